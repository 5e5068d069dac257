//! Handler registration types: transactions and subscription producers.
//!
//! Registration is explicit — build a [`Transaction`] or [`Subscription`]
//! and hand it to the server before `start`.  Handlers come in two
//! execution flavors: async closures run inline on the scheduler;
//! blocking closures are dispatched to the blocking pool so they cannot
//! stall the reactor.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::FutureExt;
use htcp_protocol::{Arguments, Param, Schema, Value};
use tokio_stream::wrappers::ReceiverStream;

/// Error raised by a handler or producer; the message travels to the
/// client verbatim as the stringified reason.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> HandlerError {
        HandlerError(message.into())
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> HandlerError {
        HandlerError(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> HandlerError {
        HandlerError(message.to_owned())
    }
}

pub type HandlerResult = Result<Value, HandlerError>;

/// Stream of values yielded by a subscription producer.
pub type EventStream = BoxStream<'static, HandlerResult>;

type AsyncHandlerFn = Arc<dyn Fn(Arguments) -> BoxFuture<'static, HandlerResult> + Send + Sync>;
type BlockingHandlerFn = Arc<dyn Fn(Arguments) -> HandlerResult + Send + Sync>;
type AsyncProducerFn = Arc<dyn Fn(Arguments) -> EventStream + Send + Sync>;
type BlockingProducerFn =
    Arc<dyn Fn(Arguments) -> Box<dyn Iterator<Item = HandlerResult> + Send> + Send + Sync>;

/// How a transaction handler executes.
#[derive(Clone)]
pub enum TransactionHandler {
    Async(AsyncHandlerFn),
    Blocking(BlockingHandlerFn),
}

impl TransactionHandler {
    /// Run the handler with prepared arguments on the right execution
    /// context.
    pub async fn invoke(&self, args: Arguments) -> HandlerResult {
        match self {
            TransactionHandler::Async(f) => f(args).await,
            TransactionHandler::Blocking(f) => {
                let f = Arc::clone(f);
                tokio::task::spawn_blocking(move || f(args))
                    .await
                    .unwrap_or_else(|e| Err(HandlerError(format!("handler panicked: {e}"))))
            }
        }
    }
}

/// A registered request/reply handler keyed by a string code.
#[derive(Clone)]
pub struct Transaction {
    pub code: String,
    pub params: Vec<Param>,
    pub returns: Schema,
    pub handler: TransactionHandler,
}

impl Transaction {
    pub fn new_async<F, Fut>(
        code: impl Into<String>,
        params: Vec<Param>,
        returns: Schema,
        handler: F,
    ) -> Transaction
    where
        F: Fn(Arguments) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Transaction {
            code: code.into(),
            params,
            returns,
            handler: TransactionHandler::Async(Arc::new(move |args| handler(args).boxed())),
        }
    }

    pub fn new_blocking<F>(
        code: impl Into<String>,
        params: Vec<Param>,
        returns: Schema,
        handler: F,
    ) -> Transaction
    where
        F: Fn(Arguments) -> HandlerResult + Send + Sync + 'static,
    {
        Transaction {
            code: code.into(),
            params,
            returns,
            handler: TransactionHandler::Blocking(Arc::new(handler)),
        }
    }
}

/// How a subscription producer yields its lazy sequence.
#[derive(Clone)]
pub enum SubscriptionProducer {
    Async(AsyncProducerFn),
    Blocking(BlockingProducerFn),
}

/// Capacity of the bridge channel between a blocking producer and its
/// connection task.  A full channel blocks the producer thread until the
/// consumer catches up.
const BLOCKING_BRIDGE_CAPACITY: usize = 16;

impl SubscriptionProducer {
    /// Open the producer's stream for one subscription.
    ///
    /// Blocking producers run on the blocking pool and push through a
    /// bounded channel; dropping the returned stream hangs up the channel,
    /// which stops the producer at its next yield.
    pub fn open(&self, args: Arguments) -> EventStream {
        match self {
            SubscriptionProducer::Async(f) => f(args),
            SubscriptionProducer::Blocking(f) => {
                let f = Arc::clone(f);
                let (tx, rx) = tokio::sync::mpsc::channel(BLOCKING_BRIDGE_CAPACITY);
                tokio::task::spawn_blocking(move || {
                    for item in f(args) {
                        if tx.blocking_send(item).is_err() {
                            break;
                        }
                    }
                });
                Box::pin(ReceiverStream::new(rx))
            }
        }
    }
}

/// A registered event-stream producer keyed by event type.
#[derive(Clone)]
pub struct Subscription {
    pub event_type: String,
    pub params: Vec<Param>,
    pub yields: Schema,
    pub producer: SubscriptionProducer,
}

impl Subscription {
    pub fn new_async<F>(
        event_type: impl Into<String>,
        params: Vec<Param>,
        yields: Schema,
        producer: F,
    ) -> Subscription
    where
        F: Fn(Arguments) -> EventStream + Send + Sync + 'static,
    {
        Subscription {
            event_type: event_type.into(),
            params,
            yields,
            producer: SubscriptionProducer::Async(Arc::new(producer)),
        }
    }

    pub fn new_blocking<F, I>(
        event_type: impl Into<String>,
        params: Vec<Param>,
        yields: Schema,
        producer: F,
    ) -> Subscription
    where
        F: Fn(Arguments) -> I + Send + Sync + 'static,
        I: Iterator<Item = HandlerResult> + Send + 'static,
    {
        Subscription {
            event_type: event_type.into(),
            params,
            yields,
            producer: SubscriptionProducer::Blocking(Arc::new(move |args| {
                Box::new(producer(args))
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use htcp_protocol::Value;

    #[tokio::test]
    async fn async_handler_runs_inline() {
        let t = Transaction::new_async("double", vec![], Schema::Int, |args| async move {
            let x = args
                .get("x")
                .and_then(Value::as_i64)
                .ok_or_else(|| HandlerError::new("missing x"))?;
            Ok(Value::from(x * 2))
        });
        let mut args = Arguments::new();
        args.insert("x".to_owned(), Value::from(21));
        assert_eq!(t.handler.invoke(args).await.unwrap(), Value::from(42));
    }

    #[tokio::test]
    async fn blocking_handler_runs_off_the_scheduler() {
        let t = Transaction::new_blocking("pid", vec![], Schema::Int, |_args| {
            // Would block the reactor if run inline.
            std::thread::sleep(std::time::Duration::from_millis(5));
            Ok(Value::from(7))
        });
        assert_eq!(
            t.handler.invoke(Arguments::new()).await.unwrap(),
            Value::from(7)
        );
    }

    #[tokio::test]
    async fn blocking_producer_bridges_to_a_stream() {
        let s = Subscription::new_blocking("counts", vec![], Schema::Int, |_args| {
            (0i64..3).map(|i| Ok(Value::from(i)))
        });
        let items: Vec<HandlerResult> = s.producer.open(Arguments::new()).collect().await;
        let values: Vec<Value> = items.into_iter().map(Result::unwrap).collect();
        assert_eq!(values, vec![Value::from(0), Value::from(1), Value::from(2)]);
    }

    #[tokio::test]
    async fn dropping_the_bridge_stream_stops_the_producer() {
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let s = Subscription::new_blocking("forever", vec![], Schema::Int, move |_args| {
            let done = done_tx.clone();
            std::iter::repeat_with(move || {
                done.send(()).ok();
                Ok(Value::from(1))
            })
        });
        let mut stream = s.producer.open(Arguments::new());
        assert!(stream.next().await.is_some());
        drop(stream);
        drop(s);
        // The producer thread unblocks on the hung-up channel and exits;
        // the disconnected sender proves it stopped.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        loop {
            match done_rx.try_recv() {
                Err(std::sync::mpsc::TryRecvError::Disconnected) => break,
                _ => {
                    assert!(std::time::Instant::now() < deadline, "producer did not stop");
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                }
            }
        }
    }
}
