//! 数据库变更订阅绑定：监听单张表的实时变更流，并将每个变更推送给事件处理器。
//!
//! # Change-Feed Binding
//!
//! [`StateChangeBinding`] holds one live session to a database and, once `read` is called,
//! forwards every change on the configured table to an [`EventSink`] in stream order.
//!
//! ## Delivery rules
//!
//! - One delivery task per binding; events are pushed one at a time and the sink is awaited
//! - Cancellation (caller token or `close`) wins over an event that has not arrived yet; an
//!   event that has arrived is always pushed before cancellation is checked again
//! - `close` does not wait for a sink that is stuck: an in-flight push is abandoned
//! - Opening the feed in `read` is bounded by `connectTimeout` and gives way to the caller's
//!   token and to `close`
//! - A stream error stops delivery without retrying; handler errors are logged and skipped
//!
//! ## Example
//!
//! ```rust
//! use component_contrib::bindings::statechange::{MemoryFeed, StateChangeBinding};
//! use component_contrib::bindings::{ChannelSink, InputBinding};
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main]
//! # async fn main() -> component_contrib::Result<()> {
//! let feed = MemoryFeed::new();
//! let binding = StateChangeBinding::with_driver(Arc::new(feed.clone()));
//! let props: HashMap<String, String> = [
//!     ("address", "localhost:28015"),
//!     ("database", "app"),
//!     ("username", "admin"),
//!     ("table", "orders"),
//! ]
//! .into_iter()
//! .map(|(k, v)| (k.to_string(), v.to_string()))
//! .collect();
//! binding.init(&props).await?;
//!
//! let (sink, mut events) = ChannelSink::new(16);
//! let cancel = CancellationToken::new();
//! binding.read(cancel.clone(), Arc::new(sink)).await?;
//!
//! feed.publish("orders", r#"{"type":"add","new_val":{"id":1}}"#);
//! let event = events.recv().await.expect("event");
//! assert_eq!(event.metadata["store-table"], "orders");
//!
//! cancel.cancel();
//! binding.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
mod memory;
mod rethinkdb;
mod session;

pub use config::{StateChangeConfig, StateChangeMetadata};
pub use memory::MemoryFeed;
pub use rethinkdb::RethinkDriver;
pub use session::{ChangeFeedDriver, ChangeStream, LiveSession};

use super::{DeliveryCounters, EventSink, InputBinding, ReadResponse, StopReason, Subscription};
use crate::metadata::{metadata_info_from_type, MetadataMap, Properties};
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

enum State {
    Uninitialized,
    Initialized {
        config: StateChangeConfig,
        session: Box<dyn LiveSession>,
    },
    /// The session lives inside the delivery task and comes back when it exits.
    Subscribing {
        config: StateChangeConfig,
        task: JoinHandle<Box<dyn LiveSession>>,
    },
    Closed,
}

impl State {
    fn misuse(&self, operation: &str) -> Error {
        let message = match self {
            State::Uninitialized => "binding is not initialized",
            State::Initialized { .. } => "binding is already initialized",
            State::Subscribing { .. } => "binding is already reading",
            State::Closed => "binding is closed",
        };
        Error::runtime_with_context(
            message,
            ErrorContext::new()
                .with_source("statechange")
                .with_details(format!("{} rejected", operation)),
        )
    }
}

/// Input binding that streams a table's change feed.
pub struct StateChangeBinding {
    driver: Arc<dyn ChangeFeedDriver>,
    state: Mutex<State>,
    shutdown: CancellationToken,
}

impl StateChangeBinding {
    /// Binding backed by the RethinkDB wire driver.
    pub fn new() -> Self {
        Self::with_driver(Arc::new(RethinkDriver::new()))
    }

    pub fn with_driver(driver: Arc<dyn ChangeFeedDriver>) -> Self {
        Self {
            driver,
            state: Mutex::new(State::Uninitialized),
            shutdown: CancellationToken::new(),
        }
    }

    async fn connect_with_retry(&self, config: &StateChangeConfig) -> Result<Box<dyn LiveSession>> {
        let mut attempt = 0u32;
        loop {
            match self.driver.connect(config).await {
                Ok(session) => return Ok(session),
                Err(e) if attempt < config.num_retries => {
                    let delay = config.retry_delay(attempt);
                    attempt += 1;
                    warn!(
                        driver = self.driver.name(),
                        address = %config.address(),
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "connect failed, retrying"
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => {
                            return Err(State::Closed.misuse("init"));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for StateChangeBinding {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InputBinding for StateChangeBinding {
    async fn init(&self, properties: &Properties) -> Result<()> {
        let mut state = self.state.lock().await;
        if !matches!(*state, State::Uninitialized) {
            return Err(state.misuse("init"));
        }

        let config = StateChangeConfig::from_properties(properties)?;
        let session = self.connect_with_retry(&config).await?;
        info!(
            driver = self.driver.name(),
            address = %config.address(),
            database = %config.database,
            table = %config.table,
            "change feed binding initialized"
        );
        *state = State::Initialized { config, session };
        Ok(())
    }

    async fn read(
        &self,
        cancel: CancellationToken,
        sink: Arc<dyn EventSink>,
    ) -> Result<Subscription> {
        let mut state = self.state.lock().await;
        let (config, mut session) = match std::mem::replace(&mut *state, State::Closed) {
            State::Initialized { config, session } => (config, session),
            other => {
                let err = other.misuse("read");
                *state = other;
                return Err(err);
            }
        };

        // Held under the state lock, so it must give way to the caller's token and to `close`.
        let subscribed = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(State::Closed.misuse("read")),
            _ = cancel.cancelled() => Err(Error::runtime_with_context(
                "read cancelled before the change feed opened",
                ErrorContext::new().with_source("statechange"),
            )),
            result = tokio::time::timeout(config.connect_timeout, session.subscribe(&config.table)) => {
                result.unwrap_or_else(|_| {
                    Err(Error::connection_with_context(
                        format!("timed out opening change feed on {}", config.table),
                        ErrorContext::new()
                            .with_source("statechange")
                            .with_details(format!("connectTimeout {:?}", config.connect_timeout)),
                    ))
                })
            }
        };
        let stream = match subscribed {
            Ok(stream) => stream,
            Err(e) => {
                *state = State::Initialized { config, session };
                return Err(e);
            }
        };

        let id = Uuid::new_v4();
        let counters = Arc::new(DeliveryCounters::default());
        let (stop_tx, stop_rx) = watch::channel(None);
        let delivery = DeliveryLoop {
            id,
            stream,
            sink,
            cancel,
            shutdown: self.shutdown.clone(),
            metadata: config.event_metadata(),
            counters: counters.clone(),
        };
        let task = tokio::spawn(async move {
            let reason = delivery.run().await;
            stop_tx.send_replace(Some(reason));
            session
        });

        info!(subscription = %id, table = %config.table, "change feed subscription started");
        *state = State::Subscribing { config, task };
        Ok(Subscription::new(id, stop_rx, counters))
    }

    async fn close(&self) -> Result<()> {
        self.shutdown.cancel();
        let mut state = self.state.lock().await;
        let session = match std::mem::replace(&mut *state, State::Closed) {
            State::Uninitialized | State::Closed => return Ok(()),
            State::Initialized { session, .. } => Some(session),
            State::Subscribing { task, .. } => match task.await {
                Ok(session) => Some(session),
                Err(e) => {
                    // The session was dropped with the task, which also drops its connection.
                    error!(error = %e, "delivery task did not exit cleanly");
                    None
                }
            },
        };
        if let Some(mut session) = session {
            session.close().await?;
        }
        info!(driver = self.driver.name(), "change feed binding closed");
        Ok(())
    }

    fn component_metadata(&self) -> MetadataMap {
        metadata_info_from_type::<StateChangeMetadata>()
    }
}

struct DeliveryLoop {
    id: Uuid,
    stream: ChangeStream,
    sink: Arc<dyn EventSink>,
    cancel: CancellationToken,
    shutdown: CancellationToken,
    metadata: HashMap<String, String>,
    counters: Arc<DeliveryCounters>,
}

impl DeliveryLoop {
    async fn run(self) -> StopReason {
        let DeliveryLoop {
            id,
            mut stream,
            sink,
            cancel,
            shutdown,
            metadata,
            counters,
        } = self;

        let reason = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break StopReason::Cancelled,
                _ = shutdown.cancelled() => break StopReason::Closed,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(payload)) => {
                    debug!(subscription = %id, bytes = payload.len(), "delivering change event");
                    let event = ReadResponse::new(payload)
                        .with_metadata(metadata.clone())
                        .with_content_type("application/json");
                    let pushed = tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => {
                            warn!(subscription = %id, "binding closed while the event handler was busy, event abandoned");
                            break StopReason::Closed;
                        }
                        pushed = sink.push(event) => pushed,
                    };
                    if let Err(e) = pushed {
                        counters.handler_errors.fetch_add(1, Ordering::AcqRel);
                        warn!(subscription = %id, error = %e, "event handler failed");
                    }
                    counters.delivered.fetch_add(1, Ordering::AcqRel);
                }
                Some(Err(e)) => {
                    error!(subscription = %id, error = %e, "change feed failed");
                    break StopReason::StreamFailed(Arc::new(e));
                }
                None => {
                    info!(subscription = %id, "change feed ended");
                    break StopReason::StreamEnded;
                }
            }
        };

        drop(stream);
        info!(
            subscription = %id,
            reason = ?reason,
            delivered = counters.delivered.load(Ordering::Acquire),
            "change feed subscription stopped"
        );
        reason
    }
}
