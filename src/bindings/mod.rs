//! 输入绑定模块：从外部系统持续接收事件，并按顺序推送给调用方提供的处理器。
//!
//! # Input Bindings Module
//!
//! An input binding owns a live connection to an external system and pushes every event it
//! receives to a caller-supplied [`EventSink`]. Delivery runs on its own task; the caller keeps a
//! [`Subscription`] handle to observe when and why delivery stopped.
//!
//! ## Lifecycle
//!
//! ```text
//! Uninitialized ──init──▶ Initialized ──read──▶ Subscribing
//!       │                      │                    │
//!       └────────close─────────┴───────close────────┴──▶ Closed
//! ```
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`InputBinding`] | Init / Read / Close contract |
//! | [`ReadResponse`] | One event: payload bytes plus string metadata |
//! | [`EventSink`] | Destination for events; closures implement it |
//! | [`ChannelSink`] | Bounded-queue sink for callers that prefer pulling |
//! | [`Subscription`] | Handle to a running delivery loop |
//! | [`statechange`] | Database change-feed binding |

pub mod statechange;

use crate::metadata::{MetadataMap, Properties};
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// One event delivered by an input binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadResponse {
    pub data: Bytes,
    pub metadata: HashMap<String, String>,
    pub content_type: Option<String>,
}

impl ReadResponse {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            metadata: HashMap::new(),
            content_type: None,
        }
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// Destination for events.
///
/// `push` is awaited inline on the delivery path, so a slow sink slows delivery down rather
/// than letting events pile up. The returned payload is reserved for request/response
/// bindings and ignored by input bindings. An `Err` is logged and counted on the
/// [`Subscription`]; it does not stop delivery.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn push(&self, event: ReadResponse) -> Result<Option<Bytes>>;
}

#[async_trait]
impl<F, Fut> EventSink for F
where
    F: Fn(ReadResponse) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Option<Bytes>>> + Send,
{
    async fn push(&self, event: ReadResponse) -> Result<Option<Bytes>> {
        (self)(event).await
    }
}

/// Sink backed by a bounded channel. `push` waits for capacity.
pub struct ChannelSink {
    tx: mpsc::Sender<ReadResponse>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ReadResponse>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn push(&self, event: ReadResponse) -> Result<Option<Bytes>> {
        self.tx.send(event).await.map_err(|_| {
            Error::runtime_with_context(
                "event receiver dropped",
                ErrorContext::new().with_source("channel_sink"),
            )
        })?;
        Ok(None)
    }
}

/// Why a delivery loop stopped.
#[derive(Debug, Clone)]
pub enum StopReason {
    /// The caller's cancellation token fired.
    Cancelled,
    /// The binding was closed.
    Closed,
    /// The external stream ended normally.
    StreamEnded,
    /// The external stream reported an error; delivery is not retried.
    StreamFailed(Arc<Error>),
}

impl StopReason {
    pub fn is_failure(&self) -> bool {
        matches!(self, StopReason::StreamFailed(_))
    }
}

#[derive(Debug, Default)]
pub(crate) struct DeliveryCounters {
    pub(crate) delivered: AtomicU64,
    pub(crate) handler_errors: AtomicU64,
}

/// Handle to a running delivery loop.
///
/// Dropping it does not stop delivery; cancel the token passed to `read` or close the binding.
#[derive(Debug, Clone)]
pub struct Subscription {
    id: Uuid,
    stop: watch::Receiver<Option<StopReason>>,
    counters: Arc<DeliveryCounters>,
}

impl Subscription {
    pub(crate) fn new(
        id: Uuid,
        stop: watch::Receiver<Option<StopReason>>,
        counters: Arc<DeliveryCounters>,
    ) -> Self {
        Self { id, stop, counters }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Events handed to the sink so far.
    pub fn delivered(&self) -> u64 {
        self.counters.delivered.load(Ordering::Acquire)
    }

    /// Sink invocations that returned an error.
    pub fn handler_errors(&self) -> u64 {
        self.counters.handler_errors.load(Ordering::Acquire)
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop.borrow().clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.borrow().is_some()
    }

    /// Wait until the delivery loop has exited and released its stream.
    pub async fn stopped(&self) -> StopReason {
        let mut rx = self.stop.clone();
        loop {
            if let Some(reason) = rx.borrow_and_update().clone() {
                return reason;
            }
            if rx.changed().await.is_err() {
                // Sender gone without a reason: the task was aborted.
                return rx.borrow().clone().unwrap_or(StopReason::Closed);
            }
        }
    }
}

/// Init / Read / Close contract shared by input bindings.
#[async_trait]
pub trait InputBinding: Send + Sync {
    /// Validate configuration and open the live session.
    async fn init(&self, properties: &Properties) -> Result<()>;

    /// Start delivering events to `sink` on a background task and return immediately.
    async fn read(&self, cancel: CancellationToken, sink: Arc<dyn EventSink>)
        -> Result<Subscription>;

    /// Stop delivery and release the session. Safe in any state; the binding is unusable after.
    async fn close(&self) -> Result<()>;

    fn component_metadata(&self) -> MetadataMap;
}
