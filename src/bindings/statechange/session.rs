//! Driver seam between the binding and a concrete change-feed backend.

use super::config::StateChangeConfig;
use crate::{BoxStream, Result};
use async_trait::async_trait;
use bytes::Bytes;

/// Ordered change objects, each serialised as JSON. An `Err` item ends the feed.
pub type ChangeStream = BoxStream<'static, Bytes>;

/// Opens live sessions against one backend.
#[async_trait]
pub trait ChangeFeedDriver: Send + Sync {
    /// Establish and authenticate a session. Implementations honour
    /// `config.connect_timeout` and report failures as [`crate::Error::Connection`].
    async fn connect(&self, config: &StateChangeConfig) -> Result<Box<dyn LiveSession>>;

    fn name(&self) -> &'static str;
}

/// An open connection exclusively owned by one binding.
#[async_trait]
pub trait LiveSession: Send {
    /// Start the changefeed on `table`. The stream is independent of `&mut self` so the
    /// session can be closed while a stream is still being consumed elsewhere.
    async fn subscribe(&mut self, table: &str) -> Result<ChangeStream>;

    /// Release the connection. Calling it twice is harmless.
    async fn close(&mut self) -> Result<()>;
}
