//! In-process change feed. Useful for embedding the binding without a database and for tests.

use super::config::StateChangeConfig;
use super::session::{ChangeFeedDriver, ChangeStream, LiveSession};
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

#[derive(Default)]
struct FeedState {
    unreachable: bool,
    connect_attempts: usize,
    open_sessions: usize,
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<Result<Bytes>>>>,
}

/// Broadcasts published payloads to every live subscription on the same table.
///
/// Clones share state, so a test can keep one handle and give another to the binding.
#[derive(Clone, Default)]
pub struct MemoryFeed {
    state: Arc<Mutex<FeedState>>,
}

impl MemoryFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// A feed whose `connect` always fails with a connection error.
    pub fn unreachable() -> Self {
        let feed = Self::new();
        feed.set_reachable(false);
        feed
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.lock().unreachable = !reachable;
    }

    fn lock(&self) -> MutexGuard<'_, FeedState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Send `payload` to every subscriber of `table`. Returns how many received it.
    pub fn publish(&self, table: &str, payload: impl Into<Bytes>) -> usize {
        let payload = payload.into();
        let mut state = self.lock();
        let Some(subs) = state.subscribers.get_mut(table) else {
            return 0;
        };
        subs.retain(|tx| tx.send(Ok(payload.clone())).is_ok());
        subs.len()
    }

    /// Terminate every subscription on `table` with an error.
    pub fn fail(&self, table: &str, message: impl Into<String>) {
        let message = message.into();
        if let Some(subs) = self.lock().subscribers.remove(table) {
            for tx in subs {
                let _ = tx.send(Err(Error::connection_with_context(
                    message.clone(),
                    ErrorContext::new().with_source("memory_feed"),
                )));
            }
        }
    }

    /// End every subscription on `table` normally.
    pub fn end(&self, table: &str) {
        self.lock().subscribers.remove(table);
    }

    /// Subscriptions on `table` whose consumer is still alive.
    pub fn subscriber_count(&self, table: &str) -> usize {
        self.lock()
            .subscribers
            .get(table)
            .map(|subs| subs.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    pub fn open_sessions(&self) -> usize {
        self.lock().open_sessions
    }

    pub fn connect_attempts(&self) -> usize {
        self.lock().connect_attempts
    }
}

#[async_trait]
impl ChangeFeedDriver for MemoryFeed {
    async fn connect(&self, config: &StateChangeConfig) -> Result<Box<dyn LiveSession>> {
        let mut state = self.lock();
        state.connect_attempts += 1;
        if state.unreachable {
            return Err(Error::connection_with_context(
                format!("cannot reach {}", config.address()),
                ErrorContext::new().with_source("memory_feed"),
            ));
        }
        state.open_sessions += 1;
        debug!(address = %config.address(), "memory feed session opened");
        Ok(Box::new(MemorySession {
            feed: self.clone(),
            open: true,
        }))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

struct MemorySession {
    feed: MemoryFeed,
    open: bool,
}

#[async_trait]
impl LiveSession for MemorySession {
    async fn subscribe(&mut self, table: &str) -> Result<ChangeStream> {
        if !self.open {
            return Err(Error::connection("session is closed"));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.feed
            .lock()
            .subscribers
            .entry(table.to_string())
            .or_default()
            .push(tx);
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn close(&mut self) -> Result<()> {
        if std::mem::take(&mut self.open) {
            let mut state = self.feed.lock();
            state.open_sessions = state.open_sessions.saturating_sub(1);
        }
        Ok(())
    }
}
