//! RethinkDB wire driver: V1_0 handshake, SCRAM-SHA-256 auth and a changefeed cursor.

mod codec;
mod scram;
mod term;

use self::codec::{Frame, HandshakeCodec, QueryCodec};
use self::scram::ScramClient;
use self::term::{Response, ResponseType};
use super::config::StateChangeConfig;
use super::session::{ChangeFeedDriver, ChangeStream, LiveSession};
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::Framed;
use tracing::{debug, info};

/// `V1_0` protocol magic, sent little-endian before the first handshake message.
const V1_0_MAGIC: u32 = 0x34c2_bdc3;

type Connection = Framed<TcpStream, QueryCodec>;

fn wire_error(message: impl Into<String>) -> Error {
    Error::connection_with_context(message, ErrorContext::new().with_source("rethinkdb"))
}

fn io_error(stage: &str, e: std::io::Error) -> Error {
    Error::connection_with_context(
        format!("{} failed: {}", stage, e),
        ErrorContext::new().with_source("rethinkdb"),
    )
}

/// Connects to a RethinkDB server over TCP.
#[derive(Debug, Default, Clone)]
pub struct RethinkDriver;

impl RethinkDriver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ChangeFeedDriver for RethinkDriver {
    async fn connect(&self, config: &StateChangeConfig) -> Result<Box<dyn LiveSession>> {
        let address = config.address();
        let establish = async {
            let tcp = TcpStream::connect((config.host.as_str(), config.port))
                .await
                .map_err(|e| io_error("connect", e))?;
            tcp.set_nodelay(true).map_err(|e| io_error("connect", e))?;
            handshake(tcp, config).await
        };
        let conn = tokio::time::timeout(config.connect_timeout, establish)
            .await
            .map_err(|_| {
                Error::connection_with_context(
                    format!("timed out connecting to {}", address),
                    ErrorContext::new()
                        .with_source("rethinkdb")
                        .with_details(format!("connectTimeout {:?}", config.connect_timeout)),
                )
            })??;

        info!(address = %address, database = %config.database, "rethinkdb session established");
        Ok(Box::new(RethinkSession {
            wire: Arc::new(Mutex::new(Wire {
                conn: Some(conn),
                open_feed: None,
            })),
            database: config.database.clone(),
            next_token: 1,
        }))
    }

    fn name(&self) -> &'static str {
        "rethinkdb"
    }
}

async fn next_handshake_message(framed: &mut Framed<TcpStream, HandshakeCodec>) -> Result<Value> {
    let raw = framed
        .next()
        .await
        .ok_or_else(|| wire_error("server closed the connection during handshake"))?
        .map_err(|e| io_error("handshake", e))?;
    // Protocol-level rejections arrive as plain text rather than JSON.
    let message: Value = serde_json::from_str(&raw).map_err(|_| wire_error(raw.clone()))?;
    if message.get("success").and_then(Value::as_bool) != Some(true) {
        let reason = message
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("handshake rejected");
        let code = message.get("error_code").and_then(Value::as_i64);
        return Err(Error::connection_with_context(
            reason.to_string(),
            ErrorContext::new()
                .with_source("rethinkdb")
                .with_details(match code {
                    Some(code) => format!("error_code {}", code),
                    None => "no error code".to_string(),
                }),
        ));
    }
    Ok(message)
}

fn authentication(message: &Value) -> Result<&str> {
    message
        .get("authentication")
        .and_then(Value::as_str)
        .ok_or_else(|| wire_error("handshake message has no authentication field"))
}

async fn handshake(tcp: TcpStream, config: &StateChangeConfig) -> Result<Connection> {
    let mut framed = Framed::new(tcp, HandshakeCodec::default());
    framed
        .get_mut()
        .write_all(&V1_0_MAGIC.to_le_bytes())
        .await
        .map_err(|e| io_error("handshake", e))?;

    let scram = ScramClient::new(&config.username, &config.password);
    let first = json!({
        "protocol_version": 0,
        "authentication_method": "SCRAM-SHA-256",
        "authentication": scram.client_first(),
    });
    framed
        .send(first.to_string())
        .await
        .map_err(|e| io_error("handshake", e))?;

    let server_info = next_handshake_message(&mut framed).await?;
    let server_version = server_info
        .get("server_version")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown");
    debug!(server_version, "rethinkdb server accepted protocol");

    let challenge = next_handshake_message(&mut framed).await?;
    let (client_final, signature) = scram.client_final(authentication(&challenge)?)?;
    framed
        .send(json!({ "authentication": client_final }).to_string())
        .await
        .map_err(|e| io_error("handshake", e))?;

    let outcome = next_handshake_message(&mut framed).await?;
    signature.verify(authentication(&outcome)?)?;

    Ok(framed.map_codec(|_| QueryCodec))
}

struct Wire {
    conn: Option<Connection>,
    /// Token of a changefeed the server still considers open.
    open_feed: Option<u64>,
}

async fn read_response(conn: &mut Connection, token: u64) -> Result<Response> {
    loop {
        let frame = conn
            .next()
            .await
            .ok_or_else(|| wire_error("server closed the connection"))?
            .map_err(|e| io_error("read", e))?;
        if frame.token != token {
            debug!(token = frame.token, "ignoring response for unknown token");
            continue;
        }
        return serde_json::from_slice(&frame.body)
            .map_err(|e| wire_error(format!("malformed response: {}", e)));
    }
}

struct Batch {
    items: VecDeque<Bytes>,
    more: bool,
}

fn into_batch(response: Response) -> Result<Batch> {
    let more = match response.kind() {
        ResponseType::SuccessPartial => true,
        ResponseType::SuccessSequence
        | ResponseType::SuccessAtom
        | ResponseType::WaitComplete => false,
        kind @ (ResponseType::ClientError
        | ResponseType::CompileError
        | ResponseType::RuntimeError) => {
            return Err(Error::connection_with_context(
                response.message(),
                ErrorContext::new()
                    .with_source("rethinkdb")
                    .with_details(format!("{:?}", kind)),
            ));
        }
        other => return Err(wire_error(format!("unexpected response {:?}", other))),
    };
    let items = response
        .r
        .iter()
        .map(|v| serde_json::to_vec(v).map(Bytes::from))
        .collect::<std::result::Result<VecDeque<_>, _>>()?;
    Ok(Batch { items, more })
}

struct RethinkSession {
    wire: Arc<Mutex<Wire>>,
    database: String,
    next_token: u64,
}

#[async_trait]
impl LiveSession for RethinkSession {
    async fn subscribe(&mut self, table: &str) -> Result<ChangeStream> {
        let token = self.next_token;
        self.next_token += 1;

        let mut wire = self.wire.lock().await;
        let conn = wire
            .conn
            .as_mut()
            .ok_or_else(|| wire_error("session is closed"))?;
        conn.send(Frame::new(token, term::start(term::changes(&self.database, table))))
            .await
            .map_err(|e| io_error("subscribe", e))?;
        let batch = into_batch(read_response(conn, token).await?)?;
        if batch.more {
            wire.open_feed = Some(token);
        }
        drop(wire);

        info!(database = %self.database, table = %table, token, "changefeed started");
        let cursor = Cursor {
            wire: self.wire.clone(),
            token,
            buffer: batch.items,
            more: batch.more,
        };
        Ok(cursor.into_stream())
    }

    async fn close(&mut self) -> Result<()> {
        let mut wire = self.wire.lock().await;
        let open_feed = wire.open_feed.take();
        if let Some(mut conn) = wire.conn.take() {
            if let Some(token) = open_feed {
                if let Err(e) = conn.send(Frame::new(token, term::stop_query())).await {
                    debug!(error = %e, "failed to stop changefeed");
                }
            }
            let mut tcp = conn.into_inner();
            if let Err(e) = tcp.shutdown().await {
                debug!(error = %e, "rethinkdb shutdown failed");
            }
            info!(database = %self.database, "rethinkdb session closed");
        }
        Ok(())
    }
}

/// Pages through a changefeed, asking for the next batch only once the current one is drained.
struct Cursor {
    wire: Arc<Mutex<Wire>>,
    token: u64,
    buffer: VecDeque<Bytes>,
    more: bool,
}

impl Cursor {
    fn into_stream(self) -> ChangeStream {
        futures::stream::unfold(Some(self), |cursor| async move {
            let mut cursor = cursor?;
            match cursor.next_item().await {
                Ok(Some(item)) => Some((Ok(item), Some(cursor))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
        .boxed()
    }

    async fn next_item(&mut self) -> Result<Option<Bytes>> {
        loop {
            if let Some(item) = self.buffer.pop_front() {
                return Ok(Some(item));
            }
            if !self.more {
                return Ok(None);
            }

            let mut wire = self.wire.lock().await;
            let conn = wire
                .conn
                .as_mut()
                .ok_or_else(|| wire_error("session is closed"))?;
            conn.send(Frame::new(self.token, term::continue_query()))
                .await
                .map_err(|e| io_error("continue", e))?;
            let batch = match read_response(conn, self.token).await.and_then(into_batch) {
                Ok(batch) => batch,
                Err(e) => {
                    wire.open_feed = None;
                    return Err(e);
                }
            };
            if !batch.more {
                wire.open_feed = None;
            }
            self.buffer = batch.items;
            self.more = batch.more;
        }
    }
}
