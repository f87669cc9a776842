//! Per-connection protocol state machine.
//!
//! `Connection` is transport-free: it takes decoded messages and returns the
//! reply to send, if any, so every auth and close edge case can be driven
//! directly. `serve_connection` wires it to a framed byte stream.
//!
//! ```text
//!                 Auth(ok)
//!  Unauthenticated ───────► Authenticated
//!        │                       │
//!        │ store op / Close      │ Close / EOF / backoff exhausted
//!        ▼                       ▼
//!      Closed ◄──────────────────┘
//! ```

use crate::protocol::codec::{FrameReader, decode_msg, encode_msg, write_frame};
use crate::protocol::error::ProtocolError;
use crate::protocol::types::{MAX_KEY_LEN, Msg, Op, Status};
use crate::storage::store::Store;

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

const BACKOFF_INITIAL: Duration = Duration::from_millis(10);
const BACKOFF_LIMIT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Unauthenticated,
    Authenticated,
    Closed,
}

pub struct Connection {
    state: ConnState,
    store: Arc<Store>,
    secret: Arc<str>,
}

impl Connection {
    /// Starts authenticated when no secret is configured.
    pub fn new(store: Arc<Store>, secret: Arc<str>) -> Self {
        let state = if secret.is_empty() {
            ConnState::Authenticated
        } else {
            ConnState::Unauthenticated
        };
        Self {
            state,
            store,
            secret,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnState::Closed
    }

    pub fn close(&mut self) {
        self.state = ConnState::Closed;
    }

    /// Applies one request and returns the reply owed to the client.
    pub fn handle(&mut self, msg: Msg) -> Option<Msg> {
        match (self.state, msg.op) {
            (ConnState::Closed, _) => None,
            (_, Op::Close) => {
                self.close();
                None
            }
            (_, Op::Ping) => Some(Msg::reply(Op::Pong, Status::Ok)),
            (_, Op::Auth) => Some(self.handle_auth(&msg)),
            (ConnState::Unauthenticated, op) if op.is_store_op() => {
                tracing::debug!("Rejecting unauthenticated {:?}, closing", op);
                self.close();
                Some(Msg::reply(op, Status::Unauthorized))
            }
            (ConnState::Authenticated, op) if op.is_store_op() => self.dispatch(msg),
            (_, op) => Some(Msg::reply(op, Status::Error)),
        }
    }

    /// Reply for a frame that could not be decoded. The stream is still in
    /// sync, so the connection stays open.
    pub fn handle_malformed(&mut self) -> Option<Msg> {
        if self.is_closed() {
            return None;
        }
        Some(Msg::reply(Op::default(), Status::Error))
    }

    fn handle_auth(&mut self, msg: &Msg) -> Msg {
        if msg.key.as_str() == &*self.secret {
            self.state = ConnState::Authenticated;
            Msg::reply(Op::Auth, Status::Ok)
        } else {
            Msg::reply(Op::Auth, Status::Unauthorized)
        }
    }

    fn dispatch(&self, msg: Msg) -> Option<Msg> {
        match msg.op {
            Op::Get => Some(self.handle_get(msg)),
            Op::Set | Op::SetAck => self.handle_set(msg),
            Op::Del | Op::DelAck => self.handle_del(msg),
            Op::List => Some(Msg {
                keys: self.store.list(&msg.key),
                ..Msg::reply(Op::List, Status::Ok)
            }),
            Op::Count => Some(Msg::count_reply(self.store.count(&msg.key) as u64)),
            op => Some(Msg::reply(op, Status::Error)),
        }
    }

    fn handle_get(&self, msg: Msg) -> Msg {
        if !valid_key(&msg.key) {
            return Msg::reply(Op::Get, Status::Error);
        }
        match self.store.get(&msg.key) {
            Some(slot) => Msg {
                op: Op::Get,
                status: Status::Ok,
                key: msg.key,
                value: slot.value,
                expires: slot.expires,
                keys: Vec::new(),
            },
            None => Msg::reply(Op::Get, Status::NotFound),
        }
    }

    fn handle_set(&self, msg: Msg) -> Option<Msg> {
        let op = msg.op;
        if !valid_key(&msg.key) || msg.expires < 0 {
            tracing::debug!("Malformed {:?} request", op);
            return op.is_ack().then(|| Msg::reply(op, Status::Error));
        }
        self.store.set(&msg.key, msg.value, msg.expires);
        op.is_ack().then(|| Msg::reply(op, Status::Ok))
    }

    fn handle_del(&self, msg: Msg) -> Option<Msg> {
        let op = msg.op;
        if !valid_key(&msg.key) {
            tracing::debug!("Malformed {:?} request", op);
            return op.is_ack().then(|| Msg::reply(op, Status::Error));
        }
        self.store.delete(&msg.key);
        op.is_ack().then(|| Msg::reply(op, Status::Ok))
    }
}

fn valid_key(key: &str) -> bool {
    !key.is_empty() && key.len() <= MAX_KEY_LEN
}

/// Exponential retry delays: starts at `initial`, doubles per attempt, and
/// runs out once the next delay would exceed `limit`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    limit: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, limit: Duration) -> Self {
        Self {
            initial,
            limit,
            current: initial,
        }
    }

    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.current > self.limit {
            return None;
        }
        let delay = self.current;
        self.current *= 2;
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BACKOFF_INITIAL, BACKOFF_LIMIT)
    }
}

/// Drives a `Connection` over a framed byte stream until it closes.
pub async fn serve_connection<S>(stream: S, store: Arc<Store>, secret: Arc<str>, peer: String)
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut frames = FrameReader::new(reader);
    let mut conn = Connection::new(store, secret);
    let mut backoff = Backoff::default();

    while !conn.is_closed() {
        let reply = match frames.read_frame().await {
            Ok(Some(payload)) => {
                backoff.reset();
                match decode_msg(&payload) {
                    Ok(msg) => conn.handle(msg),
                    Err(e) => {
                        tracing::debug!("Bad message from {}: {}", peer, e);
                        conn.handle_malformed()
                    }
                }
            }
            Ok(None) => {
                tracing::debug!("Connection {} closed by peer", peer);
                conn.close();
                None
            }
            Err(e) if !e.is_transport() => {
                tracing::debug!("Bad frame from {}: {}", peer, e);
                conn.handle_malformed()
            }
            Err(e) => match backoff.next_delay() {
                Some(delay) => {
                    tokio::time::sleep(delay).await;
                    continue;
                }
                None => {
                    tracing::warn!("Connection {} timed out: {}", peer, e);
                    conn.close();
                    Some(Msg::reply(Op::default(), Status::Error))
                }
            },
        };

        if let Some(reply) = reply
            && let Err(e) = send_reply(&mut writer, &reply, &peer).await
        {
            tracing::debug!("Failed to reply to {}: {}", peer, e);
            break;
        }
    }

    let _ = writer.shutdown().await;
}

/// Writes `reply`, or an `Error` reply for the same opcode when `reply` is too
/// large to encode. Only transport failures are returned.
async fn send_reply<W>(writer: &mut W, reply: &Msg, peer: &str) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let payload = match encode_msg(reply) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!("Failed to encode {:?} reply for {}: {}", reply.op, peer, e);
            encode_msg(&Msg::reply(reply.op, Status::Error))?
        }
    };
    write_frame(writer, &payload).await
}
