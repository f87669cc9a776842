//! Replication master.
//!
//! Accepts replica connections and, per replica, runs a delivery loop that
//! pushes the full current state of every Block flagged `must_sync` for that
//! replica. Delivery is coalescing: a Block that changed many times between
//! passes is sent once, in its latest state. A Block whose snapshot is larger
//! than one frame goes out as `BlockPart` pieces closed by a `Block`.
//!
//! A replica that reconnects while its previous session is still open (the
//! old socket may be half-open after a network blip) replaces that session.

use super::types::{IDENTITY_LEN, REPL_CHUNK_LEN, ReplMessage};
use crate::protocol::codec::{FrameReader, encoded_len};
use crate::protocol::error::ProtocolError;
use crate::storage::store::Store;
use crate::storage::types::{ReplicaId, Slot};

use anyhow::{Result, anyhow, bail};
use dashmap::DashMap;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

const HELLO_TIMEOUT: Duration = Duration::from_secs(5);

struct ReplicaSession {
    peer: SocketAddr,
    session: u64,
    /// Tells the session's delivery loop that a newer session took over.
    stop: Arc<Notify>,
}

pub struct ReplMaster {
    store: Arc<Store>,
    secret: String,
    sync_period: Duration,
    /// The live session of each connected replica.
    replicas: DashMap<ReplicaId, ReplicaSession>,
    next_session: AtomicU64,
}

impl ReplMaster {
    pub fn new(store: Arc<Store>, secret: impl Into<String>, sync_period: Duration) -> Arc<Self> {
        Arc::new(Self {
            store,
            secret: secret.into(),
            sync_period,
            replicas: DashMap::new(),
            next_session: AtomicU64::new(0),
        })
    }

    pub fn connected_replicas(&self) -> Vec<ReplicaId> {
        self.replicas.iter().map(|entry| *entry.key()).collect()
    }

    pub fn start(self: Arc<Self>, listener: TcpListener) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.accept_loop(listener).await;
        })
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!("Replication master listening on {}", addr);
        }

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!("Failed to accept replica connection: {}", e);
                    continue;
                }
            };

            let master = self.clone();
            tokio::spawn(async move {
                if let Err(e) = master.handle_replica(stream, peer).await {
                    tracing::warn!("Replica session with {} ended: {}", peer, e);
                }
            });
        }
    }

    async fn handle_replica(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let _ = stream.set_nodelay(true);
        let (reader, mut writer) = stream.into_split();
        let mut frames = FrameReader::new(reader);

        let hello = tokio::time::timeout(HELLO_TIMEOUT, frames.read_frame())
            .await
            .map_err(|_| anyhow!("no hello within {:?}", HELLO_TIMEOUT))??
            .ok_or_else(|| anyhow!("disconnected before hello"))?;

        let (identity, head, secret) = match ReplMessage::decode(&hello)? {
            ReplMessage::Hello { id, head, secret } => (id, head, secret),
            other => bail!("expected hello, got {:?}", other),
        };

        if !self.secret.is_empty() && secret != self.secret {
            deny(&mut writer, "invalid secret").await;
            bail!("replica presented an invalid secret");
        }
        if identity.len() != IDENTITY_LEN {
            deny(&mut writer, "identity must be 32 bytes").await;
            bail!("replica identity has {} bytes", identity.len());
        }

        let replica = ReplicaId::from_identity(&identity);
        let session = self.next_session.fetch_add(1, Ordering::Relaxed);
        let stop = Arc::new(Notify::new());
        let previous = self.replicas.insert(
            replica,
            ReplicaSession {
                peer,
                session,
                stop: stop.clone(),
            },
        );
        if let Some(previous) = previous {
            tracing::info!(
                "Replica {} reconnected from {}, replacing session from {}",
                replica,
                peer,
                previous.peer
            );
            previous.stop.notify_one();
        }

        self.store.register_replica(replica);
        tracing::info!("Replica {} connected from {} (head {})", replica, peer, head);

        let result = self.serve_replica(replica, &mut frames, &mut writer, &stop).await;

        // Unregister under the map entry so a newer session cannot register
        // in between and be wiped out.
        let removed = self.replicas.remove_if(&replica, |_, current| {
            if current.session != session {
                return false;
            }
            self.store.unregister_replica(replica);
            true
        });
        if removed.is_some() {
            tracing::info!("Replica {} disconnected", replica);
        } else {
            tracing::info!("Replaced session of replica {} from {} ended", replica, peer);
        }

        result
    }

    async fn serve_replica<R, W>(
        &self,
        replica: ReplicaId,
        frames: &mut FrameReader<R>,
        writer: &mut W,
        stop: &Notify,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        ReplMessage::Welcome.write_to(writer).await?;
        self.delivery_loop(replica, frames, writer, stop).await
    }

    async fn delivery_loop<R, W>(
        &self,
        replica: ReplicaId,
        frames: &mut FrameReader<R>,
        writer: &mut W,
        stop: &Notify,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut interval = tokio::time::interval(self.sync_period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop.notified() => return Ok(()),
                _ = interval.tick() => {
                    let sent = self.deliver_pending(replica, writer).await?;
                    if sent > 0 {
                        tracing::debug!("Sent {} blocks to replica {}", sent, replica);
                    }
                }
                frame = frames.read_frame() => match frame {
                    Ok(None) => return Ok(()),
                    Ok(Some(_)) => tracing::debug!("Ignoring message from replica {}", replica),
                    Err(e) if e.is_transport() => return Err(e.into()),
                    Err(e) => tracing::debug!("Bad frame from replica {}: {}", replica, e),
                },
            }
        }
    }

    /// Sends every Block pending for `replica`, clearing each flag once the
    /// whole snapshot is written. Returns the number of Blocks sent.
    pub async fn deliver_pending<W>(&self, replica: ReplicaId, writer: &mut W) -> Result<usize>
    where
        W: AsyncWrite + Unpin,
    {
        let mut sent = 0;
        for block in self.store.blocks() {
            let Some((slots, version)) = block.sync_snapshot(replica) else {
                continue;
            };
            let id = block.id();
            let mut pieces = split_snapshot(slots, REPL_CHUNK_LEN)?;
            let last = pieces.pop().unwrap_or_default();
            for slots in pieces {
                ReplMessage::BlockPart { id, slots }.write_to(writer).await?;
            }
            ReplMessage::Block { id, slots: last }.write_to(writer).await?;
            block.mark_synced(replica, version);
            sent += 1;
        }
        Ok(sent)
    }
}

/// Groups a snapshot into pieces of roughly `budget` encoded bytes. An empty
/// snapshot yields one empty piece, so the replica still clears the Block.
pub fn split_snapshot(
    slots: HashMap<String, Slot>,
    budget: u64,
) -> Result<Vec<HashMap<String, Slot>>, ProtocolError> {
    let mut pieces = Vec::new();
    let mut current = HashMap::new();
    let mut current_len = 0;

    for (key, slot) in slots {
        let len = encoded_len(&(&key, &slot))?;
        if !current.is_empty() && current_len + len > budget {
            pieces.push(std::mem::take(&mut current));
            current_len = 0;
        }
        current_len += len;
        current.insert(key, slot);
    }
    pieces.push(current);
    Ok(pieces)
}

async fn deny<W: AsyncWrite + Unpin>(writer: &mut W, reason: &str) {
    let msg = ReplMessage::Denied {
        reason: reason.to_string(),
    };
    let _ = msg.write_to(writer).await;
}
