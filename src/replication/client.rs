//! Replication client (replica side).
//!
//! Connects to the master, applies every Block snapshot it receives by
//! overwriting the local Block, and advances `head`. The `(id, head)` pair is
//! written to disk by a periodic task only when `head` moved, so after an
//! unclean restart up to one period of snapshots may be applied again. Apply
//! is an overwrite, which makes that harmless.
//!
//! Only a `Denied` answer stops the client for good. The master sends it for
//! a wrong secret or a malformed identity; every other session end is retried.

use super::types::{REPL_FRAME_LIMIT, ReplClientState, ReplMessage};
use crate::config::ReplClientConfig;
use crate::protocol::codec::FrameReader;
use crate::storage::block::write_atomically;
use crate::storage::error::StorageError;
use crate::storage::store::Store;
use crate::storage::types::{BlockId, Slot};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

pub const REPL_FILE_NAME: &str = "repl.bin";

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Leading pieces of oversized Block snapshots, waiting for their final piece.
pub type PartialBlocks = HashMap<BlockId, HashMap<String, Slot>>;

/// How a replication session with the master ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The master closed the stream; reconnecting is expected to work.
    Closed,
    /// The master refused this replica; retrying will not help.
    Denied(String),
}

pub struct ReplClient {
    store: Arc<Store>,
    path: PathBuf,
    config: ReplClientConfig,
    state: Mutex<ReplClientState>,
    head_changed: AtomicBool,
}

impl ReplClient {
    /// Loads the persisted identity and bookmark from `dir`, or creates and
    /// writes a new identity on first run.
    pub fn open(
        store: Arc<Store>,
        dir: &Path,
        config: ReplClientConfig,
    ) -> Result<Arc<Self>, StorageError> {
        let path = dir.join(REPL_FILE_NAME);
        let state = ensure_state_file(&path)?;
        tracing::info!(
            "Initialised repl client with id {} and head {}",
            state.id_hex(),
            state.head
        );

        Ok(Arc::new(Self {
            store,
            path,
            config,
            state: Mutex::new(state),
            head_changed: AtomicBool::new(false),
        }))
    }

    pub fn state(&self) -> ReplClientState {
        self.state.lock().clone()
    }

    pub fn head(&self) -> u64 {
        self.state.lock().head
    }

    /// Overwrites a local Block with the master's snapshot and advances `head`.
    pub fn apply(&self, id: BlockId, slots: HashMap<String, Slot>) -> Result<(), StorageError> {
        self.store.apply_block(id, slots)?;
        self.state.lock().head += 1;
        self.head_changed.store(true, Ordering::Release);
        Ok(())
    }

    /// Persists `(id, head)` if `head` moved since the last write.
    pub fn write_state_if_changed(&self) -> Result<bool, StorageError> {
        if !self.head_changed.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }
        let state = self.state();
        if let Err(e) = write_state(&self.path, &state) {
            self.head_changed.store(true, Ordering::Release);
            return Err(e);
        }
        tracing::debug!("Wrote repl state at head {}", state.head);
        Ok(true)
    }

    pub fn start_state_writer(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if let Err(e) = self.write_state_if_changed() {
                    tracing::error!("Failed to write repl state: {}", e);
                }
            }
        })
    }

    /// Keeps a session with the master open, reconnecting after failures,
    /// until the master denies this replica.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.sync_session().await {
                    Ok(SessionEnd::Closed) => {
                        tracing::info!("Master {} closed the replication stream", self.config.address);
                    }
                    Ok(SessionEnd::Denied(reason)) => {
                        tracing::error!("Master {} denied replication: {}", self.config.address, reason);
                        return;
                    }
                    Err(e) => {
                        tracing::warn!("Replication from {} failed: {:#}", self.config.address, e);
                    }
                }
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        })
    }

    /// One connection to the master: handshake, then apply snapshots until
    /// the stream ends.
    pub async fn sync_session(&self) -> Result<SessionEnd> {
        let stream = TcpStream::connect(self.config.address)
            .await
            .with_context(|| format!("failed to connect to master {}", self.config.address))?;
        let _ = stream.set_nodelay(true);
        // The write half must outlive the session: dropping it shuts down our
        // side and the master reads that as a disconnect.
        let (reader, mut writer) = stream.into_split();
        let mut frames = FrameReader::with_max_len(reader, REPL_FRAME_LIMIT);

        let hello = {
            let state = self.state.lock();
            ReplMessage::Hello {
                id: state.id.clone(),
                head: state.head,
                secret: self.config.auth_secret.clone(),
            }
        };
        hello.write_to(&mut writer).await?;

        let mut partial = PartialBlocks::new();
        while let Some(frame) = frames.read_frame().await? {
            let msg = ReplMessage::decode(&frame)?;
            if let Some(end) = self.handle_message(msg, &mut partial)? {
                return Ok(end);
            }
        }

        Ok(SessionEnd::Closed)
    }

    /// Applies one message from the master. Returns `Some` if the message
    /// ends the session.
    pub fn handle_message(
        &self,
        msg: ReplMessage,
        partial: &mut PartialBlocks,
    ) -> Result<Option<SessionEnd>> {
        match msg {
            ReplMessage::Welcome => {
                tracing::info!("Replicating from master {}", self.config.address);
            }
            ReplMessage::Denied { reason } => return Ok(Some(SessionEnd::Denied(reason))),
            ReplMessage::BlockPart { id, slots } => {
                partial.entry(id).or_default().extend(slots);
            }
            ReplMessage::Block { id, slots } => {
                let snapshot = match partial.remove(&id) {
                    Some(mut pieces) => {
                        pieces.extend(slots);
                        pieces
                    }
                    None => slots,
                };
                self.apply(id, snapshot)
                    .with_context(|| format!("failed to apply block {}", id))?;
            }
            ReplMessage::Hello { .. } => {
                tracing::warn!("Unexpected hello from master {}", self.config.address);
            }
        }
        Ok(None)
    }
}

fn ensure_state_file(path: &Path) -> Result<ReplClientState, StorageError> {
    match std::fs::read(path) {
        Ok(bytes) => bincode::deserialize(&bytes).map_err(|source| StorageError::Decode {
            path: path.to_path_buf(),
            source,
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!("No repl state found, creating {}", path.display());
            let state = ReplClientState::generate();
            write_state(path, &state)?;
            Ok(state)
        }
        Err(e) => Err(StorageError::io(path, e)),
    }
}

fn write_state(path: &Path, state: &ReplClientState) -> Result<(), StorageError> {
    let encoded = bincode::serialize(state).map_err(|source| StorageError::Encode {
        what: "repl state".to_string(),
        source,
    })?;
    write_atomically(path, &encoded)
}
