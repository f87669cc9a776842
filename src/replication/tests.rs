//! Replication Module Tests
//!
//! ## Test Scopes
//! - **Identity & Bookmark**: Creation, reload, and idempotent re-apply after a crash.
//! - **Delivery**: Which Blocks the master sends, when flags clear, and how
//!   oversized Blocks are split.
//! - **End to End**: A master and a replica over loopback TCP, including a
//!   reconnect over a stale session.

#[cfg(test)]
mod tests {
    use crate::config::ReplClientConfig;
    use crate::protocol::codec::FrameReader;
    use crate::replication::client::{PartialBlocks, REPL_FILE_NAME, ReplClient, SessionEnd};
    use crate::replication::master::{ReplMaster, split_snapshot};
    use crate::replication::types::{IDENTITY_LEN, REPL_FRAME_LIMIT, ReplClientState, ReplMessage};
    use crate::storage::partitioner::Partitioner;
    use crate::storage::store::Store;
    use crate::storage::types::{BlockId, ReplicaId, Slot};
    use std::collections::HashMap;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::net::TcpStream;

    fn test_store() -> (TempDir, Arc<Store>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path(), Partitioner::new(2, 2)).unwrap());
        (dir, store)
    }

    fn single_block_store() -> (TempDir, Arc<Store>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path(), Partitioner::new(1, 1)).unwrap());
        (dir, store)
    }

    fn unused_config() -> ReplClientConfig {
        ReplClientConfig {
            address: "127.0.0.1:1".parse().unwrap(),
            auth_secret: String::new(),
        }
    }

    fn snapshot(pairs: &[(&str, u8)]) -> HashMap<String, Slot> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), Slot::new(vec![*value], 0)))
            .collect()
    }

    fn contents(store: &Store) -> Vec<(String, Vec<u8>)> {
        let mut pairs: Vec<_> = store
            .list("")
            .into_iter()
            .filter_map(|key| store.get(&key).map(|slot| (key, slot.value)))
            .collect();
        pairs.sort();
        pairs
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
        for _ in 0..100 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        condition()
    }

    // ============================================================
    // IDENTITY & BOOKMARK TESTS
    // ============================================================

    #[test]
    fn test_generated_identity_is_unique() {
        let a = ReplClientState::generate();
        let b = ReplClientState::generate();

        assert_eq!(a.id.len(), IDENTITY_LEN);
        assert_eq!(a.head, 0);
        assert_ne!(a.id, b.id);
        assert_eq!(a.id_hex().len(), IDENTITY_LEN * 2);
    }

    #[test]
    fn test_open_creates_then_reloads_identity() {
        let (dir, store) = test_store();

        let first = ReplClient::open(store.clone(), dir.path(), unused_config()).unwrap();
        assert!(dir.path().join(REPL_FILE_NAME).exists());

        let second = ReplClient::open(store, dir.path(), unused_config()).unwrap();
        assert_eq!(first.state(), second.state());
    }

    #[test]
    fn test_open_rejects_corrupt_state_file() {
        let (dir, store) = test_store();
        std::fs::write(dir.path().join(REPL_FILE_NAME), [1, 2, 3]).unwrap();

        assert!(ReplClient::open(store, dir.path(), unused_config()).is_err());
    }

    #[test]
    fn test_state_written_only_when_head_moves() {
        let (dir, store) = test_store();
        let client = ReplClient::open(store, dir.path(), unused_config()).unwrap();

        assert!(!client.write_state_if_changed().unwrap());

        client.apply(BlockId::new(0, 0), snapshot(&[("a", 1)])).unwrap();
        assert_eq!(client.head(), 1);
        assert!(client.write_state_if_changed().unwrap());
        assert!(!client.write_state_if_changed().unwrap());
    }

    #[test]
    fn test_apply_unknown_block_fails_without_moving_head() {
        let (dir, store) = test_store();
        let client = ReplClient::open(store, dir.path(), unused_config()).unwrap();

        assert!(client.apply(BlockId::new(9, 9), HashMap::new()).is_err());
        assert_eq!(client.head(), 0);
    }

    #[test]
    fn test_reapply_after_crash_is_idempotent() {
        let (dir, store) = test_store();
        let changes: Vec<(BlockId, HashMap<String, Slot>)> = vec![
            (BlockId::new(0, 0), snapshot(&[("a", 1)])),
            (BlockId::new(0, 1), snapshot(&[("b", 2)])),
            (BlockId::new(1, 0), snapshot(&[("c", 3)])),
            (BlockId::new(0, 0), snapshot(&[("a", 4), ("d", 5)])),
            (BlockId::new(1, 1), snapshot(&[("e", 6)])),
        ];

        let client = ReplClient::open(store.clone(), dir.path(), unused_config()).unwrap();
        for (id, slots) in &changes[..3] {
            client.apply(*id, slots.clone()).unwrap();
        }
        client.write_state_if_changed().unwrap();
        for (id, slots) in &changes[3..] {
            client.apply(*id, slots.clone()).unwrap();
        }
        let expected = contents(&store);
        drop(client);

        // Restart: bookmark says 3, so changes 4 and 5 arrive again.
        let restarted = ReplClient::open(store.clone(), dir.path(), unused_config()).unwrap();
        assert_eq!(restarted.head(), 3);
        for (id, slots) in &changes[3..] {
            restarted.apply(*id, slots.clone()).unwrap();
        }

        assert_eq!(restarted.head(), 5);
        assert_eq!(contents(&store), expected);
        assert_eq!(store.block(BlockId::new(0, 0)).unwrap().get("a").unwrap().value, vec![4]);
    }

    // ============================================================
    // DELIVERY TESTS
    // ============================================================

    #[tokio::test]
    async fn test_deliver_pending_sends_flagged_blocks_once() {
        let (_dir, store) = test_store();
        let master = ReplMaster::new(store.clone(), "", Duration::from_millis(50));
        let replica = ReplicaId(1);
        store.register_replica(replica);

        // Initial registration flags every Block.
        let mut out = Vec::new();
        assert_eq!(master.deliver_pending(replica, &mut out).await.unwrap(), 4);
        assert_eq!(master.deliver_pending(replica, &mut out).await.unwrap(), 0);

        store.set("x", vec![1], 0);
        store.set("x", vec![2], 0);
        let mut out = Vec::new();
        assert_eq!(master.deliver_pending(replica, &mut out).await.unwrap(), 1);

        let mut reader = FrameReader::new(out.as_slice());
        let frame = reader.read_frame().await.unwrap().unwrap();
        match ReplMessage::decode(&frame).unwrap() {
            ReplMessage::Block { id, slots } => {
                assert_eq!(id, store.partitioner().locate("x"));
                assert_eq!(slots["x"].value, vec![2], "Only the latest state is sent");
            }
            other => panic!("expected block, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unregistered_replica_gets_nothing() {
        let (_dir, store) = test_store();
        let master = ReplMaster::new(store.clone(), "", Duration::from_millis(50));
        store.set("x", vec![1], 0);

        let mut out = Vec::new();
        assert_eq!(master.deliver_pending(ReplicaId(5), &mut out).await.unwrap(), 0);
        assert!(out.is_empty());
    }

    #[test]
    fn test_split_snapshot_respects_budget() {
        let slots: HashMap<String, Slot> = (0..10)
            .map(|i| (format!("k{}", i), Slot::new(vec![0; 100], 0)))
            .collect();

        // Each entry encodes to a little over 100 bytes, so two fit per piece.
        let pieces = split_snapshot(slots, 250).unwrap();
        assert_eq!(pieces.len(), 5);
        assert!(pieces.iter().all(|piece| piece.len() == 2));

        let empty = split_snapshot(HashMap::new(), 250).unwrap();
        assert_eq!(empty, vec![HashMap::new()], "An empty Block still needs one message");
    }

    #[tokio::test]
    async fn test_oversized_block_is_delivered_in_pieces() {
        let (_master_dir, master_store) = single_block_store();
        let big = 9 * 1024 * 1024;
        master_store.set("a", vec![1; big], 0);
        master_store.set("b", vec![2; big], 0);

        let master = ReplMaster::new(master_store.clone(), "", Duration::from_millis(50));
        let replica = ReplicaId(3);
        master_store.register_replica(replica);

        let mut out = Vec::new();
        assert_eq!(master.deliver_pending(replica, &mut out).await.unwrap(), 1);
        assert!(!master_store.blocks()[0].must_sync(replica));

        let (replica_dir, replica_store) = single_block_store();
        replica_store.set("stale", vec![0], 0);
        let client = ReplClient::open(replica_store.clone(), replica_dir.path(), unused_config()).unwrap();

        let mut reader = FrameReader::with_max_len(out.as_slice(), REPL_FRAME_LIMIT);
        let mut partial = PartialBlocks::new();
        let mut frames = 0;
        while let Some(frame) = reader.read_frame().await.unwrap() {
            let msg = ReplMessage::decode(&frame).unwrap();
            assert!(client.handle_message(msg, &mut partial).unwrap().is_none());
            frames += 1;
        }

        assert_eq!(frames, 2);
        assert!(partial.is_empty());
        assert_eq!(client.head(), 1, "Pieces count as one applied snapshot");
        assert_eq!(replica_store.get("a").unwrap().value.len(), big);
        assert_eq!(replica_store.get("b").unwrap().value[0], 2);
        assert!(replica_store.get("stale").is_none(), "Snapshot overwrites the Block");
    }

    // ============================================================
    // END TO END TESTS
    // ============================================================

    async fn start_master(store: Arc<Store>, secret: &str) -> (Arc<ReplMaster>, SocketAddr) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let master = ReplMaster::new(store, secret, Duration::from_millis(20));
        master.clone().start(listener);
        (master, addr)
    }

    #[tokio::test]
    async fn test_replica_catches_up_with_master() {
        let (_master_dir, master_store) = test_store();
        let (replica_dir, replica_store) = test_store();

        master_store.set("before", vec![0], 0);
        let (master, addr) = start_master(master_store.clone(), "repl").await;

        let config = ReplClientConfig {
            address: addr,
            auth_secret: "repl".to_string(),
        };
        let client = ReplClient::open(replica_store.clone(), replica_dir.path(), config).unwrap();
        let session = client.clone().start();

        assert!(wait_for(|| replica_store.get("before").is_some()).await);
        assert_eq!(master.connected_replicas().len(), 1);

        master_store.set("x", vec![1, 2, 3], 0);
        assert!(
            wait_for(|| replica_store.get("x").map(|s| s.value) == Some(vec![1, 2, 3])).await,
            "Replica should receive the new key"
        );

        master_store.delete("before");
        assert!(wait_for(|| replica_store.get("before").is_none()).await);
        assert!(client.head() >= 3);

        session.abort();
        assert!(wait_for(|| master.connected_replicas().is_empty()).await);
        let block = master_store.block(master_store.partitioner().locate("x")).unwrap();
        let replica_id = client.state().replica_id();
        assert!(!block.must_sync(replica_id), "Disconnected replica is forgotten");
    }

    #[tokio::test]
    async fn test_wrong_secret_is_denied() {
        let (_master_dir, master_store) = test_store();
        let (replica_dir, replica_store) = test_store();
        let (master, addr) = start_master(master_store, "right").await;

        let config = ReplClientConfig {
            address: addr,
            auth_secret: "wrong".to_string(),
        };
        let client = ReplClient::open(replica_store, replica_dir.path(), config).unwrap();

        let end = client.sync_session().await.unwrap();
        assert!(matches!(end, SessionEnd::Denied(_)));
        assert!(master.connected_replicas().is_empty());
    }

    #[tokio::test]
    async fn test_reconnect_replaces_stale_session() {
        let (_master_dir, master_store) = test_store();
        let (replica_dir, replica_store) = test_store();
        let (master, addr) = start_master(master_store.clone(), "").await;

        let config = ReplClientConfig {
            address: addr,
            auth_secret: String::new(),
        };
        let client = ReplClient::open(replica_store.clone(), replica_dir.path(), config).unwrap();
        let state = client.state();

        // An earlier session of the same replica that was never closed.
        let stale = TcpStream::connect(addr).await.unwrap();
        let (stale_reader, mut stale_writer) = stale.into_split();
        let hello = ReplMessage::Hello {
            id: state.id.clone(),
            head: 0,
            secret: String::new(),
        };
        hello.write_to(&mut stale_writer).await.unwrap();
        let mut stale_frames = FrameReader::with_max_len(stale_reader, REPL_FRAME_LIMIT);
        let welcome = stale_frames.read_frame().await.unwrap().unwrap();
        assert_eq!(ReplMessage::decode(&welcome).unwrap(), ReplMessage::Welcome);
        assert_eq!(master.connected_replicas(), vec![state.replica_id()]);

        let session = client.clone().start();
        master_store.set("x", vec![1], 0);
        assert!(wait_for(|| replica_store.get("x").is_some()).await);

        let drained = tokio::time::timeout(Duration::from_secs(2), async {
            while let Ok(Some(_)) = stale_frames.read_frame().await {}
        })
        .await;
        assert!(drained.is_ok(), "Master should close the replaced session");

        // The replaced session ending must not unregister the live one.
        master_store.set("y", vec![2], 0);
        assert!(wait_for(|| replica_store.get("y").is_some()).await);
        assert_eq!(master.connected_replicas(), vec![state.replica_id()]);

        session.abort();
    }
}
