//! Pull replication scenarios against the in-memory peer.

mod common;

use std::sync::atomic::Ordering;

use common::{FakeRemote, temp_store};
use satchel::{
    Direction, Replicator, ReplicatorConfig, ReplicatorState, Revision, replicate_pull,
    replicate_push,
};

#[tokio::test]
async fn pull_brings_remote_docs_local() {
    let (_dir, store) = temp_store();
    let remote = FakeRemote::new();
    remote.seed("alpha", &[serde_json::json!({"v": 1})]);
    remote.seed(
        "beta",
        &[serde_json::json!({"v": 1}), serde_json::json!({"v": 2})],
    );

    let replicator = replicate_pull(store.clone(), remote.clone());
    replicator.start().unwrap();
    assert_eq!(replicator.wait().await, ReplicatorState::Complete);

    assert_eq!(store.get("alpha").unwrap().body["v"], 1);
    let beta = store.get("beta").unwrap();
    assert_eq!(beta.body["v"], 2);
    assert_eq!(beta.rev.pos, 2);
    assert_eq!(
        store.revision_history("beta", &beta.rev).unwrap().len(),
        2,
        "full ancestor path was spliced in"
    );
}

#[tokio::test]
async fn pull_preserves_remote_conflicts() {
    let (_dir, store) = temp_store();
    // local doc at 1-a
    let root = Revision::new(1, "a");
    store
        .force_insert(&satchel::FetchedRevision {
            doc_id: "d".into(),
            rev: root.clone(),
            deleted: false,
            body: serde_json::json!({"v": 1}),
            history: vec![root.clone()],
            attachments: Default::default(),
            attachment_bodies: Default::default(),
        })
        .unwrap();

    // remote has two divergent children of 1-a
    let remote = FakeRemote::new();
    for (hash, v) in [("b1", 10), ("b2", 20)] {
        remote.seed_branch(
            "d",
            &[root.clone(), Revision::new(2, hash)],
            serde_json::json!({"v": v}),
            false,
        );
    }

    let replicator = replicate_pull(store.clone(), remote.clone());
    replicator.start().unwrap();
    assert_eq!(replicator.wait().await, ReplicatorState::Complete);

    let winner = store.get("d").unwrap();
    assert_eq!(winner.rev.to_string(), "2-b2", "deterministic winner");
    assert_eq!(winner.body["v"], 20);

    let conflicts = store.conflicts("d").unwrap();
    assert_eq!(conflicts.len(), 1, "losing branch preserved as conflict");
    assert_eq!(conflicts[0].rev.to_string(), "2-b1");
}

#[tokio::test]
async fn pull_resumes_from_checkpoint_without_refetching() {
    let (_dir, store) = temp_store();
    let remote = FakeRemote::new();
    for i in 0..1000 {
        remote.seed(&format!("doc-{i:05}"), &[serde_json::json!({"i": i})]);
    }

    let config = ReplicatorConfig {
        batch_limit: 100,
        ..Default::default()
    };

    // first run: the peer dies after serving one changes batch
    remote.fail_changes_after(1);
    let first = Replicator::new(
        store.clone(),
        remote.clone(),
        Direction::Pull,
        config.clone(),
    );
    first.start().unwrap();
    assert_eq!(first.wait().await, ReplicatorState::Error);

    let fetched_first = remote.changes_entries_served.load(Ordering::SeqCst);
    assert_eq!(fetched_first, 100, "one full batch served before the crash");
    assert_eq!(store.document_count().unwrap(), 100);
    let checkpoint = remote
        .checkpoint(first.replication_id())
        .expect("completed batch was checkpointed");
    assert_eq!(checkpoint.ordinal(), 100);

    // second run: resumes past the checkpoint and finishes the rest
    remote.fail_changes_after(u64::MAX);
    let second = Replicator::new(store.clone(), remote.clone(), Direction::Pull, config);
    assert_eq!(
        second.replication_id(),
        first.replication_id(),
        "same config shares the checkpoint"
    );
    second.start().unwrap();
    assert_eq!(second.wait().await, ReplicatorState::Complete);

    assert_eq!(store.document_count().unwrap(), 1000);
    assert_eq!(
        remote.changes_entries_served.load(Ordering::SeqCst),
        1000,
        "committed batches are never re-fetched"
    );
}

#[tokio::test]
async fn pull_attachments_and_dedup() {
    let (_dir, store) = temp_store();
    let remote = FakeRemote::new();
    let payload = vec![0x5au8; 1024 * 1024];
    remote.seed_with_attachment(
        "first",
        serde_json::json!({"n": 1}),
        "payload.bin",
        "application/octet-stream",
        &payload,
    );
    remote.seed_with_attachment(
        "second",
        serde_json::json!({"n": 2}),
        "payload.bin",
        "application/octet-stream",
        &payload,
    );

    let replicator = replicate_pull(store.clone(), remote.clone());
    replicator.start().unwrap();
    assert_eq!(replicator.wait().await, ReplicatorState::Complete);

    for id in ["first", "second"] {
        let doc = store.get(id).unwrap();
        let data = store
            .attachment_data(id, &doc.rev, "payload.bin")
            .unwrap();
        assert_eq!(data, payload);
    }

    let blob_files = std::fs::read_dir(store.blob_store().dir()).unwrap().count();
    assert_eq!(blob_files, 1, "identical bytes share one local blob");
}

#[tokio::test]
async fn push_then_pull_is_a_noop() {
    let (_dir, store) = temp_store();
    store
        .create("doc", serde_json::json!({"v": 1}), vec![])
        .unwrap();
    let remote = FakeRemote::new();

    let push = replicate_push(store.clone(), remote.clone());
    push.start().unwrap();
    assert_eq!(push.wait().await, ReplicatorState::Complete);

    let seq_before = store.local_seq().unwrap();
    let pull = replicate_pull(store.clone(), remote.clone());
    pull.start().unwrap();
    assert_eq!(pull.wait().await, ReplicatorState::Complete);

    assert_eq!(
        store.local_seq().unwrap(),
        seq_before,
        "pulling what we pushed writes nothing"
    );
    assert_eq!(pull.progress().documents_written(), 0);
}

#[tokio::test]
async fn pull_deleted_doc_deletes_locally() {
    let (_dir, store) = temp_store();
    let remote = FakeRemote::new();
    let history = remote.seed("doc", &[serde_json::json!({"v": 1})]);

    let pull = replicate_pull(store.clone(), remote.clone());
    pull.start().unwrap();
    pull.wait().await;
    assert!(store.get("doc").is_ok());

    // remote deletes the doc
    let tombstone = satchel_core::new_rev_id(history.last(), &serde_json::json!({}), true);
    remote.seed_branch(
        "doc",
        &[history[0].clone(), tombstone],
        serde_json::json!({}),
        true,
    );

    let pull = replicate_pull(store.clone(), remote.clone());
    pull.start().unwrap();
    assert_eq!(pull.wait().await, ReplicatorState::Complete);

    assert!(
        matches!(store.get("doc"), Err(satchel::SatchelError::DocumentMissing(_))),
        "tombstone won locally"
    );
}
