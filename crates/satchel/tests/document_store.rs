//! Local store behavior through the public API: winner selection, change
//! feed ordering, conflicts, compaction.

mod common;

use common::temp_store;
use satchel::{NewAttachment, Revision, SatchelError};

#[tokio::test]
async fn winner_follows_the_deterministic_rule() {
    let (_dir, store) = temp_store();

    // three leaves: 2-aaa, 3-mmm, and a deleted 3-zzz
    let seed = |hash: &str, pos: u64, deleted: bool| satchel::FetchedRevision {
        doc_id: "d".into(),
        rev: Revision::new(pos, hash),
        deleted,
        body: serde_json::json!({"hash": hash}),
        history: if pos == 2 {
            vec![Revision::new(1, "root"), Revision::new(2, hash)]
        } else {
            vec![
                Revision::new(1, "root"),
                Revision::new(2, format!("p{hash}")),
                Revision::new(3, hash),
            ]
        },
        attachments: Default::default(),
        attachment_bodies: Default::default(),
    };

    store.force_insert(&seed("aaa", 2, false)).unwrap();
    store.force_insert(&seed("mmm", 3, false)).unwrap();
    store.force_insert(&seed("zzz", 3, true)).unwrap();

    // highest non-deleted generation wins; the deleted 3-zzz loses despite
    // sorting higher
    assert_eq!(store.get("d").unwrap().rev.to_string(), "3-mmm");

    let conflicts = store.conflicts("d").unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].rev.to_string(), "2-aaa");
}

#[tokio::test]
async fn changes_feed_is_strictly_ascending_without_duplicates() {
    let (_dir, store) = temp_store();
    let mut revs = Vec::new();
    for i in 0..10 {
        revs.push(
            store
                .create(&format!("doc-{i}"), serde_json::json!({"i": i}), vec![])
                .unwrap(),
        );
    }
    // touch a few docs again
    for doc in revs.iter().take(3) {
        store
            .update(&doc.doc_id, &doc.rev, serde_json::json!({"touched": true}), vec![])
            .unwrap();
    }

    let page = store.changes(0, 1000).unwrap();
    let seqs: Vec<u64> = page.results.iter().map(|c| c.seq.ordinal()).collect();
    let mut sorted = seqs.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(seqs, sorted, "ascending, no duplicates");

    let ids: std::collections::HashSet<&str> =
        page.results.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids.len(), page.results.len(), "one entry per document");
    assert_eq!(page.results.len(), 10);
}

#[tokio::test]
async fn update_on_stale_revision_is_a_conflict() {
    let (_dir, store) = temp_store();
    let r1 = store
        .create("doc", serde_json::json!({"v": 1}), vec![])
        .unwrap();
    store
        .update("doc", &r1.rev, serde_json::json!({"v": 2}), vec![])
        .unwrap();

    let stale_update = store.update("doc", &r1.rev, serde_json::json!({"v": 3}), vec![]);
    assert!(matches!(stale_update, Err(SatchelError::Conflict)));
    let stale_delete = store.delete("doc", &r1.rev);
    assert!(matches!(stale_delete, Err(SatchelError::Conflict)));
}

#[tokio::test]
async fn attachment_lifecycle() {
    let (_dir, store) = temp_store();
    let doc = store
        .create(
            "doc",
            serde_json::json!({"kind": "report"}),
            vec![
                NewAttachment {
                    name: "body.md".into(),
                    content_type: "text/markdown".into(),
                    data: b"# report".to_vec(),
                },
                NewAttachment {
                    name: "logo.png".into(),
                    content_type: "image/png".into(),
                    data: vec![0x89, 0x50, 0x4e, 0x47],
                },
            ],
        )
        .unwrap();
    assert_eq!(doc.attachments.len(), 2);

    // update keeps both, then one is removed
    let doc2 = store
        .update("doc", &doc.rev, serde_json::json!({"kind": "report", "v": 2}), vec![])
        .unwrap();
    assert_eq!(doc2.attachments.len(), 2);

    let doc3 = store.remove_attachment("doc", &doc2.rev, "logo.png").unwrap();
    assert_eq!(doc3.attachments.len(), 1);
    assert_eq!(
        store.attachment_data("doc", &doc3.rev, "body.md").unwrap(),
        b"# report"
    );

    // the dropped blob becomes garbage once nothing references it
    store.compact(0).unwrap();
    let removed = store.collect_garbage().unwrap();
    assert_eq!(removed, 1, "logo blob collected");
}

#[tokio::test]
async fn compaction_keeps_leaves_and_rev_ids() {
    let (_dir, store) = temp_store();
    let mut rev = store
        .create("doc", serde_json::json!({"v": 0}), vec![])
        .unwrap()
        .rev;
    for v in 1..=9 {
        rev = store
            .update("doc", &rev, serde_json::json!({"v": v}), vec![])
            .unwrap()
            .rev;
    }

    store.compact(0).unwrap();

    let winner = store.get("doc").unwrap();
    assert_eq!(winner.body["v"], 9);
    // protocol-visible history survives compaction
    assert_eq!(store.revision_history("doc", &winner.rev).unwrap().len(), 10);
    // but an old body is gone
    let old = store.revision_history("doc", &winner.rev).unwrap()[0].clone();
    assert!(store.get_rev("doc", &old).is_err());
}
