//! Persistence integration tests.
//!
//! Verifies:
//! - Authority state survives a restart through the RocksDB store
//! - Push idempotency survives a restart
//! - Multi-document isolation under persistence
//! - Mutation log compaction keeps the dedup window

use std::sync::Arc;

use mapsync_collab::{
    Authority, AuthorityConfig, DocumentStore, MutationStatus, StoreConfig, SyncServer,
};
use mapsync_core::{Feature, Geometry, Mutation, WrappedFeatureCollectionId};
use tempfile::tempdir;
use uuid::Uuid;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn doc(name: &str) -> WrappedFeatureCollectionId {
    WrappedFeatureCollectionId::parse(name).unwrap()
}

fn create(id: &str) -> Mutation {
    Mutation::create(Feature::new(id, Geometry::Point([1.0, 2.0])).with_property("source", "test"))
}

fn authority_at(path: &std::path::Path, config: AuthorityConfig) -> Authority {
    let store = DocumentStore::open(StoreConfig::for_testing(path)).unwrap();
    Authority::new(config, Some(Arc::new(store)))
}

// ─── Crash recovery ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_crash_recovery_document_survives_restart() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("db");

    {
        let server = SyncServer::with_storage("127.0.0.1:0", &db_path).unwrap();
        let authority = server.authority();
        authority
            .push(&doc("roads"), Uuid::new_v4(), vec![create("r1"), create("r2")])
            .await
            .unwrap();
        authority
            .push(&doc("roads"), Uuid::new_v4(), vec![Mutation::delete("r1")])
            .await
            .unwrap();
    }

    let server = SyncServer::with_storage("127.0.0.1:0", &db_path).unwrap();
    assert_eq!(server.recover().await.unwrap(), 1);

    let restored = server.authority().pull(&doc("roads")).await.unwrap();
    assert_eq!(restored.version, 3);
    assert!(!restored.contains(&"r1".into()));
    assert!(restored.contains(&"r2".into()));
}

#[tokio::test]
async fn test_crash_recovery_keeps_idempotency() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("db");
    let mutation = create("once");

    {
        let authority = authority_at(&db_path, AuthorityConfig::for_testing());
        authority
            .push(&doc("sites"), Uuid::new_v4(), vec![mutation.clone()])
            .await
            .unwrap();
    }

    // No explicit recover: the document is loaded on first use.
    let authority = authority_at(&db_path, AuthorityConfig::for_testing());
    let ack = authority
        .push(&doc("sites"), Uuid::new_v4(), vec![mutation.clone()])
        .await
        .unwrap();
    assert_eq!(ack.status_of(mutation.id), Some(&MutationStatus::Duplicate));
    assert_eq!(ack.version, 1);
}

#[tokio::test]
async fn test_crash_recovery_multiple_documents() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("db");
    let names = ["north", "south", "east"];

    {
        let authority = authority_at(&db_path, AuthorityConfig::for_testing());
        for (i, name) in names.iter().enumerate() {
            let mutations = (0..=i).map(|n| create(&format!("{name}-{n}"))).collect();
            authority
                .push(&doc(name), Uuid::new_v4(), mutations)
                .await
                .unwrap();
        }
    }

    let authority = authority_at(&db_path, AuthorityConfig::for_testing());
    assert_eq!(authority.recover().await.unwrap(), names.len());
    for (i, name) in names.iter().enumerate() {
        let restored = authority.pull(&doc(name)).await.unwrap();
        assert_eq!(restored.len(), i + 1, "{name}");
        assert_eq!(restored.version, i as u64 + 1);
        assert!(restored.iter().all(|f| f.id.as_str().starts_with(name)));
    }
}

// ─── Mutation log ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_every_accepted_push_is_logged() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("db");
    let authority = authority_at(&db_path, AuthorityConfig::for_testing());

    let rejected = Mutation::delete("nothing");
    authority
        .push(&doc("log"), Uuid::new_v4(), vec![create("a"), create("b")])
        .await
        .unwrap();
    authority
        .push(
            &doc("log"),
            Uuid::new_v4(),
            vec![Mutation::set_property("ghost", "k", 1i64), rejected],
        )
        .await
        .unwrap();

    let store = authority.store().unwrap();
    let logged = store.load_mutations_since(&doc("log"), 0).unwrap();
    let versions: Vec<u64> = logged.iter().map(|(v, _)| *v).collect();
    // The unknown-feature update is rejected; the delete of a missing
    // feature is accepted.
    assert_eq!(versions, vec![1, 2, 3]);

    let meta = store.load_metadata(&doc("log")).unwrap();
    assert_eq!(meta.version, 3);
    assert_eq!(meta.feature_count, 2);
}

#[tokio::test]
async fn test_compaction_keeps_dedup_window() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("db");
    let config = AuthorityConfig {
        dedup_window: 4,
        compact_every: 8,
        ..AuthorityConfig::for_testing()
    };
    let authority = authority_at(&db_path, config.clone());

    let mutations: Vec<Mutation> = (0..16).map(|i| create(&format!("p{i}"))).collect();
    for mutation in &mutations {
        authority
            .push(&doc("dense"), Uuid::new_v4(), vec![mutation.clone()])
            .await
            .unwrap();
    }

    let store = authority.store().unwrap();
    let logged = store.load_mutations_since(&doc("dense"), 0).unwrap();
    assert_eq!(logged.first().map(|(v, _)| *v), Some(12));
    assert_eq!(logged.len(), 5);
    drop(authority);

    // The most recent ids are still recognised after a restart.
    let authority = authority_at(&db_path, config);
    let last = mutations.last().unwrap().clone();
    let ack = authority
        .push(&doc("dense"), Uuid::new_v4(), vec![last.clone()])
        .await
        .unwrap();
    assert_eq!(ack.status_of(last.id), Some(&MutationStatus::Duplicate));
}
