use criterion::{black_box, criterion_group, criterion_main, Criterion};
use mapsync_collab::poke::PokeGroup;
use mapsync_collab::protocol::{PushRequest, SyncMessage};
use mapsync_collab::storage::{DocumentStore, StoreConfig};
use mapsync_collab::Authority;
use mapsync_core::{
    FeatureCollectionDocument, Feature, Geometry, Mutation, WrappedFeatureCollectionId,
};
use uuid::Uuid;

fn doc_id() -> WrappedFeatureCollectionId {
    WrappedFeatureCollectionId::parse("bench").unwrap()
}

fn polygon_feature(i: usize) -> Feature {
    let x = i as f64;
    Feature::new(
        format!("parcel-{i}"),
        Geometry::Polygon(vec![vec![
            [x, 0.0],
            [x + 1.0, 0.0],
            [x + 1.0, 1.0],
            [x, 1.0],
            [x, 0.0],
        ]]),
    )
    .with_property("zone", "residential")
    .with_property("area", 1.0)
}

fn document_with(n: usize) -> FeatureCollectionDocument {
    let mut doc = FeatureCollectionDocument::empty(doc_id());
    for i in 0..n {
        doc.features.insert(format!("parcel-{i}").into(), polygon_feature(i));
    }
    doc.version = n as u64;
    doc
}

fn bench_push_encode(c: &mut Criterion) {
    let client = Uuid::new_v4();
    let request = PushRequest {
        mutations: (0..10).map(|i| Mutation::create(polygon_feature(i))).collect(),
    };

    c.bench_function("push_encode_10_mutations", |b| {
        b.iter(|| {
            let msg = SyncMessage::push(black_box(1), "bench", black_box(client), &request).unwrap();
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_push_decode(c: &mut Criterion) {
    let request = PushRequest {
        mutations: (0..10).map(|i| Mutation::create(polygon_feature(i))).collect(),
    };
    let encoded = SyncMessage::push(1, "bench", Uuid::new_v4(), &request)
        .unwrap()
        .encode()
        .unwrap();

    c.bench_function("push_decode_10_mutations", |b| {
        b.iter(|| {
            let msg = SyncMessage::decode(black_box(&encoded)).unwrap();
            black_box(msg.push_request().unwrap());
        })
    });
}

fn bench_snapshot_roundtrip(c: &mut Criterion) {
    let doc = document_with(1_000);

    c.bench_function("snapshot_roundtrip_1000_features", |b| {
        b.iter(|| {
            let encoded = SyncMessage::snapshot(1, black_box(&doc)).unwrap().encode().unwrap();
            black_box(SyncMessage::decode(&encoded).unwrap().document().unwrap());
        })
    });
}

fn bench_poke_fanout(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("poke_1000_times_100_subscribers", |b| {
        b.iter(|| {
            rt.block_on(async {
                let group = PokeGroup::new(1024);
                let subscriptions: Vec<_> =
                    (0..100).map(|_| group.subscribe(Uuid::new_v4())).collect();

                let origin = Uuid::new_v4();
                for _ in 0..1000 {
                    black_box(group.poke(origin));
                }
                drop(subscriptions);
            });
        })
    });
}

fn bench_authority_push(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let authority = Authority::in_memory();
    let client = Uuid::new_v4();

    c.bench_function("authority_push_set_property", |b| {
        rt.block_on(async {
            authority
                .push(&doc_id(), client, vec![Mutation::create(polygon_feature(0))])
                .await
                .unwrap();
        });
        let mut i = 0i64;
        b.iter(|| {
            rt.block_on(async {
                let mutation = Mutation::set_property("parcel-0", "revision", i);
                black_box(authority.push(&doc_id(), client, vec![mutation]).await.unwrap());
            });
            i += 1;
        })
    });
}

fn bench_store_commit(c: &mut Criterion) {
    let dir = std::env::temp_dir().join(format!("mapsync_bench_commit_{}", Uuid::new_v4()));
    let store = DocumentStore::open(StoreConfig {
        path: dir.clone(),
        ..StoreConfig::default()
    })
    .unwrap();
    let mut doc = document_with(100);

    c.bench_function("store_commit_100_features", |b| {
        b.iter(|| {
            doc.version += 1;
            let mutation = Mutation::set_property("parcel-0", "revision", doc.version as i64);
            black_box(store.commit(&doc, &[(doc.version, mutation)]).unwrap());
        })
    });

    let _ = std::fs::remove_dir_all(&dir);
}

fn bench_store_load_document(c: &mut Criterion) {
    let dir = std::env::temp_dir().join(format!("mapsync_bench_load_{}", Uuid::new_v4()));
    let store = DocumentStore::open(StoreConfig {
        path: dir.clone(),
        ..StoreConfig::default()
    })
    .unwrap();
    store.save_document(&document_with(1_000)).unwrap();

    c.bench_function("store_load_1000_features", |b| {
        b.iter(|| {
            black_box(store.load_document(black_box(&doc_id())).unwrap());
        })
    });

    let _ = std::fs::remove_dir_all(&dir);
}

criterion_group!(
    benches,
    bench_push_encode,
    bench_push_decode,
    bench_snapshot_roundtrip,
    bench_poke_fanout,
    bench_authority_push,
    bench_store_commit,
    bench_store_load_document,
);
criterion_main!(benches);
