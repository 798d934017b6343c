use criterion::{criterion_group, criterion_main, Criterion};
use epigraph_core::model::{Edge, EdgeType, Node, NodeMetadata, NodeType, UserId};
use std::sync::Arc;
use storage::Repository;

fn bench_insert_node_with_metadata(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let wal_path = dir.path().join("storage_bench.wal");
    let repo = rt.block_on(async { Arc::new(Repository::open(&wal_path).await.unwrap()) });
    let user = UserId::new("bench-user");
    rt.block_on(async { repo.ensure_user(&user).await.unwrap() });

    c.bench_function("insert_node_with_metadata", |b| {
        b.iter(|| {
            rt.block_on(async {
                let node = Node::new(user.clone(), NodeType::Concept, 0);
                let metadata = NodeMetadata::new(node.id.clone()).with_label("battery research");
                repo.insert_node_with_metadata(node, metadata).await.unwrap();
            })
        })
    });
}

fn bench_insert_edges_on_conflict_skip(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let wal_path = dir.path().join("storage_bench_edges.wal");
    let repo = rt.block_on(async { Arc::new(Repository::open(&wal_path).await.unwrap()) });
    let user = UserId::new("bench-user");

    let (a, b_node) = rt.block_on(async {
        repo.ensure_user(&user).await.unwrap();
        let a = Node::new(user.clone(), NodeType::Person, 0);
        let b_node = Node::new(user.clone(), NodeType::Person, 0);
        repo.insert_node_with_metadata(a.clone(), NodeMetadata::new(a.id.clone())).await.unwrap();
        repo.insert_node_with_metadata(b_node.clone(), NodeMetadata::new(b_node.id.clone())).await.unwrap();
        (a, b_node)
    });

    c.bench_function("insert_edges_batch_with_conflicts", |b| {
        b.iter(|| {
            rt.block_on(async {
                let edge = Edge::new(user.clone(), a.id.clone(), b_node.id.clone(), EdgeType::RelatedTo, 0).unwrap();
                repo.insert_edges(vec![edge]).await.unwrap();
            })
        })
    });
}

criterion_group!(benches, bench_insert_node_with_metadata, bench_insert_edges_on_conflict_skip);
criterion_main!(benches);
