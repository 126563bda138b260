use criterion::{Criterion, criterion_group, criterion_main};
use reqwest::{Client, Url};
use rpc_balancer::app::{
    AccessCacheConfig, AccessControlCache, ClientAffinityCache, Node, NodeRegistry,
};
use rpc_balancer::domain::GrantRecord;
use rpc_balancer::infra::NodeProxy;
use rpc_balancer::test_utils::MockAuthorizationService;
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

fn registry(size: u16) -> NodeRegistry {
    let mut registry = NodeRegistry::new();
    for i in 0..size {
        let url = Url::parse(&format!("http://10.0.0.{}:8545/", i + 1)).unwrap();
        let node = registry.add_node(Node::new("eth", NodeProxy::with_client(url, Client::new())));
        // Half the fleet lags one block behind the tip
        node.set_alive(100 + u64::from(i % 2));
    }
    registry
}

fn bench_select_node(c: &mut Criterion) {
    let registry = registry(16);
    c.bench_function("select_node_16", |b| {
        b.iter(|| black_box(registry.select_node(black_box("eth"))))
    });
}

fn bench_affinity(c: &mut Criterion) {
    let registry = registry(4);
    let node = registry.select_node("eth").unwrap();
    let cache = ClientAffinityCache::new(Duration::from_secs(30));
    for i in 0..10_000 {
        cache.put(&format!("caller-{}", i), Arc::clone(&node));
    }

    c.bench_function("affinity_get_hit", |b| {
        b.iter(|| black_box(cache.get(black_box("caller-4242"))))
    });
}

fn bench_access_admit(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let auth = Arc::new(MockAuthorizationService::new());
    auth.insert(GrantRecord {
        id: "g-1".to_string(),
        access_id: "abc".to_string(),
        blockchain_access: true,
        extended_methods: false,
        period_seconds: 3600,
        period_start: chrono::Utc::now(),
        calls_per_period: 0,
        max_calls_per_period: u64::MAX,
    });
    let cache = AccessControlCache::new(auth, &AccessCacheConfig::default());

    c.bench_function("access_resolve_and_admit", |b| {
        b.to_async(&rt).iter(|| async {
            let grant = cache.resolve("abc").await.unwrap();
            black_box(cache.admit(&grant, chrono::Utc::now()))
        })
    });
}

criterion_group!(benches, bench_select_node, bench_affinity, bench_access_admit);
criterion_main!(benches);
