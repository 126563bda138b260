//! End-to-end tests: real health checks against mock nodes, routing through
//! the full router, affinity and usage reconciliation.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use chrono::Utc;
use reqwest::Url;
use secrecy::SecretString;
use serde_json::json;
use tower::ServiceExt;
use wiremock::matchers::{body_json, body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use rpc_balancer::api::create_router;
use rpc_balancer::app::{
    AccessCacheConfig, AccessControlCache, AppState, HealthChecker, Node, NodeRegistry,
    run_access_maintenance,
};
use rpc_balancer::domain::GrantRecord;
use rpc_balancer::infra::{HttpAuthorizationService, NodeProxy, RpcTipProbe};
use rpc_balancer::test_utils::{MockAuthorizationService, MockTelemetrySink};

/// Mount a health-check answer and a tagged answer for proxied calls
async fn mount_node(server: &MockServer, tag: &str, height: u64) {
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"method": "eth_getBlockByNumber"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {"number": format!("{:#x}", height)}
        })))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"method": "eth_blockNumber"})))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-node", tag)
                .set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": "0x0"})),
        )
        .mount(server)
        .await;
}

fn registry_for(servers: &[&MockServer]) -> NodeRegistry {
    let mut registry = NodeRegistry::new();
    for server in servers {
        let proxy =
            NodeProxy::new(Url::parse(&server.uri()).unwrap(), Duration::from_secs(2)).unwrap();
        registry.add_node(Node::new("test", proxy));
    }
    registry
}

fn grant(access_id: &str) -> GrantRecord {
    GrantRecord {
        id: format!("grant-{}", access_id),
        access_id: access_id.to_string(),
        blockchain_access: true,
        extended_methods: false,
        period_seconds: 3600,
        period_start: Utc::now(),
        calls_per_period: 0,
        max_calls_per_period: 1000,
    }
}

async fn call_as(router: &Router, access_id: &str) -> String {
    let request = Request::builder()
        .method("POST")
        .uri(format!("/test/jsonrpc?access_id={}", access_id))
        .header("Content-Type", "application/json")
        .body(Body::from(
            r#"{"jsonrpc":"2.0","id":1,"method":"eth_blockNumber","params":[]}"#,
        ))
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    response
        .headers()
        .get("x-node")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string()
}

#[tokio::test]
async fn test_health_check_tip_routing_and_affinity() {
    let a = MockServer::start().await;
    let b = MockServer::start().await;
    let c = MockServer::start().await;
    mount_node(&a, "a", 0).await;
    mount_node(&b, "b", 5).await;
    mount_node(&c, "c", 0).await;

    let auth = MockAuthorizationService::new();
    auth.insert(grant("abc"));
    auth.insert(grant("xyz"));
    let state = Arc::new(AppState::new(registry_for(&[&a, &b, &c]), Arc::new(auth)));
    let router = create_router(Arc::clone(&state));

    // All three start alive at height zero
    let pool = state.registry.pool("test").unwrap();
    assert!(pool.nodes().iter().all(|n| n.liveness() == (true, 0)));

    let probe = Arc::new(RpcTipProbe::new(Duration::from_millis(500)).unwrap());
    let checker = HealthChecker::new(Arc::clone(&state.registry), probe);
    let round = checker.run_once().await;
    assert_eq!(round.alive, 3);
    assert_eq!(pool.nodes()[1].liveness(), (true, 5));
    assert_eq!(pool.highest_block(), 5);

    // Only the node at the tip is eligible
    assert_eq!(call_as(&router, "abc").await, "b");

    // Another node overtakes; the pinned caller stays put
    c.reset().await;
    mount_node(&c, "c", 9).await;
    checker.run_once().await;
    assert_eq!(pool.highest_block(), 9);

    assert_eq!(call_as(&router, "abc").await, "b");
    // A fresh caller follows the new tip
    assert_eq!(call_as(&router, "xyz").await, "c");
}

#[tokio::test]
async fn test_pinned_node_death_moves_caller() {
    let a = MockServer::start().await;
    let b = MockServer::start().await;
    mount_node(&a, "a", 7).await;
    mount_node(&b, "b", 7).await;

    let auth = MockAuthorizationService::new();
    auth.insert(grant("abc"));
    let state = Arc::new(AppState::new(registry_for(&[&a, &b]), Arc::new(auth)));
    let router = create_router(Arc::clone(&state));

    let probe = Arc::new(RpcTipProbe::new(Duration::from_millis(500)).unwrap());
    let checker = HealthChecker::new(Arc::clone(&state.registry), probe);
    checker.run_once().await;

    let first = call_as(&router, "abc").await;
    assert_eq!(call_as(&router, "abc").await, first);

    // The pinned node stops answering health checks
    let (pinned, other) = if first == "a" { (&a, "b") } else { (&b, "a") };
    pinned.reset().await;
    let round = checker.run_once().await;
    assert_eq!(round.dead, 1);

    assert_eq!(call_as(&router, "abc").await, other);
}

#[tokio::test]
async fn test_usage_reconciles_with_authorization_service() {
    let node = MockServer::start().await;
    mount_node(&node, "a", 1).await;

    let auth_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/access/abc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "g-abc",
            "access_id": "abc",
            "blockchain_access": true,
            "extended_methods": false,
            "period_seconds": 3600,
            "period_start": Utc::now().to_rfc3339(),
            "calls_per_period": 10,
            "max_calls_per_period": 1000
        })))
        .expect(1)
        .mount(&auth_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/grants/g-abc/usage"))
        .and(body_json(json!({"delta": 3})))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&auth_server)
        .await;

    let authorization = Arc::new(
        HttpAuthorizationService::new(
            &auth_server.uri(),
            SecretString::from("token".to_string()),
            Duration::from_secs(2),
        )
        .unwrap(),
    );
    let access = Arc::new(AccessControlCache::new(
        authorization.clone(),
        &AccessCacheConfig::default(),
    ));
    let telemetry = Arc::new(MockTelemetrySink::new());
    let state = Arc::new(
        AppState::new(registry_for(&[&node]), authorization)
            .with_access_cache(Arc::clone(&access))
            .with_telemetry(telemetry.clone()),
    );
    let router = create_router(Arc::clone(&state));

    for _ in 0..3 {
        call_as(&router, "abc").await;
    }
    assert_eq!(access.peek("abc").unwrap().session_calls, 3);

    run_access_maintenance(&state.access, &state.registry, &state.affinity, telemetry.as_ref())
        .await;

    let grant = access.peek("abc").unwrap();
    assert_eq!(grant.session_calls, 0);
    assert_eq!(grant.calls_per_period, 13);

    let reports = telemetry.system_reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].cached_grants, 1);
    assert_eq!(reports[0].affinity_entries, 1);
    assert_eq!(reports[0].alive_nodes, vec![("test".to_string(), 1)]);
}
