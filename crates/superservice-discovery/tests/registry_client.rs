//! Registry client against a mocked Consul agent

use std::sync::Arc;
use std::time::Duration;
use superservice_discovery::{ConsulConfig, RegistryClient, ServiceFinder};
use wiremock::matchers::{body_partial_json, method, path, path_regex, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn consul_client(server: &MockServer) -> RegistryClient {
    RegistryClient::consul(ConsulConfig {
        address: server.uri(),
        datacenter: None,
        timeout: Duration::from_secs(2),
    })
    .with_hostname("node.example")
}

fn health_body(instances: &[(&str, u16)]) -> serde_json::Value {
    serde_json::Value::Array(
        instances
            .iter()
            .map(|(address, port)| {
                serde_json::json!({
                    "Node": {"Node": "node-1", "Address": "10.0.0.1"},
                    "Service": {
                        "ID": format!("orders-{port}-x"),
                        "Service": "orders",
                        "Address": address,
                        "Port": port,
                        "Tags": []
                    }
                })
            })
            .collect(),
    )
}

#[tokio::test]
async fn test_register_and_resolve_through_consul() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path("/v1/agent/service/register"))
        .and(body_partial_json(serde_json::json!({
            "ID": "orders-9000-node-example",
            "Name": "orders",
            "Address": "10.0.0.5",
            "Port": 9000,
            "Check": {
                "CheckID": "service:orders-9000-node-example",
                "TCP": "127.0.0.1:9000",
                "Interval": "10s",
                "DeregisterCriticalServiceAfter": "10m"
            }
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v1/health/service/orders"))
        .and(query_param("passing", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(health_body(&[("10.0.0.5", 9000)])))
        .mount(&server)
        .await;

    let client = consul_client(&server);
    client.register("orders", "10.0.0.5:9000", "").await.unwrap();

    assert_eq!(
        client.resolve("orders", "").await.as_deref(),
        Some("10.0.0.5:9000")
    );
}

#[tokio::test]
async fn test_register_failure_is_wrapped() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path("/v1/agent/service/register"))
        .respond_with(ResponseTemplate::new(500).set_body_string("rpc error"))
        .expect(1)
        .mount(&server)
        .await;

    let client = consul_client(&server);
    let err = client
        .register("orders", "10.0.0.5:9000", "")
        .await
        .unwrap_err();

    assert!(err.is_registration_error());
    assert!(err.to_string().contains("initial register service 'orders'"));
    assert!(client.registered().is_empty());
}

#[tokio::test]
async fn test_resolve_miss_and_registry_error_are_empty() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/health/service/orders"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/health/service/billing"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let client = consul_client(&server);

    assert_eq!(client.resolve("orders", "").await, None);
    assert_eq!(client.resolve("billing", "").await, None);
    assert!(client.resolve_all("billing", "").await.is_empty());
}

#[tokio::test]
async fn test_literal_ip_makes_no_request() {
    let server = MockServer::start().await;

    Mock::given(path_regex("^/v1/.*"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let client = consul_client(&server);
    assert_eq!(client.resolve("10.0.0.9", "").await.as_deref(), Some("10.0.0.9"));
}

#[tokio::test]
async fn test_concurrent_lookups_share_one_request() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/health/service/orders"))
        .and(query_param("tag", "blue"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(health_body(&[("10.0.0.5", 9000), ("10.0.0.6", 9000)]))
                .set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = Arc::new(consul_client(&server));
    let lookups = (0..10).map(|_| {
        let client = Arc::clone(&client);
        async move {
            let mut addresses = client.resolve_all("orders", "blue").await;
            addresses.sort();
            addresses
        }
    });
    let results = futures::future::join_all(lookups).await;

    for addresses in &results {
        assert_eq!(
            addresses,
            &vec!["10.0.0.5:9000".to_string(), "10.0.0.6:9000".to_string()]
        );
    }
}

#[tokio::test]
async fn test_close_attempts_every_instance() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path("/v1/agent/service/register"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&server)
        .await;

    // first instance fails to deregister, the second must still be attempted
    Mock::given(method("PUT"))
        .and(path("/v1/agent/service/deregister/orders-9000-node-example"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/v1/agent/service/deregister/billing-9100-node-example"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path_regex("^/v1/agent/check/deregister/service:.*"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&server)
        .await;

    let client = consul_client(&server);
    client.register("orders", "10.0.0.5:9000", "").await.unwrap();
    client.register("billing", "10.0.0.5:9100", "").await.unwrap();

    let finder: &dyn ServiceFinder = &client;
    finder.close().await;

    assert!(client.registered().is_empty());
}
