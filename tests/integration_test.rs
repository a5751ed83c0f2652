//! End-to-end tests over real sockets
//!
//! Every test binds its own orchestrator on ephemeral 127.0.0.1 ports.

use agentbus::config::{AgentConfig, NoSubscribersPolicy, Settings};
use agentbus::core::RegistrationRequest;
use agentbus::transport::AgentTransport;
use agentbus::{
    handler, AgentClient, AgentId, AgentStatus, BusError, LocalAgent, Message, OrchestratorServer,
    TcpAgentTransport,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::{sleep, timeout, Duration};

const WAIT: Duration = Duration::from_secs(3);

async fn start_server(settings: Settings) -> OrchestratorServer {
    let registration = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let message = TcpListener::bind("127.0.0.1:0").await.unwrap();
    OrchestratorServer::start(&settings, registration, message).unwrap()
}

fn agent_config(server: &OrchestratorServer) -> AgentConfig {
    AgentConfig {
        orchestrator_host: "127.0.0.1".to_string(),
        registration_port: server.registration_addr().port(),
        message_port: server.message_addr().port(),
        request_timeout_ms: 2_000,
        ..AgentConfig::default()
    }
}

fn agent(name: &str, config: &AgentConfig) -> AgentClient {
    let transport = Arc::new(TcpAgentTransport::new(config));
    AgentClient::new(name, format!("test/{name}"), config.clone(), transport)
}

/// Subscribe `client` to `name`, forwarding payloads into the returned channel
fn collect(client: &AgentClient, name: &str) -> UnboundedReceiver<Value> {
    let (tx, rx) = mpsc::unbounded_channel();
    client.on_receive(
        name,
        handler(move |data| {
            let _ = tx.send(data.clone());
            Ok(())
        }),
    );
    rx
}

async fn next(rx: &mut UnboundedReceiver<Value>) -> Value {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("channel closed")
}

#[tokio::test]
async fn test_consumer_receives_routed_ping() {
    let server = start_server(Settings::default()).await;
    let config = agent_config(&server);

    let consumer = agent("consumer", &config);
    let mut pings = collect(&consumer, "ping");
    let id = consumer.start().await.unwrap();

    let report = server
        .orchestrator()
        .route(Message::new("ping", json!({"n": 1})))
        .await
        .unwrap();
    assert_eq!(report.forwarded, 1);
    assert_eq!(next(&mut pings).await, json!({"n": 1}));

    sleep(Duration::from_millis(100)).await;
    assert!(pings.try_recv().is_err());

    let status = server.orchestrator().get_agent_status(&id).await.unwrap();
    assert_eq!(status.subscriptions, vec!["ping".to_string()]);

    consumer.stop().await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_producer_consumer_round_trip() {
    let server = start_server(Settings::default()).await;
    let config = agent_config(&server);

    let consumer = agent("consumer", &config);
    let mut results = collect(&consumer, "result");
    consumer.start().await.unwrap();

    let producer = agent("producer", &config);
    let double = producer.emit(&["result"], |input| {
        Ok(json!({"doubled": input["value"].as_i64().unwrap_or(0) * 2}))
    });
    producer.start().await.unwrap();

    assert_eq!(
        double.call(&json!({"value": 21})).await.unwrap(),
        json!({"doubled": 42})
    );
    assert_eq!(next(&mut results).await, json!({"doubled": 42}));

    producer.stop().await.unwrap();
    consumer.stop().await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_registration_protocol_and_idempotent_unregister() {
    let server = start_server(Settings::default()).await;
    let transport = TcpAgentTransport::new(&agent_config(&server));

    let registered = transport
        .request(RegistrationRequest::Register {
            name: "test_agent".to_string(),
            address: "localhost:5555".to_string(),
            subscriptions: vec!["test_message".to_string()],
        })
        .await
        .unwrap();
    assert!(registered.is_success());
    let id = registered.agent_id.unwrap();
    assert_eq!(id, AgentId::derive("test_agent", Some("localhost:5555")));

    let status = transport
        .request(RegistrationRequest::Status { agent_id: id.clone() })
        .await
        .unwrap();
    assert_eq!(status.agent.unwrap().status, AgentStatus::Active);

    let heartbeat = transport
        .request(RegistrationRequest::Heartbeat { agent_id: id.clone() })
        .await
        .unwrap();
    assert!(heartbeat.is_success());

    let first = transport
        .request(RegistrationRequest::Unregister { agent_id: id.clone() })
        .await
        .unwrap();
    assert!(first.is_success());
    let second = transport
        .request(RegistrationRequest::Unregister { agent_id: id.clone() })
        .await
        .unwrap();
    assert!(!second.is_success());

    let missing = transport
        .request(RegistrationRequest::Status { agent_id: id })
        .await
        .unwrap();
    assert_eq!(missing.error.as_deref(), Some("Agent not found"));

    transport.close().await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_data_channel_refused_for_unknown_identity() {
    let server = start_server(Settings::default()).await;
    let transport = TcpAgentTransport::new(&agent_config(&server));

    let result = transport
        .open_data_channel(&AgentId::from("never-registered"))
        .await;
    assert!(matches!(result, Err(BusError::RegistrationRejected(_))));
    assert_eq!(server.connected_agents().await, 0);

    server.shutdown().await;
}

#[tokio::test]
async fn test_silent_agent_goes_inactive_and_misses_broadcast() {
    let mut settings = Settings::default();
    settings.orchestrator.liveness_check_interval_ms = 20;
    settings.orchestrator.liveness_timeout_ms = 300;
    let server = start_server(settings).await;

    let quiet_config = AgentConfig {
        heartbeat_interval_ms: 60_000,
        ..agent_config(&server)
    };
    let chatty_config = AgentConfig {
        heartbeat_interval_ms: 50,
        ..agent_config(&server)
    };

    let quiet = agent("quiet", &quiet_config);
    let mut quiet_rx = collect(&quiet, "broadcast_x");
    let quiet_id = quiet.start().await.unwrap();

    let chatty = agent("chatty", &chatty_config);
    let mut chatty_rx = collect(&chatty, "broadcast_x");
    let chatty_id = chatty.start().await.unwrap();

    let orchestrator = server.orchestrator().clone();
    timeout(WAIT, async {
        loop {
            let status = orchestrator.get_agent_status(&quiet_id).await.unwrap();
            if status.status == AgentStatus::Inactive {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("quiet agent never went inactive");

    let chatty_status = orchestrator.get_agent_status(&chatty_id).await.unwrap();
    assert_eq!(chatty_status.status, AgentStatus::Active);

    let delivered = orchestrator
        .broadcast(Message::new("broadcast_x", json!("hello")))
        .await
        .unwrap();
    assert_eq!(delivered, 1);
    assert_eq!(next(&mut chatty_rx).await, json!("hello"));
    sleep(Duration::from_millis(100)).await;
    assert!(quiet_rx.try_recv().is_err());

    quiet.stop().await.unwrap();
    chatty.stop().await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_remote_inputs_join_locally_and_fan_back_out() {
    let server = start_server(Settings::default()).await;
    let config = agent_config(&server);
    let orchestrator = server.orchestrator().clone();

    orchestrator
        .register_local(
            LocalAgent::join("combine", &["left", "right"], |inputs| {
                Ok(json!({"pair": inputs}))
            })
            .emits("combined"),
        )
        .await
        .unwrap();

    let consumer = agent("consumer", &config);
    let mut combined = collect(&consumer, "combined");
    consumer.start().await.unwrap();

    let left = agent("left_producer", &config);
    let right = agent("right_producer", &config);
    left.start().await.unwrap();
    right.start().await.unwrap();

    right.send_message(Message::new("right", json!("R"))).await.unwrap();
    left.send_message(Message::new("left", json!("L"))).await.unwrap();

    assert_eq!(next(&mut combined).await, json!({"pair": ["L", "R"]}));

    left.stop().await.unwrap();
    right.stop().await.unwrap();
    consumer.stop().await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_remote_parent_triggers_graph_child() {
    let mut settings = Settings::default();
    settings.orchestrator.no_subscribers = NoSubscribersPolicy::Ignore;
    let server = start_server(settings).await;
    let config = agent_config(&server);
    let orchestrator = server.orchestrator().clone();

    let producer = agent("producer", &config);
    let producer_id = producer.start().await.unwrap();

    let (tx, mut seen) = mpsc::unbounded_channel();
    let child = orchestrator
        .register_local(LocalAgent::graph("after_producer", move |inputs| {
            let _ = tx.send(Value::Array(inputs.clone()));
            Ok(Value::Null)
        }))
        .await
        .unwrap();
    orchestrator.add_dependency(&producer_id, &child).await.unwrap();

    producer
        .send_message(Message::new("result", json!({"score": 7})))
        .await
        .unwrap();
    assert_eq!(next(&mut seen).await, json!([{"score": 7}]));

    producer.stop().await.unwrap();
    // the graph edge is gone with the parent
    assert!(orchestrator.is_registered(&child).await);
    assert!(!orchestrator.is_registered(&producer_id).await);
    server.shutdown().await;
}

#[tokio::test]
async fn test_per_sender_order_is_preserved() {
    let server = start_server(Settings::default()).await;
    let config = agent_config(&server);

    let consumer = agent("consumer", &config);
    let mut numbers = collect(&consumer, "numbered");
    consumer.start().await.unwrap();

    let producer = agent("producer", &config);
    producer.start().await.unwrap();
    for n in 0..50 {
        producer
            .send_message(Message::new("numbered", json!(n)))
            .await
            .unwrap();
    }

    for n in 0..50 {
        assert_eq!(next(&mut numbers).await, json!(n));
    }

    producer.stop().await.unwrap();
    consumer.stop().await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_unroutable_send_fails_over_tcp() {
    let server = start_server(Settings::default()).await;
    let producer = agent("producer", &agent_config(&server));
    producer.start().await.unwrap();

    let result = producer
        .send_message(Message::new("nobody_listens", json!(1)))
        .await;
    assert!(matches!(result, Err(BusError::NoSubscribers(name)) if name == "nobody_listens"));

    producer.stop().await.unwrap();
    server.shutdown().await;
}
