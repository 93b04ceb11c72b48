//! Connection state machine against scripted compute nodes.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{MockConnector, MockReply, add_compute, controller};
use hive_gateway::{ComputeError, ErrorKind};
use hive_proto::{ComputeId, ComputeUpdate, ConnectionStatus, ForwardMethod};
use serde_json::json;

// ==================== Connect Tests ====================

#[tokio::test]
async fn test_unreachable_then_reachable() {
    let connector = MockConnector::new();
    let node = connector.node("10.0.0.5", 8001);
    node.set_reachable(false);
    let controller = controller(&connector);
    let id = add_compute(&controller, "edge", "10.0.0.5", 8001).await;

    let err = controller.connect(&id).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Unreachable);
    assert!(controller.get_compute(&id).unwrap().status.is_failed());

    node.set_reachable(true);
    let record = controller.connect(&id).await.unwrap();

    assert_eq!(record.status, ConnectionStatus::Connected);
    assert_eq!(record.capabilities.unwrap().version, "3.0.0");
}

#[tokio::test]
async fn test_concurrent_connects_share_one_handshake() {
    let connector = MockConnector::new();
    let node = connector.node("10.0.0.5", 8001);
    node.route(
        ForwardMethod::Get,
        "capabilities",
        MockReply::Delay(
            Duration::from_millis(50),
            Box::new(MockReply::Json(200, json!({"version": "3.0.0"}))),
        ),
    );
    let controller = Arc::new(controller(&connector));
    let id = add_compute(&controller, "edge", "10.0.0.5", 8001).await;

    let connections = controller.connections();
    let (a, b, c) = tokio::join!(
        connections.connect(&id, true),
        connections.connect(&id, true),
        connections.connect(&id, true),
    );

    assert!(a.is_ok() && b.is_ok() && c.is_ok());
    assert_eq!(node.count(ForwardMethod::Get, "capabilities"), 1);
    assert_eq!(node.opens(), 1);
    assert!(connections.is_connected(&id));
}

#[tokio::test]
async fn test_connect_without_report_records_failure_only() {
    let connector = MockConnector::new();
    connector.node("10.0.0.5", 8001).set_reachable(false);
    let controller = controller(&connector);
    let id = add_compute(&controller, "edge", "10.0.0.5", 8001).await;

    controller.connections().connect(&id, false).await.unwrap();

    let status = controller.get_compute(&id).unwrap().status;
    assert!(matches!(status, ConnectionStatus::Failed { ref reason } if reason.contains("connection refused")));
}

#[tokio::test]
async fn test_rejected_credentials() {
    let connector = MockConnector::new();
    connector.node("10.0.0.5", 8001).route(
        ForwardMethod::Get,
        "capabilities",
        MockReply::Json(401, json!({"message": "Unauthorized"})),
    );
    let controller = controller(&connector);
    let id = add_compute(&controller, "edge", "10.0.0.5", 8001).await;

    let err = controller.connect(&id).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Authentication);
}

#[tokio::test]
async fn test_not_a_compute_server() {
    let connector = MockConnector::new();
    connector.node("10.0.0.5", 8001).route(
        ForwardMethod::Get,
        "capabilities",
        MockReply::Text(200, "<html>hello</html>".to_string()),
    );
    let controller = controller(&connector);
    let id = add_compute(&controller, "edge", "10.0.0.5", 8001).await;

    let err = controller.connect(&id).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Remote);
    assert!(controller.get_compute(&id).unwrap().status.is_failed());
}

#[tokio::test]
async fn test_connect_unknown_compute() {
    let connector = MockConnector::new();
    let controller = controller(&connector);

    let err = controller
        .connect(&ComputeId::parse("ghost").unwrap())
        .await
        .unwrap_err();

    assert!(matches!(err, ComputeError::NotFound(_)));
}

// ==================== Status Lifecycle Tests ====================

#[tokio::test]
async fn test_status_after_connect_is_connected_or_failed() {
    let connector = MockConnector::new();
    connector.node("10.0.0.6", 8001).set_reachable(false);
    let controller = controller(&connector);
    let up = add_compute(&controller, "up", "10.0.0.5", 8001).await;
    let down = add_compute(&controller, "down", "10.0.0.6", 8001).await;

    let connections = controller.connections();
    let _ = tokio::join!(connections.connect(&up, false), connections.connect(&down, false));

    assert_eq!(controller.get_compute(&up).unwrap().status, ConnectionStatus::Connected);
    assert!(controller.get_compute(&down).unwrap().status.is_failed());
}

#[tokio::test]
async fn test_endpoint_update_tears_down_session() {
    let connector = MockConnector::new();
    let controller = controller(&connector);
    let id = add_compute(&controller, "edge", "10.0.0.5", 8001).await;
    controller.connect(&id).await.unwrap();

    let record = controller
        .update_compute(
            &id,
            ComputeUpdate {
                port: Some(8002),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(record.status, ConnectionStatus::Disconnected);
    assert_eq!(record.port, 8002);

    controller
        .forward(&id, ForwardMethod::Get, "qemu", "vms", None)
        .await
        .unwrap_err();
    assert_eq!(connector.node("10.0.0.5", 8002).opens(), 1);
}

#[tokio::test]
async fn test_name_update_keeps_session() {
    let connector = MockConnector::new();
    let controller = controller(&connector);
    let id = add_compute(&controller, "edge", "10.0.0.5", 8001).await;
    controller.connect(&id).await.unwrap();

    let record = controller
        .update_compute(
            &id,
            ComputeUpdate {
                name: Some("Edge router host".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(record.status, ConnectionStatus::Connected);
    assert_eq!(connector.node("10.0.0.5", 8001).opens(), 1);
}

#[tokio::test]
async fn test_shutdown_disconnects_everything() {
    let connector = MockConnector::new();
    let controller = controller(&connector);
    let a = add_compute(&controller, "a", "10.0.0.5", 8001).await;
    let b = add_compute(&controller, "b", "10.0.0.6", 8001).await;
    controller.connect(&a).await.unwrap();
    controller.connect(&b).await.unwrap();

    controller.shutdown().await;

    for id in [a, b] {
        assert_eq!(
            controller.get_compute(&id).unwrap().status,
            ConnectionStatus::Disconnected
        );
    }
}

// ==================== Cancellation Tests ====================

fn slow_handshake(delay: Duration) -> MockReply {
    MockReply::Delay(delay, Box::new(MockReply::Json(200, json!({"version": "3.0.0"}))))
}

#[tokio::test]
async fn test_cancelled_forward_during_handshake_resets_status() {
    let connector = MockConnector::new();
    let node = connector.node("10.0.0.5", 8001);
    node.route(ForwardMethod::Get, "capabilities", slow_handshake(Duration::from_secs(5)));
    let controller = controller(&connector);
    let id = add_compute(&controller, "edge", "10.0.0.5", 8001).await;

    let outcome = tokio::time::timeout(
        Duration::from_millis(50),
        controller.forward(&id, ForwardMethod::Get, "qemu", "vms", None),
    )
    .await;

    assert!(outcome.is_err());
    assert_eq!(controller.get_compute(&id).unwrap().status, ConnectionStatus::Disconnected);
    assert!(controller.registry().delete(&id).is_ok());
}

#[tokio::test]
async fn test_cancelled_connect_does_not_block_next_attempt() {
    let connector = MockConnector::new();
    let node = connector.node("10.0.0.5", 8001);
    node.route(ForwardMethod::Get, "capabilities", slow_handshake(Duration::from_secs(5)));
    let controller = controller(&connector);
    let id = add_compute(&controller, "edge", "10.0.0.5", 8001).await;

    let outcome =
        tokio::time::timeout(Duration::from_millis(50), controller.connections().connect(&id, true)).await;
    assert!(outcome.is_err());

    node.route(
        ForwardMethod::Get,
        "capabilities",
        MockReply::Json(200, json!({"version": "3.0.0"})),
    );
    let record = controller.connect(&id).await.unwrap();

    assert_eq!(record.status, ConnectionStatus::Connected);
    assert_eq!(node.opens(), 2);
}

#[tokio::test]
async fn test_cancelled_forward_keeps_connected_session() {
    let connector = MockConnector::new();
    let node = connector.node("10.0.0.5", 8001);
    node.route_sequence(
        ForwardMethod::Get,
        "qemu/vms",
        vec![
            MockReply::Delay(Duration::from_secs(5), Box::new(MockReply::Json(200, json!([])))),
            MockReply::Json(200, json!([{"vmname": "r1"}])),
        ],
    );
    let controller = controller(&connector);
    let id = add_compute(&controller, "edge", "10.0.0.5", 8001).await;
    controller.connect(&id).await.unwrap();

    let outcome = tokio::time::timeout(
        Duration::from_millis(50),
        controller.forward(&id, ForwardMethod::Get, "qemu", "vms", None),
    )
    .await;
    assert!(outcome.is_err());
    assert_eq!(controller.get_compute(&id).unwrap().status, ConnectionStatus::Connected);

    let payload = controller
        .forward(&id, ForwardMethod::Get, "qemu", "vms", None)
        .await
        .unwrap();

    assert_eq!(payload, json!([{"vmname": "r1"}]));
    assert_eq!(node.opens(), 1);
}

// ==================== Teardown Ordering Tests ====================

#[tokio::test]
async fn test_delete_wins_over_queued_connect() {
    let connector = MockConnector::new();
    let node = connector.node("10.0.0.5", 8001);
    node.route(ForwardMethod::Get, "capabilities", slow_handshake(Duration::from_millis(100)));
    let controller = controller(&connector);
    let id = add_compute(&controller, "edge", "10.0.0.5", 8001).await;
    let connections = controller.connections();

    let (first, deleted, queued) = tokio::join!(
        connections.connect(&id, true),
        async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            controller.delete_compute(&id).await
        },
        async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            connections.connect(&id, false).await
        },
    );

    first.unwrap();
    assert_eq!(deleted.unwrap().compute_id, id);
    assert_eq!(queued.unwrap_err().kind(), ErrorKind::NotFound);
    assert!(!controller.registry().contains(&id));
    assert_eq!(node.opens(), 1);
}

#[tokio::test]
async fn test_queued_connect_follows_endpoint_update() {
    let connector = MockConnector::new();
    let old = connector.node("10.0.0.5", 8001);
    old.route(ForwardMethod::Get, "capabilities", slow_handshake(Duration::from_millis(100)));
    let new = connector.node("10.0.0.5", 8002);
    let controller = controller(&connector);
    let id = add_compute(&controller, "edge", "10.0.0.5", 8001).await;
    let connections = controller.connections();

    let (first, updated, queued) = tokio::join!(
        connections.connect(&id, true),
        async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            controller
                .update_compute(
                    &id,
                    ComputeUpdate {
                        port: Some(8002),
                        ..Default::default()
                    },
                )
                .await
        },
        async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            connections.connect(&id, true).await
        },
    );

    first.unwrap();
    assert_eq!(updated.unwrap().status, ConnectionStatus::Disconnected);
    queued.unwrap();
    assert!(connections.is_connected(&id));
    assert_eq!(old.opens(), 1);
    assert_eq!(new.opens(), 1);
}
