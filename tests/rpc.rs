//! RPC round trips, failures and retries over the loopback broker

mod common;

use rabbitrpc::{
    CallOptions, Cause, Error, MemoryBroker, MethodHandler, RabbitMqConfig, RegisterOptions,
    TransportError,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

#[derive(Serialize)]
struct GetUser {
    id: u64,
}

#[derive(Debug, Deserialize, PartialEq)]
struct User {
    id: u64,
    name: String,
}

fn user_lookup() -> MethodHandler {
    MethodHandler::new(|kwargs| async move {
        let id = kwargs
            .get("id")
            .and_then(Value::as_u64)
            .ok_or_else(|| anyhow::anyhow!("missing id"))?;
        anyhow::Ok(json!({"id": id, "name": format!("user-{}", id)}))
    })
}

#[tokio::test]
async fn test_call_returns_reply() {
    let broker = MemoryBroker::new();
    let client = common::connected_client(&broker).await;
    client
        .register_event("users.get", user_lookup(), RegisterOptions::default())
        .await
        .unwrap();

    let reply = client
        .call("users.get", &GetUser { id: 7 }, CallOptions::default())
        .await
        .unwrap();
    assert_eq!(reply, json!({"id": 7, "name": "user-7"}));

    let user: User = client
        .call_as("users.get", &json!({"id": 8}), CallOptions::default())
        .await
        .unwrap();
    assert_eq!(
        user,
        User {
            id: 8,
            name: "user-8".into()
        }
    );
}

#[tokio::test]
async fn test_call_between_two_clients() {
    let broker = MemoryBroker::new();
    let server = common::connected_client(&broker).await;
    let caller = common::loopback_client(&broker, RabbitMqConfig::new("other-host"));
    caller.connect().await.unwrap();

    server
        .register_event("users.get", user_lookup(), RegisterOptions::default())
        .await
        .unwrap();

    let reply = caller
        .call("users.get", &json!({"id": 1}), CallOptions::default())
        .await
        .unwrap();
    assert_eq!(reply["name"], "user-1");
}

#[tokio::test]
async fn test_send_invokes_handler() {
    let broker = MemoryBroker::new();
    let client = common::connected_client(&broker).await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let audit = MethodHandler::new(move |kwargs| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(Value::Object(kwargs));
            Ok(Value::Null)
        }
    });
    client
        .register_event("audit.log", audit, RegisterOptions::default())
        .await
        .unwrap();

    client
        .send("audit.log", &json!({"action": "login"}), CallOptions::default())
        .await
        .unwrap();

    assert_eq!(common::recv_soon(&mut rx).await, Some(json!({"action": "login"})));
}

#[tokio::test]
async fn test_handler_error_is_reported_and_not_retried() {
    let broker = MemoryBroker::new();
    let client = common::connected_client(&broker).await;
    let invocations = Arc::new(AtomicUsize::new(0));

    let counter = invocations.clone();
    let failing = MethodHandler::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Err(anyhow::anyhow!("quota exceeded")) }
    });
    client
        .register_event("billing.charge", failing, RegisterOptions::default())
        .await
        .unwrap();

    let err = client
        .call("billing.charge", &json!({"amount": 10}), CallOptions::default())
        .await
        .unwrap_err();

    match err {
        Error::Rpc {
            event,
            source: Cause::Transport(TransportError::Remote(message)),
        } => {
            assert_eq!(event, "billing.charge");
            assert_eq!(message, "quota exceeded");
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unregister_requires_same_handler() {
    let broker = MemoryBroker::new();
    let client = common::connected_client(&broker).await;
    let handler = user_lookup();

    client
        .register_event("users.get", handler.clone(), RegisterOptions::default())
        .await
        .unwrap();

    let err = client.unregister_event(&user_lookup()).await.unwrap_err();
    assert!(matches!(err, Error::EventRegistration { .. }));
    assert_eq!(client.registered_events().await.unwrap(), vec!["users.get"]);

    client.unregister_event(&handler).await.unwrap();
    assert!(client.registered_events().await.unwrap().is_empty());

    // Nobody serves the method any more
    let err = client
        .call("users.get", &json!({"id": 1}), CallOptions::default().retry_count(1))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Rpc {
            source: Cause::Transport(TransportError::Unroutable { .. }),
            ..
        }
    ));
}

#[tokio::test]
async fn test_registration_validation() {
    let broker = MemoryBroker::new();
    let client = common::connected_client(&broker).await;

    client
        .register_event("users.get", user_lookup(), RegisterOptions::default())
        .await
        .unwrap();

    let duplicate = client
        .register_event("users.get", user_lookup(), RegisterOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(duplicate, Error::EventRegistration { ref event, .. } if event == "users.get"));

    let empty = client
        .register_event("", user_lookup(), RegisterOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(empty, Error::EventRegistration { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_call_times_out_when_nobody_answers() {
    let broker = MemoryBroker::new();
    let client = common::connected_client(&broker).await;
    client
        .register_event(
            "reports.build",
            MethodHandler::new(|_| futures::future::pending()),
            RegisterOptions::default(),
        )
        .await
        .unwrap();

    let start = Instant::now();
    let err = client
        .call(
            "reports.build",
            &json!({}),
            CallOptions::new().timeout(Duration::from_millis(200)),
        )
        .await
        .unwrap_err();

    assert!(err.is_timeout());
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_millis(300), "took {:?}", elapsed);
}

#[tokio::test(start_paused = true)]
async fn test_default_timeout_from_config() {
    let broker = MemoryBroker::new();
    let client = common::loopback_client(
        &broker,
        RabbitMqConfig::new("localhost").default_timeout(Duration::from_millis(300)),
    );
    client.connect().await.unwrap();
    client
        .register_event(
            "reports.build",
            MethodHandler::new(|_| futures::future::pending()),
            RegisterOptions::default(),
        )
        .await
        .unwrap();

    let err = client
        .call("reports.build", &json!({}), CallOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::Rpc { source: Cause::Timeout(after), .. } if after == Duration::from_millis(300)
    ));
}

#[tokio::test]
async fn test_disconnected_call_performs_no_io() {
    let broker = MemoryBroker::new();
    let client = common::loopback_client(&broker, RabbitMqConfig::new("localhost"));

    let err = client
        .call("users.get", &json!({"id": 1}), CallOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::NotConnected));
    assert_eq!(broker.connections_opened(), 0);
    assert_eq!(broker.publish_attempts(), 0);
}

#[tokio::test]
async fn test_transient_publish_failures_exhaust_retry_count() {
    let broker = MemoryBroker::new();
    let client = common::connected_client(&broker).await;
    client
        .register_event("users.get", user_lookup(), RegisterOptions::default())
        .await
        .unwrap();

    broker.fail_publishes(u32::MAX);
    let err = client
        .call("users.get", &json!({"id": 1}), CallOptions::new().retry_count(4))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::Rpc {
            source: Cause::Transport(TransportError::Io(_)),
            ..
        }
    ));
    assert_eq!(broker.publish_attempts(), 4);
}

#[tokio::test]
async fn test_call_recovers_after_transient_failures() {
    let broker = MemoryBroker::new();
    let client = common::connected_client(&broker).await;
    client
        .register_event("users.get", user_lookup(), RegisterOptions::default())
        .await
        .unwrap();

    broker.fail_publishes(2);
    let reply = client
        .call("users.get", &json!({"id": 3}), CallOptions::new().retry_count(3))
        .await
        .unwrap();

    assert_eq!(reply["id"], 3);
    // Three request attempts plus the handler's reply
    assert_eq!(broker.publish_attempts(), 4);
}

#[tokio::test]
async fn test_rejected_registration_leaves_client_usable() {
    let broker = MemoryBroker::new();
    let server = common::connected_client(&broker).await;
    let other = common::loopback_client(&broker, RabbitMqConfig::new("other-host"));
    other.connect().await.unwrap();

    let durable = RegisterOptions {
        durable: true,
        auto_delete: false,
    };
    server
        .register_event("users.get", user_lookup(), durable)
        .await
        .unwrap();

    let err = other
        .register_event("users.get", user_lookup(), RegisterOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::EventRegistration {
            ref event,
            source: Cause::Transport(TransportError::Rejected(_)),
        } if event == "users.get"
    ));

    assert!(other.is_connected());
    assert!(other.registered_events().await.unwrap().is_empty());
    let reply = other
        .call("users.get", &json!({"id": 5}), CallOptions::default())
        .await
        .unwrap();
    assert_eq!(reply["name"], "user-5");
}
