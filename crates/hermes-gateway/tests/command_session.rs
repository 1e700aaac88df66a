//! Command session and discovery over HTTP against a local device stub.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio_test::{assert_err, assert_ok};

use hermes_core::config::{DiscoveryConfig, RelayConfig};
use hermes_core::types::DataValue;
use hermes_devices::directory::{Directory, InMemoryDirectory};
use hermes_devices::protocol::ErrorCode;
use hermes_devices::HttpRelay;
use hermes_gateway::{CommandSession, CrawlEvent, CrawlOutcome, Crawler};

/// A device with one peripheral (2) holding one parameter (7, get/set, max 100).
async fn device(Json(body): Json<Value>) -> Json<Value> {
    let periph = body["periph_id"].as_u64().unwrap_or(0);
    let param = body["param_id"].as_u64().unwrap_or(0);
    let reply = match body["cmd_type"].as_u64() {
        Some(0) => match (periph, param) {
            (0, 0) => json!({
                "rsp_type": 0, "name": "lamp", "dev_id": 5,
                "periph_num": 1, "periph_ids": [2], "dev_type": "light"
            }),
            (2, 0) => json!({
                "rsp_type": 0, "name": "dimmer", "periph_id": 2, "periph_type": 1,
                "param_num": 1, "param_ids": [7]
            }),
            _ => json!({
                "rsp_type": 0, "name": "brightness", "param_id": param,
                "methods": 3, "param_max": 100, "data_type": 1
            }),
        },
        Some(1) => json!({
            "rsp_type": 3, "data": 42, "data_type": 1, "periph_id": periph, "param_id": param
        }),
        Some(2) => json!({"rsp_type": 1, "periph_id": periph, "param_id": param}),
        _ => json!({"rsp_type": 2, "error_code": 14, "msg": "unsupported"}),
    };
    Json(reply)
}

async fn start_device_stub() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new().route("/api", post(device));

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    addr
}

/// Discover the stub device so the directory knows it
async fn discovered(addr: SocketAddr) -> anyhow::Result<(Arc<InMemoryDirectory>, Arc<HttpRelay>)> {
    let relay = Arc::new(HttpRelay::new(&RelayConfig::default())?);
    let directory = InMemoryDirectory::shared();
    let crawler = Crawler::new(relay.clone(), directory.clone(), DiscoveryConfig::default());

    let mut handle = crawler.start(&json!({
        "address": "127.0.0.1",
        "port": addr.port(),
        "extension": "api",
    }));
    let mut last = None;
    while let Some(event) = handle.events.recv().await {
        last = Some(event);
    }
    assert_eq!(
        last,
        Some(CrawlEvent::Finished(CrawlOutcome::Succeeded { device_id: 5 }))
    );
    assert_eq!(handle.task.await?, CrawlOutcome::Succeeded { device_id: 5 });
    Ok((directory, relay))
}

#[test_log::test(tokio::test)]
async fn test_discover_then_get() -> anyhow::Result<()> {
    let addr = start_device_stub().await;
    let (directory, relay) = discovered(addr).await?;

    let device = directory.resolve_device(5).expect("device persisted");
    assert_eq!(device.dev_type, "light");
    assert_eq!(device.port, addr.port());

    let session = CommandSession::new(directory.clone(), relay);
    let reply = session
        .handle_text(r#"{"cmd_type":"GET","dev_id":5,"periph_id":2,"param_id":7}"#)
        .await;
    assert_eq!(reply["rsp_type"], 3);
    assert_eq!(
        directory.resolve_parameter(5, 2, 7).and_then(|p| p.last_value),
        Some(DataValue::Integer(42))
    );
    Ok(())
}

#[tokio::test]
async fn test_set_bounds_and_device_errors() -> anyhow::Result<()> {
    let addr = start_device_stub().await;
    let (directory, relay) = discovered(addr).await?;
    let session = CommandSession::new(directory, relay);

    let set = |data: i64| {
        json!({
            "cmd_type": "SET", "dev_id": 5, "periph_id": 2, "param_id": 7,
            "data": data, "data_type": 1
        })
    };
    assert_ok!(session.execute(&set(100)).await);
    let err = assert_err!(session.execute(&set(999)).await);
    assert_eq!(err.code, ErrorCode::InvalidDataValue);

    // the stub rejects ACTION, and that rejection reaches the client untouched
    let reply = session
        .handle(&json!({"cmd_type": "ACTION", "dev_id": 5, "periph_id": 2, "param_id": 7}))
        .await;
    assert_eq!(reply, json!({"rsp_type": 2, "error_code": 14, "msg": "unsupported"}));
    Ok(())
}
