//! End-to-end tests of the standard logging chain on a live server

use axum::{
    Router,
    body::Body,
    extract::Path,
    http::{HeaderMap, HeaderValue, StatusCode},
    middleware as axum_middleware,
    response::Response,
    routing::{get, post},
};
use bytes::Bytes;
use futures::StreamExt;
use serde_json::Value;
use std::{net::SocketAddr, path::Path as FsPath, sync::Arc, time::Duration};
use ulid::Ulid;
use zlog::{
    config::Config,
    logger::{LogWriter, MemoryWriter},
    middleware::log_requests,
    pipeline::{Pipeline, ServiceIdentity, base_logger},
    redact::md5_hex,
    sink::{MemoryRedactionSink, RedactionEntry},
};

fn identity() -> ServiceIdentity {
    ServiceIdentity {
        service: "zlog-test".into(),
        host: "test-host".into(),
    }
}

/// Minimal app standing in for whatever the middleware is mounted on.
fn app() -> Router {
    Router::new()
        .route(
            "/submit",
            post(|headers: HeaderMap, body: Bytes| async move {
                let mut response = Response::new(Body::from("accepted"));
                response
                    .headers_mut()
                    .insert("cost", HeaderValue::from_static("2.5"));
                if let Some(id) = headers.get("request-id") {
                    response.headers_mut().insert("x-seen-request-id", id.clone());
                }
                response.headers_mut().insert(
                    "x-body-length",
                    HeaderValue::from_str(&body.len().to_string()).unwrap(),
                );
                response
            }),
        )
        .route(
            "/odd-cost",
            get(|| async {
                let mut response = Response::new(Body::from("ok"));
                response
                    .headers_mut()
                    .insert("cost", HeaderValue::from_static("notanumber"));
                response
            }),
        )
        .route(
            "/item/{n}",
            get(|Path(n): Path<u32>| async move { format!("item {n}") }),
        )
        .route(
            "/broken",
            get(|| async {
                let chunks: Vec<Result<Bytes, std::io::Error>> =
                    vec![Err(std::io::Error::other("upstream went away"))];
                Response::new(Body::from_stream(futures::stream::iter(chunks)))
            }),
        )
        .route(
            "/stream",
            get(|| async {
                let chunks = futures::stream::iter([Ok::<_, std::io::Error>(Bytes::from_static(
                    b"data: first\n\n",
                ))])
                .chain(futures::stream::pending());
                let mut response = Response::new(Body::from_stream(chunks));
                response
                    .headers_mut()
                    .insert("content-type", HeaderValue::from_static("text/event-stream"));
                response
            }),
        )
        .route(
            "/truncated",
            get(|| async {
                let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
                    Ok(Bytes::from_static(b"partial")),
                    Err(std::io::Error::other("upstream went away")),
                ];
                Response::new(Body::from_stream(futures::stream::iter(chunks)))
            }),
        )
}

async fn serve(pipeline: &Pipeline) -> SocketAddr {
    let router = app().layer(axum_middleware::from_fn_with_state(
        pipeline.chain().clone(),
        log_requests,
    ));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}

async fn spawn_logged() -> (SocketAddr, MemoryWriter, Arc<MemoryRedactionSink>) {
    let writer = MemoryWriter::new();
    let sink = Arc::new(MemoryRedactionSink::new());
    let pipeline = Pipeline::new(
        base_logger(LogWriter::new(writer.clone()), &identity()),
        Some(sink.clone()),
    );
    (serve(&pipeline).await, writer, sink)
}

fn with_field<'a>(records: &'a [Value], field: &str) -> Vec<&'a Value> {
    records
        .iter()
        .filter(|record| record.get(field).is_some())
        .collect()
}

/// Records written so far, once `count` access events are among them. A
/// client may finish reading before the chain has unwound.
async fn settled(writer: &MemoryWriter, count: usize) -> Vec<Value> {
    for _ in 0..300 {
        let records = writer.records();
        if with_field(&records, "duration").len() >= count {
            return records;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    writer.records()
}

#[tokio::test]
async fn test_form_post_end_to_end() {
    let (addr, writer, sink) = spawn_logged().await;
    let long = "b".repeat(1200);

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{addr}/submit"))
        .header("x-forwarded-for", "203.0.113.5")
        .header("user-agent", "zlog-test/1.0")
        .form(&[("a", "1"), ("b", long.as_str())])
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("cost").is_none());
    let req_id = response.headers()["request-id"].to_str().unwrap().to_string();
    assert!(req_id.parse::<Ulid>().is_ok());
    assert_eq!(response.headers()["x-seen-request-id"], req_id.as_str());
    assert_eq!(response.headers()["x-body-length"], "1206");
    assert_eq!(response.text().await.unwrap(), "accepted");

    let records = settled(&writer, 1).await;
    assert_eq!(records.len(), 3);

    let access = with_field(&records, "duration");
    assert_eq!(access.len(), 1);
    let access = access[0];
    assert_eq!(access["level"], "debug");
    assert_eq!(access["method"], "POST");
    assert_eq!(access["url"], "/submit");
    assert_eq!(access["status"], 200);
    assert_eq!(access["size"], 8);
    assert_eq!(access["server"], "127.0.0.1");
    assert_eq!(access["X-Forwarded-For"], "203.0.113.5");
    assert_eq!(access["User-Agent"], "zlog-test/1.0");
    assert_eq!(access["req_id"], req_id.as_str());
    assert_eq!(access["Cost"].as_f64(), Some(2.5));
    assert_eq!(access["service"], "zlog-test");
    assert_eq!(access["host"], "test-host");

    let request = with_field(&records, "request")[0];
    let dump = request["request"].as_str().unwrap();
    assert!(dump.starts_with("POST /submit HTTP/1.1\r\n"));
    assert!(dump.ends_with(&format!("\r\n\r\na=1&md5-b={}", md5_hex(&long))));
    assert!(!dump.contains(&long));
    assert_eq!(request["req_id"], req_id.as_str());
    assert_eq!(request["level"], "info");

    let response_dump = with_field(&records, "response")[0]["response"]
        .as_str()
        .unwrap()
        .to_string();
    assert!(response_dump.contains("HTTP/1.1 200 OK\r\n"));
    assert!(response_dump.ends_with("\r\n\r\naccepted"));

    assert_eq!(
        sink.entries(),
        vec![RedactionEntry {
            field: "b".into(),
            hash: md5_hex(&long),
            content: long,
        }]
    );
}

#[tokio::test]
async fn test_supplied_request_id_is_echoed() {
    let (addr, writer, _) = spawn_logged().await;
    let supplied = Ulid::new().to_string();

    let response = reqwest::Client::new()
        .get(format!("http://{addr}/item/1"))
        .header("request-id", supplied.as_str())
        .send()
        .await
        .unwrap();

    assert_eq!(response.headers()["request-id"], supplied.as_str());
    let records = settled(&writer, 1).await;
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|record| record["req_id"] == supplied.as_str()));
}

#[tokio::test]
async fn test_invalid_request_id_is_replaced() {
    let (addr, writer, _) = spawn_logged().await;

    let response = reqwest::Client::new()
        .get(format!("http://{addr}/item/1"))
        .header("request-id", "definitely-not-an-id")
        .send()
        .await
        .unwrap();

    let echoed = response.headers()["request-id"].to_str().unwrap().to_string();
    assert_ne!(echoed, "definitely-not-an-id");
    assert!(echoed.parse::<Ulid>().is_ok());
    let records = settled(&writer, 1).await;
    assert_eq!(with_field(&records, "duration")[0]["req_id"], echoed.as_str());
}

#[tokio::test]
async fn test_unparseable_cost_is_logged_as_string() {
    let (addr, writer, _) = spawn_logged().await;

    let response = reqwest::Client::new()
        .get(format!("http://{addr}/odd-cost"))
        .send()
        .await
        .unwrap();

    assert!(response.headers().get("cost").is_none());
    assert_eq!(response.text().await.unwrap(), "ok");
    let records = settled(&writer, 1).await;
    assert_eq!(with_field(&records, "duration")[0]["Cost"], "notanumber");
}

#[tokio::test]
async fn test_malformed_form_passes_through() {
    let (addr, writer, sink) = spawn_logged().await;
    let body = format!("k={}%zz", "x".repeat(1500));

    reqwest::Client::new()
        .post(format!("http://{addr}/submit"))
        .header("content-type", "application/x-www-form-urlencoded")
        .body(body.clone())
        .send()
        .await
        .unwrap();

    let records = settled(&writer, 1).await;
    let dump = with_field(&records, "request")[0]["request"]
        .as_str()
        .unwrap()
        .to_string();
    assert!(dump.ends_with(&body));
    assert!(sink.entries().is_empty());
}

#[tokio::test]
async fn test_concurrent_requests_keep_their_own_fields() {
    let (addr, writer, _) = spawn_logged().await;
    let client = reqwest::Client::new();

    let mut tasks = Vec::new();
    for n in 0..20u32 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            client
                .get(format!("http://{addr}/item/{n}"))
                .header("x-forwarded-for", format!("10.0.0.{n}"))
                .send()
                .await
                .unwrap()
                .text()
                .await
                .unwrap()
        }));
    }
    for (n, task) in tasks.into_iter().enumerate() {
        assert_eq!(task.await.unwrap(), format!("item {n}"));
    }

    let records = settled(&writer, 20).await;
    let access = with_field(&records, "duration");
    assert_eq!(access.len(), 20);
    let mut ids = std::collections::HashSet::new();
    for record in access {
        let n = record["url"]
            .as_str()
            .unwrap()
            .trim_start_matches("/item/")
            .to_string();
        assert_eq!(record["X-Forwarded-For"], format!("10.0.0.{n}").as_str());
        assert!(ids.insert(record["req_id"].as_str().unwrap().to_string()));
    }
}

#[tokio::test]
async fn test_body_failure_before_any_data_is_bad_gateway() {
    let (addr, writer, _) = spawn_logged().await;

    let response = reqwest::Client::new()
        .get(format!("http://{addr}/broken"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert!(response.headers().get("request-id").is_some());
    let records = settled(&writer, 1).await;
    let access = with_field(&records, "duration");
    assert_eq!(access.len(), 1);
    assert_eq!(access[0]["status"], 502);
    assert_eq!(access[0]["size"], 0);
    assert_eq!(with_field(&records, "request").len(), 1);
}

#[tokio::test]
async fn test_body_failure_after_data_returns_partial_response() {
    let (addr, writer, _) = spawn_logged().await;

    let response = reqwest::Client::new()
        .get(format!("http://{addr}/truncated"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "partial");
    let records = settled(&writer, 1).await;
    let access = with_field(&records, "duration")[0];
    assert_eq!(access["status"], 200);
    assert_eq!(access["size"], 7);
}

#[tokio::test]
async fn test_file_destinations_from_config() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::from_json(
        r#"{"log_dir": "logs", "split_by": "hour", "hash_dir": "on"}"#,
        dir.path(),
    )
    .unwrap();
    // relative log_dir resolves against the working directory, pin it instead
    let config = Config {
        log_dir: dir.path().join("logs"),
        ..config
    };
    let pipeline = Pipeline::from_config(&config, &identity());
    let addr = serve(&pipeline).await;
    let long = "c".repeat(1001);

    reqwest::Client::new()
        .post(format!("http://{addr}/submit"))
        .form(&[("c", long.as_str())])
        .send()
        .await
        .unwrap();

    let log_lines = lines_after(&dir.path().join("logs"), 3).await;
    assert_eq!(log_lines.len(), 3);
    assert!(log_lines.iter().all(|line| line["service"] == "zlog-test"));

    let hash_lines = lines_after(&dir.path().join("hashdata"), 1).await;
    assert_eq!(hash_lines.len(), 1);
    assert_eq!(hash_lines[0]["field"], "c");
    assert_eq!(hash_lines[0]["md5"], md5_hex(&long).as_str());
    assert_eq!(hash_lines[0]["content"], long.as_str());
}

/// Lines are written from a background thread, so poll for them.
async fn lines_after(dir: &FsPath, count: usize) -> Vec<Value> {
    for _ in 0..300 {
        let lines = read_lines(dir);
        if lines.len() >= count {
            return lines;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    read_lines(dir)
}

fn read_lines(dir: &FsPath) -> Vec<Value> {
    let mut lines = Vec::new();
    for entry in std::fs::read_dir(dir).unwrap() {
        let contents = std::fs::read_to_string(entry.unwrap().path()).unwrap();
        lines.extend(
            contents
                .lines()
                .filter_map(|line| serde_json::from_str::<Value>(line).ok()),
        );
    }
    lines
}

#[tokio::test]
async fn test_streaming_response_reaches_client_before_it_ends() {
    let (addr, writer, _) = spawn_logged().await;

    let mut response = tokio::time::timeout(
        Duration::from_secs(3),
        reqwest::Client::new().get(format!("http://{addr}/stream")).send(),
    )
    .await
    .expect("headers should arrive while the body is still open")
    .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "text/event-stream");
    assert!(response.headers().get("request-id").is_some());
    let chunk = tokio::time::timeout(Duration::from_secs(3), response.chunk())
        .await
        .expect("first event should arrive while the body is still open")
        .unwrap()
        .unwrap();
    assert_eq!(&chunk[..], b"data: first\n\n");

    // the body is still open, so nothing has been logged yet
    assert!(writer.records().is_empty());
}

#[tokio::test]
async fn test_oversized_body_is_rejected_before_the_chain() {
    let writer = MemoryWriter::new();
    let sink = Arc::new(MemoryRedactionSink::new());
    let pipeline = Pipeline::new(
        base_logger(LogWriter::new(writer.clone()), &identity()),
        Some(sink.clone()),
    )
    .with_body_limit(1024);
    let addr = serve(&pipeline).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{addr}/submit"))
        .body("x".repeat(2048))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert!(response.headers().get("x-body-length").is_none());
    assert!(writer.records().is_empty());

    let response = client
        .post(format!("http://{addr}/submit"))
        .body("x".repeat(1024))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-body-length"], "1024");
    let records = settled(&writer, 1).await;
    let dump = with_field(&records, "request")[0]["request"]
        .as_str()
        .unwrap()
        .to_string();
    assert!(dump.ends_with(&"x".repeat(1024)));
    assert!(sink.entries().is_empty());
}
