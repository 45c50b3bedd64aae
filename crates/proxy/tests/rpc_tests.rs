//! Daemon RPC surface tests.

mod common;

use bytes::Bytes;
use common::TestPipeline;
use htvend_core::Digest;
use htvend_proxy::rpc::{self, DIGEST_HEADER, KeyValue, RpcState};
use htvend_store::BlobStore;
use http::StatusCode;
use http_body_util::BodyExt;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use url::Url;

fn rpc_state(fixture: &TestPipeline) -> RpcState {
    RpcState {
        assets: fixture.assets.clone(),
        blobs: fixture.blobs.clone(),
    }
}

async fn store_blob(blobs: &dyn BlobStore, data: &[u8]) -> Digest {
    let mut writer = blobs.put().await.unwrap();
    writer.write(data).await.unwrap();
    writer.commit().await.unwrap()
}

#[tokio::test]
async fn exists_distinguishes_present_and_absent() {
    let fixture = TestPipeline::build_mode();
    let digest = store_blob(fixture.blobs.as_ref(), b"present").await;
    let router = rpc::router(rpc_state(&fixture));

    let resp = router
        .clone()
        .oneshot(
            http::Request::get(format!("/exists?key={}", digest.to_hex()))
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let absent = Digest::compute(b"absent");
    let resp = router
        .clone()
        .oneshot(
            http::Request::get(format!("/exists?key={}", absent.to_hex()))
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = router
        .oneshot(
            http::Request::get("/exists?key=nothex")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn upload_streams_body_and_returns_digest() {
    let fixture = TestPipeline::build_mode();
    let router = rpc::router(rpc_state(&fixture));

    let resp = router
        .oneshot(
            http::Request::put("/upload")
                .body(axum::body::Body::from("uploaded bytes"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);

    let expected = Digest::compute(b"uploaded bytes");
    assert_eq!(
        resp.headers().get(DIGEST_HEADER).unwrap(),
        expected.to_hex().as_str()
    );
    assert!(fixture.blobs.exists(&expected).await.unwrap());
}

#[tokio::test]
async fn update_upserts_manifest_entry() {
    let fixture = TestPipeline::build_mode();
    let router = rpc::router(rpc_state(&fixture));

    let kv = KeyValue {
        key: "https://example.test/pushed".to_string(),
        value: htvend_core::BlobInfo::new(Digest::compute(b"x").to_hex()),
    };
    let resp = router
        .clone()
        .oneshot(
            http::Request::post("/update")
                .body(axum::body::Body::from(serde_json::to_vec(&kv).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);

    let url = Url::parse("https://example.test/pushed").unwrap();
    assert!(fixture.assets.get_blob(&url).unwrap().is_some());

    let resp = router
        .oneshot(
            http::Request::post("/update")
                .body(axum::body::Body::from("not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn wrong_methods_are_rejected_with_400() {
    let fixture = TestPipeline::build_mode();
    let router = rpc::router(rpc_state(&fixture));

    for (method, path) in [("POST", "/exists"), ("GET", "/upload"), ("PUT", "/update")] {
        let resp = router
            .clone()
            .oneshot(
                http::Request::builder()
                    .method(method)
                    .uri(path)
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{method} {path}");
    }

    // the method check wins even when the query string is malformed
    let resp = router
        .oneshot(
            http::Request::post("/exists?key=nothex")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"bad method");
}

#[tokio::test]
async fn rpc_serves_over_a_unix_socket() {
    let fixture = TestPipeline::build_mode();
    let socket_dir = tempfile::tempdir().unwrap();
    let socket_path = socket_dir.path().join("htvend.sock");

    let shutdown = CancellationToken::new();
    let server = tokio::spawn({
        let socket_path = socket_path.clone();
        let state = rpc_state(&fixture);
        let shutdown = shutdown.clone();
        async move { rpc::serve_unix(&socket_path, state, shutdown).await }
    });

    // wait for the socket to appear
    for _ in 0..50 {
        if socket_path.exists() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    let stream = tokio::net::UnixStream::connect(&socket_path).await.unwrap();
    let io = hyper_util::rt::TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await.unwrap();
    tokio::spawn(conn);

    let req = http::Request::put("/upload")
        .header("Host", "localhost")
        .body(http_body_util::Full::new(Bytes::from_static(b"socket blob")))
        .unwrap();
    let resp = sender.send_request(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let expected = Digest::compute(b"socket blob");
    assert_eq!(
        resp.headers().get(DIGEST_HEADER).unwrap(),
        expected.to_hex().as_str()
    );
    let _ = resp.into_body().collect().await.unwrap();

    shutdown.cancel();
    server.await.unwrap().unwrap();
    assert!(!socket_path.exists(), "socket removed on shutdown");
}
