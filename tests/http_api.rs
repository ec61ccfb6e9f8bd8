mod common;

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Method, Request, StatusCode, header},
    response::Response,
};
use common::Harness;
use files_store::{models::bucket::Bucket, routes::routes::routes};
use serde_json::Value;
use tower::ServiceExt;

fn app(h: &Harness) -> Router {
    routes().with_state(h.store.clone())
}

async fn send(app: &Router, method: Method, uri: &str, body: Body) -> Response {
    app.clone()
        .oneshot(Request::builder().method(method).uri(uri).body(body).unwrap())
        .await
        .unwrap()
}

async fn json(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn create_bucket(app: &Router) -> Bucket {
    let response = send(app, Method::POST, "/buckets", Body::empty()).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    serde_json::from_value(json(response).await).unwrap()
}

#[tokio::test]
async fn health_and_readiness() {
    let h = Harness::new().await;
    let app = app(&h);

    let response = send(&app, Method::GET, "/healthz", Body::empty()).await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = send(&app, Method::GET, "/readyz", Body::empty()).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json(response).await;
    assert_eq!(body["checks"]["default_location"]["ok"], true);
}

#[tokio::test]
async fn object_lifecycle_over_http() {
    let h = Harness::new().await;
    let app = app(&h);
    let bucket = create_bucket(&app).await;
    let uri = format!("/{}/docs/a.txt", bucket.id);

    let response = send(&app, Method::PUT, &uri, Body::from("hello world")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let first_version = response.headers()["x-amz-version-id"]
        .to_str()
        .unwrap()
        .to_string();

    let response = send(&app, Method::GET, &uri, Body::empty()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::ACCEPT_RANGES], "bytes");
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], b"hello world");

    let response = send(&app, Method::DELETE, &uri, Body::empty()).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(response.headers()["x-amz-delete-marker"], "true");

    let response = send(&app, Method::GET, &uri, Body::empty()).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json(response).await["code"], "NotFound");

    let versioned = format!("{}?versionId={}", uri, first_version);
    let response = send(&app, Method::GET, &versioned, Body::empty()).await;
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], b"hello world");
}

#[tokio::test]
async fn ranged_reads() {
    let h = Harness::new().await;
    let app = app(&h);
    let bucket = create_bucket(&app).await;
    let uri = format!("/{}/digits", bucket.id);
    send(&app, Method::PUT, &uri, Body::from("0123456789")).await;

    let request = Request::builder()
        .uri(&uri)
        .header(header::RANGE, "bytes=2-5")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 2-5/10");
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], b"2345");

    let request = Request::builder()
        .uri(&uri)
        .header(header::RANGE, "bytes=20-")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes */10");
}

#[tokio::test]
async fn multipart_over_http() {
    let h = Harness::new().await;
    let app = app(&h);
    let bucket = create_bucket(&app).await;
    let uri = format!("/{}/big.bin", bucket.id);

    let response = send(
        &app,
        Method::POST,
        &format!("{}?uploads&size=10&partSize=5", uri),
        Body::empty(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let upload_id = json(response).await["upload_id"]
        .as_str()
        .unwrap()
        .to_string();

    for (n, part) in ["hello", "world"].into_iter().enumerate() {
        let part_uri = format!("{}?uploadId={}&partNumber={}", uri, upload_id, n);
        let response = send(&app, Method::PUT, &part_uri, Body::from(part)).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = send(
        &app,
        Method::POST,
        &format!("{}?uploadId={}", uri, upload_id),
        Body::empty(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = send(&app, Method::GET, &uri, Body::empty()).await;
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], b"helloworld");
}

#[tokio::test]
async fn listing_pages_with_opaque_tokens() {
    let h = Harness::new().await;
    let app = app(&h);
    let bucket = create_bucket(&app).await;
    for key in ["a/1", "a/2", "b", "c"] {
        let uri = format!("/{}/{}", bucket.id, key);
        send(&app, Method::PUT, &uri, Body::from(key)).await;
    }

    let response = send(
        &app,
        Method::GET,
        &format!("/{}?delimiter=/&max-keys=2", bucket.id),
        Body::empty(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let page = json(response).await;
    assert_eq!(page["is_truncated"], true);
    assert_eq!(page["common_prefixes"][0], "a/");
    assert_eq!(page["contents"].as_array().unwrap().len(), 0);
    let token = page["next_continuation_token"].as_str().unwrap().to_string();

    let response = send(
        &app,
        Method::GET,
        &format!(
            "/{}?delimiter=/&max-keys=2&continuation-token={}",
            bucket.id, token
        ),
        Body::empty(),
    )
    .await;
    let page = json(response).await;
    assert_eq!(page["is_truncated"], false);
    assert_eq!(page["contents"].as_array().unwrap().len(), 2);
    assert_eq!(page["contents"][0]["key"], "b");
    assert_eq!(page["contents"][1]["key"], "c");
}

#[tokio::test]
async fn locked_bucket_rejects_writes() {
    let h = Harness::new().await;
    let app = app(&h);
    let bucket = create_bucket(&app).await;

    let response = send(
        &app,
        Method::POST,
        &format!("/{}?locked=true", bucket.id),
        Body::empty(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = send(
        &app,
        Method::PUT,
        &format!("/{}/a.txt", bucket.id),
        Body::from("nope"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(json(response).await["code"], "BucketLocked");
}
