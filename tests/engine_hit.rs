mod support;

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, IF_MODIFIED_SINCE, LAST_MODIFIED};
use http::{HeaderMap, Method, StatusCode};

use apt_pantry::policy::FreshnessPolicy;
use apt_pantry::storage::memory::MemoryStore;
use apt_pantry::storage::{BlobCache, HeaderCache};
use support::*;

const PLAIN: FreshnessPolicy = FreshnessPolicy {
    use_conditional: false,
    validate_with_origin: false,
};

const CONDITIONAL: FreshnessPolicy = FreshnessPolicy {
    use_conditional: true,
    validate_with_origin: false,
};

const RELEASE_LM: &str = "Mon, 01 Jan 2024 00:00:00 GMT";

fn release_mock(counters: Counters) -> impl Fn(http::Request<hyper::body::Incoming>) -> http::Response<http_body_util::Full<Bytes>> + Send + Sync {
    move |req| {
        counters.record(req.method());
        let mut headers = HeaderMap::new();
        headers.insert(LAST_MODIFIED, RELEASE_LM.parse().unwrap());
        build_response(
            StatusCode::OK,
            headers,
            Bytes::from_static(b"Origin: Ubuntu\n"),
        )
    }
}

#[tokio::test]
async fn miss_then_hit_serves_from_cache() {
    let counters = Counters::new();
    let mock = MockServer::start(release_mock(counters.clone())).await;
    let engine = engine_for(mock.addr());
    let path = "/pool/main/h/hello/hello_2.10-2_amd64.deb";

    let resp = engine.serve(&Method::GET, path, &HeaderMap::new(), PLAIN).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers().get(CONTENT_LENGTH).unwrap(), "15");
    assert_eq!(body_bytes(resp).await, Bytes::from_static(b"Origin: Ubuntu\n"));
    assert_eq!(counters.gets(), 1);

    let resp = engine.serve(&Method::GET, path, &HeaderMap::new(), PLAIN).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers().get(CONTENT_LENGTH).unwrap(), "15");
    assert_eq!(body_bytes(resp).await, Bytes::from_static(b"Origin: Ubuntu\n"));
    assert_eq!(counters.gets(), 1);
    assert_eq!(counters.heads(), 0);
}

#[tokio::test]
async fn if_modified_since_is_not_after() {
    let counters = Counters::new();
    let mock = MockServer::start(release_mock(counters.clone())).await;
    let engine = engine_for(mock.addr());
    let path = "/dists/jammy/main/binary-amd64/Packages.gz";

    let resp = engine.serve(&Method::GET, path, &HeaderMap::new(), CONDITIONAL).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(counters.gets(), 1);

    // Equal timestamp is a 304.
    let mut req = HeaderMap::new();
    req.insert(IF_MODIFIED_SINCE, RELEASE_LM.parse().unwrap());
    let resp = engine.serve(&Method::GET, path, &req, CONDITIONAL).await;
    assert_eq!(resp.status(), StatusCode::NOT_MODIFIED);
    assert!(body_bytes(resp).await.is_empty());

    let mut req = HeaderMap::new();
    req.insert(
        IF_MODIFIED_SINCE,
        "Tue, 02 Jan 2024 00:00:00 GMT".parse().unwrap(),
    );
    let resp = engine.serve(&Method::GET, path, &req, CONDITIONAL).await;
    assert_eq!(resp.status(), StatusCode::NOT_MODIFIED);

    let mut req = HeaderMap::new();
    req.insert(
        IF_MODIFIED_SINCE,
        "Sun, 31 Dec 2023 23:59:59 GMT".parse().unwrap(),
    );
    let resp = engine.serve(&Method::GET, path, &req, CONDITIONAL).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_bytes(resp).await, Bytes::from_static(b"Origin: Ubuntu\n"));

    // No extra origin traffic for any of the conditional answers.
    assert_eq!(counters.gets(), 1);
    assert_eq!(counters.heads(), 0);
}

#[tokio::test]
async fn conditional_header_ignored_for_immutable_policy() {
    let counters = Counters::new();
    let mock = MockServer::start(release_mock(counters.clone())).await;
    let engine = engine_for(mock.addr());
    let path = "/pool/main/h/hello/hello_2.10-2_amd64.deb";

    engine.serve(&Method::GET, path, &HeaderMap::new(), PLAIN).await;

    let mut req = HeaderMap::new();
    req.insert(IF_MODIFIED_SINCE, RELEASE_LM.parse().unwrap());
    let resp = engine.serve(&Method::GET, path, &req, PLAIN).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(counters.gets(), 1);
}

#[tokio::test]
async fn missing_last_modified_falls_back_to_fetch_time() {
    let mock = MockServer::start(|_req| {
        build_response(StatusCode::OK, HeaderMap::new(), Bytes::from_static(b"data"))
    })
    .await;
    let engine = engine_for(mock.addr());
    let path = "/dists/jammy/main/binary-amd64/Packages";

    let resp = engine.serve(&Method::GET, path, &HeaderMap::new(), CONDITIONAL).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let before = SystemTime::now() - Duration::from_secs(100);
    let mut req = HeaderMap::new();
    req.insert(IF_MODIFIED_SINCE, httpdate::fmt_http_date(before).parse().unwrap());
    let resp = engine.serve(&Method::GET, path, &req, CONDITIONAL).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let after = SystemTime::now() + Duration::from_secs(10);
    let mut req = HeaderMap::new();
    req.insert(IF_MODIFIED_SINCE, httpdate::fmt_http_date(after).parse().unwrap());
    let resp = engine.serve(&Method::GET, path, &req, CONDITIONAL).await;
    assert_eq!(resp.status(), StatusCode::NOT_MODIFIED);
}

#[tokio::test]
async fn head_and_get_agree_on_cached_headers() {
    let mock = MockServer::start(|req| {
        let mut headers = HeaderMap::new();
        headers.insert(LAST_MODIFIED, RELEASE_LM.parse().unwrap());
        headers.insert("X-Server", "mock/1.0".parse().unwrap());
        let body = if req.method() == Method::HEAD {
            Bytes::new()
        } else {
            Bytes::from_static(b"Origin: Ubuntu\n")
        };
        build_response(StatusCode::OK, headers, body)
    })
    .await;
    let engine = engine_for(mock.addr());
    let path = "/pool/main/h/hello/hello_2.10-2_amd64.deb";

    engine.serve(&Method::GET, path, &HeaderMap::new(), PLAIN).await;

    let head = engine.serve(&Method::HEAD, path, &HeaderMap::new(), PLAIN).await;
    assert_eq!(head.status(), StatusCode::OK);
    assert_eq!(head.headers().get("X-Server").unwrap(), "mock/1.0");
    assert_eq!(head.headers().get(CONTENT_LENGTH).unwrap(), "15");
    assert!(body_bytes(head).await.is_empty());

    let get = engine.serve(&Method::GET, path, &HeaderMap::new(), PLAIN).await;
    assert_eq!(get.status(), StatusCode::OK);
    assert_eq!(get.headers().get("X-Server").unwrap(), "mock/1.0");
    assert_eq!(get.headers().get(CONTENT_LENGTH).unwrap(), "15");
    assert_eq!(body_bytes(get).await.len(), 15);
}

#[tokio::test]
async fn missing_header_sidecar_synthesizes_minimal_headers() {
    let counters = Counters::new();
    let mock = MockServer::start(release_mock(counters.clone())).await;

    let blobs = Arc::new(MemoryStore::new());
    let primer_blobs: Arc<dyn BlobCache> = blobs.clone();
    let primer_headers: Arc<dyn HeaderCache> = Arc::new(MemoryStore::new());
    let primer = engine_with_stores(mock.addr(), primer_blobs, primer_headers);

    let path = "/pool/main/h/hello/hello_2.10-2_amd64.deb";
    primer.serve(&Method::GET, path, &HeaderMap::new(), PLAIN).await;

    // Same blobs, empty header store: the degraded-but-legal state.
    let degraded_blobs: Arc<dyn BlobCache> = blobs.clone();
    let degraded_headers: Arc<dyn HeaderCache> = Arc::new(MemoryStore::new());
    let engine = engine_with_stores(mock.addr(), degraded_blobs, degraded_headers);

    let resp = engine.serve(&Method::GET, path, &HeaderMap::new(), PLAIN).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get(CONTENT_TYPE).unwrap(),
        "application/vnd.debian.binary-package"
    );
    assert_eq!(resp.headers().get(LAST_MODIFIED).unwrap(), RELEASE_LM);
    assert_eq!(resp.headers().get(CONTENT_LENGTH).unwrap(), "15");
    assert_eq!(body_bytes(resp).await, Bytes::from_static(b"Origin: Ubuntu\n"));
}
