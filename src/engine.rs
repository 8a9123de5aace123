use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Result};
use bytes::Bytes;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, IF_MODIFIED_SINCE, LAST_MODIFIED};
use http::{HeaderMap, HeaderValue, Method, Response, StatusCode};
use http_body_util::Full;

use crate::mime;
use crate::policy::FreshnessPolicy;
use crate::singleflight::{Flight, FlightPermit, FlightRegistry};
use crate::storage::{BlobCache, CachedBlob, HeaderCache};
use crate::upstream::OriginClient;

const MAX_LOOKUP_ATTEMPTS: usize = 4;

#[derive(Clone)]
pub struct Engine {
    origin: OriginClient,
    blobs: Arc<dyn BlobCache>,
    headers: Arc<dyn HeaderCache>,
    flights: FlightRegistry,
    log_requests: bool,
}

enum HitOutcome {
    Response(Response<Full<Bytes>>),
    Restart,
}

impl Engine {
    pub fn new(
        origin: OriginClient,
        blobs: Arc<dyn BlobCache>,
        headers: Arc<dyn HeaderCache>,
        log_requests: bool,
    ) -> Self {
        Self {
            origin,
            blobs,
            headers,
            flights: FlightRegistry::new(),
            log_requests,
        }
    }

    pub async fn serve(
        &self,
        method: &Method,
        path: &str,
        req_headers: &HeaderMap,
        policy: FreshnessPolicy,
    ) -> Response<Full<Bytes>> {
        let mut followed = false;
        for _ in 0..MAX_LOOKUP_ATTEMPTS {
            let blob = match self.blobs.get(path) {
                Ok(blob) => blob,
                Err(err) => {
                    log::warn!("blob cache read failed for {path}: {err}");
                    None
                }
            };

            if let Some(blob) = blob {
                if self.log_requests {
                    log::info!("cache hit for {path}");
                }
                match self.serve_hit(method, path, req_headers, policy, blob).await {
                    HitOutcome::Response(resp) => return resp,
                    HitOutcome::Restart => continue,
                }
            }

            match self.flights.acquire(path) {
                Flight::Leader(permit) => {
                    return self
                        .lead_miss(permit, method, path, req_headers, policy)
                        .await;
                }
                Flight::Follower(waiter) => {
                    if followed {
                        // Woke to a still-empty cache and lost the next
                        // acquire as well.
                        return busy_response();
                    }
                    followed = true;
                    waiter.wait().await;
                }
            }
        }
        busy_response()
    }

    async fn serve_hit(
        &self,
        method: &Method,
        path: &str,
        req_headers: &HeaderMap,
        policy: FreshnessPolicy,
        blob: CachedBlob,
    ) -> HitOutcome {
        let cached_headers = match self.headers.get_headers(path) {
            Ok(headers) => headers,
            Err(err) => {
                log::warn!("header cache read failed for {path}: {err}");
                None
            }
        };

        if policy.use_conditional {
            if let Some(since) = if_modified_since(req_headers) {
                let authoritative =
                    authoritative_last_modified(cached_headers.as_ref(), blob.last_modified);
                // Not-after: an equal timestamp is a 304.
                if authoritative <= since {
                    return HitOutcome::Response(not_modified());
                }
            }
        }

        let mut blob = blob;
        let mut cached_headers = cached_headers;
        if policy.validate_with_origin
            && self
                .origin_has_newer(path, cached_headers.as_ref(), blob.last_modified)
                .await
        {
            match self.flights.acquire(path) {
                Flight::Leader(permit) => {
                    if let Some((fresh_blob, fresh_headers)) =
                        self.lead_refresh(permit, path).await
                    {
                        blob = fresh_blob;
                        cached_headers = fresh_headers;
                    }
                }
                Flight::Follower(waiter) => {
                    waiter.wait().await;
                    return HitOutcome::Restart;
                }
            }
        }

        HitOutcome::Response(self.hit_response(method, path, blob, cached_headers))
    }

    async fn origin_has_newer(
        &self,
        path: &str,
        cached_headers: Option<&HeaderMap>,
        stored_last_modified: SystemTime,
    ) -> bool {
        let since = cached_headers
            .and_then(|headers| headers.get(LAST_MODIFIED).cloned())
            .unwrap_or_else(|| http_date_value(stored_last_modified));
        match self.origin.conditional_head(path, &since).await {
            Ok((status, _)) if status == StatusCode::NOT_MODIFIED => {
                if self.log_requests {
                    log::info!("origin confirms cache is fresh for {path}");
                }
                false
            }
            Ok((status, _)) if status == StatusCode::OK => {
                log::info!("origin has newer content for {path}");
                true
            }
            Ok((status, _)) => {
                log::warn!("unexpected origin status {status} while revalidating {path}");
                false
            }
            Err(err) => {
                log::warn!("origin revalidation failed for {path}: {err}");
                false
            }
        }
    }

    async fn lead_miss(
        &self,
        permit: FlightPermit,
        method: &Method,
        path: &str,
        req_headers: &HeaderMap,
        policy: FreshnessPolicy,
    ) -> Response<Full<Bytes>> {
        let engine = self.clone();
        let method = method.clone();
        let path = path.to_string();
        let if_modified_since = if policy.use_conditional {
            req_headers.get(IF_MODIFIED_SINCE).cloned()
        } else {
            None
        };
        // Detached so a client disconnect does not abort cache population
        // for the waiters.
        let task = tokio::spawn(async move {
            let resp = engine.fetch_miss(&method, &path, if_modified_since).await;
            drop(permit);
            resp
        });
        match task.await {
            Ok(resp) => resp,
            Err(err) => {
                log::error!("origin fetch task failed: {err}");
                status_response(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
            }
        }
    }

    async fn fetch_miss(
        &self,
        method: &Method,
        path: &str,
        if_modified_since: Option<HeaderValue>,
    ) -> Response<Full<Bytes>> {
        if self.log_requests {
            log::info!(
                "cache miss, fetching from origin {}",
                self.origin.origin_url(path)
            );
        }
        let mut headers = HeaderMap::new();
        if let Some(since) = if_modified_since {
            headers.insert(IF_MODIFIED_SINCE, since);
        }
        let (status, origin_headers, body) =
            match self.origin.fetch(method.clone(), path, headers).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    log::warn!("origin fetch failed for {path}: {err}");
                    return status_response(StatusCode::GATEWAY_TIMEOUT, "gateway timeout");
                }
            };

        if status == StatusCode::NOT_MODIFIED {
            return not_modified();
        }
        if !status.is_success() {
            return response_with_headers(status, HeaderMap::new(), body);
        }

        let last_modified = truncate_to_secs(last_modified_or_now(&origin_headers));
        if method == Method::GET {
            self.store(path, &body, last_modified, &origin_headers);
        }

        let mut headers = origin_headers;
        if !headers.contains_key(CONTENT_TYPE) {
            headers.insert(
                CONTENT_TYPE,
                HeaderValue::from_static(mime::content_type_for(path)),
            );
        }
        if method == Method::HEAD {
            // The origin's declared Content-Length stands in for the body a
            // GET would return.
            return empty_with_headers(status, headers);
        }
        headers.insert(CONTENT_LENGTH, content_length_value(body.len() as u64));
        response_with_headers(status, headers, body)
    }

    async fn lead_refresh(
        &self,
        permit: FlightPermit,
        path: &str,
    ) -> Option<(CachedBlob, Option<HeaderMap>)> {
        let engine = self.clone();
        let path_owned = path.to_string();
        let task = tokio::spawn(async move {
            let result = engine.refresh(&path_owned).await;
            drop(permit);
            result
        });
        match task.await {
            Ok(Ok(fresh)) => Some(fresh),
            Ok(Err(err)) => {
                log::warn!("refresh fetch failed for {path}: {err}");
                None
            }
            Err(err) => {
                log::error!("refresh task failed for {path}: {err}");
                None
            }
        }
    }

    async fn refresh(&self, path: &str) -> Result<(CachedBlob, Option<HeaderMap>)> {
        let (status, headers, body) = self
            .origin
            .fetch(Method::GET, path, HeaderMap::new())
            .await?;
        if !status.is_success() {
            return Err(anyhow!("origin returned {status}"));
        }
        let last_modified = truncate_to_secs(last_modified_or_now(&headers));
        self.store(path, &body, last_modified, &headers);
        Ok((
            CachedBlob {
                length: body.len() as u64,
                body,
                last_modified,
            },
            Some(headers),
        ))
    }

    fn store(&self, path: &str, body: &Bytes, last_modified: SystemTime, headers: &HeaderMap) {
        if let Some(declared) = declared_length(headers) {
            if declared != body.len() as u64 {
                log::warn!(
                    "content length mismatch for {path}: declared {declared}, received {}",
                    body.len()
                );
            }
        }
        match self.blobs.put(path, body, last_modified) {
            Ok(()) => {
                if self.log_requests {
                    log::info!("stored {path} ({} bytes)", body.len());
                }
            }
            Err(err) => log::warn!("blob cache write failed for {path}: {err}"),
        }
        if let Err(err) = self.headers.put_headers(path, headers) {
            log::warn!("header cache write failed for {path}: {err}");
        }
    }

    fn hit_response(
        &self,
        method: &Method,
        path: &str,
        blob: CachedBlob,
        cached_headers: Option<HeaderMap>,
    ) -> Response<Full<Bytes>> {
        let mut headers =
            cached_headers.unwrap_or_else(|| synthesized_headers(path, blob.last_modified));
        headers.insert(CONTENT_LENGTH, content_length_value(blob.length));
        if method == Method::HEAD {
            return empty_with_headers(StatusCode::OK, headers);
        }
        response_with_headers(StatusCode::OK, headers, blob.body)
    }
}

fn synthesized_headers(path: &str, last_modified: SystemTime) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let content_type = if path.ends_with('/') {
        "text/html"
    } else {
        mime::content_type_for(path)
    };
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(LAST_MODIFIED, http_date_value(last_modified));
    headers
}

fn if_modified_since(headers: &HeaderMap) -> Option<SystemTime> {
    let raw = headers.get(IF_MODIFIED_SINCE)?.to_str().ok()?;
    httpdate::parse_http_date(raw).ok()
}

fn authoritative_last_modified(
    cached_headers: Option<&HeaderMap>,
    stored: SystemTime,
) -> SystemTime {
    cached_headers
        .and_then(|headers| headers.get(LAST_MODIFIED))
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| httpdate::parse_http_date(raw).ok())
        .unwrap_or(stored)
}

fn last_modified_or_now(headers: &HeaderMap) -> SystemTime {
    headers
        .get(LAST_MODIFIED)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| httpdate::parse_http_date(raw).ok())
        .unwrap_or_else(SystemTime::now)
}

fn declared_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.parse().ok())
}

// HTTP dates carry whole seconds; storing finer precision would make a
// client echoing our own Last-Modified look stale.
pub fn truncate_to_secs(time: SystemTime) -> SystemTime {
    match time.duration_since(UNIX_EPOCH) {
        Ok(elapsed) => UNIX_EPOCH + Duration::from_secs(elapsed.as_secs()),
        Err(_) => UNIX_EPOCH,
    }
}

fn http_date_value(time: SystemTime) -> HeaderValue {
    httpdate::fmt_http_date(time).parse().unwrap()
}

fn content_length_value(length: u64) -> HeaderValue {
    length.to_string().parse().unwrap()
}

fn not_modified() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::NOT_MODIFIED)
        .body(Full::new(Bytes::new()))
        .unwrap()
}

fn busy_response() -> Response<Full<Bytes>> {
    status_response(
        StatusCode::SERVICE_UNAVAILABLE,
        "server busy, please try again",
    )
}

fn status_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

fn response_with_headers(
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
) -> Response<Full<Bytes>> {
    let mut builder = Response::builder().status(status);
    for (k, v) in headers.iter() {
        builder = builder.header(k, v);
    }
    builder.body(Full::new(body)).unwrap()
}

fn empty_with_headers(status: StatusCode, headers: HeaderMap) -> Response<Full<Bytes>> {
    response_with_headers(status, headers, Bytes::new())
}
