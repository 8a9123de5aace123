use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use http::header::{IF_MODIFIED_SINCE, USER_AGENT};
use http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;

use crate::constants;

#[derive(Clone)]
pub struct OriginClient {
    client: Client<HttpConnector, Full<Bytes>>,
    base: String,
    timeout: Duration,
}

impl OriginClient {
    pub fn new(base: &str, timeout: Duration) -> Self {
        let connector = HttpConnector::new();
        let client = Client::builder(TokioExecutor::new()).build(connector);
        Self {
            client,
            base: base.trim_end_matches('/').to_string(),
            timeout,
        }
    }

    pub fn origin_url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    pub async fn fetch(
        &self,
        method: Method,
        path: &str,
        headers: HeaderMap,
    ) -> Result<(StatusCode, HeaderMap, Bytes)> {
        let uri: Uri = self
            .origin_url(path)
            .parse()
            .context("parse origin uri")?;
        let mut req = http::Request::builder().method(method).uri(uri);
        for (k, v) in headers.iter() {
            req = req.header(k, v);
        }
        req = req.header(USER_AGENT, constants::USER_AGENT);
        let req = req
            .body(Full::new(Bytes::new()))
            .context("build origin request")?;

        let round_trip = async {
            let resp = self.client.request(req).await.context("origin request")?;
            let status = resp.status();
            let headers = resp.headers().clone();
            let body = resp
                .into_body()
                .collect()
                .await
                .context("read origin body")?
                .to_bytes();
            Ok::<_, anyhow::Error>((status, headers, body))
        };

        match tokio::time::timeout(self.timeout, round_trip).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!(
                "origin request timed out after {}s",
                self.timeout.as_secs()
            )),
        }
    }

    pub async fn conditional_head(
        &self,
        path: &str,
        if_modified_since: &HeaderValue,
    ) -> Result<(StatusCode, HeaderMap)> {
        let mut headers = HeaderMap::new();
        headers.insert(IF_MODIFIED_SINCE, if_modified_since.clone());
        let (status, headers, _) = self.fetch(Method::HEAD, path, headers).await?;
        Ok((status, headers))
    }
}
