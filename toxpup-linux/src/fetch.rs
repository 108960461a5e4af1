//! HTTP fetcher used for avatars and the bootstrap node list.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use toxpup_core::{FetchError, Fetcher};

const USER_AGENT: &str = concat!("toxpup/", env!("CARGO_PKG_VERSION"));

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
        let fail = |e: reqwest::Error| FetchError {
            url: url.to_string(),
            reason: e.to_string(),
        };
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(fail)?;
        let body = resp.bytes().await.map_err(fail)?;
        tracing::debug!(url, len = body.len(), "fetched");
        Ok(body)
    }
}
