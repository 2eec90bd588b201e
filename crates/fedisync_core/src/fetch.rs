/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::error::FetchError;
use crate::http_sig::{sign_request_rsa_sha256, ACTIVITY_ACCEPT};
use async_trait::async_trait;
use http::{HeaderMap, Method, Uri};
use serde_json::Value;
use std::{collections::HashMap, sync::Arc, time::Duration, time::Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Cap on any JSON document read from a remote server.
pub const MAX_REMOTE_DOC_BYTES: usize = 1024 * 1024;

/// Reads a response body, giving up as soon as it grows past `limit`.
pub async fn read_body_limited(mut resp: reqwest::Response, limit: usize) -> Result<Vec<u8>, FetchError> {
    let url = resp.url().to_string();
    if resp.content_length().is_some_and(|len| len > limit as u64) {
        return Err(FetchError::TooLarge { url, limit });
    }
    let mut out = Vec::new();
    loop {
        let chunk = match resp.chunk().await {
            Ok(Some(c)) => c,
            Ok(None) => return Ok(out),
            Err(source) => return Err(FetchError::Http { url, source }),
        };
        if out.len() + chunk.len() > limit {
            return Err(FetchError::TooLarge { url, limit });
        }
        out.extend_from_slice(&chunk);
    }
}

/// Outbound JSON GET. Implementations never retry on their own: a failed
/// fetch is reported once and the caller decides what "no data" means.
#[async_trait]
pub trait JsonFetcher: Send + Sync {
    async fn fetch_json(&self, url: &str, cache_ttl: Duration) -> Result<Value, FetchError>;
}

#[derive(Clone)]
pub struct SignedFetchConfig {
    pub private_key_pem: String,
    pub key_id: String,
}

#[derive(Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    timeout: Duration,
    signed: Option<SignedFetchConfig>,
    cache: Arc<RwLock<HashMap<String, CachedDoc>>>,
}

#[derive(Clone)]
struct CachedDoc {
    doc: Value,
    expires_at: Instant,
}

impl HttpFetcher {
    pub fn new(client: reqwest::Client, timeout: Duration, signed: Option<SignedFetchConfig>) -> Self {
        Self {
            client,
            timeout,
            signed,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn build_request(&self, url: &str) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .get(url)
            .header("Accept", ACTIVITY_ACCEPT)
            .timeout(self.timeout);
        let Some(s) = &self.signed else {
            return req;
        };
        let Ok(uri) = url.parse::<Uri>() else {
            return req;
        };
        let mut headers = HeaderMap::new();
        match sign_request_rsa_sha256(
            &s.private_key_pem,
            &s.key_id,
            &Method::GET,
            &uri,
            &mut headers,
            &[],
            &["(request-target)", "host", "date"],
        ) {
            Ok(()) => {
                for (k, v) in headers.iter() {
                    req = req.header(k, v);
                }
            }
            Err(e) => warn!("unsigned fetch of {url}: {e:#}"),
        }
        req
    }

    async fn cached(&self, url: &str) -> Option<Value> {
        let cache = self.cache.read().await;
        cache
            .get(url)
            .filter(|c| c.expires_at > Instant::now())
            .map(|c| c.doc.clone())
    }
}

#[async_trait]
impl JsonFetcher for HttpFetcher {
    async fn fetch_json(&self, url: &str, cache_ttl: Duration) -> Result<Value, FetchError> {
        if let Some(doc) = self.cached(url).await {
            debug!("fetch cache hit: {url}");
            return Ok(doc);
        }

        let resp = self.build_request(url).send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout { url: url.to_string() }
            } else {
                FetchError::Http {
                    url: url.to_string(),
                    source: e,
                }
            }
        })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status,
            });
        }
        let bytes = read_body_limited(resp, MAX_REMOTE_DOC_BYTES).await?;
        let doc: Value = serde_json::from_slice(&bytes).map_err(|e| FetchError::Parse {
            url: url.to_string(),
            source: e,
        })?;

        if !cache_ttl.is_zero() {
            let mut cache = self.cache.write().await;
            let now = Instant::now();
            cache.retain(|_, c| c.expires_at > now);
            cache.insert(
                url.to_string(),
                CachedDoc {
                    doc: doc.clone(),
                    expires_at: now + cache_ttl,
                },
            );
        }
        Ok(doc)
    }
}

/// Pulls the `orderedItems` ids out of a (partial) collection document.
/// Embedded objects contribute their `id`; anything else is skipped.
pub fn ordered_item_ids(url: &str, doc: &Value) -> Result<Vec<String>, FetchError> {
    let items = doc
        .get("orderedItems")
        .ok_or_else(|| FetchError::Malformed {
            url: url.to_string(),
            reason: "missing orderedItems".to_string(),
        })?
        .as_array()
        .ok_or_else(|| FetchError::Malformed {
            url: url.to_string(),
            reason: "orderedItems is not an array".to_string(),
        })?;
    Ok(items
        .iter()
        .filter_map(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Object(o) => o.get("id").and_then(Value::as_str).map(str::to_string),
            _ => None,
        })
        .collect())
}
