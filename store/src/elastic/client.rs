//! Blocking Elasticsearch REST client.

use std::time::Duration;

use log::debug;
use reqwest::Url;
use reqwest::blocking::{Client, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::types::{BulkResponse, GetResponse, SearchResponse, classify_status};
use crate::excerpt;
use folio::StoreError;

/// Connection failures and timeouts are transient; a request we could not
/// build or a response we could not decode is not.
fn transport_error(context: &str, e: reqwest::Error) -> StoreError {
    if e.is_builder() || e.is_decode() {
        StoreError::Fatal(format!("{context}: {e}"))
    } else {
        StoreError::Transient(format!("{context}: {e}"))
    }
}

/// Thin wrapper over the handful of endpoints the stores need.
#[derive(Clone, Debug)]
pub struct ElasticClient {
    client: Client,
    base_url: Url,
}

impl ElasticClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, StoreError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| StoreError::Fatal(format!("invalid elasticsearch url {base_url}: {e}")))?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StoreError::Fatal(format!("http client: {e}")))?;
        Ok(Self { client, base_url })
    }

    /// `base_url` joined with percent-encoded path segments.
    fn url(&self, segments: &[&str]) -> Result<Url, StoreError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| StoreError::Fatal(format!("{} cannot be a base url", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn check(resp: Response) -> Result<Response, StoreError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().unwrap_or_default();
        Err(classify_status(status.as_u16(), &body))
    }

    /// Cluster reachability (GET /).
    pub fn ping(&self) -> Result<(), StoreError> {
        let resp = self
            .client
            .get(self.base_url.clone())
            .send()
            .map_err(|e| transport_error("ping failed", e))?;
        Self::check(resp).map(|_| ())
    }

    /// Source of one document (GET /{index}/_doc/{id}). `None` if absent.
    pub fn get_source<T: DeserializeOwned>(
        &self,
        index: &str,
        id: &str,
    ) -> Result<Option<T>, StoreError> {
        let url = self.url(&[index, "_doc", id])?;
        let resp = self
            .client
            .get(url)
            .send()
            .map_err(|e| transport_error("get request failed", e))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let doc: GetResponse<T> = Self::check(resp)?
            .json()
            .map_err(|e| transport_error("failed to parse get response", e))?;
        Ok(if doc.found { doc.source } else { None })
    }

    /// Create or replace one document (PUT /{index}/_doc/{id}).
    pub fn put_doc<T: Serialize + ?Sized>(
        &self,
        index: &str,
        id: &str,
        doc: &T,
    ) -> Result<(), StoreError> {
        let url = self.url(&[index, "_doc", id])?;
        let resp = self
            .client
            .put(url)
            .json(doc)
            .send()
            .map_err(|e| transport_error("index request failed", e))?;
        Self::check(resp).map(|_| ())
    }

    /// Sources of all hits for `query` (POST /{index}/_search). A missing index
    /// has no hits.
    pub fn search<T: DeserializeOwned>(
        &self,
        index: &str,
        query: &serde_json::Value,
    ) -> Result<Vec<T>, StoreError> {
        let url = self.url(&[index, "_search"])?;
        let resp = self
            .client
            .post(url)
            .json(query)
            .send()
            .map_err(|e| transport_error("search request failed", e))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let found: SearchResponse<T> = Self::check(resp)?
            .json()
            .map_err(|e| transport_error("failed to parse search response", e))?;
        Ok(found.hits.hits.into_iter().map(|hit| hit.source).collect())
    }

    /// Submit an NDJSON bulk body (POST /_bulk).
    pub fn bulk(&self, body: String) -> Result<BulkResponse, StoreError> {
        let url = self.url(&["_bulk"])?;
        debug!("bulk request: {}", excerpt(&body));

        let resp = self
            .client
            .post(url)
            .header("Content-Type", "application/x-ndjson")
            .body(body)
            .send()
            .map_err(|e| transport_error("bulk request failed", e))?;

        Self::check(resp)?
            .json::<BulkResponse>()
            .map_err(|e| transport_error("failed to parse bulk response", e))
    }
}
