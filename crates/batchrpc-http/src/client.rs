//! HTTP transport backed by `reqwest`.
//!
//! Response bodies:
//! - single call: the entity as JSON;
//! - batch call: `{"results": {"<id>": entity}, "errors": {"<id>": {"status", "message"}}}`.
//!
//! Non-2xx statuses become [`TransportError::Status`]; a 404 on a single call
//! therefore surfaces as "item not found" to the caller.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;
use serde_json::Value;

use batchrpc_core::error::TransportError;
use batchrpc_core::request::{BatchRequest, BatchResponse, ItemError, ItemId, SingleRequest};
use batchrpc_core::transport::Transport;

/// Configuration for [`HttpTransport`].
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    pub request_timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            user_agent: concat!("batchrpc/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// REST-style HTTP transport.
pub struct HttpTransport {
    base: Url,
    http: reqwest::Client,
    request_timeout: Duration,
}

impl HttpTransport {
    /// Create a transport for the service rooted at `base_url`.
    pub fn new(base_url: &str, config: HttpTransportConfig) -> Result<Self, TransportError> {
        let base = Url::parse(base_url)
            .map_err(|e| TransportError::Other(format!("invalid base url {base_url:?}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(TransportError::Other(format!(
                "base url {base_url:?} cannot carry a path"
            )));
        }

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(config.user_agent)
            .build()
            .map_err(|e| TransportError::Http(e.to_string()))?;

        Ok(Self {
            base,
            http,
            request_timeout: config.request_timeout,
        })
    }

    /// Create with default configuration.
    pub fn default_for(base_url: &str) -> Result<Self, TransportError> {
        Self::new(base_url, HttpTransportConfig::default())
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    async fn get_bytes(&self, url: Url) -> Result<Vec<u8>, TransportError> {
        tracing::trace!(url = %url, "GET");
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| self.request_error(e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = resp.bytes().await.map_err(|e| self.request_error(e))?;
        Ok(bytes.to_vec())
    }

    fn request_error(&self, e: reqwest::Error) -> TransportError {
        if e.is_timeout() {
            TransportError::Timeout {
                ms: self.request_timeout.as_millis() as u64,
            }
        } else {
            TransportError::Http(e.to_string())
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute_batch(&self, req: BatchRequest) -> Result<BatchResponse, TransportError> {
        if req.ids.is_empty() {
            return Ok(BatchResponse::default());
        }
        let url = batch_url(&self.base, &req)?;
        let body = self.get_bytes(url).await?;
        let wire: WireBatchResponse = serde_json::from_slice(&body)?;
        Ok(wire.into_response(&req.ids))
    }

    async fn execute_single(&self, req: SingleRequest) -> Result<Value, TransportError> {
        let url = single_url(&self.base, &req)?;
        let body = self.get_bytes(url).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    fn name(&self) -> &str {
        self.base.as_str()
    }
}

/// Batch body as sent by the server. Object keys are always strings, so
/// they are matched back to the requested ids by their display form.
#[derive(Debug, Default, Deserialize)]
struct WireBatchResponse {
    #[serde(default)]
    results: HashMap<String, Value>,
    #[serde(default)]
    errors: HashMap<String, ItemError>,
}

impl WireBatchResponse {
    fn into_response(mut self, ids: &[ItemId]) -> BatchResponse {
        let mut resp = BatchResponse::default();
        for id in ids {
            let wire_id = id.to_string();
            if let Some(value) = self.results.remove(&wire_id) {
                resp.results.insert(id.clone(), value);
            } else if let Some(error) = self.errors.remove(&wire_id) {
                resp.errors.insert(id.clone(), error);
            }
        }
        if !self.results.is_empty() || !self.errors.is_empty() {
            tracing::debug!(
                extra = self.results.len() + self.errors.len(),
                "batch response carried ids that were not requested"
            );
        }
        resp
    }
}

fn resource_url(base: &Url, segments: &[&str]) -> Result<Url, TransportError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| TransportError::Other(format!("base url {base} cannot carry a path")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

fn single_url(base: &Url, req: &SingleRequest) -> Result<Url, TransportError> {
    let id = req.id.to_string();
    let mut url = resource_url(base, &[req.key.resource(), id.as_str()])?;
    let pairs = query_pairs(req.key.method(), &req.params);
    if !pairs.is_empty() {
        url.query_pairs_mut().extend_pairs(pairs);
    }
    Ok(url)
}

fn batch_url(base: &Url, req: &BatchRequest) -> Result<Url, TransportError> {
    let mut url = resource_url(base, &[req.key.resource()])?;
    {
        let mut query = url.query_pairs_mut();
        for id in &req.ids {
            query.append_pair("ids", &id.to_string());
        }
        query.extend_pairs(query_pairs(req.key.method(), &req.params));
    }
    Ok(url)
}

/// `q=<method>` for non-`get` methods, then the parameters in key order.
fn query_pairs(method: &str, params: &Value) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    if method != "get" {
        pairs.push(("q".to_string(), method.to_string()));
    }
    match params {
        Value::Null => {}
        Value::Object(map) => {
            for (k, v) in map {
                let v = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                pairs.push((k.clone(), v));
            }
        }
        other => pairs.push(("params".to_string(), other.to_string())),
    }
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchrpc_core::request::BatchKey;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn base() -> Url {
        Url::parse("http://localhost:8080/api/").unwrap()
    }

    fn batch(method: &str, ids: Vec<ItemId>, params: Value) -> BatchRequest {
        BatchRequest {
            key: BatchKey::with_params("greetings", method, &params),
            batch_method: format!("batch_{method}"),
            ids,
            params,
        }
    }

    #[test]
    fn single_url_puts_id_in_path() {
        let req = SingleRequest::new("greetings", "get", 7);
        assert_eq!(
            single_url(&base(), &req).unwrap().as_str(),
            "http://localhost:8080/api/greetings/7"
        );
    }

    #[test]
    fn single_url_escapes_string_ids() {
        let req = SingleRequest::new("greetings", "get", "a b/c");
        assert_eq!(
            single_url(&base(), &req).unwrap().as_str(),
            "http://localhost:8080/api/greetings/a%20b%2Fc"
        );
    }

    #[test]
    fn batch_url_repeats_ids_and_keeps_duplicates() {
        let req = batch("get", vec![1.into(), 1.into(), 2.into()], Value::Null);
        assert_eq!(
            batch_url(&base(), &req).unwrap().as_str(),
            "http://localhost:8080/api/greetings?ids=1&ids=1&ids=2"
        );
    }

    #[test]
    fn batch_url_carries_method_and_params() {
        let req = batch(
            "search",
            vec![3.into()],
            json!({"tone": "FRIENDLY", "limit": 5}),
        );
        assert_eq!(
            batch_url(&base(), &req).unwrap().as_str(),
            "http://localhost:8080/api/greetings?ids=3&q=search&limit=5&tone=FRIENDLY"
        );
    }

    #[test]
    fn wire_response_is_matched_to_requested_ids() {
        let wire: WireBatchResponse = serde_json::from_value(json!({
            "results": {"1": {"id": 1}, "abc": {"id": "abc"}, "99": {"id": 99}},
            "errors": {"2": {"status": 500, "message": "boom"}}
        }))
        .unwrap();
        let ids: Vec<ItemId> = vec![1.into(), 2.into(), "abc".into(), 3.into()];
        let resp = wire.into_response(&ids);

        assert_eq!(resp.results[&ItemId::from(1)], json!({"id": 1}));
        assert_eq!(resp.results[&ItemId::from("abc")], json!({"id": "abc"}));
        assert_eq!(resp.errors[&ItemId::from(2)].status, 500);
        assert!(!resp.results.contains_key(&ItemId::from(3)));
        assert!(!resp.results.contains_key(&ItemId::from(99)));
    }

    #[test]
    fn errors_section_is_optional() {
        let wire: WireBatchResponse =
            serde_json::from_value(json!({"results": {"1": "hi"}})).unwrap();
        let resp = wire.into_response(&[1.into()]);
        assert_eq!(resp.results.len(), 1);
        assert!(resp.errors.is_empty());
    }

    #[test]
    fn base_url_keeps_its_path() {
        let transport = HttpTransport::default_for("http://localhost:8080/api/").unwrap();
        assert_eq!(transport.base_url().path(), "/api/");
        assert_eq!(transport.base_url().port(), Some(8080));
        assert_eq!(transport.name(), "http://localhost:8080/api/");
    }

    #[test]
    fn rejects_bad_base_url() {
        assert!(HttpTransport::default_for("not a url").is_err());
        assert!(HttpTransport::default_for("mailto:someone@example.com").is_err());
    }

    /// Serves one canned response per connection and records request lines.
    async fn serve(responses: Vec<(u16, &'static str)>) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();

        tokio::spawn(async move {
            for (status, body) in responses {
                let (mut sock, _) = listener.accept().await.unwrap();
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = sock.read(&mut chunk).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                }
                let head = String::from_utf8_lossy(&buf);
                let line = head.lines().next().unwrap_or_default().to_string();
                log.lock().unwrap().push(line);

                let reply = format!(
                    "HTTP/1.1 {status} X\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                sock.write_all(reply.as_bytes()).await.unwrap();
                sock.shutdown().await.unwrap();
            }
        });

        (format!("http://{addr}/"), seen)
    }

    #[tokio::test]
    async fn executes_batch_over_http() {
        let (url, seen) = serve(vec![(
            200,
            r#"{"results":{"1":{"message":"hello"}},"errors":{"2":{"status":404,"message":"gone"}}}"#,
        )])
        .await;
        let transport = HttpTransport::default_for(&url).unwrap();

        let resp = transport
            .execute_batch(batch("get", vec![1.into(), 2.into()], Value::Null))
            .await
            .unwrap();

        assert_eq!(resp.results[&ItemId::from(1)], json!({"message": "hello"}));
        assert!(resp.errors[&ItemId::from(2)].is_not_found());
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            ["GET /greetings?ids=1&ids=2 HTTP/1.1"]
        );
    }

    #[tokio::test]
    async fn single_404_is_not_found_status() {
        let (url, _seen) = serve(vec![(404, r#"{"message":"no such greeting"}"#)]).await;
        let transport = HttpTransport::default_for(&url).unwrap();

        let err = transport
            .execute_single(SingleRequest::new("greetings", "get", 5))
            .await
            .unwrap_err();
        assert!(err.is_not_found(), "{err:?}");
    }

    #[tokio::test]
    async fn malformed_body_is_deserialization_error() {
        let (url, _seen) = serve(vec![(200, "not json")]).await;
        let transport = HttpTransport::default_for(&url).unwrap();

        let err = transport
            .execute_single(SingleRequest::new("greetings", "get", 5))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Deserialization(_)));
    }
}
