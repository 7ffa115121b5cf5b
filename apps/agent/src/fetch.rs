use std::collections::HashMap;
use std::time::Duration;

use futures_util::future::BoxFuture;
use peershare_common::constants::TUNNEL_CONNECT_TIMEOUT_SECS;
use peershare_common::{ProxyRequest, ProxyResponse, RelayError, Result, decode_body, encode_body};

/// Seam for fulfilling `proxy_request` messages. The default agent
/// fetches directly, but an embedding host can substitute its own
/// handler (e.g. to route through an app-level HTTP stack).
pub trait ProxyHandler: Send + Sync {
    fn handle(&self, request: ProxyRequest) -> BoxFuture<'static, Result<ProxyResponse>>;
}

/// A fetched upstream response with the body already decoded
#[derive(Debug)]
pub struct FetchedResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

/// Outbound HTTP fetcher shared by both proxy paths
#[derive(Clone)]
pub struct DirectFetch {
    client: reqwest::Client,
}

impl DirectFetch {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(TUNNEL_CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| RelayError::HttpError(e.to_string()))?;
        Ok(Self { client })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Execute one HTTP request and collect the full response
    pub async fn fetch(
        &self,
        method: &str,
        url: &str,
        headers: &HashMap<String, String>,
        body: Option<&[u8]>,
    ) -> Result<FetchedResponse> {
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| RelayError::InvalidMessage(format!("unsupported HTTP method: {}", method)))?;

        let mut builder = self.client.request(method, url);
        for (name, value) in headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = body {
            if !body.is_empty() {
                builder = builder.body(body.to_vec());
            }
        }

        let response = builder
            .send()
            .await
            .map_err(|e| RelayError::HttpError(e.to_string()))?;

        let status = response.status().as_u16();
        let mut response_headers = HashMap::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                response_headers.insert(name.as_str().to_string(), value.to_string());
            }
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| RelayError::HttpError(e.to_string()))?;

        Ok(FetchedResponse {
            status,
            headers: response_headers,
            body: body.to_vec(),
        })
    }
}

impl ProxyHandler for DirectFetch {
    fn handle(&self, request: ProxyRequest) -> BoxFuture<'static, Result<ProxyResponse>> {
        let fetch = self.clone();
        Box::pin(async move {
            let body = request.body.as_deref().map(decode_body).transpose()?;
            let fetched = fetch
                .fetch(&request.method, &request.url, &request.headers, body.as_deref())
                .await?;
            Ok(ProxyResponse {
                request_id: request.request_id,
                status_code: fetched.status,
                headers: fetched.headers,
                body: encode_body(&fetched.body),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unsupported_method_rejected() {
        let fetch = DirectFetch::new().unwrap();
        let result = fetch
            .fetch("NOT A METHOD", "http://127.0.0.1:1/", &HashMap::new(), None)
            .await;
        assert!(matches!(result, Err(RelayError::InvalidMessage(_))));
    }

    #[tokio::test]
    async fn test_unreachable_target_is_http_error() {
        let fetch = DirectFetch::new().unwrap();
        let result = fetch
            .fetch("GET", "http://127.0.0.1:1/", &HashMap::new(), None)
            .await;
        assert!(matches!(result, Err(RelayError::HttpError(_))));
    }

    #[tokio::test]
    async fn test_handler_decodes_invalid_body() {
        let fetch = DirectFetch::new().unwrap();
        let request = ProxyRequest {
            request_id: "req_1".to_string(),
            method: "POST".to_string(),
            url: "http://127.0.0.1:1/".to_string(),
            headers: HashMap::new(),
            body: Some("not base64!!!".to_string()),
        };
        let result = fetch.handle(request).await;
        assert!(matches!(result, Err(RelayError::Base64Error(_))));
    }
}
