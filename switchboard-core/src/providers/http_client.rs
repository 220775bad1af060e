use crate::error::AdapterError;
use reqwest::{header::HeaderMap, Client, Method, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Races `fut` against `cancellation`, synchronously tearing down the
/// in-flight request if the token fires first: cancellation must return
/// promptly without side effects beyond those already committed.
pub async fn race_cancel<T>(
    fut: impl std::future::Future<Output = Result<T, AdapterError>>,
    cancellation: &CancellationToken,
) -> Result<T, AdapterError> {
    tokio::select! {
        biased;
        _ = cancellation.cancelled() => Err(AdapterError::Cancelled),
        result = fut => result,
    }
}

#[derive(Clone, Debug)]
pub enum AuthStrategy {
    Bearer { token: String },
    Header { name: String, value: String },
    None,
}

#[derive(Clone)]
pub struct HttpProviderClient {
    http: Client,
    base_url: String,
    default_headers: HeaderMap,
}

impl HttpProviderClient {
    pub fn new(
        timeout: Duration,
        base_url: Option<String>,
        default_base: &str,
        headers: &HashMap<String, String>,
        auth: AuthStrategy,
    ) -> Result<Self, AdapterError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AdapterError::TransportError(format!("failed to build http client: {e}")))?;

        let mut default_headers = HeaderMap::new();

        match auth {
            AuthStrategy::Bearer { token } => {
                default_headers.insert(
                    "Authorization",
                    format!("Bearer {token}").parse().unwrap(),
                );
            }
            AuthStrategy::Header { name, value } => {
                if let (Ok(name), Ok(value)) =
                    (name.parse::<reqwest::header::HeaderName>(), value.parse())
                {
                    default_headers.insert(name, value);
                }
            }
            AuthStrategy::None => {}
        }

        for (k, v) in headers {
            if let (Ok(name), Ok(value)) = (k.parse::<reqwest::header::HeaderName>(), v.parse()) {
                default_headers.insert(name, value);
            }
        }

        let base_url = base_url.unwrap_or_else(|| default_base.to_string());

        Ok(Self {
            http,
            base_url,
            default_headers,
        })
    }

    fn build_url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url.trim_end_matches('/'), path)
        }
    }

    fn build_headers(&self) -> HeaderMap {
        self.default_headers.clone()
    }

    pub async fn post_json<TReq: Serialize, TResp: DeserializeOwned>(
        &self,
        path: &str,
        body: &TReq,
    ) -> Result<TResp, AdapterError> {
        let url = self.build_url(path);
        let resp = self
            .http
            .request(Method::POST, url)
            .headers(self.build_headers())
            .json(body)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(map_error_response(resp).await);
        }
        Ok(resp.json::<TResp>().await?)
    }

    pub async fn post_json_raw<TReq: Serialize>(
        &self,
        path: &str,
        body: &TReq,
    ) -> Result<Response, AdapterError> {
        let url = self.build_url(path);
        let resp = self
            .http
            .request(Method::POST, url)
            .headers(self.build_headers())
            .json(body)
            .send()
            .await?;
        Ok(resp)
    }

    pub async fn get_json<TResp: DeserializeOwned>(&self, path: &str) -> Result<TResp, AdapterError> {
        let url = self.build_url(path);
        let resp = self
            .http
            .request(Method::GET, url)
            .headers(self.build_headers())
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(map_error_response(resp).await);
        }
        Ok(resp.json::<TResp>().await?)
    }
}

pub async fn map_error_response(resp: Response) -> AdapterError {
    let status = resp.status().as_u16();
    match resp.text().await {
        Ok(body) => {
            let message = serde_json::from_str::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| v.get("error").cloned())
                .and_then(|e| e.get("message").cloned())
                .and_then(|m| m.as_str().map(|s| s.to_string()))
                .unwrap_or_else(|| body.clone());
            AdapterError::from_status(status, message)
        }
        Err(_) => AdapterError::from_status(status, "failed to read error response".to_string()),
    }
}
