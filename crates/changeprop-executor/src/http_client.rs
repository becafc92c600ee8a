use async_trait::async_trait;
use changeprop_core::config::HttpConfig;
use changeprop_core::error::{Error, Result};
use changeprop_core::http::{HttpError, HttpRequest, HttpResponse};
use reqwest::redirect::Policy;
use reqwest::Method;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// Issues the requests rules expand to.
///
/// Any status >= 400 and any transport failure is an `Err`. Redirects are
/// returned as-is, never followed.
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    async fn request(&self, request: HttpRequest) -> std::result::Result<HttpResponse, HttpError>;
}

pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    pub fn new(config: &HttpConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .redirect(Policy::none())
            .user_agent(config.user_agent.clone());
        if let Some(secs) = config.timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        let client = builder
            .build()
            .map_err(|e| Error::Config(format!("failed to build http client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn request(&self, request: HttpRequest) -> std::result::Result<HttpResponse, HttpError> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|_| HttpError::transport(format!("invalid method {}", request.method)))?;

        let mut builder = self.client.request(method, &request.uri);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = match body {
                Value::String(s) => builder.body(s.clone()),
                other => builder.json(other),
            };
        }

        let response = builder.send().await.map_err(HttpError::transport)?;

        let status = response.status().as_u16();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
            .collect();
        let bytes = response.bytes().await.map_err(HttpError::transport)?;
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };

        let response = HttpResponse {
            status,
            headers,
            body,
        };
        if status >= 400 {
            Err(HttpError::from_response(response))
        } else {
            Ok(response)
        }
    }
}
