use crate::http_client::HttpClient;
use async_trait::async_trait;
use changeprop_core::http::{HttpError, HttpRequest, HttpResponse};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

/// Polls `condition` until it holds, panicking after a minute of (possibly
/// virtual) time.
pub async fn wait_for(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Answers requests from a script, then falls back to a default status.
pub struct FakeHttpClient {
    script: Mutex<VecDeque<u16>>,
    fallback: u16,
    requests: Mutex<Vec<HttpRequest>>,
}

impl FakeHttpClient {
    pub fn always(status: u16) -> Self {
        Self::scripted(&[], status)
    }

    pub fn scripted(statuses: &[u16], fallback: u16) -> Self {
        Self {
            script: Mutex::new(statuses.iter().copied().collect()),
            fallback,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl HttpClient for FakeHttpClient {
    async fn request(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        self.requests.lock().unwrap().push(request);
        let status = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.fallback);
        let mut response = HttpResponse::new(status);
        if status >= 400 {
            response.body = serde_json::json!({ "title": format!("status {status}") });
            Err(HttpError::from_response(response))
        } else {
            Ok(response)
        }
    }
}
