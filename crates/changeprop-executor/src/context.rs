//! Machinery shared by the rule and retry handlers: matching, request
//! execution, failure classification and the retry path.

use crate::error::ExecError;
use crate::http_client::HttpClient;
use crate::reporter::ErrorReporter;
use changeprop_core::http::{HttpRequest, HttpResponse};
use changeprop_core::rule::Rule;
use changeprop_core::types::{emitter_id, Event, FailedInput, RetryMessage, Traceable};
use changeprop_msg::publisher::EventPublisher;
use changeprop_msg::BusMessage;
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, enabled, error, info, trace, warn, Level};
use uuid::Uuid;

pub struct ExecContext {
    rule: Arc<dyn Rule>,
    client: Arc<dyn HttpClient>,
    publisher: EventPublisher,
    reporter: ErrorReporter,
    emitter_id: String,
}

impl ExecContext {
    pub fn new(rule: Arc<dyn Rule>, client: Arc<dyn HttpClient>, publisher: EventPublisher) -> Self {
        let emitter_id = emitter_id(rule.name());
        let reporter = ErrorReporter::new(publisher.clone(), rule.name(), &emitter_id);
        Self {
            rule,
            client,
            publisher,
            reporter,
            emitter_id,
        }
    }

    pub fn rule(&self) -> &dyn Rule {
        self.rule.as_ref()
    }

    pub fn emitter_id(&self) -> &str {
        &self.emitter_id
    }

    pub fn reporter(&self) -> &ErrorReporter {
        &self.reporter
    }

    /// Decodes a bus payload. Undecodable payloads are reported once and
    /// yield `None`; empty ones yield `None` without a report.
    pub async fn parse(&self, message: &BusMessage) -> Option<Value> {
        let raw = message.payload_str();
        if raw.is_empty() {
            debug!(rule = %self.rule.name(), offset = message.offset, "empty message dropped");
            return None;
        }
        match serde_json::from_str::<Value>(&raw) {
            Ok(value) if is_blank(&value) => {
                debug!(rule = %self.rule.name(), offset = message.offset, "blank message dropped");
                None
            }
            Ok(value) => Some(value),
            Err(e) => {
                error!(
                    rule = %self.rule.name(),
                    topic = %message.topic,
                    offset = message.offset,
                    "failed to parse message: {e}"
                );
                self.reporter
                    .report_malformed(FailedInput::Raw(&raw), &e)
                    .await;
                None
            }
        }
    }

    /// First matching option of the rule. Match errors count as no match.
    pub fn test(&self, event: &Value) -> Option<usize> {
        match self.rule.test(event) {
            Ok(Some(option)) => Some(option),
            Ok(None) => {
                debug!(rule = %self.rule.name(), uri = ?event.pointer("/meta/uri"), "dropping event message");
                None
            }
            Err(e) => {
                error!(rule = %self.rule.name(), "rule test failed: {e}");
                None
            }
        }
    }

    /// Runs the option's requests in order, stopping at the first failure.
    /// `trace` is the message whose chain goes into `x-triggered-by`.
    pub async fn exec(
        &self,
        event: &Event,
        option: usize,
        stat_name: &str,
        delay_start: Option<DateTime<Utc>>,
        trace: &(dyn Traceable + Sync),
    ) -> Result<(), ExecError> {
        trace!(rule = %self.rule.name(), uri = %event.meta().uri, "event message received");

        if let Some(created) = delay_start.or_else(|| event.meta().timestamp()) {
            let delay = (Utc::now() - created).num_milliseconds().max(0) as f64 / 1000.0;
            histogram!("changeprop_event_delay_seconds", "rule" => stat_name.to_string())
                .record(delay);
        }

        let started = Instant::now();
        let result = self.exec_requests(event, option, trace).await;
        histogram!("changeprop_exec_seconds", "rule" => stat_name.to_string())
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn exec_requests(
        &self,
        event: &Event,
        option: usize,
        trace: &(dyn Traceable + Sync),
    ) -> Result<(), ExecError> {
        let bindings = self.rule.expand(option, event.as_value())?;
        let ctx = json!({ "message": event.as_value(), "match": bindings });
        let chain = trace.trigger_chain();
        let request_id = event
            .meta()
            .request_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        for template in self.rule.exec(option) {
            let mut request = template.expand(&ctx)?;
            request.set_header("x-request-id", request_id.as_str());
            request.set_header("x-triggered-by", chain.as_str());

            match self.client.request(request.clone()).await {
                Ok(response) => {
                    if response.status == 301 {
                        warn!(
                            rule = %self.rule.name(),
                            uri = %event.meta().uri,
                            "301 redirect received, used a non-normalized title"
                        );
                    }
                    sample_log(trace, &request, &response);
                }
                Err(e) => {
                    sample_log(trace, &request, &e.to_response());
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    /// Retry message for `event` after `failure`. `previous` is the retry
    /// message being processed, if any.
    pub fn retry_message(
        &self,
        event: &Event,
        failure: &ExecError,
        retries_left: i64,
        previous: &dyn Traceable,
    ) -> RetryMessage {
        RetryMessage::for_event(
            event,
            self.rule.topic(),
            self.emitter_id.clone(),
            retries_left,
            previous.trigger_chain(),
            failure
                .as_http()
                .and_then(|e| e.title())
                .map(str::to_string),
        )
    }

    /// Logs the exhaustion and returns true once no retries are left.
    pub fn is_limit_exceeded(&self, message: &RetryMessage) -> bool {
        if message.retries_left <= 0 {
            error!(
                rule = %self.rule.name(),
                uri = %message.meta.uri,
                reason = ?message.reason,
                "retry count exceeded"
            );
            return true;
        }
        false
    }

    /// Decides what happens to a failed message: retry it, report it, or
    /// drop it.
    pub async fn catch(&self, failed: &Value, retry: RetryMessage, failure: ExecError) {
        match &failure {
            ExecError::Internal(e) => {
                error!(rule = %self.rule.name(), "internal error in change-prop: {e}");
                self.reporter
                    .report(FailedInput::Message(failed), &failure)
                    .await;
            }
            ExecError::Http(e) if self.rule.should_retry(e) => {
                if !self.is_limit_exceeded(&retry) {
                    self.retry(retry).await;
                }
            }
            ExecError::Http(e) if !self.rule.should_ignore_error(e) => {
                self.reporter
                    .report(FailedInput::Message(failed), &failure)
                    .await;
            }
            ExecError::Http(e) => {
                debug!(rule = %self.rule.name(), status = e.status, "ignoring failure");
            }
        }
    }

    /// Waits out the backoff, then publishes to the retry topic.
    async fn retry(&self, message: RetryMessage) {
        let delay = self.rule.retry_policy().delay_for(message.retries_left);
        tokio::time::sleep(delay).await;

        counter!("changeprop_retries_scheduled_total", "rule" => self.rule.name().to_string())
            .increment(1);
        match self.publisher.publish(&message.meta.topic, &message).await {
            Ok(()) => info!(
                rule = %self.rule.name(),
                uri = %message.meta.uri,
                retries_left = message.retries_left,
                delay_ms = delay.as_millis() as u64,
                "retry scheduled"
            ),
            Err(e) => error!(
                rule = %self.rule.name(),
                uri = %message.meta.uri,
                "failed to publish retry message: {e}"
            ),
        }
    }
}

fn sample_log(trace: &dyn Traceable, request: &HttpRequest, response: &HttpResponse) {
    if !enabled!(Level::TRACE) {
        return;
    }
    let body = if matches!(response.status, 200 | 201) {
        Value::Null
    } else {
        response.body.clone()
    };
    trace!(
        uri = %trace.meta().uri,
        request = ?request,
        status = response.status,
        body = %body,
        "processed event sample"
    );
}

/// `null`, `false`, `0` and `""` carry no event.
fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

