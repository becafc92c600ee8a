use crate::error::ExecError;
use changeprop_core::types::{ErrorMessage, FailedInput, ERROR_TOPIC};
use changeprop_msg::publisher::EventPublisher;
use metrics::counter;
use std::fmt;
use tracing::{error, warn};

/// Publishes terminal failure records for one rule to the error topic.
#[derive(Clone)]
pub struct ErrorReporter {
    publisher: EventPublisher,
    rule: String,
    emitter_id: String,
}

impl ErrorReporter {
    pub fn new(publisher: EventPublisher, rule: &str, emitter_id: &str) -> Self {
        Self {
            publisher,
            rule: rule.to_string(),
            emitter_id: emitter_id.to_string(),
        }
    }

    pub async fn report(&self, input: FailedInput<'_>, failure: &ExecError) {
        let details = failure.as_http().map(|e| e.details());
        self.send(input, failure.to_string(), format!("{failure:?}"), details)
            .await;
    }

    /// Reports input that could not be decoded at all.
    pub async fn report_malformed(&self, input: FailedInput<'_>, reason: &(dyn fmt::Display + Sync)) {
        self.send(input, reason.to_string(), format!("{reason}"), None)
            .await;
    }

    async fn send(
        &self,
        input: FailedInput<'_>,
        message: String,
        stack: String,
        details: Option<changeprop_core::types::ErrorDetails>,
    ) {
        let record = ErrorMessage::new(input, self.emitter_id.clone(), message, stack, details);
        counter!("changeprop_error_reports_total", "rule" => self.rule.clone()).increment(1);
        match self.publisher.publish(ERROR_TOPIC, &record).await {
            Ok(()) => warn!(rule = %self.rule, uri = %record.meta.uri, message = %record.message, "error reported"),
            Err(e) => error!(rule = %self.rule, uri = %record.meta.uri, "failed to publish error record: {e}"),
        }
    }
}
