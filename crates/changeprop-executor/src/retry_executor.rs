use crate::context::ExecContext;
use crate::executor::MessageHandler;
use async_trait::async_trait;
use changeprop_core::types::{normalize_stat_name, retry_topic, Event, FailedInput, RetryMessage};
use changeprop_msg::BusMessage;
use tracing::{debug, warn};

/// Consumes a rule's retry topic and re-attempts the wrapped events.
pub struct RetryHandler {
    ctx: ExecContext,
    stat_name: String,
}

impl RetryHandler {
    pub fn new(ctx: ExecContext) -> Self {
        let stat_name = normalize_stat_name(&format!("{}_retry", ctx.rule().name()));
        Self { ctx, stat_name }
    }
}

#[async_trait]
impl MessageHandler for RetryHandler {
    fn subscribe_topic(&self) -> String {
        retry_topic(self.ctx.rule().topic())
    }

    fn consumer_group(&self) -> String {
        format!("change-prop-{}-retry", self.ctx.rule().name())
    }

    fn concurrency(&self) -> Option<usize> {
        self.ctx.rule().concurrency()
    }

    async fn on_message(&self, message: &BusMessage) {
        let Some(value) = self.ctx.parse(message).await else {
            return;
        };
        let retry: RetryMessage = match serde_json::from_value(value.clone()) {
            Ok(retry) => retry,
            Err(e) => {
                warn!(rule = %self.ctx.rule().name(), offset = message.offset, "malformed retry message: {e}");
                self.ctx
                    .reporter()
                    .report_malformed(FailedInput::Message(&value), &e)
                    .await;
                return;
            }
        };

        if retry.emitter_id != self.ctx.emitter_id() {
            debug!(emitter_id = %retry.emitter_id, "retry message for another rule");
            return;
        }

        if self.ctx.is_limit_exceeded(&retry) {
            return;
        }

        let event = match Event::from_value(retry.original_event.clone()) {
            Ok(event) => event,
            Err(e) => {
                self.ctx
                    .reporter()
                    .report_malformed(FailedInput::Message(&value), &e)
                    .await;
                return;
            }
        };

        // The rule may have changed since the retry was scheduled.
        let Some(option) = self.ctx.test(event.as_value()) else {
            return;
        };

        if let Err(failure) = self
            .ctx
            .exec(&event, option, &self.stat_name, retry.meta.timestamp(), &retry)
            .await
        {
            let next = self
                .ctx
                .retry_message(&event, &failure, retry.retries_left - 1, &retry);
            self.ctx.catch(&value, next, failure).await;
        }
    }
}
