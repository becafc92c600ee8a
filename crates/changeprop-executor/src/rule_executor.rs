use crate::context::ExecContext;
use crate::executor::MessageHandler;
use async_trait::async_trait;
use changeprop_core::types::{normalize_stat_name, Event, FailedInput};
use changeprop_msg::BusMessage;
use tracing::warn;

/// Consumes a rule's own topic.
pub struct RuleHandler {
    ctx: ExecContext,
    stat_name: String,
}

impl RuleHandler {
    pub fn new(ctx: ExecContext) -> Self {
        let stat_name = normalize_stat_name(ctx.rule().name());
        Self { ctx, stat_name }
    }
}

#[async_trait]
impl MessageHandler for RuleHandler {
    fn subscribe_topic(&self) -> String {
        self.ctx.rule().topic().to_string()
    }

    fn consumer_group(&self) -> String {
        format!("change-prop-{}", self.ctx.rule().name())
    }

    fn concurrency(&self) -> Option<usize> {
        self.ctx.rule().concurrency()
    }

    async fn on_message(&self, message: &BusMessage) {
        let Some(value) = self.ctx.parse(message).await else {
            return;
        };
        let event = match Event::from_value(value) {
            Ok(event) => event,
            Err(e) => {
                warn!(rule = %self.ctx.rule().name(), offset = message.offset, "malformed event: {e}");
                let raw = message.payload_str();
                self.ctx
                    .reporter()
                    .report_malformed(FailedInput::Raw(&raw), &e)
                    .await;
                return;
            }
        };

        let Some(option) = self.ctx.test(event.as_value()) else {
            return;
        };

        if let Err(failure) = self
            .ctx
            .exec(&event, option, &self.stat_name, None, &event)
            .await
        {
            let retry_limit = self.ctx.rule().retry_policy().retry_limit;
            let retry = self.ctx.retry_message(&event, &failure, retry_limit, &event);
            self.ctx.catch(event.as_value(), retry, failure).await;
        }
    }
}
