use crate::context::ExecContext;
use crate::executor::{Executor, ExecutorSettings};
use crate::http_client::HttpClient;
use crate::retry_executor::RetryHandler;
use crate::rule_executor::RuleHandler;
use changeprop_core::error::Result;
use changeprop_core::rule::{ConfigRule, RuleSpec};
use changeprop_msg::publisher::EventPublisher;
use changeprop_msg::ConsumerFactory;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// What `subscribe_rule` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Subscription {
    Started,
    Replaced,
    Unchanged,
    /// The rule has nothing to execute; any previous executors were stopped.
    Skipped,
}

struct ActiveRule {
    spec: RuleSpec,
    rule_executor: Executor,
    retry_executor: Executor,
}

impl ActiveRule {
    async fn close(self) {
        self.rule_executor.close().await;
        self.retry_executor.close().await;
    }
}

/// Active rules by name, each backed by a rule executor and a retry executor.
///
/// The rule map lock is only held for lookups and swaps. Updates to one name
/// are serialized by a per-name lock, so draining a replaced executor pair
/// never blocks readers or updates to other rules.
pub struct RuleRegistry {
    factory: Arc<dyn ConsumerFactory>,
    client: Arc<dyn HttpClient>,
    publisher: EventPublisher,
    settings: ExecutorSettings,
    rules: Mutex<BTreeMap<String, ActiveRule>>,
    updates: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RuleRegistry {
    pub fn new(
        factory: Arc<dyn ConsumerFactory>,
        client: Arc<dyn HttpClient>,
        publisher: EventPublisher,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            factory,
            client,
            publisher,
            settings,
            rules: Mutex::new(BTreeMap::new()),
            updates: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribes every rule in `specs`. All specs are validated first, so an
    /// invalid one leaves the registry untouched.
    pub async fn subscribe(
        &self,
        specs: &BTreeMap<String, RuleSpec>,
    ) -> Result<BTreeMap<String, Subscription>> {
        for (name, spec) in specs {
            ConfigRule::new(name, spec.clone())?;
        }
        let mut outcome = BTreeMap::new();
        for (name, spec) in specs {
            let result = self.subscribe_rule(name, spec.clone()).await?;
            outcome.insert(name.clone(), result);
        }
        Ok(outcome)
    }

    /// Starts executors for `name` unless an identical `RuleSpec` is already
    /// active. A changed one replaces the old executor pair.
    pub async fn subscribe_rule(&self, name: &str, spec: RuleSpec) -> Result<Subscription> {
        let update = self.update_lock(name).await;
        let _update = update.lock().await;

        if self
            .rules
            .lock()
            .await
            .get(name)
            .is_some_and(|active| active.spec == spec)
        {
            debug!(rule = %name, "rule unchanged");
            return Ok(Subscription::Unchanged);
        }

        let rule = ConfigRule::new(name, spec.clone())?;
        let previous = self.rules.lock().await.remove(name);
        let replaced = previous.is_some();
        if let Some(previous) = previous {
            info!(rule = %name, "rule changed, stopping old executors");
            previous.close().await;
        }

        if rule.is_noop() {
            info!(rule = %name, "rule has nothing to execute, skipping");
            return Ok(Subscription::Skipped);
        }

        let rule = Arc::new(rule);
        let rule_executor = Executor::start(
            Arc::new(RuleHandler::new(self.context(rule.clone()))),
            self.factory.as_ref(),
            self.settings,
        )
        .await?;
        let retry_executor = match Executor::start(
            Arc::new(RetryHandler::new(self.context(rule))),
            self.factory.as_ref(),
            self.settings,
        )
        .await
        {
            Ok(executor) => executor,
            Err(e) => {
                rule_executor.close().await;
                return Err(e);
            }
        };

        info!(rule = %name, topic = %spec.topic, "rule subscribed");
        self.rules.lock().await.insert(
            name.to_string(),
            ActiveRule {
                spec,
                rule_executor,
                retry_executor,
            },
        );
        Ok(if replaced {
            Subscription::Replaced
        } else {
            Subscription::Started
        })
    }

    async fn update_lock(&self, name: &str) -> Arc<Mutex<()>> {
        self.updates
            .lock()
            .await
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    fn context(&self, rule: Arc<ConfigRule>) -> ExecContext {
        ExecContext::new(rule, self.client.clone(), self.publisher.clone())
    }

    pub async fn active_rules(&self) -> Vec<String> {
        self.rules.lock().await.keys().cloned().collect()
    }

    /// Closes every executor pair.
    pub async fn close(&self) {
        let rules = std::mem::take(&mut *self.rules.lock().await);
        for (name, active) in rules {
            active.close().await;
            debug!(rule = %name, "rule unsubscribed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{wait_for, FakeHttpClient};
    use changeprop_msg::memory::MemoryBus;
    use serde_json::json;
    use std::time::Duration;

    fn spec(uri: &str) -> RuleSpec {
        serde_json::from_value(json!({
            "topic": "simple_test_rule",
            "exec": { "uri": uri }
        }))
        .unwrap()
    }

    fn registry(bus: &MemoryBus, client: Arc<FakeHttpClient>) -> RuleRegistry {
        let publisher = EventPublisher::new(Arc::new(bus.clone()), bus.naming().clone());
        RuleRegistry::new(
            Arc::new(bus.clone()),
            client,
            publisher,
            ExecutorSettings {
                concurrency: 2,
                commit_interval: Duration::from_millis(20),
            },
        )
    }

    fn sample_event() -> serde_json::Value {
        json!({ "meta": { "topic": "simple_test_rule", "uri": "/sample/uri" } })
    }

    #[tokio::test(start_paused = true)]
    async fn test_identical_spec_is_noop() {
        let bus = MemoryBus::default();
        let registry = registry(&bus, Arc::new(FakeHttpClient::always(200)));

        let first = registry.subscribe_rule("simple", spec("http://a/")).await.unwrap();
        let second = registry.subscribe_rule("simple", spec("http://a/")).await.unwrap();
        assert_eq!(first, Subscription::Started);
        assert_eq!(second, Subscription::Unchanged);
        assert_eq!(registry.active_rules().await, vec!["simple".to_string()]);
        registry.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_changed_spec_replaces_executors() {
        let bus = MemoryBus::default();
        let client = Arc::new(FakeHttpClient::always(200));
        let registry = registry(&bus, client.clone());

        registry.subscribe_rule("simple", spec("http://a/")).await.unwrap();
        bus.publish_json("datacenter1.simple_test_rule", &sample_event());
        wait_for(|| client.count() == 1).await;
        wait_for(|| {
            bus.committed("change-prop-simple", "datacenter1.simple_test_rule", 0) == Some(1)
        })
        .await;

        let outcome = registry.subscribe_rule("simple", spec("http://b/")).await.unwrap();
        assert_eq!(outcome, Subscription::Replaced);

        bus.publish_json("datacenter1.simple_test_rule", &sample_event());
        wait_for(|| client.count() == 2).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Only the new executor handled the second event; the first one
        // was not redelivered.
        let uris: Vec<_> = client.requests().into_iter().map(|r| r.uri).collect();
        assert_eq!(uris, vec!["http://a/", "http://b/"]);
        registry.close().await;
        assert!(registry.active_rules().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_noop_and_invalid_specs() {
        let bus = MemoryBus::default();
        let registry = registry(&bus, Arc::new(FakeHttpClient::always(200)));

        let noop: RuleSpec = serde_json::from_value(json!({ "topic": "t" })).unwrap();
        assert_eq!(
            registry.subscribe_rule("noop", noop).await.unwrap(),
            Subscription::Skipped
        );

        let invalid: RuleSpec =
            serde_json::from_value(json!({ "topic": "t", "exec": { "uri": "{{bad}}" } })).unwrap();
        assert!(registry.subscribe_rule("invalid", invalid).await.is_err());
        assert!(registry.active_rules().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_replace_does_not_block_readers_while_draining() {
        let bus = MemoryBus::default();
        let client = Arc::new(FakeHttpClient::always(500));
        let registry = Arc::new(registry(&bus, client.clone()));
        let slow = |uri: &str| -> RuleSpec {
            serde_json::from_value(json!({
                "topic": "simple_test_rule",
                "retry_delay": 600000,
                "exec": { "uri": uri }
            }))
            .unwrap()
        };

        registry.subscribe_rule("slow", slow("http://a/")).await.unwrap();
        bus.publish_json("datacenter1.simple_test_rule", &sample_event());
        wait_for(|| client.count() == 1).await;

        // The old rule executor is now waiting out a ten minute backoff.
        let replace = tokio::spawn({
            let registry = registry.clone();
            async move { registry.subscribe_rule("slow", slow("http://b/")).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!replace.is_finished());

        let rules = tokio::time::timeout(Duration::from_secs(30), registry.active_rules()).await;
        assert!(rules.is_ok());
        let other = tokio::time::timeout(
            Duration::from_secs(30),
            registry.subscribe_rule(
                "other",
                serde_json::from_value(json!({
                    "topic": "other_topic",
                    "exec": { "uri": "http://c/" }
                }))
                .unwrap(),
            ),
        )
        .await;
        assert_eq!(other.unwrap().unwrap(), Subscription::Started);

        assert_eq!(replace.await.unwrap().unwrap(), Subscription::Replaced);
        assert_eq!(
            registry.active_rules().await,
            vec!["other".to_string(), "slow".to_string()]
        );
        registry.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_spec_in_batch_applies_nothing() {
        let bus = MemoryBus::default();
        let registry = registry(&bus, Arc::new(FakeHttpClient::always(200)));
        let invalid: RuleSpec =
            serde_json::from_value(json!({ "topic": "t", "exec": { "uri": "{{bad}}" } })).unwrap();
        let specs = BTreeMap::from([
            ("a_valid".to_string(), spec("http://one/")),
            ("b_invalid".to_string(), invalid),
        ]);

        assert!(registry.subscribe(&specs).await.is_err());
        assert!(registry.active_rules().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_many() {
        let bus = MemoryBus::default();
        let registry = registry(&bus, Arc::new(FakeHttpClient::always(200)));
        let specs = BTreeMap::from([
            ("one".to_string(), spec("http://one/")),
            ("two".to_string(), spec("http://two/")),
        ]);
        let outcome = registry.subscribe(&specs).await.unwrap();
        assert_eq!(outcome["one"], Subscription::Started);
        assert_eq!(outcome["two"], Subscription::Started);
        assert_eq!(registry.active_rules().await.len(), 2);
        registry.close().await;
    }
}
