pub mod rest;

use axum::Router;
use changeprop_core::rule::RuleSpec;
use changeprop_executor::registry::RuleRegistry;
use changeprop_msg::publisher::EventPublisher;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

pub struct ApiServer {
    listen_addr: SocketAddr,
    registry: Arc<RuleRegistry>,
    publisher: EventPublisher,
    static_rules: BTreeMap<String, RuleSpec>,
}

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RuleRegistry>,
    pub publisher: EventPublisher,
    pub static_rules: Arc<BTreeMap<String, RuleSpec>>,
}

impl ApiServer {
    pub fn new(listen_addr: SocketAddr, registry: Arc<RuleRegistry>, publisher: EventPublisher) -> Self {
        Self {
            listen_addr,
            registry,
            publisher,
            static_rules: BTreeMap::new(),
        }
    }

    /// Rules subscribed by `PUT /setup`.
    pub fn with_static_rules(mut self, rules: BTreeMap<String, RuleSpec>) -> Self {
        self.static_rules = rules;
        self
    }

    pub async fn run(self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let state = AppState {
            registry: self.registry,
            publisher: self.publisher,
            static_rules: Arc::new(self.static_rules),
        };

        let listener = tokio::net::TcpListener::bind(self.listen_addr).await?;
        info!("REST API listening on {}", self.listen_addr);

        let mut shutdown = shutdown;
        axum::serve(listener, app(state))
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await?;

        Ok(())
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(rest::router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
