use crate::config::Config;
use crate::rate_limit::RateLimiter;
use std::sync::Arc;
use telemetry::audit::LedgerAccessLog;
use telemetry::broadcast::Broadcaster;
use telemetry::identity::IdentityVerifier;
use telemetry::ledger::DocumentStore;
use telemetry::pipeline::Pipeline;
use telemetry::registry::ChannelRegistry;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub registry: Arc<ChannelRegistry>,
    pub identity: Arc<dyn IdentityVerifier>,
    pub rate_limiter: Arc<RateLimiter>,
    pub ws_queue_capacity: usize,
}

impl AppState {
    /// Wire the telemetry components around a ledger and identity service.
    pub fn new(
        store: Arc<dyn DocumentStore>,
        identity: Arc<dyn IdentityVerifier>,
        config: &Config,
    ) -> Self {
        let audit = Arc::new(LedgerAccessLog::new(
            store.clone(),
            config.collections.access_log.clone(),
        ));
        let registry = Arc::new(ChannelRegistry::new(
            identity.clone(),
            audit,
            config.access_policy.clone(),
        ));
        let broadcaster = Arc::new(Broadcaster::new(registry.clone(), config.broadcast.clone()));
        let pipeline = Arc::new(Pipeline::new(
            store,
            config.collections.clone(),
            config.reconcile.clone(),
            config.alert_policy.clone(),
            broadcaster,
        ));

        Self {
            pipeline,
            registry,
            identity,
            rate_limiter: Arc::new(RateLimiter::new()),
            ws_queue_capacity: config.broadcast.queue_capacity,
        }
    }
}
