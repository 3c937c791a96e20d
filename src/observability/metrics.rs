use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub accept_attempts_total: IntCounterVec,
    pub status_transitions_total: IntCounterVec,
    pub confirmation_attempts_total: IntCounterVec,
    pub chat_messages_total: IntCounter,
    pub active_subscriptions: IntGauge,
    pub evicted_subscribers_total: IntCounter,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let accept_attempts_total = IntCounterVec::new(
            Opts::new("accept_attempts_total", "Order accept attempts by outcome"),
            &["outcome"],
        )
        .expect("valid accept_attempts_total metric");

        let status_transitions_total = IntCounterVec::new(
            Opts::new(
                "status_transitions_total",
                "Applied order status transitions by target status",
            ),
            &["status"],
        )
        .expect("valid status_transitions_total metric");

        let confirmation_attempts_total = IntCounterVec::new(
            Opts::new(
                "confirmation_attempts_total",
                "Delivery confirmation code checks by outcome",
            ),
            &["outcome"],
        )
        .expect("valid confirmation_attempts_total metric");

        let chat_messages_total =
            IntCounter::new("chat_messages_total", "Chat messages relayed")
                .expect("valid chat_messages_total metric");

        let active_subscriptions = IntGauge::new(
            "active_subscriptions",
            "Live order event subscriptions",
        )
        .expect("valid active_subscriptions metric");

        let evicted_subscribers_total = IntCounter::new(
            "evicted_subscribers_total",
            "Subscribers dropped for falling behind",
        )
        .expect("valid evicted_subscribers_total metric");

        registry
            .register(Box::new(accept_attempts_total.clone()))
            .expect("register accept_attempts_total");
        registry
            .register(Box::new(status_transitions_total.clone()))
            .expect("register status_transitions_total");
        registry
            .register(Box::new(confirmation_attempts_total.clone()))
            .expect("register confirmation_attempts_total");
        registry
            .register(Box::new(chat_messages_total.clone()))
            .expect("register chat_messages_total");
        registry
            .register(Box::new(active_subscriptions.clone()))
            .expect("register active_subscriptions");
        registry
            .register(Box::new(evicted_subscribers_total.clone()))
            .expect("register evicted_subscribers_total");

        Self {
            registry,
            accept_attempts_total,
            status_transitions_total,
            confirmation_attempts_total,
            chat_messages_total,
            active_subscriptions,
            evicted_subscribers_total,
        }
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}
