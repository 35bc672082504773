use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

pub struct WorkerMetrics {
    pub registry: Registry,
    pub fetch_attempts_total: IntCounter,
    pub ban_signals_total: IntCounter,
    pub transport_failures_total: IntCounter,
    pub identity_rotations_total: IntCounter,
    pub links_completed_total: IntCounter,
    pub records_appended_total: IntCounter,
    pub persist_failures_total: IntCounter,
    pub geometry_failures_total: IntCounter,
    pub shard_progress_percent: IntGauge,
}

impl WorkerMetrics {
    pub fn new(slot: u16) -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("footprint_worker".into()), None)?;
        let slot = slot.to_string();

        macro_rules! reg {
            ($kind:ident, $name:expr, $help:expr) => {{
                let m = $kind::with_opts(prometheus::Opts::new($name, $help).const_label("slot", slot.as_str()))?;
                registry.register(Box::new(m.clone()))?;
                m
            }};
        }

        Ok(Self {
            fetch_attempts_total: reg!(IntCounter, "fetch_attempts_total", "Query requests issued"),
            ban_signals_total: reg!(IntCounter, "ban_signals_total", "Responses classified as a ban"),
            transport_failures_total: reg!(IntCounter, "transport_failures_total", "Requests that failed below HTTP"),
            identity_rotations_total: reg!(IntCounter, "identity_rotations_total", "Forced identity rotations"),
            links_completed_total: reg!(IntCounter, "links_completed_total", "Links fetched and processed"),
            records_appended_total: reg!(IntCounter, "records_appended_total", "Rows appended to the buildings table"),
            persist_failures_total: reg!(IntCounter, "persist_failures_total", "Batches dropped after an append error"),
            geometry_failures_total: reg!(IntCounter, "geometry_failures_total", "Features kept without geometry"),
            shard_progress_percent: reg!(IntGauge, "shard_progress_percent", "Last reported shard milestone"),
            registry,
        })
    }

    pub fn router(&self) -> Router {
        let reg = self.registry.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let reg = reg.clone();
                async move {
                    let mf = reg.gather();
                    let mut buf = Vec::new();
                    match TextEncoder::new().encode(&mf, &mut buf) {
                        Ok(()) => String::from_utf8_lossy(&buf).into_owned().into_response(),
                        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
                    }
                }
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gathers_with_slot_label() {
        let metrics = WorkerMetrics::new(4).unwrap();
        metrics.fetch_attempts_total.inc_by(3);
        metrics.shard_progress_percent.set(50);

        let families = metrics.registry.gather();
        let attempts = families
            .iter()
            .find(|f| f.get_name() == "footprint_worker_fetch_attempts_total")
            .unwrap();
        let metric = &attempts.get_metric()[0];
        assert_eq!(metric.get_counter().get_value(), 3.0);
        assert_eq!(metric.get_label()[0].get_value(), "4");
    }
}
