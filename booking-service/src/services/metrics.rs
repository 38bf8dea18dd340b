use metrics::counter;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

pub static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder. Later calls (several test apps in one
/// process) keep the first recorder.
pub fn init_metrics() {
    if METRICS_HANDLE.get().is_some() {
        return;
    }

    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            if METRICS_HANDLE.set(handle).is_err() {
                tracing::debug!("Metrics recorder installed concurrently");
            }
        }
        Err(e) => tracing::warn!(error = %e, "Failed to install Prometheus recorder"),
    }
}

pub fn get_metrics() -> String {
    METRICS_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_else(|| "# Metrics recorder not initialized\n".to_string())
}

/// Count an inbound gateway event by channel and how it was resolved.
pub fn record_payment_event(channel: &str, outcome: &str) {
    counter!(
        "payment_events_total",
        "channel" => channel.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

pub fn record_invoice_transition(to: &str) {
    counter!("invoice_transitions_total", "to" => to.to_string()).increment(1);
}

pub fn record_sweep(expired: u64, failed: u64) {
    counter!("sweeper_runs_total").increment(1);
    counter!("sweeper_expired_total").increment(expired);
    counter!("sweeper_failed_total").increment(failed);
}
