use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use once_cell::sync::Lazy;

static STARTED_AT: Lazy<Instant> = Lazy::new(Instant::now);

static EVENTS_RECEIVED: AtomicU64 = AtomicU64::new(0);
static EVENTS_PROCESSED: AtomicU64 = AtomicU64::new(0);
static EVENTS_FAILED: AtomicU64 = AtomicU64::new(0);
static EVENTS_RETRIED: AtomicU64 = AtomicU64::new(0);
static DUPLICATE_MESSAGES: AtomicU64 = AtomicU64::new(0);
static CONVERSATIONS_OPENED: AtomicU64 = AtomicU64::new(0);
static BOT_MATCHES: AtomicU64 = AtomicU64::new(0);
static TICKETS_ESCALATED: AtomicU64 = AtomicU64::new(0);
static FLOW_FAILURES: AtomicU64 = AtomicU64::new(0);
static QUEUE_DEPTH: AtomicU64 = AtomicU64::new(0);

pub struct Metrics;

impl Metrics {
    /// Pins the uptime origin; call once at startup.
    pub fn start() {
        Lazy::force(&STARTED_AT);
    }

    pub fn uptime_secs() -> u64 {
        STARTED_AT.elapsed().as_secs()
    }

    pub fn event_received() {
        EVENTS_RECEIVED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn event_processed() {
        EVENTS_PROCESSED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn event_failed() {
        EVENTS_FAILED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn event_retried() {
        EVENTS_RETRIED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn duplicate_message() {
        DUPLICATE_MESSAGES.fetch_add(1, Ordering::Relaxed);
    }

    pub fn conversation_opened() {
        CONVERSATIONS_OPENED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bot_matched() {
        BOT_MATCHES.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ticket_escalated() {
        TICKETS_ESCALATED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn flow_failed() {
        FLOW_FAILURES.fetch_add(1, Ordering::Relaxed);
    }

    pub fn queue_depth_inc() {
        QUEUE_DEPTH.fetch_add(1, Ordering::Relaxed);
    }

    pub fn queue_depth_dec() {
        let _ = QUEUE_DEPTH.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |depth| {
            Some(depth.saturating_sub(1))
        });
    }
}

pub fn format_prometheus() -> String {
    let counters: [(&str, &str, &str, u64); 11] = [
        (
            "router_uptime_seconds",
            "gauge",
            "Number of seconds the router has been running",
            Metrics::uptime_secs(),
        ),
        (
            "router_webhook_events_received_total",
            "counter",
            "Webhook events durably stored",
            EVENTS_RECEIVED.load(Ordering::Relaxed),
        ),
        (
            "router_webhook_events_processed_total",
            "counter",
            "Webhook events routed successfully",
            EVENTS_PROCESSED.load(Ordering::Relaxed),
        ),
        (
            "router_webhook_events_failed_total",
            "counter",
            "Webhook event processing attempts that failed",
            EVENTS_FAILED.load(Ordering::Relaxed),
        ),
        (
            "router_webhook_events_retried_total",
            "counter",
            "Webhook events picked up again by the reaper",
            EVENTS_RETRIED.load(Ordering::Relaxed),
        ),
        (
            "router_duplicate_messages_total",
            "counter",
            "Inbound messages dropped as already recorded",
            DUPLICATE_MESSAGES.load(Ordering::Relaxed),
        ),
        (
            "router_conversations_opened_total",
            "counter",
            "Conversations created by inbound messages",
            CONVERSATIONS_OPENED.load(Ordering::Relaxed),
        ),
        (
            "router_bot_matches_total",
            "counter",
            "Conversations handed to a bot by a trigger rule",
            BOT_MATCHES.load(Ordering::Relaxed),
        ),
        (
            "router_tickets_escalated_total",
            "counter",
            "Tickets opened from conversations",
            TICKETS_ESCALATED.load(Ordering::Relaxed),
        ),
        (
            "router_flow_failures_total",
            "counter",
            "Bot flow engine calls that failed",
            FLOW_FAILURES.load(Ordering::Relaxed),
        ),
        (
            "router_ingest_queue_depth",
            "gauge",
            "Webhook events waiting for a worker",
            QUEUE_DEPTH.load(Ordering::Relaxed),
        ),
    ];

    let mut output = String::new();
    for (name, kind, help, value) in counters {
        output.push_str(&format!(
            "# HELP {name} {help}\n# TYPE {name} {kind}\n{name} {value}\n\n"
        ));
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let received = EVENTS_RECEIVED.load(Ordering::Relaxed);
        let escalated = TICKETS_ESCALATED.load(Ordering::Relaxed);
        Metrics::event_received();
        Metrics::ticket_escalated();

        assert!(EVENTS_RECEIVED.load(Ordering::Relaxed) > received);
        assert!(TICKETS_ESCALATED.load(Ordering::Relaxed) > escalated);
    }

    #[test]
    fn queue_depth_never_underflows() {
        for _ in 0..3 {
            Metrics::queue_depth_dec();
        }
        assert!(QUEUE_DEPTH.load(Ordering::Relaxed) < u64::MAX / 2);
    }

    #[test]
    fn format_prometheus_includes_all_metrics() {
        let output = format_prometheus();
        assert!(output.contains("# TYPE router_uptime_seconds gauge"));
        assert!(output.contains("router_webhook_events_received_total"));
        assert!(output.contains("router_duplicate_messages_total"));
        assert!(output.contains("router_bot_matches_total"));
        assert!(output.contains("router_ingest_queue_depth"));
    }
}
