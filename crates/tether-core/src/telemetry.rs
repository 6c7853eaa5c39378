//! Metric names recorded through the `metrics` facade.
//!
//! The library never installs a recorder; embedding applications choose the
//! exporter.

/// Sessions connected total (counter).
pub const SESSIONS_CONNECTED_TOTAL: &str = "tether_sessions_connected_total";
/// Sessions disconnected total (counter).
pub const SESSIONS_DISCONNECTED_TOTAL: &str = "tether_sessions_disconnected_total";
/// Registered sessions (gauge).
pub const SESSIONS_ACTIVE: &str = "tether_sessions_active";
/// Connects refused by a handler (counter).
pub const SESSIONS_REJECTED_TOTAL: &str = "tether_sessions_rejected_total";
/// Inbound channel messages dispatched (counter).
pub const MESSAGES_DISPATCHED_TOTAL: &str = "tether_messages_dispatched_total";
/// Envelopes dropped on a full mailbox (counter, labels: kind).
pub const MAILBOX_DROPS_TOTAL: &str = "tether_mailbox_drops_total";
/// Requests refused by the security layer (counter, labels: reason).
pub const SECURITY_REJECTIONS_TOTAL: &str = "tether_security_rejections_total";
/// Handler panics caught by the HTTP adapter (counter).
pub const ADAPTER_PANICS_TOTAL: &str = "tether_adapter_panics_total";
/// Requests executed through the HTTP adapter (counter).
pub const ADAPTER_REQUESTS_TOTAL: &str = "tether_adapter_requests_total";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_names_are_prefixed_snake_case() {
        let names = [
            SESSIONS_CONNECTED_TOTAL,
            SESSIONS_DISCONNECTED_TOTAL,
            SESSIONS_ACTIVE,
            SESSIONS_REJECTED_TOTAL,
            MESSAGES_DISPATCHED_TOTAL,
            MAILBOX_DROPS_TOTAL,
            SECURITY_REJECTIONS_TOTAL,
            ADAPTER_PANICS_TOTAL,
            ADAPTER_REQUESTS_TOTAL,
        ];
        for name in names {
            assert!(name.starts_with("tether_"), "{name}");
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "{name}"
            );
        }
    }
}
