//! Audit trail for message lifecycle transitions
//!
//! Every transition an operator may need to reconstruct later is emitted as a
//! structured `tracing` event carrying an `event` field:
//!
//! - `Enqueued`: a producer or operator inserted a message
//! - `DeliveryAttempt`: the dispatcher handed a message to a provider
//! - `DeliverySuccess`: the provider accepted the message, `sent_at` is set
//! - `DeliveryRetry`: a retryable failure was recorded against the message
//! - `DeadLettered`: the message left the active queue for the dead-letter store
//! - `Resent`: an operator re-enqueued a failed or dead-lettered message
//! - `Deleted`: an operator removed a message
//!
//! Recipient addresses can be redacted through [`AuditConfig`].

use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};

/// Audit logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Emit audit events at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Replace the local part of recipient addresses with `[REDACTED]`
    #[serde(default)]
    pub redact_recipients: bool,

    /// Omit error text, which can echo addresses back from remote servers
    #[serde(default)]
    pub redact_errors: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            redact_recipients: false,
            redact_errors: false,
        }
    }
}

const fn default_true() -> bool {
    true
}

static AUDIT_CONFIG: OnceLock<Arc<AuditConfig>> = OnceLock::new();

/// Install the process-wide audit configuration. Only the first call wins.
pub fn init(config: AuditConfig) {
    AUDIT_CONFIG.get_or_init(|| Arc::new(config));
}

#[must_use]
pub fn config() -> Arc<AuditConfig> {
    AUDIT_CONFIG
        .get()
        .cloned()
        .unwrap_or_else(|| Arc::new(AuditConfig::default()))
}

/// Redact an address, keeping the domain for aggregate analysis.
#[must_use]
pub fn redact_email(email: &str, redact: bool) -> String {
    if !redact {
        return email.to_string();
    }

    email
        .rsplit_once('@')
        .map_or_else(|| "[REDACTED]".to_string(), |(_, domain)| format!("[REDACTED]@{domain}"))
}

fn error_text(error: &str, config: &AuditConfig) -> String {
    if config.redact_errors {
        "[REDACTED]".to_string()
    } else {
        error.to_string()
    }
}

/// `recipient` is the display form of the recipient (`direct:addr`, `user:42`).
pub fn log_enqueued(message_id: u64, recipient: &str, size: usize) {
    let config = config();
    if !config.enabled {
        return;
    }

    tracing::event!(
        tracing::Level::INFO,
        event = "Enqueued",
        message_id,
        recipient = %redact_email(recipient, config.redact_recipients),
        size,
        "Audit: Message enqueued"
    );
}

pub fn log_delivery_attempt(message_id: u64, provider: &str, address: &str, attempt: u32) {
    let config = config();
    if !config.enabled {
        return;
    }

    tracing::event!(
        tracing::Level::INFO,
        event = "DeliveryAttempt",
        message_id,
        provider = %provider,
        address = %redact_email(address, config.redact_recipients),
        delivery_attempt = attempt,
        "Audit: Delivery attempt"
    );
}

pub fn log_delivery_success(message_id: u64, provider: &str, address: &str, duration_ms: u128) {
    let config = config();
    if !config.enabled {
        return;
    }

    tracing::event!(
        tracing::Level::INFO,
        event = "DeliverySuccess",
        message_id,
        provider = %provider,
        address = %redact_email(address, config.redact_recipients),
        duration_ms,
        "Audit: Delivery successful"
    );
}

pub fn log_delivery_retry(message_id: u64, error: &str, error_count: u32, threshold: u32) {
    let config = config();
    if !config.enabled {
        return;
    }

    tracing::event!(
        tracing::Level::WARN,
        event = "DeliveryRetry",
        message_id,
        error = %error_text(error, &config),
        error_count,
        retry_threshold = threshold,
        "Audit: Delivery failed, will retry"
    );
}

/// `reason` is one of `exhausted`, `permanent` or `unresolved`.
pub fn log_dead_lettered(message_id: u64, sink: &str, reason: &str, error: &str) {
    let config = config();
    if !config.enabled {
        return;
    }

    tracing::event!(
        tracing::Level::WARN,
        event = "DeadLettered",
        message_id,
        sink = %sink,
        reason = %reason,
        error = %error_text(error, &config),
        "Audit: Message dead-lettered"
    );
}

pub fn log_resent(original_id: u64, new_id: u64, source: &str) {
    let config = config();
    if !config.enabled {
        return;
    }

    tracing::event!(
        tracing::Level::INFO,
        event = "Resent",
        original_id,
        new_id,
        source = %source,
        "Audit: Message resent"
    );
}

pub fn log_deleted(message_id: u64, source: &str) {
    let config = config();
    if !config.enabled {
        return;
    }

    tracing::event!(
        tracing::Level::INFO,
        event = "Deleted",
        message_id,
        source = %source,
        "Audit: Message deleted"
    );
}
