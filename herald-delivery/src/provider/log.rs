use async_trait::async_trait;
use herald_common::internal;

use super::Provider;
use crate::{error::DeliveryError, headers::MessageHeaders, settings::Settings};

/// Records deliveries in the log and reports success.
#[derive(Debug, Clone, Default)]
pub struct LogProvider;

impl LogProvider {
    #[must_use]
    pub const fn from_settings(_settings: &Settings) -> Self {
        Self
    }
}

#[async_trait]
impl Provider for LogProvider {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, address: &str, body: &str) -> Result<(), DeliveryError> {
        let headers = MessageHeaders::parse(body);
        internal!(
            level = INFO,
            address,
            subject = headers.subject.as_deref().unwrap_or_default(),
            size = body.len(),
            "Delivered to log"
        );
        Ok(())
    }
}
