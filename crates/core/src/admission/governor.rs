use tracing::warn;

use crate::errors::GatewayError;

const WARN_RATIO_PERCENT: usize = 80;

/// Checks a response's byte length before it is flushed to the client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResponseSizeGovernor {
    limit: usize,
}

impl ResponseSizeGovernor {
    pub fn new(limit: usize) -> Self {
        Self { limit }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn check(&self, size: usize, correlation_id: &str) -> Result<(), GatewayError> {
        if size > self.limit {
            warn!(
                event_name = "admission.response.too_large",
                correlation_id,
                size,
                limit = self.limit,
                "response exceeds configured size limit"
            );
            return Err(GatewayError::ResponseTooLarge { size, limit: self.limit });
        }

        if size.saturating_mul(100) > self.limit.saturating_mul(WARN_RATIO_PERCENT) {
            warn!(
                event_name = "admission.response.near_limit",
                correlation_id,
                size,
                limit = self.limit,
                "response is close to the configured size limit"
            );
        }

        Ok(())
    }
}
