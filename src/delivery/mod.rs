// Out-of-band code delivery capability
// Real deployments plug in an SMS/voice gateway; the in-memory
// implementations here back development and tests

use crate::models::PhoneMethod;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Errors raised by a delivery channel
#[derive(Debug, Clone)]
pub enum DeliveryError {
    /// The channel rejected the destination number
    InvalidNumber(String),
    /// The channel itself failed
    ChannelError(String),
}

impl std::fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryError::InvalidNumber(number) => {
                write!(f, "Invalid phone number: {}", number)
            }
            DeliveryError::ChannelError(msg) => write!(f, "Delivery channel error: {}", msg),
        }
    }
}

impl std::error::Error for DeliveryError {}

/// Capability for delivering one-time codes to a phone
#[async_trait]
pub trait CodeDelivery: Send + Sync {
    /// Deliver `code` to `number` by the given method
    async fn deliver_code(
        &self,
        number: &str,
        method: PhoneMethod,
        code: &str,
    ) -> Result<(), DeliveryError>;
}

/// Delivery backend that only logs, for development
pub struct LoggedDelivery;

#[async_trait]
impl CodeDelivery for LoggedDelivery {
    async fn deliver_code(
        &self,
        number: &str,
        method: PhoneMethod,
        code: &str,
    ) -> Result<(), DeliveryError> {
        info!("Fake delivery of {} to {} by {}", code, number, method.as_str());
        Ok(())
    }
}

/// A code handed to the delivery channel
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveredCode {
    pub number: String,
    pub method: PhoneMethod,
    pub code: String,
}

/// Delivery backend that records every code, for tests
#[derive(Default)]
pub struct RecordingDelivery {
    sent: Arc<RwLock<Vec<DeliveredCode>>>,
}

impl RecordingDelivery {
    pub fn new() -> Self {
        Self::default()
    }

    /// All codes delivered so far, oldest first
    pub async fn sent(&self) -> Vec<DeliveredCode> {
        self.sent.read().await.clone()
    }

    /// The most recently delivered code, if any
    pub async fn last(&self) -> Option<DeliveredCode> {
        self.sent.read().await.last().cloned()
    }
}

#[async_trait]
impl CodeDelivery for RecordingDelivery {
    async fn deliver_code(
        &self,
        number: &str,
        method: PhoneMethod,
        code: &str,
    ) -> Result<(), DeliveryError> {
        let mut sent = self.sent.write().await;
        sent.push(DeliveredCode {
            number: number.to_string(),
            method,
            code: code.to_string(),
        });
        Ok(())
    }
}

/// Delivery backend that always fails, for exercising failure handling
pub struct FailingDelivery;

#[async_trait]
impl CodeDelivery for FailingDelivery {
    async fn deliver_code(
        &self,
        _number: &str,
        _method: PhoneMethod,
        _code: &str,
    ) -> Result<(), DeliveryError> {
        Err(DeliveryError::ChannelError("gateway unreachable".to_string()))
    }
}
