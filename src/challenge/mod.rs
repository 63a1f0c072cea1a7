// Device challenge protocol
// Uniform generate/verify interface over the heterogeneous device variants

use crate::config::TwoFactorConfig;
use crate::delivery::CodeDelivery;
use crate::error::FlowError;
use crate::models::{Device, PhoneDevice};
use crate::otp::{Totp, hex_decode};
use crate::storage::DeviceStore;
use std::sync::Arc;
use tracing::{debug, warn};

/// Challenges devices and checks submitted tokens.
/// Verification failure is a `false` return, never an error; only the
/// challenge side can fail (delivery, datastore).
pub struct Challenger {
    store: Arc<dyn DeviceStore>,
    delivery: Arc<dyn CodeDelivery>,
    totp: Totp,
    phone_code_drift: u64,
}

impl Challenger {
    pub fn new(
        store: Arc<dyn DeviceStore>,
        delivery: Arc<dyn CodeDelivery>,
        config: &TwoFactorConfig,
    ) -> Self {
        Self {
            store,
            delivery,
            totp: Totp::new(config.totp.clone()),
            phone_code_drift: config.phone_code_drift,
        }
    }

    /// Prepare a challenge for the device. Generator and static devices
    /// need no delivery; phone devices get the current code sent out of
    /// band.
    pub async fn generate_challenge(&self, device: &Device) -> Result<(), FlowError> {
        match device {
            Device::Generator(_) | Device::Static(_) => Ok(()),
            Device::Phone(phone) => self.deliver_phone_code(phone).await,
        }
    }

    /// Check a submitted token against the device
    pub async fn verify(&self, device: &Device, token: &str) -> Result<bool, FlowError> {
        let verified = match device {
            Device::Generator(generator) => {
                let key = match hex_decode(&generator.key) {
                    Some(key) => key,
                    None => {
                        warn!("Generator device {} has a malformed key", generator.id);
                        return Ok(false);
                    }
                };
                self.totp.verify(&key, token)
            }
            Device::Phone(phone) => self.verify_phone_code(phone, token),
            Device::Static(static_device) => {
                // Membership check with delete-on-match: single use
                self.store
                    .consume_token(static_device.id, token.trim())
                    .await?
            }
        };

        debug!(
            "Token verification on {:?} device {}: {}",
            device.kind(),
            device.id(),
            verified
        );
        Ok(verified)
    }

    /// Derive the current code from the phone device's own key and hand
    /// it to the delivery channel. Works identically for persisted
    /// devices and the transient device rebuilt during enrollment.
    async fn deliver_phone_code(&self, phone: &PhoneDevice) -> Result<(), FlowError> {
        let key = hex_decode(&phone.key)
            .ok_or_else(|| FlowError::Delivery("phone device has a malformed key".to_string()))?;

        let code = self.totp.current_code(&key);
        self.delivery
            .deliver_code(&phone.number, phone.method, &code)
            .await
            .map_err(|e| FlowError::Delivery(e.to_string()))
    }

    fn verify_phone_code(&self, phone: &PhoneDevice, token: &str) -> bool {
        let key = match hex_decode(&phone.key) {
            Some(key) => key,
            None => {
                warn!("Phone device {} has a malformed key", phone.id);
                return false;
            }
        };
        // Wider drift than generator devices, covering delivery latency
        self.totp.verify_with_drift(&key, token, self.phone_code_drift)
    }
}
