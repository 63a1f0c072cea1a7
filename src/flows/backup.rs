// Backup token regeneration and backup device removal

use crate::config::TwoFactorConfig;
use crate::error::FlowError;
use crate::models::device::BACKUP_DEVICE_NAME;
use crate::otp::random_token;
use crate::storage::{DeviceStore, StoreError};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Single-step regeneration of a user's backup tokens
pub struct BackupTokens {
    store: Arc<dyn DeviceStore>,
    config: TwoFactorConfig,
}

impl BackupTokens {
    pub fn new(store: Arc<dyn DeviceStore>, config: TwoFactorConfig) -> Self {
        Self { store, config }
    }

    /// Replace the user's backup tokens wholesale: every existing token
    /// is deleted and a fresh set is generated. Returns the plaintext
    /// tokens for one-time display.
    pub async fn regenerate(&self, user_id: Uuid) -> Result<Vec<String>, FlowError> {
        let (device, created) = self
            .store
            .get_or_create_static_device(user_id, BACKUP_DEVICE_NAME)
            .await?;

        if !created {
            self.store.clear_tokens(device.id()).await?;
        }

        let mut tokens = Vec::with_capacity(self.config.backup_token_count);
        for _ in 0..self.config.backup_token_count {
            let token = random_token();
            self.store.create_token(device.id(), &token).await?;
            tokens.push(token);
        }

        info!(
            "Regenerated {} backup tokens for user {}",
            tokens.len(),
            user_id
        );
        Ok(tokens)
    }

    /// How many unconsumed backup tokens the user has left
    pub async fn remaining(&self, user_id: Uuid) -> Result<usize, FlowError> {
        let (device, _) = self
            .store
            .get_or_create_static_device(user_id, BACKUP_DEVICE_NAME)
            .await?;
        Ok(self.store.list_tokens(device.id()).await?.len())
    }
}

/// Deletion of backup devices, scoped to the requesting user
pub struct DeviceRemoval {
    store: Arc<dyn DeviceStore>,
}

impl DeviceRemoval {
    pub fn new(store: Arc<dyn DeviceStore>) -> Self {
        Self { store }
    }

    /// Delete a backup device owned by `user_id`. Devices owned by
    /// someone else or not named as backups are reported as not found,
    /// never deleted.
    pub async fn remove_backup_device(
        &self,
        user_id: Uuid,
        device_id: Uuid,
    ) -> Result<(), FlowError> {
        let device = self
            .store
            .get_device(device_id)
            .await?
            .ok_or(FlowError::Store(StoreError::NotFound))?;

        if device.user_id() != user_id || device.name() != BACKUP_DEVICE_NAME {
            warn!(
                "Refused deletion of device {} requested by user {}",
                device_id, user_id
            );
            return Err(FlowError::Store(StoreError::NotFound));
        }

        self.store.delete_device(device_id).await?;
        info!("User {} removed backup device {}", user_id, device_id);
        Ok(())
    }
}
