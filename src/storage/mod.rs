// Datastore capability consumed by the flows
// Accounts, devices and backup tokens; pluggable backends

pub mod memory;

use crate::models::{Device, NewDevice, User};
use async_trait::async_trait;
use uuid::Uuid;

/// Storage errors
#[derive(Debug, Clone)]
pub enum StoreError {
    NotFound,
    ConnectionError(String),
    InvalidData(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound => write!(f, "Item not found"),
            StoreError::ConnectionError(msg) => write!(f, "Connection error: {}", msg),
            StoreError::InvalidData(msg) => write!(f, "Invalid data: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

/// Backend trait for users, devices and backup tokens
#[async_trait]
pub trait DeviceStore: Send + Sync {
    // User operations
    /// Check a username/password pair against stored credentials
    async fn verify_credentials(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<User>, StoreError>;

    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>, StoreError>;

    // Device operations
    /// The device that answers login challenges for this user, if any.
    /// Its presence is what "two-factor enabled" means.
    async fn default_device(&self, user_id: Uuid) -> Result<Option<Device>, StoreError>;

    /// Backup phone devices enrolled as alternates for login challenges
    async fn backup_phones(&self, user_id: Uuid) -> Result<Vec<Device>, StoreError>;

    async fn get_device(&self, device_id: Uuid) -> Result<Option<Device>, StoreError>;

    /// Create a device for a user. Creating a device under the default
    /// name replaces any existing default, so a read-then-act race ends
    /// with a single default device.
    async fn create_device(&self, user_id: Uuid, new: NewDevice) -> Result<Device, StoreError>;

    async fn delete_device(&self, device_id: Uuid) -> Result<(), StoreError>;

    /// The user's static token device under `name`, if one exists
    async fn static_device(
        &self,
        user_id: Uuid,
        name: &str,
    ) -> Result<Option<Device>, StoreError>;

    /// Fetch the user's static token device under `name`, creating it if
    /// missing. The flag reports whether a new device was created.
    async fn get_or_create_static_device(
        &self,
        user_id: Uuid,
        name: &str,
    ) -> Result<(Device, bool), StoreError>;

    // Token operations on static devices
    async fn list_tokens(&self, device_id: Uuid) -> Result<Vec<String>, StoreError>;

    async fn create_token(&self, device_id: Uuid, token: &str) -> Result<(), StoreError>;

    /// Delete `token` from the device's unconsumed set.
    /// Returns whether the token was present (and is now consumed).
    async fn consume_token(&self, device_id: Uuid, token: &str) -> Result<bool, StoreError>;

    async fn clear_tokens(&self, device_id: Uuid) -> Result<(), StoreError>;
}
