// In-memory datastore backend
// Thread-safe maps behind RwLock, the reference implementation for tests

use super::{DeviceStore, StoreError};
use crate::models::device::DEFAULT_DEVICE_NAME;
use crate::models::{Device, GeneratorDevice, NewDevice, PhoneDevice, StaticDevice, User};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

/// In-memory device store
pub struct MemoryDeviceStore {
    users: Arc<RwLock<HashMap<Uuid, User>>>,
    devices: Arc<RwLock<HashMap<Uuid, Device>>>,
    /// Unconsumed backup tokens per static device
    tokens: Arc<RwLock<HashMap<Uuid, Vec<String>>>>,
}

impl MemoryDeviceStore {
    pub fn new() -> Self {
        Self {
            users: Arc::new(RwLock::new(HashMap::new())),
            devices: Arc::new(RwLock::new(HashMap::new())),
            tokens: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a user with a bcrypt-hashed password
    pub async fn add_user(&self, username: &str, email: &str, password: &str) -> Result<User, StoreError> {
        let password_hash = bcrypt::hash(password, bcrypt::DEFAULT_COST)
            .map_err(|e| StoreError::InvalidData(format!("Failed to hash password: {}", e)))?;

        let user = User {
            id: Uuid::new_v4(),
            username: username.to_string(),
            email: email.to_string(),
            password_hash,
            created_at: Utc::now(),
        };

        let mut users = self.users.write().await;
        users.insert(user.id, user.clone());
        info!("Registered user {}", user.username);
        Ok(user)
    }
}

impl Default for MemoryDeviceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceStore for MemoryDeviceStore {
    async fn verify_credentials(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<User>, StoreError> {
        let users = self.users.read().await;

        let user = users.values().find(|u| u.username == username);
        let user = match user {
            Some(user) => user,
            None => {
                debug!("Unknown username '{}'", username);
                return Ok(None);
            }
        };

        let valid = bcrypt::verify(password, &user.password_hash)
            .map_err(|e| StoreError::InvalidData(format!("Failed to verify password: {}", e)))?;

        if valid {
            Ok(Some(user.clone()))
        } else {
            debug!("Password mismatch for '{}'", username);
            Ok(None)
        }
    }

    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>, StoreError> {
        let users = self.users.read().await;
        Ok(users.get(&user_id).cloned())
    }

    async fn default_device(&self, user_id: Uuid) -> Result<Option<Device>, StoreError> {
        let devices = self.devices.read().await;
        Ok(devices
            .values()
            .find(|d| d.user_id() == user_id && d.name() == DEFAULT_DEVICE_NAME)
            .cloned())
    }

    async fn backup_phones(&self, user_id: Uuid) -> Result<Vec<Device>, StoreError> {
        let devices = self.devices.read().await;
        let mut phones: Vec<Device> = devices
            .values()
            .filter(|d| {
                d.user_id() == user_id
                    && d.as_phone().is_some()
                    && d.name() != DEFAULT_DEVICE_NAME
            })
            .cloned()
            .collect();

        // Stable order for rendering
        phones.sort_by_key(|d| d.id());
        Ok(phones)
    }

    async fn get_device(&self, device_id: Uuid) -> Result<Option<Device>, StoreError> {
        let devices = self.devices.read().await;
        Ok(devices.get(&device_id).cloned())
    }

    async fn create_device(&self, user_id: Uuid, new: NewDevice) -> Result<Device, StoreError> {
        let mut devices = self.devices.write().await;

        // A user has at most one default device; replacing inside the
        // write lock keeps a racing enrollment from leaving two behind.
        if new.name() == DEFAULT_DEVICE_NAME {
            let previous: Vec<Uuid> = devices
                .values()
                .filter(|d| d.user_id() == user_id && d.name() == DEFAULT_DEVICE_NAME)
                .map(|d| d.id())
                .collect();
            for id in previous {
                debug!("Replacing previous default device {}", id);
                devices.remove(&id);
            }
        }

        let id = Uuid::new_v4();
        let now = Utc::now();
        let device = match new {
            NewDevice::Generator { name, key } => Device::Generator(GeneratorDevice {
                id,
                user_id,
                name,
                key,
                created_at: now,
            }),
            NewDevice::Phone {
                name,
                number,
                method,
                key,
            } => Device::Phone(PhoneDevice {
                id,
                user_id,
                name,
                number,
                method,
                key,
                created_at: now,
            }),
            NewDevice::Static { name } => Device::Static(StaticDevice {
                id,
                user_id,
                name,
                created_at: now,
            }),
        };

        devices.insert(id, device.clone());
        info!("Created {:?} device {} for user {}", device.kind(), id, user_id);
        Ok(device)
    }

    async fn delete_device(&self, device_id: Uuid) -> Result<(), StoreError> {
        let mut devices = self.devices.write().await;

        if devices.remove(&device_id).is_none() {
            return Err(StoreError::NotFound);
        }

        let mut tokens = self.tokens.write().await;
        tokens.remove(&device_id);

        info!("Deleted device {}", device_id);
        Ok(())
    }

    async fn static_device(
        &self,
        user_id: Uuid,
        name: &str,
    ) -> Result<Option<Device>, StoreError> {
        let devices = self.devices.read().await;
        Ok(devices
            .values()
            .find(|d| {
                d.user_id() == user_id && d.name() == name && matches!(d, Device::Static(_))
            })
            .cloned())
    }

    async fn get_or_create_static_device(
        &self,
        user_id: Uuid,
        name: &str,
    ) -> Result<(Device, bool), StoreError> {
        let mut devices = self.devices.write().await;

        let existing = devices
            .values()
            .find(|d| {
                d.user_id() == user_id
                    && d.name() == name
                    && matches!(d, Device::Static(_))
            })
            .cloned();

        if let Some(device) = existing {
            return Ok((device, false));
        }

        let device = Device::Static(StaticDevice {
            id: Uuid::new_v4(),
            user_id,
            name: name.to_string(),
            created_at: Utc::now(),
        });
        devices.insert(device.id(), device.clone());
        info!("Created static device '{}' for user {}", name, user_id);
        Ok((device, true))
    }

    async fn list_tokens(&self, device_id: Uuid) -> Result<Vec<String>, StoreError> {
        let tokens = self.tokens.read().await;
        Ok(tokens.get(&device_id).cloned().unwrap_or_default())
    }

    async fn create_token(&self, device_id: Uuid, token: &str) -> Result<(), StoreError> {
        let devices = self.devices.read().await;
        if !devices.contains_key(&device_id) {
            return Err(StoreError::NotFound);
        }
        drop(devices);

        let mut tokens = self.tokens.write().await;
        tokens
            .entry(device_id)
            .or_insert_with(Vec::new)
            .push(token.to_string());
        Ok(())
    }

    async fn consume_token(&self, device_id: Uuid, token: &str) -> Result<bool, StoreError> {
        let mut tokens = self.tokens.write().await;

        let set = match tokens.get_mut(&device_id) {
            Some(set) => set,
            None => return Ok(false),
        };

        if let Some(pos) = set.iter().position(|t| t == token) {
            set.remove(pos);
            info!("Consumed backup token on device {}", device_id);
            Ok(true)
        } else {
            debug!("Backup token not found on device {}", device_id);
            Ok(false)
        }
    }

    async fn clear_tokens(&self, device_id: Uuid) -> Result<(), StoreError> {
        let mut tokens = self.tokens.write().await;
        tokens.remove(&device_id);
        Ok(())
    }
}
