// Second-factor device variants
// Devices are persisted only at flow completion; a PhoneDevice may exist
// transiently in memory during its own enrollment

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Name of the device that answers login challenges by default.
/// A user with a device under this name has two-factor enabled.
pub const DEFAULT_DEVICE_NAME: &str = "default";

/// Name given to backup phone and static token devices
pub const BACKUP_DEVICE_NAME: &str = "backup";

/// Out-of-band delivery method for phone devices
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PhoneMethod {
    Call,
    Sms,
}

impl PhoneMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhoneMethod::Call => "call",
            PhoneMethod::Sms => "sms",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "call" => Some(PhoneMethod::Call),
            "sms" => Some(PhoneMethod::Sms),
            _ => None,
        }
    }
}

/// Token-generator device holding a shared secret
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneratorDevice {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    /// Hex-encoded shared key, 20 bytes of entropy
    pub key: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Phone device receiving codes by call or text message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhoneDevice {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub number: String,
    pub method: PhoneMethod,
    /// Hex-encoded key the delivered codes are derived from
    pub key: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Device owning a set of single-use backup tokens.
/// The token set itself lives in the datastore.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StaticDevice {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Device variant tag
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Generator,
    Phone,
    Static,
}

/// A user's second-factor device
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Device {
    Generator(GeneratorDevice),
    Phone(PhoneDevice),
    Static(StaticDevice),
}

impl Device {
    pub fn id(&self) -> Uuid {
        match self {
            Device::Generator(d) => d.id,
            Device::Phone(d) => d.id,
            Device::Static(d) => d.id,
        }
    }

    pub fn user_id(&self) -> Uuid {
        match self {
            Device::Generator(d) => d.user_id,
            Device::Phone(d) => d.user_id,
            Device::Static(d) => d.user_id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Device::Generator(d) => &d.name,
            Device::Phone(d) => &d.name,
            Device::Static(d) => &d.name,
        }
    }

    pub fn kind(&self) -> DeviceKind {
        match self {
            Device::Generator(_) => DeviceKind::Generator,
            Device::Phone(_) => DeviceKind::Phone,
            Device::Static(_) => DeviceKind::Static,
        }
    }

    pub fn as_phone(&self) -> Option<&PhoneDevice> {
        match self {
            Device::Phone(d) => Some(d),
            _ => None,
        }
    }

    /// Display summary for rendering contexts (never exposes keys)
    pub fn summary(&self) -> DeviceSummary {
        let detail = match self {
            Device::Generator(_) => "token generator".to_string(),
            Device::Phone(d) => format!("{} {}", d.method.as_str(), mask_number(&d.number)),
            Device::Static(_) => "backup tokens".to_string(),
        };
        DeviceSummary {
            id: self.id(),
            name: self.name().to_string(),
            kind: self.kind(),
            detail,
        }
    }
}

/// Creation payload handed to the datastore at flow completion
#[derive(Debug, Clone)]
pub enum NewDevice {
    Generator {
        name: String,
        key: String,
    },
    Phone {
        name: String,
        number: String,
        method: PhoneMethod,
        key: String,
    },
    Static {
        name: String,
    },
}

impl NewDevice {
    pub fn name(&self) -> &str {
        match self {
            NewDevice::Generator { name, .. } => name,
            NewDevice::Phone { name, .. } => name,
            NewDevice::Static { name } => name,
        }
    }
}

/// Device information for display (without revealing secrets)
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DeviceSummary {
    pub id: Uuid,
    pub name: String,
    pub kind: DeviceKind,
    pub detail: String,
}

/// Keep only the last few digits of a phone number for display
fn mask_number(number: &str) -> String {
    let digits: Vec<char> = number.chars().collect();
    if digits.len() <= 4 {
        return number.to_string();
    }
    let visible: String = digits[digits.len() - 4..].iter().collect();
    format!("{}{}", "*".repeat(digits.len() - 4), visible)
}
