// Time-based One-Time Password (TOTP) verification
// RFC 6238 compliant, with a configurable skew window for clock drift

use std::time::{SystemTime, UNIX_EPOCH};
use totp_lite::{Sha1, totp_custom};
use tracing::{debug, warn};

/// TOTP configuration
#[derive(Debug, Clone)]
pub struct TotpConfig {
    /// Time step in seconds (typically 30)
    pub time_step: u64,
    /// Number of digits in the TOTP code (typically 6)
    pub digits: u32,
    /// Skew tolerance for time drift (how many time steps to check before/after)
    pub skew: u64,
    /// Issuer name shown in authenticator apps
    pub issuer: String,
}

impl Default for TotpConfig {
    fn default() -> Self {
        Self {
            time_step: 30,
            digits: 6,
            skew: 1,
            issuer: "Two Factor".to_string(),
        }
    }
}

/// TOTP computation and verification over a shared key
#[derive(Debug, Clone)]
pub struct Totp {
    config: TotpConfig,
}

impl Totp {
    pub fn new(config: TotpConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TotpConfig {
        &self.config
    }

    /// The code for the current time window, as delivered to phone devices
    pub fn current_code(&self, key: &[u8]) -> String {
        format!(
            "{:0width$}",
            self.code_at(key, self.current_step()),
            width = self.config.digits as usize
        )
    }

    /// Verify a code within the configured skew window
    pub fn verify(&self, key: &[u8], code: &str) -> bool {
        self.verify_with_drift(key, code, self.config.skew)
    }

    /// Verify a code within an explicit drift window.
    /// Phone-delivered codes use a wider window than generator codes.
    pub fn verify_with_drift(&self, key: &[u8], code: &str, drift: u64) -> bool {
        let code = code.trim();
        if code.len() != self.config.digits as usize {
            return false;
        }

        let code_num = match code.parse::<u32>() {
            Ok(n) => n,
            Err(_) => return false,
        };

        let current_step = self.current_step();

        // Check the current time step and adjacent steps for drift tolerance
        for skew in -(drift as i64)..=(drift as i64) {
            let step = current_step as i64 + skew;
            if step < 0 {
                continue;
            }

            if self.code_at(key, step as u64) == code_num {
                debug!("TOTP code verified with skew {}", skew);
                return true;
            }
        }

        debug!("TOTP code verification failed");
        false
    }

    fn current_step(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        now / self.config.time_step
    }

    fn code_at(&self, key: &[u8], time_step: u64) -> u32 {
        let code_str = totp_custom::<Sha1>(self.config.time_step, self.config.digits, key, time_step);
        code_str.parse::<u32>().unwrap_or(0)
    }
}

/// Build the otpauth:// URI encoded into a QR code for generator enrollment.
/// The shared key is carried base32-encoded, as authenticator apps expect.
pub fn otpauth_url(account: &str, key: &[u8], config: &TotpConfig) -> String {
    format!(
        "otpauth://totp/{}?secret={}&issuer={}&digits={}&period={}",
        urlencoding::encode(account),
        base32_encode(key),
        urlencoding::encode(&config.issuer),
        config.digits,
        config.time_step
    )
}

/// Render QR source data as scannable unicode text
pub fn qr_text(data: &str) -> Result<String, String> {
    let code = qrcode::QrCode::new(data.as_bytes())
        .map_err(|e| format!("Failed to generate QR code: {}", e))?;

    Ok(code.render::<qrcode::render::unicode::Dense1x2>().build())
}

/// Base32 encode (RFC 4648), unpadded as otpauth URIs require
fn base32_encode(data: &[u8]) -> String {
    const ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
    let mut result = String::new();
    let mut buffer = 0u32;
    let mut bits_in_buffer = 0u8;

    for &byte in data {
        buffer = (buffer << 8) | byte as u32;
        bits_in_buffer += 8;

        while bits_in_buffer >= 5 {
            bits_in_buffer -= 5;
            let index = ((buffer >> bits_in_buffer) & 0x1F) as usize;
            result.push(ALPHABET[index] as char);
        }
    }

    if bits_in_buffer > 0 {
        let index = ((buffer << (5 - bits_in_buffer)) & 0x1F) as usize;
        result.push(ALPHABET[index] as char);
    }

    result
}

/// Hex encode, the storage format for device keys
pub fn hex_encode(data: &[u8]) -> String {
    let mut result = String::with_capacity(data.len() * 2);
    for byte in data {
        result.push_str(&format!("{:02x}", byte));
    }
    result
}

/// Hex decode a stored device key.
/// Returns None on malformed input; callers treat that as verification failure.
pub fn hex_decode(data: &str) -> Option<Vec<u8>> {
    if data.len() % 2 != 0 {
        warn!("Hex key has odd length");
        return None;
    }

    let mut result = Vec::with_capacity(data.len() / 2);
    let bytes = data.as_bytes();
    for chunk in bytes.chunks(2) {
        let pair = std::str::from_utf8(chunk).ok()?;
        match u8::from_str_radix(pair, 16) {
            Ok(byte) => result.push(byte),
            Err(_) => {
                warn!("Hex key contains invalid characters");
                return None;
            }
        }
    }
    Some(result)
}
