// One-time password algorithm capability
// RFC 6238 TOTP plus the key and backup-token generators used by the flows

pub mod tokens;
pub mod totp;

pub use tokens::{random_hex_key, random_token};
pub use totp::{Totp, TotpConfig, hex_decode, hex_encode, otpauth_url, qr_text};
