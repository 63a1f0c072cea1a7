// Random key and backup-token generation

use rand::Rng;

use super::totp::hex_encode;

/// Bytes of entropy in a freshly generated device key
const KEY_BYTES: usize = 20;

/// Generate a hex-encoded random device key with 20 bytes of entropy
pub fn random_hex_key() -> String {
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..KEY_BYTES).map(|_| rng.r#gen::<u8>()).collect();
    hex_encode(&bytes)
}

/// Generate a single-use backup token.
/// Nine digits, zero-padded, matching what users expect to type from a
/// printed recovery sheet.
pub fn random_token() -> String {
    let mut rng = rand::thread_rng();
    let code: u64 = rng.gen_range(100000000..999999999);
    format!("{:09}", code)
}
