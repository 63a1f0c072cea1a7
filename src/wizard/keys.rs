// Per-run secret lifecycle
// Generates and pins ephemeral keys so a secret shown on one step is the
// same secret verified on the next

use super::run::WizardRun;
use crate::otp::random_hex_key;
use tracing::debug;

/// Return the run's key for `slot`, generating it on first use.
/// The key is stable for the lifetime of the run and never outlives it
/// unless the flow's completion commits it into a device.
pub fn get_or_create(run: &mut WizardRun, slot: &str) -> String {
    if let Some(key) = run.extra.keys.get(slot) {
        return key.clone();
    }

    let key = random_hex_key();
    run.extra.keys.insert(slot.to_string(), key.clone());
    debug!("Generated key for slot '{}' on run {}", slot, run.id);
    key
}
