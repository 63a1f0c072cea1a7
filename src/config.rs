// Configuration for the two-factor flows

use crate::otp::TotpConfig;

/// Top-level configuration shared by all flows
#[derive(Debug, Clone)]
pub struct TwoFactorConfig {
    /// Site name used in otpauth URIs and generator account labels
    pub site_name: String,
    /// Where completed login and enrollment flows send the user
    pub login_redirect_url: String,
    /// Cancel target offered during login verification
    pub logout_url: String,
    /// Redirect target when enrollment is already complete
    pub setup_complete_url: String,
    /// Number of backup tokens issued per regeneration
    pub backup_token_count: usize,
    /// TOTP parameters for generator devices
    pub totp: TotpConfig,
    /// Extra time steps accepted for phone-delivered codes, sized to
    /// out-of-band delivery latency
    pub phone_code_drift: u64,
}

impl Default for TwoFactorConfig {
    fn default() -> Self {
        Self {
            site_name: "example.com".to_string(),
            login_redirect_url: "/".to_string(),
            logout_url: "/logout".to_string(),
            setup_complete_url: "/two-factor/setup/complete".to_string(),
            backup_token_count: 10,
            totp: TotpConfig::default(),
            phone_code_drift: 6, // 3 minutes of 30-second steps
        }
    }
}
