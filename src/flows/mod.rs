// Concrete flows built on the wizard engine

pub mod backup;
pub mod login;
pub mod phone;
pub mod setup;

pub use backup::{BackupTokens, DeviceRemoval};
pub use login::{LoginController, LoginFlow, LoginOutcome};
pub use phone::{PhoneSetupController, PhoneSetupFlow, PhoneSetupOutcome};
pub use setup::{SetupController, SetupFlow, SetupOutcome};
