// Multi-step two-factor authentication flows
// Wizard engine plus login, enrollment and backup-code flow controllers

pub mod challenge;
pub mod config;
pub mod delivery;
pub mod error;
pub mod flows;
pub mod models;
pub mod otp;
pub mod storage;
pub mod wizard;
