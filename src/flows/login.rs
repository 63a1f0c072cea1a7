// Login verification flow
// Primary credential check followed by a second-factor challenge against
// the user's default device, with an explicit device-switch affordance

use crate::challenge::Challenger;
use crate::config::TwoFactorConfig;
use crate::delivery::CodeDelivery;
use crate::error::{FlowError, ValidationErrors};
use crate::models::device::BACKUP_DEVICE_NAME;
use crate::models::{Device, PhoneMethod, User};
use crate::storage::DeviceStore;
use crate::wizard::{
    FieldSpec, FormData, FormSchema, Flow, RenderContext, StepData, StepDefinition, StepView,
    SubmitOutcome, WizardEngine, WizardRun,
};
use crate::wizard::store::RunStorage;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

pub const AUTH_STEP: &str = "auth";
pub const TOKEN_STEP: &str = "token";

/// A completed login: the verified user and where to send them
#[derive(Debug)]
pub struct LoginOutcome {
    pub user: User,
    pub redirect_url: String,
}

/// Flow definition for login verification
pub struct LoginFlow {
    store: Arc<dyn DeviceStore>,
    challenger: Challenger,
    config: TwoFactorConfig,
    steps: Vec<StepDefinition>,
}

impl LoginFlow {
    pub fn new(
        store: Arc<dyn DeviceStore>,
        delivery: Arc<dyn CodeDelivery>,
        config: TwoFactorConfig,
    ) -> Self {
        let challenger = Challenger::new(store.clone(), delivery, &config);
        let steps = vec![
            StepDefinition::new(
                AUTH_STEP,
                FormSchema::new(vec![
                    FieldSpec::text("username", 150),
                    FieldSpec::password("password"),
                ]),
            ),
            // Never reuse a cached token validation: back-navigation plus
            // resubmission must re-check the one-time code
            StepDefinition::non_idempotent(
                TOKEN_STEP,
                FormSchema::new(vec![FieldSpec::token("token", 6, 9)]),
            ),
        ];

        Self {
            store,
            challenger,
            config,
            steps,
        }
    }

    /// The user proven by the auth step, reconstructed from validated
    /// step data on every request
    async fn authenticated_user(&self, run: &WizardRun) -> Result<Option<User>, FlowError> {
        let user_id = match run.field(AUTH_STEP, "user_id") {
            Some(value) => value,
            None => return Ok(None),
        };
        let user_id = match Uuid::parse_str(user_id) {
            Ok(id) => id,
            Err(_) => return Ok(None),
        };
        Ok(self.store.get_user(user_id).await?)
    }

    /// The device to challenge: the explicitly chosen backup phone if
    /// one was selected, otherwise the user's default device
    async fn challenge_device(&self, run: &WizardRun) -> Result<Option<Device>, FlowError> {
        let user = match self.authenticated_user(run).await? {
            Some(user) => user,
            None => return Ok(None),
        };

        if let Some(device_id) = run.extra.challenge_device {
            for device in self.store.backup_phones(user.id).await? {
                if device.id() == device_id {
                    return Ok(Some(device));
                }
            }
        }

        Ok(self.store.default_device(user.id).await?)
    }

    fn instructions_for(device: &Device) -> String {
        match device {
            Device::Phone(phone) if phone.method == PhoneMethod::Call => {
                "We are calling your phone right now, please enter the digits you hear."
            }
            Device::Phone(_) => "We sent you a text message, please enter the tokens we sent.",
            _ => "Please enter the tokens generated by your token generator.",
        }
        .to_string()
    }
}

#[async_trait]
impl Flow for LoginFlow {
    type Output = LoginOutcome;

    fn name(&self) -> &'static str {
        "login"
    }

    fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    fn goto_allowlist(&self) -> &'static [&'static str] {
        // The one permitted forward jump: re-entering the token step
        // after switching the challenged device
        &[TOKEN_STEP]
    }

    async fn applies(&self, step: &StepDefinition, run: &WizardRun) -> Result<bool, FlowError> {
        if step.name == TOKEN_STEP {
            let user = match self.authenticated_user(run).await? {
                Some(user) => user,
                None => return Ok(false),
            };
            return Ok(self.store.default_device(user.id).await?.is_some());
        }
        Ok(true)
    }

    async fn validate(
        &self,
        step: &StepDefinition,
        mut cleaned: StepData,
        run: &mut WizardRun,
    ) -> Result<StepData, FlowError> {
        match step.name {
            AUTH_STEP => {
                let username = cleaned.get("username").cloned().unwrap_or_default();
                let password = cleaned.remove("password").unwrap_or_default();

                let user = self
                    .store
                    .verify_credentials(&username, &password)
                    .await?
                    .ok_or_else(|| {
                        FlowError::Validation(ValidationErrors::message(
                            "Please enter a correct username and password.",
                        ))
                    })?;

                // The credential itself never enters run storage; the
                // proven identity does
                cleaned.insert("user_id".to_string(), user.id.to_string());
                run.user_id = Some(user.id);
                Ok(cleaned)
            }
            TOKEN_STEP => {
                let user = self
                    .authenticated_user(run)
                    .await?
                    .ok_or(FlowError::RunExpired)?;
                let device = self.challenge_device(run).await?.ok_or_else(|| {
                    FlowError::validation("No two-factor device is available for your account.")
                })?;

                let token = cleaned.get("token").cloned().unwrap_or_default();
                let mut verified = self.challenger.verify(&device, &token).await?;

                // A single-use backup token is accepted instead of the
                // challenged device's code
                if !verified && !matches!(device, Device::Static(_)) {
                    if let Some(backup) = self
                        .store
                        .static_device(user.id, BACKUP_DEVICE_NAME)
                        .await?
                    {
                        verified = self.challenger.verify(&backup, &token).await?;
                    }
                }

                if !verified {
                    return Err(FlowError::validation("Entered token is not valid."));
                }
                Ok(cleaned)
            }
            _ => Ok(cleaned),
        }
    }

    async fn enter(
        &self,
        step: &StepDefinition,
        run: &mut WizardRun,
        _advancing: bool,
    ) -> Result<RenderContext, FlowError> {
        let mut context = RenderContext {
            cancel_url: Some(self.config.logout_url.clone()),
            ..RenderContext::default()
        };

        if step.name == TOKEN_STEP {
            let device = self.challenge_device(run).await?.ok_or_else(|| {
                FlowError::validation("No two-factor device is available for your account.")
            })?;

            // Every display of the token step issues a fresh challenge
            self.challenger.generate_challenge(&device).await?;

            context.instructions = Some(Self::instructions_for(&device));

            if let Some(user) = self.authenticated_user(run).await? {
                context.other_devices = self
                    .store
                    .backup_phones(user.id)
                    .await?
                    .iter()
                    .filter(|d| d.id() != device.id())
                    .map(|d| d.summary())
                    .collect();
            }
        }

        Ok(context)
    }

    async fn done(&self, run: &WizardRun) -> Result<LoginOutcome, FlowError> {
        let user = self
            .authenticated_user(run)
            .await?
            .ok_or(FlowError::RunExpired)?;

        info!("User {} passed login verification", user.username);
        Ok(LoginOutcome {
            user,
            redirect_url: self.config.login_redirect_url.clone(),
        })
    }
}

/// Login verification entry point: the engine plus the device-switch
/// action that precedes the allow-listed jump to the token step
pub struct LoginController {
    engine: WizardEngine<LoginFlow>,
    store: Arc<dyn DeviceStore>,
    runs: Arc<dyn RunStorage>,
}

impl LoginController {
    pub fn new(
        store: Arc<dyn DeviceStore>,
        delivery: Arc<dyn CodeDelivery>,
        runs: Arc<dyn RunStorage>,
        config: TwoFactorConfig,
    ) -> Self {
        let flow = LoginFlow::new(store.clone(), delivery, config);
        Self {
            engine: WizardEngine::new(flow, runs.clone()),
            store,
            runs,
        }
    }

    pub fn engine(&self) -> &WizardEngine<LoginFlow> {
        &self.engine
    }

    pub async fn begin(&self, session_id: &str) -> Result<SubmitOutcome<LoginOutcome>, FlowError> {
        self.engine.begin(session_id).await
    }

    pub async fn current(&self, session_id: &str) -> Result<StepView, FlowError> {
        self.engine.current(session_id).await
    }

    pub async fn submit(
        &self,
        session_id: &str,
        step: &str,
        input: &FormData,
    ) -> Result<SubmitOutcome<LoginOutcome>, FlowError> {
        self.engine.submit(session_id, step, input).await
    }

    /// Reassign which device is challenged, then re-enter the token
    /// step. Ids that are not among the user's backup phones fall back
    /// to the default device.
    pub async fn switch_device(
        &self,
        session_id: &str,
        device_id: Uuid,
    ) -> Result<StepView, FlowError> {
        let mut run = self
            .runs
            .load(session_id)
            .await?
            .ok_or(FlowError::RunExpired)?;
        if run.flow != self.engine.flow().name() || run.completed {
            return Err(FlowError::RunExpired);
        }

        let chosen = match self.engine.flow().authenticated_user(&run).await? {
            Some(user) => self
                .store
                .backup_phones(user.id)
                .await?
                .into_iter()
                .find(|d| d.id() == device_id)
                .map(|d| d.id()),
            None => None,
        };

        run.extra.challenge_device = chosen;
        self.runs.save(session_id, &run).await?;

        self.engine.goto(session_id, TOKEN_STEP).await
    }

    pub async fn abandon(&self, session_id: &str) -> Result<(), FlowError> {
        self.engine.abandon(session_id).await
    }
}
