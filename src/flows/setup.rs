// Generator device enrollment flow
// Shows a QR-encodable otpauth URI for a freshly generated key and only
// persists the device once the user proves possession with a valid code

use crate::challenge::Challenger;
use crate::config::TwoFactorConfig;
use crate::delivery::CodeDelivery;
use crate::error::FlowError;
use crate::models::device::DEFAULT_DEVICE_NAME;
use crate::models::{Device, GeneratorDevice, NewDevice};
use crate::otp::{hex_decode, otpauth_url, qr_text};
use crate::storage::DeviceStore;
use crate::wizard::store::RunStorage;
use crate::wizard::{
    FieldSpec, Flow, FormData, FormSchema, RenderContext, StepData, StepDefinition, StepView,
    SubmitOutcome, WizardEngine, WizardRun, keys,
};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

pub const WELCOME_STEP: &str = "welcome";
pub const METHOD_STEP: &str = "method";
pub const GENERATOR_STEP: &str = "generator";

/// Run-state slot holding the candidate generator key
const KEY_SLOT: &str = "generator";

/// A completed enrollment: the persisted device and where to send the user
#[derive(Debug)]
pub struct SetupOutcome {
    pub device: Device,
    pub redirect_url: String,
}

/// Flow definition for enrolling a generator device
pub struct SetupFlow {
    store: Arc<dyn DeviceStore>,
    challenger: Challenger,
    config: TwoFactorConfig,
    steps: Vec<StepDefinition>,
}

impl SetupFlow {
    pub fn new(
        store: Arc<dyn DeviceStore>,
        delivery: Arc<dyn CodeDelivery>,
        config: TwoFactorConfig,
    ) -> Self {
        let challenger = Challenger::new(store.clone(), delivery, &config);
        let digits = config.totp.digits as usize;
        let steps = vec![
            StepDefinition::new(WELCOME_STEP, FormSchema::empty()),
            // Only the generator method is offered; phone enrollment has
            // its own flow
            StepDefinition::new(METHOD_STEP, FormSchema::new(vec![FieldSpec::choice(
                "method",
                &["generator"],
            )])),
            StepDefinition::non_idempotent(
                GENERATOR_STEP,
                FormSchema::new(vec![FieldSpec::token("token", digits, digits)]),
            ),
        ];

        Self {
            store,
            challenger,
            config,
            steps,
        }
    }

    /// The candidate device, rebuilt from the run key on every use so
    /// the key shown in the QR context is the key that verifies
    fn candidate_device(&self, run: &mut WizardRun) -> Result<GeneratorDevice, FlowError> {
        let user_id = run.user_id.ok_or(FlowError::RunExpired)?;
        let key = keys::get_or_create(run, KEY_SLOT);
        Ok(GeneratorDevice {
            id: Uuid::new_v4(),
            user_id,
            name: DEFAULT_DEVICE_NAME.to_string(),
            key,
            created_at: Utc::now(),
        })
    }
}

#[async_trait]
impl Flow for SetupFlow {
    type Output = SetupOutcome;

    fn name(&self) -> &'static str {
        "setup"
    }

    fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    async fn validate(
        &self,
        step: &StepDefinition,
        cleaned: StepData,
        run: &mut WizardRun,
    ) -> Result<StepData, FlowError> {
        match step.name {
            METHOD_STEP => {
                if let Some(method) = cleaned.get("method") {
                    run.extra
                        .step_metadata
                        .insert(METHOD_STEP.to_string(), json!({ "device_type": method }));
                }
                Ok(cleaned)
            }
            GENERATOR_STEP => {
                let device = Device::Generator(self.candidate_device(run)?);
                let token = cleaned.get("token").cloned().unwrap_or_default();

                if !self.challenger.verify(&device, &token).await? {
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
            cancel_url: Some(self.config.login_redirect_url.clone()),
            ..RenderContext::default()
        };

        if step.name == GENERATOR_STEP {
            let user_id = run.user_id.ok_or(FlowError::RunExpired)?;
            let user = self
                .store
                .get_user(user_id)
                .await?
                .ok_or(FlowError::RunExpired)?;

            let key = keys::get_or_create(run, KEY_SLOT);
            let key_bytes = hex_decode(&key)
                .ok_or_else(|| FlowError::validation("Stored key is malformed."))?;

            let account = format!("{}@{}", user.username, self.config.site_name);
            let url = otpauth_url(&account, &key_bytes, &self.config.totp);
            context.qr = qr_text(&url).ok();
            context.otpauth_url = Some(url);
        }

        Ok(context)
    }

    async fn done(&self, run: &WizardRun) -> Result<SetupOutcome, FlowError> {
        let user_id = run.user_id.ok_or(FlowError::RunExpired)?;
        let key = run
            .extra
            .keys
            .get(KEY_SLOT)
            .cloned()
            .ok_or(FlowError::RunExpired)?;

        let device = self
            .store
            .create_device(
                user_id,
                NewDevice::Generator {
                    name: DEFAULT_DEVICE_NAME.to_string(),
                    key,
                },
            )
            .await?;

        info!("Enrolled generator device {} for user {}", device.id(), user_id);
        Ok(SetupOutcome {
            device,
            redirect_url: self.config.setup_complete_url.clone(),
        })
    }
}

/// Enrollment entry point. Guards against duplicate enrollment before a
/// run is ever created.
pub struct SetupController {
    engine: WizardEngine<SetupFlow>,
    store: Arc<dyn DeviceStore>,
}

impl SetupController {
    pub fn new(
        store: Arc<dyn DeviceStore>,
        delivery: Arc<dyn CodeDelivery>,
        runs: Arc<dyn RunStorage>,
        config: TwoFactorConfig,
    ) -> Self {
        let flow = SetupFlow::new(store.clone(), delivery, config);
        Self {
            engine: WizardEngine::new(flow, runs),
            store,
        }
    }

    pub fn engine(&self) -> &WizardEngine<SetupFlow> {
        &self.engine
    }

    /// Start enrollment for an authenticated user. A user who already
    /// has a default device is redirected to the setup-complete page
    /// instead of starting a second enrollment.
    pub async fn begin(
        &self,
        session_id: &str,
        user_id: Uuid,
    ) -> Result<SubmitOutcome<SetupOutcome>, FlowError> {
        if self.store.default_device(user_id).await?.is_some() {
            return Err(FlowError::DuplicateEnrollment);
        }
        self.engine.begin_as(session_id, Some(user_id)).await
    }

    pub async fn current(&self, session_id: &str) -> Result<StepView, FlowError> {
        self.engine.current(session_id).await
    }

    pub async fn submit(
        &self,
        session_id: &str,
        step: &str,
        input: &FormData,
    ) -> Result<SubmitOutcome<SetupOutcome>, FlowError> {
        self.engine.submit(session_id, step, input).await
    }

    pub async fn abandon(&self, session_id: &str) -> Result<(), FlowError> {
        self.engine.abandon(session_id).await
    }
}
