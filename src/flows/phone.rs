// Phone device enrollment flow
// Collects a number and delivery method, then validates possession with a
// code delivered to that exact number. The device is rebuilt from the
// validated setup data plus the run key on every step, so the challenged
// device and the persisted device are always field-identical.

use crate::challenge::Challenger;
use crate::config::TwoFactorConfig;
use crate::delivery::CodeDelivery;
use crate::error::FlowError;
use crate::models::device::BACKUP_DEVICE_NAME;
use crate::models::{Device, NewDevice, PhoneDevice, PhoneMethod};
use crate::storage::DeviceStore;
use crate::wizard::store::RunStorage;
use crate::wizard::{
    FieldSpec, Flow, FormData, FormSchema, RenderContext, StepData, StepDefinition, StepView,
    SubmitOutcome, WizardEngine, WizardRun, keys,
};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

pub const SETUP_STEP: &str = "setup";
pub const VALIDATION_STEP: &str = "validation";

/// Run-state slot holding the candidate phone key
const KEY_SLOT: &str = "key";

/// A completed phone enrollment
#[derive(Debug)]
pub struct PhoneSetupOutcome {
    pub device: Device,
    pub redirect_url: String,
}

/// Flow definition for enrolling a backup phone
pub struct PhoneSetupFlow {
    store: Arc<dyn DeviceStore>,
    challenger: Challenger,
    config: TwoFactorConfig,
    steps: Vec<StepDefinition>,
}

impl PhoneSetupFlow {
    pub fn new(
        store: Arc<dyn DeviceStore>,
        delivery: Arc<dyn CodeDelivery>,
        config: TwoFactorConfig,
    ) -> Self {
        let challenger = Challenger::new(store.clone(), delivery, &config);
        let digits = config.totp.digits as usize;
        let steps = vec![
            StepDefinition::new(SETUP_STEP, FormSchema::new(vec![
                FieldSpec::phone_number("number"),
                FieldSpec::choice("method", &["call", "sms"]),
            ])),
            StepDefinition::non_idempotent(
                VALIDATION_STEP,
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

    /// Rebuild the transient device from the stored setup data and the
    /// run key
    fn transient_device(&self, run: &mut WizardRun) -> Result<PhoneDevice, FlowError> {
        let user_id = run.user_id.ok_or(FlowError::RunExpired)?;
        let number = run
            .field(SETUP_STEP, "number")
            .ok_or(FlowError::RunExpired)?
            .to_string();
        let method = run
            .field(SETUP_STEP, "method")
            .and_then(PhoneMethod::parse)
            .ok_or(FlowError::RunExpired)?;
        let key = keys::get_or_create(run, KEY_SLOT);

        Ok(PhoneDevice {
            id: Uuid::new_v4(),
            user_id,
            name: BACKUP_DEVICE_NAME.to_string(),
            number,
            method,
            key,
            created_at: Utc::now(),
        })
    }

    fn instructions_for(method: PhoneMethod) -> String {
        match method {
            PhoneMethod::Call => {
                "We are calling your phone right now, please enter the digits you hear."
            }
            PhoneMethod::Sms => "We sent you a text message, please enter the tokens we sent.",
        }
        .to_string()
    }
}

#[async_trait]
impl Flow for PhoneSetupFlow {
    type Output = PhoneSetupOutcome;

    fn name(&self) -> &'static str {
        "phone_setup"
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
        if step.name == VALIDATION_STEP {
            let device = Device::Phone(self.transient_device(run)?);
            let token = cleaned.get("token").cloned().unwrap_or_default();

            if !self.challenger.verify(&device, &token).await? {
                return Err(FlowError::validation("Entered token is not valid."));
            }
        }
        Ok(cleaned)
    }

    async fn enter(
        &self,
        step: &StepDefinition,
        run: &mut WizardRun,
        advancing: bool,
    ) -> Result<RenderContext, FlowError> {
        let mut context = RenderContext {
            cancel_url: Some(self.config.login_redirect_url.clone()),
            ..RenderContext::default()
        };

        if step.name == VALIDATION_STEP {
            let device = self.transient_device(run)?;
            context.instructions = Some(Self::instructions_for(device.method));

            // Deliver a code when the step becomes current; plain
            // re-renders do not resend
            if advancing {
                self.challenger
                    .generate_challenge(&Device::Phone(device))
                    .await?;
            }
        }

        Ok(context)
    }

    async fn done(&self, run: &WizardRun) -> Result<PhoneSetupOutcome, FlowError> {
        let user_id = run.user_id.ok_or(FlowError::RunExpired)?;
        let number = run
            .field(SETUP_STEP, "number")
            .ok_or(FlowError::RunExpired)?
            .to_string();
        let method = run
            .field(SETUP_STEP, "method")
            .and_then(PhoneMethod::parse)
            .ok_or(FlowError::RunExpired)?;
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
                NewDevice::Phone {
                    name: BACKUP_DEVICE_NAME.to_string(),
                    number,
                    method,
                    key,
                },
            )
            .await?;

        info!("Enrolled phone device {} for user {}", device.id(), user_id);
        Ok(PhoneSetupOutcome {
            device,
            redirect_url: self.config.login_redirect_url.clone(),
        })
    }
}

/// Phone enrollment entry point for an authenticated, already
/// two-factor-verified user
pub struct PhoneSetupController {
    engine: WizardEngine<PhoneSetupFlow>,
}

impl PhoneSetupController {
    pub fn new(
        store: Arc<dyn DeviceStore>,
        delivery: Arc<dyn CodeDelivery>,
        runs: Arc<dyn RunStorage>,
        config: TwoFactorConfig,
    ) -> Self {
        let flow = PhoneSetupFlow::new(store, delivery, config);
        Self {
            engine: WizardEngine::new(flow, runs),
        }
    }

    pub fn engine(&self) -> &WizardEngine<PhoneSetupFlow> {
        &self.engine
    }

    pub async fn begin(
        &self,
        session_id: &str,
        user_id: Uuid,
    ) -> Result<SubmitOutcome<PhoneSetupOutcome>, FlowError> {
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
    ) -> Result<SubmitOutcome<PhoneSetupOutcome>, FlowError> {
        self.engine.submit(session_id, step, input).await
    }

    pub async fn abandon(&self, session_id: &str) -> Result<(), FlowError> {
        self.engine.abandon(session_id).await
    }
}
