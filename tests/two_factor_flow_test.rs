// End-to-end flow scenarios against the in-memory backends

use std::sync::Arc;

use two_factor_flow::config::TwoFactorConfig;
use two_factor_flow::delivery::{FailingDelivery, RecordingDelivery};
use two_factor_flow::error::FlowError;
use two_factor_flow::flows::{
    BackupTokens, DeviceRemoval, LoginController, PhoneSetupController, SetupController,
};
use two_factor_flow::models::device::{BACKUP_DEVICE_NAME, DEFAULT_DEVICE_NAME};
use two_factor_flow::models::{Device, NewDevice, PhoneMethod, User};
use two_factor_flow::otp::{Totp, hex_decode, otpauth_url, random_hex_key};
use two_factor_flow::storage::DeviceStore;
use two_factor_flow::storage::memory::MemoryDeviceStore;
use two_factor_flow::wizard::{FormData, MemoryRunStorage, RunStorage, SubmitOutcome};

struct Harness {
    store: Arc<MemoryDeviceStore>,
    runs: Arc<MemoryRunStorage>,
    delivery: Arc<RecordingDelivery>,
    config: TwoFactorConfig,
}

impl Harness {
    fn new() -> Self {
        Self {
            store: Arc::new(MemoryDeviceStore::new()),
            runs: Arc::new(MemoryRunStorage::new()),
            delivery: Arc::new(RecordingDelivery::new()),
            config: TwoFactorConfig::default(),
        }
    }

    async fn user(&self) -> User {
        self.store
            .add_user("bouke", "bouke@example.com", "secret")
            .await
            .unwrap()
    }

    fn login(&self) -> LoginController {
        LoginController::new(
            self.store.clone(),
            self.delivery.clone(),
            self.runs.clone(),
            self.config.clone(),
        )
    }

    fn setup(&self) -> SetupController {
        SetupController::new(
            self.store.clone(),
            self.delivery.clone(),
            self.runs.clone(),
            self.config.clone(),
        )
    }

    fn phone_setup(&self) -> PhoneSetupController {
        PhoneSetupController::new(
            self.store.clone(),
            self.delivery.clone(),
            self.runs.clone(),
            self.config.clone(),
        )
    }

    async fn enroll_generator(&self, user: &User) -> (Device, Vec<u8>) {
        let key = random_hex_key();
        let device = self
            .store
            .create_device(
                user.id,
                NewDevice::Generator {
                    name: DEFAULT_DEVICE_NAME.to_string(),
                    key: key.clone(),
                },
            )
            .await
            .unwrap();
        (device, hex_decode(&key).unwrap())
    }

    fn totp(&self) -> Totp {
        Totp::new(self.config.totp.clone())
    }
}

fn input(pairs: &[(&str, &str)]) -> FormData {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn wrong_code(code: &str) -> String {
    if code == "000000" {
        "000001".to_string()
    } else {
        "000000".to_string()
    }
}

#[tokio::test]
async fn login_with_generator_device() {
    let harness = Harness::new();
    let user = harness.user().await;
    let (_, key) = harness.enroll_generator(&user).await;
    let login = harness.login();

    match login.begin("s").await.unwrap() {
        SubmitOutcome::NextStep(view) => assert_eq!(view.step, "auth"),
        SubmitOutcome::Complete(_) => panic!("login completed without credentials"),
    }

    // Wrong password stays on the auth step
    let err = login
        .submit("s", "auth", &input(&[("username", "bouke"), ("password", "nope")]))
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::Validation(_)));

    // Correct credentials advance to the token challenge
    let view = match login
        .submit("s", "auth", &input(&[("username", "bouke"), ("password", "secret")]))
        .await
        .unwrap()
    {
        SubmitOutcome::NextStep(view) => view,
        SubmitOutcome::Complete(_) => panic!("second factor was skipped"),
    };
    assert_eq!(view.step, "token");
    assert!(
        view.context
            .instructions
            .unwrap()
            .contains("token generator")
    );

    // An incorrect code is rejected and the step stays current
    let code = harness.totp().current_code(&key);
    let err = login
        .submit("s", "token", &input(&[("token", &wrong_code(&code))]))
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::Validation(_)));
    assert_eq!(
        login.engine().current_step_name("s").await.unwrap(),
        "token"
    );

    // The correct code completes the login
    match login
        .submit("s", "token", &input(&[("token", &code)]))
        .await
        .unwrap()
    {
        SubmitOutcome::Complete(outcome) => {
            assert_eq!(outcome.user.id, user.id);
            assert_eq!(outcome.redirect_url, "/");
        }
        SubmitOutcome::NextStep(view) => panic!("expected completion, got step {}", view.step),
    }

    // The run is gone: a replayed submission is expired
    let replay = login.submit("s", "token", &input(&[("token", &code)])).await;
    assert!(matches!(replay, Err(FlowError::RunExpired)));
}

#[tokio::test]
async fn login_without_second_factor_skips_token_step() {
    let harness = Harness::new();
    let user = harness.user().await;
    let login = harness.login();

    login.begin("s").await.unwrap();
    match login
        .submit("s", "auth", &input(&[("username", "bouke"), ("password", "secret")]))
        .await
        .unwrap()
    {
        SubmitOutcome::Complete(outcome) => assert_eq!(outcome.user.id, user.id),
        SubmitOutcome::NextStep(view) => panic!("unexpected step {}", view.step),
    }
}

#[tokio::test]
async fn login_out_of_order_submission_is_illegal() {
    let harness = Harness::new();
    let user = harness.user().await;
    harness.enroll_generator(&user).await;
    let login = harness.login();

    login.begin("s").await.unwrap();
    let err = login
        .submit("s", "token", &input(&[("token", "123456")]))
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::IllegalTransition { .. }));
    assert_eq!(login.engine().current_step_name("s").await.unwrap(), "auth");
}

#[tokio::test]
async fn login_switch_to_backup_phone() {
    let harness = Harness::new();
    let user = harness.user().await;
    harness.enroll_generator(&user).await;
    let phone = harness
        .store
        .create_device(
            user.id,
            NewDevice::Phone {
                name: BACKUP_DEVICE_NAME.to_string(),
                number: "+31612345678".to_string(),
                method: PhoneMethod::Sms,
                key: random_hex_key(),
            },
        )
        .await
        .unwrap();
    let login = harness.login();

    login.begin("s").await.unwrap();
    let view = match login
        .submit("s", "auth", &input(&[("username", "bouke"), ("password", "secret")]))
        .await
        .unwrap()
    {
        SubmitOutcome::NextStep(view) => view,
        SubmitOutcome::Complete(_) => panic!("second factor was skipped"),
    };

    // The backup phone is offered as an alternate device
    assert_eq!(view.context.other_devices.len(), 1);
    assert_eq!(view.context.other_devices[0].id, phone.id());

    // Switching reassigns the challenge before it is generated
    let view = login.switch_device("s", phone.id()).await.unwrap();
    assert_eq!(view.step, "token");
    assert!(view.context.instructions.unwrap().contains("text message"));

    let sent = harness.delivery.last().await.unwrap();
    assert_eq!(sent.number, "+31612345678");
    assert_eq!(sent.method, PhoneMethod::Sms);

    match login
        .submit("s", "token", &input(&[("token", &sent.code)]))
        .await
        .unwrap()
    {
        SubmitOutcome::Complete(outcome) => assert_eq!(outcome.user.id, user.id),
        SubmitOutcome::NextStep(view) => panic!("expected completion, got step {}", view.step),
    }
}

#[tokio::test]
async fn login_accepts_backup_token_exactly_once() {
    let harness = Harness::new();
    let user = harness.user().await;
    let (_, key) = harness.enroll_generator(&user).await;
    let tokens = BackupTokens::new(harness.store.clone(), harness.config.clone())
        .regenerate(user.id)
        .await
        .unwrap();
    let login = harness.login();

    login.begin("s").await.unwrap();
    login
        .submit("s", "auth", &input(&[("username", "bouke"), ("password", "secret")]))
        .await
        .unwrap();
    match login
        .submit("s", "token", &input(&[("token", &tokens[0])]))
        .await
        .unwrap()
    {
        SubmitOutcome::Complete(outcome) => assert_eq!(outcome.user.id, user.id),
        SubmitOutcome::NextStep(view) => panic!("expected completion, got step {}", view.step),
    }

    // A second login replaying the consumed token fails
    login.begin("s").await.unwrap();
    login
        .submit("s", "auth", &input(&[("username", "bouke"), ("password", "secret")]))
        .await
        .unwrap();
    let err = login
        .submit("s", "token", &input(&[("token", &tokens[0])]))
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::Validation(_)));

    // The generator still works for that stuck login
    let code = Totp::new(harness.config.totp.clone()).current_code(&key);
    assert!(matches!(
        login
            .submit("s", "token", &input(&[("token", &code)]))
            .await
            .unwrap(),
        SubmitOutcome::Complete(_)
    ));
}

#[tokio::test]
async fn generator_enrollment_key_is_stable_across_rerenders() {
    let harness = Harness::new();
    let user = harness.user().await;
    let setup = harness.setup();

    match setup.begin("s", user.id).await.unwrap() {
        SubmitOutcome::NextStep(view) => assert_eq!(view.step, "welcome"),
        SubmitOutcome::Complete(_) => panic!("enrollment completed prematurely"),
    }

    setup.submit("s", "welcome", &input(&[])).await.unwrap();
    let view = match setup
        .submit("s", "method", &input(&[("method", "generator")]))
        .await
        .unwrap()
    {
        SubmitOutcome::NextStep(view) => view,
        SubmitOutcome::Complete(_) => panic!("enrollment completed prematurely"),
    };
    assert_eq!(view.step, "generator");
    let first_url = view.context.otpauth_url.unwrap();

    // Re-rendering the step keeps showing the same key
    let rerendered = setup.current("s").await.unwrap();
    assert_eq!(rerendered.context.otpauth_url.unwrap(), first_url);

    // The URL is built from exactly the key stored on the run
    let run = harness.runs.load("s").await.unwrap().unwrap();
    let key_hex = run.extra.keys.get("generator").unwrap().clone();
    let key = hex_decode(&key_hex).unwrap();
    assert_eq!(
        otpauth_url("bouke@example.com", &key, &harness.config.totp),
        first_url
    );

    // A wrong code re-renders the step; the right code persists the
    // device with that same key
    let code = harness.totp().current_code(&key);
    let err = setup
        .submit("s", "generator", &input(&[("token", &wrong_code(&code))]))
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::Validation(_)));

    match setup
        .submit("s", "generator", &input(&[("token", &code)]))
        .await
        .unwrap()
    {
        SubmitOutcome::Complete(outcome) => {
            assert_eq!(outcome.redirect_url, "/two-factor/setup/complete");
            match outcome.device {
                Device::Generator(generator) => assert_eq!(generator.key, key_hex),
                other => panic!("expected a generator device, got {:?}", other.kind()),
            }
        }
        SubmitOutcome::NextStep(view) => panic!("expected completion, got step {}", view.step),
    }

    let default = harness.store.default_device(user.id).await.unwrap();
    assert!(default.is_some());
}

#[tokio::test]
async fn generator_enrollment_rejects_duplicate() {
    let harness = Harness::new();
    let user = harness.user().await;
    harness.enroll_generator(&user).await;
    let setup = harness.setup();

    let err = setup.begin("s", user.id).await.unwrap_err();
    assert!(matches!(err, FlowError::DuplicateEnrollment));
}

#[tokio::test]
async fn phone_enrollment_end_to_end() {
    let harness = Harness::new();
    let user = harness.user().await;
    let phone_setup = harness.phone_setup();

    match phone_setup.begin("s", user.id).await.unwrap() {
        SubmitOutcome::NextStep(view) => assert_eq!(view.step, "setup"),
        SubmitOutcome::Complete(_) => panic!("enrollment completed prematurely"),
    }

    // The number is normalized and a code goes out to it on entering
    // the validation step
    let view = match phone_setup
        .submit(
            "s",
            "setup",
            &input(&[("number", "+31 6 1234-5678"), ("method", "sms")]),
        )
        .await
        .unwrap()
    {
        SubmitOutcome::NextStep(view) => view,
        SubmitOutcome::Complete(_) => panic!("enrollment completed prematurely"),
    };
    assert_eq!(view.step, "validation");
    assert!(view.context.instructions.unwrap().contains("text message"));

    let sent = harness.delivery.last().await.unwrap();
    assert_eq!(sent.number, "+31612345678");
    assert_eq!(sent.method, PhoneMethod::Sms);

    // Re-rendering the validation step does not resend the code
    phone_setup.current("s").await.unwrap();
    assert_eq!(harness.delivery.sent().await.len(), 1);

    // Submitting exactly the delivered code persists the device
    let device = match phone_setup
        .submit("s", "validation", &input(&[("token", &sent.code)]))
        .await
        .unwrap()
    {
        SubmitOutcome::Complete(outcome) => outcome.device,
        SubmitOutcome::NextStep(view) => panic!("expected completion, got step {}", view.step),
    };

    let phone = match harness.store.get_device(device.id()).await.unwrap().unwrap() {
        Device::Phone(phone) => phone,
        other => panic!("expected a phone device, got {:?}", other.kind()),
    };
    assert_eq!(phone.user_id, user.id);
    assert_eq!(phone.name, BACKUP_DEVICE_NAME);
    assert_eq!(phone.number, "+31612345678");
    assert_eq!(phone.method, PhoneMethod::Sms);

    // The persisted key is the key the delivered code was derived from
    let key = hex_decode(&phone.key).unwrap();
    let totp = Totp::new(harness.config.totp.clone());
    assert!(totp.verify_with_drift(&key, &sent.code, harness.config.phone_code_drift));
}

#[tokio::test]
async fn phone_enrollment_delivery_failure_requests_resubmission() {
    let harness = Harness::new();
    let user = harness.user().await;
    let phone_setup = PhoneSetupController::new(
        harness.store.clone(),
        Arc::new(FailingDelivery),
        harness.runs.clone(),
        harness.config.clone(),
    );

    phone_setup.begin("s", user.id).await.unwrap();
    let err = phone_setup
        .submit(
            "s",
            "setup",
            &input(&[("number", "+31612345678"), ("method", "call")]),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::Validation(_)));

    // The run rolled back so resubmitting retries delivery
    assert_eq!(
        phone_setup.engine().current_step_name("s").await.unwrap(),
        "setup"
    );
}

#[tokio::test]
async fn backup_device_deletion_is_scoped() {
    let harness = Harness::new();
    let owner = harness.user().await;
    let other = harness
        .store
        .add_user("eve", "eve@example.com", "secret")
        .await
        .unwrap();
    let removal = DeviceRemoval::new(harness.store.clone());

    let backup = harness
        .store
        .create_device(
            owner.id,
            NewDevice::Phone {
                name: BACKUP_DEVICE_NAME.to_string(),
                number: "+31612345678".to_string(),
                method: PhoneMethod::Call,
                key: random_hex_key(),
            },
        )
        .await
        .unwrap();

    assert!(removal.remove_backup_device(other.id, backup.id()).await.is_err());
    assert!(removal.remove_backup_device(owner.id, backup.id()).await.is_ok());
    assert!(harness.store.get_device(backup.id()).await.unwrap().is_none());
}

#[tokio::test]
async fn concurrent_sessions_are_isolated() {
    // One run store, two sessions; each run is owned by its session
    let harness = Harness::new();
    let alice = harness.user().await;
    let bob = harness
        .store
        .add_user("bob", "bob@example.com", "secret")
        .await
        .unwrap();

    let setup = harness.setup();
    setup.begin("alice-session", alice.id).await.unwrap();
    setup.begin("bob-session", bob.id).await.unwrap();

    setup.submit("alice-session", "welcome", &input(&[])).await.unwrap();
    setup
        .submit("alice-session", "method", &input(&[("method", "generator")]))
        .await
        .unwrap();

    // Bob's run is still on its first step
    assert_eq!(
        setup.engine().current_step_name("bob-session").await.unwrap(),
        "welcome"
    );

    let alice_run = harness.runs.load("alice-session").await.unwrap().unwrap();
    let bob_run = harness.runs.load("bob-session").await.unwrap().unwrap();
    assert_ne!(alice_run.id, bob_run.id);
    assert_eq!(alice_run.user_id, Some(alice.id));
    assert_eq!(bob_run.user_id, Some(bob.id));
}
