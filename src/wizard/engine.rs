// The step sequencer
// Orders steps, validates submissions, skips steps whose condition does
// not hold, and invokes the flow's completion handler exactly once

use super::forms::{FormData, FormSchema};
use super::run::{StepData, WizardRun};
use super::store::RunStorage;
use crate::error::{FlowError, ValidationErrors};
use crate::models::DeviceSummary;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One step in a flow's fixed step order
#[derive(Debug, Clone)]
pub struct StepDefinition {
    pub name: &'static str,
    pub schema: FormSchema,
    /// When false, a resubmission of this step always re-runs its full
    /// side-effecting validation; cached validity is never reused.
    /// Guards one-time token checks against back-navigation replay.
    pub idempotent: bool,
}

impl StepDefinition {
    pub fn new(name: &'static str, schema: FormSchema) -> Self {
        Self {
            name,
            schema,
            idempotent: true,
        }
    }

    pub fn non_idempotent(name: &'static str, schema: FormSchema) -> Self {
        Self {
            name,
            schema,
            idempotent: false,
        }
    }
}

/// Step-specific context handed to the rendering layer
#[derive(Debug, Clone, Default, Serialize)]
pub struct RenderContext {
    /// Human instructions for the challenged device
    pub instructions: Option<String>,
    /// otpauth:// URI for generator enrollment
    pub otpauth_url: Option<String>,
    /// QR rendering of `otpauth_url`
    pub qr: Option<String>,
    /// Where "cancel" takes the user
    pub cancel_url: Option<String>,
    /// Alternate devices the user may switch the challenge to
    pub other_devices: Vec<DeviceSummary>,
}

/// What the rendering layer needs to display a step
#[derive(Debug, Clone, Serialize)]
pub struct StepView {
    pub step: String,
    pub schema: FormSchema,
    pub context: RenderContext,
}

/// Result of a successful submission
#[derive(Debug)]
pub enum SubmitOutcome<T> {
    /// Render the next step
    NextStep(StepView),
    /// The flow finished; `done` ran and produced this
    Complete(T),
}

/// Per-flow behavior plugged into the engine: the step list, conditions,
/// side-effecting validation, entry hooks and the completion handler
#[async_trait]
pub trait Flow: Send + Sync {
    type Output: Send;

    fn name(&self) -> &'static str;

    /// The fixed, ordered step list
    fn steps(&self) -> &[StepDefinition];

    /// Steps reachable by an explicit forward goto. Empty by default;
    /// the login flow lists its challenge-redirect step here.
    fn goto_allowlist(&self) -> &'static [&'static str] {
        &[]
    }

    /// Whether the step applies, evaluated against live external state
    /// at every advance decision (never cached: state may change
    /// between steps).
    async fn applies(&self, step: &StepDefinition, run: &WizardRun) -> Result<bool, FlowError> {
        let _ = (step, run);
        Ok(true)
    }

    /// Side-effecting validation on top of the schema-cleaned data.
    /// Token checks and credential checks happen here.
    async fn validate(
        &self,
        step: &StepDefinition,
        cleaned: StepData,
        run: &mut WizardRun,
    ) -> Result<StepData, FlowError> {
        let _ = (step, run);
        Ok(cleaned)
    }

    /// Hook run when a step is displayed. `advancing` is true when the
    /// step has just become current (advance, goto or begin) and false
    /// on an idempotent re-render.
    async fn enter(
        &self,
        step: &StepDefinition,
        run: &mut WizardRun,
        advancing: bool,
    ) -> Result<RenderContext, FlowError> {
        let _ = (step, run, advancing);
        Ok(RenderContext::default())
    }

    /// Completion handler, invoked exactly once per run when no
    /// remaining step applies
    async fn done(&self, run: &WizardRun) -> Result<Self::Output, FlowError>;
}

/// The wizard engine: one flow definition plus run storage
pub struct WizardEngine<F: Flow> {
    flow: F,
    runs: Arc<dyn RunStorage>,
}

impl<F: Flow> WizardEngine<F> {
    pub fn new(flow: F, runs: Arc<dyn RunStorage>) -> Self {
        Self { flow, runs }
    }

    pub fn flow(&self) -> &F {
        &self.flow
    }

    /// Look up a step by name
    pub fn get_step(&self, name: &str) -> Option<&StepDefinition> {
        self.flow.steps().iter().find(|s| s.name == name)
    }

    fn step_index(&self, name: &str) -> Option<usize> {
        self.flow.steps().iter().position(|s| s.name == name)
    }

    /// Start a new run. The first step is the first one whose condition
    /// holds; a flow with no applicable step completes immediately.
    pub async fn begin(&self, session_id: &str) -> Result<SubmitOutcome<F::Output>, FlowError> {
        self.begin_as(session_id, None).await
    }

    /// Start a new run owned by an authenticated user, as the
    /// enrollment flows do
    pub async fn begin_as(
        &self,
        session_id: &str,
        user_id: Option<uuid::Uuid>,
    ) -> Result<SubmitOutcome<F::Output>, FlowError> {
        let mut run = WizardRun::new(self.flow.name());
        run.user_id = user_id;

        let first = self.next_applicable(&run, 0).await?;
        match first {
            Some(index) => {
                let step = &self.flow.steps()[index];
                run.current_step = step.name.to_string();

                let context = self.flow.enter(step, &mut run, true).await?;
                self.runs.save(session_id, &run).await?;

                info!("Started {} run {} at step '{}'", run.flow, run.id, step.name);
                Ok(SubmitOutcome::NextStep(StepView {
                    step: step.name.to_string(),
                    schema: step.schema.clone(),
                    context,
                }))
            }
            None => {
                run.completed = true;
                let output = self.flow.done(&run).await?;
                info!("Run {} of {} completed with no applicable steps", run.id, run.flow);
                Ok(SubmitOutcome::Complete(output))
            }
        }
    }

    /// Name of the step awaiting input
    pub async fn current_step_name(&self, session_id: &str) -> Result<String, FlowError> {
        let run = self.load(session_id).await?;
        Ok(run.current_step)
    }

    /// Re-render the current step. Safe to call any number of times.
    pub async fn current(&self, session_id: &str) -> Result<StepView, FlowError> {
        let mut run = self.load(session_id).await?;

        let step_name = run.current_step.clone();
        let step = self.get_step(&step_name).ok_or(FlowError::RunExpired)?;

        let context = self
            .flow
            .enter(step, &mut run, false)
            .await
            .map_err(surface_delivery_failure)?;
        self.runs.save(session_id, &run).await?;

        Ok(StepView {
            step: step.name.to_string(),
            schema: step.schema.clone(),
            context,
        })
    }

    /// Submit input for the current step.
    /// On success the run advances past every step whose condition does
    /// not hold; at the end of the order the flow's `done` runs and the
    /// run is destroyed.
    pub async fn submit(
        &self,
        session_id: &str,
        step_name: &str,
        input: &FormData,
    ) -> Result<SubmitOutcome<F::Output>, FlowError> {
        let mut run = self.load(session_id).await?;

        if step_name != run.current_step {
            warn!(
                "Out-of-order submission of '{}' while on '{}'",
                step_name, run.current_step
            );
            return Err(FlowError::IllegalTransition {
                attempted: step_name.to_string(),
                current: run.current_step.clone(),
            });
        }

        let step_index = self
            .step_index(step_name)
            .ok_or_else(|| FlowError::IllegalTransition {
                attempted: step_name.to_string(),
                current: run.current_step.clone(),
            })?;
        let step = &self.flow.steps()[step_index];

        let cleaned = step.schema.validate(input).map_err(FlowError::Validation)?;
        let cleaned = self.flow.validate(step, cleaned, &mut run).await?;
        run.set_step_data(step_name, cleaned);

        // A fresh submission invalidates every later step that must not
        // reuse cached validity (one-time token checks)
        for later in &self.flow.steps()[step_index + 1..] {
            if !later.idempotent && run.step_data(later.name).is_some() {
                debug!("Invalidating stored data of non-idempotent step '{}'", later.name);
                run.clear_step_data(later.name);
            }
        }

        match self.next_applicable(&run, step_index + 1).await? {
            Some(next_index) => {
                let next = &self.flow.steps()[next_index];
                let previous = run.current_step.clone();
                run.current_step = next.name.to_string();

                match self.flow.enter(next, &mut run, true).await {
                    Ok(context) => {
                        self.runs.save(session_id, &run).await?;
                        debug!("Run {} advanced to step '{}'", run.id, next.name);
                        Ok(SubmitOutcome::NextStep(StepView {
                            step: next.name.to_string(),
                            schema: next.schema.clone(),
                            context,
                        }))
                    }
                    Err(err @ FlowError::Delivery(_)) => {
                        // Roll back so resubmitting the step retries the
                        // challenge delivery
                        run.current_step = previous;
                        self.runs.save(session_id, &run).await?;
                        warn!("Challenge delivery failed on run {}: {}", run.id, err);
                        Err(surface_delivery_failure(err))
                    }
                    Err(other) => Err(other),
                }
            }
            None => {
                run.completed = true;
                self.prune_inapplicable(&mut run).await?;

                // Mark completion before running `done`: even if the
                // handler fails mid-way, this run can never trigger it
                // a second time
                self.runs.save(session_id, &run).await?;
                let output = self.flow.done(&run).await?;
                self.runs.delete(session_id).await?;

                info!("Run {} of {} completed", run.id, run.flow);
                Ok(SubmitOutcome::Complete(output))
            }
        }
    }

    /// Explicit jump. Permitted only to steps earlier in the order or to
    /// the flow's allow-listed challenge-redirect steps, and only when
    /// the target's condition holds.
    pub async fn goto(&self, session_id: &str, target: &str) -> Result<StepView, FlowError> {
        let mut run = self.load(session_id).await?;

        let target_index = self
            .step_index(target)
            .ok_or_else(|| FlowError::IllegalTransition {
                attempted: target.to_string(),
                current: run.current_step.clone(),
            })?;
        let current_index = self.step_index(&run.current_step).unwrap_or(0);

        let allow_listed = self.flow.goto_allowlist().contains(&target);
        if target_index >= current_index && !allow_listed {
            return Err(FlowError::IllegalTransition {
                attempted: target.to_string(),
                current: run.current_step.clone(),
            });
        }

        let step = &self.flow.steps()[target_index];
        if !self.flow.applies(step, &run).await? {
            return Err(FlowError::IllegalTransition {
                attempted: target.to_string(),
                current: run.current_step.clone(),
            });
        }

        run.current_step = step.name.to_string();
        let context = self
            .flow
            .enter(step, &mut run, true)
            .await
            .map_err(surface_delivery_failure)?;
        self.runs.save(session_id, &run).await?;

        debug!("Run {} jumped to step '{}'", run.id, step.name);
        Ok(StepView {
            step: step.name.to_string(),
            schema: step.schema.clone(),
            context,
        })
    }

    /// Drop an in-progress run
    pub async fn abandon(&self, session_id: &str) -> Result<(), FlowError> {
        self.runs.delete(session_id).await?;
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<WizardRun, FlowError> {
        let run = self.runs.load(session_id).await?;
        match run {
            Some(run) if !run.completed && run.flow == self.flow.name() => Ok(run),
            Some(_) => Err(FlowError::RunExpired),
            None => Err(FlowError::RunExpired),
        }
    }

    /// First step at or after `from` whose condition holds right now
    async fn next_applicable(
        &self,
        run: &WizardRun,
        from: usize,
    ) -> Result<Option<usize>, FlowError> {
        for (offset, step) in self.flow.steps()[from..].iter().enumerate() {
            if self.flow.applies(step, run).await? {
                return Ok(Some(from + offset));
            }
        }
        Ok(None)
    }

    /// Remove validated data of steps whose condition no longer holds,
    /// so `done` never sees data from a skipped step
    async fn prune_inapplicable(&self, run: &mut WizardRun) -> Result<(), FlowError> {
        for step in self.flow.steps() {
            if run.step_data(step.name).is_some() && !self.flow.applies(step, run).await? {
                debug!("Pruning data of inapplicable step '{}'", step.name);
                run.clear_step_data(step.name);
            }
        }
        Ok(())
    }
}

/// A failed out-of-band delivery is user-correctable: re-render the step
/// with a message asking to resubmit
fn surface_delivery_failure(err: FlowError) -> FlowError {
    match err {
        FlowError::Delivery(msg) => FlowError::Validation(ValidationErrors::message(format!(
            "We could not send you a code: {}. Please try again.",
            msg
        ))),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wizard::forms::FieldSpec;
    use crate::wizard::store::MemoryRunStorage;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Flow with a conditional middle step and a non-idempotent final
    /// step whose token is valid exactly once
    struct TestFlow {
        steps: Vec<StepDefinition>,
        include_middle: AtomicBool,
        token_valid: AtomicBool,
        done_calls: AtomicUsize,
    }

    impl TestFlow {
        fn new(include_middle: bool) -> Self {
            Self {
                steps: vec![
                    StepDefinition::new("first", FormSchema::new(vec![FieldSpec::text("name", 20)])),
                    StepDefinition::new(
                        "middle",
                        FormSchema::new(vec![FieldSpec::choice("pick", &["a", "b"])]),
                    ),
                    StepDefinition::non_idempotent(
                        "verify",
                        FormSchema::new(vec![FieldSpec::token("token", 6, 6)]),
                    ),
                ],
                include_middle: AtomicBool::new(include_middle),
                token_valid: AtomicBool::new(true),
                done_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Flow for TestFlow {
        type Output = BTreeMap<String, StepData>;

        fn name(&self) -> &'static str {
            "test"
        }

        fn steps(&self) -> &[StepDefinition] {
            &self.steps
        }

        async fn applies(&self, step: &StepDefinition, _run: &WizardRun) -> Result<bool, FlowError> {
            if step.name == "middle" {
                return Ok(self.include_middle.load(Ordering::SeqCst));
            }
            Ok(true)
        }

        async fn validate(
            &self,
            step: &StepDefinition,
            cleaned: StepData,
            _run: &mut WizardRun,
        ) -> Result<StepData, FlowError> {
            if step.name == "verify" {
                // One-time token: consumed by a successful validation
                if !self.token_valid.swap(false, Ordering::SeqCst) {
                    return Err(FlowError::validation("Entered token is not valid."));
                }
            }
            Ok(cleaned)
        }

        async fn done(&self, run: &WizardRun) -> Result<Self::Output, FlowError> {
            self.done_calls.fetch_add(1, Ordering::SeqCst);
            Ok(run.validated_step_data.clone())
        }
    }

    fn input(pairs: &[(&str, &str)]) -> FormData {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn engine(include_middle: bool) -> WizardEngine<TestFlow> {
        WizardEngine::new(TestFlow::new(include_middle), Arc::new(MemoryRunStorage::new()))
    }

    #[tokio::test]
    async fn test_ordered_submission_reaches_complete_once() {
        let engine = engine(true);

        let begun = engine.begin("s").await.unwrap();
        match begun {
            SubmitOutcome::NextStep(view) => assert_eq!(view.step, "first"),
            SubmitOutcome::Complete(_) => panic!("flow completed prematurely"),
        }

        let outcome = engine.submit("s", "first", &input(&[("name", "x")])).await.unwrap();
        match outcome {
            SubmitOutcome::NextStep(view) => assert_eq!(view.step, "middle"),
            SubmitOutcome::Complete(_) => panic!("flow completed prematurely"),
        }

        engine.submit("s", "middle", &input(&[("pick", "a")])).await.unwrap();
        let outcome = engine
            .submit("s", "verify", &input(&[("token", "123456")]))
            .await
            .unwrap();

        match outcome {
            SubmitOutcome::Complete(data) => {
                assert_eq!(data.len(), 3);
                assert_eq!(data["first"]["name"], "x");
            }
            SubmitOutcome::NextStep(_) => panic!("expected completion"),
        }
        assert_eq!(engine.flow().done_calls.load(Ordering::SeqCst), 1);

        // The run is destroyed on completion
        let late = engine.submit("s", "verify", &input(&[("token", "123456")])).await;
        assert!(matches!(late, Err(FlowError::RunExpired)));
    }

    #[tokio::test]
    async fn test_out_of_order_submission_is_illegal_and_mutates_nothing() {
        let engine = engine(true);
        engine.begin("s").await.unwrap();

        let err = engine
            .submit("s", "verify", &input(&[("token", "123456")]))
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::IllegalTransition { .. }));

        // Still on the first step, nothing stored
        assert_eq!(engine.current_step_name("s").await.unwrap(), "first");
        let outcome = engine.submit("s", "first", &input(&[("name", "x")])).await.unwrap();
        match outcome {
            SubmitOutcome::NextStep(view) => assert_eq!(view.step, "middle"),
            SubmitOutcome::Complete(_) => panic!("flow completed prematurely"),
        }
    }

    #[tokio::test]
    async fn test_false_condition_step_is_skipped_and_absent_from_done() {
        let engine = engine(false);
        engine.begin("s").await.unwrap();

        let outcome = engine.submit("s", "first", &input(&[("name", "x")])).await.unwrap();
        match outcome {
            SubmitOutcome::NextStep(view) => assert_eq!(view.step, "verify"),
            SubmitOutcome::Complete(_) => panic!("flow completed prematurely"),
        }

        let outcome = engine
            .submit("s", "verify", &input(&[("token", "123456")]))
            .await
            .unwrap();
        match outcome {
            SubmitOutcome::Complete(data) => assert!(!data.contains_key("middle")),
            SubmitOutcome::NextStep(_) => panic!("expected completion"),
        }
    }

    #[tokio::test]
    async fn test_condition_reevaluated_at_each_advance() {
        let engine = engine(false);
        engine.begin("s").await.unwrap();

        // State changes while the run is in progress
        engine.flow().include_middle.store(true, Ordering::SeqCst);

        let outcome = engine.submit("s", "first", &input(&[("name", "x")])).await.unwrap();
        match outcome {
            SubmitOutcome::NextStep(view) => assert_eq!(view.step, "middle"),
            SubmitOutcome::Complete(_) => panic!("flow completed prematurely"),
        }
    }

    #[tokio::test]
    async fn test_validation_error_keeps_step() {
        let engine = engine(true);
        engine.begin("s").await.unwrap();

        let err = engine.submit("s", "first", &input(&[])).await.unwrap_err();
        assert!(matches!(err, FlowError::Validation(_)));
        assert_eq!(engine.current_step_name("s").await.unwrap(), "first");
    }

    #[tokio::test]
    async fn test_non_idempotent_step_revalidates_on_resubmission() {
        let engine = engine(false);
        engine.begin("s").await.unwrap();
        engine.submit("s", "first", &input(&[("name", "x")])).await.unwrap();

        engine
            .submit("s", "verify", &input(&[("token", "123456")]))
            .await
            .unwrap();

        // The token was consumed by the first run; a fresh run must
        // re-run the side-effecting validation and fail
        engine.begin("s").await.unwrap();
        engine.submit("s", "first", &input(&[("name", "x")])).await.unwrap();
        let err = engine
            .submit("s", "verify", &input(&[("token", "123456")]))
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Validation(_)));
    }

    #[tokio::test]
    async fn test_resubmitting_earlier_step_invalidates_later_non_idempotent_data() {
        let engine = engine(true);
        engine.begin("s").await.unwrap();
        engine.submit("s", "first", &input(&[("name", "x")])).await.unwrap();
        engine.submit("s", "middle", &input(&[("pick", "a")])).await.unwrap();

        // Walk back to the start and resubmit
        engine.goto("s", "first").await.unwrap();
        engine.submit("s", "first", &input(&[("name", "y")])).await.unwrap();

        // The verify step had no stored data yet, but if it had, it
        // would be gone now; either way validation re-runs in full
        engine.submit("s", "middle", &input(&[("pick", "b")])).await.unwrap();
        let outcome = engine
            .submit("s", "verify", &input(&[("token", "123456")]))
            .await
            .unwrap();
        match outcome {
            SubmitOutcome::Complete(data) => assert_eq!(data["first"]["name"], "y"),
            SubmitOutcome::NextStep(_) => panic!("expected completion"),
        }
    }

    #[tokio::test]
    async fn test_goto_backward_allowed_forward_rejected() {
        let engine = engine(true);
        engine.begin("s").await.unwrap();
        engine.submit("s", "first", &input(&[("name", "x")])).await.unwrap();

        // Forward jump is not allow-listed
        let err = engine.goto("s", "verify").await.unwrap_err();
        assert!(matches!(err, FlowError::IllegalTransition { .. }));

        // Backward jump is fine
        let view = engine.goto("s", "first").await.unwrap();
        assert_eq!(view.step, "first");
        assert_eq!(engine.current_step_name("s").await.unwrap(), "first");
    }

    #[tokio::test]
    async fn test_goto_unknown_step_rejected() {
        let engine = engine(true);
        engine.begin("s").await.unwrap();

        let err = engine.goto("s", "nonsense").await.unwrap_err();
        assert!(matches!(err, FlowError::IllegalTransition { .. }));
    }

    #[tokio::test]
    async fn test_begin_skips_leading_inapplicable_steps() {
        struct SkipFirst(TestFlow);

        #[async_trait]
        impl Flow for SkipFirst {
            type Output = BTreeMap<String, StepData>;

            fn name(&self) -> &'static str {
                "test"
            }

            fn steps(&self) -> &[StepDefinition] {
                self.0.steps()
            }

            async fn applies(
                &self,
                step: &StepDefinition,
                run: &WizardRun,
            ) -> Result<bool, FlowError> {
                if step.name == "first" {
                    return Ok(false);
                }
                self.0.applies(step, run).await
            }

            async fn done(&self, run: &WizardRun) -> Result<Self::Output, FlowError> {
                self.0.done(run).await
            }
        }

        let engine = WizardEngine::new(
            SkipFirst(TestFlow::new(true)),
            Arc::new(MemoryRunStorage::new()),
        );

        match engine.begin("s").await.unwrap() {
            SubmitOutcome::NextStep(view) => assert_eq!(view.step, "middle"),
            SubmitOutcome::Complete(_) => panic!("flow completed prematurely"),
        }
    }

    #[tokio::test]
    async fn test_unknown_session_is_expired() {
        let engine = engine(true);
        let err = engine.current("missing").await.unwrap_err();
        assert!(matches!(err, FlowError::RunExpired));
    }
}
