// Error taxonomy for the wizard engine and flow controllers
// Every variant is recovered at the flow boundary; none is fatal

use crate::storage::StoreError;
use std::collections::BTreeMap;

/// Field-level validation messages for re-rendering a step
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationErrors {
    /// Messages keyed by field name
    pub fields: BTreeMap<String, Vec<String>>,
    /// Messages not tied to a single field (e.g. a rejected token)
    pub non_field: Vec<String>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Single non-field message, the common case for token rejection
    pub fn message(msg: impl Into<String>) -> Self {
        Self {
            fields: BTreeMap::new(),
            non_field: vec![msg.into()],
        }
    }

    /// Single message attached to one field
    pub fn field(name: impl Into<String>, msg: impl Into<String>) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(name.into(), vec![msg.into()]);
        Self {
            fields,
            non_field: Vec::new(),
        }
    }

    pub fn add_field(&mut self, name: impl Into<String>, msg: impl Into<String>) {
        self.fields.entry(name.into()).or_default().push(msg.into());
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.non_field.is_empty()
    }
}

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts: Vec<String> = self.non_field.clone();
        for (field, msgs) in &self.fields {
            for msg in msgs {
                parts.push(format!("{}: {}", field, msg));
            }
        }
        write!(f, "{}", parts.join("; "))
    }
}

/// Errors surfaced by the wizard engine and flow controllers
#[derive(Debug, Clone)]
pub enum FlowError {
    /// Bad or incorrect step input; re-render the same step with messages
    Validation(ValidationErrors),
    /// Out-of-order submission or disallowed goto; reset to the current step
    IllegalTransition { attempted: String, current: String },
    /// Submission after completion, or the run is gone from session storage
    RunExpired,
    /// The out-of-band channel could not deliver a code
    Delivery(String),
    /// Enrollment attempted while a default device already exists
    DuplicateEnrollment,
    /// Datastore fault
    Store(StoreError),
}

impl FlowError {
    /// Shorthand for a single-message validation failure
    pub fn validation(msg: impl Into<String>) -> Self {
        FlowError::Validation(ValidationErrors::message(msg))
    }
}

impl std::fmt::Display for FlowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlowError::Validation(errors) => write!(f, "Validation failed: {}", errors),
            FlowError::IllegalTransition { attempted, current } => write!(
                f,
                "Illegal transition to step '{}' while on step '{}'",
                attempted, current
            ),
            FlowError::RunExpired => write!(f, "Wizard run has expired or completed"),
            FlowError::Delivery(msg) => write!(f, "Code delivery failed: {}", msg),
            FlowError::DuplicateEnrollment => {
                write!(f, "A default device is already enrolled")
            }
            FlowError::Store(err) => write!(f, "Storage error: {}", err),
        }
    }
}

impl std::error::Error for FlowError {}

impl From<StoreError> for FlowError {
    fn from(err: StoreError) -> Self {
        FlowError::Store(err)
    }
}
