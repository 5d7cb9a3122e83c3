use std::sync::{Arc, LazyLock};

use jsonschema::JSONSchema;
use schemars::schema_for;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::models::StructuredAnswer;

mod steps;

pub use steps::{
    AnswerLength, AnswerLimits, PiiRedaction, REDACTION_MARKER, SourceGrounding, StepOutcome,
    ToxicLanguage, ValidationStep,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct ValidationFailure {
    /// Whether regenerating the answer could fix the problem.
    pub recoverable: bool,
    pub reason: String,
}

impl ValidationFailure {
    pub fn recoverable(reason: impl Into<String>) -> Self {
        Self {
            recoverable: true,
            reason: reason.into(),
        }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Self {
            recoverable: false,
            reason: reason.into(),
        }
    }
}

static ANSWER_SCHEMA: LazyLock<Result<Value, String>> = LazyLock::new(|| {
    serde_json::to_value(schema_for!(StructuredAnswer)).map_err(|err| err.to_string())
});

static ANSWER_VALIDATOR: LazyLock<Result<JSONSchema, String>> = LazyLock::new(|| {
    let schema = ANSWER_SCHEMA.as_ref().map_err(Clone::clone)?;
    JSONSchema::compile(schema).map_err(|err| err.to_string())
});

/// JSON schema of [`StructuredAnswer`], embedded in prompts and used to check
/// generator output.
pub fn answer_schema() -> Result<&'static Value, String> {
    ANSWER_SCHEMA.as_ref().map_err(Clone::clone)
}

/// Turns raw generator text into a checked answer: schema first, then each
/// step in order. Steps may repair the answer or reject it.
#[derive(Clone)]
pub struct ResponseValidator {
    steps: Arc<Vec<Box<dyn ValidationStep>>>,
}

impl ResponseValidator {
    pub fn new(steps: Vec<Box<dyn ValidationStep>>) -> Self {
        Self {
            steps: Arc::new(steps),
        }
    }

    pub fn with_limits(limits: AnswerLimits) -> Self {
        Self::new(vec![
            Box::new(PiiRedaction::default()),
            Box::new(ToxicLanguage::default()),
            Box::new(AnswerLength::new(limits)),
            Box::new(SourceGrounding),
        ])
    }

    pub fn validate(
        &self,
        raw: &str,
        known_sources: &[String],
    ) -> Result<StructuredAnswer, ValidationFailure> {
        let mut answer = parse_structured_answer(raw)?;

        for step in self.steps.iter() {
            answer = match step.check(answer, known_sources) {
                StepOutcome::Pass(answer) => answer,
                StepOutcome::Fix { answer, note } => {
                    debug!(step = step.name(), note = %note, "validator repaired answer");
                    answer
                }
                StepOutcome::Fail(failure) => {
                    debug!(
                        step = step.name(),
                        recoverable = failure.recoverable,
                        reason = %failure.reason,
                        "validator rejected answer"
                    );
                    return Err(failure);
                }
            };
        }

        Ok(answer)
    }
}

impl Default for ResponseValidator {
    fn default() -> Self {
        Self::with_limits(AnswerLimits::default())
    }
}

pub fn parse_structured_answer(raw: &str) -> Result<StructuredAnswer, ValidationFailure> {
    let candidate = extract_json_object(raw)
        .ok_or_else(|| ValidationFailure::recoverable("response is not a JSON object"))?;
    let payload: Value = serde_json::from_str(candidate)
        .map_err(|err| ValidationFailure::recoverable(format!("response is not valid JSON: {err}")))?;

    let validator = ANSWER_VALIDATOR
        .as_ref()
        .map_err(|message| ValidationFailure::fatal(format!("answer schema failed to compile: {message}")))?;
    if let Err(validation_errors) = validator.validate(&payload) {
        let errors = validation_errors
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(ValidationFailure::recoverable(format!(
            "response does not match schema: {}",
            errors.join("; ")
        )));
    }

    serde_json::from_value(payload).map_err(|err| {
        ValidationFailure::recoverable(format!("response does not match schema: {err}"))
    })
}

/// The outermost `{...}` span of `raw`, which tolerates code fences and
/// prose around the object.
fn extract_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (start < end).then(|| &raw[start..=end])
}
