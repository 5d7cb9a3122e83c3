use regex::{Regex, RegexBuilder};
use tracing::warn;

use super::ValidationFailure;
use crate::models::{Confidence, StructuredAnswer};

pub const REDACTION_MARKER: &str = "[REDACTED]";

const DEFAULT_TOXIC_TERMS: [&str; 8] = [
    "idiot",
    "moron",
    "stupid",
    "imbecile",
    "shut up",
    "kill yourself",
    "i hate you",
    "worthless",
];

pub enum StepOutcome {
    Pass(StructuredAnswer),
    Fix {
        answer: StructuredAnswer,
        note: String,
    },
    Fail(ValidationFailure),
}

/// One check in the validator chain. Steps run in order and each receives
/// the answer produced by the step before it.
pub trait ValidationStep: Send + Sync {
    fn name(&self) -> &'static str;

    fn check(&self, answer: StructuredAnswer, known_sources: &[String]) -> StepOutcome;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnswerLimits {
    pub min_chars: usize,
    pub max_chars: usize,
}

impl Default for AnswerLimits {
    fn default() -> Self {
        Self {
            min_chars: 5,
            max_chars: 1000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnswerLength {
    limits: AnswerLimits,
}

impl AnswerLength {
    pub fn new(limits: AnswerLimits) -> Self {
        Self { limits }
    }
}

impl ValidationStep for AnswerLength {
    fn name(&self) -> &'static str {
        "answer_length"
    }

    fn check(&self, mut answer: StructuredAnswer, _known_sources: &[String]) -> StepOutcome {
        let trimmed = answer.answer.trim();
        let length = trimmed.chars().count();
        if length < self.limits.min_chars {
            return StepOutcome::Fail(ValidationFailure::recoverable(format!(
                "answer must be at least {} characters",
                self.limits.min_chars
            )));
        }

        if length > self.limits.max_chars {
            let truncated = trimmed
                .chars()
                .take(self.limits.max_chars)
                .collect::<String>();
            answer.answer = truncated;
            return StepOutcome::Fix {
                answer,
                note: format!("truncated answer from {length} characters"),
            };
        }

        if trimmed.len() != answer.answer.len() {
            answer.answer = trimmed.to_string();
        }
        StepOutcome::Pass(answer)
    }
}

/// Rejects answers containing any configured term. A term list that fails to
/// compile rejects every answer instead of letting them through unchecked.
#[derive(Debug, Clone)]
pub struct ToxicLanguage {
    pattern: Result<Option<Regex>, String>,
}

impl ToxicLanguage {
    pub fn new<I, S>(terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let alternatives = terms
            .into_iter()
            .map(|term| regex::escape(term.as_ref().trim()))
            .filter(|term| !term.is_empty())
            .collect::<Vec<_>>();
        if alternatives.is_empty() {
            return Self { pattern: Ok(None) };
        }

        Self::from_compiled(
            RegexBuilder::new(&format!(r"\b(?:{})\b", alternatives.join("|")))
                .case_insensitive(true)
                .build()
                .map(Some),
        )
    }

    fn from_compiled(compiled: Result<Option<Regex>, regex::Error>) -> Self {
        let pattern = compiled.map_err(|err| {
            warn!(
                error = %err,
                "toxic term pattern failed to compile, every answer will be rejected"
            );
            err.to_string()
        });
        Self { pattern }
    }
}

impl Default for ToxicLanguage {
    fn default() -> Self {
        Self::new(DEFAULT_TOXIC_TERMS)
    }
}

impl ValidationStep for ToxicLanguage {
    fn name(&self) -> &'static str {
        "toxic_language"
    }

    fn check(&self, answer: StructuredAnswer, _known_sources: &[String]) -> StepOutcome {
        match &self.pattern {
            Ok(Some(pattern)) if pattern.is_match(&answer.answer) => StepOutcome::Fail(
                ValidationFailure::fatal("answer contains toxic language"),
            ),
            Ok(_) => StepOutcome::Pass(answer),
            Err(message) => StepOutcome::Fail(ValidationFailure::fatal(format!(
                "toxic language filter unavailable: {message}"
            ))),
        }
    }
}

const PII_PATTERNS: [(&str, &str); 4] = [
    ("ssn", r"\b\d{3}-\d{2}-\d{4}\b"),
    ("card", r"\b\d(?:[ -]?\d){12,15}\b"),
    ("email", r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b"),
    (
        "phone",
        r"(?:\+\d{1,2}[ .-]?)?(?:\(\d{3}\)|\b\d{3})[ .-]?\d{3}[ .-]\d{4}\b",
    ),
];

/// Replaces personal data with [`REDACTED`](REDACTION_MARKER). Like
/// [`ToxicLanguage`], a pattern that fails to compile rejects every answer.
#[derive(Debug, Clone)]
pub struct PiiRedaction {
    patterns: Result<Vec<(&'static str, Regex)>, String>,
}

impl PiiRedaction {
    fn compile(patterns: &[(&'static str, &str)]) -> Self {
        let patterns = patterns
            .iter()
            .map(|(kind, pattern)| Regex::new(pattern).map(|regex| (*kind, regex)))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| {
                warn!(
                    error = %err,
                    "pii pattern failed to compile, every answer will be rejected"
                );
                err.to_string()
            });
        Self { patterns }
    }
}

impl Default for PiiRedaction {
    fn default() -> Self {
        Self::compile(&PII_PATTERNS)
    }
}

impl ValidationStep for PiiRedaction {
    fn name(&self) -> &'static str {
        "pii_redaction"
    }

    fn check(&self, mut answer: StructuredAnswer, _known_sources: &[String]) -> StepOutcome {
        let patterns = match &self.patterns {
            Ok(patterns) => patterns,
            Err(message) => {
                return StepOutcome::Fail(ValidationFailure::fatal(format!(
                    "pii filter unavailable: {message}"
                )));
            }
        };

        let mut redacted_kinds = Vec::new();
        for (kind, pattern) in patterns {
            if pattern.is_match(&answer.answer) {
                answer.answer = pattern
                    .replace_all(&answer.answer, REDACTION_MARKER)
                    .into_owned();
                redacted_kinds.push(*kind);
            }
        }

        if redacted_kinds.is_empty() {
            StepOutcome::Pass(answer)
        } else {
            StepOutcome::Fix {
                answer,
                note: format!("redacted {}", redacted_kinds.join(", ")),
            }
        }
    }
}

/// Keeps only sources the retriever actually returned. A source cited by
/// bare file name is mapped to the matching retrieved path.
#[derive(Debug, Clone, Copy, Default)]
pub struct SourceGrounding;

impl SourceGrounding {
    fn resolve<'a>(cited: &str, known_sources: &'a [String]) -> Option<&'a String> {
        let cited = cited.trim();
        known_sources
            .iter()
            .find(|known| known.as_str() == cited)
            .or_else(|| {
                known_sources
                    .iter()
                    .find(|known| known.rsplit('/').next() == Some(cited))
            })
    }
}

impl ValidationStep for SourceGrounding {
    fn name(&self) -> &'static str {
        "source_grounding"
    }

    fn check(&self, mut answer: StructuredAnswer, known_sources: &[String]) -> StepOutcome {
        let mut grounded: Vec<String> = Vec::with_capacity(answer.sources.len());
        for cited in &answer.sources {
            if let Some(known) = Self::resolve(cited, known_sources)
                && !grounded.contains(known)
            {
                grounded.push(known.clone());
            }
        }

        let mut notes = Vec::new();
        if grounded != answer.sources {
            notes.push(format!(
                "kept {} of {} cited sources",
                grounded.len(),
                answer.sources.len()
            ));
            answer.sources = grounded;
        }
        if answer.sources.is_empty() && answer.confidence != Confidence::Low {
            notes.push(format!(
                "downgraded {} confidence without sources",
                answer.confidence.as_str()
            ));
            answer.confidence = Confidence::Low;
        }

        if notes.is_empty() {
            StepOutcome::Pass(answer)
        } else {
            StepOutcome::Fix {
                answer,
                note: notes.join("; "),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use regex::Regex;

    use super::{
        AnswerLength, AnswerLimits, PiiRedaction, SourceGrounding, StepOutcome, ToxicLanguage,
        ValidationStep,
    };
    use crate::models::{Confidence, StructuredAnswer};

    fn answer(text: &str, confidence: Confidence, sources: &[&str]) -> StructuredAnswer {
        StructuredAnswer {
            answer: text.to_string(),
            confidence,
            sources: sources.iter().map(|source| source.to_string()).collect(),
        }
    }

    fn fixed(outcome: StepOutcome) -> StructuredAnswer {
        match outcome {
            StepOutcome::Fix { answer, .. } => answer,
            StepOutcome::Pass(_) => panic!("expected fix, got pass"),
            StepOutcome::Fail(failure) => panic!("expected fix, got failure {failure}"),
        }
    }

    #[test]
    fn length_trims_surrounding_whitespace() {
        let step = AnswerLength::new(AnswerLimits {
            min_chars: 5,
            max_chars: 20,
        });

        let StepOutcome::Pass(passed) =
            step.check(answer("  hello world ", Confidence::High, &[]), &[])
        else {
            panic!("expected pass");
        };
        assert_eq!(passed.answer, "hello world");
    }

    #[test]
    fn length_truncates_on_char_boundary() {
        let step = AnswerLength::new(AnswerLimits {
            min_chars: 1,
            max_chars: 3,
        });
        let repaired = fixed(step.check(answer("héllo", Confidence::High, &[]), &[]));
        assert_eq!(repaired.answer, "hél");
    }

    #[test]
    fn toxic_terms_match_whole_words_case_insensitively() {
        let step = ToxicLanguage::default();
        assert!(matches!(
            step.check(answer("You are an IDIOT.", Confidence::High, &[]), &[]),
            StepOutcome::Fail(failure) if !failure.recoverable
        ));
        assert!(matches!(
            step.check(answer("Stupidity is not a policy term.", Confidence::High, &[]), &[]),
            StepOutcome::Pass(_)
        ));
    }

    #[test]
    fn pii_is_redacted() {
        let step = PiiRedaction::default();
        let repaired = fixed(step.check(
            answer(
                "Call 555-123-4567 or mail a@b.co, SSN 123-45-6789, card 4111 1111 1111 1111.",
                Confidence::High,
                &[],
            ),
            &[],
        ));

        assert_eq!(
            repaired.answer,
            "Call [REDACTED] or mail [REDACTED], SSN [REDACTED], card [REDACTED]."
        );
    }

    #[test]
    fn filters_that_fail_to_compile_reject_every_answer() {
        let toxic = ToxicLanguage::from_compiled(Regex::new("(unclosed").map(Some));
        assert!(matches!(
            toxic.check(answer("Refunds take 30 days.", Confidence::High, &[]), &[]),
            StepOutcome::Fail(failure) if !failure.recoverable
        ));

        let pii = PiiRedaction::compile(&[("email", "[a-z")]);
        assert!(matches!(
            pii.check(answer("Refunds take 30 days.", Confidence::High, &[]), &[]),
            StepOutcome::Fail(failure) if failure.reason.starts_with("pii filter unavailable")
        ));

        let empty = ToxicLanguage::new(Vec::<String>::new());
        assert!(matches!(
            empty.check(answer("Refunds take 30 days.", Confidence::High, &[]), &[]),
            StepOutcome::Pass(_)
        ));
    }

    #[test]
    fn pii_leaves_ordinary_numbers_alone() {
        let step = PiiRedaction::default();
        assert!(matches!(
            step.check(
                answer("Refunds within 30 days, order 2024-01-15.", Confidence::High, &[]),
                &[]
            ),
            StepOutcome::Pass(_)
        ));
    }

    #[test]
    fn grounding_maps_bare_names_and_downgrades_unsupported_confidence() {
        let known = vec!["policies/refund.txt".to_string()];

        let repaired = fixed(SourceGrounding.check(
            answer("Refunds take 30 days.", Confidence::High, &["refund.txt", "refund.txt"]),
            &known,
        ));
        assert_eq!(repaired.sources, vec!["policies/refund.txt"]);
        assert_eq!(repaired.confidence, Confidence::High);

        let repaired = fixed(SourceGrounding.check(
            answer("Refunds take 30 days.", Confidence::Medium, &["made-up.pdf"]),
            &known,
        ));
        assert!(repaired.sources.is_empty());
        assert_eq!(repaired.confidence, Confidence::Low);
    }
}
