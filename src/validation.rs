//! Admission validation.
//!
//! Two surfaces share one validator: the loose surface (human clients,
//! defaults apply) and the strict surface (machine/tool clients, hard
//! field rules). Rejections name the offending field so callers can fix
//! their payload without guesswork.

use std::path::Path;

use crate::constants::{
    MAX_EXECUTION_PROMPT, STRICT_MAX_SYSTEM_PROMPT, STRICT_MIN_EXECUTION_PROMPT,
    STRICT_MIN_SYSTEM_PROMPT,
};
use crate::models::NewTask;
use crate::{CapstanError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionSurface {
    /// Human entry point: defaults apply, minimal constraints.
    Loose,
    /// Machine/tool entry point: strict field rules, no defaults invented.
    Strict,
}

/// Field-rule validator for task admission.
#[derive(Debug, Clone, Default)]
pub struct TaskAdmissionValidator;

impl TaskAdmissionValidator {
    pub fn new() -> Self {
        Self
    }

    /// Validate a task's inputs for the given surface.
    pub fn validate(&self, task: &NewTask, surface: AdmissionSurface) -> Result<()> {
        self.validate_execution_prompt(&task.execution_prompt, surface)?;
        if let Some(system_prompt) = &task.system_prompt {
            self.validate_system_prompt(system_prompt, surface)?;
        }
        self.validate_working_dir(&task.working_dir)?;
        Ok(())
    }

    fn validate_execution_prompt(&self, prompt: &str, surface: AdmissionSurface) -> Result<()> {
        let length = prompt.chars().count();
        if length == 0 {
            return Err(CapstanError::validation(
                "execution_prompt",
                "must not be empty",
            ));
        }
        if length > MAX_EXECUTION_PROMPT {
            return Err(CapstanError::validation(
                "execution_prompt",
                format!("must be at most {MAX_EXECUTION_PROMPT} characters, got {length}"),
            ));
        }
        if surface == AdmissionSurface::Strict {
            if length < STRICT_MIN_EXECUTION_PROMPT {
                return Err(CapstanError::validation(
                    "execution_prompt",
                    format!(
                        "must be at least {STRICT_MIN_EXECUTION_PROMPT} characters, got {length}"
                    ),
                ));
            }
            // A task for a coding agent that names no path is almost always
            // a malformed tool call.
            if !prompt.contains('/') && !prompt.contains('\\') {
                return Err(CapstanError::validation(
                    "execution_prompt",
                    "must contain a path-like fragment ('/' or '\\')",
                ));
            }
        }
        Ok(())
    }

    fn validate_system_prompt(&self, prompt: &str, surface: AdmissionSurface) -> Result<()> {
        if surface != AdmissionSurface::Strict {
            return Ok(());
        }
        let length = prompt.chars().count();
        if length < STRICT_MIN_SYSTEM_PROMPT || length > STRICT_MAX_SYSTEM_PROMPT {
            return Err(CapstanError::validation(
                "system_prompt",
                format!(
                    "must be {STRICT_MIN_SYSTEM_PROMPT}-{STRICT_MAX_SYSTEM_PROMPT} characters, got {length}"
                ),
            ));
        }
        Ok(())
    }

    /// The working directory is always the client-supplied value; the
    /// service never substitutes its own. Both surfaces require it
    /// absolute; omission is a request-shape error upstream.
    fn validate_working_dir(&self, dir: &str) -> Result<()> {
        if dir.trim().is_empty() {
            return Err(CapstanError::validation(
                "working_dir",
                "must not be empty",
            ));
        }
        if !Path::new(dir).is_absolute() {
            return Err(CapstanError::validation(
                "working_dir",
                format!("must be an absolute path, got {dir:?}"),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ModelTier;

    fn task(prompt: &str, system: Option<&str>, dir: &str) -> NewTask {
        NewTask {
            execution_prompt: prompt.to_string(),
            working_dir: dir.to_string(),
            system_prompt: system.map(str::to_string),
            model_tier: ModelTier::Balanced,
        }
    }

    /// A prompt of exactly `len` characters that satisfies the path rule.
    fn prompt_of(len: usize) -> String {
        let mut p = String::from("update /srv/app: ");
        while p.chars().count() < len {
            p.push('x');
        }
        p
    }

    #[test]
    fn strict_rejects_prompt_one_below_the_minimum() {
        let validator = TaskAdmissionValidator::new();
        let err = validator
            .validate(&task(&prompt_of(149), None, "/srv/app"), AdmissionSurface::Strict)
            .unwrap_err();
        assert!(
            matches!(err, CapstanError::Validation { ref field, .. } if field == "execution_prompt")
        );
    }

    #[test]
    fn strict_accepts_prompt_at_the_minimum() {
        let validator = TaskAdmissionValidator::new();
        validator
            .validate(&task(&prompt_of(150), None, "/srv/app"), AdmissionSurface::Strict)
            .unwrap();
    }

    #[test]
    fn strict_rejects_prompt_without_path_fragment() {
        let validator = TaskAdmissionValidator::new();
        let prompt = "x".repeat(200);
        let err = validator
            .validate(&task(&prompt, None, "/srv/app"), AdmissionSurface::Strict)
            .unwrap_err();
        assert!(err.to_string().contains("path-like"), "err was: {err}");
    }

    #[test]
    fn loose_accepts_short_prompts() {
        let validator = TaskAdmissionValidator::new();
        validator
            .validate(&task("fix it", None, "/srv/app"), AdmissionSurface::Loose)
            .unwrap();
    }

    #[test]
    fn empty_prompt_is_rejected_on_both_surfaces() {
        let validator = TaskAdmissionValidator::new();
        for surface in [AdmissionSurface::Loose, AdmissionSurface::Strict] {
            assert!(validator.validate(&task("", None, "/srv/app"), surface).is_err());
        }
    }

    #[test]
    fn strict_bounds_the_system_prompt() {
        let validator = TaskAdmissionValidator::new();
        let short = "too short";
        let good = "s".repeat(75);
        let long = "s".repeat(501);

        assert!(validator
            .validate(&task(&prompt_of(150), Some(short), "/srv"), AdmissionSurface::Strict)
            .is_err());
        assert!(validator
            .validate(&task(&prompt_of(150), Some(&good), "/srv"), AdmissionSurface::Strict)
            .is_ok());
        assert!(validator
            .validate(&task(&prompt_of(150), Some(&long), "/srv"), AdmissionSurface::Strict)
            .is_err());
    }

    #[test]
    fn loose_ignores_system_prompt_length() {
        let validator = TaskAdmissionValidator::new();
        validator
            .validate(&task("fix /srv", Some("hi"), "/srv"), AdmissionSurface::Loose)
            .unwrap();
    }

    #[test]
    fn relative_working_dir_is_rejected() {
        let validator = TaskAdmissionValidator::new();
        let err = validator
            .validate(&task(&prompt_of(150), None, "projects/app"), AdmissionSurface::Strict)
            .unwrap_err();
        assert!(
            matches!(err, CapstanError::Validation { ref field, .. } if field == "working_dir")
        );
    }

    #[test]
    fn oversized_prompt_is_rejected_everywhere() {
        let validator = TaskAdmissionValidator::new();
        let huge = format!("/srv {}", "x".repeat(MAX_EXECUTION_PROMPT + 10));
        for surface in [AdmissionSurface::Loose, AdmissionSurface::Strict] {
            assert!(validator.validate(&task(&huge, None, "/srv"), surface).is_err());
        }
    }
}
