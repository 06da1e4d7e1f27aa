//! Unified diff parsing, validation, and application
//!
//! A refinement diff must parse as a single unified patch, apply cleanly to
//! the current prompt body, stay within the size and shape bounds, never
//! delete more than five consecutive lines, and preserve every template
//! variable the prompt had before.

use diffy::{Line, Patch};
use serde::{Deserialize, Serialize};

use crate::render::extract_variables;

/// Size and shape bounds on a refinement diff
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffLimits {
    /// Post-apply character-count change, as a fraction of the old length
    pub max_length_delta: f64,
    /// Post-apply line-count change, as a fraction of the old line count
    pub max_line_delta: f64,
    /// Longest allowed run of consecutive deleted lines
    pub max_deletion_run: usize,
}

impl Default for DiffLimits {
    fn default() -> Self {
        Self {
            max_length_delta: 0.15,
            max_line_delta: 0.20,
            max_deletion_run: 5,
        }
    }
}

/// Why a diff was rejected
#[derive(Debug, Clone, thiserror::Error)]
pub enum DiffError {
    #[error("diff does not parse as a unified patch: {0}")]
    Parse(String),

    #[error("diff does not address prompt.txt (got {0})")]
    WrongTarget(String),

    #[error("diff does not apply cleanly: {0}")]
    DoesNotApply(String),

    #[error("length changes by {actual:.1}% (limit {limit:.1}%)")]
    LengthDelta { actual: f64, limit: f64 },

    #[error("line count changes by {actual:.1}% (limit {limit:.1}%)")]
    LineDelta { actual: f64, limit: f64 },

    #[error("deletion run of {run} consecutive lines (limit {limit})")]
    DeletionRun { run: usize, limit: usize },

    #[error("template variables lost by the diff: {0}")]
    LostVariables(String),
}

/// Validate a diff against the current prompt body and return the new body
pub fn validate_and_apply(diff_text: &str, old_body: &str, limits: &DiffLimits) -> Result<String, DiffError> {
    let patch = Patch::from_str(diff_text).map_err(|e| DiffError::Parse(e.to_string()))?;

    if let Some(original) = patch.original() {
        let name = format!("{original}");
        if !name.contains("prompt.txt") && name != "original" {
            return Err(DiffError::WrongTarget(name));
        }
    }

    check_deletion_runs(&patch, limits)?;

    let new_body = diffy::apply(old_body, &patch).map_err(|e| DiffError::DoesNotApply(e.to_string()))?;

    let old_len = old_body.chars().count().max(1);
    let new_len = new_body.chars().count();
    let length_delta = (new_len as f64 - old_len as f64).abs() / old_len as f64;
    if length_delta > limits.max_length_delta {
        return Err(DiffError::LengthDelta {
            actual: length_delta * 100.0,
            limit: limits.max_length_delta * 100.0,
        });
    }

    let old_lines = old_body.lines().count().max(1);
    let new_lines = new_body.lines().count();
    let line_delta = (new_lines as f64 - old_lines as f64).abs() / old_lines as f64;
    if line_delta > limits.max_line_delta {
        return Err(DiffError::LineDelta {
            actual: line_delta * 100.0,
            limit: limits.max_line_delta * 100.0,
        });
    }

    let old_vars = extract_variables(old_body);
    let new_vars = extract_variables(&new_body);
    let lost: Vec<&String> = old_vars.iter().filter(|v| !new_vars.contains(*v)).collect();
    if !lost.is_empty() {
        return Err(DiffError::LostVariables(
            lost.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", "),
        ));
    }

    Ok(new_body)
}

fn check_deletion_runs(patch: &Patch<'_, str>, limits: &DiffLimits) -> Result<(), DiffError> {
    for hunk in patch.hunks() {
        let mut run = 0usize;
        for line in hunk.lines() {
            match line {
                Line::Delete(_) => {
                    run += 1;
                    if run > limits.max_deletion_run {
                        return Err(DiffError::DeletionRun {
                            run,
                            limit: limits.max_deletion_run,
                        });
                    }
                }
                _ => run = 0,
            }
        }
    }
    Ok(())
}

/// Render a unified diff between two prompt bodies addressing prompt.txt
///
/// Used by tests and by review edits to restate an edited body as a diff.
pub fn diff_between(old_body: &str, new_body: &str) -> String {
    let patch = diffy::create_patch(old_body, new_body);
    patch
        .to_string()
        .replacen("--- original", "--- a/prompt.txt", 1)
        .replacen("+++ modified", "+++ b/prompt.txt", 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prompt(lines: usize) -> String {
        (1..=lines)
            .map(|n| format!("Line {n} of the prompt with {{{{var}}}} usage."))
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn test_round_trip() {
        let old = prompt(10);
        let new = old.replace("Line 3", "Rewritten line 3");
        let diff = diff_between(&old, &new);
        let applied = validate_and_apply(&diff, &old, &DiffLimits::default()).unwrap();
        assert_eq!(applied, new);
    }

    #[test]
    fn test_unparseable_diff() {
        let result = validate_and_apply("this is not a diff", &prompt(5), &DiffLimits::default());
        assert!(matches!(result, Err(DiffError::Parse(_))));
    }

    #[test]
    fn test_diff_must_apply_cleanly() {
        let old = prompt(10);
        let new = old.replace("Line 3", "Rewritten line 3");
        let diff = diff_between(&old, &new);
        // Apply against a different body
        let other = prompt(10).replace("Line", "Row");
        let result = validate_and_apply(&diff, &other, &DiffLimits::default());
        assert!(matches!(result, Err(DiffError::DoesNotApply(_))));
    }

    #[test]
    fn test_length_growth_bounded() {
        let old = prompt(10);
        let mut new = old.clone();
        new.push_str(&"\nPadding line that makes the prompt much much longer.".repeat(10));
        let diff = diff_between(&old, &new);
        let result = validate_and_apply(&diff, &old, &DiffLimits::default());
        assert!(matches!(result, Err(DiffError::LengthDelta { .. })));
    }

    #[test]
    fn test_deletion_run_bounded() {
        // Remove 12 consecutive lines out of 50
        let old = prompt(50);
        let lines: Vec<&str> = old.lines().collect();
        let new: String = lines
            .iter()
            .enumerate()
            .filter(|(index, _)| !(10..22).contains(index))
            .map(|(_, line)| *line)
            .collect::<Vec<_>>()
            .join("\n");
        let diff = diff_between(&old, &new);
        let result = validate_and_apply(&diff, &old, &DiffLimits::default());
        assert!(matches!(result, Err(DiffError::DeletionRun { .. })));
    }

    #[test]
    fn test_small_deletion_run_allowed() {
        // Removing 2 of 50 lines stays within every bound
        let old = prompt(50);
        let lines: Vec<&str> = old.lines().collect();
        let new: String = lines
            .iter()
            .enumerate()
            .filter(|(index, _)| !(10..12).contains(index))
            .map(|(_, line)| *line)
            .collect::<Vec<_>>()
            .join("\n");
        let diff = diff_between(&old, &new);
        assert!(validate_and_apply(&diff, &old, &DiffLimits::default()).is_ok());
    }

    #[test]
    fn test_template_variables_preserved() {
        let old = "Translate {{text}} into {{language}}.\nBe terse.\nKeep names.\nAvoid slang.\nReturn only the translation.".to_string();
        let new = old.replace("{{language}}", "French");
        let diff = diff_between(&old, &new);
        let result = validate_and_apply(&diff, &old, &DiffLimits::default());
        match result {
            Err(DiffError::LostVariables(vars)) => assert!(vars.contains("language")),
            other => panic!("expected LostVariables, got {other:?}"),
        }
    }

    #[test]
    fn test_wrong_target_rejected() {
        let old = prompt(10);
        let new = old.replace("Line 2", "Changed line 2");
        let diff = diff_between(&old, &new).replace("prompt.txt", "system.txt");
        let result = validate_and_apply(&diff, &old, &DiffLimits::default());
        assert!(matches!(result, Err(DiffError::WrongTarget(_))));
    }

    proptest::proptest! {
        // apply(diff(old, new), old) == new for single-line edits anywhere
        // in the prompt
        #[test]
        fn prop_diff_round_trip(line_count in 6usize..40, edit_index in 0usize..40) {
            let old = prompt(line_count);
            let target = edit_index % line_count + 1;
            let new = old.replace(
                &format!("Line {target} of"),
                &format!("Line {target} (edited) of"),
            );
            let diff = diff_between(&old, &new);
            let applied = validate_and_apply(&diff, &old, &DiffLimits::default()).unwrap();
            proptest::prop_assert_eq!(applied, new);
        }
    }
}
