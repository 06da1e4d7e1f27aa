//! Synthetic dataset generation
//!
//! The `generate-dataset` phase asks an LLM to fabricate cases for the
//! experiment's template variables, using the same strict-JSON discipline as
//! the judges.

use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;
use tracing::{debug, warn};

use super::verdict::strip_code_fences;
use crate::domain::Case;
use crate::error::{EdisonError, Result};
use crate::provider::{ChatMessage, ChatOptions, ProviderAdapter};

#[derive(Debug, Deserialize)]
struct CasesWire {
    cases: Vec<CaseWire>,
}

#[derive(Debug, Deserialize)]
struct CaseWire {
    input: BTreeMap<String, String>,
    #[serde(default)]
    expected: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default = "default_difficulty")]
    difficulty: u8,
}

fn default_difficulty() -> u8 {
    3
}

/// Generate `count` synthetic cases binding every template variable
///
/// Cases missing a required variable are dropped with a warning; an empty
/// result is a parse failure.
pub async fn generate_cases(
    adapter: &ProviderAdapter,
    objective: &str,
    prompt_body: &str,
    variables: &BTreeSet<String>,
    count: usize,
) -> Result<Vec<Case>> {
    let variable_list = variables.iter().cloned().collect::<Vec<_>>().join(", ");
    let prompt = format!(
        "Generate {count} diverse test cases for evaluating a prompt.\n\
         Objective: {objective}\n\n\
         Prompt template:\n{prompt_body}\n\n\
         Each case must bind every template variable: [{variable_list}].\n\
         Respond with ONLY a JSON object:\n\
         {{\"cases\": [{{\"input\": {{<variable>: <string>}}, \"expected\": <string or null>, \
         \"tags\": [<string>], \"difficulty\": <1-5>}}]}}",
    );

    let options = ChatOptions::default().with_temperature(0.8).json_mode();
    let response = adapter.chat(&[ChatMessage::user(&prompt)], &options).await?;

    let cleaned = strip_code_fences(&response.text);
    let wire: CasesWire = serde_json::from_str(cleaned)
        .map_err(|e| EdisonError::ParseFailure(format!("dataset generation reply is not valid JSON: {e}")))?;

    let mut cases = Vec::new();
    for candidate in wire.cases {
        let missing: Vec<&String> = variables.iter().filter(|v| !candidate.input.contains_key(*v)).collect();
        if !missing.is_empty() {
            warn!(?missing, "dropping generated case missing template variables");
            continue;
        }
        let mut case = Case::new(candidate.input)
            .with_tags(candidate.tags)
            .with_difficulty(candidate.difficulty.clamp(1, 5));
        if let Some(expected) = candidate.expected {
            case = case.with_expected(expected);
        }
        cases.push(case);
    }

    if cases.is_empty() {
        return Err(EdisonError::ParseFailure(
            "dataset generation produced no usable cases".to_string(),
        ));
    }
    debug!(generated = cases.len(), requested = count, "synthetic cases generated");
    Ok(cases)
}
