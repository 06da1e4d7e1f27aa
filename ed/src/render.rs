//! Prompt template rendering
//!
//! Case inputs are substituted into the prompt body via `{{name}}`
//! placeholders. Rendering is strict: a variable with no binding is a
//! validation error, never a silent blank.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use handlebars::Handlebars;
use regex::Regex;
use tracing::debug;

use crate::error::{EdisonError, Result};

fn variable_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_-]*)\s*\}\}").unwrap())
}

/// Extract the `{{name}}` template variables appearing in a prompt body
pub fn extract_variables(body: &str) -> BTreeSet<String> {
    variable_pattern()
        .captures_iter(body)
        .map(|c| c[1].to_string())
        .collect()
}

/// Strict handlebars renderer for prompt bodies
pub struct PromptRenderer {
    handlebars: Handlebars<'static>,
}

impl Default for PromptRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptRenderer {
    pub fn new() -> Self {
        let mut handlebars = Handlebars::new();
        handlebars.set_strict_mode(true);
        handlebars.register_escape_fn(handlebars::no_escape);
        Self { handlebars }
    }

    /// Render a prompt body against a case's variable bindings
    pub fn render(&self, body: &str, vars: &BTreeMap<String, String>) -> Result<String> {
        debug!(var_count = vars.len(), body_len = body.len(), "PromptRenderer::render");

        // Surface the full missing set up front; strict mode alone reports
        // only the first hole
        let required = extract_variables(body);
        let missing: Vec<&String> = required.iter().filter(|name| !vars.contains_key(*name)).collect();
        if !missing.is_empty() {
            return Err(EdisonError::Validation(format!(
                "case is missing template variables: {}",
                missing.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
            )));
        }

        self.handlebars
            .render_template(body, vars)
            .map_err(|e| EdisonError::Validation(format!("template render failed: {e}")))
    }
}
