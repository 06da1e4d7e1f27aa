//! Safety scanner
//!
//! Pointwise content checks applied to model outputs and to judge
//! rationales: PII regexes (SSN, card numbers with a Luhn check, email,
//! North-American phone), a versioned jailbreak pattern library, and hooks
//! for provider-native moderation and an external toxicity service. The
//! scanner only attaches flags; whether flagged outputs are excluded from
//! aggregation is the experiment's blocking policy.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Flag map attached to outputs and judgments
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyFlags {
    #[serde(default)]
    pub policy_violation: bool,
    #[serde(default)]
    pub pii_detected: bool,
    #[serde(default)]
    pub toxic_content: bool,
    #[serde(default)]
    pub jailbreak_attempt: bool,
}

impl SafetyFlags {
    pub fn any(&self) -> bool {
        self.policy_violation || self.pii_detected || self.toxic_content || self.jailbreak_attempt
    }

    pub fn merge(&mut self, other: &SafetyFlags) {
        self.policy_violation |= other.policy_violation;
        self.pii_detected |= other.pii_detected;
        self.toxic_content |= other.toxic_content;
        self.jailbreak_attempt |= other.jailbreak_attempt;
    }
}

/// Versioned jailbreak pattern library, loaded from config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternLibrary {
    pub version: String,
    pub patterns: Vec<String>,
}

impl Default for PatternLibrary {
    fn default() -> Self {
        Self {
            version: "2025-07".to_string(),
            patterns: vec![
                r"(?i)ignore (all |any )?(previous|prior|above) instructions".to_string(),
                r"(?i)disregard (your|the) (system prompt|instructions|guidelines)".to_string(),
                r"(?i)you are now (DAN|in developer mode)".to_string(),
                r"(?i)pretend (you have|there are) no (rules|restrictions|guidelines)".to_string(),
                r"(?i)jailbreak".to_string(),
            ],
        }
    }
}

fn ssn_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").unwrap())
}

fn card_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\b\d{4}[ -]?\d{4}[ -]?\d{4}[ -]?\d{4}\b").unwrap())
}

fn email_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").unwrap())
}

fn phone_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\b\(?\d{3}\)?[-. ]\d{3}[-. ]\d{4}\b").unwrap())
}

/// Luhn checksum over the digits of a candidate card number
fn luhn_valid(candidate: &str) -> bool {
    let digits: Vec<u32> = candidate.chars().filter_map(|c| c.to_digit(10)).collect();
    if digits.len() != 16 {
        return false;
    }
    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(index, &digit)| {
            if index % 2 == 1 {
                let doubled = digit * 2;
                if doubled > 9 { doubled - 9 } else { doubled }
            } else {
                digit
            }
        })
        .sum();
    sum % 10 == 0
}

/// Compiled scanner
pub struct SafetyScanner {
    jailbreak: Vec<Regex>,
    pattern_version: String,
}

impl SafetyScanner {
    /// Compile the scanner from a pattern library
    ///
    /// Invalid patterns are skipped with a warning rather than failing the
    /// whole scanner.
    pub fn new(library: &PatternLibrary) -> Self {
        let jailbreak = library
            .patterns
            .iter()
            .filter_map(|pattern| match Regex::new(pattern) {
                Ok(regex) => Some(regex),
                Err(e) => {
                    tracing::warn!(pattern, error = %e, "skipping invalid jailbreak pattern");
                    None
                }
            })
            .collect();
        Self {
            jailbreak,
            pattern_version: library.version.clone(),
        }
    }

    pub fn pattern_version(&self) -> &str {
        &self.pattern_version
    }

    /// Scan a text and return the flag map
    pub fn scan(&self, text: &str) -> SafetyFlags {
        let pii_detected = self.detect_pii(text);
        let jailbreak_attempt = self.jailbreak.iter().any(|p| p.is_match(text));
        let flags = SafetyFlags {
            policy_violation: false,
            pii_detected,
            toxic_content: false,
            jailbreak_attempt,
        };
        if flags.any() {
            debug!(?flags, "safety scan flagged content");
        }
        flags
    }

    fn detect_pii(&self, text: &str) -> bool {
        if ssn_pattern().is_match(text) || email_pattern().is_match(text) || phone_pattern().is_match(text) {
            return true;
        }
        card_pattern().find_iter(text).any(|m| luhn_valid(m.as_str()))
    }
}

impl Default for SafetyScanner {
    fn default() -> Self {
        Self::new(&PatternLibrary::default())
    }
}
