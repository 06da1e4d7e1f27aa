//! Budget and stop-rule engine
//!
//! Two gates around every iteration: the pre-gate refuses to start work
//! (budget headroom, credentials, non-empty dataset) and the post-gate
//! decides whether the experiment continues (max iterations, budget,
//! convergence, refiner drought). A one-shot cost alert fires at the
//! configured fraction of the budget without blocking anything.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info};

use crate::aggregate::converged;
use crate::domain::StopRules;
use crate::error::{EdisonError, Result};

/// Spend window consulted by the budget gate
pub const SPEND_WINDOW_MS: i64 = 30 * 24 * 60 * 60 * 1000;

/// Why an experiment stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    MaxIterations,
    BudgetExhausted,
    Converged,
    NoRefinement,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MaxIterations => "max_iterations",
            Self::BudgetExhausted => "budget_exhausted",
            Self::Converged => "converged",
            Self::NoRefinement => "no_refinement",
        }
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Post-gate verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopDecision {
    Stop(StopReason),
    Continue,
}

/// Pre-iteration gate, evaluated before any job is enqueued
///
/// `missing_credentials` lists selected providers with no configured
/// credential.
pub fn pre_iteration_gate(
    stop_rules: &StopRules,
    spend_usd: f64,
    estimated_cost_usd: f64,
    missing_credentials: &[String],
    dataset_len: usize,
) -> Result<()> {
    if dataset_len == 0 {
        return Err(EdisonError::Validation("dataset is empty".to_string()));
    }
    if !missing_credentials.is_empty() {
        return Err(EdisonError::AuthFailure(format!(
            "no active credential for provider(s): {}",
            missing_credentials.join(", ")
        )));
    }
    if let Some(budget) = stop_rules.max_budget_usd
        && spend_usd + estimated_cost_usd >= budget
    {
        return Err(EdisonError::BudgetExceeded {
            spend_usd,
            estimate_usd: estimated_cost_usd,
            budget_usd: budget,
        });
    }
    debug!(spend_usd, estimated_cost_usd, "pre-iteration gate passed");
    Ok(())
}

/// Post-iteration gate, evaluated after aggregation
///
/// `composite_history` is ascending by iteration number and includes the
/// just-finished iteration. `refined` is whether this iteration staged a
/// valid (PENDING) suggestion; an INVALID suggestion counts as no
/// refinement.
pub fn post_iteration_gate(
    stop_rules: &StopRules,
    iteration_number: u32,
    spend_usd: f64,
    composite_history: &[f64],
    refined: bool,
) -> StopDecision {
    if iteration_number >= stop_rules.max_iterations {
        info!(iteration_number, "stop: max iterations reached");
        return StopDecision::Stop(StopReason::MaxIterations);
    }
    if let Some(budget) = stop_rules.max_budget_usd
        && spend_usd >= budget
    {
        info!(spend_usd, budget, "stop: budget exhausted");
        return StopDecision::Stop(StopReason::BudgetExhausted);
    }
    if converged(
        composite_history,
        stop_rules.convergence_window,
        stop_rules.min_delta_threshold,
    ) {
        info!(window = stop_rules.convergence_window, "stop: converged");
        return StopDecision::Stop(StopReason::Converged);
    }
    if !refined && stop_rules.stop_if_no_refinement {
        info!("stop: no refinement this iteration");
        return StopDecision::Stop(StopReason::NoRefinement);
    }
    StopDecision::Continue
}

/// One-shot cost alert
///
/// `check` returns the (spend, budget) pair exactly once, the first time
/// spend crosses `alert_threshold * max_budget`.
#[derive(Default)]
pub struct CostAlertGate {
    fired: AtomicBool,
}

impl CostAlertGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&self, stop_rules: &StopRules, spend_usd: f64) -> Option<(f64, f64)> {
        let budget = stop_rules.max_budget_usd?;
        if spend_usd < stop_rules.alert_threshold * budget {
            return None;
        }
        if self.fired.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some((spend_usd, budget))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(max_budget: Option<f64>) -> StopRules {
        StopRules {
            max_iterations: 10,
            min_delta_threshold: 0.02,
            convergence_window: 3,
            max_budget_usd: max_budget,
            alert_threshold: 0.8,
            stop_if_no_refinement: false,
        }
    }

    #[test]
    fn test_pre_gate_budget() {
        let rules = rules(Some(1.0));
        assert!(pre_iteration_gate(&rules, 0.5, 0.2, &[], 10).is_ok());

        let result = pre_iteration_gate(&rules, 0.9, 0.2, &[], 10);
        assert!(matches!(result, Err(EdisonError::BudgetExceeded { .. })));

        // Exactly at the budget is still a refusal
        let result = pre_iteration_gate(&rules, 0.9, 0.1, &[], 10);
        assert!(matches!(result, Err(EdisonError::BudgetExceeded { .. })));
    }

    #[test]
    fn test_pre_gate_no_budget_configured() {
        assert!(pre_iteration_gate(&rules(None), 1000.0, 50.0, &[], 10).is_ok());
    }

    #[test]
    fn test_pre_gate_empty_dataset() {
        let result = pre_iteration_gate(&rules(None), 0.0, 0.0, &[], 0);
        assert!(matches!(result, Err(EdisonError::Validation(_))));
    }

    #[test]
    fn test_pre_gate_missing_credentials() {
        let missing = vec!["anthropic".to_string()];
        let result = pre_iteration_gate(&rules(None), 0.0, 0.0, &missing, 5);
        assert!(matches!(result, Err(EdisonError::AuthFailure(_))));
    }

    #[test]
    fn test_post_gate_max_iterations() {
        let decision = post_iteration_gate(&rules(None), 10, 0.0, &[7.0], true);
        assert_eq!(decision, StopDecision::Stop(StopReason::MaxIterations));
    }

    #[test]
    fn test_post_gate_budget() {
        let decision = post_iteration_gate(&rules(Some(1.0)), 2, 1.1, &[7.0, 7.5], true);
        assert_eq!(decision, StopDecision::Stop(StopReason::BudgetExhausted));
    }

    #[test]
    fn test_post_gate_convergence() {
        let history = [7.00, 7.10, 7.11, 7.12];
        let decision = post_iteration_gate(&rules(None), 4, 0.0, &history, true);
        assert_eq!(decision, StopDecision::Stop(StopReason::Converged));
    }

    #[test]
    fn test_post_gate_no_refinement() {
        let mut strict = rules(None);
        strict.stop_if_no_refinement = true;
        let decision = post_iteration_gate(&strict, 2, 0.0, &[7.0, 7.5], false);
        assert_eq!(decision, StopDecision::Stop(StopReason::NoRefinement));

        // Without the flag, the drought does not stop the loop
        let decision = post_iteration_gate(&rules(None), 2, 0.0, &[7.0, 7.5], false);
        assert_eq!(decision, StopDecision::Continue);
    }

    #[test]
    fn test_post_gate_continue() {
        let decision = post_iteration_gate(&rules(Some(10.0)), 2, 0.5, &[7.0, 7.5], true);
        assert_eq!(decision, StopDecision::Continue);
    }

    #[test]
    fn test_cost_alert_is_one_shot() {
        let gate = CostAlertGate::new();
        let rules = rules(Some(1.0));

        assert!(gate.check(&rules, 0.5).is_none());
        let fired = gate.check(&rules, 0.85);
        assert_eq!(fired, Some((0.85, 1.0)));
        // Never again
        assert!(gate.check(&rules, 0.99).is_none());
    }

    #[test]
    fn test_cost_alert_without_budget() {
        let gate = CostAlertGate::new();
        assert!(gate.check(&rules(None), 1000.0).is_none());
    }
}
