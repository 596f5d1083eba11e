//! Usage and cost accounting.
//!
//! Prices are USD per 1000 tokens, looked up by model identifier: user
//! overrides from `config.toml` first, then the built-in table, then a
//! default rate. Model identifiers match an entry when they start with it,
//! and the longest matching entry wins.
//!
//! Totals are always recomputed from the attempt history, so a step retried
//! three times contributes three attempts' worth of tokens and cost.

use promptchain_types::config::ModelPricing;
use promptchain_types::workflow::{StepAttempt, StepDefinition, StepUsage, UsageSummary};

/// Tokens assumed per step when estimating a workflow before it runs.
pub const ESTIMATED_TOKENS_PER_STEP: i64 = 1500;

/// Rate used when no table entry matches.
pub const DEFAULT_PRICE_PER_1K: f64 = 0.002;

/// Built-in price table (USD per 1000 tokens).
const DEFAULT_PRICING: &[(&str, f64)] = &[("kimi-k2p5", 0.002), ("kimi-k2-instruct-0905", 0.0015)];

// ---------------------------------------------------------------------------
// CostAccountant
// ---------------------------------------------------------------------------

/// Prices tokens and aggregates attempt history into usage totals.
#[derive(Debug, Clone)]
pub struct CostAccountant {
    overrides: Vec<ModelPricing>,
    default_price_per_1k: f64,
}

impl Default for CostAccountant {
    fn default() -> Self {
        Self::new(Vec::new(), DEFAULT_PRICE_PER_1K)
    }
}

impl CostAccountant {
    pub fn new(overrides: Vec<ModelPricing>, default_price_per_1k: f64) -> Self {
        Self {
            overrides,
            default_price_per_1k: default_price_per_1k.max(0.0),
        }
    }

    /// USD per 1000 tokens for `model`.
    pub fn price_per_1k(&self, model: &str) -> f64 {
        let user = longest_match(
            model,
            self.overrides
                .iter()
                .map(|p| (p.model.as_str(), p.price_per_1k)),
        );
        user.or_else(|| longest_match(model, DEFAULT_PRICING.iter().copied()))
            .unwrap_or(self.default_price_per_1k)
            .max(0.0)
    }

    /// Cost of `tokens` on `model`. Missing, zero or negative counts cost nothing.
    pub fn cost(&self, model: &str, tokens: Option<i64>) -> f64 {
        match tokens {
            Some(t) if t > 0 => (t as f64 / 1000.0) * self.price_per_1k(model),
            _ => 0.0,
        }
    }

    /// Cost of a single recorded attempt, priced on the model it actually used.
    pub fn attempt_cost(&self, attempt: &StepAttempt) -> f64 {
        self.cost(&attempt.model, attempt.tokens_used.map(i64::from))
    }

    /// Sum every attempt, grouped by step in first-seen order.
    ///
    /// The run total is the sum of the per-step totals, so the two can never
    /// disagree.
    pub fn summarize(&self, attempts: &[StepAttempt]) -> UsageSummary {
        let mut steps: Vec<StepUsage> = Vec::new();

        for attempt in attempts {
            let index = match steps.iter().position(|s| s.step_id == attempt.step_id) {
                Some(i) => i,
                None => {
                    steps.push(StepUsage {
                        step_id: attempt.step_id.clone(),
                        attempts: 0,
                        tokens: 0,
                        cost: 0.0,
                    });
                    steps.len() - 1
                }
            };
            let step = &mut steps[index];
            step.attempts += 1;
            step.tokens += u64::from(attempt.tokens_used.unwrap_or(0));
            step.cost += self.attempt_cost(attempt);
        }

        UsageSummary {
            attempts: steps.iter().map(|s| s.attempts).sum(),
            total_tokens: steps.iter().map(|s| s.tokens).sum(),
            total_cost: steps.iter().map(|s| s.cost).sum(),
            steps,
        }
    }

    /// Rough pre-run cost assuming one attempt of `ESTIMATED_TOKENS_PER_STEP`
    /// per step. `resolve_model` maps `auto` to a concrete model.
    pub fn estimate_workflow_cost<F>(&self, steps: &[StepDefinition], resolve_model: F) -> f64
    where
        F: Fn(&StepDefinition) -> String,
    {
        steps
            .iter()
            .map(|s| self.cost(&resolve_model(s), Some(ESTIMATED_TOKENS_PER_STEP)))
            .sum()
    }
}

fn longest_match<'a>(model: &str, entries: impl Iterator<Item = (&'a str, f64)>) -> Option<f64> {
    entries
        .filter(|(pattern, _)| !pattern.is_empty() && model.starts_with(pattern))
        .max_by_key(|(pattern, _)| pattern.len())
        .map(|(_, price)| price)
}

/// Format a cost as a human-readable string.
///
/// Always prefixed with `~` to indicate the value is an estimate.
/// - Zero renders as `$0.00`
/// - Costs below $0.01 use 4 decimal places: `~$0.0015`
/// - Costs $0.01 and above use 2 decimal places: `~$0.12`
pub fn format_cost(cost: f64) -> String {
    if cost <= 0.0 {
        "$0.00".to_string()
    } else if cost < 0.01 {
        format!("~${cost:.4}")
    } else {
        format!("~${cost:.2}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn attempt(step_id: &str, number: u32, model: &str, tokens: Option<u32>, passed: bool) -> StepAttempt {
        StepAttempt {
            id: Uuid::now_v7(),
            execution_id: Uuid::nil(),
            step_id: step_id.to_string(),
            attempt_number: number,
            model: model.to_string(),
            prompt_sent: String::new(),
            response: Some("r".to_string()),
            tokens_used: tokens,
            criteria_passed: passed,
            failure_type: None,
            failure_reason: None,
            created_at: Utc::now(),
        }
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn known_models_use_table_rate() {
        let accountant = CostAccountant::default();
        assert!(approx(accountant.cost("kimi-k2p5", Some(1000)), 0.002));
        assert!(approx(
            accountant.cost("kimi-k2-instruct-0905", Some(2000)),
            0.003
        ));
    }

    #[test]
    fn unknown_model_falls_back_to_default_rate() {
        let accountant = CostAccountant::default();
        assert!(approx(accountant.cost("mystery-model", Some(500)), 0.001));
    }

    #[test]
    fn missing_zero_and_negative_tokens_cost_nothing() {
        let accountant = CostAccountant::default();
        assert_eq!(accountant.cost("kimi-k2p5", None), 0.0);
        assert_eq!(accountant.cost("kimi-k2p5", Some(0)), 0.0);
        assert_eq!(accountant.cost("kimi-k2p5", Some(-250)), 0.0);
    }

    #[test]
    fn overrides_win_and_longest_prefix_matches() {
        let accountant = CostAccountant::new(
            vec![
                ModelPricing {
                    model: "gpt-4o".to_string(),
                    price_per_1k: 0.01,
                },
                ModelPricing {
                    model: "gpt-4o-mini".to_string(),
                    price_per_1k: 0.001,
                },
                ModelPricing {
                    model: "kimi-k2p5".to_string(),
                    price_per_1k: 0.005,
                },
            ],
            0.002,
        );
        assert!(approx(accountant.price_per_1k("gpt-4o-2024-08-06"), 0.01));
        assert!(approx(accountant.price_per_1k("gpt-4o-mini"), 0.001));
        assert!(approx(accountant.price_per_1k("kimi-k2p5"), 0.005));
    }

    #[test]
    fn negative_configured_prices_clamp_to_zero() {
        let accountant = CostAccountant::new(
            vec![ModelPricing {
                model: "free".to_string(),
                price_per_1k: -1.0,
            }],
            -3.0,
        );
        assert_eq!(accountant.cost("free-tier", Some(1000)), 0.0);
        assert_eq!(accountant.cost("other", Some(1000)), 0.0);
    }

    #[test]
    fn summary_counts_every_attempt_including_failures() {
        let accountant = CostAccountant::default();
        let attempts = vec![
            attempt("draft", 1, "kimi-k2p5", Some(1000), false),
            attempt("draft", 2, "kimi-k2p5", Some(1000), false),
            attempt("draft", 3, "kimi-k2p5", Some(1000), true),
            attempt("review", 1, "kimi-k2-instruct-0905", Some(2000), true),
            attempt("review", 2, "kimi-k2-instruct-0905", None, false),
        ];

        let summary = accountant.summarize(&attempts);
        assert_eq!(summary.attempts, 5);
        assert_eq!(summary.total_tokens, 5000);
        assert_eq!(summary.steps.len(), 2);

        let draft = &summary.steps[0];
        assert_eq!(draft.step_id, "draft");
        assert_eq!(draft.attempts, 3);
        assert_eq!(draft.tokens, 3000);
        assert!(approx(draft.cost, 0.006));

        let review = &summary.steps[1];
        assert_eq!(review.attempts, 2);
        assert!(approx(review.cost, 0.003));

        let step_sum: f64 = summary.steps.iter().map(|s| s.cost).sum();
        assert!(approx(step_sum, summary.total_cost));
        let attempt_sum: f64 = attempts.iter().map(|a| accountant.attempt_cost(a)).sum();
        assert!(approx(attempt_sum, summary.total_cost));
    }

    #[test]
    fn empty_history_summarizes_to_zero() {
        let summary = CostAccountant::default().summarize(&[]);
        assert_eq!(summary, UsageSummary::default());
    }

    #[test]
    fn format_cost_precision() {
        assert_eq!(format_cost(0.0), "$0.00");
        assert_eq!(format_cost(0.0015), "~$0.0015");
        assert_eq!(format_cost(0.123), "~$0.12");
        assert_eq!(format_cost(4.5), "~$4.50");
    }
}
