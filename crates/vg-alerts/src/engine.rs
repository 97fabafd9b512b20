use serde::{Deserialize, Serialize};

use vg_core::types::{AlertRule, RuleConditions, Severity};
use vg_pipeline::IngestedEvent;

use crate::filters;

// ---------------------------------------------------------------------------
// Inputs & outputs
// ---------------------------------------------------------------------------

/// The counts a rule evaluation consumes. Built once per `(event, rule)` by
/// [`crate::SnapshotBuilder`]; the engine itself never touches the store.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleMetrics {
    pub window_count: u64,
    pub window_minutes: i64,
    pub baseline_count: u64,
    pub baseline_minutes: i64,
    pub is_new: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    ThresholdExceeded,
    SpikeDetected,
    NewError,
    CriticalSeverity,
    CriticalFingerprint,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Evaluation {
    pub triggered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<TriggerReason>,
    /// The metric snapshot the decision was made from.
    pub context: serde_json::Value,
    pub cooldown_minutes: i64,
}

impl Evaluation {
    fn none(cooldown_minutes: i64) -> Self {
        Self {
            triggered: false,
            reason: None,
            context: serde_json::Value::Null,
            cooldown_minutes,
        }
    }

    fn fire(reason: TriggerReason, context: serde_json::Value, cooldown_minutes: i64) -> Self {
        Self {
            triggered: true,
            reason: Some(reason),
            context,
            cooldown_minutes,
        }
    }
}

// ---------------------------------------------------------------------------
// evaluate
// ---------------------------------------------------------------------------

/// Pure, deterministic rule evaluation.
///
/// Threshold fires at exact equality. A spike with a zero baseline never
/// fires (the rate increase is undefined; a threshold rule covers cold
/// starts). Disabled rules and scope misses short-circuit to not-triggered.
pub fn evaluate(rule: &AlertRule, event: &IngestedEvent, metrics: &RuleMetrics) -> Evaluation {
    let cooldown = rule.cooldown_minutes;
    if !rule.enabled {
        return Evaluation::none(cooldown);
    }
    if !rule.environments.is_empty()
        && !rule.environments.iter().any(|e| e == &event.environment)
    {
        return Evaluation::none(cooldown);
    }
    if let Some(filter) = &rule.filter {
        if !filters::matches(filter, event) {
            return Evaluation::none(cooldown);
        }
    }

    match &rule.conditions {
        RuleConditions::Threshold {
            threshold,
            window_minutes,
        } => {
            if metrics.window_count >= *threshold {
                Evaluation::fire(
                    TriggerReason::ThresholdExceeded,
                    serde_json::json!({
                        "windowCount": metrics.window_count,
                        "threshold": threshold,
                        "windowMinutes": window_minutes,
                    }),
                    cooldown,
                )
            } else {
                Evaluation::none(cooldown)
            }
        }

        RuleConditions::Spike {
            increase_percent,
            window_minutes,
            baseline_minutes,
        } => {
            if metrics.baseline_count == 0 || *window_minutes <= 0 || *baseline_minutes <= 0 {
                return Evaluation::none(cooldown);
            }
            let window_rate = metrics.window_count as f64 / *window_minutes as f64;
            let baseline_rate = metrics.baseline_count as f64 / *baseline_minutes as f64;
            let increase = (window_rate / baseline_rate - 1.0) * 100.0;
            if increase >= *increase_percent {
                Evaluation::fire(
                    TriggerReason::SpikeDetected,
                    serde_json::json!({
                        "windowCount": metrics.window_count,
                        "windowMinutes": window_minutes,
                        "baselineCount": metrics.baseline_count,
                        "baselineMinutes": baseline_minutes,
                        // Rounded to one decimal for display only.
                        "increasePercent": (increase * 10.0).round() / 10.0,
                        "requiredPercent": increase_percent,
                    }),
                    cooldown,
                )
            } else {
                Evaluation::none(cooldown)
            }
        }

        RuleConditions::NewError {} => {
            if metrics.is_new {
                Evaluation::fire(
                    TriggerReason::NewError,
                    serde_json::json!({ "fingerprint": event.fingerprint }),
                    cooldown,
                )
            } else {
                Evaluation::none(cooldown)
            }
        }

        RuleConditions::Critical {
            severity,
            fingerprint,
        } => {
            let wanted = (*severity).unwrap_or(Severity::Critical);
            if event.severity == wanted {
                return Evaluation::fire(
                    TriggerReason::CriticalSeverity,
                    serde_json::json!({ "severity": event.severity.as_str() }),
                    cooldown,
                );
            }
            if let Some(fp) = fingerprint {
                if fp == &event.fingerprint {
                    return Evaluation::fire(
                        TriggerReason::CriticalFingerprint,
                        serde_json::json!({ "fingerprint": fp }),
                        cooldown,
                    );
                }
            }
            Evaluation::none(cooldown)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
