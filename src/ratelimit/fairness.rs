//! Priority fairness scheduling.
//!
//! Classes sharing a bucket are arbitrated per evaluation window. Each class
//! with demand first receives its guaranteed floor, then the rest of the
//! window's supply is water-filled across still-hungry classes in proportion
//! to weight. The allowance only gates requests while the bucket is
//! contended, i.e. when estimated demand exceeds the window's supply.
//!
//! Allowances are fractional but requests are whole tokens, so each class
//! draws on a credit balance that accrues at its allowance rate and carries
//! across windows. A request larger than the balance can hold is admitted
//! once the balance is full, and the shortfall is charged forward.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::limits::PriorityClass;

use super::bucket::TOKEN_EPSILON;

/// Demand and admissions of one class in the current window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassUsage {
    /// Tokens requested, whether admitted or not
    pub demand: f64,
    /// Tokens admitted
    pub admitted: f64,
}

/// Per-class usage for the current and previous fairness windows.
///
/// Stored next to the bucket state so every evaluator sees the same counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowLedger {
    /// Start of the current window in epoch milliseconds
    pub window_start_ms: u64,
    /// Usage in the current window
    #[serde(default)]
    pub current: BTreeMap<String, ClassUsage>,
    /// Demand in the window immediately before the current one
    #[serde(default)]
    pub previous_demand: BTreeMap<String, f64>,
    /// Admission credit per class; survives window rolls
    #[serde(default)]
    pub credits: BTreeMap<String, ClassCredit>,
}

/// Admission credit carried by one class.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassCredit {
    /// Tokens the class may still take; negative after an oversized admission
    pub balance: f64,
    /// Last accrual in epoch milliseconds
    pub updated_ms: u64,
}

impl WindowLedger {
    /// Advance to the window containing `now_ms`.
    ///
    /// Windows are aligned to multiples of `window_ms`. A timestamp in an
    /// earlier window than the ledger's is counted in the current one.
    pub fn roll(&mut self, now_ms: u64, window_ms: u64) {
        let window_ms = window_ms.max(1);
        let start = now_ms - now_ms % window_ms;
        if start <= self.window_start_ms {
            return;
        }

        if start - self.window_start_ms == window_ms {
            self.previous_demand = self
                .current
                .iter()
                .map(|(class, usage)| (class.clone(), usage.demand))
                .collect();
        } else {
            self.previous_demand.clear();
        }
        self.current.clear();
        self.window_start_ms = start;
    }

    pub fn record_demand(&mut self, class: &str, tokens: f64) {
        self.current.entry(class.to_string()).or_default().demand += tokens;
    }

    pub fn record_admitted(&mut self, class: &str, tokens: f64) {
        self.current.entry(class.to_string()).or_default().admitted += tokens;
    }

    /// Take `tokens` from `class`'s credit.
    pub fn charge_credit(&mut self, class: &str, tokens: f64) {
        if let Some(credit) = self.credits.get_mut(class) {
            credit.balance -= tokens;
        }
    }

    /// Credit balance of `class`, if it has been gated before.
    pub fn credit(&self, class: &str) -> Option<f64> {
        self.credits.get(class).map(|c| c.balance)
    }

    /// Tokens admitted for `class` in the current window.
    pub fn admitted(&self, class: &str) -> f64 {
        self.current.get(class).map(|u| u.admitted).unwrap_or(0.0)
    }

    /// Sliding estimate of `class`'s demand per window.
    ///
    /// The previous window is weighted by the fraction of the current window
    /// that has not yet elapsed.
    pub fn estimated_demand(&self, class: &str, now_ms: u64, window_ms: u64) -> f64 {
        let window_ms = window_ms.max(1);
        let elapsed = now_ms.saturating_sub(self.window_start_ms).min(window_ms);
        let remaining_fraction = 1.0 - elapsed as f64 / window_ms as f64;

        let previous = self.previous_demand.get(class).copied().unwrap_or(0.0);
        let current = self.current.get(class).map(|u| u.demand).unwrap_or(0.0);
        previous * remaining_fraction + current
    }

    /// End of the current window in epoch milliseconds.
    pub fn window_end_ms(&self, window_ms: u64) -> u64 {
        self.window_start_ms.saturating_add(window_ms.max(1))
    }
}

/// Allowance computed for one class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassAllowance {
    pub class: String,
    /// Estimated demand for the window
    pub demand: f64,
    /// Tokens the class may be admitted in the window
    pub allowance: f64,
}

/// Allowances for every class under a bucket for one window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllowancePlan {
    /// Tokens the bucket supplies per window
    pub supply: f64,
    /// Whether total estimated demand exceeds supply
    pub contended: bool,
    /// Every contending class had weight zero and equal weights were used
    pub zero_weight_fallback: bool,
    pub classes: Vec<ClassAllowance>,
}

impl AllowancePlan {
    pub fn allowance(&self, class: &str) -> Option<f64> {
        self.classes
            .iter()
            .find(|c| c.class == class)
            .map(|c| c.allowance)
    }

    /// Most credit `class` may bank: two windows of allowance, and never
    /// less than two tokens.
    pub fn credit_cap(&self, class: &str) -> f64 {
        2.0 * self.allowance(class).unwrap_or(0.0).max(1.0)
    }
}

/// Result of the class gate for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateDecision {
    pub passed: bool,
    /// When the class will have enough credit, in epoch milliseconds.
    /// `None` when the class currently accrues nothing.
    pub deadline_ms: Option<u64>,
}

/// Computes per-class allowances over a fixed-length window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FairnessScheduler {
    window_ms: u64,
}

impl Default for FairnessScheduler {
    fn default() -> Self {
        Self { window_ms: 1000 }
    }
}

impl FairnessScheduler {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window_ms: window_ms.max(1),
        }
    }

    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    /// Tokens a bucket supplies per window.
    ///
    /// A bucket that never refills supplies its capacity.
    pub fn supply(&self, capacity: f64, refill_rate: f64) -> f64 {
        if refill_rate > 0.0 {
            refill_rate * self.window_ms as f64 / 1000.0
        } else {
            capacity
        }
    }

    /// Allowances for the window containing `now_ms`, from the ledger's demand estimates.
    pub fn plan(
        &self,
        classes: &[PriorityClass],
        ledger: &WindowLedger,
        supply: f64,
        now_ms: u64,
    ) -> AllowancePlan {
        let demands: Vec<f64> = classes
            .iter()
            .map(|c| ledger.estimated_demand(&c.name, now_ms, self.window_ms))
            .collect();
        allocate(classes, &demands, supply)
    }

    /// Accrue `class`'s credit up to `now_ms` and decide whether it may take
    /// `requested` tokens.
    ///
    /// An uncontended plan admits everything and refills the credit. Under
    /// contention the balance must cover the request, or be full when the
    /// request is larger than the cap. The caller charges the credit if the
    /// request is finally admitted.
    pub fn gate(
        &self,
        plan: &AllowancePlan,
        ledger: &mut WindowLedger,
        class: &str,
        requested: f64,
        now_ms: u64,
    ) -> GateDecision {
        let allowance = plan.allowance(class).unwrap_or(0.0);
        let cap = plan.credit_cap(class);
        let credit = ledger.credits.entry(class.to_string()).or_insert(ClassCredit {
            balance: cap,
            updated_ms: now_ms,
        });

        if !plan.contended {
            *credit = ClassCredit {
                balance: cap,
                updated_ms: now_ms.max(credit.updated_ms),
            };
            return GateDecision {
                passed: true,
                deadline_ms: Some(now_ms),
            };
        }

        let elapsed = now_ms.saturating_sub(credit.updated_ms) as f64;
        credit.balance = (credit.balance + allowance * elapsed / self.window_ms as f64).min(cap);
        credit.updated_ms = now_ms.max(credit.updated_ms);

        if allowance <= TOKEN_EPSILON {
            return GateDecision {
                passed: false,
                deadline_ms: None,
            };
        }

        let target = requested.min(cap);
        if credit.balance + TOKEN_EPSILON >= target {
            return GateDecision {
                passed: true,
                deadline_ms: Some(now_ms),
            };
        }
        let wait_ms = ((target - credit.balance) * self.window_ms as f64 / allowance).ceil();
        GateDecision {
            passed: false,
            deadline_ms: Some(now_ms.saturating_add(wait_ms as u64)),
        }
    }

    /// Allowances if every class were demanding the whole supply.
    pub fn nominal(&self, classes: &[PriorityClass], supply: f64) -> AllowancePlan {
        let demands = vec![supply; classes.len()];
        let mut plan = allocate(classes, &demands, supply);
        plan.contended = true;
        plan
    }
}

/// Floor reservation followed by weighted water-filling.
fn allocate(classes: &[PriorityClass], demands: &[f64], supply: f64) -> AllowancePlan {
    let total_demand: f64 = demands.iter().sum();
    let contended = total_demand > supply + TOKEN_EPSILON;

    let mut allocation = vec![0.0; classes.len()];
    for (i, class) in classes.iter().enumerate() {
        if demands[i] > 0.0 {
            allocation[i] = (class.floor() * supply).min(demands[i]);
        }
    }
    let mut pool = supply - allocation.iter().sum::<f64>();

    let mut zero_weight_fallback = false;
    let mut active: Vec<usize> = (0..classes.len())
        .filter(|&i| demands[i] > allocation[i] + TOKEN_EPSILON)
        .collect();
    let mut first_round = true;

    while pool > TOKEN_EPSILON && !active.is_empty() {
        let (weights, fallback) = effective_weights(classes, &active);
        if fallback && first_round {
            zero_weight_fallback = true;
        }
        first_round = false;
        let weight_sum: f64 = weights.iter().sum();

        let mut hungry = Vec::with_capacity(active.len());
        let mut distributed = 0.0;
        for (slot, &i) in active.iter().enumerate() {
            let share = pool * weights[slot] / weight_sum;
            let residual = demands[i] - allocation[i];
            if share + TOKEN_EPSILON >= residual {
                allocation[i] += residual;
                distributed += residual;
            } else {
                hungry.push((i, weights[slot]));
            }
        }

        if distributed == 0.0 {
            // Nobody saturated: split the pool once and stop.
            for (i, weight) in hungry {
                allocation[i] += pool * weight / weight_sum;
            }
            pool = 0.0;
            break;
        }

        pool -= distributed;
        active = hungry.into_iter().map(|(i, _)| i).collect();
    }

    // Spare supply is headroom, handed out by weight.
    if pool > TOKEN_EPSILON && !classes.is_empty() {
        let everyone: Vec<usize> = (0..classes.len()).collect();
        let (weights, _) = effective_weights(classes, &everyone);
        let weight_sum: f64 = weights.iter().sum();
        for (i, weight) in weights.iter().enumerate() {
            allocation[i] += pool * weight / weight_sum;
        }
    }

    AllowancePlan {
        supply,
        contended,
        zero_weight_fallback,
        classes: classes
            .iter()
            .enumerate()
            .map(|(i, class)| ClassAllowance {
                class: class.name.clone(),
                demand: demands[i],
                allowance: allocation[i],
            })
            .collect(),
    }
}

/// Weights for the given classes, with equal weights when they sum to zero.
fn effective_weights(classes: &[PriorityClass], indices: &[usize]) -> (Vec<f64>, bool) {
    let weights: Vec<f64> = indices.iter().map(|&i| classes[i].weight as f64).collect();
    if weights.iter().sum::<f64>() > 0.0 {
        (weights, false)
    } else {
        (vec![1.0; indices.len()], true)
    }
}
