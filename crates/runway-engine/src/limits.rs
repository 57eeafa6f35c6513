//! Concurrency caps and per-run model budget

use std::collections::HashMap;

use parking_lot::Mutex;

/// Why an acquisition was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitScope {
    Global,
    Tenant,
}

impl LimitScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Tenant => "tenant",
        }
    }
}

/// Tracks active runs per tenant and globally. A limit of zero disables that
/// cap.
pub struct RateLimiter {
    global_limit: usize,
    tenant_limit: usize,
    active: Mutex<ActiveRuns>,
}

struct ActiveRuns {
    by_run: HashMap<String, String>,
    by_tenant: HashMap<String, usize>,
}

impl RateLimiter {
    pub fn new(global_limit: usize, tenant_limit: usize) -> Self {
        Self {
            global_limit,
            tenant_limit,
            active: Mutex::new(ActiveRuns {
                by_run: HashMap::new(),
                by_tenant: HashMap::new(),
            }),
        }
    }

    /// Reserve a slot for the run, or report which cap refused it.
    pub fn try_acquire(&self, run_id: &str, tenant_id: &str) -> Result<(), LimitScope> {
        let tenant = if tenant_id.is_empty() { "default" } else { tenant_id };
        let mut active = self.active.lock();
        if active.by_run.contains_key(run_id) {
            return Ok(());
        }
        if self.global_limit > 0 && active.by_run.len() >= self.global_limit {
            return Err(LimitScope::Global);
        }
        let tenant_count = active.by_tenant.get(tenant).copied().unwrap_or(0);
        if self.tenant_limit > 0 && tenant_count >= self.tenant_limit {
            return Err(LimitScope::Tenant);
        }
        active.by_run.insert(run_id.to_string(), tenant.to_string());
        *active.by_tenant.entry(tenant.to_string()).or_insert(0) += 1;
        Ok(())
    }

    /// Release the slot held by a run. Safe to call for unknown runs.
    pub fn release(&self, run_id: &str) {
        let mut active = self.active.lock();
        if let Some(tenant) = active.by_run.remove(run_id) {
            if let Some(count) = active.by_tenant.get_mut(&tenant) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    active.by_tenant.remove(&tenant);
                }
            }
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().by_run.len()
    }
}

/// Raised when a run's model spend crosses the configured cap.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("model budget exhausted: spent {spent_usd} of {limit_usd}")]
pub struct BudgetExceeded {
    pub spent_usd: f64,
    pub limit_usd: f64,
}

/// Tracks per-run model spend against a static USD limit. A limit of zero
/// disables enforcement.
pub struct BudgetManager {
    limit_usd: f64,
    spent: Mutex<HashMap<String, f64>>,
}

impl BudgetManager {
    pub fn new(limit_usd: f64) -> Self {
        Self {
            limit_usd: limit_usd.max(0.0),
            spent: Mutex::new(HashMap::new()),
        }
    }

    pub fn limit_usd(&self) -> f64 {
        self.limit_usd
    }

    /// Record additional spend and return the new total, or the overage.
    pub fn record(&self, run_id: &str, amount_usd: f64) -> Result<f64, BudgetExceeded> {
        let mut spent = self.spent.lock();
        let total = spent.entry(run_id.to_string()).or_insert(0.0);
        if amount_usd > 0.0 {
            *total += amount_usd;
        }
        let total = *total;
        drop(spent);
        if self.limit_usd > 0.0 && total > self.limit_usd {
            return Err(BudgetExceeded {
                spent_usd: total,
                limit_usd: self.limit_usd,
            });
        }
        Ok(total)
    }

    pub fn reset(&self, run_id: &str) {
        self.spent.lock().remove(run_id);
    }
}
