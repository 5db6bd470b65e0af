//! Per-call cost accounting with a daily soft budget.
//!
//! Spend is tracked in micro-cents so integer atomics suffice. The
//! budget is advisory: crossing it logs one warning per UTC day and
//! nothing else changes. Providers bill per token; characters are a
//! close-enough proxy that keeps this layer independent of any
//! tokenizer.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use chrono::{Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CostConfig {
    /// Micro-cents charged per 1000 characters of input text.
    #[serde(default = "default_micros_per_thousand_chars")]
    pub micros_per_thousand_chars: u64,

    /// Soft daily budget in micro-cents. `None` disables the alert.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_budget_micros: Option<u64>,
}

fn default_micros_per_thousand_chars() -> u64 {
    10
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            micros_per_thousand_chars: default_micros_per_thousand_chars(),
            daily_budget_micros: None,
        }
    }
}

/// Lock-free spend counter shared by all calls of one client.
#[derive(Debug)]
pub struct CostTracker {
    config: CostConfig,
    /// Day key (`num_days_from_ce`) the daily counters belong to.
    day: AtomicU32,
    calls_today: AtomicU64,
    spent_today_micros: AtomicU64,
    total_calls: AtomicU64,
    total_spent_micros: AtomicU64,
    alerted_today: AtomicBool,
}

impl CostTracker {
    pub fn new(config: CostConfig) -> Self {
        Self {
            config,
            day: AtomicU32::new(0),
            calls_today: AtomicU64::new(0),
            spent_today_micros: AtomicU64::new(0),
            total_calls: AtomicU64::new(0),
            total_spent_micros: AtomicU64::new(0),
            alerted_today: AtomicBool::new(false),
        }
    }

    /// Records one provider call over `text_len` characters and returns
    /// the micro-cents charged for it.
    pub fn record(&self, text_len: usize) -> u64 {
        self.record_on(Utc::now().date_naive(), text_len)
    }

    fn record_on(&self, today: NaiveDate, text_len: usize) -> u64 {
        let day_key = today.num_days_from_ce() as u32;
        let previous = self.day.swap(day_key, Ordering::Relaxed);
        if previous != day_key {
            self.calls_today.store(0, Ordering::Relaxed);
            self.spent_today_micros.store(0, Ordering::Relaxed);
            self.alerted_today.store(false, Ordering::Relaxed);
        }

        let units = text_len.max(1).div_ceil(1000) as u64;
        let cost = units * self.config.micros_per_thousand_chars;

        self.calls_today.fetch_add(1, Ordering::Relaxed);
        let spent_today = self.spent_today_micros.fetch_add(cost, Ordering::Relaxed) + cost;
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        self.total_spent_micros.fetch_add(cost, Ordering::Relaxed);

        if let Some(budget) = self.config.daily_budget_micros {
            if spent_today > budget && !self.alerted_today.swap(true, Ordering::Relaxed) {
                tracing::warn!(
                    spent_micros = spent_today,
                    budget_micros = budget,
                    "daily embedding spend crossed soft budget"
                );
            }
        }
        cost
    }

    pub fn stats(&self) -> CostStats {
        let spent_today = self.spent_today_micros.load(Ordering::Relaxed);
        CostStats {
            calls_today: self.calls_today.load(Ordering::Relaxed),
            spent_today_micros: spent_today,
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_spent_micros: self.total_spent_micros.load(Ordering::Relaxed),
            daily_budget_micros: self.config.daily_budget_micros,
            over_budget: self
                .config
                .daily_budget_micros
                .is_some_and(|budget| spent_today > budget),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostStats {
    pub calls_today: u64,
    pub spent_today_micros: u64,
    pub total_calls: u64,
    pub total_spent_micros: u64,
    pub daily_budget_micros: Option<u64>,
    pub over_budget: bool,
}
