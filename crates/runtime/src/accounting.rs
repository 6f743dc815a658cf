//! Per-user monthly token accounting
//!
//! Tracks `{used, quota, reset_at}` per user. `record` is transactional:
//! it either applies the whole delta or returns `QuotaExceeded`. Each
//! ledger has a single writer at a time, so concurrent records can never
//! overshoot the sum of their deltas.

use chrono::{DateTime, Datelike, TimeZone, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::AccountingConfig;
use crate::types::{AccountingError, UserId};

/// Point-in-time view of a user's ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub user: UserId,
    pub used_tokens: u64,
    pub quota_tokens: u64,
    pub reset_at: DateTime<Utc>,
    /// Accumulated cost in micro-dollars.
    pub cost_micros: f64,
}

#[derive(Debug)]
struct Ledger {
    used_tokens: u64,
    quota_tokens: u64,
    last_reset_at: DateTime<Utc>,
    cost_micros: f64,
}

impl Ledger {
    fn new(quota_tokens: u64) -> Self {
        Self {
            used_tokens: 0,
            quota_tokens,
            last_reset_at: Utc::now(),
            cost_micros: 0.0,
        }
    }

    /// Zero the tally when the accounting month has rolled over.
    fn roll_month(&mut self, now: DateTime<Utc>) -> bool {
        let rolled = now.year() > self.last_reset_at.year()
            || (now.year() == self.last_reset_at.year()
                && now.month() > self.last_reset_at.month());
        if rolled {
            self.used_tokens = 0;
            self.cost_micros = 0.0;
            self.last_reset_at = month_start(now);
        }
        rolled
    }
}

fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(now)
}

/// Monthly token tallies with quota enforcement.
pub struct TokenAccountant {
    ledgers: DashMap<UserId, Arc<Mutex<Ledger>>>,
    config: AccountingConfig,
}

impl TokenAccountant {
    pub fn new(config: AccountingConfig) -> Self {
        Self {
            ledgers: DashMap::new(),
            config,
        }
    }

    fn ledger(&self, user: UserId) -> Arc<Mutex<Ledger>> {
        self.ledgers
            .entry(user)
            .or_insert_with(|| Arc::new(Mutex::new(Ledger::new(self.config.monthly_quota_tokens))))
            .clone()
    }

    /// Make sure a ledger exists with the default quota.
    pub fn ensure(&self, user: UserId) {
        let _ = self.ledger(user);
    }

    /// Override a user's monthly quota.
    pub fn set_quota(&self, user: UserId, quota_tokens: u64) {
        let ledger = self.ledger(user);
        ledger.lock().quota_tokens = quota_tokens;
    }

    /// Whether `delta` more tokens fit under the user's quota. Callers
    /// must check this before producing output; `record` re-checks.
    pub fn can_consume(&self, user: UserId, delta: u64) -> bool {
        let ledger = self.ledger(user);
        let mut guard = ledger.lock();
        guard.roll_month(Utc::now());
        guard.used_tokens.saturating_add(delta) <= guard.quota_tokens
    }

    /// Apply a usage delta transactionally. Either the whole delta lands
    /// or the ledger is untouched and `QuotaExceeded` is returned.
    pub fn record(
        &self,
        user: UserId,
        input_tokens: u64,
        output_tokens: u64,
        cost_micros: f64,
    ) -> Result<UsageSnapshot, AccountingError> {
        let ledger = self.ledger(user);
        let mut guard = ledger.lock();
        guard.roll_month(Utc::now());

        let delta = input_tokens.saturating_add(output_tokens);
        let projected = guard.used_tokens.saturating_add(delta);
        if projected > guard.quota_tokens {
            return Err(AccountingError::QuotaExceeded {
                user,
                used: guard.used_tokens,
                requested: delta,
                quota: guard.quota_tokens,
            });
        }

        guard.used_tokens = projected;
        guard.cost_micros += cost_micros;
        Ok(UsageSnapshot {
            user,
            used_tokens: guard.used_tokens,
            quota_tokens: guard.quota_tokens,
            reset_at: guard.last_reset_at,
            cost_micros: guard.cost_micros,
        })
    }

    /// Current ledger state.
    pub fn usage(&self, user: UserId) -> UsageSnapshot {
        let ledger = self.ledger(user);
        let mut guard = ledger.lock();
        guard.roll_month(Utc::now());
        UsageSnapshot {
            user,
            used_tokens: guard.used_tokens,
            quota_tokens: guard.quota_tokens,
            reset_at: guard.last_reset_at,
            cost_micros: guard.cost_micros,
        }
    }

    /// Zero one user's tally immediately.
    pub fn reset(&self, user: UserId) {
        let ledger = self.ledger(user);
        let mut guard = ledger.lock();
        guard.used_tokens = 0;
        guard.cost_micros = 0.0;
        guard.last_reset_at = month_start(Utc::now());
    }

    /// Roll every ledger whose accounting month has ended. Returns how
    /// many were reset. Driven by the maintenance supervisor.
    pub fn reset_expired(&self) -> usize {
        let now = Utc::now();
        let mut reset = 0;
        for entry in self.ledgers.iter() {
            if entry.value().lock().roll_month(now) {
                reset += 1;
            }
        }
        if reset > 0 {
            tracing::info!(count = reset, "rolled monthly token ledgers");
        }
        reset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accountant(quota: u64) -> TokenAccountant {
        TokenAccountant::new(AccountingConfig {
            monthly_quota_tokens: quota,
        })
    }

    #[test]
    fn record_accumulates_and_enforces_quota() {
        let acct = accountant(100);
        let user = UserId::new();
        assert!(acct.can_consume(user, 60));
        acct.record(user, 40, 20, 1.5).unwrap();
        assert!(acct.can_consume(user, 40));
        assert!(!acct.can_consume(user, 41));

        let err = acct.record(user, 41, 0, 0.0).unwrap_err();
        assert!(matches!(err, AccountingError::QuotaExceeded { used: 60, .. }));
        // Failed record must not partially apply.
        assert_eq!(acct.usage(user).used_tokens, 60);
    }

    #[test]
    fn reset_zeroes_the_tally() {
        let acct = accountant(100);
        let user = UserId::new();
        acct.record(user, 50, 0, 0.0).unwrap();
        acct.reset(user);
        assert_eq!(acct.usage(user).used_tokens, 0);
        assert!(acct.can_consume(user, 100));
    }

    #[test]
    fn concurrent_records_never_exceed_sum_of_deltas() {
        let acct = Arc::new(accountant(1_000_000));
        let user = UserId::new();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let acct = Arc::clone(&acct);
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    acct.record(user, 7, 3, 0.1).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(acct.usage(user).used_tokens, 8 * 100 * 10);
    }
}
