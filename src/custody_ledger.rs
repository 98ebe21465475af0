//! Custody Ledger - account balances and per-service custody holds
//!
//! This module is the single authority over fund movement. Participants hold
//! free balances; the escrow engine locks balances into per-service holds and
//! releases them on approval, refund, or resolution. Every movement is
//! balance-checked, so value is conserved across any sequence of operations;
//! the only way value enters the ledger is an explicit `deposit`.

use std::collections::HashMap;

use tokio::sync::RwLock;
use tracing::info;

use crate::error::EngineError;
use crate::models::ServiceId;
use crate::EngineResult;

/// Main custody ledger
pub struct CustodyLedger {
    /// In-memory balances and holds (in production, this would be a database)
    state: RwLock<LedgerState>,
}

#[derive(Debug, Default)]
struct LedgerState {
    /// Free balance per account
    accounts: HashMap<String, i64>,
    /// Funds held in custody per service
    holds: HashMap<ServiceId, i64>,
}

impl CustodyLedger {
    /// Create an empty ledger
    pub fn new() -> Self {
        Self {
            state: RwLock::new(LedgerState::default()),
        }
    }

    /// Credit an account from outside the ledger. The external value on-ramp;
    /// every other operation conserves total value.
    pub async fn deposit(&self, account: &str, amount: i64) -> EngineResult<i64> {
        if amount <= 0 {
            return Err(EngineError::validation(
                "deposit amount must be greater than 0",
            ));
        }

        let mut state = self.state.write().await;
        let balance = state.accounts.entry(account.to_string()).or_insert(0);
        *balance += amount;
        let balance = *balance;

        info!("Deposited {} to {} (balance {})", amount, account, balance);

        Ok(balance)
    }

    /// Free balance of an account; 0 for unknown accounts
    pub async fn balance_of(&self, account: &str) -> i64 {
        self.state
            .read()
            .await
            .accounts
            .get(account)
            .copied()
            .unwrap_or(0)
    }

    /// Funds currently held in custody for a service
    pub async fn held_for(&self, service_id: ServiceId) -> i64 {
        self.state
            .read()
            .await
            .holds
            .get(&service_id)
            .copied()
            .unwrap_or(0)
    }

    /// Total value in the ledger: all balances plus all holds
    pub async fn total_value(&self) -> i64 {
        let state = self.state.read().await;
        state.accounts.values().sum::<i64>() + state.holds.values().sum::<i64>()
    }

    /// Move funds between two accounts
    pub async fn transfer(&self, from: &str, to: &str, amount: i64) -> EngineResult<()> {
        if amount <= 0 {
            return Err(EngineError::validation(
                "transfer amount must be greater than 0",
            ));
        }

        let mut state = self.state.write().await;
        state.debit(from, amount)?;
        *state.accounts.entry(to.to_string()).or_insert(0) += amount;

        Ok(())
    }

    /// Lock an account's balance into custody for a service. Fails without
    /// any movement if the balance cannot cover the amount.
    pub async fn lock_funds(&self, service_id: ServiceId, from: &str, amount: i64) -> EngineResult<()> {
        if amount <= 0 {
            return Err(EngineError::validation(
                "custody amount must be greater than 0",
            ));
        }

        let mut state = self.state.write().await;
        if state.holds.contains_key(&service_id) {
            return Err(EngineError::validation(format!(
                "custody already held for service {}",
                service_id
            )));
        }

        state.debit(from, amount)?;
        state.holds.insert(service_id, amount);

        info!("Locked {} from {} into custody for service {}", amount, from, service_id);

        Ok(())
    }

    /// Release part of a service's custody hold to an account. The hold is
    /// removed once it reaches zero.
    pub async fn release_from_hold(
        &self,
        service_id: ServiceId,
        to: &str,
        amount: i64,
    ) -> EngineResult<()> {
        if amount <= 0 {
            return Err(EngineError::validation(
                "release amount must be greater than 0",
            ));
        }

        let mut state = self.state.write().await;
        let held = state.holds.get_mut(&service_id).ok_or_else(|| {
            EngineError::not_found("custody hold for service", service_id)
        })?;

        if *held < amount {
            return Err(EngineError::InsufficientFunds {
                account: format!("custody:{}", service_id),
                required: amount,
                available: *held,
            });
        }

        *held -= amount;
        if *held == 0 {
            state.holds.remove(&service_id);
        }
        *state.accounts.entry(to.to_string()).or_insert(0) += amount;

        info!("Released {} from service {} custody to {}", amount, service_id, to);

        Ok(())
    }
}

impl LedgerState {
    fn debit(&mut self, account: &str, amount: i64) -> EngineResult<()> {
        let available = self.accounts.get(account).copied().unwrap_or(0);
        if available < amount {
            return Err(EngineError::InsufficientFunds {
                account: account.to_string(),
                required: amount,
                available,
            });
        }
        *self.accounts.get_mut(account).unwrap() -= amount;
        Ok(())
    }
}

impl Default for CustodyLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deposit_and_balance() {
        let ledger = CustodyLedger::new();
        ledger.deposit("alice", 500).await.unwrap();
        ledger.deposit("alice", 250).await.unwrap();

        assert_eq!(ledger.balance_of("alice").await, 750);
        assert_eq!(ledger.balance_of("nobody").await, 0);
    }

    #[tokio::test]
    async fn transfer_checks_balance() {
        let ledger = CustodyLedger::new();
        ledger.deposit("alice", 100).await.unwrap();

        let err = ledger.transfer("alice", "bob", 200).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::InsufficientFunds {
                required: 200,
                available: 100,
                ..
            }
        ));
        // nothing moved
        assert_eq!(ledger.balance_of("alice").await, 100);
        assert_eq!(ledger.balance_of("bob").await, 0);

        ledger.transfer("alice", "bob", 40).await.unwrap();
        assert_eq!(ledger.balance_of("alice").await, 60);
        assert_eq!(ledger.balance_of("bob").await, 40);
    }

    #[tokio::test]
    async fn hold_lifecycle_conserves_value() {
        let ledger = CustodyLedger::new();
        ledger.deposit("client", 300).await.unwrap();
        assert_eq!(ledger.total_value().await, 300);

        ledger.lock_funds(1, "client", 300).await.unwrap();
        assert_eq!(ledger.balance_of("client").await, 0);
        assert_eq!(ledger.held_for(1).await, 300);
        assert_eq!(ledger.total_value().await, 300);

        ledger.release_from_hold(1, "contractor", 100).await.unwrap();
        assert_eq!(ledger.held_for(1).await, 200);
        assert_eq!(ledger.balance_of("contractor").await, 100);
        assert_eq!(ledger.total_value().await, 300);

        ledger.release_from_hold(1, "client", 200).await.unwrap();
        assert_eq!(ledger.held_for(1).await, 0);
        assert_eq!(ledger.total_value().await, 300);
    }

    #[tokio::test]
    async fn hold_cannot_overdraw_or_double_lock() {
        let ledger = CustodyLedger::new();
        ledger.deposit("client", 100).await.unwrap();

        let err = ledger.lock_funds(1, "client", 300).await.unwrap_err();
        assert!(matches!(err, EngineError::InsufficientFunds { .. }));

        ledger.lock_funds(1, "client", 100).await.unwrap();
        let err = ledger.lock_funds(1, "client", 1).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let err = ledger
            .release_from_hold(1, "contractor", 150)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InsufficientFunds { .. }));
    }
}
