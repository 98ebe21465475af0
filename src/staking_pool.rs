//! Staking Pool - staked balances and continuous-time reward accrual
//!
//! Principal moves between staker balances and the pool vault through the
//! shared custody ledger; rewards are paid from the rewards reserve account.
//! Accrual is window-based: `reward_debt` carries rewards already accounted
//! for (or earned-but-unclaimed, as a negative debt) whenever the window is
//! restarted, so no interval can ever be paid twice. The same double-spend
//! discipline as milestone release, generalized to continuous time.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use crate::custody_ledger::CustodyLedger;
use crate::error::EngineError;
use crate::models::StakePosition;
use crate::EngineResult;

/// Reserved ledger account holding staked principal
pub const POOL_VAULT_ACCOUNT: &str = "@staking-pool";
/// Reserved ledger account rewards are paid from
pub const REWARDS_RESERVE_ACCOUNT: &str = "@staking-rewards";

/// Configuration for the staking pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StakingPoolConfig {
    /// Accrual rate in parts-per-million of the staked amount per second
    pub reward_rate_ppm_per_sec: i64,
    /// Minimum amount for a single stake call
    pub min_stake_amount: i64,
}

impl Default for StakingPoolConfig {
    fn default() -> Self {
        Self {
            reward_rate_ppm_per_sec: 1,
            min_stake_amount: 100,
        }
    }
}

/// Main staking pool
pub struct StakingPool {
    config: StakingPoolConfig,
    /// In-memory position storage (in production, this would be a database)
    state: RwLock<PoolState>,
    /// Custody ledger shared with the rest of the node
    ledger: Arc<CustodyLedger>,
}

#[derive(Default)]
struct PoolState {
    positions: HashMap<String, StakePosition>,
    /// Always equals the sum of all position amounts
    total_staked: i64,
}

impl StakingPool {
    /// Create a new staking pool over a shared ledger
    pub fn new(config: StakingPoolConfig, ledger: Arc<CustodyLedger>) -> Self {
        Self {
            config,
            state: RwLock::new(PoolState::default()),
            ledger,
        }
    }

    /// Deposit `amount` into the pool. An existing position is merged by
    /// first settling its pending rewards into `reward_debt`, so deposits of
    /// different ages never dilute each other.
    pub async fn stake(&self, owner: &str, amount: i64) -> EngineResult<StakePosition> {
        self.stake_at(owner, amount, Utc::now()).await
    }

    pub(crate) async fn stake_at(
        &self,
        owner: &str,
        amount: i64,
        now: DateTime<Utc>,
    ) -> EngineResult<StakePosition> {
        if amount < self.config.min_stake_amount {
            return Err(EngineError::validation(format!(
                "stake amount {} is below the minimum {}",
                amount, self.config.min_stake_amount
            )));
        }

        let mut state = self.state.write().await;
        self.ledger.transfer(owner, POOL_VAULT_ACCOUNT, amount).await?;

        let position = match state.positions.get_mut(owner) {
            Some(position) => {
                self.settle_into_debt(position, now);
                position.amount += amount;
                position.clone()
            }
            None => {
                let position = StakePosition::new(owner.to_string(), amount, now);
                state.positions.insert(owner.to_string(), position.clone());
                position
            }
        };
        state.total_staked += amount;

        info!("Staked {} for {} (total staked {})", amount, owner, state.total_staked);

        Ok(position)
    }

    /// Withdraw part or all of a position's principal. Pending rewards are
    /// settled first; a position drained to zero pays out its carried rewards
    /// and is removed.
    pub async fn unstake(&self, owner: &str, amount: i64) -> EngineResult<()> {
        self.unstake_at(owner, amount, Utc::now()).await
    }

    pub(crate) async fn unstake_at(
        &self,
        owner: &str,
        amount: i64,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        if amount <= 0 {
            return Err(EngineError::validation(
                "unstake amount must be greater than 0",
            ));
        }

        let mut state = self.state.write().await;
        let position = state
            .positions
            .get_mut(owner)
            .ok_or_else(|| EngineError::not_found("stake position", owner))?;

        if amount > position.amount {
            return Err(EngineError::InsufficientFunds {
                account: format!("stake:{}", owner),
                required: amount,
                available: position.amount,
            });
        }

        self.settle_into_debt(position, now);

        if amount == position.amount {
            // draining the position is an implicit claim of carried rewards
            let carried = (-position.reward_debt).max(0);
            if carried > 0 {
                self.ledger
                    .transfer(REWARDS_RESERVE_ACCOUNT, owner, carried)
                    .await?;
            }
            self.ledger.transfer(POOL_VAULT_ACCOUNT, owner, amount).await?;
            state.positions.remove(owner);
        } else {
            self.ledger.transfer(POOL_VAULT_ACCOUNT, owner, amount).await?;
            let position = state.positions.get_mut(owner).unwrap();
            position.amount -= amount;
        }
        state.total_staked -= amount;

        info!("Unstaked {} for {} (total staked {})", amount, owner, state.total_staked);

        Ok(())
    }

    /// Pay out all rewards accrued since the last settlement and reset the
    /// accrual window. Claiming the same interval twice pays zero the second
    /// time.
    pub async fn claim_rewards(&self, owner: &str) -> EngineResult<i64> {
        self.claim_rewards_at(owner, Utc::now()).await
    }

    pub(crate) async fn claim_rewards_at(
        &self,
        owner: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<i64> {
        let mut state = self.state.write().await;
        let position = state
            .positions
            .get_mut(owner)
            .ok_or_else(|| EngineError::not_found("stake position", owner))?;

        let pending = self.pending_for(position, now);
        if pending > 0 {
            self.ledger
                .transfer(REWARDS_RESERVE_ACCOUNT, owner, pending)
                .await?;
        }
        position.last_claim = Some(now);
        position.reward_debt = 0;

        if pending > 0 {
            info!("Paid {} staking rewards to {}", pending, owner);
        }

        Ok(pending)
    }

    /// Rewards claimable right now; 0 for unknown stakers
    pub async fn get_pending_rewards(&self, owner: &str) -> i64 {
        self.pending_rewards_at(owner, Utc::now()).await
    }

    pub(crate) async fn pending_rewards_at(&self, owner: &str, now: DateTime<Utc>) -> i64 {
        self.state
            .read()
            .await
            .positions
            .get(owner)
            .map(|position| self.pending_for(position, now))
            .unwrap_or(0)
    }

    /// Get a staker's position
    pub async fn get_position(&self, owner: &str) -> EngineResult<StakePosition> {
        self.state
            .read()
            .await
            .positions
            .get(owner)
            .cloned()
            .ok_or_else(|| EngineError::not_found("stake position", owner))
    }

    /// Sum of all staked principal
    pub async fn total_staked(&self) -> i64 {
        self.state.read().await.total_staked
    }

    /// Sum of the individual position amounts, for conservation audits
    pub async fn positions_total(&self) -> i64 {
        self.state
            .read()
            .await
            .positions
            .values()
            .map(|position| position.amount)
            .sum()
    }

    /// Rewards accrued over the current window minus what was already
    /// accounted for. A negative `reward_debt` is carried, earned-but-unclaimed
    /// reward from a previous window.
    fn pending_for(&self, position: &StakePosition, now: DateTime<Utc>) -> i64 {
        let anchor = position
            .last_claim
            .map_or(position.since, |last| position.since.max(last));
        let elapsed = (now - anchor).num_seconds().max(0) as i128;

        let accrued = position.amount as i128 * self.config.reward_rate_ppm_per_sec as i128
            * elapsed
            / 1_000_000;
        let pending = accrued - position.reward_debt as i128;
        pending.clamp(0, i64::MAX as i128) as i64
    }

    /// Restart the accrual window, converting the pending amount into carried
    /// reward debt. Pure bookkeeping; the observable pending amount is
    /// unchanged.
    fn settle_into_debt(&self, position: &mut StakePosition, now: DateTime<Utc>) {
        let pending = self.pending_for(position, now);
        position.reward_debt = -pending;
        position.last_claim = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const RATE: i64 = 1_000; // 0.1% per second keeps the arithmetic readable

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    async fn funded_pool(reserve: i64) -> StakingPool {
        let ledger = Arc::new(CustodyLedger::new());
        ledger.deposit("alice", 10_000).await.unwrap();
        ledger.deposit("carol", 10_000).await.unwrap();
        if reserve > 0 {
            ledger.deposit(REWARDS_RESERVE_ACCOUNT, reserve).await.unwrap();
        }
        StakingPool::new(
            StakingPoolConfig {
                reward_rate_ppm_per_sec: RATE,
                min_stake_amount: 100,
            },
            ledger,
        )
    }

    #[tokio::test]
    async fn staked_total_matches_positions() {
        let pool = funded_pool(0).await;

        pool.stake_at("alice", 1_000, t(0)).await.unwrap();
        pool.stake_at("carol", 2_000, t(0)).await.unwrap();
        pool.unstake_at("alice", 400, t(0)).await.unwrap();
        pool.stake_at("carol", 500, t(0)).await.unwrap();

        assert_eq!(pool.total_staked().await, 3_100);
        assert_eq!(pool.positions_total().await, 3_100);
        assert_eq!(pool.ledger.balance_of(POOL_VAULT_ACCOUNT).await, 3_100);
    }

    #[tokio::test]
    async fn stake_requires_balance_and_minimum() {
        let pool = funded_pool(0).await;

        let err = pool.stake_at("alice", 50, t(0)).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let err = pool.stake_at("nobody", 500, t(0)).await.unwrap_err();
        assert!(matches!(err, EngineError::InsufficientFunds { .. }));
        assert_eq!(pool.total_staked().await, 0);
    }

    #[tokio::test]
    async fn accrual_is_rate_times_amount_times_elapsed() {
        let pool = funded_pool(10_000).await;
        pool.stake_at("alice", 1_000, t(0)).await.unwrap();

        // 1_000 * 1_000ppm * 100s = 100
        assert_eq!(pool.pending_rewards_at("alice", t(100)).await, 100);

        let paid = pool.claim_rewards_at("alice", t(100)).await.unwrap();
        assert_eq!(paid, 100);
        assert_eq!(pool.ledger.balance_of(REWARDS_RESERVE_ACCOUNT).await, 9_900);

        // the claimed interval can never be paid again
        assert_eq!(pool.pending_rewards_at("alice", t(100)).await, 0);
        let paid = pool.claim_rewards_at("alice", t(100)).await.unwrap();
        assert_eq!(paid, 0);

        // accrual continues from the claim, not from the stake
        assert_eq!(pool.pending_rewards_at("alice", t(150)).await, 50);
    }

    #[tokio::test]
    async fn merge_settles_first_so_ages_do_not_dilute() {
        let pool = funded_pool(10_000).await;
        pool.stake_at("alice", 1_000, t(0)).await.unwrap();

        // merge at t=100: 100 earned at the old amount is carried, not lost
        let position = pool.stake_at("alice", 1_000, t(100)).await.unwrap();
        assert_eq!(position.amount, 2_000);
        assert_eq!(position.reward_debt, -100);
        assert_eq!(pool.pending_rewards_at("alice", t(100)).await, 100);

        // t100..t200 accrues at the merged amount: 2_000 * 1_000ppm * 100s = 200
        assert_eq!(pool.pending_rewards_at("alice", t(200)).await, 300);
        let paid = pool.claim_rewards_at("alice", t(200)).await.unwrap();
        assert_eq!(paid, 300);
    }

    #[tokio::test]
    async fn partial_unstake_keeps_carried_rewards() {
        let pool = funded_pool(10_000).await;
        pool.stake_at("alice", 1_000, t(0)).await.unwrap();

        pool.unstake_at("alice", 400, t(100)).await.unwrap();
        let position = pool.get_position("alice").await.unwrap();
        assert_eq!(position.amount, 600);
        // the 100 earned before the unstake is still claimable
        assert_eq!(pool.pending_rewards_at("alice", t(100)).await, 100);
        assert_eq!(pool.ledger.balance_of("alice").await, 9_000 + 400);
    }

    #[tokio::test]
    async fn draining_a_position_pays_out_and_removes_it() {
        let pool = funded_pool(10_000).await;
        pool.stake_at("alice", 1_000, t(0)).await.unwrap();

        pool.unstake_at("alice", 1_000, t(100)).await.unwrap();
        // principal and the 100 carried rewards both came back
        assert_eq!(pool.ledger.balance_of("alice").await, 10_100);
        assert!(pool.get_position("alice").await.is_err());
        assert_eq!(pool.get_pending_rewards("alice").await, 0);
        assert_eq!(pool.total_staked().await, 0);
    }

    #[tokio::test]
    async fn unstake_cannot_exceed_position() {
        let pool = funded_pool(0).await;
        pool.stake_at("alice", 1_000, t(0)).await.unwrap();

        let err = pool.unstake_at("alice", 1_500, t(10)).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::InsufficientFunds {
                required: 1_500,
                available: 1_000,
                ..
            }
        ));
        assert_eq!(pool.total_staked().await, 1_000);
    }

    #[tokio::test]
    async fn dry_reserve_aborts_a_claim_without_losing_accrual() {
        let pool = funded_pool(0).await;
        pool.stake_at("alice", 1_000, t(0)).await.unwrap();

        let err = pool.claim_rewards_at("alice", t(100)).await.unwrap_err();
        assert!(matches!(err, EngineError::InsufficientFunds { .. }));

        // nothing was reset; once the reserve is funded the claim succeeds
        pool.ledger
            .deposit(REWARDS_RESERVE_ACCOUNT, 1_000)
            .await
            .unwrap();
        let paid = pool.claim_rewards_at("alice", t(100)).await.unwrap();
        assert_eq!(paid, 100);
    }
}
