//! Settlement Node - High-level API for the settlement engine
//!
//! This module wires the escrow engine, reputation ledger, and staking pool
//! over one shared custody ledger and one shared event outbox, and exposes
//! the full operation surface collaborators (UI, indexers) call into. It also
//! performs the cross-component bookkeeping: job counters on the contractor's
//! profile follow the service lifecycle.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::custody_ledger::CustodyLedger;
use crate::error::EngineError;
use crate::escrow_engine::{
    CreateServiceRequest, EscrowEngine, EscrowEngineConfig, RaiseDisputeRequest,
    ResolveDisputeRequest,
};
use crate::event_outbox::{EngineEvent, EventOutbox};
use crate::models::{
    ContractorProfile, Dispute, Milestone, Review, Service, ServiceId, ServiceStatus,
    StakePosition,
};
use crate::reputation_ledger::{
    RegisterContractorRequest, ReputationLedger, ReputationLedgerConfig, SubmitReviewRequest,
};
use crate::staking_pool::{StakingPool, StakingPoolConfig, REWARDS_RESERVE_ACCOUNT};
use crate::EngineResult;

/// Configuration for the settlement node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementNodeConfig {
    /// Escrow engine configuration
    pub escrow: EscrowEngineConfig,
    /// Reputation ledger configuration
    pub reputation: ReputationLedgerConfig,
    /// Staking pool configuration
    pub staking: StakingPoolConfig,
    /// Amount seeded into the staking rewards reserve at initialization
    pub rewards_reserve: i64,
}

impl Default for SettlementNodeConfig {
    fn default() -> Self {
        Self {
            escrow: EscrowEngineConfig::default(),
            reputation: ReputationLedgerConfig::default(),
            staking: StakingPoolConfig::default(),
            rewards_reserve: 1_000_000,
        }
    }
}

impl SettlementNodeConfig {
    /// Load the configuration with environment overrides layered over the
    /// defaults, e.g. `SETTLEMENT_ESCROW__MAX_SERVICE_AMOUNT=500000`.
    pub fn from_env() -> EngineResult<Self> {
        let defaults = config::Config::try_from(&Self::default())
            .map_err(|e| EngineError::config(e.to_string()))?;
        config::Config::builder()
            .add_source(defaults)
            .add_source(
                config::Environment::with_prefix("SETTLEMENT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| EngineError::config(e.to_string()))?
            .try_deserialize()
            .map_err(|e| EngineError::config(e.to_string()))
    }
}

/// Main settlement node coordinating all components
pub struct SettlementNode {
    /// Custody ledger shared by the escrow engine and staking pool
    ledger: Arc<CustodyLedger>,
    /// Escrow engine for the service lifecycle
    escrow: Arc<EscrowEngine>,
    /// Reputation ledger for profiles and reviews
    reputation: Arc<ReputationLedger>,
    /// Staking pool for reward accrual
    staking: Arc<StakingPool>,
    /// Append-only event log for external observers
    outbox: Arc<EventOutbox>,
}

/// Node health status
#[derive(Debug, Clone)]
pub struct NodeHealth {
    pub healthy: bool,
    pub issues: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl SettlementNode {
    /// Create a new settlement node with empty ledgers (genesis state)
    pub async fn new(config: SettlementNodeConfig) -> EngineResult<Self> {
        info!("Initializing settlement node");

        let ledger = Arc::new(CustodyLedger::new());
        let outbox = Arc::new(EventOutbox::new());
        let escrow = Arc::new(EscrowEngine::new(
            config.escrow,
            ledger.clone(),
            outbox.clone(),
        ));
        let reputation = Arc::new(ReputationLedger::new(config.reputation, outbox.clone()));
        let staking = Arc::new(StakingPool::new(config.staking, ledger.clone()));

        if config.rewards_reserve > 0 {
            ledger
                .deposit(REWARDS_RESERVE_ACCOUNT, config.rewards_reserve)
                .await?;
        }

        info!("Settlement node initialized");

        Ok(Self {
            ledger,
            escrow,
            reputation,
            staking,
            outbox,
        })
    }

    /// Credit a participant's balance from outside the engine
    pub async fn deposit(&self, participant: &str, amount: i64) -> EngineResult<i64> {
        self.ledger.deposit(participant, amount).await
    }

    /// Free balance of a participant
    pub async fn balance_of(&self, participant: &str) -> i64 {
        self.ledger.balance_of(participant).await
    }

    /// Create a new service, locking its total amount into custody
    pub async fn create_service(&self, request: CreateServiceRequest) -> EngineResult<Service> {
        let service = self.escrow.create_service(request).await?;
        self.reputation.record_job_started(&service.contractor).await;
        Ok(service)
    }

    /// Start a milestone (contractor)
    pub async fn start_milestone(
        &self,
        caller: &str,
        service_id: ServiceId,
        index: usize,
    ) -> EngineResult<Milestone> {
        self.escrow.start_milestone(caller, service_id, index).await
    }

    /// Mark a milestone's work as done (contractor)
    pub async fn complete_milestone(
        &self,
        caller: &str,
        service_id: ServiceId,
        index: usize,
    ) -> EngineResult<Milestone> {
        self.escrow
            .complete_milestone(caller, service_id, index)
            .await
    }

    /// Approve a completed milestone and release its tranche (client)
    pub async fn approve_milestone(
        &self,
        caller: &str,
        service_id: ServiceId,
        index: usize,
    ) -> EngineResult<Service> {
        let service = self.escrow.approve_milestone(caller, service_id, index).await?;
        if service.status == ServiceStatus::Completed {
            self.reputation
                .record_job_completed(&service.contractor)
                .await;
        }
        Ok(service)
    }

    /// Raise a dispute (either party)
    pub async fn raise_dispute(&self, request: RaiseDisputeRequest) -> EngineResult<Dispute> {
        self.escrow.raise_dispute(request).await
    }

    /// Resolve a dispute (configured resolver only)
    pub async fn resolve_dispute(&self, request: ResolveDisputeRequest) -> EngineResult<Service> {
        self.escrow.resolve_dispute(request).await
    }

    /// Cancel a service before work starts (client)
    pub async fn cancel_service(
        &self,
        caller: &str,
        service_id: ServiceId,
    ) -> EngineResult<Service> {
        self.escrow.cancel_service(caller, service_id).await
    }

    /// Register a contractor profile
    pub async fn register_contractor(
        &self,
        request: RegisterContractorRequest,
    ) -> EngineResult<ContractorProfile> {
        self.reputation.register_contractor(request).await
    }

    /// Submit a review for a settled service
    pub async fn submit_review(
        &self,
        service_id: ServiceId,
        request: SubmitReviewRequest,
    ) -> EngineResult<Review> {
        let service = self.escrow.get_service(service_id).await?;
        self.reputation.submit_review(&service, request).await
    }

    /// Flip a contractor profile's verification flag (platform operator)
    pub async fn set_contractor_verified(
        &self,
        contractor: &str,
        verified: bool,
    ) -> EngineResult<ContractorProfile> {
        self.reputation.set_verified(contractor, verified).await
    }

    /// Stake into the rewards pool
    pub async fn stake(&self, owner: &str, amount: i64) -> EngineResult<StakePosition> {
        self.staking.stake(owner, amount).await
    }

    /// Withdraw staked principal
    pub async fn unstake(&self, owner: &str, amount: i64) -> EngineResult<()> {
        self.staking.unstake(owner, amount).await
    }

    /// Claim accrued staking rewards
    pub async fn claim_rewards(&self, owner: &str) -> EngineResult<i64> {
        self.staking.claim_rewards(owner).await
    }

    /// Get a service by id
    pub async fn get_service(&self, service_id: ServiceId) -> EngineResult<Service> {
        self.escrow.get_service(service_id).await
    }

    /// Get a service's milestones
    pub async fn get_service_milestones(
        &self,
        service_id: ServiceId,
    ) -> EngineResult<Vec<Milestone>> {
        self.escrow.get_service_milestones(service_id).await
    }

    /// All services where the participant is the client
    pub async fn get_client_services(&self, participant: &str) -> Vec<Service> {
        self.escrow.get_client_services(participant).await
    }

    /// All services where the participant is the contractor
    pub async fn get_contractor_services(&self, participant: &str) -> Vec<Service> {
        self.escrow.get_contractor_services(participant).await
    }

    /// Get the dispute record for a service
    pub async fn get_dispute(&self, service_id: ServiceId) -> EngineResult<Dispute> {
        self.escrow.get_dispute(service_id).await
    }

    /// Get a contractor's profile
    pub async fn get_contractor_profile(
        &self,
        contractor: &str,
    ) -> EngineResult<ContractorProfile> {
        self.reputation.get_contractor_profile(contractor).await
    }

    /// Average rating for a contractor; 0.0 with no reviews
    pub async fn get_contractor_rating(&self, contractor: &str) -> f64 {
        self.reputation.get_contractor_rating(contractor).await
    }

    /// All reviews recorded for a service
    pub async fn get_service_reviews(&self, service_id: ServiceId) -> Vec<Review> {
        self.reputation.get_service_reviews(service_id).await
    }

    /// Rewards claimable right now
    pub async fn get_pending_rewards(&self, owner: &str) -> i64 {
        self.staking.get_pending_rewards(owner).await
    }

    /// Outbox entries after `after_id`, for indexer catch-up
    pub async fn get_events_since(&self, after_id: u64) -> Vec<EngineEvent> {
        self.outbox.events_since(after_id).await
    }

    /// Outbox entries concerning one service
    pub async fn get_service_events(&self, service_id: ServiceId) -> Vec<EngineEvent> {
        self.outbox.events_for_service(service_id).await
    }

    /// Audit the conservation invariants across all components
    pub async fn health_check(&self) -> NodeHealth {
        let mut issues = Vec::new();

        let total_staked = self.staking.total_staked().await;
        let positions_total = self.staking.positions_total().await;
        if total_staked != positions_total {
            issues.push(format!(
                "staking totals diverged: total_staked {} vs positions {}",
                total_staked, positions_total
            ));
        }

        let vault = self
            .ledger
            .balance_of(crate::staking_pool::POOL_VAULT_ACCOUNT)
            .await;
        if vault != total_staked {
            issues.push(format!(
                "pool vault balance {} does not cover total staked {}",
                vault, total_staked
            ));
        }

        for service in self.escrow.all_services().await {
            if service.released_amount < 0 || service.released_amount > service.total_amount {
                issues.push(format!(
                    "service {} released {} outside [0, {}]",
                    service.id, service.released_amount, service.total_amount
                ));
            }
            let held = self.ledger.held_for(service.id).await;
            let expected = if service.status.is_terminal() {
                0
            } else {
                service.remaining_amount()
            };
            if held != expected {
                issues.push(format!(
                    "service {} custody hold {} does not match expected {}",
                    service.id, held, expected
                ));
            }
        }

        NodeHealth {
            healthy: issues.is_empty(),
            issues,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MilestoneSpec, ServiceType};

    fn node_config() -> SettlementNodeConfig {
        SettlementNodeConfig {
            escrow: EscrowEngineConfig {
                resolver: Some("arbiter".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn renovation_request() -> CreateServiceRequest {
        CreateServiceRequest {
            client: "alice".to_string(),
            contractor: "bob".to_string(),
            total_amount: 300,
            milestones: vec![
                MilestoneSpec {
                    description: "demolition".to_string(),
                    amount: 100,
                },
                MilestoneSpec {
                    description: "installation".to_string(),
                    amount: 100,
                },
                MilestoneSpec {
                    description: "finishing".to_string(),
                    amount: 100,
                },
            ],
            description: "kitchen renovation".to_string(),
            service_type: ServiceType::Carpentry,
            deadline: None,
        }
    }

    #[tokio::test]
    async fn node_initialization_is_healthy() {
        let node = SettlementNode::new(node_config()).await.unwrap();
        let health = node.health_check().await;
        assert!(health.healthy, "issues: {:?}", health.issues);
    }

    #[tokio::test]
    async fn full_lifecycle_updates_every_component() {
        let node = SettlementNode::new(node_config()).await.unwrap();
        node.deposit("alice", 1_000).await.unwrap();

        node.register_contractor(RegisterContractorRequest {
            contractor: "bob".to_string(),
            name: "Bob's Carpentry".to_string(),
            description: "cabinets and trim".to_string(),
            skills: vec!["carpentry".to_string()],
        })
        .await
        .unwrap();

        let service = node.create_service(renovation_request()).await.unwrap();
        assert_eq!(
            node.get_contractor_profile("bob").await.unwrap().total_jobs,
            1
        );

        for index in 0..3 {
            node.start_milestone("bob", service.id, index).await.unwrap();
            node.complete_milestone("bob", service.id, index).await.unwrap();
            node.approve_milestone("alice", service.id, index).await.unwrap();
        }

        let profile = node.get_contractor_profile("bob").await.unwrap();
        assert_eq!(profile.completed_jobs, 1);
        assert_eq!(node.balance_of("bob").await, 300);
        assert_eq!(node.balance_of("alice").await, 700);

        node.submit_review(
            service.id,
            SubmitReviewRequest {
                reviewer: "alice".to_string(),
                reviewee: "bob".to_string(),
                rating: 5,
                comment: "great work".to_string(),
                is_client: true,
            },
        )
        .await
        .unwrap();
        assert_eq!(node.get_contractor_rating("bob").await, 5.0);

        let health = node.health_check().await;
        assert!(health.healthy, "issues: {:?}", health.issues);

        // the outbox saw creation, three completions, three releases, one review
        assert_eq!(node.get_service_events(service.id).await.len(), 8);
    }

    #[tokio::test]
    async fn review_is_locked_until_settlement() {
        let node = SettlementNode::new(node_config()).await.unwrap();
        node.deposit("alice", 300).await.unwrap();
        let service = node.create_service(renovation_request()).await.unwrap();

        let err = node
            .submit_review(
                service.id,
                SubmitReviewRequest {
                    reviewer: "alice".to_string(),
                    reviewee: "bob".to_string(),
                    rating: 5,
                    comment: String::new(),
                    is_client: true,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn staking_round_trip_through_the_node() {
        let node = SettlementNode::new(node_config()).await.unwrap();
        node.deposit("carol", 5_000).await.unwrap();

        node.stake("carol", 2_000).await.unwrap();
        assert_eq!(node.balance_of("carol").await, 3_000);
        assert_eq!(node.get_pending_rewards("carol").await, 0);

        node.unstake("carol", 2_000).await.unwrap();
        assert_eq!(node.balance_of("carol").await, 5_000);

        let health = node.health_check().await;
        assert!(health.healthy, "issues: {:?}", health.issues);
    }

    #[tokio::test]
    async fn default_config_loads() {
        let config = SettlementNodeConfig::default();
        assert!(config.escrow.resolver.is_none());
        assert!(config.rewards_reserve > 0);
    }

    #[tokio::test]
    async fn from_env_falls_back_to_defaults() {
        let config = SettlementNodeConfig::from_env().unwrap();
        let defaults = SettlementNodeConfig::default();
        assert_eq!(config.rewards_reserve, defaults.rewards_reserve);
        assert_eq!(
            config.staking.min_stake_amount,
            defaults.staking.min_stake_amount
        );
        assert_eq!(
            config.escrow.max_milestones_per_service,
            defaults.escrow.max_milestones_per_service
        );
    }
}
