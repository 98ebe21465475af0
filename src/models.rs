//! Core data models for the settlement engine
//!
//! This module contains the domain records, state machines, and type
//! definitions shared by the escrow engine, reputation ledger, and
//! staking pool.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;
use crate::EngineResult;

/// Unique identifier for a service agreement, assigned sequentially.
pub type ServiceId = u64;

/// Service state machine enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceStatus {
    /// Funds in custody, no milestone started
    Created,
    /// At least one milestone started
    InProgress,
    /// All milestones approved, or dispute resolved with a contractor payout
    Completed,
    /// Frozen pending external resolution
    Disputed,
    /// Cancelled before work started, or dispute resolved as a full refund
    Cancelled,
}

impl ServiceStatus {
    /// Check if this is a terminal state (no further transitions possible)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Check if this state allows cancellation
    pub fn can_cancel(&self) -> bool {
        matches!(self, Self::Created)
    }

    /// Check if this state allows raising a dispute
    pub fn can_dispute(&self) -> bool {
        matches!(self, Self::InProgress)
    }

    /// Check if this state allows milestone transitions
    pub fn allows_milestone_activity(&self) -> bool {
        matches!(self, Self::Created | Self::InProgress)
    }

    /// Check whether a direct transition to `to` is valid
    pub fn can_transition_to(&self, to: ServiceStatus) -> bool {
        matches!(
            (self, to),
            (Self::Created, Self::InProgress)
                | (Self::Created, Self::Cancelled)
                | (Self::InProgress, Self::Completed)
                | (Self::InProgress, Self::Disputed)
                | (Self::Disputed, Self::Completed)
                | (Self::Disputed, Self::Cancelled)
        )
    }
}

/// Milestone state machine enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MilestoneStatus {
    /// Not yet started
    Pending,
    /// Contractor working
    InProgress,
    /// Work signalled done, awaiting client approval
    Completed,
    /// Client approved, funds released
    Approved,
}

impl MilestoneStatus {
    /// Check if this is the terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Approved)
    }

    /// Check if this state allows starting work
    pub fn can_start(&self) -> bool {
        matches!(self, Self::Pending)
    }

    /// Check if this state allows marking work done
    pub fn can_complete(&self) -> bool {
        matches!(self, Self::InProgress)
    }

    /// Check if this state allows approval (and release)
    pub fn can_approve(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Domain categories for physical services
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceType {
    Plumbing,
    Electrical,
    Carpentry,
    Cleaning,
    Landscaping,
    Moving,
    Painting,
    Other,
}

/// One escrow agreement between a client and a contractor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub id: ServiceId,
    pub client: String,
    pub contractor: String,

    /// Fixed at creation; equals the sum of all milestone amounts
    pub total_amount: i64,
    /// Monotonically non-decreasing; never exceeds `total_amount`
    pub released_amount: i64,

    pub status: ServiceStatus,
    pub milestone_count: usize,
    pub completed_milestone_count: usize,

    pub description: String,
    pub service_type: ServiceType,

    /// Informational only; the engine never self-triggers on it
    pub deadline: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Service {
    /// Create a new service record in `Created` status
    pub fn new(
        id: ServiceId,
        client: String,
        contractor: String,
        total_amount: i64,
        milestone_count: usize,
        description: String,
        service_type: ServiceType,
        deadline: Option<DateTime<Utc>>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            client,
            contractor,
            total_amount,
            released_amount: 0,
            status: ServiceStatus::Created,
            milestone_count,
            completed_milestone_count: 0,
            description,
            service_type,
            deadline,
            created_at: now,
            updated_at: now,
        }
    }

    /// Validate and apply a status transition
    pub fn transition(&mut self, to: ServiceStatus, operation: &'static str) -> EngineResult<()> {
        if !self.status.can_transition_to(to) {
            return Err(EngineError::invalid_service_state(
                self.id,
                self.status,
                operation,
            ));
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Custody still held for this service
    pub fn remaining_amount(&self) -> i64 {
        self.total_amount - self.released_amount
    }

    /// Check whether `participant` is the client or the contractor
    pub fn is_participant(&self, participant: &str) -> bool {
        self.client == participant || self.contractor == participant
    }

    /// The opposite party of `participant`, if they are a participant at all
    pub fn counterparty(&self, participant: &str) -> Option<&str> {
        if participant == self.client {
            Some(self.contractor.as_str())
        } else if participant == self.contractor {
            Some(self.client.as_str())
        } else {
            None
        }
    }
}

/// One payable tranche of a service, approved independently and in order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Milestone {
    pub service_id: ServiceId,
    /// 0-based, fixed at creation; the approval sequence
    pub index: usize,
    pub description: String,
    pub amount: i64,
    pub status: MilestoneStatus,

    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub approved_at: Option<DateTime<Utc>>,
}

impl Milestone {
    /// Create a new pending milestone
    pub fn new(service_id: ServiceId, index: usize, description: String, amount: i64) -> Self {
        Self {
            service_id,
            index,
            description,
            amount,
            status: MilestoneStatus::Pending,
            started_at: None,
            completed_at: None,
            approved_at: None,
        }
    }
}

/// Description and amount for one milestone at service creation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MilestoneSpec {
    pub description: String,
    pub amount: i64,
}

/// One reputation event, immutable once recorded
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Review {
    pub id: Uuid,
    pub service_id: ServiceId,
    pub reviewer: String,
    pub reviewee: String,
    /// Integer rating in [1, 5]
    pub rating: u8,
    pub comment: String,
    /// Direction flag: true if client reviewing the contractor
    pub is_client: bool,
    pub created_at: DateTime<Utc>,
}

impl Review {
    pub fn new(
        service_id: ServiceId,
        reviewer: String,
        reviewee: String,
        rating: u8,
        comment: String,
        is_client: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            service_id,
            reviewer,
            reviewee,
            rating,
            comment,
            is_client,
            created_at: Utc::now(),
        }
    }
}

/// Aggregate reputation state for a registered contractor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractorProfile {
    pub contractor: String,
    pub name: String,
    pub description: String,
    pub skills: Vec<String>,

    pub total_jobs: u32,
    pub completed_jobs: u32,

    /// Incremental aggregates; `average_rating` is always derived from these,
    /// never cached separately
    pub total_rating_sum: i64,
    pub review_count: u32,

    pub is_verified: bool,

    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ContractorProfile {
    /// Create a fresh profile with zeroed aggregates
    pub fn new(contractor: String, name: String, description: String, skills: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            contractor,
            name,
            description,
            skills,
            total_jobs: 0,
            completed_jobs: 0,
            total_rating_sum: 0,
            review_count: 0,
            is_verified: false,
            registered_at: now,
            updated_at: now,
        }
    }

    /// Average rating; 0.0 when no reviews exist
    pub fn average_rating(&self) -> f64 {
        if self.review_count == 0 {
            0.0
        } else {
            self.total_rating_sum as f64 / self.review_count as f64
        }
    }

    /// Fold one review rating into the aggregates
    pub fn record_review(&mut self, rating: u8) {
        self.total_rating_sum += rating as i64;
        self.review_count += 1;
        self.updated_at = Utc::now();
    }
}

/// One staker's holding in the staking pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StakePosition {
    pub owner: String,
    pub amount: i64,
    /// Accrual checkpoint; advanced whenever pending rewards are settled
    pub since: DateTime<Utc>,
    pub last_claim: Option<DateTime<Utc>>,
    /// Reward already paid out for the current accrual window
    pub reward_debt: i64,
}

impl StakePosition {
    pub fn new(owner: String, amount: i64, since: DateTime<Utc>) -> Self {
        Self {
            owner,
            amount,
            since,
            last_claim: None,
            reward_debt: 0,
        }
    }
}

/// Dispute record for a frozen service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dispute {
    pub id: Uuid,
    pub service_id: ServiceId,
    pub raised_by: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,

    pub resolution: Option<DisputeAllocation>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Dispute {
    pub fn new(service_id: ServiceId, raised_by: String, reason: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            service_id,
            raised_by,
            reason,
            created_at: Utc::now(),
            resolution: None,
            resolved_at: None,
        }
    }
}

/// How a resolver allocates the unreleased remainder of a disputed service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisputeAllocation {
    /// Remaining funds released to the contractor
    ReleaseToContractor,
    /// Remaining funds refunded to the client
    RefundToClient,
    /// Remaining funds split; the two parts must sum to the remainder
    Split {
        contractor_amount: i64,
        client_amount: i64,
    },
}

impl DisputeAllocation {
    /// The contractor's and client's share of `remaining`
    pub fn shares(&self, remaining: i64) -> (i64, i64) {
        match *self {
            Self::ReleaseToContractor => (remaining, 0),
            Self::RefundToClient => (0, remaining),
            Self::Split {
                contractor_amount,
                client_amount,
            } => (contractor_amount, client_amount),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_transition_table() {
        assert!(ServiceStatus::Created.can_transition_to(ServiceStatus::InProgress));
        assert!(ServiceStatus::Created.can_transition_to(ServiceStatus::Cancelled));
        assert!(ServiceStatus::InProgress.can_transition_to(ServiceStatus::Disputed));
        assert!(ServiceStatus::Disputed.can_transition_to(ServiceStatus::Completed));
        assert!(ServiceStatus::Disputed.can_transition_to(ServiceStatus::Cancelled));

        // no transition leaves a terminal state
        assert!(!ServiceStatus::Completed.can_transition_to(ServiceStatus::InProgress));
        assert!(!ServiceStatus::Cancelled.can_transition_to(ServiceStatus::Created));
        assert!(!ServiceStatus::Created.can_transition_to(ServiceStatus::Completed));
    }

    #[test]
    fn invalid_transition_is_typed() {
        let mut service = Service::new(
            1,
            "client".to_string(),
            "contractor".to_string(),
            100,
            1,
            "fix sink".to_string(),
            ServiceType::Plumbing,
            None,
        );
        service.status = ServiceStatus::Completed;
        let err = service
            .transition(ServiceStatus::InProgress, "start_milestone")
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidState { .. }));
    }

    #[test]
    fn milestone_predicates() {
        assert!(MilestoneStatus::Pending.can_start());
        assert!(!MilestoneStatus::Pending.can_complete());
        assert!(MilestoneStatus::InProgress.can_complete());
        assert!(MilestoneStatus::Completed.can_approve());
        assert!(MilestoneStatus::Approved.is_terminal());
        assert!(!MilestoneStatus::Approved.can_approve());
    }

    #[test]
    fn average_rating_never_divides_by_zero() {
        let mut profile = ContractorProfile::new(
            "bob".to_string(),
            "Bob's Plumbing".to_string(),
            String::new(),
            vec!["plumbing".to_string()],
        );
        assert_eq!(profile.average_rating(), 0.0);

        profile.record_review(4);
        profile.record_review(5);
        assert_eq!(profile.average_rating(), 4.5);
        assert_eq!(profile.review_count, 2);
    }

    #[test]
    fn allocation_shares_cover_remainder() {
        assert_eq!(DisputeAllocation::ReleaseToContractor.shares(200), (200, 0));
        assert_eq!(DisputeAllocation::RefundToClient.shares(200), (0, 200));
        assert_eq!(
            DisputeAllocation::Split {
                contractor_amount: 150,
                client_amount: 50
            }
            .shares(200),
            (150, 50)
        );
    }
}
