//! Escrow Engine - Service and Milestone lifecycle
//!
//! This module owns the service state machine, fund custody movement, and
//! release/dispute logic. Every mutating operation validates under the state
//! write lock, performs the custody movement (the only fallible commit step),
//! then applies the record mutation and appends the event, so callers never
//! observe a partially-applied transition.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::custody_ledger::CustodyLedger;
use crate::error::EngineError;
use crate::event_outbox::{EventKind, EventOutbox};
use crate::models::{
    Dispute, DisputeAllocation, Milestone, MilestoneSpec, MilestoneStatus, Service, ServiceId,
    ServiceStatus, ServiceType,
};
use crate::EngineResult;

/// Configuration for the escrow engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowEngineConfig {
    /// Maximum total amount for a single service
    pub max_service_amount: i64,
    /// Maximum number of milestones per service
    pub max_milestones_per_service: usize,
    /// Identity authorized to resolve disputes; None until an external
    /// arbitration authority is assigned
    pub resolver: Option<String>,
}

impl Default for EscrowEngineConfig {
    fn default() -> Self {
        Self {
            max_service_amount: 1_000_000_000,
            max_milestones_per_service: 32,
            resolver: None,
        }
    }
}

/// Main escrow engine
pub struct EscrowEngine {
    /// Configuration
    config: EscrowEngineConfig,
    /// In-memory service storage (in production, this would be a database)
    state: RwLock<EngineState>,
    /// Custody ledger shared with the rest of the node
    ledger: Arc<CustodyLedger>,
    /// Outbox written on every successful commit
    outbox: Arc<EventOutbox>,
}

#[derive(Default)]
struct EngineState {
    services: HashMap<ServiceId, ServiceRecord>,
    disputes: HashMap<ServiceId, Dispute>,
    next_service_id: ServiceId,
}

struct ServiceRecord {
    service: Service,
    milestones: Vec<Milestone>,
}

/// Service creation request
#[derive(Debug, Clone)]
pub struct CreateServiceRequest {
    pub client: String,
    pub contractor: String,
    pub total_amount: i64,
    pub milestones: Vec<MilestoneSpec>,
    pub description: String,
    pub service_type: ServiceType,
    pub deadline: Option<DateTime<Utc>>,
}

/// Dispute request
#[derive(Debug, Clone)]
pub struct RaiseDisputeRequest {
    pub service_id: ServiceId,
    pub raised_by: String,
    pub reason: String,
}

/// Dispute resolution request, issued by the external arbitration authority
#[derive(Debug, Clone)]
pub struct ResolveDisputeRequest {
    pub service_id: ServiceId,
    pub resolver: String,
    pub allocation: DisputeAllocation,
}

impl EscrowEngine {
    /// Create a new escrow engine over a shared ledger and outbox
    pub fn new(
        config: EscrowEngineConfig,
        ledger: Arc<CustodyLedger>,
        outbox: Arc<EventOutbox>,
    ) -> Self {
        Self {
            config,
            state: RwLock::new(EngineState::default()),
            ledger,
            outbox,
        }
    }

    /// Create a new service, locking the full amount into custody.
    /// All-or-nothing: if the client's balance cannot cover the total, no
    /// service or milestone records are left behind.
    pub async fn create_service(&self, request: CreateServiceRequest) -> EngineResult<Service> {
        self.validate_create_service_request(&request)?;

        let mut state = self.state.write().await;
        let service_id = state.next_service_id + 1;

        self.ledger
            .lock_funds(service_id, &request.client, request.total_amount)
            .await?;
        state.next_service_id = service_id;

        let service = Service::new(
            service_id,
            request.client.clone(),
            request.contractor.clone(),
            request.total_amount,
            request.milestones.len(),
            request.description,
            request.service_type,
            request.deadline,
        );
        let milestones = request
            .milestones
            .into_iter()
            .enumerate()
            .map(|(index, spec)| Milestone::new(service_id, index, spec.description, spec.amount))
            .collect();

        state.services.insert(
            service_id,
            ServiceRecord {
                service: service.clone(),
                milestones,
            },
        );

        self.outbox
            .record(EventKind::ServiceCreated {
                service_id,
                client: request.client,
                contractor: request.contractor,
                amount: request.total_amount,
            })
            .await;

        info!("Created service {} ({} milestones)", service_id, service.milestone_count);

        Ok(service)
    }

    /// Start a milestone. Milestones execute strictly in order: the previous
    /// milestone must be approved before the next can start.
    pub async fn start_milestone(
        &self,
        caller: &str,
        service_id: ServiceId,
        index: usize,
    ) -> EngineResult<Milestone> {
        let mut state = self.state.write().await;
        let record = state.record_mut(service_id)?;

        if caller != record.service.contractor {
            return Err(EngineError::not_authorized(
                "start_milestone",
                "contractor",
                caller,
            ));
        }
        if !record.service.status.allows_milestone_activity() {
            return Err(EngineError::invalid_service_state(
                service_id,
                record.service.status,
                "start_milestone",
            ));
        }

        let milestone = record.milestone(index)?;
        if !milestone.status.can_start() {
            return Err(EngineError::invalid_milestone_state(
                service_id,
                index,
                milestone.status,
                "start_milestone",
            ));
        }
        if index > 0 && record.milestones[index - 1].status != MilestoneStatus::Approved {
            return Err(EngineError::OutOfOrder {
                service_id,
                index,
                waiting_on: index - 1,
            });
        }

        let milestone = &mut record.milestones[index];
        milestone.status = MilestoneStatus::InProgress;
        milestone.started_at = Some(Utc::now());
        let milestone = milestone.clone();

        if record.service.status == ServiceStatus::Created {
            record
                .service
                .transition(ServiceStatus::InProgress, "start_milestone")?;
        }

        info!("Started milestone {} of service {}", index, service_id);

        Ok(milestone)
    }

    /// Mark a milestone's work as done. Signals completion only; funds move
    /// exclusively through explicit client approval.
    pub async fn complete_milestone(
        &self,
        caller: &str,
        service_id: ServiceId,
        index: usize,
    ) -> EngineResult<Milestone> {
        let mut state = self.state.write().await;
        let record = state.record_mut(service_id)?;

        if caller != record.service.contractor {
            return Err(EngineError::not_authorized(
                "complete_milestone",
                "contractor",
                caller,
            ));
        }
        if !record.service.status.allows_milestone_activity() {
            return Err(EngineError::invalid_service_state(
                service_id,
                record.service.status,
                "complete_milestone",
            ));
        }

        let milestone = record.milestone(index)?;
        if !milestone.status.can_complete() {
            return Err(EngineError::invalid_milestone_state(
                service_id,
                index,
                milestone.status,
                "complete_milestone",
            ));
        }

        let milestone = &mut record.milestones[index];
        milestone.status = MilestoneStatus::Completed;
        milestone.completed_at = Some(Utc::now());
        let milestone = milestone.clone();
        record.service.updated_at = Utc::now();

        self.outbox
            .record(EventKind::MilestoneCompleted {
                service_id,
                index,
                amount: milestone.amount,
            })
            .await;

        info!("Completed milestone {} of service {}", index, service_id);

        Ok(milestone)
    }

    /// Approve a completed milestone and release its amount from custody to
    /// the contractor. Double release is impossible: the check is against the
    /// milestone's own status, which flips to `Approved` in the same commit.
    pub async fn approve_milestone(
        &self,
        caller: &str,
        service_id: ServiceId,
        index: usize,
    ) -> EngineResult<Service> {
        let mut state = self.state.write().await;
        let record = state.record_mut(service_id)?;

        if caller != record.service.client {
            return Err(EngineError::not_authorized(
                "approve_milestone",
                "client",
                caller,
            ));
        }
        if !record.service.status.allows_milestone_activity() {
            return Err(EngineError::invalid_service_state(
                service_id,
                record.service.status,
                "approve_milestone",
            ));
        }

        let milestone = record.milestone(index)?;
        if milestone.status == MilestoneStatus::Approved {
            return Err(EngineError::AlreadyReleased { service_id, index });
        }
        if !milestone.status.can_approve() {
            return Err(EngineError::invalid_milestone_state(
                service_id,
                index,
                milestone.status,
                "approve_milestone",
            ));
        }

        let amount = milestone.amount;
        let contractor = record.service.contractor.clone();

        self.ledger
            .release_from_hold(service_id, &contractor, amount)
            .await?;

        let milestone = &mut record.milestones[index];
        milestone.status = MilestoneStatus::Approved;
        milestone.approved_at = Some(Utc::now());

        record.service.released_amount += amount;
        record.service.completed_milestone_count += 1;
        record.service.updated_at = Utc::now();
        if record.service.completed_milestone_count == record.service.milestone_count {
            record
                .service
                .transition(ServiceStatus::Completed, "approve_milestone")?;
        }
        let service = record.service.clone();

        self.outbox
            .record(EventKind::PaymentReleased {
                service_id,
                amount,
                contractor,
            })
            .await;

        info!(
            "Released {} for milestone {} of service {} ({}/{} approved)",
            amount, index, service_id, service.completed_milestone_count, service.milestone_count
        );

        Ok(service)
    }

    /// Raise a dispute, freezing all milestone transitions until an external
    /// resolution
    pub async fn raise_dispute(&self, request: RaiseDisputeRequest) -> EngineResult<Dispute> {
        if request.reason.trim().is_empty() {
            return Err(EngineError::validation("dispute reason cannot be empty"));
        }

        let mut state = self.state.write().await;
        let record = state.record_mut(request.service_id)?;

        if !record.service.is_participant(&request.raised_by) {
            return Err(EngineError::not_authorized(
                "raise_dispute",
                "client or contractor",
                request.raised_by,
            ));
        }
        if !record.service.status.can_dispute() {
            return Err(EngineError::invalid_service_state(
                request.service_id,
                record.service.status,
                "raise_dispute",
            ));
        }

        record
            .service
            .transition(ServiceStatus::Disputed, "raise_dispute")?;

        let dispute = Dispute::new(request.service_id, request.raised_by, request.reason);
        state.disputes.insert(request.service_id, dispute.clone());

        warn!("Dispute raised on service {}", request.service_id);

        Ok(dispute)
    }

    /// Resolve a dispute by allocating the unreleased remainder. Only the
    /// configured resolver identity may call this; the allocation must cover
    /// the remainder exactly and can never re-touch released funds.
    pub async fn resolve_dispute(&self, request: ResolveDisputeRequest) -> EngineResult<Service> {
        if self.config.resolver.as_deref() != Some(request.resolver.as_str()) {
            return Err(EngineError::not_authorized(
                "resolve_dispute",
                "configured resolver",
                request.resolver,
            ));
        }

        let mut state = self.state.write().await;
        let record = state.record_mut(request.service_id)?;

        if record.service.status != ServiceStatus::Disputed {
            return Err(EngineError::invalid_service_state(
                request.service_id,
                record.service.status,
                "resolve_dispute",
            ));
        }

        let remaining = record.service.remaining_amount();
        let (to_contractor, to_client) = request.allocation.shares(remaining);
        if to_contractor < 0 || to_client < 0 {
            return Err(EngineError::validation(
                "allocation amounts cannot be negative",
            ));
        }
        if to_contractor + to_client != remaining {
            return Err(EngineError::AmountMismatch {
                expected: remaining,
                actual: to_contractor + to_client,
            });
        }

        let contractor = record.service.contractor.clone();
        let client = record.service.client.clone();
        if to_contractor > 0 {
            self.ledger
                .release_from_hold(request.service_id, &contractor, to_contractor)
                .await?;
        }
        if to_client > 0 {
            self.ledger
                .release_from_hold(request.service_id, &client, to_client)
                .await?;
        }

        record.service.released_amount += to_contractor;
        let final_status = if to_contractor > 0 {
            ServiceStatus::Completed
        } else {
            ServiceStatus::Cancelled
        };
        record.service.transition(final_status, "resolve_dispute")?;

        let dispute = state.disputes.get_mut(&request.service_id).ok_or_else(|| {
            EngineError::not_found("dispute for service", request.service_id)
        })?;
        dispute.resolution = Some(request.allocation);
        dispute.resolved_at = Some(Utc::now());

        let service = state.services[&request.service_id].service.clone();

        if to_contractor > 0 {
            self.outbox
                .record(EventKind::PaymentReleased {
                    service_id: request.service_id,
                    amount: to_contractor,
                    contractor,
                })
                .await;
        }

        info!(
            "Resolved dispute on service {}: {} to contractor, {} to client",
            request.service_id, to_contractor, to_client
        );

        Ok(service)
    }

    /// Cancel a service before any milestone has started, refunding the full
    /// amount to the client
    pub async fn cancel_service(&self, caller: &str, service_id: ServiceId) -> EngineResult<Service> {
        let mut state = self.state.write().await;
        let record = state.record_mut(service_id)?;

        if caller != record.service.client {
            return Err(EngineError::not_authorized(
                "cancel_service",
                "client",
                caller,
            ));
        }
        if !record.service.status.can_cancel() {
            return Err(EngineError::invalid_service_state(
                service_id,
                record.service.status,
                "cancel_service",
            ));
        }

        let client = record.service.client.clone();
        let total = record.service.total_amount;
        self.ledger
            .release_from_hold(service_id, &client, total)
            .await?;

        record
            .service
            .transition(ServiceStatus::Cancelled, "cancel_service")?;
        let service = record.service.clone();

        info!("Cancelled service {}, refunded {}", service_id, total);

        Ok(service)
    }

    /// Get a service by id
    pub async fn get_service(&self, service_id: ServiceId) -> EngineResult<Service> {
        self.state
            .read()
            .await
            .services
            .get(&service_id)
            .map(|record| record.service.clone())
            .ok_or_else(|| EngineError::not_found("service", service_id))
    }

    /// Get the milestones of a service, in approval order
    pub async fn get_service_milestones(
        &self,
        service_id: ServiceId,
    ) -> EngineResult<Vec<Milestone>> {
        self.state
            .read()
            .await
            .services
            .get(&service_id)
            .map(|record| record.milestones.clone())
            .ok_or_else(|| EngineError::not_found("service", service_id))
    }

    /// Get the dispute record for a service
    pub async fn get_dispute(&self, service_id: ServiceId) -> EngineResult<Dispute> {
        self.state
            .read()
            .await
            .disputes
            .get(&service_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("dispute for service", service_id))
    }

    /// All services where `participant` is the client
    pub async fn get_client_services(&self, participant: &str) -> Vec<Service> {
        self.state
            .read()
            .await
            .services
            .values()
            .filter(|record| record.service.client == participant)
            .map(|record| record.service.clone())
            .collect()
    }

    /// All services where `participant` is the contractor
    pub async fn get_contractor_services(&self, participant: &str) -> Vec<Service> {
        self.state
            .read()
            .await
            .services
            .values()
            .filter(|record| record.service.contractor == participant)
            .map(|record| record.service.clone())
            .collect()
    }

    /// Snapshot of every service record, for audits
    pub async fn all_services(&self) -> Vec<Service> {
        self.state
            .read()
            .await
            .services
            .values()
            .map(|record| record.service.clone())
            .collect()
    }

    /// Validate a service creation request
    fn validate_create_service_request(&self, request: &CreateServiceRequest) -> EngineResult<()> {
        if request.client.trim().is_empty() || request.contractor.trim().is_empty() {
            return Err(EngineError::validation(
                "client and contractor identifiers cannot be empty",
            ));
        }
        if request.client == request.contractor {
            return Err(EngineError::validation(
                "client and contractor must be distinct",
            ));
        }
        if request.description.trim().is_empty() {
            return Err(EngineError::validation("description cannot be empty"));
        }
        if request.milestones.is_empty() {
            return Err(EngineError::validation(
                "a service needs at least one milestone",
            ));
        }
        if request.milestones.len() > self.config.max_milestones_per_service {
            return Err(EngineError::validation(format!(
                "milestone count {} exceeds maximum {}",
                request.milestones.len(),
                self.config.max_milestones_per_service
            )));
        }
        if request.total_amount <= 0 {
            return Err(EngineError::validation(
                "total amount must be greater than 0",
            ));
        }
        if request.total_amount > self.config.max_service_amount {
            return Err(EngineError::validation(format!(
                "total amount {} exceeds maximum {}",
                request.total_amount, self.config.max_service_amount
            )));
        }

        let mut sum: i64 = 0;
        for spec in &request.milestones {
            if spec.amount <= 0 {
                return Err(EngineError::validation(
                    "milestone amounts must be greater than 0",
                ));
            }
            sum = sum
                .checked_add(spec.amount)
                .ok_or_else(|| EngineError::validation("milestone amounts overflow"))?;
        }
        if sum != request.total_amount {
            return Err(EngineError::AmountMismatch {
                expected: request.total_amount,
                actual: sum,
            });
        }

        Ok(())
    }
}

impl EngineState {
    fn record_mut(&mut self, service_id: ServiceId) -> EngineResult<&mut ServiceRecord> {
        self.services
            .get_mut(&service_id)
            .ok_or_else(|| EngineError::not_found("service", service_id))
    }
}

impl ServiceRecord {
    fn milestone(&self, index: usize) -> EngineResult<&Milestone> {
        self.milestones.get(index).ok_or_else(|| {
            EngineError::not_found("milestone", format!("{}.{}", self.service.id, index))
        })
    }
}
