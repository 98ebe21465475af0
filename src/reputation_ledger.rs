//! Reputation Ledger - review records and rating aggregates
//!
//! This module tracks contractor profiles and the reviews submitted after a
//! service settles. Ratings are aggregated incrementally on the profile, so
//! the average is always derived from the recorded review set and a rating
//! lookup stays O(1). Pure aggregation; no money moves here.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use crate::error::EngineError;
use crate::event_outbox::{EventKind, EventOutbox};
use crate::models::{ContractorProfile, Review, Service, ServiceId, ServiceStatus};
use crate::EngineResult;

/// Configuration for the reputation ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReputationLedgerConfig {
    /// Maximum review comment length in characters
    pub max_comment_len: usize,
    /// Maximum number of skills on a profile
    pub max_skills: usize,
}

impl Default for ReputationLedgerConfig {
    fn default() -> Self {
        Self {
            max_comment_len: 512,
            max_skills: 16,
        }
    }
}

/// Main reputation ledger
pub struct ReputationLedger {
    config: ReputationLedgerConfig,
    /// In-memory profile and review storage (in production, this would be a database)
    state: RwLock<LedgerState>,
    /// Outbox written on every successful commit
    outbox: Arc<EventOutbox>,
}

#[derive(Default)]
struct LedgerState {
    profiles: HashMap<String, ContractorProfile>,
    reviews: Vec<Review>,
    /// One review per (service, reviewer) pair
    reviewed: HashSet<(ServiceId, String)>,
}

/// Contractor registration request
#[derive(Debug, Clone)]
pub struct RegisterContractorRequest {
    pub contractor: String,
    pub name: String,
    pub description: String,
    pub skills: Vec<String>,
}

/// Review submission request
#[derive(Debug, Clone)]
pub struct SubmitReviewRequest {
    pub reviewer: String,
    pub reviewee: String,
    pub rating: u8,
    pub comment: String,
    /// Direction flag: true if the client is reviewing the contractor
    pub is_client: bool,
}

impl ReputationLedger {
    /// Create a new reputation ledger over a shared outbox
    pub fn new(config: ReputationLedgerConfig, outbox: Arc<EventOutbox>) -> Self {
        Self {
            config,
            state: RwLock::new(LedgerState::default()),
            outbox,
        }
    }

    /// Register a contractor profile. An identity claim: one profile per
    /// contractor, ever.
    pub async fn register_contractor(
        &self,
        request: RegisterContractorRequest,
    ) -> EngineResult<ContractorProfile> {
        if request.contractor.trim().is_empty() {
            return Err(EngineError::validation(
                "contractor identifier cannot be empty",
            ));
        }
        if request.name.trim().is_empty() {
            return Err(EngineError::validation("profile name cannot be empty"));
        }
        if request.skills.len() > self.config.max_skills {
            return Err(EngineError::validation(format!(
                "skill count {} exceeds maximum {}",
                request.skills.len(),
                self.config.max_skills
            )));
        }

        let mut state = self.state.write().await;
        if state.profiles.contains_key(&request.contractor) {
            return Err(EngineError::AlreadyRegistered {
                contractor: request.contractor,
            });
        }

        let profile = ContractorProfile::new(
            request.contractor.clone(),
            request.name.clone(),
            request.description,
            request.skills,
        );
        state
            .profiles
            .insert(request.contractor.clone(), profile.clone());

        self.outbox
            .record(EventKind::ContractorRegistered {
                contractor: request.contractor.clone(),
                name: request.name,
            })
            .await;

        info!("Registered contractor {}", request.contractor);

        Ok(profile)
    }

    /// Submit a review against a settled service. The caller passes the
    /// current service snapshot; reviews unlock only once the service is
    /// `Completed`, which prevents pre-payment coercion.
    pub async fn submit_review(
        &self,
        service: &Service,
        request: SubmitReviewRequest,
    ) -> EngineResult<Review> {
        if !(1..=5).contains(&request.rating) {
            return Err(EngineError::validation(format!(
                "rating {} is outside [1, 5]",
                request.rating
            )));
        }
        if request.comment.len() > self.config.max_comment_len {
            return Err(EngineError::validation(format!(
                "comment length {} exceeds maximum {}",
                request.comment.len(),
                self.config.max_comment_len
            )));
        }
        if service.status != ServiceStatus::Completed {
            return Err(EngineError::invalid_service_state(
                service.id,
                service.status,
                "submit_review",
            ));
        }
        if !service.is_participant(&request.reviewer) {
            return Err(EngineError::not_authorized(
                "submit_review",
                "client or contractor",
                request.reviewer,
            ));
        }
        if service.counterparty(&request.reviewer) != Some(request.reviewee.as_str()) {
            return Err(EngineError::validation(
                "reviewee must be the other participant of the service",
            ));
        }
        if request.is_client != (request.reviewer == service.client) {
            return Err(EngineError::validation(
                "direction flag does not match the caller's role",
            ));
        }

        let mut state = self.state.write().await;
        let key = (service.id, request.reviewer.clone());
        if state.reviewed.contains(&key) {
            return Err(EngineError::DuplicateReview {
                service_id: service.id,
                reviewer: request.reviewer,
            });
        }

        let review = Review::new(
            service.id,
            request.reviewer,
            request.reviewee.clone(),
            request.rating,
            request.comment,
            request.is_client,
        );

        state.reviewed.insert(key);
        state.reviews.push(review.clone());
        if request.is_client {
            if let Some(profile) = state.profiles.get_mut(&request.reviewee) {
                profile.record_review(request.rating);
            }
        }

        self.outbox
            .record(EventKind::ReviewSubmitted {
                service_id: review.service_id,
                reviewer: review.reviewer.clone(),
                reviewee: review.reviewee.clone(),
                rating: review.rating,
            })
            .await;

        info!(
            "Recorded review for service {} (rating {})",
            review.service_id, review.rating
        );

        Ok(review)
    }

    /// Average rating for a contractor; 0.0 when no reviews (or no profile) exist
    pub async fn get_contractor_rating(&self, contractor: &str) -> f64 {
        self.state
            .read()
            .await
            .profiles
            .get(contractor)
            .map(|profile| profile.average_rating())
            .unwrap_or(0.0)
    }

    /// Get a contractor's profile
    pub async fn get_contractor_profile(
        &self,
        contractor: &str,
    ) -> EngineResult<ContractorProfile> {
        self.state
            .read()
            .await
            .profiles
            .get(contractor)
            .cloned()
            .ok_or_else(|| EngineError::not_found("contractor profile", contractor))
    }

    /// All reviews recorded for a service
    pub async fn get_service_reviews(&self, service_id: ServiceId) -> Vec<Review> {
        self.state
            .read()
            .await
            .reviews
            .iter()
            .filter(|review| review.service_id == service_id)
            .cloned()
            .collect()
    }

    /// Bump the job counter when a service is created against a registered
    /// contractor
    pub async fn record_job_started(&self, contractor: &str) {
        let mut state = self.state.write().await;
        if let Some(profile) = state.profiles.get_mut(contractor) {
            profile.total_jobs += 1;
            profile.updated_at = Utc::now();
        }
    }

    /// Bump the completion counter when a service settles through the full
    /// approval path
    pub async fn record_job_completed(&self, contractor: &str) {
        let mut state = self.state.write().await;
        if let Some(profile) = state.profiles.get_mut(contractor) {
            profile.completed_jobs += 1;
            profile.updated_at = Utc::now();
        }
    }

    /// Platform-operator surface: flip a profile's verification flag
    pub async fn set_verified(
        &self,
        contractor: &str,
        verified: bool,
    ) -> EngineResult<ContractorProfile> {
        let mut state = self.state.write().await;
        let profile = state
            .profiles
            .get_mut(contractor)
            .ok_or_else(|| EngineError::not_found("contractor profile", contractor))?;
        profile.is_verified = verified;
        profile.updated_at = Utc::now();
        Ok(profile.clone())
    }
}
