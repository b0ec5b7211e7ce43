//! Storage boundaries for alert rules and incidents.
//!
//! The scheduler and evaluator only see these traits. The bundled
//! implementations keep everything in memory.
use async_trait::async_trait;
use thiserror::Error;

use crate::db::models::{
    AlertRule, CreateAlertRuleRequest, CreateIncidentRequest, Incident, UpdateAlertRuleRequest,
};

pub mod alert_service;
pub mod incident_service;

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("Alert rule not found: {0}")]
    RuleNotFound(i32),
    #[error("Incident not found: {0}")]
    IncidentNotFound(i32),
    #[error("Storage error: {0}")]
    Storage(String),
}

/// Read-only view of alert rules, as needed by the evaluator.
#[async_trait]
pub trait AlertRuleSource: Send + Sync {
    async fn find_rules_by_target_id(
        &self,
        target_id: &str,
    ) -> Result<Vec<AlertRule>, RepositoryError>;
}

#[async_trait]
pub trait AlertRuleRepository: AlertRuleSource {
    async fn create(&self, request: CreateAlertRuleRequest) -> Result<AlertRule, RepositoryError>;

    async fn find_by_id(&self, id: i32) -> Result<Option<AlertRule>, RepositoryError>;

    async fn update(
        &self,
        id: i32,
        request: UpdateAlertRuleRequest,
    ) -> Result<AlertRule, RepositoryError>;

    async fn toggle_enabled(&self, id: i32, enabled: bool) -> Result<AlertRule, RepositoryError>;

    async fn delete(&self, id: i32) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait IncidentRepository: Send + Sync {
    async fn create(&self, request: CreateIncidentRequest) -> Result<Incident, RepositoryError>;

    async fn find_by_id(&self, id: i32) -> Result<Option<Incident>, RepositoryError>;

    async fn find_by_target_id(&self, target_id: &str) -> Result<Vec<Incident>, RepositoryError>;

    async fn find_unresolved(&self) -> Result<Vec<Incident>, RepositoryError>;

    /// Marks the incident resolved. Returns `true` when this call changed it,
    /// `false` when it was already resolved.
    async fn resolve(&self, id: i32) -> Result<bool, RepositoryError>;
}
