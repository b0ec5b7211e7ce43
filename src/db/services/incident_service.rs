use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicI32, Ordering};

use crate::db::models::{CreateIncidentRequest, Incident};
use crate::db::services::{IncidentRepository, RepositoryError};

/// In-memory incident storage keyed by incident id.
#[derive(Debug, Default)]
pub struct InMemoryIncidentStore {
    incidents: DashMap<i32, Incident>,
    last_id: AtomicI32,
}

impl InMemoryIncidentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn collect_sorted<F>(&self, predicate: F) -> Vec<Incident>
    where
        F: Fn(&Incident) -> bool,
    {
        let mut incidents: Vec<Incident> = self
            .incidents
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        incidents.sort_by_key(|incident| incident.id);
        incidents
    }
}

#[async_trait]
impl IncidentRepository for InMemoryIncidentStore {
    async fn create(&self, request: CreateIncidentRequest) -> Result<Incident, RepositoryError> {
        let id = self.last_id.fetch_add(1, Ordering::Relaxed) + 1;
        let incident = Incident {
            id,
            target_id: request.target_id,
            incident_type: request.incident_type,
            description: request.description,
            resolved: false,
            rule_id: request.rule_id,
            timestamp: Utc::now(),
            resolved_at: None,
        };
        self.incidents.insert(id, incident.clone());
        Ok(incident)
    }

    async fn find_by_id(&self, id: i32) -> Result<Option<Incident>, RepositoryError> {
        Ok(self.incidents.get(&id).map(|entry| entry.value().clone()))
    }

    async fn find_by_target_id(&self, target_id: &str) -> Result<Vec<Incident>, RepositoryError> {
        Ok(self.collect_sorted(|incident| incident.target_id == target_id))
    }

    async fn find_unresolved(&self) -> Result<Vec<Incident>, RepositoryError> {
        Ok(self.collect_sorted(|incident| !incident.resolved))
    }

    async fn resolve(&self, id: i32) -> Result<bool, RepositoryError> {
        let mut entry = self
            .incidents
            .get_mut(&id)
            .ok_or(RepositoryError::IncidentNotFound(id))?;
        let incident = entry.value_mut();
        if incident.resolved {
            return Ok(false);
        }
        incident.resolved = true;
        incident.resolved_at = Some(Utc::now());
        Ok(true)
    }
}
