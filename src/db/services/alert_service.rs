use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicI32, Ordering};

use crate::db::models::{AlertRule, CreateAlertRuleRequest, UpdateAlertRuleRequest};
use crate::db::services::{AlertRuleRepository, AlertRuleSource, RepositoryError};

/// In-memory alert rule storage keyed by rule id.
#[derive(Debug, Default)]
pub struct InMemoryAlertRuleStore {
    rules: DashMap<i32, AlertRule>,
    last_id: AtomicI32,
}

impl InMemoryAlertRuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[async_trait]
impl AlertRuleSource for InMemoryAlertRuleStore {
    async fn find_rules_by_target_id(
        &self,
        target_id: &str,
    ) -> Result<Vec<AlertRule>, RepositoryError> {
        let mut rules: Vec<AlertRule> = self
            .rules
            .iter()
            .filter(|entry| entry.value().target_id == target_id)
            .map(|entry| entry.value().clone())
            .collect();
        rules.sort_by_key(|rule| rule.id);
        Ok(rules)
    }
}

#[async_trait]
impl AlertRuleRepository for InMemoryAlertRuleStore {
    async fn create(&self, request: CreateAlertRuleRequest) -> Result<AlertRule, RepositoryError> {
        let id = self.last_id.fetch_add(1, Ordering::Relaxed) + 1;
        let now = Utc::now();
        let rule = AlertRule {
            id,
            target_id: request.target_id,
            metric: request.metric,
            condition: request.condition,
            threshold: request.threshold,
            enabled: request.enabled.unwrap_or(true),
            created_at: now,
            updated_at: now,
        };
        self.rules.insert(id, rule.clone());
        Ok(rule)
    }

    async fn find_by_id(&self, id: i32) -> Result<Option<AlertRule>, RepositoryError> {
        Ok(self.rules.get(&id).map(|entry| entry.value().clone()))
    }

    async fn update(
        &self,
        id: i32,
        request: UpdateAlertRuleRequest,
    ) -> Result<AlertRule, RepositoryError> {
        let mut entry = self
            .rules
            .get_mut(&id)
            .ok_or(RepositoryError::RuleNotFound(id))?;
        let rule = entry.value_mut();
        if let Some(condition) = request.condition {
            rule.condition = condition;
        }
        if let Some(threshold) = request.threshold {
            rule.threshold = threshold;
        }
        if let Some(enabled) = request.enabled {
            rule.enabled = enabled;
        }
        rule.updated_at = Utc::now();
        Ok(rule.clone())
    }

    async fn toggle_enabled(&self, id: i32, enabled: bool) -> Result<AlertRule, RepositoryError> {
        let mut entry = self
            .rules
            .get_mut(&id)
            .ok_or(RepositoryError::RuleNotFound(id))?;
        let rule = entry.value_mut();
        rule.enabled = enabled;
        rule.updated_at = Utc::now();
        Ok(rule.clone())
    }

    async fn delete(&self, id: i32) -> Result<(), RepositoryError> {
        self.rules
            .remove(&id)
            .map(|_| ())
            .ok_or(RepositoryError::RuleNotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{Condition, MetricKind};

    fn request(target_id: &str, threshold: f64) -> CreateAlertRuleRequest {
        CreateAlertRuleRequest {
            target_id: target_id.to_string(),
            metric: MetricKind::Ping,
            condition: Condition::GreaterThan,
            threshold,
            enabled: None,
        }
    }

    #[tokio::test]
    async fn test_create_assigns_increasing_ids_and_defaults_enabled() {
        let store = InMemoryAlertRuleStore::new();
        let first = store.create(request("t1", 100.0)).await.unwrap();
        let second = store.create(request("t1", 200.0)).await.unwrap();
        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
        assert!(first.enabled);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_find_by_target_is_filtered_and_sorted() {
        let store = InMemoryAlertRuleStore::new();
        for threshold in [1.0, 2.0, 3.0] {
            store.create(request("t1", threshold)).await.unwrap();
        }
        store.create(request("t2", 4.0)).await.unwrap();

        let rules = store.find_rules_by_target_id("t1").await.unwrap();
        let ids: Vec<i32> = rules.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(store.find_rules_by_target_id("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_merges_fields_and_keeps_identity() {
        let store = InMemoryAlertRuleStore::new();
        let rule = store.create(request("t1", 100.0)).await.unwrap();
        let updated = store
            .update(
                rule.id,
                UpdateAlertRuleRequest {
                    threshold: Some(250.0),
                    condition: Some(Condition::LessThan),
                    enabled: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.threshold, 250.0);
        assert_eq!(updated.condition, Condition::LessThan);
        assert_eq!(updated.metric, MetricKind::Ping);
        assert_eq!(updated.target_id, "t1");
        assert!(updated.enabled);
    }

    #[tokio::test]
    async fn test_missing_rule_errors() {
        let store = InMemoryAlertRuleStore::new();
        assert!(matches!(
            store.toggle_enabled(9, false).await,
            Err(RepositoryError::RuleNotFound(9))
        ));
        assert!(matches!(
            store.delete(9).await,
            Err(RepositoryError::RuleNotFound(9))
        ));
    }
}
