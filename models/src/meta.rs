use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Metadata carried by every resource in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    /// Bumped by the store whenever the spec changes.
    #[serde(default)]
    pub generation: i64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    pub fn new(namespace: &str, name: &str) -> Self {
        ObjectMeta {
            name: name.to_string(),
            namespace: namespace.to_string(),
            uid: Some(Uuid::new_v4().to_string()),
            generation: 1,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            creation_timestamp: Some(Utc::now()),
            deletion_timestamp: None,
        }
    }

    /// Store key: `namespace/name`, or just `name` for cluster-scoped resources.
    pub fn key(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.namespace, self.name)
        }
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// An observable condition on a resource's status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    pub last_transition_time: DateTime<Utc>,
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    pub fn new(
        type_: &str,
        status: ConditionStatus,
        reason: &str,
        message: &str,
        transition_time: DateTime<Utc>,
    ) -> Self {
        Condition {
            type_: type_.to_string(),
            status,
            last_transition_time: transition_time,
            reason: reason.to_string(),
            message: message.to_string(),
            observed_generation: None,
        }
    }

    /// Equality ignoring the transition timestamp and observed generation.
    /// Two conditions that match carry the same meaning for observers.
    pub fn matches(&self, other: &Condition) -> bool {
        self.type_ == other.type_
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
    }
}

pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Replaces the condition of the same type, or appends it.
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => *existing = condition,
        None => conditions.push(condition),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn condition(reason: &str) -> Condition {
        Condition::new("Ready", ConditionStatus::True, reason, "", Utc::now())
    }

    #[test]
    fn test_matches_ignores_transition_time() {
        let mut a = condition("AsExpected");
        let b = condition("AsExpected");
        a.last_transition_time = Utc::now() - chrono::Duration::minutes(5);
        assert!(a.matches(&b));
    }

    #[test]
    fn test_matches_detects_reason_change() {
        let a = condition("AsExpected");
        let b = condition("Degraded");
        assert!(!a.matches(&b));
    }

    #[test]
    fn test_set_condition_replaces_same_type() {
        let mut conditions = vec![condition("AsExpected")];
        set_condition(&mut conditions, condition("Degraded"));
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].reason, "Degraded");

        let mut other = Condition::new("Available", ConditionStatus::False, "Down", "", Utc::now());
        other.type_ = "Available".to_string();
        set_condition(&mut conditions, other);
        assert_eq!(conditions.len(), 2);
    }

    #[test]
    fn test_object_meta_key() {
        assert_eq!(ObjectMeta::new("clusters", "prod").key(), "clusters/prod");
        assert_eq!(ObjectMeta::new("", "cluster").key(), "cluster");
    }
}
