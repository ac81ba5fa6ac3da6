use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::meta::{find_condition, Condition, ObjectMeta};
use crate::quantity::Quantity;

/// Name of the API server container, deployment, and the VPA tracking it.
pub const KUBE_API_SERVER: &str = "kube-apiserver";

/// Reverse-lookup annotations stamped on the VPA so its events map back to a
/// hosted cluster.
pub const VPA_CLUSTER_NAMESPACE_ANNOTATION: &str =
    "hypershift.openshift.io/hosted-cluster-namespace";
pub const VPA_CLUSTER_NAME_ANNOTATION: &str = "hypershift.openshift.io/hosted-cluster-name";

pub const RECOMMENDATION_PROVIDED_CONDITION: &str = "RecommendationProvided";

pub const RESOURCE_MEMORY: &str = "memory";
pub const RESOURCE_CPU: &str = "cpu";

/// Machine-set label grouping request-serving machines by size class.
pub const CLUSTER_SIZE_MACHINE_LABEL: &str = "cluster-size";

/// Machine-set annotations describing instance capacity.
pub const MACHINE_MEMORY_MB_ANNOTATION: &str = "machine.openshift.io/memoryMb";
pub const MACHINE_VCPU_ANNOTATION: &str = "machine.openshift.io/vCPU";

/// A vertical pod autoscaler resource; this control plane only ever creates
/// recommendation-only instances (`updateMode: Off`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerticalPodAutoscaler {
    pub metadata: ObjectMeta,
    pub spec: VpaSpec,
    #[serde(default)]
    pub status: VpaStatus,
}

impl VerticalPodAutoscaler {
    pub fn key(&self) -> String {
        self.metadata.key()
    }

    /// The hosted cluster this VPA reports for, from the reverse annotations.
    pub fn hosted_cluster_key(&self) -> Option<String> {
        let namespace = self.metadata.annotation(VPA_CLUSTER_NAMESPACE_ANNOTATION)?;
        let name = self.metadata.annotation(VPA_CLUSTER_NAME_ANNOTATION)?;
        Some(format!("{}/{}", namespace, name))
    }

    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        find_condition(&self.status.conditions, type_)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct VpaSpec {
    pub target_ref: CrossVersionObjectReference,
    pub update_policy: VpaUpdatePolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CrossVersionObjectReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct VpaUpdatePolicy {
    pub update_mode: VpaUpdateMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum VpaUpdateMode {
    #[default]
    Off,
    Initial,
    Recreation,
    Auto,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct VpaStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<VpaRecommendation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct VpaRecommendation {
    #[serde(default)]
    pub container_recommendations: Vec<VpaContainerRecommendation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct VpaContainerRecommendation {
    pub container_name: String,
    /// Recommendation after applying resource policy caps.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub target: BTreeMap<String, Quantity>,
    /// Recommendation unconstrained by caps; the sizing input.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub uncapped_target: BTreeMap<String, Quantity>,
}

impl VpaRecommendation {
    pub fn container(&self, name: &str) -> Option<&VpaContainerRecommendation> {
        self.container_recommendations
            .iter()
            .find(|c| c.container_name == name)
    }
}

/// A machine set in the management cluster; capacity is introspected from its
/// annotations when the sizing configuration omits explicit capacities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineSet {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: MachineSetSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MachineSetSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<u32>,
}

impl MachineSet {
    pub fn size_class(&self) -> Option<&str> {
        self.metadata.label(CLUSTER_SIZE_MACHINE_LABEL)
    }

    pub fn memory_mb(&self) -> Option<u64> {
        self.metadata
            .annotation(MACHINE_MEMORY_MB_ANNOTATION)
            .and_then(|v| v.parse().ok())
    }

    pub fn vcpus(&self) -> Option<u64> {
        self.metadata
            .annotation(MACHINE_VCPU_ANNOTATION)
            .and_then(|v| v.parse().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hosted_cluster_key_from_annotations() {
        let mut vpa = VerticalPodAutoscaler {
            metadata: ObjectMeta::new("clusters-prod-a", KUBE_API_SERVER),
            spec: VpaSpec::default(),
            status: VpaStatus::default(),
        };
        assert!(vpa.hosted_cluster_key().is_none());

        vpa.metadata.annotations.insert(
            VPA_CLUSTER_NAMESPACE_ANNOTATION.to_string(),
            "clusters".to_string(),
        );
        vpa.metadata
            .annotations
            .insert(VPA_CLUSTER_NAME_ANNOTATION.to_string(), "prod-a".to_string());
        assert_eq!(vpa.hosted_cluster_key().as_deref(), Some("clusters/prod-a"));
    }

    #[test]
    fn test_machine_set_capacity_annotations() {
        let mut machine_set = MachineSet {
            metadata: ObjectMeta::new("openshift-machine-api", "serving-1"),
            spec: MachineSetSpec::default(),
        };
        machine_set
            .metadata
            .labels
            .insert(CLUSTER_SIZE_MACHINE_LABEL.to_string(), "small".to_string());
        machine_set.metadata.annotations.insert(
            MACHINE_MEMORY_MB_ANNOTATION.to_string(),
            "16384".to_string(),
        );
        machine_set
            .metadata
            .annotations
            .insert(MACHINE_VCPU_ANNOTATION.to_string(), "4".to_string());

        assert_eq!(machine_set.size_class(), Some("small"));
        assert_eq!(machine_set.memory_mb(), Some(16384));
        assert_eq!(machine_set.vcpus(), Some(4));
    }
}
