use serde::{Deserialize, Serialize};

use crate::meta::{find_condition, Condition, ConditionStatus, ObjectMeta};

/// Size label written by the sizing controller; consumed downstream by the
/// request-serving scheduler.
pub const SIZE_LABEL: &str = "hypershift.openshift.io/cluster-size";

/// Pins a cluster to a named size class regardless of node count.
pub const SIZE_OVERRIDE_ANNOTATION: &str = "hypershift.openshift.io/cluster-size-override";

/// `"true"` once the cluster has been placed on request-serving capacity;
/// only scheduled clusters are subject to the fleet concurrency gate.
pub const SCHEDULED_ANNOTATION: &str = "hypershift.openshift.io/cluster-scheduled";

/// `"true"` opts a cluster into resource-based control-plane autoscaling.
pub const RESOURCE_BASED_AUTOSCALING_ANNOTATION: &str =
    "hypershift.openshift.io/resource-based-control-plane-autoscaling";

/// Recommended size class written back by the resource-based autoscaler.
pub const RECOMMENDED_SIZE_ANNOTATION: &str =
    "hypershift.openshift.io/recommended-cluster-size";

pub const TOPOLOGY_ANNOTATION: &str = "hypershift.openshift.io/topology";
pub const DEDICATED_REQUEST_SERVING_TOPOLOGY: &str = "DedicatedRequestServingComponents";

/// Image label that marks operator builds reporting node count through the
/// hosted control plane status.
pub const NODE_COUNT_REPORTED_IMAGE_LABEL: &str =
    "io.openshift.hypershift.hosted-cluster-config-operator-reports-node-count";

pub const CLUSTER_SIZE_COMPUTED: &str = "ClusterSizeComputed";
pub const CLUSTER_SIZE_TRANSITION_REQUIRED: &str = "ClusterSizeTransitionRequired";
pub const CLUSTER_SIZE_TRANSITION_PENDING: &str = "ClusterSizeTransitionPending";

/// The only condition types the sizing controller may write. Applies reassert
/// the full set so a single field owner keeps them alive together.
pub const MANAGED_SIZE_CONDITIONS: [&str; 3] = [
    CLUSTER_SIZE_COMPUTED,
    CLUSTER_SIZE_TRANSITION_REQUIRED,
    CLUSTER_SIZE_TRANSITION_PENDING,
];

/// Written by the hosted control plane reconciler; read-only here.
pub const KUBE_API_SERVER_AVAILABLE: &str = "KubeAPIServerAvailable";

pub const REASON_AS_EXPECTED: &str = "AsExpected";
pub const REASON_TRANSITION_DELAY_NOT_ELAPSED: &str = "TransitionDelayNotElapsed";
pub const REASON_CONCURRENCY_LIMIT_REACHED: &str = "ConcurrencyLimitReached";
pub const REASON_TRANSITIONED: &str = "ClusterSizeTransitioned";

/// A user-facing workload cluster whose control plane runs in the shared
/// management cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostedCluster {
    pub metadata: ObjectMeta,
    pub spec: HostedClusterSpec,
    #[serde(default)]
    pub status: HostedClusterStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct HostedClusterSpec {
    /// Image of the in-cluster config operator; its labels decide the node
    /// count source.
    pub release_image: String,
    /// Name of a dockerconfigjson secret in the cluster's namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_secret_ref: Option<String>,
    /// RFC3339 timestamp; reconciliation is suspended until it passes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_until: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct HostedClusterStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl HostedCluster {
    pub fn new(namespace: &str, name: &str) -> Self {
        HostedCluster {
            metadata: ObjectMeta::new(namespace, name),
            spec: HostedClusterSpec::default(),
            status: HostedClusterStatus::default(),
        }
    }

    pub fn key(&self) -> String {
        self.metadata.key()
    }

    /// Namespace holding this cluster's control plane resources.
    pub fn control_plane_namespace(&self) -> String {
        format!("{}-{}", self.metadata.namespace, self.metadata.name)
    }

    pub fn size_label(&self) -> Option<&str> {
        self.metadata.label(SIZE_LABEL)
    }

    pub fn size_override(&self) -> Option<&str> {
        self.metadata.annotation(SIZE_OVERRIDE_ANNOTATION)
    }

    pub fn is_scheduled(&self) -> bool {
        self.metadata.annotation(SCHEDULED_ANNOTATION) == Some("true")
    }

    pub fn autoscaling_requested(&self) -> bool {
        self.metadata.annotation(RESOURCE_BASED_AUTOSCALING_ANNOTATION) == Some("true")
    }

    pub fn topology(&self) -> Option<&str> {
        self.metadata.annotation(TOPOLOGY_ANNOTATION)
    }

    pub fn recommended_size(&self) -> Option<&str> {
        self.metadata.annotation(RECOMMENDED_SIZE_ANNOTATION)
    }

    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        find_condition(&self.status.conditions, type_)
    }

    /// The committed size transition, if any: the `ClusterSizeComputed=True`
    /// condition.
    pub fn computed_size(&self) -> Option<&Condition> {
        self.condition(CLUSTER_SIZE_COMPUTED)
            .filter(|c| c.status == ConditionStatus::True)
    }

    pub fn kube_api_server_available(&self) -> bool {
        matches!(
            self.condition(KUBE_API_SERVER_AVAILABLE),
            Some(c) if c.status == ConditionStatus::True
        )
    }
}

/// A set of worker nodes belonging to one hosted cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePool {
    pub metadata: ObjectMeta,
    pub spec: NodePoolSpec,
    #[serde(default)]
    pub status: NodePoolStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolSpec {
    /// Name of the owning hosted cluster, in the pool's own namespace.
    pub cluster_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_scaling: Option<NodePoolAutoScaling>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolAutoScaling {
    pub min: u32,
    pub max: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolStatus {
    #[serde(default)]
    pub replicas: u32,
}

impl NodePool {
    pub fn new(namespace: &str, name: &str, cluster_name: &str) -> Self {
        NodePool {
            metadata: ObjectMeta::new(namespace, name),
            spec: NodePoolSpec {
                cluster_name: cluster_name.to_string(),
                ..NodePoolSpec::default()
            },
            status: NodePoolStatus::default(),
        }
    }
}

/// The concrete control plane realizing a hosted cluster, living in the
/// cluster's control plane namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostedControlPlane {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub status: HostedControlPlaneStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct HostedControlPlaneStatus {
    /// Worker-node count reported from inside the cluster; only populated by
    /// operator builds carrying the node-count image label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_count: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_control_plane_namespace() {
        let cluster = HostedCluster::new("clusters", "prod-a");
        assert_eq!(cluster.control_plane_namespace(), "clusters-prod-a");
    }

    #[test]
    fn test_annotation_helpers() {
        let mut cluster = HostedCluster::new("clusters", "prod-a");
        assert!(!cluster.is_scheduled());
        cluster
            .metadata
            .annotations
            .insert(SCHEDULED_ANNOTATION.to_string(), "true".to_string());
        assert!(cluster.is_scheduled());
    }

    #[test]
    fn test_computed_size_requires_true_status() {
        let mut cluster = HostedCluster::new("clusters", "prod-a");
        cluster.status.conditions.push(Condition::new(
            CLUSTER_SIZE_COMPUTED,
            ConditionStatus::False,
            "Unknown",
            "",
            Utc::now(),
        ));
        assert!(cluster.computed_size().is_none());

        cluster.status.conditions[0].status = ConditionStatus::True;
        assert!(cluster.computed_size().is_some());
    }
}
