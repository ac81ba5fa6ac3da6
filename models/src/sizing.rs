use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::meta::{Condition, ObjectMeta};
use crate::quantity::Quantity;

/// Name of the cluster-singleton sizing configuration.
pub const SIZING_CONFIGURATION_NAME: &str = "cluster";

/// Condition type written by the configuration validator.
pub const VALID_CONDITION: &str = "Valid";

pub const REASON_AS_EXPECTED: &str = "AsExpected";
pub const REASON_CONFIGURATION_INVALID: &str = "SizeConfigurationInvalid";

/// The administrator-supplied size table plus fleet-wide transition policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSizingConfiguration {
    pub metadata: ObjectMeta,
    pub spec: ClusterSizingSpec,
    #[serde(default)]
    pub status: ClusterSizingStatus,
}

impl Default for ClusterSizingConfiguration {
    fn default() -> Self {
        ClusterSizingConfiguration {
            metadata: ObjectMeta::new("", SIZING_CONFIGURATION_NAME),
            spec: ClusterSizingSpec::default(),
            status: ClusterSizingStatus::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSizingSpec {
    /// Ordered size classes; their `[from, to]` intervals must tile `[0, +inf)`.
    pub sizes: Vec<SizeClass>,
    #[serde(default)]
    pub transition_delay: TransitionDelay,
    #[serde(default)]
    pub concurrency: ConcurrencyBounds,
    #[serde(default)]
    pub resource_based_autoscaling: ResourceBasedAutoscalingSpec,
}

impl ClusterSizingSpec {
    /// The unique class whose inclusive interval contains the node count.
    pub fn classify(&self, node_count: u32) -> Option<&SizeClass> {
        self.sizes.iter().find(|size| {
            node_count >= size.criteria.from
                && size.criteria.to.map_or(true, |to| node_count <= to)
        })
    }

    pub fn class(&self, name: &str) -> Option<&SizeClass> {
        self.sizes.iter().find(|size| size.name == name)
    }
}

impl Default for ClusterSizingSpec {
    fn default() -> Self {
        ClusterSizingSpec {
            sizes: vec![
                SizeClass::new("small", 0, Some(10)),
                SizeClass::new("medium", 11, Some(100)),
                SizeClass::new("large", 101, None),
            ],
            transition_delay: TransitionDelay::default(),
            concurrency: ConcurrencyBounds::default(),
            resource_based_autoscaling: ResourceBasedAutoscalingSpec::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SizeClass {
    pub name: String,
    pub criteria: SizeCriteria,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<SizeCapacity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub management: Option<SizeManagement>,
}

impl SizeClass {
    pub fn new(name: &str, from: u32, to: Option<u32>) -> Self {
        SizeClass {
            name: name.to_string(),
            criteria: SizeCriteria { from, to },
            capacity: None,
            management: None,
        }
    }
}

/// Inclusive worker-node count interval; `to` absent means unbounded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SizeCriteria {
    pub from: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<u32>,
}

/// Machine capacity of the request-serving nodes backing a size class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SizeCapacity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<Quantity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<Quantity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kube_api_server_memory_fraction: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kube_api_server_cpu_fraction: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SizeManagement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub non_request_serving_nodes_per_zone: Option<u32>,
}

/// Minimum wait between size changes for one hosted cluster, asymmetric by
/// direction so scale-down is damped harder than scale-up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionDelay {
    pub increase: Duration,
    pub decrease: Duration,
}

impl Default for TransitionDelay {
    fn default() -> Self {
        TransitionDelay {
            increase: Duration::from_secs(30),
            decrease: Duration::from_secs(10 * 60),
        }
    }
}

/// Fleet-wide cap on size transitions inside a sliding window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConcurrencyBounds {
    pub sliding_window: Duration,
    pub limit: u32,
}

impl Default for ConcurrencyBounds {
    fn default() -> Self {
        ConcurrencyBounds {
            sliding_window: Duration::from_secs(10 * 60),
            limit: 5,
        }
    }
}

/// Global fractions of machine capacity the API server may claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResourceBasedAutoscalingSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kube_api_server_memory_fraction: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kube_api_server_cpu_fraction: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSizingStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_default_table() {
        let spec = ClusterSizingSpec::default();
        assert_eq!(spec.classify(0).unwrap().name, "small");
        assert_eq!(spec.classify(10).unwrap().name, "small");
        assert_eq!(spec.classify(11).unwrap().name, "medium");
        assert_eq!(spec.classify(100).unwrap().name, "medium");
        assert_eq!(spec.classify(101).unwrap().name, "large");
        assert_eq!(spec.classify(30_000).unwrap().name, "large");
    }

    #[test]
    fn test_classify_with_gap() {
        let spec = ClusterSizingSpec {
            sizes: vec![
                SizeClass::new("small", 0, Some(10)),
                SizeClass::new("large", 20, None),
            ],
            ..ClusterSizingSpec::default()
        };
        assert!(spec.classify(15).is_none());
    }

    #[test]
    fn test_class_lookup() {
        let spec = ClusterSizingSpec::default();
        assert!(spec.class("medium").is_some());
        assert!(spec.class("xlarge").is_none());
    }

    #[test]
    fn test_defaults() {
        let spec = ClusterSizingSpec::default();
        assert_eq!(spec.transition_delay.increase, Duration::from_secs(30));
        assert_eq!(spec.transition_delay.decrease, Duration::from_secs(600));
        assert_eq!(spec.concurrency.limit, 5);
        assert_eq!(spec.concurrency.sliding_window, Duration::from_secs(600));
    }
}
