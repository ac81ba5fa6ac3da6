//! Validates the administrator-supplied sizing configuration.
//!
//! The size intervals must tile the non-negative integers with no gap and no
//! overlap, the non-request-serving node count must be set uniformly, and
//! every capacity fraction must be a usable ratio. The verdict lands on the
//! configuration's `Valid` condition; nothing else reads or writes it.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;

use models::sizing::{
    ClusterSizingSpec, REASON_AS_EXPECTED, REASON_CONFIGURATION_INVALID,
    SIZING_CONFIGURATION_NAME, VALID_CONDITION,
};
use models::{Condition, ConditionStatus};

use crate::controller::{Outcome, Reconciler};
use crate::store::{ResourceKind, Store, StoreError, StoreEvent};

#[derive(Debug, Error)]
pub enum ValidatorError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct ConfigurationValidator {
    store: Arc<Store>,
}

impl ConfigurationValidator {
    pub fn new(store: Arc<Store>) -> Self {
        ConfigurationValidator { store }
    }
}

/// All problems with a sizing spec, in declaration order. Empty means valid.
pub(crate) fn validate_spec(spec: &ClusterSizingSpec) -> Vec<String> {
    let mut errors = Vec::new();

    if spec.sizes.is_empty() {
        errors.push("at least one size class is required".to_string());
        return errors;
    }

    // The intervals tile [0, +inf) exactly when the multiset of nonzero
    // `from` values equals the multiset of `to + 1` values.
    let mut starts: Vec<u32> = spec
        .sizes
        .iter()
        .map(|s| s.criteria.from)
        .filter(|from| *from != 0)
        .collect();
    let mut follow_ups: Vec<u32> = spec
        .sizes
        .iter()
        .filter_map(|s| s.criteria.to)
        .map(|to| to + 1)
        .collect();
    starts.sort_unstable();
    follow_ups.sort_unstable();
    let zero_starts = spec.sizes.iter().filter(|s| s.criteria.from == 0).count();
    if starts != follow_ups || zero_starts != 1 {
        errors.push(
            "size intervals must cover all node counts exactly once, \
             e.g. {(0,10),(11,100),(101,+Inf)}"
                .to_string(),
        );
    }

    let with_nodes = spec
        .sizes
        .iter()
        .filter(|s| {
            s.management
                .as_ref()
                .and_then(|m| m.non_request_serving_nodes_per_zone)
                .is_some()
        })
        .count();
    if with_nodes != 0 && with_nodes != spec.sizes.len() {
        errors.push(
            "nonRequestServingNodesPerZone must be set on all size classes or on none"
                .to_string(),
        );
    }

    let mut check_fraction = |scope: String, value: Option<f64>| {
        if let Some(f) = value {
            if !(f > 0.0 && f <= 1.0) {
                errors.push(format!("fraction {} for {} must be in (0, 1]", f, scope));
            }
        }
    };
    check_fraction(
        "kubeAPIServerMemoryFraction".to_string(),
        spec.resource_based_autoscaling.kube_api_server_memory_fraction,
    );
    check_fraction(
        "kubeAPIServerCPUFraction".to_string(),
        spec.resource_based_autoscaling.kube_api_server_cpu_fraction,
    );
    for size in &spec.sizes {
        if let Some(capacity) = &size.capacity {
            check_fraction(
                format!("size {} memory", size.name),
                capacity.kube_api_server_memory_fraction,
            );
            check_fraction(
                format!("size {} cpu", size.name),
                capacity.kube_api_server_cpu_fraction,
            );
        }
    }

    errors
}

impl Reconciler for ConfigurationValidator {
    type Error = ValidatorError;

    fn name(&self) -> &'static str {
        "sizing-configuration-validator"
    }

    fn interest(&self, event: &StoreEvent) -> Vec<String> {
        match event.kind {
            ResourceKind::SizingConfiguration => vec![event.key.clone()],
            _ => Vec::new(),
        }
    }

    fn all_keys(&self) -> Vec<String> {
        vec![SIZING_CONFIGURATION_NAME.to_string()]
    }

    async fn reconcile(&self, _key: &str) -> Result<Outcome, Self::Error> {
        let Some(config) = self.store.sizing_configuration() else {
            return Ok(Outcome::done());
        };

        let errors = validate_spec(&config.spec);
        let condition = if errors.is_empty() {
            Condition::new(
                VALID_CONDITION,
                ConditionStatus::True,
                REASON_AS_EXPECTED,
                "size configuration is valid",
                Utc::now(),
            )
        } else {
            tracing::warn!(errors = errors.len(), "sizing configuration rejected");
            Condition::new(
                VALID_CONDITION,
                ConditionStatus::False,
                REASON_CONFIGURATION_INVALID,
                &errors.join("; "),
                Utc::now(),
            )
        };

        self.store.apply_valid_condition(condition)?;
        Ok(Outcome::done())
    }
}
