//! Assigns each hosted cluster a size class from its worker-node count and
//! gates transitions between classes.
//!
//! A transition commits in two phases because the status subresource and the
//! metadata label cannot be mutated in one write: the conditions commit
//! first, then the next reconcile catches the label up. Two gates damp churn
//! on the shared request-serving pool: a per-cluster delay (asymmetric for
//! increase vs. decrease) and a fleet-wide sliding-window cap on transitions.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use models::cluster::{
    HostedCluster, NodePool, CLUSTER_SIZE_COMPUTED, CLUSTER_SIZE_TRANSITION_PENDING,
    CLUSTER_SIZE_TRANSITION_REQUIRED, DEDICATED_REQUEST_SERVING_TOPOLOGY,
    MANAGED_SIZE_CONDITIONS, NODE_COUNT_REPORTED_IMAGE_LABEL, REASON_AS_EXPECTED,
    REASON_CONCURRENCY_LIMIT_REACHED, REASON_TRANSITIONED,
    REASON_TRANSITION_DELAY_NOT_ELAPSED,
};
use models::meta::find_condition;
use models::sizing::{ClusterSizingConfiguration, VALID_CONDITION};
use models::{Condition, ConditionStatus};

use crate::controller::{Outcome, Reconciler};
use crate::registry::{ImageMetadataProvider, RegistryError};
use crate::store::{ResourceKind, Store, StoreError, StoreEvent};

#[derive(Debug, Error)]
pub enum SizingError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

pub struct SizingController<P> {
    store: Arc<Store>,
    images: P,
}

/// The usable worker-node count, or a signal that the available inputs cannot
/// be trusted and the current size should stand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeCountOutcome {
    Count(u32),
    Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransitionDirection {
    Increase,
    Decrease,
}

impl std::fmt::Display for TransitionDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransitionDirection::Increase => f.write_str("increase"),
            TransitionDirection::Decrease => f.write_str("decrease"),
        }
    }
}

#[derive(Debug)]
pub(crate) struct StatusApply {
    pub conditions: Vec<Condition>,
    /// False when every condition matched the observed status; the write is
    /// suppressed but a requeue may still be wanted.
    pub changed: bool,
    pub requeue_after: Option<Duration>,
}

#[derive(Debug)]
pub(crate) enum Plan {
    None,
    Apply(StatusApply),
}

/// Renders a duration the way operators read them: "30s", "10m0s", "1h2m3s".
pub(crate) fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    if hours > 0 {
        format!("{}h{}m{}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m{}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PauseState {
    NotPaused,
    PausedUntil(Duration),
    Malformed,
}

pub(crate) fn pause_state(cluster: &HostedCluster, now: DateTime<Utc>) -> PauseState {
    let Some(raw) = &cluster.spec.paused_until else {
        return PauseState::NotPaused;
    };
    match DateTime::parse_from_rfc3339(raw) {
        Ok(until) => {
            let until = until.with_timezone(&Utc);
            if until > now {
                PauseState::PausedUntil((until - now).to_std().unwrap_or_default())
            } else {
                PauseState::NotPaused
            }
        }
        Err(_) => PauseState::Malformed,
    }
}

/// Second phase of a prior commit: the label value the committed condition
/// promises but the metadata does not yet carry.
pub(crate) fn pending_label_write(cluster: &HostedCluster) -> Option<String> {
    let previous = cluster.computed_size()?;
    if cluster.size_label() != Some(previous.reason.as_str()) {
        Some(previous.reason.clone())
    } else {
        None
    }
}

/// Node count when the operator image reports it through the hosted control
/// plane. An absent or zero report on a cluster that already has a size is
/// not trusted to shrink it.
pub(crate) fn node_count_from_control_plane(
    cluster: &HostedCluster,
    reported: Option<u32>,
) -> NodeCountOutcome {
    match reported {
        Some(count) if count > 0 => NodeCountOutcome::Count(count),
        _ if cluster.size_label().is_some() => NodeCountOutcome::Ignore,
        _ => NodeCountOutcome::Count(0),
    }
}

/// Node count summed over node pools: autoscaled pools contribute their
/// observed replicas, fixed pools their desired replicas. Observed replicas
/// of autoscaled pools are stale without a live API server, so a cluster
/// that already has a size keeps it rather than trust them.
pub(crate) fn node_count_from_pools(
    cluster: &HostedCluster,
    pools: &[NodePool],
) -> NodeCountOutcome {
    let any_autoscaling = pools.iter().any(|p| p.spec.auto_scaling.is_some());
    if any_autoscaling && !cluster.kube_api_server_available() && cluster.size_label().is_some() {
        return NodeCountOutcome::Ignore;
    }
    let total = pools
        .iter()
        .map(|p| {
            if p.spec.auto_scaling.is_some() {
                p.status.replicas
            } else {
                p.spec.replicas.unwrap_or(0)
            }
        })
        .sum();
    NodeCountOutcome::Count(total)
}

fn computed_condition(target: &str, now: DateTime<Utc>) -> Condition {
    Condition::new(
        CLUSTER_SIZE_COMPUTED,
        ConditionStatus::True,
        target,
        &format!("The cluster size is {}", target),
        now,
    )
}

fn required_condition(target: &str, now: DateTime<Utc>) -> Condition {
    Condition::new(
        CLUSTER_SIZE_TRANSITION_REQUIRED,
        ConditionStatus::True,
        target,
        &format!("A transition to size {} is required", target),
        now,
    )
}

fn required_cleared(now: DateTime<Utc>) -> Condition {
    Condition::new(
        CLUSTER_SIZE_TRANSITION_REQUIRED,
        ConditionStatus::False,
        REASON_AS_EXPECTED,
        "The cluster size is as expected",
        now,
    )
}

fn pending_cleared(now: DateTime<Utc>) -> Condition {
    Condition::new(
        CLUSTER_SIZE_TRANSITION_PENDING,
        ConditionStatus::False,
        REASON_TRANSITIONED,
        "The cluster size has transitioned",
        now,
    )
}

/// Builds the full managed-condition apply. Conditions matching the observed
/// status are carried over verbatim so their transition time survives; any
/// managed type this apply did not decide is reasserted from the observed
/// status so a single field owner keeps the whole set alive.
fn finish_apply(
    cluster: &HostedCluster,
    desired: Vec<Condition>,
    requeue_after: Option<Duration>,
) -> Plan {
    let mut conditions = Vec::with_capacity(MANAGED_SIZE_CONDITIONS.len());
    let mut changed = false;
    for condition in desired {
        match cluster.condition(&condition.type_) {
            Some(existing) if existing.matches(&condition) => conditions.push(existing.clone()),
            _ => {
                changed = true;
                conditions.push(condition);
            }
        }
    }
    for type_ in MANAGED_SIZE_CONDITIONS {
        if !conditions.iter().any(|c| c.type_ == type_) {
            if let Some(existing) = cluster.condition(type_) {
                conditions.push(existing.clone());
            }
        }
    }
    if !changed && requeue_after.is_none() {
        return Plan::None;
    }
    Plan::Apply(StatusApply {
        conditions,
        changed,
        requeue_after,
    })
}

/// Decides the next write for a hosted cluster given its target inputs. This
/// covers everything after the cheap gates: target selection, the per-cluster
/// delay, the fleet concurrency cap, and the commit itself.
pub(crate) fn plan_transition(
    config: &ClusterSizingConfiguration,
    cluster: &HostedCluster,
    fleet: &[HostedCluster],
    node_count: NodeCountOutcome,
    now: DateTime<Utc>,
) -> Plan {
    let spec = &config.spec;

    // Target priority: explicit override, then the autoscaler recommendation
    // for opted-in clusters, then the worker-node count.
    let recommended = (cluster.autoscaling_requested()
        && cluster.topology() == Some(DEDICATED_REQUEST_SERVING_TOPOLOGY))
    .then(|| cluster.recommended_size().and_then(|name| spec.class(name)))
    .flatten();
    let target = match cluster
        .size_override()
        .and_then(|name| spec.class(name))
        .or(recommended)
    {
        Some(class) => class,
        None => {
            let count = match node_count {
                NodeCountOutcome::Ignore => return Plan::None,
                NodeCountOutcome::Count(count) => count,
            };
            match spec.classify(count) {
                Some(class) => class,
                None => {
                    tracing::warn!(
                        cluster = %cluster.key(),
                        node_count = count,
                        "no size class matches node count"
                    );
                    return Plan::None;
                }
            }
        }
    };

    let label = cluster.size_label();
    let previous = cluster.computed_size();

    // Already at the target: clear the transient conditions and keep the
    // committed transition time untouched.
    if label == Some(target.name.as_str()) {
        let computed = previous
            .cloned()
            .unwrap_or_else(|| computed_condition(&target.name, now));
        return finish_apply(
            cluster,
            vec![computed, required_cleared(now), pending_cleared(now)],
            None,
        );
    }

    // Per-cluster delay gate. Direction comes from the interval starts of the
    // current and target classes. The clock starts at the later of the last
    // committed transition and the moment this target was first announced.
    if let (Some(previous), Some(current)) = (previous, label.and_then(|l| spec.class(l))) {
        let direction = if target.criteria.from > current.criteria.from {
            TransitionDirection::Increase
        } else {
            TransitionDirection::Decrease
        };
        let delay = match direction {
            TransitionDirection::Increase => spec.transition_delay.increase,
            TransitionDirection::Decrease => spec.transition_delay.decrease,
        };
        let announced = cluster
            .condition(CLUSTER_SIZE_TRANSITION_REQUIRED)
            .filter(|c| c.status == ConditionStatus::True && c.reason == target.name)
            .map(|c| c.last_transition_time);
        let delay_start = announced
            .map_or(previous.last_transition_time, |t| {
                t.max(previous.last_transition_time)
            });
        let delay_span =
            chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::max_value());
        let elapsed = now.signed_duration_since(delay_start);
        if elapsed < delay_span {
            let remaining = (delay_span - elapsed).to_std().unwrap_or_default();
            let pending = Condition::new(
                CLUSTER_SIZE_TRANSITION_PENDING,
                ConditionStatus::True,
                REASON_TRANSITION_DELAY_NOT_ELAPSED,
                &format!(
                    "The {} transition delay of {} has not elapsed",
                    direction,
                    format_duration(delay)
                ),
                now,
            );
            return finish_apply(
                cluster,
                vec![pending, required_condition(&target.name, now)],
                Some(remaining),
            );
        }
    }

    // Fleet-wide concurrency gate; only clusters already placed on
    // request-serving capacity are held back, a brand-new cluster's first
    // size is on the creation path.
    if cluster.is_scheduled() {
        let window = chrono::Duration::from_std(spec.concurrency.sliding_window)
            .unwrap_or_else(|_| chrono::Duration::max_value());
        let mut recent: Vec<DateTime<Utc>> = fleet
            .iter()
            .filter_map(|c| c.computed_size())
            .map(|c| c.last_transition_time)
            .filter(|t| *t > now - window && *t <= now)
            .collect();
        if recent.len() as u32 >= spec.concurrency.limit {
            recent.sort();
            let oldest = recent[0];
            let requeue = ((oldest + window) - now).to_std().unwrap_or_default();
            let pending = Condition::new(
                CLUSTER_SIZE_TRANSITION_PENDING,
                ConditionStatus::True,
                REASON_CONCURRENCY_LIMIT_REACHED,
                &format!(
                    "{} size transitions occurred in the last {}; the limit is {}",
                    recent.len(),
                    format_duration(spec.concurrency.sliding_window),
                    spec.concurrency.limit
                ),
                now,
            );
            return finish_apply(
                cluster,
                vec![pending, required_condition(&target.name, now)],
                Some(requeue),
            );
        }
    }

    // Commit, phase one. The label write happens on the next reconcile once
    // this condition is observed.
    finish_apply(
        cluster,
        vec![
            computed_condition(&target.name, now),
            required_cleared(now),
            pending_cleared(now),
        ],
        None,
    )
}

impl<P: ImageMetadataProvider> SizingController<P> {
    pub fn new(store: Arc<Store>, images: P) -> Self {
        SizingController { store, images }
    }

    async fn node_count(&self, cluster: &HostedCluster) -> Result<NodeCountOutcome, SizingError> {
        let pull_secret = cluster.spec.pull_secret_ref.as_ref().and_then(|name| {
            self.store
                .secret(&format!("{}/{}", cluster.metadata.namespace, name))
        });
        let labels = self
            .images
            .image_labels(&cluster.spec.release_image, pull_secret.as_ref())
            .await?;
        let reports = labels
            .get(NODE_COUNT_REPORTED_IMAGE_LABEL)
            .map(|v| v == "true")
            .unwrap_or(false);

        if reports {
            let hcp_key = format!(
                "{}/{}",
                cluster.control_plane_namespace(),
                cluster.metadata.name
            );
            let reported = self
                .store
                .hosted_control_plane(&hcp_key)
                .and_then(|hcp| hcp.status.node_count);
            Ok(node_count_from_control_plane(cluster, reported))
        } else {
            let pools = self.store.node_pools_for(&cluster.key());
            Ok(node_count_from_pools(cluster, &pools))
        }
    }
}

impl<P: ImageMetadataProvider> Reconciler for SizingController<P> {
    type Error = SizingError;

    fn name(&self) -> &'static str {
        "cluster-sizing"
    }

    fn interest(&self, event: &StoreEvent) -> Vec<String> {
        match event.kind {
            ResourceKind::HostedCluster => vec![event.key.clone()],
            // Any configuration change can re-class the whole fleet.
            ResourceKind::SizingConfiguration => self.store.hosted_cluster_keys(),
            ResourceKind::NodePool => self
                .store
                .node_pool(&event.key)
                .map(|pool| {
                    vec![format!(
                        "{}/{}",
                        pool.metadata.namespace, pool.spec.cluster_name
                    )]
                })
                .unwrap_or_default(),
            ResourceKind::HostedControlPlane => self
                .store
                .cluster_for_control_plane(&event.key)
                .map(|key| vec![key])
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    fn all_keys(&self) -> Vec<String> {
        self.store.hosted_cluster_keys()
    }

    async fn reconcile(&self, key: &str) -> Result<Outcome, Self::Error> {
        let Some(config) = self.store.sizing_configuration() else {
            return Ok(Outcome::done());
        };
        let valid = find_condition(&config.status.conditions, VALID_CONDITION)
            .map(|c| c.status == ConditionStatus::True)
            .unwrap_or(false);
        if !valid {
            return Ok(Outcome::done());
        }

        let Some(cluster) = self.store.hosted_cluster(key) else {
            return Ok(Outcome::done());
        };
        if cluster.metadata.deletion_timestamp.is_some() {
            return Ok(Outcome::done());
        }

        let now = Utc::now();
        match pause_state(&cluster, now) {
            PauseState::NotPaused => {}
            PauseState::PausedUntil(wait) => return Ok(Outcome::requeue_after(wait)),
            PauseState::Malformed => {
                tracing::warn!(
                    cluster = %key,
                    paused_until = ?cluster.spec.paused_until,
                    "ignoring unparseable pausedUntil"
                );
                return Ok(Outcome::done());
            }
        }

        if let Some(label) = pending_label_write(&cluster) {
            tracing::info!(cluster = %key, size = %label, "writing size label");
            self.store.patch_size_label(key, &label)?;
            return Ok(Outcome::done());
        }

        let node_count = self.node_count(&cluster).await?;
        let fleet = self.store.list_hosted_clusters();
        match plan_transition(&config, &cluster, &fleet, node_count, now) {
            Plan::None => Ok(Outcome::done()),
            Plan::Apply(apply) => {
                if apply.changed {
                    self.store.apply_size_conditions(key, apply.conditions)?;
                }
                Ok(Outcome {
                    requeue_after: apply.requeue_after,
                })
            }
        }
    }
}
