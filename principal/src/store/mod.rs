//! In-process declarative resource store.
//!
//! The controllers never talk to each other; they communicate exclusively
//! through fields on the resources held here. Every mutation emits a
//! [`StoreEvent`] on a broadcast channel, which is the watch source driving
//! the reconcile runners. Writes that would not change the stored resource
//! are suppressed and emit nothing, so a settled fleet stays quiet.

use std::collections::HashMap;
use std::sync::Mutex;

use thiserror::Error;
use tokio::sync::broadcast;

use models::cluster::{HostedCluster, HostedControlPlane, NodePool, MANAGED_SIZE_CONDITIONS, SIZE_LABEL};
use models::meta::set_condition;
use models::autoscaling::{MachineSet, VerticalPodAutoscaler};
use models::secret::Secret;
use models::sizing::ClusterSizingConfiguration;
use models::Condition;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    SizingConfiguration,
    HostedCluster,
    NodePool,
    HostedControlPlane,
    VerticalPodAutoscaler,
    MachineSet,
    Secret,
}

#[derive(Debug, Clone)]
pub struct StoreEvent {
    pub kind: ResourceKind,
    pub key: String,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("resource not found: {0}")]
    NotFound(String),
    /// Writing a condition type outside the managed set is a programming
    /// error, not a runtime state; the reconcile is aborted.
    #[error("condition type {0} is outside the managed set")]
    UnmanagedCondition(String),
}

#[derive(Default)]
struct Collections {
    sizing_configuration: Option<ClusterSizingConfiguration>,
    hosted_clusters: HashMap<String, HostedCluster>,
    node_pools: HashMap<String, NodePool>,
    hosted_control_planes: HashMap<String, HostedControlPlane>,
    vpas: HashMap<String, VerticalPodAutoscaler>,
    machine_sets: HashMap<String, MachineSet>,
    secrets: HashMap<String, Secret>,
}

pub struct Store {
    inner: Mutex<Collections>,
    events: broadcast::Sender<StoreEvent>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Store {
            inner: Mutex::new(Collections::default()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn emit(&self, kind: ResourceKind, key: &str) {
        let _ = self.events.send(StoreEvent {
            kind,
            key: key.to_string(),
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Collections> {
        // A poisoned lock means a writer panicked mid-update; the data is
        // plain resource clones, so continuing is safe.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    // --- sizing configuration ---

    pub fn sizing_configuration(&self) -> Option<ClusterSizingConfiguration> {
        self.lock().sizing_configuration.clone()
    }

    /// Replaces the configuration spec, bumping the generation when it differs.
    pub fn put_sizing_configuration(&self, mut config: ClusterSizingConfiguration) {
        let key = config.metadata.key();
        {
            let mut inner = self.lock();
            if let Some(existing) = &inner.sizing_configuration {
                if existing.spec == config.spec {
                    return;
                }
                config.metadata.generation = existing.metadata.generation + 1;
                config.status = existing.status.clone();
            }
            inner.sizing_configuration = Some(config);
        }
        self.emit(ResourceKind::SizingConfiguration, &key);
    }

    /// The validator's single write path: sets the `Valid` condition.
    pub fn apply_valid_condition(&self, condition: Condition) -> Result<(), StoreError> {
        let key;
        {
            let mut inner = self.lock();
            let config = inner
                .sizing_configuration
                .as_mut()
                .ok_or_else(|| StoreError::NotFound("sizing configuration".to_string()))?;
            key = config.metadata.key();
            if let Some(existing) = config
                .status
                .conditions
                .iter()
                .find(|c| c.type_ == condition.type_)
            {
                if existing.matches(&condition) {
                    return Ok(());
                }
            }
            set_condition(&mut config.status.conditions, condition);
        }
        self.emit(ResourceKind::SizingConfiguration, &key);
        Ok(())
    }

    // --- hosted clusters ---

    pub fn hosted_cluster(&self, key: &str) -> Option<HostedCluster> {
        self.lock().hosted_clusters.get(key).cloned()
    }

    pub fn list_hosted_clusters(&self) -> Vec<HostedCluster> {
        self.lock().hosted_clusters.values().cloned().collect()
    }

    pub fn hosted_cluster_keys(&self) -> Vec<String> {
        self.lock().hosted_clusters.keys().cloned().collect()
    }

    pub fn upsert_hosted_cluster(&self, mut cluster: HostedCluster) {
        let key = cluster.key();
        {
            let mut inner = self.lock();
            if let Some(existing) = inner.hosted_clusters.get(&key) {
                if *existing == cluster {
                    return;
                }
                if existing.spec != cluster.spec {
                    cluster.metadata.generation = existing.metadata.generation + 1;
                }
            }
            inner.hosted_clusters.insert(key.clone(), cluster);
        }
        self.emit(ResourceKind::HostedCluster, &key);
    }

    /// Second phase of the size commit: the label write, kept separate from
    /// status applies because the two cannot be mutated atomically.
    pub fn patch_size_label(&self, key: &str, value: &str) -> Result<(), StoreError> {
        {
            let mut inner = self.lock();
            let cluster = inner
                .hosted_clusters
                .get_mut(key)
                .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
            if cluster.metadata.label(SIZE_LABEL) == Some(value) {
                return Ok(());
            }
            cluster
                .metadata
                .labels
                .insert(SIZE_LABEL.to_string(), value.to_string());
        }
        self.emit(ResourceKind::HostedCluster, key);
        Ok(())
    }

    pub fn patch_annotation(&self, key: &str, name: &str, value: &str) -> Result<(), StoreError> {
        {
            let mut inner = self.lock();
            let cluster = inner
                .hosted_clusters
                .get_mut(key)
                .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
            if cluster.metadata.annotation(name) == Some(value) {
                return Ok(());
            }
            cluster
                .metadata
                .annotations
                .insert(name.to_string(), value.to_string());
        }
        self.emit(ResourceKind::HostedCluster, key);
        Ok(())
    }

    /// Applies the managed sizing conditions as one field owner: the given set
    /// replaces exactly the managed types, every other condition type is left
    /// untouched. Rejects condition types outside the managed set.
    pub fn apply_size_conditions(
        &self,
        key: &str,
        conditions: Vec<Condition>,
    ) -> Result<(), StoreError> {
        for condition in &conditions {
            if !MANAGED_SIZE_CONDITIONS.contains(&condition.type_.as_str()) {
                return Err(StoreError::UnmanagedCondition(condition.type_.clone()));
            }
        }
        {
            let mut inner = self.lock();
            let cluster = inner
                .hosted_clusters
                .get_mut(key)
                .ok_or_else(|| StoreError::NotFound(key.to_string()))?;

            let unchanged = conditions.iter().all(|c| {
                cluster
                    .status
                    .conditions
                    .iter()
                    .any(|existing| existing == c)
            }) && MANAGED_SIZE_CONDITIONS.iter().all(|t| {
                conditions.iter().any(|c| c.type_ == *t)
                    || !cluster.status.conditions.iter().any(|c| c.type_ == *t)
            });
            if unchanged {
                return Ok(());
            }

            cluster.status.conditions.retain(|c| {
                !MANAGED_SIZE_CONDITIONS.contains(&c.type_.as_str())
            });
            cluster.status.conditions.extend(conditions);
        }
        self.emit(ResourceKind::HostedCluster, key);
        Ok(())
    }

    // --- node pools ---

    pub fn node_pool(&self, key: &str) -> Option<NodePool> {
        self.lock().node_pools.get(key).cloned()
    }

    pub fn upsert_node_pool(&self, pool: NodePool) {
        let key = pool.metadata.key();
        {
            let mut inner = self.lock();
            if inner.node_pools.get(&key) == Some(&pool) {
                return;
            }
            inner.node_pools.insert(key.clone(), pool);
        }
        self.emit(ResourceKind::NodePool, &key);
    }

    /// Pools belonging to a hosted cluster: same namespace, matching
    /// `spec.clusterName`.
    pub fn node_pools_for(&self, cluster_key: &str) -> Vec<NodePool> {
        let (namespace, name) = match cluster_key.split_once('/') {
            Some(parts) => parts,
            None => return Vec::new(),
        };
        self.lock()
            .node_pools
            .values()
            .filter(|p| p.metadata.namespace == namespace && p.spec.cluster_name == name)
            .cloned()
            .collect()
    }

    // --- hosted control planes ---

    pub fn hosted_control_plane(&self, key: &str) -> Option<HostedControlPlane> {
        self.lock().hosted_control_planes.get(key).cloned()
    }

    pub fn upsert_hosted_control_plane(&self, hcp: HostedControlPlane) {
        let key = hcp.metadata.key();
        {
            let mut inner = self.lock();
            if inner.hosted_control_planes.get(&key) == Some(&hcp) {
                return;
            }
            inner.hosted_control_planes.insert(key.clone(), hcp);
        }
        self.emit(ResourceKind::HostedControlPlane, &key);
    }

    /// Reverse lookup: the hosted cluster whose control plane namespace holds
    /// this control plane.
    pub fn cluster_for_control_plane(&self, hcp_key: &str) -> Option<String> {
        let inner = self.lock();
        let hcp = inner.hosted_control_planes.get(hcp_key)?;
        inner
            .hosted_clusters
            .values()
            .find(|c| {
                c.control_plane_namespace() == hcp.metadata.namespace
                    && c.metadata.name == hcp.metadata.name
            })
            .map(|c| c.key())
    }

    // --- vertical pod autoscalers ---

    pub fn vpa(&self, key: &str) -> Option<VerticalPodAutoscaler> {
        self.lock().vpas.get(key).cloned()
    }

    /// Creates or updates the VPA, preserving any status reported by the
    /// recommender. No event when spec and annotations already match.
    pub fn ensure_vpa(&self, mut vpa: VerticalPodAutoscaler) {
        let key = vpa.key();
        {
            let mut inner = self.lock();
            if let Some(existing) = inner.vpas.get(&key) {
                if existing.spec == vpa.spec
                    && existing.metadata.annotations == vpa.metadata.annotations
                {
                    return;
                }
                vpa.status = existing.status.clone();
            }
            inner.vpas.insert(key.clone(), vpa);
        }
        self.emit(ResourceKind::VerticalPodAutoscaler, &key);
    }

    /// Status write path for the external recommender.
    pub fn put_vpa(&self, vpa: VerticalPodAutoscaler) {
        let key = vpa.key();
        {
            let mut inner = self.lock();
            if inner.vpas.get(&key) == Some(&vpa) {
                return;
            }
            inner.vpas.insert(key.clone(), vpa);
        }
        self.emit(ResourceKind::VerticalPodAutoscaler, &key);
    }

    pub fn delete_vpa(&self, key: &str) {
        let removed = self.lock().vpas.remove(key).is_some();
        if removed {
            self.emit(ResourceKind::VerticalPodAutoscaler, key);
        }
    }

    // --- machine sets ---

    pub fn upsert_machine_set(&self, machine_set: MachineSet) {
        let key = machine_set.metadata.key();
        {
            let mut inner = self.lock();
            if inner.machine_sets.get(&key) == Some(&machine_set) {
                return;
            }
            inner.machine_sets.insert(key.clone(), machine_set);
        }
        self.emit(ResourceKind::MachineSet, &key);
    }

    pub fn machine_sets_in(&self, namespace: &str) -> Vec<MachineSet> {
        self.lock()
            .machine_sets
            .values()
            .filter(|m| m.metadata.namespace == namespace)
            .cloned()
            .collect()
    }

    // --- secrets ---

    pub fn secret(&self, key: &str) -> Option<Secret> {
        self.lock().secrets.get(key).cloned()
    }

    pub fn upsert_secret(&self, secret: Secret) {
        let key = secret.key();
        {
            let mut inner = self.lock();
            if inner.secrets.get(&key) == Some(&secret) {
                return;
            }
            inner.secrets.insert(key.clone(), secret);
        }
        self.emit(ResourceKind::Secret, &key);
    }
}
