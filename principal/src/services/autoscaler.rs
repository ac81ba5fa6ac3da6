//! Recommends a size class from API-server resource usage.
//!
//! For opted-in clusters on the dedicated request-serving topology, a
//! recommendation-only vertical pod autoscaler tracks the API server
//! deployment. Its uncapped target is mapped through the machine-size cache
//! to the smallest class that can host it, and the result is published as an
//! annotation on the hosted cluster. The sizing controller consumes that
//! annotation as a middle-priority target input for opted-in clusters: an
//! explicit override beats it, and it beats the worker-node count.

use std::sync::Arc;

use thiserror::Error;

use models::autoscaling::{
    CrossVersionObjectReference, VerticalPodAutoscaler, VpaSpec, VpaUpdateMode, VpaUpdatePolicy,
    KUBE_API_SERVER, RECOMMENDATION_PROVIDED_CONDITION, RESOURCE_CPU, RESOURCE_MEMORY,
    VPA_CLUSTER_NAMESPACE_ANNOTATION, VPA_CLUSTER_NAME_ANNOTATION,
};
use models::cluster::{
    HostedCluster, DEDICATED_REQUEST_SERVING_TOPOLOGY, RECOMMENDED_SIZE_ANNOTATION,
};
use models::meta::ObjectMeta;
use models::ConditionStatus;

use crate::controller::{Outcome, Reconciler};
use crate::services::machine_sizes::MachineSizeCache;
use crate::store::{ResourceKind, Store, StoreError, StoreEvent};

#[derive(Debug, Error)]
pub enum AutoscalerError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct ResourceBasedAutoscaler {
    store: Arc<Store>,
    machine_sizes: Arc<MachineSizeCache>,
    management_namespace: String,
}

impl ResourceBasedAutoscaler {
    pub fn new(
        store: Arc<Store>,
        machine_sizes: Arc<MachineSizeCache>,
        management_namespace: String,
    ) -> Self {
        ResourceBasedAutoscaler {
            store,
            machine_sizes,
            management_namespace,
        }
    }

    fn vpa_key(cluster: &HostedCluster) -> String {
        format!("{}/{}", cluster.control_plane_namespace(), KUBE_API_SERVER)
    }

    /// The recommendation-only VPA tracking a cluster's API server, annotated
    /// for the reverse lookup from VPA events back to the cluster.
    fn desired_vpa(cluster: &HostedCluster) -> VerticalPodAutoscaler {
        let mut metadata = ObjectMeta::new(&cluster.control_plane_namespace(), KUBE_API_SERVER);
        metadata.annotations.insert(
            VPA_CLUSTER_NAMESPACE_ANNOTATION.to_string(),
            cluster.metadata.namespace.clone(),
        );
        metadata.annotations.insert(
            VPA_CLUSTER_NAME_ANNOTATION.to_string(),
            cluster.metadata.name.clone(),
        );
        VerticalPodAutoscaler {
            metadata,
            spec: VpaSpec {
                target_ref: CrossVersionObjectReference {
                    api_version: "apps/v1".to_string(),
                    kind: "Deployment".to_string(),
                    name: KUBE_API_SERVER.to_string(),
                },
                update_policy: VpaUpdatePolicy {
                    update_mode: VpaUpdateMode::Off,
                },
            },
            status: Default::default(),
        }
    }
}

impl Reconciler for ResourceBasedAutoscaler {
    type Error = AutoscalerError;

    fn name(&self) -> &'static str {
        "resource-based-autoscaler"
    }

    fn interest(&self, event: &StoreEvent) -> Vec<String> {
        match event.kind {
            ResourceKind::HostedCluster => vec![event.key.clone()],
            ResourceKind::VerticalPodAutoscaler => self
                .store
                .vpa(&event.key)
                .and_then(|vpa| vpa.hosted_cluster_key())
                .map(|key| vec![key])
                .unwrap_or_default(),
            // Fractions and capacities feed every recommendation.
            ResourceKind::SizingConfiguration | ResourceKind::MachineSet => {
                self.store.hosted_cluster_keys()
            }
            _ => Vec::new(),
        }
    }

    fn all_keys(&self) -> Vec<String> {
        self.store.hosted_cluster_keys()
    }

    async fn reconcile(&self, key: &str) -> Result<Outcome, Self::Error> {
        let Some(cluster) = self.store.hosted_cluster(key) else {
            return Ok(Outcome::done());
        };

        let vpa_key = Self::vpa_key(&cluster);
        let opted_in = cluster.autoscaling_requested()
            && cluster.topology() == Some(DEDICATED_REQUEST_SERVING_TOPOLOGY);
        if !opted_in {
            self.store.delete_vpa(&vpa_key);
            return Ok(Outcome::done());
        }

        self.store.ensure_vpa(Self::desired_vpa(&cluster));

        let Some(vpa) = self.store.vpa(&vpa_key) else {
            return Ok(Outcome::done());
        };
        let provided = matches!(
            vpa.condition(RECOMMENDATION_PROVIDED_CONDITION),
            Some(c) if c.status == ConditionStatus::True
        );
        if !provided {
            return Ok(Outcome::done());
        }
        let Some(recommendation) = vpa
            .status
            .recommendation
            .as_ref()
            .and_then(|r| r.container(KUBE_API_SERVER))
        else {
            return Ok(Outcome::done());
        };

        let memory = recommendation.uncapped_target.get(RESOURCE_MEMORY);
        let cpu = recommendation.uncapped_target.get(RESOURCE_CPU);
        if memory.is_none() && cpu.is_none() {
            return Ok(Outcome::done());
        }

        let Some(config) = self.store.sizing_configuration() else {
            return Ok(Outcome::done());
        };
        let machine_sets = self.store.machine_sets_in(&self.management_namespace);
        if let Err(error) = self.machine_sizes.update(&config, &machine_sets) {
            // Bad capacities or fractions are an administrator problem; the
            // validator surfaces them, nothing to retry here.
            tracing::warn!(cluster = %key, "machine size cache not updated: {}", error);
            return Ok(Outcome::done());
        }

        let size = self.machine_sizes.size_for(memory, cpu);
        if size.is_empty() {
            return Ok(Outcome::done());
        }

        if cluster.recommended_size() != Some(size.as_str()) {
            tracing::info!(cluster = %key, size = %size, "publishing recommended size");
            self.store
                .patch_annotation(key, RECOMMENDED_SIZE_ANNOTATION, &size)?;
        }
        Ok(Outcome::done())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use models::autoscaling::{VpaContainerRecommendation, VpaRecommendation};
    use models::cluster::{RESOURCE_BASED_AUTOSCALING_ANNOTATION, TOPOLOGY_ANNOTATION};
    use models::sizing::{ClusterSizingConfiguration, SizeCapacity};
    use models::{Condition, Quantity};

    fn opted_in_cluster() -> HostedCluster {
        let mut cluster = HostedCluster::new("clusters", "c1");
        cluster.metadata.annotations.insert(
            RESOURCE_BASED_AUTOSCALING_ANNOTATION.to_string(),
            "true".to_string(),
        );
        cluster.metadata.annotations.insert(
            TOPOLOGY_ANNOTATION.to_string(),
            DEDICATED_REQUEST_SERVING_TOPOLOGY.to_string(),
        );
        cluster
    }

    fn config_with_capacities() -> ClusterSizingConfiguration {
        let mut config = ClusterSizingConfiguration::default();
        let capacities = [("small", "16Gi"), ("medium", "48Gi"), ("large", "96Gi")];
        for (name, memory) in capacities {
            let size = config
                .spec
                .sizes
                .iter_mut()
                .find(|s| s.name == name)
                .unwrap();
            size.capacity = Some(SizeCapacity {
                memory: Some(Quantity::from(memory)),
                ..SizeCapacity::default()
            });
        }
        config
    }

    fn autoscaler(store: Arc<Store>) -> ResourceBasedAutoscaler {
        ResourceBasedAutoscaler::new(
            store,
            Arc::new(MachineSizeCache::default()),
            "openshift-machine-api".to_string(),
        )
    }

    fn recommend(store: &Store, vpa_key: &str, memory: &str) {
        let mut vpa = store.vpa(vpa_key).unwrap();
        vpa.status.conditions.push(Condition::new(
            RECOMMENDATION_PROVIDED_CONDITION,
            ConditionStatus::True,
            "RecommendationProvided",
            "",
            Utc::now(),
        ));
        vpa.status.recommendation = Some(VpaRecommendation {
            container_recommendations: vec![VpaContainerRecommendation {
                container_name: KUBE_API_SERVER.to_string(),
                uncapped_target: [(RESOURCE_MEMORY.to_string(), Quantity::from(memory))]
                    .into_iter()
                    .collect(),
                ..VpaContainerRecommendation::default()
            }],
        });
        store.put_vpa(vpa);
    }

    #[tokio::test]
    async fn test_opted_out_cluster_has_no_vpa() {
        let store = Arc::new(Store::new());
        store.put_sizing_configuration(config_with_capacities());
        store.upsert_hosted_cluster(HostedCluster::new("clusters", "c1"));

        let controller = autoscaler(store.clone());
        controller.reconcile("clusters/c1").await.unwrap();
        assert!(store.vpa("clusters-c1/kube-apiserver").is_none());
    }

    #[tokio::test]
    async fn test_opting_out_tears_down_the_vpa() {
        let store = Arc::new(Store::new());
        store.put_sizing_configuration(config_with_capacities());
        store.upsert_hosted_cluster(opted_in_cluster());

        let controller = autoscaler(store.clone());
        controller.reconcile("clusters/c1").await.unwrap();
        assert!(store.vpa("clusters-c1/kube-apiserver").is_some());

        let mut cluster = store.hosted_cluster("clusters/c1").unwrap();
        cluster
            .metadata
            .annotations
            .remove(RESOURCE_BASED_AUTOSCALING_ANNOTATION);
        store.upsert_hosted_cluster(cluster);

        controller.reconcile("clusters/c1").await.unwrap();
        assert!(store.vpa("clusters-c1/kube-apiserver").is_none());
    }

    #[tokio::test]
    async fn test_creates_recommendation_only_vpa_with_reverse_annotations() {
        let store = Arc::new(Store::new());
        store.put_sizing_configuration(config_with_capacities());
        store.upsert_hosted_cluster(opted_in_cluster());

        let controller = autoscaler(store.clone());
        controller.reconcile("clusters/c1").await.unwrap();

        let vpa = store.vpa("clusters-c1/kube-apiserver").unwrap();
        assert_eq!(vpa.spec.update_policy.update_mode, VpaUpdateMode::Off);
        assert_eq!(vpa.spec.target_ref.name, KUBE_API_SERVER);
        assert_eq!(vpa.hosted_cluster_key().as_deref(), Some("clusters/c1"));
    }

    #[tokio::test]
    async fn test_recommendation_maps_to_annotation() {
        let store = Arc::new(Store::new());
        store.put_sizing_configuration(config_with_capacities());
        store.upsert_hosted_cluster(opted_in_cluster());

        let controller = autoscaler(store.clone());
        controller.reconcile("clusters/c1").await.unwrap();

        // 20Gi needs medium: 16Gi * 0.65 = 10.4Gi < 20Gi <= 48Gi * 0.65.
        recommend(&store, "clusters-c1/kube-apiserver", "20Gi");
        controller.reconcile("clusters/c1").await.unwrap();

        let cluster = store.hosted_cluster("clusters/c1").unwrap();
        assert_eq!(cluster.recommended_size(), Some("medium"));
    }

    #[tokio::test]
    async fn test_no_recommendation_publishes_nothing() {
        let store = Arc::new(Store::new());
        store.put_sizing_configuration(config_with_capacities());
        store.upsert_hosted_cluster(opted_in_cluster());

        let controller = autoscaler(store.clone());
        controller.reconcile("clusters/c1").await.unwrap();
        controller.reconcile("clusters/c1").await.unwrap();

        let cluster = store.hosted_cluster("clusters/c1").unwrap();
        assert_eq!(cluster.recommended_size(), None);
    }

    #[tokio::test]
    async fn test_unchanged_recommendation_writes_nothing() {
        let store = Arc::new(Store::new());
        store.put_sizing_configuration(config_with_capacities());
        store.upsert_hosted_cluster(opted_in_cluster());

        let controller = autoscaler(store.clone());
        controller.reconcile("clusters/c1").await.unwrap();
        recommend(&store, "clusters-c1/kube-apiserver", "20Gi");
        controller.reconcile("clusters/c1").await.unwrap();

        let mut events = store.subscribe();
        controller.reconcile("clusters/c1").await.unwrap();
        assert!(events.try_recv().is_err());
    }
}
