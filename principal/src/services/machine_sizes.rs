//! Cached machine capacities per size class.
//!
//! The resource-based autoscaler turns an API-server resource recommendation
//! into a size class by comparing it against the capacity a machine of each
//! class offers, scaled by the fraction the API server is allowed to claim.
//! Capacities come from the sizing configuration when fully declared there,
//! otherwise from introspecting the request-serving machine sets in the
//! management cluster.

use std::collections::HashMap;
use std::sync::Mutex;

use thiserror::Error;

use models::autoscaling::MachineSet;
use models::sizing::ClusterSizingConfiguration;
use models::Quantity;

pub const DEFAULT_MEMORY_FRACTION: f64 = 0.65;
pub const DEFAULT_CPU_FRACTION: f64 = 0.65;

#[derive(Debug, Error)]
pub enum MachineSizeError {
    #[error("fraction {value} for {scope} must be in (0, 1]")]
    InvalidFraction { scope: String, value: f64 },
    #[error("no machine capacity found for size class {0:?}")]
    UncoveredSize(String),
    #[error("machine capacity for size class {0:?} is not a valid quantity: {1}")]
    BadQuantity(String, String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MachineCapacity {
    pub memory: Quantity,
    pub cpu: Option<Quantity>,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct SizeFractions {
    memory: Option<f64>,
    cpu: Option<f64>,
}

#[derive(Default)]
struct CacheState {
    sizes: HashMap<String, MachineCapacity>,
    /// Class names in ascending memory order; sizes are totally ordered by
    /// memory.
    ordered: Vec<String>,
    global_memory_fraction: Option<f64>,
    global_cpu_fraction: Option<f64>,
    per_size: HashMap<String, SizeFractions>,
    cached_generation: Option<i64>,
}

/// Process-wide cache, guarded by a mutex across every read and update.
#[derive(Default)]
pub struct MachineSizeCache {
    state: Mutex<CacheState>,
}

enum Dimension {
    Memory,
    Cpu,
}

fn check_fraction(scope: &str, value: f64) -> Result<f64, MachineSizeError> {
    if value > 0.0 && value <= 1.0 {
        Ok(value)
    } else {
        Err(MachineSizeError::InvalidFraction {
            scope: scope.to_string(),
            value,
        })
    }
}

fn fully_declared(config: &ClusterSizingConfiguration) -> bool {
    config
        .spec
        .sizes
        .iter()
        .all(|s| s.capacity.as_ref().map_or(false, |c| c.memory.is_some()))
}

impl MachineSizeCache {
    /// Rebuilds the cache from the configuration and the machine sets of the
    /// management cluster. Skipped entirely when the configuration generation
    /// is unchanged and every class declares its capacity in-spec.
    pub fn update(
        &self,
        config: &ClusterSizingConfiguration,
        machine_sets: &[MachineSet],
    ) -> Result<(), MachineSizeError> {
        let mut state = self.lock();

        if state.cached_generation == Some(config.metadata.generation) && fully_declared(config) {
            return Ok(());
        }

        let mut global_memory = None;
        let mut global_cpu = None;
        if let Some(f) = config.spec.resource_based_autoscaling.kube_api_server_memory_fraction {
            global_memory = Some(check_fraction("global memory", f)?);
        }
        if let Some(f) = config.spec.resource_based_autoscaling.kube_api_server_cpu_fraction {
            global_cpu = Some(check_fraction("global cpu", f)?);
        }

        let mut per_size = HashMap::new();
        for size in &config.spec.sizes {
            let Some(capacity) = &size.capacity else { continue };
            let mut fractions = SizeFractions::default();
            if let Some(f) = capacity.kube_api_server_memory_fraction {
                fractions.memory =
                    Some(check_fraction(&format!("size {} memory", size.name), f)?);
            }
            if let Some(f) = capacity.kube_api_server_cpu_fraction {
                fractions.cpu = Some(check_fraction(&format!("size {} cpu", size.name), f)?);
            }
            if fractions != SizeFractions::default() {
                per_size.insert(size.name.clone(), fractions);
            }
        }

        let mut sizes = HashMap::new();
        if fully_declared(config) {
            for size in &config.spec.sizes {
                let capacity = size.capacity.as_ref().and_then(|c| c.memory.as_ref());
                let Some(memory) = capacity else {
                    return Err(MachineSizeError::UncoveredSize(size.name.clone()));
                };
                sizes.insert(
                    size.name.clone(),
                    MachineCapacity {
                        memory: memory.clone(),
                        cpu: size.capacity.as_ref().and_then(|c| c.cpu.clone()),
                    },
                );
            }
        } else {
            // Group machine sets by size class; the first one encountered per
            // class wins. Divergent instance types within a class are
            // explicitly unspecified.
            let mut by_class: HashMap<&str, &MachineSet> = HashMap::new();
            for machine_set in machine_sets {
                if let Some(class) = machine_set.size_class() {
                    by_class.entry(class).or_insert(machine_set);
                }
            }
            for size in &config.spec.sizes {
                let Some(machine_set) = by_class.get(size.name.as_str()) else {
                    return Err(MachineSizeError::UncoveredSize(size.name.clone()));
                };
                let Some(memory_mb) = machine_set.memory_mb() else {
                    return Err(MachineSizeError::UncoveredSize(size.name.clone()));
                };
                sizes.insert(
                    size.name.clone(),
                    MachineCapacity {
                        memory: Quantity::from_mebibytes(memory_mb),
                        cpu: machine_set.vcpus().map(Quantity::from_cores),
                    },
                );
            }
        }

        let mut ordered: Vec<(String, f64)> = Vec::with_capacity(sizes.len());
        for (name, capacity) in &sizes {
            let bytes = capacity
                .memory
                .to_f64()
                .map_err(|e| MachineSizeError::BadQuantity(name.clone(), e))?;
            ordered.push((name.clone(), bytes));
        }
        ordered.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        state.sizes = sizes;
        state.ordered = ordered.into_iter().map(|(name, _)| name).collect();
        state.global_memory_fraction = global_memory;
        state.global_cpu_fraction = global_cpu;
        state.per_size = per_size;
        state.cached_generation = Some(config.metadata.generation);
        Ok(())
    }

    /// The smallest size class whose effective capacity satisfies the
    /// recommendation; when both dimensions are present the larger class
    /// wins. Returns an empty string before the first successful update.
    pub fn size_for(&self, memory: Option<&Quantity>, cpu: Option<&Quantity>) -> String {
        let state = self.lock();
        if state.ordered.is_empty() {
            return String::new();
        }

        let memory_index = memory
            .and_then(|q| q.to_f64().ok())
            .map(|need| state.first_fitting(need, Dimension::Memory));
        let cpu_index = cpu
            .and_then(|q| q.to_f64().ok())
            .map(|need| state.first_fitting(need, Dimension::Cpu));

        let index = match (memory_index, cpu_index) {
            (Some(m), Some(c)) => m.max(c),
            (Some(m), None) => m,
            (None, Some(c)) => c,
            (None, None) => return String::new(),
        };
        state.ordered[index].clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl CacheState {
    fn effective_fraction(&self, name: &str, dimension: &Dimension) -> f64 {
        let per_size = self.per_size.get(name);
        match dimension {
            Dimension::Memory => per_size
                .and_then(|f| f.memory)
                .or(self.global_memory_fraction)
                .unwrap_or(DEFAULT_MEMORY_FRACTION),
            Dimension::Cpu => per_size
                .and_then(|f| f.cpu)
                .or(self.global_cpu_fraction)
                .unwrap_or(DEFAULT_CPU_FRACTION),
        }
    }

    /// Index into `ordered` of the smallest class fitting the requirement,
    /// clamped to the largest class when nothing fits. A class without a
    /// declared CPU capacity is unconstrained on that dimension.
    fn first_fitting(&self, need: f64, dimension: Dimension) -> usize {
        for (index, name) in self.ordered.iter().enumerate() {
            let Some(capacity) = self.sizes.get(name) else { continue };
            let fraction = self.effective_fraction(name, &dimension);
            let effective = match &dimension {
                Dimension::Memory => capacity.memory.scale(fraction).ok(),
                Dimension::Cpu => match &capacity.cpu {
                    Some(cpu) => cpu.scale(fraction).ok(),
                    None => return index,
                },
            };
            match effective {
                Some(available) if available >= need => return index,
                _ => continue,
            }
        }
        self.ordered.len() - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use models::autoscaling::{
        CLUSTER_SIZE_MACHINE_LABEL, MACHINE_MEMORY_MB_ANNOTATION, MACHINE_VCPU_ANNOTATION,
    };
    use models::meta::ObjectMeta;
    use models::sizing::{SizeCapacity, SizeClass};

    fn config_with_capacities() -> ClusterSizingConfiguration {
        let mut config = ClusterSizingConfiguration::default();
        let capacities = [
            ("small", "16Gi", "4"),
            ("medium", "48Gi", "12"),
            ("large", "96Gi", "24"),
        ];
        for (name, memory, cpu) in capacities {
            let size = config
                .spec
                .sizes
                .iter_mut()
                .find(|s| s.name == name)
                .unwrap();
            size.capacity = Some(SizeCapacity {
                memory: Some(Quantity::from(memory)),
                cpu: Some(Quantity::from(cpu)),
                ..SizeCapacity::default()
            });
        }
        config
    }

    fn machine_set(namespace: &str, name: &str, class: &str, memory_mb: u64, vcpus: u64) -> MachineSet {
        let mut machine_set = MachineSet {
            metadata: ObjectMeta::new(namespace, name),
            spec: Default::default(),
        };
        machine_set
            .metadata
            .labels
            .insert(CLUSTER_SIZE_MACHINE_LABEL.to_string(), class.to_string());
        machine_set.metadata.annotations.insert(
            MACHINE_MEMORY_MB_ANNOTATION.to_string(),
            memory_mb.to_string(),
        );
        machine_set
            .metadata
            .annotations
            .insert(MACHINE_VCPU_ANNOTATION.to_string(), vcpus.to_string());
        machine_set
    }

    #[test]
    fn test_empty_cache_returns_empty_size() {
        let cache = MachineSizeCache::default();
        assert_eq!(cache.size_for(Some(&Quantity::from("1Gi")), None), "");
    }

    #[test]
    fn test_update_from_declared_capacities() {
        let cache = MachineSizeCache::default();
        cache.update(&config_with_capacities(), &[]).unwrap();

        // 16Gi * 0.65 = 10.4Gi available on small.
        assert_eq!(cache.size_for(Some(&Quantity::from("8Gi")), None), "small");
        assert_eq!(cache.size_for(Some(&Quantity::from("12Gi")), None), "medium");
        assert_eq!(cache.size_for(Some(&Quantity::from("40Gi")), None), "large");
    }

    #[test]
    fn test_recommendation_beyond_largest_clamps() {
        let cache = MachineSizeCache::default();
        cache.update(&config_with_capacities(), &[]).unwrap();
        assert_eq!(cache.size_for(Some(&Quantity::from("900Gi")), None), "large");
    }

    #[test]
    fn test_larger_dimension_wins() {
        let cache = MachineSizeCache::default();
        cache.update(&config_with_capacities(), &[]).unwrap();

        // Memory fits small (8Gi < 10.4Gi) but CPU needs medium (4 * 0.65 =
        // 2.6 cores < 6 <= 12 * 0.65).
        let size = cache.size_for(
            Some(&Quantity::from("8Gi")),
            Some(&Quantity::from("6")),
        );
        assert_eq!(size, "medium");
    }

    #[test]
    fn test_update_from_machine_sets() {
        let mut config = ClusterSizingConfiguration::default();
        config.spec.sizes = vec![
            SizeClass::new("small", 0, Some(10)),
            SizeClass::new("large", 11, None),
        ];
        let sets = vec![
            machine_set("openshift-machine-api", "serving-small", "small", 16_384, 4),
            machine_set("openshift-machine-api", "serving-large", "large", 98_304, 24),
        ];

        let cache = MachineSizeCache::default();
        cache.update(&config, &sets).unwrap();
        assert_eq!(cache.size_for(Some(&Quantity::from("8Gi")), None), "small");
        assert_eq!(cache.size_for(Some(&Quantity::from("32Gi")), None), "large");
    }

    #[test]
    fn test_update_requires_coverage_of_every_class() {
        let mut config = ClusterSizingConfiguration::default();
        config.spec.sizes = vec![
            SizeClass::new("small", 0, Some(10)),
            SizeClass::new("large", 11, None),
        ];
        let sets = vec![machine_set(
            "openshift-machine-api",
            "serving-small",
            "small",
            16_384,
            4,
        )];

        let cache = MachineSizeCache::default();
        assert!(matches!(
            cache.update(&config, &sets),
            Err(MachineSizeError::UncoveredSize(name)) if name == "large"
        ));
    }

    #[test]
    fn test_rejects_out_of_range_fraction() {
        let mut config = config_with_capacities();
        config
            .spec
            .resource_based_autoscaling
            .kube_api_server_memory_fraction = Some(1.5);

        let cache = MachineSizeCache::default();
        assert!(matches!(
            cache.update(&config, &[]),
            Err(MachineSizeError::InvalidFraction { .. })
        ));
    }

    #[test]
    fn test_per_size_fraction_overrides_global() {
        let mut config = config_with_capacities();
        config
            .spec
            .resource_based_autoscaling
            .kube_api_server_memory_fraction = Some(0.9);
        config
            .spec
            .sizes
            .iter_mut()
            .find(|s| s.name == "small")
            .unwrap()
            .capacity
            .as_mut()
            .unwrap()
            .kube_api_server_memory_fraction = Some(0.5);

        let cache = MachineSizeCache::default();
        cache.update(&config, &[]).unwrap();

        // 16Gi * 0.5 = 8Gi, so 9Gi spills to medium even though the global
        // fraction would have kept it on small.
        assert_eq!(cache.size_for(Some(&Quantity::from("9Gi")), None), "medium");
    }

    #[test]
    fn test_generation_short_circuit_skips_rebuild() {
        let config = config_with_capacities();
        let cache = MachineSizeCache::default();
        cache.update(&config, &[]).unwrap();

        // Same generation, fully declared: a second update with different
        // machine sets must be a no-op.
        let sets = vec![machine_set("openshift-machine-api", "x", "small", 1, 1)];
        cache.update(&config, &sets).unwrap();
        assert_eq!(cache.size_for(Some(&Quantity::from("8Gi")), None), "small");
    }
}
