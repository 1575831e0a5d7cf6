//! Aggregate resource arithmetic for the synthetic node.
//!
//! Capacities and pod requests are folded into a small fixed set of
//! dimensions: cpu (millicores), memory and ephemeral storage (bytes), and
//! pod count.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Container, Node, Pod};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use tracing::warn;

/// Totals for the resource dimensions the synthetic node reports.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ClusterResources {
    pub cpu_milli: i64,
    pub memory_bytes: i64,
    pub ephemeral_storage_bytes: i64,
    pub pods: i64,
}

impl ClusterResources {
    /// Read totals out of a capacity (or any resource list) map.
    pub fn from_capacity(capacity: &BTreeMap<String, Quantity>) -> Self {
        Self {
            cpu_milli: capacity.get("cpu").map_or(0, quantity_to_millicores),
            memory_bytes: capacity.get("memory").map_or(0, quantity_to_bytes),
            ephemeral_storage_bytes: capacity
                .get("ephemeral-storage")
                .map_or(0, quantity_to_bytes),
            pods: capacity.get("pods").map_or(0, quantity_to_bytes),
        }
    }

    /// Resources a pod asks for: container requests summed, init container
    /// requests folded in element-wise (an init container only raises a
    /// dimension it exceeds), pod overhead added on top. Every pod consumes
    /// one unit of the pod-count dimension.
    pub fn from_pod_requests(pod: &Pod) -> Self {
        let mut total = Self::default();
        let Some(spec) = pod.spec.as_ref() else {
            total.pods = 1;
            return total;
        };
        for container in &spec.containers {
            total.add(&container_requests(container));
        }
        if let Some(init_containers) = &spec.init_containers {
            for container in init_containers {
                total.max_assign(&container_requests(container));
            }
        }
        if let Some(overhead) = &spec.overhead {
            total.add(&Self::from_capacity(overhead));
        }
        total.pods = 1;
        total
    }

    pub fn add(&mut self, other: &Self) {
        self.cpu_milli = self.cpu_milli.saturating_add(other.cpu_milli);
        self.memory_bytes = self.memory_bytes.saturating_add(other.memory_bytes);
        self.ephemeral_storage_bytes = self
            .ephemeral_storage_bytes
            .saturating_add(other.ephemeral_storage_bytes);
        self.pods = self.pods.saturating_add(other.pods);
    }

    /// Subtract, saturating at zero: an over-committed cluster reports no
    /// spare capacity rather than a negative one.
    pub fn sub(&mut self, other: &Self) {
        self.cpu_milli = (self.cpu_milli - other.cpu_milli).max(0);
        self.memory_bytes = (self.memory_bytes - other.memory_bytes).max(0);
        self.ephemeral_storage_bytes =
            (self.ephemeral_storage_bytes - other.ephemeral_storage_bytes).max(0);
        self.pods = (self.pods - other.pods).max(0);
    }

    fn max_assign(&mut self, other: &Self) {
        self.cpu_milli = self.cpu_milli.max(other.cpu_milli);
        self.memory_bytes = self.memory_bytes.max(other.memory_bytes);
        self.ephemeral_storage_bytes = self
            .ephemeral_storage_bytes
            .max(other.ephemeral_storage_bytes);
        self.pods = self.pods.max(other.pods);
    }

    /// Write these totals into the node's capacity and allocatable lists.
    pub fn apply_to_node(&self, node: &mut Node) {
        let mut resources = BTreeMap::new();
        resources.insert("cpu".to_string(), Quantity(format!("{}m", self.cpu_milli)));
        resources.insert("memory".to_string(), Quantity(self.memory_bytes.to_string()));
        resources.insert(
            "ephemeral-storage".to_string(),
            Quantity(self.ephemeral_storage_bytes.to_string()),
        );
        resources.insert("pods".to_string(), Quantity(self.pods.to_string()));

        let status = node.status.get_or_insert_with(Default::default);
        status.capacity = Some(resources.clone());
        status.allocatable = Some(resources);
    }
}

fn container_requests(container: &Container) -> ClusterResources {
    container
        .resources
        .as_ref()
        .and_then(|resources| resources.requests.as_ref())
        .map_or_else(ClusterResources::default, ClusterResources::from_capacity)
}

/// Millicores in a cpu quantity ("100m" -> 100, "2" -> 2000).
pub fn quantity_to_millicores(quantity: &Quantity) -> i64 {
    (parse_quantity(quantity) * 1000.0).round() as i64
}

/// Base units in a quantity ("1Ki" -> 1024, "500k" -> 500000).
pub fn quantity_to_bytes(quantity: &Quantity) -> i64 {
    parse_quantity(quantity).round() as i64
}

fn parse_quantity(quantity: &Quantity) -> f64 {
    let raw = quantity.0.trim();
    // Plain numbers, including exponent notation, parse directly.
    if let Ok(value) = raw.parse::<f64>() {
        return value;
    }
    const SUFFIXES: &[(&str, f64)] = &[
        ("Ki", 1_024.0),
        ("Mi", 1_048_576.0),
        ("Gi", 1_073_741_824.0),
        ("Ti", 1_099_511_627_776.0),
        ("Pi", 1_125_899_906_842_624.0),
        ("Ei", 1_152_921_504_606_846_976.0),
        ("m", 1e-3),
        ("k", 1e3),
        ("M", 1e6),
        ("G", 1e9),
        ("T", 1e12),
        ("P", 1e15),
        ("E", 1e18),
    ];
    for (suffix, scale) in SUFFIXES {
        if let Some(number) = raw.strip_suffix(suffix) {
            if let Ok(value) = number.parse::<f64>() {
                return value * scale;
            }
        }
    }
    warn!(quantity = raw, "unparseable resource quantity, treating as zero");
    0.0
}
