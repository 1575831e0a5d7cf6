//! Synthetic node construction and cluster probes.
//!
//! The provider fronts a downstream cluster as one node: its capacity is
//! the sum over ready, schedulable downstream nodes minus what their pods
//! already consume. Cluster access goes through the [`ClusterView`] trait so
//! tests can substitute a canned view for a live API server.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    DaemonEndpoint, Node, NodeAddress, NodeCondition, NodeDaemonEndpoints, NodeSystemInfo, Pod,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::chrono::Utc;
use kube::api::{Api, ListParams};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::resources::ClusterResources;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),
    #[error("could not reach the {side} api server: {source}")]
    Unreachable {
        side: &'static str,
        #[source]
        source: Box<ProviderError>,
    },
    #[error("{0}")]
    Backend(String),
}

/// Read access to one cluster's control plane.
#[async_trait]
pub trait ClusterView: Send + Sync + 'static {
    async fn nodes(&self) -> Result<Vec<Node>, ProviderError>;

    async fn pods(&self) -> Result<Vec<Pod>, ProviderError>;

    /// Version of the api server; doubles as a liveness probe.
    async fn server_version(&self) -> Result<String, ProviderError>;
}

/// [`ClusterView`] over a live cluster.
pub struct KubeClusterView {
    client: kube::Client,
}

impl KubeClusterView {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterView for KubeClusterView {
    async fn nodes(&self) -> Result<Vec<Node>, ProviderError> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn pods(&self) -> Result<Vec<Pod>, ProviderError> {
        let api: Api<Pod> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn server_version(&self) -> Result<String, ProviderError> {
        let info = self.client.apiserver_version().await?;
        Ok(format!("{}.{}", info.major, info.minor))
    }
}

/// Identity the synthetic node reports upstream.
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    pub kubelet_version: String,
    pub daemon_port: i32,
    pub internal_ip: Option<String>,
    pub external_ip: Option<String>,
    /// Extra labels stamped onto the node.
    pub labels: BTreeMap<String, String>,
}

/// Builds and refreshes the synthetic node fronting the downstream cluster.
pub struct NodeProvider {
    upstream: Arc<dyn ClusterView>,
    downstream: Arc<dyn ClusterView>,
    identity: NodeIdentity,
    updates_tx: mpsc::Sender<Node>,
    updates_rx: Mutex<Option<mpsc::Receiver<Node>>>,
}

impl NodeProvider {
    pub fn new(
        upstream: Arc<dyn ClusterView>,
        downstream: Arc<dyn ClusterView>,
        identity: NodeIdentity,
    ) -> Self {
        let (updates_tx, updates_rx) = mpsc::channel(16);
        Self {
            upstream,
            downstream,
            identity,
            updates_tx,
            updates_rx: Mutex::new(Some(updates_rx)),
        }
    }

    /// Fill `node` with the aggregate downstream capacity and this node's
    /// identity, conditions, and addresses.
    pub async fn configure_node(&self, node: &mut Node) -> Result<(), ProviderError> {
        let members = self.downstream.nodes().await?;

        let mut capacity = ClusterResources::default();
        for member in &members {
            if !node_schedulable(member) {
                continue;
            }
            if !node_ready(member) {
                debug!(
                    node = member.metadata.name.as_deref().unwrap_or(""),
                    "skipping downstream node that is not ready"
                );
                continue;
            }
            if let Some(member_capacity) = member.status.as_ref().and_then(|s| s.capacity.as_ref())
            {
                capacity.add(&ClusterResources::from_capacity(member_capacity));
            }
        }
        capacity.sub(&self.pods_in_use(&members).await?);
        capacity.apply_to_node(node);

        let labels = node.metadata.labels.get_or_insert_with(BTreeMap::new);
        labels.insert("kubernetes.io/arch".to_string(), "amd64".to_string());
        labels.insert("kubernetes.io/os".to_string(), "linux".to_string());
        labels.insert("beta.kubernetes.io/os".to_string(), "linux".to_string());
        labels.extend(self.identity.labels.clone());

        let mut addresses = Vec::new();
        if let Some(ip) = &self.identity.internal_ip {
            addresses.push(NodeAddress {
                type_: "InternalIP".to_string(),
                address: ip.clone(),
            });
        }
        if let Some(ip) = &self.identity.external_ip {
            addresses.push(NodeAddress {
                type_: "ExternalIP".to_string(),
                address: ip.clone(),
            });
        }

        let status = node.status.get_or_insert_with(Default::default);
        status.node_info = Some(NodeSystemInfo {
            architecture: "amd64".to_string(),
            operating_system: "linux".to_string(),
            kubelet_version: self.identity.kubelet_version.clone(),
            ..Default::default()
        });
        status.addresses = Some(addresses);
        status.conditions = Some(synthetic_conditions());
        status.daemon_endpoints = Some(NodeDaemonEndpoints {
            kubelet_endpoint: Some(DaemonEndpoint {
                port: self.identity.daemon_port,
            }),
        });
        Ok(())
    }

    /// Resources already spoken for by pods on usable downstream nodes:
    /// running pods, and pending pods that have a node assignment.
    async fn pods_in_use(&self, members: &[Node]) -> Result<ClusterResources, ProviderError> {
        let usable: HashSet<&str> = members
            .iter()
            .filter(|n| node_schedulable(n) && node_ready(n))
            .filter_map(|n| n.metadata.name.as_deref())
            .collect();

        let mut used = ClusterResources::default();
        for pod in &self.downstream.pods().await? {
            let phase = pod
                .status
                .as_ref()
                .and_then(|s| s.phase.as_deref())
                .unwrap_or("");
            let assigned = pod.spec.as_ref().and_then(|s| s.node_name.as_deref());
            let consumes = phase == "Running" || (phase == "Pending" && assigned.is_some());
            if !consumes {
                continue;
            }
            if let Some(node_name) = assigned {
                if !usable.contains(node_name) {
                    continue;
                }
            }
            used.add(&ClusterResources::from_pod_requests(pod));
        }
        Ok(used)
    }

    /// Probe both api servers; either side failing fails the ping.
    pub async fn ping(&self) -> Result<(), ProviderError> {
        self.upstream
            .server_version()
            .await
            .map_err(|err| ProviderError::Unreachable {
                side: "upstream",
                source: Box::new(err),
            })?;
        self.downstream
            .server_version()
            .await
            .map_err(|err| ProviderError::Unreachable {
                side: "downstream",
                source: Box::new(err),
            })?;
        Ok(())
    }

    /// Queue a freshly built node for the status forwarder. Never blocks; a
    /// full channel drops the update (the next resync rebuilds it anyway).
    pub fn push_status(&self, node: Node) {
        if let Err(err) = self.updates_tx.try_send(node) {
            warn!(error = %err, "dropping node status update");
        }
    }

    /// Forward queued node updates to `callback` until `shutdown` fires.
    /// Returns immediately; forwarding runs on its own task.
    pub fn notify_node_status(
        &self,
        mut shutdown: broadcast::Receiver<()>,
        callback: impl Fn(Node) + Send + 'static,
    ) {
        let Some(mut updates) = self.updates_rx.lock().unwrap().take() else {
            warn!("node status updates already have a subscriber");
            return;
        };
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    maybe = updates.recv() => match maybe {
                        Some(node) => callback(node),
                        None => return,
                    },
                    _ = shutdown.recv() => return,
                }
            }
        });
    }
}

fn node_schedulable(node: &Node) -> bool {
    !node
        .spec
        .as_ref()
        .and_then(|s| s.unschedulable)
        .unwrap_or(false)
}

fn node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

/// Conditions the synthetic node always reports. The node is a facade, so it
/// is ready whenever the bridge itself is up.
fn synthetic_conditions() -> Vec<NodeCondition> {
    let now = Time(Utc::now());
    let condition = |type_: &str, status: &str, reason: &str, message: &str| NodeCondition {
        type_: type_.to_string(),
        status: status.to_string(),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        last_heartbeat_time: Some(now.clone()),
        last_transition_time: Some(now.clone()),
    };
    vec![
        condition(
            "Ready",
            "True",
            "KubeletReady",
            "kubelet is posting ready status",
        ),
        condition(
            "MemoryPressure",
            "False",
            "KubeletHasSufficientMemory",
            "kubelet has sufficient memory available",
        ),
        condition(
            "DiskPressure",
            "False",
            "KubeletHasNoDiskPressure",
            "kubelet has no disk pressure",
        ),
        condition(
            "PIDPressure",
            "False",
            "KubeletHasSufficientPID",
            "kubelet has sufficient PID available",
        ),
    ]
}
