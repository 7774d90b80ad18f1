//! Node Lifecycle Manager: deployment descriptors, launch, health polling and
//! channel join.

use crate::channel::ConfigBlock;
use crate::collab::{ContainerRuntime, Health, OrdererFailure, OrderingService, RuntimeFailure};
use crate::error::NodeError;
use crate::model::{Endpoint, Participant};
use crate::trust::TrustBundle;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time;
use tracing::{debug, info, warn};

const NODE_CONFIG_DIR: &str = "/etc/hyperledger/fabric";

/// Peer node to bring up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Node name (`peer1`).
    pub name: String,
    /// Owning organization (`org1`).
    pub organization: String,
    /// MSP id of the organization.
    pub msp_id: String,
    /// Peer listen port.
    pub port: u16,
    /// Chaincode listen port.
    pub chaincode_port: u16,
    /// Operations endpoint port, if exposed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operations_port: Option<u16>,
    /// Existing peer used as gossip bootstrap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_peer: Option<Endpoint>,
    /// Image override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl NodeSpec {
    /// Spec with the chaincode port one above `port`.
    pub fn new(
        name: impl Into<String>,
        organization: impl Into<String>,
        msp_id: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            name: name.into(),
            organization: organization.into(),
            msp_id: msp_id.into(),
            port,
            chaincode_port: port.saturating_add(1),
            operations_port: None,
            bootstrap_peer: None,
            image: None,
        }
    }

    /// Participant record of this node.
    pub fn participant(&self) -> Participant {
        Participant::node(&self.name, &self.organization, &self.msp_id)
    }

    /// Fully-qualified host name.
    pub fn host(&self, domain: &str) -> String {
        self.participant().host(domain)
    }

    /// Peer endpoint.
    pub fn endpoint(&self, domain: &str) -> Endpoint {
        Endpoint::new(self.host(domain), self.port)
    }
}

/// Network-wide settings every descriptor shares.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentSettings {
    /// Domain suffix of host names.
    pub domain: String,
    /// Default peer image.
    pub image: String,
    /// Container network.
    pub network: String,
    /// Host directory mounted as the peer's core config.
    pub peer_config_dir: String,
}

impl Default for DeploymentSettings {
    fn default() -> Self {
        Self {
            domain: "example.com".into(),
            image: "hyperledger/fabric-peer:latest".into(),
            network: "fabric_test".into(),
            peer_config_dir: "./docker/peercfg".into(),
        }
    }
}

/// Runtime description of one node container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentDescriptor {
    /// Container name (the node's host name).
    pub container_name: String,
    /// Image to run.
    pub image: String,
    /// Labels attached to the container.
    pub labels: BTreeMap<String, String>,
    /// Environment variables.
    pub environment: BTreeMap<String, String>,
    /// `host:container` volume mounts.
    pub volumes: Vec<String>,
    /// `host:container` port mappings.
    pub ports: Vec<String>,
    /// Working directory.
    pub working_dir: String,
    /// Start command.
    pub command: String,
    /// Networks to attach.
    pub networks: Vec<String>,
    /// Endpoint peers reach the node on.
    #[serde(skip)]
    pub endpoint: Option<Endpoint>,
    /// MSP id served by the node.
    #[serde(skip)]
    pub msp_id: String,
}

impl DeploymentDescriptor {
    /// Descriptor for `spec` serving the identity in `bundle`.
    pub fn for_node(spec: &NodeSpec, bundle: &TrustBundle, settings: &DeploymentSettings) -> Self {
        let host = spec.host(&settings.domain);
        let mut env = BTreeMap::new();
        let mut set = |key: &str, value: String| {
            env.insert(key.to_string(), value);
        };
        set("FABRIC_CFG_PATH", "/etc/hyperledger/peercfg".into());
        set("FABRIC_LOGGING_SPEC", "INFO".into());
        set("CORE_PEER_TLS_ENABLED", "true".into());
        set("CORE_PEER_PROFILE_ENABLED", "false".into());
        set("CORE_PEER_TLS_CERT_FILE", format!("{NODE_CONFIG_DIR}/tls/server.crt"));
        set("CORE_PEER_TLS_KEY_FILE", format!("{NODE_CONFIG_DIR}/tls/server.key"));
        set("CORE_PEER_TLS_ROOTCERT_FILE", format!("{NODE_CONFIG_DIR}/tls/ca.crt"));
        set("CORE_PEER_ID", host.clone());
        set("CORE_PEER_ADDRESS", format!("{host}:{}", spec.port));
        set("CORE_PEER_LISTENADDRESS", format!("0.0.0.0:{}", spec.port));
        set(
            "CORE_PEER_CHAINCODEADDRESS",
            format!("{host}:{}", spec.chaincode_port),
        );
        set(
            "CORE_PEER_CHAINCODELISTENADDRESS",
            format!("0.0.0.0:{}", spec.chaincode_port),
        );
        let bootstrap = spec
            .bootstrap_peer
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| format!("{host}:{}", spec.port));
        set("CORE_PEER_GOSSIP_BOOTSTRAP", bootstrap);
        set("CORE_PEER_GOSSIP_EXTERNALENDPOINT", format!("{host}:{}", spec.port));
        set("CORE_PEER_LOCALMSPID", spec.msp_id.clone());
        set("CORE_PEER_MSPCONFIGPATH", format!("{NODE_CONFIG_DIR}/msp"));
        set("CORE_METRICS_PROVIDER", "prometheus".into());
        set("CORE_CHAINCODE_EXECUTETIMEOUT", "300s".into());
        set("CORE_VM_ENDPOINT", "unix:///host/var/run/docker.sock".into());
        set("CORE_VM_DOCKER_HOSTCONFIG_NETWORKMODE", settings.network.clone());
        let mut ports = vec![format!("{0}:{0}", spec.port)];
        if let Some(ops) = spec.operations_port {
            set("CORE_OPERATIONS_LISTENADDRESS", format!("0.0.0.0:{ops}"));
            ports.push(format!("{ops}:{ops}"));
        }
        Self {
            container_name: host.clone(),
            image: spec.image.clone().unwrap_or_else(|| settings.image.clone()),
            labels: BTreeMap::from([("service".to_string(), "hyperledger-fabric".to_string())]),
            environment: env,
            volumes: vec![
                format!("{}:{NODE_CONFIG_DIR}", bundle.root.display()),
                format!("{host}:/var/hyperledger/production"),
                format!("{}:/etc/hyperledger/peercfg", settings.peer_config_dir),
                "/var/run/docker.sock:/host/var/run/docker.sock".into(),
            ],
            ports,
            working_dir: "/root".into(),
            command: "peer node start".into(),
            networks: vec![settings.network.clone()],
            endpoint: Some(spec.endpoint(&settings.domain)),
            msp_id: spec.msp_id.clone(),
        }
    }

    /// Renders the descriptor as a compose `services`/`volumes` fragment.
    pub fn to_compose_yaml(&self) -> Result<String, serde_yaml::Error> {
        #[derive(Serialize)]
        struct Service<'a> {
            container_name: &'a str,
            image: &'a str,
            labels: &'a BTreeMap<String, String>,
            environment: Vec<String>,
            volumes: &'a [String],
            working_dir: &'a str,
            command: &'a str,
            ports: &'a [String],
            networks: &'a [String],
        }
        #[derive(Serialize)]
        struct Compose<'a> {
            services: BTreeMap<&'a str, Service<'a>>,
            volumes: BTreeMap<&'a str, Option<()>>,
        }
        let service = Service {
            container_name: &self.container_name,
            image: &self.image,
            labels: &self.labels,
            environment: self
                .environment
                .iter()
                .map(|(key, value)| format!("{key}={value}"))
                .collect(),
            volumes: &self.volumes,
            working_dir: &self.working_dir,
            command: &self.command,
            ports: &self.ports,
            networks: &self.networks,
        };
        serde_yaml::to_string(&Compose {
            services: BTreeMap::from([(self.container_name.as_str(), service)]),
            volumes: BTreeMap::from([(self.container_name.as_str(), None)]),
        })
    }
}

/// Running node as reported by the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeHandle {
    /// Runtime id (container id).
    pub id: String,
    /// Node host name.
    pub node: String,
    /// MSP id served by the node.
    pub msp_id: String,
    /// Endpoint the node listens on.
    pub endpoint: Endpoint,
}

/// Launches nodes, waits for health and joins them to channels.
pub struct NodeLifecycleManager {
    runtime: Arc<dyn ContainerRuntime>,
    orderer: Arc<dyn OrderingService>,
    settings: DeploymentSettings,
    health_timeout: Duration,
    poll_interval: Duration,
    join_timeout: Duration,
}

impl NodeLifecycleManager {
    /// Manager over the given collaborators.
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        orderer: Arc<dyn OrderingService>,
        settings: DeploymentSettings,
    ) -> Self {
        Self {
            runtime,
            orderer,
            settings,
            health_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(500),
            join_timeout: Duration::from_secs(30),
        }
    }

    /// Bounds health polling and the channel join.
    pub fn with_timeouts(mut self, health: Duration, poll: Duration, join: Duration) -> Self {
        self.health_timeout = health;
        self.poll_interval = poll;
        self.join_timeout = join;
        self
    }

    /// Descriptor the manager would launch for `spec`.
    pub fn descriptor(&self, spec: &NodeSpec, bundle: &TrustBundle) -> DeploymentDescriptor {
        DeploymentDescriptor::for_node(spec, bundle, &self.settings)
    }

    /// Launches the node and waits until it reports healthy.
    pub async fn bootstrap(
        &self,
        participant: &Participant,
        spec: &NodeSpec,
        bundle: &TrustBundle,
    ) -> Result<NodeHandle, NodeError> {
        let node = participant.host(&self.settings.domain);
        if bundle.participant != participant.storage_key() || bundle.tls_dir.is_none() {
            return Err(NodeError::Launch {
                node,
                reason: format!("trust bundle {} does not belong to this node", bundle.participant),
            });
        }
        let descriptor = self.descriptor(spec, bundle);
        let handle = self
            .runtime
            .launch(&descriptor)
            .await
            .map_err(|err| NodeError::Launch {
                node: node.clone(),
                reason: err.to_string(),
            })?;
        info!(evt = "node_launched", node = %node, id = %handle.id);
        let started = Instant::now();
        loop {
            let remaining = self.health_timeout.saturating_sub(started.elapsed());
            match time::timeout(remaining, self.runtime.ping(&handle)).await {
                Ok(Health::Healthy) => {
                    info!(evt = "node_healthy", node = %node, waited_ms = started.elapsed().as_millis() as u64);
                    return Ok(handle);
                }
                Ok(Health::Unhealthy(reason)) => {
                    debug!(evt = "node_unhealthy", node = %node, %reason);
                }
                Err(_) => {
                    debug!(evt = "node_ping_timeout", node = %node);
                }
            }
            if started.elapsed() >= self.health_timeout {
                warn!(evt = "node_startup_timeout", node = %node);
                return Err(NodeError::StartupTimeout {
                    node,
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            time::sleep(self.poll_interval).await;
        }
    }

    /// Joins a launched node to `channel` from the committed configuration block.
    pub async fn join(
        &self,
        handle: &NodeHandle,
        channel: &str,
        committed: &ConfigBlock,
    ) -> Result<(), NodeError> {
        let outcome = time::timeout(
            self.join_timeout,
            self.orderer.join_channel(handle, channel, committed),
        )
        .await
        .map_err(|_| NodeError::Join {
            node: handle.node.clone(),
            reason: format!("timed out after {} ms", self.join_timeout.as_millis()),
        })?;
        match outcome {
            Ok(()) => {
                info!(evt = "node_joined", node = %handle.node, channel);
                Ok(())
            }
            Err(OrdererFailure::AlreadyJoined) => {
                debug!(evt = "node_already_joined", node = %handle.node, channel);
                Ok(())
            }
            Err(err) => Err(NodeError::Join {
                node: handle.node.clone(),
                reason: err.to_string(),
            }),
        }
    }

    /// Fetches the current configuration block of `channel` for a join.
    pub async fn committed_block(&self, channel: &str) -> Result<ConfigBlock, NodeError> {
        time::timeout(self.join_timeout, self.orderer.fetch_config(channel))
            .await
            .map_err(|_| NodeError::Join {
                node: channel.to_string(),
                reason: "config fetch timed out".into(),
            })?
            .map_err(|err| NodeError::Join {
                node: channel.to_string(),
                reason: err.to_string(),
            })
    }
}

/// Runs nodes as local Docker containers.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: PathBuf,
    probe_host: String,
    probe_timeout: Duration,
}

impl Default for DockerRuntime {
    fn default() -> Self {
        Self {
            docker: PathBuf::from("docker"),
            probe_host: "127.0.0.1".into(),
            probe_timeout: Duration::from_secs(2),
        }
    }
}

impl DockerRuntime {
    /// Runtime using the given docker binary.
    pub fn new(docker: impl Into<PathBuf>) -> Self {
        Self {
            docker: docker.into(),
            ..Self::default()
        }
    }

    /// Host the published peer port is probed on.
    pub fn with_probe_host(mut self, host: impl Into<String>) -> Self {
        self.probe_host = host.into();
        self
    }

    async fn docker(&self, args: &[String]) -> Result<String, RuntimeFailure> {
        let output = Command::new(&self.docker)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| RuntimeFailure(format!("{}: {err}", self.docker.display())))?;
        if !output.status.success() {
            return Err(RuntimeFailure(format!(
                "docker {} exited with {:?}: {}",
                args.first().map(String::as_str).unwrap_or_default(),
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn run_args(descriptor: &DeploymentDescriptor) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".into(),
            "--name".into(),
            descriptor.container_name.clone(),
            "--hostname".into(),
            descriptor.container_name.clone(),
            "-w".into(),
            descriptor.working_dir.clone(),
        ];
        for network in &descriptor.networks {
            args.extend(["--network".into(), network.clone()]);
        }
        for (key, value) in &descriptor.labels {
            args.extend(["--label".into(), format!("{key}={value}")]);
        }
        for (key, value) in &descriptor.environment {
            args.extend(["-e".into(), format!("{key}={value}")]);
        }
        for volume in &descriptor.volumes {
            args.extend(["-v".into(), volume.clone()]);
        }
        for port in &descriptor.ports {
            args.extend(["-p".into(), port.clone()]);
        }
        args.push(descriptor.image.clone());
        args.extend(descriptor.command.split_whitespace().map(str::to_string));
        args
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn launch(&self, descriptor: &DeploymentDescriptor) -> Result<NodeHandle, RuntimeFailure> {
        let endpoint = descriptor
            .endpoint
            .clone()
            .ok_or_else(|| RuntimeFailure("descriptor has no endpoint".into()))?;
        let inspect = self
            .docker(&[
                "inspect".into(),
                "-f".into(),
                "{{.Id}} {{.State.Running}}".into(),
                descriptor.container_name.clone(),
            ])
            .await;
        let id = match inspect.as_deref().map(|out| out.split_once(' ')) {
            Ok(Some((id, "true"))) => id.to_string(),
            _ => self.docker(&Self::run_args(descriptor)).await?,
        };
        Ok(NodeHandle {
            id,
            node: descriptor.container_name.clone(),
            msp_id: descriptor.msp_id.clone(),
            endpoint,
        })
    }

    async fn ping(&self, handle: &NodeHandle) -> Health {
        let addr = format!("{}:{}", self.probe_host, handle.endpoint.port);
        match time::timeout(self.probe_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(_)) => Health::Healthy,
            Ok(Err(err)) => Health::Unhealthy(format!("{addr}: {err}")),
            Err(_) => Health::Unhealthy(format!("{addr}: probe timed out")),
        }
    }

    async fn stop(&self, handle: &NodeHandle) -> Result<(), RuntimeFailure> {
        self.docker(&["stop".into(), handle.node.clone()]).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimNetwork, SimRuntime};

    fn bundle(root: &str) -> TrustBundle {
        TrustBundle {
            participant: "peer1.org1".into(),
            msp_id: "Org1MSP".into(),
            root: PathBuf::from(root),
            msp_dir: PathBuf::from(root).join("msp"),
            tls_dir: Some(PathBuf::from(root).join("tls")),
            fingerprint: "00".into(),
        }
    }

    fn spec() -> NodeSpec {
        let mut spec = NodeSpec::new("peer1", "org1", "Org1MSP", 8051);
        spec.bootstrap_peer = Some(Endpoint::new("peer0.org1.example.com", 7051));
        spec
    }

    #[test]
    fn descriptor_carries_identity_and_endpoints() {
        let descriptor =
            DeploymentDescriptor::for_node(&spec(), &bundle("/trust/peer1.org1"), &DeploymentSettings::default());
        assert_eq!(descriptor.container_name, "peer1.org1.example.com");
        assert_eq!(descriptor.environment["CORE_PEER_LOCALMSPID"], "Org1MSP");
        assert_eq!(
            descriptor.environment["CORE_PEER_ADDRESS"],
            "peer1.org1.example.com:8051"
        );
        assert_eq!(
            descriptor.environment["CORE_PEER_CHAINCODEADDRESS"],
            "peer1.org1.example.com:8052"
        );
        assert_eq!(
            descriptor.environment["CORE_PEER_GOSSIP_BOOTSTRAP"],
            "peer0.org1.example.com:7051"
        );
        assert_eq!(descriptor.volumes[0], "/trust/peer1.org1:/etc/hyperledger/fabric");
        assert_eq!(descriptor.ports, vec!["8051:8051"]);
    }

    #[test]
    fn compose_fragment_lists_service_and_volume() {
        let descriptor =
            DeploymentDescriptor::for_node(&spec(), &bundle("/trust/peer1.org1"), &DeploymentSettings::default());
        let yaml = descriptor.to_compose_yaml().unwrap();
        let parsed: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        let service = &parsed["services"]["peer1.org1.example.com"];
        assert_eq!(service["command"], serde_yaml::Value::from("peer node start"));
        let env = service["environment"].as_sequence().unwrap();
        assert!(env.contains(&serde_yaml::Value::from("CORE_PEER_ID=peer1.org1.example.com")));
        assert!(parsed["volumes"]
            .as_mapping()
            .unwrap()
            .contains_key(&serde_yaml::Value::from("peer1.org1.example.com")));
    }

    #[test]
    fn docker_run_arguments_follow_descriptor() {
        let descriptor =
            DeploymentDescriptor::for_node(&spec(), &bundle("/trust/peer1.org1"), &DeploymentSettings::default());
        let args = DockerRuntime::run_args(&descriptor);
        assert_eq!(&args[..4], ["run", "-d", "--name", "peer1.org1.example.com"]);
        assert!(args.windows(2).any(|w| w[0] == "-e" && w[1] == "CORE_PEER_LOCALMSPID=Org1MSP"));
        assert_eq!(&args[args.len() - 4..], ["hyperledger/fabric-peer:latest", "peer", "node", "start"]);
    }

    #[tokio::test]
    async fn bootstrap_polls_until_healthy_then_joins_once() {
        let net = SimNetwork::bootstrap("example.com", "mychannel", &["org1", "org2"]);
        let runtime = Arc::new(SimRuntime::healthy_after(3));
        let manager = NodeLifecycleManager::new(runtime.clone(), net.orderer.clone(), DeploymentSettings::default())
            .with_timeouts(Duration::from_secs(2), Duration::from_millis(1), Duration::from_secs(1));
        let spec = spec();
        let handle = manager
            .bootstrap(&spec.participant(), &spec, &bundle("/trust/peer1.org1"))
            .await
            .unwrap();
        assert_eq!(runtime.pings(&handle.node), 3);

        let block = manager.committed_block("mychannel").await.unwrap();
        manager.join(&handle, "mychannel", &block).await.unwrap();
        manager.join(&handle, "mychannel", &block).await.unwrap();
        assert!(net.orderer.has_joined("peer1.org1.example.com", "mychannel"));
    }

    #[tokio::test]
    async fn unhealthy_node_times_out() {
        let net = SimNetwork::bootstrap("example.com", "mychannel", &["org1"]);
        let manager = NodeLifecycleManager::new(
            Arc::new(SimRuntime::never_healthy()),
            net.orderer.clone(),
            DeploymentSettings::default(),
        )
        .with_timeouts(Duration::from_millis(30), Duration::from_millis(5), Duration::from_secs(1));
        let spec = spec();
        let err = manager
            .bootstrap(&spec.participant(), &spec, &bundle("/trust/peer1.org1"))
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::StartupTimeout { .. }));
    }

    struct SilentRuntime(SimRuntime);

    #[async_trait]
    impl ContainerRuntime for SilentRuntime {
        async fn launch(&self, descriptor: &DeploymentDescriptor) -> Result<NodeHandle, RuntimeFailure> {
            self.0.launch(descriptor).await
        }

        async fn ping(&self, _handle: &NodeHandle) -> Health {
            futures::future::pending().await
        }

        async fn stop(&self, handle: &NodeHandle) -> Result<(), RuntimeFailure> {
            self.0.stop(handle).await
        }
    }

    #[tokio::test]
    async fn unanswered_ping_counts_against_health_timeout() {
        let net = SimNetwork::bootstrap("example.com", "mychannel", &["org1"]);
        let manager = NodeLifecycleManager::new(
            Arc::new(SilentRuntime(SimRuntime::healthy_after(1))),
            net.orderer.clone(),
            DeploymentSettings::default(),
        )
        .with_timeouts(Duration::from_millis(50), Duration::from_millis(5), Duration::from_secs(1));
        let spec = spec();
        let outcome = time::timeout(
            Duration::from_secs(2),
            manager.bootstrap(&spec.participant(), &spec, &bundle("/trust/peer1.org1")),
        )
        .await
        .expect("bootstrap must not outlive its health timeout");
        assert!(matches!(outcome, Err(NodeError::StartupTimeout { .. })), "{outcome:?}");
    }

    #[tokio::test]
    async fn foreign_bundle_is_refused() {
        let net = SimNetwork::bootstrap("example.com", "mychannel", &["org1"]);
        let manager = NodeLifecycleManager::new(
            Arc::new(SimRuntime::healthy_after(1)),
            net.orderer.clone(),
            DeploymentSettings::default(),
        );
        let mut other = bundle("/trust/peer2.org1");
        other.participant = "peer2.org1".into();
        let spec = spec();
        let err = manager
            .bootstrap(&spec.participant(), &spec, &other)
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::Launch { .. }));
    }
}
