use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt::{self, Display, Formatter};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Chain environments a simnet can run against
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Simnet,
    Regtest,
    Testnet,
    Mainnet,
}

pub const NETWORK_NAMES: [&'static str; 4] = ["simnet", "regtest", "testnet", "mainnet"];

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Simnet => "simnet",
            Network::Regtest => "regtest",
            Network::Testnet => "testnet",
            Network::Mainnet => "mainnet",
        }
    }

    /// The `chain` field `getblockchaininfo` reports on this network
    pub fn chain_name(&self) -> &'static str {
        match self {
            Network::Testnet => "testnet3",
            other => other.as_str(),
        }
    }
}

impl Display for Network {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "simnet" => Ok(Network::Simnet),
            "regtest" => Ok(Network::Regtest),
            "testnet" => Ok(Network::Testnet),
            "mainnet" | "bitcoin" => Ok(Network::Mainnet),
            _ => Err(Error::Config(format!("unknown network {}", s))),
        }
    }
}

/// Retry schedule for one call site.
///
/// `max_attempts = None` (written as `0` in a config file) retries forever,
/// which reproduces the behavior of scripts that treat every node as
/// eventually reachable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    #[serde(with = "attempts")]
    pub max_attempts: Option<u32>,
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Some(10),
            initial_interval_ms: 250,
            max_interval_ms: 5_000,
            multiplier: 1.5,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: Option<u32>, initial: Duration, max: Duration) -> Self {
        Self {
            max_attempts,
            initial_interval_ms: initial.as_millis() as u64,
            max_interval_ms: max.as_millis() as u64,
            multiplier: 1.5,
        }
    }

    /// No delay between attempts
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            initial_interval_ms: 0,
            max_interval_ms: 0,
            multiplier: 1.0,
        }
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(false, |max| attempt >= max)
    }

    pub fn backoff(&self) -> backoff::ExponentialBackoff {
        backoff::ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(self.initial_interval_ms))
            .with_max_interval(Duration::from_millis(self.max_interval_ms))
            .with_multiplier(self.multiplier)
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None)
            .build()
    }

    fn validate(&self, name: &str) -> Result<()> {
        if self.multiplier < 1.0 {
            return Err(Error::Config(format!("retry.{}.multiplier must be at least 1", name)));
        }
        Ok(())
    }
}

mod attempts {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<u32>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(value.unwrap_or(0))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<u32>, D::Error> {
        let n = u32::deserialize(deserializer)?;
        Ok(if n == 0 { None } else { Some(n) })
    }
}

/// Retry policies, one per call site
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// is the node (or chain) up and answering
    pub readiness: RetryPolicy,
    /// transient failures of idempotent read commands
    pub command: RetryPolicy,
    /// waiting for a result to show up (addresses, confirmed balances)
    pub acquisition: RetryPolicy,
    /// waiting for peer and channel counts before asserting them; always bounded
    pub settle: RetryPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            readiness: RetryPolicy::new(
                Some(15),
                Duration::from_millis(500),
                Duration::from_secs(5),
            ),
            command: RetryPolicy::default(),
            acquisition: RetryPolicy::new(
                Some(30),
                Duration::from_secs(1),
                Duration::from_secs(5),
            ),
            settle: RetryPolicy::new(Some(20), Duration::from_secs(1), Duration::from_secs(5)),
        }
    }
}

impl RetryConfig {
    /// Every call site with the same immediate policy
    pub fn immediate(max_attempts: u32) -> Self {
        let policy = RetryPolicy::immediate(max_attempts);
        Self {
            readiness: policy.clone(),
            command: policy.clone(),
            acquisition: policy.clone(),
            settle: policy,
        }
    }
}

/// How commands reach the container runtime.
///
/// This is the only environment commands run with: the executor does not
/// inherit the parent process environment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecConfig {
    pub compose_program: String,
    pub compose_files: Vec<PathBuf>,
    pub project_dir: Option<PathBuf>,
    pub container_program: String,
    pub node_service: String,
    pub cli_service: String,
    pub chain_service: String,
    pub chain_cli_service: String,
    /// fixed variables added to every command
    pub env: BTreeMap<String, String>,
    /// variables copied from the process environment when the config is resolved
    pub passthrough: Vec<String>,
}

impl Default for ExecConfig {
    fn default() -> Self {
        let mut env = BTreeMap::new();
        env.insert("COMPOSE_INTERACTIVE_NO_CLI".to_string(), "true".to_string());
        Self {
            compose_program: "docker-compose".to_string(),
            compose_files: Vec::new(),
            project_dir: None,
            container_program: "docker".to_string(),
            node_service: "lnd_btc".to_string(),
            cli_service: "lncli".to_string(),
            chain_service: "btcd".to_string(),
            chain_cli_service: "btcctl".to_string(),
            env,
            passthrough: ["PATH", "HOME", "DOCKER_HOST", "DOCKER_CONFIG", "XDG_RUNTIME_DIR"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl ExecConfig {
    /// Snapshot the passthrough variables into `env`.  Called once, before
    /// any node handle is built.
    pub fn resolve_passthrough(&mut self) {
        for key in &self.passthrough {
            if self.env.contains_key(key) {
                continue;
            }
            if let Ok(value) = std::env::var(key) {
                self.env.insert(key.clone(), value);
            }
        }
    }
}

/// One node of the topology
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    pub rpc_port: u16,
    pub p2p_port: u16,
    #[serde(default)]
    pub light_client: bool,
    /// chain source for a light client, e.g. `btcd:18555`
    #[serde(default)]
    pub backend: Option<String>,
    /// overrides the data dir template
    #[serde(default)]
    pub data_dir: Option<String>,
}

impl NodeConfig {
    pub fn full(name: &str, rpc_port: u16, p2p_port: u16) -> Self {
        Self {
            name: name.to_string(),
            rpc_port,
            p2p_port,
            light_client: false,
            backend: None,
            data_dir: None,
        }
    }

    pub fn light(name: &str, rpc_port: u16, p2p_port: u16, backend: &str) -> Self {
        Self {
            light_client: true,
            backend: Some(backend.to_string()),
            ..Self::full(name, rpc_port, p2p_port)
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.contains(char::is_whitespace) {
            return Err(Error::Config(format!("invalid node name {:?}", self.name)));
        }
        if self.light_client && self.backend.as_deref().map_or(true, str::is_empty) {
            return Err(Error::Config(format!("light client {} needs a backend", self.name)));
        }
        Ok(())
    }
}

/// Amounts and block counts used while bringing the network up
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FundingConfig {
    /// funding amount is the miner's confirmed balance divided by this
    pub divisor: i64,
    pub channel_size: i64,
    pub push_amount: i64,
    /// blocks mined on a fresh chain, enough for coinbase maturity
    pub initial_blocks: u32,
    /// blocks mined to confirm funding transactions
    pub confirm_blocks: u32,
    /// blocks mined after opening channels, above the minimum channel depth
    pub channel_confirm_blocks: u32,
    /// confirmed miner balance above which an existing chain is reused
    pub mature_balance: i64,
}

impl Default for FundingConfig {
    fn default() -> Self {
        Self {
            divisor: 10,
            channel_size: 1_000_000,
            push_amount: 500_000,
            initial_blocks: 400,
            confirm_blocks: 1,
            channel_confirm_blocks: 10,
            mature_balance: 100_000_000 * 50 * 400,
        }
    }
}

/// Where node credentials are read from
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum CredentialSourceConfig {
    /// read through the container runtime
    Container,
    /// node data dirs are mounted on the host under `root/<name>`
    Host { root: PathBuf },
}

impl Default for CredentialSourceConfig {
    fn default() -> Self {
        CredentialSourceConfig::Container
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialConfig {
    pub output: PathBuf,
    pub source: CredentialSourceConfig,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            output: PathBuf::from("credentials.json"),
            source: CredentialSourceConfig::default(),
        }
    }
}

/// Optional per-node sidecar containers
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SidecarConfig {
    pub gatekeepers: bool,
    pub gatekeeper_service: String,
    pub gatekeeper_base_port: u16,
    pub monitors: bool,
    pub monitor_compose_files: Vec<PathBuf>,
    pub monitor_listen: u16,
    pub prometheus_listen: u16,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            gatekeepers: false,
            gatekeeper_service: "boltwall".to_string(),
            gatekeeper_base_port: 8000,
            monitors: false,
            monitor_compose_files: Vec::new(),
            monitor_listen: 8989,
            prometheus_listen: 9092,
        }
    }
}

/// Full bootstrap configuration.  The first node is the miner.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimnetConfig {
    pub network: Network,
    /// `{name}` is replaced by the node name
    pub data_dir_template: String,
    pub nodes: Vec<NodeConfig>,
    pub exec: ExecConfig,
    pub retry: RetryConfig,
    pub funding: FundingConfig,
    pub credentials: CredentialConfig,
    pub sidecars: SidecarConfig,
}

impl Default for SimnetConfig {
    fn default() -> Self {
        Self {
            network: Network::Simnet,
            data_dir_template: "/lnd-data/{name}".to_string(),
            nodes: vec![
                NodeConfig::full("alice", 10001, 9735),
                NodeConfig::light("bob", 10002, 9736, "btcd:18555"),
                NodeConfig::light("carol", 10003, 9737, "btcd:18555"),
            ],
            exec: ExecConfig::default(),
            retry: RetryConfig::default(),
            funding: FundingConfig::default(),
            credentials: CredentialConfig::default(),
            sidecars: SidecarConfig::default(),
        }
    }
}

impl SimnetConfig {
    pub fn from_toml(s: &str) -> Result<Self> {
        let config: SimnetConfig =
            toml::from_str(s).map_err(|e| Error::Config(format!("parse: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!("read {}: {}", path.as_ref().display(), e))
        })?;
        Self::from_toml(&contents)
    }

    pub fn data_dir(&self, node: &NodeConfig) -> String {
        node.data_dir
            .clone()
            .unwrap_or_else(|| self.data_dir_template.replace("{name}", &node.name))
    }

    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(Error::Config("at least one node (the miner) is required".to_string()));
        }
        let mut names = HashSet::new();
        let mut ports = HashSet::new();
        for node in &self.nodes {
            node.validate()?;
            if !names.insert(node.name.as_str()) {
                return Err(Error::Config(format!("duplicate node name {}", node.name)));
            }
            for port in [node.rpc_port, node.p2p_port] {
                if !ports.insert(port) {
                    return Err(Error::Config(format!("port {} used twice", port)));
                }
            }
        }
        let f = &self.funding;
        if f.divisor <= 0 {
            return Err(Error::Config("funding.divisor must be positive".to_string()));
        }
        if f.channel_size < 0 || f.push_amount < 0 || f.mature_balance < 0 {
            return Err(Error::Config("funding amounts must be non-negative".to_string()));
        }
        if f.push_amount > f.channel_size {
            return Err(Error::Config(
                "funding.push_amount exceeds funding.channel_size".to_string(),
            ));
        }
        self.retry.readiness.validate("readiness")?;
        self.retry.command.validate("command")?;
        self.retry.acquisition.validate("acquisition")?;
        self.retry.settle.validate("settle")?;
        if self.retry.settle.max_attempts.is_none() {
            return Err(Error::Config("retry.settle.max_attempts must be positive".to_string()));
        }
        Ok(())
    }
}
