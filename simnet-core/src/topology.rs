//! Brings up a miner and its light clients, wires them together and
//! reports what came up.

use futures::future::try_join_all;
use log::*;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use crate::chain::ChainBackend;
use crate::config::{ExecConfig, Network, SimnetConfig};
use crate::coordinator::Coordinator;
use crate::credentials::{self, CredentialDocument};
use crate::error::{Error, Result};
use crate::executor::CommandExecutor;
use crate::node::NodeHandle;
use crate::poller::poll_until;
use crate::sidecar::Sidecars;

/// The funding node followed by its clients
pub struct Topology {
    pub miner: NodeHandle,
    pub clients: Vec<NodeHandle>,
}

impl Topology {
    pub fn nodes(&self) -> Vec<&NodeHandle> {
        std::iter::once(&self.miner).chain(self.clients.iter()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&NodeHandle> {
        self.nodes().into_iter().find(|n| n.name() == name)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeSummary {
    pub name: String,
    pub identity_pubkey: String,
    pub rpc_port: u16,
    pub p2p_port: u16,
    pub light_client: bool,
    pub wallet_balance: i64,
    pub channel_balance: i64,
    pub peers: usize,
    pub channels: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NetworkSummary {
    pub network: Network,
    pub chain_height: u64,
    pub nodes: Vec<NodeSummary>,
    pub credentials: PathBuf,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gatekeepers: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub monitors: Vec<String>,
}

pub struct TopologyDriver {
    config: SimnetConfig,
    exec: Arc<ExecConfig>,
    executor: Arc<dyn CommandExecutor>,
    topology: Topology,
    chain: ChainBackend,
}

impl TopologyDriver {
    /// Validate the configuration and build handles for every node.  The
    /// first configured node is the miner.
    pub fn new(config: SimnetConfig, executor: Arc<dyn CommandExecutor>) -> Result<Self> {
        config.validate()?;
        let exec = Arc::new(config.exec.clone());
        let mut handles = config
            .nodes
            .iter()
            .map(|node| {
                NodeHandle::new(
                    node.clone(),
                    config.network,
                    config.data_dir(node),
                    exec.clone(),
                    config.retry.clone(),
                    executor.clone(),
                )
            })
            .collect::<Result<Vec<_>>>()?
            .into_iter();
        let miner = handles
            .next()
            .ok_or_else(|| Error::Config("at least one node (the miner) is required".to_string()))?;
        let clients: Vec<NodeHandle> = handles.collect();
        if miner.is_light_client() {
            return Err(Error::Config(format!("miner {} cannot be a light client", miner.name())));
        }
        let chain =
            ChainBackend::new(config.network, exec.clone(), config.retry.clone(), executor.clone());
        Ok(Self { config, exec, executor, topology: Topology { miner, clients }, chain })
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn chain(&self) -> &ChainBackend {
        &self.chain
    }

    pub fn config(&self) -> &SimnetConfig {
        &self.config
    }

    fn coordinator(&self) -> Coordinator<'_> {
        Coordinator::new(
            &self.topology.miner,
            &self.topology.clients,
            &self.chain,
            &self.config.funding,
            &self.config.retry,
        )
    }

    /// Start the miner, then the chain mining to it, and make sure the miner
    /// holds spendable coins
    async fn start_miner_and_chain(&self) -> Result<()> {
        let miner = &self.topology.miner;
        info!("starting miner {}", miner.name());
        miner.start().await?;
        let address = miner.get_address().await?;
        info!("starting chain backend");
        self.chain.start(&address).await?;

        let info = self.chain.blockchain_info().await?;
        let balance = miner.get_balance().await?.confirmed_balance;
        if !self.chain.is_fresh(&info, balance, &self.config.funding) {
            info!("reusing chain at height {}", info.blocks);
            return Ok(());
        }
        self.chain.mine(self.config.funding.initial_blocks).await?;
        let what = format!("{} mined balance", miner.name());
        let balance = poll_until(&self.config.retry.acquisition, &what, |_| async move {
            let balance = miner.try_get_balance().await?.confirmed_balance;
            Ok((balance > 0).then_some(balance))
        })
        .await?;
        info!("{} balance: {}", miner.name(), balance);
        Ok(())
    }

    /// Run the whole bring-up.  Every stage is skipped when its work is
    /// already done, so this can be rerun after a partial failure.
    pub async fn bootstrap(&self) -> Result<NetworkSummary> {
        info!("=== chain and miner ===");
        self.start_miner_and_chain().await?;

        info!("=== clients ===");
        for client in &self.topology.clients {
            client.start().await?;
        }

        let coordinator = self.coordinator();
        info!("=== funding ===");
        coordinator.fund_clients().await?;
        info!("=== peers ===");
        coordinator.connect_peers().await?;
        info!("=== channels ===");
        coordinator.open_channels().await?;

        info!("=== credentials ===");
        let document = self.export_credentials().await?;

        let sidecars =
            Sidecars::new(self.config.sidecars.clone(), self.exec.clone(), self.executor.clone());
        let nodes = self.topology.nodes();
        let gatekeepers = if self.config.sidecars.gatekeepers {
            info!("=== gatekeepers ===");
            sidecars.start_gatekeepers(&nodes, &document).await?
        } else {
            Vec::new()
        };
        let monitors = if self.config.sidecars.monitors {
            info!("=== monitors ===");
            sidecars.start_monitors(&nodes).await?
        } else {
            Vec::new()
        };

        let mut summary = self.summary().await?;
        summary.gatekeepers = gatekeepers;
        summary.monitors = monitors;
        info!("network is up: {} nodes at height {}", summary.nodes.len(), summary.chain_height);
        Ok(summary)
    }

    /// Read every node's credentials and write the credential document
    pub async fn export_credentials(&self) -> Result<CredentialDocument> {
        let source = credentials::source_from_config(
            &self.config.credentials.source,
            self.exec.clone(),
            self.executor.clone(),
        );
        let document = credentials::export(source.as_ref(), &self.topology.nodes()).await?;
        credentials::write_document(&self.config.credentials.output, &document).await?;
        Ok(document)
    }

    async fn node_summary(&self, node: &NodeHandle) -> Result<NodeSummary> {
        let (wallet, channel, peers, channels) = tokio::try_join!(
            node.get_balance(),
            node.channel_balance(),
            node.list_peers(),
            node.list_channels()
        )?;
        Ok(NodeSummary {
            name: node.name().to_string(),
            identity_pubkey: node.require_identity()?.to_string(),
            rpc_port: node.rpc_port(),
            p2p_port: node.p2p_port(),
            light_client: node.is_light_client(),
            wallet_balance: wallet.total_balance,
            channel_balance: channel.balance,
            peers: peers.len(),
            channels: channels.len(),
        })
    }

    /// Current state of every node and the chain
    pub async fn summary(&self) -> Result<NetworkSummary> {
        let nodes =
            try_join_all(self.topology.nodes().into_iter().map(|n| self.node_summary(n))).await?;
        let info = self.chain.blockchain_info().await?;
        Ok(NetworkSummary {
            network: self.config.network,
            chain_height: info.blocks,
            nodes,
            credentials: self.config.credentials.output.clone(),
            gatekeepers: Vec::new(),
            monitors: Vec::new(),
        })
    }
}
