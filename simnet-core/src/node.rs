use log::*;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use crate::compose::{self, decode, parse_structured};
use crate::config::{ExecConfig, Network, NodeConfig, RetryConfig};
use crate::error::{Error, Result};
use crate::executor::{CommandExecutor, CommandSpec};
use crate::model::{
    ChannelBalance, Channel, GetInfo, ListChannels, ListPeers, NewAddress, OpenChannel, Peer,
    PendingChannel, PendingChannels, SendCoins, WalletBalance,
};
use crate::poller::{poll_until, retry};

/// Where a channel should go
#[derive(Clone, Copy)]
pub enum ChannelPeer<'a> {
    Node(&'a NodeHandle),
    Identity(&'a str),
}

impl<'a> ChannelPeer<'a> {
    fn identity(&self) -> Result<&'a str> {
        let key = match *self {
            ChannelPeer::Node(node) => node.identity_key().ok_or_else(|| {
                Error::Validation(format!(
                    "{} has no identity key to open a channel to",
                    node.name()
                ))
            })?,
            ChannelPeer::Identity(key) => key,
        };
        if key.is_empty() {
            return Err(Error::Validation("channel target identity is empty".to_string()));
        }
        Ok(key)
    }
}

/// One payment node of the network, driven through the node CLI
pub struct NodeHandle {
    config: NodeConfig,
    network: Network,
    data_dir: String,
    exec: Arc<ExecConfig>,
    retry: RetryConfig,
    executor: Arc<dyn CommandExecutor>,
    identity: OnceLock<String>,
}

impl NodeHandle {
    pub fn new(
        config: NodeConfig,
        network: Network,
        data_dir: String,
        exec: Arc<ExecConfig>,
        retry: RetryConfig,
        executor: Arc<dyn CommandExecutor>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, network, data_dir, exec, retry, executor, identity: OnceLock::new() })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn rpc_port(&self) -> u16 {
        self.config.rpc_port
    }

    pub fn p2p_port(&self) -> u16 {
        self.config.p2p_port
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn is_light_client(&self) -> bool {
        self.config.light_client
    }

    pub fn backend(&self) -> Option<&str> {
        self.config.backend.as_deref()
    }

    pub fn data_dir(&self) -> &str {
        &self.data_dir
    }

    /// `host:port` of the admin RPC interface, as seen from the container network
    pub fn rpc_server(&self) -> String {
        format!("{}:{}", self.name(), self.rpc_port())
    }

    pub fn p2p_address(&self) -> String {
        format!("{}:{}", self.name(), self.p2p_port())
    }

    /// Set once the node has answered a readiness check
    pub fn identity_key(&self) -> Option<&str> {
        self.identity.get().map(String::as_str)
    }

    pub fn require_identity(&self) -> Result<&str> {
        self.identity_key().ok_or_else(|| Error::MissingIdentity { node: self.name().to_string() })
    }

    fn set_identity(&self, key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(Error::Validation(format!("{} reported an empty identity", self.name())));
        }
        let current = self.identity.get_or_init(|| key.to_string());
        if current != key {
            return Err(Error::IdentityChanged {
                node: self.name().to_string(),
                old: current.clone(),
                new: key.to_string(),
            });
        }
        Ok(())
    }

    fn env(&self) -> BTreeMap<String, String> {
        let mut env = self.exec.env.clone();
        env.insert("NETWORK".to_string(), self.network.to_string());
        env.insert("TLSEXTRADOMAIN".to_string(), self.name().to_string());
        env
    }

    fn start_command(&self) -> CommandSpec {
        let mut spec = compose::compose(&self.exec)
            .envs(&self.env())
            .args(["run", "-d"])
            .env_flag("LNDDIR", &self.data_dir)
            .env_flag("RPCLISTEN", self.rpc_port())
            .env_flag("NOSEEDBACKUP", true)
            .env_flag("TLSEXTRADOMAIN", self.name())
            .env_flag("LISTEN", self.p2p_port())
            .env_flag("NETWORK", self.network);
        if let (true, Some(backend)) = (self.is_light_client(), self.backend()) {
            spec = spec.env_flag("NEUTRINO", backend).env_flag("BACKEND", "neutrino");
        }
        spec.arg("-p")
            .arg(format!("{0}:{0}", self.rpc_port()))
            .arg("-p")
            .arg(format!("{0}:{0}", self.p2p_port()))
            .args(["--name", self.name()])
            .arg(self.exec.node_service.as_str())
    }

    fn cli_command(&self, args: &[&str]) -> CommandSpec {
        compose::compose(&self.exec)
            .envs(&self.env())
            .args(["run", "--rm"])
            .env_flag("LNDDIR", &self.data_dir)
            .env_flag("RPCSERVER", self.rpc_server())
            .env_flag("NETWORK", self.network)
            .arg(self.exec.cli_service.as_str())
            .args(args.iter().copied())
    }

    async fn launch(&self) -> Result<()> {
        let output = self.executor.run(&self.start_command()).await?;
        if output.success() {
            return Ok(());
        }
        if compose::is_conflict(&output.stderr) {
            return Err(Error::StartConflict { node: self.name().to_string() });
        }
        Err(Error::StartFailed { node: self.name().to_string(), stderr: output.stderr })
    }

    /// Start the node container and wait until it reports a version and an
    /// identity.  An existing container is reused.
    pub async fn start(&self) -> Result<()> {
        match self.launch().await {
            Ok(()) => info!("started {}", self.name()),
            Err(Error::StartConflict { node }) =>
                warn!("container for {} already exists, skipping startup", node),
            Err(e) => return Err(e),
        }

        info!("attempting connection with {}...", self.name());
        let info = poll_until(&self.retry.readiness, self.name(), |_| async move {
            let info: GetInfo = self.fetch_once(&["getinfo"]).await?;
            Ok(if info.version.is_empty() || info.identity_pubkey.is_empty() {
                None
            } else {
                Some(info)
            })
        })
        .await?;
        self.set_identity(&info.identity_pubkey)?;
        info!("{} pubkey: {}", self.name().to_uppercase(), info.identity_pubkey);
        Ok(())
    }

    /// One attempt, no retry
    async fn exec_once(&self, args: &[&str]) -> Result<Value> {
        let command = args.join(" ");
        let output = self.executor.run(&self.cli_command(args)).await?;
        parse_structured(self.name(), &command, output)
    }

    /// Run an idempotent administrative command, retrying transient failures
    pub async fn run_command(&self, args: &[&str]) -> Result<Value> {
        let what = format!("{}: {}", self.name(), args.join(" "));
        retry(&self.retry.command, &what, |_| self.exec_once(args)).await
    }

    /// Run an idempotent command and decode its response, retrying until it
    /// has the expected shape
    async fn query<T: DeserializeOwned>(&self, args: &[&str]) -> Result<T> {
        let what = format!("{}: {}", self.name(), args.join(" "));
        retry(&self.retry.command, &what, |_| self.fetch_once(args)).await
    }

    /// One decoded attempt, for callers that run their own polling loop
    async fn fetch_once<T: DeserializeOwned>(&self, args: &[&str]) -> Result<T> {
        decode(self.name(), &args.join(" "), self.exec_once(args).await?)
    }

    /// Run a state-changing command exactly once
    async fn submit<T: DeserializeOwned>(&self, args: &[&str]) -> Result<T> {
        let command = args.join(" ");
        debug!("{}: {}", self.name(), command);
        decode(self.name(), &command, self.exec_once(args).await?)
    }

    pub async fn get_info(&self) -> Result<GetInfo> {
        self.query(&["getinfo"]).await
    }

    /// A fresh nested-segwit address of the node's wallet
    pub async fn get_address(&self) -> Result<String> {
        let what = format!("address from {}", self.name());
        retry(&self.retry.acquisition, &what, |_| async move {
            let response: NewAddress = self.fetch_once(&["newaddress", "np2wkh"]).await?;
            if response.address.is_empty() {
                return Err(Error::EmptyResponse {
                    target: self.name().to_string(),
                    command: "newaddress np2wkh".to_string(),
                });
            }
            Ok(response.address)
        })
        .await
    }

    pub async fn get_balance(&self) -> Result<WalletBalance> {
        self.query(&["walletbalance"]).await
    }

    /// Single attempt of [`Self::get_balance`]
    pub async fn try_get_balance(&self) -> Result<WalletBalance> {
        self.fetch_once(&["walletbalance"]).await
    }

    pub async fn channel_balance(&self) -> Result<ChannelBalance> {
        self.query(&["channelbalance"]).await
    }

    pub async fn list_peers(&self) -> Result<Vec<Peer>> {
        Ok(self.query::<ListPeers>(&["listpeers"]).await?.peers)
    }

    /// Single attempt of [`Self::list_peers`]
    pub async fn try_list_peers(&self) -> Result<Vec<Peer>> {
        Ok(self.fetch_once::<ListPeers>(&["listpeers"]).await?.peers)
    }

    pub async fn list_channels(&self) -> Result<Vec<Channel>> {
        Ok(self.query::<ListChannels>(&["listchannels"]).await?.channels)
    }

    /// Single attempt of [`Self::list_channels`]
    pub async fn try_list_channels(&self) -> Result<Vec<Channel>> {
        Ok(self.fetch_once::<ListChannels>(&["listchannels"]).await?.channels)
    }

    pub async fn pending_channels(&self) -> Result<Vec<PendingChannel>> {
        let pending: PendingChannels = self.query(&["pendingchannels"]).await?;
        Ok(pending.pending_open_channels.into_iter().map(|p| p.channel).collect())
    }

    /// Connect to `target` over its p2p address
    pub async fn connect_peer(&self, target: &NodeHandle) -> Result<()> {
        let key = target.require_identity()?;
        let address = format!("{}@{}", key, target.p2p_address());
        info!("connecting {} to {}", self.name(), target.name());
        let _: Value = self.submit(&["connect", &address]).await?;
        Ok(())
    }

    /// Open a channel funded with `local_amount`, pushing `push_amount` to the peer
    pub async fn open_channel(
        &self,
        target: ChannelPeer<'_>,
        local_amount: i64,
        push_amount: i64,
    ) -> Result<OpenChannel> {
        if local_amount < 0 {
            return Err(Error::Validation(format!(
                "local amount must be a non-negative integer, got {}",
                local_amount
            )));
        }
        if push_amount < 0 {
            return Err(Error::Validation(format!(
                "push amount must be a non-negative integer, got {}",
                push_amount
            )));
        }
        let key = target.identity()?;
        let local = local_amount.to_string();
        let push = push_amount.to_string();
        info!("{}: opening {} channel to {} (push {})", self.name(), local, key, push);
        self.submit(&["openchannel", key, &local, &push]).await
    }

    pub async fn send_coins(&self, address: &str, amount: i64) -> Result<SendCoins> {
        if amount <= 0 {
            return Err(Error::Validation(format!("send amount must be positive, got {}", amount)));
        }
        if address.is_empty() {
            return Err(Error::Validation("send address is empty".to_string()));
        }
        let addr = format!("--addr={}", address);
        let amt = format!("--amt={}", amount);
        info!("{}: sending {} to {}", self.name(), amount, address);
        self.submit(&["sendcoins", &addr, &amt]).await
    }
}
