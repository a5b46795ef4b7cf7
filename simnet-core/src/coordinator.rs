//! Funding, peering and channel opening across the node chain.
//!
//! Each stage first reads the state of every node and skips itself when
//! the work is already done, so a bootstrap can be rerun after a failure.

use futures::future::try_join_all;
use log::*;

use crate::chain::ChainBackend;
use crate::config::{FundingConfig, RetryConfig};
use crate::error::{Error, Result};
use crate::model::WalletBalance;
use crate::node::{ChannelPeer, NodeHandle};
use crate::poller::poll_until;

/// A channel to open, from `source` to `target`
pub struct ChannelIntent<'a> {
    pub source: &'a NodeHandle,
    pub target: &'a NodeHandle,
    pub local_amount: i64,
    pub push_amount: i64,
}

/// Drives the bring-up stages for a miner followed by its clients
pub struct Coordinator<'a> {
    miner: &'a NodeHandle,
    clients: &'a [NodeHandle],
    chain: &'a ChainBackend,
    funding: &'a FundingConfig,
    retry: &'a RetryConfig,
}

impl<'a> Coordinator<'a> {
    pub fn new(
        miner: &'a NodeHandle,
        clients: &'a [NodeHandle],
        chain: &'a ChainBackend,
        funding: &'a FundingConfig,
        retry: &'a RetryConfig,
    ) -> Self {
        Self { miner, clients, chain, funding, retry }
    }

    /// Miner first, then the clients in order
    pub fn nodes(&self) -> Vec<&'a NodeHandle> {
        std::iter::once(self.miner).chain(self.clients.iter()).collect()
    }

    /// Peer count each node must report once node i is connected to node i+1
    pub fn expected_peers(&self) -> Vec<usize> {
        let n = self.clients.len() + 1;
        (0..n).map(|i| usize::from(i > 0) + usize::from(i + 1 < n)).collect()
    }

    /// One channel per adjacent pair of the chain
    pub fn channel_intents(&self) -> Vec<ChannelIntent<'a>> {
        self.nodes()
            .windows(2)
            .map(|pair| ChannelIntent {
                source: pair[0],
                target: pair[1],
                local_amount: self.funding.channel_size,
                push_amount: self.funding.push_amount,
            })
            .collect()
    }

    async fn client_balances(&self) -> Result<Vec<WalletBalance>> {
        try_join_all(self.clients.iter().map(|c| c.get_balance())).await
    }

    /// One read per node, not retried: callers poll
    async fn peer_counts(&self) -> Result<Vec<usize>> {
        let peers = try_join_all(self.nodes().into_iter().map(|n| n.try_list_peers())).await?;
        Ok(peers.iter().map(Vec::len).collect())
    }

    async fn channel_counts(&self) -> Result<Vec<usize>> {
        let channels =
            try_join_all(self.nodes().into_iter().map(|n| n.try_list_channels())).await?;
        Ok(channels.iter().map(Vec::len).collect())
    }

    /// Send a share of the miner's balance to every client without funds,
    /// mine, and wait for the payments to confirm.  Returns the number of
    /// transfers issued.
    ///
    /// Clients that already hold coins are left alone, so a rerun after a
    /// partial funding round tops up only the ones that were missed.
    pub async fn fund_clients(&self) -> Result<usize> {
        let balances = self.client_balances().await?;
        let unfunded: Vec<&NodeHandle> = self
            .clients
            .iter()
            .zip(balances.iter())
            .filter(|(_, b)| b.total_balance <= 0)
            .map(|(c, _)| c)
            .collect();
        if unfunded.is_empty() {
            info!("all clients funded, skipping funding");
            return Ok(0);
        }

        let miner_balance = self.miner.get_balance().await?.confirmed_balance;
        let amount = miner_balance / self.funding.divisor;
        if amount <= 0 {
            return Err(Error::InsufficientFunds {
                node: self.miner.name().to_string(),
                balance: miner_balance,
            });
        }

        for client in &unfunded {
            let address = client.get_address().await?;
            self.miner.send_coins(&address, amount).await?;
        }
        self.chain.mine(self.funding.confirm_blocks).await?;

        for client in &unfunded {
            let what = format!("{} confirmed balance", client.name());
            let balance = poll_until(&self.retry.acquisition, &what, |_| async move {
                let balance = client.try_get_balance().await?;
                Ok((balance.confirmed_balance > 0).then_some(balance.confirmed_balance))
            })
            .await?;
            info!("{} funded with {}", client.name(), balance);
        }
        Ok(unfunded.len())
    }

    /// Connect node i to node i+1 and check every node sees the expected
    /// number of peers.  Returns the number of connect commands issued.
    pub async fn connect_peers(&self) -> Result<usize> {
        let nodes = self.nodes();
        if nodes.len() < 2 {
            return Ok(0);
        }
        let peers = try_join_all(nodes.iter().map(|n| n.list_peers())).await?;
        if peers.iter().all(|p| !p.is_empty()) {
            info!("all nodes have peers, skipping connect");
            return Ok(0);
        }

        let mut issued = 0;
        for (i, pair) in nodes.windows(2).enumerate() {
            let (source, target) = (pair[0], pair[1]);
            let target_key = target.require_identity()?;
            if peers[i].iter().any(|p| p.pub_key == target_key) {
                debug!("{} already connected to {}", source.name(), target.name());
                continue;
            }
            source.connect_peer(target).await?;
            issued += 1;
        }

        let expected = self.expected_peers();
        let settled = poll_until(&self.retry.settle, "peer connections", |_| {
            let expected = &expected;
            async move {
                let counts = self.peer_counts().await?;
                Ok((&counts == expected).then_some(()))
            }
        })
        .await;
        match settled {
            Ok(()) => Ok(issued),
            Err(Error::ReadinessTimeout { .. }) => {
                let counts = self.peer_counts().await?;
                Err(Error::TopologyAssertionFailed(format!(
                    "peer counts {:?}, expected {:?}",
                    counts, expected
                )))
            }
            Err(e) => Err(e),
        }
    }

    /// Open one channel per adjacent pair, mine past the confirmation depth,
    /// and check every participant has a channel.  Returns the number of
    /// open commands issued.
    pub async fn open_channels(&self) -> Result<usize> {
        let nodes = self.nodes();
        if nodes.len() < 2 {
            return Ok(0);
        }
        let counts = try_join_all(nodes.iter().map(|n| n.list_channels())).await?;
        if counts.iter().all(|c| !c.is_empty()) {
            info!("all nodes have channels, skipping channel open");
            return Ok(0);
        }

        let mut issued = 0;
        for intent in self.channel_intents() {
            if self.has_channel(&intent).await? {
                debug!(
                    "{} already has a channel to {}",
                    intent.source.name(),
                    intent.target.name()
                );
                continue;
            }
            let target = ChannelPeer::Node(intent.target);
            let opened =
                intent.source.open_channel(target, intent.local_amount, intent.push_amount).await?;
            info!(
                "{} -> {} funding tx {}:{}",
                intent.source.name(),
                intent.target.name(),
                opened.funding_txid,
                opened.output_index
            );
            issued += 1;
        }
        self.chain.mine(self.funding.channel_confirm_blocks).await?;

        let settled = poll_until(&self.retry.settle, "channels", |_| async move {
            let counts = self.channel_counts().await?;
            Ok(counts.iter().all(|c| *c > 0).then_some(()))
        })
        .await;
        match settled {
            Ok(()) => Ok(issued),
            Err(Error::ReadinessTimeout { .. }) => {
                let counts = self.channel_counts().await?;
                Err(Error::TopologyAssertionFailed(format!(
                    "channel counts {:?}, every node needs at least one",
                    counts
                )))
            }
            Err(e) => Err(e),
        }
    }

    /// Whether the source already has an open or pending channel to the target
    async fn has_channel(&self, intent: &ChannelIntent<'_>) -> Result<bool> {
        let key = intent.target.require_identity()?;
        let (open, pending) =
            tokio::try_join!(intent.source.list_channels(), intent.source.pending_channels())?;
        Ok(open.iter().any(|c| c.remote_pubkey == key)
            || pending.iter().any(|c| c.remote_node_pub == key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExecConfig, Network, NodeConfig, RetryPolicy};
    use crate::executor::{CommandExecutor, CommandOutput};
    use crate::test_utils::FakeNetwork;
    use std::sync::Arc;
    use std::time::Duration;
    use test_log::test;

    struct Fixture {
        net: FakeNetwork,
        miner: NodeHandle,
        clients: Vec<NodeHandle>,
        chain: ChainBackend,
        funding: FundingConfig,
        retry: RetryConfig,
    }

    impl Fixture {
        async fn new(clients: usize) -> Fixture {
            let net = FakeNetwork::new();
            let executor: Arc<dyn CommandExecutor> = Arc::new(net.clone());
            let exec = Arc::new(ExecConfig::default());
            let retry = RetryConfig::immediate(5);
            let node = |config: NodeConfig| {
                let dir = format!("/lnd-data/{}", config.name);
                let (exec, retry, executor) = (exec.clone(), retry.clone(), executor.clone());
                NodeHandle::new(config, Network::Simnet, dir, exec, retry, executor).unwrap()
            };
            let miner = node(NodeConfig::full("alice", 10001, 9735));
            let clients: Vec<NodeHandle> = ["bob", "carol", "dave"]
                .iter()
                .take(clients)
                .enumerate()
                .map(|(i, name)| {
                    let i = i as u16 + 2;
                    node(NodeConfig::light(name, 10000 + i, 9734 + i, "btcd:18555"))
                })
                .collect();
            let chain =
                ChainBackend::new(Network::Simnet, exec.clone(), retry.clone(), executor.clone());
            miner.start().await.unwrap();
            let address = miner.get_address().await.unwrap();
            chain.start(&address).await.unwrap();
            chain.mine(400).await.unwrap();
            for client in &clients {
                client.start().await.unwrap();
            }
            Fixture { net, miner, clients, chain, funding: FundingConfig::default(), retry }
        }

        fn coordinator(&self) -> Coordinator<'_> {
            Coordinator::new(&self.miner, &self.clients, &self.chain, &self.funding, &self.retry)
        }
    }

    #[test(tokio::test)]
    async fn chain_shape() {
        let f = Fixture::new(3).await;
        let coordinator = f.coordinator();
        assert_eq!(coordinator.expected_peers(), vec![1, 2, 2, 1]);
        let intents = coordinator.channel_intents();
        let pairs: Vec<(&str, &str)> =
            intents.iter().map(|i| (i.source.name(), i.target.name())).collect();
        assert_eq!(pairs, vec![("alice", "bob"), ("bob", "carol"), ("carol", "dave")]);
        assert!(intents.iter().all(|i| i.local_amount == 1_000_000 && i.push_amount == 500_000));

        let f = Fixture::new(0).await;
        assert_eq!(f.coordinator().expected_peers(), vec![0]);
    }

    #[test(tokio::test)]
    async fn funding_is_idempotent() {
        let f = Fixture::new(2).await;
        let coordinator = f.coordinator();
        assert_eq!(coordinator.fund_clients().await.unwrap(), 2);
        assert_eq!(f.net.count_cli("sendcoins"), 2);
        for client in &f.clients {
            assert!(client.get_balance().await.unwrap().confirmed_balance > 0);
        }

        assert_eq!(coordinator.fund_clients().await.unwrap(), 0);
        assert_eq!(f.net.count_cli("sendcoins"), 2);
    }

    #[test(tokio::test)]
    async fn funding_only_tops_up_empty_clients() {
        let f = Fixture::new(2).await;
        f.net.set_balance("bob", 5000);
        assert_eq!(f.coordinator().fund_clients().await.unwrap(), 1);
        assert_eq!(f.net.count_cli("sendcoins"), 1);
    }

    #[test(tokio::test)]
    async fn funding_needs_miner_balance() {
        let f = Fixture::new(1).await;
        f.net.set_balance("alice", 5);
        assert!(matches!(
            f.coordinator().fund_clients().await,
            Err(Error::InsufficientFunds { balance: 5, .. })
        ));
        assert_eq!(f.net.count_cli("sendcoins"), 0);
    }

    #[test(tokio::test)]
    async fn peers_form_a_chain() {
        let f = Fixture::new(2).await;
        let coordinator = f.coordinator();
        assert_eq!(coordinator.connect_peers().await.unwrap(), 2);
        assert_eq!(f.miner.list_peers().await.unwrap().len(), 1);
        assert_eq!(f.clients[0].list_peers().await.unwrap().len(), 2);
        assert_eq!(f.clients[1].list_peers().await.unwrap().len(), 1);

        assert_eq!(coordinator.connect_peers().await.unwrap(), 0);
        assert_eq!(f.net.count_cli("connect"), 2);
    }

    #[test(tokio::test)]
    async fn unexpected_peer_fails_assertion() {
        let f = Fixture::new(2).await;
        // carol also talks to alice, so alice ends up with two peers
        f.net.add_peer("alice", "carol");
        match f.coordinator().connect_peers().await {
            Err(Error::TopologyAssertionFailed(msg)) => {
                assert!(msg.contains("[2, 2, 2]"), "{}", msg)
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test(tokio::test)]
    async fn peer_assertion_bounded_when_acquisition_is_not() {
        let mut f = Fixture::new(2).await;
        f.retry.acquisition.max_attempts = None;
        f.retry.settle = RetryPolicy::immediate(3);
        f.net.add_peer("alice", "carol");
        let before = f.net.count_cli("listpeers");
        let result =
            tokio::time::timeout(Duration::from_secs(10), f.coordinator().connect_peers()).await;
        match result {
            Ok(Err(Error::TopologyAssertionFailed(_))) => {}
            Ok(other) => panic!("unexpected {:?}", other),
            Err(_) => panic!("connect_peers did not give up"),
        }
        // initial read, three settle attempts and the final report, three nodes each
        assert_eq!(f.net.count_cli("listpeers") - before, 5 * 3);
    }

    #[test(tokio::test)]
    async fn confirmation_wait_reads_once_per_attempt() {
        let mut f = Fixture::new(1).await;
        f.retry.acquisition = RetryPolicy::immediate(2);
        f.net.inject(
            "bob",
            "walletbalance",
            CommandOutput::ok("{\"total_balance\": \"0\", \"confirmed_balance\": \"0\"}"),
        );
        for _ in 0..10 {
            f.net.inject("bob", "walletbalance", CommandOutput::failed(1, "wallet locked"));
        }
        let before = f.net.count_cli("walletbalance");
        match f.coordinator().fund_clients().await {
            Err(Error::ReadinessTimeout { what, attempts }) => {
                assert_eq!(what, "bob confirmed balance");
                assert_eq!(attempts, 2);
            }
            other => panic!("unexpected {:?}", other),
        }
        // bob's skip check, the miner's balance, then one read per attempt
        assert_eq!(f.net.count_cli("walletbalance") - before, 4);
    }

    #[test(tokio::test)]
    async fn channels_opened_once() {
        let f = Fixture::new(2).await;
        let coordinator = f.coordinator();
        coordinator.fund_clients().await.unwrap();
        coordinator.connect_peers().await.unwrap();
        assert_eq!(coordinator.open_channels().await.unwrap(), 2);
        for node in coordinator.nodes() {
            assert!(!node.list_channels().await.unwrap().is_empty());
        }

        assert_eq!(coordinator.open_channels().await.unwrap(), 0);
        assert_eq!(f.net.count_cli("openchannel"), 2);
    }

    #[test(tokio::test)]
    async fn pending_channel_not_reopened() {
        let f = Fixture::new(1).await;
        let coordinator = f.coordinator();
        coordinator.fund_clients().await.unwrap();
        coordinator.connect_peers().await.unwrap();
        // an open from a previous run that was never mined
        f.miner
            .open_channel(ChannelPeer::Node(&f.clients[0]), 1_000_000, 500_000)
            .await
            .unwrap();
        assert_eq!(coordinator.open_channels().await.unwrap(), 0);
        assert_eq!(f.net.count_cli("openchannel"), 1);
        assert!(!f.clients[0].list_channels().await.unwrap().is_empty());
    }

    #[test(tokio::test)]
    async fn single_node_has_nothing_to_connect() {
        let f = Fixture::new(0).await;
        let coordinator = f.coordinator();
        assert_eq!(coordinator.fund_clients().await.unwrap(), 0);
        assert_eq!(coordinator.connect_peers().await.unwrap(), 0);
        assert_eq!(coordinator.open_channels().await.unwrap(), 0);
        assert!(coordinator.channel_intents().is_empty());
    }
}
