use log::*;
use serde_json::Value;
use std::sync::Arc;

use crate::compose::{self, decode, parse_structured};
use crate::config::{ExecConfig, FundingConfig, Network, RetryConfig};
use crate::error::{Error, Result};
use crate::executor::{CommandExecutor, CommandSpec};
use crate::model::BlockchainInfo;
use crate::poller::{poll_until, retry};

/// The chain backend container and its CLI
pub struct ChainBackend {
    network: Network,
    exec: Arc<ExecConfig>,
    retry: RetryConfig,
    executor: Arc<dyn CommandExecutor>,
}

impl ChainBackend {
    pub fn new(
        network: Network,
        exec: Arc<ExecConfig>,
        retry: RetryConfig,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        Self { network, exec, retry, executor }
    }

    fn cli_command(&self, args: &[&str]) -> CommandSpec {
        compose::compose(&self.exec)
            .env("NETWORK", self.network.as_str())
            .args(["run", "--rm"])
            .arg(self.exec.chain_cli_service.as_str())
            .args(args.iter().copied())
    }

    async fn exec_once(&self, args: &[&str]) -> Result<Value> {
        let output = self.executor.run(&self.cli_command(args)).await?;
        parse_structured(&self.exec.chain_service, &args.join(" "), output)
    }

    /// Start the chain backend paying block rewards to `mining_address`,
    /// then wait until it answers.  The mining address is fixed for the life
    /// of the container.
    pub async fn start(&self, mining_address: &str) -> Result<BlockchainInfo> {
        if mining_address.is_empty() {
            return Err(Error::Validation("mining address is empty".to_string()));
        }
        let spec = compose::compose(&self.exec)
            .env("MINING_ADDRESS", mining_address)
            .env("NETWORK", self.network.as_str())
            .args(["up", "-d"])
            .arg(self.exec.chain_service.as_str());
        let output = self.executor.run(&spec).await?;
        if !output.success() {
            return Err(Error::StartFailed {
                node: self.exec.chain_service.clone(),
                stderr: output.stderr,
            });
        }
        info!("{} started, mining to {}", self.exec.chain_service, mining_address);
        poll_until(&self.retry.readiness, &self.exec.chain_service, |_| async move {
            let info: BlockchainInfo = decode(
                &self.exec.chain_service,
                "getblockchaininfo",
                self.exec_once(&["getblockchaininfo"]).await?,
            )?;
            Ok(Some(info))
        })
        .await
    }

    pub async fn blockchain_info(&self) -> Result<BlockchainInfo> {
        let what = format!("{}: getblockchaininfo", self.exec.chain_service);
        retry(&self.retry.command, &what, |_| async move {
            decode(
                &self.exec.chain_service,
                "getblockchaininfo",
                self.exec_once(&["getblockchaininfo"]).await?,
            )
        })
        .await
    }

    /// Mine `blocks` blocks.  Not retried: a partial failure would mine an
    /// unknown number of blocks.
    pub async fn mine(&self, blocks: u32) -> Result<()> {
        if blocks == 0 {
            return Ok(());
        }
        info!("mining {} blocks", blocks);
        let count = blocks.to_string();
        let command = format!("generate {}", blocks);
        let output = self.executor.run(&self.cli_command(&["generate", &count])).await?;
        if !output.success() {
            return Err(Error::CommandFailed {
                target: self.exec.chain_service.clone(),
                command,
                code: output.code,
                stderr: output.stderr,
            });
        }
        Ok(())
    }

    /// Whether the chain must be (re)initialized.  An existing chain is only
    /// reused if it is the expected network, has blocks, and the miner
    /// already holds a mature balance.
    pub fn is_fresh(
        &self,
        info: &BlockchainInfo,
        miner_balance: i64,
        funding: &FundingConfig,
    ) -> bool {
        let fresh = info.blocks == 0
            || info.chain != self.network.chain_name()
            || miner_balance < funding.mature_balance;
        debug!(
            "chain {} at {} blocks, miner balance {}: fresh={}",
            info.chain, info.blocks, miner_balance, fresh
        );
        fresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::CommandOutput;
    use crate::test_utils::ScriptedExecutor;
    use test_log::test;

    fn backend(executor: Arc<ScriptedExecutor>) -> ChainBackend {
        ChainBackend::new(
            Network::Simnet,
            Arc::new(ExecConfig::default()),
            RetryConfig::immediate(3),
            executor,
        )
    }

    #[test(tokio::test)]
    async fn start_passes_mining_address() {
        let executor = Arc::new(ScriptedExecutor::default());
        executor.push(CommandOutput::ok(""));
        executor.push(CommandOutput::failed(1, "connection refused"));
        executor.push(CommandOutput::ok("{\"chain\": \"simnet\", \"blocks\": 0}"));
        let chain = backend(executor.clone());
        let info = chain.start("rp2miner").await.unwrap();
        assert_eq!(info.chain, "simnet");

        let calls = executor.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].env.get("MINING_ADDRESS").map(String::as_str), Some("rp2miner"));
        assert_eq!(calls[0].to_string(), "docker-compose up -d btcd");
        assert_eq!(calls[2].to_string(), "docker-compose run --rm btcctl getblockchaininfo");
    }

    #[test(tokio::test)]
    async fn start_requires_address() {
        let executor = Arc::new(ScriptedExecutor::default());
        let chain = backend(executor.clone());
        assert!(matches!(chain.start("").await, Err(Error::Validation(_))));
        assert!(executor.calls().is_empty());
    }

    #[test(tokio::test)]
    async fn mine_issued_once() {
        let executor = Arc::new(ScriptedExecutor::default());
        executor.push(CommandOutput::failed(1, "rpc error"));
        let chain = backend(executor.clone());
        assert!(matches!(chain.mine(10).await, Err(Error::CommandFailed { .. })));
        assert_eq!(executor.calls().len(), 1);
        assert_eq!(executor.calls()[0].args.last().map(String::as_str), Some("10"));

        chain.mine(0).await.unwrap();
        assert_eq!(executor.calls().len(), 1);
    }

    #[test]
    fn freshness() {
        let chain = backend(Arc::new(ScriptedExecutor::default()));
        let funding = FundingConfig::default();
        let mature = funding.mature_balance;
        let info = |chain: &str, blocks| BlockchainInfo {
            chain: chain.to_string(),
            blocks,
            bestblockhash: String::new(),
        };
        assert!(chain.is_fresh(&info("simnet", 0), mature, &funding));
        assert!(chain.is_fresh(&info("regtest", 500), mature, &funding));
        assert!(chain.is_fresh(&info("simnet", 500), mature - 1, &funding));
        assert!(!chain.is_fresh(&info("simnet", 500), mature, &funding));
    }

    #[test]
    fn testnet_chain_name() {
        let chain = ChainBackend::new(
            Network::Testnet,
            Arc::new(ExecConfig::default()),
            RetryConfig::immediate(3),
            Arc::new(ScriptedExecutor::default()),
        );
        let funding = FundingConfig::default();
        let info = BlockchainInfo {
            chain: "testnet3".to_string(),
            blocks: 500,
            bestblockhash: String::new(),
        };
        assert!(!chain.is_fresh(&info, funding.mature_balance, &funding));
        let info = BlockchainInfo { chain: "testnet".to_string(), ..info };
        assert!(chain.is_fresh(&info, funding.mature_balance, &funding));
    }
}
