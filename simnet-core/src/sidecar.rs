//! Optional per-node companion containers: a payment gatekeeper in front of
//! each node's RPC interface and a monitoring stack scraping it.

use log::*;
use std::sync::Arc;

use crate::compose;
use crate::config::{ExecConfig, SidecarConfig};
use crate::credentials::CredentialDocument;
use crate::error::{Error, Result};
use crate::executor::{CommandExecutor, CommandSpec};
use crate::node::NodeHandle;

pub struct Sidecars {
    config: SidecarConfig,
    exec: Arc<ExecConfig>,
    executor: Arc<dyn CommandExecutor>,
}

impl Sidecars {
    pub fn new(
        config: SidecarConfig,
        exec: Arc<ExecConfig>,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        Self { config, exec, executor }
    }

    fn gatekeeper_command(
        &self,
        node: &NodeHandle,
        port: u16,
        admin_macaroon: &str,
        cert: &str,
    ) -> CommandSpec {
        compose::compose(&self.exec)
            .args(["run", "-d"])
            .env_flag("BOLTWALL_PORT", port)
            .env_flag("LND_MACAROON", admin_macaroon)
            .env_flag("LND_TLS_CERT", cert)
            .env_flag("LND_SOCKET", node.rpc_server())
            .arg("-p")
            .arg(format!("{0}:{0}", port))
            .arg("--name")
            .arg(format!("{}-{}", node.name(), self.config.gatekeeper_service))
            .arg(self.config.gatekeeper_service.as_str())
    }

    fn monitor_command(&self, node: &NodeHandle) -> CommandSpec {
        let mut spec = CommandSpec::new(&self.exec.compose_program)
            .envs(&self.exec.env)
            .current_dir(self.exec.project_dir.clone())
            .env("LND_HOSTNAME", node.name())
            .env("MONITORLISTEN", self.config.monitor_listen.to_string())
            .env("PROMETHEUSLISTEN", self.config.prometheus_listen.to_string())
            .env("LND_DIR", node.data_dir())
            .env("LND_HOST", node.rpc_server())
            .env("NETWORK", node.network().as_str());
        for file in &self.config.monitor_compose_files {
            spec = spec.arg("-f").arg(file.to_string_lossy());
        }
        spec.arg("-p").arg(format!("{}-monitor", node.name())).args(["up", "-d"])
    }

    /// Start a gatekeeper for each node on consecutive ports.  Nodes without
    /// an admin macaroon are skipped.  Returns the names of the containers
    /// started.
    pub async fn start_gatekeepers(
        &self,
        nodes: &[&NodeHandle],
        credentials: &CredentialDocument,
    ) -> Result<Vec<String>> {
        let base = self.config.gatekeeper_base_port;
        let ports = (0..nodes.len())
            .map(|i| u16::try_from(i).ok().and_then(|i| base.checked_add(i)))
            .collect::<Option<Vec<u16>>>()
            .ok_or_else(|| {
                Error::Config(format!(
                    "sidecars.gatekeeper_base_port {} leaves no room for {} gatekeepers",
                    base,
                    nodes.len()
                ))
            })?;
        let mut started = Vec::new();
        for (node, port) in nodes.iter().zip(ports) {
            let record = match credentials.get(node.name()) {
                Some(record) => record,
                None => {
                    warn!("no credentials for {}, not starting a gatekeeper", node.name());
                    continue;
                }
            };
            let macaroon = match &record.admin_macaroon {
                Some(macaroon) => macaroon,
                None => {
                    warn!("{} has no admin macaroon, not starting a gatekeeper", node.name());
                    continue;
                }
            };
            let spec = self.gatekeeper_command(node, port, macaroon, &record.cert);
            let name = format!("{}-{}", node.name(), self.config.gatekeeper_service);
            let output = self.executor.run(&spec).await?;
            if !output.success() {
                if !compose::is_conflict(&output.stderr) {
                    return Err(Error::StartFailed { node: name, stderr: output.stderr });
                }
                warn!("{} already exists", name);
            }
            info!("{} listening on {}", name, port);
            started.push(name);
        }
        Ok(started)
    }

    /// Start a monitoring stack for each node, one compose project per node
    pub async fn start_monitors(&self, nodes: &[&NodeHandle]) -> Result<Vec<String>> {
        if self.config.monitor_compose_files.is_empty() {
            return Err(Error::Config("sidecars.monitor_compose_files is empty".to_string()));
        }
        let mut started = Vec::new();
        for node in nodes {
            let project = format!("{}-monitor", node.name());
            let output = self.executor.run(&self.monitor_command(node)).await?;
            if !output.success() {
                return Err(Error::StartFailed { node: project, stderr: output.stderr });
            }
            info!("started {}", project);
            started.push(project);
        }
        Ok(started)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Network, NodeConfig, RetryConfig};
    use crate::credentials::CredentialRecord;
    use crate::executor::CommandOutput;
    use crate::test_utils::ScriptedExecutor;
    use std::path::PathBuf;
    use test_log::test;

    fn handle(name: &str, rpc: u16, p2p: u16) -> NodeHandle {
        NodeHandle::new(
            NodeConfig::full(name, rpc, p2p),
            Network::Simnet,
            format!("/lnd-data/{}", name),
            Arc::new(ExecConfig::default()),
            RetryConfig::immediate(1),
            Arc::new(ScriptedExecutor::default()),
        )
        .unwrap()
    }

    fn sidecars(config: SidecarConfig, executor: Arc<ScriptedExecutor>) -> Sidecars {
        Sidecars::new(config, Arc::new(ExecConfig::default()), executor)
    }

    #[test(tokio::test)]
    async fn gatekeepers_on_consecutive_ports() {
        let executor = Arc::new(ScriptedExecutor::default());
        executor.push(CommandOutput::ok(""));
        executor.push(CommandOutput::failed(
            1,
            "Cannot create container for service boltwall: Conflict",
        ));
        let sidecars = sidecars(SidecarConfig::default(), executor.clone());
        let alice = handle("alice", 10001, 9735);
        let bob = handle("bob", 10002, 9736);
        let carol = handle("carol", 10003, 9737);

        let mut credentials = CredentialDocument::new();
        let record = |admin: Option<&str>| CredentialRecord {
            cert: "Y2VydA==".into(),
            admin_macaroon: admin.map(str::to_string),
            ..Default::default()
        };
        credentials.insert("alice".into(), record(Some("YWRtaW4=")));
        credentials.insert("bob".into(), record(None));
        credentials.insert("carol".into(), record(Some("YWRtaW4=")));

        let started =
            sidecars.start_gatekeepers(&[&alice, &bob, &carol], &credentials).await.unwrap();
        assert_eq!(started, vec!["alice-boltwall", "carol-boltwall"]);

        let calls = executor.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].env_arg("BOLTWALL_PORT"), Some("8000"));
        assert_eq!(calls[0].env_arg("LND_SOCKET"), Some("alice:10001"));
        assert_eq!(calls[0].env_arg("LND_MACAROON"), Some("YWRtaW4="));
        assert_eq!(calls[1].env_arg("BOLTWALL_PORT"), Some("8002"));
        assert!(calls[1].to_string().ends_with("-p 8002:8002 --name carol-boltwall boltwall"));
    }

    #[test(tokio::test)]
    async fn gatekeeper_ports_must_fit() {
        let executor = Arc::new(ScriptedExecutor::default());
        let config = SidecarConfig { gatekeeper_base_port: u16::MAX, ..Default::default() };
        let sidecars = sidecars(config, executor.clone());
        let (alice, bob) = (handle("alice", 10001, 9735), handle("bob", 10002, 9736));
        let mut credentials = CredentialDocument::new();
        for name in ["alice", "bob"] {
            let record = CredentialRecord {
                cert: "Y2VydA==".into(),
                admin_macaroon: Some("YWRtaW4=".into()),
                ..Default::default()
            };
            credentials.insert(name.into(), record);
        }
        let result = sidecars.start_gatekeepers(&[&alice, &bob], &credentials).await;
        assert!(matches!(result, Err(Error::Config(_))));
        assert!(executor.calls().is_empty());

        // a single gatekeeper still fits on the last port
        let started = sidecars.start_gatekeepers(&[&alice], &credentials).await.unwrap();
        assert_eq!(started, vec!["alice-boltwall"]);
        assert_eq!(executor.calls()[0].env_arg("BOLTWALL_PORT"), Some("65535"));
    }

    #[test(tokio::test)]
    async fn monitor_per_node_project() {
        let executor = Arc::new(ScriptedExecutor::default());
        executor.push(CommandOutput::ok(""));
        let config = SidecarConfig {
            monitors: true,
            monitor_compose_files: vec![PathBuf::from("monitor.yml"), PathBuf::from("lndmon.yml")],
            ..Default::default()
        };
        let sidecars = sidecars(config, executor.clone());
        let alice = handle("alice", 10001, 9735);
        assert_eq!(sidecars.start_monitors(&[&alice]).await.unwrap(), vec!["alice-monitor"]);

        let call = &executor.calls()[0];
        assert_eq!(
            call.to_string(),
            "docker-compose -f monitor.yml -f lndmon.yml -p alice-monitor up -d"
        );
        assert_eq!(call.env.get("LND_HOST").map(String::as_str), Some("alice:10001"));
        assert_eq!(call.env.get("LND_DIR").map(String::as_str), Some("/lnd-data/alice"));
        assert_eq!(call.env.get("MONITORLISTEN").map(String::as_str), Some("8989"));
    }

    #[test(tokio::test)]
    async fn monitors_need_compose_files() {
        let executor = Arc::new(ScriptedExecutor::default());
        let sidecars = sidecars(SidecarConfig::default(), executor.clone());
        let alice = handle("alice", 10001, 9735);
        assert!(matches!(sidecars.start_monitors(&[&alice]).await, Err(Error::Config(_))));
        assert!(executor.calls().is_empty());
    }
}
