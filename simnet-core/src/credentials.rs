//! Export of node TLS certificates and macaroons.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use log::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::compose;
use crate::config::{CredentialSourceConfig, ExecConfig};
use crate::error::{Error, Result};
use crate::executor::CommandExecutor;
use crate::node::NodeHandle;

pub const CERT_FILE: &str = "tls.cert";

/// Scopes of the macaroons a node may have, in document order
pub const MACAROON_SCOPES: [&str; 3] = ["admin", "readonly", "invoice"];

/// Path of a scoped macaroon, relative to the node's data directory
pub fn macaroon_path(node: &NodeHandle, scope: &str) -> String {
    format!("data/chain/bitcoin/{}/{}.macaroon", node.network(), scope)
}

/// Credentials of one node, base64 encoded.  Missing macaroons are left out
/// of the serialized record.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialRecord {
    pub cert: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_macaroon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readonly_macaroon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoice_macaroon: Option<String>,
}

impl CredentialRecord {
    fn set_macaroon(&mut self, scope: &str, value: String) {
        match scope {
            "admin" => self.admin_macaroon = Some(value),
            "readonly" => self.readonly_macaroon = Some(value),
            "invoice" => self.invoice_macaroon = Some(value),
            _ => warn!("ignoring unknown macaroon scope {}", scope),
        }
    }
}

/// Node name to credentials
pub type CredentialDocument = BTreeMap<String, CredentialRecord>;

/// Reads files out of a node's data directory
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Contents of `relative` under the node's data directory, or `None` if
    /// the file does not exist
    async fn read(&self, node: &NodeHandle, relative: &str) -> Result<Option<Vec<u8>>>;
}

/// Node data directories mounted on the host at `root/<name>`
pub struct HostDirSource {
    root: PathBuf,
}

impl HostDirSource {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl CredentialSource for HostDirSource {
    async fn read(&self, node: &NodeHandle, relative: &str) -> Result<Option<Vec<u8>>> {
        let path = self.root.join(node.name()).join(relative);
        match tokio::fs::read(&path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(Error::CredentialIo { path: path.display().to_string(), source }),
        }
    }
}

/// Reads through the container runtime, from inside the node's container
pub struct ContainerSource {
    exec: Arc<ExecConfig>,
    executor: Arc<dyn CommandExecutor>,
}

impl ContainerSource {
    pub fn new(exec: Arc<ExecConfig>, executor: Arc<dyn CommandExecutor>) -> Self {
        Self { exec, executor }
    }
}

#[async_trait]
impl CredentialSource for ContainerSource {
    async fn read(&self, node: &NodeHandle, relative: &str) -> Result<Option<Vec<u8>>> {
        let path = format!("{}/{}", node.data_dir().trim_end_matches('/'), relative);
        let spec = compose::container(&self.exec).args(["exec", node.name(), "cat", path.as_str()]);
        let output = self.executor.run(&spec).await?;
        if output.success() {
            return Ok(Some(output.stdout));
        }
        if output.stderr.contains("No such file") {
            return Ok(None);
        }
        Err(Error::CredentialIo {
            path,
            source: io::Error::new(io::ErrorKind::Other, output.stderr.trim().to_string()),
        })
    }
}

/// Build the credential source named by the configuration
pub fn source_from_config(
    config: &CredentialSourceConfig,
    exec: Arc<ExecConfig>,
    executor: Arc<dyn CommandExecutor>,
) -> Box<dyn CredentialSource> {
    match config {
        CredentialSourceConfig::Container => Box::new(ContainerSource::new(exec, executor)),
        CredentialSourceConfig::Host { root } => Box::new(HostDirSource::new(root.clone())),
    }
}

/// Read the credentials of one node.  The certificate is required.
pub async fn read_record(
    source: &dyn CredentialSource,
    node: &NodeHandle,
) -> Result<CredentialRecord> {
    let cert = source.read(node, CERT_FILE).await?.ok_or_else(|| Error::MissingCredential {
        node: node.name().to_string(),
        path: CERT_FILE.to_string(),
    })?;
    let mut record = CredentialRecord { cert: STANDARD.encode(cert), ..Default::default() };
    for scope in MACAROON_SCOPES {
        let path = macaroon_path(node, scope);
        match source.read(node, &path).await? {
            Some(contents) => record.set_macaroon(scope, STANDARD.encode(contents)),
            None => debug!("{}: no {} macaroon", node.name(), scope),
        }
    }
    Ok(record)
}

/// Read the credentials of every node, one node at a time
pub async fn export(
    source: &dyn CredentialSource,
    nodes: &[&NodeHandle],
) -> Result<CredentialDocument> {
    let mut document = CredentialDocument::new();
    for node in nodes {
        let record = read_record(source, node).await?;
        document.insert(node.name().to_string(), record);
    }
    Ok(document)
}

/// Write the document, replacing any previous one
pub async fn write_document(path: &Path, document: &CredentialDocument) -> Result<()> {
    let json = serde_json::to_string_pretty(document)?;
    tokio::fs::write(path, json)
        .await
        .map_err(|source| Error::CredentialIo { path: path.display().to_string(), source })?;
    info!("wrote credentials for {} nodes to {}", document.len(), path.display());
    Ok(())
}

pub async fn read_document(path: &Path) -> Result<CredentialDocument> {
    let json = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| Error::CredentialIo { path: path.display().to_string(), source })?;
    Ok(serde_json::from_str(&json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Network, NodeConfig, RetryConfig};
    use crate::test_utils::{FakeNetwork, ScriptedExecutor};
    use serde_json::json;
    use test_log::test;

    fn handle(name: &str, port: u16) -> NodeHandle {
        NodeHandle::new(
            NodeConfig::full(name, 10000 + port, 9700 + port),
            Network::Simnet,
            format!("/lnd-data/{}", name),
            Arc::new(ExecConfig::default()),
            RetryConfig::immediate(3),
            Arc::new(ScriptedExecutor::default()),
        )
        .unwrap()
    }

    fn write(root: &Path, node: &str, relative: &str, contents: &[u8]) {
        let path = root.join(node).join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    #[test(tokio::test)]
    async fn missing_macaroon_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let alice = handle("alice", 1);
        let bob = handle("bob", 2);
        write(dir.path(), "alice", "tls.cert", b"alice-cert");
        write(dir.path(), "alice", "data/chain/bitcoin/simnet/admin.macaroon", b"alice-admin");
        write(dir.path(), "alice", "data/chain/bitcoin/simnet/readonly.macaroon", b"alice-ro");
        write(dir.path(), "bob", "tls.cert", b"bob-cert");
        write(dir.path(), "bob", "data/chain/bitcoin/simnet/admin.macaroon", b"bob-admin");
        write(dir.path(), "bob", "data/chain/bitcoin/simnet/readonly.macaroon", b"bob-ro");
        write(dir.path(), "bob", "data/chain/bitcoin/simnet/invoice.macaroon", b"bob-inv");

        let source = HostDirSource::new(dir.path().to_path_buf());
        let document = export(&source, &[&alice, &bob]).await.unwrap();

        let alice_record = &document["alice"];
        assert_eq!(alice_record.cert, STANDARD.encode("alice-cert"));
        assert_eq!(alice_record.invoice_macaroon, None);
        assert_eq!(document["bob"].invoice_macaroon, Some(STANDARD.encode("bob-inv")));

        let value = serde_json::to_value(&document).unwrap();
        assert_eq!(
            value["alice"],
            json!({
                "cert": STANDARD.encode("alice-cert"),
                "adminMacaroon": STANDARD.encode("alice-admin"),
                "readonlyMacaroon": STANDARD.encode("alice-ro"),
            })
        );
        assert!(value["alice"].get("invoiceMacaroon").is_none());
    }

    #[test(tokio::test)]
    async fn missing_cert_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = HostDirSource::new(dir.path().to_path_buf());
        let result = export(&source, &[&handle("alice", 1)]).await;
        assert!(matches!(result, Err(Error::MissingCredential { .. })));
    }

    #[test(tokio::test)]
    async fn document_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        let stale = "{\"stale\": {\"cert\": \"x\"}, \"padding\": \"....................\"}";
        std::fs::write(&path, stale).unwrap();

        let mut document = CredentialDocument::new();
        let record = CredentialRecord { cert: "Y2VydA==".into(), ..Default::default() };
        document.insert("alice".to_string(), record);
        write_document(&path, &document).await.unwrap();

        let read = read_document(&path).await.unwrap();
        assert_eq!(read, document);
    }

    #[test(tokio::test)]
    async fn container_source_reads_through_exec() {
        let net = FakeNetwork::new();
        let executor: Arc<dyn CommandExecutor> = Arc::new(net.clone());
        let exec = Arc::new(ExecConfig::default());
        let alice = NodeHandle::new(
            NodeConfig::full("alice", 10001, 9735),
            Network::Simnet,
            "/lnd-data/alice".to_string(),
            exec.clone(),
            RetryConfig::immediate(3),
            executor.clone(),
        )
        .unwrap();
        alice.start().await.unwrap();
        net.remove_file("alice", "data/chain/bitcoin/simnet/invoice.macaroon");

        let source = ContainerSource::new(exec, executor);
        let record = read_record(&source, &alice).await.unwrap();
        assert!(!record.cert.is_empty());
        assert!(record.admin_macaroon.is_some());
        assert!(record.invoice_macaroon.is_none());
    }
}
