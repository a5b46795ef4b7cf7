use thiserror::Error;

/// Bootstrap errors
#[derive(Debug, Error)]
pub enum Error {
    /// the command could not be spawned at all
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    /// a container with the node's name already exists
    #[error("container for {node} already exists")]
    StartConflict { node: String },
    #[error("failed to start {node}: {stderr}")]
    StartFailed { node: String, stderr: String },
    /// a bounded existence poll ran out of attempts
    #[error("gave up waiting for {what} after {attempts} attempts")]
    ReadinessTimeout { what: String, attempts: u32 },
    /// non-zero exit from a command
    #[error("`{command}` on {target} exited with {code:?}: {stderr}")]
    CommandFailed { target: String, command: String, code: Option<i32>, stderr: String },
    /// exit zero, but only diagnostic text came back
    #[error("problem connecting to {target} for `{command}`: {stderr}")]
    Unavailable { target: String, command: String, stderr: String },
    #[error("malformed response from {target} for `{command}`: {reason}")]
    MalformedResponse { target: String, command: String, reason: String },
    #[error("no response from {target} for `{command}`")]
    EmptyResponse { target: String, command: String },
    #[error("topology assertion failed: {0}")]
    TopologyAssertionFailed(String),
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("{node} has no identity key yet")]
    MissingIdentity { node: String },
    #[error("{node} identity changed from {old} to {new}")]
    IdentityChanged { node: String, old: String, new: String },
    #[error("{node} balance {balance} is too small to fund clients")]
    InsufficientFunds { node: String, balance: i64 },
    #[error("required credential {path} missing for {node}")]
    MissingCredential { node: String, path: String },
    #[error("credential I/O for {path}: {source}")]
    CredentialIo {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("config: {0}")]
    Config(String),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Bootstrap result
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether a read-style command may be retried after this error
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::CommandFailed { .. }
                | Error::Unavailable { .. }
                | Error::MalformedResponse { .. }
                | Error::EmptyResponse { .. }
        )
    }

    /// The text an operator needs to see, preferring captured stderr
    pub fn diagnostic(&self) -> String {
        match self {
            Error::StartFailed { stderr, .. }
            | Error::CommandFailed { stderr, .. }
            | Error::Unavailable { stderr, .. }
                if !stderr.trim().is_empty() =>
                stderr.trim().to_string(),
            _ => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostic_prefers_stderr() {
        let err = Error::CommandFailed {
            target: "alice".to_string(),
            command: "getinfo".to_string(),
            code: Some(1),
            stderr: "  rpc error: unavailable\n".to_string(),
        };
        assert_eq!(err.diagnostic(), "rpc error: unavailable");

        let err = Error::CommandFailed {
            target: "alice".to_string(),
            command: "getinfo".to_string(),
            code: Some(1),
            stderr: String::new(),
        };
        assert!(err.diagnostic().contains("exited with Some(1)"));
    }

    #[test]
    fn transient_classification() {
        assert!(Error::EmptyResponse { target: "a".into(), command: "c".into() }.is_transient());
        assert!(!Error::Validation("negative".into()).is_transient());
        assert!(!Error::TopologyAssertionFailed("peers".into()).is_transient());
    }

    #[test]
    fn timeout_names_the_wait() {
        let err = Error::ReadinessTimeout { what: "bob confirmed balance".into(), attempts: 30 };
        assert_eq!(err.to_string(), "gave up waiting for bob confirmed balance after 30 attempts");
        assert!(!err.is_transient());
    }
}
