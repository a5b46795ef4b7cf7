//! Command templates for the container runtime and parsing of the
//! structured text the node tools print.

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::config::ExecConfig;
use crate::error::{Error, Result};
use crate::executor::{CommandOutput, CommandSpec};

/// `docker-compose [-f FILE]...` with the configured environment
pub fn compose(config: &ExecConfig) -> CommandSpec {
    let mut spec = CommandSpec::new(&config.compose_program)
        .envs(&config.env)
        .current_dir(config.project_dir.clone());
    for file in &config.compose_files {
        spec = spec.arg("-f").arg(file.to_string_lossy());
    }
    spec
}

/// `docker` with the configured environment
pub fn container(config: &ExecConfig) -> CommandSpec {
    CommandSpec::new(&config.container_program)
        .envs(&config.env)
        .current_dir(config.project_dir.clone())
}

/// Whether a failed create was only because the container is already there
pub fn is_conflict(stderr: &str) -> bool {
    (stderr.contains("Cannot create container") && stderr.contains("Conflict"))
        || stderr.contains("is already in use by container")
}

/// Interpret the output of a command that should print a JSON object
pub fn parse_structured(target: &str, command: &str, output: CommandOutput) -> Result<Value> {
    if !output.success() {
        return Err(Error::CommandFailed {
            target: target.to_string(),
            command: command.to_string(),
            code: output.code,
            stderr: output.stderr,
        });
    }
    let stdout = output.stdout_str();
    let stdout = stdout.trim();
    if !stdout.is_empty() {
        let value: Value = serde_json::from_str(stdout).map_err(|e| Error::MalformedResponse {
            target: target.to_string(),
            command: command.to_string(),
            reason: e.to_string(),
        })?;
        if !value.is_object() {
            return Err(Error::MalformedResponse {
                target: target.to_string(),
                command: command.to_string(),
                reason: "expected a JSON object".to_string(),
            });
        }
        return Ok(value);
    }
    if !output.stderr.trim().is_empty() {
        return Err(Error::Unavailable {
            target: target.to_string(),
            command: command.to_string(),
            stderr: output.stderr,
        });
    }
    Err(Error::EmptyResponse { target: target.to_string(), command: command.to_string() })
}

/// Convert a parsed response into its typed form
pub fn decode<T: DeserializeOwned>(target: &str, command: &str, value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| Error::MalformedResponse {
        target: target.to_string(),
        command: command.to_string(),
        reason: e.to_string(),
    })
}
