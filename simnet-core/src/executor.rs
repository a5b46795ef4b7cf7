use async_trait::async_trait;
use log::*;
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;

use crate::error::{Error, Result};

/// A single external command, with the complete environment it runs under
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub current_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: &str) -> Self {
        Self { program: program.to_string(), ..Default::default() }
    }

    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs(mut self, env: &BTreeMap<String, String>) -> Self {
        self.env.extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn current_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.current_dir = dir;
        self
    }

    /// Append a `-e KEY=VALUE` argument
    pub fn env_flag<V: Display>(self, key: &str, value: V) -> Self {
        self.arg("-e").arg(format!("{}={}", key, value))
    }

    /// Value of a `-e KEY=VALUE` argument, if present
    pub fn env_arg(&self, key: &str) -> Option<&str> {
        let prefix = format!("{}=", key);
        self.args
            .windows(2)
            .filter(|w| w[0] == "-e")
            .find_map(|w| w[1].strip_prefix(prefix.as_str()))
    }
}

impl Display for CommandSpec {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Captured result of a command that ran to completion
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CommandOutput {
    /// exit code, `None` if killed by a signal
    pub code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok<S: Into<Vec<u8>>>(stdout: S) -> Self {
        Self { code: Some(0), stdout: stdout.into(), stderr: String::new() }
    }

    pub fn failed(code: i32, stderr: &str) -> Self {
        Self { code: Some(code), stdout: Vec::new(), stderr: stderr.to_string() }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// Runs external commands.  `Err` is returned only when the command could
/// not be run at all; a non-zero exit is reported through [`CommandOutput`].
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, command: &CommandSpec) -> Result<CommandOutput>;
}

/// Runs commands as child processes
#[derive(Clone, Debug, Default)]
pub struct ShellExecutor;

#[async_trait]
impl CommandExecutor for ShellExecutor {
    async fn run(&self, command: &CommandSpec) -> Result<CommandOutput> {
        debug!("exec: {}", command);
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .env_clear()
            .envs(&command.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &command.current_dir {
            cmd.current_dir(dir);
        }
        let output = cmd
            .output()
            .await
            .map_err(|source| Error::Spawn { program: command.program.clone(), source })?;
        let result = CommandOutput {
            code: output.status.code(),
            stdout: output.stdout,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        trace!(
            "exec result {:?}: {} bytes stdout, stderr {:?}",
            result.code,
            result.stdout.len(),
            result.stderr
        );
        Ok(result)
    }
}
