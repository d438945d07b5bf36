//! External-process plugins.
//!
//! A command plugin is any executable that answers one JSON request per
//! invocation. The logger spawns the program, writes a single request line
//! to stdin and closes it, then reads a single response line from stdout:
//!
//! ```text
//! -> {"operation":"read_sample","options":{"gpio":17}}
//! <- {"status":"ok","values":{"rain_mm":0.28}}
//! ```
//!
//! Operations are `identify`, `initialize`, `read_sample` and `shutdown`.
//! An `identify` response carries `name`, `version` and `capabilities`. Any
//! operation may fail with `{"status":"error","message":"..."}`. Stderr is
//! logged at debug level and otherwise ignored.

use std::{path::PathBuf, process::Stdio, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::{io::AsyncWriteExt, process::Command};
use tracing::{debug, trace};

use super::{
    error::PluginError,
    traits::{PluginHandle, SensorPlugin},
    types::{Capability, Measurements, PluginIdentity, PluginOptions, PluginResult, Sample},
};

/// Tracing target for plugin process operations.
const COMMAND_TARGET: &str = "ccs_datalogger::plugins::command";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum Operation {
    Identify,
    Initialize,
    ReadSample,
    Shutdown,
}

#[derive(Debug, Serialize)]
struct Request<'a> {
    operation: Operation,
    options: &'a PluginOptions,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
enum Response {
    Ok {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        version: Option<String>,
        #[serde(default)]
        capabilities: Vec<Capability>,
        #[serde(default)]
        values: Option<Measurements>,
    },
    Error {
        message: String,
    },
}

/// Plugin backed by an external executable.
#[derive(Debug, Clone)]
pub struct CommandPlugin {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandPlugin {
    pub fn new(program: PathBuf, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program,
            args,
            timeout,
        }
    }

    /// Runs the program once for `operation` and returns its parsed answer.
    async fn call(&self, operation: Operation, options: &PluginOptions) -> PluginResult<Response> {
        let request = serde_json::to_string(&Request { operation, options })
            .map_err(|e| PluginError::InvalidData(format!("cannot encode request: {}", e)))?;

        match tokio::time::timeout(self.timeout, self.exchange(&request)).await {
            Ok(result) => result,
            // The child is killed when the exchange future is dropped.
            Err(_) => Err(PluginError::Timeout(self.timeout)),
        }
    }

    async fn exchange(&self, request: &str) -> PluginResult<Response> {
        debug!(
            target: COMMAND_TARGET,
            program = %self.program.display(),
            request_bytes = request.len(),
            "spawning plugin process"
        );

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                PluginError::ReadFailure(format!(
                    "cannot spawn '{}': {}",
                    self.program.display(),
                    e
                ))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            let line = format!("{}\n", request);
            stdin.write_all(line.as_bytes()).await.map_err(|e| {
                PluginError::ReadFailure(format!("cannot write request: {}", e))
            })?;
            stdin.flush().await.ok();
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| PluginError::ReadFailure(format!("plugin process failed: {}", e)))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            debug!(target: COMMAND_TARGET, stderr = %stderr.trim(), "plugin stderr");
        }

        if !output.status.success() {
            let detail = stderr.lines().last().unwrap_or("").trim().to_string();
            return Err(PluginError::ReadFailure(format!(
                "plugin exited with {}{}",
                output.status,
                if detail.is_empty() {
                    String::new()
                } else {
                    format!(": {}", detail)
                }
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout
            .lines()
            .find(|l| !l.trim().is_empty())
            .ok_or_else(|| PluginError::InvalidData("plugin wrote no response".into()))?;
        trace!(target: COMMAND_TARGET, response = line, "plugin response");

        serde_json::from_str(line)
            .map_err(|e| PluginError::InvalidData(format!("unparsable response: {}", e)))
    }
}

#[async_trait::async_trait]
impl SensorPlugin for CommandPlugin {
    async fn initialize(&self, options: &PluginOptions) -> PluginResult<Box<dyn PluginHandle>> {
        let identity = match self.call(Operation::Identify, options).await? {
            Response::Ok {
                name,
                version,
                capabilities,
                ..
            } => PluginIdentity {
                name: name.unwrap_or_default(),
                version: version.unwrap_or_default(),
                capabilities,
            },
            Response::Error { message } => return Err(PluginError::ReadFailure(message)),
        };

        if let Response::Error { message } = self.call(Operation::Initialize, options).await? {
            return Err(PluginError::ReadFailure(message));
        }

        Ok(Box::new(CommandHandle {
            plugin: self.clone(),
            identity,
            options: options.clone(),
        }))
    }
}

/// Live handle of a command plugin. The process is not kept running between
/// calls, so the handle only remembers identity and options.
#[derive(Debug)]
pub struct CommandHandle {
    plugin: CommandPlugin,
    identity: PluginIdentity,
    options: PluginOptions,
}

#[async_trait::async_trait]
impl PluginHandle for CommandHandle {
    fn identify(&self) -> PluginIdentity {
        self.identity.clone()
    }

    async fn read_sample(&self) -> PluginResult<Sample> {
        match self.plugin.call(Operation::ReadSample, &self.options).await? {
            Response::Ok {
                values: Some(values),
                ..
            } => Ok(Sample::new(values)),
            Response::Ok { values: None, .. } => {
                Err(PluginError::InvalidData("response carries no values".into()))
            }
            Response::Error { message } => Err(PluginError::ReadFailure(message)),
        }
    }

    async fn shutdown(&self) -> PluginResult<()> {
        match self.plugin.call(Operation::Shutdown, &self.options).await? {
            Response::Ok { .. } => Ok(()),
            Response::Error { message } => Err(PluginError::ReadFailure(message)),
        }
    }
}
