//! External command templates used by the converter and inference engine.

use crate::errors::{AgentError, Result};
use model_hub::HubError;
use std::process::{Output, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// How often a running command checks for cancellation
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Bytes of stderr kept in error messages
const STDERR_TAIL: usize = 2048;

/// argv with `{placeholder}` substitution per argument
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    argv: Vec<String>,
}

impl CommandTemplate {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }

    pub fn is_configured(&self) -> bool {
        !self.argv.is_empty()
    }

    pub fn render(&self, vars: &[(&str, &str)]) -> Vec<String> {
        self.argv
            .iter()
            .map(|arg| {
                vars.iter().fold(arg.clone(), |acc, (name, value)| {
                    acc.replace(&format!("{{{}}}", name), value)
                })
            })
            .collect()
    }

    /// Run the rendered command to completion.
    ///
    /// The child is killed when `cancel` flips. A non-zero exit is an
    /// `Execution` error carrying the tail of stderr.
    pub async fn run(&self, vars: &[(&str, &str)], cancel: &AtomicBool) -> Result<Output> {
        let argv = self.render(vars);
        let Some((program, args)) = argv.split_first() else {
            return Err(AgentError::Config("command template is empty".into()));
        };
        debug!(program = %program, args = ?args, "Spawning command");

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    AgentError::Config(format!("command not found: {}", program))
                }
                _ => AgentError::Io(e),
            })?;

        let output = child.wait_with_output();
        tokio::pin!(output);

        let output = loop {
            tokio::select! {
                out = &mut output => break out?,
                _ = tokio::time::sleep(CANCEL_POLL_INTERVAL) => {
                    if cancel.load(Ordering::Relaxed) {
                        // Dropping the future kills the child
                        return Err(HubError::Cancelled(format!("{} was cancelled", program)).into());
                    }
                }
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail_start = stderr.len().saturating_sub(STDERR_TAIL);
            let tail = stderr
                .get(tail_start..)
                .unwrap_or(&stderr)
                .trim();
            return Err(AgentError::Execution(format!(
                "{} exited with {}: {}",
                program, output.status, tail
            )));
        }
        Ok(output)
    }
}
