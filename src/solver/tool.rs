//! Running external command line programs
//!
//! Registration, photometry and image arithmetic are all done by external
//! programs. Each invocation is described by a [ToolCommand] whose arguments
//! may contain `{placeholder}` variables, and runs under a watchdog: the child
//! is polled and killed once the timeout expires.
//!
//! ```json
//! { "program": "solve-field", "args": ["--overwrite", "--no-plots", "{image}"] }
//! ```

use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Program plus argument template
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ToolCommand {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// Arguments with every `{name}` replaced by its value in `vars`.
    pub fn expand_args(&self, vars: &HashMap<&str, String>) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                vars.iter().fold(arg.clone(), |acc, (name, value)| {
                    acc.replace(&format!("{{{name}}}"), value)
                })
            })
            .collect()
    }

    /// Run the program to completion or until `timeout` expires.
    pub fn run(
        &self,
        vars: &HashMap<&str, String>,
        working_dir: Option<&Path>,
        timeout: Duration,
    ) -> Result<ExitStatus, ToolError> {
        let args = self.expand_args(vars);
        debug!("Executing: {} {}", self.program, args.join(" "));

        let mut cmd = Command::new(&self.program);
        cmd.args(&args).stdout(Stdio::piped()).stderr(Stdio::null());
        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }
        let mut child = cmd.spawn().map_err(|source| ToolError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        let status = std::thread::scope(|s| -> Result<ExitStatus, ToolError> {
            if let Some(stdout) = child.stdout.take() {
                let program = self.program.as_str();
                s.spawn(move || {
                    for line in BufReader::new(stdout).lines().map_while(Result::ok) {
                        debug!("[{program}] {line}");
                    }
                });
            }

            let started = Instant::now();
            loop {
                if let Some(status) = child.try_wait()? {
                    return Ok(status);
                }
                if started.elapsed() >= timeout {
                    warn!(
                        "{} still running after {:?}, killing it",
                        self.program, timeout
                    );
                    child.kill()?;
                    child.wait()?;
                    return Err(ToolError::TimedOut {
                        program: self.program.clone(),
                        timeout,
                    });
                }
                sleep(POLL_INTERVAL);
            }
        })?;

        if status.success() {
            Ok(status)
        } else {
            Err(ToolError::Failed {
                program: self.program.clone(),
                status,
            })
        }
    }
}

/// External program runtime errors
#[derive(Error, Debug)]
pub enum ToolError {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("Cannot start {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("{program} did not finish within {timeout:?}")]
    TimedOut { program: String, timeout: Duration },
    #[error("{program} exited with {status}")]
    Failed { program: String, status: ExitStatus },
}
