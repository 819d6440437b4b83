//! Running external image tools (`enfuse`, `align_image_stack`, upload scripts)

use crate::{ProcessingError, Result};
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::process::Command;
use tracing::debug;

/// An external program plus the fixed arguments placed before per-call ones
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalTool {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ExternalTool {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Start a command with the fixed arguments already applied
    #[must_use]
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }

    /// Run with extra arguments appended, failing on a non-zero exit
    pub fn run<I, S>(&self, extra: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = self.command();
        cmd.args(extra);
        run_command(&mut cmd)
    }
}

/// Execute a prepared command and turn a non-zero exit into `ToolFailed`
pub fn run_command(cmd: &mut Command) -> Result<()> {
    let program = cmd.get_program().to_string_lossy().into_owned();
    debug!("Running external tool: {:?}", cmd);

    let output = cmd.output().map_err(|source| ProcessingError::ToolLaunch {
        program: program.clone(),
        source,
    })?;

    if !output.status.success() {
        return Err(ProcessingError::ToolFailed {
            program,
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(())
}
