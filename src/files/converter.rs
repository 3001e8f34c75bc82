//! RLD -> TXT conversion
//!
//! Binary RLD decoding is delegated to an external tool. The contract
//! consumed here is narrow: given a source directory and an output
//! directory, the tool writes a text export into the output directory.
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, error, info, instrument};

#[derive(Error, Debug)]
pub enum ConversionError {
    #[error("No RLD converter configured")]
    NotConfigured,

    #[error("Failed to launch converter: {0}")]
    Launch(#[from] std::io::Error),

    #[error("Converter exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("Converter timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Converter produced no output at {0}")]
    MissingOutput(PathBuf),
}

/// True for binary logger files that need conversion before parsing
pub fn is_binary_export(filename: &str) -> bool {
    Path::new(filename)
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("rld"))
        .unwrap_or(false)
}

#[async_trait]
pub trait Converter: Send + Sync {
    /// Convert every binary export in `source_dir` into `output_dir`
    async fn convert(&self, source_dir: &Path, output_dir: &Path) -> Result<(), ConversionError>;
}

/// Runs a configured command as `<program> [args..] <source_dir> <output_dir> <file_filter>`
#[derive(Debug, Clone)]
pub struct ExternalConverter {
    program: String,
    args: Vec<String>,
    file_filter: String,
    timeout: Duration,
}

impl ExternalConverter {
    /// Build from a whitespace-separated command line
    ///
    /// Returns `None` for an empty command.
    pub fn from_command_line(command: &str, file_filter: impl Into<String>) -> Option<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
            file_filter: file_filter.into(),
            timeout: Duration::from_secs(120),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Converter for ExternalConverter {
    #[instrument(skip(self), fields(program = %self.program))]
    async fn convert(&self, source_dir: &Path, output_dir: &Path) -> Result<(), ConversionError> {
        info!(
            "Converting {} to TXT in {}",
            source_dir.display(),
            output_dir.display()
        );

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(source_dir)
            .arg(output_dir)
            .arg(&self.file_filter)
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| ConversionError::TimedOut(self.timeout))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!("Converter failed with {}: {}", output.status, stderr);
            return Err(ConversionError::Failed {
                status: output.status.to_string(),
                stderr,
            });
        }

        debug!("Converter finished for {}", source_dir.display());
        Ok(())
    }
}

/// Stand-in used when no converter command is configured
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredConverter;

#[async_trait]
impl Converter for UnconfiguredConverter {
    async fn convert(&self, _source_dir: &Path, _output_dir: &Path) -> Result<(), ConversionError> {
        Err(ConversionError::NotConfigured)
    }
}
