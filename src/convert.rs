use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::cache::Artifact;
use crate::error::{BrokerError, Result};

/// Turns an uploaded geographic file into another format.
#[async_trait]
pub trait FormatConverter: Send + Sync {
    async fn convert(&self, input: &Path, options: &[String]) -> Result<Artifact>;
}

/// Runs an external conversion program (`ogr2ogr`-style) and returns its stdout.
///
/// The command line is `program base_args... options... input`. A nonzero
/// exit status or an empty stdout is a failed conversion.
#[derive(Debug, Clone)]
pub struct CommandConverter {
    program: String,
    base_args: Vec<String>,
}

impl CommandConverter {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            base_args: Vec::new(),
        }
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.base_args.push(arg.into());
        self
    }

    /// GeoJSON on stdout through GDAL.
    pub fn ogr2ogr_geojson() -> Self {
        Self::new("ogr2ogr")
            .with_arg("-f")
            .with_arg("GeoJSON")
            .with_arg("-t_srs")
            .with_arg("EPSG:4326")
            .with_arg("/dev/stdout")
    }

    fn process_output(
        &self,
        input: &Path,
        result: std::result::Result<std::process::Output, std::io::Error>,
    ) -> Result<Artifact> {
        let output = result.map_err(|e| {
            tracing::error!(program = %self.program, error = %e, "Converter failed to run");
            BrokerError::ConversionFailed(format!("{}: {}", self.program, e))
        })?;

        let exit_code = output.status.code();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            tracing::warn!(program = %self.program, input = %input.display(), exit_code = ?exit_code, "Conversion failed");
            return Err(BrokerError::ConversionFailed(if stderr.is_empty() {
                format!("exit code: {:?}", exit_code)
            } else {
                stderr
            }));
        }

        if output.stdout.is_empty() {
            tracing::warn!(program = %self.program, input = %input.display(), "Converter produced no output");
            return Err(BrokerError::ConversionFailed("empty output".to_string()));
        }

        tracing::debug!(program = %self.program, bytes = output.stdout.len(), "Conversion finished");
        Ok(output.stdout)
    }
}

#[async_trait]
impl FormatConverter for CommandConverter {
    async fn convert(&self, input: &Path, options: &[String]) -> Result<Artifact> {
        tracing::info!(program = %self.program, input = %input.display(), "Converting upload");

        let result = Command::new(&self.program)
            .args(&self.base_args)
            .args(options)
            .arg(input)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await;

        self.process_output(input, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn cat_returns_file_bytes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{\"type\":\"FeatureCollection\"}").unwrap();

        let converter = CommandConverter::new("cat");
        let out = converter.convert(file.path(), &[]).await.unwrap();
        assert_eq!(out, b"{\"type\":\"FeatureCollection\"}");
    }

    #[tokio::test]
    async fn empty_output_is_a_failure() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let converter = CommandConverter::new("cat");
        let err = converter.convert(file.path(), &[]).await.unwrap_err();
        assert!(matches!(err, BrokerError::ConversionFailed(_)));
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_failure() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let converter = CommandConverter::new("sh")
            .with_arg("-c")
            .with_arg("echo broken layer >&2; exit 3");
        let err = converter.convert(file.path(), &[]).await.unwrap_err();
        match err {
            BrokerError::ConversionFailed(msg) => assert_eq!(msg, "broken layer"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn missing_program_is_a_failure() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let converter = CommandConverter::new("definitely-not-a-converter-binary");
        let err = converter.convert(file.path(), &[]).await.unwrap_err();
        assert!(matches!(err, BrokerError::ConversionFailed(_)));
    }
}
