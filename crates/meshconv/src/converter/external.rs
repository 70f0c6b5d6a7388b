//! Runs the FreeCAD conversion script as a child process.
//!
//! Invocation: `<program> [script] <input> <output> --tolerance <t>
//! --repair|--no-repair`. The script prints a JSON report on stdout, possibly
//! after unrelated banner output.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, info_span, warn};

use super::{ConversionRequest, Converter};
use crate::config::ConverterConfig;
use crate::error::ConversionError;
use crate::job::ConversionReport;

/// Characters of stderr kept as the diagnostic when no report is printed.
const STDERR_TAIL: usize = 500;

#[derive(Debug, Clone)]
pub struct ExternalConverter {
    program: String,
    script: Option<PathBuf>,
    timeout: Duration,
}

impl ExternalConverter {
    pub fn new(program: impl Into<String>, script: Option<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            script,
            timeout,
        }
    }

    pub fn from_config(config: &ConverterConfig) -> Self {
        Self::new(
            config.program.clone(),
            config.script.clone(),
            Duration::from_secs(config.timeout_secs),
        )
    }

    fn command(&self, request: &ConversionRequest) -> Command {
        let mut cmd = Command::new(&self.program);
        if let Some(script) = &self.script {
            cmd.arg(script);
        }
        cmd.arg(&request.input)
            .arg(&request.output)
            .arg("--tolerance")
            .arg(request.options.tolerance.to_string())
            .arg(if request.options.repair {
                "--repair"
            } else {
                "--no-repair"
            })
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn run(&self, request: &ConversionRequest) -> Result<ConversionReport, ConversionError> {
        let child = self
            .command(request)
            .spawn()
            .map_err(|source| ConversionError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        // Dropping the future on timeout drops the child, which kills it.
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ConversionError::Timeout(self.timeout))??;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        debug!(
            job_id = %request.job_id,
            status = %output.status,
            stdout_len = stdout.len(),
            "Converter exited"
        );

        match extract_report(&stdout) {
            Some(report) => interpret_report(report, request),
            None if !output.status.success() => Err(ConversionError::Failed(failure_diagnostic(
                &stderr,
                output.status.code(),
            ))),
            None => Err(ConversionError::BadReport(
                "no JSON object on stdout".to_string(),
            )),
        }
    }
}

impl Converter for ExternalConverter {
    fn convert(&self, request: &ConversionRequest) -> Result<ConversionReport, ConversionError> {
        let span = info_span!(
            "converter.run",
            job_id = %request.job_id,
            attempt = request.attempt
        );
        let _enter = span.enter();

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        rt.block_on(self.run(request))
    }
}

/// Parses the first JSON value starting at the first `{` in `stdout`.
fn extract_report(stdout: &str) -> Option<Value> {
    let start = stdout.find('{')?;
    serde_json::Deserializer::from_str(&stdout[start..])
        .into_iter::<Value>()
        .next()
        .and_then(Result::ok)
        .filter(Value::is_object)
}

fn interpret_report(
    report: Value,
    request: &ConversionRequest,
) -> Result<ConversionReport, ConversionError> {
    if report.get("success").and_then(Value::as_bool) != Some(true) {
        let message = report
            .get("error")
            .and_then(Value::as_str)
            .filter(|e| !e.is_empty())
            .unwrap_or("Conversion failed without a diagnostic");
        return Err(ConversionError::Failed(message.to_string()));
    }
    if !request.output.exists() {
        warn!(
            job_id = %request.job_id,
            output = %request.output.display(),
            "Converter reported success without writing output"
        );
        return Err(ConversionError::Failed(
            "Converter reported success but wrote no output file".to_string(),
        ));
    }
    Ok(ConversionReport(report))
}

fn failure_diagnostic(stderr: &str, code: Option<i32>) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        return match code {
            Some(code) => format!("Converter exited with code {}", code),
            None => "Converter terminated by signal".to_string(),
        };
    }
    let skip = trimmed.chars().count().saturating_sub(STDERR_TAIL);
    trimmed.chars().skip(skip).collect()
}
