use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{GridflowError, Result};

/// Runs scheduler command-line tools.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `argv` and return its stdout. A non-zero exit is an
    /// [`GridflowError::CommandFailed`] carrying the command's stderr.
    async fn run(&self, argv: &[String]) -> Result<String>;
}

/// Runs commands as child processes, without a shell.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, argv: &[String]) -> Result<String> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| GridflowError::Internal("empty command line".into()))?;

        tracing::debug!(command = %argv.join(" "), "Running command");
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            Err(GridflowError::CommandFailed {
                command: argv.join(" "),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn captures_stdout() {
        let out = ProcessRunner.run(&argv(&["echo", "hello"])).await.unwrap();
        assert_eq!(out, "hello\n");
    }

    #[tokio::test]
    async fn non_zero_exit_carries_stderr() {
        let err = ProcessRunner
            .run(&argv(&["sh", "-c", "echo 'qstat: Unknown Job Id' >&2; exit 153"]))
            .await
            .unwrap_err();
        match err {
            GridflowError::CommandFailed { code, stderr, .. } => {
                assert_eq!(code, Some(153));
                assert_eq!(stderr, "qstat: Unknown Job Id");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn empty_command_line_is_rejected() {
        let err = ProcessRunner.run(&[]).await.unwrap_err();
        assert!(matches!(err, GridflowError::Internal(_)));
    }

    #[tokio::test]
    async fn missing_program_is_io_error() {
        let err = ProcessRunner
            .run(&argv(&["gridflow_no_such_program_12345"]))
            .await
            .unwrap_err();
        assert!(matches!(err, GridflowError::Io(_)));
    }
}
