use thiserror::Error;
use tokio::process::Command;

use std::future::Future;
use std::io;
use std::process::Output;

#[derive(Debug, Error)]
pub enum Error {
    #[error("command failed with status {status:?}: {stderr}")]
    CommandFailed { status: Option<i32>, stderr: String },
    #[error("IO error: {0}")]
    IO(#[from] io::Error),
}

/// Whether failures are logged as errors or left to the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Logs {
    Print,
    Suppress,
}

impl Error {
    /// Error output of a failed command, empty for spawn failures.
    pub fn stderr(&self) -> &str {
        match self {
            Error::CommandFailed { stderr, .. } => stderr,
            Error::IO(_) => "",
        }
    }

    /// iproute2, wg and iptables all report missing objects on stderr only.
    pub fn is_not_found(&self) -> bool {
        let stderr = self.stderr().to_lowercase();
        ["cannot find device", "no such", "does not exist", "not found", "bad rule"]
            .iter()
            .any(|needle| stderr.contains(needle))
    }
}

pub trait ShellCommandExt {
    fn run(&mut self, logs: Logs) -> impl Future<Output = Result<(), Error>> + Send;
    fn run_stdout(&mut self, logs: Logs) -> impl Future<Output = Result<String, Error>> + Send;
}

impl ShellCommandExt for Command {
    /// Run the command, capturing stdout and stderr regardless of command settings.
    async fn run(&mut self, logs: Logs) -> Result<(), Error> {
        self.run_stdout(logs).await.map(|_| ())
    }

    async fn run_stdout(&mut self, logs: Logs) -> Result<String, Error> {
        let output = self.output().await?;
        let cmd_debug = format!("{:?}", self);
        stdout_from_output(cmd_debug, output, logs)
    }
}

pub fn stdout_from_output(cmd: String, output: Output, logs: Logs) -> Result<String, Error> {
    let stderrempty = output.stderr.is_empty();
    let stdout = String::from_utf8_lossy(&output.stdout);
    match (stderrempty, output.status) {
        (true, status) if status.success() => Ok(stdout.trim().to_string()),
        (false, status) if status.success() => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if logs == Logs::Print {
                tracing::warn!(cmd, %stderr, "Non empty stderr on successful command");
            }
            Ok(stdout.trim().to_string())
        }
        (_, status) => {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if logs == Logs::Print {
                tracing::error!(cmd, status_code = ?status.code(), %stdout, %stderr, "Error executing command");
            } else {
                tracing::debug!(cmd, status_code = ?status.code(), %stderr, "Command failed");
            }
            Err(Error::CommandFailed {
                status: status.code(),
                stderr,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;

    fn output(code: i32, stdout: &str, stderr: &str) -> Output {
        Output {
            status: ExitStatus::from_raw(code << 8),
            stdout: stdout.as_bytes().to_vec(),
            stderr: stderr.as_bytes().to_vec(),
        }
    }

    #[test]
    fn trims_stdout_on_success() -> anyhow::Result<()> {
        let out = stdout_from_output("wg".into(), output(0, "  peer\n", ""), Logs::Print)?;
        assert_eq!(out, "peer");
        Ok(())
    }

    #[test]
    fn stderr_on_success_is_not_an_error() -> anyhow::Result<()> {
        let out = stdout_from_output("wg".into(), output(0, "ok", "warning"), Logs::Suppress)?;
        assert_eq!(out, "ok");
        Ok(())
    }

    #[test]
    fn failure_keeps_stderr_for_classification() {
        let err = stdout_from_output(
            "ip".into(),
            output(1, "", "Cannot find device \"moz0\"\n"),
            Logs::Suppress,
        )
        .expect_err("non zero exit");
        assert!(err.is_not_found());
        assert!(matches!(err, Error::CommandFailed { status: Some(1), .. }));

        let err = stdout_from_output("ip".into(), output(2, "", "RTNETLINK answers: File exists"), Logs::Suppress)
            .expect_err("non zero exit");
        assert!(!err.is_not_found());
    }
}
