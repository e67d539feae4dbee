//! Local command execution.
//!
//! Implements [`CommandRunner`] for `localhost` via the system shell. Remote
//! hosts need an SSH-backed implementation injected by the embedding
//! application; this one refuses them rather than guessing at transport.

use crate::error::{FlotillaError, FlotillaResult};
use crate::ops::CommandRunner;
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

pub struct LocalRunner;

#[async_trait]
impl CommandRunner for LocalRunner {
    async fn run(&self, host: &str, command: &str) -> FlotillaResult<String> {
        if host != "localhost" && host != "127.0.0.1" {
            return Err(FlotillaError::Internal(format!(
                "LocalRunner cannot reach {}; inject an SSH runner for remote hosts",
                host
            )));
        }
        debug!("local exec: {}", command);

        let output = if cfg!(windows) {
            Command::new("cmd").args(["/C", command]).output().await?
        } else {
            Command::new("sh").args(["-c", command]).output().await?
        };

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(FlotillaError::Internal(format!(
                "command '{}' exited {}: {}",
                command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runs_a_local_command() {
        let runner = LocalRunner;
        let out = runner.run("localhost", "echo flotilla").await.unwrap();
        assert_eq!(out.trim(), "flotilla");
    }

    #[tokio::test]
    async fn refuses_remote_hosts() {
        let runner = LocalRunner;
        assert!(runner.run("10.0.0.5", "echo hi").await.is_err());
    }

    #[tokio::test]
    async fn surfaces_failure_with_stderr() {
        let runner = LocalRunner;
        let err = runner
            .run("localhost", "ls /definitely/not/a/path")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exited"));
    }
}
