//! `SubprocessRunner` (spec.md section 9): a testable seam around `nginx -V`, `nginx -t`,
//! `ps`, `openssl`, and package-manager probes.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

#[derive(Debug, Clone)]
pub struct SubprocessResult {
    pub stdout_lines: Vec<String>,
    pub stderr_lines: Vec<String>,
    pub returncode: i32,
}

#[async_trait]
pub trait SubprocessRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[&str], timeout: Duration) -> Result<SubprocessResult>;
}

/// Default runner: spawns via `tokio::process::Command`, bounded by `timeout`
/// (spec.md section 5: "every blocking call must have a timeout").
pub struct TokioSubprocessRunner;

#[async_trait]
impl SubprocessRunner for TokioSubprocessRunner {
    async fn run(&self, program: &str, args: &[&str], timeout: Duration) -> Result<SubprocessResult> {
        let mut child = Command::new(program)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn {program}"))?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        if let Some(mut out) = child.stdout.take() {
            let _ = tokio::time::timeout(timeout, out.read_to_string(&mut stdout)).await;
        }
        if let Some(mut err) = child.stderr.take() {
            let _ = tokio::time::timeout(timeout, err.read_to_string(&mut stderr)).await;
        }

        let status = tokio::time::timeout(timeout, child.wait())
            .await
            .with_context(|| format!("{program} exceeded timeout of {timeout:?}"))??;

        Ok(SubprocessResult {
            stdout_lines: stdout.lines().map(str::to_string).collect(),
            stderr_lines: stderr.lines().map(str::to_string).collect(),
            returncode: status.code().unwrap_or(-1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runs_true_and_false() {
        let runner = TokioSubprocessRunner;
        let ok = runner.run("true", &[], Duration::from_secs(2)).await.unwrap();
        assert_eq!(ok.returncode, 0);

        let fail = runner.run("false", &[], Duration::from_secs(2)).await.unwrap();
        assert_eq!(fail.returncode, 1);
    }

    #[tokio::test]
    async fn captures_stdout() {
        let runner = TokioSubprocessRunner;
        let result = runner.run("echo", &["hello"], Duration::from_secs(2)).await.unwrap();
        assert_eq!(result.stdout_lines, vec!["hello".to_string()]);
    }
}
