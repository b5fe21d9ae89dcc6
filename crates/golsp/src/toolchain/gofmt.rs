//
// toolchain/gofmt.rs
//
// Document formatting through a gofmt subprocess
//

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

#[async_trait]
pub trait Formatter: Send + Sync {
    /// Formatted text, or an error when the formatter is unavailable or
    /// rejects the input.
    async fn format(&self, source: &str) -> Result<String>;
}

pub struct Gofmt {
    path: PathBuf,
    timeout: Duration,
}

impl Gofmt {
    const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    /// `path` defaults to `gofmt` looked up on `PATH`.
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path: path.unwrap_or_else(|| PathBuf::from("gofmt")),
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Formatter for Gofmt {
    async fn format(&self, source: &str) -> Result<String> {
        let _timing = crate::perf::TimingGuard::new("gofmt");

        let mut child = Command::new(&self.path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| anyhow!("Failed to spawn {}: {e}", self.path.display()))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("gofmt stdin unavailable"))?;
        let input = source.as_bytes().to_vec();
        // Written concurrently so a large file cannot fill both pipes
        let writer = tokio::spawn(async move {
            let result = stdin.write_all(&input).await;
            drop(stdin);
            result
        });

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| anyhow!("Failed to run gofmt: {e}"))?,
            Err(_) => return Err(anyhow!("gofmt timed out after {:?}", self.timeout)),
        };
        if let Ok(Err(e)) = writer.await {
            log::trace!("gofmt stdin closed early: {}", e);
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("gofmt failed with status {}: {}", output.status, stderr.trim()));
        }
        String::from_utf8(output.stdout).map_err(|e| anyhow!("gofmt produced invalid UTF-8: {e}"))
    }
}
