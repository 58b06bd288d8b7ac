use std::collections::VecDeque;
use std::io::Write;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use anyhow::Context;
use pyrelay_core::config::ExecConfig;
use pyrelay_core::ExecutionResult;
use regex::Regex;
use tempfile::NamedTempFile;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Output lines that deserve a runtime analysis.
const NOTABLE_PATTERN: &str = r"(?i)\b(result|output|finished|done|error|exception|warning)\b";

/// How long to wait for stderr to drain once the child is gone.
const STDERR_GRACE: Duration = Duration::from_secs(1);

enum Outcome {
    Exited(ExitStatus),
    ReadFailed(std::io::Error),
    TimedOut,
    Cancelled,
}

/// Runs a code snippet as a script in a child interpreter.
pub struct ScriptRunner {
    config: ExecConfig,
    notable: Regex,
}

impl ScriptRunner {
    pub fn new(config: ExecConfig) -> anyhow::Result<Self> {
        Ok(Self {
            config,
            notable: Regex::new(NOTABLE_PATTERN)?,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout()
    }

    pub fn is_notable(&self, line: &str) -> bool {
        self.notable.is_match(line)
    }

    /// Write `code` to a throwaway file and run it.
    ///
    /// `on_notable` is called for every stdout line matching the keyword
    /// pattern, with the most recent output lines (the notable one last).
    /// On timeout the child is killed and reaped and the result carries
    /// `timed_out`. The script file is removed on every path out.
    pub async fn run<F>(
        &self,
        code: &str,
        cancel: CancellationToken,
        mut on_notable: F,
    ) -> anyhow::Result<ExecutionResult>
    where
        F: FnMut(&str, Vec<String>) + Send,
    {
        let script = self.write_script(code)?;
        let started = Instant::now();

        let mut child = Command::new(&self.config.interpreter)
            .args(&self.config.args)
            .arg(script.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start {}", self.config.interpreter.display()))?;
        let pid = child.id();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("failed to capture stdout"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow::anyhow!("failed to capture stderr"))?;
        let mut stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            stderr.read_to_end(&mut buf).await.map(|_| buf)
        });

        let context_lines = self.config.context_lines.max(1);
        let mut captured: Vec<String> = Vec::new();
        let mut recent: VecDeque<String> = VecDeque::with_capacity(context_lines);
        let mut reader = BufReader::new(stdout);
        let mut buf = Vec::new();

        let outcome = tokio::select! {
            result = async {
                // Scripts may print arbitrary bytes; decode each line lossily.
                while reader.read_until(b'\n', &mut buf).await? > 0 {
                    let line = decode_line(&buf);
                    buf.clear();
                    if recent.len() == context_lines {
                        recent.pop_front();
                    }
                    recent.push_back(line.clone());
                    if self.notable.is_match(&line) {
                        on_notable(&line, recent.iter().cloned().collect());
                    }
                    captured.push(line);
                }
                child.wait().await
            } => match result {
                Ok(status) => Outcome::Exited(status),
                Err(e) => Outcome::ReadFailed(e),
            },
            _ = tokio::time::sleep(self.config.timeout()) => Outcome::TimedOut,
            _ = cancel.cancelled() => Outcome::Cancelled,
        };

        let status = match outcome {
            Outcome::Exited(status) => Some(status),
            Outcome::TimedOut => {
                tracing::info!(pid = ?pid, timeout_secs = self.config.timeout_secs, "script timed out, killing");
                child.kill().await.ok();
                None
            }
            Outcome::Cancelled => {
                child.kill().await.ok();
                anyhow::bail!("execution cancelled");
            }
            Outcome::ReadFailed(e) => {
                child.kill().await.ok();
                return Err(e).context("reading script output");
            }
        };

        let stderr = match tokio::time::timeout(STDERR_GRACE, &mut stderr_task).await {
            Ok(Ok(Ok(bytes))) => String::from_utf8_lossy(&bytes).into_owned(),
            Ok(_) => String::new(),
            Err(_) => {
                // A grandchild may still hold the pipe open.
                stderr_task.abort();
                String::new()
            }
        };
        drop(script);

        Ok(ExecutionResult {
            success: status.map(|s| s.success()).unwrap_or(false),
            stdout: captured.join("\n"),
            stderr,
            exit_code: status.and_then(|s| s.code()),
            timed_out: status.is_none(),
            duration_ms: started.elapsed().as_millis() as u64,
            pid,
        })
    }

    fn write_script(&self, code: &str) -> anyhow::Result<NamedTempFile> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("pyrelay-").suffix(".py");
        let mut file = match &self.config.scratch_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                builder.tempfile_in(dir)?
            }
            None => builder.tempfile()?,
        };
        file.write_all(code.as_bytes())?;
        file.flush()?;
        Ok(file)
    }
}

/// One raw output line without its terminator, invalid UTF-8 replaced.
fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}
