//! Time-bounded execution of external programs (`virsh`, power control
//! commands, hooks). Stdout is collected, stderr is forwarded to the log.

use std::ffi::OsStr;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, LinesCodec};

use crate::error::{LabError, Result};
use crate::log::*;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Output of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    pub stdout: String,
    pub stderr: Vec<String>,
}

enum Line {
    Out(String),
    Err(String),
}

/// Run `program` with `args`, failing with [`LabError::Backend`] (attributed
/// to `backend`) if it can't be spawned, exits non-zero or outlives
/// `timeout`. The child is killed when the timeout elapses.
#[tracing::instrument(skip(args, envs))]
pub async fn run<A, E, K, V>(
    backend: &str,
    program: &str,
    args: A,
    envs: E,
    timeout: Duration,
) -> Result<Output>
where
    A: IntoIterator,
    A::Item: AsRef<OsStr>,
    E: IntoIterator<Item = (K, V)>,
    K: AsRef<OsStr>,
    V: AsRef<OsStr>,
{
    debug!("process: running {}", program);
    let mut child = Command::new(program)
        .args(args)
        .envs(envs)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| LabError::backend(backend, format!("spawning '{program}' failed: {e}")))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| LabError::backend(backend, "child stdout missing"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| LabError::backend(backend, "child stderr missing"))?;
    let stdout = FramedRead::new(stdout, LinesCodec::new()).map(|l| l.map(Line::Out));
    let stderr = FramedRead::new(stderr, LinesCodec::new()).map(|l| l.map(Line::Err));
    let mut lines = stdout.merge(stderr);

    let finished = async {
        let mut out = Output {
            stdout: String::new(),
            stderr: vec![],
        };
        while let Some(line) = lines.next().await {
            match line {
                Ok(Line::Out(line)) => {
                    out.stdout.push_str(&line);
                    out.stdout.push('\n');
                }
                Ok(Line::Err(line)) => {
                    warn!("process: {}: {}", program, line);
                    out.stderr.push(line);
                }
                Err(e) => {
                    error!("process: {}: error reading output: {}", program, e);
                }
            }
        }
        let status = child.wait().await?;
        Ok::<_, std::io::Error>((status, out))
    };

    let (status, mut out) = tokio::time::timeout(timeout, finished)
        .await
        .map_err(|_| {
            LabError::backend(
                backend,
                format!("'{program}' timed out after {}s", timeout.as_secs()),
            )
        })?
        .map_err(|e| LabError::backend(backend, format!("waiting for '{program}' failed: {e}")))?;

    if !status.success() {
        let reason = out.stderr.last().cloned().unwrap_or_default();
        return Err(LabError::backend(
            backend,
            format!("'{program}' exited with {status}: {reason}"),
        ));
    }

    let trimmed = out.stdout.trim_end().len();
    out.stdout.truncate(trimmed);
    Ok(out)
}

/// Run a shell-quoted command line such as `ipmitool -H bmc1 power on`.
pub async fn run_command_line(backend: &str, command_line: &str, timeout: Duration) -> Result<Output> {
    let words = shell_words::split(command_line)
        .map_err(|e| LabError::InvalidRequest(format!("bad command line '{command_line}': {e}")))?;
    let (program, args) = words
        .split_first()
        .ok_or_else(|| LabError::InvalidRequest("empty command line".into()))?;
    run(backend, program, args, std::iter::empty::<(&str, &str)>(), timeout).await
}
