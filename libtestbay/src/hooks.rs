//! External programs notified about job transitions, e.g. to feed a
//! dashboard. Every executable file in the hooks directory is run as
//! `<hook> <event> <cookie>` with the job's details in the environment.
//! Hooks can't influence the job: failures are only logged.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs;

use crate::job::JobRecord;
use crate::log::*;
use crate::process;

pub const HOOK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookEvent {
    Submitted,
    Started,
    Finished,
    Aborted,
}

impl fmt::Display for HookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookEvent::Submitted => write!(f, "submitted"),
            HookEvent::Started => write!(f, "started"),
            HookEvent::Finished => write!(f, "finished"),
            HookEvent::Aborted => write!(f, "aborted"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Hooks {
    dir: Option<PathBuf>,
    timeout: Option<Duration>,
}

impl Hooks {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self {
            dir: Some(dir.into()),
            timeout: None,
        }
    }

    /// No hooks at all.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Run every hook for `event`. Returns how many hooks succeeded.
    #[tracing::instrument(skip(self, record), fields(cookie = %record.cookie()))]
    pub async fn fire(&self, event: HookEvent, record: &JobRecord) -> usize {
        let Some(dir) = &self.dir else {
            return 0;
        };
        let hooks = match executables(dir).await {
            Ok(hooks) => hooks,
            Err(e) => {
                warn!("hooks: can't read {}: {}", dir.display(), e);
                return 0;
            }
        };

        let event_name = event.to_string();
        let envs = [
            ("TESTBAY_EVENT", event_name.clone()),
            ("TESTBAY_COOKIE", record.cookie().clone()),
            ("TESTBAY_STATUS", record.status().to_string()),
            ("TESTBAY_TESTSUITE", record.testsuite().clone()),
            ("TESTBAY_PROFILE", record.profile().clone()),
            ("TESTBAY_HOST", record.host().clone()),
            ("TESTBAY_CURRENT_STEP", record.current_step().to_string()),
        ];
        let mut succeeded = 0;
        for hook in hooks {
            let program = hook.display().to_string();
            debug!("hooks: running {} for {}", program, event_name);
            match process::run(
                "hooks",
                &program,
                [event_name.as_str(), record.cookie().as_str()],
                envs.iter().map(|(k, v)| (*k, v.as_str())),
                self.timeout.unwrap_or(HOOK_TIMEOUT),
            )
            .await
            {
                Ok(_) => succeeded += 1,
                Err(e) => warn!("hooks: {} failed for {}: {}", program, event_name, e),
            }
        }
        succeeded
    }
}

/// Executable regular files in `dir`, sorted by name.
async fn executables(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    use std::os::unix::fs::PermissionsExt;

    let mut hooks = vec![];
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(hooks),
        Err(e) => return Err(e),
    };
    while let Some(entry) = entries.next_entry().await? {
        let metadata = entry.metadata().await?;
        if metadata.is_file() && metadata.permissions().mode() & 0o111 != 0 {
            hooks.push(entry.path());
        }
    }
    hooks.sort();
    Ok(hooks)
}
