use std::{env, ffi::OsString, path::PathBuf, str::FromStr, time::Duration};

use tracing::warn;

const POLL_INTERVAL_VAR: &str = "NOTEPORT_POLL_INTERVAL_MS";
const EXECUTION_DEADLINE_VAR: &str = "NOTEPORT_EXECUTION_DEADLINE_SECS";
const RUNTIME_DIR_VAR: &str = "NOTEPORT_RUNTIME_DIR";
const STRICT_SIGNATURES_VAR: &str = "NOTEPORT_STRICT_SIGNATURES";

/// Timing and capacity knobs of a kernel client and the process supervisor.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long one iopub poll waits for data.
    pub poll_interval: Duration,
    /// After this long without an idle status, a one-time warning is
    /// appended to the execution output. Polling continues.
    pub slow_execution_warning: Duration,
    /// Hard limit on a single execution. `None` waits for the kernel forever.
    pub execution_deadline: Option<Duration>,
    /// Upper bound on stale iopub messages discarded before a request.
    pub drain_limit: usize,
    pub connect_timeout: Duration,
    pub ready_timeout: Duration,
    pub ready_poll_interval: Duration,
    pub spawn_timeout: Duration,
    pub spawn_poll_interval: Duration,
    pub terminate_grace: Duration,
    pub kill_grace: Duration,
    /// Executions that may be queued or running at once.
    pub max_in_flight: usize,
    pub username: String,
    /// Directory receiving connection files of kernels spawned by the supervisor.
    pub runtime_dir: PathBuf,
    /// Refuse to connect when the signature scheme cannot be honoured,
    /// instead of sending unsigned messages.
    pub strict_signatures: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            slow_execution_warning: Duration::from_secs(30),
            execution_deadline: None,
            drain_limit: 2000,
            connect_timeout: Duration::from_secs(5),
            ready_timeout: Duration::from_secs(5),
            ready_poll_interval: Duration::from_millis(100),
            spawn_timeout: Duration::from_secs(10),
            spawn_poll_interval: Duration::from_millis(100),
            terminate_grace: Duration::from_secs(2),
            kill_grace: Duration::from_secs(1),
            max_in_flight: 2,
            username: "user".to_string(),
            runtime_dir: env::temp_dir(),
            strict_signatures: false,
        }
    }
}

impl ClientConfig {
    /// Defaults overridden by `NOTEPORT_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var_os(name))
    }

    /// Defaults overridden by whatever `lookup` returns for each `NOTEPORT_*` name.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<OsString>) -> Self {
        let mut config = Self::default();

        if let Some(ms) = parse_var::<u64>(&lookup, POLL_INTERVAL_VAR) {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, EXECUTION_DEADLINE_VAR) {
            config.execution_deadline = Some(Duration::from_secs(secs));
        }
        if let Some(dir) = lookup(RUNTIME_DIR_VAR) {
            config.runtime_dir = PathBuf::from(dir);
        }
        if let Some(strict) = parse_var::<bool>(&lookup, STRICT_SIGNATURES_VAR) {
            config.strict_signatures = strict;
        }

        config
    }

    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[must_use]
    pub fn slow_execution_warning(mut self, after: Duration) -> Self {
        self.slow_execution_warning = after;
        self
    }

    #[must_use]
    pub fn execution_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.execution_deadline = deadline;
        self
    }

    #[must_use]
    pub fn drain_limit(mut self, limit: usize) -> Self {
        self.drain_limit = limit;
        self
    }

    #[must_use]
    pub fn ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    #[must_use]
    pub fn spawn_timeout(mut self, timeout: Duration) -> Self {
        self.spawn_timeout = timeout;
        self
    }

    #[must_use]
    pub fn shutdown_grace(mut self, terminate: Duration, kill: Duration) -> Self {
        self.terminate_grace = terminate;
        self.kill_grace = kill;
        self
    }

    #[must_use]
    pub fn max_in_flight(mut self, n: usize) -> Self {
        self.max_in_flight = n.max(1);
        self
    }

    #[must_use]
    pub fn runtime_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runtime_dir = dir.into();
        self
    }

    #[must_use]
    pub fn strict_signatures(mut self, strict: bool) -> Self {
        self.strict_signatures = strict;
        self
    }
}

fn parse_var<T: FromStr>(lookup: impl Fn(&str) -> Option<OsString>, name: &str) -> Option<T> {
    let raw = lookup(name)?;
    let parsed = raw.to_str().and_then(|value| value.trim().parse().ok());
    if parsed.is_none() {
        warn!(var = name, value = ?raw, "ignoring malformed environment override");
    }
    parsed
}
