//! Discovery, spawning and teardown of kernel processes.

use std::{
    collections::BTreeMap,
    env, fmt, io, iter,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    time::Duration,
};

use serde::Deserialize;
use thiserror::Error;
use tokio::{
    fs,
    io::{AsyncBufReadExt, BufReader},
    process::{Child, Command},
    time::{sleep, timeout, Instant},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    client::{ClientError, KernelClient},
    config::ClientConfig,
    connection::ConnectionInfo,
};

pub const START_SCRIPT_NAME: &str = "start_kernel.sh";
const START_SCRIPT_VAR: &str = "NOTEPORT_START_KERNEL_SCRIPT";

const CONNECTION_FILE_PREFIX: &str = "KERNEL_CONNECTION_FILE=";
const PID_PREFIX: &str = "KERNEL_PID=";

const EXIT_POLL: Duration = Duration::from_millis(50);
const DELETE_RETRY_DELAY: Duration = Duration::from_millis(200);

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("i/o error while supervising kernel: {0}")]
    Io(#[from] io::Error),
    #[error("{program} exited with {status}: {stderr}")]
    CommandFailed {
        program: PathBuf,
        status: ExitStatus,
        stderr: String,
    },
    #[error("malformed kernel spec listing: {0}")]
    Discovery(#[source] serde_json::Error),
    #[error("could not find an executable start_kernel.sh")]
    StartScriptNotFound,
    #[error("start script failed with {0}")]
    ScriptFailed(ExitStatus),
    #[error("start script did not output a connection file path")]
    NoConnectionFile,
    #[error("connection file was not created within {0:?}")]
    SpawnTimeout(Duration),
    #[error("kernel process exited prematurely with {0}")]
    PrematureExit(ExitStatus),
    #[error(transparent)]
    Client(#[from] ClientError),
}

/// An installed kernel, as listed by `jupyter kernelspec list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSpec {
    pub name: String,
    pub display_name: String,
    pub resource_dir: PathBuf,
}

impl fmt::Display for KernelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.display_name, self.name)
    }
}

#[derive(Deserialize)]
struct KernelSpecListing {
    kernelspecs: BTreeMap<String, KernelSpecEntry>,
}

#[derive(Deserialize)]
struct KernelSpecEntry {
    resource_dir: PathBuf,
    spec: KernelSpecFile,
}

#[derive(Deserialize)]
struct KernelSpecFile {
    display_name: String,
}

pub fn launcher_path(env_root: &Path) -> PathBuf {
    env_root.join("bin").join("jupyter")
}

/// Lists the kernels installed in an environment. Never fails: a missing
/// launcher or a broken listing yields an empty map.
pub async fn discover_kernels(env_root: impl AsRef<Path>) -> BTreeMap<String, KernelSpec> {
    let env_root = env_root.as_ref();
    if env_root.as_os_str().is_empty() {
        return BTreeMap::new();
    }

    let launcher = launcher_path(env_root);
    if !launcher.exists() {
        debug!(launcher = %launcher.display(), "no kernel launcher in environment");
        return BTreeMap::new();
    }

    match list_kernel_specs(env_root, &launcher).await {
        Ok(kernels) => kernels,
        Err(e) => {
            warn!(env = %env_root.display(), error = %e, "could not discover kernels");
            BTreeMap::new()
        }
    }
}

async fn list_kernel_specs(
    env_root: &Path,
    launcher: &Path,
) -> Result<BTreeMap<String, KernelSpec>, LifecycleError> {
    let mut command = Command::new(launcher);
    command
        .args(["kernelspec", "list", "--json"])
        .stdin(Stdio::null());
    prepare_environment(&mut command, env_root);

    let output = command.output().await.map_err(|source| LifecycleError::Spawn {
        program: launcher.to_path_buf(),
        source,
    })?;
    if !output.status.success() {
        return Err(LifecycleError::CommandFailed {
            program: launcher.to_path_buf(),
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    if output.stdout.iter().all(u8::is_ascii_whitespace) {
        return Ok(BTreeMap::new());
    }

    let listing: KernelSpecListing =
        serde_json::from_slice(&output.stdout).map_err(LifecycleError::Discovery)?;

    Ok(listing
        .kernelspecs
        .into_iter()
        .map(|(name, entry)| {
            let spec = KernelSpec {
                name: name.clone(),
                display_name: entry.spec.display_name,
                resource_dir: entry.resource_dir,
            };
            (name, spec)
        })
        .collect())
}

/// Puts the environment's `bin` first on `PATH` and marks it active.
fn prepare_environment(command: &mut Command, env_root: &Path) {
    let bin = env_root.join("bin");
    let path = match env::var_os("PATH") {
        Some(existing) => env::join_paths(iter::once(bin.clone()).chain(env::split_paths(&existing)))
            .unwrap_or_else(|_| bin.into_os_string()),
        None => bin.into_os_string(),
    };

    command.env("PATH", path).env("VIRTUAL_ENV", env_root);
}

/// Finds `start_kernel.sh`: an explicit override first, then the working
/// directory, then next to the executable and up to two levels above it.
pub fn locate_start_script() -> Option<PathBuf> {
    let mut candidates: Vec<PathBuf> = env::var_os(START_SCRIPT_VAR)
        .map(PathBuf::from)
        .into_iter()
        .collect();

    if let Ok(cwd) = env::current_dir() {
        candidates.push(cwd.join(START_SCRIPT_NAME));
    }
    if let Some(exe_dir) = env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        candidates.extend(exe_dir.ancestors().take(3).map(|dir| dir.join(START_SCRIPT_NAME)));
    }

    first_executable(candidates)
}

fn first_executable(candidates: impl IntoIterator<Item = PathBuf>) -> Option<PathBuf> {
    candidates.into_iter().find(|path| is_executable(path))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Sentinel lines printed by the start script.
#[derive(Debug, Default, PartialEq, Eq)]
struct ScriptReport {
    connection_file: Option<PathBuf>,
    pid: Option<u32>,
}

impl ScriptReport {
    fn observe(&mut self, line: &str) {
        if let Some(path) = line.strip_prefix(CONNECTION_FILE_PREFIX) {
            self.connection_file = Some(PathBuf::from(path.trim()));
        } else if let Some(pid) = line.strip_prefix(PID_PREFIX) {
            match pid.trim().parse() {
                Ok(pid) => {
                    info!(pid, "captured kernel pid");
                    self.pid = Some(pid);
                }
                Err(e) => warn!(line, error = %e, "failed to parse kernel pid"),
            }
        }
    }
}

/// Starts a kernel through the located `start_kernel.sh`.
pub async fn start_kernel_directly(
    env_root: impl AsRef<Path>,
    config: ClientConfig,
) -> Result<KernelClient, LifecycleError> {
    let script = locate_start_script().ok_or(LifecycleError::StartScriptNotFound)?;
    start_kernel_with_script(&script, env_root, config).await
}

/// Runs `script <env_root>`, reads the connection file and kernel pid it
/// reports, then connects and waits for the kernel to answer.
pub async fn start_kernel_with_script(
    script: &Path,
    env_root: impl AsRef<Path>,
    config: ClientConfig,
) -> Result<KernelClient, LifecycleError> {
    let env_root = env_root.as_ref();
    info!(script = %script.display(), env = %env_root.display(), "starting kernel via start script");

    let mut child = Command::new(script)
        .arg(env_root)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|source| LifecycleError::Spawn {
            program: script.to_path_buf(),
            source,
        })?;

    let mut report = ScriptReport::default();
    if let Some(stdout) = child.stdout.take() {
        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await? {
            debug!(line, "start script output");
            report.observe(&line);
        }
    }

    let status = child.wait().await?;
    if !status.success() {
        return Err(LifecycleError::ScriptFailed(status));
    }
    let connection_file = report
        .connection_file
        .ok_or(LifecycleError::NoConnectionFile)?;
    if report.pid.is_none() {
        warn!("start script did not report a kernel pid");
    }

    let process = KernelProcess::from_pid(report.pid, connection_file.clone());
    let mut client = match KernelClient::connect(&connection_file, config.clone()).await {
        Ok(client) => client,
        Err(e) => {
            process.shutdown(&config).await;
            return Err(e.into());
        }
    };
    client.adopt_process(process);

    ready_or_shutdown(client).await
}

/// Launches `jupyter kernel` for `kernel_name` inside `env_root` and waits
/// for it to write its connection file and answer a readiness request.
pub async fn start_kernel(
    kernel_name: &str,
    env_root: impl AsRef<Path>,
    config: ClientConfig,
) -> Result<KernelClient, LifecycleError> {
    let env_root = env_root.as_ref();
    info!(kernel = kernel_name, env = %env_root.display(), "starting kernel");

    let connection_file = config
        .runtime_dir
        .join(format!("kernel_{}.json", Uuid::new_v4()));
    let launcher = launcher_path(env_root);

    let mut command = Command::new(&launcher);
    command
        .arg("kernel")
        .arg(format!("--kernel={kernel_name}"))
        .arg(format!(
            "--KernelManager.connection_file={}",
            connection_file.display()
        ))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    prepare_environment(&mut command, env_root);
    command.env_remove("PYTHONHOME").env_remove("PYTHONPATH");

    let child = command.spawn().map_err(|source| LifecycleError::Spawn {
        program: launcher.clone(),
        source,
    })?;
    let pid = match child.id() {
        Some(pid) => Some(pid),
        None => lookup_pid(&connection_file).await,
    };
    match pid {
        Some(pid) => info!(pid, "kernel started"),
        None => warn!("could not determine kernel pid"),
    }

    let mut process = KernelProcess::new(Some(child), pid, connection_file.clone());
    if let Err(e) = wait_for_connection_file(&mut process, &config).await {
        process.shutdown(&config).await;
        return Err(e);
    }

    let mut client = match KernelClient::connect(&connection_file, config.clone()).await {
        Ok(client) => client,
        Err(e) => {
            process.shutdown(&config).await;
            return Err(e.into());
        }
    };
    client.adopt_process(process);

    ready_or_shutdown(client).await
}

/// Finds a process by the connection file on its command line.
async fn lookup_pid(connection_file: &Path) -> Option<u32> {
    let output = Command::new("pgrep")
        .arg("-f")
        .arg(connection_file)
        .output()
        .await
        .ok()?;

    String::from_utf8_lossy(&output.stdout)
        .lines()
        .find_map(|line| line.trim().parse().ok())
}

async fn wait_for_connection_file(
    process: &mut KernelProcess,
    config: &ClientConfig,
) -> Result<(), LifecycleError> {
    let path = process.connection_file().to_path_buf();
    info!(path = %path.display(), "waiting for connection file");

    let deadline = Instant::now() + config.spawn_timeout;
    loop {
        // A file that exists but does not parse yet is still being written.
        if ConnectionInfo::from_file(&path).is_ok() {
            return Ok(());
        }
        if let Some(status) = process.try_exit_status() {
            return Err(LifecycleError::PrematureExit(status));
        }
        if Instant::now() >= deadline {
            return Err(LifecycleError::SpawnTimeout(config.spawn_timeout));
        }
        sleep(config.spawn_poll_interval).await;
    }
}

async fn ready_or_shutdown(mut client: KernelClient) -> Result<KernelClient, LifecycleError> {
    match client.wait_until_ready().await {
        Ok(()) => Ok(client),
        Err(e) => {
            warn!(error = %e, "kernel did not become ready, shutting it down");
            client.shutdown().await;
            Err(e.into())
        }
    }
}

/// The OS side of a kernel: an owned child, a bare pid, or both, plus the
/// connection file that goes away with it.
#[derive(Debug)]
pub struct KernelProcess {
    child: Option<Child>,
    pid: Option<u32>,
    connection_file: PathBuf,
}

impl KernelProcess {
    pub fn new(child: Option<Child>, pid: Option<u32>, connection_file: PathBuf) -> Self {
        let pid = pid.or_else(|| child.as_ref().and_then(Child::id));
        Self {
            child,
            pid,
            connection_file,
        }
    }

    pub fn from_child(child: Child, connection_file: PathBuf) -> Self {
        Self::new(Some(child), None, connection_file)
    }

    pub fn from_pid(pid: Option<u32>, connection_file: PathBuf) -> Self {
        Self::new(None, pid, connection_file)
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn connection_file(&self) -> &Path {
        &self.connection_file
    }

    fn try_exit_status(&mut self) -> Option<ExitStatus> {
        self.child.as_mut()?.try_wait().ok().flatten()
    }

    /// Sends SIGINT. Returns whether the signalling command succeeded.
    pub async fn interrupt(&self) -> bool {
        let Some(pid) = self.pid else {
            warn!("cannot interrupt kernel: no process id available");
            return false;
        };

        info!(pid, "interrupting kernel");
        match send_signal(pid, "-INT").await {
            Ok(status) => {
                info!(pid, %status, "interrupt command finished");
                status.success()
            }
            Err(e) => {
                warn!(pid, error = %e, "error interrupting kernel");
                false
            }
        }
    }

    /// Terminates the process with escalating force, then removes the
    /// connection file. Failures are logged, never returned.
    pub async fn shutdown(mut self, config: &ClientConfig) {
        match (self.child.as_mut(), self.pid) {
            (Some(child), pid) => terminate_child(child, pid, config).await,
            (None, Some(pid)) => terminate_pid(pid, config).await,
            (None, None) => info!("no kernel process or pid to terminate"),
        }

        remove_connection_file(&self.connection_file).await;
    }
}

async fn send_signal(pid: u32, signal: &str) -> io::Result<ExitStatus> {
    Command::new("kill")
        .arg(signal)
        .arg(pid.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
}

async fn terminate_child(child: &mut Child, pid: Option<u32>, config: &ClientConfig) {
    match child.try_wait() {
        Ok(Some(status)) => {
            info!(%status, "kernel process already exited");
            return;
        }
        Ok(None) => {}
        Err(e) => warn!(error = %e, "could not query kernel process state"),
    }

    if let Some(pid) = pid {
        info!(pid, "terminating kernel process");
        match send_signal(pid, "-TERM").await {
            Ok(_) => match timeout(config.terminate_grace, child.wait()).await {
                Ok(Ok(status)) => {
                    info!(%status, "kernel process terminated gracefully");
                    return;
                }
                Ok(Err(e)) => warn!(error = %e, "error waiting for kernel process"),
                Err(_) => info!("kernel process did not terminate gracefully, forcing termination"),
            },
            Err(e) => warn!(pid, error = %e, "could not send SIGTERM"),
        }
    }

    if let Err(e) = child.start_kill() {
        warn!(error = %e, "could not kill kernel process");
    }
    match timeout(config.kill_grace, child.wait()).await {
        Ok(Ok(status)) => info!(%status, "kernel process terminated forcefully"),
        Ok(Err(e)) => warn!(error = %e, "error waiting for killed kernel process"),
        Err(_) => error!(?pid, "failed to terminate kernel process even forcefully"),
    }
}

async fn terminate_pid(pid: u32, config: &ClientConfig) {
    info!(pid, "terminating kernel by pid");
    match send_signal(pid, "-TERM").await {
        Ok(status) if status.success() => {}
        Ok(status) => {
            info!(pid, %status, "kernel process could not be signalled, assuming it exited");
            return;
        }
        Err(e) => warn!(pid, error = %e, "could not send SIGTERM"),
    }
    if wait_for_exit(pid, config.terminate_grace).await {
        info!(pid, "kernel process terminated via SIGTERM");
        return;
    }

    info!(pid, "kernel process did not respond to SIGTERM, sending SIGKILL");
    if let Err(e) = send_signal(pid, "-KILL").await {
        warn!(pid, error = %e, "could not send SIGKILL");
    }
    if wait_for_exit(pid, config.kill_grace).await {
        info!(pid, "kernel process killed via SIGKILL");
    } else {
        error!(pid, "kernel process still running after SIGKILL");
    }
}

/// A zombie counts as exited: it is gone once its parent reaps it.
async fn is_alive(pid: u32) -> bool {
    let signalled = send_signal(pid, "-0")
        .await
        .map(|status| status.success())
        .unwrap_or(false);

    signalled && !is_zombie(pid).await
}

async fn is_zombie(pid: u32) -> bool {
    Command::new("ps")
        .args(["-o", "stat=", "-p", &pid.to_string()])
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .await
        .map(|output| {
            String::from_utf8_lossy(&output.stdout)
                .trim_start()
                .starts_with('Z')
        })
        .unwrap_or(false)
}

async fn wait_for_exit(pid: u32, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    loop {
        if !is_alive(pid).await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(EXIT_POLL).await;
    }
}

/// Deletes the connection file, retrying once after a short delay.
async fn remove_connection_file(path: &Path) {
    for attempt in 1..=2 {
        match fs::remove_file(path).await {
            Ok(()) => {
                info!(path = %path.display(), attempt, "deleted connection file");
                return;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "connection file already removed");
                return;
            }
            Err(e) if attempt == 1 => {
                debug!(path = %path.display(), error = %e, "retrying connection file deletion");
                sleep(DELETE_RETRY_DELAY).await;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to delete connection file");
            }
        }
    }
}
