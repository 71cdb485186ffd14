#![allow(dead_code)]

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use noteport_kernel::ClientConfig;

pub fn write_connection_file(dir: &Path, json: &str) -> PathBuf {
    let path = dir.join(format!("kernel_{}.json", uuid::Uuid::new_v4()));
    fs::write(&path, json).unwrap();
    path
}

#[cfg(unix)]
pub fn write_script(path: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, format!("#!/bin/sh\n{body}")).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
    path.to_path_buf()
}

pub fn fast_config(runtime_dir: &Path) -> ClientConfig {
    ClientConfig::default()
        .poll_interval(Duration::from_millis(20))
        .ready_timeout(Duration::from_secs(5))
        .spawn_timeout(Duration::from_secs(5))
        .shutdown_grace(Duration::from_millis(500), Duration::from_millis(500))
        .runtime_dir(runtime_dir)
}

/// Whether `pid` is a live process. Zombies awaiting reaping count as gone.
pub fn is_running(pid: u32) -> bool {
    let pid = pid.to_string();
    let signalled = std::process::Command::new("kill")
        .args(["-0", &pid])
        .stderr(std::process::Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false);
    let zombie = std::process::Command::new("ps")
        .args(["-o", "stat=", "-p", &pid])
        .output()
        .map(|output| String::from_utf8_lossy(&output.stdout).trim_start().starts_with('Z'))
        .unwrap_or(false);

    signalled && !zombie
}
