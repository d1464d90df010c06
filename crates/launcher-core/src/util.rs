//! Small helpers shared by the spawner and the broker

use std::env;
use std::ffi::OsString;
use std::path::PathBuf;

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;

use crate::{LauncherError, Result};

/// Directory under the runtime dir holding the launcher sockets
pub const SOCKET_DIR: &str = "launcher";

/// Normalize a reaped wait status: exit code, or 128 + signal number.
///
/// Returns `None` for statuses that are not a termination (stopped, continued, still alive).
pub fn normalize_wait_status(status: WaitStatus) -> Option<(Pid, i32)> {
    match status {
        WaitStatus::Exited(pid, code) => Some((pid, code)),
        WaitStatus::Signaled(pid, signal, _) => Some((pid, 128 + signal as i32)),
        _ => None,
    }
}

/// Describe a normalized exit status for logs and error messages
pub fn describe_exit_status(status: i32) -> String {
    if status > 128 {
        if let Ok(signal) = Signal::try_from(status - 128) {
            return format!("killed by signal {}", signal.as_str());
        }
    }
    format!("exited with code {}", status)
}

/// Split a `NAME=value` entry. Entries without `=` or with an empty name are rejected.
pub fn split_env_entry(entry: &str) -> Option<(&str, &str)> {
    let (name, value) = entry.split_once('=')?;
    if name.is_empty() {
        return None;
    }
    Some((name, value))
}

/// Apply `NAME=value` overrides on top of `base`. Later entries win.
///
/// The base is kept as `OsString` pairs since an inherited environment need
/// not be valid UTF-8.
pub fn merge_env_overrides(
    mut base: Vec<(OsString, OsString)>,
    overrides: &[String],
) -> Vec<(OsString, OsString)> {
    for entry in overrides {
        let Some((key, value)) = split_env_entry(entry) else {
            continue;
        };
        if let Some((_, existing)) = base.iter_mut().find(|(k, _)| k == key) {
            *existing = OsString::from(value);
        } else {
            base.push((OsString::from(key), OsString::from(value)));
        }
    }
    base
}

/// Look up a variable in a list of `NAME=value` overrides, last entry wins
pub fn lookup_env_override<'a>(overrides: &'a [String], name: &str) -> Option<&'a str> {
    overrides
        .iter()
        .rev()
        .filter_map(|entry| split_env_entry(entry))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v)
}

/// Startup tokens `""` and `"0"` mean "no startup notification"
pub fn is_startup_token(token: &str) -> bool {
    !token.is_empty() && token != "0"
}

/// Runtime directory for sockets: `$XDG_RUNTIME_DIR/launcher`, else `$HOME/.launcher`
pub fn runtime_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_RUNTIME_DIR").filter(|d| !d.is_empty()) {
        return Ok(PathBuf::from(dir).join(SOCKET_DIR));
    }
    match env::var_os("HOME").filter(|d| !d.is_empty()) {
        Some(home) => Ok(PathBuf::from(home).join(format!(".{}", SOCKET_DIR))),
        None => Err(LauncherError::InvalidConfig(
            "neither XDG_RUNTIME_DIR nor HOME is set".to_string(),
        )),
    }
}

/// Default path of a named socket inside the runtime directory
pub fn default_socket_path(name: &str) -> Result<PathBuf> {
    Ok(runtime_dir()?.join(name))
}
