//! Flushing tracked connections of addresses that lose their permit.

use dflow_types::IpAddress;
use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::process::Command;

pub const CONNTRACK_CMD: &str = "/usr/sbin/conntrack";

#[derive(Debug, Error)]
pub enum ConntrackError {
    #[error("no async runtime to run {command}")]
    NoRuntime { command: String },

    #[error("failed to run {command}: {source}")]
    Exec {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Removes conntrack entries of an address within a zone.
pub trait ConntrackHelper: Send {
    fn flush(&self, address: IpAddress, zone: u16) -> Result<(), ConntrackError>;
}

static SHELL_ESCAPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([$`"\\\n])"#).expect("valid shell escape pattern"));

/// Double-quotes `s` for `/bin/sh`, escaping what is special inside quotes.
pub fn shellquote(s: &str) -> String {
    format!("\"{}\"", SHELL_ESCAPE_RE.replace_all(s, r"\$1"))
}

/// Runs the `conntrack` utility in the background on the current tokio
/// runtime. Exit status is only logged.
#[derive(Debug, Clone)]
pub struct ShellConntrack {
    command: String,
}

impl Default for ShellConntrack {
    fn default() -> Self {
        Self::new(CONNTRACK_CMD)
    }
}

impl ShellConntrack {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    /// Deletes entries sourced from and destined to `address`.
    pub fn command_line(&self, address: IpAddress, zone: u16) -> String {
        let family = if address.is_ipv6() { " -f ipv6" } else { "" };
        let address = shellquote(&address.to_string());
        let base = format!("{} -D -w {}{}", self.command, zone, family);
        format!("{base} -s {address}; {base} -d {address}")
    }
}

impl ConntrackHelper for ShellConntrack {
    fn flush(&self, address: IpAddress, zone: u16) -> Result<(), ConntrackError> {
        let cmd = self.command_line(address, zone);
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| ConntrackError::NoRuntime { command: cmd.clone() })?;

        runtime.spawn(async move {
            let output = Command::new("/bin/sh")
                .arg("-c")
                .arg(&cmd)
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .output()
                .await
                .map_err(|e| ConntrackError::Exec {
                    command: cmd.clone(),
                    source: e,
                });
            match output {
                // conntrack exits non-zero when nothing matched
                Ok(output) if output.status.success() => debug!("conntrack: {} done", cmd),
                Ok(output) => debug!(
                    "conntrack: {} exited with {:?}: {}",
                    cmd,
                    output.status.code(),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
                Err(e) => warn!("conntrack: {}", e),
            }
        });
        Ok(())
    }
}

/// Records flush requests instead of running anything.
#[derive(Debug, Clone, Default)]
pub struct RecordingConntrack {
    calls: Arc<Mutex<Vec<(IpAddress, u16)>>>,
}

impl RecordingConntrack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<(IpAddress, u16)> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

impl ConntrackHelper for RecordingConntrack {
    fn flush(&self, address: IpAddress, zone: u16) -> Result<(), ConntrackError> {
        let mut calls = self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        calls.push((address, zone));
        Ok(())
    }
}

/// Used when conntrack flushing is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullConntrack;

impl ConntrackHelper for NullConntrack {
    fn flush(&self, _address: IpAddress, _zone: u16) -> Result<(), ConntrackError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_shellquote() {
        assert_eq!(shellquote("10.0.0.1"), "\"10.0.0.1\"");
        assert_eq!(shellquote("a$b`c\"d"), "\"a\\$b\\`c\\\"d\"");
    }

    #[test]
    fn test_command_line() {
        let helper = ShellConntrack::default();
        assert_eq!(
            helper.command_line(IpAddress::v4(10, 0, 0, 5), 7),
            "/usr/sbin/conntrack -D -w 7 -s \"10.0.0.5\"; /usr/sbin/conntrack -D -w 7 -d \"10.0.0.5\""
        );
        let v6: IpAddress = "fd00::5".parse().unwrap();
        assert!(helper.command_line(v6, 7).contains("-w 7 -f ipv6 -s \"fd00::5\""));
    }

    #[test]
    fn test_flush_outside_runtime_fails() {
        let helper = ShellConntrack::new("/bin/true");
        assert!(matches!(
            helper.flush(IpAddress::v4(10, 0, 0, 5), 1),
            Err(ConntrackError::NoRuntime { .. })
        ));
    }

    #[test]
    fn test_recording_helper_shares_calls() {
        let helper = RecordingConntrack::new();
        let observer = helper.clone();
        helper.flush(IpAddress::v4(10, 0, 0, 5), 3).unwrap();
        assert_eq!(observer.calls(), vec![(IpAddress::v4(10, 0, 0, 5), 3)]);
    }
}
