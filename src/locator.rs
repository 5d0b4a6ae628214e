/// Process discovery: list running processes and pick the one for a role.
use crate::config::LocatorConfig;
use crate::role::{ComponentRole, Signature};
use crate::runner::CommandRunner;
use std::sync::Arc;

/// One line of a process listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRecord {
    pub pid: u32,
    /// Full invocation string.
    pub command: String,
}

/// Parse `pid args...` lines (the `ps -o pid=,args=` shape).
///
/// Lines that don't start with a numeric pid (headers, blanks) are skipped.
pub fn parse_listing(stdout: &str) -> Vec<ProcessRecord> {
    stdout
        .lines()
        .filter_map(|line| {
            let line = line.trim_start();
            let (pid, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
            let pid = pid.parse().ok()?;
            Some(ProcessRecord {
                pid,
                command: rest.trim().to_string(),
            })
        })
        .collect()
}

/// Finds the target process for a [`ComponentRole`].
pub struct ProcessLocator {
    runner: Arc<dyn CommandRunner>,
    config: LocatorConfig,
    own_pid: u32,
}

impl ProcessLocator {
    pub fn new(runner: Arc<dyn CommandRunner>, config: LocatorConfig) -> Self {
        Self {
            runner,
            config,
            own_pid: std::process::id(),
        }
    }

    /// The substring a matching command line must contain, if the role has one.
    fn needle<'a>(&'a self, role: &ComponentRole) -> Option<&'a str> {
        if let Some(sig) = self.config.signature.as_deref() {
            return Some(sig);
        }
        match role.signature() {
            Signature::Static(s) => Some(s),
            Signature::Active | Signature::Unknown => None,
        }
    }

    /// Pick the first record whose command line carries the role's signature.
    pub fn select(&self, records: &[ProcessRecord], role: &ComponentRole) -> Option<u32> {
        let Some(needle) = self.needle(role) else {
            tracing::debug!(role = %role, "role has no static process signature");
            return None;
        };

        let mut matches = records
            .iter()
            .filter(|r| r.pid != self.own_pid && r.command.contains(needle));
        let first = matches.next()?;
        let others = matches.count();
        if others > 0 {
            tracing::warn!(
                role = %role,
                matches = others + 1,
                pid = first.pid,
                "multiple processes match, using the first"
            );
        }
        tracing::info!(pid = first.pid, command = %first.command, "identified target process");
        Some(first.pid)
    }

    /// Enumerate processes and return the target pid, or None when not found.
    ///
    /// Enumeration failures are logged and reported as not found.
    pub async fn locate(&self, role: &ComponentRole) -> Option<u32> {
        let output = match self.runner.run(&self.config.command, &self.config.args).await {
            Ok(out) if out.success() => out,
            Ok(out) => {
                tracing::warn!(
                    command = %self.config.command,
                    exit_code = ?out.exit_code,
                    "process listing exited with failure"
                );
                return None;
            }
            Err(e) => {
                tracing::warn!(
                    command = %self.config.command,
                    error = %e,
                    "failed to list processes"
                );
                return None;
            }
        };

        let records = parse_listing(&output.stdout);
        tracing::debug!(count = records.len(), "found processes");
        for record in &records {
            tracing::debug!(pid = record.pid, command = %record.command, "process");
        }

        self.select(&records, role)
    }
}
