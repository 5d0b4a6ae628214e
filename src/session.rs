/// Single sampling session: attach the external profiler to a pid for a fixed
/// duration and have it write a trace file.
use crate::config::SamplerConfig;
use crate::runner::CommandRunner;
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Outcome of one session, consumed by the upload step of the same cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionResult {
    pub success: bool,
    /// Where the trace was (or would have been) written. Only guaranteed to
    /// exist when `success` is true.
    pub output_path: PathBuf,
}

/// Build the sampler arguments, replacing `{pid}`, `{output}` and `{duration}`.
fn build_args(config: &SamplerConfig, pid: u32, duration: Duration, output: &Path) -> Vec<String> {
    let pid = pid.to_string();
    let secs = duration.as_secs().to_string();
    let output = output.to_string_lossy();
    config
        .args
        .iter()
        .map(|arg| {
            arg.replace("{pid}", &pid)
                .replace("{duration}", &secs)
                .replace("{output}", &output)
        })
        .collect()
}

/// Whether `pid` names a live process (signal 0).
pub fn is_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        // Exists, but owned by someone else
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Runs bounded sampling sessions through a [`CommandRunner`].
pub struct SessionExecutor {
    runner: Arc<dyn CommandRunner>,
    config: SamplerConfig,
}

impl SessionExecutor {
    pub fn new(runner: Arc<dyn CommandRunner>, config: SamplerConfig) -> Self {
        Self { runner, config }
    }

    /// Sample `pid` for `duration`, writing to `output_path`.
    ///
    /// Returns true iff the sampler exited with status 0. A dead pid, a
    /// missing sampler binary, or a non-zero exit all return false.
    pub async fn run(&self, pid: u32, duration: Duration, output_path: &Path) -> bool {
        if !is_alive(pid) {
            tracing::warn!(pid, "target process is gone, skipping session");
            return false;
        }

        let args = build_args(&self.config, pid, duration, output_path);
        tracing::info!(
            command = %self.config.command,
            args = ?args,
            output = %output_path.display(),
            "starting profiler session"
        );

        let start = Instant::now();
        let result = self.runner.run(&self.config.command, &args).await;
        let elapsed = start.elapsed();

        match result {
            Ok(out) if out.success() => {
                tracing::info!(
                    pid,
                    duration_secs = elapsed.as_secs(),
                    "profiler session complete"
                );
                true
            }
            Ok(out) => {
                tracing::warn!(
                    pid,
                    exit_code = ?out.exit_code,
                    duration_secs = elapsed.as_secs(),
                    "profiler session failed"
                );
                false
            }
            Err(e) => {
                tracing::warn!(
                    command = %self.config.command,
                    error = %e,
                    "failed to start profiler"
                );
                false
            }
        }
    }
}
