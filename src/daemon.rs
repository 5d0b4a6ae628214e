//! The profiling loop.
//!
//! Each cycle: resolve the output directory, locate the target process, run a
//! sampling session, upload the trace if the session succeeded, then sweep
//! old traces. [`Daemon::run`] repeats cycles with a fixed sleep in between
//! until the shutdown token fires.

use crate::config::Settings;
use crate::layout::OutputLayout;
use crate::locator::ProcessLocator;
use crate::retention::{self, SweepReport};
use crate::runner::CommandRunner;
use crate::session::{SessionExecutor, SessionResult};
use crate::signals::Shutdown;
use crate::status::{DaemonState, StatusTracker};
use crate::timestamp::trace_file_name;
use crate::upload::Uploader;
use chrono::NaiveDateTime;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Source of the local wall-clock time used for names and retention.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        chrono::Local::now().naive_local()
    }
}

/// What one cycle did. Transient: nothing here survives into the next cycle.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub target_pid: Option<u32>,
    /// Output path of the session that ran this cycle, if any.
    pub trace: Option<PathBuf>,
    pub session_ok: bool,
    pub uploaded: bool,
    pub sweep: Option<SweepReport>,
    /// Shutdown was requested before the cycle finished.
    pub interrupted: bool,
}

impl CycleReport {
    /// One summary line per cycle.
    pub fn log(&self, cycle: u64) {
        tracing::info!(
            cycle,
            target_pid = ?self.target_pid,
            trace = ?self.trace,
            session_ok = self.session_ok,
            uploaded = self.uploaded,
            deleted = ?self.sweep.map(|r| r.deleted),
            remaining = ?self.sweep.map(|r| r.remaining),
            interrupted = self.interrupted,
            "cycle finished"
        );
    }
}

pub struct Daemon {
    settings: Settings,
    layout: OutputLayout,
    locator: ProcessLocator,
    executor: SessionExecutor,
    uploader: Arc<dyn Uploader>,
    clock: Arc<dyn Clock>,
    status: Option<StatusTracker>,
    cycle: u64,
}

impl Daemon {
    pub fn new(
        settings: Settings,
        runner: Arc<dyn CommandRunner>,
        uploader: Arc<dyn Uploader>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let layout = OutputLayout::from_identity(&settings.identity);
        let locator = ProcessLocator::new(runner.clone(), settings.config.locator.clone());
        let executor = SessionExecutor::new(runner, settings.config.sampler.clone());
        let status = settings
            .config
            .status
            .file
            .as_ref()
            .map(|path| StatusTracker::new(path.clone()));

        Self {
            settings,
            layout,
            locator,
            executor,
            uploader,
            clock,
            status,
            cycle: 0,
        }
    }

    pub fn layout(&self) -> &OutputLayout {
        &self.layout
    }

    fn set_state(&self, state: DaemonState) {
        tracing::debug!(?state, cycle = self.cycle, "state transition");
        if let Some(status) = &self.status {
            status.update(state);
        }
    }

    fn with_status(&mut self, f: impl FnOnce(&mut StatusTracker)) {
        if let Some(status) = self.status.as_mut() {
            f(status);
        }
    }

    /// Run one full cycle. Never fails: every error is logged and absorbed.
    pub async fn run_cycle(&mut self, shutdown: &mut Shutdown) -> CycleReport {
        self.cycle += 1;
        let cycle = self.cycle;
        self.with_status(|s| s.set_cycle(cycle));
        let mut report = CycleReport::default();

        let dir = match self.layout.ensure_output_dir() {
            Ok(dir) => dir,
            Err(e) => {
                tracing::error!(
                    dir = %self.layout.output_dir().display(),
                    error = %e,
                    "unable to create output directory, skipping cycle"
                );
                return report;
            }
        };

        self.set_state(DaemonState::Locating);
        let role = &self.settings.identity.component;
        report.target_pid = self.locator.locate(role).await;
        let target_pid = report.target_pid;
        self.with_status(|s| s.set_target_pid(target_pid));

        match report.target_pid {
            Some(pid) => {
                if shutdown.is_triggered() {
                    report.interrupted = true;
                    return report;
                }
                let Some(session) = self.sample(pid, shutdown).await else {
                    report.interrupted = true;
                    return report;
                };
                if session.success {
                    report.uploaded = self.upload(&session.output_path).await;
                } else {
                    tracing::info!("profiler session failed, skipping upload");
                }
                report.session_ok = session.success;
                report.trace = Some(session.output_path);
            }
            None => {
                tracing::info!(
                    component = %self.settings.identity.component,
                    "unable to find target process"
                );
            }
        }

        report.sweep = self.sweep(&dir);
        report
    }

    /// EXECUTE. Returns None if shutdown interrupted the session.
    async fn sample(&mut self, pid: u32, shutdown: &mut Shutdown) -> Option<SessionResult> {
        let extension = &self.settings.config.sampler.extension;
        let file_name = trace_file_name(pid, self.clock.now(), extension);
        let output_path = self.layout.trace_path(&file_name);
        let duration = self.settings.config.schedule.session_duration();

        self.set_state(DaemonState::Sampling);
        tracing::info!(
            pid,
            duration_secs = duration.as_secs(),
            output = %output_path.display(),
            "executing profiler session"
        );

        let success = tokio::select! {
            ok = self.executor.run(pid, duration, &output_path) => ok,
            _ = shutdown.wait() => {
                tracing::info!(pid, "shutdown requested, abandoning profiler session");
                return None;
            }
        };

        if success {
            self.with_status(|s| s.set_last_trace(&output_path));
        }
        Some(SessionResult {
            success,
            output_path,
        })
    }

    /// UPLOAD. Returns whether the upload succeeded. The local file is left
    /// in place either way; the sweeper owns local cleanup.
    async fn upload(&self, local_path: &Path) -> bool {
        let Some(bucket) = self.settings.bucket() else {
            tracing::warn!("no bucket configured, skipping upload");
            return false;
        };
        let Some(file_name) = local_path.file_name().and_then(|n| n.to_str()) else {
            tracing::warn!(path = %local_path.display(), "trace path has no file name");
            return false;
        };
        let key = self.layout.remote_key(file_name);

        self.set_state(DaemonState::Uploading);
        tracing::info!(bucket, key = %key, "uploading trace file");
        match self.uploader.upload(local_path, bucket, &key).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "upload failed, trace stays local until pruned");
                false
            }
        }
    }

    /// SWEEP. Always attempted once the directory exists.
    fn sweep(&mut self, dir: &Path) -> Option<SweepReport> {
        self.set_state(DaemonState::Sweeping);
        let schedule = &self.settings.config.schedule;
        tracing::info!(
            dir = %dir.display(),
            retention_mins = schedule.retention_mins,
            "cleaning up old profiler results"
        );

        match retention::sweep(
            dir,
            &self.settings.config.sampler.extension,
            schedule.retention(),
            self.clock.now(),
        ) {
            Ok(report) => {
                self.with_status(|s| s.set_last_sweep(report));
                Some(report)
            }
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "sweep failed");
                None
            }
        }
    }

    /// Run cycles until `shutdown` fires.
    pub async fn run(&mut self, mut shutdown: Shutdown) {
        let sleep = self.settings.config.schedule.sleep();
        self.set_state(DaemonState::Starting);

        loop {
            let report = self.run_cycle(&mut shutdown).await;
            report.log(self.cycle);
            if report.interrupted || shutdown.is_triggered() {
                break;
            }

            self.set_state(DaemonState::Sleeping);
            tracing::info!(secs = sleep.as_secs(), "profiler sleeping");
            tokio::select! {
                _ = tokio::time::sleep(sleep) => {}
                _ = shutdown.wait() => break,
            }
        }

        self.set_state(DaemonState::ShuttingDown);
        tracing::info!(cycles = self.cycle, "profiler stopped");
        if let Some(status) = &self.status {
            status.remove();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Identity, ProfilerConfig};
    use crate::role::ComponentRole;
    use crate::runner::CommandOutput;
    use crate::signals;
    use crate::timestamp::parse_timestamp;
    use crate::upload::UploadError;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    const SCHEDULER_CMD: &str = "/usr/bin/python3 /usr/local/airflow/.local/bin/airflow scheduler";

    /// A live pid that isn't ours (ours is excluded by the locator).
    fn target_pid() -> u32 {
        std::os::unix::process::parent_id()
    }

    /// Answers `ps` with a canned listing and fakes the sampler.
    struct ScriptedRunner {
        listing: String,
        sampler_exit: Option<i32>,
        sampler_delay: Duration,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        fn new(listing: String, sampler_exit: Option<i32>) -> Self {
            Self {
                listing,
                sampler_exit,
                sampler_delay: Duration::ZERO,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn sampler_calls(&self) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|p| p.as_str() == "py-spy")
                .count()
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput> {
            self.calls.lock().unwrap().push(program.to_string());
            if program == "ps" {
                return Ok(CommandOutput {
                    exit_code: Some(0),
                    stdout: self.listing.clone(),
                });
            }

            tokio::time::sleep(self.sampler_delay).await;
            if self.sampler_exit == Some(0) {
                let pos = args.iter().position(|a| a == "-o").unwrap();
                std::fs::write(&args[pos + 1], "{}")?;
            }
            Ok(CommandOutput {
                exit_code: self.sampler_exit,
                stdout: String::new(),
            })
        }
    }

    struct FakeUploader {
        fail: bool,
        calls: Mutex<Vec<(PathBuf, String, String)>>,
    }

    impl FakeUploader {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                fail,
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Uploader for FakeUploader {
        async fn upload(&self, local_path: &Path, bucket: &str, key: &str) -> Result<(), UploadError> {
            self.calls.lock().unwrap().push((
                local_path.to_path_buf(),
                bucket.to_string(),
                key.to_string(),
            ));
            if self.fail {
                return Err(UploadError::Remote {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                    message: "AccessDenied".into(),
                });
            }
            Ok(())
        }
    }

    struct FixedClock(NaiveDateTime);

    impl Clock for FixedClock {
        fn now(&self) -> NaiveDateTime {
            self.0
        }
    }

    struct Harness {
        _home: tempfile::TempDir,
        daemon: Daemon,
        runner: Arc<ScriptedRunner>,
        uploader: Arc<FakeUploader>,
    }

    fn settings(home: &Path, bucket: Option<&str>) -> Settings {
        let mut config = ProfilerConfig::default();
        config.storage.bucket = bucket.map(str::to_string);
        config.schedule.sleep_secs = 3600;
        Settings {
            identity: Identity {
                component: ComponentRole::Scheduler,
                home: home.to_path_buf(),
                env_name: "dev".into(),
            },
            config,
        }
    }

    fn harness_with(
        runner: ScriptedRunner,
        uploader: Arc<FakeUploader>,
        bucket: Option<&str>,
        configure: impl FnOnce(&mut Settings),
    ) -> Harness {
        let home = tempfile::tempdir().unwrap();
        let mut settings = settings(home.path(), bucket);
        configure(&mut settings);
        let runner = Arc::new(runner);
        let clock = Arc::new(FixedClock(parse_timestamp("2024-01-01-10-16-00").unwrap()));
        let daemon = Daemon::new(settings, runner.clone(), uploader.clone(), clock);
        Harness {
            _home: home,
            daemon,
            runner,
            uploader,
        }
    }

    fn harness(listing: String, sampler_exit: Option<i32>, upload_fails: bool) -> Harness {
        harness_with(
            ScriptedRunner::new(listing, sampler_exit),
            FakeUploader::new(upload_fails),
            Some("traces"),
            |_| {},
        )
    }

    fn scheduler_listing() -> String {
        format!("    1 /sbin/init\n {} {SCHEDULER_CMD}\n", target_pid())
    }

    fn seed_old_and_new(dir: &Path) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join("111_2024-01-01-10-00-00.json"), "{}").unwrap();
        std::fs::write(dir.join("222_2024-01-01-10-20-00.json"), "{}").unwrap();
    }

    #[tokio::test]
    async fn test_cycle_samples_uploads_and_sweeps() {
        let mut h = harness(scheduler_listing(), Some(0), false);
        let dir = h.daemon.layout().output_dir();
        seed_old_and_new(&dir);

        let report = h.daemon.run_cycle(&mut Shutdown::never()).await;

        let pid = target_pid();
        let file_name = format!("{pid}_2024-01-01-10-16-00.json");
        assert_eq!(report.target_pid, Some(pid));
        assert!(report.session_ok);
        assert_eq!(report.trace, Some(dir.join(&file_name)));
        assert!(report.uploaded);

        let calls = h.uploader.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, dir.join(&file_name));
        assert_eq!(calls[0].1, "traces");
        assert_eq!(calls[0].2, format!("profiler/dev/scheduler/{file_name}"));

        // New trace kept, 16-minute-old one pruned
        let sweep = report.sweep.unwrap();
        assert_eq!(sweep.deleted, 1);
        assert_eq!(sweep.remaining, 2);
        assert!(dir.join(&file_name).exists());
        assert!(!dir.join("111_2024-01-01-10-00-00.json").exists());
    }

    #[tokio::test]
    async fn test_session_failure_skips_upload_but_sweeps() {
        let mut h = harness(scheduler_listing(), Some(1), false);
        let dir = h.daemon.layout().output_dir();
        seed_old_and_new(&dir);

        let report = h.daemon.run_cycle(&mut Shutdown::never()).await;

        assert_eq!(h.runner.sampler_calls(), 1);
        assert!(!report.session_ok);
        assert!(report.trace.is_some());
        assert!(!report.uploaded);
        assert!(h.uploader.calls.lock().unwrap().is_empty());
        let sweep = report.sweep.unwrap();
        assert_eq!(sweep.deleted, 1);
        assert_eq!(sweep.remaining, 1);
    }

    #[tokio::test]
    async fn test_not_found_goes_straight_to_sweep() {
        let mut h = harness("    1 /sbin/init\n".to_string(), Some(0), false);
        let dir = h.daemon.layout().output_dir();
        seed_old_and_new(&dir);

        let report = h.daemon.run_cycle(&mut Shutdown::never()).await;

        assert_eq!(report.target_pid, None);
        assert!(report.trace.is_none());
        assert!(!report.session_ok);
        assert_eq!(h.runner.sampler_calls(), 0);
        assert!(h.uploader.calls.lock().unwrap().is_empty());
        let sweep = report.sweep.unwrap();
        assert_eq!(sweep.deleted, 1);
        assert_eq!(sweep.remaining, 1);
        assert!(dir.join("222_2024-01-01-10-20-00.json").exists());
    }

    #[tokio::test]
    async fn test_upload_failure_keeps_local_file() {
        let mut h = harness(scheduler_listing(), Some(0), true);
        let report = h.daemon.run_cycle(&mut Shutdown::never()).await;

        assert!(!report.uploaded);
        assert_eq!(h.uploader.calls.lock().unwrap().len(), 1);
        assert!(report.session_ok);
        assert!(report.trace.unwrap().exists());
        assert!(report.sweep.is_some());
    }

    #[tokio::test]
    async fn test_no_bucket_skips_upload() {
        let mut h = harness_with(
            ScriptedRunner::new(scheduler_listing(), Some(0)),
            FakeUploader::new(false),
            None,
            |_| {},
        );
        let report = h.daemon.run_cycle(&mut Shutdown::never()).await;

        assert!(report.session_ok);
        assert!(!report.uploaded);
        assert!(h.uploader.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_first_cycle_creates_output_dir() {
        let mut h = harness("".to_string(), Some(0), false);
        let dir = h.daemon.layout().output_dir();
        assert!(!dir.exists());

        let report = h.daemon.run_cycle(&mut Shutdown::never()).await;

        assert!(dir.is_dir());
        assert_eq!(report.sweep, Some(SweepReport::default()));
    }

    #[tokio::test]
    async fn test_shutdown_before_execute_skips_session() {
        let mut h = harness(scheduler_listing(), Some(0), false);
        let (trigger, mut shutdown) = signals::channel();
        trigger.trigger();

        let report = h.daemon.run_cycle(&mut shutdown).await;

        assert!(report.interrupted);
        assert_eq!(h.runner.sampler_calls(), 0);
        assert!(report.sweep.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_during_session_abandons_it() {
        let mut runner = ScriptedRunner::new(scheduler_listing(), Some(0));
        runner.sampler_delay = Duration::from_secs(30);
        let mut h = harness_with(runner, FakeUploader::new(false), Some("traces"), |_| {});
        let (trigger, mut shutdown) = signals::channel();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.trigger();
        });

        let start = Instant::now();
        let report = h.daemon.run_cycle(&mut shutdown).await;

        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(report.interrupted);
        assert!(report.trace.is_none());
        assert!(h.uploader.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown_while_sleeping() {
        let mut h = harness("".to_string(), Some(0), false);
        let dir = h.daemon.layout().output_dir();
        seed_old_and_new(&dir);
        let (trigger, shutdown) = signals::channel();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.trigger();
        });

        tokio::time::timeout(Duration::from_secs(5), h.daemon.run(shutdown))
            .await
            .expect("run should stop when shutdown fires");

        assert_eq!(h.daemon.cycle, 1);
        assert!(!dir.join("111_2024-01-01-10-00-00.json").exists());
    }

    #[tokio::test]
    async fn test_status_file_tracks_cycle() {
        let status_dir = tempfile::tempdir().unwrap();
        let status_path = status_dir.path().join("flamewatch.status");
        let path_for_config = status_path.clone();
        let mut h = harness_with(
            ScriptedRunner::new(scheduler_listing(), Some(0)),
            FakeUploader::new(false),
            Some("traces"),
            move |s| s.config.status.file = Some(path_for_config),
        );

        h.daemon.run_cycle(&mut Shutdown::never()).await;

        let contents = std::fs::read_to_string(&status_path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed["state"], "sweeping");
        assert_eq!(parsed["cycle"], 1);
        assert_eq!(parsed["target_pid"], target_pid());
        assert!(parsed["last_trace"]
            .as_str()
            .unwrap()
            .ends_with("_2024-01-01-10-16-00.json"));
        assert_eq!(parsed["last_sweep"]["remaining"], 1);
    }

    #[tokio::test]
    async fn test_status_file_omits_trace_from_failed_session() {
        let status_dir = tempfile::tempdir().unwrap();
        let status_path = status_dir.path().join("flamewatch.status");
        let path_for_config = status_path.clone();
        let mut h = harness_with(
            ScriptedRunner::new(scheduler_listing(), Some(1)),
            FakeUploader::new(false),
            Some("traces"),
            move |s| s.config.status.file = Some(path_for_config),
        );

        let report = h.daemon.run_cycle(&mut Shutdown::never()).await;
        assert!(!report.session_ok);

        let contents = std::fs::read_to_string(&status_path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed["target_pid"], target_pid());
        assert!(parsed["last_trace"].is_null());
    }

    #[tokio::test]
    async fn test_worker_role_never_samples() {
        let mut h = harness_with(
            ScriptedRunner::new(
                format!(" {} /usr/bin/python3 airflow celery worker\n", target_pid()),
                Some(0),
            ),
            FakeUploader::new(false),
            Some("traces"),
            |s| s.identity.component = ComponentRole::Worker,
        );

        let report = h.daemon.run_cycle(&mut Shutdown::never()).await;

        assert_eq!(report.target_pid, None);
        assert_eq!(h.runner.sampler_calls(), 0);
        assert!(h.daemon.layout().output_dir().ends_with("profiler/dev/worker"));
    }
}
