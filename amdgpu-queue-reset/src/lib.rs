// AMD GPU queue reset verification harness
//
// Copyright 2025 The amdgpu-queue-reset Authors
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate
)]

pub mod asic;
pub mod backend;
pub mod buffer;
pub mod catalog;
pub mod deadlock;
pub mod device;
pub mod encoder;
pub mod jobs;
pub mod orchestrator;
pub mod ring;
pub mod shared;
#[cfg(test)]
pub(crate) mod testutils;
pub mod user_queue;

use std::{
    ffi::OsString,
    fmt::{self, Display, Formatter},
    io,
    os::unix::process::CommandExt,
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus},
    sync::{
        mpsc::{self, RecvTimeoutError},
        Arc,
    },
    thread,
    time::Duration,
};

use clap::ValueEnum;
use log::{error, info, warn};
use serde::Deserialize;
use thiserror::Error as ThisError;

use crate::{
    backend::{AmdgpuDevice, SimConfig, SimDevice},
    catalog::{
        entry_by_name, CatalogEntry, OutcomeMap, OutcomeMapError, OutcomeRule, QUEUE_RESET_CATALOG,
    },
    deadlock::{DeadlockError, DeadlockSuite, Scenario, SuiteSummary, DEBUGFS_DRI, SCENARIOS},
    device::{GpuDevice, IpType},
    orchestrator::{run_harness, HarnessError, Summary},
    ring::SubmitPath,
    shared::{Role, SharedMemory, SharedRegion, SHARED_CHILD_DESCRIPTOR, SHARED_MEMORY_NAME},
};

pub const DEFAULT_DEVICE: &str = "/dev/dri/renderD128";
pub const DEFAULT_RESET_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MONITOR_POLL: Duration = Duration::from_millis(10);
pub const DEFAULT_ROLE_POLL: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DriverKind {
    /// The amdgpu kernel driver on a DRM render node.
    #[default]
    Amdgpu,
    /// An in-process simulated GPU.
    Sim,
}

impl Display for DriverKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Amdgpu => write!(f, "amdgpu"),
            Self::Sim => write!(f, "sim"),
        }
    }
}

/// Where the role submitting good jobs runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackgroundMode {
    /// A child process with its own device file.
    #[default]
    Process,
    Thread,
}

impl Display for BackgroundMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Process => write!(f, "process"),
            Self::Thread => write!(f, "thread"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timing {
    /// How long the monitor waits for any reset to finish.
    pub reset_timeout: Duration,
    pub monitor_poll: Duration,
    /// How often the test and background roles check for round completion.
    pub role_poll: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            reset_timeout: DEFAULT_RESET_TIMEOUT,
            monitor_poll: DEFAULT_MONITOR_POLL,
            role_poll: DEFAULT_ROLE_POLL,
        }
    }
}

#[derive(Debug, ThisError, PartialEq, Eq)]
pub enum ConfigError {
    #[error("No IP block to test")]
    NoIps,
    #[error("Queue reset is only tested on gfx, compute and sdma, not {0}")]
    UnsupportedIp(IpType),
    #[error("Unknown test '{0}'")]
    UnknownTest(String),
    #[error("Reset timeout must not be zero")]
    ZeroResetTimeout,
    #[error("Poll interval {0:?} must be shorter than the reset timeout {1:?}")]
    PollTooSlow(Duration, Duration),
    #[error("Invalid outcome rule: {0}")]
    OutcomeMap(#[from] OutcomeMapError),
    #[error("The simulated GPU lives in one process, use a background thread")]
    SimInProcess,
}

#[derive(Debug, Clone)]
/// This structure holds the configuration of one harness run
pub struct HarnessConfig {
    driver: DriverKind,
    device_path: PathBuf,
    submit_path: SubmitPath,
    ips: Vec<IpType>,
    tests: Vec<&'static CatalogEntry>,
    timing: Timing,
    background: BackgroundMode,
    outcome_map: OutcomeMap,
    sysfs_root: PathBuf,
    debugfs_root: PathBuf,
}

impl HarnessConfig {
    /// Create a new instance of the `HarnessConfig` struct. An empty
    /// `tests` list selects the whole catalog.
    pub fn new(
        driver: DriverKind,
        device_path: PathBuf,
        submit_path: SubmitPath,
        ips: Vec<IpType>,
        tests: &[String],
        timing: Timing,
        background: BackgroundMode,
    ) -> Result<Self, ConfigError> {
        if ips.is_empty() {
            return Err(ConfigError::NoIps);
        }
        if let Some(&ip) = ips
            .iter()
            .find(|ip| !matches!(ip, IpType::Gfx | IpType::Compute | IpType::Dma))
        {
            return Err(ConfigError::UnsupportedIp(ip));
        }
        if driver == DriverKind::Sim && background == BackgroundMode::Process {
            return Err(ConfigError::SimInProcess);
        }
        if timing.reset_timeout.is_zero() {
            return Err(ConfigError::ZeroResetTimeout);
        }
        for poll in [timing.monitor_poll, timing.role_poll] {
            if poll >= timing.reset_timeout {
                return Err(ConfigError::PollTooSlow(poll, timing.reset_timeout));
            }
        }

        let tests = if tests.is_empty() {
            QUEUE_RESET_CATALOG.iter().collect()
        } else {
            tests
                .iter()
                .map(|name| {
                    entry_by_name(name).ok_or_else(|| ConfigError::UnknownTest(name.clone()))
                })
                .collect::<Result<Vec<_>, _>>()?
        };

        Ok(Self {
            driver,
            device_path,
            submit_path,
            ips,
            tests,
            timing,
            background,
            outcome_map: OutcomeMap::default(),
            sysfs_root: PathBuf::from(asic::SYSFS_PCI_DEVICES),
            debugfs_root: PathBuf::from(DEBUGFS_DRI),
        })
    }

    /// Replaces the errno to monitor action table.
    pub fn with_outcome_rules(mut self, rules: &[OutcomeRule]) -> Result<Self, ConfigError> {
        self.outcome_map = OutcomeMap::from_rules(rules)?;
        Ok(self)
    }

    pub fn with_sysfs_root(mut self, root: PathBuf) -> Self {
        self.sysfs_root = root;
        self
    }

    pub fn with_debugfs_root(mut self, root: PathBuf) -> Self {
        self.debugfs_root = root;
        self
    }

    pub const fn driver(&self) -> DriverKind {
        self.driver
    }

    pub fn device_path(&self) -> &Path {
        &self.device_path
    }

    pub const fn submit_path(&self) -> SubmitPath {
        self.submit_path
    }

    pub fn ips(&self) -> &[IpType] {
        &self.ips
    }

    pub fn tests(&self) -> &[&'static CatalogEntry] {
        &self.tests
    }

    pub const fn timing(&self) -> &Timing {
        &self.timing
    }

    pub const fn background(&self) -> BackgroundMode {
        self.background
    }

    pub const fn outcome_map(&self) -> &OutcomeMap {
        &self.outcome_map
    }

    pub fn sysfs_root(&self) -> &Path {
        &self.sysfs_root
    }

    pub fn debugfs_root(&self) -> &Path {
        &self.debugfs_root
    }
}

#[derive(Debug, ThisError)]
pub enum StartError {
    #[error("Could not open {0:?}: {1}")]
    CouldNotOpenDevice(PathBuf, device::Error),
    #[error("Could not set up shared memory: {0}")]
    SharedMemory(shared::Error),
    #[error("Could not spawn the background process: {0}")]
    SpawnBackground(io::Error),
    #[error("Could not wait for the background process: {0}")]
    WaitBackground(io::Error),
    #[error("Background process exited with {0} before the last round")]
    BackgroundExited(ExitStatus),
    #[error("Harness failed: {0}")]
    Harness(#[from] HarnessError),
    #[error("Could not set up hang scenarios: {0}")]
    Deadlock(DeadlockError),
    #[error("Unknown scenario '{0}'")]
    UnknownScenario(String),
}

pub fn open_device(config: &HarnessConfig) -> Result<Arc<dyn GpuDevice>, StartError> {
    match config.driver() {
        DriverKind::Amdgpu => {
            let device = AmdgpuDevice::open(config.device_path())
                .map_err(|e| {
                    StartError::CouldNotOpenDevice(config.device_path().to_path_buf(), e)
                })?;
            Ok(Arc::new(device))
        }
        DriverKind::Sim => Ok(Arc::new(SimDevice::new(SimConfig::default()))),
    }
}

/// Re-executes this binary as the background role, handing over the
/// shared region as [`SHARED_CHILD_DESCRIPTOR`].
fn spawn_background(shm: &SharedMemory, args: &[OsString]) -> Result<Child, StartError> {
    let fd = shm
        .raw_fd()
        .ok_or(StartError::SharedMemory(shared::Error::InvalidName))?;
    let exe = std::env::current_exe().map_err(StartError::SpawnBackground)?;

    let mut command = Command::new(exe);
    command.args(args).args(["--role", "background"]);
    // SAFETY: only async-signal-safe calls run between fork and exec.
    unsafe {
        command.pre_exec(move || {
            let ret = if fd == SHARED_CHILD_DESCRIPTOR {
                libc::fcntl(fd, libc::F_SETFD, 0)
            } else {
                libc::dup2(fd, SHARED_CHILD_DESCRIPTOR)
            };
            if ret < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
    command.spawn().map_err(StartError::SpawnBackground)
}

/// Runs the queue reset rounds. `child_args` are the arguments the
/// background process is started with in process mode.
pub fn start_harness(
    config: &HarnessConfig,
    child_args: &[OsString],
) -> Result<Summary, StartError> {
    info!(
        "Starting harness on {} ({}), {} tests, background {}",
        config.device_path().display(),
        config.driver(),
        config.tests().len(),
        config.background()
    );
    let device = open_device(config)?;

    match config.background() {
        BackgroundMode::Thread => {
            let shm = SharedMemory::anonymous().map_err(StartError::SharedMemory)?;
            Ok(run_harness(&device, config, &shm, true)?)
        }
        BackgroundMode::Process => {
            let shm = SharedMemory::create(SHARED_MEMORY_NAME).map_err(StartError::SharedMemory)?;
            let child = spawn_background(&shm, child_args)?;
            run_with_background(&device, config, &shm, child)
        }
    }
}

/// Reaps the background process once the rounds are over, or kills it when
/// `stop` says so. Should it die before the sentinel round, a stand-in
/// crosses its barriers so the rounds still end.
fn watch_background(
    mut child: Child,
    region: &SharedRegion,
    stop: mpsc::Receiver<bool>,
    poll: Duration,
) -> io::Result<ExitStatus> {
    loop {
        if let Some(status) = child.try_wait()? {
            if !status.success() {
                error!("Background process exited with {status}");
                orchestrator::stand_in(region, Role::Background);
            }
            return Ok(status);
        }
        match stop.recv_timeout(poll) {
            Ok(true) => {
                warn!("Killing the background process");
                child.kill()?;
                return child.wait();
            }
            Ok(false) | Err(RecvTimeoutError::Disconnected) => return child.wait(),
            Err(RecvTimeoutError::Timeout) => {}
        }
    }
}

/// Runs the rounds with the background role in `child`.
fn run_with_background(
    device: &Arc<dyn GpuDevice>,
    config: &HarnessConfig,
    shm: &SharedMemory,
    child: Child,
) -> Result<Summary, StartError> {
    let poll = config.timing().role_poll;
    let (stop, stopped) = mpsc::channel();
    let (summary, exit) = thread::scope(|s| {
        let watcher = s.spawn(move || watch_background(child, shm, stopped, poll));
        let summary = run_harness(device, config, shm, false);
        let _ = stop.send(summary.is_err());
        let exit = watcher.join().unwrap_or_else(|_| {
            Err(io::Error::new(
                io::ErrorKind::Other,
                "background watcher panicked",
            ))
        });
        (summary, exit)
    });

    let summary = summary?;
    let status = exit.map_err(StartError::WaitBackground)?;
    if !status.success() {
        return Err(StartError::BackgroundExited(status));
    }
    Ok(summary)
}

/// Entry point of the background process.
pub fn start_background(config: &HarnessConfig) -> Result<(), StartError> {
    let device = open_device(config)?;
    // SAFETY: the launcher hands the shared region over as this descriptor
    // and nothing else in this process uses it.
    let shm = unsafe { SharedMemory::open_fd(SHARED_CHILD_DESCRIPTOR) }
        .map_err(StartError::SharedMemory)?;
    orchestrator::background_role(&device, &shm, config);
    Ok(())
}

/// Scenarios on the configured engines, narrowed to `names` unless empty.
pub fn select_scenarios(
    config: &HarnessConfig,
    names: &[String],
) -> Result<Vec<Scenario>, StartError> {
    let scenarios = if names.is_empty() {
        SCENARIOS.to_vec()
    } else {
        names
            .iter()
            .map(|name| {
                Scenario::by_name(name).ok_or_else(|| StartError::UnknownScenario(name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?
    };
    Ok(scenarios
        .into_iter()
        .filter(|s| config.ips().contains(&s.ip()))
        .collect())
}

pub fn start_deadlock_suite(
    config: &HarnessConfig,
    names: &[String],
) -> Result<SuiteSummary, StartError> {
    let scenarios = select_scenarios(config, names)?;
    let device = open_device(config)?;
    let suite = DeadlockSuite::new(&device)
        .map_err(StartError::Deadlock)?
        .with_roots(
            config.sysfs_root().to_path_buf(),
            config.debugfs_root().to_path_buf(),
        );
    Ok(suite.run_all(&scenarios))
}

/// One line per round the configuration schedules and per hang scenario.
pub fn list_tests(config: &HarnessConfig) -> Vec<String> {
    let mut lines = Vec::new();
    for &ip in config.ips() {
        for entry in config.tests().iter().filter(|e| e.supports(ip)) {
            let expected = match entry.expected_for(ip) {
                Some(catalog::ExpectedResult::QueueReset) => "queue reset",
                Some(catalog::ExpectedResult::GpuReset) => "gpu reset",
                None => "nothing",
            };
            lines.push(format!("{} on {ip}: expects {expected}", entry.name()));
        }
    }
    for scenario in SCENARIOS.iter().filter(|s| config.ips().contains(&s.ip())) {
        lines.push(format!("{scenario} (hang scenario)"));
    }
    lines
}

#[cfg(test)]
mod tests {
    use std::fs::create_dir_all;

    use assert_matches::assert_matches;
    use tempfile::tempdir;

    use super::*;
    use crate::{
        catalog::{ErrorKind, MonitorAction},
        orchestrator::Verdict,
        shared::Phase,
    };

    fn timing() -> Timing {
        Timing {
            reset_timeout: Duration::from_secs(5),
            monitor_poll: Duration::from_millis(1),
            role_poll: Duration::from_millis(1),
        }
    }

    fn sim_config(ips: Vec<IpType>, tests: &[&str]) -> Result<HarnessConfig, ConfigError> {
        let tests: Vec<String> = tests.iter().map(|t| t.to_string()).collect();
        HarnessConfig::new(
            DriverKind::Sim,
            DEFAULT_DEVICE.into(),
            SubmitPath::Kernel,
            ips,
            &tests,
            timing(),
            BackgroundMode::Thread,
        )
    }

    #[test]
    fn test_harness_config_defaults() {
        let config = sim_config(vec![IpType::Compute], &[]).unwrap();
        assert_eq!(config.tests().len(), QUEUE_RESET_CATALOG.len());
        assert_eq!(config.sysfs_root(), Path::new("/sys/bus/pci/devices"));
        assert_eq!(config.debugfs_root(), Path::new("/sys/kernel/debug/dri"));
        assert_eq!(config.outcome_map(), &OutcomeMap::default());
        assert_eq!(Timing::default().reset_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_harness_config_validation() {
        assert_matches!(sim_config(vec![], &[]), Err(ConfigError::NoIps));
        assert_matches!(
            sim_config(vec![IpType::Compute, IpType::VcnDec], &[]),
            Err(ConfigError::UnsupportedIp(IpType::VcnDec))
        );
        assert_matches!(
            sim_config(vec![IpType::Gfx], &["CMD_STREAM_EXEC_NOPE"]),
            Err(ConfigError::UnknownTest(name)) if name == "CMD_STREAM_EXEC_NOPE"
        );

        let mut timing = timing();
        timing.role_poll = timing.reset_timeout;
        assert_matches!(
            HarnessConfig::new(
                DriverKind::Sim,
                DEFAULT_DEVICE.into(),
                SubmitPath::Kernel,
                vec![IpType::Gfx],
                &[],
                timing,
                BackgroundMode::Thread,
            ),
            Err(ConfigError::PollTooSlow(..))
        );
        timing.reset_timeout = Duration::ZERO;
        assert_matches!(
            HarnessConfig::new(
                DriverKind::Sim,
                DEFAULT_DEVICE.into(),
                SubmitPath::Kernel,
                vec![IpType::Gfx],
                &[],
                timing,
                BackgroundMode::Thread,
            ),
            Err(ConfigError::ZeroResetTimeout)
        );
        assert_matches!(
            HarnessConfig::new(
                DriverKind::Sim,
                DEFAULT_DEVICE.into(),
                SubmitPath::Kernel,
                vec![IpType::Gfx],
                &[],
                self::timing(),
                BackgroundMode::Process,
            ),
            Err(ConfigError::SimInProcess)
        );
    }

    #[test]
    fn test_outcome_rules() {
        let config = sim_config(vec![IpType::Compute], &[]).unwrap();
        let rules = [OutcomeRule {
            errno: "ETIME".to_string(),
            action: MonitorAction::GpuResetFailure,
            family: None,
        }];
        let config = config.with_outcome_rules(&rules).unwrap();
        assert_eq!(
            config.outcome_map().action(0, -libc::ETIME),
            MonitorAction::GpuResetFailure
        );

        let bad = [OutcomeRule {
            errno: "EBADNESS".to_string(),
            action: MonitorAction::QueueReset,
            family: None,
        }];
        assert_matches!(
            config.with_outcome_rules(&bad),
            Err(ConfigError::OutcomeMap(OutcomeMapError::UnknownErrno(_)))
        );
    }

    #[test]
    fn test_display_eq_arg_name() {
        for driver in DriverKind::value_variants() {
            assert_eq!(*driver, DriverKind::from_str(&driver.to_string(), false).unwrap());
        }
        for mode in BackgroundMode::value_variants() {
            assert_eq!(*mode, BackgroundMode::from_str(&mode.to_string(), false).unwrap());
        }
    }

    #[test]
    fn test_list_tests() {
        let config = sim_config(
            vec![IpType::Compute, IpType::Dma],
            &["BACKEND_SE_GC_SHADER_INVALID_SHADER", "CMD_STREAM_EXEC_INVALID_OPCODE"],
        )
        .unwrap();
        let lines = list_tests(&config);

        // Shader faults have no sdma variant.
        assert_eq!(
            lines
                .iter()
                .filter(|l| l.starts_with(ErrorKind::InvalidShader.name()))
                .count(),
            1
        );
        assert!(lines.contains(&format!(
            "{} on {}: expects queue reset",
            ErrorKind::InvalidOpcode.name(),
            IpType::Dma
        )));
        assert!(lines.contains(&"sdma-corrupted-header (hang scenario)".to_string()));
        assert!(!lines.iter().any(|l| l.starts_with("deadlock-gfx")));
    }

    #[test]
    fn test_select_scenarios() {
        let config = sim_config(vec![IpType::Gfx], &[]).unwrap();
        let all = select_scenarios(&config, &[]).unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.iter().all(|s| s.ip() == IpType::Gfx));

        let names = vec!["deadlock-gfx".to_string(), "deadlock-compute".to_string()];
        assert_eq!(
            select_scenarios(&config, &names).unwrap(),
            vec![Scenario::WaitMemory(IpType::Gfx)]
        );
        assert_matches!(
            select_scenarios(&config, &["deadlock-vpe".to_string()]),
            Err(StartError::UnknownScenario(_))
        );
    }

    #[test]
    fn test_start_harness_sim_thread() {
        let config =
            sim_config(vec![IpType::Compute], &["CMD_STREAM_EXEC_INVALID_OPCODE"]).unwrap();
        let summary = start_harness(&config, &[]).unwrap();
        assert_eq!(summary.reports.len(), 1);
        assert_eq!(summary.exit_code(), 0);
    }

    #[test]
    fn test_start_deadlock_suite_sim() {
        let sysfs = tempdir().unwrap();
        let debugfs = tempdir().unwrap();
        let dir = sysfs.path().join("0000:00:00.0");
        create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("sdma_reset_mask"), "soft queue\n").unwrap();

        let config = sim_config(vec![IpType::Dma], &[])
            .unwrap()
            .with_sysfs_root(sysfs.path().to_path_buf())
            .with_debugfs_root(debugfs.path().to_path_buf());
        let names = vec![
            "sdma-corrupted-header".to_string(),
            "sdma-bad-length".to_string(),
        ];
        let summary = start_deadlock_suite(&config, &names).unwrap();
        assert_eq!(summary.passed(), 2);
        assert_eq!(summary.exit_code(), 0);
    }

    #[test]
    fn test_open_missing_device() {
        let config = HarnessConfig::new(
            DriverKind::Amdgpu,
            "/nonexistent/renderD128".into(),
            SubmitPath::Kernel,
            vec![IpType::Gfx],
            &[],
            timing(),
            BackgroundMode::Thread,
        )
        .unwrap();
        assert_matches!(
            open_device(&config).map(|_| ()),
            Err(StartError::CouldNotOpenDevice(path, _))
                if path == Path::new("/nonexistent/renderD128")
        );
        let err = open_device(&config).map(|_| ()).unwrap_err();
        assert!(err
            .to_string()
            .starts_with("Could not open \"/nonexistent/renderD128\": "));
    }

    #[test]
    fn test_background_process_startup_failure() {
        let config = sim_config(
            vec![IpType::Compute],
            &["BACKEND_SE_GC_SHADER_INVALID_PROGRAM_ADDR"],
        )
        .unwrap();
        let device = open_device(&config).unwrap();
        let shm = SharedMemory::anonymous().unwrap();
        // Dies before it ever attaches to the region.
        let child = Command::new("false").spawn().unwrap();

        assert_matches!(
            run_with_background(&device, &config, &shm, child),
            Err(StartError::BackgroundExited(status)) if status.code() == Some(1)
        );
        assert_eq!(shm.count(), 0);
        assert_eq!(shm.phase(Role::Background), Phase::Done);
    }

    #[test]
    fn test_background_process_runs_rounds() {
        let config = sim_config(
            vec![IpType::Compute],
            &["BACKEND_SE_GC_SHADER_INVALID_PROGRAM_ADDR"],
        )
        .unwrap();
        let device = open_device(&config).unwrap();
        let shm = SharedMemory::anonymous().unwrap();
        // The role itself runs on a thread next to this process.
        let child = Command::new("sleep").arg("0.2").spawn().unwrap();

        let summary = thread::scope(|s| {
            s.spawn(|| {
                orchestrator::background_role(&device, &shm, &config);
            });
            run_with_background(&device, &config, &shm, child)
        })
        .unwrap();
        assert_eq!(summary.reports.len(), 1);
        assert_eq!(summary.reports[0].verdict, Verdict::Pass);
    }
}
