// Reset recovery orchestration across the test, monitor and background roles
//
// Copyright 2025 The amdgpu-queue-reset Authors
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

pub mod monitor;
mod roles;
mod scheduler;

use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex, PoisonError},
    thread,
};

use log::{error, info, warn};
use thiserror::Error as ThisError;

pub(crate) use self::roles::{background_role, stand_in};
pub use self::roles::BACKGROUND_GONE;
pub use self::{
    monitor::{Monitor, MonitorState, Observation, Transition},
    scheduler::{select_rings, Scheduler},
};
use crate::{
    catalog::{ExpectedResult, Job},
    device::{self, ContextId, GpuDevice},
    jobs::{JobError, JobStatus},
    shared::{BackgroundStats, ResetBits, ResetState, Role, SharedRegion, TestFlags, TestState},
    HarnessConfig,
};

#[derive(Debug, ThisError)]
pub enum HarnessError {
    #[error("Device call failed: {0}")]
    Device(#[from] device::Error),
    #[error("Failed to build job: {0}")]
    Job(#[from] JobError),
    #[error("Role `{0}` panicked")]
    RolePanic(Role),
}

/// Terminal outcome of one round as the monitor recorded it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoundOutcome {
    QueueResetSuccess,
    GpuResetSuccess,
    GpuResetFailure,
    NoResetDetected,
}

impl RoundOutcome {
    pub fn from_bits(bits: ResetBits) -> Self {
        if bits.contains(ResetBits::QUEUE_RESET) {
            Self::QueueResetSuccess
        } else if bits.contains(ResetBits::GPU_RESET_END_FAILURE) {
            Self::GpuResetFailure
        } else if bits.contains(ResetBits::GPU_RESET_END_SUCCESS) {
            Self::GpuResetSuccess
        } else {
            Self::NoResetDetected
        }
    }
}

impl fmt::Display for RoundOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::QueueResetSuccess => "queue-reset-success",
            Self::GpuResetSuccess => "gpu-reset-success",
            Self::GpuResetFailure => "gpu-reset-failure",
            Self::NoResetDetected => "no-reset-detected",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    /// The observed outcome does not match the catalog.
    Mismatch(String),
    /// A role could not do its part: the faulting job did not run, the
    /// reset state was unreadable or the background role was gone.
    SetupFailed,
    Skipped(String),
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => f.write_str("pass"),
            Self::Mismatch(reason) => write!(f, "MISMATCH ({reason})"),
            Self::SetupFailed => f.write_str("setup failed"),
            Self::Skipped(reason) => write!(f, "skipped ({reason})"),
        }
    }
}

/// Compares what a round produced with what the catalog expects.
pub fn judge(
    expected: Option<ExpectedResult>,
    test: &TestState,
    reset: &ResetState,
    background: &BackgroundStats,
) -> Verdict {
    if test.flags.contains(TestFlags::SETUP_FAILED)
        || reset.flags.contains(ResetBits::QUERY_FAILED)
        || background.error == BACKGROUND_GONE
    {
        return Verdict::SetupFailed;
    }

    let status = JobStatus(test.error_code);
    if !status.is_expected_fault() {
        return Verdict::Mismatch(format!("faulting job returned {status}"));
    }
    if background.error != 0 {
        return Verdict::Mismatch(format!(
            "good job failed with {}",
            JobStatus(background.error)
        ));
    }

    let outcome = RoundOutcome::from_bits(reset.flags);
    match expected {
        Some(ExpectedResult::QueueReset) => {
            if outcome != RoundOutcome::QueueResetSuccess {
                Verdict::Mismatch(format!("expected queue-reset-success, got {outcome}"))
            } else if status.code() != -libc::ENODATA {
                Verdict::Mismatch(format!("expected -ENODATA, got {status}"))
            } else if reset.flags != ResetBits::QUEUE_RESET {
                Verdict::Mismatch(format!("GPU reset bits set: {:?}", reset.flags))
            } else if background.good_jobs_ok == 0 {
                Verdict::Mismatch("no good job completed during the round".to_string())
            } else {
                Verdict::Pass
            }
        }
        Some(ExpectedResult::GpuReset) => {
            if outcome == RoundOutcome::GpuResetSuccess {
                Verdict::Pass
            } else {
                Verdict::Mismatch(format!("expected gpu-reset-success, got {outcome}"))
            }
        }
        None => {
            if outcome == RoundOutcome::NoResetDetected {
                Verdict::Pass
            } else {
                Verdict::Mismatch(format!("expected no reset, got {outcome}"))
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoundReport {
    pub round: u32,
    pub bad_job: Job,
    pub good_job: Option<Job>,
    pub status: JobStatus,
    pub reset_bits: ResetBits,
    pub outcome: Option<RoundOutcome>,
    pub background: BackgroundStats,
    pub verdict: Verdict,
}

impl fmt::Display for RoundReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "round {}: {}", self.round, self.bad_job)?;
        if let Some(outcome) = self.outcome {
            write!(
                f,
                ", status {}, {outcome}, good jobs {}/{}",
                self.status,
                self.background.good_jobs_ok,
                self.background.good_jobs_ok + self.background.good_jobs_failed
            )?;
        }
        write!(f, ": {}", self.verdict)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub reports: Vec<RoundReport>,
}

impl Summary {
    fn count(&self, pred: impl Fn(&Verdict) -> bool) -> usize {
        self.reports.iter().filter(|r| pred(&r.verdict)).count()
    }

    pub fn passed(&self) -> usize {
        self.count(|v| *v == Verdict::Pass)
    }

    pub fn mismatched(&self) -> usize {
        self.count(|v| matches!(v, Verdict::Mismatch(_)))
    }

    pub fn setup_failures(&self) -> usize {
        self.count(|v| *v == Verdict::SetupFailed)
    }

    pub fn skipped(&self) -> usize {
        self.count(|v| matches!(v, Verdict::Skipped(_)))
    }

    /// 0 when everything passed, 1 on setup failures, 2 on mismatches.
    pub fn exit_code(&self) -> i32 {
        if self.setup_failures() > 0 {
            1
        } else if self.mismatched() > 0 {
            2
        } else {
            0
        }
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} rounds: {} passed, {} mismatched, {} setup failures, {} skipped",
            self.reports.len(),
            self.passed(),
            self.mismatched(),
            self.setup_failures(),
            self.skipped()
        )
    }
}

/// Context the faulting job of the current round runs on. Owned by the
/// scheduler, read by the test and monitor roles between the barriers.
#[derive(Debug, Default)]
pub(crate) struct RoundContext(Mutex<Option<ContextId>>);

impl RoundContext {
    pub(crate) fn get(&self) -> Option<ContextId> {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set(&self, ctx: Option<ContextId>) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = ctx;
    }
}

/// Runs `body` as `role`. Should it panic, a stand-in crosses the rest of
/// the role's barriers so the other roles are not left waiting.
pub(crate) fn guarded(
    region: &SharedRegion,
    role: Role,
    body: impl FnOnce(),
) -> Result<(), HarnessError> {
    if panic::catch_unwind(AssertUnwindSafe(body)).is_ok() {
        return Ok(());
    }
    error!("The {role} role panicked");
    stand_in(region, role);
    Err(HarnessError::RolePanic(role))
}

/// Runs every configured round on `device`.
///
/// The scheduler runs on the calling thread, the test and monitor roles on
/// their own threads. With `background_thread` the background role runs
/// here as well, otherwise another process must attach to `region`.
pub fn run_harness(
    device: &Arc<dyn GpuDevice>,
    config: &HarnessConfig,
    region: &SharedRegion,
    background_thread: bool,
) -> Result<Summary, HarnessError> {
    // The roles start even without GPU info so that all of them, the
    // background process included, get the sentinel.
    let info = device.gpu_info();
    let family_id = info.as_ref().map_or(0, |info| info.family_id);
    let round_ctx = RoundContext::default();

    thread::scope(|s| {
        let monitor = s.spawn(|| {
            guarded(region, Role::Monitor, || {
                roles::monitor_role(device, region, &round_ctx, config, family_id)
            })
        });
        let test = s.spawn(|| {
            guarded(region, Role::Test, || {
                roles::test_role(device, region, &round_ctx, config)
            })
        });
        let background = background_thread.then(|| {
            s.spawn(|| {
                guarded(region, Role::Background, || {
                    roles::background_role(device, region, config)
                })
            })
        });

        let mut summary = Summary::default();
        let result = info
            .map_err(HarnessError::from)
            .and_then(|_| Scheduler::new(device, config, region, &round_ctx))
            .and_then(|mut scheduler| {
                for &ip in config.ips() {
                    for entry in config.tests().iter().filter(|e| e.supports(ip)) {
                        summary.reports.push(scheduler.run_round(entry, ip)?);
                    }
                }
                scheduler.finish();
                Ok(())
            });
        if result.is_err() {
            // Roles are parked at the barrier until the sentinel arrives.
            Scheduler::release_roles(region);
        }

        let mut roles = vec![(Role::Monitor, monitor), (Role::Test, test)];
        roles.extend(background.map(|b| (Role::Background, b)));
        for (role, handle) in roles {
            handle.join().map_err(|_| HarnessError::RolePanic(role))??;
        }

        result?;
        if summary.skipped() > 0 {
            warn!("{} rounds skipped", summary.skipped());
        }
        info!("{summary}");
        Ok(summary)
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use vmm_sys_util::errno::Error as Errno;

    use super::*;
    use crate::{
        backend::{SimConfig, SimDevice},
        catalog::ErrorKind,
        device::{IpType, MockGpuDevice},
        ring::SubmitPath,
        shared::{Phase, RoundBarrier, RoundPlan, SharedMemory, NUM_PARTICIPANTS},
        testutils::sim_device_with,
        BackgroundMode, DriverKind, Timing,
    };

    fn state(code: i32, bits: ResetBits, good: u64) -> (TestState, ResetState, BackgroundStats) {
        (
            TestState {
                completed: true,
                error_code: code,
                flags: TestFlags::ERROR_CODE_SET,
            },
            ResetState {
                completed: true,
                flags: bits,
            },
            BackgroundStats {
                good_jobs_ok: good,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_outcome_from_bits() {
        assert_eq!(
            RoundOutcome::from_bits(ResetBits::QUEUE_RESET),
            RoundOutcome::QueueResetSuccess
        );
        assert_eq!(
            RoundOutcome::from_bits(ResetBits::GPU_RESET_BEGIN | ResetBits::GPU_RESET_END_SUCCESS),
            RoundOutcome::GpuResetSuccess
        );
        assert_eq!(
            RoundOutcome::from_bits(ResetBits::GPU_RESET_BEGIN | ResetBits::GPU_RESET_END_FAILURE),
            RoundOutcome::GpuResetFailure
        );
        assert_eq!(
            RoundOutcome::from_bits(ResetBits::GPU_RESET_BEGIN),
            RoundOutcome::NoResetDetected
        );
    }

    #[test]
    fn test_judge_queue_reset() {
        let expected = Some(ExpectedResult::QueueReset);

        let (t, r, b) = state(-libc::ENODATA, ResetBits::QUEUE_RESET, 3);
        assert_eq!(judge(expected, &t, &r, &b), Verdict::Pass);

        let (t, r, b) = state(-libc::ENODATA, ResetBits::QUEUE_RESET, 0);
        assert!(matches!(judge(expected, &t, &r, &b), Verdict::Mismatch(_)));

        let (t, r, b) = state(
            -libc::ENODATA,
            ResetBits::QUEUE_RESET | ResetBits::GPU_RESET_BEGIN,
            3,
        );
        assert!(matches!(judge(expected, &t, &r, &b), Verdict::Mismatch(_)));

        let (t, r, b) = state(
            -libc::ETIME,
            ResetBits::GPU_RESET_BEGIN | ResetBits::GPU_RESET_END_SUCCESS,
            3,
        );
        assert!(matches!(judge(expected, &t, &r, &b), Verdict::Mismatch(_)));
    }

    #[test]
    fn test_judge_gpu_reset_and_errors() {
        let expected = Some(ExpectedResult::GpuReset);

        let (t, r, b) = state(
            -libc::ETIME,
            ResetBits::GPU_RESET_BEGIN | ResetBits::GPU_RESET_END_SUCCESS,
            0,
        );
        assert_eq!(judge(expected, &t, &r, &b), Verdict::Pass);

        let (t, r, mut b) = state(
            -libc::ETIME,
            ResetBits::GPU_RESET_BEGIN | ResetBits::GPU_RESET_END_SUCCESS,
            0,
        );
        b.error = -libc::EIO;
        assert_eq!(
            judge(expected, &t, &r, &b),
            Verdict::Mismatch(format!("good job failed with {}", -libc::EIO))
        );

        let (t, r, b) = state(-libc::EINVAL, ResetBits::empty(), 1);
        assert!(matches!(judge(expected, &t, &r, &b), Verdict::Mismatch(_)));

        let (mut t, r, b) = state(0, ResetBits::empty(), 1);
        t.flags = TestFlags::SETUP_FAILED;
        assert_eq!(judge(expected, &t, &r, &b), Verdict::SetupFailed);
    }

    #[test]
    fn test_summary_exit_code() {
        let report = |verdict| RoundReport {
            round: 1,
            bad_job: Job {
                error: ErrorKind::InvalidOpcode,
                ip: IpType::Compute,
                ring_id: 1,
                expected: None,
            },
            good_job: None,
            status: JobStatus::OK,
            reset_bits: ResetBits::empty(),
            outcome: None,
            background: BackgroundStats::default(),
            verdict,
        };

        let mut summary = Summary {
            reports: vec![report(Verdict::Pass), report(Verdict::Skipped("x".into()))],
        };
        assert_eq!(summary.exit_code(), 0);
        summary.reports.push(report(Verdict::Mismatch("y".into())));
        assert_eq!(summary.exit_code(), 2);
        summary.reports.push(report(Verdict::SetupFailed));
        assert_eq!(summary.exit_code(), 1);
        assert_eq!(
            summary.to_string(),
            "4 rounds: 1 passed, 1 mismatched, 1 setup failures, 1 skipped"
        );
    }

    fn harness(sim: SimConfig, ips: Vec<IpType>, tests: &[&str]) -> (Arc<SimDevice>, Summary) {
        let (sim, device) = sim_device_with(sim);
        let tests: Vec<String> = tests.iter().map(|t| t.to_string()).collect();
        let config = HarnessConfig::new(
            DriverKind::Sim,
            "/dev/null".into(),
            SubmitPath::Kernel,
            ips,
            &tests,
            Timing {
                reset_timeout: Duration::from_secs(5),
                monitor_poll: Duration::from_millis(1),
                role_poll: Duration::from_millis(1),
            },
            BackgroundMode::Thread,
        )
        .unwrap();
        let shm = SharedMemory::anonymous().unwrap();
        let summary = run_harness(&device, &config, &shm, true).unwrap();
        assert_eq!(shm.count(), 0);
        (sim, summary)
    }

    #[test]
    fn test_compute_invalid_program_addr_round() {
        let (sim, summary) = harness(
            SimConfig::default(),
            vec![IpType::Compute],
            &["BACKEND_SE_GC_SHADER_INVALID_PROGRAM_ADDR"],
        );

        assert_eq!(summary.reports.len(), 1);
        let report = &summary.reports[0];
        assert_eq!(report.verdict, Verdict::Pass, "{report}");
        assert_eq!(report.status, JobStatus(-libc::ENODATA));
        assert_eq!(report.reset_bits, ResetBits::QUEUE_RESET);
        assert_eq!(report.bad_job.ring_id, 1);
        assert_eq!(report.good_job.map(|j| j.ring_id), Some(0));
        assert!(report.background.good_jobs_ok >= 1);
        assert_eq!(sim.gpu_reset_count(), 0);
        // The scheduler destroys every round context.
        assert_eq!(sim.context_count(), 0);
    }

    #[test]
    fn test_gpu_reset_round() {
        let (sim, summary) = harness(
            SimConfig {
                gpu_reset_duration: Duration::from_millis(50),
                ..Default::default()
            },
            vec![IpType::Compute],
            &["CMD_STREAM_TRANS_BAD_REG_ADDRESS"],
        );

        let report = &summary.reports[0];
        assert_eq!(report.verdict, Verdict::Pass, "{report}");
        assert_eq!(report.outcome, Some(RoundOutcome::GpuResetSuccess));
        assert_eq!(report.status, JobStatus(-libc::ETIME));
        assert_eq!(sim.gpu_reset_count(), 1);
        assert_eq!(summary.exit_code(), 0);
    }

    #[test]
    fn test_full_catalog_on_sim() {
        let (_sim, summary) = harness(
            SimConfig::default(),
            vec![IpType::Compute, IpType::Gfx],
            &[],
        );

        // Shader faults do not apply to SDMA, everything else runs on both.
        assert_eq!(summary.reports.len(), 16);
        assert_eq!(summary.exit_code(), 0, "{:#?}", summary.reports);
    }

    #[test]
    fn test_recovery_mismatch_is_reported() {
        let mut sim = SimConfig::default();
        sim.recovery_overrides.insert(
            crate::backend::sim::Fault::InvalidShader,
            crate::backend::sim::Recovery::GpuReset,
        );
        let (_sim, summary) = harness(
            sim,
            vec![IpType::Compute],
            &["BACKEND_SE_GC_SHADER_INVALID_SHADER"],
        );

        assert_matches!(summary.reports[0].verdict, Verdict::Mismatch(_));
        assert_eq!(summary.exit_code(), 2);
    }

    #[test]
    fn test_panicked_role_is_stood_in() {
        let shm = SharedMemory::anonymous().unwrap();
        let region = shm.region();

        thread::scope(|s| {
            // The monitor dies in the middle of the round.
            let monitor = s.spawn(|| {
                guarded(region, Role::Monitor, || {
                    RoundBarrier::new(region, NUM_PARTICIPANTS).enter(Role::Monitor);
                    panic!("lost the device");
                })
            });
            let test = s.spawn(|| guarded(region, Role::Test, || stand_in(region, Role::Test)));
            let background = s.spawn(|| stand_in(region, Role::Background));

            region.publish_round(&RoundPlan {
                round: 1,
                job_exists: true,
                ..Default::default()
            });
            let barrier = RoundBarrier::new(region, NUM_PARTICIPANTS);
            barrier.enter(Role::Scheduler);
            barrier.exit(Role::Scheduler);

            let (test_state, reset) = (region.test_state(), region.reset_state());
            let stats = region.background_stats();
            assert_eq!(reset.flags, ResetBits::QUERY_FAILED);
            assert_eq!(stats.error, BACKGROUND_GONE);
            assert_eq!(
                judge(Some(ExpectedResult::GpuReset), &test_state, &reset, &stats),
                Verdict::SetupFailed
            );

            Scheduler::release_roles(region);
            assert_matches!(
                monitor.join().unwrap(),
                Err(HarnessError::RolePanic(Role::Monitor))
            );
            assert_matches!(test.join().unwrap(), Ok(()));
            background.join().unwrap();
        });

        assert_eq!(shm.count(), 0);
        for role in [Role::Monitor, Role::Test, Role::Background] {
            assert_eq!(shm.phase(role), Phase::Done);
        }
    }

    #[test]
    fn test_setup_error_releases_background() {
        let mut mock = MockGpuDevice::new();
        mock.expect_gpu_info()
            .returning(|| Err(device::Error::OpenFailed(Errno::new(libc::ENODEV))));
        let device: Arc<dyn GpuDevice> = Arc::new(mock);
        let config = HarnessConfig::new(
            DriverKind::Sim,
            "/dev/null".into(),
            SubmitPath::Kernel,
            vec![IpType::Compute],
            &[],
            Timing::default(),
            BackgroundMode::Thread,
        )
        .unwrap();
        let shm = SharedMemory::anonymous().unwrap();
        let region = shm.region();

        thread::scope(|s| {
            // Plays the background process, which only leaves on the sentinel.
            let background = s.spawn(|| {
                let barrier = RoundBarrier::new(region, NUM_PARTICIPANTS);
                barrier.enter(Role::Background);
                let plan = region.round_plan();
                barrier.exit(Role::Background);
                plan
            });
            assert_matches!(
                run_harness(&device, &config, region, false),
                Err(HarnessError::Device(device::Error::OpenFailed(_)))
            );
            assert!(!background.join().unwrap().job_exists);
        });
        assert_eq!(shm.count(), 0);
    }
}
