// Reset monitor state machine
//
// Copyright 2025 The amdgpu-queue-reset Authors
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{
    thread,
    time::{Duration, Instant},
};

use log::{debug, trace};

use crate::{
    catalog::{MonitorAction, OutcomeMap},
    device::{self, ContextId, GpuDevice, ResetFlags},
    shared::{ResetBits, SharedRegion, TestFlags, TestState},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MonitorState {
    /// Waiting for the context to report any reset.
    Detecting,
    /// The context was reset, waiting for the faulting job's status.
    QueueReset,
    /// Waiting for a GPU reset to finish.
    GpuReset,
}

/// One poll of everything the monitor looks at.
#[derive(Clone, Copy, Debug, Default)]
pub struct Observation {
    pub reset: ResetFlags,
    pub test: TestState,
    pub timed_out: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    Stay,
    Goto(MonitorState),
    /// End of the round with the bits to report.
    Finish(ResetBits),
}

/// Pure transition function of the monitor.
pub fn step(
    state: MonitorState,
    obs: &Observation,
    actions: &OutcomeMap,
    family_id: u32,
) -> Transition {
    let in_progress = obs.reset.contains(ResetFlags::RESET_IN_PROGRESS);
    let status_known = obs.test.completed && obs.test.flags.contains(TestFlags::ERROR_CODE_SET);

    match state {
        MonitorState::Detecting => {
            if in_progress {
                Transition::Goto(MonitorState::GpuReset)
            } else if obs.reset.contains(ResetFlags::RESET) {
                Transition::Goto(MonitorState::QueueReset)
            } else if obs.timed_out
                || (obs.test.completed
                    && (obs.test.flags.contains(TestFlags::SETUP_FAILED)
                        || obs.test.error_code == 0))
            {
                // Nothing faulted, or nothing ever will.
                Transition::Finish(ResetBits::empty())
            } else {
                Transition::Stay
            }
        }
        MonitorState::QueueReset => {
            if in_progress {
                Transition::Goto(MonitorState::GpuReset)
            } else if status_known {
                match actions.action(family_id, obs.test.error_code) {
                    MonitorAction::QueueReset => Transition::Finish(ResetBits::QUEUE_RESET),
                    MonitorAction::Escalate => Transition::Goto(MonitorState::GpuReset),
                    MonitorAction::GpuResetFailure => {
                        Transition::Finish(ResetBits::GPU_RESET_END_FAILURE)
                    }
                }
            } else if obs.timed_out {
                Transition::Finish(ResetBits::empty())
            } else {
                Transition::Stay
            }
        }
        MonitorState::GpuReset => {
            if !in_progress {
                Transition::Finish(ResetBits::GPU_RESET_END_SUCCESS)
            } else if obs.timed_out {
                Transition::Finish(ResetBits::GPU_RESET_END_FAILURE)
            } else {
                Transition::Stay
            }
        }
    }
}

/// Drives [`step`] against a live context.
pub struct Monitor<'a> {
    device: &'a dyn GpuDevice,
    actions: &'a OutcomeMap,
    family_id: u32,
    timeout: Duration,
    poll: Duration,
}

impl<'a> Monitor<'a> {
    pub fn new(
        device: &'a dyn GpuDevice,
        actions: &'a OutcomeMap,
        family_id: u32,
        timeout: Duration,
        poll: Duration,
    ) -> Self {
        Self {
            device,
            actions,
            family_id,
            timeout,
            poll,
        }
    }

    /// Watches `ctx` until the round reaches a terminal outcome. The whole
    /// watch is bounded by the reset timeout.
    pub fn watch(&self, ctx: ContextId, region: &SharedRegion) -> device::Result<ResetBits> {
        let start = Instant::now();
        let mut state = MonitorState::Detecting;
        let mut bits = ResetBits::empty();

        loop {
            let reset = self.device.query_reset_state(ctx)?;
            if state != MonitorState::Detecting {
                let legacy = self.device.query_reset_state_legacy(ctx)?;
                trace!(
                    "{ctx}: legacy reset state {} after {} hangs",
                    legacy.state,
                    legacy.hangs
                );
            }

            let obs = Observation {
                reset,
                test: region.test_state(),
                timed_out: start.elapsed() >= self.timeout,
            };
            match step(state, &obs, self.actions, self.family_id) {
                Transition::Stay => thread::sleep(self.poll),
                Transition::Goto(next) => {
                    debug!("Monitor {state:?} -> {next:?} on {reset:?}");
                    if next == MonitorState::GpuReset {
                        bits |= ResetBits::GPU_RESET_BEGIN;
                    }
                    state = next;
                }
                Transition::Finish(end) => {
                    debug!(
                        "Monitor finished in {state:?} after {:?}: {:?}",
                        start.elapsed(),
                        bits | end
                    );
                    return Ok(bits | end);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        asic::{FAMILY_GC_11_0_0, FAMILY_NV},
        backend::SimConfig,
        catalog::{ErrorKind, Job, OutcomeRule},
        device::{ContextPriority, IpType},
        jobs::JobRunner,
        ring::SubmitPath,
        shared::SharedMemory,
        testutils::{sim_device, sim_device_with},
    };

    fn obs(reset: ResetFlags, code: Option<i32>, timed_out: bool) -> Observation {
        Observation {
            reset,
            test: code.map_or_else(TestState::default, |error_code| TestState {
                completed: true,
                error_code,
                flags: TestFlags::ERROR_CODE_SET,
            }),
            timed_out,
        }
    }

    #[test]
    fn test_step_detecting() {
        use MonitorState::*;
        use Transition::*;

        let map = OutcomeMap::default();
        let cases = [
            (obs(ResetFlags::empty(), None, false), Stay),
            (obs(ResetFlags::RESET, None, false), Goto(QueueReset)),
            (
                obs(ResetFlags::RESET | ResetFlags::RESET_IN_PROGRESS, None, false),
                Goto(GpuReset),
            ),
            (obs(ResetFlags::empty(), None, true), Finish(ResetBits::empty())),
            (obs(ResetFlags::empty(), Some(0), false), Finish(ResetBits::empty())),
            // A fault status without a reset yet keeps waiting.
            (obs(ResetFlags::empty(), Some(-libc::ENODATA), false), Stay),
        ];
        for (o, expected) in cases {
            assert_eq!(step(Detecting, &o, &map, FAMILY_NV), expected, "{o:?}");
        }

        let setup_failed = Observation {
            test: TestState {
                completed: true,
                error_code: 0,
                flags: TestFlags::SETUP_FAILED,
            },
            ..Default::default()
        };
        assert_eq!(
            step(Detecting, &setup_failed, &map, FAMILY_NV),
            Finish(ResetBits::empty())
        );
    }

    #[test]
    fn test_step_queue_reset() {
        use MonitorState::*;
        use Transition::*;

        let map = OutcomeMap::default();
        let cases = [
            (obs(ResetFlags::RESET, None, false), Stay),
            (obs(ResetFlags::RESET, None, true), Finish(ResetBits::empty())),
            (
                obs(ResetFlags::RESET, Some(-libc::ENODATA), false),
                Finish(ResetBits::QUEUE_RESET),
            ),
            (obs(ResetFlags::RESET, Some(-libc::ETIME), false), Goto(GpuReset)),
            (obs(ResetFlags::RESET, Some(-libc::ECANCELED), false), Goto(GpuReset)),
            (
                obs(ResetFlags::RESET | ResetFlags::RESET_IN_PROGRESS, None, false),
                Goto(GpuReset),
            ),
        ];
        for (o, expected) in cases {
            assert_eq!(step(QueueReset, &o, &map, FAMILY_NV), expected, "{o:?}");
        }
    }

    #[test]
    fn test_step_gpu_reset() {
        use MonitorState::*;
        use Transition::*;

        let map = OutcomeMap::default();
        let busy = ResetFlags::RESET | ResetFlags::RESET_IN_PROGRESS;
        assert_eq!(step(GpuReset, &obs(busy, None, false), &map, FAMILY_NV), Stay);
        assert_eq!(
            step(GpuReset, &obs(busy, None, true), &map, FAMILY_NV),
            Finish(ResetBits::GPU_RESET_END_FAILURE)
        );
        assert_eq!(
            step(GpuReset, &obs(ResetFlags::RESET, None, true), &map, FAMILY_NV),
            Finish(ResetBits::GPU_RESET_END_SUCCESS)
        );
    }

    #[test]
    fn test_step_family_override() {
        let map = OutcomeMap::from_rules(&[OutcomeRule {
            errno: "ETIME".to_string(),
            action: MonitorAction::GpuResetFailure,
            family: Some(FAMILY_GC_11_0_0),
        }])
        .unwrap();
        let o = obs(ResetFlags::RESET, Some(-libc::ETIME), false);

        assert_eq!(
            step(MonitorState::QueueReset, &o, &map, FAMILY_GC_11_0_0),
            Transition::Finish(ResetBits::GPU_RESET_END_FAILURE)
        );
        assert_eq!(
            step(MonitorState::QueueReset, &o, &map, FAMILY_NV),
            Transition::Goto(MonitorState::GpuReset)
        );
    }

    fn fault(
        device: &std::sync::Arc<dyn GpuDevice>,
        error: ErrorKind,
        region: &SharedRegion,
    ) -> ContextId {
        let runner = JobRunner::new(device, SubmitPath::Kernel).unwrap();
        let ctx = device.create_context(ContextPriority::Normal).unwrap();
        let job = Job {
            error,
            ip: IpType::Compute,
            ring_id: 1,
            expected: None,
        };
        let status = runner.run(ctx, &job).unwrap();
        region.set_test_state(TestState {
            completed: true,
            error_code: status.code(),
            flags: TestFlags::ERROR_CODE_SET,
        });
        ctx
    }

    #[test]
    fn test_watch_queue_reset() {
        let (_sim, device) = sim_device();
        let shm = SharedMemory::anonymous().unwrap();
        let ctx = fault(&device, ErrorKind::InvalidProgramAddr, &shm);

        let map = OutcomeMap::default();
        let monitor = Monitor::new(
            device.as_ref(),
            &map,
            FAMILY_NV,
            Duration::from_secs(5),
            Duration::from_millis(1),
        );
        assert_eq!(monitor.watch(ctx, &shm).unwrap(), ResetBits::QUEUE_RESET);
    }

    #[test]
    fn test_watch_gpu_reset() {
        let (sim, device) = sim_device_with(SimConfig {
            gpu_reset_duration: Duration::from_millis(100),
            ..Default::default()
        });
        let shm = SharedMemory::anonymous().unwrap();
        let ctx = fault(&device, ErrorKind::BadRegAddress, &shm);
        assert_eq!(sim.gpu_reset_count(), 1);

        let map = OutcomeMap::default();
        let monitor = Monitor::new(
            device.as_ref(),
            &map,
            FAMILY_NV,
            Duration::from_secs(5),
            Duration::from_millis(1),
        );
        assert_eq!(
            monitor.watch(ctx, &shm).unwrap(),
            ResetBits::GPU_RESET_BEGIN | ResetBits::GPU_RESET_END_SUCCESS
        );
    }

    #[test]
    fn test_watch_missed_gpu_reset_with_override() {
        // The reset is over before the first poll, so only the status
        // tells the monitor what happened.
        let (_sim, device) = sim_device_with(SimConfig {
            gpu_reset_duration: Duration::ZERO,
            ..Default::default()
        });
        let shm = SharedMemory::anonymous().unwrap();
        let ctx = fault(&device, ErrorKind::BadRegAddress, &shm);

        let map = OutcomeMap::from_rules(&[OutcomeRule {
            errno: "ETIME".to_string(),
            action: MonitorAction::GpuResetFailure,
            family: None,
        }])
        .unwrap();
        let monitor = Monitor::new(
            device.as_ref(),
            &map,
            FAMILY_NV,
            Duration::from_secs(5),
            Duration::from_millis(1),
        );
        assert_eq!(
            monitor.watch(ctx, &shm).unwrap(),
            ResetBits::GPU_RESET_END_FAILURE
        );
    }

    #[test]
    fn test_watch_times_out_without_reset() {
        let (_sim, device) = sim_device();
        let shm = SharedMemory::anonymous().unwrap();
        let ctx = device.create_context(ContextPriority::Normal).unwrap();

        let map = OutcomeMap::default();
        let monitor = Monitor::new(
            device.as_ref(),
            &map,
            FAMILY_NV,
            Duration::from_millis(20),
            Duration::from_millis(1),
        );
        let start = Instant::now();
        assert_eq!(monitor.watch(ctx, &shm).unwrap(), ResetBits::empty());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
