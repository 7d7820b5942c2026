// Role loops that cross the round barrier
//
// Copyright 2025 The amdgpu-queue-reset Authors
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{sync::Arc, thread};

use log::{debug, error, info, warn};

use super::{monitor::Monitor, RoundContext};
use crate::{
    device::{ContextPriority, GpuDevice},
    jobs::JobRunner,
    ring::SubmitPath,
    shared::{
        Phase, ResetBits, ResetState, Role, RoundBarrier, RoundPlan, SharedRegion, TestFlags,
        TestState, NUM_PARTICIPANTS,
    },
    HarnessConfig,
};

const PROGRESS_INTERVAL: u64 = 10_000;
/// Background error of the rounds a stand-in crossed for the background role.
pub const BACKGROUND_GONE: i32 = -libc::ECHILD;

/// Enters the next round. `None` once the scheduler sent the sentinel, in
/// which case the barrier has already been left.
fn next_round(barrier: &RoundBarrier, region: &SharedRegion, role: Role) -> Option<RoundPlan> {
    barrier.enter(role);
    let plan = region.round_plan();
    if !plan.job_exists {
        debug!("{role} done after {} rounds", plan.round);
        barrier.exit(role);
        barrier.finish(role);
        return None;
    }
    Some(plan)
}

/// Records what a missing `role` means for the round.
fn fail_round(region: &SharedRegion, role: Role, plan: &RoundPlan) {
    if plan.skipped {
        return;
    }
    match role {
        Role::Monitor => region.set_reset_state(ResetState {
            completed: true,
            flags: ResetBits::QUERY_FAILED,
        }),
        Role::Test => region.set_test_state(TestState {
            completed: true,
            error_code: 0,
            flags: TestFlags::SETUP_FAILED,
        }),
        Role::Background => region.set_background_error(BACKGROUND_GONE),
        Role::Scheduler => {}
    }
}

/// Crosses the barriers of a role that died, up to and including the
/// sentinel round, and fails every round it misses.
pub(crate) fn stand_in(region: &SharedRegion, role: Role) {
    let barrier = RoundBarrier::new(region, NUM_PARTICIPANTS);
    match barrier.resume(role) {
        Phase::Done => return,
        Phase::Inside => {
            let plan = region.round_plan();
            if !plan.job_exists {
                barrier.exit(role);
                barrier.finish(role);
                return;
            }
            fail_round(region, role, &plan);
            barrier.exit(role);
        }
        Phase::Outside | Phase::Arrived | Phase::Leaving => {}
    }

    warn!("Standing in for the {role} role");
    while let Some(plan) = next_round(&barrier, region, role) {
        fail_round(region, role, &plan);
        barrier.exit(role);
    }
}

pub(crate) fn monitor_role(
    device: &Arc<dyn GpuDevice>,
    region: &SharedRegion,
    round_ctx: &RoundContext,
    config: &HarnessConfig,
    family_id: u32,
) {
    let barrier = RoundBarrier::new(region, NUM_PARTICIPANTS);
    let monitor = Monitor::new(
        device.as_ref(),
        config.outcome_map(),
        family_id,
        config.timing().reset_timeout,
        config.timing().monitor_poll,
    );

    while let Some(plan) = next_round(&barrier, region, Role::Monitor) {
        if !plan.skipped {
            let flags = match round_ctx.get() {
                Some(ctx) => monitor.watch(ctx, region).unwrap_or_else(|e| {
                    error!("Round {}: reset query failed: {e}", plan.round);
                    ResetBits::QUERY_FAILED
                }),
                None => ResetBits::empty(),
            };
            region.set_reset_state(ResetState {
                completed: true,
                flags,
            });
        }
        barrier.exit(Role::Monitor);
    }
}

pub(crate) fn test_role(
    device: &Arc<dyn GpuDevice>,
    region: &SharedRegion,
    round_ctx: &RoundContext,
    config: &HarnessConfig,
) {
    let barrier = RoundBarrier::new(region, NUM_PARTICIPANTS);
    // Faulting jobs always go through the kernel so the context reports the
    // reset.
    let runner = JobRunner::new(device, SubmitPath::Kernel)
        .map_err(|e| error!("Cannot run faulting jobs: {e}"))
        .ok();

    while let Some(plan) = next_round(&barrier, region, Role::Test) {
        if plan.skipped {
            barrier.exit(Role::Test);
            continue;
        }

        let setup_failed = TestState {
            completed: true,
            error_code: 0,
            flags: TestFlags::SETUP_FAILED,
        };
        let state = match (runner.as_ref(), plan.bad_job, round_ctx.get()) {
            (Some(runner), Some(job), Some(ctx)) => match runner.run(ctx, &job) {
                Ok(status) => {
                    info!("Round {}: {job} returned {status}", plan.round);
                    TestState {
                        completed: true,
                        error_code: status.code(),
                        flags: TestFlags::ERROR_CODE_SET,
                    }
                }
                Err(e) => {
                    error!("Round {}: {job} could not run: {e}", plan.round);
                    setup_failed
                }
            },
            _ => setup_failed,
        };
        region.set_test_state(state);

        // Either recovery may still be running.
        while !region.reset_state().completed {
            thread::sleep(config.timing().role_poll);
        }
        barrier.exit(Role::Test);
    }
}

/// Submits good jobs until the faulting job and the monitor are done.
///
/// At least one job runs per round, so a round always shows whether
/// unrelated work still makes progress.
pub(crate) fn background_role(
    device: &Arc<dyn GpuDevice>,
    region: &SharedRegion,
    config: &HarnessConfig,
) {
    let barrier = RoundBarrier::new(region, NUM_PARTICIPANTS);
    let runner = JobRunner::new(device, config.submit_path())
        .map_err(|e| error!("Cannot run good jobs: {e}"))
        .ok();
    let mut counter: u64 = 0;

    while let Some(plan) = next_round(&barrier, region, Role::Background) {
        if plan.skipped {
            barrier.exit(Role::Background);
            continue;
        }

        let ctx = match device.create_context(ContextPriority::Normal) {
            Ok(ctx) => Some(ctx),
            Err(e) => {
                error!("Background context: {e}");
                region.set_background_error(-e.errno().unwrap_or(libc::EIO));
                None
            }
        };

        loop {
            match (runner.as_ref(), plan.good_job, ctx) {
                (Some(runner), Some(job), Some(ctx)) => match runner.run(ctx, &job) {
                    Ok(status) => {
                        region.record_good_job(status.is_ok());
                        if !status.is_tolerated_for_good_job() {
                            warn!("Good job {job} returned {status}");
                            region.set_background_error(status.code());
                        }
                    }
                    Err(e) => {
                        error!("Good job {job}: {e}");
                        region.record_good_job(false);
                        region.set_background_error(-libc::EIO);
                        thread::sleep(config.timing().role_poll);
                    }
                },
                _ => thread::sleep(config.timing().role_poll),
            }

            counter += 1;
            if counter % PROGRESS_INTERVAL == 0 {
                debug!("Background ran {counter} good jobs");
            }
            if region.round_complete() {
                break;
            }
        }

        if let Some(ctx) = ctx {
            if let Err(e) = device.destroy_context(ctx) {
                warn!("Failed to destroy background context: {e}");
            }
        }
        barrier.exit(Role::Background);
    }
}
