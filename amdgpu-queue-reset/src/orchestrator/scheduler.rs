// Round scheduling
//
// Copyright 2025 The amdgpu-queue-reset Authors
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::sync::Arc;

use log::{debug, info, warn};

use super::{judge, HarnessError, RoundContext, RoundOutcome, RoundReport, Verdict};
use crate::{
    asic::{reset_mask_at, PciAddr, ResetType},
    catalog::{CatalogEntry, ErrorKind, ExpectedResult, Job},
    device::{ContextPriority, GpuDevice, GpuInfo, HwIpInfo, IpType},
    jobs::JobStatus,
    ring::SubmitPath,
    shared::{
        BackgroundStats, ResetBits, Role, RoundBarrier, RoundPlan, SharedRegion, NUM_PARTICIPANTS,
    },
    HarnessConfig,
};

/// Engine the good jobs run on.
pub const GOOD_JOB_IP: IpType = IpType::Compute;
const MAX_RINGS: u32 = 32;

/// Picks the rings of the good and the faulting job.
///
/// The good job takes the first usable compute ring. A faulting compute
/// job takes the next compute ring after it, any other engine its first
/// ring.
pub fn select_rings(
    good: &HwIpInfo,
    good_user_queue: bool,
    bad: &HwIpInfo,
    bad_ip: IpType,
) -> Option<(u32, u32)> {
    let good_ring = (0..MAX_RINGS).find(|&r| good.ring_available(r, good_user_queue))?;
    let first_bad = if bad_ip == GOOD_JOB_IP { good_ring + 1 } else { 0 };
    let bad_ring = (first_bad..MAX_RINGS).find(|&r| bad.ring_available(r, false))?;
    Some((good_ring, bad_ring))
}

pub struct Scheduler<'a> {
    device: &'a Arc<dyn GpuDevice>,
    config: &'a HarnessConfig,
    region: &'a SharedRegion,
    round_ctx: &'a RoundContext,
    info: GpuInfo,
    pci: Option<PciAddr>,
    good_info: HwIpInfo,
    round: u32,
}

impl<'a> Scheduler<'a> {
    pub(crate) fn new(
        device: &'a Arc<dyn GpuDevice>,
        config: &'a HarnessConfig,
        region: &'a SharedRegion,
        round_ctx: &'a RoundContext,
    ) -> Result<Self, HarnessError> {
        let info = device.gpu_info()?;
        let pci = device
            .pci_addr()
            .map_err(|e| warn!("No PCI address, reset masks are not checked: {e}"))
            .ok();
        let good_info = device.query_hw_ip_info(GOOD_JOB_IP, 0)?;

        Ok(Self {
            device,
            config,
            region,
            round_ctx,
            info,
            pci,
            good_info,
            round: 0,
        })
    }

    fn skip_reason(
        &self,
        entry: &CatalogEntry,
        ip: IpType,
        expected: Option<ExpectedResult>,
        rings: Option<(u32, u32)>,
    ) -> Option<String> {
        if !entry.supports(ip) {
            return Some(format!("{} has no {ip} variant", entry.name()));
        }
        if entry.is_excluded(&self.info) {
            return Some("excluded on this ASIC".to_string());
        }
        if rings.is_none() {
            return Some(format!("no free {ip} ring"));
        }
        if expected == Some(ExpectedResult::QueueReset) {
            let mask = self
                .pci
                .as_ref()
                .and_then(|pci| reset_mask_at(self.config.sysfs_root(), ip, pci));
            if let Some(mask) = mask {
                if !mask.contains(ResetType::PER_QUEUE) {
                    return Some(format!("per queue reset disabled for {ip}"));
                }
            }
        }
        None
    }

    /// Runs one round of `entry` faulting on `ip`.
    ///
    /// Errors only come from setup done before the round is published, so
    /// the roles never wait on a round that does not happen.
    pub fn run_round(
        &mut self,
        entry: &CatalogEntry,
        ip: IpType,
    ) -> Result<RoundReport, HarnessError> {
        let bad_info = self.device.query_hw_ip_info(ip, 0)?;
        let good_user_queue = self.config.submit_path() == SubmitPath::UserQueue;
        let rings = select_rings(&self.good_info, good_user_queue, &bad_info, ip);
        let (good_ring, bad_ring) = rings.unwrap_or_default();
        let expected = entry.expected_for(ip);

        let bad_job = Job {
            error: entry.error,
            ip,
            ring_id: bad_ring,
            expected,
        };
        let good_job = Job {
            error: ErrorKind::CmdStreamExecSuccess,
            ip: GOOD_JOB_IP,
            ring_id: good_ring,
            expected: None,
        };
        self.round += 1;
        let mut plan = RoundPlan {
            round: self.round,
            job_exists: true,
            skipped: false,
            bad_job: Some(bad_job),
            good_job: Some(good_job),
        };

        if let Some(reason) = self.skip_reason(entry, ip, expected, rings) {
            warn!("Round {}: skipping {bad_job}: {reason}", self.round);
            plan.skipped = true;
            self.cross(&plan);
            return Ok(RoundReport {
                round: self.round,
                bad_job,
                good_job: None,
                status: JobStatus::OK,
                reset_bits: ResetBits::empty(),
                outcome: None,
                background: BackgroundStats::default(),
                verdict: Verdict::Skipped(reason),
            });
        }

        info!(
            "Round {}: {bad_job} against good jobs on {} ring {good_ring}, expecting {expected:?}",
            self.round, GOOD_JOB_IP
        );
        let ctx = self.device.create_context(ContextPriority::Normal)?;
        self.round_ctx.set(Some(ctx));
        self.cross(&plan);
        self.round_ctx.set(None);

        let test = self.region.test_state();
        let reset = self.region.reset_state();
        let background = self.region.background_stats();
        if let Err(e) = self.device.destroy_context(ctx) {
            warn!("Failed to destroy round context {ctx}: {e}");
        }

        let report = RoundReport {
            round: self.round,
            bad_job,
            good_job: Some(good_job),
            status: JobStatus(test.error_code),
            reset_bits: reset.flags,
            outcome: Some(RoundOutcome::from_bits(reset.flags)),
            background,
            verdict: judge(expected, &test, &reset, &background),
        };
        info!("{report}");
        Ok(report)
    }

    /// Publishes `plan` and waits until every role is done with it.
    fn cross(&self, plan: &RoundPlan) {
        self.region.publish_round(plan);
        let barrier = RoundBarrier::new(self.region, NUM_PARTICIPANTS);
        barrier.enter(Role::Scheduler);
        debug!("Round {} running", plan.round);
        barrier.exit(Role::Scheduler);
    }

    /// Sends the sentinel round that ends every role.
    pub fn finish(self) {
        debug!("Ending after {} rounds", self.round);
        Self::release_roles(self.region);
    }

    pub(crate) fn release_roles(region: &SharedRegion) {
        let plan = RoundPlan {
            round: region.round_plan().round,
            ..Default::default()
        };
        region.publish_round(&plan);
        let barrier = RoundBarrier::new(region, NUM_PARTICIPANTS);
        barrier.enter(Role::Scheduler);
        barrier.exit(Role::Scheduler);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        fs::{create_dir_all, write},
        thread,
        time::Duration,
    };

    use tempfile::tempdir;

    use super::*;
    use crate::{
        catalog::{entry, QUEUE_RESET_CATALOG},
        device::MockGpuDevice,
        shared::SharedMemory,
        BackgroundMode, DriverKind, Timing,
    };

    fn hw(rings: u32, slots: u32) -> HwIpInfo {
        HwIpInfo {
            available_rings: rings,
            userq_num_slots: slots,
            ..Default::default()
        }
    }

    #[test]
    fn test_select_rings() {
        // Compute faults skip the good job's ring.
        assert_eq!(
            select_rings(&hw(0b1111, 0), false, &hw(0b1111, 0), IpType::Compute),
            Some((0, 1))
        );
        assert_eq!(
            select_rings(&hw(0b1111, 0), false, &hw(0b1, 0), IpType::Gfx),
            Some((0, 0))
        );
        assert_eq!(
            select_rings(&hw(0b1100, 0), false, &hw(0b1100, 0), IpType::Compute),
            Some((2, 3))
        );
        assert_eq!(
            select_rings(&hw(0b1, 0), false, &hw(0b1, 0), IpType::Compute),
            None
        );
        assert_eq!(select_rings(&hw(0, 0), false, &hw(0b1, 0), IpType::Gfx), None);
        // User queue slots replace the kernel rings for the good job.
        assert_eq!(
            select_rings(&hw(0, 2), true, &hw(0b11, 0), IpType::Compute),
            Some((0, 1))
        );
    }

    fn config(sysfs: &std::path::Path) -> HarnessConfig {
        HarnessConfig::new(
            DriverKind::Sim,
            "/dev/null".into(),
            SubmitPath::Kernel,
            vec![IpType::Compute],
            &[],
            Timing {
                reset_timeout: Duration::from_secs(1),
                monitor_poll: Duration::from_millis(1),
                role_poll: Duration::from_millis(1),
            },
            BackgroundMode::Thread,
        )
        .unwrap()
        .with_sysfs_root(sysfs.to_path_buf())
    }

    fn mock(family_id: u32, chip_external_rev: u32) -> Arc<dyn GpuDevice> {
        let mut device = MockGpuDevice::new();
        device.expect_gpu_info().returning(move || {
            Ok(GpuInfo {
                family_id,
                chip_external_rev,
                ..Default::default()
            })
        });
        device.expect_pci_addr().returning(|| {
            Ok(PciAddr {
                domain: 0,
                bus: 3,
                device: 0,
                function: 0,
            })
        });
        device
            .expect_query_hw_ip_info()
            .returning(|_, _| Ok(hw(0b1111, 2)));
        // Skipped rounds never create a context.
        device.expect_create_context().never();
        Arc::new(device)
    }

    fn run_skipped(
        device: &Arc<dyn GpuDevice>,
        config: &HarnessConfig,
        entry: &CatalogEntry,
    ) -> RoundReport {
        let shm = SharedMemory::anonymous().unwrap();
        let region = shm.region();
        let round_ctx = RoundContext::default();

        thread::scope(|s| {
            // The roles only cross the barriers of skipped rounds.
            for role in [Role::Monitor, Role::Test, Role::Background] {
                s.spawn(move || {
                    let barrier = RoundBarrier::new(region, NUM_PARTICIPANTS);
                    loop {
                        barrier.enter(role);
                        let plan = region.round_plan();
                        barrier.exit(role);
                        if !plan.job_exists {
                            break;
                        }
                        assert!(plan.skipped);
                    }
                });
            }
            let mut scheduler = Scheduler::new(device, config, region, &round_ctx).unwrap();
            let report = scheduler.run_round(entry, IpType::Compute).unwrap();
            scheduler.finish();
            report
        })
    }

    #[test]
    fn test_excluded_asic_skips_round() {
        let sysfs = tempdir().unwrap();
        let config = config(sysfs.path());
        // Navi31 cannot recover from bad register writes by queue reset.
        let device = mock(crate::asic::FAMILY_GC_11_0_0, 0x01);
        let report = run_skipped(&device, &config, entry(ErrorKind::BadRegAddress).unwrap());

        assert_eq!(
            report.verdict,
            Verdict::Skipped("excluded on this ASIC".to_string())
        );
        assert_eq!(report.outcome, None);
    }

    #[test]
    fn test_disabled_queue_reset_skips_round() {
        let sysfs = tempdir().unwrap();
        let dir = sysfs.path().join("0000:03:00.0");
        create_dir_all(&dir).unwrap();
        write(dir.join("compute_reset_mask"), "full soft\n").unwrap();

        let config = config(sysfs.path());
        let device = mock(crate::asic::FAMILY_NV, 0x28);
        let report = run_skipped(&device, &config, &QUEUE_RESET_CATALOG[0]);

        assert_eq!(
            report.verdict,
            Verdict::Skipped("per queue reset disabled for AMD_IP_COMPUTE".to_string())
        );
        assert_eq!(report.round, 1);
    }
}
