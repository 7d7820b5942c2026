// Standalone hang and deadlock scenarios
//
// Copyright 2025 The amdgpu-queue-reset Authors
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
    sync::{mpsc, Arc},
    thread,
};

use log::{debug, error, info, warn};
use thiserror::Error as ThisError;

use crate::{
    asic::{gpu_reset_supported, is_reset_enable_at, PciAddr, ResetType, SYSFS_PCI_DEVICES},
    buffer::GpuBuffer,
    catalog::{ErrorKind, Job},
    device::{
        self, AllocRequest, ContextId, ContextPriority, FenceTimeout, GpuDevice, GpuInfo, IpType,
        VmFlags,
    },
    encoder::{encoder_for, sdma::SDMA_CORRUPTED_HEADER, EncodeError, RegisterLayout, WaitFunc},
    jobs::{execute, JobError, JobRunner, JobStatus, WRITE_LENGTH},
    ring::{RingContext, SubmitError, SubmitPath},
};

/// Upper bound of jobs queued behind a blocked wait.
pub const MAX_JOB_COUNT: usize = 200;
/// Dword of the wait buffer the blocked jobs poll.
pub const MEMORY_OFFSET: usize = 256;
pub const DEBUGFS_DRI: &str = "/sys/kernel/debug/dri";

const WAIT_BUFFER_SIZE: u64 = 4096;
const WAIT_CMD_DW: usize = 16;
const COPY_PACKET_DW: usize = 8;
const HEADER_HANG_SIZE: u32 = 4096;

#[derive(Debug, ThisError)]
pub enum DeadlockError {
    #[error(transparent)]
    Device(#[from] device::Error),
    #[error(transparent)]
    Submit(#[from] SubmitError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error("Wait buffer is not CPU mapped")]
    Unmapped,
    #[error("{ip} job ended with {status}")]
    Unexpected { ip: IpType, status: JobStatus },
    #[error("{0} is not an SDMA hang")]
    NotAHang(ErrorKind),
    #[error("{0} has no scheduler mask")]
    NoSchedMask(IpType),
    #[error("Malformed scheduler mask in {}: {contents:?}", .path.display())]
    MalformedMask { path: PathBuf, contents: String },
    #[error("Failed to write {}: {source}", .path.display())]
    SchedMask { path: PathBuf, source: io::Error },
}

pub type Result<T> = std::result::Result<T, DeadlockError>;

/// Rings the kernel scheduler may pick for one engine.
///
/// Isolating a ring narrows the mask to that ring. The mask found at open
/// time is written back on drop.
pub struct SchedMask {
    path: PathBuf,
    ip: IpType,
    original: u64,
}

impl SchedMask {
    pub fn open(debugfs_root: &Path, ip: IpType, pci: &PciAddr) -> Result<Self> {
        let file = match ip {
            IpType::Gfx => "amdgpu_gfx_sched_mask",
            IpType::Compute => "amdgpu_compute_sched_mask",
            IpType::Dma => "amdgpu_sdma_sched_mask",
            _ => return Err(DeadlockError::NoSchedMask(ip)),
        };
        let path = debugfs_root.join(pci.to_string()).join(file);

        let original = match fs::read_to_string(&path) {
            Ok(contents) => parse_mask(&contents).ok_or_else(|| DeadlockError::MalformedMask {
                path: path.clone(),
                contents: contents.clone(),
            })?,
            Err(e) => {
                info!("{}: {e}, scheduling on a single {ip} ring", path.display());
                1
            }
        };
        debug!("{ip} scheduler mask {original:#x}");

        Ok(Self { path, ip, original })
    }

    pub fn mask(&self) -> u64 {
        self.original
    }

    pub fn is_multi_ring(&self) -> bool {
        self.original > 1
    }

    pub fn rings(&self) -> impl Iterator<Item = u32> + '_ {
        (0..u64::BITS)
            .take_while(|&ring| 1u64 << ring <= self.original)
            .filter(|&ring| self.original & (1 << ring) != 0)
    }

    /// Compute ring 0 and gfx ring 1 are the high priority queues when
    /// more than one ring is scheduled.
    pub fn priority(&self, ring: u32) -> ContextPriority {
        match (self.ip, ring) {
            (IpType::Compute, 0) | (IpType::Gfx, 1) if self.is_multi_ring() => {
                ContextPriority::High
            }
            _ => ContextPriority::Normal,
        }
    }

    /// Leaves only `ring` to the scheduler.
    pub fn isolate(&self, ring: u32) -> Result<()> {
        if !self.is_multi_ring() {
            return Ok(());
        }
        info!("Keeping only {} ring {ring} enabled", self.ip);
        self.write(1 << ring)
    }

    fn write(&self, mask: u64) -> Result<()> {
        fs::write(&self.path, format!("0x{mask:x}")).map_err(|source| {
            DeadlockError::SchedMask {
                path: self.path.clone(),
                source,
            }
        })
    }
}

impl Drop for SchedMask {
    fn drop(&mut self) {
        if self.is_multi_ring() {
            if let Err(e) = self.write(self.original) {
                warn!("Failed to restore {} scheduler mask: {e}", self.ip);
            }
        }
    }
}

fn parse_mask(contents: &str) -> Option<u64> {
    let hex = contents.trim();
    let hex = hex
        .strip_prefix("0x")
        .or_else(|| hex.strip_prefix("0X"))
        .unwrap_or(hex);
    u64::from_str_radix(hex, 16).ok()
}

/// Size of the ping-pong copy chain that keeps an SDMA ring busy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlowCopy {
    /// Round trips between the two buffers.
    pub round_trips: u32,
    /// Bytes per copy.
    pub bytes: u32,
}

impl Default for SlowCopy {
    fn default() -> Self {
        Self {
            round_trips: 0x1_ffff,
            bytes: 256 * 4 * 0x2_0000,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scenario {
    /// Jobs queued behind a wait that never completes.
    WaitMemory(IpType),
    BadAccess(ErrorKind, IpType),
    HangSdma(ErrorKind),
}

/// Every scenario, in the order they run.
pub const SCENARIOS: &[Scenario] = &[
    Scenario::WaitMemory(IpType::Dma),
    Scenario::BadAccess(ErrorKind::BadRegAddress, IpType::Gfx),
    Scenario::BadAccess(ErrorKind::BadMemAddress, IpType::Gfx),
    Scenario::WaitMemory(IpType::Gfx),
    Scenario::BadAccess(ErrorKind::BadMemAddress, IpType::Compute),
    Scenario::WaitMemory(IpType::Compute),
    Scenario::HangSdma(ErrorKind::DmaCorruptedHeaderHang),
    Scenario::HangSdma(ErrorKind::DmaSlowLinearCopyHang),
    Scenario::BadAccess(ErrorKind::InvalidOpcode, IpType::Dma),
    Scenario::BadAccess(ErrorKind::BadMemAddress, IpType::Dma),
    Scenario::BadAccess(ErrorKind::BadRegAddress, IpType::Dma),
    Scenario::BadAccess(ErrorKind::InvalidPacketLength, IpType::Dma),
];

impl Scenario {
    pub fn ip(&self) -> IpType {
        match *self {
            Self::WaitMemory(ip) | Self::BadAccess(_, ip) => ip,
            Self::HangSdma(_) => IpType::Dma,
        }
    }

    pub fn name(&self) -> String {
        let engine = match self.ip() {
            IpType::Gfx => "gfx",
            IpType::Compute => "compute",
            _ => "sdma",
        };
        match *self {
            Self::WaitMemory(_) => format!("deadlock-{engine}"),
            Self::BadAccess(error, _) => format!("{engine}-{}", short_name(error)),
            Self::HangSdma(ErrorKind::DmaCorruptedHeaderHang) => {
                "sdma-corrupted-header".to_string()
            }
            Self::HangSdma(ErrorKind::DmaSlowLinearCopyHang) => {
                "sdma-slow-linear-copy".to_string()
            }
            Self::HangSdma(error) => format!("sdma-{}", short_name(error)),
        }
    }

    pub fn by_name(name: &str) -> Option<Self> {
        SCENARIOS.iter().copied().find(|s| s.name() == name)
    }
}

fn short_name(error: ErrorKind) -> String {
    match error {
        ErrorKind::BadRegAddress => "illegal-reg-access".to_string(),
        ErrorKind::BadMemAddress => "illegal-mem-access".to_string(),
        ErrorKind::InvalidOpcode => "bad-opcode".to_string(),
        ErrorKind::InvalidPacketLength => "bad-length".to_string(),
        other => other.name().to_lowercase().replace('_', "-"),
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScenarioResult {
    /// Every scheduled ring recovered.
    Passed { rings: u32 },
    Skipped(String),
}

/// Results of a batch of scenarios.
#[derive(Debug, Default)]
pub struct SuiteSummary {
    pub results: Vec<(Scenario, Result<ScenarioResult>)>,
}

impl SuiteSummary {
    pub fn passed(&self) -> usize {
        self.results
            .iter()
            .filter(|(_, r)| matches!(r, Ok(ScenarioResult::Passed { .. })))
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.results
            .iter()
            .filter(|(_, r)| matches!(r, Ok(ScenarioResult::Skipped(_))))
            .count()
    }

    /// Scenarios whose jobs did not end the way recovery should end them.
    pub fn failed(&self) -> usize {
        self.results
            .iter()
            .filter(|(_, r)| matches!(r, Err(DeadlockError::Unexpected { .. })))
            .count()
    }

    pub fn errors(&self) -> usize {
        self.results.len() - self.passed() - self.skipped() - self.failed()
    }

    /// 1 when a scenario could not be set up, 2 when one failed.
    pub fn exit_code(&self) -> i32 {
        if self.errors() > 0 {
            1
        } else if self.failed() > 0 {
            2
        } else {
            0
        }
    }
}

impl fmt::Display for SuiteSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} scenarios: {} passed, {} failed, {} errors, {} skipped",
            self.results.len(),
            self.passed(),
            self.failed(),
            self.errors(),
            self.skipped()
        )
    }
}

/// Runs the hang scenarios against one device.
pub struct DeadlockSuite {
    device: Arc<dyn GpuDevice>,
    info: GpuInfo,
    pci: Option<PciAddr>,
    layout: Option<RegisterLayout>,
    sysfs_root: PathBuf,
    debugfs_root: PathBuf,
    slow_copy: SlowCopy,
}

impl DeadlockSuite {
    pub fn new(device: &Arc<dyn GpuDevice>) -> Result<Self> {
        let info = device.gpu_info()?;
        let layout = RegisterLayout::for_family(info.family_id).ok();
        let pci = device
            .pci_addr()
            .map_err(|e| warn!("No PCI address, hang scenarios are skipped: {e}"))
            .ok();

        Ok(Self {
            device: device.clone(),
            info,
            pci,
            layout,
            sysfs_root: PathBuf::from(SYSFS_PCI_DEVICES),
            debugfs_root: PathBuf::from(DEBUGFS_DRI),
            slow_copy: SlowCopy::default(),
        })
    }

    pub fn with_roots(mut self, sysfs_root: PathBuf, debugfs_root: PathBuf) -> Self {
        self.sysfs_root = sysfs_root;
        self.debugfs_root = debugfs_root;
        self
    }

    pub fn with_slow_copy(mut self, slow_copy: SlowCopy) -> Self {
        self.slow_copy = slow_copy;
        self
    }

    fn layout(&self) -> Result<RegisterLayout> {
        self.layout
            .ok_or(EncodeError::UnsupportedFamily(self.info.family_id).into())
    }

    fn skip_reason(&self, ip: IpType) -> Result<Option<String>> {
        if !gpu_reset_supported(&self.info) {
            return Ok(Some(format!(
                "family {} cannot recover from hangs",
                self.info.family_id
            )));
        }
        let Some(pci) = self.pci.as_ref() else {
            return Ok(Some("unknown PCI address".to_string()));
        };
        if !is_reset_enable_at(&self.sysfs_root, ip, ResetType::PER_QUEUE, pci) {
            return Ok(Some(format!("per queue reset disabled for {ip}")));
        }
        if self.device.query_hw_ip_info(ip, 0)?.available_rings == 0 {
            return Ok(Some(format!("no {ip} ring")));
        }
        Ok(None)
    }

    /// Runs `scenario` once per scheduled ring.
    pub fn run(&self, scenario: Scenario) -> Result<ScenarioResult> {
        let ip = scenario.ip();
        if let Some(reason) = self.skip_reason(ip)? {
            warn!("Skipping {scenario}: {reason}");
            return Ok(ScenarioResult::Skipped(reason));
        }
        let Some(pci) = self.pci.as_ref() else {
            return Ok(ScenarioResult::Skipped("unknown PCI address".to_string()));
        };

        let mask = SchedMask::open(&self.debugfs_root, ip, pci)?;
        let mut rings = 0;
        for ring in mask.rings() {
            mask.isolate(ring)?;
            let priority = mask.priority(ring);
            let status = match scenario {
                Scenario::WaitMemory(ip) => self.wait_memory(ip, priority)?,
                Scenario::BadAccess(error, ip) => self.bad_access(error, ip, priority)?,
                Scenario::HangSdma(kind) => self.hang_sdma(kind)?,
            };
            info!("{scenario} on {ip} ring {ring} recovered with {status}");
            rings += 1;
        }
        Ok(ScenarioResult::Passed { rings })
    }

    /// Runs each scenario in turn. A failing scenario does not stop the
    /// others.
    pub fn run_all(&self, scenarios: &[Scenario]) -> SuiteSummary {
        let mut summary = SuiteSummary::default();
        for &scenario in scenarios {
            let result = self.run(scenario);
            if let Err(e) = &result {
                error!("{scenario}: {e}");
            }
            summary.results.push((scenario, result));
        }
        info!("{summary}");
        summary
    }

    fn with_context<T>(
        &self,
        priority: ContextPriority,
        f: impl FnOnce(ContextId) -> Result<T>,
    ) -> Result<T> {
        let ctx = self.device.create_context(priority)?;
        let result = f(ctx);
        if let Err(e) = self.device.destroy_context(ctx) {
            warn!("Failed to destroy {ctx}: {e}");
        }
        result
    }

    /// Queues jobs behind a `WAIT_REG_MEM` on memory nothing writes until
    /// they are done, so only a reset gets them off the ring.
    pub fn wait_memory(&self, ip: IpType, priority: ContextPriority) -> Result<JobStatus> {
        self.with_context(priority, |ctx| {
            let buffer = GpuBuffer::new(
                &self.device,
                &AllocRequest::gtt(WAIT_BUFFER_SIZE).with_vm_flags(VmFlags::MTYPE_UC),
            )?;
            let cpu = buffer.cpu().ok_or(DeadlockError::Unmapped)?;
            let addr = buffer.gpu_addr() + MEMORY_OFFSET as u64 * 4;
            cpu.fill_u32(0);

            // Dropped before the buffer it references.
            let mut ring =
                RingContext::new(&self.device, ip, 0, ctx, SubmitPath::Kernel, WAIT_CMD_DW)?;
            ring.reference(&buffer)?;
            let encoder = encoder_for(ip, self.layout()?)?;
            encoder.wait_reg_mem(ring.cmd(), addr, 0, u32::MAX, WaitFunc::NotEqual)?;
            encoder.pad(ring.cmd())?;

            let (release, released) = mpsc::channel::<()>();
            thread::scope(|scope| {
                let writer = scope.spawn(move || {
                    if released.recv().is_ok() {
                        if let Err(e) = cpu.write_u32(MEMORY_OFFSET, 1) {
                            warn!("Failed to release the waiting jobs: {e}");
                        }
                    }
                });

                let result = submit_blocked(&mut ring);
                if result.is_ok() {
                    let _ = release.send(());
                }
                drop(release);
                if writer.join().is_err() {
                    warn!("Wait memory writer panicked");
                }
                result
            })
        })
    }

    /// One faulting 128 dword linear write on ring 0.
    pub fn bad_access(
        &self,
        error: ErrorKind,
        ip: IpType,
        priority: ContextPriority,
    ) -> Result<JobStatus> {
        let runner = JobRunner::new(&self.device, SubmitPath::Kernel)?;
        let job = Job {
            error,
            ip,
            ring_id: 0,
            expected: None,
        };
        self.with_context(priority, |ctx| {
            let status = runner.write_linear_len(ctx, &job, WRITE_LENGTH)?;
            expect_fault(ip, status)
        })
    }

    /// Hangs an SDMA ring with a corrupted copy header or a copy chain
    /// that outlasts the job timeout.
    pub fn hang_sdma(&self, kind: ErrorKind) -> Result<JobStatus> {
        let (bytes, round_trips) = match kind {
            ErrorKind::DmaCorruptedHeaderHang => (HEADER_HANG_SIZE, 0),
            ErrorKind::DmaSlowLinearCopyHang => (self.slow_copy.bytes, self.slow_copy.round_trips),
            other => return Err(DeadlockError::NotAHang(other)),
        };
        let cmd_dw = (round_trips as usize * 2 + 1) * COPY_PACKET_DW + COPY_PACKET_DW;

        self.with_context(ContextPriority::Normal, |ctx| {
            let mut ring =
                RingContext::new(&self.device, IpType::Dma, 0, ctx, SubmitPath::Kernel, cmd_dw)?;
            let mut addrs = [0u64; 2];
            for addr in addrs.iter_mut() {
                let index = ring.alloc(&AllocRequest::gtt(u64::from(bytes)))?;
                let buffer = ring.resource(index).ok_or(DeadlockError::Unmapped)?;
                buffer.cpu().ok_or(DeadlockError::Unmapped)?.fill_u32(0);
                *addr = buffer.gpu_addr();
            }
            let [a, b] = addrs;

            let encoder = encoder_for(IpType::Dma, self.layout()?)?;
            if kind == ErrorKind::DmaCorruptedHeaderHang {
                encoder.copy_linear(ring.cmd(), a, b, bytes)?;
                ring.cmd().emit_at_offset(SDMA_CORRUPTED_HEADER, 0)?;
            } else {
                for _ in 0..round_trips {
                    encoder.copy_linear(ring.cmd(), a, b, bytes)?;
                    encoder.copy_linear(ring.cmd(), b, a, bytes)?;
                }
            }
            encoder.pad(ring.cmd())?;

            let status = execute(&mut ring)?;
            expect_fault(IpType::Dma, status)
        })
    }
}

/// Codes the blocked jobs may end with.
fn is_recovered(status: JobStatus) -> bool {
    matches!(-status.code(), 0 | libc::ECANCELED | libc::ENODATA)
}

fn expect_fault(ip: IpType, status: JobStatus) -> Result<JobStatus> {
    if status.is_ok() || !status.is_expected_fault() {
        return Err(DeadlockError::Unexpected { ip, status });
    }
    Ok(status)
}

/// Submits the ring's commands until the kernel refuses, then waits for the
/// last accepted job.
fn submit_blocked(ring: &mut RingContext) -> Result<JobStatus> {
    let ip = ring.ip();
    let mut submissions = Vec::with_capacity(MAX_JOB_COUNT);
    let mut status = JobStatus::OK;
    while submissions.len() < MAX_JOB_COUNT {
        match ring.submit() {
            Ok(submission) => submissions.push(submission),
            Err(SubmitError::Rejected(e)) => {
                status = JobStatus(-e.errno());
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }
    debug!("{} {ip} jobs queued, last submission {status}", submissions.len());
    if !is_recovered(status) {
        return Err(DeadlockError::Unexpected { ip, status });
    }

    let Some(last) = submissions.last() else {
        return Ok(status);
    };
    let status = match ring.wait(last, FenceTimeout::Infinite) {
        Ok(wait) => JobStatus(wait.code()),
        Err(SubmitError::Execution(e)) => JobStatus(-e.errno()),
        Err(e) => return Err(e.into()),
    };
    if !is_recovered(status) {
        return Err(DeadlockError::Unexpected { ip, status });
    }
    Ok(status)
}
