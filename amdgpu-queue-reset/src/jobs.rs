// Good and faulting job bodies
//
// Copyright 2025 The amdgpu-queue-reset Authors
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{fmt, sync::Arc};

use log::{debug, trace};
use thiserror::Error as ThisError;

use crate::{
    buffer::GpuBuffer,
    catalog::{ErrorKind, Job},
    device::{AllocFlags, AllocRequest, ContextId, CpuView, FenceTimeout, GpuDevice, IpType},
    encoder::{
        dispatch::{dispatch_direct, program_compute, shader_code, ShaderProgram},
        encoder_for, EncodeError, Pm4Encoder, RegisterLayout, WRITE_PATTERN,
    },
    ring::{RingContext, SubmitError, SubmitPath},
};

pub const CMD_BUFFER_DW: usize = 256;
pub const WRITE_LENGTH: u32 = 128;
/// Gfx firmware skips a short invalid opcode packet without hanging.
pub const SHORT_WRITE_LENGTH: u32 = 10;
const DISPATCH_MARKER: u32 = 0x600d_c0de;
const MARKER_INDEX: usize = 64;

#[derive(Debug, ThisError)]
pub enum JobError {
    #[error(transparent)]
    Submit(#[from] SubmitError),
    #[error("Failed to encode job: {0}")]
    Encode(#[from] EncodeError),
    #[error("Job buffer is not CPU mapped")]
    Unmapped,
    #[error("Job result mismatch at dword {index}: {value:#x}")]
    Verify { index: usize, value: u32 },
}

impl From<crate::device::Error> for JobError {
    fn from(e: crate::device::Error) -> Self {
        Self::Submit(SubmitError::Setup(e))
    }
}

/// Outcome of a job as the kernel reported it: zero or a negative errno.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct JobStatus(pub i32);

impl JobStatus {
    pub const OK: Self = Self(0);

    pub fn is_ok(&self) -> bool {
        self.0 == 0
    }

    pub fn code(&self) -> i32 {
        self.0
    }

    /// Codes a good job may see while a fault elsewhere is recovered.
    pub fn is_tolerated_for_good_job(&self) -> bool {
        matches!(
            -self.0,
            0 | libc::ECANCELED | libc::ENODATA | libc::EHWPOISON
        )
    }

    /// Codes a faulting job is allowed to end with.
    pub fn is_expected_fault(&self) -> bool {
        matches!(-self.0, 0 | libc::ECANCELED | libc::ETIME | libc::ENODATA)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match -self.0 {
            0 => f.write_str("0"),
            libc::ECANCELED => f.write_str("-ECANCELED"),
            libc::ETIME => f.write_str("-ETIME"),
            libc::ENODATA => f.write_str("-ENODATA"),
            libc::EHWPOISON => f.write_str("-EHWPOISON"),
            _ => write!(f, "{}", self.0),
        }
    }
}

fn cpu_of(ring: &RingContext, index: usize) -> Result<CpuView<'_>, JobError> {
    ring.resource(index)
        .and_then(GpuBuffer::cpu)
        .ok_or(JobError::Unmapped)
}

fn gpu_addr_of(ring: &RingContext, index: usize) -> u64 {
    ring.resource(index).map_or(0, GpuBuffer::gpu_addr)
}

/// Submits what `ring` holds and waits for it without a timeout.
///
/// Faults the kernel reports come back as the status.
pub fn execute(ring: &mut RingContext) -> Result<JobStatus, JobError> {
    let submission = match ring.submit() {
        Ok(submission) => submission,
        Err(SubmitError::Rejected(e)) => {
            debug!("{} ring {} rejected: {e}", ring.ip(), ring.ring_id());
            return Ok(JobStatus(-e.errno()));
        }
        Err(e) => return Err(e.into()),
    };

    match ring.wait(&submission, FenceTimeout::Infinite) {
        Ok(status) => Ok(JobStatus(status.code())),
        Err(SubmitError::Execution(e)) => Ok(JobStatus(-e.errno())),
        Err(e) => Err(e.into()),
    }
}

/// Builds and runs jobs on one device.
pub struct JobRunner {
    device: Arc<dyn GpuDevice>,
    layout: RegisterLayout,
    path: SubmitPath,
}

impl JobRunner {
    pub fn new(device: &Arc<dyn GpuDevice>, path: SubmitPath) -> Result<Self, JobError> {
        let info = device.gpu_info()?;
        Ok(Self {
            device: device.clone(),
            layout: RegisterLayout::for_family(info.family_id)?,
            path,
        })
    }

    pub fn path(&self) -> SubmitPath {
        self.path
    }

    pub fn layout(&self) -> &RegisterLayout {
        &self.layout
    }

    /// Runs `job` on `ctx` and waits for it.
    ///
    /// Faults the kernel reports come back as the status, `Err` means the
    /// job could not be built or the outcome could not be read.
    pub fn run(&self, ctx: ContextId, job: &Job) -> Result<JobStatus, JobError> {
        trace!("Running {job} via {}", self.path);
        if job.error.is_shader_error() {
            self.dispatch(ctx, job)
        } else {
            self.write_linear(ctx, job)
        }
    }

    /// Linear write of a known pattern, or its faulting variant.
    pub fn write_linear(&self, ctx: ContextId, job: &Job) -> Result<JobStatus, JobError> {
        let length = if job.ip == IpType::Gfx && job.error == ErrorKind::InvalidOpcode {
            SHORT_WRITE_LENGTH
        } else {
            WRITE_LENGTH
        };
        self.write_linear_len(ctx, job, length)
    }

    /// `write_linear` with an explicit length in dwords.
    pub fn write_linear_len(
        &self,
        ctx: ContextId,
        job: &Job,
        length: u32,
    ) -> Result<JobStatus, JobError> {
        let mut ring = RingContext::new(
            &self.device,
            job.ip,
            job.ring_id,
            ctx,
            self.path,
            CMD_BUFFER_DW,
        )?;
        let dst = ring.alloc(
            &AllocRequest::gtt(u64::from(length) * 4).with_flags(AllocFlags::CPU_GTT_USWC),
        )?;
        let dst_addr = gpu_addr_of(&ring, dst);
        cpu_of(&ring, dst)?.fill_u32(0);

        let encoder = encoder_for(job.ip, self.layout)?;
        if job.error.is_success() {
            encoder.write_linear(ring.cmd(), dst_addr, length)?;
        } else {
            encoder.bad_write_linear(ring.cmd(), dst_addr, length, job.error)?;
        }
        encoder.pad(ring.cmd())?;

        let status = execute(&mut ring)?;
        if status.is_ok() && job.error.is_success() {
            let cpu = cpu_of(&ring, dst)?;
            for index in 0..length as usize {
                let value = cpu.read_u32(index)?;
                if value != WRITE_PATTERN {
                    return Err(JobError::Verify { index, value });
                }
            }
        }
        Ok(status)
    }

    /// Compute dispatch followed by a confirmed completion marker.
    pub fn dispatch(&self, ctx: ContextId, job: &Job) -> Result<JobStatus, JobError> {
        if !matches!(job.ip, IpType::Gfx | IpType::Compute) {
            return Err(EncodeError::Unsupported(job.error, job.ip).into());
        }

        let mut ring = RingContext::new(
            &self.device,
            job.ip,
            job.ring_id,
            ctx,
            self.path,
            CMD_BUFFER_DW,
        )?;
        let code = ring.alloc(&AllocRequest::gtt(4096))?;
        let data = ring.alloc(&AllocRequest::gtt(4096))?;
        let (code_addr, data_addr) = (gpu_addr_of(&ring, code), gpu_addr_of(&ring, data));

        cpu_of(&ring, code)?.copy_from_u32(0, &shader_code(&self.layout, job.error))?;
        cpu_of(&ring, data)?.fill_u32(0);

        let program =
            ShaderProgram::new(&self.layout, code_addr, data_addr).with_error(job.error, job.ip)?;
        program_compute(ring.cmd(), &self.layout, &program)?;
        dispatch_direct(ring.cmd(), &self.layout, [1, 1, 1])?;
        Pm4Encoder::new(job.ip, self.layout).write_confirm(
            ring.cmd(),
            data_addr + MARKER_INDEX as u64 * 4,
            DISPATCH_MARKER,
        )?;

        let status = execute(&mut ring)?;
        if status.is_ok() && job.error.is_success() {
            let value = cpu_of(&ring, data)?.read_u32(MARKER_INDEX)?;
            if value != DISPATCH_MARKER {
                return Err(JobError::Verify {
                    index: MARKER_INDEX,
                    value,
                });
            }
        }
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::{device::ContextPriority, testutils::sim_device};

    fn job(error: ErrorKind, ip: IpType) -> Job {
        Job {
            error,
            ip,
            ring_id: 0,
            expected: None,
        }
    }

    #[test]
    fn test_good_jobs_succeed() {
        let (sim, device) = sim_device();
        let runner = JobRunner::new(&device, SubmitPath::Kernel).unwrap();
        let ctx = device.create_context(ContextPriority::Normal).unwrap();

        for ip in [IpType::Gfx, IpType::Compute, IpType::Dma] {
            let status = runner
                .run(ctx, &job(ErrorKind::CmdStreamExecSuccess, ip))
                .unwrap();
            assert_eq!(status, JobStatus::OK, "{ip}");
        }
        for ip in [IpType::Gfx, IpType::Compute] {
            let status = runner
                .run(ctx, &job(ErrorKind::ShaderExecSuccess, ip))
                .unwrap();
            assert_eq!(status, JobStatus::OK, "{ip}");
        }
        // Rings free their buffers once the job is done.
        assert_eq!(sim.live_buffers(), 0);
    }

    #[test]
    fn test_faulting_jobs_report_errno() {
        let (_sim, device) = sim_device();
        let runner = JobRunner::new(&device, SubmitPath::Kernel).unwrap();

        for (error, ip) in [
            (ErrorKind::InvalidOpcode, IpType::Compute),
            (ErrorKind::InvalidOpcode, IpType::Gfx),
            (ErrorKind::InvalidPacketLength, IpType::Dma),
            (ErrorKind::InvalidProgramAddr, IpType::Compute),
            (ErrorKind::InvalidUserData, IpType::Gfx),
            (ErrorKind::InvalidShader, IpType::Compute),
        ] {
            let ctx = device.create_context(ContextPriority::Normal).unwrap();
            let status = runner.run(ctx, &job(error, ip)).unwrap();
            assert_eq!(status, JobStatus(-libc::ENODATA), "{error} on {ip}");
            assert!(status.is_expected_fault());
        }
    }

    #[test]
    fn test_guilty_context_rejects_next_job() {
        let (_sim, device) = sim_device();
        let runner = JobRunner::new(&device, SubmitPath::Kernel).unwrap();
        let ctx = device.create_context(ContextPriority::Normal).unwrap();

        runner
            .run(ctx, &job(ErrorKind::InvalidOpcode, IpType::Compute))
            .unwrap();
        let status = runner
            .run(ctx, &job(ErrorKind::CmdStreamExecSuccess, IpType::Compute))
            .unwrap();
        assert_eq!(status, JobStatus(-libc::ECANCELED));
        assert!(status.is_tolerated_for_good_job());
    }

    #[test]
    fn test_user_queue_good_job() {
        let (_sim, device) = sim_device();
        let runner = JobRunner::new(&device, SubmitPath::UserQueue).unwrap();
        let ctx = device.create_context(ContextPriority::Normal).unwrap();
        let status = runner
            .run(ctx, &job(ErrorKind::CmdStreamExecSuccess, IpType::Compute))
            .unwrap();
        assert_eq!(status, JobStatus::OK);
    }

    #[test]
    fn test_dispatch_on_sdma_unsupported() {
        let (_sim, device) = sim_device();
        let runner = JobRunner::new(&device, SubmitPath::Kernel).unwrap();
        let ctx = device.create_context(ContextPriority::Normal).unwrap();
        assert_matches!(
            runner.run(ctx, &job(ErrorKind::InvalidShader, IpType::Dma)),
            Err(JobError::Encode(EncodeError::Unsupported(
                ErrorKind::InvalidShader,
                IpType::Dma
            )))
        );
    }

    #[test]
    fn test_status_display() {
        assert_eq!(JobStatus(-libc::ENODATA).to_string(), "-ENODATA");
        assert_eq!(JobStatus(-libc::EIO).to_string(), format!("{}", -libc::EIO));
        assert!(!JobStatus(-libc::EIO).is_expected_fault());
        assert!(!JobStatus(-libc::ETIME).is_tolerated_for_good_job());
    }
}
