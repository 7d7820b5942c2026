// Ring context: command buffer, buffers and one submission path
//
// Copyright 2025 The amdgpu-queue-reset Authors
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{fmt, sync::Arc};

use clap::ValueEnum;
use log::{debug, trace, warn};
use serde::Deserialize;
use thiserror::Error as ThisError;
use vmm_sys_util::errno::Error as Errno;

use crate::{
    buffer::GpuBuffer,
    device::{
        self, AllocRequest, ContextId, Fence, FenceStatus, FenceTimeout, GpuDevice, HwIpInfo,
        IbRequest, IpType, VmFlags,
    },
    encoder::{CmdBuffer, EncodeError},
    user_queue::UserQueue,
};

/// Buffers a job can attach besides its indirect buffer.
pub const MAX_RESOURCES: usize = 4;
const IB_ALIGNMENT: u64 = 4096;

/// How command buffers reach the hardware.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubmitPath {
    /// Kernel command submission ioctl.
    #[default]
    Kernel,
    /// Doorbell on a user mode queue.
    UserQueue,
}

impl fmt::Display for SubmitPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kernel => f.write_str("kernel"),
            Self::UserQueue => f.write_str("user-queue"),
        }
    }
}

#[derive(Debug, ThisError)]
pub enum SubmitError {
    #[error("Submission rejected by the kernel: {0}")]
    Rejected(Errno),
    #[error("Execution failed: {0}")]
    Execution(Errno),
    #[error("Ring setup failed: {0}")]
    Setup(#[from] device::Error),
    #[error("Command encoding failed: {0}")]
    Encode(#[from] EncodeError),
    #[error("A ring holds at most {MAX_RESOURCES} buffers")]
    TooManyResources,
    #[error("{0} ring {1} is not available")]
    RingUnavailable(IpType, u32),
    #[error("Ring context already destroyed")]
    Destroyed,
}

impl SubmitError {
    /// Status code as a negative errno, when the kernel produced one.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Rejected(e) | Self::Execution(e) => Some(-e.errno()),
            Self::Setup(e) => e.errno().map(|e| -e),
            _ => None,
        }
    }
}

/// Completion states a submission can reach. A reset discarding the job
/// is an ordinary outcome, not an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitStatus {
    Signaled,
    TimedOut,
    Cancelled(Errno),
}

impl WaitStatus {
    /// Zero or a negative errno.
    pub fn code(&self) -> i32 {
        match self {
            Self::Signaled => 0,
            Self::TimedOut => -libc::ETIME,
            Self::Cancelled(e) => -e.errno(),
        }
    }
}

/// Errnos the kernel uses for jobs discarded by a reset.
pub fn is_reset_errno(errno: i32) -> bool {
    matches!(errno, libc::ECANCELED | libc::ENODATA | libc::ETIME)
}

enum Pending {
    Kernel(Fence),
    /// User queue submissions are waited for when they are rung.
    UserQueue(Option<Errno>),
}

/// An in-flight command buffer. Dropping it frees the indirect buffer
/// whether or not the fence ever signaled.
pub struct Submission {
    pending: Pending,
    _ib: GpuBuffer,
}

impl Submission {
    pub fn fence(&self) -> Option<Fence> {
        match self.pending {
            Pending::Kernel(fence) => Some(fence),
            Pending::UserQueue(_) => None,
        }
    }
}

/// One command stream in flight on one ring.
pub struct RingContext {
    device: Arc<dyn GpuDevice>,
    ip: IpType,
    ring_id: u32,
    ctx: ContextId,
    hw_ip_info: HwIpInfo,
    pm4: CmdBuffer,
    resources: Vec<GpuBuffer>,
    external: Vec<u32>,
    user_queue: Option<UserQueue>,
    path: SubmitPath,
    secure: bool,
    destroyed: bool,
}

impl RingContext {
    pub fn new(
        device: &Arc<dyn GpuDevice>,
        ip: IpType,
        ring_id: u32,
        ctx: ContextId,
        path: SubmitPath,
        pm4_dw: usize,
    ) -> Result<Self, SubmitError> {
        let hw_ip_info = device.query_hw_ip_info(ip, 0)?;
        let user_queue = path == SubmitPath::UserQueue;
        if !hw_ip_info.ring_available(ring_id, user_queue) {
            return Err(SubmitError::RingUnavailable(ip, ring_id));
        }

        let user_queue = if user_queue {
            Some(UserQueue::new(device, ip)?)
        } else {
            None
        };

        trace!("{ip} ring {ring_id} on {ctx} via {path}");
        Ok(Self {
            device: device.clone(),
            ip,
            ring_id,
            ctx,
            hw_ip_info,
            pm4: CmdBuffer::with_capacity(pm4_dw),
            resources: Vec::with_capacity(MAX_RESOURCES),
            external: Vec::new(),
            user_queue,
            path,
            secure: false,
            destroyed: false,
        })
    }

    pub fn ip(&self) -> IpType {
        self.ip
    }

    pub fn ring_id(&self) -> u32 {
        self.ring_id
    }

    pub fn ctx(&self) -> ContextId {
        self.ctx
    }

    pub fn path(&self) -> SubmitPath {
        self.path
    }

    pub fn hw_ip_info(&self) -> &HwIpInfo {
        &self.hw_ip_info
    }

    pub fn cmd(&mut self) -> &mut CmdBuffer {
        &mut self.pm4
    }

    pub fn set_secure(&mut self, secure: bool) {
        self.secure = secure;
    }

    /// Allocates a buffer owned by this ring and returns its index.
    pub fn alloc(&mut self, request: &AllocRequest) -> Result<usize, SubmitError> {
        if self.destroyed {
            return Err(SubmitError::Destroyed);
        }
        if self.resources.len() + self.external.len() == MAX_RESOURCES {
            return Err(SubmitError::TooManyResources);
        }
        self.resources.push(GpuBuffer::new(&self.device, request)?);
        Ok(self.resources.len() - 1)
    }

    pub fn resource(&self, index: usize) -> Option<&GpuBuffer> {
        self.resources.get(index)
    }

    /// Adds a buffer the caller owns to the BO list of every later submission.
    ///
    /// The buffer must outlive the submissions that reference it.
    pub fn reference(&mut self, buffer: &GpuBuffer) -> Result<(), SubmitError> {
        if self.destroyed {
            return Err(SubmitError::Destroyed);
        }
        if self.resources.len() + self.external.len() == MAX_RESOURCES {
            return Err(SubmitError::TooManyResources);
        }
        self.external.push(buffer.handle());
        Ok(())
    }

    fn alloc_ib(&mut self) -> Result<GpuBuffer, SubmitError> {
        let bytes = (self.pm4.len() as u64 * 4).max(1);
        let size = bytes.div_ceil(IB_ALIGNMENT) * IB_ALIGNMENT;
        let mut request = AllocRequest::gtt(size).with_vm_flags(VmFlags::MTYPE_UC);

        let ib = match self.user_queue.as_mut() {
            Some(queue) => {
                request = request.with_timeline(queue.next_point()?);
                let ib = GpuBuffer::new(&self.device, &request)?;
                queue.wait_timeline()?;
                ib
            }
            None => GpuBuffer::new(&self.device, &request)?,
        };

        ib.cpu()
            .ok_or(SubmitError::Setup(device::Error::UnknownHandle(ib.handle())))?
            .copy_from_u32(0, self.pm4.as_slice())
            .map_err(SubmitError::Setup)?;
        Ok(ib)
    }

    /// Copies the command buffer into a fresh indirect buffer and submits it.
    pub fn submit(&mut self) -> Result<Submission, SubmitError> {
        if self.destroyed {
            return Err(SubmitError::Destroyed);
        }

        let ib = self.alloc_ib()?;
        let ib_size_dw = self.pm4.len() as u32;
        debug!(
            "Submitting {ib_size_dw} dwords on {} ring {} via {}",
            self.ip, self.ring_id, self.path
        );

        let pending = match self.user_queue.as_mut() {
            Some(queue) => {
                queue
                    .ring_doorbell(ib.gpu_addr(), ib_size_dw)
                    .map_err(rejected)?;
                Pending::UserQueue(match queue.wait_fence() {
                    Ok(()) => None,
                    Err(e) => Some(kernel_errno(e)?),
                })
            }
            None => {
                let mut bo_handles: Vec<u32> =
                    self.resources.iter().map(GpuBuffer::handle).collect();
                bo_handles.extend_from_slice(&self.external);
                bo_handles.push(ib.handle());
                let request = IbRequest {
                    ip: self.ip,
                    ring: self.ring_id,
                    ib_addr: ib.gpu_addr(),
                    ib_size_dw,
                    bo_handles,
                    secure: self.secure,
                };
                let seq_no = self
                    .device
                    .submit_cs(self.ctx, &request)
                    .map_err(rejected)?;
                Pending::Kernel(Fence {
                    ctx: self.ctx,
                    ip: self.ip,
                    ring: self.ring_id,
                    seq_no,
                })
            }
        };

        Ok(Submission { pending, _ib: ib })
    }

    pub fn wait(
        &self,
        submission: &Submission,
        timeout: FenceTimeout,
    ) -> Result<WaitStatus, SubmitError> {
        let errno = match submission.pending {
            Pending::Kernel(fence) => match self.device.query_fence_status(&fence, timeout) {
                Ok(FenceStatus::Signaled) => return Ok(WaitStatus::Signaled),
                Ok(FenceStatus::Pending) => return Ok(WaitStatus::TimedOut),
                Err(e) => kernel_errno(e)?,
            },
            Pending::UserQueue(None) => return Ok(WaitStatus::Signaled),
            Pending::UserQueue(Some(errno)) => errno,
        };

        if is_reset_errno(errno.errno()) {
            Ok(WaitStatus::Cancelled(errno))
        } else {
            Err(SubmitError::Execution(errno))
        }
    }

    /// Frees everything the ring owns. Safe to call more than once.
    pub fn destroy(&mut self) -> Result<(), SubmitError> {
        if self.destroyed {
            return Ok(());
        }
        self.destroyed = true;
        self.external.clear();

        let mut result = Ok(());
        if let Some(mut queue) = self.user_queue.take() {
            if let Err(e) = queue.destroy() {
                result = Err(e.into());
            }
        }
        while let Some(mut buffer) = self.resources.pop() {
            if let Err(e) = buffer.release(None) {
                warn!("Freeing {} ring buffer: {e}", self.ip);
                if result.is_ok() {
                    result = Err(e.into());
                }
            }
        }
        result
    }
}

impl Drop for RingContext {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            warn!("Failed to destroy {} ring context: {e}", self.ip);
        }
    }
}

fn kernel_errno(e: device::Error) -> Result<Errno, SubmitError> {
    match e {
        device::Error::IoctlFailure(_, errno) => Ok(errno),
        other => Err(SubmitError::Setup(other)),
    }
}

fn rejected(e: device::Error) -> SubmitError {
    match kernel_errno(e) {
        Ok(errno) => SubmitError::Rejected(errno),
        Err(other) => other,
    }
}

#[cfg(test)]
mod tests {
    use std::{
        ptr::NonNull,
        sync::atomic::{AtomicU32, Ordering},
    };

    use assert_matches::assert_matches;

    use super::*;
    use crate::{
        device::{BoMapping, CpuPtr, MockGpuDevice},
        encoder::{encoder_for, RegisterLayout, WRITE_PATTERN},
        testutils::sim_device,
    };

    fn mock_with_buffers(frees: Arc<AtomicU32>) -> MockGpuDevice {
        let mut device = MockGpuDevice::new();
        let mut backing: Vec<Box<[u64]>> = Vec::new();
        let mut next = 0u32;
        device.expect_query_hw_ip_info().returning(|_, _| {
            Ok(HwIpInfo {
                available_rings: 0b11,
                ..Default::default()
            })
        });
        device.expect_alloc_and_map().returning(move |req| {
            next += 1;
            let mut storage = vec![0u64; (req.size / 8) as usize].into_boxed_slice();
            let ptr = NonNull::new(storage.as_mut_ptr().cast::<u8>()).unwrap();
            backing.push(storage);
            Ok(BoMapping {
                handle: next,
                size: req.size,
                gpu_addr: u64::from(next) << 16,
                // SAFETY: storage is kept alive by the mock.
                cpu: Some(unsafe { CpuPtr::new(ptr, req.size as usize) }),
            })
        });
        device.expect_unmap_and_free().returning(move |_, _| {
            frees.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        device
    }

    #[test]
    fn test_destroy_twice_frees_once() {
        let frees = Arc::new(AtomicU32::new(0));
        let device: Arc<dyn GpuDevice> = Arc::new(mock_with_buffers(frees.clone()));

        let mut ring = RingContext::new(
            &device,
            IpType::Compute,
            1,
            ContextId(1),
            SubmitPath::Kernel,
            64,
        )
        .unwrap();
        ring.alloc(&AllocRequest::gtt(4096)).unwrap();
        ring.alloc(&AllocRequest::gtt(4096)).unwrap();

        ring.destroy().unwrap();
        ring.destroy().unwrap();
        drop(ring);
        assert_eq!(frees.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_resource_limit() {
        let frees = Arc::new(AtomicU32::new(0));
        let device: Arc<dyn GpuDevice> = Arc::new(mock_with_buffers(frees));
        let mut ring =
            RingContext::new(&device, IpType::Gfx, 0, ContextId(1), SubmitPath::Kernel, 64)
                .unwrap();
        for i in 0..MAX_RESOURCES {
            assert_eq!(ring.alloc(&AllocRequest::gtt(4096)).unwrap(), i);
        }
        assert_matches!(
            ring.alloc(&AllocRequest::gtt(4096)),
            Err(SubmitError::TooManyResources)
        );
    }

    #[test]
    fn test_reference_joins_bo_list() {
        let frees = Arc::new(AtomicU32::new(0));
        let mut device = mock_with_buffers(frees.clone());
        device
            .expect_submit_cs()
            .withf(|_, req| req.bo_handles.len() == 3 && req.bo_handles[1] == 1)
            .returning(|_, _| Ok(7));
        let device: Arc<dyn GpuDevice> = Arc::new(device);

        let shared = GpuBuffer::new(&device, &AllocRequest::gtt(4096)).unwrap();
        let mut ring =
            RingContext::new(&device, IpType::Gfx, 0, ContextId(1), SubmitPath::Kernel, 64)
                .unwrap();
        ring.alloc(&AllocRequest::gtt(4096)).unwrap();
        ring.reference(&shared).unwrap();
        ring.cmd().emit(0xffff_1000).unwrap();
        ring.submit().unwrap();

        ring.destroy().unwrap();
        assert_matches!(ring.reference(&shared), Err(SubmitError::Destroyed));
        // The shared buffer outlives the ring.
        assert_eq!(frees.load(Ordering::SeqCst), 2);
        drop(ring);
        drop(shared);
        assert_eq!(frees.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_ring_unavailable() {
        let frees = Arc::new(AtomicU32::new(0));
        let device: Arc<dyn GpuDevice> = Arc::new(mock_with_buffers(frees));
        assert_matches!(
            RingContext::new(&device, IpType::Gfx, 2, ContextId(1), SubmitPath::Kernel, 64)
                .map(|_| ()),
            Err(SubmitError::RingUnavailable(IpType::Gfx, 2))
        );
    }

    #[test]
    fn test_submit_rejected_and_cancelled() {
        let frees = Arc::new(AtomicU32::new(0));
        let mut device = mock_with_buffers(frees);
        let mut calls = 0;
        device.expect_submit_cs().returning(move |_, req| {
            calls += 1;
            assert_eq!(req.bo_handles.len(), 1);
            if calls == 1 {
                Err(device::Error::IoctlFailure("cs", Errno::new(libc::EINVAL)))
            } else {
                Ok(42)
            }
        });
        device
            .expect_query_fence_status()
            .withf(|fence, _| fence.seq_no == 42)
            .returning(|_, _| {
                Err(device::Error::IoctlFailure(
                    "wait_cs",
                    Errno::new(libc::ENODATA),
                ))
            });
        let device: Arc<dyn GpuDevice> = Arc::new(device);

        let mut ring =
            RingContext::new(&device, IpType::Gfx, 0, ContextId(3), SubmitPath::Kernel, 64)
                .unwrap();
        ring.cmd().emit(0xffff_1000).unwrap();

        let err = ring.submit().err().unwrap();
        assert_matches!(err, SubmitError::Rejected(e) if e.errno() == libc::EINVAL);
        assert_eq!(err.code(), Some(-libc::EINVAL));

        let submission = ring.submit().unwrap();
        assert_eq!(submission.fence().unwrap().ctx, ContextId(3));
        let status = ring.wait(&submission, FenceTimeout::Infinite).unwrap();
        assert_matches!(status, WaitStatus::Cancelled(e) if e.errno() == libc::ENODATA);
        assert_eq!(status.code(), -libc::ENODATA);
    }

    #[test]
    fn test_execution_error() {
        let frees = Arc::new(AtomicU32::new(0));
        let mut device = mock_with_buffers(frees);
        device.expect_submit_cs().returning(|_, _| Ok(1));
        device.expect_query_fence_status().returning(|_, _| {
            Err(device::Error::IoctlFailure("wait_cs", Errno::new(libc::EIO)))
        });
        let device: Arc<dyn GpuDevice> = Arc::new(device);

        let mut ring =
            RingContext::new(&device, IpType::Gfx, 0, ContextId(3), SubmitPath::Kernel, 64)
                .unwrap();
        ring.cmd().emit(0xffff_1000).unwrap();
        let submission = ring.submit().unwrap();
        assert_matches!(
            ring.wait(&submission, FenceTimeout::Infinite),
            Err(SubmitError::Execution(e)) if e.errno() == libc::EIO
        );
    }

    #[test]
    fn test_user_queue_ordering() {
        let (sim, device) = sim_device();
        let layout = RegisterLayout::for_family(sim.gpu_info().unwrap().family_id).unwrap();
        let encoder = encoder_for(IpType::Compute, layout).unwrap();
        let ctx = device.create_context(Default::default()).unwrap();
        let target = GpuBuffer::new(&device, &AllocRequest::gtt(4096)).unwrap();
        let cpu = target.cpu().unwrap();

        let mut ring =
            RingContext::new(&device, IpType::Compute, 0, ctx, SubmitPath::UserQueue, 64)
                .unwrap();
        const K: u32 = 32;
        for i in 0..K {
            ring.cmd().clear();
            encoder
                .atomic_cmpswap(ring.cmd(), target.gpu_addr() + u64::from(i) * 4, i + 1, 0)
                .unwrap();
            encoder.pad(ring.cmd()).unwrap();
            let submission = ring.submit().unwrap();
            assert_eq!(
                ring.wait(&submission, FenceTimeout::Infinite).unwrap(),
                WaitStatus::Signaled
            );
        }

        let values: Vec<u32> = (0..K as usize).map(|i| cpu.read_u32(i).unwrap()).collect();
        assert_eq!(values, (1..=K).collect::<Vec<_>>());
        assert_eq!(cpu.read_u32(K as usize).unwrap(), 0);
        assert_ne!(cpu.read_u32(0).unwrap(), WRITE_PATTERN);
        ring.destroy().unwrap();
    }
}
