// Typed interface to the amdgpu kernel driver
//
// Copyright 2025 The amdgpu-queue-reset Authors
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{fmt, marker::PhantomData, ptr::NonNull, time::Duration};

use bitflags::bitflags;
use clap::ValueEnum;
use serde::Deserialize;
use thiserror::Error as ThisError;
use vmm_sys_util::errno::Error as Errno;

use crate::asic::PciAddr;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Copy, Clone, Debug, PartialEq, ThisError)]
pub enum Error {
    #[error("Ioctl command failed for {0} operation: {1}")]
    IoctlFailure(&'static str, Errno),
    #[error("Failed to open the render node: {0}")]
    OpenFailed(Errno),
    #[error("Failed to map buffer object into the process: {0}")]
    MmapFailed(Errno),
    #[error("Unknown buffer object handle {0}")]
    UnknownHandle(u32),
    #[error("Unknown context {0}")]
    UnknownContext(u32),
    #[error("Unknown user queue {0}")]
    UnknownQueue(u32),
    #[error("IP block {0} is not supported by this device")]
    UnsupportedIp(IpType),
    #[error("GPU virtual address space exhausted")]
    VaExhausted,
    #[error("Access of {width} bytes at byte {offset} is past a {len} byte mapping")]
    OutOfMapping {
        offset: usize,
        width: usize,
        len: usize,
    },
}

impl Error {
    /// Kernel errno carried by this error, if it came from the kernel.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Self::IoctlFailure(_, e) | Self::OpenFailed(e) | Self::MmapFailed(e) => {
                Some(e.errno())
            }
            _ => None,
        }
    }
}

/// Hardware engine families the harness can target.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ValueEnum, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
#[repr(u32)]
pub enum IpType {
    Gfx = 0,
    Compute = 1,
    Dma = 2,
    Uvd = 3,
    Vce = 4,
    UvdEnc = 5,
    VcnDec = 6,
    VcnEnc = 7,
    VcnJpeg = 8,
    Vpe = 9,
}

impl IpType {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Gfx => "AMD_IP_GFX",
            Self::Compute => "AMD_IP_COMPUTE",
            Self::Dma => "AMD_IP_DMA",
            Self::Uvd => "AMD_IP_UVD",
            Self::Vce => "AMD_IP_VCE",
            Self::UvdEnc => "AMD_IP_UVD_ENC",
            Self::VcnDec => "AMD_IP_VCN_DEC",
            Self::VcnEnc => "AMD_IP_VCN_ENC",
            Self::VcnJpeg => "AMD_IP_VCN_JPEG",
            Self::Vpe => "AMD_IP_VPE",
        }
    }

    pub const fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::Gfx,
            1 => Self::Compute,
            2 => Self::Dma,
            3 => Self::Uvd,
            4 => Self::Vce,
            5 => Self::UvdEnc,
            6 => Self::VcnDec,
            7 => Self::VcnEnc,
            8 => Self::VcnJpeg,
            9 => Self::Vpe,
            _ => return None,
        })
    }
}

impl fmt::Display for IpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub u32);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ContextPriority {
    #[default]
    Normal,
    High,
}

impl ContextPriority {
    pub const fn raw(self) -> i32 {
        match self {
            Self::Normal => 0,
            Self::High => 512,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GpuInfo {
    pub device_id: u32,
    pub family_id: u32,
    pub chip_rev: u32,
    pub chip_external_rev: u32,
    pub va_start: u64,
    pub va_end: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HwIpInfo {
    pub version_major: u32,
    pub version_minor: u32,
    pub ib_start_alignment: u32,
    pub ib_size_alignment: u32,
    /// Bit per usable kernel ring.
    pub available_rings: u32,
    pub userq_num_slots: u32,
}

impl HwIpInfo {
    /// Number of submission slots, either kernel rings or user queue slots.
    pub fn ring_count(&self, user_queue: bool) -> u32 {
        if user_queue {
            self.userq_num_slots
        } else {
            self.available_rings.count_ones()
        }
    }

    pub fn ring_available(&self, ring: u32, user_queue: bool) -> bool {
        if user_queue {
            ring < self.userq_num_slots
        } else {
            ring < 32 && self.available_rings & (1 << ring) != 0
        }
    }
}

/// Firmware save areas a user mode queue has to provide.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FwAreaInfo {
    pub shadow_size: u32,
    pub shadow_alignment: u32,
    pub csa_size: u32,
    pub csa_alignment: u32,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Domain: u32 {
        const CPU = 1 << 0;
        const GTT = 1 << 1;
        const VRAM = 1 << 2;
        const DOORBELL = 1 << 6;
    }

    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct AllocFlags: u64 {
        const CPU_ACCESS_REQUIRED = 1 << 0;
        const NO_CPU_ACCESS = 1 << 1;
        const CPU_GTT_USWC = 1 << 2;
        const ENCRYPTED = 1 << 10;
    }

    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct VmFlags: u32 {
        const READABLE = 1 << 1;
        const WRITEABLE = 1 << 2;
        const EXECUTABLE = 1 << 3;
        const MTYPE_UC = 4 << 5;
    }

    /// Bits reported by the per-context reset query.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ResetFlags: u64 {
        const RESET = 1 << 0;
        const VRAMLOST = 1 << 1;
        const GUILTY = 1 << 2;
        const RAS_CE = 1 << 3;
        const RAS_UE = 1 << 4;
        const RESET_IN_PROGRESS = 1 << 5;
    }

    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SyncobjWaitFlags: u32 {
        const WAIT_ALL = 1 << 0;
        const WAIT_FOR_SUBMIT = 1 << 1;
        const WAIT_AVAILABLE = 1 << 2;
    }
}

/// A point on a timeline sync object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimelinePoint {
    pub syncobj: u32,
    pub point: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocRequest {
    pub size: u64,
    pub alignment: u64,
    pub domain: Domain,
    pub flags: AllocFlags,
    pub vm_flags: VmFlags,
    /// Bind the object into the GPU virtual address space.
    pub gpu_map: bool,
    /// Map the object into this process.
    pub cpu_map: bool,
    /// Signal this point once the GPU mapping is in place.
    pub timeline: Option<TimelinePoint>,
}

impl AllocRequest {
    pub const DEFAULT_VM_FLAGS: VmFlags = VmFlags::READABLE
        .union(VmFlags::WRITEABLE)
        .union(VmFlags::EXECUTABLE);

    /// CPU visible, GPU mapped GTT memory.
    pub fn gtt(size: u64) -> Self {
        Self {
            size,
            alignment: 4096,
            domain: Domain::GTT,
            flags: AllocFlags::empty(),
            vm_flags: Self::DEFAULT_VM_FLAGS,
            gpu_map: true,
            cpu_map: true,
            timeline: None,
        }
    }

    pub fn vram(size: u64) -> Self {
        Self {
            domain: Domain::VRAM,
            ..Self::gtt(size)
        }
    }

    pub fn doorbell(size: u64) -> Self {
        Self {
            domain: Domain::DOORBELL,
            gpu_map: false,
            ..Self::gtt(size)
        }
    }

    pub fn with_flags(mut self, flags: AllocFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn with_vm_flags(mut self, vm_flags: VmFlags) -> Self {
        self.vm_flags |= vm_flags;
        self
    }

    pub fn with_alignment(mut self, alignment: u64) -> Self {
        self.alignment = alignment;
        self
    }

    pub fn without_cpu_map(mut self) -> Self {
        self.cpu_map = false;
        self
    }

    pub fn with_timeline(mut self, timeline: TimelinePoint) -> Self {
        self.timeline = Some(timeline);
        self
    }
}

/// Address of a buffer object mapped into this process.
///
/// Holds no borrow of the mapping. Reads and writes go through a
/// [`CpuView`], which only the owner of the mapping hands out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CpuPtr {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: `CpuPtr` is an address and a length; it cannot access memory.
unsafe impl Send for CpuPtr {}
// SAFETY: see above.
unsafe impl Sync for CpuPtr {}

impl CpuPtr {
    /// # Safety
    ///
    /// `ptr` must point to a writable mapping of at least `len` bytes,
    /// aligned to 8 bytes.
    pub unsafe fn new(ptr: NonNull<u8>, len: usize) -> Self {
        Self { ptr, len }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// # Safety
    ///
    /// The mapping must stay valid for `'a`.
    pub unsafe fn view<'a>(self) -> CpuView<'a> {
        CpuView {
            ptr: self.ptr,
            len: self.len,
            _mapping: PhantomData,
        }
    }
}

/// Access to a mapping for as long as its owner is borrowed.
///
/// The GPU writes this memory behind the compiler's back, so every access
/// is volatile.
#[derive(Clone, Copy, Debug)]
pub struct CpuView<'a> {
    ptr: NonNull<u8>,
    len: usize,
    _mapping: PhantomData<&'a [u8]>,
}

// SAFETY: the view only performs volatile dword and qword accesses on a
// mapping that outlives it.
unsafe impl Send for CpuView<'_> {}
// SAFETY: see above.
unsafe impl Sync for CpuView<'_> {}

impl CpuView<'_> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn len_dw(&self) -> usize {
        self.len / 4
    }

    /// Pointer to the `width` byte item at `index`, once it is known to be
    /// inside the mapping.
    fn item(&self, index: usize, width: usize) -> Result<*mut u8> {
        let offset = index.saturating_mul(width);
        if offset.saturating_add(width) > self.len {
            return Err(Error::OutOfMapping {
                offset,
                width,
                len: self.len,
            });
        }
        // SAFETY: `offset + width` is within the mapping.
        Ok(unsafe { self.ptr.as_ptr().add(offset) })
    }

    pub fn read_u32(&self, index: usize) -> Result<u32> {
        let ptr = self.item(index, 4)?;
        // SAFETY: in bounds and 4 byte aligned.
        Ok(unsafe { ptr.cast::<u32>().read_volatile() })
    }

    pub fn write_u32(&self, index: usize, value: u32) -> Result<()> {
        let ptr = self.item(index, 4)?;
        // SAFETY: in bounds and 4 byte aligned.
        unsafe { ptr.cast::<u32>().write_volatile(value) };
        Ok(())
    }

    pub fn read_u64(&self, index: usize) -> Result<u64> {
        let ptr = self.item(index, 8)?;
        // SAFETY: in bounds and 8 byte aligned.
        Ok(unsafe { ptr.cast::<u64>().read_volatile() })
    }

    pub fn write_u64(&self, index: usize, value: u64) -> Result<()> {
        let ptr = self.item(index, 8)?;
        // SAFETY: in bounds and 8 byte aligned.
        unsafe { ptr.cast::<u64>().write_volatile(value) };
        Ok(())
    }

    pub fn fill_u32(&self, value: u32) {
        for i in 0..self.len_dw() {
            // SAFETY: every index below len_dw is in bounds.
            unsafe { self.ptr.as_ptr().cast::<u32>().add(i).write_volatile(value) };
        }
    }

    pub fn copy_from_u32(&self, offset: usize, words: &[u32]) -> Result<()> {
        if !words.is_empty() {
            self.item(offset.saturating_add(words.len() - 1), 4)?;
        }
        for (i, word) in words.iter().enumerate() {
            self.write_u32(offset + i, *word)?;
        }
        Ok(())
    }
}

/// A buffer object allocated and bound by the driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BoMapping {
    pub handle: u32,
    pub size: u64,
    /// Zero when the object has no GPU virtual address.
    pub gpu_addr: u64,
    pub cpu: Option<CpuPtr>,
}

/// One indirect buffer submission through the kernel CS path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IbRequest {
    pub ip: IpType,
    pub ring: u32,
    pub ib_addr: u64,
    pub ib_size_dw: u32,
    pub bo_handles: Vec<u32>,
    pub secure: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Fence {
    pub ctx: ContextId,
    pub ip: IpType,
    pub ring: u32,
    pub seq_no: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FenceTimeout {
    Infinite,
    After(Duration),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FenceStatus {
    Signaled,
    Pending,
}

pub const AMDGPU_CTX_NO_RESET: u32 = 0;
pub const AMDGPU_CTX_GUILTY_RESET: u32 = 1;
pub const AMDGPU_CTX_INNOCENT_RESET: u32 = 2;
pub const AMDGPU_CTX_UNKNOWN_RESET: u32 = 3;

/// Answer of the first generation reset query.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LegacyResetState {
    pub state: u32,
    pub hangs: u32,
}

/// Queue descriptor memory, one layout per engine family.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mqd {
    Gfx { shadow_va: u64, csa_va: u64 },
    Compute { eop_va: u64 },
    Sdma { csa_va: u64 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UserQueueDesc {
    pub ip: IpType,
    pub doorbell_handle: u32,
    pub doorbell_offset: u32,
    pub queue_va: u64,
    pub queue_size: u64,
    pub rptr_va: u64,
    pub wptr_va: u64,
    pub mqd: Mqd,
}

/// Everything the harness needs from the kernel driver.
///
/// The ioctl backend talks to a render node, the simulated backend
/// executes command streams in process.
#[cfg_attr(test, mockall::automock)]
pub trait GpuDevice: Send + Sync {
    fn driver_version(&self) -> (u32, u32);
    fn gpu_info(&self) -> Result<GpuInfo>;
    fn pci_addr(&self) -> Result<PciAddr>;
    fn query_hw_ip_info(&self, ip: IpType, instance: u32) -> Result<HwIpInfo>;
    fn query_fw_area_info(&self, ip: IpType) -> Result<FwAreaInfo>;

    fn create_context(&self, priority: ContextPriority) -> Result<ContextId>;
    fn destroy_context(&self, ctx: ContextId) -> Result<()>;
    fn query_reset_state(&self, ctx: ContextId) -> Result<ResetFlags>;
    fn query_reset_state_legacy(&self, ctx: ContextId) -> Result<LegacyResetState>;

    fn alloc_and_map(&self, request: &AllocRequest) -> Result<BoMapping>;
    fn unmap_and_free(&self, mapping: &BoMapping, timeline: Option<TimelinePoint>) -> Result<()>;

    /// Returns the sequence number of the submission.
    fn submit_cs(&self, ctx: ContextId, request: &IbRequest) -> Result<u64>;
    fn query_fence_status(&self, fence: &Fence, timeout: FenceTimeout) -> Result<FenceStatus>;

    fn create_user_queue(&self, desc: &UserQueueDesc) -> Result<u32>;
    fn destroy_user_queue(&self, queue_id: u32) -> Result<()>;
    /// Attach the queue's next completion fence to `syncobj`.
    fn signal_user_queue(&self, queue_id: u32, syncobj: u32) -> Result<()>;

    fn syncobj_create(&self) -> Result<u32>;
    fn syncobj_destroy(&self, handle: u32) -> Result<()>;
    /// Last submitted timeline point.
    fn syncobj_query(&self, handle: u32) -> Result<u64>;
    /// `timeout_ns` is an absolute CLOCK_MONOTONIC deadline, `i64::MAX`
    /// waits forever. A point of zero waits for the current fence.
    fn syncobj_wait(
        &self,
        handles: &[u32],
        points: &[u64],
        timeout_ns: i64,
        flags: SyncobjWaitFlags,
    ) -> Result<()>;
}
