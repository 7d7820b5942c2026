// Kernel amdgpu driver backend
//
// Copyright 2025 The amdgpu-queue-reset Authors
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{
    ffi::c_void,
    fs::{File, OpenOptions},
    mem::size_of,
    os::unix::io::AsRawFd,
    path::Path,
    ptr::{self, NonNull},
    sync::{Mutex, PoisonError},
};

use log::{debug, info, warn};
use vmm_sys_util::{
    errno::Error as Errno,
    ioctl::{ioctl_with_mut_ref, ioctl_with_ref},
};

use super::bindings::*;
use crate::{asic::PciAddr, device::*};

const PAGE_SIZE: u64 = 4096;

fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

/// GPU virtual address range handed out to buffer objects.
///
/// Freed ranges are reused first fit, the rest of the range is handed out
/// from the top of what has been used so far.
#[derive(Debug)]
struct VaAllocator {
    next: u64,
    end: u64,
    free: Vec<(u64, u64)>,
}

impl VaAllocator {
    fn new(start: u64, end: u64) -> Self {
        Self {
            next: start,
            end,
            free: Vec::new(),
        }
    }

    fn alloc(&mut self, size: u64, alignment: u64) -> Option<u64> {
        let alignment = alignment.max(PAGE_SIZE);

        for i in 0..self.free.len() {
            let (start, len) = self.free[i];
            let addr = align_up(start, alignment);
            if addr + size <= start + len {
                self.free.swap_remove(i);
                if addr > start {
                    self.free.push((start, addr - start));
                }
                if addr + size < start + len {
                    self.free.push((addr + size, start + len - addr - size));
                }
                return Some(addr);
            }
        }

        let addr = align_up(self.next, alignment);
        if addr.checked_add(size)? > self.end {
            return None;
        }
        self.next = addr + size;
        Some(addr)
    }

    fn free(&mut self, addr: u64, size: u64) {
        self.free.push((addr, size));
    }
}

/// Absolute CLOCK_MONOTONIC deadline `timeout` from now, saturating.
fn monotonic_deadline(timeout: FenceTimeout) -> u64 {
    let FenceTimeout::After(duration) = timeout else {
        return u64::MAX;
    };
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `now` is a valid timespec for the duration of the call.
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut now) };
    let now_ns = (now.tv_sec as u64)
        .saturating_mul(1_000_000_000)
        .saturating_add(now.tv_nsec as u64);
    now_ns.saturating_add(duration.as_nanos().min(u128::from(u64::MAX)) as u64)
}

fn check(op: &'static str, ret: i32) -> Result<()> {
    if ret < 0 {
        Err(Error::IoctlFailure(op, Errno::last()))
    } else {
        Ok(())
    }
}

/// A render node driven by the amdgpu kernel driver.
pub struct AmdgpuDevice {
    file: File,
    version: (u32, u32),
    info: GpuInfo,
    pci: Option<PciAddr>,
    va: Mutex<VaAllocator>,
}

impl AmdgpuDevice {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::OpenFailed(Errno::new(e.raw_os_error().unwrap_or(libc::EIO))))?;

        let mut name = [0u8; 64];
        let mut version = DrmVersion {
            name_len: name.len(),
            name: name.as_mut_ptr() as u64,
            ..Default::default()
        };
        // SAFETY: `version` points at `name`, which outlives the call and
        // has room for `name_len` bytes.
        let ret =
            unsafe { ioctl_with_mut_ref(&file.as_raw_fd(), DRM_IOCTL_VERSION(), &mut version) };
        check("version", ret)?;
        let len = version.name_len.min(name.len());
        if &name[..len] != b"amdgpu" {
            return Err(Error::IoctlFailure("version", Errno::new(libc::ENODEV)));
        }

        let mut dev = DrmAmdgpuInfoDevice::default();
        query_info(&file, AMDGPU_INFO_DEV_INFO, 0, 0, &mut dev)?;

        let pci = match PciAddr::from_drm_fd(&file) {
            Ok(pci) => Some(pci),
            Err(e) => {
                warn!("Cannot resolve PCI address of {}: {e}", path.display());
                None
            }
        };

        let info = GpuInfo {
            device_id: dev.device_id,
            family_id: dev.family,
            chip_rev: dev.chip_rev,
            chip_external_rev: dev.external_rev,
            va_start: dev.virtual_address_offset,
            va_end: dev.virtual_address_max,
        };
        info!(
            "Opened {} amdgpu {}.{} device {:#x} family {} rev {:#x}",
            path.display(),
            version.version_major,
            version.version_minor,
            info.device_id,
            info.family_id,
            info.chip_external_rev
        );

        Ok(Self {
            file,
            version: (version.version_major as u32, version.version_minor as u32),
            info,
            pci,
            va: Mutex::new(VaAllocator::new(
                info.va_start.max(PAGE_SIZE),
                info.va_end,
            )),
        })
    }

    fn fd(&self) -> i32 {
        self.file.as_raw_fd()
    }

    fn va(&self) -> std::sync::MutexGuard<'_, VaAllocator> {
        self.va.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ctx_op(&self, op: u32, ctx_id: u32, priority: i32) -> Result<DrmAmdgpuCtx> {
        let mut args = DrmAmdgpuCtx {
            in_: CtxIn {
                op,
                flags: 0,
                ctx_id,
                priority,
            },
        };
        // SAFETY: `args` is a properly sized drm_amdgpu_ctx.
        let ret = unsafe { ioctl_with_mut_ref(&self.fd(), DRM_IOCTL_AMDGPU_CTX(), &mut args) };
        check("ctx", ret)?;
        Ok(args)
    }

    fn gem_close(&self, handle: u32) -> Result<()> {
        let args = DrmGemClose { handle, pad: 0 };
        // SAFETY: `args` is a valid drm_gem_close.
        let ret = unsafe { ioctl_with_ref(&self.fd(), DRM_IOCTL_GEM_CLOSE(), &args) };
        check("gem_close", ret)
    }

    fn gem_va(
        &self,
        operation: u32,
        handle: u32,
        va: u64,
        size: u64,
        flags: VmFlags,
        timeline: Option<TimelinePoint>,
    ) -> Result<()> {
        let (point, syncobj) = timeline.map_or((0, 0), |t| (t.point, t.syncobj));
        let args = DrmAmdgpuGemVa {
            handle,
            operation,
            flags: flags.bits(),
            va_address: va,
            map_size: size,
            vm_timeline_point: point,
            vm_timeline_syncobj_out: syncobj,
            ..Default::default()
        };
        // SAFETY: `args` is a valid drm_amdgpu_gem_va.
        let ret = unsafe { ioctl_with_ref(&self.fd(), DRM_IOCTL_AMDGPU_GEM_VA(), &args) };
        check("gem_va", ret)
    }

    fn cpu_map(&self, handle: u32, size: u64) -> Result<CpuPtr> {
        let mut args = DrmAmdgpuGemMmap {
            in_: GemMmapIn { handle, pad: 0 },
        };
        // SAFETY: `args` is a valid drm_amdgpu_gem_mmap.
        let ret = unsafe { ioctl_with_mut_ref(&self.fd(), DRM_IOCTL_AMDGPU_GEM_MMAP(), &mut args) };
        check("gem_mmap", ret)?;
        // SAFETY: the kernel filled in the output half.
        let offset = unsafe { args.out.addr_ptr };

        // SAFETY: maps a buffer object of `size` bytes through the render
        // node at the offset the kernel returned.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd(),
                offset as libc::off_t,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(Error::MmapFailed(Errno::last()));
        }
        let ptr = NonNull::new(addr.cast::<u8>())
            .ok_or(Error::MmapFailed(Errno::new(libc::EFAULT)))?;
        // SAFETY: a fresh page aligned shared mapping of `size` bytes that
        // lives until `unmap_and_free`.
        Ok(unsafe { CpuPtr::new(ptr, size as usize) })
    }

    fn wait_timeline(
        &self,
        handles: &[u32],
        points: &[u64],
        timeout_ns: i64,
        flags: u32,
    ) -> Result<()> {
        let mut args = DrmSyncobjTimelineWait {
            handles: handles.as_ptr() as u64,
            points: points.as_ptr() as u64,
            timeout_nsec: timeout_ns,
            count_handles: handles.len() as u32,
            flags,
            ..Default::default()
        };
        // SAFETY: `handles` and `points` outlive the call and hold
        // `count_handles` entries each.
        let ret = unsafe {
            ioctl_with_mut_ref(&self.fd(), DRM_IOCTL_SYNCOBJ_TIMELINE_WAIT(), &mut args)
        };
        check("syncobj_wait", ret)
    }
}

fn query_info<T>(file: &File, query: u32, ip: u32, instance: u32, out: &mut T) -> Result<()> {
    let args = DrmAmdgpuInfo {
        return_pointer: out as *mut T as u64,
        return_size: size_of::<T>() as u32,
        query,
        query_hw_ip: InfoQueryHwIp {
            type_: ip,
            ip_instance: instance,
            pad: [0; 2],
        },
    };
    // SAFETY: the kernel writes at most `return_size` bytes to `out`.
    let ret = unsafe { ioctl_with_ref(&file.as_raw_fd(), DRM_IOCTL_AMDGPU_INFO(), &args) };
    check("info", ret)
}

impl GpuDevice for AmdgpuDevice {
    fn driver_version(&self) -> (u32, u32) {
        self.version
    }

    fn gpu_info(&self) -> Result<GpuInfo> {
        Ok(self.info)
    }

    fn pci_addr(&self) -> Result<PciAddr> {
        self.pci
            .ok_or(Error::IoctlFailure("pci_addr", Errno::new(libc::ENODEV)))
    }

    fn query_hw_ip_info(&self, ip: IpType, instance: u32) -> Result<HwIpInfo> {
        let mut out = DrmAmdgpuInfoHwIp::default();
        query_info(&self.file, AMDGPU_INFO_HW_IP_INFO, ip as u32, instance, &mut out)?;
        Ok(HwIpInfo {
            version_major: out.hw_ip_version_major,
            version_minor: out.hw_ip_version_minor,
            ib_start_alignment: out.ib_start_alignment,
            ib_size_alignment: out.ib_size_alignment,
            available_rings: out.available_rings,
            userq_num_slots: out.userq_num_slots,
        })
    }

    fn query_fw_area_info(&self, ip: IpType) -> Result<FwAreaInfo> {
        let mut out = DrmAmdgpuInfoUqFwAreas::default();
        query_info(&self.file, AMDGPU_INFO_UQ_FW_AREAS, ip as u32, 0, &mut out)?;
        Ok(FwAreaInfo {
            shadow_size: out.shadow_size,
            shadow_alignment: out.shadow_alignment,
            csa_size: out.csa_size,
            csa_alignment: out.csa_alignment,
        })
    }

    fn create_context(&self, priority: ContextPriority) -> Result<ContextId> {
        let args = self.ctx_op(AMDGPU_CTX_OP_ALLOC_CTX, 0, priority.raw())?;
        // SAFETY: ALLOC_CTX fills in the alloc output.
        let id = unsafe { args.out.alloc.ctx_id };
        debug!("Created context {id}");
        Ok(ContextId(id))
    }

    fn destroy_context(&self, ctx: ContextId) -> Result<()> {
        self.ctx_op(AMDGPU_CTX_OP_FREE_CTX, ctx.0, 0).map(|_| ())
    }

    fn query_reset_state(&self, ctx: ContextId) -> Result<ResetFlags> {
        let args = self.ctx_op(AMDGPU_CTX_OP_QUERY_STATE2, ctx.0, 0)?;
        // SAFETY: QUERY_STATE2 fills in the state output.
        let flags = unsafe { args.out.state.flags };
        Ok(ResetFlags::from_bits_truncate(flags))
    }

    fn query_reset_state_legacy(&self, ctx: ContextId) -> Result<LegacyResetState> {
        let args = self.ctx_op(AMDGPU_CTX_OP_QUERY_STATE, ctx.0, 0)?;
        // SAFETY: QUERY_STATE fills in the state output.
        let state = unsafe { args.out.state };
        Ok(LegacyResetState {
            state: state.reset_status,
            hangs: state.hangs,
        })
    }

    fn alloc_and_map(&self, request: &AllocRequest) -> Result<BoMapping> {
        let size = align_up(request.size.max(1), PAGE_SIZE);
        let mut args = DrmAmdgpuGemCreate {
            in_: GemCreateIn {
                bo_size: size,
                alignment: request.alignment,
                domains: u64::from(request.domain.bits()),
                domain_flags: request.flags.bits(),
            },
        };
        // SAFETY: `args` is a valid drm_amdgpu_gem_create.
        let ret =
            unsafe { ioctl_with_mut_ref(&self.fd(), DRM_IOCTL_AMDGPU_GEM_CREATE(), &mut args) };
        check("gem_create", ret)?;
        // SAFETY: the kernel filled in the output half.
        let handle = unsafe { args.out.handle };

        let mut mapping = BoMapping {
            handle,
            size,
            gpu_addr: 0,
            cpu: None,
        };

        let result = (|| {
            if request.gpu_map {
                let va = self
                    .va()
                    .alloc(size, request.alignment)
                    .ok_or(Error::VaExhausted)?;
                if let Err(e) = self.gem_va(
                    AMDGPU_VA_OP_MAP,
                    handle,
                    va,
                    size,
                    request.vm_flags,
                    request.timeline,
                ) {
                    self.va().free(va, size);
                    return Err(e);
                }
                mapping.gpu_addr = va;
            }
            if request.cpu_map {
                mapping.cpu = Some(self.cpu_map(handle, size)?);
            }
            Ok(())
        })();

        if let Err(e) = result {
            if mapping.gpu_addr != 0 {
                let _ = self.unmap_and_free(&mapping, None);
            } else {
                let _ = self.gem_close(handle);
            }
            return Err(e);
        }
        Ok(mapping)
    }

    fn unmap_and_free(&self, mapping: &BoMapping, timeline: Option<TimelinePoint>) -> Result<()> {
        if let Some(cpu) = mapping.cpu {
            // SAFETY: the mapping was created by `cpu_map` with this length.
            unsafe { libc::munmap(cpu.as_ptr().cast::<c_void>(), cpu.len()) };
        }
        if mapping.gpu_addr != 0 {
            self.gem_va(
                AMDGPU_VA_OP_UNMAP,
                mapping.handle,
                mapping.gpu_addr,
                mapping.size,
                VmFlags::empty(),
                timeline,
            )?;
            self.va().free(mapping.gpu_addr, mapping.size);
        }
        self.gem_close(mapping.handle)
    }

    fn submit_cs(&self, ctx: ContextId, request: &IbRequest) -> Result<u64> {
        let entries: Vec<DrmAmdgpuBoListEntry> = request
            .bo_handles
            .iter()
            .map(|&bo_handle| DrmAmdgpuBoListEntry {
                bo_handle,
                bo_priority: 0,
            })
            .collect();
        let bo_list = DrmAmdgpuBoListIn {
            operation: AMDGPU_BO_LIST_OP_NONE,
            list_handle: AMDGPU_BO_LIST_OP_NONE,
            bo_number: entries.len() as u32,
            bo_info_size: size_of::<DrmAmdgpuBoListEntry>() as u32,
            bo_info_ptr: entries.as_ptr() as u64,
        };
        let ib = DrmAmdgpuCsChunkIb {
            flags: if request.secure {
                AMDGPU_IB_FLAGS_SECURE
            } else {
                0
            },
            va_start: request.ib_addr,
            ib_bytes: request.ib_size_dw * 4,
            ip_type: request.ip as u32,
            ip_instance: 0,
            ring: request.ring,
            ..Default::default()
        };
        let chunks = [
            DrmAmdgpuCsChunk {
                chunk_id: AMDGPU_CHUNK_ID_BO_HANDLES,
                length_dw: (size_of::<DrmAmdgpuBoListIn>() / 4) as u32,
                chunk_data: &bo_list as *const _ as u64,
            },
            DrmAmdgpuCsChunk {
                chunk_id: AMDGPU_CHUNK_ID_IB,
                length_dw: (size_of::<DrmAmdgpuCsChunkIb>() / 4) as u32,
                chunk_data: &ib as *const _ as u64,
            },
        ];
        let chunk_ptrs: Vec<u64> = chunks.iter().map(|c| c as *const _ as u64).collect();

        let mut args = DrmAmdgpuCs {
            in_: CsIn {
                ctx_id: ctx.0,
                bo_list_handle: 0,
                num_chunks: chunk_ptrs.len() as u32,
                flags: 0,
                chunks: chunk_ptrs.as_ptr() as u64,
            },
        };
        // SAFETY: every pointer in the chunk array refers to locals that
        // outlive the call.
        let ret = unsafe { ioctl_with_mut_ref(&self.fd(), DRM_IOCTL_AMDGPU_CS(), &mut args) };
        check("cs", ret)?;
        // SAFETY: the kernel filled in the output half.
        Ok(unsafe { args.out.handle })
    }

    fn query_fence_status(&self, fence: &Fence, timeout: FenceTimeout) -> Result<FenceStatus> {
        let mut args = DrmAmdgpuWaitCs {
            in_: WaitCsIn {
                handle: fence.seq_no,
                timeout: monotonic_deadline(timeout),
                ip_type: fence.ip as u32,
                ip_instance: 0,
                ring: fence.ring,
                ctx_id: fence.ctx.0,
            },
        };
        // SAFETY: `args` is a valid drm_amdgpu_wait_cs.
        let ret = unsafe { ioctl_with_mut_ref(&self.fd(), DRM_IOCTL_AMDGPU_WAIT_CS(), &mut args) };
        check("wait_cs", ret)?;
        // SAFETY: the kernel filled in the output half.
        if unsafe { args.out.status } == 0 {
            Ok(FenceStatus::Signaled)
        } else {
            Ok(FenceStatus::Pending)
        }
    }

    fn create_user_queue(&self, desc: &UserQueueDesc) -> Result<u32> {
        let gfx;
        let compute;
        let sdma;
        let (mqd, mqd_size) = match desc.mqd {
            Mqd::Gfx { shadow_va, csa_va } => {
                gfx = UserqMqdGfx11 { shadow_va, csa_va };
                (&gfx as *const _ as u64, size_of::<UserqMqdGfx11>())
            }
            Mqd::Compute { eop_va } => {
                compute = UserqMqdComputeGfx11 { eop_va };
                (&compute as *const _ as u64, size_of::<UserqMqdComputeGfx11>())
            }
            Mqd::Sdma { csa_va } => {
                sdma = UserqMqdSdmaGfx11 { csa_va };
                (&sdma as *const _ as u64, size_of::<UserqMqdSdmaGfx11>())
            }
        };

        let mut args = DrmAmdgpuUserq {
            in_: UserqIn {
                op: AMDGPU_USERQ_OP_CREATE,
                queue_id: 0,
                ip_type: desc.ip as u32,
                doorbell_handle: desc.doorbell_handle,
                doorbell_offset: desc.doorbell_offset,
                flags: 0,
                queue_va: desc.queue_va,
                queue_size: desc.queue_size,
                rptr_va: desc.rptr_va,
                wptr_va: desc.wptr_va,
                mqd,
                mqd_size: mqd_size as u64,
            },
        };
        // SAFETY: the MQD pointer refers to a local that outlives the call.
        let ret = unsafe { ioctl_with_mut_ref(&self.fd(), DRM_IOCTL_AMDGPU_USERQ(), &mut args) };
        check("userq", ret)?;
        // SAFETY: the kernel filled in the output half.
        Ok(unsafe { args.out.queue_id })
    }

    fn destroy_user_queue(&self, queue_id: u32) -> Result<()> {
        let mut args = DrmAmdgpuUserq {
            in_: UserqIn {
                op: AMDGPU_USERQ_OP_FREE,
                queue_id,
                ..Default::default()
            },
        };
        // SAFETY: `args` is a valid drm_amdgpu_userq.
        let ret = unsafe { ioctl_with_mut_ref(&self.fd(), DRM_IOCTL_AMDGPU_USERQ(), &mut args) };
        check("userq", ret)
    }

    fn signal_user_queue(&self, queue_id: u32, syncobj: u32) -> Result<()> {
        let handles = [syncobj];
        let mut args = DrmAmdgpuUserqSignal {
            queue_id,
            syncobj_handles: handles.as_ptr() as u64,
            num_syncobj_handles: handles.len() as u64,
            ..Default::default()
        };
        // SAFETY: `handles` outlives the call.
        let ret = unsafe {
            ioctl_with_mut_ref(&self.fd(), DRM_IOCTL_AMDGPU_USERQ_SIGNAL(), &mut args)
        };
        check("userq_signal", ret)
    }

    fn syncobj_create(&self) -> Result<u32> {
        let mut args = DrmSyncobjCreate::default();
        // SAFETY: `args` is a valid drm_syncobj_create.
        let ret = unsafe { ioctl_with_mut_ref(&self.fd(), DRM_IOCTL_SYNCOBJ_CREATE(), &mut args) };
        check("syncobj_create", ret)?;
        Ok(args.handle)
    }

    fn syncobj_destroy(&self, handle: u32) -> Result<()> {
        let mut args = DrmSyncobjDestroy { handle, pad: 0 };
        // SAFETY: `args` is a valid drm_syncobj_destroy.
        let ret = unsafe { ioctl_with_mut_ref(&self.fd(), DRM_IOCTL_SYNCOBJ_DESTROY(), &mut args) };
        check("syncobj_destroy", ret)
    }

    fn syncobj_query(&self, handle: u32) -> Result<u64> {
        let handles = [handle];
        let mut points = [0u64];
        let mut args = DrmSyncobjTimelineArray {
            handles: handles.as_ptr() as u64,
            points: points.as_mut_ptr() as u64,
            count_handles: 1,
            flags: DRM_SYNCOBJ_QUERY_FLAGS_LAST_SUBMITTED,
        };
        // SAFETY: both arrays hold one entry and outlive the call.
        let ret = unsafe { ioctl_with_mut_ref(&self.fd(), DRM_IOCTL_SYNCOBJ_QUERY(), &mut args) };
        check("syncobj_query", ret)?;
        Ok(points[0])
    }

    fn syncobj_wait(
        &self,
        handles: &[u32],
        points: &[u64],
        timeout_ns: i64,
        flags: SyncobjWaitFlags,
    ) -> Result<()> {
        if points.len() < handles.len() {
            return Err(Error::IoctlFailure("syncobj_wait", Errno::new(libc::EINVAL)));
        }
        self.wait_timeline(handles, points, timeout_ns, flags.bits())
    }
}
