// DRM and amdgpu kernel interface definitions
//
// Copyright 2025 The amdgpu-queue-reset Authors
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

#![allow(dead_code)]

use vmm_sys_util::{ioctl_iow_nr, ioctl_iowr_nr};

const DRM_IOCTL_BASE: u32 = 0x64;
const DRM_COMMAND_BASE: u32 = 0x40;

pub const AMDGPU_CHUNK_ID_IB: u32 = 0x01;
pub const AMDGPU_CHUNK_ID_BO_HANDLES: u32 = 0x06;
pub const AMDGPU_IB_FLAGS_SECURE: u32 = 1 << 5;

pub const AMDGPU_CTX_OP_ALLOC_CTX: u32 = 1;
pub const AMDGPU_CTX_OP_FREE_CTX: u32 = 2;
pub const AMDGPU_CTX_OP_QUERY_STATE: u32 = 3;
pub const AMDGPU_CTX_OP_QUERY_STATE2: u32 = 4;

pub const AMDGPU_VA_OP_MAP: u32 = 1;
pub const AMDGPU_VA_OP_UNMAP: u32 = 2;

pub const AMDGPU_INFO_HW_IP_INFO: u32 = 0x02;
pub const AMDGPU_INFO_DEV_INFO: u32 = 0x16;
pub const AMDGPU_INFO_UQ_FW_AREAS: u32 = 0x24;

pub const AMDGPU_USERQ_OP_CREATE: u32 = 1;
pub const AMDGPU_USERQ_OP_FREE: u32 = 2;

pub const DRM_SYNCOBJ_QUERY_FLAGS_LAST_SUBMITTED: u32 = 1 << 0;

/// Marks "no bo list" in the BO_HANDLES chunk.
pub const AMDGPU_BO_LIST_OP_NONE: u32 = !0;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DrmVersion {
    pub version_major: i32,
    pub version_minor: i32,
    pub version_patchlevel: i32,
    pub name_len: usize,
    pub name: u64,
    pub date_len: usize,
    pub date: u64,
    pub desc_len: usize,
    pub desc: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DrmGemClose {
    pub handle: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DrmSyncobjCreate {
    pub handle: u32,
    pub flags: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DrmSyncobjDestroy {
    pub handle: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DrmSyncobjTimelineWait {
    pub handles: u64,
    pub points: u64,
    pub timeout_nsec: i64,
    pub count_handles: u32,
    pub flags: u32,
    pub first_signaled: u32,
    pub pad: u32,
    pub deadline_nsec: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DrmSyncobjTimelineArray {
    pub handles: u64,
    pub points: u64,
    pub count_handles: u32,
    pub flags: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct GemCreateIn {
    pub bo_size: u64,
    pub alignment: u64,
    pub domains: u64,
    pub domain_flags: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct GemCreateOut {
    pub handle: u32,
    pub pad: u32,
}

#[repr(C)]
pub union DrmAmdgpuGemCreate {
    pub in_: GemCreateIn,
    pub out: GemCreateOut,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct GemMmapIn {
    pub handle: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct GemMmapOut {
    pub addr_ptr: u64,
}

#[repr(C)]
pub union DrmAmdgpuGemMmap {
    pub in_: GemMmapIn,
    pub out: GemMmapOut,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DrmAmdgpuGemVa {
    pub handle: u32,
    pub pad: u32,
    pub operation: u32,
    pub flags: u32,
    pub va_address: u64,
    pub offset_in_bo: u64,
    pub map_size: u64,
    pub vm_timeline_point: u64,
    pub vm_timeline_syncobj_out: u32,
    pub num_syncobj_handles: u32,
    pub input_fence_syncobj_handles: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct CtxIn {
    pub op: u32,
    pub flags: u32,
    pub ctx_id: u32,
    pub priority: i32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct CtxOutState {
    pub flags: u64,
    pub hangs: u32,
    pub reset_status: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct CtxOutAlloc {
    pub ctx_id: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union CtxOut {
    pub alloc: CtxOutAlloc,
    pub state: CtxOutState,
}

#[repr(C)]
pub union DrmAmdgpuCtx {
    pub in_: CtxIn,
    pub out: CtxOut,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DrmAmdgpuCsChunk {
    pub chunk_id: u32,
    pub length_dw: u32,
    pub chunk_data: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DrmAmdgpuCsChunkIb {
    pub pad: u32,
    pub flags: u32,
    pub va_start: u64,
    pub ib_bytes: u32,
    pub ip_type: u32,
    pub ip_instance: u32,
    pub ring: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DrmAmdgpuBoListEntry {
    pub bo_handle: u32,
    pub bo_priority: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DrmAmdgpuBoListIn {
    pub operation: u32,
    pub list_handle: u32,
    pub bo_number: u32,
    pub bo_info_size: u32,
    pub bo_info_ptr: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct CsIn {
    pub ctx_id: u32,
    pub bo_list_handle: u32,
    pub num_chunks: u32,
    pub flags: u32,
    /// Pointer to an array of pointers to chunks.
    pub chunks: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct CsOut {
    pub handle: u64,
}

#[repr(C)]
pub union DrmAmdgpuCs {
    pub in_: CsIn,
    pub out: CsOut,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct WaitCsIn {
    pub handle: u64,
    /// Absolute CLOCK_MONOTONIC deadline in ns.
    pub timeout: u64,
    pub ip_type: u32,
    pub ip_instance: u32,
    pub ring: u32,
    pub ctx_id: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct WaitCsOut {
    pub status: u64,
}

#[repr(C)]
pub union DrmAmdgpuWaitCs {
    pub in_: WaitCsIn,
    pub out: WaitCsOut,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct InfoQueryHwIp {
    pub type_: u32,
    pub ip_instance: u32,
    pub pad: [u32; 2],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DrmAmdgpuInfo {
    pub return_pointer: u64,
    pub return_size: u32,
    pub query: u32,
    pub query_hw_ip: InfoQueryHwIp,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DrmAmdgpuInfoHwIp {
    pub hw_ip_version_major: u32,
    pub hw_ip_version_minor: u32,
    pub capabilities_flags: u64,
    pub ib_start_alignment: u32,
    pub ib_size_alignment: u32,
    pub available_rings: u32,
    pub ip_discovery_version: u32,
    pub userq_num_slots: u32,
    pub pad: u32,
}

/// Leading part of `drm_amdgpu_info_device`. The kernel copies at most
/// `return_size` bytes so the tail is kept as reserved space.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct DrmAmdgpuInfoDevice {
    pub device_id: u32,
    pub chip_rev: u32,
    pub external_rev: u32,
    pub pci_rev: u32,
    pub family: u32,
    pub num_shader_engines: u32,
    pub num_shader_arrays_per_engine: u32,
    pub gpu_counter_freq: u32,
    pub max_engine_clock: u64,
    pub max_memory_clock: u64,
    pub cu_active_number: u32,
    pub cu_ao_mask: u32,
    pub cu_bitmap: [[u32; 4]; 4],
    pub enabled_rb_pipes_mask: u32,
    pub num_rb_pipes: u32,
    pub num_hw_gfx_contexts: u32,
    pub pcie_gen: u32,
    pub ids_flags: u64,
    pub virtual_address_offset: u64,
    pub virtual_address_max: u64,
    pub reserved: [u64; 64],
}

impl Default for DrmAmdgpuInfoDevice {
    fn default() -> Self {
        // SAFETY: plain integers, all zero is a valid value.
        unsafe { std::mem::zeroed() }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DrmAmdgpuInfoUqFwAreas {
    pub shadow_size: u32,
    pub shadow_alignment: u32,
    pub csa_size: u32,
    pub csa_alignment: u32,
    pub reserved: [u32; 4],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct UserqMqdGfx11 {
    pub shadow_va: u64,
    pub csa_va: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct UserqMqdComputeGfx11 {
    pub eop_va: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct UserqMqdSdmaGfx11 {
    pub csa_va: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct UserqIn {
    pub op: u32,
    pub queue_id: u32,
    pub ip_type: u32,
    pub doorbell_handle: u32,
    pub doorbell_offset: u32,
    pub flags: u32,
    pub queue_va: u64,
    pub queue_size: u64,
    pub rptr_va: u64,
    pub wptr_va: u64,
    pub mqd: u64,
    pub mqd_size: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct UserqOut {
    pub queue_id: u32,
    pub pad: u32,
}

#[repr(C)]
pub union DrmAmdgpuUserq {
    pub in_: UserqIn,
    pub out: UserqOut,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DrmAmdgpuUserqSignal {
    pub queue_id: u32,
    pub pad: u32,
    pub syncobj_handles: u64,
    pub num_syncobj_handles: u64,
    pub bo_read_handles: u64,
    pub bo_write_handles: u64,
    pub num_bo_read_handles: u32,
    pub num_bo_write_handles: u32,
}

ioctl_iowr_nr!(DRM_IOCTL_VERSION, DRM_IOCTL_BASE, 0x00, DrmVersion);
ioctl_iow_nr!(DRM_IOCTL_GEM_CLOSE, DRM_IOCTL_BASE, 0x09, DrmGemClose);
ioctl_iowr_nr!(DRM_IOCTL_SYNCOBJ_CREATE, DRM_IOCTL_BASE, 0xbf, DrmSyncobjCreate);
ioctl_iowr_nr!(DRM_IOCTL_SYNCOBJ_DESTROY, DRM_IOCTL_BASE, 0xc0, DrmSyncobjDestroy);
ioctl_iowr_nr!(
    DRM_IOCTL_SYNCOBJ_TIMELINE_WAIT,
    DRM_IOCTL_BASE,
    0xca,
    DrmSyncobjTimelineWait
);
ioctl_iowr_nr!(
    DRM_IOCTL_SYNCOBJ_QUERY,
    DRM_IOCTL_BASE,
    0xcb,
    DrmSyncobjTimelineArray
);

ioctl_iowr_nr!(
    DRM_IOCTL_AMDGPU_GEM_CREATE,
    DRM_IOCTL_BASE,
    DRM_COMMAND_BASE,
    DrmAmdgpuGemCreate
);
ioctl_iowr_nr!(
    DRM_IOCTL_AMDGPU_GEM_MMAP,
    DRM_IOCTL_BASE,
    DRM_COMMAND_BASE + 0x01,
    DrmAmdgpuGemMmap
);
ioctl_iowr_nr!(
    DRM_IOCTL_AMDGPU_CTX,
    DRM_IOCTL_BASE,
    DRM_COMMAND_BASE + 0x02,
    DrmAmdgpuCtx
);
ioctl_iowr_nr!(
    DRM_IOCTL_AMDGPU_CS,
    DRM_IOCTL_BASE,
    DRM_COMMAND_BASE + 0x04,
    DrmAmdgpuCs
);
ioctl_iow_nr!(
    DRM_IOCTL_AMDGPU_INFO,
    DRM_IOCTL_BASE,
    DRM_COMMAND_BASE + 0x05,
    DrmAmdgpuInfo
);
ioctl_iow_nr!(
    DRM_IOCTL_AMDGPU_GEM_VA,
    DRM_IOCTL_BASE,
    DRM_COMMAND_BASE + 0x08,
    DrmAmdgpuGemVa
);
ioctl_iowr_nr!(
    DRM_IOCTL_AMDGPU_WAIT_CS,
    DRM_IOCTL_BASE,
    DRM_COMMAND_BASE + 0x09,
    DrmAmdgpuWaitCs
);
ioctl_iowr_nr!(
    DRM_IOCTL_AMDGPU_USERQ,
    DRM_IOCTL_BASE,
    DRM_COMMAND_BASE + 0x16,
    DrmAmdgpuUserq
);
ioctl_iowr_nr!(
    DRM_IOCTL_AMDGPU_USERQ_SIGNAL,
    DRM_IOCTL_BASE,
    DRM_COMMAND_BASE + 0x17,
    DrmAmdgpuUserqSignal
);

#[cfg(test)]
mod tests {
    use std::mem::size_of;

    use super::*;

    #[test]
    fn test_struct_sizes() {
        assert_eq!(size_of::<DrmAmdgpuGemCreate>(), 32);
        assert_eq!(size_of::<DrmAmdgpuGemVa>(), 64);
        assert_eq!(size_of::<DrmAmdgpuCtx>(), 16);
        assert_eq!(size_of::<DrmAmdgpuCs>(), 24);
        assert_eq!(size_of::<DrmAmdgpuCsChunkIb>(), 32);
        assert_eq!(size_of::<DrmAmdgpuWaitCs>(), 32);
        assert_eq!(size_of::<DrmAmdgpuInfo>(), 32);
        assert_eq!(size_of::<DrmAmdgpuUserq>(), 72);
        assert_eq!(size_of::<DrmAmdgpuUserqSignal>(), 48);
        assert_eq!(size_of::<DrmSyncobjTimelineWait>(), 48);
    }

    #[test]
    fn test_ctx_out_reads_back() {
        let mut ctx = DrmAmdgpuCtx {
            in_: CtxIn::default(),
        };
        ctx.out = CtxOut {
            alloc: CtxOutAlloc { ctx_id: 7, pad: 0 },
        };
        let out = unsafe { ctx.out };
        assert_eq!(unsafe { out.alloc.ctx_id }, 7);
    }

    #[test]
    fn test_ioctl_numbers() {
        // _IOWR('d', 0x40, 32 bytes)
        assert_eq!(DRM_IOCTL_AMDGPU_GEM_CREATE() as u64, 0xc020_6440);
        // _IOW('d', 0x48, 64 bytes)
        assert_eq!(DRM_IOCTL_AMDGPU_GEM_VA() as u64, 0x4040_6448);
        // _IOW('d', 0x09, 8 bytes)
        assert_eq!(DRM_IOCTL_GEM_CLOSE() as u64, 0x4008_6409);
    }
}
