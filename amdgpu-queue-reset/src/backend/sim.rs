// In-process GPU that executes command streams and models recovery
//
// Copyright 2025 The amdgpu-queue-reset Authors
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{
    collections::{BTreeMap, HashMap},
    ptr::NonNull,
    sync::{Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use log::{debug, info};
use vmm_sys_util::errno::Error as Errno;

use crate::{
    asic::{PciAddr, FAMILY_AI, FAMILY_NV},
    device::*,
    encoder::{
        pm4::*,
        sdma::{
            SDMA_ATOMIC_CMPSWAP_RTN_32, SDMA_OPCODE_ATOMIC, SDMA_OPCODE_CONSTANT_FILL,
            SDMA_OPCODE_COPY, SDMA_OPCODE_NOP, SDMA_OPCODE_POLL_REGMEM, SDMA_OPCODE_SRBM_WRITE,
            SDMA_OPCODE_WRITE,
        },
        RegisterLayout, WaitFunc,
    },
};

type Result<T, E = Error> = std::result::Result<T, E>;

/// Dwords a single submission may touch before it counts as hung.
const WORK_LIMIT: u64 = 1 << 20;
const MAX_IB_DEPTH: u32 = 2;
const VA_START: u64 = 0x80_0000;
const VA_END: u64 = 0x8000_0000_0000;
const PAGE_SIZE: u64 = 4096;

/// Ways a command stream can break the simulated engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Fault {
    InvalidOpcode,
    InvalidPacketLength,
    InvalidEopQueue,
    BadRegister,
    BadMemAddress,
    BadMemAddressBySync,
    InvalidShader,
    InvalidProgramAddr,
    InvalidProgramSetting,
    InvalidUserData,
    Hang,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Recovery {
    /// Only the faulting queue is reset.
    QueueReset,
    /// The whole GPU is reset.
    GpuReset,
}

/// Recovery the simulated kernel applies, before any override.
pub fn default_recovery(fault: Fault, ip: IpType) -> Recovery {
    match fault {
        Fault::BadRegister | Fault::BadMemAddressBySync | Fault::Hang => Recovery::GpuReset,
        Fault::InvalidProgramSetting if ip == IpType::Gfx => Recovery::GpuReset,
        _ => Recovery::QueueReset,
    }
}

#[derive(Clone, Debug)]
pub struct SimConfig {
    pub device_id: u32,
    pub family_id: u32,
    pub chip_rev: u32,
    pub chip_external_rev: u32,
    pub gfx_rings: u32,
    pub compute_rings: u32,
    pub sdma_rings: u32,
    pub userq_slots: u32,
    pub gpu_reset_duration: Duration,
    pub recovery_overrides: HashMap<Fault, Recovery>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            device_id: 0x731f,
            family_id: FAMILY_NV,
            chip_rev: 0,
            chip_external_rev: 0x28,
            gfx_rings: 0b1,
            compute_rings: 0b1111,
            sdma_rings: 0b11,
            userq_slots: 2,
            gpu_reset_duration: Duration::from_millis(20),
            recovery_overrides: HashMap::new(),
        }
    }
}

struct SimBo {
    storage: NonNull<u64>,
    len_qw: usize,
    size: u64,
    gpu_addr: u64,
}

// SAFETY: the storage is a heap allocation owned by this value; all
// accesses go through raw volatile reads and writes.
unsafe impl Send for SimBo {}

impl SimBo {
    fn new(size: u64) -> Self {
        let len_qw = size.div_ceil(8) as usize;
        let storage = Box::into_raw(vec![0u64; len_qw].into_boxed_slice());
        Self {
            // SAFETY: Box::into_raw never returns null.
            storage: unsafe { NonNull::new_unchecked(storage.cast::<u64>()) },
            len_qw,
            size,
            gpu_addr: 0,
        }
    }

    fn cpu_ptr(&self) -> CpuPtr {
        // SAFETY: the storage is 8 byte aligned and `len_qw * 8` bytes long.
        unsafe { CpuPtr::new(self.storage.cast::<u8>(), self.len_qw * 8) }
    }

    fn view(&self) -> CpuView<'_> {
        // SAFETY: the storage lives as long as `self`.
        unsafe { self.cpu_ptr().view() }
    }
}

impl Drop for SimBo {
    fn drop(&mut self) {
        let slice = std::ptr::slice_from_raw_parts_mut(self.storage.as_ptr(), self.len_qw);
        // SAFETY: the pointer came from Box::into_raw with this length.
        drop(unsafe { Box::from_raw(slice) });
    }
}

#[derive(Default)]
struct SimContext {
    reset_epoch: u64,
    queue_reset: bool,
    guilty: bool,
    hangs: u32,
    next_seq: u64,
    fences: HashMap<u64, Option<i32>>,
}

#[derive(Default)]
struct SimSyncobj {
    point: u64,
    error: Option<i32>,
}

struct SimQueue {
    ip: IpType,
    queue_va: u64,
    size_dw: u64,
    rptr_va: u64,
    doorbell_handle: u32,
    doorbell_offset: u32,
    reset: bool,
}

#[derive(Default)]
struct SimState {
    next_handle: u32,
    next_va: u64,
    bos: HashMap<u32, SimBo>,
    /// GPU address to handle.
    va_map: BTreeMap<u64, u32>,
    contexts: HashMap<u32, SimContext>,
    syncobjs: HashMap<u32, SimSyncobj>,
    queues: HashMap<u32, SimQueue>,
    gpu_reset_epoch: u64,
    gpu_reset_until: Option<Instant>,
}

fn ioctl_err(op: &'static str, errno: i32) -> Error {
    Error::IoctlFailure(op, Errno::new(errno))
}

fn addr64(lo: u32, hi: u32) -> u64 {
    u64::from(lo) | (u64::from(hi) << 32)
}

/// Per submission interpreter state.
struct Exec<'a> {
    state: &'a SimState,
    layout: Option<RegisterLayout>,
    sdma_count_minus_one: bool,
    work: u64,
}

impl Exec<'_> {
    fn charge(&mut self, dwords: u64) -> Result<(), Fault> {
        self.work += dwords;
        if self.work > WORK_LIMIT {
            return Err(Fault::Hang);
        }
        Ok(())
    }

    fn read(&self, va: u64, fault: Fault) -> Result<u32, Fault> {
        self.state.read_va(va).ok_or(fault)
    }

    fn write(&mut self, va: u64, value: u32) -> Result<(), Fault> {
        self.charge(1)?;
        self.state.write_va(va, value).ok_or(Fault::BadMemAddress)
    }

    fn fill(&mut self, dst: u64, value: u32, dwords: u64) -> Result<(), Fault> {
        for k in 0..dwords {
            self.write(dst + k * 4, value)?;
        }
        Ok(())
    }

    fn copy(&mut self, src: u64, dst: u64, dwords: u64) -> Result<(), Fault> {
        for k in 0..dwords {
            let v = self.read(src + k * 4, Fault::BadMemAddress)?;
            self.write(dst + k * 4, v)?;
        }
        Ok(())
    }

    fn cmpswap(&mut self, dst: u64, value: u32, compare: u32) -> Result<(), Fault> {
        if self.read(dst, Fault::BadMemAddress)? == compare {
            self.write(dst, value)?;
        }
        Ok(())
    }

    fn poll(&self, addr: u64, reference: u32, mask: u32, func: u32) -> Result<(), Fault> {
        let value = self.read(addr, Fault::BadMemAddressBySync)?;
        let func = WaitFunc::from_raw(func).ok_or(Fault::InvalidOpcode)?;
        if func.test(value & mask, reference) {
            Ok(())
        } else {
            Err(Fault::Hang)
        }
    }

    fn body(&self, addr: u64, start: u64, len: u64) -> Result<Vec<u32>, Fault> {
        (0..len)
            .map(|k| self.read(addr + (start + k) * 4, Fault::BadMemAddress))
            .collect()
    }

    fn run(&mut self, ip: IpType, addr: u64, size_dw: u64, depth: u32) -> Result<(), Fault> {
        match ip {
            IpType::Gfx | IpType::Compute => self.run_pm4(addr & !3, size_dw, depth),
            IpType::Dma => self.run_sdma(addr & !3, size_dw),
            _ => Err(Fault::InvalidOpcode),
        }
    }

    fn run_pm4(&mut self, addr: u64, size_dw: u64, depth: u32) -> Result<(), Fault> {
        let mut sh: HashMap<u32, u32> = HashMap::new();
        let mut i = 0;
        while i < size_dw {
            self.charge(1)?;
            let header = self.read(addr + i * 4, Fault::BadMemAddress)?;
            if header == GFX_COMPUTE_NOP {
                i += 1;
                continue;
            }
            if packet_type(header) != PACKET_TYPE3 {
                return Err(Fault::InvalidOpcode);
            }
            let len = u64::from(packet3_count(header)) + 1;
            if i + 1 + len > size_dw {
                return Err(Fault::InvalidPacketLength);
            }
            let body = self.body(addr, i + 1, len)?;

            match packet3_opcode(header) {
                PACKET3_NOP
                | PACKET3_CONTEXT_CONTROL
                | PACKET3_CLEAR_STATE
                | PACKET3_PROTECTED_FENCE_SIGNAL => {}
                PACKET3_WRITE_DATA => {
                    if body.len() < 3 {
                        return Err(Fault::InvalidPacketLength);
                    }
                    match (body[0] >> 8) & 0xf {
                        WRITE_DATA_DST_SEL_MEM => {
                            let dst = addr64(body[1] & !3, body[2]);
                            for (k, v) in body[3..].iter().enumerate() {
                                self.write(dst + k as u64 * 4, *v)?;
                            }
                        }
                        WRITE_DATA_DST_SEL_REG => {
                            if body[1] > MAX_REG_OFFSET {
                                return Err(Fault::BadRegister);
                            }
                        }
                        _ => {}
                    }
                }
                PACKET3_WAIT_REG_MEM => {
                    if body.len() < 6 {
                        return Err(Fault::InvalidPacketLength);
                    }
                    if (body[0] >> 4) & 0x3 == WAIT_REG_MEM_SPACE_MEM {
                        self.poll(addr64(body[1], body[2]), body[3], body[4], body[0] & 0x7)?;
                    }
                }
                PACKET3_SET_SH_REG => {
                    for (k, v) in body[1..].iter().enumerate() {
                        sh.insert(body[0] + k as u32, *v);
                    }
                }
                PACKET3_DISPATCH_DIRECT => self.dispatch(&sh)?,
                PACKET3_RELEASE_MEM => {
                    if body.len() < 5 || (body[0] >> 8) & 0xf != RELEASE_MEM_EOP_INDEX {
                        return Err(Fault::InvalidEopQueue);
                    }
                    self.write(addr64(body[2], body[3]), body[4])?;
                }
                PACKET3_ATOMIC_MEM => {
                    if body.len() < 8 {
                        return Err(Fault::InvalidPacketLength);
                    }
                    if body[0] & 0x7f == TC_OP_ATOMIC_CMPSWAP_RTN_32 {
                        self.cmpswap(addr64(body[1], body[2]), body[3], body[5])?;
                    }
                }
                PACKET3_DMA_DATA => {
                    if body.len() < 6 {
                        return Err(Fault::InvalidPacketLength);
                    }
                    let dst = addr64(body[3], body[4]);
                    let dwords = u64::from(body[5] & 0x03ff_ffff) / 4;
                    if (body[0] >> 29) & 0x3 == DMA_DATA_SRC_SEL_DATA {
                        self.fill(dst, body[1], dwords)?;
                    } else {
                        self.copy(addr64(body[1], body[2]), dst, dwords)?;
                    }
                }
                PACKET3_INDIRECT_BUFFER => {
                    if depth >= MAX_IB_DEPTH || body.len() < 3 {
                        return Err(Fault::InvalidOpcode);
                    }
                    let ib = addr64(body[0] & !3, body[1]);
                    self.run_pm4(ib, u64::from(body[2] & 0xf_ffff), depth + 1)?;
                }
                _ => return Err(Fault::InvalidOpcode),
            }
            i += 1 + len;
        }
        Ok(())
    }

    fn dispatch(&self, sh: &HashMap<u32, u32>) -> Result<(), Fault> {
        let layout = self.layout.ok_or(Fault::InvalidOpcode)?;
        let reg = |offset: u32| sh.get(&offset).copied().unwrap_or(0);
        let regs = &layout.sh;

        let pgm = (u64::from(reg(regs.compute_pgm_lo)) << 8)
            | (u64::from(reg(regs.compute_pgm_lo + 1)) << 40);
        if self.state.read_va(pgm).is_none() {
            return Err(Fault::InvalidProgramAddr);
        }
        if reg(regs.compute_pgm_rsrc1) & layout.rsrc1_reserved_mask() != 0 {
            return Err(Fault::InvalidProgramSetting);
        }
        let user_data = addr64(
            reg(regs.compute_user_data_0),
            reg(regs.compute_user_data_0 + 1),
        );
        if self.state.read_va(user_data).is_none() {
            return Err(Fault::InvalidUserData);
        }

        let end_pgm = layout.end_pgm();
        for k in 0..256 {
            match self.state.read_va(pgm + k * 4) {
                Some(word) if word == end_pgm => return Ok(()),
                Some(_) => {}
                None => break,
            }
        }
        Err(Fault::InvalidShader)
    }

    fn sdma_count(&self, raw: u32) -> u64 {
        if self.sdma_count_minus_one {
            u64::from(raw) + 1
        } else {
            u64::from(raw)
        }
    }

    fn run_sdma(&mut self, addr: u64, size_dw: u64) -> Result<(), Fault> {
        let mut i = 0;
        while i < size_dw {
            self.charge(1)?;
            let header = self.read(addr + i * 4, Fault::BadMemAddress)?;
            let fixed = |n: u64| -> Result<Vec<u32>, Fault> {
                if i + n > size_dw {
                    return Err(Fault::InvalidPacketLength);
                }
                self.body(addr, i, n)
            };

            let consumed = match header & 0xff {
                SDMA_OPCODE_NOP => 1 + u64::from((header >> 16) & 0x3fff),
                SDMA_OPCODE_COPY if (header >> 8) & 0xff == 0 => {
                    let p = fixed(7)?;
                    let dwords = self.sdma_count(p[1]) / 4;
                    self.copy(addr64(p[3], p[4]), addr64(p[5], p[6]), dwords)?;
                    7
                }
                SDMA_OPCODE_WRITE if (header >> 8) & 0xff == 0 => {
                    let p = fixed(4)?;
                    let dwords = self.sdma_count(p[3]);
                    if i + 4 + dwords > size_dw {
                        return Err(Fault::InvalidPacketLength);
                    }
                    let data = self.body(addr, i + 4, dwords)?;
                    let dst = addr64(p[1], p[2]);
                    for (k, v) in data.iter().enumerate() {
                        self.write(dst + k as u64 * 4, *v)?;
                    }
                    4 + dwords
                }
                SDMA_OPCODE_POLL_REGMEM => {
                    let p = fixed(6)?;
                    if header >> 31 == 1 {
                        self.poll(addr64(p[1], p[2]), p[3], p[4], (header >> 28) & 0x7)?;
                    }
                    6
                }
                SDMA_OPCODE_ATOMIC => {
                    let p = fixed(8)?;
                    if (header >> 25) & 0x7f == SDMA_ATOMIC_CMPSWAP_RTN_32 {
                        self.cmpswap(addr64(p[1], p[2]), p[3], p[5])?;
                    }
                    8
                }
                SDMA_OPCODE_CONSTANT_FILL => {
                    let p = fixed(5)?;
                    let dwords = self.sdma_count(p[4]) / 4;
                    self.fill(addr64(p[1], p[2]), p[3], dwords)?;
                    5
                }
                SDMA_OPCODE_SRBM_WRITE => {
                    let p = fixed(3)?;
                    if p[1] > MAX_REG_OFFSET {
                        return Err(Fault::BadRegister);
                    }
                    3
                }
                _ => return Err(Fault::InvalidOpcode),
            };
            i += consumed;
        }
        Ok(())
    }
}

impl SimState {
    fn bo_at(&self, va: u64) -> Option<(&SimBo, u64)> {
        let (_, handle) = self.va_map.range(..=va).next_back()?;
        let bo = self.bos.get(handle)?;
        let offset = va - bo.gpu_addr;
        (offset + 4 <= bo.size).then_some((bo, offset))
    }

    fn read_va(&self, va: u64) -> Option<u32> {
        let (bo, offset) = self.bo_at(va)?;
        bo.view().read_u32((offset / 4) as usize).ok()
    }

    fn write_va(&self, va: u64, value: u32) -> Option<()> {
        let (bo, offset) = self.bo_at(va)?;
        bo.view().write_u32((offset / 4) as usize, value).ok()
    }

    fn gpu_reset_active(&self, now: Instant) -> bool {
        self.gpu_reset_until.is_some_and(|until| now < until)
    }

    fn signal(&mut self, timeline: Option<TimelinePoint>) -> Result<()> {
        if let Some(t) = timeline {
            let syncobj = self
                .syncobjs
                .get_mut(&t.syncobj)
                .ok_or(ioctl_err("gem_va", libc::ENOENT))?;
            syncobj.point = syncobj.point.max(t.point);
        }
        Ok(())
    }

    fn execute(
        &self,
        config: &SimConfig,
        ip: IpType,
        addr: u64,
        size_dw: u64,
    ) -> Result<(), Fault> {
        let mut exec = Exec {
            state: self,
            layout: RegisterLayout::for_family(config.family_id).ok(),
            sdma_count_minus_one: config.family_id >= FAMILY_AI,
            work: 0,
        };
        exec.run(ip, addr, size_dw, 0)
    }
}

/// A GPU that lives entirely in this process.
///
/// Command streams execute synchronously at submission. Faults are
/// recovered according to [`default_recovery`] and the configured
/// overrides, which drives the same reset reporting the kernel offers.
pub struct SimDevice {
    config: SimConfig,
    state: Mutex<SimState>,
}

impl SimDevice {
    pub fn new(config: SimConfig) -> Self {
        info!(
            "Simulated GPU family {} rev {:#x}",
            config.family_id, config.chip_external_rev
        );
        Self {
            config,
            state: Mutex::new(SimState {
                next_va: VA_START,
                ..Default::default()
            }),
        }
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn recovery(&self, fault: Fault, ip: IpType) -> Recovery {
        self.config
            .recovery_overrides
            .get(&fault)
            .copied()
            .unwrap_or_else(|| default_recovery(fault, ip))
    }

    /// Applies the recovery for `fault` and returns the errno the faulting
    /// job reports.
    fn recover(&self, state: &mut SimState, ctx: Option<u32>, fault: Fault, ip: IpType) -> i32 {
        let recovery = self.recovery(fault, ip);
        debug!("{ip} fault {fault:?}, recovering with {recovery:?}");

        if let Some(ctx) = ctx.and_then(|id| state.contexts.get_mut(&id)) {
            ctx.guilty = true;
            ctx.hangs += 1;
            if recovery == Recovery::QueueReset {
                ctx.queue_reset = true;
            }
        }

        match recovery {
            Recovery::QueueReset => libc::ENODATA,
            Recovery::GpuReset => {
                state.gpu_reset_epoch += 1;
                state.gpu_reset_until = Some(Instant::now() + self.config.gpu_reset_duration);
                libc::ETIME
            }
        }
    }

    fn rings(&self, ip: IpType) -> u32 {
        match ip {
            IpType::Gfx => self.config.gfx_rings,
            IpType::Compute => self.config.compute_rings,
            IpType::Dma => self.config.sdma_rings,
            _ => 0,
        }
    }

    pub fn live_buffers(&self) -> usize {
        self.state().bos.len()
    }

    pub fn context_count(&self) -> usize {
        self.state().contexts.len()
    }

    pub fn user_queue_count(&self) -> usize {
        self.state().queues.len()
    }

    pub fn gpu_reset_count(&self) -> u64 {
        self.state().gpu_reset_epoch
    }
}

impl GpuDevice for SimDevice {
    fn driver_version(&self) -> (u32, u32) {
        (3, 63)
    }

    fn gpu_info(&self) -> Result<GpuInfo> {
        Ok(GpuInfo {
            device_id: self.config.device_id,
            family_id: self.config.family_id,
            chip_rev: self.config.chip_rev,
            chip_external_rev: self.config.chip_external_rev,
            va_start: VA_START,
            va_end: VA_END,
        })
    }

    fn pci_addr(&self) -> Result<PciAddr> {
        Ok(PciAddr::default())
    }

    fn query_hw_ip_info(&self, ip: IpType, _instance: u32) -> Result<HwIpInfo> {
        let rings = self.rings(ip);
        Ok(HwIpInfo {
            version_major: if rings != 0 { 10 } else { 0 },
            version_minor: 0,
            ib_start_alignment: 32,
            ib_size_alignment: 32,
            available_rings: rings,
            userq_num_slots: if rings != 0 { self.config.userq_slots } else { 0 },
        })
    }

    fn query_fw_area_info(&self, _ip: IpType) -> Result<FwAreaInfo> {
        Ok(FwAreaInfo {
            shadow_size: 0x8000,
            shadow_alignment: 0x1000,
            csa_size: 0x2000,
            csa_alignment: 0x1000,
        })
    }

    fn create_context(&self, _priority: ContextPriority) -> Result<ContextId> {
        let mut state = self.state();
        state.next_handle += 1;
        let id = state.next_handle;
        let ctx = SimContext {
            reset_epoch: state.gpu_reset_epoch,
            next_seq: 1,
            ..Default::default()
        };
        state.contexts.insert(id, ctx);
        Ok(ContextId(id))
    }

    fn destroy_context(&self, ctx: ContextId) -> Result<()> {
        self.state()
            .contexts
            .remove(&ctx.0)
            .map(|_| ())
            .ok_or(Error::UnknownContext(ctx.0))
    }

    fn query_reset_state(&self, ctx: ContextId) -> Result<ResetFlags> {
        let state = self.state();
        let c = state
            .contexts
            .get(&ctx.0)
            .ok_or(Error::UnknownContext(ctx.0))?;

        let mut flags = ResetFlags::empty();
        if c.queue_reset || c.reset_epoch != state.gpu_reset_epoch {
            flags |= ResetFlags::RESET;
        }
        if c.guilty {
            flags |= ResetFlags::GUILTY;
        }
        if state.gpu_reset_active(Instant::now()) {
            flags |= ResetFlags::RESET_IN_PROGRESS;
        }
        Ok(flags)
    }

    fn query_reset_state_legacy(&self, ctx: ContextId) -> Result<LegacyResetState> {
        let flags = self.query_reset_state(ctx)?;
        let hangs = self
            .state()
            .contexts
            .get(&ctx.0)
            .map_or(0, |c| c.hangs);
        let state = if flags.contains(ResetFlags::GUILTY) {
            AMDGPU_CTX_GUILTY_RESET
        } else if flags.contains(ResetFlags::RESET) {
            AMDGPU_CTX_INNOCENT_RESET
        } else {
            AMDGPU_CTX_NO_RESET
        };
        Ok(LegacyResetState { state, hangs })
    }

    fn alloc_and_map(&self, request: &AllocRequest) -> Result<BoMapping> {
        let mut state = self.state();
        let size = request.size.max(1).div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let mut bo = SimBo::new(size);

        if request.gpu_map && !request.domain.contains(Domain::DOORBELL) {
            let alignment = request.alignment.max(PAGE_SIZE);
            let va = state.next_va.div_ceil(alignment) * alignment;
            if va + size > VA_END {
                return Err(Error::VaExhausted);
            }
            state.next_va = va + size;
            bo.gpu_addr = va;
        }

        state.signal(request.timeline)?;
        state.next_handle += 1;
        let handle = state.next_handle;
        let mapping = BoMapping {
            handle,
            size,
            gpu_addr: bo.gpu_addr,
            cpu: request.cpu_map.then(|| bo.cpu_ptr()),
        };
        if bo.gpu_addr != 0 {
            state.va_map.insert(bo.gpu_addr, handle);
        }
        state.bos.insert(handle, bo);
        Ok(mapping)
    }

    fn unmap_and_free(&self, mapping: &BoMapping, timeline: Option<TimelinePoint>) -> Result<()> {
        let mut state = self.state();
        let bo = state
            .bos
            .remove(&mapping.handle)
            .ok_or(Error::UnknownHandle(mapping.handle))?;
        if bo.gpu_addr != 0 {
            state.va_map.remove(&bo.gpu_addr);
        }
        state.signal(timeline)
    }

    fn submit_cs(&self, ctx: ContextId, request: &IbRequest) -> Result<u64> {
        let mut state = self.state();
        let c = state
            .contexts
            .get(&ctx.0)
            .ok_or(ioctl_err("cs", libc::EINVAL))?;
        if c.guilty {
            return Err(ioctl_err("cs", libc::ECANCELED));
        }
        let rings = self.rings(request.ip);
        if request.ring >= 32 || rings & (1 << request.ring) == 0 {
            return Err(ioctl_err("cs", libc::EINVAL));
        }
        if request.bo_handles.iter().any(|h| !state.bos.contains_key(h)) {
            return Err(ioctl_err("cs", libc::ENOENT));
        }

        let result = if state.gpu_reset_active(Instant::now()) {
            Some(libc::ECANCELED)
        } else {
            match state.execute(
                &self.config,
                request.ip,
                request.ib_addr,
                u64::from(request.ib_size_dw),
            ) {
                Ok(()) => None,
                Err(fault) => Some(self.recover(&mut state, Some(ctx.0), fault, request.ip)),
            }
        };

        let c = state
            .contexts
            .get_mut(&ctx.0)
            .ok_or(ioctl_err("cs", libc::EINVAL))?;
        let seq = c.next_seq;
        c.next_seq += 1;
        c.fences.insert(seq, result);
        Ok(seq)
    }

    fn query_fence_status(&self, fence: &Fence, _timeout: FenceTimeout) -> Result<FenceStatus> {
        let state = self.state();
        let c = state
            .contexts
            .get(&fence.ctx.0)
            .ok_or(ioctl_err("wait_cs", libc::EINVAL))?;
        match c.fences.get(&fence.seq_no) {
            Some(None) => Ok(FenceStatus::Signaled),
            Some(Some(errno)) => Err(ioctl_err("wait_cs", *errno)),
            None => Err(ioctl_err("wait_cs", libc::EINVAL)),
        }
    }

    fn create_user_queue(&self, desc: &UserQueueDesc) -> Result<u32> {
        let mut state = self.state();
        let slots = self.query_hw_ip_info(desc.ip, 0)?.userq_num_slots;
        let used = state.queues.values().filter(|q| q.ip == desc.ip).count() as u32;
        if used >= slots {
            return Err(ioctl_err("userq", libc::ENOSPC));
        }
        if desc.queue_size < 4 {
            return Err(ioctl_err("userq", libc::EINVAL));
        }

        let mqd_vas: Vec<u64> = match desc.mqd {
            Mqd::Gfx { shadow_va, csa_va } => vec![shadow_va, csa_va],
            Mqd::Compute { eop_va } => vec![eop_va],
            Mqd::Sdma { csa_va } => vec![csa_va],
        };
        let mapped = [desc.queue_va, desc.rptr_va, desc.wptr_va]
            .iter()
            .chain(mqd_vas.iter())
            .all(|va| state.read_va(*va).is_some());
        if !mapped {
            return Err(ioctl_err("userq", libc::EINVAL));
        }
        if !state.bos.contains_key(&desc.doorbell_handle) {
            return Err(ioctl_err("userq", libc::ENOENT));
        }

        state.next_handle += 1;
        let id = state.next_handle;
        state.queues.insert(
            id,
            SimQueue {
                ip: desc.ip,
                queue_va: desc.queue_va,
                size_dw: desc.queue_size / 4,
                rptr_va: desc.rptr_va,
                doorbell_handle: desc.doorbell_handle,
                doorbell_offset: desc.doorbell_offset,
                reset: false,
            },
        );
        Ok(id)
    }

    fn destroy_user_queue(&self, queue_id: u32) -> Result<()> {
        self.state()
            .queues
            .remove(&queue_id)
            .map(|_| ())
            .ok_or(Error::UnknownQueue(queue_id))
    }

    fn signal_user_queue(&self, queue_id: u32, syncobj: u32) -> Result<()> {
        let mut state = self.state();
        let q = state
            .queues
            .get(&queue_id)
            .ok_or(ioctl_err("userq_signal", libc::EINVAL))?;
        if !state.syncobjs.contains_key(&syncobj) {
            return Err(ioctl_err("userq_signal", libc::ENOENT));
        }
        let (ip, queue_va, size_dw, rptr_va) = (q.ip, q.queue_va, q.size_dw, q.rptr_va);

        let doorbell = state
            .bos
            .get(&q.doorbell_handle)
            .ok_or(ioctl_err("userq_signal", libc::ENOENT))?
            .view()
            .read_u64(q.doorbell_offset as usize)?;
        let discard = q.reset || state.gpu_reset_active(Instant::now());
        let rptr_lo = state.read_va(rptr_va).unwrap_or(0);
        let rptr_hi = state.read_va(rptr_va + 4).unwrap_or(0);
        let mut rptr = addr64(rptr_lo, rptr_hi);

        let ring = |state: &SimState, pos: u64| {
            state
                .read_va(queue_va + (pos % size_dw) * 4)
                .ok_or(Fault::BadMemAddress)
        };

        let mut result = discard.then_some(libc::ECANCELED);

        while result.is_none() && rptr < doorbell {
            let outcome = ring(&state, rptr).and_then(|header| {
                let len = u64::from(packet3_count(header)) + 2;
                if packet3_opcode(header) == PACKET3_INDIRECT_BUFFER {
                    let lo = ring(&state, rptr + 1)?;
                    let hi = ring(&state, rptr + 2)?;
                    let control = ring(&state, rptr + 3)?;
                    state.execute(
                        &self.config,
                        ip,
                        addr64(lo & !3, hi),
                        u64::from(control & 0xf_ffff),
                    )?;
                }
                Ok(len)
            });
            match outcome {
                Ok(len) => rptr += len,
                Err(fault) => {
                    let errno = self.recover(&mut state, None, fault, ip);
                    if self.recovery(fault, ip) == Recovery::QueueReset {
                        if let Some(q) = state.queues.get_mut(&queue_id) {
                            q.reset = true;
                        }
                    }
                    result = Some(errno);
                    rptr = doorbell;
                }
            }
        }

        state.write_va(rptr_va, rptr as u32);
        state.write_va(rptr_va + 4, (rptr >> 32) as u32);

        if let Some(s) = state.syncobjs.get_mut(&syncobj) {
            s.point += 1;
            s.error = result;
        }
        Ok(())
    }

    fn syncobj_create(&self) -> Result<u32> {
        let mut state = self.state();
        state.next_handle += 1;
        let id = state.next_handle;
        state.syncobjs.insert(id, SimSyncobj::default());
        Ok(id)
    }

    fn syncobj_destroy(&self, handle: u32) -> Result<()> {
        self.state()
            .syncobjs
            .remove(&handle)
            .map(|_| ())
            .ok_or(ioctl_err("syncobj_destroy", libc::EINVAL))
    }

    fn syncobj_query(&self, handle: u32) -> Result<u64> {
        self.state()
            .syncobjs
            .get(&handle)
            .map(|s| s.point)
            .ok_or(ioctl_err("syncobj_query", libc::EINVAL))
    }

    fn syncobj_wait(
        &self,
        handles: &[u32],
        points: &[u64],
        _timeout_ns: i64,
        _flags: SyncobjWaitFlags,
    ) -> Result<()> {
        let state = self.state();
        for (i, handle) in handles.iter().enumerate() {
            let syncobj = state
                .syncobjs
                .get(handle)
                .ok_or(ioctl_err("syncobj_wait", libc::EINVAL))?;
            if let Some(errno) = syncobj.error {
                return Err(ioctl_err("syncobj_wait", errno));
            }
            // Nothing will ever signal a future point, report the timeout
            // instead of blocking.
            if points.get(i).copied().unwrap_or(0) > syncobj.point {
                return Err(ioctl_err("syncobj_wait", libc::ETIME));
            }
        }
        Ok(())
    }
}
