// PM4 packets for the graphics and compute command processors
//
// Copyright 2025 The amdgpu-queue-reset Authors
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use super::{
    CmdBuffer, EncodeError, IpEncoder, RegisterLayout, Result, WaitFunc, POISONED_ADDRESS,
    WRITE_PATTERN,
};
use crate::{catalog::ErrorKind, device::IpType};

pub const PACKET_TYPE3: u32 = 3;
/// NOP the command processor skips one dword at a time, used for padding.
pub const GFX_COMPUTE_NOP: u32 = 0xffff_1000;

pub const PACKET3_NOP: u32 = 0x10;
pub const PACKET3_CLEAR_STATE: u32 = 0x12;
pub const PACKET3_DISPATCH_DIRECT: u32 = 0x15;
pub const PACKET3_ATOMIC_MEM: u32 = 0x1e;
pub const PACKET3_CONTEXT_CONTROL: u32 = 0x28;
pub const PACKET3_WRITE_DATA: u32 = 0x37;
pub const PACKET3_WAIT_REG_MEM: u32 = 0x3c;
pub const PACKET3_INDIRECT_BUFFER: u32 = 0x3f;
pub const PACKET3_RELEASE_MEM: u32 = 0x49;
pub const PACKET3_DMA_DATA: u32 = 0x50;
pub const PACKET3_SET_SH_REG: u32 = 0x76;
pub const PACKET3_PROTECTED_FENCE_SIGNAL: u32 = 0xd0;
/// Not assigned to any packet on any generation.
pub const PACKET3_INVALID_OPCODE: u32 = 0xf1;

pub const PACKET3_SET_SH_REG_START: u32 = 0x2c00;

/// Largest register dword offset behind the MMIO aperture.
pub const MAX_REG_OFFSET: u32 = 0x3_ffff;
/// Register offset past the end of the aperture.
pub const BAD_REG_OFFSET: u32 = 0x1ff_fffc;

pub const WRITE_DATA_DST_SEL_REG: u32 = 0;
pub const WRITE_DATA_DST_SEL_MEM: u32 = 5;
pub const WR_CONFIRM: u32 = 1 << 20;

pub const WAIT_REG_MEM_SPACE_MEM: u32 = 1;

pub const RELEASE_MEM_EOP_INDEX: u32 = 5;
pub const CACHE_FLUSH_AND_INV_TS_EVENT: u32 = 0x14;

pub const DMA_DATA_SRC_SEL_DATA: u32 = 2;
pub const DMA_DATA_CP_SYNC: u32 = 1 << 31;

pub const ATOMIC_MEM_COMMAND_SINGLE_PASS: u32 = 1;
pub const TC_OP_ATOMIC_CMPSWAP_RTN_32: u32 = 8;

pub const INDIRECT_BUFFER_INHERIT_VMID_MQD_GFX: u32 = 1 << 22;
pub const INDIRECT_BUFFER_VALID: u32 = 1 << 23;
pub const INDIRECT_BUFFER_INHERIT_VMID_MQD_COMPUTE: u32 = 1 << 30;

/// Alignment mask of graphics and compute submissions.
pub const PM4_ALIGN_MASK: usize = 7;

pub const fn packet3(op: u32, count: u32) -> u32 {
    (PACKET_TYPE3 << 30) | ((count & 0x3fff) << 16) | ((op & 0xff) << 8)
}

pub const fn packet_type(header: u32) -> u32 {
    header >> 30
}

pub const fn packet3_count(header: u32) -> u32 {
    (header >> 16) & 0x3fff
}

pub const fn packet3_opcode(header: u32) -> u32 {
    (header >> 8) & 0xff
}

pub const fn write_data_dst_sel(sel: u32) -> u32 {
    sel << 8
}

pub const fn wait_reg_mem_control(func: u32, mem_space: u32, engine: u32) -> u32 {
    func | (mem_space << 4) | (engine << 8)
}

pub const fn release_mem_event(event_type: u32, event_index: u32) -> u32 {
    event_type | (event_index << 8)
}

pub const fn dma_data_src_sel(sel: u32) -> u32 {
    sel << 29
}

pub const fn atomic_mem_command(command: u32, op: u32) -> u32 {
    (command << 8) | op
}

pub const fn lo32(addr: u64) -> u32 {
    addr as u32
}

pub const fn hi32(addr: u64) -> u32 {
    (addr >> 32) as u32
}

/// Encoder for the graphics and compute rings.
#[derive(Clone, Copy, Debug)]
pub struct Pm4Encoder {
    ip: IpType,
    layout: RegisterLayout,
}

impl Pm4Encoder {
    pub fn new(ip: IpType, layout: RegisterLayout) -> Self {
        Self { ip, layout }
    }

    pub fn layout(&self) -> &RegisterLayout {
        &self.layout
    }

    fn write_data(
        &self,
        cmd: &mut CmdBuffer,
        header: u32,
        control: u32,
        dst: u64,
        len_dw: u32,
    ) -> Result<()> {
        cmd.emit(header)?;
        cmd.emit(control)?;
        cmd.emit(lo32(dst) & !3)?;
        cmd.emit(hi32(dst))?;
        cmd.emit_repeat(WRITE_PATTERN, len_dw as usize)
    }

    /// Single dword write with confirmation, used as a completion marker.
    pub fn write_confirm(&self, cmd: &mut CmdBuffer, dst: u64, value: u32) -> Result<()> {
        cmd.emit(packet3(PACKET3_WRITE_DATA, 3))?;
        cmd.emit(write_data_dst_sel(WRITE_DATA_DST_SEL_MEM) | WR_CONFIRM)?;
        cmd.emit(lo32(dst) & !3)?;
        cmd.emit(hi32(dst))?;
        cmd.emit(value)?;
        self.pad(cmd)
    }

    /// End of pipe write with an out of range event index.
    fn bad_release_mem(&self, cmd: &mut CmdBuffer, dst: u64) -> Result<()> {
        cmd.emit(packet3(PACKET3_RELEASE_MEM, 6))?;
        cmd.emit(release_mem_event(CACHE_FLUSH_AND_INV_TS_EVENT, 0xf))?;
        cmd.emit(1 << 29)?;
        cmd.emit(lo32(dst))?;
        cmd.emit(hi32(dst))?;
        cmd.emit(WRITE_PATTERN)?;
        cmd.emit(0)?;
        cmd.emit(0)
    }
}

impl IpEncoder for Pm4Encoder {
    fn ip(&self) -> IpType {
        self.ip
    }

    fn write_linear(&self, cmd: &mut CmdBuffer, dst: u64, len_dw: u32) -> Result<()> {
        self.write_data(
            cmd,
            packet3(PACKET3_WRITE_DATA, 2 + len_dw),
            write_data_dst_sel(WRITE_DATA_DST_SEL_MEM) | WR_CONFIRM,
            dst,
            len_dw,
        )
    }

    fn bad_write_linear(
        &self,
        cmd: &mut CmdBuffer,
        dst: u64,
        len_dw: u32,
        error: ErrorKind,
    ) -> Result<()> {
        let control = write_data_dst_sel(WRITE_DATA_DST_SEL_MEM) | WR_CONFIRM;
        match error {
            ErrorKind::CmdStreamExecSuccess => self.write_linear(cmd, dst, len_dw),
            ErrorKind::InvalidOpcode => self.write_data(
                cmd,
                packet3(PACKET3_INVALID_OPCODE, 2 + len_dw),
                control,
                dst,
                len_dw,
            ),
            ErrorKind::InvalidPacketLength => {
                self.write_data(cmd, packet3(PACKET3_WRITE_DATA, 0x3ffe), control, dst, len_dw)
            }
            ErrorKind::InvalidPacketEopQueue => {
                self.write_linear(cmd, dst, len_dw)?;
                self.bad_release_mem(cmd, dst)
            }
            ErrorKind::BadRegAddress => {
                cmd.emit(packet3(PACKET3_WRITE_DATA, 2 + len_dw))?;
                cmd.emit(write_data_dst_sel(WRITE_DATA_DST_SEL_REG) | WR_CONFIRM)?;
                cmd.emit(BAD_REG_OFFSET)?;
                cmd.emit(0)?;
                cmd.emit_repeat(WRITE_PATTERN, len_dw as usize)
            }
            ErrorKind::BadMemAddress => self.write_linear(cmd, POISONED_ADDRESS, len_dw),
            ErrorKind::BadMemAddressBySync => {
                self.wait_reg_mem(cmd, POISONED_ADDRESS, 0, 0xffff_ffff, WaitFunc::Equal)?;
                self.write_linear(cmd, dst, len_dw)
            }
            _ => Err(EncodeError::Unsupported(error, self.ip)),
        }
    }

    fn const_fill(&self, cmd: &mut CmdBuffer, dst: u64, value: u32, size: u32) -> Result<()> {
        cmd.emit(packet3(PACKET3_DMA_DATA, 5))?;
        cmd.emit(dma_data_src_sel(DMA_DATA_SRC_SEL_DATA) | DMA_DATA_CP_SYNC)?;
        cmd.emit(value)?;
        cmd.emit(0)?;
        cmd.emit(lo32(dst))?;
        cmd.emit(hi32(dst))?;
        cmd.emit(size & 0x03ff_ffff)
    }

    fn copy_linear(&self, cmd: &mut CmdBuffer, src: u64, dst: u64, size: u32) -> Result<()> {
        cmd.emit(packet3(PACKET3_DMA_DATA, 5))?;
        cmd.emit(DMA_DATA_CP_SYNC)?;
        cmd.emit(lo32(src))?;
        cmd.emit(hi32(src))?;
        cmd.emit(lo32(dst))?;
        cmd.emit(hi32(dst))?;
        cmd.emit(size & 0x03ff_ffff)
    }

    fn atomic_cmpswap(
        &self,
        cmd: &mut CmdBuffer,
        dst: u64,
        value: u32,
        compare: u32,
    ) -> Result<()> {
        cmd.emit(packet3(PACKET3_ATOMIC_MEM, 7))?;
        cmd.emit(atomic_mem_command(
            ATOMIC_MEM_COMMAND_SINGLE_PASS,
            TC_OP_ATOMIC_CMPSWAP_RTN_32,
        ))?;
        cmd.emit(lo32(dst))?;
        cmd.emit(hi32(dst))?;
        cmd.emit(value)?;
        cmd.emit(0)?;
        cmd.emit(compare)?;
        cmd.emit(0)?;
        cmd.emit(0x20)
    }

    fn wait_reg_mem(
        &self,
        cmd: &mut CmdBuffer,
        addr: u64,
        reference: u32,
        mask: u32,
        func: WaitFunc,
    ) -> Result<()> {
        cmd.emit(packet3(PACKET3_WAIT_REG_MEM, 5))?;
        cmd.emit(wait_reg_mem_control(func as u32, WAIT_REG_MEM_SPACE_MEM, 0))?;
        cmd.emit(lo32(addr))?;
        cmd.emit(hi32(addr))?;
        cmd.emit(reference)?;
        cmd.emit(mask)?;
        cmd.emit(4)
    }

    fn pad(&self, cmd: &mut CmdBuffer) -> Result<()> {
        cmd.emit_aligned(PM4_ALIGN_MASK, GFX_COMPUTE_NOP)
    }
}
