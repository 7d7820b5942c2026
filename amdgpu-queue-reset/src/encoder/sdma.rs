// SDMA packets
//
// Copyright 2025 The amdgpu-queue-reset Authors
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use super::{
    pm4::{hi32, lo32, BAD_REG_OFFSET},
    CmdBuffer, EncodeError, IpEncoder, Result, WaitFunc, POISONED_ADDRESS, WRITE_PATTERN,
};
use crate::{asic::FAMILY_AI, catalog::ErrorKind, device::IpType};

pub const SDMA_OPCODE_NOP: u32 = 0;
pub const SDMA_OPCODE_COPY: u32 = 1;
pub const SDMA_OPCODE_WRITE: u32 = 2;
pub const SDMA_OPCODE_POLL_REGMEM: u32 = 8;
pub const SDMA_OPCODE_ATOMIC: u32 = 10;
pub const SDMA_OPCODE_CONSTANT_FILL: u32 = 11;
pub const SDMA_OPCODE_SRBM_WRITE: u32 = 14;
/// Outside the SDMA opcode space.
pub const SDMA_OPCODE_INVALID: u32 = 0xff;

pub const SDMA_COPY_SUB_OPCODE_LINEAR: u32 = 0;
pub const SDMA_WRITE_SUB_OPCODE_LINEAR: u32 = 0;

pub const SDMA_ATOMIC_CMPSWAP_RTN_32: u32 = 0x08;

/// Header dword that decodes to a nonsense packet on every SDMA engine.
pub const SDMA_CORRUPTED_HEADER: u32 = 0x23de_cd3d;

pub const SDMA_ALIGN_MASK: usize = 7;

pub const fn sdma_packet(op: u32, sub_op: u32, extra: u32) -> u32 {
    ((extra & 0xffff) << 16) | ((sub_op & 0xff) << 8) | (op & 0xff)
}

pub const fn sdma_opcode(header: u32) -> u32 {
    header & 0xff
}

pub const fn sdma_sub_opcode(header: u32) -> u32 {
    (header >> 8) & 0xff
}

/// `POLL_REGMEM` header: function in bits 28..30, memory space in bit 31.
pub const fn sdma_poll_regmem(func: u32, mem_space: u32) -> u32 {
    sdma_packet(SDMA_OPCODE_POLL_REGMEM, 0, 0) | ((func & 0x7) << 28) | ((mem_space & 0x1) << 31)
}

pub const fn sdma_atomic(op: u32) -> u32 {
    sdma_packet(SDMA_OPCODE_ATOMIC, 0, 0) | ((op & 0x7f) << 25)
}

#[derive(Clone, Copy, Debug)]
pub struct SdmaEncoder {
    family_id: u32,
}

impl SdmaEncoder {
    pub fn new(family_id: u32) -> Self {
        Self { family_id }
    }

    /// Vega and newer engines count from zero.
    fn count(&self, n: u32) -> u32 {
        if self.family_id >= FAMILY_AI {
            n.saturating_sub(1)
        } else {
            n
        }
    }

    fn write_packet(
        &self,
        cmd: &mut CmdBuffer,
        op: u32,
        dst: u64,
        count: u32,
        len_dw: u32,
    ) -> Result<()> {
        cmd.emit(sdma_packet(op, SDMA_WRITE_SUB_OPCODE_LINEAR, 0))?;
        cmd.emit(lo32(dst))?;
        cmd.emit(hi32(dst))?;
        cmd.emit(count)?;
        cmd.emit_repeat(WRITE_PATTERN, len_dw as usize)
    }
}

impl IpEncoder for SdmaEncoder {
    fn ip(&self) -> IpType {
        IpType::Dma
    }

    fn write_linear(&self, cmd: &mut CmdBuffer, dst: u64, len_dw: u32) -> Result<()> {
        self.write_packet(cmd, SDMA_OPCODE_WRITE, dst, self.count(len_dw), len_dw)
    }

    fn bad_write_linear(
        &self,
        cmd: &mut CmdBuffer,
        dst: u64,
        len_dw: u32,
        error: ErrorKind,
    ) -> Result<()> {
        match error {
            ErrorKind::CmdStreamExecSuccess => self.write_linear(cmd, dst, len_dw),
            ErrorKind::InvalidOpcode => {
                self.write_packet(cmd, SDMA_OPCODE_INVALID, dst, self.count(len_dw), len_dw)
            }
            ErrorKind::InvalidPacketLength => {
                self.write_packet(cmd, SDMA_OPCODE_WRITE, dst, 0x003f_ffff, len_dw)
            }
            ErrorKind::BadRegAddress => {
                cmd.emit(sdma_packet(SDMA_OPCODE_SRBM_WRITE, 0, 0) | (0xf << 28))?;
                cmd.emit(BAD_REG_OFFSET)?;
                cmd.emit(WRITE_PATTERN)
            }
            ErrorKind::BadMemAddress => self.write_linear(cmd, POISONED_ADDRESS, len_dw),
            ErrorKind::BadMemAddressBySync => {
                self.wait_reg_mem(cmd, POISONED_ADDRESS, 0, 0xffff_ffff, WaitFunc::Equal)?;
                self.write_linear(cmd, dst, len_dw)
            }
            _ => Err(EncodeError::Unsupported(error, IpType::Dma)),
        }
    }

    fn const_fill(&self, cmd: &mut CmdBuffer, dst: u64, value: u32, size: u32) -> Result<()> {
        // Extra field 2 selects dword fills.
        cmd.emit(sdma_packet(SDMA_OPCODE_CONSTANT_FILL, 0, 2 << 14))?;
        cmd.emit(lo32(dst))?;
        cmd.emit(hi32(dst))?;
        cmd.emit(value)?;
        cmd.emit(self.count(size))
    }

    fn copy_linear(&self, cmd: &mut CmdBuffer, src: u64, dst: u64, size: u32) -> Result<()> {
        cmd.emit(sdma_packet(SDMA_OPCODE_COPY, SDMA_COPY_SUB_OPCODE_LINEAR, 0))?;
        cmd.emit(self.count(size))?;
        cmd.emit(0)?;
        cmd.emit(lo32(src))?;
        cmd.emit(hi32(src))?;
        cmd.emit(lo32(dst))?;
        cmd.emit(hi32(dst))
    }

    fn atomic_cmpswap(
        &self,
        cmd: &mut CmdBuffer,
        dst: u64,
        value: u32,
        compare: u32,
    ) -> Result<()> {
        cmd.emit(sdma_atomic(SDMA_ATOMIC_CMPSWAP_RTN_32))?;
        cmd.emit(lo32(dst))?;
        cmd.emit(hi32(dst))?;
        cmd.emit(value)?;
        cmd.emit(0)?;
        cmd.emit(compare)?;
        cmd.emit(0)?;
        cmd.emit(0x1fff)
    }

    fn wait_reg_mem(
        &self,
        cmd: &mut CmdBuffer,
        addr: u64,
        reference: u32,
        mask: u32,
        func: WaitFunc,
    ) -> Result<()> {
        cmd.emit(sdma_poll_regmem(func as u32, 1))?;
        cmd.emit(lo32(addr))?;
        cmd.emit(hi32(addr))?;
        cmd.emit(reference)?;
        cmd.emit(mask)?;
        cmd.emit(4)
    }

    fn pad(&self, cmd: &mut CmdBuffer) -> Result<()> {
        cmd.emit_aligned(SDMA_ALIGN_MASK, sdma_packet(SDMA_OPCODE_NOP, 0, 0))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::asic::{FAMILY_GC_11_0_0, FAMILY_VI};

    #[test]
    fn test_write_linear_count() {
        let mut cmd = CmdBuffer::with_capacity(16);
        SdmaEncoder::new(FAMILY_GC_11_0_0)
            .write_linear(&mut cmd, 0x1_0000_1000, 2)
            .unwrap();
        assert_eq!(
            cmd.as_slice(),
            &[2, 0x1000, 1, 1, WRITE_PATTERN, WRITE_PATTERN]
        );

        cmd.clear();
        SdmaEncoder::new(FAMILY_VI)
            .write_linear(&mut cmd, 0x1000, 2)
            .unwrap();
        assert_eq!(cmd.as_slice()[3], 2);
    }

    #[test]
    fn test_poll_regmem_header() {
        let mut cmd = CmdBuffer::with_capacity(8);
        SdmaEncoder::new(FAMILY_GC_11_0_0)
            .wait_reg_mem(&mut cmd, 0x2000, 0, 0xffff_ffff, WaitFunc::NotEqual)
            .unwrap();
        assert_eq!(cmd.as_slice()[0], 8 | (4 << 28) | (1 << 31));
        assert_eq!(cmd.len(), 6);
    }

    #[test]
    fn test_bad_variants() {
        let enc = SdmaEncoder::new(FAMILY_GC_11_0_0);
        let mut cmd = CmdBuffer::with_capacity(32);

        enc.bad_write_linear(&mut cmd, 0x1000, 1, ErrorKind::InvalidOpcode)
            .unwrap();
        assert_eq!(sdma_opcode(cmd.as_slice()[0]), SDMA_OPCODE_INVALID);

        cmd.clear();
        enc.bad_write_linear(&mut cmd, 0x1000, 1, ErrorKind::BadRegAddress)
            .unwrap();
        assert_eq!(sdma_opcode(cmd.as_slice()[0]), SDMA_OPCODE_SRBM_WRITE);
        assert_eq!(cmd.as_slice()[1], BAD_REG_OFFSET);

        assert_matches!(
            enc.bad_write_linear(&mut cmd, 0x1000, 1, ErrorKind::InvalidUserData),
            Err(EncodeError::Unsupported(ErrorKind::InvalidUserData, IpType::Dma))
        );
    }

    #[test]
    fn test_pad_with_nops() {
        let mut cmd = CmdBuffer::with_capacity(8);
        let enc = SdmaEncoder::new(FAMILY_GC_11_0_0);
        enc.const_fill(&mut cmd, 0x1000, 7, 16).unwrap();
        enc.pad(&mut cmd).unwrap();
        assert_eq!(cmd.len(), 8);
        assert_eq!(&cmd.as_slice()[5..], &[0, 0, 0]);
    }
}
