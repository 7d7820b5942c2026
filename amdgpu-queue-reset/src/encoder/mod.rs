// Command stream encoders
//
// Copyright 2025 The amdgpu-queue-reset Authors
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

pub mod dispatch;
pub mod pm4;
pub mod registers;
pub mod sdma;

use thiserror::Error as ThisError;

pub use self::{pm4::Pm4Encoder, registers::RegisterLayout, sdma::SdmaEncoder};
use crate::{catalog::ErrorKind, device::IpType};

/// GPU address that is never mapped by the harness. Faulting jobs point
/// reads, writes and program counters at it.
pub const POISONED_ADDRESS: u64 = 0x0000_dead_0000_0000;

pub type Result<T> = std::result::Result<T, EncodeError>;

#[derive(Copy, Clone, Debug, PartialEq, Eq, ThisError)]
pub enum EncodeError {
    #[error("Command buffer too small: need {needed} dwords, capacity is {capacity}")]
    BufferTooSmall { needed: usize, capacity: usize },
    #[error("Offset {offset} is past the {len} dwords written so far")]
    OffsetOutOfRange { offset: usize, len: usize },
    #[error("{0} cannot be encoded for {1}")]
    Unsupported(ErrorKind, IpType),
    #[error("No command encoder for {0}")]
    NoEncoder(IpType),
    #[error("Unsupported GPU family {0}")]
    UnsupportedFamily(u32),
}

/// Dword command buffer with a fixed capacity.
///
/// Nothing is ever written past `capacity`; a write that does not fit
/// fails and leaves the buffer untouched.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CmdBuffer {
    words: Vec<u32>,
    capacity: usize,
}

impl CmdBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            words: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.words
    }

    pub fn clear(&mut self) {
        self.words.clear();
    }

    fn reserve(&self, count: usize) -> Result<()> {
        let needed = self.words.len() + count;
        if needed > self.capacity {
            return Err(EncodeError::BufferTooSmall {
                needed,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    pub fn emit(&mut self, value: u32) -> Result<()> {
        self.reserve(1)?;
        self.words.push(value);
        Ok(())
    }

    pub fn emit_buf(&mut self, values: &[u32]) -> Result<()> {
        self.reserve(values.len())?;
        self.words.extend_from_slice(values);
        Ok(())
    }

    pub fn emit_repeat(&mut self, value: u32, count: usize) -> Result<()> {
        self.reserve(count)?;
        self.words.resize(self.words.len() + count, value);
        Ok(())
    }

    /// Pads with `value` until the length is a multiple of `mask + 1`.
    pub fn emit_aligned(&mut self, mask: usize, value: u32) -> Result<()> {
        let pad = (mask + 1 - (self.words.len() & mask)) & mask;
        self.emit_repeat(value, pad)
    }

    /// Overwrites an already emitted dword.
    pub fn emit_at_offset(&mut self, value: u32, offset: usize) -> Result<()> {
        let len = self.words.len();
        let slot = self
            .words
            .get_mut(offset)
            .ok_or(EncodeError::OffsetOutOfRange { offset, len })?;
        *slot = value;
        Ok(())
    }
}

/// Register wait comparison, the encoding shared by PM4 and SDMA.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum WaitFunc {
    Always = 0,
    Less = 1,
    LessEqual = 2,
    Equal = 3,
    NotEqual = 4,
    GreaterEqual = 5,
    Greater = 6,
}

impl WaitFunc {
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::Always,
            1 => Self::Less,
            2 => Self::LessEqual,
            3 => Self::Equal,
            4 => Self::NotEqual,
            5 => Self::GreaterEqual,
            6 => Self::Greater,
            _ => return None,
        })
    }

    pub fn test(self, value: u32, reference: u32) -> bool {
        match self {
            Self::Always => true,
            Self::Less => value < reference,
            Self::LessEqual => value <= reference,
            Self::Equal => value == reference,
            Self::NotEqual => value != reference,
            Self::GreaterEqual => value >= reference,
            Self::Greater => value > reference,
        }
    }
}

/// Logical operations a ring can encode.
pub trait IpEncoder: Send + Sync {
    fn ip(&self) -> IpType;

    /// Writes `len_dw` copies of [`WRITE_PATTERN`] at `dst`.
    fn write_linear(&self, cmd: &mut CmdBuffer, dst: u64, len_dw: u32) -> Result<()>;

    /// Same job as `write_linear`, malformed according to `error`.
    fn bad_write_linear(
        &self,
        cmd: &mut CmdBuffer,
        dst: u64,
        len_dw: u32,
        error: ErrorKind,
    ) -> Result<()>;

    fn const_fill(&self, cmd: &mut CmdBuffer, dst: u64, value: u32, size: u32) -> Result<()>;

    fn copy_linear(&self, cmd: &mut CmdBuffer, src: u64, dst: u64, size: u32) -> Result<()>;

    /// Stores `value` at `dst` if it currently holds `compare`.
    fn atomic_cmpswap(&self, cmd: &mut CmdBuffer, dst: u64, value: u32, compare: u32)
        -> Result<()>;

    fn wait_reg_mem(
        &self,
        cmd: &mut CmdBuffer,
        addr: u64,
        reference: u32,
        mask: u32,
        func: WaitFunc,
    ) -> Result<()>;

    /// NOP padding up to the engine's submission alignment.
    fn pad(&self, cmd: &mut CmdBuffer) -> Result<()>;
}

/// Payload every linear write job stores.
pub const WRITE_PATTERN: u32 = 0xdead_beaf;

pub fn encoder_for(ip: IpType, layout: RegisterLayout) -> Result<Box<dyn IpEncoder>> {
    match ip {
        IpType::Gfx | IpType::Compute => Ok(Box::new(Pm4Encoder::new(ip, layout))),
        IpType::Dma => Ok(Box::new(SdmaEncoder::new(layout.family_id()))),
        _ => Err(EncodeError::NoEncoder(ip)),
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::asic::FAMILY_NV;

    #[test]
    fn test_emit_capacity() {
        let mut cmd = CmdBuffer::with_capacity(4);
        cmd.emit(1).unwrap();
        cmd.emit_buf(&[2, 3]).unwrap();
        assert_matches!(
            cmd.emit_buf(&[4, 5]),
            Err(EncodeError::BufferTooSmall {
                needed: 5,
                capacity: 4
            })
        );
        // A failed write leaves the buffer as it was.
        assert_eq!(cmd.as_slice(), &[1, 2, 3]);
        cmd.emit(4).unwrap();
        assert_matches!(cmd.emit(5), Err(EncodeError::BufferTooSmall { .. }));
        assert_eq!(cmd.len(), cmd.capacity());
    }

    #[test]
    fn test_emit_aligned() {
        let mut cmd = CmdBuffer::with_capacity(16);
        cmd.emit_aligned(7, 0xffff_1000).unwrap();
        assert!(cmd.is_empty());

        cmd.emit_repeat(1, 3).unwrap();
        cmd.emit_aligned(7, 0xffff_1000).unwrap();
        assert_eq!(cmd.len(), 8);
        assert_eq!(&cmd.as_slice()[3..], &[0xffff_1000; 5]);

        // Padding up to exactly the capacity fits.
        cmd.emit(2).unwrap();
        cmd.emit_aligned(15, 0).unwrap();
        assert_eq!(cmd.len(), 16);

        let mut cmd = CmdBuffer::with_capacity(15);
        cmd.emit_repeat(1, 9).unwrap();
        assert_matches!(
            cmd.emit_aligned(15, 0),
            Err(EncodeError::BufferTooSmall {
                needed: 16,
                capacity: 15
            })
        );
        assert_eq!(cmd.len(), 9);
    }

    #[test]
    fn test_emit_at_offset() {
        let mut cmd = CmdBuffer::with_capacity(8);
        cmd.emit_buf(&[1, 2, 3]).unwrap();
        cmd.emit_at_offset(0x23de_cd3d, 0).unwrap();
        assert_eq!(cmd.as_slice(), &[0x23de_cd3d, 2, 3]);
        assert_matches!(
            cmd.emit_at_offset(0, 3),
            Err(EncodeError::OffsetOutOfRange { offset: 3, len: 3 })
        );
    }

    #[test]
    fn test_wait_func() {
        assert!(WaitFunc::NotEqual.test(1, 0));
        assert!(!WaitFunc::NotEqual.test(0, 0));
        assert!(WaitFunc::GreaterEqual.test(5, 5));
        assert!(WaitFunc::Always.test(0, 9));
        assert_eq!(WaitFunc::from_raw(4), Some(WaitFunc::NotEqual));
        assert_eq!(WaitFunc::from_raw(7), None);
    }

    #[test]
    fn test_encoder_for() {
        let layout = RegisterLayout::for_family(FAMILY_NV).unwrap();
        assert_eq!(encoder_for(IpType::Gfx, layout).unwrap().ip(), IpType::Gfx);
        assert_eq!(encoder_for(IpType::Dma, layout).unwrap().ip(), IpType::Dma);
        assert_eq!(
            encoder_for(IpType::Vpe, layout).err(),
            Some(EncodeError::NoEncoder(IpType::Vpe))
        );
    }
}
