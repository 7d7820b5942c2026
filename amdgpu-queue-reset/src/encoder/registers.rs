// Per generation compute register layout
//
// Copyright 2025 The amdgpu-queue-reset Authors
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use super::{EncodeError, Result};
use crate::asic::*;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GfxGeneration {
    Gfx9,
    Gfx10,
    Gfx10_3,
    Gfx11,
    Gfx12,
}

impl GfxGeneration {
    pub fn from_family(family_id: u32) -> Result<Self> {
        Ok(match family_id {
            FAMILY_AI | FAMILY_RV => Self::Gfx9,
            FAMILY_NV | FAMILY_VGH => Self::Gfx10,
            FAMILY_YC | FAMILY_GC_10_3_6 | FAMILY_GC_10_3_7 => Self::Gfx10_3,
            FAMILY_GC_11_0_0 | FAMILY_GC_11_0_1 | FAMILY_GC_11_5_0 => Self::Gfx11,
            FAMILY_GC_12_0_0 => Self::Gfx12,
            _ => return Err(EncodeError::UnsupportedFamily(family_id)),
        })
    }
}

/// Shader register offsets, relative to the start of the SH register
/// aperture as `SET_SH_REG` expects them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShRegisters {
    pub compute_start_x: u32,
    pub compute_num_thread_x: u32,
    pub compute_pgm_lo: u32,
    pub compute_pgm_rsrc1: u32,
    pub compute_resource_limits: u32,
    pub compute_tmpring_size: u32,
    pub compute_user_data_0: u32,
}

const SH_REGISTERS: ShRegisters = ShRegisters {
    compute_start_x: 0x204,
    compute_num_thread_x: 0x207,
    compute_pgm_lo: 0x20c,
    compute_pgm_rsrc1: 0x212,
    compute_resource_limits: 0x215,
    compute_tmpring_size: 0x218,
    compute_user_data_0: 0x240,
};

/// Everything an encoder needs to know about the GPU generation.
/// Resolved once per device and passed to every encoder call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegisterLayout {
    family_id: u32,
    generation: GfxGeneration,
    pub sh: ShRegisters,
}

impl RegisterLayout {
    pub fn for_family(family_id: u32) -> Result<Self> {
        Ok(Self {
            family_id,
            generation: GfxGeneration::from_family(family_id)?,
            sh: SH_REGISTERS,
        })
    }

    pub fn family_id(&self) -> u32 {
        self.family_id
    }

    pub fn generation(&self) -> GfxGeneration {
        self.generation
    }

    /// Encoding of `s_endpgm`.
    pub fn end_pgm(&self) -> u32 {
        match self.generation {
            GfxGeneration::Gfx9 | GfxGeneration::Gfx10 | GfxGeneration::Gfx10_3 => 0xbf81_0000,
            GfxGeneration::Gfx11 | GfxGeneration::Gfx12 => 0xbfb0_0000,
        }
    }

    /// `s_nop 0`.
    pub fn nop(&self) -> u32 {
        0xbf80_0000
    }

    pub fn dispatch_initiator(&self) -> u32 {
        match self.generation {
            GfxGeneration::Gfx9 | GfxGeneration::Gfx10 => 0,
            GfxGeneration::Gfx10_3 | GfxGeneration::Gfx11 | GfxGeneration::Gfx12 => 0x45,
        }
    }

    pub fn has_tmpring_size(&self) -> bool {
        matches!(
            self.generation,
            GfxGeneration::Gfx9 | GfxGeneration::Gfx10 | GfxGeneration::Gfx10_3
        )
    }

    pub fn has_clear_state(&self) -> bool {
        self.generation != GfxGeneration::Gfx12
    }

    /// Bits of `COMPUTE_PGM_RSRC1` with no defined meaning.
    pub fn rsrc1_reserved_mask(&self) -> u32 {
        match self.generation {
            GfxGeneration::Gfx9 => 0xf800_0000,
            _ => 0xc000_0000,
        }
    }

    /// Reset value used by well formed dispatches.
    pub fn default_rsrc1(&self) -> u32 {
        0x002c_0041
    }

    pub fn default_rsrc2(&self) -> u32 {
        0x0000_0090
    }

    /// Command processors before Vega count SDMA sizes from one.
    pub fn sdma_count_minus_one(&self) -> bool {
        self.family_id >= FAMILY_AI
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn test_generation_from_family() {
        assert_eq!(
            GfxGeneration::from_family(FAMILY_RV).unwrap(),
            GfxGeneration::Gfx9
        );
        assert_eq!(
            GfxGeneration::from_family(FAMILY_VGH).unwrap(),
            GfxGeneration::Gfx10
        );
        assert_eq!(
            GfxGeneration::from_family(FAMILY_GC_10_3_7).unwrap(),
            GfxGeneration::Gfx10_3
        );
        assert_eq!(
            GfxGeneration::from_family(FAMILY_GC_11_5_0).unwrap(),
            GfxGeneration::Gfx11
        );
        assert_eq!(
            GfxGeneration::from_family(FAMILY_GC_12_0_0).unwrap(),
            GfxGeneration::Gfx12
        );
        assert_matches!(
            GfxGeneration::from_family(FAMILY_VI),
            Err(EncodeError::UnsupportedFamily(FAMILY_VI))
        );
    }

    #[test]
    fn test_layout_quirks() {
        let nv = RegisterLayout::for_family(FAMILY_NV).unwrap();
        assert_eq!(nv.end_pgm(), 0xbf81_0000);
        assert_eq!(nv.dispatch_initiator(), 0);
        assert!(nv.has_tmpring_size());
        assert!(nv.has_clear_state());

        let yc = RegisterLayout::for_family(FAMILY_YC).unwrap();
        assert_eq!(yc.dispatch_initiator(), 0x45);

        let gfx11 = RegisterLayout::for_family(FAMILY_GC_11_0_0).unwrap();
        assert_eq!(gfx11.end_pgm(), 0xbfb0_0000);
        assert!(!gfx11.has_tmpring_size());
        assert!(gfx11.has_clear_state());

        let gfx12 = RegisterLayout::for_family(FAMILY_GC_12_0_0).unwrap();
        assert!(!gfx12.has_clear_state());
        assert_eq!(gfx12.default_rsrc1() & gfx12.rsrc1_reserved_mask(), 0);
    }
}
