// Compute program binding and dispatch
//
// Copyright 2025 The amdgpu-queue-reset Authors
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use super::{
    pm4::{
        hi32, lo32, packet3, GFX_COMPUTE_NOP, PACKET3_CLEAR_STATE, PACKET3_CONTEXT_CONTROL,
        PACKET3_DISPATCH_DIRECT, PACKET3_SET_SH_REG, PM4_ALIGN_MASK,
    },
    CmdBuffer, EncodeError, RegisterLayout, Result, POISONED_ADDRESS,
};
use crate::{catalog::ErrorKind, device::IpType};

/// Shader state bound before a dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShaderProgram {
    pub code_addr: u64,
    pub user_data: u64,
    pub rsrc1: u32,
    pub rsrc2: u32,
    pub threads: [u32; 3],
}

impl ShaderProgram {
    pub fn new(layout: &RegisterLayout, code_addr: u64, user_data: u64) -> Self {
        Self {
            code_addr,
            user_data,
            rsrc1: layout.default_rsrc1(),
            rsrc2: layout.default_rsrc2(),
            threads: [1, 1, 1],
        }
    }

    /// Breaks the program the way `error` asks for.
    pub fn with_error(mut self, error: ErrorKind, ip: IpType) -> Result<Self> {
        match error {
            ErrorKind::ShaderExecSuccess | ErrorKind::InvalidShader => {}
            ErrorKind::InvalidProgramAddr => self.code_addr = POISONED_ADDRESS,
            ErrorKind::InvalidUserData => self.user_data = POISONED_ADDRESS,
            ErrorKind::InvalidProgramSetting => self.rsrc1 = u32::MAX,
            _ => return Err(EncodeError::Unsupported(error, ip)),
        }
        Ok(self)
    }
}

/// Shader binary placed at the program address.
pub fn shader_code(layout: &RegisterLayout, error: ErrorKind) -> Vec<u32> {
    if error == ErrorKind::InvalidShader {
        // No end of program anywhere, the wave runs into garbage.
        vec![0xdead_beef; 64]
    } else {
        vec![layout.nop(), layout.nop(), layout.end_pgm()]
    }
}

fn set_sh_reg(cmd: &mut CmdBuffer, reg: u32, values: &[u32]) -> Result<()> {
    cmd.emit(packet3(PACKET3_SET_SH_REG, values.len() as u32))?;
    cmd.emit(reg)?;
    cmd.emit_buf(values)
}

/// Binds `program` to the compute pipeline.
///
/// Gfx11 drops the scratch ring size register, gfx12 additionally has no
/// CLEAR_STATE.
pub fn program_compute(
    cmd: &mut CmdBuffer,
    layout: &RegisterLayout,
    program: &ShaderProgram,
) -> Result<()> {
    let sh = &layout.sh;

    cmd.emit(packet3(PACKET3_CONTEXT_CONTROL, 1))?;
    cmd.emit(0x8000_0000)?;
    cmd.emit(0x8000_0000)?;

    if layout.has_clear_state() {
        cmd.emit(packet3(PACKET3_CLEAR_STATE, 0))?;
        cmd.emit(0x8000_0000)?;
    }

    set_sh_reg(
        cmd,
        sh.compute_pgm_lo,
        &[
            (program.code_addr >> 8) as u32,
            (program.code_addr >> 40) as u32,
        ],
    )?;
    set_sh_reg(cmd, sh.compute_pgm_rsrc1, &[program.rsrc1, program.rsrc2])?;
    if layout.has_tmpring_size() {
        set_sh_reg(cmd, sh.compute_tmpring_size, &[0x100])?;
    }
    set_sh_reg(
        cmd,
        sh.compute_user_data_0,
        &[lo32(program.user_data), hi32(program.user_data)],
    )?;
    set_sh_reg(cmd, sh.compute_resource_limits, &[0])?;
    set_sh_reg(cmd, sh.compute_num_thread_x, &program.threads)
}

pub fn dispatch_direct(
    cmd: &mut CmdBuffer,
    layout: &RegisterLayout,
    groups: [u32; 3],
) -> Result<()> {
    cmd.emit(packet3(PACKET3_DISPATCH_DIRECT, 3))?;
    cmd.emit_buf(&groups)?;
    cmd.emit(layout.dispatch_initiator())?;
    cmd.emit_aligned(PM4_ALIGN_MASK, GFX_COMPUTE_NOP)
}
