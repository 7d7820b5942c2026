// GPU device backends
//
// Copyright 2025 The amdgpu-queue-reset Authors
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

pub mod amdgpu;
mod bindings;
pub mod sim;

pub use self::{
    amdgpu::AmdgpuDevice,
    sim::{SimConfig, SimDevice},
};
