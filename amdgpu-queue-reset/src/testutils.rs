// Shared test fixtures
//
// Copyright 2025 The amdgpu-queue-reset Authors
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{sync::Arc, time::Duration};

use crate::{
    backend::{SimConfig, SimDevice},
    device::GpuDevice,
};

pub(crate) fn sim_device_with(config: SimConfig) -> (Arc<SimDevice>, Arc<dyn GpuDevice>) {
    let sim = Arc::new(SimDevice::new(config));
    let device: Arc<dyn GpuDevice> = sim.clone();
    (sim, device)
}

pub(crate) fn sim_device() -> (Arc<SimDevice>, Arc<dyn GpuDevice>) {
    sim_device_with(SimConfig {
        gpu_reset_duration: Duration::from_millis(20),
        ..Default::default()
    })
}
