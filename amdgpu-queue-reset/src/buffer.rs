// Owning GPU buffer
//
// Copyright 2025 The amdgpu-queue-reset Authors
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::sync::Arc;

use log::warn;

use crate::device::{AllocRequest, BoMapping, CpuView, GpuDevice, Result, TimelinePoint};

/// A buffer object that is unmapped and freed exactly once, either by
/// [`GpuBuffer::release`] or on drop.
pub struct GpuBuffer {
    device: Arc<dyn GpuDevice>,
    mapping: Option<BoMapping>,
}

impl GpuBuffer {
    pub fn new(device: &Arc<dyn GpuDevice>, request: &AllocRequest) -> Result<Self> {
        let mapping = device.alloc_and_map(request)?;
        Ok(Self {
            device: device.clone(),
            mapping: Some(mapping),
        })
    }

    pub fn handle(&self) -> u32 {
        self.mapping.map_or(0, |m| m.handle)
    }

    pub fn gpu_addr(&self) -> u64 {
        self.mapping.map_or(0, |m| m.gpu_addr)
    }

    pub fn size(&self) -> u64 {
        self.mapping.map_or(0, |m| m.size)
    }

    /// `None` once released or when the buffer was not CPU mapped.
    ///
    /// The view borrows the buffer, so it cannot outlive the mapping:
    ///
    /// ```compile_fail
    /// # use std::sync::Arc;
    /// # use amdgpu_queue_reset::{
    /// #     backend::{SimConfig, SimDevice},
    /// #     buffer::GpuBuffer,
    /// #     device::{AllocRequest, GpuDevice},
    /// # };
    /// let device: Arc<dyn GpuDevice> = Arc::new(SimDevice::new(SimConfig::default()));
    /// let buffer = GpuBuffer::new(&device, &AllocRequest::gtt(4096)).unwrap();
    /// let stale = buffer.cpu().unwrap();
    /// drop(buffer);
    /// stale.write_u32(0, 0x4141_4141).unwrap();
    /// ```
    pub fn cpu(&self) -> Option<CpuView<'_>> {
        let cpu = self.mapping.and_then(|m| m.cpu)?;
        // SAFETY: the mapping is only freed through `&mut self`, which the
        // returned borrow excludes.
        Some(unsafe { cpu.view() })
    }

    pub fn is_released(&self) -> bool {
        self.mapping.is_none()
    }

    /// Unbinds and frees the buffer, signalling `timeline` once the GPU
    /// mapping is gone. Later calls do nothing.
    pub fn release(&mut self, timeline: Option<TimelinePoint>) -> Result<()> {
        match self.mapping.take() {
            Some(mapping) => self.device.unmap_and_free(&mapping, timeline),
            None => Ok(()),
        }
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        if let Err(e) = self.release(None) {
            warn!("Failed to free buffer object: {e}");
        }
    }
}
