// User mode queues: doorbell submission without a kernel call per job
//
// Copyright 2025 The amdgpu-queue-reset Authors
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::sync::{
    atomic::{fence, Ordering},
    Arc,
};

use log::{debug, warn};

use crate::{
    buffer::GpuBuffer,
    device::{
        AllocRequest, CpuView, Error, GpuDevice, IpType, Mqd, Result, SyncobjWaitFlags,
        TimelinePoint, UserQueueDesc, VmFlags,
    },
    encoder::pm4::{
        hi32, lo32, packet3, INDIRECT_BUFFER_INHERIT_VMID_MQD_COMPUTE,
        INDIRECT_BUFFER_INHERIT_VMID_MQD_GFX, INDIRECT_BUFFER_VALID, PACKET3_INDIRECT_BUFFER,
        PACKET3_PROTECTED_FENCE_SIGNAL,
    },
};

pub const USERMODE_QUEUE_SIZE: u64 = 4096 * 256;
pub const USERMODE_QUEUE_SIZE_DW: u32 = (USERMODE_QUEUE_SIZE >> 2) as u32;
pub const USERMODE_QUEUE_SIZE_DW_MASK: u32 = USERMODE_QUEUE_SIZE_DW - 1;
pub const ALIGNMENT: u64 = 4096;
/// Qword slot of the doorbell page this queue rings.
pub const DOORBELL_INDEX: u32 = 4;
const EOP_SIZE: u64 = 256;
const POINTER_SIZE: u64 = 8;

/// Dwords a single submission appends to the ring.
pub const SUBMIT_DWORDS: u32 = 6;

/// Indirect buffer control word for `ip`.
pub fn ib_control(ip: IpType, ib_size_dw: u32) -> u32 {
    let inherit = if ip == IpType::Gfx {
        INDIRECT_BUFFER_INHERIT_VMID_MQD_GFX
    } else {
        INDIRECT_BUFFER_VALID | INDIRECT_BUFFER_INHERIT_VMID_MQD_COMPUTE
    };
    (ib_size_dw & 0xf_ffff) | inherit
}

/// A firmware scheduled queue the process rings directly.
pub struct UserQueue {
    device: Arc<dyn GpuDevice>,
    ip: IpType,
    queue_id: Option<u32>,
    syncobj: Option<u32>,
    point: u64,
    queue: Option<GpuBuffer>,
    wptr: Option<GpuBuffer>,
    rptr: Option<GpuBuffer>,
    doorbell: Option<GpuBuffer>,
    /// Descriptor buffers in allocation order.
    mqd_buffers: Vec<GpuBuffer>,
}

impl UserQueue {
    pub fn new(device: &Arc<dyn GpuDevice>, ip: IpType) -> Result<Self> {
        let mut queue = Self {
            device: device.clone(),
            ip,
            queue_id: None,
            syncobj: None,
            point: 0,
            queue: None,
            wptr: None,
            rptr: None,
            doorbell: None,
            mqd_buffers: Vec::new(),
        };

        if let Err(e) = queue.create() {
            if let Err(cleanup) = queue.destroy() {
                warn!("Cleanup after failed {ip} user queue creation: {cleanup}");
            }
            return Err(e);
        }
        Ok(queue)
    }

    fn create(&mut self) -> Result<()> {
        let fw = self.device.query_fw_area_info(IpType::Gfx)?;
        self.syncobj = Some(self.device.syncobj_create()?);

        let uncached = |size: u64| {
            AllocRequest::gtt(size)
                .with_alignment(ALIGNMENT)
                .with_vm_flags(VmFlags::MTYPE_UC)
        };

        let request = uncached(USERMODE_QUEUE_SIZE).with_timeline(self.next_point()?);
        self.queue = Some(GpuBuffer::new(&self.device, &request)?);
        let request = uncached(POINTER_SIZE).with_timeline(self.next_point()?);
        self.wptr = Some(GpuBuffer::new(&self.device, &request)?);
        let request = uncached(POINTER_SIZE).with_timeline(self.next_point()?);
        self.rptr = Some(GpuBuffer::new(&self.device, &request)?);

        let mqd = match self.ip {
            IpType::Gfx => {
                let shadow = self.alloc_mqd_buffer(
                    u64::from(fw.shadow_size),
                    u64::from(fw.shadow_alignment),
                )?;
                let csa =
                    self.alloc_mqd_buffer(u64::from(fw.csa_size), u64::from(fw.csa_alignment))?;
                Mqd::Gfx {
                    shadow_va: shadow,
                    csa_va: csa,
                }
            }
            IpType::Compute => Mqd::Compute {
                eop_va: self.alloc_mqd_buffer(EOP_SIZE, ALIGNMENT)?,
            },
            IpType::Dma => Mqd::Sdma {
                csa_va: self
                    .alloc_mqd_buffer(u64::from(fw.csa_size), u64::from(fw.csa_alignment))?,
            },
            other => return Err(Error::UnsupportedIp(other)),
        };

        self.wait_timeline()?;

        let doorbell = GpuBuffer::new(&self.device, &AllocRequest::doorbell(4096))?;
        self.doorbell = Some(doorbell);

        self.queue_cpu()?.fill_u32(0);

        let desc = UserQueueDesc {
            ip: self.ip,
            doorbell_handle: self.doorbell.as_ref().map_or(0, GpuBuffer::handle),
            doorbell_offset: DOORBELL_INDEX,
            queue_va: self.queue.as_ref().map_or(0, GpuBuffer::gpu_addr),
            queue_size: USERMODE_QUEUE_SIZE,
            rptr_va: self.rptr.as_ref().map_or(0, GpuBuffer::gpu_addr),
            wptr_va: self.wptr.as_ref().map_or(0, GpuBuffer::gpu_addr),
            mqd,
        };
        let id = self.device.create_user_queue(&desc)?;
        debug!("Created {} user queue {id}", self.ip);
        self.queue_id = Some(id);

        Ok(())
    }

    fn alloc_mqd_buffer(&mut self, size: u64, alignment: u64) -> Result<u64> {
        let request = AllocRequest::vram(size.max(ALIGNMENT))
            .with_alignment(alignment.max(ALIGNMENT))
            .without_cpu_map()
            .with_timeline(self.next_point()?);
        let buffer = GpuBuffer::new(&self.device, &request)?;
        let va = buffer.gpu_addr();
        self.mqd_buffers.push(buffer);
        Ok(va)
    }

    fn syncobj(&self) -> Result<u32> {
        self.syncobj
            .ok_or(Error::UnknownQueue(self.queue_id.unwrap_or(0)))
    }

    /// Reserves the next timeline point for a bind or unbind.
    pub fn next_point(&mut self) -> Result<TimelinePoint> {
        let syncobj = self.syncobj()?;
        self.point += 1;
        Ok(TimelinePoint {
            syncobj,
            point: self.point,
        })
    }

    /// Waits for the last submitted point of the timeline.
    pub fn wait_timeline(&self) -> Result<()> {
        let syncobj = self.syncobj()?;
        let point = self.device.syncobj_query(syncobj)?;
        self.device.syncobj_wait(
            &[syncobj],
            &[point],
            i64::MAX,
            SyncobjWaitFlags::WAIT_ALL | SyncobjWaitFlags::WAIT_FOR_SUBMIT,
        )
    }

    pub fn ip(&self) -> IpType {
        self.ip
    }

    pub fn queue_id(&self) -> Option<u32> {
        self.queue_id
    }

    fn queue_cpu(&self) -> Result<CpuView<'_>> {
        self.cpu_of(&self.queue)
    }

    fn cpu_of<'a>(&self, buffer: &'a Option<GpuBuffer>) -> Result<CpuView<'a>> {
        buffer
            .as_ref()
            .and_then(GpuBuffer::cpu)
            .ok_or(Error::UnknownQueue(self.queue_id.unwrap_or(0)))
    }

    /// Current write pointer, in dwords since creation.
    pub fn wptr(&self) -> Result<u64> {
        self.cpu_of(&self.wptr)?.read_u64(0)
    }

    pub fn rptr(&self) -> Result<u64> {
        self.cpu_of(&self.rptr)?.read_u64(0)
    }

    /// Queues the indirect buffer at `ib_addr`, rings the doorbell and waits
    /// for the queue's fence.
    pub fn submit(&mut self, ib_addr: u64, ib_size_dw: u32) -> Result<()> {
        self.ring_doorbell(ib_addr, ib_size_dw)?;
        self.wait_fence()
    }

    /// Appends the indirect buffer and fence packets, publishes the new
    /// write pointer and asks the kernel to signal the queue's sync object.
    pub fn ring_doorbell(&mut self, ib_addr: u64, ib_size_dw: u32) -> Result<()> {
        let queue_id = self.queue_id.ok_or(Error::UnknownQueue(0))?;
        let syncobj = self.syncobj()?;
        let ring = self.queue_cpu()?;
        let wptr = self.cpu_of(&self.wptr)?;
        let doorbell = self.cpu_of(&self.doorbell)?;

        let start = wptr.read_u64(0)?;
        let packets = [
            packet3(PACKET3_INDIRECT_BUFFER, 2),
            lo32(ib_addr),
            hi32(ib_addr),
            ib_control(self.ip, ib_size_dw),
            packet3(PACKET3_PROTECTED_FENCE_SIGNAL, 0),
            0,
        ];
        for (i, word) in packets.iter().enumerate() {
            let slot = (start as u32).wrapping_add(i as u32) & USERMODE_QUEUE_SIZE_DW_MASK;
            ring.write_u32(slot as usize, *word)?;
        }

        // The new write pointer must not be visible before the packets.
        fence(Ordering::SeqCst);
        wptr.write_u64(0, start + packets.len() as u64)?;
        fence(Ordering::SeqCst);
        doorbell.write_u64(DOORBELL_INDEX as usize, wptr.read_u64(0)?)?;

        self.device.signal_user_queue(queue_id, syncobj)
    }

    /// Blocks until the last doorbell's fence signals.
    pub fn wait_fence(&self) -> Result<()> {
        let syncobj = self.syncobj()?;
        self.device
            .syncobj_wait(&[syncobj], &[0], i64::MAX, SyncobjWaitFlags::WAIT_ALL)
    }

    /// Tears the queue down in reverse creation order. Safe to call again.
    pub fn destroy(&mut self) -> Result<()> {
        let mut result = Ok(());
        let mut keep_first = |r: Result<()>| {
            if let Err(e) = r {
                warn!("User queue teardown: {e}");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        };

        if let Some(id) = self.queue_id.take() {
            keep_first(self.device.destroy_user_queue(id));
        }

        while let Some(mut buffer) = self.mqd_buffers.pop() {
            let point = self.next_point().ok();
            keep_first(buffer.release(point));
            if point.is_some() {
                keep_first(self.wait_timeline());
            }
        }

        if let Some(syncobj) = self.syncobj.take() {
            keep_first(self.device.syncobj_destroy(syncobj));
        }

        for mut buffer in [
            self.doorbell.take(),
            self.rptr.take(),
            self.wptr.take(),
            self.queue.take(),
        ]
        .into_iter()
        .flatten()
        {
            keep_first(buffer.release(None));
        }

        result
    }
}

impl Drop for UserQueue {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            warn!("Failed to destroy {} user queue: {e}", self.ip);
        }
    }
}
