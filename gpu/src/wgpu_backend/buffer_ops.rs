//! WebGPU buffer operations: storage buffer allocation and data transfer

use std::sync::Arc;

use wgpu;
use wgpu::util::DeviceExt;

use super::device_init::WgpuContext;
use crate::driver::{BufferId, StorageHint};

const ALIGN: u64 = wgpu::COPY_BUFFER_ALIGNMENT;

fn align_down(v: u64) -> u64 {
    v & !(ALIGN - 1)
}

fn align_up(v: u64) -> u64 {
    v.div_ceil(ALIGN) * ALIGN
}

/// Storage buffer bound at `@binding(id)`.
pub struct WgpuBuffer {
    pub(crate) buffer: wgpu::Buffer,
    pub(crate) id: BufferId,
    /// Logical size requested by the caller; the allocation is rounded up to 4 bytes.
    pub(crate) byte_size: u64,
    pub(crate) ctx: Arc<WgpuContext>,
}

// wgpu exposes one storage heap, so the hint does not change the usage set.
fn usage_for(_hint: StorageHint) -> wgpu::BufferUsages {
    wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST
}

impl WgpuBuffer {
    pub fn allocate(
        ctx: &Arc<WgpuContext>,
        hint: StorageHint,
        id: BufferId,
        initial: Option<&[u8]>,
        byte_size: usize,
    ) -> Option<Self> {
        if byte_size == 0 {
            return None;
        }
        let padded = align_up(byte_size as u64);
        let label = format!("cinder_buffer_{}", id);

        let buffer = match initial {
            Some(data) => {
                let mut contents = data.to_vec();
                contents.resize(padded as usize, 0);
                ctx.device
                    .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                        label: Some(&label),
                        contents: &contents,
                        usage: usage_for(hint),
                    })
            }
            None => ctx.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(&label),
                size: padded,
                usage: usage_for(hint),
                mapped_at_creation: false,
            }),
        };

        Some(WgpuBuffer {
            buffer,
            id,
            byte_size: byte_size as u64,
            ctx: Arc::clone(ctx),
        })
    }

    fn in_bounds(&self, offset: u64, len: usize) -> bool {
        offset
            .checked_add(len as u64)
            .is_some_and(|end| end <= self.byte_size)
    }

    /// Copy `[start, end)` (4-byte aligned) back to the CPU via a staging buffer.
    fn read_aligned(&self, start: u64, end: u64) -> Option<Vec<u8>> {
        let device = &self.ctx.device;
        let size = end - start;

        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("cinder_staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("cinder_readback"),
        });
        encoder.copy_buffer_to_buffer(&self.buffer, start, &staging, 0, size);
        self.ctx.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        device.poll(wgpu::Maintain::Wait);

        match rx.recv() {
            Ok(Ok(())) => {
                let data = slice.get_mapped_range().to_vec();
                staging.unmap();
                Some(data)
            }
            _ => None,
        }
    }

    /// Read `dst.len()` bytes at `offset`. Blocks until the copy completes.
    pub fn read(&self, offset: u64, dst: &mut [u8]) -> bool {
        if !self.in_bounds(offset, dst.len()) {
            return false;
        }
        if dst.is_empty() {
            return true;
        }
        let start = align_down(offset);
        let end = align_up(offset + dst.len() as u64);
        let Some(window) = self.read_aligned(start, end) else {
            return false;
        };
        let skip = (offset - start) as usize;
        dst.copy_from_slice(&window[skip..skip + dst.len()]);
        true
    }

    /// Write `src` at `offset`. Unaligned ranges are widened with a read-modify-write.
    pub fn write(&self, offset: u64, src: &[u8]) -> bool {
        if !self.in_bounds(offset, src.len()) {
            return false;
        }
        if src.is_empty() {
            return true;
        }
        let len = src.len() as u64;
        if offset % ALIGN == 0 && len % ALIGN == 0 {
            self.ctx.queue.write_buffer(&self.buffer, offset, src);
        } else {
            let start = align_down(offset);
            let end = align_up(offset + len);
            let Some(mut window) = self.read_aligned(start, end) else {
                return false;
            };
            let skip = (offset - start) as usize;
            window[skip..skip + src.len()].copy_from_slice(src);
            self.ctx.queue.write_buffer(&self.buffer, start, &window);
        }
        self.ctx.queue.submit(std::iter::empty());
        self.ctx.device.poll(wgpu::Maintain::Wait);
        true
    }
}
