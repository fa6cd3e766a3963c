//! Device buffers and host transfer.
//!
//! This module defines a [`Buffer`] wrapper around [`wgpu::Buffer`]
//! that owns one device allocation and moves bytes between it and host
//! memory.  Every allocation carries `STORAGE | UNIFORM | COPY_DST |
//! COPY_SRC` usage so the same buffer can be written, bound to a
//! kernel, and read back.  Reads go through a transient `MAP_READ`
//! staging buffer: the copy is encoded and submitted on the calling
//! thread (which keeps queue order equal to call order), and the wait,
//! map and memcpy either happen in place ([`Buffer::read_sync`]) or on
//! a worker thread ([`Buffer::read_async`]).
//!
//! wgpu copies move whole 4-byte words.  Writes whose length is not a
//! multiple of four are zero padded, read offsets must be aligned to
//! four bytes, and reads round their device copy up to a whole word
//! before truncating the result to the requested length.

use std::mem::size_of;
use std::sync::Arc;

use bytemuck::{cast_slice, cast_slice_mut, Pod};
use futures::channel::oneshot;
use parking_lot::Mutex;
use wgpu::util::align_to;
use wgpu::{BufferDescriptor, BufferUsages, Device, COPY_BUFFER_ALIGNMENT};

use crate::completion::{self, Completion};
use crate::error::{Error, Result};
use crate::Context;

/// The slot a buffer's allocation lives in.  Compute shaders share it
/// so they always bind whatever allocation the buffer currently owns.
pub(crate) type SharedAllocation = Arc<Mutex<Option<wgpu::Buffer>>>;

/// Usage flags of every device allocation.
pub const BUFFER_USAGE: BufferUsages = BufferUsages::STORAGE
    .union(BufferUsages::UNIFORM)
    .union(BufferUsages::COPY_DST)
    .union(BufferUsages::COPY_SRC);

/// A device-resident allocation with host transfer.
///
/// The buffer borrows the [`Context`] it was created from; it cannot
/// outlive it.  A buffer made with [`Buffer::new`] has no allocation
/// until the first [`Buffer::write`] or [`Buffer::create_or_resize`].
pub struct Buffer<'ctx> {
    context: &'ctx Context,
    allocation: SharedAllocation,
    len: u64,
}

impl<'ctx> Buffer<'ctx> {
    /// A buffer with no device allocation yet.
    pub fn new(context: &'ctx Context) -> Self {
        Self {
            context,
            allocation: Arc::new(Mutex::new(None)),
            len: 0,
        }
    }

    /// A buffer with room for `byte_size` bytes.  Contents are whatever
    /// the backend initialises new allocations with.
    pub fn with_size(context: &'ctx Context, byte_size: u64) -> Result<Self> {
        let mut buffer = Self::new(context);
        buffer.create_or_resize(byte_size)?;
        Ok(buffer)
    }

    /// A buffer sized for `count` elements of `T`.
    pub fn with_elements<T: Pod>(context: &'ctx Context, count: usize) -> Result<Self> {
        let byte_size = count
            .checked_mul(size_of::<T>())
            .and_then(|n| u64::try_from(n).ok())
            .ok_or_else(|| Error::Allocation {
                size: u64::MAX,
                reason: format!("{count} elements of {} bytes overflow the address space", size_of::<T>()),
            })?;
        Self::with_size(context, byte_size)
    }

    /// A buffer initialised with the contents of `data`.
    pub fn from_slice<T: Pod>(context: &'ctx Context, data: &[T]) -> Result<Self> {
        let mut buffer = Self::new(context);
        buffer.write_slice(data)?;
        Ok(buffer)
    }

    /// Bytes last written or requested.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size of the current device allocation in bytes, zero when there
    /// is none.
    pub fn capacity(&self) -> u64 {
        self.allocation.lock().as_ref().map_or(0, wgpu::Buffer::size)
    }

    pub fn is_allocated(&self) -> bool {
        self.allocation.lock().is_some()
    }

    pub(crate) fn shared(&self) -> SharedAllocation {
        Arc::clone(&self.allocation)
    }

    /// Allocates room for `byte_size` bytes, releasing any previous
    /// allocation first.  Previous contents are not preserved.  On
    /// failure the buffer is left without an allocation.
    pub fn create_or_resize(&mut self, byte_size: u64) -> Result<()> {
        self.allocate(byte_size)
            .inspect_err(|e| log::error!("buffer allocation failed: {e}"))
    }

    fn allocate(&mut self, byte_size: u64) -> Result<()> {
        let size = align_to(byte_size.max(1), COPY_BUFFER_ALIGNMENT);
        let mut slot = self.allocation.lock();
        if let Some(previous) = slot.take() {
            previous.destroy();
        }
        self.len = 0;
        let (buffer, error) = self.context.scoped(|device| {
            device.create_buffer(&BufferDescriptor {
                label: Some("minigpu_buffer"),
                size,
                usage: BUFFER_USAGE,
                mapped_at_creation: false,
            })
        });
        if let Some(error) = error {
            buffer.destroy();
            return Err(Error::Allocation { size, reason: error.to_string() });
        }
        log::debug!("allocated {size}-byte device buffer");
        *slot = Some(buffer);
        self.len = byte_size;
        Ok(())
    }

    /// Copies `data` to the start of the buffer, growing the allocation
    /// first when it is missing or too small.
    ///
    /// The copy is enqueued before this returns and is ordered before
    /// any work submitted afterwards, but it is not waited on.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.write_bytes(data)
            .inspect_err(|e| log::error!("buffer write failed: {e}"))
    }

    /// Typed form of [`Buffer::write`].
    pub fn write_slice<T: Pod>(&mut self, data: &[T]) -> Result<()> {
        self.write(cast_slice(data))
    }

    fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        let byte_size = data.len() as u64;
        if byte_size == 0 {
            return Ok(());
        }
        if self.capacity() < byte_size {
            self.allocate(byte_size)?;
        }
        let slot = self.allocation.lock();
        let buffer = slot.as_ref().ok_or(Error::Unallocated)?;
        let padded;
        let bytes = if byte_size % COPY_BUFFER_ALIGNMENT == 0 {
            data
        } else {
            let mut v = data.to_vec();
            v.resize(align_to(byte_size, COPY_BUFFER_ALIGNMENT) as usize, 0);
            padded = v;
            &padded
        };
        let ((), error) = self.context.scoped(|_| self.context.queue().write_buffer(buffer, 0, bytes));
        if let Some(error) = error {
            return Err(Error::Submission(error.to_string()));
        }
        drop(slot);
        self.len = byte_size;
        Ok(())
    }

    /// Copies `out.len()` bytes starting at `offset` into `out`, blocking
    /// until the device has finished every earlier submission and the
    /// data has been mapped.
    pub fn read_sync(&self, out: &mut [u8], offset: u64) -> Result<()> {
        self.read_into(out, offset)
            .inspect_err(|e| log::error!("synchronous buffer read failed: {e}"))
    }

    fn read_into(&self, out: &mut [u8], offset: u64) -> Result<()> {
        let Some(staging) = self.stage(out.len() as u64, offset)? else {
            return Ok(());
        };
        map_staging(self.context.device(), &staging, out)
    }

    /// Typed form of [`Buffer::read_sync`].  `offset` is in bytes.
    pub fn read_slice<T: Pod>(&self, out: &mut [T], offset: u64) -> Result<()> {
        self.read_sync(cast_slice_mut(out), offset)
    }

    /// Reads the whole written length of the buffer as elements of `T`.
    pub fn to_vec<T: Pod>(&self) -> Result<Vec<T>> {
        let mut out = vec![T::zeroed(); self.len as usize / size_of::<T>()];
        self.read_slice(&mut out, 0)?;
        Ok(out)
    }

    /// Starts a read of `byte_size` bytes at `offset` and returns without
    /// waiting for it.  The copy is submitted before this returns; the
    /// wait, map and copy into host memory run on a worker thread, and
    /// the handle resolves only once the returned vector is complete.
    pub fn read_async(&self, byte_size: u64, offset: u64) -> Result<Completion<Vec<u8>>> {
        let (device, staging) = self.begin_async_read(byte_size, offset)?;
        completion::spawn("readback", move || finish_async_read(&device, staging, byte_size))
    }

    /// Like [`Buffer::read_async`], but hands the result to `on_complete`
    /// on the worker thread.  The callback runs exactly once.
    pub fn read_async_with<F>(&self, byte_size: u64, offset: u64, on_complete: F) -> Result<()>
    where
        F: FnOnce(Result<Vec<u8>>) + Send + 'static,
    {
        let (device, staging) = self.begin_async_read(byte_size, offset)?;
        completion::spawn_with("readback", move || finish_async_read(&device, staging, byte_size), on_complete)
    }

    fn begin_async_read(&self, byte_size: u64, offset: u64) -> Result<(Device, Option<wgpu::Buffer>)> {
        let staging = self
            .stage(byte_size, offset)
            .inspect_err(|e| log::error!("asynchronous buffer read failed: {e}"))?;
        Ok((self.context.device().clone(), staging))
    }

    /// Copies this buffer's written bytes into `dst`, growing `dst` if
    /// needed.  Both buffers must come from the same context.
    pub fn copy_to(&self, dst: &mut Buffer<'_>) -> Result<()> {
        self.copy_into(dst)
            .inspect_err(|e| log::error!("buffer copy failed: {e}"))
    }

    fn copy_into(&self, dst: &mut Buffer<'_>) -> Result<()> {
        let size = align_to(self.len, COPY_BUFFER_ALIGNMENT);
        if size == 0 {
            return Ok(());
        }
        if dst.capacity() < size {
            dst.allocate(size)?;
        }
        let src_slot = self.allocation.lock();
        let src = src_slot.as_ref().ok_or(Error::Unallocated)?;
        let dst_slot = dst.allocation.lock();
        let target = dst_slot.as_ref().ok_or(Error::Unallocated)?;
        let ((), error) = self.context.scoped(|device| {
            let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("minigpu_copy_encoder"),
            });
            encoder.copy_buffer_to_buffer(src, 0, target, 0, size);
            self.context.queue().submit([encoder.finish()]);
        });
        if let Some(error) = error {
            return Err(Error::Submission(error.to_string()));
        }
        drop(dst_slot);
        dst.len = self.len;
        Ok(())
    }

    /// Frees the device allocation.  Compute shaders this buffer is
    /// still bound to will refuse to dispatch until it is rebound.
    pub fn release(self) {
        if let Some(buffer) = self.allocation.lock().take() {
            log::debug!("releasing {}-byte device buffer", buffer.size());
            buffer.destroy();
        }
    }

    /// Checks the range, creates a staging buffer and submits the
    /// device-side copy into it.  `None` means there is nothing to read.
    fn stage(&self, byte_size: u64, offset: u64) -> Result<Option<wgpu::Buffer>> {
        let slot = self.allocation.lock();
        let source = slot.as_ref().ok_or(Error::Unallocated)?;
        if offset % COPY_BUFFER_ALIGNMENT != 0 {
            return Err(Error::Misaligned { offset, alignment: COPY_BUFFER_ALIGNMENT });
        }
        if byte_size == 0 {
            return Ok(None);
        }
        let copy_size = align_to(byte_size, COPY_BUFFER_ALIGNMENT);
        let capacity = source.size();
        let end = offset.saturating_add(copy_size);
        if end > capacity {
            return Err(Error::OutOfBounds { offset, end, capacity });
        }
        let (staging, error) = self.context.scoped(|device| {
            let staging = device.create_buffer(&BufferDescriptor {
                label: Some("minigpu_staging"),
                size: copy_size,
                usage: BufferUsages::COPY_DST | BufferUsages::MAP_READ,
                mapped_at_creation: false,
            });
            let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("minigpu_readback_encoder"),
            });
            encoder.copy_buffer_to_buffer(source, offset, &staging, 0, copy_size);
            self.context.queue().submit([encoder.finish()]);
            staging
        });
        if let Some(error) = error {
            staging.destroy();
            return Err(Error::Submission(error.to_string()));
        }
        Ok(Some(staging))
    }
}

fn finish_async_read(device: &Device, staging: Option<wgpu::Buffer>, byte_size: u64) -> Result<Vec<u8>> {
    let mut out = vec![0u8; byte_size as usize];
    if let Some(staging) = staging {
        map_staging(device, &staging, &mut out)?;
    }
    Ok(out)
}

/// Waits for the device, maps `staging` and copies its first
/// `out.len()` bytes into `out`.  The staging buffer is destroyed
/// afterwards, whether or not mapping succeeded.
fn map_staging(device: &Device, staging: &wgpu::Buffer, out: &mut [u8]) -> Result<()> {
    let result = map_and_copy(device, staging, out);
    staging.destroy();
    result
}

fn map_and_copy(device: &Device, staging: &wgpu::Buffer, out: &mut [u8]) -> Result<()> {
    let slice = staging.slice(..);
    let (sender, receiver) = oneshot::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = sender.send(result);
    });
    device.poll(wgpu::PollType::Wait)?;
    match pollster::block_on(receiver) {
        Ok(mapped) => mapped?,
        Err(oneshot::Canceled) => {
            return Err(Error::Submission("staging buffer mapping was abandoned".into()));
        }
    }
    {
        let data = slice.get_mapped_range();
        out.copy_from_slice(&data[..out.len()]);
    }
    staging.unmap();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_supports_transfer_and_binding() {
        assert!(BUFFER_USAGE.contains(BufferUsages::STORAGE));
        assert!(BUFFER_USAGE.contains(BufferUsages::COPY_DST));
        assert!(BUFFER_USAGE.contains(BufferUsages::COPY_SRC));
        assert!(!BUFFER_USAGE.contains(BufferUsages::MAP_READ));
    }

    #[test]
    fn sizes_round_up_to_copy_alignment() {
        assert_eq!(align_to(1u64, COPY_BUFFER_ALIGNMENT), 4);
        assert_eq!(align_to(400u64, COPY_BUFFER_ALIGNMENT), 400);
        assert_eq!(align_to(401u64, COPY_BUFFER_ALIGNMENT), 404);
    }
}
