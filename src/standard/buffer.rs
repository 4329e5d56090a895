//! Typed device buffers, views and page-locked host memory.

use std::marker::PhantomData;

use crate::backend::DeviceFeatures;
use crate::driver::MemHandle;
use crate::error::Result as UclResult;
use crate::ir::ScalarKind;

use super::accelerator::Accelerator;
use super::event::Event;
use super::stream::Stream;

/// Preferred allocation alignment across supported devices; individual
/// element alignment is always a divisor of it.
const PREFERRED_ALIGN: usize = 256;

/// An error related to buffers, views or transfers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MemoryError {
    #[error("invalid view: {detail}")]
    InvalidView { detail: String },
    #[error("lifetime violation: {detail}")]
    LifetimeViolation { detail: String },
    #[error("transfer failed: {detail}")]
    TransferFailed { detail: String },
    #[error("alignment violation: {detail}")]
    AlignmentViolation { detail: String },
}

/// Memory layout of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemLayout {
    /// Contiguous elements at the device's preferred alignment.
    Dense,
    /// Elements spaced by a caller-supplied stride.
    Strided,
    /// Page-locked host mirror: addressable from host and device.
    PageLocked,
}

/// Element types storable in device buffers.
///
/// Covers the scalar kinds every backend understands. `Pod` guarantees
/// a stable bit-for-bit host representation, which keeps round trips
/// exact for the integer and bit-preserving float types.
pub trait UclPrm:
    bytemuck::Pod + std::fmt::Debug + Default + PartialEq + Send + Sync + 'static
{
    const KIND: ScalarKind;
}

macro_rules! impl_ucl_prm {
    ($($t:ty => $kind:ident),* $(,)?) => {
        $(impl UclPrm for $t {
            const KIND: ScalarKind = ScalarKind::$kind;
        })*
    };
}

impl_ucl_prm! {
    i8 => I8, i16 => I16, i32 => I32, i64 => I64,
    u8 => U8, u16 => U16, u32 => U32, u64 => U64,
    f32 => F32, f64 => F64,
    half::f16 => F16, half::bf16 => BF16,
}

/// A typed, length-fixed allocation on one accelerator.
///
/// Created through [`BufferBuilder`]; destroyed when dropped or
/// explicitly via [`dispose`](Buffer::dispose), which drains in-flight
/// ordered work first. The owning accelerator is held alive for the
/// buffer's whole lifetime and cannot be disposed before it.
#[derive(Debug)]
pub struct Buffer<T: UclPrm> {
    mem: MemHandle,
    len: usize,
    layout: MemLayout,
    accel: Accelerator,
    generation: u64,
    registry_key: u64,
    released: bool,
    _pd: PhantomData<T>,
}

impl<T: UclPrm> Buffer<T> {
    /// Returns a new [`BufferBuilder`].
    pub fn builder() -> BufferBuilder<T> {
        BufferBuilder::new()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn size_bytes(&self) -> usize {
        self.len * std::mem::size_of::<T>()
    }

    pub fn layout(&self) -> MemLayout {
        self.layout
    }

    pub fn accelerator(&self) -> &Accelerator {
        &self.accel
    }

    /// Monotonic creation stamp within the owning accelerator.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn mem(&self) -> &MemHandle {
        &self.mem
    }

    /// Returns a command builder reading into `dst`.
    pub fn read<'b>(&'b self, dst: &'b mut [T]) -> BufferReadCmd<'b, T> {
        BufferReadCmd {
            buf: self,
            dst,
            offset: 0,
            stream: None,
        }
    }

    /// Returns a command builder writing from `src`.
    pub fn write<'b>(&'b self, src: &'b [T]) -> BufferWriteCmd<'b, T> {
        BufferWriteCmd {
            buf: self,
            src,
            offset: 0,
            stream: None,
        }
    }

    /// Returns a command builder copying this buffer into `dst`.
    ///
    /// When both buffers live on devices of one driver the copy stays
    /// on-device; otherwise it is staged through a host bounce buffer,
    /// observable only in timing.
    pub fn copy_to<'b>(&'b self, dst: &'b Buffer<T>) -> BufferCopyCmd<'b, T> {
        BufferCopyCmd {
            src: self,
            dst,
            src_offset: 0,
            dst_offset: 0,
            len: None,
        }
    }

    /// Fills the whole buffer with `val`, synchronously.
    pub fn fill(&self, val: T) -> UclResult<()> {
        let pattern = vec![val; self.len];
        self.write(&pattern).enq()
    }

    /// A borrowed sub-range with its own stride. Views never own.
    pub fn view(&self, offset: usize, len: usize) -> UclResult<BufferView<'_, T>> {
        self.view_strided(offset, len, 1)
    }

    pub fn view_strided(
        &self,
        offset: usize,
        len: usize,
        stride: usize,
    ) -> UclResult<BufferView<'_, T>> {
        if stride == 0 {
            return Err(MemoryError::InvalidView {
                detail: "view stride must be non-zero".to_owned(),
            }
            .into());
        }
        let span = offset + len.saturating_sub(1) * stride + usize::from(len > 0);
        if span > self.len {
            return Err(MemoryError::InvalidView {
                detail: format!(
                    "view of {} elements (stride {}) at offset {} exceeds buffer length {}",
                    len, stride, offset, self.len
                ),
            }
            .into());
        }
        Ok(BufferView {
            buf: self,
            offset,
            len,
            stride,
        })
    }

    /// Releases the buffer, draining any ordered work still in flight
    /// on the accelerator's default stream.
    pub fn dispose(mut self) -> UclResult<()> {
        self.release()
    }

    fn release(&mut self) -> UclResult<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.accel.default_stream().finish()?;
        self.accel
            .driver()
            .free(self.accel.device_id(), &self.mem);
        self.accel.unregister_buffer(self.registry_key);
        Ok(())
    }
}

impl<T: UclPrm> Drop for Buffer<T> {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            log::warn!("buffer release on drop failed: {}", err);
        }
    }
}

/// A builder for [`Buffer`].
#[must_use = "builders do nothing unless '::build' is called"]
#[derive(Debug)]
pub struct BufferBuilder<T: UclPrm> {
    accel: Option<Accelerator>,
    len: usize,
    layout: MemLayout,
    fill_val: Option<T>,
}

impl<T: UclPrm> BufferBuilder<T> {
    pub fn new() -> BufferBuilder<T> {
        BufferBuilder {
            accel: None,
            len: 0,
            layout: MemLayout::Dense,
            fill_val: None,
        }
    }

    /// The accelerator that will own the allocation. Required.
    pub fn accelerator(mut self, accel: &Accelerator) -> BufferBuilder<T> {
        self.accel = Some(accel.clone());
        self
    }

    /// Element count. Required, non-zero.
    pub fn len(mut self, len: usize) -> BufferBuilder<T> {
        self.len = len;
        self
    }

    pub fn layout(mut self, layout: MemLayout) -> BufferBuilder<T> {
        self.layout = layout;
        self
    }

    /// Fills the new buffer with `val` before returning it.
    pub fn fill_val(mut self, val: T) -> BufferBuilder<T> {
        self.fill_val = Some(val);
        self
    }

    pub fn build(self) -> UclResult<Buffer<T>> {
        let accel = self.accel.ok_or_else(|| MemoryError::InvalidView {
            detail: "buffer builder requires an accelerator".to_owned(),
        })?;
        if self.len == 0 {
            return Err(MemoryError::InvalidView {
                detail: "buffer length must be non-zero".to_owned(),
            }
            .into());
        }
        if self.layout == MemLayout::PageLocked
            && !accel
                .caps()
                .features
                .contains(DeviceFeatures::PAGE_LOCKED)
        {
            return Err(MemoryError::AlignmentViolation {
                detail: format!(
                    "accelerator {} does not support page-locked host mirrors",
                    accel.label()
                ),
            }
            .into());
        }
        accel.ensure_usable()?;

        let align = PREFERRED_ALIGN.max(std::mem::align_of::<T>());
        let bytes = self.len * std::mem::size_of::<T>();
        let mem = accel.driver().alloc(accel.device_id(), bytes, align)?;
        let registry_key = accel.register_buffer(bytes);
        let buffer = Buffer {
            mem,
            len: self.len,
            layout: self.layout,
            generation: accel.next_generation(),
            registry_key,
            accel,
            released: false,
            _pd: PhantomData,
        };
        if let Some(val) = self.fill_val {
            buffer.fill(val)?;
        }
        Ok(buffer)
    }
}

impl<T: UclPrm> Default for BufferBuilder<T> {
    fn default() -> BufferBuilder<T> {
        BufferBuilder::new()
    }
}

//=============================================================================
//================================ COMMANDS ===================================
//=============================================================================

/// A buffer read command: device → host.
#[must_use = "commands do nothing unless enqueued"]
pub struct BufferReadCmd<'b, T: UclPrm> {
    buf: &'b Buffer<T>,
    dst: &'b mut [T],
    offset: usize,
    stream: Option<&'b Stream>,
}

impl<'b, T: UclPrm> BufferReadCmd<'b, T> {
    /// Element offset into the buffer.
    pub fn offset(mut self, offset: usize) -> BufferReadCmd<'b, T> {
        self.offset = offset;
        self
    }

    /// Orders this read after prior work on `stream` instead of the
    /// accelerator's default stream.
    pub fn queue(mut self, stream: &'b Stream) -> BufferReadCmd<'b, T> {
        self.stream = Some(stream);
        self
    }

    /// Executes the read, blocking until the bytes are in `dst`. The
    /// read observes everything previously submitted to the stream.
    pub fn enq(self) -> UclResult<()> {
        check_range(self.buf, self.offset, self.dst.len())?;
        self.buf.accel.ensure_usable()?;
        let stream = self.stream.unwrap_or_else(|| self.buf.accel.default_stream());
        stream.finish()?;
        self.buf.accel.driver().read(
            self.buf.accel.device_id(),
            self.buf.mem(),
            self.offset * std::mem::size_of::<T>(),
            bytemuck::cast_slice_mut(self.dst),
        )
    }
}

/// A buffer write command: host → device.
#[must_use = "commands do nothing unless enqueued"]
pub struct BufferWriteCmd<'b, T: UclPrm> {
    buf: &'b Buffer<T>,
    src: &'b [T],
    offset: usize,
    stream: Option<&'b Stream>,
}

impl<'b, T: UclPrm> BufferWriteCmd<'b, T> {
    pub fn offset(mut self, offset: usize) -> BufferWriteCmd<'b, T> {
        self.offset = offset;
        self
    }

    pub fn queue(mut self, stream: &'b Stream) -> BufferWriteCmd<'b, T> {
        self.stream = Some(stream);
        self
    }

    /// Executes the write, blocking until the device holds the bytes.
    pub fn enq(self) -> UclResult<()> {
        check_range(self.buf, self.offset, self.src.len())?;
        self.buf.accel.ensure_usable()?;
        let stream = self.stream.unwrap_or_else(|| self.buf.accel.default_stream());
        stream.finish()?;
        self.buf.accel.driver().write(
            self.buf.accel.device_id(),
            self.buf.mem(),
            self.offset * std::mem::size_of::<T>(),
            bytemuck::cast_slice(self.src),
        )
    }

    /// Submits the write as a non-blocking stream operation; the source
    /// bytes are captured eagerly.
    pub fn enq_async(self) -> UclResult<Event> {
        check_range(self.buf, self.offset, self.src.len())?;
        self.buf.accel.ensure_usable()?;
        let stream = self.stream.unwrap_or_else(|| self.buf.accel.default_stream());
        let bytes: Vec<u8> = bytemuck::cast_slice(self.src).to_vec();
        let driver = std::sync::Arc::clone(self.buf.accel.driver());
        let dev = self.buf.accel.device_id();
        let mem = self.buf.mem().clone();
        let byte_offset = self.offset * std::mem::size_of::<T>();
        stream.submit(move || driver.write(dev, &mem, byte_offset, &bytes))
    }
}

/// A device → device copy command.
#[must_use = "commands do nothing unless enqueued"]
pub struct BufferCopyCmd<'b, T: UclPrm> {
    src: &'b Buffer<T>,
    dst: &'b Buffer<T>,
    src_offset: usize,
    dst_offset: usize,
    len: Option<usize>,
}

impl<'b, T: UclPrm> BufferCopyCmd<'b, T> {
    pub fn src_offset(mut self, offset: usize) -> BufferCopyCmd<'b, T> {
        self.src_offset = offset;
        self
    }

    pub fn dst_offset(mut self, offset: usize) -> BufferCopyCmd<'b, T> {
        self.dst_offset = offset;
        self
    }

    pub fn len(mut self, len: usize) -> BufferCopyCmd<'b, T> {
        self.len = Some(len);
        self
    }

    /// Executes the copy, blocking until the destination holds the
    /// bytes. Without direct peer access the copy bounces through a
    /// host staging buffer.
    pub fn enq(self) -> UclResult<()> {
        let len = self.len.unwrap_or(self.src.len());
        check_range(self.src, self.src_offset, len)?;
        check_range(self.dst, self.dst_offset, len)?;
        self.src.accel.ensure_usable()?;
        self.dst.accel.ensure_usable()?;
        self.src.accel.default_stream().finish()?;
        self.dst.accel.default_stream().finish()?;

        let bytes = len * std::mem::size_of::<T>();
        let src_off = self.src_offset * std::mem::size_of::<T>();
        let dst_off = self.dst_offset * std::mem::size_of::<T>();
        let same_driver = std::sync::Arc::ptr_eq(self.src.accel.driver(), self.dst.accel.driver());
        if same_driver {
            self.src.accel.driver().copy(
                self.src.accel.device_id(),
                self.src.mem(),
                src_off,
                self.dst.mem(),
                dst_off,
                bytes,
            )
        } else {
            // Pinned staging bounce; correctness-neutral.
            let mut staged = vec![0u8; bytes];
            self.src.accel.driver().read(
                self.src.accel.device_id(),
                self.src.mem(),
                src_off,
                &mut staged,
            )?;
            self.dst.accel.driver().write(
                self.dst.accel.device_id(),
                self.dst.mem(),
                dst_off,
                &staged,
            )
        }
    }
}

fn check_range<T: UclPrm>(buf: &Buffer<T>, offset: usize, len: usize) -> UclResult<()> {
    if offset + len > buf.len() {
        return Err(MemoryError::InvalidView {
            detail: format!(
                "range of {} elements at offset {} exceeds buffer length {}",
                len,
                offset,
                buf.len()
            ),
        }
        .into());
    }
    Ok(())
}

//=============================================================================
//================================== VIEWS ====================================
//=============================================================================

/// A non-owning sub-range of a buffer with its own stride.
///
/// Borrowing the buffer makes a view of a disposed buffer unrepresentable.
#[derive(Debug, Clone, Copy)]
pub struct BufferView<'b, T: UclPrm> {
    buf: &'b Buffer<T>,
    offset: usize,
    len: usize,
    stride: usize,
}

impl<'b, T: UclPrm> BufferView<'b, T> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn buffer(&self) -> &'b Buffer<T> {
        self.buf
    }

    /// Reads the viewed elements into `dst`.
    pub fn read_into(&self, dst: &mut [T]) -> UclResult<()> {
        if dst.len() != self.len {
            return Err(MemoryError::InvalidView {
                detail: format!(
                    "destination holds {} elements, view holds {}",
                    dst.len(),
                    self.len
                ),
            }
            .into());
        }
        if self.stride == 1 {
            return self.buf.read(dst).offset(self.offset).enq();
        }
        // Strided gather through a dense staging read.
        let span = self.offset + (self.len - 1) * self.stride + 1;
        let mut staged = vec![T::default(); span];
        self.buf.read(&mut staged).enq()?;
        for (i, slot) in dst.iter_mut().enumerate() {
            *slot = staged[self.offset + i * self.stride];
        }
        Ok(())
    }

    /// Writes `src` over the viewed elements.
    pub fn write_from(&self, src: &[T]) -> UclResult<()> {
        if src.len() != self.len {
            return Err(MemoryError::InvalidView {
                detail: format!(
                    "source holds {} elements, view holds {}",
                    src.len(),
                    self.len
                ),
            }
            .into());
        }
        if self.stride == 1 {
            return self.buf.write(src).offset(self.offset).enq();
        }
        let span = self.offset + (self.len - 1) * self.stride + 1;
        let mut staged = vec![T::default(); span];
        self.buf.read(&mut staged).enq()?;
        for (i, &val) in src.iter().enumerate() {
            staged[self.offset + i * self.stride] = val;
        }
        self.buf.write(&staged).enq()
    }
}

//=============================================================================
//============================== PAGE LOCKING =================================
//=============================================================================

/// A scope wrapping externally pinned host storage.
///
/// Ownership of the storage stays with the caller; the guard registers
/// with the accelerator for its own lifetime and the borrow checker
/// enforces that it is dropped before the storage is.
#[derive(Debug)]
pub struct PinnedGuard<'h, T: UclPrm> {
    data: &'h mut [T],
    accel: Accelerator,
    registry_key: u64,
}

impl Accelerator {
    /// Wraps caller-pinned host storage for zero-copy access.
    pub fn pin_host<'h, T: UclPrm>(
        &self,
        data: &'h mut [T],
    ) -> UclResult<PinnedGuard<'h, T>> {
        self.ensure_usable()?;
        if !self.caps().features.contains(DeviceFeatures::PAGE_LOCKED) {
            return Err(MemoryError::AlignmentViolation {
                detail: format!(
                    "accelerator {} does not support page-locked host memory",
                    self.label()
                ),
            }
            .into());
        }
        let registry_key = self.register_buffer(std::mem::size_of_val(data));
        Ok(PinnedGuard {
            data,
            accel: self.clone(),
            registry_key,
        })
    }
}

impl<'h, T: UclPrm> PinnedGuard<'h, T> {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Host-side zero-copy access.
    pub fn as_slice(&self) -> &[T] {
        self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        self.data
    }

    /// Copies the pinned contents into a device buffer.
    pub fn upload(&self, dst: &Buffer<T>) -> UclResult<()> {
        dst.write(self.data).enq()
    }

    /// Copies a device buffer into the pinned storage.
    pub fn download(&mut self, src: &Buffer<T>) -> UclResult<()> {
        src.read(self.data).enq()
    }
}

impl<'h, T: UclPrm> Drop for PinnedGuard<'h, T> {
    fn drop(&mut self) {
        self.accel.unregister_buffer(self.registry_key);
    }
}
