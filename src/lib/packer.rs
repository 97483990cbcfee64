//! # Kernel argument packing
//!
//! AMDGPU kernels receive their arguments as one contiguous buffer handed to
//! `hipModuleLaunchKernel` through its `extra` parameter. The buffer layout
//! follows the kernel ABI: arguments are laid out in formal-parameter order,
//! and an argument is moved to the next 32-byte boundary when it would
//! otherwise straddle one (small arguments) or start off-boundary (arguments
//! of 32 bytes or more).
//!
//! The layout depends on argument order, not only on the sizes, so callers
//! must pass arguments exactly in the kernel's parameter order.
//!
//! [`ArgLayout::compute`] is the only offset walk. Both the size query and the
//! copy go through it, so the allocated size and the bytes written can never
//! disagree.

use std::collections::TryReserveError;

use bytemuck::Pod;
use serde::Serialize;
use thiserror::Error;

/// Alignment boundary of the kernel argument ABI.
pub const ARG_ALIGN: usize = 32;

/// Errors that can occur while packing arguments.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PackError {
    #[error("destination holds {len} bytes, packed arguments need {required}")]
    DestinationTooSmall { len: usize, required: usize },
    #[error("failed to allocate {size} bytes for packed arguments")]
    Allocation { size: usize },
    #[error("packed size overflows usize at argument {index} ({size} bytes after offset {offset})")]
    SizeOverflow {
        index: usize,
        offset: usize,
        size: usize,
    },
}

/// Borrowed view of one kernel argument's raw bytes.
///
/// The view never owns or copies the caller's memory; bytes are read only
/// when the argument is packed.
#[derive(Copy, Clone, Debug)]
pub struct KernelArg<'a> {
    bytes: &'a [u8],
}

impl<'a> KernelArg<'a> {
    /// Argument from raw bytes.
    pub fn from_bytes(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    /// Argument from a plain value (scalar, device pointer, `#[repr(C)]` struct).
    pub fn from_pod<T: Pod>(value: &'a T) -> Self {
        Self {
            bytes: bytemuck::bytes_of(value),
        }
    }

    /// Argument passed by value as an inline array.
    pub fn from_slice<T: Pod>(values: &'a [T]) -> Self {
        Self {
            bytes: bytemuck::cast_slice(values),
        }
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Placement of one argument inside the packed buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ArgSlot {
    pub offset: usize,
    pub size: usize,
}

/// Result of the offset walk over an ordered list of argument sizes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ArgLayout {
    slots: Vec<ArgSlot>,
    total: usize,
}

fn align_up(byte_cnt: usize) -> Option<usize> {
    byte_cnt.checked_add(ARG_ALIGN - byte_cnt % ARG_ALIGN)
}

/// Offset at which an argument of `size` bytes lands when the running offset
/// is `byte_cnt`. None if padding would overflow.
fn place(byte_cnt: usize, size: usize) -> Option<usize> {
    let rem = byte_cnt % ARG_ALIGN;
    if size < ARG_ALIGN {
        // Same residue as (byte_cnt + size) % ARG_ALIGN
        let end = (rem + size) % ARG_ALIGN;
        if end > rem || end == 0 {
            Some(byte_cnt)
        } else {
            align_up(byte_cnt)
        }
    } else if rem != 0 {
        align_up(byte_cnt)
    } else {
        Some(byte_cnt)
    }
}

impl ArgLayout {
    /// Walk `sizes` in order and record where each argument lands.
    ///
    /// Fails with [`PackError::SizeOverflow`] if an offset or the total does
    /// not fit in `usize`.
    pub fn compute<I>(sizes: I) -> Result<Self, PackError>
    where
        I: IntoIterator<Item = usize>,
    {
        let mut slots = Vec::new();
        let mut byte_cnt: usize = 0;
        for (index, size) in sizes.into_iter().enumerate() {
            let overflow = PackError::SizeOverflow {
                index,
                offset: byte_cnt,
                size,
            };
            let offset = place(byte_cnt, size).ok_or_else(|| overflow.clone())?;
            byte_cnt = offset.checked_add(size).ok_or(overflow)?;
            slots.push(ArgSlot { offset, size });
        }
        Ok(Self {
            slots,
            total: byte_cnt,
        })
    }

    /// Layout for a list of argument views.
    pub fn for_args(args: &[KernelArg<'_>]) -> Result<Self, PackError> {
        Self::compute(args.iter().map(KernelArg::len))
    }

    pub fn slots(&self) -> &[ArgSlot] {
        &self.slots
    }

    pub fn offsets(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots.iter().map(|slot| slot.offset)
    }

    /// Total packed size in bytes, padding included.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Bytes spent on padding.
    pub fn padding(&self) -> usize {
        self.total - self.slots.iter().map(|slot| slot.size).sum::<usize>()
    }
}

/// Total packed size of arguments with the given sizes, in order.
pub fn compute_packed_size<I>(sizes: I) -> Result<usize, PackError>
where
    I: IntoIterator<Item = usize>,
{
    ArgLayout::compute(sizes).map(|layout| layout.total())
}

/// Copy every argument to its offset in `dest`.
///
/// Padding bytes are left untouched. Returns the number of bytes the packed
/// arguments span, which equals [`compute_packed_size`] for the same sizes.
pub fn pack(args: &[KernelArg<'_>], dest: &mut [u8]) -> Result<usize, PackError> {
    let layout = ArgLayout::for_args(args)?;
    write_args(args, &layout, dest)?;
    Ok(layout.total())
}

fn write_args(
    args: &[KernelArg<'_>],
    layout: &ArgLayout,
    dest: &mut [u8],
) -> Result<(), PackError> {
    if dest.len() < layout.total() {
        return Err(PackError::DestinationTooSmall {
            len: dest.len(),
            required: layout.total(),
        });
    }
    for (arg, slot) in args.iter().zip(layout.slots()) {
        dest[slot.offset..slot.offset + slot.size].copy_from_slice(arg.as_bytes());
    }
    Ok(())
}

/// Owned, zero-padded argument buffer for one launch.
///
/// Allocated per launch and released when dropped; buffers are never pooled.
#[derive(Debug)]
pub struct PackedArgs {
    buf: Vec<u8>,
    layout: ArgLayout,
}

impl PackedArgs {
    /// Allocate exactly the packed size and pack `args` into it.
    pub fn pack(args: &[KernelArg<'_>]) -> Result<Self, PackError> {
        let layout = ArgLayout::for_args(args)?;
        let mut buf = alloc_zeroed(layout.total())?;
        write_args(args, &layout, &mut buf)?;
        Ok(Self { buf, layout })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn layout(&self) -> &ArgLayout {
        &self.layout
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

fn alloc_zeroed(size: usize) -> Result<Vec<u8>, PackError> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(size)
        .map_err(|_: TryReserveError| PackError::Allocation { size })?;
    buf.resize(size, 0);
    Ok(buf)
}

#[cfg(test)]
thread_local! {
    /// Number of `PackedArgs` dropped on this thread.
    pub(crate) static RELEASED: std::cell::Cell<usize> = const { std::cell::Cell::new(0) };
}

#[cfg(test)]
impl Drop for PackedArgs {
    fn drop(&mut self) {
        RELEASED.with(|released| released.set(released.get() + 1));
    }
}
