//! Block descriptors and group validation.
//!
//! A [`BlockDescriptor`] describes one requested or tracked region: either a
//! linear (page-mode) byte range or a 2D tiled area with a pixel format.
//! Groups of descriptors are acquired and released as one atomic unit, so
//! validation happens over the whole group before any resource is touched.

use crate::address::{BackingAddress, VirtualAddress};
use crate::error::MemError;
use crate::geometry::{self, default_stride};

/// Maximum number of blocks in one buffer group.
pub const MAX_BLOCKS: usize = 16;

/// Pixel format of a tiled block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 8 bits per pixel.
    Bit8,
    /// 16 bits per pixel.
    Bit16,
    /// 32 bits per pixel.
    Bit32,
}

impl PixelFormat {
    /// Returns the number of bytes occupied by one pixel.
    #[inline]
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Bit8 => 1,
            Self::Bit16 => 2,
            Self::Bit32 => 4,
        }
    }
}

/// The kind of region an address or descriptor refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockKind {
    /// A linear (page-mode) region.
    Linear,
    /// A tiled region of 8-bit pixels.
    Tiled8,
    /// A tiled region of 16-bit pixels.
    Tiled16,
    /// A tiled region of 32-bit pixels.
    Tiled32,
}

impl BlockKind {
    /// Returns true for the tiled (2D) kinds.
    #[inline]
    pub const fn is_tiled(self) -> bool {
        !matches!(self, Self::Linear)
    }
}

/// Requested shape of one block.
///
/// A `None` stride means "use the computed default": no row structure for a
/// linear block, the page-padded row width for a tiled block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockGeometry {
    /// A 1D byte range.
    Linear {
        /// Length in bytes. Must be non-zero.
        length: usize,
        /// Optional explicit row stride; must evenly divide `length`.
        stride: Option<usize>,
    },
    /// A 2D pixel area.
    Tiled {
        /// Pixel format.
        format: PixelFormat,
        /// Width in pixels. Must be non-zero.
        width: usize,
        /// Height in pixels. Must be non-zero.
        height: usize,
        /// Optional explicit row stride; must equal the computed default.
        stride: Option<usize>,
    },
}

/// One requested or tracked region within a buffer group.
///
/// Before acquisition a descriptor carries only its geometry (and, for the
/// map path, the caller-supplied pointer). On success the manager back-fills
/// the backing address and the block's pointer within the group buffer; on
/// failure both are reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockDescriptor {
    pub(crate) geometry: BlockGeometry,
    pub(crate) backing: BackingAddress,
    pub(crate) ptr: Option<VirtualAddress>,
}

impl BlockDescriptor {
    /// Creates a linear block descriptor of `length` bytes.
    pub const fn linear(length: usize) -> Self {
        Self {
            geometry: BlockGeometry::Linear {
                length,
                stride: None,
            },
            backing: BackingAddress::NULL,
            ptr: None,
        }
    }

    /// Creates a linear block descriptor with an explicit row stride.
    pub const fn linear_with_stride(length: usize, stride: usize) -> Self {
        Self {
            geometry: BlockGeometry::Linear {
                length,
                stride: Some(stride),
            },
            backing: BackingAddress::NULL,
            ptr: None,
        }
    }

    /// Creates a linear block descriptor over caller-owned memory at `ptr`,
    /// for use with [`map`](crate::MemoryManager::map).
    pub const fn linear_at(ptr: VirtualAddress, length: usize) -> Self {
        Self {
            geometry: BlockGeometry::Linear {
                length,
                stride: None,
            },
            backing: BackingAddress::NULL,
            ptr: Some(ptr),
        }
    }

    /// Creates a tiled block descriptor of `width` x `height` pixels.
    pub const fn tiled(format: PixelFormat, width: usize, height: usize) -> Self {
        Self {
            geometry: BlockGeometry::Tiled {
                format,
                width,
                height,
                stride: None,
            },
            backing: BackingAddress::NULL,
            ptr: None,
        }
    }

    /// Returns the kind of region this descriptor describes.
    pub const fn kind(&self) -> BlockKind {
        match self.geometry {
            BlockGeometry::Linear { .. } => BlockKind::Linear,
            BlockGeometry::Tiled { format, .. } => match format {
                PixelFormat::Bit8 => BlockKind::Tiled8,
                PixelFormat::Bit16 => BlockKind::Tiled16,
                PixelFormat::Bit32 => BlockKind::Tiled32,
            },
        }
    }

    /// Returns the geometry this descriptor was built from.
    pub const fn geometry(&self) -> BlockGeometry {
        self.geometry
    }

    /// Returns the total byte size of this block.
    ///
    /// For a linear block this is its length; for a tiled block, the height
    /// times the default row stride.
    pub const fn size(&self) -> usize {
        match self.geometry {
            BlockGeometry::Linear { length, .. } => length,
            BlockGeometry::Tiled {
                format,
                width,
                height,
                ..
            } => height * default_stride(width * format.bytes_per_pixel()),
        }
    }

    /// Returns the effective row stride of this block.
    ///
    /// Zero for a linear block without row structure.
    pub const fn stride(&self) -> usize {
        match self.geometry {
            BlockGeometry::Linear { stride, .. } => match stride {
                Some(s) => s,
                None => 0,
            },
            BlockGeometry::Tiled {
                format,
                width,
                stride,
                ..
            } => match stride {
                Some(s) => s,
                None => default_stride(width * format.bytes_per_pixel()),
            },
        }
    }

    /// Returns the block's pointer within its group buffer, if acquired (or,
    /// before a map, the caller-supplied source pointer).
    pub const fn ptr(&self) -> Option<VirtualAddress> {
        self.ptr
    }

    /// Returns the backing-store address of this block.
    ///
    /// Null exactly when the block is not currently acquired.
    pub const fn backing(&self) -> BackingAddress {
        self.backing
    }

    /// Returns true if `addr` falls within this block's mapped range.
    pub(crate) fn contains(&self, addr: VirtualAddress) -> bool {
        match self.ptr {
            Some(base) => addr >= base && addr.as_usize() < base.as_usize() + self.size(),
            None => false,
        }
    }

    /// Clears the backing address and pointer, returning the descriptor to
    /// its unacquired state.
    pub(crate) fn reset(&mut self) {
        self.backing = BackingAddress::NULL;
        self.ptr = None;
    }

    /// Checks this descriptor's geometry, and its page alignment when the
    /// group policy requires it.
    fn validate(&self, must_be_page_sized: bool, index: usize) -> Result<(), MemError> {
        match self.geometry {
            BlockGeometry::Linear { length, stride } => {
                if length == 0 {
                    return Err(MemError::InvalidGeometry { index });
                }
                // An explicit stride must be non-zero and evenly divide the length.
                if let Some(stride) = stride {
                    if stride == 0 || length % stride != 0 {
                        return Err(MemError::InvalidGeometry { index });
                    }
                }
            }
            BlockGeometry::Tiled {
                format,
                width,
                height,
                stride,
            } => {
                if width == 0 || height == 0 {
                    return Err(MemError::InvalidGeometry { index });
                }
                // No custom 2D stride: an explicit stride must match the default.
                if let Some(stride) = stride {
                    if stride != default_stride(width * format.bytes_per_pixel()) {
                        return Err(MemError::InvalidGeometry { index });
                    }
                }
            }
        }

        if must_be_page_sized && !geometry::is_page_multiple(self.size()) {
            return Err(MemError::NotPageAligned { index });
        }

        Ok(())
    }
}

/// Returns the total byte size of a group buffer: the sum of each block's
/// size in descriptor order.
pub fn group_size(blocks: &[BlockDescriptor]) -> usize {
    blocks.iter().map(BlockDescriptor::size).sum()
}

/// Validates a group of descriptors before acquisition.
///
/// The first `num_page_sized` blocks must occupy whole pages. Descriptors
/// must be fresh: any block that already carries a backing address fails the
/// whole group. The first failing block aborts the check, reporting its
/// index.
pub(crate) fn validate_group(
    blocks: &[BlockDescriptor],
    num_page_sized: usize,
) -> Result<(), MemError> {
    if blocks.is_empty() {
        return Err(MemError::TooFewBlocks);
    }
    if blocks.len() > MAX_BLOCKS {
        return Err(MemError::TooManyBlocks);
    }

    for (index, block) in blocks.iter().enumerate() {
        if !block.backing.is_null() {
            return Err(MemError::AlreadyAcquired { index });
        }
        block.validate(index < num_page_sized, index)?;
    }

    Ok(())
}
