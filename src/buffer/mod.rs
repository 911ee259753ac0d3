//! Zero-copy content buffers.
//!
//! A [`Buffer`] is a small header pointing at reference-counted storage drawn
//! from a [`MemoryPool`]. Duplicating a buffer creates a new header over the
//! same storage; each header keeps its own window (offset and size), so
//! resizing one duplicate never affects the others.
//!
//! # Copy-on-write
//!
//! Reads are always allowed. Write access requires exclusive storage: on a
//! shared buffer, every `*_write` method fails with [`Error::Busy`]. The caller
//! then either gives up or calls [`Buffer::make_writable`], which copies the
//! storage into a private region.
//!
//! ```rust
//! use sluice::buffer::{BlockManager, BufferManager, BufferSize};
//! use sluice::memory::MemoryPool;
//!
//! let mgr = BlockManager::new(MemoryPool::default());
//! let mut a = mgr.alloc(BufferSize::Block(4))?;
//! a.block_write(0, 4)?.copy_from_slice(b"abcd");
//!
//! let mut b = a.duplicate();
//! assert!(b.block_write(0, 1).is_err()); // shared
//! b.make_writable()?;
//! b.block_write(0, 1)?[0] = b'x';
//! assert_eq!(a.block_read(0, 4)?, b"abcd");
//! assert_eq!(b.block_read(0, 4)?, b"xbcd");
//! # Ok::<(), sluice::Error>(())
//! ```
//!
//! # Layouts
//!
//! - [`BlockManager`]: one contiguous byte range with headroom
//! - [`PictureManager`]: planar pictures with chroma subsampling
//! - [`SoundManager`]: packed or planar audio samples

mod block;
mod picture;
mod sound;

pub use block::BlockManager;
pub use picture::{PictureFormat, PictureManager};
pub use sound::{SampleFormat, SoundManager};

use crate::attr::{AttributeRef, flow};
use crate::error::{Error, Result};
use crate::memory::{Memory, MemoryPool};
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;

/// Kind of content a buffer manager produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    /// Contiguous bytes.
    Block,
    /// Planar picture.
    Picture,
    /// Audio samples.
    Sound,
}

/// Size argument for [`BufferManager::alloc`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferSize {
    /// Number of octets.
    Block(usize),
    /// Picture dimensions in pixels.
    Picture {
        /// Horizontal size.
        hsize: usize,
        /// Vertical size.
        vsize: usize,
    },
    /// Number of samples per channel.
    Sound(usize),
}

/// Allocator and layout policy for a family of buffers.
pub trait BufferManager: Send + Sync + fmt::Debug {
    /// Kind of buffers produced.
    fn kind(&self) -> BufferKind;

    /// Allocate a new buffer.
    ///
    /// Fails with [`Error::Invalid`] if `size` is not of this manager's kind.
    fn alloc(&self, size: BufferSize) -> Result<Buffer>;

    /// Check whether this manager can produce buffers for `flow_def`.
    fn check(&self, flow_def: &AttributeRef) -> Result<()>;

    /// Pool the storage is drawn from.
    fn pool(&self) -> &MemoryPool;

    /// Release cached memory.
    fn vacuum(&self) {
        self.pool().vacuum();
    }
}

// ============================================================================
// Layouts
// ============================================================================

#[derive(Debug, Clone)]
pub(crate) struct BlockLayout {
    pub(crate) offset: usize,
    pub(crate) size: usize,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct PlaneLayout {
    pub(crate) chroma: &'static str,
    pub(crate) hsub: usize,
    pub(crate) vsub: usize,
    pub(crate) macropixel_size: usize,
    pub(crate) base: usize,
    pub(crate) stride: usize,
}

#[derive(Debug, Clone)]
pub(crate) struct PictureLayout {
    pub(crate) planes: SmallVec<[PlaneLayout; 4]>,
    pub(crate) hoffset: usize,
    pub(crate) voffset: usize,
    pub(crate) hsize: usize,
    pub(crate) vsize: usize,
    pub(crate) alloc_hsize: usize,
    pub(crate) alloc_vsize: usize,
}

#[derive(Debug, Clone)]
pub(crate) struct SoundLayout {
    pub(crate) channels: SmallVec<[&'static str; 8]>,
    pub(crate) sample_size: usize,
    pub(crate) offset: usize,
    pub(crate) size: usize,
    pub(crate) capacity: usize,
}

#[derive(Debug, Clone)]
pub(crate) enum Layout {
    Block(BlockLayout),
    Picture(PictureLayout),
    Sound(SoundLayout),
}

// ============================================================================
// Buffer
// ============================================================================

/// A zero-copy content buffer.
///
/// Cloning is the same as [`Buffer::duplicate`]: the storage is shared.
#[derive(Clone)]
pub struct Buffer {
    manager: Arc<dyn BufferManager>,
    storage: Arc<Memory>,
    pub(crate) layout: Layout,
}

impl Buffer {
    pub(crate) fn new(manager: Arc<dyn BufferManager>, storage: Memory, layout: Layout) -> Self {
        Self {
            manager,
            storage: Arc::new(storage),
            layout,
        }
    }

    /// The manager that allocated this buffer.
    pub fn manager(&self) -> &Arc<dyn BufferManager> {
        &self.manager
    }

    /// Kind of buffer.
    pub fn kind(&self) -> BufferKind {
        match self.layout {
            Layout::Block(_) => BufferKind::Block,
            Layout::Picture(_) => BufferKind::Picture,
            Layout::Sound(_) => BufferKind::Sound,
        }
    }

    /// Create a new header sharing this buffer's storage.
    pub fn duplicate(&self) -> Buffer {
        self.clone()
    }

    /// Whether the storage is shared with another header.
    pub fn is_shared(&self) -> bool {
        Arc::strong_count(&self.storage) > 1
    }

    /// Whether `other` points at the same storage.
    pub fn shares_storage_with(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    /// Length of the backing storage in octets.
    pub fn storage_len(&self) -> usize {
        self.storage.len()
    }

    /// Make the storage private to this header, copying it if shared.
    ///
    /// After this call the `*_write` methods succeed. Other duplicates keep
    /// the old storage and are unaffected by later writes.
    pub fn make_writable(&mut self) -> Result<()> {
        if !self.is_shared() {
            return Ok(());
        }
        let mut copy = self.manager.pool().alloc(self.storage.len())?;
        copy.copy_from_slice(&self.storage);
        tracing::trace!(len = copy.len(), "copy-on-write split");
        self.storage = Arc::new(copy);
        Ok(())
    }

    pub(crate) fn storage(&self) -> &[u8] {
        &self.storage
    }

    pub(crate) fn storage_mut(&mut self) -> Result<&mut [u8]> {
        match Arc::get_mut(&mut self.storage) {
            Some(mem) => Ok(&mut mem[..]),
            None => Err(Error::busy("buffer storage is shared")),
        }
    }

    pub(crate) fn wrong_kind(&self, wanted: BufferKind) -> Error {
        Error::Invalid(format!("{:?} buffer used as {:?}", self.kind(), wanted))
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("kind", &self.kind())
            .field("shared", &self.is_shared())
            .field("layout", &self.layout)
            .finish()
    }
}

/// Checks a requested window against an available length.
pub(crate) fn check_window(offset: usize, len: usize, available: usize) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= available => Ok(()),
        _ => Err(Error::Invalid(format!(
            "window {offset}+{len} exceeds {available}"
        ))),
    }
}

/// Pick a buffer manager able to serve `flow_def`.
///
/// Recognized definitions:
/// - `block.*`
/// - `sound.<format>.*` with `channels` and `planes`
/// - `pic.<format>.*` with format `yuv420p`, `rgb24` or `gray8`
pub fn manager_for_flow_def(
    pool: &MemoryPool,
    flow_def: &AttributeRef,
) -> Result<Arc<dyn BufferManager>> {
    let def = flow::def(flow_def).ok_or_else(|| Error::invalid("flow def without def"))?;
    let mut parts = def.split('.');
    match parts.next() {
        Some("block") => Ok(BlockManager::new(pool.clone())),
        Some("sound") => {
            let format = parts
                .next()
                .and_then(SampleFormat::from_name)
                .ok_or_else(|| Error::Invalid(format!("unknown sound flow {def}")))?;
            let channels = flow::channels(flow_def).unwrap_or(2) as usize;
            let planes = flow::planes(flow_def).unwrap_or(1) as usize;
            let planar = planes > 1 || channels == 1;
            if planar && planes != channels {
                return Err(Error::Invalid(format!(
                    "{planes} planes for {channels} channels"
                )));
            }
            Ok(SoundManager::new(pool.clone(), format, channels, planar)?)
        }
        Some("pic") => {
            let format = parts
                .next()
                .and_then(PictureFormat::from_name)
                .ok_or_else(|| Error::Invalid(format!("unknown picture flow {def}")))?;
            Ok(PictureManager::new(pool.clone(), format))
        }
        _ => Err(Error::Invalid(format!("no buffer manager for {def}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attr::AttributeRefManager;

    fn flow_def(def: &str) -> AttributeRef {
        flow::alloc_def(&AttributeRefManager::new(), def)
    }

    #[test]
    fn test_duplicate_shares_storage() {
        let mgr = BlockManager::new(MemoryPool::default());
        let mut a = mgr.alloc(BufferSize::Block(8)).unwrap();
        a.block_write(0, 8).unwrap().copy_from_slice(b"01234567");
        let b = a.duplicate();
        assert!(a.is_shared());
        assert!(a.shares_storage_with(&b));
        assert_eq!(b.block_read(0, 8).unwrap(), b"01234567");
        drop(b);
        assert!(!a.is_shared());
        assert!(a.block_write(0, 1).is_ok());
    }

    #[test]
    fn test_shared_write_is_busy() {
        let mgr = BlockManager::new(MemoryPool::default());
        let mut a = mgr.alloc(BufferSize::Block(8)).unwrap();
        let _b = a.duplicate();
        let err = a.block_write(0, 1).unwrap_err();
        assert!(matches!(err, Error::Busy(_)));
    }

    #[test]
    fn test_make_writable_splits() {
        let mgr = BlockManager::new(MemoryPool::default());
        let mut a = mgr.alloc(BufferSize::Block(3)).unwrap();
        a.block_write(0, 3).unwrap().copy_from_slice(b"abc");
        let mut b = a.duplicate();
        b.make_writable().unwrap();
        assert!(!b.shares_storage_with(&a));
        b.block_write(0, 1).unwrap()[0] = b'z';
        assert_eq!(a.block_read(0, 3).unwrap(), b"abc");
        assert_eq!(b.block_read(0, 3).unwrap(), b"zbc");
    }

    #[test]
    fn test_manager_for_flow_def() {
        let pool = MemoryPool::default();
        let block = manager_for_flow_def(&pool, &flow_def("block.mpegts.")).unwrap();
        assert_eq!(block.kind(), BufferKind::Block);

        let mut sound_def = flow_def("sound.s16.");
        flow::set_channels(&mut sound_def, 2);
        flow::set_planes(&mut sound_def, 1);
        flow::set_rate(&mut sound_def, 48_000);
        let sound = manager_for_flow_def(&pool, &sound_def).unwrap();
        assert_eq!(sound.kind(), BufferKind::Sound);
        assert!(sound.check(&sound_def).is_ok());

        let pic = manager_for_flow_def(&pool, &flow_def("pic.yuv420p.")).unwrap();
        assert_eq!(pic.kind(), BufferKind::Picture);

        assert!(manager_for_flow_def(&pool, &flow_def("void.")).is_err());
        assert!(manager_for_flow_def(&pool, &flow_def("sound.mp3.")).is_err());
    }

    #[test]
    fn test_wrong_size_kind() {
        let mgr = BlockManager::new(MemoryPool::default());
        let err = mgr.alloc(BufferSize::Sound(10)).unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }
}
