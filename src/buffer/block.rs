//! Block buffers: one contiguous range of octets.

use super::{
    BlockLayout, Buffer, BufferKind, BufferManager, BufferSize, Layout, check_window,
};
use crate::attr::{AttributeRef, flow};
use crate::error::{Error, Result};
use crate::memory::MemoryPool;
use std::sync::{Arc, Weak};

/// Default headroom before the payload, in octets.
const DEFAULT_PREPEND: usize = 32;
/// Default headroom after the payload, in octets.
const DEFAULT_APPEND: usize = 32;

/// Manager for block buffers.
///
/// Every block is allocated with some headroom on both sides so that
/// [`Buffer::block_resize`] can prepend or append without copying.
#[derive(Debug)]
pub struct BlockManager {
    this: Weak<BlockManager>,
    pool: MemoryPool,
    prepend: usize,
    append: usize,
}

impl BlockManager {
    /// Create a block manager with default headroom.
    pub fn new(pool: MemoryPool) -> Arc<Self> {
        Self::with_headroom(pool, DEFAULT_PREPEND, DEFAULT_APPEND)
    }

    /// Create a block manager with explicit headroom.
    pub fn with_headroom(pool: MemoryPool, prepend: usize, append: usize) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            pool,
            prepend,
            append,
        })
    }

    /// Allocate a block and fill it with `data`.
    pub fn alloc_from(&self, data: &[u8]) -> Result<Buffer> {
        let mut buffer = self.alloc(BufferSize::Block(data.len()))?;
        buffer.block_write(0, data.len())?.copy_from_slice(data);
        Ok(buffer)
    }
}

impl BufferManager for BlockManager {
    fn kind(&self) -> BufferKind {
        BufferKind::Block
    }

    fn alloc(&self, size: BufferSize) -> Result<Buffer> {
        let BufferSize::Block(size) = size else {
            return Err(Error::Invalid(format!("{size:?} for block manager")));
        };
        let this = self
            .this
            .upgrade()
            .ok_or_else(|| Error::invalid("block manager released"))?;
        let storage = self.pool.alloc(self.prepend + size + self.append)?;
        Ok(Buffer::new(
            this,
            storage,
            Layout::Block(BlockLayout {
                offset: self.prepend,
                size,
            }),
        ))
    }

    fn check(&self, flow_def: &AttributeRef) -> Result<()> {
        if flow::match_def(flow_def, "block.") {
            Ok(())
        } else {
            Err(Error::invalid("block manager needs a block. flow"))
        }
    }

    fn pool(&self) -> &MemoryPool {
        &self.pool
    }
}

impl Buffer {
    fn block_layout(&self) -> Result<&BlockLayout> {
        match &self.layout {
            Layout::Block(layout) => Ok(layout),
            _ => Err(self.wrong_kind(BufferKind::Block)),
        }
    }

    /// Size of the block window in octets.
    pub fn block_size(&self) -> Result<usize> {
        Ok(self.block_layout()?.size)
    }

    /// Read `len` octets at `offset` in the window.
    pub fn block_read(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let layout = self.block_layout()?;
        check_window(offset, len, layout.size)?;
        let start = layout.offset + offset;
        Ok(&self.storage()[start..start + len])
    }

    /// Map `len` octets at `offset` for writing.
    ///
    /// Fails with [`Error::Busy`] if the storage is shared.
    pub fn block_write(&mut self, offset: usize, len: usize) -> Result<&mut [u8]> {
        let layout = self.block_layout()?;
        check_window(offset, len, layout.size)?;
        let start = layout.offset + offset;
        let storage = self.storage_mut()?;
        Ok(&mut storage[start..start + len])
    }

    /// Copy octets at `offset` into `out`.
    pub fn block_extract(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        out.copy_from_slice(self.block_read(offset, out.len())?);
        Ok(())
    }

    /// Allocate a new, unshared block holding a copy of part of this one.
    pub fn block_copy(&self, offset: usize, len: usize) -> Result<Buffer> {
        let data = self.block_read(offset, len)?;
        let mut copy = self.manager().alloc(BufferSize::Block(len))?;
        copy.block_write(0, len)?.copy_from_slice(data);
        Ok(copy)
    }

    /// Move the window start by `skip` octets and set its size.
    ///
    /// A negative `skip` extends the window into the headroom before the
    /// payload. Fails with [`Error::Invalid`] if the new window does not fit
    /// in the backing storage. Only this header is affected.
    pub fn block_resize(&mut self, skip: isize, new_size: usize) -> Result<()> {
        let available = self.storage_len();
        let Layout::Block(layout) = &mut self.layout else {
            return Err(Error::invalid("block_resize on a non-block buffer"));
        };
        let offset = layout
            .offset
            .checked_add_signed(skip)
            .ok_or_else(|| Error::Invalid(format!("skip {skip} before storage start")))?;
        check_window(offset, new_size, available)?;
        layout.offset = offset;
        layout.size = new_size;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> Arc<BlockManager> {
        BlockManager::with_headroom(MemoryPool::default(), 4, 4)
    }

    #[test]
    fn test_block_alloc_read_write() {
        let mgr = manager();
        let buffer = mgr.alloc_from(b"hello").unwrap();
        assert_eq!(buffer.block_size().unwrap(), 5);
        assert_eq!(buffer.block_read(1, 3).unwrap(), b"ell");
        assert!(buffer.block_read(3, 3).is_err());
    }

    #[test]
    fn test_block_resize_window() {
        let mgr = manager();
        let mut buffer = mgr.alloc_from(b"abcdef").unwrap();
        buffer.block_resize(2, 3).unwrap();
        assert_eq!(buffer.block_read(0, 3).unwrap(), b"cde");

        // prepend into headroom
        buffer.block_resize(-6, 2).unwrap();
        assert_eq!(buffer.block_size().unwrap(), 2);

        // past the front of the storage
        assert!(buffer.block_resize(-100, 1).is_err());
        // past the end of the storage
        assert!(buffer.block_resize(0, 1000).is_err());
    }

    #[test]
    fn test_resize_is_per_header() {
        let mgr = manager();
        let a = mgr.alloc_from(b"abcdef").unwrap();
        let mut b = a.duplicate();
        b.block_resize(3, 3).unwrap();
        assert_eq!(a.block_read(0, 6).unwrap(), b"abcdef");
        assert_eq!(b.block_read(0, 3).unwrap(), b"def");
    }

    #[test]
    fn test_block_copy_is_private() {
        let mgr = manager();
        let a = mgr.alloc_from(b"abcdef").unwrap();
        let _keep = a.duplicate();
        let mut c = a.block_copy(1, 2).unwrap();
        assert!(!c.is_shared());
        c.block_write(0, 1).unwrap()[0] = b'X';
        assert_eq!(c.block_read(0, 2).unwrap(), b"Xc");

        let mut out = [0u8; 2];
        a.block_extract(4, &mut out).unwrap();
        assert_eq!(&out, b"ef");
    }

    #[test]
    fn test_block_check() {
        let mgr = manager();
        let mgr_ref = crate::attr::AttributeRefManager::new();
        assert!(mgr.check(&flow::alloc_def(&mgr_ref, "block.h264.")).is_ok());
        assert!(mgr.check(&flow::alloc_def(&mgr_ref, "sound.s16.")).is_err());
    }
}
