//! Picture buffers: one or more planes with chroma subsampling.

use super::{
    Buffer, BufferKind, BufferManager, BufferSize, Layout, PictureLayout, PlaneLayout,
};
use crate::attr::{AttributeRef, flow};
use crate::error::{Error, Result};
use crate::memory::MemoryPool;
use smallvec::SmallVec;
use std::sync::{Arc, Weak};

/// Plane description: chroma name, subsampling and octets per macropixel.
type PlaneSpec = (&'static str, usize, usize, usize);

/// Supported picture formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PictureFormat {
    /// Planar Y'CbCr 4:2:0, 8 bits.
    Yuv420p,
    /// Packed RGB, 8 bits per component.
    Rgb24,
    /// Single luma plane, 8 bits.
    Gray8,
}

impl PictureFormat {
    /// Parse the format component of a `pic.` flow definition.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "yuv420p" => Some(Self::Yuv420p),
            "rgb24" => Some(Self::Rgb24),
            "gray8" => Some(Self::Gray8),
            _ => None,
        }
    }

    /// Name used in flow definitions.
    pub fn name(self) -> &'static str {
        match self {
            Self::Yuv420p => "yuv420p",
            Self::Rgb24 => "rgb24",
            Self::Gray8 => "gray8",
        }
    }

    fn planes(self) -> &'static [PlaneSpec] {
        match self {
            Self::Yuv420p => &[("y8", 1, 1, 1), ("u8", 2, 2, 1), ("v8", 2, 2, 1)],
            Self::Rgb24 => &[("r8g8b8", 1, 1, 3)],
            Self::Gray8 => &[("y8", 1, 1, 1)],
        }
    }

    /// Largest horizontal and vertical subsampling among planes.
    fn max_sub(self) -> (usize, usize) {
        self.planes()
            .iter()
            .fold((1, 1), |(h, v), p| (h.max(p.1), v.max(p.2)))
    }
}

/// Manager for picture buffers of one format.
#[derive(Debug)]
pub struct PictureManager {
    this: Weak<PictureManager>,
    pool: MemoryPool,
    format: PictureFormat,
}

impl PictureManager {
    /// Create a picture manager.
    pub fn new(pool: MemoryPool, format: PictureFormat) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            pool,
            format,
        })
    }

    /// Picture format.
    pub fn format(&self) -> PictureFormat {
        self.format
    }
}

impl BufferManager for PictureManager {
    fn kind(&self) -> BufferKind {
        BufferKind::Picture
    }

    fn alloc(&self, size: BufferSize) -> Result<Buffer> {
        let BufferSize::Picture { hsize, vsize } = size else {
            return Err(Error::Invalid(format!("{size:?} for picture manager")));
        };
        let (hmax, vmax) = self.format.max_sub();
        if hsize % hmax != 0 || vsize % vmax != 0 {
            return Err(Error::Invalid(format!(
                "{hsize}x{vsize} not a multiple of {} subsampling",
                self.format.name()
            )));
        }

        let mut planes = SmallVec::new();
        let mut total = 0usize;
        for &(chroma, hsub, vsub, macropixel_size) in self.format.planes() {
            let stride = hsize / hsub * macropixel_size;
            planes.push(PlaneLayout {
                chroma,
                hsub,
                vsub,
                macropixel_size,
                base: total,
                stride,
            });
            total += stride * (vsize / vsub);
        }

        let this = self
            .this
            .upgrade()
            .ok_or_else(|| Error::invalid("picture manager released"))?;
        let storage = self.pool.alloc(total)?;
        Ok(Buffer::new(
            this,
            storage,
            Layout::Picture(PictureLayout {
                planes,
                hoffset: 0,
                voffset: 0,
                hsize,
                vsize,
                alloc_hsize: hsize,
                alloc_vsize: vsize,
            }),
        ))
    }

    fn check(&self, flow_def: &AttributeRef) -> Result<()> {
        let wanted = format!("pic.{}.", self.format.name());
        if flow::match_def(flow_def, &wanted) {
            Ok(())
        } else {
            Err(Error::Invalid(format!("picture manager needs {wanted}")))
        }
    }

    fn pool(&self) -> &MemoryPool {
        &self.pool
    }
}

impl Buffer {
    fn picture_layout(&self) -> Result<&PictureLayout> {
        match &self.layout {
            Layout::Picture(layout) => Ok(layout),
            _ => Err(self.wrong_kind(BufferKind::Picture)),
        }
    }

    /// Picture window size in pixels, as `(hsize, vsize)`.
    pub fn pic_size(&self) -> Result<(usize, usize)> {
        let layout = self.picture_layout()?;
        Ok((layout.hsize, layout.vsize))
    }

    /// Chroma names of the planes.
    pub fn pic_chromas(&self) -> Result<Vec<&'static str>> {
        Ok(self.picture_layout()?.planes.iter().map(|p| p.chroma).collect())
    }

    fn plane_range(&self, chroma: &str) -> Result<(usize, usize, usize)> {
        let layout = self.picture_layout()?;
        let plane = layout
            .planes
            .iter()
            .find(|p| p.chroma == chroma)
            .ok_or_else(|| Error::Invalid(format!("no plane {chroma}")))?;
        let start = plane.base
            + layout.voffset / plane.vsub * plane.stride
            + layout.hoffset / plane.hsub * plane.macropixel_size;
        let end = plane.base + plane.stride * (layout.alloc_vsize / plane.vsub);
        Ok((start, end, plane.stride))
    }

    /// Read a plane starting at the window origin.
    ///
    /// Returns the plane octets and the line stride.
    pub fn pic_plane_read(&self, chroma: &str) -> Result<(&[u8], usize)> {
        let (start, end, stride) = self.plane_range(chroma)?;
        Ok((&self.storage()[start..end], stride))
    }

    /// Map a plane for writing, starting at the window origin.
    pub fn pic_plane_write(&mut self, chroma: &str) -> Result<(&mut [u8], usize)> {
        let (start, end, stride) = self.plane_range(chroma)?;
        let storage = self.storage_mut()?;
        Ok((&mut storage[start..end], stride))
    }

    /// Crop the picture window.
    ///
    /// Offsets are relative to the current window and must respect the
    /// subsampling of every plane.
    pub fn pic_resize(
        &mut self,
        hskip: usize,
        vskip: usize,
        new_hsize: usize,
        new_vsize: usize,
    ) -> Result<()> {
        let Layout::Picture(layout) = &mut self.layout else {
            return Err(Error::invalid("pic_resize on a non-picture buffer"));
        };
        let hoffset = layout.hoffset + hskip;
        let voffset = layout.voffset + vskip;
        if hoffset + new_hsize > layout.alloc_hsize || voffset + new_vsize > layout.alloc_vsize {
            return Err(Error::Invalid(format!(
                "crop {hoffset}+{new_hsize}x{voffset}+{new_vsize} exceeds picture"
            )));
        }
        if layout
            .planes
            .iter()
            .any(|p| hoffset % p.hsub != 0 || voffset % p.vsub != 0)
        {
            return Err(Error::invalid("crop offset breaks chroma subsampling"));
        }
        layout.hoffset = hoffset;
        layout.voffset = voffset;
        layout.hsize = new_hsize;
        layout.vsize = new_vsize;
        Ok(())
    }
}
