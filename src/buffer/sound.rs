//! Sound buffers: packed or planar audio samples.

use super::{Buffer, BufferKind, BufferManager, BufferSize, Layout, SoundLayout, check_window};
use crate::attr::{AttributeRef, flow};
use crate::error::{Error, Result};
use crate::memory::MemoryPool;
use smallvec::SmallVec;
use std::sync::{Arc, Weak};

/// Channel names, in allocation order.
const CHANNEL_NAMES: &str = "lrcLRSox";

/// Sample formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleFormat {
    /// Unsigned 8 bits.
    U8,
    /// Signed 16 bits.
    S16,
    /// Signed 24 bits, packed in 3 octets.
    S24,
    /// Signed 32 bits.
    S32,
    /// 32-bit float.
    F32,
    /// 64-bit float.
    F64,
}

impl SampleFormat {
    /// Parse the format component of a `sound.` flow definition.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "u8" => Some(Self::U8),
            "s16" => Some(Self::S16),
            "s24" => Some(Self::S24),
            "s32" => Some(Self::S32),
            "f32" => Some(Self::F32),
            "f64" => Some(Self::F64),
            _ => None,
        }
    }

    /// Name used in flow definitions.
    pub fn name(self) -> &'static str {
        match self {
            Self::U8 => "u8",
            Self::S16 => "s16",
            Self::S24 => "s24",
            Self::S32 => "s32",
            Self::F32 => "f32",
            Self::F64 => "f64",
        }
    }

    /// Octets per sample of one channel.
    pub fn octets(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::S16 => 2,
            Self::S24 => 3,
            Self::S32 | Self::F32 => 4,
            Self::F64 => 8,
        }
    }
}

/// Manager for sound buffers of one format and channel layout.
///
/// Packed buffers have a single plane named after all channels (`"lr"`);
/// planar buffers have one plane per channel (`"l"`, `"r"`).
#[derive(Debug)]
pub struct SoundManager {
    this: Weak<SoundManager>,
    pool: MemoryPool,
    format: SampleFormat,
    channels: usize,
    planar: bool,
}

impl SoundManager {
    /// Create a sound manager.
    ///
    /// At most 8 channels are supported.
    pub fn new(
        pool: MemoryPool,
        format: SampleFormat,
        channels: usize,
        planar: bool,
    ) -> Result<Arc<Self>> {
        if channels == 0 || channels > CHANNEL_NAMES.len() {
            return Err(Error::Invalid(format!("unsupported channel count {channels}")));
        }
        Ok(Arc::new_cyclic(|this| Self {
            this: this.clone(),
            pool,
            format,
            channels,
            planar,
        }))
    }

    /// Sample format.
    pub fn format(&self) -> SampleFormat {
        self.format
    }

    /// Number of channels.
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Whether buffers have one plane per channel.
    pub fn is_planar(&self) -> bool {
        self.planar
    }

    fn plane_names(&self) -> SmallVec<[&'static str; 8]> {
        if self.planar {
            (0..self.channels)
                .map(|i| &CHANNEL_NAMES[i..i + 1])
                .collect()
        } else {
            SmallVec::from_slice(&[&CHANNEL_NAMES[..self.channels]])
        }
    }

    fn plane_sample_size(&self) -> usize {
        if self.planar {
            self.format.octets()
        } else {
            self.format.octets() * self.channels
        }
    }
}

impl BufferManager for SoundManager {
    fn kind(&self) -> BufferKind {
        BufferKind::Sound
    }

    fn alloc(&self, size: BufferSize) -> Result<Buffer> {
        let BufferSize::Sound(samples) = size else {
            return Err(Error::Invalid(format!("{size:?} for sound manager")));
        };
        let planes = self.plane_names();
        let sample_size = self.plane_sample_size();
        let this = self
            .this
            .upgrade()
            .ok_or_else(|| Error::invalid("sound manager released"))?;
        let storage = self.pool.alloc(planes.len() * samples * sample_size)?;
        Ok(Buffer::new(
            this,
            storage,
            Layout::Sound(SoundLayout {
                channels: planes,
                sample_size,
                offset: 0,
                size: samples,
                capacity: samples,
            }),
        ))
    }

    fn check(&self, flow_def: &AttributeRef) -> Result<()> {
        let wanted = format!("sound.{}.", self.format.name());
        if !flow::match_def(flow_def, &wanted) {
            return Err(Error::Invalid(format!("sound manager needs {wanted}")));
        }
        if let Some(channels) = flow::channels(flow_def) {
            if channels as usize != self.channels {
                return Err(Error::Invalid(format!(
                    "{channels} channels, manager has {}",
                    self.channels
                )));
            }
        }
        if let Some(planes) = flow::planes(flow_def) {
            let expected = if self.planar { self.channels } else { 1 };
            if planes as usize != expected {
                return Err(Error::Invalid(format!("{planes} planes, expected {expected}")));
            }
        }
        Ok(())
    }

    fn pool(&self) -> &MemoryPool {
        &self.pool
    }
}

impl Buffer {
    fn sound_layout(&self) -> Result<&SoundLayout> {
        match &self.layout {
            Layout::Sound(layout) => Ok(layout),
            _ => Err(self.wrong_kind(BufferKind::Sound)),
        }
    }

    /// Window size in samples per channel.
    pub fn sound_size(&self) -> Result<usize> {
        Ok(self.sound_layout()?.size)
    }

    /// Octets per sample in one plane.
    pub fn sound_sample_size(&self) -> Result<usize> {
        Ok(self.sound_layout()?.sample_size)
    }

    /// Plane names.
    pub fn sound_planes(&self) -> Result<Vec<&'static str>> {
        Ok(self.sound_layout()?.channels.to_vec())
    }

    fn sound_range(&self, plane: &str) -> Result<(usize, usize)> {
        let layout = self.sound_layout()?;
        let index = layout
            .channels
            .iter()
            .position(|&c| c == plane)
            .ok_or_else(|| Error::Invalid(format!("no sound plane {plane}")))?;
        let base = index * layout.capacity * layout.sample_size;
        let start = base + layout.offset * layout.sample_size;
        Ok((start, start + layout.size * layout.sample_size))
    }

    /// Read one plane of the window.
    pub fn sound_plane_read(&self, plane: &str) -> Result<&[u8]> {
        let (start, end) = self.sound_range(plane)?;
        Ok(&self.storage()[start..end])
    }

    /// Map one plane of the window for writing.
    pub fn sound_plane_write(&mut self, plane: &str) -> Result<&mut [u8]> {
        let (start, end) = self.sound_range(plane)?;
        let storage = self.storage_mut()?;
        Ok(&mut storage[start..end])
    }

    /// Move the window start by `skip` samples and set its size.
    pub fn sound_resize(&mut self, skip: usize, new_size: usize) -> Result<()> {
        let Layout::Sound(layout) = &mut self.layout else {
            return Err(Error::invalid("sound_resize on a non-sound buffer"));
        };
        let offset = layout.offset + skip;
        check_window(offset, new_size, layout.capacity)?;
        layout.offset = offset;
        layout.size = new_size;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packed_s16() {
        let mgr = SoundManager::new(MemoryPool::default(), SampleFormat::S16, 2, false).unwrap();
        let mut sound = mgr.alloc(BufferSize::Sound(480)).unwrap();
        assert_eq!(sound.sound_planes().unwrap(), vec!["lr"]);
        assert_eq!(sound.sound_sample_size().unwrap(), 4);
        assert_eq!(sound.sound_plane_write("lr").unwrap().len(), 480 * 4);
        assert!(sound.sound_plane_read("l").is_err());
    }

    #[test]
    fn test_planar_resize() {
        let mgr = SoundManager::new(MemoryPool::default(), SampleFormat::F32, 2, true).unwrap();
        let mut sound = mgr.alloc(BufferSize::Sound(10)).unwrap();
        sound.sound_plane_write("r").unwrap().fill(7);
        sound.sound_resize(4, 6).unwrap();
        assert_eq!(sound.sound_size().unwrap(), 6);
        let right = sound.sound_plane_read("r").unwrap();
        assert_eq!(right.len(), 6 * 4);
        assert!(right.iter().all(|&b| b == 7));
        assert!(sound.sound_resize(1, 6).is_err());
    }

    #[test]
    fn test_sound_check() {
        let refs = crate::attr::AttributeRefManager::new();
        let mgr = SoundManager::new(MemoryPool::default(), SampleFormat::S16, 2, false).unwrap();
        let mut def = flow::alloc_def(&refs, "sound.s16.");
        flow::set_channels(&mut def, 2);
        flow::set_planes(&mut def, 1);
        assert!(mgr.check(&def).is_ok());
        flow::set_channels(&mut def, 6);
        assert!(mgr.check(&def).is_err());
        assert!(SoundManager::new(MemoryPool::default(), SampleFormat::U8, 9, true).is_err());
    }
}
