//! Attribute refs: the unit of dataflow between pipes.

use super::dict::{Dictionary, Rational, Value};
use crate::buffer::Buffer;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Flags carried by every attribute ref.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RefFlags(u64);

impl RefFlags {
    /// No special flags.
    pub const NONE: Self = Self(0);
    /// Last ref of the flow.
    pub const FLOW_END: Self = Self(1 << 0);
    /// Discontinuity before this ref.
    pub const FLOW_DISC: Self = Self(1 << 1);
    /// Ref starts a logical block (access unit, packet).
    pub const BLOCK_START: Self = Self(1 << 2);
    /// Ref ends a logical block.
    pub const BLOCK_END: Self = Self(1 << 3);
    /// Ref carries a clock reference.
    pub const CLOCK_REF: Self = Self(1 << 4);

    /// Create empty flags.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Check if empty.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Check if contains a flag.
    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Union of flags.
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Flags of `self` not in `other`.
    pub const fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

/// Timeline a date belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timeline {
    /// Local system clock.
    Sys,
    /// Program clock (after clock recovery).
    Prog,
    /// Original stream timestamps.
    Orig,
}

/// What a stored date refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DateKind {
    /// Clock reference (reception time).
    Cr,
    /// Decoding timestamp.
    Dts,
    /// Presentation timestamp.
    Pts,
}

const DTS_PTS_DELAY: &str = "k.dts_pts_delay";
const CR_DTS_DELAY: &str = "k.cr_dts_delay";
const RAP_CR_DELAY: &str = "k.rap_cr_delay";
const DURATION: &str = "k.duration";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Dates {
    sys: Option<(u64, DateKind)>,
    prog: Option<(u64, DateKind)>,
    orig: Option<(u64, DateKind)>,
}

impl Dates {
    fn slot(&mut self, timeline: Timeline) -> &mut Option<(u64, DateKind)> {
        match timeline {
            Timeline::Sys => &mut self.sys,
            Timeline::Prog => &mut self.prog,
            Timeline::Orig => &mut self.orig,
        }
    }

    fn get(&self, timeline: Timeline) -> Option<(u64, DateKind)> {
        match timeline {
            Timeline::Sys => self.sys,
            Timeline::Prog => self.prog,
            Timeline::Orig => self.orig,
        }
    }
}

/// A dictionary of typed attributes plus an optional buffer.
///
/// *Data* refs carry a [`Buffer`]; *control* refs carry only attributes and
/// are used for flow definitions. Dates are expressed in 27 MHz ticks; each
/// timeline stores one date and its kind, and the other kinds are derived
/// through the `dts_pts_delay` and `cr_dts_delay` attributes.
///
/// `Clone` is the same as [`AttributeRef::duplicate`].
#[derive(Debug, Clone, Default)]
pub struct AttributeRef {
    dict: Dictionary,
    buffer: Option<Buffer>,
    flags: RefFlags,
    dates: Dates,
}

impl AttributeRef {
    /// Deep-copy the attributes, sharing the buffer storage.
    pub fn duplicate(&self) -> AttributeRef {
        self.clone()
    }

    /// Whether this ref carries no buffer.
    pub fn is_control(&self) -> bool {
        self.buffer.is_none()
    }

    /// The attribute dictionary.
    pub fn dict(&self) -> &Dictionary {
        &self.dict
    }

    /// Mutable access to the attribute dictionary.
    pub fn dict_mut(&mut self) -> &mut Dictionary {
        &mut self.dict
    }

    // ---- buffer ----------------------------------------------------------

    /// The attached buffer.
    pub fn buffer(&self) -> Option<&Buffer> {
        self.buffer.as_ref()
    }

    /// Mutable access to the attached buffer.
    pub fn buffer_mut(&mut self) -> Option<&mut Buffer> {
        self.buffer.as_mut()
    }

    /// Attach a buffer, returning the one previously attached.
    pub fn attach_buffer(&mut self, buffer: Buffer) -> Option<Buffer> {
        self.buffer.replace(buffer)
    }

    /// Detach the buffer.
    pub fn detach_buffer(&mut self) -> Option<Buffer> {
        self.buffer.take()
    }

    // ---- flags -----------------------------------------------------------

    /// Current flags.
    pub fn flags(&self) -> RefFlags {
        self.flags
    }

    /// Whether all of `flags` are set.
    pub fn has_flags(&self, flags: RefFlags) -> bool {
        self.flags.contains(flags)
    }

    /// Set `flags`.
    pub fn set_flags(&mut self, flags: RefFlags) {
        self.flags = self.flags.union(flags);
    }

    /// Clear `flags`.
    pub fn clear_flags(&mut self, flags: RefFlags) {
        self.flags = self.flags.difference(flags);
    }

    // ---- typed attributes -----------------------------------------------

    /// Remove an attribute.
    pub fn delete(&mut self, name: &str) -> bool {
        self.dict.delete(name)
    }

    /// Whether a void attribute is present.
    pub fn get_void(&self, name: &str) -> bool {
        self.dict.get_void(name)
    }

    /// Set a void attribute.
    pub fn set_void(&mut self, name: &str) {
        self.dict.set(name, Value::Void);
    }

    /// Get a boolean attribute.
    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.dict.get_bool(name)
    }

    /// Set a boolean attribute.
    pub fn set_bool(&mut self, name: &str, value: bool) {
        self.dict.set(name, Value::Bool(value));
    }

    /// Get an unsigned attribute.
    pub fn get_unsigned(&self, name: &str) -> Option<u64> {
        self.dict.get_unsigned(name)
    }

    /// Set an unsigned attribute.
    pub fn set_unsigned(&mut self, name: &str, value: u64) {
        self.dict.set(name, Value::Unsigned(value));
    }

    /// Get a signed attribute.
    pub fn get_int(&self, name: &str) -> Option<i64> {
        self.dict.get_int(name)
    }

    /// Set a signed attribute.
    pub fn set_int(&mut self, name: &str, value: i64) {
        self.dict.set(name, Value::Int(value));
    }

    /// Get a rational attribute.
    pub fn get_rational(&self, name: &str) -> Option<Rational> {
        self.dict.get_rational(name)
    }

    /// Set a rational attribute.
    pub fn set_rational(&mut self, name: &str, value: Rational) {
        self.dict.set(name, Value::Rational(value));
    }

    /// Get a float attribute.
    pub fn get_float(&self, name: &str) -> Option<f64> {
        self.dict.get_float(name)
    }

    /// Set a float attribute.
    pub fn set_float(&mut self, name: &str, value: f64) {
        self.dict.set(name, Value::Float(value));
    }

    /// Get a string attribute.
    pub fn get_string(&self, name: &str) -> Option<&str> {
        self.dict.get_string(name)
    }

    /// Set a string attribute.
    pub fn set_string(&mut self, name: &str, value: impl Into<String>) {
        self.dict.set(name, Value::String(value.into()));
    }

    /// Get an opaque attribute.
    pub fn get_opaque(&self, name: &str) -> Option<&[u8]> {
        self.dict.get_opaque(name)
    }

    /// Set an opaque attribute.
    pub fn set_opaque(&mut self, name: &str, value: impl Into<Vec<u8>>) {
        self.dict.set(name, Value::Opaque(value.into()));
    }

    // ---- clock -----------------------------------------------------------

    /// Store a date of the given kind on a timeline.
    pub fn set_date(&mut self, timeline: Timeline, kind: DateKind, date: u64) {
        *self.dates.slot(timeline) = Some((date, kind));
    }

    /// Stored date and its kind.
    pub fn date(&self, timeline: Timeline) -> Option<(u64, DateKind)> {
        self.dates.get(timeline)
    }

    /// Remove the date of a timeline.
    pub fn clear_date(&mut self, timeline: Timeline) {
        *self.dates.slot(timeline) = None;
    }

    /// Presentation timestamp, derived from the stored date.
    pub fn pts(&self, timeline: Timeline) -> Option<u64> {
        let (date, kind) = self.dates.get(timeline)?;
        let dts_pts = self.dts_pts_delay().unwrap_or(0);
        match kind {
            DateKind::Pts => Some(date),
            DateKind::Dts => date.checked_add(dts_pts),
            DateKind::Cr => date
                .checked_add(self.cr_dts_delay().unwrap_or(0))?
                .checked_add(dts_pts),
        }
    }

    /// Decoding timestamp, derived from the stored date.
    pub fn dts(&self, timeline: Timeline) -> Option<u64> {
        let (date, kind) = self.dates.get(timeline)?;
        match kind {
            DateKind::Pts => date.checked_sub(self.dts_pts_delay().unwrap_or(0)),
            DateKind::Dts => Some(date),
            DateKind::Cr => date.checked_add(self.cr_dts_delay().unwrap_or(0)),
        }
    }

    /// Clock reference, derived from the stored date.
    pub fn cr(&self, timeline: Timeline) -> Option<u64> {
        let (date, kind) = self.dates.get(timeline)?;
        let cr_dts = self.cr_dts_delay().unwrap_or(0);
        match kind {
            DateKind::Pts => date
                .checked_sub(self.dts_pts_delay().unwrap_or(0))?
                .checked_sub(cr_dts),
            DateKind::Dts => date.checked_sub(cr_dts),
            DateKind::Cr => Some(date),
        }
    }

    /// Delay between DTS and PTS.
    pub fn dts_pts_delay(&self) -> Option<u64> {
        self.get_unsigned(DTS_PTS_DELAY)
    }

    /// Set the delay between DTS and PTS.
    pub fn set_dts_pts_delay(&mut self, delay: u64) {
        self.set_unsigned(DTS_PTS_DELAY, delay);
    }

    /// Delay between clock reference and DTS.
    pub fn cr_dts_delay(&self) -> Option<u64> {
        self.get_unsigned(CR_DTS_DELAY)
    }

    /// Set the delay between clock reference and DTS.
    pub fn set_cr_dts_delay(&mut self, delay: u64) {
        self.set_unsigned(CR_DTS_DELAY, delay);
    }

    /// Delay between the last random access point and the clock reference.
    pub fn rap_cr_delay(&self) -> Option<u64> {
        self.get_unsigned(RAP_CR_DELAY)
    }

    /// Set the delay between the last random access point and the clock reference.
    pub fn set_rap_cr_delay(&mut self, delay: u64) {
        self.set_unsigned(RAP_CR_DELAY, delay);
    }

    /// Duration in ticks.
    pub fn duration(&self) -> Option<u64> {
        self.get_unsigned(DURATION)
    }

    /// Set the duration in ticks.
    pub fn set_duration(&mut self, duration: u64) {
        self.set_unsigned(DURATION, duration);
    }

    /// Whether attributes, flags and dates of both refs are equal.
    ///
    /// Buffers are not compared.
    pub fn same_attributes(&self, other: &AttributeRef) -> bool {
        self.dict == other.dict && self.flags == other.flags && self.dates == other.dates
    }
}

// ============================================================================
// Manager
// ============================================================================

/// Factory for attribute refs.
///
/// Shared between pipes through the `UrefMgr` request.
#[derive(Debug)]
pub struct AttributeRefManager {
    dict_capacity: usize,
    allocated: AtomicU64,
}

impl AttributeRefManager {
    /// Create a manager with a default dictionary capacity.
    pub fn new() -> Arc<Self> {
        Self::with_capacity(8)
    }

    /// Create a manager pre-sizing dictionaries for `dict_capacity` attributes.
    pub fn with_capacity(dict_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            dict_capacity,
            allocated: AtomicU64::new(0),
        })
    }

    /// Allocate an empty ref.
    pub fn alloc(&self) -> AttributeRef {
        self.allocated.fetch_add(1, Ordering::Relaxed);
        AttributeRef {
            dict: Dictionary::with_capacity(self.dict_capacity),
            ..Default::default()
        }
    }

    /// Allocate a control ref (a ref that will never carry a buffer).
    pub fn alloc_control(&self) -> AttributeRef {
        self.alloc()
    }

    /// Allocate a data ref carrying `buffer`.
    pub fn alloc_with_buffer(&self, buffer: Buffer) -> AttributeRef {
        let mut uref = self.alloc();
        uref.attach_buffer(buffer);
        uref
    }

    /// Number of refs allocated so far.
    pub fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BlockManager, BufferManager, BufferSize};
    use crate::memory::MemoryPool;

    #[test]
    fn test_duplicate_round_trip_every_kind() {
        let mgr = AttributeRefManager::new();
        let mut uref = mgr.alloc();
        uref.set_void("v");
        uref.set_bool("b", true);
        uref.set_unsigned("u", 42);
        uref.set_int("i", -42);
        uref.set_rational("r", Rational::new(30000, 1001));
        uref.set_float("f", 0.5);
        uref.set_string("s", "text");
        uref.set_opaque("o", vec![1, 2, 3]);
        uref.set_flags(RefFlags::BLOCK_START);
        uref.set_date(Timeline::Prog, DateKind::Dts, 27_000_000);

        let dup = uref.duplicate();
        assert!(dup.same_attributes(&uref));
        assert!(dup.get_void("v"));
        assert_eq!(dup.get_bool("b"), Some(true));
        assert_eq!(dup.get_unsigned("u"), Some(42));
        assert_eq!(dup.get_int("i"), Some(-42));
        assert_eq!(dup.get_rational("r"), Some(Rational::new(30000, 1001)));
        assert_eq!(dup.get_float("f"), Some(0.5));
        assert_eq!(dup.get_string("s"), Some("text"));
        assert_eq!(dup.get_opaque("o"), Some(&[1u8, 2, 3][..]));
        assert_eq!(dup.dts(Timeline::Prog), Some(27_000_000));
    }

    #[test]
    fn test_duplicate_is_deep_for_attributes() {
        let mgr = AttributeRefManager::new();
        let mut uref = mgr.alloc();
        uref.set_unsigned("u", 1);
        let mut dup = uref.duplicate();
        dup.set_unsigned("u", 2);
        assert_eq!(uref.get_unsigned("u"), Some(1));
        assert!(!dup.same_attributes(&uref));
    }

    #[test]
    fn test_duplicate_shares_buffer() {
        let refs = AttributeRefManager::new();
        let blocks = BlockManager::new(MemoryPool::default());
        let uref = refs.alloc_with_buffer(blocks.alloc(BufferSize::Block(16)).unwrap());
        assert!(!uref.is_control());
        let dup = uref.duplicate();
        assert!(dup.buffer().unwrap().shares_storage_with(uref.buffer().unwrap()));
    }

    #[test]
    fn test_attach_detach() {
        let refs = AttributeRefManager::new();
        let blocks = BlockManager::new(MemoryPool::default());
        let mut uref = refs.alloc_control();
        assert!(uref.is_control());
        assert!(uref.attach_buffer(blocks.alloc_from(b"x").unwrap()).is_none());
        let buffer = uref.detach_buffer().unwrap();
        assert_eq!(buffer.block_read(0, 1).unwrap(), b"x");
        assert!(uref.is_control());
        assert_eq!(refs.allocated(), 1);
    }

    #[test]
    fn test_date_derivation() {
        let mut uref = AttributeRef::default();
        uref.set_date(Timeline::Sys, DateKind::Cr, 1000);
        uref.set_cr_dts_delay(100);
        uref.set_dts_pts_delay(10);
        assert_eq!(uref.cr(Timeline::Sys), Some(1000));
        assert_eq!(uref.dts(Timeline::Sys), Some(1100));
        assert_eq!(uref.pts(Timeline::Sys), Some(1110));

        uref.set_date(Timeline::Sys, DateKind::Pts, 1110);
        assert_eq!(uref.cr(Timeline::Sys), Some(1000));
        assert_eq!(uref.pts(Timeline::Orig), None);

        uref.set_date(Timeline::Orig, DateKind::Pts, 5);
        assert_eq!(uref.cr(Timeline::Orig), None);
    }

    #[test]
    fn test_flags() {
        let mut uref = AttributeRef::default();
        uref.set_flags(RefFlags::FLOW_DISC.union(RefFlags::BLOCK_END));
        assert!(uref.has_flags(RefFlags::FLOW_DISC));
        uref.clear_flags(RefFlags::FLOW_DISC);
        assert!(!uref.has_flags(RefFlags::FLOW_DISC));
        assert!(uref.has_flags(RefFlags::BLOCK_END));
    }
}
