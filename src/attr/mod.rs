//! Attribute refs and their typed dictionaries.
//!
//! An [`AttributeRef`] is what flows between pipes: a dictionary of typed
//! attributes, flags, clock dates and an optional [`Buffer`]. Duplicating a
//! ref deep-copies the attributes and shares the buffer storage.
//!
//! Getters return `None` when an attribute is absent (or of another kind).
//! Absence is a distinct outcome, never folded into zero.
//!
//! ```rust
//! use sluice::attr::{AttributeRefManager, flow};
//!
//! let mgr = AttributeRefManager::new();
//! let mut def = flow::alloc_def(&mgr, "sound.s16.");
//! flow::set_rate(&mut def, 48_000);
//! assert_eq!(flow::rate(&def), Some(48_000));
//! assert_eq!(flow::channels(&def), None);
//! ```
//!
//! [`Buffer`]: crate::buffer::Buffer

mod dict;
pub mod flow;
mod uref;

pub use dict::{Dictionary, Rational, Value};
pub use uref::{AttributeRef, AttributeRefManager, DateKind, RefFlags, Timeline};
