//! Generic utility pipes.
//!
//! None of these touch payloads; they exist to assemble and observe
//! pipelines: forwarding, discarding, tagging and capturing refs.

mod capture;
mod identity;
mod null;
mod setattr;

pub use capture::{CAPTURE_SIGNATURE, CaptureConfig, CaptureHandle, CaptureManager};
pub use identity::{IDENTITY_SIGNATURE, IdentityManager};
pub use null::{NULL_SIGNATURE, NullManager};
pub use setattr::{SETATTR_SET_TEMPLATE, SETATTR_SIGNATURE, SetAttrManager};
