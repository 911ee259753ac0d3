//! Flow definition attributes.
//!
//! A flow definition is a control ref whose `def` attribute names the stream
//! type as a dot-separated path ending in a dot (`sound.s16.`,
//! `block.mpegts.`, `pic.yuv420p.`). Type-specific attributes complete it.

use super::{AttributeRef, AttributeRefManager, Rational};

/// Stream type path.
pub const DEF: &str = "def";
/// Sample rate in Hz.
pub const RATE: &str = "rate";
/// Number of audio channels.
pub const CHANNELS: &str = "channels";
/// Number of audio planes.
pub const PLANES: &str = "planes";
/// Picture width.
pub const HSIZE: &str = "hsize";
/// Picture height.
pub const VSIZE: &str = "vsize";
/// Octets per second.
pub const OCTETRATE: &str = "octetrate";
/// Frames per second.
pub const FPS: &str = "fps";
/// Latency in 27 MHz ticks.
pub const LATENCY: &str = "latency";
/// Marks a flow that had malformed input upstream.
pub const ERROR: &str = "error";
/// Program identifier.
pub const PROGRAM: &str = "program";
/// Language code.
pub const LANG: &str = "lang";

/// Allocate a flow definition with the given type path.
pub fn alloc_def(mgr: &AttributeRefManager, def: &str) -> AttributeRef {
    let mut uref = mgr.alloc_control();
    set_def(&mut uref, def);
    uref
}

/// Stream type path.
pub fn def(uref: &AttributeRef) -> Option<&str> {
    uref.get_string(DEF)
}

/// Set the stream type path.
pub fn set_def(uref: &mut AttributeRef, def: &str) {
    uref.set_string(DEF, def);
}

/// Whether the type path starts with `prefix`.
pub fn match_def(uref: &AttributeRef, prefix: &str) -> bool {
    def(uref).is_some_and(|d| d.starts_with(prefix))
}

/// Whether `uref` is a flow definition.
pub fn is_flow_def(uref: &AttributeRef) -> bool {
    uref.is_control() && def(uref).is_some()
}

macro_rules! unsigned_attr {
    ($get:ident, $set:ident, $key:ident, $doc:literal) => {
        #[doc = $doc]
        pub fn $get(uref: &AttributeRef) -> Option<u64> {
            uref.get_unsigned($key)
        }

        #[doc = concat!("Set: ", $doc)]
        pub fn $set(uref: &mut AttributeRef, value: u64) {
            uref.set_unsigned($key, value);
        }
    };
}

unsigned_attr!(rate, set_rate, RATE, "Sample rate in Hz.");
unsigned_attr!(channels, set_channels, CHANNELS, "Number of audio channels.");
unsigned_attr!(planes, set_planes, PLANES, "Number of audio planes.");
unsigned_attr!(hsize, set_hsize, HSIZE, "Picture width in pixels.");
unsigned_attr!(vsize, set_vsize, VSIZE, "Picture height in pixels.");
unsigned_attr!(octetrate, set_octetrate, OCTETRATE, "Octets per second.");
unsigned_attr!(latency, set_latency, LATENCY, "Latency in 27 MHz ticks.");

/// Frame rate.
pub fn fps(uref: &AttributeRef) -> Option<Rational> {
    uref.get_rational(FPS)
}

/// Set the frame rate.
pub fn set_fps(uref: &mut AttributeRef, fps: Rational) {
    uref.set_rational(FPS, fps);
}

/// Whether the flow was flagged as carrying malformed data.
pub fn has_error(uref: &AttributeRef) -> bool {
    uref.get_void(ERROR)
}

/// Flag the flow as carrying malformed data.
pub fn set_error(uref: &mut AttributeRef) {
    uref.set_void(ERROR);
}

/// Program identifier.
pub fn program(uref: &AttributeRef) -> Option<&str> {
    uref.get_string(PROGRAM)
}

/// Set the program identifier.
pub fn set_program(uref: &mut AttributeRef, program: &str) {
    uref.set_string(PROGRAM, program);
}

/// Language code.
pub fn lang(uref: &AttributeRef) -> Option<&str> {
    uref.get_string(LANG)
}

/// Set the language code.
pub fn set_lang(uref: &mut AttributeRef, lang: &str) {
    uref.set_string(LANG, lang);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_def_attributes() {
        let mgr = AttributeRefManager::new();
        let mut def = alloc_def(&mgr, "sound.s16.");
        set_rate(&mut def, 48_000);
        set_channels(&mut def, 2);
        assert!(is_flow_def(&def));
        assert!(match_def(&def, "sound."));
        assert!(!match_def(&def, "pic."));
        assert_eq!(rate(&def), Some(48_000));
        assert_eq!(channels(&def), Some(2));
        assert_eq!(planes(&def), None);
        assert!(!has_error(&def));
        set_error(&mut def);
        assert!(has_error(&def));
    }

    #[test]
    fn test_no_def() {
        let mgr = AttributeRefManager::new();
        let uref = mgr.alloc();
        assert!(!is_flow_def(&uref));
        assert!(!match_def(&uref, ""));
    }
}
