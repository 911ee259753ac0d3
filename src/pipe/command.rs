//! Control commands.

use super::Pipe;
use crate::attr::AttributeRef;
use crate::pump::PumpManager;
use crate::request::Request;
use std::any::Any;
use std::fmt;

/// A control command sent to a pipe.
///
/// Getter commands carry an output slot that the handling pipe fills.
pub enum Command {
    /// Re-request an attribute ref manager.
    AttachUrefMgr,
    /// Drop the current event loop and ask for a new one.
    AttachUpumpMgr,
    /// Re-request a clock.
    AttachUclock,
    /// Re-request a buffer manager.
    AttachUbufMgr,
    /// Read the URI.
    GetUri(Option<String>),
    /// Set (or clear) the URI.
    SetUri(Option<String>),
    /// Read a string option.
    GetOption {
        /// Option name.
        key: String,
        /// Filled with the value.
        value: Option<String>,
    },
    /// Set (or clear) a string option.
    SetOption {
        /// Option name.
        key: String,
        /// New value.
        value: Option<String>,
    },
    /// Register a request with the pipe and its downstream.
    RegisterRequest(Request),
    /// Withdraw a registered request.
    UnregisterRequest(Request),
    /// Set the input flow definition.
    SetFlowDef(AttributeRef),
    /// Read the output flow definition.
    GetFlowDef(Option<AttributeRef>),
    /// Read the maximum number of held or queued refs.
    GetMaxLength(Option<usize>),
    /// Set the maximum number of held or queued refs.
    SetMaxLength(usize),
    /// Drop held refs.
    Flush,
    /// Leave the preroll state.
    EndPreroll,
    /// Read the output.
    GetOutput(Option<Pipe>),
    /// Set (or clear) the output.
    SetOutput(Option<Pipe>),
    /// Read the output chunk size.
    GetOutputSize(Option<u64>),
    /// Set the output chunk size.
    SetOutputSize(u64),
    /// Iterate over the flow definitions of a split pipe.
    ///
    /// Starts from `None`; the pipe replaces the slot with the next
    /// definition, or `None` after the last one.
    SplitIterate(Option<AttributeRef>),
    /// Stop forwarding commands to inner pipes while the bin is rebuilt.
    BinFreeze,
    /// Resume forwarding.
    BinThaw,
    /// Read the first inner pipe of a bin.
    BinGetFirstInner(Option<Pipe>),
    /// Read the last inner pipe of a bin.
    BinGetLastInner(Option<Pipe>),
    /// Read the size of the source, in octets.
    SrcGetSize(Option<u64>),
    /// Read the read position of the source.
    SrcGetPosition(Option<u64>),
    /// Seek the source.
    SrcSetPosition(u64),
    /// Read the range the source is restricted to.
    SrcGetRange {
        /// Filled with the start offset.
        offset: Option<u64>,
        /// Filled with the length, `None` meaning unbounded.
        length: Option<u64>,
    },
    /// Restrict the source to a range.
    SrcSetRange {
        /// Start offset.
        offset: u64,
        /// Length, `None` meaning unbounded.
        length: Option<u64>,
    },
    /// Command private to a pipe type.
    Custom {
        /// Signature of the pipe manager that defines the command.
        signature: u32,
        /// Command number within that signature.
        command: u32,
        /// Command arguments and results.
        payload: Box<dyn Any + Send>,
    },
}

impl Command {
    /// Short command name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Command::AttachUrefMgr => "attach_uref_mgr",
            Command::AttachUpumpMgr => "attach_upump_mgr",
            Command::AttachUclock => "attach_uclock",
            Command::AttachUbufMgr => "attach_ubuf_mgr",
            Command::GetUri(_) => "get_uri",
            Command::SetUri(_) => "set_uri",
            Command::GetOption { .. } => "get_option",
            Command::SetOption { .. } => "set_option",
            Command::RegisterRequest(_) => "register_request",
            Command::UnregisterRequest(_) => "unregister_request",
            Command::SetFlowDef(_) => "set_flow_def",
            Command::GetFlowDef(_) => "get_flow_def",
            Command::GetMaxLength(_) => "get_max_length",
            Command::SetMaxLength(_) => "set_max_length",
            Command::Flush => "flush",
            Command::EndPreroll => "end_preroll",
            Command::GetOutput(_) => "get_output",
            Command::SetOutput(_) => "set_output",
            Command::GetOutputSize(_) => "get_output_size",
            Command::SetOutputSize(_) => "set_output_size",
            Command::SplitIterate(_) => "split_iterate",
            Command::BinFreeze => "bin_freeze",
            Command::BinThaw => "bin_thaw",
            Command::BinGetFirstInner(_) => "bin_get_first_inner",
            Command::BinGetLastInner(_) => "bin_get_last_inner",
            Command::SrcGetSize(_) => "src_get_size",
            Command::SrcGetPosition(_) => "src_get_position",
            Command::SrcSetPosition(_) => "src_set_position",
            Command::SrcGetRange { .. } => "src_get_range",
            Command::SrcSetRange { .. } => "src_set_range",
            Command::Custom { .. } => "custom",
        }
    }

    /// Whether this is a custom command of the pipe type `signature`.
    pub fn is_custom_for(&self, signature: u32) -> bool {
        matches!(self, Command::Custom { signature: s, .. } if *s == signature)
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Custom {
                signature, command, ..
            } => f
                .debug_struct("Custom")
                .field("signature", &format_args!("{signature:#010x}"))
                .field("command", command)
                .finish_non_exhaustive(),
            other => f.write_str(other.name()),
        }
    }
}

/// A control command sent to a pipe manager.
pub enum ManagerCommand {
    /// Bind the manager to an event loop.
    AttachUpumpMgr(PumpManager),
    /// Stop handing out the event loop to new pipes.
    FreezeUpumpMgr,
    /// Resume handing out the event loop.
    ThawUpumpMgr,
    /// Command private to a manager type.
    Custom {
        /// Signature of the manager type.
        signature: u32,
        /// Command number within that signature.
        command: u32,
        /// Command arguments and results.
        payload: Box<dyn Any + Send>,
    },
}

impl fmt::Debug for ManagerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManagerCommand::AttachUpumpMgr(_) => f.write_str("attach_upump_mgr"),
            ManagerCommand::FreezeUpumpMgr => f.write_str("freeze_upump_mgr"),
            ManagerCommand::ThawUpumpMgr => f.write_str("thaw_upump_mgr"),
            ManagerCommand::Custom {
                signature, command, ..
            } => f
                .debug_struct("Custom")
                .field("signature", signature)
                .field("command", command)
                .finish_non_exhaustive(),
        }
    }
}

/// Build a four-character pipe signature.
pub const fn fourcc(code: &[u8; 4]) -> u32 {
    u32::from_le_bytes(*code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fourcc() {
        assert_eq!(fourcc(b"qsrc"), u32::from_le_bytes(*b"qsrc"));
        assert_ne!(fourcc(b"qsrc"), fourcc(b"qsnk"));
    }

    #[test]
    fn test_custom_signature() {
        let cmd = Command::Custom {
            signature: fourcc(b"qsrc"),
            command: 1,
            payload: Box::new(0usize),
        };
        assert!(cmd.is_custom_for(fourcc(b"qsrc")));
        assert!(!cmd.is_custom_for(fourcc(b"xfer")));
        assert!(!Command::Flush.is_custom_for(fourcc(b"qsrc")));
        assert_eq!(Command::SetMaxLength(3).name(), "set_max_length");
    }
}
