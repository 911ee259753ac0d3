//! Requests: downstream negotiation of shared resources.
//!
//! A pipe that needs something (a buffer manager for its output format, a
//! clock, the sink latency) builds a [`Request`] and registers it with its
//! output. The request travels downstream until some pipe or probe can
//! answer it, which it does by calling [`Request::provide`].
//!
//! A request is answered at most once. Answers that arrive after the
//! requester went away are harmless: the callback holds only weak state.
//! Pipes that cannot satisfy a request resolve it with
//! [`Provision::Unavailable`] rather than leaving it hanging.

use crate::attr::{AttributeRef, AttributeRefManager};
use crate::buffer::BufferManager;
use crate::clock::Clock;
use crate::error::{Error, Result};
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// What a request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// An attribute ref manager.
    UrefMgr,
    /// The closest flow format downstream supports.
    FlowFormat,
    /// A buffer manager for a flow definition.
    UbufMgr,
    /// A clock.
    Uclock,
    /// The latency added by the sinks.
    SinkLatency,
    /// A kind private to a pipe type.
    Local(u32),
}

/// The answer to a request.
pub enum Provision {
    /// Attribute ref manager.
    UrefMgr(Arc<AttributeRefManager>),
    /// Amended flow format.
    FlowFormat(AttributeRef),
    /// Buffer manager, with the flow definition it was built for.
    UbufMgr {
        /// The manager.
        manager: Arc<dyn BufferManager>,
        /// Flow definition the manager allocates for.
        flow_def: AttributeRef,
    },
    /// Clock.
    Uclock(Arc<dyn Clock>),
    /// Sink latency in ticks.
    SinkLatency(u64),
    /// Answer to a [`RequestKind::Local`] request.
    Local(Box<dyn Any + Send>),
    /// Nobody downstream can provide the resource.
    Unavailable,
}

impl Provision {
    fn answers(&self, kind: RequestKind) -> bool {
        matches!(
            (self, kind),
            (Provision::Unavailable, _)
                | (Provision::UrefMgr(_), RequestKind::UrefMgr)
                | (Provision::FlowFormat(_), RequestKind::FlowFormat)
                | (Provision::UbufMgr { .. }, RequestKind::UbufMgr)
                | (Provision::Uclock(_), RequestKind::Uclock)
                | (Provision::SinkLatency(_), RequestKind::SinkLatency)
                | (Provision::Local(_), RequestKind::Local(_))
        )
    }

    /// Whether this is [`Provision::Unavailable`].
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Provision::Unavailable)
    }
}

impl fmt::Debug for Provision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provision::UrefMgr(_) => f.write_str("UrefMgr"),
            Provision::FlowFormat(def) => f.debug_tuple("FlowFormat").field(def).finish(),
            Provision::UbufMgr { manager, .. } => {
                f.debug_tuple("UbufMgr").field(&manager.kind()).finish()
            }
            Provision::Uclock(clock) => f.debug_tuple("Uclock").field(&clock.name()).finish(),
            Provision::SinkLatency(latency) => f.debug_tuple("SinkLatency").field(latency).finish(),
            Provision::Local(_) => f.write_str("Local"),
            Provision::Unavailable => f.write_str("Unavailable"),
        }
    }
}

type ProvideFn = Box<dyn FnOnce(Provision) -> Result<()> + Send>;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

struct RequestInner {
    id: u64,
    kind: RequestKind,
    query: Option<AttributeRef>,
    provide: Mutex<Option<ProvideFn>>,
    provided: AtomicBool,
}

impl Drop for RequestInner {
    fn drop(&mut self) {
        if !self.provided.load(Ordering::Acquire) {
            tracing::warn!(request = self.id, kind = ?self.kind, "request dropped unanswered");
        }
    }
}

/// A negotiation request.
///
/// Cloning shares the request; all clones see the same answer state.
#[derive(Clone)]
pub struct Request {
    inner: Arc<RequestInner>,
}

impl Request {
    /// Build a request with an optional query and an answer callback.
    pub fn new<F>(kind: RequestKind, query: Option<AttributeRef>, on_provide: F) -> Self
    where
        F: FnOnce(Provision) -> Result<()> + Send + 'static,
    {
        Self {
            inner: Arc::new(RequestInner {
                id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
                kind,
                query,
                provide: Mutex::new(Some(Box::new(on_provide))),
                provided: AtomicBool::new(false),
            }),
        }
    }

    /// Ask for an attribute ref manager.
    pub fn uref_mgr<F>(on_provide: F) -> Self
    where
        F: FnOnce(Provision) -> Result<()> + Send + 'static,
    {
        Self::new(RequestKind::UrefMgr, None, on_provide)
    }

    /// Ask downstream to amend `flow_def` into a format it supports.
    pub fn flow_format<F>(flow_def: AttributeRef, on_provide: F) -> Self
    where
        F: FnOnce(Provision) -> Result<()> + Send + 'static,
    {
        Self::new(RequestKind::FlowFormat, Some(flow_def), on_provide)
    }

    /// Ask for a buffer manager able to allocate for `flow_def`.
    pub fn ubuf_mgr<F>(flow_def: AttributeRef, on_provide: F) -> Self
    where
        F: FnOnce(Provision) -> Result<()> + Send + 'static,
    {
        Self::new(RequestKind::UbufMgr, Some(flow_def), on_provide)
    }

    /// Ask for a clock.
    pub fn uclock<F>(on_provide: F) -> Self
    where
        F: FnOnce(Provision) -> Result<()> + Send + 'static,
    {
        Self::new(RequestKind::Uclock, None, on_provide)
    }

    /// Ask for the sink latency.
    pub fn sink_latency<F>(on_provide: F) -> Self
    where
        F: FnOnce(Provision) -> Result<()> + Send + 'static,
    {
        Self::new(RequestKind::SinkLatency, None, on_provide)
    }

    /// A request of the same kind and query as `upstream`, answered by
    /// `on_provide` instead.
    ///
    /// Used by pipes that relay requests across a boundary: the proxy is
    /// registered downstream, and its callback forwards the answer back to
    /// `upstream` (possibly later, on another thread).
    pub fn proxy<F>(upstream: &Request, on_provide: F) -> Self
    where
        F: FnOnce(Provision) -> Result<()> + Send + 'static,
    {
        Self::new(
            upstream.kind(),
            upstream.query().map(AttributeRef::duplicate),
            on_provide,
        )
    }

    /// Unique id, for logs.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Kind of resource requested.
    pub fn kind(&self) -> RequestKind {
        self.inner.kind
    }

    /// Query flow definition, if any.
    pub fn query(&self) -> Option<&AttributeRef> {
        self.inner.query.as_ref()
    }

    /// Whether the request was answered.
    pub fn is_provided(&self) -> bool {
        self.inner.provided.load(Ordering::Acquire)
    }

    /// Whether two handles designate the same request.
    pub fn same(&self, other: &Request) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Answer the request.
    ///
    /// Fails with [`Error::Invalid`] if it was already answered, or if
    /// `provision` does not match the request kind.
    pub fn provide(&self, provision: Provision) -> Result<()> {
        if !provision.answers(self.kind()) {
            return Err(Error::invalid(format!(
                "{provision:?} does not answer a {:?} request",
                self.kind()
            )));
        }
        let callback = self
            .inner
            .provide
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(callback) = callback else {
            return Err(Error::invalid(format!(
                "request {} already provided",
                self.id()
            )));
        };
        self.inner.provided.store(true, Ordering::Release);
        tracing::trace!(request = self.id(), kind = ?self.kind(), "request provided");
        callback(provision)
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("provided", &self.is_provided())
            .finish()
    }
}
