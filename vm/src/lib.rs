pub mod arglist;
pub mod config;
pub mod context;
pub mod demos;
pub mod dispatch;
pub mod error;
pub mod exception;
pub mod frame;
pub mod hooks;
mod interpreter;
mod invoke;
pub mod marshal;
pub mod method;
mod monitor;
pub mod native;
pub mod stackval;
pub mod stats;
pub mod transform;
pub mod unwind;

use std::sync::Arc;

use ahash::AHashMap;
use object::{
    AllocError, CallConv, Class, ExceptionKind, Heap, Metadata, MetadataError, MethodFlags,
    MethodId, ObjRef,
};
use parking_lot::{Mutex, RwLock};

pub use arglist::ArgIterator;
pub use config::{DomainCreateInfo, InterpOptions};
pub use context::{InterruptHandle, ResumeState, ResumeTarget, ThreadContext, with_context};
pub use error::{DomainError, InvokeError, NativeFault, TransformError, fatal};
pub use exception::Raise;
pub use frame::{FrameId, InterpFrame};
pub use hooks::{ExecutionHooks, NoHooks, TraceHooks};
pub use invoke::reenter;
pub use marshal::ValueRepr;
pub use method::{DataItem, InterpMethod, MethodCode, MethodKind};
pub use monitor::Monitor;
pub use native::NativeBridge;
pub use stackval::StackVal;
pub use stats::InterpStats;
pub use transform::{LoweredBodyTransformer, Transformer};
pub use unwind::{ClauseUnwinder, ThrowSite, Unwinder};

use method::MethodTable;
use monitor::MonitorTable;

/// A Rust implementation of an internal-call method. Receives the argument
/// cells (`this` first) and writes the return cell.
pub type InternalCall = fn(&Domain, &[StackVal], &mut StackVal) -> Result<(), Raise>;

/// An execution domain: the metadata, heap and interpreter state that
/// managed code runs against.
///
/// A domain is shared by every thread that runs code in it; per-thread
/// state lives in the [`ThreadContext`].
pub struct Domain {
    metadata: Metadata,
    heap: Heap,
    options: InterpOptions,
    methods: MethodTable,
    transformer: Box<dyn Transformer>,
    unwinder: Box<dyn Unwinder>,
    bridge: Box<dyn NativeBridge>,
    hooks: Box<dyn ExecutionHooks>,
    internals: RwLock<AHashMap<MethodId, InternalCall>>,
    strings: Mutex<AHashMap<String, ObjRef>>,
    string_class: Arc<Class>,
    pub(crate) monitors: MonitorTable,
    stats: InterpStats,
    /// Serializes installation into dispatch caches.
    pub(crate) dispatch_lock: Mutex<()>,
    /// Thrown when an exception object cannot be allocated.
    pub(crate) oom: ObjRef,
    pub(crate) arena_chunk_cells: usize,
}

impl Domain {
    pub fn new(info: DomainCreateInfo) -> Result<Self, DomainError> {
        let metadata = Metadata::new()?;
        let heap = Heap::new(info.heap);
        let special = metadata.special();
        let string_class = metadata.class(special.string)?;
        let oom_class = metadata.class(special.exception_class(ExceptionKind::OutOfMemory))?;
        let oom = heap.alloc_object(&oom_class)?;

        let hooks: Box<dyn ExecutionHooks> = if info.options.trace {
            Box::new(TraceHooks::new(info.options.trace_filter.clone()))
        } else {
            Box::new(NoHooks)
        };
        log::debug!("domain created with options {:?}", info.options);

        Ok(Self {
            metadata,
            heap,
            options: info.options,
            methods: MethodTable::default(),
            transformer: Box::new(LoweredBodyTransformer),
            unwinder: Box::new(ClauseUnwinder),
            bridge: native::default_bridge(),
            hooks,
            internals: RwLock::new(AHashMap::new()),
            strings: Mutex::new(AHashMap::new()),
            string_class,
            monitors: MonitorTable::default(),
            stats: InterpStats::default(),
            dispatch_lock: Mutex::new(()),
            oom,
            arena_chunk_cells: info.arena_chunk_cells,
        })
    }

    pub fn with_transformer(mut self, transformer: impl Transformer + 'static) -> Self {
        self.transformer = Box::new(transformer);
        self
    }

    pub fn with_unwinder(mut self, unwinder: impl Unwinder + 'static) -> Self {
        self.unwinder = Box::new(unwinder);
        self
    }

    pub fn with_native_bridge(mut self, bridge: impl NativeBridge + 'static) -> Self {
        self.bridge = Box::new(bridge);
        self
    }

    pub fn with_hooks(mut self, hooks: impl ExecutionHooks + 'static) -> Self {
        self.hooks = Box::new(hooks);
        self
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn options(&self) -> &InterpOptions {
        &self.options
    }

    pub fn stats(&self) -> &InterpStats {
        &self.stats
    }

    pub(crate) fn unwinder(&self) -> &dyn Unwinder {
        self.unwinder.as_ref()
    }

    pub(crate) fn bridge(&self) -> &dyn NativeBridge {
        self.bridge.as_ref()
    }

    pub(crate) fn hooks(&self) -> &dyn ExecutionHooks {
        self.hooks.as_ref()
    }

    // ── methods ────────────────────────────────────────────────────

    /// The interpreter descriptor of `id`, created on first request.
    pub fn interp_method(&self, id: MethodId) -> Result<Arc<InterpMethod>, MetadataError> {
        if let Some(imethod) = self.methods.get(id) {
            return Ok(imethod);
        }
        let meta = &self.metadata;
        let method = meta.method(id)?;
        let class = meta.class(method.class)?;
        let sig = method.sig.clone();
        let has_body = meta.lowered_body(&method).is_some();

        let kind = if method.is_pinvoke() {
            MethodKind::Pinvoke(method.native_addr())
        } else if method.flags.contains(MethodFlags::INTERNAL_CALL) {
            MethodKind::Internal
        } else {
            match method.compiled() {
                Some(entry) if !has_body || self.options.prefers_compiled(&class.name) => {
                    MethodKind::Compiled(entry)
                }
                _ if !has_body && method.flags.contains(MethodFlags::ABSTRACT) => {
                    MethodKind::Abstract
                }
                _ => MethodKind::Interpreted,
            }
        };

        let mut arg_reprs = Vec::with_capacity(sig.params.len() + 1);
        if sig.hasthis {
            arg_reprs.push(if class.is_valuetype() {
                ValueRepr::Ptr
            } else {
                ValueRepr::Object
            });
        }
        for param in &sig.params {
            arg_reprs.push(ValueRepr::of(meta, param, false)?);
        }
        let ret_repr = ValueRepr::of(meta, &sig.ret, false)?;
        let (native_arg_reprs, native_ret_repr) = if matches!(kind, MethodKind::Pinvoke(_)) {
            let params = sig
                .params
                .iter()
                .map(|param| ValueRepr::of(meta, param, true))
                .collect::<Result<Vec<_>, _>>()?;
            (params, ValueRepr::of(meta, &sig.ret, true)?)
        } else {
            (Vec::new(), ret_repr)
        };

        let imethod = InterpMethod {
            hasthis: sig.hasthis,
            vararg: sig.call_conv == CallConv::VarArg,
            param_count: sig.param_count(),
            method,
            class,
            sig,
            kind,
            arg_reprs,
            ret_repr,
            native_arg_reprs,
            native_ret_repr,
            code: Default::default(),
        };
        log::debug!("created descriptor for {} ({:?})", imethod.full_name(), imethod.kind);
        Ok(self.methods.insert(imethod))
    }

    /// The transformed code of `imethod`, transforming it on first use.
    pub fn transformed<'m>(&self, imethod: &'m InterpMethod) -> Result<&'m MethodCode, TransformError> {
        if let Some(code) = imethod.code.get() {
            return Ok(code);
        }
        let code = self.transformer.transform(self, imethod)?;
        self.stats
            .transforms
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        log::debug!(
            "transformed {}: {} bytes, {} frame cells",
            imethod.full_name(),
            code.bytes.len(),
            code.frame_cells()
        );
        Ok(imethod.code.get_or_init(|| code))
    }

    pub fn method_count(&self) -> usize {
        self.methods.len()
    }

    /// Implement internal-call method `id` with `f`.
    pub fn register_internal(&self, id: MethodId, f: InternalCall) {
        self.internals.write().insert(id, f);
    }

    pub(crate) fn internal(&self, id: MethodId) -> Option<InternalCall> {
        self.internals.read().get(&id).copied()
    }

    // ── strings ────────────────────────────────────────────────────

    pub fn new_string(&self, value: &str) -> Result<ObjRef, AllocError> {
        self.heap.alloc_string(&self.string_class, value)
    }

    /// The domain's unique string object for `value`.
    pub fn intern_string(&self, value: &str) -> Result<ObjRef, AllocError> {
        let mut strings = self.strings.lock();
        if let Some(&string) = strings.get(value) {
            return Ok(string);
        }
        let string = self.new_string(value)?;
        strings.insert(value.to_owned(), string);
        Ok(string)
    }
}
