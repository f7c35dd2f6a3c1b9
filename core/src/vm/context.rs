//! Per-thread execution state shared by every frame of one invocation.

use super::code::Code;
use super::fault::Fault;
use crate::values::{ExceptionRef, TraceEntry, Value};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub const DEFAULT_MAX_DEPTH: usize = 256;

#[derive(Default)]
struct AbortSignal {
    requested: AtomicBool,
    reason: Mutex<Value>,
}

/// Cooperative cancellation. Cloning shares the signal, so a host can keep
/// one handle and request an abort from another thread.
#[derive(Clone, Default)]
pub struct AbortHandle(Arc<AbortSignal>);

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self, reason: Value) {
        *self.0.reason.lock() = reason;
        self.0.requested.store(true, Ordering::Release);
    }

    /// Cancels a pending abort. Called from inside a catch handler it stops
    /// the abort from being re-raised when the handler exits.
    pub fn reset(&self) {
        self.0.requested.store(false, Ordering::Release);
        *self.0.reason.lock() = Value::Null;
    }

    #[inline]
    pub fn is_requested(&self) -> bool {
        self.0.requested.load(Ordering::Acquire)
    }

    pub fn reason(&self) -> Value {
        self.0.reason.lock().clone()
    }
}

impl std::fmt::Debug for AbortHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbortHandle").field("requested", &self.is_requested()).finish()
    }
}

/// One logical activation on the call stack.
pub(crate) enum FrameRecord {
    Interpreted { code: Arc<Code>, ip: usize },
    Native { name: Arc<str> },
}

/// Logical call stack, recursion limit and abort state of one thread of
/// execution. Passed explicitly to every call.
pub struct ExecutionContext {
    frames: Vec<FrameRecord>,
    max_depth: usize,
    abort: AbortHandle,
    /// Abort exception currently propagating, if any. While set, polls do
    /// not raise a second abort.
    aborting: Option<ExceptionRef>,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self { frames: Vec::new(), max_depth: DEFAULT_MAX_DEPTH, abort: AbortHandle::new(), aborting: None }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_abort_handle(mut self, abort: AbortHandle) -> Self {
        self.abort = abort;
        self
    }

    pub fn abort_handle(&self) -> &AbortHandle {
        &self.abort
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub(crate) fn enter_interpreted(&mut self, code: &Arc<Code>) -> Result<usize, Fault> {
        self.push_record(FrameRecord::Interpreted { code: Arc::clone(code), ip: 0 })
    }

    /// Records a natively compiled activation so that depth limits and
    /// stack traces cover compiled code too.
    pub fn enter_native(&mut self, name: &Arc<str>) -> Result<usize, Fault> {
        self.push_record(FrameRecord::Native { name: Arc::clone(name) })
    }

    fn push_record(&mut self, record: FrameRecord) -> Result<usize, Fault> {
        if self.frames.len() >= self.max_depth {
            return Err(Fault::insufficient_stack(self.max_depth));
        }
        self.frames.push(record);
        Ok(self.frames.len() - 1)
    }

    pub fn leave_frame(&mut self) {
        self.frames.pop();
    }

    /// Updates the fault point / call site of an interpreted record.
    pub(crate) fn set_ip(&mut self, record: usize, new_ip: usize) {
        if let Some(FrameRecord::Interpreted { ip, .. }) = self.frames.get_mut(record) {
            *ip = new_ip;
        }
    }

    /// Logical stack trace, innermost frame first.
    pub fn stack_trace(&self) -> Vec<TraceEntry> {
        self.frames
            .iter()
            .rev()
            .map(|record| match record {
                FrameRecord::Interpreted { code, ip } => code.trace_entry(*ip),
                FrameRecord::Native { name } => TraceEntry {
                    function: Arc::clone(name),
                    instruction: None,
                    lines: None,
                    file: None,
                },
            })
            .collect()
    }

    /// Raises an abort if one was requested and none is in flight.
    pub fn poll_abort(&mut self) -> Result<(), Fault> {
        if self.abort.is_requested() && self.aborting.is_none() {
            let fault = Fault::abort(self.abort.reason());
            tracing::debug!(reason = %fault, "Abort requested, raising");
            self.aborting = Some(Arc::clone(fault.exception()));
            return Err(fault);
        }
        Ok(())
    }

    /// Called when a catch handler for `abort` exits its region. Re-raises
    /// the same exception while the abort is still requested.
    pub(crate) fn reraise_abort(&mut self, abort: &ExceptionRef) -> Result<(), Fault> {
        if self.abort.is_requested() {
            self.aborting = Some(Arc::clone(abort));
            return Err(Fault::Abort(Arc::clone(abort)));
        }
        self.aborting = None;
        Ok(())
    }

    /// Forgets the in-flight abort so the next poll raises it again.
    pub(crate) fn clear_abort_in_flight(&mut self) {
        self.aborting = None;
    }

    /// Marks an abort as propagating (raised by compiled code or a host).
    pub fn note_abort(&mut self, fault: &Fault) {
        if let Fault::Abort(exception) = fault {
            self.aborting = Some(Arc::clone(exception));
        }
    }

    /// Clears the in-flight abort once it has left the outermost frame.
    pub fn finish_abort(&mut self) {
        if self.frames.is_empty() {
            self.aborting = None;
        }
    }
}
