use super::Value;
use crate::types::ExceptionClass;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

pub type ExceptionRef = Arc<ExceptionObject>;

/// One entry of a logical stack trace.
#[derive(Clone, Debug, PartialEq)]
pub struct TraceEntry {
    /// Name of the lambda (or native callable) the frame belongs to.
    pub function: Arc<str>,
    /// Instruction index of the fault point or call site. `None` for frames
    /// without an instruction stream.
    pub instruction: Option<usize>,
    /// Source line range from debug info, when available.
    pub lines: Option<(u32, u32)>,
    pub file: Option<Arc<str>>,
}

impl fmt::Display for TraceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "at {}", self.function)?;
        match (&self.file, self.lines) {
            (Some(file), Some((start, _))) => write!(f, " in {}:line {}", file, start)?,
            (None, Some((start, _))) => write!(f, " line {}", start)?,
            _ => {}
        }
        if let Some(ip) = self.instruction {
            write!(f, " [ip {}]", ip)?;
        }
        Ok(())
    }
}

/// A thrown exception. Identity matters: rethrowing propagates the same
/// `Arc`, and the stack trace is captured once, at the first fault point.
pub struct ExceptionObject {
    class: Arc<ExceptionClass>,
    message: String,
    payload: Value,
    trace: Mutex<Option<Vec<TraceEntry>>>,
}

impl ExceptionObject {
    pub fn new(class: &Arc<ExceptionClass>, message: impl Into<String>) -> ExceptionRef {
        Self::with_payload(class, message, Value::Null)
    }

    pub fn with_payload(class: &Arc<ExceptionClass>, message: impl Into<String>, payload: Value) -> ExceptionRef {
        Arc::new(Self {
            class: Arc::clone(class),
            message: message.into(),
            payload,
            trace: Mutex::new(None),
        })
    }

    pub fn class(&self) -> &Arc<ExceptionClass> {
        &self.class
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn stack_trace(&self) -> Option<Vec<TraceEntry>> {
        self.trace.lock().clone()
    }

    pub fn has_stack_trace(&self) -> bool {
        self.trace.lock().is_some()
    }

    /// Records the trace unless one was already captured.
    pub fn set_stack_trace_if_absent(&self, make: impl FnOnce() -> Vec<TraceEntry>) {
        let mut trace = self.trace.lock();
        if trace.is_none() {
            *trace = Some(make());
        }
    }
}

impl fmt::Debug for ExceptionObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class.name(), self.message)
    }
}
