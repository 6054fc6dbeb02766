use simple_error::SimpleError;
use thiserror::Error;

use crate::scheduler::SchedulerState;
use crate::types::StepIndex;

/// Failure to turn a model description into a usable kernel set.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GenerationError {
    #[error("parse error in {context}: {message}")]
    Parse { context: String, message: String },

    #[error("undeclared variable '{name}' in {context}")]
    UndeclaredVariable { context: String, name: String },

    #[error("'{name}' is not assignable in {context}")]
    NotAssignable { context: String, name: String },

    #[error("type mismatch in {context}: expected {expected}, found {found}")]
    TypeMismatch {
        context: String,
        expected: String,
        found: String,
    },

    #[error("device failed to compile kernel '{kernel}': {diagnostic}")]
    Compile { kernel: String, diagnostic: String },

    #[error("invalid model: {0}")]
    InvalidModel(String),
}

impl From<SimpleError> for GenerationError {
    fn from(err: SimpleError) -> Self {
        GenerationError::InvalidModel(err.as_str().to_string())
    }
}

/// Malformed connector range or rule.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TopologyError {
    #[error("connector '{connector}' references unknown group '{group}'")]
    UnknownGroup { connector: String, group: String },

    #[error("connector '{connector}': range {start}..{end} is invalid for group '{group}' of size {size}")]
    InvalidRange {
        connector: String,
        group: String,
        start: usize,
        end: usize,
        size: usize,
    },

    #[error("connector '{connector}': one-to-one requires equal range lengths, got {source_len} and {target_len}")]
    LengthMismatch {
        connector: String,
        source_len: usize,
        target_len: usize,
    },

    #[error("connector '{connector}': connection probability {p} is not in [0, 1]")]
    InvalidProbability { connector: String, p: f64 },

    #[error("connector '{connector}': pair ({source_index}, {target_index}) lies outside the connector ranges")]
    IndexOutOfRange {
        connector: String,
        source_index: usize,
        target_index: usize,
    },

    #[error("connector '{connector}': {message}")]
    InvalidRule { connector: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceErrorKind {
    Allocation,
    Dispatch,
    Synchronization,
    QueueFull,
    InvalidBuffer,
}

/// Failure reported by the compute device runtime.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind:?}: {message}")]
pub struct DeviceError {
    pub kind: DeviceErrorKind,
    pub message: String,
}

impl DeviceError {
    pub fn new(kind: DeviceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == DeviceErrorKind::QueueFull
    }

    pub(crate) fn poisoned(what: &str) -> Self {
        Self::new(
            DeviceErrorKind::Synchronization,
            format!("{} lock poisoned by a failed worker", what),
        )
    }
}

/// Diagnostic produced by the device when it refuses a generated program.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{diagnostic}")]
pub struct CompileError {
    pub diagnostic: String,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SimError {
    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error("{operation} is not allowed in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SchedulerState,
    },

    #[error("device error{}: {source}", at_step(.step))]
    Device {
        step: Option<StepIndex>,
        #[source]
        source: DeviceError,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl From<DeviceError> for SimError {
    fn from(source: DeviceError) -> Self {
        SimError::Device { step: None, source }
    }
}

pub type SimResult<T> = Result<T, SimError>;

fn at_step(step: &Option<StepIndex>) -> String {
    match step {
        Some(step) => format!(" at step {}", step),
        None => String::new(),
    }
}
