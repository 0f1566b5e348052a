use thiserror::Error;

/// Malformed data on the wire. The transport treats this as a retryable fault.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed frame: {reason}")]
pub struct FrameError {
    pub reason: String,
}

impl FrameError {
    pub fn new<S: Into<String>>(reason: S) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("no response within {0}ms")]
    Timeout(u64),
    #[error("connection reset: {0}")]
    Reset(String),
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
    #[error("shutdown in progress")]
    ShuttingDown,
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("device returned modbus exception {code:#04x} for function {function:#04x}")]
    Exception { function: u8, code: u8 },
}

impl TransportError {
    /// Exceptions are answers from the device, repeating the request won't change them.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Reset(_) | Self::Frame(_))
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegisterError {
    #[error("register {name} is not available on firmware {version}")]
    Unsupported { name: String, version: String },
    #[error("register {0} is read-only")]
    ReadOnly(String),
    #[error("value {value} does not fit register {name}")]
    OutOfRange { name: String, value: f64 },
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("register {name} reads back {actual} after writing {wanted}")]
pub struct WriteMismatchError {
    pub name: String,
    pub wanted: f64,
    pub actual: f64,
}
