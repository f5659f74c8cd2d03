use std::io;
use thiserror::Error;

/// Errors produced by the resolver, interceptor, scanner and patch controller.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid parameter
    #[error("invalid parameter")]
    InvalidParameter,

    /// Error occurs when modifying the memory protect
    #[error("memory protect error, code:{0}")]
    MemoryProtect(i32),

    /// The address is not inside any mapping of this process
    #[error("address {0:#x} is not mapped")]
    Unmapped(usize),

    #[error("memory allocation error")]
    MemoryAllocation,

    /// Can't disassemble in the specified address
    #[error("disassemble error at {0:#x}")]
    Disassemble(usize),

    /// The stolen instructions could not be re-encoded in the trampoline
    #[error("moving code error")]
    MoveCode,

    /// The stolen instructions contain something the relocator refuses to move
    #[error("moving code not supported")]
    MovingCodeNotSupported,

    /// A hook with the same identity or on the same target already exists
    #[error("{id} is already hooked (target {target:#x})")]
    AlreadyHooked { id: &'static str, target: usize },

    /// No hook backend exists for this architecture
    #[error("hooking is not supported on this architecture")]
    UnsupportedArch,

    #[error("module not loaded: {0}")]
    ModuleNotFound(String),

    #[error("symbol not found: {module}!{symbol}")]
    SymbolNotFound { module: String, symbol: String },

    /// A polled resource never became available
    #[error("{what} never became available after {attempts} attempts")]
    NeverAvailable { what: String, attempts: u32 },

    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    /// Some io error
    #[error("io error")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn last_os_error() -> Self {
        Error::MemoryProtect(io::Error::last_os_error().raw_os_error().unwrap_or(-1))
    }
}
