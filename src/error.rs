use thiserror::Error;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// This enum covers every failure mode of private library loading: locating and
/// mapping image files, walking PE directories of mapped images, resolving
/// imports and forwarder chains, and invoking module entry points. Each variant
/// provides specific context about the failure so callers can distinguish "file
/// was not there" from "file was there but hostile".
///
/// # Error Categories
///
/// ## Image Mapping Errors
/// - [`Error::Io`] - The image file could not be opened or read
/// - [`Error::Goblin`] - The PE file failed to parse
/// - [`Error::NotRelocatable`] - A displaced image carries no relocation data
/// - [`Error::RelocationFailed`] - The relocation walk itself failed
/// - [`Error::Unsupported`] - The image needs a declared non-goal (ordinal
///   imports, delay-load, TLS, executables)
///
/// ## Mapped-Image Errors
/// - [`Error::Malformed`] - A directory is corrupt or out of bounds
/// - [`Error::OutOfBounds`] - A read would have left the mapped span
/// - [`Error::InvalidAddress`] - An address is not mapped, or a mapping overlaps
///
/// ## Resolution Errors
/// - [`Error::DependencyNotFound`] - A transitive dependency could not be located
/// - [`Error::SymbolNotFound`] - A named import is absent from its module's exports
/// - [`Error::EntryPointFailure`] - A module's entry returned failure on attach
/// - [`Error::RecursionLimit`] - Dependency or forwarder chain exceeded its bound
/// - [`Error::ResourceExhausted`] - A fixed-capacity bootstrap table overflowed
#[derive(Error, Debug)]
pub enum Error {
    /// The image or a directory inside it is damaged and could not be parsed.
    ///
    /// The error records the source location where the malformation was
    /// detected, which matters when several walkers touch the same directory.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of what was malformed
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted while reading a mapped image.
    ///
    /// Directory walkers probe readability before dereferencing; a partial map
    /// surfaces here instead of crashing.
    #[error("Out of Bound read would have occurred!")]
    OutOfBounds,

    /// The image requires a feature that is a declared non-goal.
    ///
    /// Ordinal imports, delay-load imports, TLS directories, and non-DLL
    /// images are detected explicitly and fail loudly rather than producing a
    /// silently broken IAT.
    #[error("Unsupported feature: {0}")]
    Unsupported(&'static str),

    /// The image must be relocated but carries no usable relocation directory.
    #[error("Image requires relocation but is not relocatable")]
    NotRelocatable,

    /// The relocation walk failed on a displaced image.
    #[error("Relocation failed: {0}")]
    RelocationFailed(String),

    /// A transitive dependency could not be located on any search path.
    ///
    /// Fatal to the root load; everything already mapped for it is unwound.
    #[error("Dependency not found: {0}")]
    DependencyNotFound(String),

    /// A named import is not exported by the module it was resolved against.
    #[error("Symbol {symbol} not found in {module}")]
    SymbolNotFound {
        /// Short name of the module that was searched
        module: String,
        /// The import name that could not be resolved
        symbol: String,
    },

    /// A module's entry point returned failure on `ProcessAttach`.
    ///
    /// The loader treats the module as failed and unloads it.
    #[error("Entry point of {0} returned failure")]
    EntryPointFailure(String),

    /// A fixed-capacity bootstrap table overflowed.
    ///
    /// Only a handful of client libraries are expected before the allocator
    /// comes up; overflow is an assert in debug and a graceful failure here.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// A dependency or forwarder chain exceeded its sanity bound.
    ///
    /// The associated value is the bound that was hit. Cyclic imports
    /// terminate naturally through the registry; this guard catches the
    /// pathological rest.
    #[error("Reached the maximum recursion level allowed - {0}")]
    RecursionLimit(usize),

    /// An address is not mapped, or a new mapping would overlap an existing one.
    #[error("Invalid address {address:#x}: {reason}")]
    InvalidAddress {
        /// The offending address
        address: u64,
        /// Why the address was rejected
        reason: String,
    },

    /// Failed to lock target.
    #[error("Failed to lock target")]
    LockError,

    /// File I/O error.
    ///
    /// Wraps standard I/O errors from opening or reading image files.
    #[error("{0}")]
    Io(#[from] std::io::Error),

    /// Error from the goblin crate during PE parsing.
    ///
    /// The goblin crate parses the on-disk file layout at map time; this
    /// wraps any failure from that layer.
    #[error("{0}")]
    Goblin(#[from] goblin::error::Error),
}
