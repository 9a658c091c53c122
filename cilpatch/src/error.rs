use std::path::PathBuf;

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

/// The generic Error type, covering every failure this library can return.
///
/// The variants map onto the patcher's error taxonomy: precondition failures
/// (missing files, unwritable backups) that abort a run before any mutation,
/// resolution failures (type/method/signature lookup), per-patch non-fatal
/// conditions (a call site that no longer exists), and structural-invariant
/// violations that must never reach the serializer's file write.
#[derive(Error, Debug)]
pub enum Error {
    /// The requested module file does not exist.
    #[error("assembly not found: {0}")]
    AssemblyNotFound(PathBuf),

    /// The input bytes do not parse as a compact managed module.
    ///
    /// Includes the source location where the malformation was detected,
    /// since parse failures are otherwise hard to attribute.
    #[error("malformed module - {file}:{line}: {message}")]
    Malformed {
        /// Description of what was malformed
        message: String,
        /// Source file in which the error was detected
        file: &'static str,
        /// Source line in which the error was detected
        line: u32,
    },

    /// An out of bound access was attempted while parsing the file.
    #[error("out of bound read would have occurred")]
    OutOfBounds,

    /// The module carries a format version this library does not understand.
    #[error("unsupported module format version: {0}")]
    NotSupported(u16),

    /// Provided input was empty.
    #[error("provided input was empty")]
    Empty,

    /// File I/O error.
    #[error("{0}")]
    FileError(#[from] std::io::Error),

    /// The one-time backup copy could not be created.
    ///
    /// This aborts the entire patch run before any mutation occurs.
    #[error("failed to create backup {path}: {source}")]
    BackupWrite {
        /// The backup path that could not be written
        path: PathBuf,
        /// The underlying I/O failure
        source: std::io::Error,
    },

    /// A referenced sibling module could not be located in any search directory.
    #[error("could not resolve referenced module '{0}' in any search directory")]
    ReferenceResolution(String),

    /// No type definition with the given full name exists in the image.
    #[error("type not found: {0}")]
    TypeNotFound(String),

    /// The declaring type exists but has no method with the given name.
    #[error("method not found: {type_name}.{method_name}")]
    MethodNotFound {
        /// Full name of the declaring type
        type_name: String,
        /// Name of the missing method
        method_name: String,
    },

    /// A method with the right name exists, but its signature does not satisfy
    /// the constraints.
    #[error("signature mismatch for {type_name}.{method_name}: {details}")]
    SignatureMismatch {
        /// Full name of the declaring type
        type_name: String,
        /// Name of the method
        method_name: String,
        /// What differed from the constraint
        details: String,
    },

    /// The constraint list matched more than one method definition.
    ///
    /// The constraints are supposed to uniquely identify the target; picking
    /// either candidate silently would patch the wrong method.
    #[error("ambiguous method target {type_name}.{method_name}: {count} candidates match")]
    AmbiguousMethod {
        /// Full name of the declaring type
        type_name: String,
        /// Name of the method
        method_name: String,
        /// Number of candidates that satisfied all constraints
        count: usize,
    },

    /// The intercepted parameter is not of the type the injector requires.
    #[error("parameter type mismatch in {method}: expected {expected}, found {found}")]
    ParameterTypeMismatch {
        /// The method being patched
        method: String,
        /// The parameter type the injector requires
        expected: String,
        /// The parameter type actually declared
        found: String,
    },

    /// No instruction in the method body matched the call-site predicate.
    ///
    /// Non-fatal per patch: the target's internal structure changed and this
    /// particular patch no longer applies, but independent patches continue.
    #[error("call site not found: no call to '{callee}' in {method}")]
    CallSiteNotFound {
        /// The method that was searched
        method: String,
        /// The callee name the predicate looked for
        callee: String,
    },

    /// A field with the bootstrap flag's name already exists with an
    /// incompatible type or storage class.
    #[error("flag field conflict on {type_name}: '{field_name}' exists with an incompatible shape")]
    FlagFieldConflict {
        /// The type the flag was to be added to
        type_name: String,
        /// The conflicting field name
        field_name: String,
    },

    /// A mutation left (or would leave) a method body structurally invalid.
    ///
    /// Injectors must never produce such a state; hitting this is a defect in
    /// the injector, not a normal runtime failure.
    #[error("structural invariant violated in {method}: {details}")]
    StructuralInvariant {
        /// The method whose body is invalid
        method: String,
        /// Which invariant was broken
        details: String,
    },

    /// The in-memory image could not be serialized.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Evaluation of a method body failed (unhandled exception, invalid
    /// state, or fuel exhaustion). Used by the evaluation engine only.
    #[error("evaluation failed: {0}")]
    Evaluation(String),
}
