//! Common error types for noby.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`NobyError`].
pub type NobyResult<T> = Result<T, NobyError>;

/// Errors raised by the parser, the layer store and the build engine.
#[derive(Error, Diagnostic, Debug)]
pub enum NobyError {
    /// The build file is malformed.
    #[error("Parse error on line {line}: {message}")]
    #[diagnostic(
        code(noby::parse),
        help("Supported instructions are FROM, ENV, HOST and RUN")
    )]
    Parse {
        /// Line number (1-based) where the offending instruction starts.
        line: usize,
        /// What was wrong with it.
        message: String,
    },

    /// The `FROM` reference names neither a tag nor a sealed layer.
    #[error("Unresolved base image: {reference}")]
    #[diagnostic(
        code(noby::build::unresolved_base),
        help("Use `scratch`, an existing tag, or a layer key listed by `noby layers`")
    )]
    UnresolvedBase {
        /// The reference that could not be resolved.
        reference: String,
    },

    /// A snapshot backend operation failed.
    #[error("Storage error during {operation}: {message}")]
    #[diagnostic(code(noby::store::backend))]
    Storage {
        /// The operation that failed (create, snapshot, delete, ...).
        operation: String,
        /// Backend error detail.
        message: String,
    },

    /// A HOST or RUN command failed or could not be started.
    #[error(
        "Instruction #{index} failed ({}){}: {command}: {message}",
        exit_code.map_or_else(|| "no exit code".to_string(), |c| format!("exit code {c}")),
        line.map_or_else(String::new, |l| format!(" on line {l}"))
    )]
    #[diagnostic(code(noby::build::execution))]
    Execution {
        /// Index of the instruction within the plan.
        index: usize,
        /// Source line in the build file, when there is one.
        line: Option<usize>,
        /// The command text.
        command: String,
        /// Exit code, if the process ran to completion.
        exit_code: Option<i32>,
        /// Failure detail.
        message: String,
    },

    /// A layer key already exists with different content.
    #[error("Layer {key} already exists with different content (expected {expected}, got {actual})")]
    #[diagnostic(
        code(noby::store::conflict),
        help("The existing layer is kept; non-reproducible commands are the usual cause")
    )]
    Conflict {
        /// The colliding layer key.
        key: String,
        /// Content digest of the existing layer.
        expected: String,
        /// Content digest of the rejected snapshot.
        actual: String,
    },

    /// A layer cannot be deleted while something references it.
    #[error("Layer {key} is in use by {}", referrers.join(", "))]
    #[diagnostic(
        code(noby::store::in_use),
        help("Remove the referencing tags or child layers first, or run `noby gc`")
    )]
    InUse {
        /// The referenced layer key.
        key: String,
        /// Tags and child layers referencing it.
        referrers: Vec<String>,
    },

    /// Layer not present in the index.
    #[error("Layer not found: {key}")]
    #[diagnostic(code(noby::store::layer_not_found))]
    LayerNotFound {
        /// The missing layer key.
        key: String,
    },

    /// Tag not present in the registry.
    #[error("Tag not found: {tag}")]
    #[diagnostic(code(noby::tag::not_found))]
    TagNotFound {
        /// The missing tag.
        tag: String,
    },

    /// Invalid tag name.
    #[error("Invalid tag: {tag}")]
    #[diagnostic(
        code(noby::tag::invalid),
        help("Tags are 1-128 characters of [A-Za-z0-9_.:/-], start alphanumeric, and may not be `scratch`")
    )]
    InvalidTag {
        /// The rejected tag.
        tag: String,
    },

    /// Invalid layer key format.
    #[error("Invalid layer key: {key}")]
    #[diagnostic(
        code(noby::store::invalid_key),
        help("Layer keys are 64 lowercase hex characters")
    )]
    InvalidLayerKey {
        /// The rejected key.
        key: String,
    },

    /// The store is locked by another process.
    #[error("Store is locked by another process: {holder}")]
    #[diagnostic(
        code(noby::store::locked),
        help("Wait for the other noby process to finish")
    )]
    Locked {
        /// Description of the lock holder.
        holder: String,
    },

    /// The build was aborted between instructions.
    #[error("Build aborted before instruction #{index}")]
    #[diagnostic(code(noby::build::aborted))]
    Aborted {
        /// Index of the next instruction that was not started.
        index: usize,
    },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(noby::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(noby::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(noby::serialization))]
    Serialization(String),

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(
        code(noby::internal),
        help("This is a bug, please report it at https://github.com/artizirk/noby/issues")
    )]
    Internal {
        /// The error message.
        message: String,
    },
}

impl NobyError {
    /// Shorthand for a [`NobyError::Storage`] error.
    pub fn storage(operation: impl Into<String>, message: impl ToString) -> Self {
        Self::Storage {
            operation: operation.into(),
            message: message.to_string(),
        }
    }
}

impl From<serde_json::Error> for NobyError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
