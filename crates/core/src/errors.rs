//! Error types and handling
//!
//! The error taxonomy is split per domain (configuration, artifact cache,
//! artifact fetching, templating, supervised processes). Every domain enum is
//! wrapped in the top-level [`SidecarsError`], and per-sidecar failures are
//! wrapped once more with [`SidecarsError::Sidecar`] so operators always see
//! which sidecar went wrong.

use thiserror::Error;

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Sidecar declared without a name
    #[error("You must provide a name to your sidecar")]
    MissingName,

    /// Sidecar declared without an executable
    #[error("You must provide an executable path to your sidecar {name}")]
    MissingExecutable { name: String },

    /// Name that is not usable as a single directory component
    #[error("Invalid sidecar name '{name}': it must not contain '/', '\\' or '..' nor start with '.'")]
    InvalidName { name: String },

    /// Two sidecars share the same name
    #[error("Duplicate sidecar name: {name}")]
    DuplicateName { name: String },

    /// Configuration file parsing error
    #[error("Failed to parse configuration file {path}: {message}")]
    Parsing { path: String, message: String },

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    NotFound { path: String },

    /// Resolved working directory does not exist
    #[error("Workdir '{path}' doesn't exist")]
    WorkDirMissing { path: String },

    /// Port value that cannot be parsed
    #[error("Invalid port value '{value}' in {source_name}")]
    InvalidPort { value: String, source_name: String },

    /// Configuration file I/O error
    #[error("Failed to read configuration file")]
    Io(#[from] std::io::Error),
}

/// Artifact index (cache metadata) errors
#[derive(Error, Debug)]
pub enum CacheError {
    /// Index file exists but cannot be decoded
    #[error("Index file {path} is corrupt: {message}")]
    Corrupt { path: String, message: String },

    /// Index file cannot be read or written
    #[error("Index file {path} I/O error: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Index entries cannot be encoded
    #[error("Failed to serialize index: {message}")]
    Serialize { message: String },
}

/// Artifact download and extraction errors
#[derive(Error, Debug)]
pub enum FetchError {
    /// Content could not be retrieved from its source
    #[error("Download error for {uri}: {message}")]
    Download { uri: String, message: String },

    /// Declared content hash does not match the fetched content
    #[error("Sha1 '{expected}' mismatch with current sha1 '{actual}'")]
    HashMismatch { expected: String, actual: String },

    /// Generic extraction failure
    #[error("Extraction error: {message}")]
    Extraction { message: String },

    /// Archive entry resolves outside of the destination directory
    #[error("Archive entry '{entry}' escapes the destination directory")]
    PathTraversal { entry: String },

    /// Archive entry kind that is not extracted (links, devices, ...)
    #[error("Unsupported archive entry '{entry}' ({kind})")]
    UnsupportedEntry { entry: String, kind: String },

    /// Artifact type that is neither declared nor inferable
    #[error("Unsupported artifact type '{kind}' for {uri}")]
    UnsupportedFormat { uri: String, kind: String },

    /// Local file system error while storing or reading an archive
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Environment templating errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    /// Reference to a variable missing from the environment
    #[error("Unresolved variable reference '{fragment}'")]
    Unresolved { fragment: String },

    /// Reference that is not a valid `$VAR` / `${VAR}` form
    #[error("Malformed variable reference '{fragment}'")]
    Malformed { fragment: String },
}

/// Supervised process errors
#[derive(Error, Debug)]
pub enum ProcessError {
    /// Process could not be started
    #[error("Failed to start {role} {name}: {source}")]
    Spawn {
        name: String,
        role: String,
        #[source]
        source: std::io::Error,
    },

    /// Process exited unsuccessfully
    #[error("Error occurred on {role} {name}: {status}")]
    Exited {
        name: String,
        role: String,
        status: String,
    },

    /// Waiting on the process failed
    #[error("Failed to wait for {role} {name}: {source}")]
    Wait {
        name: String,
        role: String,
        #[source]
        source: std::io::Error,
    },

    /// Helper script (after install) failed
    #[error("Script '{script}' failed: {status}")]
    Script { script: String, status: String },
}

/// Main error enum wrapping all domain-specific errors
#[derive(Error, Debug)]
pub enum SidecarsError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Artifact index errors
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// Artifact download/extraction errors
    #[error("Artifact error: {0}")]
    Fetch(#[from] FetchError),

    /// Templating errors
    #[error("Templating error: {0}")]
    Template(#[from] TemplateError),

    /// Supervised process errors
    #[error("{0}")]
    Process(#[from] ProcessError),

    /// Cached hash differs from the declared hash for an unchanged URI
    #[error("Verification error: {reason}")]
    Verification { reason: String },

    /// No platform collaborator matched the environment
    #[error("Could not find a starter for cloud env '{env}'")]
    NoStarter { env: String },

    /// Any error tied to a single sidecar
    #[error("Error on sidecar {name}: {source}")]
    Sidecar {
        name: String,
        #[source]
        source: Box<SidecarsError>,
    },

    /// Plain I/O errors (profile files, directories)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SidecarsError {
    /// Wrap an error with the name of the sidecar it belongs to
    pub fn for_sidecar(name: impl Into<String>, err: impl Into<SidecarsError>) -> Self {
        SidecarsError::Sidecar {
            name: name.into(),
            source: Box::new(err.into()),
        }
    }

    /// Name of the sidecar this error is attached to, if any
    pub fn sidecar_name(&self) -> Option<&str> {
        match self {
            SidecarsError::Sidecar { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Whether this error (or the error it wraps) is a content verification failure
    pub fn is_verification(&self) -> bool {
        match self {
            SidecarsError::Verification { .. } => true,
            SidecarsError::Fetch(FetchError::HashMismatch { .. }) => true,
            SidecarsError::Sidecar { source, .. } => source.is_verification(),
            _ => false,
        }
    }
}

/// Convenience type alias for Results with SidecarsError
pub type Result<T> = std::result::Result<T, SidecarsError>;
