//! Error types for the scripting bridge

use std::path::PathBuf;

use thiserror::Error;

/// A marshalled value failed a type or range check
///
/// Rendered the way Lua's own argument errors read, so scripts see
/// `bad argument #2 (value must be less than or equal to 255)`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("bad argument #{narg} ({message})")]
pub struct ArgumentError {
    /// 1-based argument position
    pub narg: usize,
    pub message: String,
}

impl ArgumentError {
    pub fn new(narg: usize, message: impl Into<String>) -> Self {
        Self {
            narg,
            message: message.into(),
        }
    }

    /// `<expected> expected, got <found>`
    pub fn type_mismatch(narg: usize, expected: &str, found: &str) -> Self {
        Self::new(narg, format!("{} expected, got {}", expected, found))
    }
}

impl From<ArgumentError> for mlua::Error {
    fn from(err: ArgumentError) -> Self {
        mlua::Error::RuntimeError(err.to_string())
    }
}

/// Why a registration was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    #[error("couldn't find a {kind} with (ID: {id})")]
    UnknownDefinition { kind: &'static str, id: u32 },

    #[error("{category} bindings require an entry id")]
    MissingEntry { category: &'static str },
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Argument(#[from] ArgumentError),

    #[error("{category}: {source}")]
    Registration {
        category: &'static str,
        #[source]
        source: RegistrationError,
    },

    #[error("error loading `{}`: {source}", path.display())]
    Load {
        path: PathBuf,
        #[source]
        source: mlua::Error,
    },

    #[error(
        "error loading `{}`: file with same name already loaded from `{}`, rename either file",
        path.display(),
        existing.display()
    )]
    NameConflict {
        name: String,
        path: PathBuf,
        existing: PathBuf,
    },

    #[error("cannot execute call: registered value is {found}, not a function")]
    NotCallable { found: &'static str },

    #[error("script call failed: {0}")]
    Call(#[source] mlua::Error),

    #[error("bridge is not initialized")]
    NotInitialized,

    #[error(transparent)]
    Runtime(#[from] mlua::Error),
}

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;
