use thiserror::Error;

use crate::{HEADER_SIZE, MAX_NAME_LEN};

pub type EggResult<T> = Result<T, EggError>;

#[derive(Error, Debug)]
pub enum EggError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("At least one input is required")]
    EmptyInput,
    #[error("File name is {len} bytes, longer than {MAX_NAME_LEN}: {name}")]
    NameTooLong { name: String, len: usize },
    #[error("File name contains a NUL byte: {0:?}")]
    InvalidName(String),
    #[error("Unable to read {name}: {source}")]
    SourceRead {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{0} does not fit in the 32-bit fields of an archive")]
    TooLarge(String),
    #[error("Invalid Archive: Magic bytes mismatch")]
    BadMagic,
    #[error("Invalid Archive: {len} bytes is shorter than the {HEADER_SIZE}-byte header")]
    Truncated { len: usize },
    #[error("Corrupt Archive: {0}")]
    CorruptArchive(String),
    #[error("File not found: {0}")]
    NotFound(String),
}

impl EggError {
    pub(crate) fn corrupt(reason: impl Into<String>) -> Self {
        Self::CorruptArchive(reason.into())
    }
}
