use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{}: {defect}", path.display())]
    Format { path: PathBuf, defect: String },

    #[error("{what} not found in {}", path.display())]
    NotFound { path: PathBuf, what: String },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("environment: {0}")]
    Environment(String),

    #[error("configuration: {0}")]
    Config(String),

    #[error("precondition violated: {0}")]
    Precondition(String),
}

impl Error {
    pub fn format(path: &Path, defect: impl Into<String>) -> Self {
        Error::Format {
            path: path.to_path_buf(),
            defect: defect.into(),
        }
    }

    pub fn not_found(path: &Path, what: impl Into<String>) -> Self {
        Error::NotFound {
            path: path.to_path_buf(),
            what: what.into(),
        }
    }

    pub fn io(path: &Path, source: io::Error) -> Self {
        Error::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
