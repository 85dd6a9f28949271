use std::io;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("failed to resolve required path: {0}")]
    Path(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error("{0}")]
    Config(String),
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    #[error("alias rejected: {0}")]
    InvalidAlias(String),
    #[error("coordinate out of range: lat {lat}, lon {lon}")]
    InvalidCoordinate { lat: f64, lon: f64 },
}

/// Raised when text still carries character-set corruption after repair.
///
/// Such an address is never cached or retried automatically; it has to be
/// fixed where it entered the system.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("address still corrupted after decoding ({markers:?}): {text:?}")]
pub struct EncodingError {
    pub text: String,
    pub markers: Vec<char>,
}

impl AppError {
    pub fn is_encoding(&self) -> bool {
        matches!(self, AppError::Encoding(_))
    }
}
