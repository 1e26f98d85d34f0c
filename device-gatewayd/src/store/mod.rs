pub mod db;
pub mod hash;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("device {0} not found")]
    NotFound(String),

    /// A known name was announced with a different hardware id.
    #[error("device {name} is bound to hardware id {stored}, refusing {advertised}")]
    IdentityMismatch {
        name: String,
        stored: String,
        advertised: String,
    },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("device store is not running")]
    Closed,
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
