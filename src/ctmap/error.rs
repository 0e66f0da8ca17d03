use super::kind::Family;
use thiserror::Error;

/// Errors produced while accessing connection-tracking tables.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CtMapError {
    /// The table does not exist (e.g. the protocol family is disabled).
    ///
    /// This is never fatal: a missing table contributes zero records.
    #[error("conntrack map {map} is not present")]
    NotPresent {
        /// Name of the table.
        map: String,
    },

    /// An I/O error occurred while opening or dumping the table.
    #[error("i/o error on conntrack map {map}: {source}")]
    Io {
        /// Name of the table.
        map: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The table returned data that could not be decoded.
    #[error("conntrack map {map} is corrupt: {reason}")]
    Corrupt {
        /// Name of the table.
        map: String,
        /// Human-readable description.
        reason: String,
    },

    /// A record's key does not belong to the family of the table it was read from.
    #[error("conntrack map {map} yielded a {actual} key, expected {expected}")]
    FamilyMismatch {
        /// Name of the table.
        map: String,
        /// Family of the table.
        expected: Family,
        /// Family of the offending key.
        actual: Family,
    },

    /// Writing a single record back failed.
    #[error("failed to update entry in conntrack map {map}: {reason}")]
    Update {
        /// Name of the table.
        map: String,
        /// Human-readable description.
        reason: String,
    },
}

impl CtMapError {
    /// Returns `true` for [`CtMapError::NotPresent`].
    pub const fn is_not_present(&self) -> bool {
        matches!(self, Self::NotPresent { .. })
    }

    /// Builds the error a table backend should return when its backing object is gone.
    ///
    /// `ENOENT` becomes [`CtMapError::NotPresent`]; anything else stays an I/O error.
    pub fn from_open_error(map: impl Into<String>, source: std::io::Error) -> Self {
        let map = map.into();
        if source.kind() == std::io::ErrorKind::NotFound {
            Self::NotPresent { map }
        } else {
            Self::Io { map, source }
        }
    }
}
