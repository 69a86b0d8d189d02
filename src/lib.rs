// FutonDB - a CouchDB-compatible document database server
// HTTP protocol adapter over an abstract document store

#![warn(rust_2018_idioms)]

pub mod server;
pub mod store;

// Re-exports for convenience
pub use store::{Database, MapExpr, MemoryEngine, StoreEngine};

/// FutonDB error types
pub mod error {
    use serde_json::{json, Value};
    use thiserror::Error;

    /// Errors surfaced by the document store and mapped onto the
    /// CouchDB wire protocol by the HTTP adapter. The adapter never
    /// invents error detail of its own; it serializes these payloads
    /// verbatim and only selects the status code per operation.
    #[derive(Error, Debug, Clone)]
    pub enum Error {
        #[error("not found: {0}")]
        NotFound(String),

        #[error("conflict: {0}")]
        Conflict(String),

        #[error("already exists: {0}")]
        AlreadyExists(String),

        #[error("bad request: {0}")]
        BadRequest(String),

        #[error("unknown error: {0}")]
        Unknown(String),
    }

    impl Error {
        /// CouchDB error name for the `error` field of a failure body.
        pub fn couch_name(&self) -> &'static str {
            match self {
                Error::NotFound(_) => "not_found",
                Error::Conflict(_) => "conflict",
                Error::AlreadyExists(_) => "file_exists",
                Error::BadRequest(_) => "bad_request",
                Error::Unknown(_) => "unknown_error",
            }
        }

        /// The human-readable `reason` carried by this error.
        pub fn reason(&self) -> &str {
            match self {
                Error::NotFound(r)
                | Error::Conflict(r)
                | Error::AlreadyExists(r)
                | Error::BadRequest(r)
                | Error::Unknown(r) => r,
            }
        }

        /// CouchDB-shaped failure body: `{"error": ..., "reason": ...}`.
        pub fn to_body(&self) -> Value {
            json!({
                "error": self.couch_name(),
                "reason": self.reason(),
            })
        }
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::error::Error;

    #[test]
    fn test_error_wire_shape() {
        let err = Error::AlreadyExists("The database could not be created.".to_string());
        let body = err.to_body();
        assert_eq!(body["error"], "file_exists");
        assert_eq!(body["reason"], "The database could not be created.");
    }
}
