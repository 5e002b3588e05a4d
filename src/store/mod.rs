//! Persistence seams: JSON blob storage for run artifacts and a SQLite
//! table for externally visible run status.

pub mod blob;
pub mod status;

pub use blob::{BlobStore, FsBlobStore};
pub use status::{RunStatusStore, SqliteRunStatusStore};
