//! A single-file, offset-linked key-value/table store.
//!
//! [`database::Database`] is the entry point: it opens (or creates) a data
//! file, keeps a secondary hash index consistent with it, and exposes
//! table/row CRUD plus filtered selects. [`cursor::DatabaseCursor`] and
//! [`indexer::Indexer`] are the two collaborators underneath it and can be
//! used directly by callers that want lower-level control.

pub mod codec;
pub mod cursor;
pub mod database;
pub mod error;
pub mod indexer;
pub mod types;
pub mod util;

pub use database::Database;
pub use error::{Error, Result};
pub use types::{DbType, Filter, FilterPart, FilterValue, Row, Scalar, Table};
