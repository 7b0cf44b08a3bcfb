use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Every failure mode the storage engine, indexer and façade can surface.
#[derive(Error, Debug)]
pub enum Error {
	#[error("not a slotdb database file: {0}")]
	IncorrectDatabase(String),

	#[error("duplicate name: {0}")]
	DuplicateName(String),

	#[error("not found: {0}")]
	NotFound(String),

	#[error("schema mismatch in table '{table}': {reason}")]
	SchemaMismatch { table: String, reason: String },

	#[error("column '{column}' of table '{table}' is not indexed")]
	MissingIndex { table: String, column: String },

	#[error("filter must not be empty for an index-accelerated lookup")]
	InvalidFilter,

	#[error(transparent)]
	Io(#[from] std::io::Error),

	#[error("record codec error: {0}")]
	Codec(#[from] serde_json::Error),
}
