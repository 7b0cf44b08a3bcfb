//! Secondary hash index: `table -> column -> hash(value) -> [row offset]`,
//! kept in memory and persisted as a JSON sidecar next to the data file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::cursor::DatabaseCursor;
use crate::error::{Error, Result};
use crate::types::Scalar;

type Buckets = BTreeMap<String, BTreeMap<String, BTreeMap<String, Vec<u64>>>>;

/// In-memory secondary index over every indexed `(table, column)` pair.
pub struct Indexer {
	buckets: Buckets,
}

/// Hex-encoded MD5 digest of a value's textual form. Collisions are
/// tolerated: candidate offsets returned by the index are never verified
/// against the original filter value before being handed back.
fn hash_value(value: &Scalar) -> String {
	hex::encode(md5::compute(value.as_hash_input().as_bytes()).0)
}

/// Sidecar path for a given data file: `<path>.index.json`.
pub fn sidecar_path(db_path: &Path) -> PathBuf {
	let mut name = db_path.as_os_str().to_os_string();
	name.push(".index.json");
	PathBuf::from(name)
}

impl Indexer {
	pub fn new() -> Indexer {
		Indexer { buckets: BTreeMap::new() }
	}

	/// Register `table` as indexable (possibly with no indexed columns
	/// yet) so lookups against it don't spuriously look like "unknown
	/// table".
	pub fn ensure_table(&mut self, table_name: &str) {
		self.buckets.entry(table_name.to_string()).or_default();
	}

	/// Full scan over `table_name`, populating buckets for every column in
	/// its `indexes` set.
	pub fn build_for_table(&mut self, cursor: &DatabaseCursor, table_name: &str) -> Result<()> {
		let table = cursor.get_table(table_name)?.clone();
		self.ensure_table(table_name);
		for row in cursor.rows(table_name)? {
			let (row, offset) = row?;
			for column in &table.indexes {
				if let Some(value) = row.data.get(column) {
					self.insert_one(table_name, column, value, offset);
				}
			}
		}
		log::info!(target: "slotdb", "built index for table '{}' ({} column(s))", table_name, table.indexes.len());
		Ok(())
	}

	/// Full scan building just one newly-declared indexed column.
	pub fn build_for_table_key(&mut self, cursor: &DatabaseCursor, table_name: &str, key: &str) -> Result<()> {
		let table = cursor.get_table(table_name)?;
		if !table.keys.contains_key(key) {
			return Err(Error::NotFound(format!("column '{}' on table '{}'", key, table_name)));
		}
		self.ensure_table(table_name);
		for row in cursor.rows(table_name)? {
			let (row, offset) = row?;
			if let Some(value) = row.data.get(key) {
				self.insert_one(table_name, key, value, offset);
			}
		}
		Ok(())
	}

	/// Incrementally index a freshly inserted row against every column in
	/// `indexes`.
	pub fn add_item(
		&mut self,
		table_name: &str,
		indexes: &std::collections::BTreeSet<String>,
		data: &BTreeMap<String, Scalar>,
		offset: u64,
	) {
		for column in indexes {
			if let Some(value) = data.get(column) {
				self.insert_one(table_name, column, value, offset);
			}
		}
	}

	fn insert_one(&mut self, table_name: &str, column: &str, value: &Scalar, offset: u64) {
		let bucket = self
			.buckets
			.entry(table_name.to_string())
			.or_default()
			.entry(column.to_string())
			.or_default()
			.entry(hash_value(value))
			.or_default();
		if !bucket.contains(&offset) {
			bucket.push(offset);
		}
	}

	/// Candidate row offsets for `table.column == value`. Errors if the
	/// column is not indexed.
	pub fn get_offsets_for(&self, table_name: &str, column: &str, value: &Scalar) -> Result<Vec<u64>> {
		let table_buckets = self
			.buckets
			.get(table_name)
			.ok_or_else(|| Error::MissingIndex { table: table_name.into(), column: column.into() })?;
		let column_buckets = table_buckets
			.get(column)
			.ok_or_else(|| Error::MissingIndex { table: table_name.into(), column: column.into() })?;
		Ok(column_buckets.get(&hash_value(value)).cloned().unwrap_or_default())
	}

	pub fn has_index(&self, table_name: &str, column: &str) -> bool {
		self.buckets.get(table_name).map(|cols| cols.contains_key(column)).unwrap_or(false)
	}

	/// Persist the whole mapping as pretty-printed JSON next to the data file.
	pub fn save(&self, db_path: &Path) -> Result<()> {
		let path = sidecar_path(db_path);
		let json = serde_json::to_vec_pretty(&self.buckets)?;
		std::fs::write(path, json)?;
		Ok(())
	}

	/// Load a previously saved sidecar, or `None` if it is missing or
	/// unreadable (the caller falls back to rebuilding from a scan).
	pub fn load(db_path: &Path) -> Option<Indexer> {
		let path = sidecar_path(db_path);
		let bytes = std::fs::read(&path).ok()?;
		let buckets: Buckets = serde_json::from_slice(&bytes).ok()?;
		Some(Indexer { buckets })
	}
}
