//! User-facing façade: maps `Table`/`Row` DTOs onto the cursor and indexer,
//! and resolves filters either by full scan or index lookup.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;

use rand::Rng;

use crate::cursor::DatabaseCursor;
use crate::error::{Error, Result};
use crate::indexer::Indexer;
use crate::types::{DbType, Filter, FilterValue, Row, Scalar, Table};

pub struct Database {
	cursor: DatabaseCursor,
	indexer: Indexer,
}

impl Database {
	/// Open (or create) the database file at `path`. The index sidecar is
	/// loaded if present; otherwise it is rebuilt from a full scan of every
	/// table, matching what a corrupted or deleted sidecar recovers to.
	pub fn open(path: impl AsRef<Path>) -> Result<Database> {
		let cursor = DatabaseCursor::open(path)?;
		let indexer = match Indexer::load(cursor.path()) {
			Some(indexer) => indexer,
			None => {
				log::warn!(
					target: "slotdb",
					"index sidecar missing or unreadable for {}, rebuilding from scan",
					cursor.path().display()
				);
				let mut indexer = Indexer::new();
				for table in cursor.read_all_tables()? {
					indexer.build_for_table(&cursor, &table.name)?;
				}
				indexer
			}
		};
		Ok(Database { cursor, indexer })
	}

	/// Flush the index sidecar to disk. Call on orderly shutdown.
	pub fn close(&self) -> Result<()> {
		self.indexer.save(self.cursor.path())?;
		self.cursor.flush()
	}

	pub fn create_table(&mut self, name: &str, keys: BTreeMap<String, DbType>) -> Result<Table> {
		let (table, _offset) = self.cursor.write_table_meta(name, keys)?;
		self.indexer.ensure_table(name);
		Ok(Table::from(&table))
	}

	pub fn create_index(&mut self, table_name: &str, column: &str) -> Result<()> {
		let (mut table, offset) = {
			let table = self.cursor.get_table(table_name)?.clone();
			let offset = self.cursor.get_table_offset(table_name)?;
			(table, offset)
		};
		if !table.keys.contains_key(column) {
			return Err(Error::NotFound(format!("column '{}' on table '{}'", column, table_name)));
		}
		if table.indexes.contains(column) {
			return Err(Error::DuplicateName(format!("index on '{}'.'{}'", table_name, column)));
		}
		table.indexes.insert(column.to_string());
		self.cursor.override_table_meta(table, offset)?;
		self.indexer.build_for_table_key(&self.cursor, table_name, column)?;
		log::info!(target: "slotdb", "created index on '{}'.'{}'", table_name, column);
		Ok(())
	}

	pub fn list_tables(&self) -> Vec<Table> {
		self.cursor.table_names().map(|name| Table::from(self.cursor.get_table(name).unwrap())).collect()
	}

	pub fn insert(&mut self, table_name: &str, data: BTreeMap<String, Scalar>) -> Result<Row> {
		let (row, offset) = self.cursor.write_row_meta(table_name, data)?;
		let indexes = self.cursor.get_table(table_name)?.indexes.clone();
		self.indexer.add_item(table_name, &indexes, &row.data, offset);
		Ok(Row::from(&row))
	}

	/// Insert `amount` rows with generated values: a random `i64` in
	/// `[0, 1000)` for `int` columns, a random UUID string for `str`
	/// columns.
	pub fn insert_auto(&mut self, table_name: &str, amount: u32) -> Result<Vec<Row>> {
		let keys = self.cursor.get_table(table_name)?.keys.clone();
		let mut rows = Vec::with_capacity(amount as usize);
		let mut rng = rand::thread_rng();
		for _ in 0..amount {
			let data: BTreeMap<String, Scalar> = keys
				.iter()
				.map(|(key, ty)| {
					let value = match ty {
						DbType::Int => Scalar::Int(rng.gen_range(0..1000)),
						DbType::Str => Scalar::Str(uuid::Uuid::new_v4().to_string()),
					};
					(key.clone(), value)
				})
				.collect();
			rows.push(self.insert(table_name, data)?);
		}
		Ok(rows)
	}

	/// Coerce every scalar in `filter` to its column's declared type, so
	/// `"1"` matches an `int` column holding `1`.
	fn coerce_filter(&self, table_name: &str, filter: &Filter) -> Result<Filter> {
		let table = self.cursor.get_table(table_name)?;
		let coerce_part = |part: &BTreeMap<String, FilterValue>| -> BTreeMap<String, FilterValue> {
			part.iter()
				.map(|(key, value)| {
					let coerced = match table.keys.get(key) {
						Some(ty) => match value {
							FilterValue::One(v) => FilterValue::One(v.coerce(*ty).unwrap_or_else(|_| v.clone())),
							FilterValue::Many(vs) => FilterValue::Many(
								vs.iter().map(|v| v.coerce(*ty).unwrap_or_else(|_| v.clone())).collect(),
							),
						},
						None => value.clone(),
					};
					(key.clone(), coerced)
				})
				.collect()
		};
		Ok(match filter {
			Filter::Part(part) => Filter::Part(coerce_part(part)),
			Filter::Parts(parts) => Filter::Parts(parts.iter().map(coerce_part).collect()),
		})
	}

	/// Scan `table_name` row by row, keeping those matching `filter`
	/// (OR-of-ANDs; an empty filter keeps every row), in list order.
	pub fn select(&self, table_name: &str, filter: &Filter, limit: Option<usize>) -> Result<Vec<Row>> {
		let filter = self.coerce_filter(table_name, filter)?;
		let mut out = Vec::new();
		for entry in self.cursor.rows(table_name)? {
			let (row, _offset) = entry?;
			if filter.matches(&row.data) {
				out.push(Row::from(&row));
				if let Some(limit) = limit {
					if out.len() >= limit {
						break;
					}
				}
			}
		}
		Ok(out)
	}

	/// Resolve `filter` through the secondary index instead of scanning.
	/// Every column referenced by the filter must be indexed; an empty
	/// filter is rejected ([`Error::InvalidFilter`]), matching the
	/// external CLI's `--use-index` requirement.
	pub fn select_indexed(&self, table_name: &str, filter: &Filter, limit: Option<usize>) -> Result<Vec<Row>> {
		if filter.is_empty() {
			return Err(Error::InvalidFilter);
		}
		let filter = self.coerce_filter(table_name, filter)?;

		for part in filter.parts() {
			for column in part.keys() {
				if !self.indexer.has_index(table_name, column) {
					return Err(Error::MissingIndex { table: table_name.into(), column: column.clone() });
				}
			}
		}

		let mut combined: HashSet<u64> = HashSet::new();
		for part in filter.parts() {
			let mut part_offsets: Option<HashSet<u64>> = None;
			for (column, value) in part {
				let mut key_offsets: HashSet<u64> = HashSet::new();
				for scalar in value.candidates() {
					key_offsets.extend(self.indexer.get_offsets_for(table_name, column, scalar)?);
				}
				part_offsets = Some(match part_offsets {
					None => key_offsets,
					Some(acc) => acc.intersection(&key_offsets).copied().collect(),
				});
			}
			if let Some(offsets) = part_offsets {
				combined.extend(offsets);
			}
		}

		let mut offsets: Vec<u64> = combined.into_iter().collect();
		offsets.sort_unstable();
		let mut out = Vec::new();
		for offset in offsets {
			let row = self.cursor.row_at(offset)?;
			out.push(Row::from(&row));
			if let Some(limit) = limit {
				if out.len() >= limit {
					break;
				}
			}
		}
		Ok(out)
	}

	pub fn indexed_columns(&self, table_name: &str) -> Result<BTreeSet<String>> {
		Ok(self.cursor.get_table(table_name)?.indexes.clone())
	}
}
