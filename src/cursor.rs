//! File-backed storage engine: owns the data file, maintains the
//! doubly-linked lists of tables and rows by byte offset, and implements
//! the override/relocate policy that keeps them consistent.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::codec::{self, MAGIC};
use crate::error::{Error, Result};
use crate::types::{DbType, MetaDb, MetaRow, MetaTable, Scalar};

/// Owns the open data file and an in-memory `name -> (descriptor, offset)`
/// cache of every table, kept in sync with every mutation.
pub struct DatabaseCursor {
	path: PathBuf,
	file: std::fs::File,
	db_meta: MetaDb,
	db_meta_offset: u64,
	tables: BTreeMap<String, (MetaTable, u64)>,
}

impl DatabaseCursor {
	/// Open `path`, creating a fresh database if it does not yet exist.
	pub fn open(path: impl AsRef<Path>) -> Result<DatabaseCursor> {
		let path = path.as_ref().to_path_buf();
		if let Some(parent) = path.parent() {
			if !parent.as_os_str().is_empty() {
				std::fs::create_dir_all(parent)?;
			}
		}
		let is_new = !path.exists();
		let file = OpenOptions::new().create(true).read(true).write(true).open(&path).map_err(|err| {
			log::warn!(target: "slotdb", "failed to open {}: {}", path.display(), err);
			Error::IncorrectDatabase(format!("{}: {}", path.display(), err))
		})?;

		let mut cursor = if is_new {
			log::debug!(target: "slotdb", "creating new database at {}", path.display());
			let now = Utc::now();
			let db_meta = MetaDb::new(now);
			file.write_all_at(MAGIC, 0)?;
			let db_meta_offset = MAGIC.len() as u64;
			let encoded = codec::encode_record(&db_meta)?;
			codec::write_slot(&file, db_meta_offset, &encoded)?;
			DatabaseCursor { path, file, db_meta, db_meta_offset, tables: BTreeMap::new() }
		} else {
			log::debug!(target: "slotdb", "opening existing database at {}", path.display());
			let magic = codec::read_at(&file, 0, MAGIC.len()).map_err(|err| {
				log::warn!(target: "slotdb", "failed to read database magic from {}: {}", path.display(), err);
				Error::IncorrectDatabase(format!("{}: truncated database magic", path.display()))
			})?;
			if magic != MAGIC {
				log::warn!(target: "slotdb", "{}: missing database magic", path.display());
				return Err(Error::IncorrectDatabase(format!(
					"{}: missing database magic",
					path.display()
				)));
			}
			let db_meta_offset = MAGIC.len() as u64;
			let db_meta = Self::read_db_meta_at(&file, db_meta_offset, &path)?;
			DatabaseCursor { path, file, db_meta, db_meta_offset, tables: BTreeMap::new() }
		};

		cursor.bootstrap_tables()?;
		Ok(cursor)
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	pub fn db_meta(&self) -> &MetaDb {
		&self.db_meta
	}

	fn read_db_meta_at(file: &std::fs::File, offset: u64, path: &Path) -> Result<MetaDb> {
		let head = codec::read_at(file, offset, codec::LENGTH_PREFIX_SIZE).map_err(|err| {
			log::warn!(target: "slotdb", "failed to read database header from {}: {}", path.display(), err);
			Error::IncorrectDatabase(format!("{}: truncated database header", path.display()))
		})?;
		let len = u64::from_be_bytes(head[codec::LENGTH_PREFIX_SIZE - 8..].try_into().unwrap()) as usize;
		let full = codec::read_at(file, offset, codec::LENGTH_PREFIX_SIZE + len).map_err(|err| {
			log::warn!(
				target: "slotdb",
				"failed to read database header payload from {}: {}",
				path.display(),
				err
			);
			Error::IncorrectDatabase(format!("{}: truncated database header", path.display()))
		})?;
		codec::decode_record(&full).map_err(|err| {
			log::warn!(target: "slotdb", "failed to decode database header from {}: {}", path.display(), err);
			Error::IncorrectDatabase("could not decode database header".into())
		})
	}

	fn read_record_len_at(&self, offset: u64) -> Result<usize> {
		let head = codec::read_at(&self.file, offset, codec::LENGTH_PREFIX_SIZE)?;
		let mut bytes = [0u8; 8];
		bytes.copy_from_slice(&head[codec::LENGTH_PREFIX_SIZE - 8..]);
		Ok(u64::from_be_bytes(bytes) as usize)
	}

	fn read_table_at(&self, offset: u64) -> Result<MetaTable> {
		let len = self.read_record_len_at(offset)?;
		let full = codec::read_at(&self.file, offset, codec::LENGTH_PREFIX_SIZE + len)?;
		codec::decode_record(&full)
	}

	fn read_row_at(&self, offset: u64) -> Result<MetaRow> {
		let len = self.read_record_len_at(offset)?;
		let full = codec::read_at(&self.file, offset, codec::LENGTH_PREFIX_SIZE + len)?;
		codec::decode_record(&full)
	}

	fn bootstrap_tables(&mut self) -> Result<()> {
		let mut offset = self.db_meta.first_table_offset;
		while offset != 0 {
			let table = self.read_table_at(offset)?;
			let next = table.next_table_offset;
			self.tables.insert(table.name.clone(), (table, offset));
			offset = next;
		}
		Ok(())
	}

	fn file_tail(&self) -> Result<u64> {
		Ok(self.file.metadata()?.len())
	}

	fn write_db_meta(&mut self) -> Result<()> {
		let encoded = codec::encode_record(&self.db_meta)?;
		codec::write_slot(&self.file, self.db_meta_offset, &encoded)?;
		Ok(())
	}

	/// Append or in-place-rewrite `table` at `offset`, relocating and
	/// rewiring neighbors if the new encoding no longer fits its slot.
	fn override_table(&mut self, mut table: MetaTable, offset: u64) -> Result<u64> {
		let encoded = codec::encode_record(&table)?;
		if codec::fits_slot(encoded.len()) {
			codec::write_slot(&self.file, offset, &encoded)?;
			self.tables.insert(table.name.clone(), (table, offset));
			return Ok(offset);
		}

		let new_offset = self.file_tail()?;
		codec::write_slot(&self.file, new_offset, &encoded)?;

		let prev = table.prev_table_offset;
		let next = table.next_table_offset;
		if prev != 0 {
			let mut prev_table = self.read_table_at(prev)?;
			prev_table.next_table_offset = new_offset;
			self.override_table(prev_table, prev)?;
		} else {
			self.db_meta.first_table_offset = new_offset;
		}
		if next != 0 {
			let mut next_table = self.read_table_at(next)?;
			next_table.prev_table_offset = new_offset;
			self.override_table(next_table, next)?;
		} else {
			self.db_meta.last_table_offset = new_offset;
		}
		self.write_db_meta()?;

		table.prev_table_offset = prev;
		table.next_table_offset = next;
		self.tables.insert(table.name.clone(), (table, new_offset));
		Ok(new_offset)
	}

	/// Append or in-place-rewrite a row, rewiring neighbors and its owning
	/// table's head/tail pointers on relocation.
	fn override_row(&mut self, mut row: MetaRow, offset: u64, table_offset: u64) -> Result<u64> {
		let encoded = codec::encode_record(&row)?;
		if codec::fits_slot(encoded.len()) {
			codec::write_slot(&self.file, offset, &encoded)?;
			return Ok(offset);
		}

		let new_offset = self.file_tail()?;
		codec::write_slot(&self.file, new_offset, &encoded)?;

		let prev = row.prev_row_offset;
		let next = row.next_row_offset;
		let mut table = self.read_table_at(table_offset)?;
		let mut table_dirty = false;

		if prev != 0 {
			let mut prev_row = self.read_row_at(prev)?;
			prev_row.next_row_offset = new_offset;
			self.override_row(prev_row, prev, table_offset)?;
		} else if table.first_row_offset == offset {
			table.first_row_offset = new_offset;
			table_dirty = true;
		}
		if next != 0 {
			let mut next_row = self.read_row_at(next)?;
			next_row.prev_row_offset = new_offset;
			self.override_row(next_row, next, table_offset)?;
		} else if table.last_row_offset == offset {
			table.last_row_offset = new_offset;
			table_dirty = true;
		}
		if table_dirty {
			self.override_table(table, table_offset)?;
		}

		row.prev_row_offset = prev;
		row.next_row_offset = next;
		Ok(new_offset)
	}

	/// Create a new table. Fails with [`Error::DuplicateName`] if the name
	/// is already taken.
	pub fn write_table_meta(
		&mut self,
		name: &str,
		keys: BTreeMap<String, DbType>,
	) -> Result<(MetaTable, u64)> {
		if self.tables.contains_key(name) {
			return Err(Error::DuplicateName(name.to_string()));
		}
		let offset = self.file_tail()?;
		let table = MetaTable {
			name: name.to_string(),
			keys,
			indexes: Default::default(),
			first_row_offset: 0,
			last_row_offset: 0,
			next_table_offset: 0,
			prev_table_offset: self.db_meta.last_table_offset,
		};
		let encoded = codec::encode_record(&table)?;
		codec::write_slot(&self.file, offset, &encoded)?;
		self.tables.insert(name.to_string(), (table.clone(), offset));

		if self.db_meta.first_table_offset == 0 {
			self.db_meta.first_table_offset = offset;
		} else {
			let prev_offset = self.db_meta.last_table_offset;
			let mut prev_table = self.read_table_at(prev_offset)?;
			prev_table.next_table_offset = offset;
			self.override_table(prev_table, prev_offset)?;
		}
		self.db_meta.last_table_offset = offset;
		self.db_meta.updated = Utc::now();
		self.write_db_meta()?;

		log::info!(target: "slotdb", "created table '{}' at offset {}", name, offset);
		Ok((table, offset))
	}

	/// Rewrite `table`'s descriptor, e.g. after adding an index.
	pub fn override_table_meta(&mut self, table: MetaTable, offset: u64) -> Result<u64> {
		self.override_table(table, offset)
	}

	pub fn get_table(&self, name: &str) -> Result<&MetaTable> {
		self.tables.get(name).map(|(t, _)| t).ok_or_else(|| Error::NotFound(name.to_string()))
	}

	pub fn get_table_offset(&self, name: &str) -> Result<u64> {
		self.tables.get(name).map(|(_, o)| *o).ok_or_else(|| Error::NotFound(name.to_string()))
	}

	pub fn table_names(&self) -> impl Iterator<Item = &str> {
		self.tables.keys().map(|s| s.as_str())
	}

	/// Validate and coerce `data` against `table`'s declared columns.
	fn coerce_row(table: &MetaTable, data: BTreeMap<String, Scalar>) -> Result<BTreeMap<String, Scalar>> {
		if data.len() != table.keys.len() || !data.keys().all(|k| table.keys.contains_key(k)) {
			return Err(Error::SchemaMismatch {
				table: table.name.clone(),
				reason: "row columns do not match the table's declared keys".into(),
			});
		}
		let mut coerced = BTreeMap::new();
		for (key, value) in data {
			let ty = table.keys[&key];
			let value = value.coerce(ty).map_err(|reason| Error::SchemaMismatch {
				table: table.name.clone(),
				reason: format!("column '{}': {}", key, reason),
			})?;
			coerced.insert(key, value);
		}
		Ok(coerced)
	}

	/// Insert one row into `table_name`, returning the stored row and its
	/// offset so the caller (the façade) can update the index.
	pub fn write_row_meta(
		&mut self,
		table_name: &str,
		data: BTreeMap<String, Scalar>,
	) -> Result<(MetaRow, u64)> {
		let table_offset = self.get_table_offset(table_name)?;
		let table = self.get_table(table_name)?.clone();
		let data = Self::coerce_row(&table, data)?;

		let offset = self.file_tail()?;
		let row = MetaRow { data, next_row_offset: 0, prev_row_offset: table.last_row_offset };
		let encoded = codec::encode_record(&row)?;
		codec::write_slot(&self.file, offset, &encoded)?;

		let mut table = table;
		if table.first_row_offset == 0 {
			table.first_row_offset = offset;
		} else {
			let prev_offset = table.last_row_offset;
			let mut prev_row = self.read_row_at(prev_offset)?;
			prev_row.next_row_offset = offset;
			self.override_row(prev_row, prev_offset, table_offset)?;
			// `override_row` may already have rewritten the table descriptor
			// (the relocated row could also have been `first_row_offset`);
			// pick up that correction instead of clobbering it with our
			// pre-insert snapshot below.
			table = self.get_table(table_name)?.clone();
		}
		table.last_row_offset = offset;
		let table_offset = self.get_table_offset(table_name)?;
		self.override_table(table, table_offset)?;

		log::trace!(target: "slotdb", "inserted row into '{}' at offset {}", table_name, offset);
		Ok((row, offset))
	}

	/// All live tables, in list order.
	pub fn read_all_tables(&self) -> Result<Vec<MetaTable>> {
		let mut out = Vec::new();
		let mut offset = self.db_meta.first_table_offset;
		while offset != 0 {
			let table = self.read_table_at(offset)?;
			offset = table.next_table_offset;
			out.push(table);
		}
		Ok(out)
	}

	/// Iterate every row of `table_name` in list order.
	pub fn rows(&self, table_name: &str) -> Result<RowIter<'_>> {
		let offset = self.get_table(table_name)?.first_row_offset;
		Ok(RowIter { cursor: self, next_offset: offset })
	}

	/// Read one row by its stored offset.
	pub fn row_at(&self, offset: u64) -> Result<MetaRow> {
		self.read_row_at(offset)
	}

	pub fn flush(&self) -> Result<()> {
		self.file.sync_data()?;
		Ok(())
	}
}

/// Forward iterator over a table's row chain.
pub struct RowIter<'a> {
	cursor: &'a DatabaseCursor,
	next_offset: u64,
}

impl<'a> Iterator for RowIter<'a> {
	type Item = Result<(MetaRow, u64)>;

	fn next(&mut self) -> Option<Self::Item> {
		if self.next_offset == 0 {
			return None;
		}
		let offset = self.next_offset;
		match self.cursor.read_row_at(offset) {
			Ok(row) => {
				self.next_offset = row.next_row_offset;
				Some(Ok((row, offset)))
			}
			Err(err) => {
				self.next_offset = 0;
				Some(Err(err))
			}
		}
	}
}
