//! End-to-end tests against the façade, covering the documented scenarios:
//! table/row persistence, filter variants, index rebuild after sidecar
//! loss, and schema/index error paths.

use std::collections::BTreeMap;

use slotdb::{DbType, Filter, FilterPart, FilterValue, Scalar};

struct TempDb(std::path::PathBuf);

impl TempDb {
	fn new(name: &'static str) -> TempDb {
		env_logger::try_init().ok();
		let mut path = std::env::temp_dir();
		path.push("slotdb-test");
		path.push("database");
		path.push(name);
		if path.exists() {
			std::fs::remove_dir_all(&path).unwrap();
		}
		std::fs::create_dir_all(&path).unwrap();
		TempDb(path.join("t.db"))
	}
}

impl Drop for TempDb {
	fn drop(&mut self) {
		if let Some(dir) = self.0.parent() {
			let _ = std::fs::remove_dir_all(dir);
		}
	}
}

fn keys(pairs: &[(&str, DbType)]) -> BTreeMap<String, DbType> {
	pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

fn row(pairs: &[(&str, Scalar)]) -> BTreeMap<String, Scalar> {
	pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

fn part(pairs: &[(&str, FilterValue)]) -> FilterPart {
	pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

#[test]
fn two_tables_and_rows_round_trip() {
	let path = TempDb::new("two_tables_and_rows_round_trip");
	let mut db = slotdb::Database::open(&path.0).unwrap();

	db.create_table("T1", keys(&[("id", DbType::Str), ("content", DbType::Int)])).unwrap();
	db.create_table("T2", keys(&[("idx", DbType::Str)])).unwrap();

	let tables = db.list_tables();
	assert_eq!(tables.len(), 2);
	assert!(tables.iter().any(|t| t.name == "T1"));
	assert!(tables.iter().any(|t| t.name == "T2"));

	db.insert("T1", row(&[("id", Scalar::Str("aaa".into())), ("content", Scalar::Int(1))])).unwrap();
	db.insert("T1", row(&[("id", Scalar::Str("bbb".into())), ("content", Scalar::Int(2))])).unwrap();

	let all = db.select("T1", &Filter::Part(Default::default()), None).unwrap();
	assert_eq!(all.len(), 2);
}

#[test]
fn select_sees_every_row_after_a_large_row_forces_relocation() {
	let path = TempDb::new("select_sees_every_row_after_a_large_row_forces_relocation");
	let mut db = slotdb::Database::open(&path.0).unwrap();
	db.create_table("T", keys(&[("id", DbType::Str)])).unwrap();

	// A long string makes row 1's encoding exceed one slot, so inserting
	// row 2 (which patches row 1's `next_row_offset`) forces the cursor's
	// relocate-and-rewire path instead of an in-place update.
	let long_id = "x".repeat(480);
	db.insert("T", row(&[("id", Scalar::Str(long_id.clone()))])).unwrap();
	db.insert("T", row(&[("id", Scalar::Str("second".into()))])).unwrap();
	db.insert("T", row(&[("id", Scalar::Str("third".into()))])).unwrap();

	let all = db.select("T", &Filter::Part(Default::default()), None).unwrap();
	let ids: Vec<&str> = all
		.iter()
		.map(|r| match &r.data["id"] {
			Scalar::Str(s) => s.as_str(),
			_ => unreachable!(),
		})
		.collect();
	assert_eq!(ids, vec![long_id.as_str(), "second", "third"]);
}

#[test]
fn filter_variants_match_spec_scenario() {
	let path = TempDb::new("filter_variants_match_spec_scenario");
	let mut db = slotdb::Database::open(&path.0).unwrap();
	db.create_table("T", keys(&[("id", DbType::Str), ("content", DbType::Int)])).unwrap();
	db.insert("T", row(&[("id", Scalar::Str("aaa".into())), ("content", Scalar::Int(1))])).unwrap();
	db.insert("T", row(&[("id", Scalar::Str("bbb".into())), ("content", Scalar::Int(1))])).unwrap();

	let by_id = Filter::Part(part(&[("id", FilterValue::One(Scalar::Str("aaa".into())))]));
	assert_eq!(db.select("T", &by_id, None).unwrap().len(), 1);

	let no_match = Filter::Part(part(&[("id", FilterValue::One(Scalar::Str("ccc".into())))]));
	assert_eq!(db.select("T", &no_match, None).unwrap().len(), 0);

	let or_parts = Filter::Parts(vec![
		part(&[("id", FilterValue::One(Scalar::Str("aaa".into())))]),
		part(&[("id", FilterValue::One(Scalar::Str("bbb".into())))]),
	]);
	assert_eq!(db.select("T", &or_parts, None).unwrap().len(), 2);

	let in_set = Filter::Part(part(&[(
		"id",
		FilterValue::Many(vec![Scalar::Str("aaa".into()), Scalar::Str("bbb".into())]),
	)]));
	assert_eq!(db.select("T", &in_set, None).unwrap().len(), 2);

	let empty = Filter::Part(Default::default());
	assert_eq!(db.select("T", &empty, None).unwrap().len(), 2);
}

#[test]
fn int_column_coerces_string_filter_value() {
	let path = TempDb::new("int_column_coerces_string_filter_value");
	let mut db = slotdb::Database::open(&path.0).unwrap();
	db.create_table("T", keys(&[("content", DbType::Int)])).unwrap();
	db.insert("T", row(&[("content", Scalar::Int(1))])).unwrap();

	let filter = Filter::Part(part(&[("content", FilterValue::One(Scalar::Str("1".into())))]));
	assert_eq!(db.select("T", &filter, None).unwrap().len(), 1);
}

#[test]
fn indexed_select_requires_non_empty_filter_and_indexed_columns() {
	let path = TempDb::new("indexed_select_requires_non_empty_filter_and_indexed_columns");
	let mut db = slotdb::Database::open(&path.0).unwrap();
	db.create_table("T", keys(&[("id", DbType::Str)])).unwrap();
	db.insert("T", row(&[("id", Scalar::Str("aaa".into()))])).unwrap();

	let empty = Filter::Part(Default::default());
	assert!(db.select_indexed("T", &empty, None).is_err());

	let by_id = Filter::Part(part(&[("id", FilterValue::One(Scalar::Str("aaa".into())))]));
	assert!(db.select_indexed("T", &by_id, None).is_err());

	db.create_index("T", "id").unwrap();
	let rows = db.select_indexed("T", &by_id, None).unwrap();
	assert_eq!(rows.len(), 1);
}

#[test]
fn and_within_part_intersects_candidates() {
	let path = TempDb::new("and_within_part_intersects_candidates");
	let mut db = slotdb::Database::open(&path.0).unwrap();
	db.create_table("T", keys(&[("id", DbType::Str), ("content", DbType::Int)])).unwrap();
	db.create_index("T", "id").unwrap();
	db.create_index("T", "content").unwrap();

	db.insert("T", row(&[("id", Scalar::Str("aaa".into())), ("content", Scalar::Int(1))])).unwrap();
	db.insert("T", row(&[("id", Scalar::Str("aaa".into())), ("content", Scalar::Int(2))])).unwrap();
	db.insert("T", row(&[("id", Scalar::Str("bbb".into())), ("content", Scalar::Int(1))])).unwrap();

	let filter = Filter::Part(part(&[
		("id", FilterValue::One(Scalar::Str("aaa".into()))),
		("content", FilterValue::One(Scalar::Int(1))),
	]));
	let rows = db.select_indexed("T", &filter, None).unwrap();
	assert_eq!(rows.len(), 1);
	assert_eq!(rows[0].data["id"], Scalar::Str("aaa".into()));
	assert_eq!(rows[0].data["content"], Scalar::Int(1));
}

#[test]
fn index_rebuilds_after_sidecar_loss() {
	let path = TempDb::new("index_rebuilds_after_sidecar_loss");
	{
		let mut db = slotdb::Database::open(&path.0).unwrap();
		db.create_table("T", keys(&[("id", DbType::Str)])).unwrap();
		db.create_index("T", "id").unwrap();
		for i in 0..5 {
			db.insert("T", row(&[("id", Scalar::Str(format!("row-{}", i)))])).unwrap();
		}
		db.close().unwrap();
	}

	let sidecar = slotdb::indexer::sidecar_path(&path.0);
	assert!(sidecar.exists());
	std::fs::remove_file(&sidecar).unwrap();

	let db = slotdb::Database::open(&path.0).unwrap();
	let filter = Filter::Part(part(&[("id", FilterValue::One(Scalar::Str("row-3".into())))]));
	let rows = db.select_indexed("T", &filter, None).unwrap();
	assert_eq!(rows.len(), 1);
}

#[test]
fn schema_mismatch_rejects_unknown_columns() {
	let path = TempDb::new("schema_mismatch_rejects_unknown_columns");
	let mut db = slotdb::Database::open(&path.0).unwrap();
	db.create_table("T", keys(&[("id", DbType::Str)])).unwrap();
	let err = db.insert("T", row(&[("nope", Scalar::Str("x".into()))])).unwrap_err();
	assert!(matches!(err, slotdb::Error::SchemaMismatch { .. }));
}

#[test]
fn duplicate_table_name_is_rejected() {
	let path = TempDb::new("duplicate_table_name_is_rejected");
	let mut db = slotdb::Database::open(&path.0).unwrap();
	db.create_table("T", keys(&[("id", DbType::Str)])).unwrap();
	let err = db.create_table("T", keys(&[("id", DbType::Str)])).unwrap_err();
	assert!(matches!(err, slotdb::Error::DuplicateName(_)));
}

#[test]
fn insert_auto_fills_every_declared_column() {
	let path = TempDb::new("insert_auto_fills_every_declared_column");
	let mut db = slotdb::Database::open(&path.0).unwrap();
	db.create_table("T", keys(&[("id", DbType::Str), ("content", DbType::Int)])).unwrap();
	let rows = db.insert_auto("T", 3).unwrap();
	assert_eq!(rows.len(), 3);
	for row in &rows {
		assert!(row.data.contains_key("id"));
		assert!(row.data.contains_key("content"));
		assert!(matches!(row.data["content"], Scalar::Int(n) if n >= 0 && n < 1000));
	}
}

#[test]
fn opening_a_directory_path_is_an_incorrect_database() {
	let dir = std::env::temp_dir().join("slotdb-test").join("database").join("directory_is_not_a_db");
	if dir.exists() {
		std::fs::remove_dir_all(&dir).unwrap();
	}
	std::fs::create_dir_all(&dir).unwrap();

	let err = slotdb::Database::open(&dir).unwrap_err();
	assert!(matches!(err, slotdb::Error::IncorrectDatabase(_)));

	std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn truncated_length_prefix_is_an_incorrect_database() {
	let path = TempDb::new("truncated_length_prefix_is_an_incorrect_database");
	{
		let db = slotdb::Database::open(&path.0).unwrap();
		db.close().unwrap();
	}

	// Cut the file off partway through the header's 64-byte length field,
	// well short of even that much being readable.
	let file = std::fs::OpenOptions::new().write(true).open(&path.0).unwrap();
	file.set_len(30).unwrap();
	drop(file);

	let err = slotdb::Database::open(&path.0).unwrap_err();
	assert!(matches!(err, slotdb::Error::IncorrectDatabase(_)));
}

#[test]
fn truncated_header_payload_is_an_incorrect_database() {
	let path = TempDb::new("truncated_header_payload_is_an_incorrect_database");
	{
		let db = slotdb::Database::open(&path.0).unwrap();
		db.close().unwrap();
	}

	// Leave the length prefix intact but cut the file off partway through
	// the JSON payload it claims follows.
	let file = std::fs::OpenOptions::new().write(true).open(&path.0).unwrap();
	file.set_len(19 + 64 + 5).unwrap();
	drop(file);

	let err = slotdb::Database::open(&path.0).unwrap_err();
	assert!(matches!(err, slotdb::Error::IncorrectDatabase(_)));
}

#[test]
fn incorrect_database_error_displays_and_is_a_std_error() {
	let err = slotdb::Error::IncorrectDatabase("t.db: missing database magic".into());
	assert_eq!(err.to_string(), "not a slotdb database file: t.db: missing database magic");
	let as_std: &dyn std::error::Error = &err;
	assert!(as_std.source().is_none());
}

#[test]
fn opening_a_nonexistent_parent_creates_the_database() {
	let dir = std::env::temp_dir().join("slotdb-test").join("database").join("nested_create");
	if dir.exists() {
		std::fs::remove_dir_all(&dir).unwrap();
	}
	let path = dir.join("sub").join("t.db");
	let db = slotdb::Database::open(&path).unwrap();
	assert!(db.list_tables().is_empty());
	std::fs::remove_dir_all(&dir).unwrap();
}
