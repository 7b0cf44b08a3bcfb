//! Data model shared by the cursor, indexer and façade layers.

use std::collections::{BTreeMap, BTreeSet};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Declared type of a table column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbType {
	Int,
	Str,
}

/// A single stored value, coerced to its column's [`DbType`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
	Int(i64),
	Str(String),
}

impl Scalar {
	/// Coerce `self` to `ty`, the way a row's declared schema demands.
	/// Returns a bare reason string; callers attach the owning table name.
	pub fn coerce(&self, ty: DbType) -> std::result::Result<Scalar, String> {
		match ty {
			DbType::Int => match self {
				Scalar::Int(v) => Ok(Scalar::Int(*v)),
				Scalar::Str(s) => s
					.parse::<i64>()
					.map(Scalar::Int)
					.map_err(|_| format!("value '{}' does not coerce to int", s)),
			},
			DbType::Str => match self {
				Scalar::Str(v) => Ok(Scalar::Str(v.clone())),
				Scalar::Int(v) => Ok(Scalar::Str(v.to_string())),
			},
		}
	}

	/// The textual form hashed by the indexer.
	pub fn as_hash_input(&self) -> String {
		match self {
			Scalar::Int(v) => v.to_string(),
			Scalar::Str(v) => v.clone(),
		}
	}
}

/// Singleton header record stored right after the file magic.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetaDb {
	pub created: DateTime<Utc>,
	pub updated: DateTime<Utc>,
	pub first_table_offset: u64,
	pub last_table_offset: u64,
}

impl MetaDb {
	pub fn new(now: DateTime<Utc>) -> MetaDb {
		MetaDb { created: now, updated: now, first_table_offset: 0, last_table_offset: 0 }
	}
}

/// On-disk table descriptor, one node in the doubly-linked table list.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetaTable {
	pub name: String,
	pub keys: BTreeMap<String, DbType>,
	pub indexes: BTreeSet<String>,
	pub first_row_offset: u64,
	pub last_row_offset: u64,
	pub next_table_offset: u64,
	pub prev_table_offset: u64,
}

/// On-disk row descriptor, one node in a table's doubly-linked row list.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetaRow {
	pub data: BTreeMap<String, Scalar>,
	pub next_row_offset: u64,
	pub prev_row_offset: u64,
}

/// User-facing table DTO: no offsets, no index set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Table {
	pub name: String,
	pub keys: BTreeMap<String, DbType>,
}

impl From<&MetaTable> for Table {
	fn from(meta: &MetaTable) -> Table {
		Table { name: meta.name.clone(), keys: meta.keys.clone() }
	}
}

/// User-facing row DTO.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Row {
	pub data: BTreeMap<String, Scalar>,
}

impl From<&MetaRow> for Row {
	fn from(meta: &MetaRow) -> Row {
		Row { data: meta.data.clone() }
	}
}

/// A filter value: either a single scalar (equality) or a set of scalars
/// (membership).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
	One(Scalar),
	Many(Vec<Scalar>),
}

impl FilterValue {
	fn matches(&self, value: &Scalar) -> bool {
		match self {
			FilterValue::One(v) => v == value,
			FilterValue::Many(vs) => vs.iter().any(|v| v == value),
		}
	}

	/// All scalars this filter value could match, for index bucket lookup.
	pub fn candidates(&self) -> Vec<&Scalar> {
		match self {
			FilterValue::One(v) => vec![v],
			FilterValue::Many(vs) => vs.iter().collect(),
		}
	}
}

/// A single AND-clause: every `(column, value)` pair must match.
pub type FilterPart = BTreeMap<String, FilterValue>;

/// A `Filter` is either one AND-clause or an OR of several.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Filter {
	Part(FilterPart),
	Parts(Vec<FilterPart>),
}

impl Filter {
	/// Every `FilterPart` that makes up this filter. An empty filter (no
	/// parts at all) is represented by a single empty part, which matches
	/// every row.
	pub fn parts(&self) -> Vec<&FilterPart> {
		match self {
			Filter::Part(p) => vec![p],
			Filter::Parts(ps) => ps.iter().collect(),
		}
	}

	pub fn is_empty(&self) -> bool {
		match self {
			Filter::Part(p) => p.is_empty(),
			Filter::Parts(ps) => ps.is_empty() || ps.iter().all(|p| p.is_empty()),
		}
	}

	/// OR-of-ANDs match against a materialized row. An empty filter (no
	/// parts, or a single empty part) matches every row.
	pub fn matches(&self, row: &BTreeMap<String, Scalar>) -> bool {
		if self.is_empty() {
			return true;
		}
		self.parts().iter().any(|part| part_matches(part, row))
	}
}

fn part_matches(part: &FilterPart, row: &BTreeMap<String, Scalar>) -> bool {
	part.iter().all(|(key, expected)| {
		row.get(key).map(|actual| expected.matches(actual)).unwrap_or(false)
	})
}
