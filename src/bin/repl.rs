//! Thin REPL/CLI front-end over [`slotdb::Database`]. Intentionally
//! unambitious: a line is split on whitespace and dispatched to the same
//! subcommand enum used for one-shot invocations.

use std::collections::BTreeMap;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use slotdb::{DbType, Filter, Scalar};
use structopt::StructOpt;

#[derive(StructOpt)]
#[structopt(name = "slotdb", about = "single-file table store")]
struct Opt {
	/// Path to the database file; created if it does not exist.
	db: PathBuf,

	/// Increase log verbosity (-v, -vv).
	#[structopt(short, long, parse(from_occurrences))]
	verbose: u8,

	#[structopt(subcommand)]
	command: Option<Command>,
}

#[derive(StructOpt)]
enum Command {
	/// Create a table. `spec` is a tolerant-JSON object: {name, keys:{col:type,...}}.
	CreateTable { spec: String },
	/// Add an index to an existing column.
	CreateIndex {
		#[structopt(long)]
		table: String,
		#[structopt(long)]
		key: String,
	},
	/// List every stored table.
	ListTables,
	/// Insert one row. `data` is a tolerant-JSON object {col: value, ...}.
	Insert {
		#[structopt(long)]
		table: String,
		#[structopt(long)]
		data: String,
	},
	/// Insert `amount` rows with generated column values.
	InsertAuto {
		#[structopt(long)]
		table: String,
		#[structopt(long)]
		amount: u32,
	},
	/// Select rows, optionally filtered.
	Select {
		#[structopt(long)]
		table: String,
		#[structopt(long)]
		filter: Option<String>,
		#[structopt(long)]
		limit: Option<usize>,
		#[structopt(long)]
		use_index: bool,
		/// Suppress per-row output, printing only the final count.
		#[structopt(long)]
		counter: bool,
		/// Don't pause for input every 6 rows.
		#[structopt(long)]
		all: bool,
	},
	/// Print command help.
	Help,
}

fn main() {
	let opt = Opt::from_args();
	let level = match opt.verbose {
		0 => log::LevelFilter::Info,
		1 => log::LevelFilter::Debug,
		_ => log::LevelFilter::Trace,
	};
	env_logger::Builder::from_default_env().filter_level(level).init();

	let mut db = match slotdb::Database::open(&opt.db) {
		Ok(db) => db,
		Err(err) => {
			eprintln!("error opening {}: {}", opt.db.display(), err);
			std::process::exit(1);
		}
	};

	match opt.command {
		Some(cmd) => run_one(&mut db, cmd),
		None => run_repl(&mut db),
	}

	if let Err(err) = db.close() {
		eprintln!("error flushing index: {}", err);
	}
}

fn run_one(db: &mut slotdb::Database, cmd: Command) {
	if let Err(err) = dispatch(db, cmd) {
		eprintln!("error: {}", err);
	}
}

fn run_repl(db: &mut slotdb::Database) {
	println!("slotdb REPL. Type 'help' for commands, Ctrl-D to exit.");
	let stdin = io::stdin();
	loop {
		print!("> ");
		io::stdout().flush().ok();
		let mut line = String::new();
		match stdin.lock().read_line(&mut line) {
			Ok(0) => break,
			Ok(_) => {}
			Err(err) => {
				eprintln!("error reading input: {}", err);
				break;
			}
		}
		let line = line.trim();
		if line.is_empty() {
			continue;
		}
		let mut argv = vec!["slotdb".to_string()];
		argv.extend(line.split_whitespace().map(|s| s.to_string()));
		match Command::from_iter_safe(argv) {
			Ok(cmd) => {
				if let Err(err) = dispatch(db, cmd) {
					eprintln!("error: {}", err);
				}
			}
			Err(err) => eprintln!("{}", err),
		}
	}
}

fn dispatch(db: &mut slotdb::Database, cmd: Command) -> slotdb::Result<()> {
	match cmd {
		Command::CreateTable { spec } => {
			let spec = slotdb::util::convert_json(&spec);
			let parsed: TableSpec = serde_json::from_str(&spec).map_err(slotdb::Error::from)?;
			let table = db.create_table(&parsed.name, parsed.keys)?;
			println!("created table {:?}", table);
		}
		Command::CreateIndex { table, key } => {
			db.create_index(&table, &key)?;
			println!("created index on '{}'.'{}'", table, key);
		}
		Command::ListTables => {
			for table in db.list_tables() {
				let indexes = db.indexed_columns(&table.name)?;
				println!("{:?} indexes={:?}", table, indexes);
			}
		}
		Command::Insert { table, data } => {
			let data = slotdb::util::convert_json(&data);
			let parsed: BTreeMap<String, Scalar> = serde_json::from_str(&data).map_err(slotdb::Error::from)?;
			let row = db.insert(&table, parsed)?;
			println!("{:?}", row);
		}
		Command::InsertAuto { table, amount } => {
			let rows = db.insert_auto(&table, amount)?;
			println!("inserted {} row(s)", rows.len());
		}
		Command::Select { table, filter, limit, use_index, counter, all } => {
			let filter = match filter {
				Some(raw) => {
					let canonical = slotdb::util::convert_json(&raw);
					serde_json::from_str::<Filter>(&canonical).map_err(slotdb::Error::from)?
				}
				None => Filter::Part(Default::default()),
			};
			let rows = if use_index {
				db.select_indexed(&table, &filter, limit)?
			} else {
				db.select(&table, &filter, limit)?
			};
			if !counter {
				for (i, row) in rows.iter().enumerate() {
					println!("{:?}", row);
					if !all && i > 0 && (i + 1) % 6 == 0 {
						print!("-- more, press enter --");
						io::stdout().flush().ok();
						let mut pause = String::new();
						io::stdin().lock().read_line(&mut pause).ok();
					}
				}
			}
			println!("{} row(s)", rows.len());
		}
		Command::Help => print_help(),
	}
	Ok(())
}

fn print_help() {
	println!(
		"commands:\n  \
		 create-table <spec>\n  \
		 create-index --table T --key K\n  \
		 list-tables\n  \
		 insert --table T --data <row>\n  \
		 insert-auto --table T --amount N\n  \
		 select --table T [--filter F] [--limit N] [--use-index]\n  \
		 help"
	);
}

#[derive(serde::Deserialize)]
struct TableSpec {
	name: String,
	keys: BTreeMap<String, DbType>,
}
