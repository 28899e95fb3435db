use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Parser, Subcommand};
use tracing_subscriber::filter::LevelFilter;

use avrocol::output::ParquetWriter;
use avrocol::{
    Column, NullPolicy, ReadBatch, ReadOptions, RecordLimit, RecordStreamReader, SeekMode, Storage,
};

/// Check if an error is a broken pipe (EPIPE).
/// This happens when piping to commands like `head` that close early.
fn is_broken_pipe<E: std::error::Error>(err: &E) -> bool {
    let mut source: Option<&dyn std::error::Error> = Some(err);
    while let Some(e) = source {
        if e.to_string().to_lowercase().contains("broken pipe") {
            return true;
        }
        source = e.source();
    }
    false
}

/// Inspect Avro container files and convert them to columns
#[derive(Parser, Debug)]
#[command(name = "avrocol", version, about)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the schema stored in the file header
    Schema {
        /// Input path or URI
        source: String,
    },

    /// Print header metadata
    Meta {
        /// Input path or URI
        source: String,
    },

    /// Read records and summarize the resulting columns
    Read(ReadArgs),

    /// Convert records to a Parquet file
    ToParquet(ToParquetArgs),
}

#[derive(Parser, Debug)]
struct ReadArgs {
    /// Input path or URI
    source: String,

    /// Byte offset to start reading from
    #[arg(long)]
    offset: Option<u64>,

    /// Maximum number of records to read (default: all)
    #[arg(long)]
    limit: Option<u64>,

    /// Treat --offset as approximate and move to the next block boundary
    #[arg(long)]
    sync: bool,

    /// Keep nulls in validity bitmaps instead of sentinel values
    #[arg(long)]
    validity: bool,
}

#[derive(Parser, Debug)]
struct ToParquetArgs {
    /// Input path or URI
    source: String,

    /// Output Parquet file
    #[arg(short, long)]
    output: PathBuf,

    /// Records per row group batch
    #[arg(long, default_value_t = 65_536)]
    batch_size: u64,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(io::stderr)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Schema { source } => run_schema(&source),
        Commands::Meta { source } => run_meta(&source),
        Commands::Read(args) => run_read(args),
        Commands::ToParquet(args) => run_to_parquet(args),
    }
}

/// Print to stdout, treating a closed pipe as success.
fn emit(text: &str) -> ExitCode {
    let mut stdout = io::stdout().lock();
    match writeln!(stdout, "{text}") {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if is_broken_pipe(&e) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run_schema(source: &str) -> ExitCode {
    match avrocol::avro::schema_text(&Storage::default(), source) {
        Ok(text) => emit(&text),
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run_meta(source: &str) -> ExitCode {
    match avrocol::avro::metadata(&Storage::default(), source) {
        Ok(meta) => {
            let lines: Vec<String> = meta
                .iter()
                .filter(|(key, _)| key.as_str() != "avro.schema")
                .map(|(key, value)| format!("{key}\t{value}"))
                .collect();
            emit(&lines.join("\n"))
        }
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run_read(args: ReadArgs) -> ExitCode {
    let options = ReadOptions {
        seek_mode: if args.sync { SeekMode::Sync } else { SeekMode::Exact },
        null_policy: if args.validity {
            NullPolicy::Validity
        } else {
            NullPolicy::Sentinel
        },
    };
    let limit = args.limit.map_or(RecordLimit::All, RecordLimit::Count);

    let mut reader = RecordStreamReader::new(Storage::default(), options);
    match reader.read(&args.source, args.offset, limit) {
        Ok(batch) => emit(&summarize(&batch)),
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// One line per column: name, type, value count, and group-length total for
/// repeated fields.
fn summarize(batch: &ReadBatch) -> String {
    let mut lines = vec![format!(
        "records: {}  exhausted: {}  next position: {}",
        batch.records, batch.exhausted, batch.position
    )];
    for ((field, column), lengths) in batch
        .fields
        .iter()
        .zip(&batch.columns)
        .zip(&batch.group_lengths)
    {
        let kind = match column {
            Column::Array(array) => array.data_type().to_string(),
            Column::Values(_) => format!("{:?} (pass-through)", field.leaf_type),
        };
        let mut line = format!("{}\t{}\t{} values", field.qualified_name(), kind, column.len());
        if let Some(lengths) = lengths {
            let groups: i64 = lengths.iter().map(|l| i64::from(l.unwrap_or(0))).sum();
            line.push_str(&format!("\t{} groups, {} elements", lengths.len(), groups));
        }
        lines.push(line);
    }
    lines.join("\n")
}

fn run_to_parquet(args: ToParquetArgs) -> ExitCode {
    if args.batch_size == 0 {
        eprintln!("Error: --batch-size must be positive");
        return ExitCode::FAILURE;
    }

    let mut writer = match ParquetWriter::create(&args.output) {
        Ok(writer) => writer,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut reader = RecordStreamReader::default();
    loop {
        let batch = match reader.read(&args.source, None, RecordLimit::Count(args.batch_size)) {
            Ok(batch) => batch,
            Err(e) => {
                eprintln!("Error: {e}");
                return ExitCode::FAILURE;
            }
        };
        if let Err(e) = writer.write_batch(&batch) {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
        if batch.exhausted {
            break;
        }
    }
    reader.close();

    match writer.finish() {
        Ok(rows) => {
            eprintln!("Wrote {} rows to {}", rows, args.output.display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
