//! recscope - Inspect record files through declarative layouts
//!
//! This tool loads a file type configuration, splits an input file into
//! records and prints them as a table (`list`) or item by item (`show`).

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use recscope_core::record::{Payload, NUMBER_ITEM};
use recscope_core::{update_meta_items, Configuration, Record, RecordFilter, RecordReader};
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use tracing::{debug, info, Level};
use tracing_subscriber::EnvFilter;

/// Inspect fixed-length, variable-length and line-oriented record files
#[derive(Parser, Debug)]
#[command(name = "recscope")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// File type configuration
    #[arg(short, long, env = "RECSCOPE_CONFIG", default_value = "recscope.toml")]
    config: PathBuf,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print records as a table, one row per record
    List(ListArgs),
    /// Print every item of one record
    Show(ShowArgs),
    /// Print the configured file types
    Formats,
}

#[derive(Args, Debug)]
struct InputArgs {
    /// File type name from the configuration
    #[arg(short = 't', long = "type")]
    file_type: String,

    /// File to read
    file: PathBuf,
}

#[derive(Args, Debug)]
struct ListArgs {
    #[command(flatten)]
    input: InputArgs,

    /// Index of the first record (-1 = last page)
    #[arg(long, default_value = "0", allow_negative_numbers = true)]
    offset: i64,

    /// Maximum number of records (0 = unlimited)
    #[arg(long, default_value = "100")]
    max: i64,

    /// Read the whole file, ignoring --offset and --max
    #[arg(long, conflicts_with_all = ["offset", "max"])]
    all: bool,

    /// Columns to print (comma-separated; defaults to the file type's list items)
    #[arg(long, value_delimiter = ',')]
    columns: Vec<String>,

    /// Only print records whose columns contain this text
    #[arg(long)]
    filter: Option<String>,

    /// Treat --filter as an expression instead of plain text
    #[arg(long, requires = "filter")]
    extended: bool,

    /// Extra meta-item, as NAME=EXPRESSION (repeatable)
    #[arg(long = "meta", value_parser = parse_meta_item)]
    meta_items: Vec<(String, String)>,
}

#[derive(Args, Debug)]
struct ShowArgs {
    #[command(flatten)]
    input: InputArgs,

    /// Record number (1-based)
    #[arg(short, long, default_value = "1", value_parser = clap::value_parser!(u64).range(1..))]
    record: u64,
}

fn parse_meta_item(text: &str) -> std::result::Result<(String, String), String> {
    match text.split_once('=') {
        Some((name, expression)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), expression.to_string()))
        }
        _ => Err(format!("expected NAME=EXPRESSION, got '{text}'")),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let config = Configuration::load(&cli.config)
        .with_context(|| format!("Failed to load configuration: {}", cli.config.display()))?;
    info!("Loaded configuration {}", config.path().display());

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());

    match &cli.command {
        Command::List(args) => list(&config, args, &mut out)?,
        Command::Show(args) => show(&config, args, &mut out)?,
        Command::Formats => formats(&config, &mut out)?,
    }

    out.flush()?;
    Ok(())
}

fn reader_for(config: &Configuration, input: &InputArgs) -> Result<RecordReader> {
    match config.reader(&input.file_type) {
        Some(reader) => Ok(reader),
        None => {
            let known: Vec<&str> = config.formats().map(|f| f.name()).collect();
            bail!(
                "Unknown file type '{}' (configured: {})",
                input.file_type,
                known.join(", ")
            )
        }
    }
}

fn list(config: &Configuration, args: &ListArgs, out: &mut impl Write) -> Result<()> {
    let reader = reader_for(config, &args.input)?;
    let path = &args.input.file;

    let mut columns = if args.columns.is_empty() {
        reader.format().columns().to_vec()
    } else {
        args.columns.iter().map(|c| c.trim().to_string()).collect()
    };
    columns.extend(args.meta_items.iter().map(|(name, _)| name.clone()));
    if columns.is_empty() {
        columns.push(NUMBER_ITEM.to_string());
    }

    let filter = args.filter.as_ref().map(|text| {
        if args.extended {
            RecordFilter::Expression(text.clone())
        } else {
            RecordFilter::Simple {
                text: text.clone(),
                columns: columns.clone(),
            }
        }
    });

    writeln!(out, "{}", columns.join("\t"))?;

    let mut printed = 0usize;
    let mut emit = |record: &Record, out: &mut dyn Write| -> Result<()> {
        if let Some(filter) = &filter {
            if !filter.matches(record)? {
                return Ok(());
            }
        }
        let row: Vec<String> = columns.iter().map(|c| cell(&record.value(c))).collect();
        writeln!(out, "{}", row.join("\t"))?;
        printed += 1;
        Ok(())
    };

    if args.all {
        let total = reader
            .load_each(path, |record| {
                update_meta_items([&record], &args.meta_items);
                emit(&record, out).map_err(|e| recscope_core::Error::internal(e.to_string()))
            })
            .with_context(|| format!("Failed to read {}", path.display()))?;
        debug!("Printed {} of {} record(s)", printed, total);
        return Ok(());
    }

    let records = reader
        .load(path, args.offset, args.max)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    update_meta_items(&records, &args.meta_items);
    for record in &records {
        emit(record, out)?;
    }
    debug!("Printed {} of {} record(s)", printed, records.len());

    writeln!(
        out,
        "# records {}-{} of {}{}",
        records.offset() + 1,
        records.offset() + records.len(),
        path.display(),
        if records.eof() { " (end of file)" } else { "" }
    )?;
    Ok(())
}

fn show(config: &Configuration, args: &ShowArgs, out: &mut impl Write) -> Result<()> {
    let reader = reader_for(config, &args.input)?;
    let path = &args.input.file;
    let offset = i64::try_from(args.record - 1).context("Record number out of range")?;

    let records = reader
        .load(path, offset, 1)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let Some(record) = records
        .iter()
        .find(|r| r.value(NUMBER_ITEM) == args.record.to_string())
    else {
        bail!("{} has no record {}", path.display(), args.record);
    };

    print_record(record, &args.input.file_type, out)
}

fn print_record(record: &Record, file_type: &str, out: &mut impl Write) -> Result<()> {
    writeln!(
        out,
        "{} record {} ({} {})",
        file_type,
        record.value(NUMBER_ITEM),
        record.len(),
        length_unit(record)
    )?;

    // Item values first: computing them may add diagnostic meta-items
    let items: Vec<_> = record
        .items()
        .into_iter()
        .map(|(name, value)| {
            let text = value.value(record);
            (name, text, value.hex(record), value)
        })
        .collect();

    writeln!(out, "kind\tno\tname\toffset\tlength\tvalue\thex")?;
    for (i, (name, value)) in record.meta_items().into_iter().enumerate() {
        writeln!(out, "meta\t{}\t{}\t\t\t{}\t", i + 1, name, cell(&value.value(record)))?;
    }
    for (i, (name, value, hex, cell_value)) in items.iter().enumerate() {
        let (offset, length) = cell_value
            .as_field()
            .map(|f| (f.offset().to_string(), f.length().to_string()))
            .unwrap_or_default();
        writeln!(
            out,
            "item\t{}\t{}\t{}\t{}\t{}\t{}",
            i + 1,
            name,
            offset,
            length,
            cell(value),
            hex
        )?;
    }
    Ok(())
}

/// Unit of `Record::len`: text payloads count characters
fn length_unit(record: &Record) -> &'static str {
    match record.payload() {
        Payload::Text(_) => "characters",
        Payload::Bytes(_) | Payload::Absent => "bytes",
    }
}

fn formats(config: &Configuration, out: &mut impl Write) -> Result<()> {
    for format in config.formats() {
        let layouts: Vec<&str> = format.dump_layouts().iter().map(|g| g.name()).collect();
        writeln!(out, "{}\t{}", format.name(), format.strategy())?;
        if !layouts.is_empty() {
            writeln!(out, "  layouts: {}", layouts.join(", "))?;
        }
        if !format.columns().is_empty() {
            writeln!(out, "  columns: {}", format.columns().join(", "))?;
        }
    }
    Ok(())
}

/// Keeps one value on one table cell
fn cell(value: &str) -> String {
    value.replace(['\t', '\n', '\r'], " ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Configuration, PathBuf) {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("layouts")).unwrap();
        fs::write(
            dir.path().join("layouts/rec.toml"),
            "name = \"rec\"\nitem1 = \"hex:kind,1\"\nitem2 = \"string:label,UTF-8,3\"",
        )
        .unwrap();
        let config_path = dir.path().join("recscope.toml");
        fs::write(
            &config_path,
            r#"
            layout_dirs = ["layouts"]

            [[file_types]]
            name = "sample"
            reader = "fixed-bytes"
            list_items = "[No.], rec.kind, rec.label"
            options = { record_size = 4, dump_layouts = "rec" }
            "#,
        )
        .unwrap();
        let data = dir.path().join("data.bin");
        fs::write(&data, b"\x01abc\x02def\x03ghi").unwrap();

        let config = Configuration::load(&config_path).unwrap();
        (dir, config, data)
    }

    fn list_args(data: &Path) -> ListArgs {
        ListArgs {
            input: InputArgs {
                file_type: "sample".into(),
                file: data.to_path_buf(),
            },
            offset: 0,
            max: 100,
            all: false,
            columns: Vec::new(),
            filter: None,
            extended: false,
            meta_items: Vec::new(),
        }
    }

    fn run_list(config: &Configuration, args: &ListArgs) -> Vec<String> {
        let mut out = Vec::new();
        list(config, args, &mut out).unwrap();
        String::from_utf8(out).unwrap().lines().map(str::to_string).collect()
    }

    #[test]
    fn test_list_table() {
        let (_dir, config, data) = setup();
        let lines = run_list(&config, &list_args(&data));
        assert_eq!(lines[0], "[No.]\trec.kind\trec.label");
        assert_eq!(lines[1], "1\t01\tabc");
        assert_eq!(lines[3], "3\t03\tghi");
        assert!(lines[4].ends_with("(end of file)"));
    }

    #[test]
    fn test_list_filter_and_meta() {
        let (_dir, config, data) = setup();
        let mut args = list_args(&data);
        args.filter = Some("de".into());
        args.meta_items = vec![("size".into(), "rec.length()".into())];
        let lines = run_list(&config, &args);
        assert_eq!(lines[0], "[No.]\trec.kind\trec.label\tsize");
        assert_eq!(lines[1], "2\t02\tdef\t4");
        assert_eq!(lines.len(), 3);

        let mut args = list_args(&data);
        args.all = true;
        args.filter = Some("$(\"rec.kind\") != \"02\"".into());
        args.extended = true;
        let lines = run_list(&config, &args);
        assert_eq!(lines.len(), 3);
        assert!(lines[2].starts_with("3\t"));
    }

    #[test]
    fn test_show_record() {
        let (_dir, config, data) = setup();
        let args = ShowArgs {
            input: InputArgs {
                file_type: "sample".into(),
                file: data,
            },
            record: 2,
        };
        let mut out = Vec::new();
        show(&config, &args, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("sample record 2 (4 bytes)"));
        assert!(text.contains("item\t1\trec.kind\t0\t1\t02\t02"));
        assert!(text.contains("item\t2\trec.label\t1\t3\tdef\t646566"));
    }

    #[test]
    fn test_length_unit() {
        let evaluator = recscope_core::Evaluator::new();
        assert_eq!(length_unit(&Record::from_bytes(&evaluator, vec![1u8, 2])), "bytes");
        assert_eq!(length_unit(&Record::from_text(&evaluator, "h\u{e9}")), "characters");

        let mut out = Vec::new();
        print_record(&Record::from_text(&evaluator, "h\u{e9}"), "log", &mut out).unwrap();
        assert!(String::from_utf8(out).unwrap().starts_with("log record  (2 characters)"));
    }

    #[test]
    fn test_unknown_file_type() {
        let (_dir, config, data) = setup();
        let mut args = list_args(&data);
        args.input.file_type = "nope".into();
        let err = list(&config, &args, &mut Vec::new()).unwrap_err();
        assert!(err.to_string().contains("sample"));
    }

    #[test]
    fn test_parse_meta_item() {
        assert_eq!(
            parse_meta_item("size=rec.length()").unwrap(),
            ("size".to_string(), "rec.length()".to_string())
        );
        assert_eq!(
            parse_meta_item("eq=a == b").unwrap(),
            ("eq".to_string(), "a == b".to_string())
        );
        assert!(parse_meta_item("=x").is_err());
        assert!(parse_meta_item("novalue").is_err());
    }

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
