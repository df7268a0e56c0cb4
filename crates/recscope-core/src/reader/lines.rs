//! Line-oriented record sources and decoders.

use super::{tag, RawSource, RawUnit};
use crate::codec::{decode_hex, encode_text};
use crate::error::{Error, Result};
use crate::expr::Evaluator;
use crate::format::{ReaderStrategy, RecordFormat, DUMP_GROUP};
use crate::parser;
use crate::record::{Record, RecordValue};
use encoding_rs::Encoding;
use regex::Captures;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

/// Diagnostic for lines the record pattern does not match
pub(crate) const UNMATCHED_LINE: &str = "unknown record layout (no applicable record_pattern)";

/// Lines of an ASCII-compatible text file, without their terminators
pub(super) struct LineSource {
    reader: BufReader<File>,
    path: PathBuf,
    charset: &'static Encoding,
    buf: Vec<u8>,
    first: bool,
}

impl LineSource {
    pub(super) fn open(path: &Path, charset: &'static Encoding) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::file_read(path, e))?;
        Ok(Self {
            reader: BufReader::new(file),
            path: path.to_path_buf(),
            charset,
            buf: Vec::new(),
            first: true,
        })
    }

    /// Reads the next raw line into `buf`; false at end of file
    fn read_raw(&mut self) -> Result<bool> {
        self.buf.clear();
        let read = self
            .reader
            .read_until(b'\n', &mut self.buf)
            .map_err(|e| Error::file_read(&self.path, e))?;
        if read == 0 {
            return Ok(false);
        }
        if self.buf.ends_with(b"\n") {
            self.buf.pop();
            if self.buf.ends_with(b"\r") {
                self.buf.pop();
            }
        }
        Ok(true)
    }
}

impl RawSource for LineSource {
    fn next_unit(&mut self) -> Result<Option<RawUnit>> {
        if !self.read_raw()? {
            return Ok(None);
        }
        let (text, _) = self.charset.decode_without_bom_handling(&self.buf);
        let mut line = text.into_owned();
        if std::mem::take(&mut self.first) && line.starts_with('\u{feff}') {
            line.remove(0);
        }
        Ok(Some(RawUnit::Line(line)))
    }

    fn skip(&mut self, count: usize) -> Result<usize> {
        let mut skipped = 0;
        while skipped < count && self.read_raw()? {
            self.first = false;
            skipped += 1;
        }
        Ok(skipped)
    }
}

/// Decodes one line into record number `number` according to the format's strategy
pub(super) fn decode_line(
    format: &RecordFormat,
    evaluator: &Evaluator,
    line: &str,
    number: usize,
) -> Result<Record> {
    let strategy = format.strategy();

    if let ReaderStrategy::CsvLines { .. } = strategy {
        let record = Record::from_text(evaluator, line);
        tag(&record, format, number);
        for (i, value) in line.split(',').enumerate() {
            let name = format
                .columns()
                .get(i)
                .cloned()
                .unwrap_or_else(|| format!("[{i}]"));
            record.insert_item(name, RecordValue::Text(value.to_string()));
        }
        parser::append_meta_items(&record, format);
        return Ok(record);
    }

    let Some(pattern) = strategy.pattern() else {
        return Err(Error::internal(format!("reader '{}' is not line-oriented", strategy.id())));
    };
    let Some(captures) = pattern.captures(line) else {
        let record = Record::error(evaluator, UNMATCHED_LINE);
        tag(&record, format, number);
        return Ok(record);
    };

    let dump = captures.name(DUMP_GROUP).map_or("", |m| m.as_str());
    let record = match strategy {
        ReaderStrategy::HexDumpLines { .. } => match decode_hex(dump) {
            Ok(data) => Record::from_bytes(evaluator, data),
            Err(e) => {
                let record = Record::error(evaluator, format!("invalid hex dump: {e}"));
                tag(&record, format, number);
                return Ok(record);
            }
        },
        ReaderStrategy::StringDumpLines { dump_charset, .. } => {
            Record::from_bytes(evaluator, encode_text(dump_charset, dump))
        }
        _ => Record::from_text(evaluator, line),
    };

    tag(&record, format, number);
    insert_groups(&record, format, &captures);

    if format.dump_layouts().is_empty() {
        parser::append_meta_items(&record, format);
    } else {
        parser::parse_record(&record, format)?;
    }
    Ok(record)
}

/// Stores the pattern's named groups (other than `DUMP`) as meta-items
fn insert_groups(record: &Record, format: &RecordFormat, captures: &Captures<'_>) {
    for name in format.strategy().meta_group_names() {
        let value = captures.name(name).map_or("", |m| m.as_str());
        record.insert_meta(name, RecordValue::Text(value.to_string()));
    }
}
