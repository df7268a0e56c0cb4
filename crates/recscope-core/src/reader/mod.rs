//! Record readers.
//!
//! A [`RecordReader`] splits a file into raw units with the format's
//! [`ReaderStrategy`], decodes each unit into a [`Record`] and parses it. Files
//! are streamed: [`RecordReader::load`] only keeps the requested window in
//! memory and [`RecordReader::load_each`] keeps nothing.
//!
//! ## Windowing
//!
//! - a negative offset selects the last page, `max(0, total - max_records)`
//! - `max_records <= 0` means no limit
//! - a window past the end of a non-empty file falls back to the last page
//! - `eof` is set only when reading one more record after the window failed

mod binary;
mod lines;

use crate::error::Result;
use crate::expr::Evaluator;
use crate::format::{ReaderStrategy, RecordFormat};
use crate::parser;
use crate::record::{Record, RecordSet, RecordValue, FORMAT_ITEM, NUMBER_ITEM};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, trace};

/// One raw record as produced by a strategy
#[derive(Debug)]
pub(crate) enum RawUnit {
    Bytes(Vec<u8>),
    Line(String),
}

/// A stream of raw units over one open file
pub(crate) trait RawSource {
    /// Returns the next unit, or `None` at end of stream
    fn next_unit(&mut self) -> Result<Option<RawUnit>>;

    /// Skips up to `count` units, returning how many were skipped
    fn skip(&mut self, count: usize) -> Result<usize> {
        let mut skipped = 0;
        while skipped < count && self.next_unit()?.is_some() {
            skipped += 1;
        }
        Ok(skipped)
    }
}

/// Reads and decodes the records of one file type
#[derive(Debug, Clone)]
pub struct RecordReader {
    format: Arc<RecordFormat>,
    evaluator: Evaluator,
}

struct Window {
    records: Vec<Record>,
    eof: bool,
    skipped: usize,
}

impl RecordReader {
    /// Creates a reader for `format`
    pub fn new(format: Arc<RecordFormat>, evaluator: Evaluator) -> Self {
        Self { format, evaluator }
    }

    /// File type read by this reader
    pub fn format(&self) -> &Arc<RecordFormat> {
        &self.format
    }

    /// Loads a window of at most `max_records` records starting at record `offset`
    pub fn load(&self, path: impl AsRef<Path>, offset: i64, max_records: i64) -> Result<RecordSet> {
        let path = path.as_ref();
        let max = usize::try_from(max_records).ok().filter(|&m| m > 0);

        let mut start = match usize::try_from(offset) {
            Ok(start) => start,
            Err(_) => self.last_page_offset(path, max)?,
        };
        let mut window = self.load_window(path, start, max)?;

        let source_has_records = window.skipped > 0 || !window.records.is_empty();
        if window.records.is_empty() && source_has_records && offset >= 0 {
            start = self.last_page_offset(path, max)?;
            trace!("Offset {} is past the end of {}, retrying at {}", offset, path.display(), start);
            window = self.load_window(path, start, max)?;
        }

        debug!(
            "Loaded {} record(s) from {} (offset {}, eof {})",
            window.records.len(),
            path.display(),
            start,
            window.eof
        );
        Ok(RecordSet::new(window.records, path, Arc::clone(&self.format), start, window.eof))
    }

    /// Decodes every record of the file in order, handing each to `on_record`.
    ///
    /// Returns the number of records read.
    pub fn load_each<F>(&self, path: impl AsRef<Path>, mut on_record: F) -> Result<usize>
    where
        F: FnMut(Record) -> Result<()>,
    {
        let path = path.as_ref();
        let mut source = self.open(path)?;
        let mut count = 0;
        while let Some(unit) = source.next_unit()? {
            count += 1;
            on_record(self.decode(unit, count)?)?;
        }
        debug!("Streamed {} record(s) from {}", count, path.display());
        Ok(count)
    }

    /// Counts the records of the file without decoding them
    pub fn count(&self, path: impl AsRef<Path>) -> Result<usize> {
        self.open(path.as_ref())?.skip(usize::MAX)
    }

    fn last_page_offset(&self, path: &Path, max: Option<usize>) -> Result<usize> {
        match max {
            Some(max) => Ok(self.count(path)?.saturating_sub(max)),
            None => Ok(0),
        }
    }

    fn load_window(&self, path: &Path, start: usize, max: Option<usize>) -> Result<Window> {
        let mut source = self.open(path)?;
        let skipped = source.skip(start)?;
        if skipped < start {
            return Ok(Window { records: Vec::new(), eof: true, skipped });
        }

        let mut records = Vec::new();
        let mut eof = false;
        loop {
            let Some(unit) = source.next_unit()? else {
                eof = true;
                break;
            };
            if max.is_some_and(|max| records.len() >= max) {
                break;
            }
            records.push(self.decode(unit, start + records.len() + 1)?);
        }
        Ok(Window { records, eof, skipped })
    }

    fn open(&self, path: &Path) -> Result<Box<dyn RawSource>> {
        match self.format.strategy() {
            ReaderStrategy::FixedBytes { record_size } => {
                Ok(Box::new(binary::FixedSource::open(path, *record_size)?))
            }
            ReaderStrategy::VariableBytes { read_process } => Ok(Box::new(
                binary::ProcessSource::open(path, read_process, &self.evaluator)?,
            )),
            ReaderStrategy::Lines { charset, .. }
            | ReaderStrategy::HexDumpLines { charset, .. }
            | ReaderStrategy::StringDumpLines { charset, .. }
            | ReaderStrategy::CsvLines { charset } => {
                Ok(Box::new(lines::LineSource::open(path, *charset)?))
            }
        }
    }

    /// Decodes one unit into record number `number` (1-based)
    fn decode(&self, unit: RawUnit, number: usize) -> Result<Record> {
        match unit {
            RawUnit::Bytes(data) => {
                let record = Record::from_bytes(&self.evaluator, data);
                tag(&record, &self.format, number);
                parser::parse_record(&record, &self.format)?;
                Ok(record)
            }
            RawUnit::Line(line) => lines::decode_line(&self.format, &self.evaluator, &line, number),
        }
    }
}

/// Adds the hidden `[format]` and `[No.]` items
fn tag(record: &Record, format: &RecordFormat, number: usize) {
    record.insert_hidden(FORMAT_ITEM, RecordValue::Text(format.name().to_string()));
    record.insert_hidden(NUMBER_ITEM, RecordValue::Text(number.to_string()));
}
