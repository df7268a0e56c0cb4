//! Binary record sources: fixed-size records and script-cut records.

use super::{RawSource, RawUnit};
use crate::error::{Error, Result};
use crate::expr::{Evaluator, InputStream, Param};
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Records of `record_size` bytes; a short final read ends the stream
pub(super) struct FixedSource {
    file: BufReader<File>,
    path: PathBuf,
    record_size: usize,
    remaining: u64,
}

impl FixedSource {
    pub(super) fn open(path: &Path, record_size: usize) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::file_read(path, e))?;
        let len = file.metadata().map_err(|e| Error::file_read(path, e))?.len();
        Ok(Self {
            file: BufReader::new(file),
            path: path.to_path_buf(),
            record_size,
            remaining: len,
        })
    }

    fn whole_records_left(&self) -> u64 {
        self.remaining / self.record_size as u64
    }
}

impl RawSource for FixedSource {
    fn next_unit(&mut self) -> Result<Option<RawUnit>> {
        let mut buf = vec![0u8; self.record_size];
        match self.file.read_exact(&mut buf) {
            Ok(()) => {
                self.remaining = self.remaining.saturating_sub(self.record_size as u64);
                Ok(Some(RawUnit::Bytes(buf)))
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(Error::file_read(&self.path, e)),
        }
    }

    fn skip(&mut self, count: usize) -> Result<usize> {
        let records = self.whole_records_left().min(count as u64);
        let bytes = records * self.record_size as u64;
        let delta = i64::try_from(bytes).map_err(|_| Error::internal("skip distance overflows"))?;
        self.file
            .seek(SeekFrom::Current(delta))
            .map_err(|e| Error::file_read(&self.path, e))?;
        self.remaining -= bytes;
        usize::try_from(records).map_err(|_| Error::internal("record count overflows"))
    }
}

/// Records returned one by one by a read procedure over the open file
pub(super) struct ProcessSource {
    input: InputStream,
    path: PathBuf,
    read_process: String,
    evaluator: Evaluator,
}

impl ProcessSource {
    pub(super) fn open(path: &Path, read_process: &str, evaluator: &Evaluator) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::file_read(path, e))?;
        Ok(Self {
            input: InputStream::new(BufReader::new(file)),
            path: path.to_path_buf(),
            read_process: read_process.to_string(),
            evaluator: evaluator.clone(),
        })
    }
}

impl RawSource for ProcessSource {
    fn next_unit(&mut self) -> Result<Option<RawUnit>> {
        let params = [Param::stream("input", self.input.clone())];
        let data = self
            .evaluator
            .eval_bytes(None, &self.read_process, &params)
            .map_err(|e| Error::read_process(&self.path, e.to_string()))?;
        Ok(data.map(RawUnit::Bytes))
    }
}
