//! Record formats.
//!
//! A [`RecordFormat`] bundles everything needed to turn a file into records:
//! the reader strategy and its typed options, the ordered dump layouts, the
//! display columns and the format-level meta-item expressions.

use crate::codec::can_encode;
use crate::error::{Error, Result};
use crate::layout::GroupNode;
use encoding_rs::Encoding;
use indexmap::IndexMap;
use regex::Regex;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

/// Named capture group holding the dump in `*-dump-lines` patterns
pub const DUMP_GROUP: &str = "DUMP";

/// Largest accepted `record_size` (64 MiB)
pub const MAX_RECORD_SIZE: usize = 64 * 1024 * 1024;

/// How a file is split into raw records
#[derive(Debug, Clone)]
pub enum ReaderStrategy {
    /// Records of a constant byte size
    FixedBytes {
        /// Size of every record
        record_size: usize,
    },
    /// Records cut by a read procedure
    VariableBytes {
        /// Script returning the next record as a blob, or `()` at end of stream
        read_process: String,
    },
    /// One record per line; named groups become meta-items
    Lines {
        /// File encoding
        charset: &'static Encoding,
        /// Pattern every line must match
        pattern: Regex,
    },
    /// One record per line, holding a hex dump in the `DUMP` group
    HexDumpLines {
        /// File encoding
        charset: &'static Encoding,
        /// Pattern every line must match
        pattern: Regex,
    },
    /// One record per line, holding text in the `DUMP` group
    StringDumpLines {
        /// File encoding
        charset: &'static Encoding,
        /// Pattern every line must match
        pattern: Regex,
        /// Encoding the dump is converted to before parsing
        dump_charset: &'static Encoding,
    },
    /// Comma-separated values, one record per line
    CsvLines {
        /// File encoding
        charset: &'static Encoding,
    },
}

impl ReaderStrategy {
    /// Reader identifiers accepted in configuration
    pub const IDS: &'static [&'static str] = &[
        "fixed-bytes",
        "variable-bytes",
        "lines",
        "hex-dump-lines",
        "string-dump-lines",
        "csv-lines",
    ];

    /// Builds a strategy from string options.
    ///
    /// `path` and `key` locate the options in the configuration for error
    /// messages (e.g. `file_types[0].options`).
    pub fn from_options(
        reader: &str,
        options: &IndexMap<String, String>,
        path: &Path,
        key: &str,
    ) -> Result<Self> {
        let opts = Options { values: options, path, key };

        let strategy = match reader {
            "fixed-bytes" => {
                let record_size = opts.usize("record_size")?;
                if record_size == 0 {
                    return Err(opts.error("record_size", "must be greater than zero"));
                }
                if record_size > MAX_RECORD_SIZE {
                    return Err(opts.error(
                        "record_size",
                        format!("must not exceed {MAX_RECORD_SIZE} bytes"),
                    ));
                }
                ReaderStrategy::FixedBytes { record_size }
            }
            "variable-bytes" => ReaderStrategy::VariableBytes {
                read_process: opts.required("read_process")?.to_string(),
            },
            "lines" => ReaderStrategy::Lines {
                charset: opts.line_charset("charset")?,
                pattern: opts.pattern("record_pattern")?,
            },
            "hex-dump-lines" => ReaderStrategy::HexDumpLines {
                charset: opts.line_charset("charset")?,
                pattern: opts.dump_pattern("record_pattern")?,
            },
            "string-dump-lines" => ReaderStrategy::StringDumpLines {
                charset: opts.line_charset("charset")?,
                pattern: opts.dump_pattern("record_pattern")?,
                dump_charset: opts.charset("dump_charset")?,
            },
            "csv-lines" => ReaderStrategy::CsvLines {
                charset: opts.line_charset("charset")?,
            },
            other => {
                let reader_key = key
                    .rsplit_once('.')
                    .map_or("reader".to_string(), |(k, _)| format!("{k}.reader"));
                return Err(Error::invalid_config(
                    path,
                    reader_key,
                    format!("unknown reader '{other}' (expected one of: {})", Self::IDS.join(", ")),
                ));
            }
        };

        for name in options.keys() {
            if !strategy.option_names().contains(&name.as_str()) {
                warn!("Ignoring option '{}.{}' in {}", key, name, path.display());
            }
        }

        Ok(strategy)
    }

    /// Configuration identifier
    pub fn id(&self) -> &'static str {
        match self {
            ReaderStrategy::FixedBytes { .. } => "fixed-bytes",
            ReaderStrategy::VariableBytes { .. } => "variable-bytes",
            ReaderStrategy::Lines { .. } => "lines",
            ReaderStrategy::HexDumpLines { .. } => "hex-dump-lines",
            ReaderStrategy::StringDumpLines { .. } => "string-dump-lines",
            ReaderStrategy::CsvLines { .. } => "csv-lines",
        }
    }

    /// Options this strategy understands
    pub fn option_names(&self) -> &'static [&'static str] {
        match self {
            ReaderStrategy::FixedBytes { .. } => &["record_size", "dump_layouts"],
            ReaderStrategy::VariableBytes { .. } => &["read_process", "dump_layouts"],
            ReaderStrategy::Lines { .. } | ReaderStrategy::HexDumpLines { .. } => {
                &["charset", "record_pattern", "dump_layouts"]
            }
            ReaderStrategy::StringDumpLines { .. } => {
                &["charset", "record_pattern", "dump_charset", "dump_layouts"]
            }
            ReaderStrategy::CsvLines { .. } => &["charset"],
        }
    }

    /// Returns true if records are decoded by walking dump layouts
    pub fn requires_layouts(&self) -> bool {
        !matches!(self, ReaderStrategy::Lines { .. } | ReaderStrategy::CsvLines { .. })
    }

    /// Line pattern, for line-oriented strategies that have one
    pub fn pattern(&self) -> Option<&Regex> {
        match self {
            ReaderStrategy::Lines { pattern, .. }
            | ReaderStrategy::HexDumpLines { pattern, .. }
            | ReaderStrategy::StringDumpLines { pattern, .. } => Some(pattern),
            _ => None,
        }
    }

    /// Names of the pattern's capture groups stored as meta-items
    pub fn meta_group_names(&self) -> Vec<&str> {
        self.pattern()
            .map(|pattern| {
                pattern
                    .capture_names()
                    .flatten()
                    .filter(|name| *name != DUMP_GROUP)
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl fmt::Display for ReaderStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReaderStrategy::FixedBytes { record_size } => {
                write!(f, "{} (record_size={})", self.id(), record_size)
            }
            ReaderStrategy::StringDumpLines { charset, dump_charset, .. } => write!(
                f,
                "{} (charset={}, dump_charset={})",
                self.id(),
                charset.name(),
                dump_charset.name()
            ),
            ReaderStrategy::Lines { charset, .. }
            | ReaderStrategy::HexDumpLines { charset, .. }
            | ReaderStrategy::CsvLines { charset } => {
                write!(f, "{} (charset={})", self.id(), charset.name())
            }
            ReaderStrategy::VariableBytes { .. } => f.write_str(self.id()),
        }
    }
}

struct Options<'a> {
    values: &'a IndexMap<String, String>,
    path: &'a Path,
    key: &'a str,
}

impl Options<'_> {
    fn error(&self, name: &str, message: impl Into<String>) -> Error {
        Error::invalid_config(self.path, format!("{}.{}", self.key, name), message)
    }

    fn optional(&self, name: &str) -> Option<&str> {
        self.values
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, name: &str) -> Result<&str> {
        self.optional(name)
            .ok_or_else(|| self.error(name, "required option is missing or empty"))
    }

    fn usize(&self, name: &str) -> Result<usize> {
        let text = self.required(name)?;
        text.parse()
            .map_err(|_| self.error(name, format!("'{text}' is not a non-negative integer")))
    }

    fn charset(&self, name: &str) -> Result<&'static Encoding> {
        let label = self.required(name)?;
        let encoding = Encoding::for_label(label.as_bytes())
            .ok_or_else(|| self.error(name, format!("unknown charset '{label}'")))?;
        if !can_encode(encoding) {
            return Err(self.error(name, format!("charset '{label}' cannot encode text")));
        }
        Ok(encoding)
    }

    fn line_charset(&self, name: &str) -> Result<&'static Encoding> {
        let encoding = self.charset(name)?;
        if !encoding.is_ascii_compatible() {
            return Err(self.error(
                name,
                format!("line-oriented readers need an ASCII-compatible charset, got '{}'", encoding.name()),
            ));
        }
        Ok(encoding)
    }

    fn pattern(&self, name: &str) -> Result<Regex> {
        let text = self.required(name)?;
        Regex::new(text).map_err(|e| self.error(name, format!("invalid pattern: {e}")))
    }

    fn dump_pattern(&self, name: &str) -> Result<Regex> {
        let pattern = self.pattern(name)?;
        if !pattern.capture_names().flatten().any(|n| n == DUMP_GROUP) {
            return Err(self.error(name, format!("pattern must define a (?<{DUMP_GROUP}>...) group")));
        }
        Ok(pattern)
    }
}

/// An immutable file type definition
#[derive(Debug, Clone)]
pub struct RecordFormat {
    name: String,
    columns: Vec<String>,
    dump_layouts: Vec<Arc<GroupNode>>,
    strategy: ReaderStrategy,
    meta_items: Vec<(String, String)>,
}

impl RecordFormat {
    /// Creates a format with no columns, layouts or meta-items
    pub fn new(name: impl Into<String>, strategy: ReaderStrategy) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            dump_layouts: Vec::new(),
            strategy,
            meta_items: Vec::new(),
        }
    }

    /// Sets the display columns
    pub fn with_columns(mut self, columns: Vec<String>) -> Self {
        self.columns = columns;
        self
    }

    /// Sets the ordered dump layouts
    pub fn with_dump_layouts(mut self, layouts: Vec<Arc<GroupNode>>) -> Self {
        self.dump_layouts = layouts;
        self
    }

    /// Sets the format-level meta-item expressions
    pub fn with_meta_items(mut self, items: Vec<(String, String)>) -> Self {
        self.meta_items = items;
        self
    }

    /// Format name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Display columns (item names)
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Alternative top-level layouts, tried in order
    pub fn dump_layouts(&self) -> &[Arc<GroupNode>] {
        &self.dump_layouts
    }

    /// Reader strategy
    pub fn strategy(&self) -> &ReaderStrategy {
        &self.strategy
    }

    /// Meta-item expressions appended to every parsed record
    pub fn meta_items(&self) -> &[(String, String)] {
        &self.meta_items
    }
}
