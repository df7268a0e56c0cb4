//! # recscope-core
//!
//! A configurable record-extraction engine: it turns structured files into
//! records of named, typed items according to declarative, conditional
//! layouts.
//!
//! This crate provides the core functionality for:
//! - Compiling layout files (fields, reusable groups, if/elsif/else chains)
//!   into immutable definition graphs
//! - Splitting files into raw records (fixed-size, script-cut, or lines that
//!   may embed hex or string dumps)
//! - Walking a layout against a record with lazily evaluated, memoized values
//! - Windowed access (offset and page size, last page, end-of-file detection)
//!   over files too large to load at once
//!
//! ## Architecture
//!
//! - [`config`]: TOML file type configuration
//! - [`format`]: Record formats and reader strategies
//! - [`layout`]: Item definition graph and its compiler
//! - [`reader`]: Raw record sources and windowed loading
//! - [`parser`]: Layout selection and walking
//! - [`record`]: Records, lazy values and record sets
//! - [`expr`]: Rhai expression evaluation
//! - [`filter`]: Record filtering
//! - [`codec`]: Hex conversion
//! - [`error`]: Error types and handling
//!
//! ## Example
//!
//! ```no_run
//! use recscope_core::Configuration;
//!
//! let config = Configuration::load("formats/types.toml")?;
//! let reader = config.reader("sample").expect("file type is configured");
//!
//! // The last ten records
//! let records = reader.load("data/sample.bin", -1, 10)?;
//! for record in &records {
//!     for (name, value) in record.items() {
//!         println!("{name} = {}", value.value(record));
//!     }
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unreachable_pub)]

pub mod codec;
pub mod config;
pub mod error;
pub mod expr;
pub mod filter;
pub mod format;
pub mod layout;
pub mod parser;
pub mod reader;
pub mod record;

// Re-export primary types for convenience
pub use config::Configuration;
pub use error::{Error, Result};
pub use expr::{EvalError, Evaluator, EvaluatorConfig, Param};
pub use filter::RecordFilter;
pub use format::{ReaderStrategy, RecordFormat};
pub use layout::{GroupNode, ItemNode, LayoutLibrary};
pub use parser::{parse_record, update_meta_items};
pub use reader::RecordReader;
pub use record::{Record, RecordSet, RecordValue};

/// Crate version for programmatic access
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
