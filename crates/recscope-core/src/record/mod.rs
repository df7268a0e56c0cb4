//! Record model.
//!
//! A [`Record`] holds one raw payload and three ordered name→value maps:
//!
//! - items: the fields produced by a layout walk
//! - meta-items: reader-provided values, expression results and diagnostics
//! - hidden items: internal values usable by expressions, never displayed
//!
//! Records are cheap to clone (a shared handle) and are what expressions see
//! as `rec`. Values are computed lazily through [`RecordValue`] cells.

mod item;

pub use item::{ExpressionCell, FieldCell, RecordValue, NOT_AVAILABLE};

use crate::expr::Evaluator;
use crate::format::RecordFormat;
use bytes::Bytes;
use indexmap::IndexMap;
use std::cell::RefCell;
use std::fmt;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;

/// Meta-item carrying the reason a record could not be decoded
pub const ERROR_ITEM: &str = "[error]";

/// Hidden item holding the format name
pub const FORMAT_ITEM: &str = "[format]";

/// Hidden item holding the 1-based record number
pub const NUMBER_ITEM: &str = "[No.]";

/// Raw content of a record
#[derive(Debug, Clone)]
pub enum Payload {
    /// Binary record
    Bytes(Bytes),
    /// Decoded text line
    Text(String),
    /// No payload (unmatched lines)
    Absent,
}

type ValueMap = RefCell<IndexMap<String, Rc<RecordValue>>>;

/// One decoded record
#[derive(Clone)]
pub struct Record {
    inner: Rc<RecordInner>,
}

struct RecordInner {
    payload: Payload,
    length: usize,
    evaluator: Evaluator,
    items: ValueMap,
    meta_items: ValueMap,
    hidden_items: ValueMap,
}

impl Record {
    fn with_payload(evaluator: &Evaluator, payload: Payload, length: usize) -> Self {
        Self {
            inner: Rc::new(RecordInner {
                payload,
                length,
                evaluator: evaluator.clone(),
                items: RefCell::default(),
                meta_items: RefCell::default(),
                hidden_items: RefCell::default(),
            }),
        }
    }

    /// Creates a record over binary data
    pub fn from_bytes(evaluator: &Evaluator, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let length = data.len();
        Self::with_payload(evaluator, Payload::Bytes(data), length)
    }

    /// Creates a record over a decoded line; its length counts characters
    pub fn from_text(evaluator: &Evaluator, text: impl Into<String>) -> Self {
        let text = text.into();
        let length = text.chars().count();
        Self::with_payload(evaluator, Payload::Text(text), length)
    }

    /// Creates a record with no payload
    pub fn without_payload(evaluator: &Evaluator, length: usize) -> Self {
        Self::with_payload(evaluator, Payload::Absent, length)
    }

    /// Creates a record whose only meta-item is `[error]`
    pub fn error(evaluator: &Evaluator, message: impl Into<String>) -> Self {
        let record = Self::without_payload(evaluator, 0);
        record.insert_meta(ERROR_ITEM, RecordValue::Text(message.into()));
        record
    }

    /// Raw payload
    pub fn payload(&self) -> &Payload {
        &self.inner.payload
    }

    /// Total length (bytes, or characters for text payloads)
    pub fn len(&self) -> usize {
        self.inner.length
    }

    /// Returns true if the record has no content
    pub fn is_empty(&self) -> bool {
        self.inner.length == 0
    }

    /// Copy of the payload as bytes (UTF-8 for text payloads)
    pub fn raw_bytes(&self) -> Vec<u8> {
        match &self.inner.payload {
            Payload::Bytes(data) => data.to_vec(),
            Payload::Text(text) => text.as_bytes().to_vec(),
            Payload::Absent => Vec::new(),
        }
    }

    /// Evaluator used for this record's expressions
    pub fn evaluator(&self) -> &Evaluator {
        &self.inner.evaluator
    }

    /// Looks `name` up in items, then meta-items, then hidden items.
    ///
    /// Missing names render as the empty string.
    pub fn value(&self, name: &str) -> String {
        let cell = [
            &self.inner.items,
            &self.inner.meta_items,
            &self.inner.hidden_items,
        ]
        .into_iter()
        .find_map(|map| map.borrow().get(name).cloned());

        // borrow released: computing may insert diagnostics
        cell.map(|cell| cell.value(self)).unwrap_or_default()
    }

    /// Hex rendering of the field item `name`, or empty
    pub fn hex_value(&self, name: &str) -> String {
        let cell = self.item(name);
        cell.map(|cell| cell.hex(self)).unwrap_or_default()
    }

    /// Item `name`
    pub fn item(&self, name: &str) -> Option<Rc<RecordValue>> {
        self.inner.items.borrow().get(name).cloned()
    }

    /// Meta-item `name`
    pub fn meta_item(&self, name: &str) -> Option<Rc<RecordValue>> {
        self.inner.meta_items.borrow().get(name).cloned()
    }

    /// Hidden item `name`
    pub fn hidden_item(&self, name: &str) -> Option<Rc<RecordValue>> {
        self.inner.hidden_items.borrow().get(name).cloned()
    }

    /// Inserts an item; a repeated name replaces the value in place
    pub fn insert_item(&self, name: impl Into<String>, value: RecordValue) {
        self.inner.items.borrow_mut().insert(name.into(), Rc::new(value));
    }

    /// Inserts a meta-item; a repeated name replaces the value in place
    pub fn insert_meta(&self, name: impl Into<String>, value: RecordValue) {
        self.inner.meta_items.borrow_mut().insert(name.into(), Rc::new(value));
    }

    /// Inserts a hidden item; a repeated name replaces the value in place
    pub fn insert_hidden(&self, name: impl Into<String>, value: RecordValue) {
        self.inner.hidden_items.borrow_mut().insert(name.into(), Rc::new(value));
    }

    /// Removes every user-added (removable) meta-item
    pub fn remove_removable_meta(&self) {
        self.inner
            .meta_items
            .borrow_mut()
            .retain(|_, value| !value.is_removable());
    }

    /// Snapshot of the items, in insertion order
    pub fn items(&self) -> Vec<(String, Rc<RecordValue>)> {
        snapshot(&self.inner.items)
    }

    /// Snapshot of the meta-items, in insertion order
    pub fn meta_items(&self) -> Vec<(String, Rc<RecordValue>)> {
        snapshot(&self.inner.meta_items)
    }

    /// Snapshot of the hidden items, in insertion order
    pub fn hidden_items(&self) -> Vec<(String, Rc<RecordValue>)> {
        snapshot(&self.inner.hidden_items)
    }

    /// Number of items
    pub fn item_count(&self) -> usize {
        self.inner.items.borrow().len()
    }

    /// The `[error]` meta-item, if the record could not be decoded
    pub fn error_message(&self) -> Option<String> {
        self.meta_item(ERROR_ITEM).map(|value| value.value(self))
    }
}

fn snapshot(map: &ValueMap) -> Vec<(String, Rc<RecordValue>)> {
    map.borrow()
        .iter()
        .map(|(name, value)| (name.clone(), Rc::clone(value)))
        .collect()
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = |map: &ValueMap| map.borrow().keys().cloned().collect::<Vec<_>>();
        f.debug_struct("Record")
            .field("length", &self.inner.length)
            .field("items", &names(&self.inner.items))
            .field("meta_items", &names(&self.inner.meta_items))
            .field("hidden_items", &names(&self.inner.hidden_items))
            .finish()
    }
}

/// A window of records loaded from one file
#[derive(Debug)]
pub struct RecordSet {
    records: Vec<Record>,
    path: PathBuf,
    format: Arc<RecordFormat>,
    offset: usize,
    eof: bool,
}

impl RecordSet {
    /// Creates a new record set
    pub fn new(
        records: Vec<Record>,
        path: impl Into<PathBuf>,
        format: Arc<RecordFormat>,
        offset: usize,
        eof: bool,
    ) -> Self {
        Self {
            records,
            path: path.into(),
            format,
            offset,
            eof,
        }
    }

    /// Records in file order
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Source file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Format the records were decoded with
    pub fn format(&self) -> &RecordFormat {
        &self.format
    }

    /// Index of the first record in the file
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// True when the window reaches the end of the file
    pub fn eof(&self) -> bool {
        self.eof
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if the window holds no records
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Iterates over the records
    pub fn iter(&self) -> std::slice::Iter<'_, Record> {
        self.records.iter()
    }
}

impl<'a> IntoIterator for &'a RecordSet {
    type Item = &'a Record;
    type IntoIter = std::slice::Iter<'a, Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}
