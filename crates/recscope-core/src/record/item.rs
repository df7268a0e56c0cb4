//! Lazy, memoized record values.
//!
//! Field and expression values are computed on first access and never
//! recomputed. A cell that is read again while it is still computing (an
//! expression referring to itself, directly or through other items) resolves
//! to an empty string.

use super::{Payload, Record};
use crate::codec::{clamp_range, encode_hex, encode_text};
use crate::expr::Param;
use crate::layout::{FieldKind, FieldNode};
use std::cell::{Cell, OnceCell};
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Rendering of a value whose computation failed
pub const NOT_AVAILABLE: &str = "[N/A]";

/// A value stored in one of a record's maps
#[derive(Debug)]
pub enum RecordValue {
    /// Fixed text (reader-provided values and diagnostics)
    Text(String),
    /// Byte-range field
    Field(FieldCell),
    /// Computed expression
    Expression(ExpressionCell),
}

impl RecordValue {
    /// Renders the value, computing it on first access
    pub fn value(&self, record: &Record) -> String {
        match self {
            RecordValue::Text(text) => text.clone(),
            RecordValue::Field(cell) => cell.value(record),
            RecordValue::Expression(cell) => cell.value(record),
        }
    }

    /// Hex rendering of the underlying bytes; empty for non-field values
    pub fn hex(&self, record: &Record) -> String {
        match self {
            RecordValue::Field(cell) => cell.hex(record),
            _ => String::new(),
        }
    }

    /// Returns the field cell, if this is a field
    pub fn as_field(&self) -> Option<&FieldCell> {
        match self {
            RecordValue::Field(cell) => Some(cell),
            _ => None,
        }
    }

    /// Returns true for user-added meta-items that may be bulk-replaced
    pub fn is_removable(&self) -> bool {
        matches!(self, RecordValue::Expression(cell) if cell.removable)
    }
}

#[derive(Default)]
struct Memo {
    value: OnceCell<String>,
    busy: Cell<bool>,
}

impl Memo {
    fn get_or_compute(&self, name: &str, compute: impl FnOnce() -> String) -> String {
        if let Some(value) = self.value.get() {
            return value.clone();
        }
        if self.busy.replace(true) {
            warn!("Value '{}' refers to itself; resolving to empty", name);
            return String::new();
        }
        let value = compute();
        self.busy.set(false);
        self.value.get_or_init(|| value).clone()
    }
}

impl fmt::Debug for Memo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Memo").field(&self.value.get()).finish()
    }
}

/// A field bound to its offset and length within one record
#[derive(Debug)]
pub struct FieldCell {
    name: String,
    node: Arc<FieldNode>,
    offset: usize,
    length: usize,
    value: Memo,
    hex: Memo,
}

impl FieldCell {
    /// Binds `node` to a byte range; `name` is the full dotted item name
    pub fn new(name: impl Into<String>, node: Arc<FieldNode>, offset: usize, length: usize) -> Self {
        Self {
            name: name.into(),
            node,
            offset,
            length,
            value: Memo::default(),
            hex: Memo::default(),
        }
    }

    /// Full item name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Field definition
    pub fn node(&self) -> &FieldNode {
        &self.node
    }

    /// Start of the field within the record
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Length resolved when the record was parsed
    pub fn length(&self) -> usize {
        self.length
    }

    /// Rendered value, after the field's value expression if it has one
    pub fn value(&self, record: &Record) -> String {
        self.value.get_or_compute(&self.name, || {
            let raw = self.raw(record);
            let Some(expression) = self.node.value_expression() else {
                return raw;
            };

            let params = [
                Param::text("value", raw.clone()),
                Param::int("offset", self.offset),
            ];
            match record.evaluator().eval(Some(record), expression, &params) {
                Ok(value) => value,
                Err(err) => {
                    record.insert_meta(
                        format!("[value error: {}]", self.name),
                        RecordValue::Text(format!("source value: {raw}, error: {err}")),
                    );
                    NOT_AVAILABLE.to_string()
                }
            }
        })
    }

    /// Uppercase hex of the field's bytes
    pub fn hex(&self, record: &Record) -> String {
        self.hex.get_or_compute(&self.name, || match (record.payload(), self.node.kind()) {
            (Payload::Bytes(data), _) => encode_hex(data, self.offset, self.length),
            (Payload::Text(text), FieldKind::Hex) => {
                hex::encode_upper(char_slice(text, self.offset, self.length))
            }
            (Payload::Text(text), FieldKind::String(encoding)) => {
                hex::encode_upper(encode_text(encoding, char_slice(text, self.offset, self.length)))
            }
            (Payload::Absent, _) => String::new(),
        })
    }

    fn raw(&self, record: &Record) -> String {
        match (record.payload(), self.node.kind()) {
            (_, FieldKind::Hex) => self.hex(record),
            (Payload::Bytes(data), FieldKind::String(encoding)) => {
                let range = clamp_range(data.len(), self.offset, self.length);
                let (text, _) = encoding.decode_without_bom_handling(&data[range]);
                text.into_owned()
            }
            (Payload::Text(text), FieldKind::String(_)) => {
                char_slice(text, self.offset, self.length).to_string()
            }
            (Payload::Absent, _) => String::new(),
        }
    }
}

/// Substring by character position, clamped to the text
fn char_slice(text: &str, offset: usize, length: usize) -> &str {
    let byte_at = |chars: usize| {
        text.char_indices()
            .nth(chars)
            .map_or(text.len(), |(i, _)| i)
    };
    let start = byte_at(offset);
    let end = byte_at(offset.saturating_add(length)).max(start);
    &text[start..end]
}

/// A named expression evaluated against its record
#[derive(Debug)]
pub struct ExpressionCell {
    name: String,
    expression: String,
    removable: bool,
    memo: Memo,
}

impl ExpressionCell {
    /// Creates a new cell; `removable` marks user-added meta-items
    pub fn new(name: impl Into<String>, expression: impl Into<String>, removable: bool) -> Self {
        Self {
            name: name.into(),
            expression: expression.into(),
            removable,
            memo: Memo::default(),
        }
    }

    /// Item name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Source expression
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Computed value
    pub fn value(&self, record: &Record) -> String {
        self.memo.get_or_compute(&self.name, || {
            match record.evaluator().eval(Some(record), &self.expression, &[]) {
                Ok(value) => value,
                Err(err) => {
                    record.insert_meta(
                        format!("[value error: {}]", self.name),
                        RecordValue::Text(format!("expression: {}, error: {err}", self.expression)),
                    );
                    NOT_AVAILABLE.to_string()
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Evaluator;
    use crate::layout::LengthSpec;

    fn string_field(name: &str, expression: Option<&str>) -> Arc<FieldNode> {
        Arc::new(FieldNode::new(
            name,
            FieldKind::String(encoding_rs::UTF_8),
            LengthSpec::Fixed(0),
            expression.map(str::to_string),
        ))
    }

    #[test]
    fn test_char_slice() {
        assert_eq!(char_slice("héllo", 1, 3), "éll");
        assert_eq!(char_slice("héllo", 3, 10), "lo");
        assert_eq!(char_slice("héllo", 9, 2), "");
    }

    #[test]
    fn test_field_on_bytes() {
        let record = Record::from_bytes(&Evaluator::new(), b"\x01ABCD".to_vec());
        let cell = FieldCell::new("g.text", string_field("text", None), 1, 3);
        assert_eq!(cell.value(&record), "ABC");
        assert_eq!(cell.hex(&record), "414243");

        let hex = FieldCell::new("g.kind", Arc::new(FieldNode::hex("kind", LengthSpec::Fixed(1))), 0, 1);
        assert_eq!(hex.value(&record), "01");
    }

    #[test]
    fn test_field_clamps_to_payload() {
        let record = Record::from_bytes(&Evaluator::new(), b"AB".to_vec());
        let cell = FieldCell::new("x", string_field("x", None), 1, 8);
        assert_eq!(cell.value(&record), "B");
        assert_eq!(cell.hex(&record), "42");
    }

    #[test]
    fn test_field_on_text() {
        let record = Record::from_text(&Evaluator::new(), "ab-cd");
        let cell = FieldCell::new("x", string_field("x", None), 3, 2);
        assert_eq!(cell.value(&record), "cd");
        assert_eq!(cell.hex(&record), "6364");
    }

    #[test]
    fn test_text_hex_in_field_charset() {
        let record = Record::from_text(&Evaluator::new(), "xAB\u{e9}");
        let node = |encoding| {
            Arc::new(FieldNode::new("s", FieldKind::String(encoding), LengthSpec::Fixed(0), None))
        };
        let utf16 = FieldCell::new("s", node(encoding_rs::UTF_16LE), 1, 2);
        assert_eq!(utf16.hex(&record), "41004200");
        let sjis = FieldCell::new("s", node(encoding_rs::SHIFT_JIS), 1, 3);
        assert_eq!(sjis.hex(&record), "41423F");
    }

    #[test]
    fn test_value_expression() {
        let record = Record::from_bytes(&Evaluator::new(), b"0042".to_vec());
        let node = string_field("n", Some("`${parse_int(value) + 1}@${offset}`"));
        let cell = FieldCell::new("n", node, 0, 4);
        assert_eq!(cell.value(&record), "43@0");
    }

    #[test]
    fn test_value_expression_error() {
        let record = Record::from_bytes(&Evaluator::new(), b"zz".to_vec());
        let cell = FieldCell::new("n", string_field("n", Some("throw \"bad\"")), 0, 2);
        assert_eq!(cell.value(&record), NOT_AVAILABLE);

        let diagnostic = record.meta_item("[value error: n]").unwrap();
        let text = diagnostic.value(&record);
        assert!(text.starts_with("source value: zz, error: "));
        assert!(text.contains("bad"));
    }

    #[test]
    fn test_expression_memoized() {
        let record = Record::from_bytes(&Evaluator::new(), vec![1, 2, 3]);
        let cell = ExpressionCell::new("len", "rec.length() * 2", false);
        assert_eq!(cell.value(&record), "6");
        assert_eq!(cell.value(&record), "6");
        assert_eq!(format!("{:?}", cell.memo), "Memo(Some(\"6\"))");
    }

    #[test]
    fn test_self_reference_resolves_empty() {
        let record = Record::from_bytes(&Evaluator::new(), vec![]);
        record.insert_meta(
            "loop",
            RecordValue::Expression(ExpressionCell::new("loop", "\"<\" + $(\"loop\") + \">\"", false)),
        );
        assert_eq!(record.value("loop"), "<>");
    }

    #[test]
    fn test_removable_flag() {
        assert!(RecordValue::Expression(ExpressionCell::new("a", "1", true)).is_removable());
        assert!(!RecordValue::Expression(ExpressionCell::new("a", "1", false)).is_removable());
        assert!(!RecordValue::Text("a".into()).is_removable());
    }
}
