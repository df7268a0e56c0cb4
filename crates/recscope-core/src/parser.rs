//! Record parser.
//!
//! [`parse_record`] selects the first dump layout of a format whose condition
//! holds for a record and walks its graph, inserting one lazily evaluated item
//! per field while tracking the running byte offset. Remaining bytes become a
//! hex `[padding]` item; format-level meta-items are appended last.

use crate::error::{Error, Result};
use crate::expr::Param;
use crate::format::RecordFormat;
use crate::layout::{FieldNode, GroupNode, ItemNode, LengthSpec};
use crate::record::{ExpressionCell, FieldCell, Record, RecordValue, ERROR_ITEM};
use std::sync::{Arc, OnceLock};
use tracing::trace;

/// Item covering the bytes left over after the layout walk
pub const PADDING_ITEM: &str = "[padding]";

/// Diagnostic attached when no dump layout applies
pub const UNKNOWN_LAYOUT: &str = "unknown record layout (no applicable dump layout)";

fn padding_node() -> Arc<FieldNode> {
    static PADDING: OnceLock<Arc<FieldNode>> = OnceLock::new();
    Arc::clone(PADDING.get_or_init(|| Arc::new(FieldNode::hex(PADDING_ITEM, LengthSpec::ToEnd))))
}

/// Decodes `record` with the first applicable dump layout of `format`.
///
/// A record no layout applies to gets a single `[error]` meta-item and no
/// items. Only resource-limit failures while evaluating a layout or group
/// condition are returned as errors.
pub fn parse_record(record: &Record, format: &RecordFormat) -> Result<()> {
    let mut selected = None;
    for layout in format.dump_layouts() {
        if condition_holds(record, layout)? {
            selected = Some(layout);
            break;
        }
    }

    let Some(layout) = selected else {
        trace!("No dump layout of '{}' applies", format.name());
        record.insert_meta(ERROR_ITEM, RecordValue::Text(UNKNOWN_LAYOUT.to_string()));
        return Ok(());
    };

    trace!("Parsing with layout '{}'", layout.name());
    let mut walker = Walker { record, offset: 0 };
    walker.walk_children(layout.name(), layout)?;

    if walker.offset < record.len() {
        let length = record.len() - walker.offset;
        record.insert_item(
            PADDING_ITEM,
            RecordValue::Field(FieldCell::new(PADDING_ITEM, padding_node(), walker.offset, length)),
        );
    }

    append_meta_items(record, format);
    Ok(())
}

/// Appends the format-level meta-item expressions to `record`
pub fn append_meta_items(record: &Record, format: &RecordFormat) {
    for (name, expression) in format.meta_items() {
        record.insert_meta(
            name.as_str(),
            RecordValue::Expression(ExpressionCell::new(name.as_str(), expression.as_str(), false)),
        );
    }
}

/// Replaces the user-added meta-items of every record with `items`.
///
/// Meta-items from readers, layouts and the format are left untouched.
pub fn update_meta_items<'a>(
    records: impl IntoIterator<Item = &'a Record>,
    items: &[(String, String)],
) {
    for record in records {
        record.remove_removable_meta();
        for (name, expression) in items {
            record.insert_meta(
                name.as_str(),
                RecordValue::Expression(ExpressionCell::new(name.as_str(), expression.as_str(), true)),
            );
        }
    }
}

fn condition_holds(record: &Record, group: &GroupNode) -> Result<bool> {
    record
        .evaluator()
        .eval_bool(Some(record), group.condition(), &[])
        .map_err(|e| Error::condition(group.condition().unwrap_or_default(), e.to_string()))
}

fn join_path(parent: &str, name: &str) -> String {
    match (parent.is_empty(), name.is_empty()) {
        (true, _) => name.to_string(),
        (false, true) => parent.to_string(),
        (false, false) => format!("{parent}.{name}"),
    }
}

struct Walker<'r> {
    record: &'r Record,
    offset: usize,
}

impl Walker<'_> {
    /// Walks the children of `group`, whose items are named under `path`
    fn walk_children(&mut self, path: &str, group: &GroupNode) -> Result<()> {
        let mut added = false;
        for child in group.children() {
            if added && child.branch().is_continuation() {
                continue;
            }
            added = self.walk(path, child)?;
        }
        Ok(())
    }

    /// Returns whether the node was added (false only for groups whose condition failed)
    fn walk(&mut self, path: &str, node: &ItemNode) -> Result<bool> {
        match node {
            ItemNode::Group(group) => {
                if !condition_holds(self.record, group)? {
                    return Ok(false);
                }
                self.walk_children(&join_path(path, group.name()), group)?;
            }
            ItemNode::Field(field) => {
                let name = join_path(path, field.name());
                let length = self.resolve_length(&name, field.length());
                trace!("Field '{}' at {} (+{})", name, self.offset, length);
                self.record.insert_item(
                    name.as_str(),
                    RecordValue::Field(FieldCell::new(name.as_str(), Arc::clone(field), self.offset, length)),
                );
                self.offset = self.offset.saturating_add(length);
            }
            ItemNode::Meta(value) => {
                self.record.insert_meta(
                    value.name(),
                    RecordValue::Expression(ExpressionCell::new(value.name(), value.expression(), false)),
                );
            }
            ItemNode::Hidden(value) => {
                self.record.insert_hidden(
                    value.name(),
                    RecordValue::Expression(ExpressionCell::new(value.name(), value.expression(), false)),
                );
            }
        }
        Ok(true)
    }

    fn resolve_length(&self, name: &str, spec: &LengthSpec) -> usize {
        let to_end = self.record.len().saturating_sub(self.offset);
        let expression = match spec {
            LengthSpec::Fixed(length) => return *length,
            LengthSpec::ToEnd => return to_end,
            LengthSpec::Expression(expression) => expression,
        };

        let params = [Param::int("offset", self.offset)];
        let result = self
            .record
            .evaluator()
            .eval(Some(self.record), expression, &params)
            .map_err(|e| e.to_string())
            .and_then(|text| parse_length(&text));

        match result {
            Ok(Some(length)) => length,
            Ok(None) => to_end,
            Err(message) => {
                self.record.insert_meta(
                    format!("[length error: {name}]"),
                    RecordValue::Text(format!("length: {expression}, error: {message}")),
                );
                0
            }
        }
    }
}

/// Parses an evaluated length; `Ok(None)` means "to end of record"
fn parse_length(text: &str) -> std::result::Result<Option<usize>, String> {
    let text = text.trim();
    let number = match text.parse::<i64>() {
        Ok(n) => n,
        Err(_) => match text.parse::<f64>() {
            Ok(f) if f.fract() == 0.0 && f.is_finite() => f as i64,
            _ => return Err(format!("'{text}' is not an integer length")),
        },
    };
    match number {
        -1 => Ok(None),
        n if n < 0 => Err(format!("negative length {n}")),
        n => usize::try_from(n)
            .map(Some)
            .map_err(|_| format!("length {n} out of range")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Evaluator;
    use crate::format::ReaderStrategy;
    use crate::layout::{LayoutLibrary, LayoutSource};
    use pretty_assertions::assert_eq;

    fn format(layouts: &[(&str, &str)], dump: &[&str]) -> RecordFormat {
        let mut library = LayoutLibrary::new();
        for (name, text) in layouts {
            library.insert(*name, LayoutSource::parse(format!("{name}.toml"), text).unwrap());
        }
        let dump_layouts = dump
            .iter()
            .map(|name| library.compile(name).unwrap().unwrap())
            .collect();
        RecordFormat::new("test", ReaderStrategy::FixedBytes { record_size: 1 })
            .with_dump_layouts(dump_layouts)
    }

    fn parsed(format: &RecordFormat, data: &[u8]) -> Record {
        let record = Record::from_bytes(&Evaluator::new(), data.to_vec());
        parse_record(&record, format).unwrap();
        record
    }

    fn items(record: &Record) -> Vec<(String, String)> {
        record
            .items()
            .into_iter()
            .map(|(name, value)| (name, value.value(record)))
            .collect()
    }

    fn pairs(entries: &[(&str, &str)]) -> Vec<(String, String)> {
        entries.iter().map(|(a, b)| (a.to_string(), b.to_string())).collect()
    }

    const HEADER: &str = r#"
        name = "rec"
        item1 = "hex:kind,1"
        item2 = "string:label,UTF-8,3"
        item3 = "meta:kind_name,if $hex(\"rec.kind\") == \"01\" { \"one\" } else { \"other\" }"
        item4 = "hidden:secret,40 + 2"
    "#;

    #[test]
    fn test_fields_offsets_and_padding() {
        let format = format(&[("rec", HEADER)], &["rec"]);
        let record = parsed(&format, b"\x01abcXY");

        assert_eq!(
            items(&record),
            pairs(&[("rec.kind", "01"), ("rec.label", "abc"), ("[padding]", "5859")])
        );

        let padding = record.item(PADDING_ITEM).unwrap();
        let cell = padding.as_field().unwrap();
        assert_eq!((cell.offset(), cell.length()), (4, 2));
        assert_eq!(record.value("kind_name"), "one");
        assert_eq!(record.value("secret"), "42");
        assert!(record.meta_items().iter().all(|(name, _)| name != "secret"));
    }

    #[test]
    fn test_no_padding_when_consumed() {
        let format = format(&[("rec", HEADER)], &["rec"]);
        let record = parsed(&format, b"\x01abc");
        assert!(record.item(PADDING_ITEM).is_none());
    }

    #[test]
    fn test_walk_is_deterministic() {
        let format = format(&[("rec", HEADER)], &["rec"]);
        let first = parsed(&format, b"\x02xyz!");
        let second = parsed(&format, b"\x02xyz!");
        assert_eq!(items(&first), items(&second));
        assert_eq!(first.value("kind_name"), second.value("kind_name"));
    }

    #[test]
    fn test_unknown_layout() {
        let layout = "name = \"rec\"\ncondition = \"rec.length() > 10\"\nitem1 = \"hex:a,1\"";
        let format = format(&[("rec", layout)], &["rec"]);
        let record = parsed(&format, b"\x01");

        assert_eq!(record.item_count(), 0);
        assert_eq!(record.error_message().as_deref(), Some(UNKNOWN_LAYOUT));
        assert_eq!(record.meta_items().len(), 1);
    }

    #[test]
    fn test_first_matching_layout_wins() {
        let a = "name = \"a\"\ncondition = \"rec.raw()[0] == 0xAA\"\nitem1 = \"hex:x,1\"";
        let b = "name = \"b\"\nitem1 = \"hex:y,1\"";
        let c = "name = \"c\"\nitem1 = \"hex:z,1\"";
        let format = format(&[("a", a), ("b", b), ("c", c)], &["a", "b", "c"]);

        assert_eq!(items(&parsed(&format, &[0xAA])), pairs(&[("a.x", "AA")]));
        assert_eq!(items(&parsed(&format, &[0xBB])), pairs(&[("b.y", "BB")]));
    }

    #[test]
    fn test_branch_chain() {
        let layout = r#"
            name = "rec"
            item1 = "hex:kind,1"
            item2 = "if $(\"rec.kind\") == \"01\""
            item3 = "hex:one,1"
            item4 = "elsif $(\"rec.kind\") == \"02\""
            item5 = "hex:two,1"
            item6 = "else"
            item7 = "hex:other,1"
            item8 = "endif"
            item9 = "hex:tail,1"
        "#;
        let format = format(&[("rec", layout)], &["rec"]);

        let names = |data: &[u8]| -> Vec<String> {
            parsed(&format, data).items().into_iter().map(|(n, _)| n).collect()
        };
        assert_eq!(names(&[1, 0, 0]), vec!["rec.kind", "rec.one", "rec.tail"]);
        assert_eq!(names(&[2, 0, 0]), vec!["rec.kind", "rec.two", "rec.tail"]);
        assert_eq!(names(&[3, 0, 0]), vec!["rec.kind", "rec.other", "rec.tail"]);
    }

    #[test]
    fn test_failing_condition_opens_branch() {
        let layout = r#"
            name = "rec"
            item1 = "if throw \"broken\""
            item2 = "hex:first,1"
            item3 = "else"
            item4 = "hex:second,1"
            item5 = "endif"
        "#;
        let format = format(&[("rec", layout)], &["rec"]);
        let record = parsed(&format, &[1, 2]);
        assert_eq!(items(&record), pairs(&[("rec.first", "01"), ("[padding]", "02")]));
    }

    #[test]
    fn test_nested_group_paths() {
        let inner = "name = \"inner\"\nitem1 = \"hex:b,1\"";
        let outer = "name = \"outer\"\nitem1 = \"hex:a,1\"\nitem2 = \"group:inner\"";
        let format = format(&[("inner", inner), ("outer", outer)], &["outer"]);
        let record = parsed(&format, &[1, 2]);
        assert_eq!(items(&record), pairs(&[("outer.a", "01"), ("outer.inner.b", "02")]));
    }

    #[test]
    fn test_computed_length() {
        let layout = r#"
            name = "rec"
            item1 = "hex:len,1"
            item2 = "string:body,UTF-8,parse_int($hex(\"rec.len\")) + offset - 1"
            item3 = "hex:rest,-1"
        "#;
        let format = format(&[("rec", layout)], &["rec"]);
        let record = parsed(&format, b"\x03abcdef");
        assert_eq!(
            items(&record),
            pairs(&[("rec.len", "03"), ("rec.body", "abc"), ("rec.rest", "646566")])
        );
    }

    #[test]
    fn test_length_minus_one_expression() {
        let layout = "name = \"rec\"\nitem1 = \"hex:all,0 - 1\"";
        let format = format(&[("rec", layout)], &["rec"]);
        let record = parsed(&format, &[1, 2, 3]);
        assert_eq!(items(&record), pairs(&[("rec.all", "010203")]));
    }

    #[test]
    fn test_length_error_diagnostic() {
        let layout = r#"
            name = "rec"
            item1 = "hex:bad,rec.length() / 2.0 + 0.25"
            item2 = "hex:next,1"
        "#;
        let format = format(&[("rec", layout)], &["rec"]);
        let record = parsed(&format, &[7]);

        assert_eq!(items(&record), pairs(&[("rec.bad", ""), ("rec.next", "07")]));
        let diagnostic = record.value("[length error: rec.bad]");
        assert!(diagnostic.contains("not an integer length"), "{diagnostic}");
    }

    #[test]
    fn test_last_write_wins() {
        let layout = "name = \"rec\"\nitem1 = \"hex:a,1\"\nitem2 = \"hex:b,1\"\nitem3 = \"hex:a,1\"";
        let format = format(&[("rec", layout)], &["rec"]);
        let record = parsed(&format, &[1, 2, 3]);
        assert_eq!(items(&record), pairs(&[("rec.a", "03"), ("rec.b", "02")]));
    }

    #[test]
    fn test_format_meta_items() {
        let format = format(&[("rec", HEADER)], &["rec"])
            .with_meta_items(pairs(&[("size", "rec.length()")]));
        let record = parsed(&format, b"\x01abc");
        let names: Vec<_> = record.meta_items().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["kind_name", "size"]);
        assert_eq!(record.value("size"), "4");
    }

    #[test]
    fn test_update_meta_items() {
        let format = format(&[("rec", HEADER)], &["rec"])
            .with_meta_items(pairs(&[("size", "rec.length()")]));
        let records = vec![parsed(&format, b"\x01abc"), parsed(&format, b"\x02abc")];

        update_meta_items(&records, &pairs(&[("user", "\"u1\"")]));
        update_meta_items(&records, &pairs(&[("other", "\"u2\"")]));

        for record in &records {
            let names: Vec<_> = record.meta_items().into_iter().map(|(n, _)| n).collect();
            assert_eq!(names, vec!["kind_name", "size", "other"]);
            assert_eq!(record.value("other"), "u2");
        }
    }

    #[test]
    fn test_limit_in_condition_aborts() {
        let layout = "name = \"rec\"\ncondition = \"loop { }\"\nitem1 = \"hex:a,1\"";
        let format = format(&[("rec", layout)], &["rec"]);
        let evaluator = Evaluator::with_config(crate::expr::EvaluatorConfig::new().max_operations(500));
        let record = Record::from_bytes(&evaluator, vec![1]);
        let err = parse_record(&record, &format).unwrap_err();
        assert!(matches!(err, Error::Condition { .. }));
    }

    #[test]
    fn test_limit_in_length_is_local() {
        let layout = "name = \"rec\"\nitem1 = \"hex:a,loop { }\"";
        let format = format(&[("rec", layout)], &["rec"]);
        let evaluator = Evaluator::with_config(crate::expr::EvaluatorConfig::new().max_operations(500));
        let record = Record::from_bytes(&evaluator, vec![1, 2]);
        parse_record(&record, &format).unwrap();

        let diagnostic = record.value("[length error: rec.a]");
        assert!(diagnostic.starts_with("length: loop { }, error: "));
        assert_eq!(record.value("rec.a"), "");
        assert_eq!(record.value(PADDING_ITEM), "0102");
    }

    #[test]
    fn test_parse_length() {
        assert_eq!(parse_length("4"), Ok(Some(4)));
        assert_eq!(parse_length(" 4.0 "), Ok(Some(4)));
        assert_eq!(parse_length("-1"), Ok(None));
        assert!(parse_length("-3").is_err());
        assert!(parse_length("4.5").is_err());
        assert!(parse_length("").is_err());
    }
}
