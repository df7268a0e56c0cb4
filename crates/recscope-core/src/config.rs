//! File type configuration.
//!
//! A configuration is one TOML file declaring script libraries, layout
//! directories, evaluator limits and the file types (record formats):
//!
//! ```toml
//! scripts = ["scripts/common.rhai"]
//! layout_dirs = ["layouts"]
//!
//! [evaluator]
//! max_operations = 100000
//!
//! [[file_types]]
//! name = "sample"
//! reader = "fixed-bytes"
//! list_items = '[No.], rec.kind, rec.label'
//! options = { record_size = 16, dump_layouts = "rec" }
//! meta_items = { size = "rec.length()" }
//! ```
//!
//! Relative paths are resolved against the directory of the configuration
//! file. All layouts are compiled while loading, so layout errors surface
//! before any file is read.

use crate::error::{Error, Result};
use crate::expr::{Evaluator, EvaluatorConfig};
use crate::format::{ReaderStrategy, RecordFormat};
use crate::layout::LayoutLibrary;
use crate::reader::RecordReader;
use indexmap::IndexMap;
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    scripts: Vec<PathBuf>,
    #[serde(default)]
    layout_dirs: Vec<PathBuf>,
    #[serde(default)]
    evaluator: EvaluatorSection,
    #[serde(default)]
    file_types: Vec<FileTypeEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct EvaluatorSection {
    max_operations: Option<u64>,
    max_call_levels: Option<usize>,
    max_expr_depth: Option<usize>,
}

impl EvaluatorSection {
    fn to_config(&self) -> EvaluatorConfig {
        let mut config = EvaluatorConfig::new();
        if let Some(max) = self.max_operations {
            config = config.max_operations(max);
        }
        if let Some(max) = self.max_call_levels {
            config = config.max_call_levels(max);
        }
        if let Some(max) = self.max_expr_depth {
            config = config.max_expr_depth(max);
        }
        config
    }
}

#[derive(Debug, Deserialize)]
struct FileTypeEntry {
    name: String,
    reader: String,
    #[serde(default)]
    list_items: String,
    #[serde(default)]
    options: IndexMap<String, OptionValue>,
    #[serde(default)]
    meta_items: IndexMap<String, String>,
}

/// Reader options may be written as strings, integers or booleans
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OptionValue {
    Text(String),
    Integer(i64),
    Boolean(bool),
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Text(text) => f.write_str(text),
            OptionValue::Integer(n) => write!(f, "{n}"),
            OptionValue::Boolean(b) => write!(f, "{b}"),
        }
    }
}

/// A loaded file type configuration
#[derive(Debug)]
pub struct Configuration {
    path: PathBuf,
    evaluator: Evaluator,
    formats: IndexMap<String, Arc<RecordFormat>>,
    layouts: Vec<String>,
}

impl Configuration {
    /// Loads and validates the configuration file at `path`
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| Error::file_read(path, e))?;
        Self::parse(path, &text)
    }

    /// Parses configuration `text`; `path` locates relative paths and names errors
    pub fn parse(path: impl AsRef<Path>, text: &str) -> Result<Self> {
        let path = path.as_ref();
        let file: ConfigFile = toml::from_str(text).map_err(|e| Error::config_syntax(path, e))?;
        let base = path.parent().unwrap_or_else(|| Path::new(""));

        let mut scripts = Vec::with_capacity(file.scripts.len());
        for (i, script) in file.scripts.iter().enumerate() {
            let script = base.join(script);
            if !script.is_file() {
                return Err(Error::invalid_config(
                    path,
                    format!("scripts[{i}]"),
                    format!("script '{}' not found", script.display()),
                ));
            }
            scripts.push(script);
        }
        let evaluator = Evaluator::with_scripts(file.evaluator.to_config(), &scripts)?;

        let mut library = LayoutLibrary::new();
        for (i, dir) in file.layout_dirs.iter().enumerate() {
            let dir = base.join(dir);
            if !dir.is_dir() {
                return Err(Error::invalid_config(
                    path,
                    format!("layout_dirs[{i}]"),
                    format!("directory '{}' not found", dir.display()),
                ));
            }
            library.load_dir(&dir)?;
        }
        library.compile_all()?;

        let mut formats = IndexMap::with_capacity(file.file_types.len());
        for (i, entry) in file.file_types.iter().enumerate() {
            let key = format!("file_types[{i}]");
            if entry.name.trim().is_empty() {
                return Err(Error::invalid_config(path, format!("{key}.name"), "name is empty"));
            }
            if formats.contains_key(&entry.name) {
                return Err(Error::invalid_config(
                    path,
                    format!("{key}.name"),
                    format!("duplicate file type '{}'", entry.name),
                ));
            }

            let format = build_format(entry, &mut library, path, &key)?;
            debug!("Configured file type '{}' ({})", entry.name, format.strategy());
            formats.insert(entry.name.clone(), Arc::new(format));
        }

        debug!(
            "Loaded {} file type(s) and {} layout(s) from {}",
            formats.len(),
            library.names().len(),
            path.display()
        );

        Ok(Self {
            path: path.to_path_buf(),
            evaluator,
            formats,
            layouts: library.names().into_iter().map(str::to_string).collect(),
        })
    }

    /// Path of the configuration file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Evaluator shared by all formats of this configuration
    pub fn evaluator(&self) -> &Evaluator {
        &self.evaluator
    }

    /// File types, in declaration order
    pub fn formats(&self) -> impl Iterator<Item = &Arc<RecordFormat>> {
        self.formats.values()
    }

    /// File type `name`
    pub fn format(&self, name: &str) -> Option<&Arc<RecordFormat>> {
        self.formats.get(name)
    }

    /// Names of all loaded layouts, sorted
    pub fn layouts(&self) -> &[String] {
        &self.layouts
    }

    /// Reader for the file type `name`
    pub fn reader(&self, name: &str) -> Option<RecordReader> {
        self.format(name)
            .map(|format| RecordReader::new(Arc::clone(format), self.evaluator.clone()))
    }
}

fn build_format(
    entry: &FileTypeEntry,
    library: &mut LayoutLibrary,
    path: &Path,
    key: &str,
) -> Result<RecordFormat> {
    let options: IndexMap<String, String> = entry
        .options
        .iter()
        .map(|(name, value)| (name.clone(), value.to_string()))
        .collect();

    let options_key = format!("{key}.options");
    let strategy = ReaderStrategy::from_options(&entry.reader, &options, path, &options_key)?;

    let layouts_key = format!("{options_key}.dump_layouts");
    let names = options.get("dump_layouts").map(|v| split_list(v)).unwrap_or_default();
    let mut dump_layouts = Vec::with_capacity(names.len());
    for name in names.iter().filter(|n| !n.is_empty()) {
        let layout = library.compile(name)?.ok_or_else(|| {
            Error::invalid_config(path, &layouts_key, format!("unknown dump layout '{name}'"))
        })?;
        dump_layouts.push(layout);
    }
    if dump_layouts.is_empty() && strategy.requires_layouts() {
        return Err(Error::invalid_config(
            path,
            layouts_key,
            format!("reader '{}' requires at least one dump layout", strategy.id()),
        ));
    }

    let columns = split_list(&entry.list_items)
        .into_iter()
        .filter(|c| !c.is_empty())
        .collect();
    let meta_items = entry
        .meta_items
        .iter()
        .map(|(name, expression)| (name.clone(), expression.clone()))
        .collect();

    Ok(RecordFormat::new(entry.name.clone(), strategy)
        .with_columns(columns)
        .with_dump_layouts(dump_layouts)
        .with_meta_items(meta_items))
}

/// Splits a comma-separated list.
///
/// Commas inside double quotes do not split; tokens are trimmed and a token
/// wrapped in double quotes loses them.
pub(crate) fn split_list(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quoted = false;

    for c in text.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                current.push(c);
            }
            ',' if !quoted => tokens.push(unquote(&std::mem::take(&mut current))),
            _ => current.push(c),
        }
    }
    tokens.push(unquote(&current));
    tokens
}

fn unquote(token: &str) -> String {
    let token = token.trim();
    match token.strip_prefix('"').and_then(|t| t.strip_suffix('"')) {
        Some(inner) => inner.to_string(),
        None => token.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn setup(config: &str) -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("layouts")).unwrap();
        fs::create_dir(dir.path().join("scripts")).unwrap();
        fs::write(
            dir.path().join("layouts/rec.toml"),
            "name = \"rec\"\nitem1 = \"hex:kind,1\"\nitem2 = \"string:label,UTF-8,3\"",
        )
        .unwrap();
        fs::write(dir.path().join("scripts/common.rhai"), "fn kind_name(k) { if k == \"01\" { \"one\" } else { \"other\" } }")
            .unwrap();
        let path = dir.path().join("types.toml");
        fs::write(&path, config).unwrap();
        (dir, path)
    }

    fn error_key(err: Error) -> String {
        match err {
            Error::InvalidConfig { key, .. } => key,
            other => panic!("unexpected error: {other}"),
        }
    }

    const VALID: &str = r#"
        scripts = ["scripts/common.rhai"]
        layout_dirs = ["layouts"]

        [evaluator]
        max_operations = 100000

        [[file_types]]
        name = "sample"
        reader = "fixed-bytes"
        list_items = '[No.], rec.kind, "a,b"'
        options = { record_size = 4, dump_layouts = "rec" }
        meta_items = { name = 'kind_name($("rec.kind"))', size = "rec.length()" }

        [[file_types]]
        name = "log"
        reader = "lines"
        options = { charset = "utf-8", record_pattern = '^(?<level>\w+): (?<message>.*)$' }
    "#;

    #[test]
    fn test_split_list() {
        assert_eq!(split_list("a, b ,c"), vec!["a", "b", "c"]);
        assert_eq!(split_list("\"a,b\", c"), vec!["a,b", "c"]);
        assert_eq!(split_list("f(\"x\", 1)"), vec!["f(\"x\"", "1)"]);
        assert_eq!(split_list("\"f(\"x\", 1)\""), vec!["f(\"x\", 1)"]);
        assert_eq!(split_list(""), vec![""]);
    }

    #[test]
    fn test_load_valid() {
        let (_dir, path) = setup(VALID);
        let config = Configuration::load(&path).unwrap();

        let names: Vec<&str> = config.formats().map(|f| f.name()).collect();
        assert_eq!(names, vec!["sample", "log"]);
        assert_eq!(config.layouts(), ["rec"]);

        let sample = config.format("sample").unwrap();
        assert_eq!(sample.columns(), ["[No.]", "rec.kind", "a,b"]);
        assert_eq!(sample.strategy().id(), "fixed-bytes");
        assert_eq!(sample.dump_layouts().len(), 1);
        assert_eq!(sample.meta_items().len(), 2);

        let log = config.format("log").unwrap();
        assert_eq!(log.strategy().meta_group_names(), vec!["level", "message"]);
        assert!(config.reader("log").is_some());
        assert!(config.reader("missing").is_none());

        assert_eq!(config.evaluator().eval(None, "kind_name(\"01\")", &[]).unwrap(), "one");
    }

    #[test]
    fn test_syntax_error() {
        let (_dir, path) = setup("file_types = [");
        let err = Configuration::load(&path).unwrap_err();
        assert!(matches!(err, Error::ConfigSyntax { .. }));
    }

    #[test]
    fn test_missing_record_size() {
        let (_dir, path) = setup(
            r#"
            layout_dirs = ["layouts"]
            [[file_types]]
            name = "sample"
            reader = "fixed-bytes"
            options = { dump_layouts = "rec" }
            "#,
        );
        let err = Configuration::load(&path).unwrap_err();
        assert_eq!(error_key(err), "file_types[0].options.record_size");
    }

    #[test]
    fn test_unknown_reader_and_layout() {
        let (_dir, path) = setup(
            r#"
            layout_dirs = ["layouts"]
            [[file_types]]
            name = "a"
            reader = "fixed-bytes"
            options = { record_size = 4, dump_layouts = "rec" }
            [[file_types]]
            name = "b"
            reader = "tape"
            "#,
        );
        assert_eq!(error_key(Configuration::load(&path).unwrap_err()), "file_types[1].reader");

        let (_dir, path) = setup(
            r#"
            layout_dirs = ["layouts"]
            [[file_types]]
            name = "a"
            reader = "fixed-bytes"
            options = { record_size = 4, dump_layouts = "rec, gone" }
            "#,
        );
        let err = Configuration::load(&path).unwrap_err();
        assert!(err.to_string().contains("gone"));
        assert_eq!(error_key(err), "file_types[0].options.dump_layouts");
    }

    #[test]
    fn test_duplicate_file_type() {
        let (_dir, path) = setup(
            r#"
            [[file_types]]
            name = "csv"
            reader = "csv-lines"
            options = { charset = "utf-8" }
            [[file_types]]
            name = "csv"
            reader = "csv-lines"
            options = { charset = "utf-8" }
            "#,
        );
        assert_eq!(error_key(Configuration::load(&path).unwrap_err()), "file_types[1].name");
    }

    #[test]
    fn test_missing_paths() {
        let (_dir, path) = setup("layout_dirs = [\"nowhere\"]");
        assert_eq!(error_key(Configuration::load(&path).unwrap_err()), "layout_dirs[0]");

        let (_dir, path) = setup("scripts = [\"missing.rhai\"]");
        assert_eq!(error_key(Configuration::load(&path).unwrap_err()), "scripts[0]");
    }

    #[test]
    fn test_missing_config_file() {
        let dir = TempDir::new().unwrap();
        let err = Configuration::load(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, Error::FileRead { .. }));
    }
}
