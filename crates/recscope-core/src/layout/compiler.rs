//! Layout compiler.
//!
//! Turns layout sources into [`GroupNode`] graphs. A layout source is a TOML
//! file holding a `name`, an optional `condition` and ordered `item<N>`
//! declarations:
//!
//! ```toml
//! name = "header"
//! condition = '$("[format]") == "sample"'
//! item1 = "hex:kind,1"
//! item2 = "if $(\"header.kind\") == \"01\""
//! item3 = "string:label,UTF-8,8"
//! item4 = "else"
//! item5 = "group:trailer"
//! item6 = "endif"
//! ```
//!
//! Declarations are `group`, `string`, `hex`, `meta` and `hidden` items, plus
//! the `if`/`elsif`/`else`/`endif` control tokens. Conditional blocks compile
//! into anonymous groups tagged with their [`Branch`].
//!
//! Named layouts referenced through `group:` are compiled once and cached in a
//! [`LayoutLibrary`]; reference cycles are reported as configuration errors.

use super::{Branch, FieldKind, FieldNode, GroupNode, ItemNode, LengthSpec, ValueNode};
use crate::codec::can_encode;
use crate::config::split_list;
use crate::error::{Error, Result};
use encoding_rs::Encoding;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace, warn};
use walkdir::WalkDir;

/// File extension of layout sources
const LAYOUT_EXTENSION: &str = "toml";

/// A parsed, not yet compiled, layout file
#[derive(Debug, Clone)]
pub struct LayoutSource {
    origin: PathBuf,
    name: String,
    condition: Option<String>,
    declarations: Vec<(String, String)>,
}

impl LayoutSource {
    /// Parses a layout source; `origin` is used in error messages
    pub fn parse(origin: impl Into<PathBuf>, text: &str) -> Result<Self> {
        let origin = origin.into();
        let table: toml::Table =
            toml::from_str(text).map_err(|e| Error::config_syntax(&origin, e))?;

        let mut name = String::new();
        let mut condition = None;
        let mut numbered = Vec::new();

        for (key, value) in table {
            let Some(text) = value.as_str() else {
                return Err(Error::invalid_config(&origin, key, "value must be a string"));
            };
            if key == "name" {
                name = text.to_string();
            } else if key == "condition" {
                condition = Some(text.to_string());
            } else if let Some(number) = item_number(&key) {
                numbered.push((number, key.clone(), text.to_string()));
            } else {
                warn!("Ignoring unknown key '{}' in {}", key, origin.display());
            }
        }

        // item2 before item10
        numbered.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

        Ok(Self {
            origin,
            name,
            condition,
            declarations: numbered
                .into_iter()
                .map(|(_, key, text)| (key, text))
                .collect(),
        })
    }

    /// Reads and parses a layout file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| Error::file_read(path, e))?;
        Self::parse(path, &text)
    }

    /// File the source was read from
    pub fn origin(&self) -> &Path {
        &self.origin
    }

    /// Group name of the compiled root
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Condition of the compiled root
    pub fn condition(&self) -> Option<&str> {
        self.condition.as_deref()
    }

    /// Ordered `(key, declaration)` pairs
    pub fn declarations(&self) -> &[(String, String)] {
        &self.declarations
    }
}

/// Extracts N from an `item<N>` key
fn item_number(key: &str) -> Option<u64> {
    let digits = key.strip_prefix("item")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Registry of named layouts, compiled on first use
#[derive(Debug, Default)]
pub struct LayoutLibrary {
    sources: HashMap<String, LayoutSource>,
    compiled: HashMap<String, Arc<GroupNode>>,
    in_progress: Vec<String>,
}

impl LayoutLibrary {
    /// Creates an empty library
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a source under `name`; the first registration of a name wins
    pub fn insert(&mut self, name: impl Into<String>, source: LayoutSource) -> bool {
        let name = name.into();
        if self.sources.contains_key(&name) {
            trace!("Layout '{}' already registered, keeping the first", name);
            return false;
        }
        self.sources.insert(name, source);
        true
    }

    /// Registers every `*.toml` file under `dir`, keyed by file stem
    pub fn load_dir(&mut self, dir: impl AsRef<Path>) -> Result<usize> {
        let dir = dir.as_ref();
        let mut loaded = 0;

        for entry in WalkDir::new(dir).follow_links(false).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(dir).to_path_buf();
                Error::file_read(path, std::io::Error::other(e.to_string()))
            })?;
            let path = entry.path();
            if !entry.file_type().is_file()
                || path.extension().and_then(|e| e.to_str()) != Some(LAYOUT_EXTENSION)
            {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if self.insert(stem, LayoutSource::load(path)?) {
                loaded += 1;
            }
        }

        debug!("Loaded {} layout(s) from {}", loaded, dir.display());
        Ok(loaded)
    }

    /// Returns true if a source is registered under `name`
    pub fn contains(&self, name: &str) -> bool {
        self.sources.contains_key(name)
    }

    /// Names of all registered layouts, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.sources.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Compiles (or fetches the cached graph of) the layout `name`.
    ///
    /// Returns `Ok(None)` if no such layout is registered.
    pub fn compile(&mut self, name: &str) -> Result<Option<Arc<GroupNode>>> {
        if let Some(graph) = self.compiled.get(name) {
            return Ok(Some(Arc::clone(graph)));
        }
        let Some(source) = self.sources.get(name).cloned() else {
            return Ok(None);
        };

        self.in_progress.push(name.to_string());
        let result = self.compile_source(&source);
        self.in_progress.pop();

        let graph = Arc::new(result?);
        debug!(
            "Compiled layout '{}' ({} top-level nodes)",
            name,
            graph.children().len()
        );
        self.compiled.insert(name.to_string(), Arc::clone(&graph));
        Ok(Some(graph))
    }

    /// Compiles every registered layout
    pub fn compile_all(&mut self) -> Result<()> {
        let names: Vec<String> = self.names().into_iter().map(str::to_string).collect();
        for name in names {
            self.compile(&name)?;
        }
        Ok(())
    }

    /// Resolves a `group:` reference from `source`
    fn resolve(&mut self, name: &str, source: &LayoutSource, key: &str) -> Result<Arc<GroupNode>> {
        if self.in_progress.iter().any(|n| n == name) {
            let chain = self.in_progress.join(" -> ");
            return Err(Error::invalid_config(
                source.origin(),
                key,
                format!("cyclic group reference: {chain} -> {name}"),
            ));
        }
        self.compile(name)?.ok_or_else(|| {
            Error::invalid_config(source.origin(), key, format!("layout '{name}' not found"))
        })
    }

    fn compile_source(&mut self, source: &LayoutSource) -> Result<GroupNode> {
        let mut root = Frame::new(
            "name",
            source.name(),
            source.condition().map(str::to_string),
            Branch::None,
        );
        let mut open: Vec<Frame> = Vec::new();

        for (key, text) in source.declarations() {
            let text = text.trim();

            if let Some(condition) = control(text, "if") {
                open.push(Frame::new(key, "", Some(condition.to_string()), Branch::If));
            } else if let Some(condition) = control(text, "elsif") {
                close_branch(&mut root, &mut open, source, key, "elsif")?;
                open.push(Frame::new(key, "", Some(condition.to_string()), Branch::Elsif));
            } else if control(text, "else").is_some() {
                close_branch(&mut root, &mut open, source, key, "else")?;
                open.push(Frame::new(key, "", None, Branch::Else));
            } else if control(text, "endif").is_some() {
                close_branch(&mut root, &mut open, source, key, "endif")?;
            } else {
                let nodes = self.declaration(source, key, text)?;
                top(&mut root, &mut open).children.extend(nodes);
            }
        }

        if let Some(unclosed) = open.last() {
            return Err(Error::invalid_config(
                source.origin(),
                &unclosed.key,
                "if/elsif without a matching endif",
            ));
        }
        Ok(root.finish())
    }

    fn declaration(&mut self, source: &LayoutSource, key: &str, text: &str) -> Result<Vec<ItemNode>> {
        let invalid = |message: String| Error::invalid_config(source.origin(), key, message);

        let Some(split) = text.find([':', ',']) else {
            return Err(invalid(format!(
                "malformed declaration '{text}', expected '<kind>:<arguments>'"
            )));
        };
        let kind = text[..split].trim();
        let args = split_list(&text[split + 1..]);
        let arity = |min: usize, max: usize, usage: &str| {
            if args.len() < min || args.len() > max {
                Err(invalid(format!(
                    "{kind} takes {usage}, got {} argument(s)",
                    args.len()
                )))
            } else {
                Ok(())
            }
        };

        match kind {
            "group" => {
                let mut nodes = Vec::with_capacity(args.len());
                for name in args.iter().filter(|n| !n.is_empty()) {
                    nodes.push(ItemNode::Group(self.resolve(name, source, key)?));
                }
                if nodes.is_empty() {
                    return Err(invalid("group takes at least one layout name".into()));
                }
                Ok(nodes)
            }
            "string" => {
                arity(3, 4, "name, charset, length[, value expression]")?;
                let encoding = Encoding::for_label(args[1].as_bytes())
                    .ok_or_else(|| invalid(format!("unknown charset '{}'", args[1])))?;
                if !can_encode(encoding) {
                    return Err(invalid(format!("charset '{}' cannot encode text", args[1])));
                }
                let length = parse_length(&args[2]).ok_or_else(|| {
                    invalid(format!("invalid length '{}'", args[2]))
                })?;
                Ok(vec![ItemNode::Field(Arc::new(FieldNode::new(
                    &args[0],
                    FieldKind::String(encoding),
                    length,
                    args.get(3).cloned(),
                )))])
            }
            "hex" => {
                arity(2, 3, "name, length[, value expression]")?;
                let length = parse_length(&args[1]).ok_or_else(|| {
                    invalid(format!("invalid length '{}'", args[1]))
                })?;
                Ok(vec![ItemNode::Field(Arc::new(FieldNode::new(
                    &args[0],
                    FieldKind::Hex,
                    length,
                    args.get(2).cloned(),
                )))])
            }
            "meta" => {
                arity(2, 2, "name, value expression")?;
                Ok(vec![ItemNode::Meta(ValueNode::new(&args[0], &args[1]))])
            }
            "hidden" => {
                arity(2, 2, "name, value expression")?;
                Ok(vec![ItemNode::Hidden(ValueNode::new(&args[0], &args[1]))])
            }
            _ => Err(invalid(format!(
                "unknown item kind '{kind}', expected one of group, string, hex, meta, hidden"
            ))),
        }
    }
}

fn parse_length(text: &str) -> Option<LengthSpec> {
    if text.trim().is_empty() {
        return None;
    }
    LengthSpec::parse(text)
}

/// An open group during compilation
struct Frame {
    key: String,
    name: String,
    condition: Option<String>,
    branch: Branch,
    children: Vec<ItemNode>,
}

impl Frame {
    fn new(key: &str, name: &str, condition: Option<String>, branch: Branch) -> Self {
        Self {
            key: key.to_string(),
            name: name.to_string(),
            condition,
            branch,
            children: Vec::new(),
        }
    }

    fn finish(self) -> GroupNode {
        GroupNode::new(self.name, self.children, self.condition, self.branch)
    }
}

fn top<'a>(root: &'a mut Frame, open: &'a mut [Frame]) -> &'a mut Frame {
    match open.last_mut() {
        Some(frame) => frame,
        None => root,
    }
}

/// Pops the innermost conditional frame and attaches it to its parent
fn close_branch(
    root: &mut Frame,
    open: &mut Vec<Frame>,
    source: &LayoutSource,
    key: &str,
    token: &str,
) -> Result<()> {
    let Some(frame) = open.pop() else {
        return Err(Error::invalid_config(
            source.origin(),
            key,
            format!("{token} without a matching if"),
        ));
    };
    top(root, open)
        .children
        .push(ItemNode::Group(Arc::new(frame.finish())));
    Ok(())
}

/// Matches a control keyword at a word boundary, returning the rest of the line
fn control<'a>(text: &'a str, keyword: &str) -> Option<&'a str> {
    let rest = text.strip_prefix(keyword)?;
    match rest.chars().next() {
        Some(c) if c.is_alphanumeric() || c == '_' => None,
        _ => Some(rest.trim()),
    }
}
