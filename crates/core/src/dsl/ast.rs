use std::fmt;

use crate::secret::SecretRef;

/// A parsed `.glue` program: top-level declarations in source order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Document {
    pub items: Vec<Decl>,
    /// Whether the program ends with `apply glue`.
    pub applied: bool,
}

impl Document {
    /// Top-level block by name.
    pub fn block(&self, name: &str) -> Option<&Block> {
        self.blocks().find(|b| b.name == name)
    }

    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.items.iter().filter_map(|item| match item {
            Decl::Block(block) => Some(block),
            _ => None,
        })
    }
}

/// `name { ... }` or a two-word header such as `glue app { ... }`.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub keyword: Option<String>,
    pub name: String,
    pub body: Vec<Decl>,
}

impl Block {
    pub fn new(name: impl Into<String>, body: Vec<Decl>) -> Self {
        Self {
            keyword: None,
            name: name.into(),
            body,
        }
    }

    /// Bare words in declaration order (provider keywords).
    pub fn words(&self) -> impl Iterator<Item = &str> {
        self.body.iter().filter_map(|d| match d {
            Decl::Word(w) => Some(w.as_str()),
            _ => None,
        })
    }

    /// Value of the first assignment to `key`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.body.iter().find_map(|d| match d {
            Decl::Assign { key: k, value } if k == key => Some(value),
            _ => None,
        })
    }

    /// Nested block by name.
    pub fn block(&self, name: &str) -> Option<&Block> {
        self.body.iter().find_map(|d| match d {
            Decl::Block(b) if b.name == name => Some(b),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decl {
    /// `key = value`
    Assign { key: String, value: Value },
    /// `key: value`
    Entry { key: String, value: Value },
    Block(Block),
    /// A lone identifier, usually a provider keyword.
    Word(String),
    /// A lone `os.<name>` reference.
    Secret(SecretRef),
    /// `a >> b >> c`
    Chain(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Number(f64),
    Bool(bool),
    Ident(String),
    Secret(SecretRef),
    List(Vec<Value>),
    /// `{ ... }` inline object
    Object(Vec<Decl>),
    Chain(Vec<String>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) | Value::Ident(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Scalars become one-element lists.
    pub fn as_names(&self) -> Vec<String> {
        match self {
            Value::List(items) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            other => other.as_str().map(|s| vec![s.to_string()]).unwrap_or_default(),
        }
    }
}

// Rendering back to source text. Output re-parses to an equal document.

const INDENT: &str = "    ";

fn write_indent(f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
    for _ in 0..depth {
        f.write_str(INDENT)?;
    }
    Ok(())
}

fn write_string(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    f.write_str("\"")?;
    for c in s.chars() {
        match c {
            '"' => f.write_str("\\\"")?,
            '\\' => f.write_str("\\\\")?,
            '\t' => f.write_str("\\t")?,
            '\r' => f.write_str("\\r")?,
            c => write!(f, "{c}")?,
        }
    }
    f.write_str("\"")
}

fn write_value(f: &mut fmt::Formatter<'_>, value: &Value, depth: usize) -> fmt::Result {
    match value {
        Value::Str(s) => write_string(f, s),
        Value::Number(n) => write!(f, "{n}"),
        Value::Bool(b) => write!(f, "{b}"),
        Value::Ident(i) => f.write_str(i),
        Value::Secret(r) => write!(f, "{r}"),
        Value::Chain(names) => f.write_str(&names.join(" >> ")),
        Value::List(items) => {
            f.write_str("[")?;
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write_value(f, item, depth)?;
            }
            f.write_str("]")
        }
        Value::Object(decls) => {
            if decls.is_empty() {
                return f.write_str("{}");
            }
            f.write_str("{ ")?;
            for (i, decl) in decls.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write_inline_decl(f, decl, depth)?;
            }
            f.write_str(" }")
        }
    }
}

fn write_inline_decl(f: &mut fmt::Formatter<'_>, decl: &Decl, depth: usize) -> fmt::Result {
    match decl {
        Decl::Assign { key, value } => {
            write!(f, "{key} = ")?;
            write_value(f, value, depth)
        }
        Decl::Entry { key, value } => {
            write!(f, "{key}: ")?;
            write_value(f, value, depth)
        }
        Decl::Word(w) => f.write_str(w),
        Decl::Secret(r) => write!(f, "{r}"),
        Decl::Chain(names) => f.write_str(&names.join(" >> ")),
        Decl::Block(block) => write_block(f, block, depth),
    }
}

fn write_block(f: &mut fmt::Formatter<'_>, block: &Block, depth: usize) -> fmt::Result {
    if let Some(keyword) = &block.keyword {
        write!(f, "{keyword} ")?;
    }
    writeln!(f, "{} {{", block.name)?;
    for decl in &block.body {
        write_indent(f, depth + 1)?;
        write_inline_decl(f, decl, depth + 1)?;
        writeln!(f)?;
    }
    write_indent(f, depth)?;
    f.write_str("}")
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_block(f, self, 0)
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for item in &self.items {
            write_inline_decl(f, item, 0)?;
            f.write_str("\n\n")?;
        }
        if self.applied {
            f.write_str("apply glue\n")?;
        }
        Ok(())
    }
}
