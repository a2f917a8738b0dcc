//! Block model shared by the parser, renderer, mapper and resolver.

use blockbridge_types::{BlockId, VarType};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Kind of a block, with the structural attributes that kind carries.
///
/// The kind of an existing block never changes in place; a retyped block is a
/// delete followed by a create.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockKind {
    Heading { level: u8 },
    Paragraph,
    List { ordered: bool },
    Quote,
    Divider,
    Code { language: Option<String> },
    State,
    Set,
    Form,
    IfElse,
    Nav,
    Panel,
    Map,
    /// Remote block with no local equivalent, kept verbatim
    Unmapped { remote_type: String },
}

impl BlockKind {
    pub fn tag(&self) -> &'static str {
        match self {
            BlockKind::Heading { .. } => "heading",
            BlockKind::Paragraph => "paragraph",
            BlockKind::List { .. } => "list",
            BlockKind::Quote => "quote",
            BlockKind::Divider => "divider",
            BlockKind::Code { .. } => "code",
            BlockKind::State => "state",
            BlockKind::Set => "set",
            BlockKind::Form => "form",
            BlockKind::IfElse => "if_else",
            BlockKind::Nav => "nav",
            BlockKind::Panel => "panel",
            BlockKind::Map => "map",
            BlockKind::Unmapped { .. } => "unmapped",
        }
    }

    pub fn is_runtime(&self) -> bool {
        self.fence_tag().is_some()
    }

    /// Fenced code language that introduces this kind in markdown.
    pub fn fence_tag(&self) -> Option<&'static str> {
        match self {
            BlockKind::State => Some("state"),
            BlockKind::Set => Some("set"),
            BlockKind::Form => Some("form"),
            BlockKind::IfElse => Some("if"),
            BlockKind::Nav => Some("nav"),
            BlockKind::Panel => Some("panel"),
            BlockKind::Map => Some("map"),
            _ => None,
        }
    }

    pub fn from_fence_tag(tag: &str) -> Option<Self> {
        match tag {
            "state" => Some(BlockKind::State),
            "set" => Some(BlockKind::Set),
            "form" => Some(BlockKind::Form),
            "if" => Some(BlockKind::IfElse),
            "nav" => Some(BlockKind::Nav),
            "panel" => Some(BlockKind::Panel),
            "map" => Some(BlockKind::Map),
            _ => None,
        }
    }

    /// Caption tag used when this kind travels as a remote code block.
    pub fn caption_tag(&self) -> Option<&'static str> {
        match self {
            BlockKind::State => Some("STATE"),
            BlockKind::Set => Some("SET"),
            BlockKind::Form => Some("FORM"),
            BlockKind::Panel => Some("PANEL"),
            BlockKind::Map => Some("MAP"),
            _ => None,
        }
    }

    pub fn from_caption_tag(tag: &str) -> Option<Self> {
        match tag.to_ascii_uppercase().as_str() {
            "STATE" => Some(BlockKind::State),
            "SET" => Some(BlockKind::Set),
            "FORM" => Some(BlockKind::Form),
            "PANEL" => Some(BlockKind::Panel),
            "MAP" => Some(BlockKind::Map),
            _ => None,
        }
    }
}

/// One run of inline text sharing the same formatting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RichText {
    pub text: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub bold: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub italic: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub strikethrough: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub code: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl RichText {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn same_style(&self, other: &RichText) -> bool {
        self.bold == other.bold
            && self.italic == other.italic
            && self.strikethrough == other.strikethrough
            && self.code == other.code
            && self.link == other.link
    }
}

/// Drop empty spans and merge neighbours that share a style.
///
/// Every producer of spans runs its output through here so that two
/// renderings of the same text compare equal.
pub fn normalize_spans(spans: Vec<RichText>) -> Vec<RichText> {
    let mut out: Vec<RichText> = Vec::with_capacity(spans.len());
    for span in spans {
        if span.text.is_empty() {
            continue;
        }
        match out.last_mut() {
            Some(last) if last.same_style(&span) => last.text.push_str(&span.text),
            _ => out.push(span),
        }
    }
    out
}

/// Payload of a block: spans for prose kinds, raw text for code and runtime kinds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "format", content = "value", rename_all = "snake_case")]
pub enum BlockContent {
    Rich(Vec<RichText>),
    Raw(String),
    Empty,
}

impl BlockContent {
    pub fn rich(spans: Vec<RichText>) -> Self {
        BlockContent::Rich(normalize_spans(spans))
    }

    pub fn plain_text(&self) -> String {
        match self {
            BlockContent::Rich(spans) => spans.iter().map(|s| s.text.as_str()).collect(),
            BlockContent::Raw(raw) => raw.clone(),
            BlockContent::Empty => String::new(),
        }
    }
}

/// A declared runtime variable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDecl {
    pub name: String,
    #[serde(rename = "type")]
    pub var_type: VarType,
    pub initial_value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignOp {
    Assign,
    Add,
    Sub,
    Mul,
    Div,
}

impl AssignOp {
    pub fn from_symbol(s: &str) -> Option<Self> {
        match s {
            "=" => Some(AssignOp::Assign),
            "+=" => Some(AssignOp::Add),
            "-=" => Some(AssignOp::Sub),
            "*=" => Some(AssignOp::Mul),
            "/=" => Some(AssignOp::Div),
            _ => None,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            AssignOp::Assign => "=",
            AssignOp::Add => "+=",
            AssignOp::Sub => "-=",
            AssignOp::Mul => "*=",
            AssignOp::Div => "/=",
        }
    }
}

/// One `$name <op> <expr>` line of a `set` block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub name: String,
    pub op: AssignOp,
    pub expr: String,
    #[serde(rename = "type")]
    pub var_type: VarType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormField {
    pub var: String,
    pub field_type: String,
    #[serde(rename = "type")]
    pub var_type: VarType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NavChoice {
    pub label: String,
    pub target: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// Structured payload extracted from a runtime block, one variant per kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuntimeMetadata {
    State {
        variables: Vec<VariableDecl>,
    },
    Set {
        assignments: Vec<Assignment>,
    },
    Form {
        fields: Vec<FormField>,
    },
    IfElse {
        condition: String,
        /// Index into `children` where the else branch starts
        else_index: Option<usize>,
    },
    Nav {
        choices: Vec<NavChoice>,
    },
    Panel {
        width: usize,
        height: usize,
    },
    Map {
        viewport: Option<Viewport>,
        provider: Option<String>,
        sprites: Option<String>,
        #[serde(default)]
        extra: BTreeMap<String, String>,
    },
}

impl RuntimeMetadata {
    /// Variables this block declares, as `(name, type, initial value)`.
    ///
    /// `set` blocks declare nothing; they only assign.
    pub fn declared_variables(&self) -> Vec<VariableDecl> {
        match self {
            RuntimeMetadata::State { variables } => variables.clone(),
            RuntimeMetadata::Form { fields } => fields
                .iter()
                .map(|f| VariableDecl {
                    name: f.var.clone(),
                    var_type: f.var_type,
                    initial_value: Value::Null,
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// One typed node of a parsed document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub id: BlockId,
    pub kind: BlockKind,
    pub content: BlockContent,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Block>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_metadata: Option<RuntimeMetadata>,
}

impl Block {
    /// Build a block without an id; ids are assigned once the whole document is known.
    pub fn new(kind: BlockKind, content: BlockContent) -> Self {
        Self {
            id: BlockId::new(""),
            kind,
            content,
            children: Vec::new(),
            runtime_metadata: None,
        }
    }

    pub fn with_children(mut self, children: Vec<Block>) -> Self {
        self.children = children;
        self
    }

    pub fn with_metadata(mut self, metadata: RuntimeMetadata) -> Self {
        self.runtime_metadata = Some(metadata);
        self
    }

    /// Same kind, content, metadata and children, ignoring ids.
    pub fn semantically_eq(&self, other: &Block) -> bool {
        self.kind == other.kind
            && self.content == other.content
            && self.runtime_metadata == other.runtime_metadata
            && self.children.len() == other.children.len()
            && self
                .children
                .iter()
                .zip(&other.children)
                .all(|(a, b)| a.semantically_eq(b))
    }

    /// Id-free JSON form used for hashing and snapshots.
    pub fn canonical(&self) -> Value {
        serde_json::json!({
            "kind": self.kind,
            "content": self.content,
            "metadata": self.runtime_metadata,
            "children": self.children.iter().map(Block::canonical).collect::<Vec<_>>(),
        })
    }

    /// Depth-first walk over this block and its descendants.
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a Block)) {
        visit(self);
        for child in &self.children {
            child.walk(visit);
        }
    }
}

/// Frontmatter plus blocks: everything a markdown document holds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    pub frontmatter: Option<crate::frontmatter::DocFrontmatter>,
    pub blocks: Vec<Block>,
}
