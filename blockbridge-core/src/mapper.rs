//! Block <-> remote block payload mapping.
//!
//! Remote payloads follow the Notion block object shape. Kinds with no
//! native remote equivalent travel as `code` blocks whose caption carries a
//! `[TYPE:<KIND>]` tag, so `from_remote(to_remote(b))` gives back `b`.

use crate::frontmatter::{DocFrontmatter, FrontmatterError};
use crate::identity::assign_ids;
use crate::models::{Block, BlockContent, BlockKind, Document, RichText, RuntimeMetadata};
use crate::parser::runtime::metadata_for;
use crate::parser::ParseError;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::{json, Map, Value};
use std::sync::OnceLock;
use thiserror::Error;

/// Longest text a single remote rich-text item may hold
pub const RICH_TEXT_LIMIT: usize = 2000;

const NAV_ICON: &str = "🧭";
const MAP_NOTE: &str = "read-only, edit locally";
const FRONTMATTER_TAG: &str = "FRONTMATTER";
const PLAIN_TEXT_LANGUAGE: &str = "plain text";

/// Server-managed fields dropped from passthrough payloads.
const READ_ONLY_FIELDS: &[&str] = &[
    "id",
    "created_time",
    "last_edited_time",
    "created_by",
    "last_edited_by",
    "parent",
    "archived",
    "in_trash",
    "has_children",
    "request_id",
];

#[derive(Error, Debug)]
pub enum MapError {
    /// The caption names no known kind; `passthrough` keeps the payload intact.
    #[error("unknown caption tag `{tag}`")]
    UnknownCaption { tag: String, passthrough: Box<Block> },

    #[error("remote block is missing `{0}`")]
    MissingField(&'static str),

    #[error("malformed runtime block: {0}")]
    Malformed(#[from] ParseError),

    #[error("invalid passthrough payload: {0}")]
    Passthrough(#[from] serde_json::Error),

    #[error("invalid frontmatter block: {0}")]
    Frontmatter(#[from] FrontmatterError),
}

impl MapError {
    /// The passthrough block an unknown caption decodes to, if any.
    pub fn into_passthrough(self) -> Option<Block> {
        match self {
            MapError::UnknownCaption { passthrough, .. } => Some(*passthrough),
            _ => None,
        }
    }
}

static CAPTION_TAG: OnceLock<Regex> = OnceLock::new();

fn caption_tag_regex() -> &'static Regex {
    CAPTION_TAG.get_or_init(|| {
        Regex::new(r"^\s*\[(?:TYPE|uDOS):([A-Za-z_]+)\]").expect("valid regex")
    })
}

/// Caption text marking `kind` on the remote side.
pub fn caption_for(kind: &BlockKind) -> Option<String> {
    let tag = kind.caption_tag()?;
    Some(match kind {
        BlockKind::Map => format!("[TYPE:{}] {}", tag, MAP_NOTE),
        _ => format!("[TYPE:{}]", tag),
    })
}

/// Remote block id of a payload.
pub fn remote_id(payload: &Value) -> Option<&str> {
    payload.get("id")?.as_str()
}

/// `last_edited_time` of a payload.
pub fn remote_edited_at(payload: &Value) -> Option<DateTime<Utc>> {
    let raw = payload.get("last_edited_time")?.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

pub fn remote_has_children(payload: &Value) -> bool {
    payload
        .get("has_children")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Split `text` into pieces of at most [`RICH_TEXT_LIMIT`] characters.
fn chunk_text(text: &str) -> Vec<&str> {
    let mut chunks = Vec::new();
    let mut start = 0;
    let mut count = 0;
    for (i, _) in text.char_indices() {
        if count == RICH_TEXT_LIMIT {
            chunks.push(&text[start..i]);
            start = i;
            count = 0;
        }
        count += 1;
    }
    if start < text.len() {
        chunks.push(&text[start..]);
    }
    chunks
}

fn text_item(content: &str, span: &RichText) -> Value {
    json!({
        "type": "text",
        "text": {
            "content": content,
            "link": span.link.as_ref().map(|url| json!({ "url": url })),
        },
        "annotations": {
            "bold": span.bold,
            "italic": span.italic,
            "strikethrough": span.strikethrough,
            "underline": false,
            "code": span.code,
            "color": "default",
        },
        "plain_text": content,
        "href": span.link,
    })
}

fn rich_text(spans: &[RichText]) -> Value {
    Value::Array(
        spans
            .iter()
            .flat_map(|span| {
                chunk_text(&span.text)
                    .into_iter()
                    .map(move |chunk| text_item(chunk, span))
            })
            .collect(),
    )
}

fn plain_rich_text(text: &str) -> Value {
    rich_text(&[RichText::plain(text)])
}

fn spans_from(value: Option<&Value>) -> Vec<RichText> {
    let Some(items) = value.and_then(Value::as_array) else {
        return Vec::new();
    };
    let spans = items
        .iter()
        .map(|item| {
            let text = item
                .get("plain_text")
                .and_then(Value::as_str)
                .or_else(|| item.pointer("/text/content").and_then(Value::as_str))
                .unwrap_or_default();
            let flag = |name: &str| {
                item.pointer(&format!("/annotations/{}", name))
                    .and_then(Value::as_bool)
                    .unwrap_or(false)
            };
            let link = item
                .pointer("/text/link/url")
                .and_then(Value::as_str)
                .or_else(|| item.get("href").and_then(Value::as_str))
                .map(str::to_string);
            RichText {
                text: text.to_string(),
                bold: flag("bold"),
                italic: flag("italic"),
                strikethrough: flag("strikethrough"),
                code: flag("code"),
                link,
            }
        })
        .collect();
    crate::models::normalize_spans(spans)
}

fn plain_text_of(value: Option<&Value>) -> String {
    spans_from(value).into_iter().map(|s| s.text).collect()
}

fn typed(remote_type: &str, mut body: Value, children: Vec<Value>) -> Value {
    if !children.is_empty() {
        if let Value::Object(map) = &mut body {
            map.insert("children".to_string(), Value::Array(children));
        }
    }
    json!({
        "object": "block",
        "type": remote_type,
        remote_type: body,
    })
}

fn code_payload(raw: &str, language: &str, caption: Option<String>) -> Value {
    let caption = caption.map(|c| plain_rich_text(&c)).unwrap_or(json!([]));
    typed(
        "code",
        json!({
            "rich_text": plain_rich_text(raw),
            "language": language,
            "caption": caption,
        }),
        Vec::new(),
    )
}

fn toggle(label: &str, children: Vec<Value>) -> Value {
    typed(
        "toggle",
        json!({ "rich_text": plain_rich_text(label), "color": "default" }),
        children,
    )
}

fn children_to_remote(children: &[Block]) -> Result<Vec<Value>, MapError> {
    children.iter().map(to_remote).collect()
}

/// Build the remote payload for a block.
pub fn to_remote(block: &Block) -> Result<Value, MapError> {
    let spans = match &block.content {
        BlockContent::Rich(spans) => spans.as_slice(),
        _ => &[],
    };
    let raw = block.content.plain_text();

    let payload = match &block.kind {
        BlockKind::Heading { level } => typed(
            &format!("heading_{}", (*level).clamp(1, 3)),
            json!({ "rich_text": rich_text(spans), "is_toggleable": false, "color": "default" }),
            Vec::new(),
        ),
        BlockKind::Paragraph => typed(
            "paragraph",
            json!({ "rich_text": rich_text(spans), "color": "default" }),
            children_to_remote(&block.children)?,
        ),
        BlockKind::Quote => typed(
            "quote",
            json!({ "rich_text": rich_text(spans), "color": "default" }),
            children_to_remote(&block.children)?,
        ),
        BlockKind::List { ordered } => typed(
            if *ordered {
                "numbered_list_item"
            } else {
                "bulleted_list_item"
            },
            json!({ "rich_text": rich_text(spans), "color": "default" }),
            children_to_remote(&block.children)?,
        ),
        BlockKind::Divider => typed("divider", json!({}), Vec::new()),
        BlockKind::Code { language } => code_payload(
            &raw,
            language.as_deref().unwrap_or(PLAIN_TEXT_LANGUAGE),
            None,
        ),
        BlockKind::State
        | BlockKind::Set
        | BlockKind::Form
        | BlockKind::Panel
        | BlockKind::Map => code_payload(&raw, PLAIN_TEXT_LANGUAGE, caption_for(&block.kind)),
        BlockKind::IfElse => if_to_remote(block)?,
        BlockKind::Nav => typed(
            "callout",
            json!({
                "rich_text": plain_rich_text(&raw),
                "icon": { "type": "emoji", "emoji": NAV_ICON },
                "color": "gray_background",
            }),
            Vec::new(),
        ),
        BlockKind::Unmapped { .. } => serde_json::from_str(&raw)?,
    };
    Ok(payload)
}

fn if_to_remote(block: &Block) -> Result<Value, MapError> {
    let (condition, else_index) = match &block.runtime_metadata {
        Some(RuntimeMetadata::IfElse {
            condition,
            else_index,
        }) => (condition.clone(), *else_index),
        _ => (block.content.plain_text(), None),
    };
    let split = else_index
        .unwrap_or(block.children.len())
        .min(block.children.len());
    let (then_branch, else_branch) = block.children.split_at(split);

    let mut branches = vec![toggle("then", children_to_remote(then_branch)?)];
    if else_index.is_some() {
        branches.push(toggle("else", children_to_remote(else_branch)?));
    }
    Ok(typed(
        "heading_2",
        json!({
            "rich_text": plain_rich_text(&format!("if {}", condition)),
            "is_toggleable": true,
            "color": "default",
        }),
        branches,
    ))
}

/// Decode a remote payload into a block with content-derived ids.
///
/// A code block whose caption tag names no known kind fails with
/// [`MapError::UnknownCaption`]; the error carries an `unmapped` block
/// holding the payload so the caller can keep it.
pub fn from_remote(payload: &Value) -> Result<Block, MapError> {
    let mut block = decode(payload)?;
    assign_ids(std::slice::from_mut(&mut block));
    Ok(block)
}

fn remote_children(payload: &Value, body: &Value) -> Vec<Value> {
    body.get("children")
        .or_else(|| payload.get("children"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn decode_children(children: &[Value]) -> Result<Vec<Block>, MapError> {
    let mut blocks = Vec::with_capacity(children.len());
    for child in children {
        match decode(child) {
            Ok(block) => blocks.push(block),
            Err(MapError::UnknownCaption { passthrough, .. }) => blocks.push(*passthrough),
            Err(err) => return Err(err),
        }
    }
    Ok(blocks)
}

fn decode(payload: &Value) -> Result<Block, MapError> {
    let remote_type = payload
        .get("type")
        .and_then(Value::as_str)
        .ok_or(MapError::MissingField("type"))?;
    let body = payload.get(remote_type).cloned().unwrap_or(Value::Null);
    let rich = || BlockContent::rich(spans_from(body.get("rich_text")));

    let block = match remote_type {
        "heading_1" | "heading_2" | "heading_3" => {
            if body.get("is_toggleable").and_then(Value::as_bool) == Some(true) {
                decode_if(payload, &body)?
            } else {
                let level = remote_type[remote_type.len() - 1..].parse().unwrap_or(1);
                Block::new(BlockKind::Heading { level }, rich())
            }
        }
        "paragraph" => Block::new(BlockKind::Paragraph, rich())
            .with_children(decode_children(&remote_children(payload, &body))?),
        "quote" => Block::new(BlockKind::Quote, rich())
            .with_children(decode_children(&remote_children(payload, &body))?),
        "bulleted_list_item" | "numbered_list_item" => Block::new(
            BlockKind::List {
                ordered: remote_type == "numbered_list_item",
            },
            rich(),
        )
        .with_children(decode_children(&remote_children(payload, &body))?),
        "divider" => Block::new(BlockKind::Divider, BlockContent::Empty),
        "code" => decode_code(payload, &body)?,
        "callout" if body.pointer("/icon/emoji").and_then(Value::as_str) == Some(NAV_ICON) => {
            let raw = plain_text_of(body.get("rich_text"));
            let metadata = metadata_for(&BlockKind::Nav, &raw)?;
            Block::new(BlockKind::Nav, BlockContent::Raw(raw)).with_metadata(metadata)
        }
        _ => passthrough(payload)?,
    };
    Ok(block)
}

fn decode_code(payload: &Value, body: &Value) -> Result<Block, MapError> {
    let raw = plain_text_of(body.get("rich_text"));
    let caption = plain_text_of(body.get("caption"));

    let Some(caps) = caption_tag_regex().captures(&caption) else {
        let language = body
            .get("language")
            .and_then(Value::as_str)
            .filter(|l| *l != PLAIN_TEXT_LANGUAGE && !l.is_empty())
            .map(str::to_string);
        return Ok(Block::new(BlockKind::Code { language }, BlockContent::Raw(raw)));
    };

    let tag = caps[1].to_string();
    if tag.eq_ignore_ascii_case(FRONTMATTER_TAG) {
        // Only meaningful at document level; decoded alone it is plain YAML
        return Ok(Block::new(
            BlockKind::Code {
                language: Some("yaml".to_string()),
            },
            BlockContent::Raw(raw),
        ));
    }

    match BlockKind::from_caption_tag(&tag) {
        Some(kind) => {
            let metadata = metadata_for(&kind, &raw)?;
            Ok(Block::new(kind, BlockContent::Raw(raw)).with_metadata(metadata))
        }
        None => Err(MapError::UnknownCaption {
            tag,
            passthrough: Box::new(passthrough(payload)?),
        }),
    }
}

fn is_toggle_labelled(value: &Value, label: &str) -> bool {
    value.get("type").and_then(Value::as_str) == Some("toggle")
        && plain_text_of(value.pointer("/toggle/rich_text"))
            .trim()
            .eq_ignore_ascii_case(label)
}

fn decode_if(payload: &Value, body: &Value) -> Result<Block, MapError> {
    let text = plain_text_of(body.get("rich_text"));
    let text = text.trim();
    let condition = text.strip_prefix("if ").unwrap_or(text).trim().to_string();
    if condition.is_empty() {
        return Err(ParseError::malformed("if", 1, "missing condition").into());
    }

    let children = remote_children(payload, body);
    let branch = |value: &Value| remote_children(value, value.get("toggle").unwrap_or(&Value::Null));

    let (blocks, else_index) = match children.as_slice() {
        [then] if is_toggle_labelled(then, "then") => (decode_children(&branch(then))?, None),
        [then, otherwise] if is_toggle_labelled(then, "then") && is_toggle_labelled(otherwise, "else") => {
            let mut blocks = decode_children(&branch(then))?;
            let split = blocks.len();
            blocks.extend(decode_children(&branch(otherwise))?);
            (blocks, Some(split))
        }
        _ => (decode_children(&children)?, None),
    };
    Ok(Block::new(BlockKind::IfElse, BlockContent::Raw(condition.clone()))
        .with_children(blocks)
        .with_metadata(RuntimeMetadata::IfElse {
            condition,
            else_index,
        }))
}

/// Keep an unsupported payload verbatim, minus server-managed fields.
fn passthrough(payload: &Value) -> Result<Block, MapError> {
    let remote_type = payload
        .get("type")
        .and_then(Value::as_str)
        .ok_or(MapError::MissingField("type"))?
        .to_string();
    let mut stripped = payload.as_object().cloned().unwrap_or_else(Map::new);
    for field in READ_ONLY_FIELDS {
        stripped.remove(*field);
    }
    Ok(Block::new(
        BlockKind::Unmapped { remote_type },
        BlockContent::Raw(Value::Object(stripped).to_string()),
    ))
}

/// The code block carrying a page's frontmatter.
pub fn frontmatter_to_remote(fm: &DocFrontmatter) -> Result<Value, MapError> {
    Ok(code_payload(
        fm.to_yaml()?.trim_end(),
        "yaml",
        Some(format!("[TYPE:{}]", FRONTMATTER_TAG)),
    ))
}

/// Whether `payload` is the code block carrying a page's frontmatter.
pub fn is_frontmatter_payload(payload: &Value) -> bool {
    if payload.get("type").and_then(Value::as_str) != Some("code") {
        return false;
    }
    let caption = plain_text_of(payload.pointer("/code/caption"));
    caption_tag_regex()
        .captures(&caption)
        .is_some_and(|caps| caps[1].eq_ignore_ascii_case(FRONTMATTER_TAG))
}

/// Frontmatter payload (if any) followed by one payload per block.
pub fn document_to_remote(doc: &Document) -> Result<Vec<Value>, MapError> {
    let mut payloads = Vec::with_capacity(doc.blocks.len() + 1);
    if let Some(fm) = doc.frontmatter.as_ref().filter(|fm| !fm.is_empty()) {
        payloads.push(frontmatter_to_remote(fm)?);
    }
    for block in &doc.blocks {
        payloads.push(to_remote(block)?);
    }
    Ok(payloads)
}

/// A decoded remote block with the remote facts sync needs.
#[derive(Debug, Clone)]
pub struct RemoteBlock {
    pub remote_id: Option<String>,
    pub edited_at: Option<DateTime<Utc>>,
    pub block: Block,
}

/// A remote page decoded into a document.
#[derive(Debug, Default)]
pub struct RemoteDocument {
    pub frontmatter: Option<DocFrontmatter>,
    pub frontmatter_remote_id: Option<String>,
    pub blocks: Vec<RemoteBlock>,
    /// Per-block problems; unknown captions still yield a passthrough block
    pub warnings: Vec<MapError>,
}

impl RemoteDocument {
    pub fn to_document(&self) -> Document {
        Document {
            frontmatter: self.frontmatter.clone(),
            blocks: self.blocks.iter().map(|b| b.block.clone()).collect(),
        }
    }
}

/// Decode a page's top-level payloads.
///
/// Failures stay local to their block: an unknown caption keeps the block
/// as passthrough, any other error drops it with a warning.
pub fn document_from_remote(payloads: &[Value]) -> RemoteDocument {
    let mut doc = RemoteDocument::default();
    let mut blocks = Vec::with_capacity(payloads.len());
    let mut meta = Vec::with_capacity(payloads.len());

    for payload in payloads {
        if doc.frontmatter.is_none() && is_frontmatter_payload(payload) {
            let yaml = plain_text_of(payload.pointer("/code/rich_text"));
            match DocFrontmatter::from_yaml(&yaml) {
                Ok(fm) => {
                    doc.frontmatter = Some(fm);
                    doc.frontmatter_remote_id = remote_id(payload).map(str::to_string);
                }
                Err(err) => doc.warnings.push(err.into()),
            }
            continue;
        }

        let decoded = match decode(payload) {
            Ok(block) => Some(block),
            Err(err) => {
                tracing::warn!(remote_id = ?remote_id(payload), error = %err, "remote block did not map cleanly");
                let passthrough = match &err {
                    MapError::UnknownCaption { passthrough, .. } => Some((**passthrough).clone()),
                    _ => None,
                };
                doc.warnings.push(err);
                passthrough
            }
        };
        if let Some(block) = decoded {
            blocks.push(block);
            meta.push((
                remote_id(payload).map(str::to_string),
                remote_edited_at(payload),
            ));
        }
    }

    assign_ids(&mut blocks);
    doc.blocks = blocks
        .into_iter()
        .zip(meta)
        .map(|(block, (remote_id, edited_at))| RemoteBlock {
            remote_id,
            edited_at,
            block,
        })
        .collect();
    doc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;
    use proptest::prelude::*;

    fn round_trip(block: &Block) -> Block {
        from_remote(&to_remote(block).unwrap()).unwrap()
    }

    #[test]
    fn test_state_block_maps_to_captioned_code() {
        let block = parse("```state\n$hp = 100\n```").unwrap().remove(0);
        let payload = to_remote(&block).unwrap();
        assert_eq!(payload["type"], "code");
        assert_eq!(payload["code"]["caption"][0]["plain_text"], "[TYPE:STATE]");
        assert_eq!(payload["code"]["rich_text"][0]["text"]["content"], "$hp = 100");
        assert!(round_trip(&block).semantically_eq(&block));
    }

    #[test]
    fn test_legacy_caption_prefix() {
        let payload = json!({
            "type": "code",
            "code": {
                "rich_text": [{ "plain_text": "$gold += 5" }],
                "caption": [{ "plain_text": "[uDOS:SET]" }],
                "language": "plain text"
            }
        });
        let block = from_remote(&payload).unwrap();
        assert_eq!(block.kind, BlockKind::Set);
    }

    #[test]
    fn test_unknown_caption_is_passthrough() {
        let payload = json!({
            "id": "abc",
            "type": "code",
            "code": {
                "rich_text": [{ "plain_text": "spin()" }],
                "caption": [{ "plain_text": "[TYPE:WIDGET]" }],
                "language": "plain text"
            }
        });
        let err = from_remote(&payload).unwrap_err();
        let MapError::UnknownCaption { tag, passthrough } = err else {
            panic!("expected unknown caption");
        };
        assert_eq!(tag, "WIDGET");
        assert_eq!(
            passthrough.kind,
            BlockKind::Unmapped {
                remote_type: "code".to_string()
            }
        );
        // Re-emitted verbatim, minus the server-assigned id
        let emitted = to_remote(&passthrough).unwrap();
        assert_eq!(emitted["code"], payload["code"]);
        assert!(emitted.get("id").is_none());
    }

    #[test]
    fn test_uncaptioned_code_stays_code() {
        let payload = json!({
            "type": "code",
            "code": { "rich_text": [{ "plain_text": "fn main() {}" }], "caption": [], "language": "rust" }
        });
        let block = from_remote(&payload).unwrap();
        assert_eq!(
            block.kind,
            BlockKind::Code {
                language: Some("rust".to_string())
            }
        );
    }

    #[test]
    fn test_if_else_maps_to_toggle_heading() {
        let block = parse("```if\n$gold >= 100\nRich.\nelse\nPoor.\n```")
            .unwrap()
            .remove(0);
        let payload = to_remote(&block).unwrap();
        assert_eq!(payload["type"], "heading_2");
        assert_eq!(payload["heading_2"]["is_toggleable"], true);
        assert_eq!(payload["heading_2"]["rich_text"][0]["plain_text"], "if $gold >= 100");
        let branches = payload["heading_2"]["children"].as_array().unwrap();
        assert_eq!(branches.len(), 2);
        assert_eq!(branches[1]["toggle"]["rich_text"][0]["plain_text"], "else");
        assert!(round_trip(&block).semantically_eq(&block));
    }

    #[test]
    fn test_toggle_heading_without_branches() {
        let payload = json!({
            "type": "heading_2",
            "heading_2": {
                "rich_text": [{ "plain_text": "if $torch" }],
                "is_toggleable": true,
                "children": [{ "type": "paragraph", "paragraph": { "rich_text": [{ "plain_text": "Bright." }] } }]
            }
        });
        let block = from_remote(&payload).unwrap();
        assert_eq!(block.children.len(), 1);
        assert_eq!(
            block.runtime_metadata,
            Some(RuntimeMetadata::IfElse {
                condition: "$torch".to_string(),
                else_index: None
            })
        );
    }

    #[test]
    fn test_nav_callout() {
        let block = parse("```nav\n- \"North\" → north.md\n```").unwrap().remove(0);
        let payload = to_remote(&block).unwrap();
        assert_eq!(payload["type"], "callout");
        assert_eq!(payload["callout"]["icon"]["emoji"], NAV_ICON);
        assert!(round_trip(&block).semantically_eq(&block));

        let other = json!({
            "type": "callout",
            "callout": { "rich_text": [], "icon": { "type": "emoji", "emoji": "💡" } }
        });
        assert_eq!(from_remote(&other).unwrap().kind.tag(), "unmapped");
    }

    #[test]
    fn test_map_caption_marks_read_only() {
        let block = parse("```map\nviewport: 40x20\n```").unwrap().remove(0);
        let payload = to_remote(&block).unwrap();
        assert_eq!(
            payload["code"]["caption"][0]["plain_text"],
            "[TYPE:MAP] read-only, edit locally"
        );
        assert!(round_trip(&block).semantically_eq(&block));
    }

    #[test]
    fn test_long_text_is_split_and_rejoined() {
        let text = "x".repeat(RICH_TEXT_LIMIT * 2 + 5);
        let block = Block::new(
            BlockKind::Paragraph,
            BlockContent::rich(vec![RichText::plain(text.clone())]),
        );
        let payload = to_remote(&block).unwrap();
        assert_eq!(payload["paragraph"]["rich_text"].as_array().unwrap().len(), 3);
        assert_eq!(round_trip(&block).content.plain_text(), text);
    }

    #[test]
    fn test_document_carries_frontmatter() {
        let text = "---\ntitle: Keep\ndata:\n  db:\n    provider: sqlite\n    path: w.db\n---\n# Hi\n";
        let doc = crate::parser::parse_document(text).unwrap().document;
        let payloads = document_to_remote(&doc).unwrap();
        assert_eq!(payloads.len(), 2);
        assert!(is_frontmatter_payload(&payloads[0]));

        let back = document_from_remote(&payloads);
        assert!(back.warnings.is_empty());
        assert_eq!(back.frontmatter, doc.frontmatter);
        assert_eq!(back.blocks.len(), 1);
        assert_eq!(back.blocks[0].block.id, doc.blocks[0].id);
    }

    #[test]
    fn test_edited_at_helper() {
        let payload = json!({ "id": "b1", "last_edited_time": "2024-03-01T10:00:00.000Z" });
        assert_eq!(remote_id(&payload), Some("b1"));
        assert_eq!(
            remote_edited_at(&payload).map(|t| t.to_rfc3339()),
            Some("2024-03-01T10:00:00+00:00".to_string())
        );
    }

    fn span_strategy() -> impl Strategy<Value = RichText> {
        (
            "[a-zA-Z0-9 .,!?]{1,40}",
            any::<bool>(),
            any::<bool>(),
            any::<bool>(),
            any::<bool>(),
            proptest::option::of("https://[a-z]{1,10}\\.com"),
        )
            .prop_map(|(text, bold, italic, strikethrough, code, link)| RichText {
                text,
                bold,
                italic,
                strikethrough,
                code,
                link,
            })
    }

    fn prose_strategy() -> impl Strategy<Value = Block> {
        let spans = prop::collection::vec(span_strategy(), 0..5).prop_map(BlockContent::rich);
        (0usize..5, spans).prop_map(|(kind, content)| {
            let kind = match kind {
                0 => BlockKind::Heading { level: 1 },
                1 => BlockKind::Heading { level: 3 },
                2 => BlockKind::Quote,
                3 => BlockKind::List { ordered: true },
                _ => BlockKind::Paragraph,
            };
            Block::new(kind, content)
        })
    }

    fn runtime_strategy() -> impl Strategy<Value = Block> {
        prop_oneof![
            (prop::collection::vec(("[a-z]{1,8}", -1000i64..1000), 1..4)).prop_map(|vars| {
                let body: Vec<String> = vars.iter().map(|(n, v)| format!("${} = {}", n, v)).collect();
                body.join("\n")
            }).prop_map(|body| format!("```state\n{}\n```", body)),
            "[a-z]{1,8}".prop_map(|n| format!("```set\n${} += 1\n```", n)),
            "[a-z]{1,8}".prop_map(|n| format!("```form\nvar: ${}, type: number, required: true\n```", n)),
            "[A-Za-z ]{1,12}".prop_map(|l| format!("```nav\n- \"{}\" → next.md\n```", l)),
            "[#. ]{1,20}".prop_map(|row| format!("```panel\n{}\n{}\n```", row, row)),
            (1u32..200, 1u32..200).prop_map(|(w, h)| format!("```map\nviewport: {}x{}\n```", w, h)),
            "[a-z]{1,8}".prop_map(|n| format!("```if\n${} > 1\nYes.\nelse\nNo.\n```", n)),
            proptest::option::of("[a-z]{1,8}").prop_map(|lang| format!(
                "```{}\nlet x = 1;\n```",
                lang.unwrap_or_default()
            )),
        ]
        .prop_map(|markdown| parse(&markdown).map(|mut b| b.remove(0)))
        .prop_filter_map("runtime block should parse", Result::ok)
    }

    proptest! {
        #[test]
        fn prop_prose_round_trips(block in prose_strategy()) {
            prop_assert!(round_trip(&block).semantically_eq(&block));
        }

        #[test]
        fn prop_runtime_round_trips(block in runtime_strategy()) {
            let back = round_trip(&block);
            prop_assert_eq!(&back.kind, &block.kind);
            prop_assert_eq!(&back.content, &block.content);
            prop_assert_eq!(&back.runtime_metadata, &block.runtime_metadata);
        }
    }
}
