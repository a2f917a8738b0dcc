//! Markdown to block parsing.
//!
//! Prose is parsed permissively: anything the block model has no shape for
//! (tables, HTML, images, footnote definitions) degrades to paragraph text
//! taken verbatim from the source. Fenced runtime blocks are parsed strictly
//! by their grammar in [`runtime`].

pub mod runtime;

use crate::frontmatter::{split_frontmatter, FrontmatterError};
use crate::identity::assign_ids;
use crate::models::{Block, BlockContent, BlockKind, Document, RichText};
use pulldown_cmark::{CodeBlockKind, Event, OffsetIter, Options, Parser, Tag, TagEnd};
use std::iter::Peekable;
use std::ops::Range;
use thiserror::Error;

/// Fence language for remote blocks that have no local equivalent.
pub const PASSTHROUGH_FENCE: &str = "remote-block";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed `{fence}` block at line {line}: {reason}")]
    MalformedBlock {
        fence: String,
        line: usize,
        reason: String,
    },
}

impl ParseError {
    pub fn malformed(fence: &str, line: usize, reason: impl Into<String>) -> Self {
        ParseError::MalformedBlock {
            fence: fence.to_string(),
            line,
            reason: reason.into(),
        }
    }

    pub fn line(&self) -> usize {
        match self {
            ParseError::MalformedBlock { line, .. } => *line,
        }
    }

    fn shifted(self, lines: usize) -> Self {
        match self {
            ParseError::MalformedBlock { fence, line, reason } => ParseError::MalformedBlock {
                fence,
                line: line + lines,
                reason,
            },
        }
    }
}

/// Blocks that parsed, plus the runtime blocks that did not.
#[derive(Debug, Clone, Default)]
pub struct ParsedBlocks {
    pub blocks: Vec<Block>,
    pub errors: Vec<ParseError>,
}

/// A whole document: frontmatter, blocks and per-block parse errors.
#[derive(Debug, Clone, Default)]
pub struct ParsedDocument {
    pub document: Document,
    pub errors: Vec<ParseError>,
}

fn markdown_options() -> Options {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_FOOTNOTES);
    options.insert(Options::ENABLE_STRIKETHROUGH);
    options.insert(Options::ENABLE_TASKLISTS);
    options
}

/// Parse markdown into blocks, failing on the first malformed runtime block.
///
/// # Example
///
/// ```
/// use blockbridge_core::parser::parse;
/// use blockbridge_core::models::BlockKind;
///
/// let blocks = parse("```state\n$hp = 100\n```\n").unwrap();
/// assert_eq!(blocks[0].kind, BlockKind::State);
/// ```
pub fn parse(text: &str) -> Result<Vec<Block>, ParseError> {
    let parsed = parse_lenient(text);
    match parsed.errors.into_iter().next() {
        Some(err) => Err(err),
        None => Ok(parsed.blocks),
    }
}

/// Parse markdown into blocks, collecting malformed runtime blocks as errors.
///
/// A malformed block is left out of `blocks`; its siblings are unaffected.
pub fn parse_lenient(text: &str) -> ParsedBlocks {
    let mut parsed = parse_unassigned(text, 0);
    assign_ids(&mut parsed.blocks);
    parsed
}

/// Split frontmatter and parse the body.
pub fn parse_document(text: &str) -> Result<ParsedDocument, FrontmatterError> {
    let (frontmatter, body) = split_frontmatter(text)?;
    let offset = text[..text.len() - body.len()].matches('\n').count();
    let mut parsed = parse_unassigned(body, offset);
    assign_ids(&mut parsed.blocks);
    Ok(ParsedDocument {
        document: Document {
            frontmatter,
            blocks: parsed.blocks,
        },
        errors: parsed.errors,
    })
}

/// Parse without assigning ids; `line_offset` shifts reported line numbers.
pub(crate) fn parse_unassigned(text: &str, line_offset: usize) -> ParsedBlocks {
    let mut walker = Walker {
        source: text,
        iter: Parser::new_ext(text, markdown_options())
            .into_offset_iter()
            .peekable(),
        errors: Vec::new(),
        line_offset,
    };
    let blocks = walker.blocks_until_end();
    ParsedBlocks {
        blocks,
        errors: walker.errors,
    }
}

/// Accumulates inline events into spans.
#[derive(Default)]
struct Inline {
    spans: Vec<RichText>,
    bold: usize,
    italic: usize,
    strike: usize,
    links: Vec<String>,
}

impl Inline {
    fn push(&mut self, text: &str, code: bool) {
        self.spans.push(RichText {
            text: text.to_string(),
            bold: self.bold > 0,
            italic: self.italic > 0,
            strikethrough: self.strike > 0,
            code,
            link: self.links.last().cloned(),
        });
    }

    /// Newline between two flattened blocks.
    fn separate(&mut self) {
        let ends_with_newline = self
            .spans
            .last()
            .map_or(true, |s| s.text.ends_with('\n'));
        if !ends_with_newline {
            self.spans.push(RichText::plain("\n"));
        }
    }

    /// Returns false when `event` is not inline content.
    fn feed(&mut self, event: &Event<'_>, raw: &str) -> bool {
        match event {
            Event::Start(Tag::Emphasis) => self.italic += 1,
            Event::Start(Tag::Strong) => self.bold += 1,
            Event::Start(Tag::Strikethrough) => self.strike += 1,
            Event::Start(Tag::Link { dest_url, .. }) => self.links.push(dest_url.to_string()),
            Event::End(TagEnd::Emphasis) => self.italic = self.italic.saturating_sub(1),
            Event::End(TagEnd::Strong) => self.bold = self.bold.saturating_sub(1),
            Event::End(TagEnd::Strikethrough) => self.strike = self.strike.saturating_sub(1),
            Event::End(TagEnd::Link) => {
                self.links.pop();
            }
            Event::Text(text) => self.push(text, false),
            Event::Code(code) => self.push(code, true),
            Event::SoftBreak | Event::HardBreak => self.push("\n", false),
            Event::InlineHtml(html) | Event::Html(html) => self.push(html, false),
            Event::FootnoteReference(label) => self.push(&format!("[^{}]", label), false),
            Event::TaskListMarker(done) => self.push(if *done { "[x] " } else { "[ ] " }, false),
            Event::InlineMath(_) | Event::DisplayMath(_) => self.push(raw, false),
            _ => return false,
        }
        true
    }

    fn finish(self) -> Vec<RichText> {
        self.spans
    }
}

struct Walker<'a> {
    source: &'a str,
    iter: Peekable<OffsetIter<'a>>,
    errors: Vec<ParseError>,
    line_offset: usize,
}

impl<'a> Walker<'a> {
    fn line_of(&self, offset: usize) -> usize {
        self.line_offset + self.source[..offset].matches('\n').count() + 1
    }

    fn raw(&self, range: Range<usize>) -> &'a str {
        self.source[range].trim_end()
    }

    /// Read blocks until the end of the enclosing element (or of input).
    fn blocks_until_end(&mut self) -> Vec<Block> {
        let mut out = Vec::new();
        while let Some((event, range)) = self.iter.next() {
            if let Event::End(_) = event {
                break;
            }
            self.blocks_from(event, range, &mut out);
        }
        out
    }

    fn blocks_from(&mut self, event: Event<'a>, range: Range<usize>, out: &mut Vec<Block>) {
        match event {
            Event::Start(Tag::Heading { level, .. }) => {
                let spans = self.flatten_until_end();
                let level = (level as u8).clamp(1, 3);
                out.push(Block::new(
                    BlockKind::Heading { level },
                    BlockContent::rich(spans),
                ));
            }
            Event::Start(Tag::Paragraph) => {
                let spans = self.flatten_until_end();
                out.push(Block::new(BlockKind::Paragraph, BlockContent::rich(spans)));
            }
            Event::Start(Tag::BlockQuote(_)) => {
                let spans = self.flatten_until_end();
                out.push(Block::new(BlockKind::Quote, BlockContent::rich(spans)));
            }
            Event::Start(Tag::List(start)) => self.list_items(start.is_some(), out),
            Event::Start(Tag::CodeBlock(kind)) => self.code_block(kind, range, out),
            Event::Rule => out.push(Block::new(BlockKind::Divider, BlockContent::Empty)),
            Event::Start(_) => {
                self.skip_until_end();
                out.push(self.degraded(range));
            }
            Event::Html(_) | Event::Text(_) => out.push(self.degraded(range)),
            _ => {}
        }
    }

    /// Paragraph holding the verbatim source of an unsupported construct.
    fn degraded(&self, range: Range<usize>) -> Block {
        let raw = self.raw(range);
        tracing::debug!(raw, "degrading unsupported markdown to paragraph text");
        Block::new(
            BlockKind::Paragraph,
            BlockContent::rich(vec![RichText::plain(raw)]),
        )
    }

    /// Collect all inline text up to the end of the current element.
    ///
    /// Nested block containers are flattened with newlines between them.
    fn flatten_until_end(&mut self) -> Vec<RichText> {
        let mut inline = Inline::default();
        while let Some((event, range)) = self.iter.next() {
            if inline.feed(&event, &self.source[range.clone()]) {
                continue;
            }
            match event {
                Event::End(_) => break,
                Event::Start(
                    Tag::Paragraph
                    | Tag::Heading { .. }
                    | Tag::BlockQuote(_)
                    | Tag::List(_)
                    | Tag::Item,
                ) => {
                    inline.separate();
                    let nested = self.flatten_until_end();
                    inline.spans.extend(nested);
                }
                Event::Start(_) => {
                    self.skip_until_end();
                    inline.separate();
                    inline.push(self.raw(range), false);
                }
                Event::Rule => {
                    inline.separate();
                    inline.push("---", false);
                }
                _ => {}
            }
        }
        inline.finish()
    }

    fn skip_until_end(&mut self) {
        let mut depth = 0usize;
        for (event, _) in self.iter.by_ref() {
            match event {
                Event::Start(_) => depth += 1,
                Event::End(_) if depth == 0 => return,
                Event::End(_) => depth -= 1,
                _ => {}
            }
        }
    }

    fn list_items(&mut self, ordered: bool, out: &mut Vec<Block>) {
        while let Some((event, _)) = self.iter.next() {
            match event {
                Event::Start(Tag::Item) => {
                    let item = self.list_item(ordered);
                    out.push(item);
                }
                Event::End(_) => break,
                _ => {}
            }
        }
    }

    fn list_item(&mut self, ordered: bool) -> Block {
        let mut inline = Inline::default();
        let mut children = Vec::new();
        while let Some((event, range)) = self.iter.next() {
            if children.is_empty() && inline.feed(&event, &self.source[range.clone()]) {
                continue;
            }
            match event {
                Event::End(_) => break,
                Event::Start(Tag::Paragraph) if children.is_empty() => {
                    inline.separate();
                    let spans = self.flatten_until_end();
                    inline.spans.extend(spans);
                }
                other => self.blocks_from(other, range, &mut children),
            }
        }
        Block::new(BlockKind::List { ordered }, BlockContent::rich(inline.finish()))
            .with_children(children)
    }

    fn code_block(&mut self, kind: CodeBlockKind<'a>, range: Range<usize>, out: &mut Vec<Block>) {
        let mut body = String::new();
        while let Some((event, _)) = self.iter.next() {
            match event {
                Event::Text(text) => body.push_str(&text),
                Event::End(_) => break,
                _ => {}
            }
        }
        if body.ends_with('\n') {
            body.pop();
            if body.ends_with('\r') {
                body.pop();
            }
        }

        let language = match kind {
            CodeBlockKind::Fenced(info) => info.split_whitespace().next().map(str::to_string),
            CodeBlockKind::Indented => None,
        };
        let fence = language.as_deref().map(str::to_ascii_lowercase);
        let body_line = self.line_of(range.start) + 1;

        if fence.as_deref() == Some(PASSTHROUGH_FENCE) {
            match runtime::parse_passthrough(&body, body_line) {
                Ok(block) => out.push(block),
                Err(err) => self.reject(err),
            }
            return;
        }

        if let Some(kind) = fence.as_deref().and_then(BlockKind::from_fence_tag) {
            match runtime::parse_runtime(&kind, &body, body_line) {
                Ok(block) => out.push(block),
                Err(err) => self.reject(err),
            }
            return;
        }

        out.push(Block::new(
            BlockKind::Code { language },
            BlockContent::Raw(body),
        ));
    }

    fn reject(&mut self, err: ParseError) {
        tracing::warn!(error = %err, "skipping malformed block");
        self.errors.push(err);
    }
}

/// Parse a branch body nested in another block, reporting lines relative to
/// the enclosing document.
pub(crate) fn parse_nested(text: &str, line_offset: usize) -> Result<Vec<Block>, ParseError> {
    let parsed = parse_unassigned(text, 0);
    match parsed.errors.into_iter().next() {
        Some(err) => Err(err.shifted(line_offset)),
        None => Ok(parsed.blocks),
    }
}
