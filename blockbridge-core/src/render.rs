//! Block to markdown rendering, the inverse of [`crate::parser`].
//!
//! Rendering then re-parsing yields semantically equal blocks: text is
//! escaped so it cannot turn into markup, and fences grow when a body
//! contains backticks.

use crate::frontmatter::FrontmatterError;
use crate::models::{Block, BlockContent, BlockKind, Document, RichText, RuntimeMetadata};
use crate::parser::PASSTHROUGH_FENCE;

/// Render a whole document, frontmatter first.
pub fn render_document(doc: &Document) -> Result<String, FrontmatterError> {
    let mut out = String::new();
    if let Some(fm) = &doc.frontmatter {
        out.push_str("---\n");
        out.push_str(&fm.to_yaml()?);
        out.push_str("---\n");
        if !doc.blocks.is_empty() {
            out.push('\n');
        }
    }
    let body = render_blocks(&doc.blocks);
    if !body.is_empty() {
        out.push_str(&body);
        out.push('\n');
    }
    Ok(out)
}

/// Render a block sequence without a trailing newline.
pub fn render_blocks(blocks: &[Block]) -> String {
    let mut out = String::new();
    let mut prev: Option<&BlockKind> = None;
    let mut ordinal = 0;
    for block in blocks {
        if is_blank_paragraph(block) {
            continue;
        }
        let continues_list = matches!(
            (prev, &block.kind),
            (Some(BlockKind::List { ordered: a }), BlockKind::List { ordered: b }) if a == b
        );
        ordinal = if continues_list { ordinal + 1 } else { 1 };
        if prev.is_some() {
            out.push_str(if continues_list { "\n" } else { "\n\n" });
        }
        out.push_str(&render_block(block, ordinal));
        prev = Some(&block.kind);
    }
    out
}

fn is_blank_paragraph(block: &Block) -> bool {
    block.kind == BlockKind::Paragraph && block.content.plain_text().trim().is_empty()
}

fn spans(block: &Block) -> &[RichText] {
    match &block.content {
        BlockContent::Rich(spans) => spans,
        _ => &[],
    }
}

fn raw(block: &Block) -> String {
    block.content.plain_text()
}

/// Render one block; `ordinal` numbers ordered list items.
pub fn render_block(block: &Block, ordinal: usize) -> String {
    match &block.kind {
        BlockKind::Heading { level } => {
            let single_line: Vec<RichText> = spans(block)
                .iter()
                .map(|s| RichText {
                    text: s.text.replace('\n', " "),
                    ..s.clone()
                })
                .collect();
            format!(
                "{} {}",
                "#".repeat(usize::from((*level).clamp(1, 3))),
                render_inline(&single_line)
            )
        }
        BlockKind::Paragraph => render_inline(spans(block)),
        BlockKind::Quote => render_inline(spans(block))
            .lines()
            .map(|line| {
                if line.is_empty() {
                    ">".to_string()
                } else {
                    format!("> {}", line)
                }
            })
            .collect::<Vec<_>>()
            .join("\n"),
        BlockKind::List { ordered } => render_list_item(block, *ordered, ordinal),
        BlockKind::Divider => "---".to_string(),
        BlockKind::Code { language } => fenced(language.as_deref().unwrap_or(""), &raw(block)),
        BlockKind::IfElse => render_if(block),
        BlockKind::Unmapped { .. } => {
            let body = serde_json::from_str::<serde_json::Value>(&raw(block))
                .and_then(|v| serde_json::to_string_pretty(&v))
                .unwrap_or_else(|_| raw(block));
            fenced(PASSTHROUGH_FENCE, &body)
        }
        kind => fenced(kind.fence_tag().unwrap_or(""), &raw(block)),
    }
}

fn render_list_item(block: &Block, ordered: bool, ordinal: usize) -> String {
    let marker = if ordered {
        format!("{}. ", ordinal)
    } else {
        "- ".to_string()
    };
    let indent = " ".repeat(marker.len());
    let text = render_inline(spans(block));
    let mut out = marker;
    out.push_str(&indent_continuation(&text, &indent));

    if !block.children.is_empty() {
        let nested = matches!(block.children[0].kind, BlockKind::List { .. });
        out.push_str(if nested { "\n" } else { "\n\n" });
        out.push_str(&indent_all(&render_blocks(&block.children), &indent));
    }
    out
}

fn indent_continuation(text: &str, indent: &str) -> String {
    text.replace('\n', &format!("\n{}", indent))
}

fn indent_all(text: &str, indent: &str) -> String {
    text.lines()
        .map(|line| {
            if line.is_empty() {
                String::new()
            } else {
                format!("{}{}", indent, line)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_if(block: &Block) -> String {
    let (condition, else_index) = match &block.runtime_metadata {
        Some(RuntimeMetadata::IfElse {
            condition,
            else_index,
        }) => (condition.clone(), *else_index),
        _ => (raw(block), None),
    };
    let split = else_index.unwrap_or(block.children.len()).min(block.children.len());
    let (then_branch, else_branch) = block.children.split_at(split);

    let mut body = format!("if {}", condition);
    let then_text = render_blocks(then_branch);
    if !then_text.is_empty() {
        body.push('\n');
        body.push_str(&then_text);
    }
    if else_index.is_some() {
        body.push_str("\nelse");
        let else_text = render_blocks(else_branch);
        if !else_text.is_empty() {
            body.push('\n');
            body.push_str(&else_text);
        }
    }
    fenced("if", &body)
}

/// Fence long enough that the body cannot close it.
fn fenced(language: &str, body: &str) -> String {
    let longest = longest_run(body, '`');
    let fence = "`".repeat(longest.max(2) + 1);
    if body.is_empty() {
        format!("{fence}{language}\n{fence}")
    } else {
        format!("{fence}{language}\n{body}\n{fence}")
    }
}

fn longest_run(text: &str, ch: char) -> usize {
    let mut longest = 0;
    let mut current = 0;
    for c in text.chars() {
        if c == ch {
            current += 1;
            longest = longest.max(current);
        } else {
            current = 0;
        }
    }
    longest
}

/// Render spans as inline markdown.
pub fn render_inline(spans: &[RichText]) -> String {
    let mut writer = InlineWriter::default();
    for span in spans {
        writer.span(span);
    }
    writer.out
}

#[derive(Default)]
struct InlineWriter {
    out: String,
}

impl InlineWriter {
    fn at_line_start(&self) -> bool {
        self.out.is_empty() || self.out.ends_with('\n')
    }

    fn span(&mut self, span: &RichText) {
        if span.code {
            self.code_span(span);
            return;
        }

        // Emphasis markers must hug non-whitespace, so keep padding outside
        let core = span.text.trim();
        if core.is_empty() {
            self.text(&span.text);
            return;
        }
        let lead = &span.text[..span.text.len() - span.text.trim_start().len()];
        let trail = &span.text[span.text.trim_end().len()..];

        self.text(lead);
        if span.link.is_some() {
            self.out.push('[');
        }
        let markers = markers(span);
        self.out.push_str(&markers);
        self.text(core);
        self.out.push_str(&markers.chars().rev().collect::<String>());
        if let Some(url) = &span.link {
            self.out.push_str("](");
            self.out.push_str(&link_destination(url));
            self.out.push(')');
        }
        self.text(trail);
    }

    fn code_span(&mut self, span: &RichText) {
        let text = span.text.replace('\n', " ");
        let ticks = "`".repeat(longest_run(&text, '`') + 1);
        let pad = text.contains('`')
            || (text.starts_with(' ') && text.ends_with(' ') && !text.trim().is_empty());
        let inner = if pad { format!(" {} ", text) } else { text };
        let mut rendered = format!("{ticks}{inner}{ticks}");
        if let Some(url) = &span.link {
            rendered = format!("[{}]({})", rendered, link_destination(url));
        }
        self.out.push_str(&rendered);
    }

    fn text(&mut self, text: &str) {
        let chars: Vec<char> = text.chars().collect();
        let mut i = 0;
        while i < chars.len() {
            let ch = chars[i];
            if self.at_line_start() {
                if matches!(ch, '#' | '>' | '-' | '+' | '=' | '|') {
                    self.out.push('\\');
                } else if ch.is_ascii_digit() {
                    let end = chars[i..]
                        .iter()
                        .position(|c| !c.is_ascii_digit())
                        .map_or(chars.len(), |p| i + p);
                    if end < chars.len() && matches!(chars[end], '.' | ')') {
                        self.out.extend(&chars[i..end]);
                        self.out.push('\\');
                        self.out.push(chars[end]);
                        i = end + 1;
                        continue;
                    }
                }
            }
            if matches!(ch, '\\' | '*' | '_' | '`' | '~' | '[' | ']' | '<' | '&') {
                self.out.push('\\');
            }
            self.out.push(ch);
            i += 1;
        }
    }
}

fn markers(span: &RichText) -> String {
    let mut m = String::new();
    if span.strikethrough {
        m.push_str("~~");
    }
    if span.bold {
        m.push_str("**");
    }
    if span.italic {
        m.push('*');
    }
    m
}

fn link_destination(url: &str) -> String {
    if url.contains([' ', '(', ')']) {
        format!("<{}>", url)
    } else {
        url.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{parse, parse_document};

    fn assert_stable(markdown: &str) {
        let first = parse(markdown).unwrap();
        let rendered = render_blocks(&first);
        let second = parse(&rendered).unwrap();
        assert_eq!(first.len(), second.len(), "rendered:\n{}", rendered);
        for (a, b) in first.iter().zip(&second) {
            assert!(a.semantically_eq(b), "rendered:\n{}\n{:?}\n{:?}", rendered, a, b);
        }
    }

    #[test]
    fn test_render_snapshot() {
        let blocks = parse(
            "# Tavern\n\nThe **innkeeper** nods. *Welcome*, [friend](https://example.com).\n\n- ale\n  - dark\n- bread\n\n```state\n$gold = 12\n```\n",
        )
        .unwrap();
        insta::assert_snapshot!(render_blocks(&blocks), @r"
        # Tavern

        The **innkeeper** nods. *Welcome*, [friend](https://example.com).

        - ale
          - dark
        - bread

        ```state
        $gold = 12
        ```
        ");
    }

    #[test]
    fn test_prose_is_stable() {
        assert_stable("# Title\n\nPlain *italic* **bold** ~~gone~~ `code` text.\n\n> a quote\n> over lines\n\n---\n");
    }

    #[test]
    fn test_special_characters_are_escaped() {
        assert_stable("Price is 5\\*3 and a\\_b.\n\n\\# not a heading\n\n1\\. not a list\n");
    }

    #[test]
    fn test_lists_are_stable() {
        assert_stable("1. one\n2. two\n   - nested\n\n- a\n- b\n");
    }

    #[test]
    fn test_runtime_blocks_are_stable() {
        assert_stable(
            "```form\nvar: $name, type: text\n```\n\n```nav\n- \"Go\" → next.md\n```\n\n```panel\n+--+\n+--+\n```\n",
        );
    }

    #[test]
    fn test_if_block_is_stable() {
        assert_stable("```if\n$gold >= 100\n# Rich\n\nBuy it.\nelse\nToo poor.\n```\n");
    }

    #[test]
    fn test_code_with_backticks_grows_fence() {
        let block = Block::new(
            BlockKind::Code { language: None },
            BlockContent::Raw("```\nnested\n```".to_string()),
        );
        let rendered = render_block(&block, 1);
        assert!(rendered.starts_with("````\n"));
        let reparsed = parse(&rendered).unwrap();
        assert!(reparsed[0].semantically_eq(&block));
    }

    #[test]
    fn test_document_round_trip() {
        let text = "---\ntitle: Tavern\n---\n\n# Hello\n";
        let parsed = parse_document(text).unwrap();
        let rendered = render_document(&parsed.document).unwrap();
        assert_eq!(rendered, text);
    }

    #[test]
    fn test_padding_stays_outside_emphasis() {
        let spans = vec![
            RichText {
                text: "bold ".to_string(),
                bold: true,
                ..Default::default()
            },
            RichText::plain("tail"),
        ];
        assert_eq!(render_inline(&spans), "**bold** tail");
    }
}
