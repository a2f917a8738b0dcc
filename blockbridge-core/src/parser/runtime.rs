//! Grammars for fenced runtime blocks.
//!
//! Each kind has a small line-oriented grammar. Violations are reported as
//! [`ParseError::MalformedBlock`] with the 1-based line in the document.

use super::{parse_nested, ParseError, PASSTHROUGH_FENCE};
use crate::models::{
    AssignOp, Assignment, Block, BlockContent, BlockKind, FormField, NavChoice, RuntimeMetadata,
    VariableDecl, Viewport,
};
use blockbridge_types::VarType;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::OnceLock;

static STATE_LINE: OnceLock<Regex> = OnceLock::new();
static SET_LINE: OnceLock<Regex> = OnceLock::new();
static NAV_LINE: OnceLock<Regex> = OnceLock::new();
static VIEWPORT: OnceLock<Regex> = OnceLock::new();
static IDENT: OnceLock<Regex> = OnceLock::new();

fn state_line() -> &'static Regex {
    STATE_LINE.get_or_init(|| {
        Regex::new(r"^\$([A-Za-z_][A-Za-z0-9_.]*)\s*=\s*(.*)$").expect("valid regex")
    })
}

fn set_line() -> &'static Regex {
    SET_LINE.get_or_init(|| {
        Regex::new(r"^\$([A-Za-z_][A-Za-z0-9_.]*)\s*(\+=|-=|\*=|/=|=)\s*(.*)$").expect("valid regex")
    })
}

fn nav_line() -> &'static Regex {
    NAV_LINE.get_or_init(|| {
        Regex::new(r#"^[-*]\s*"([^"]*)"\s*(?:→|->)\s*(\S.*)$"#).expect("valid regex")
    })
}

fn viewport() -> &'static Regex {
    VIEWPORT.get_or_init(|| Regex::new(r"^(\d+)\s*[xX×]\s*(\d+)$").expect("valid regex"))
}

fn ident() -> &'static Regex {
    IDENT.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_.]*$").expect("valid regex"))
}

/// Parse the body of a fenced runtime block into a block of `kind`.
///
/// `first_line` is the document line of the first body line.
pub fn parse_runtime(kind: &BlockKind, body: &str, first_line: usize) -> Result<Block, ParseError> {
    let fence = kind.fence_tag().unwrap_or("runtime");
    if *kind == BlockKind::IfElse {
        return parse_if(body, first_line);
    }

    let metadata = match kind {
        BlockKind::State => parse_state(body, first_line)?,
        BlockKind::Set => parse_set(body, first_line)?,
        BlockKind::Form => parse_form(body, first_line)?,
        BlockKind::Nav => parse_nav(body, first_line)?,
        BlockKind::Panel => measure_panel(body),
        BlockKind::Map => parse_map(body, first_line)?,
        _ => {
            return Err(ParseError::malformed(
                fence,
                first_line,
                format!("`{}` is not a runtime block", kind.tag()),
            ))
        }
    };
    Ok(Block::new(kind.clone(), BlockContent::Raw(body.to_string())).with_metadata(metadata))
}

/// Parse the JSON body of a passthrough block back into an unmapped block.
pub fn parse_passthrough(body: &str, first_line: usize) -> Result<Block, ParseError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| ParseError::malformed(PASSTHROUGH_FENCE, first_line + e.line().saturating_sub(1), e.to_string()))?;
    let remote_type = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| ParseError::malformed(PASSTHROUGH_FENCE, first_line, "missing `type`"))?
        .to_string();
    Ok(Block::new(
        BlockKind::Unmapped { remote_type },
        BlockContent::Raw(value.to_string()),
    ))
}

/// Parse a literal: JSON if it parses, a single-quoted string, or the bare text.
pub fn literal_value(raw: &str) -> Value {
    let raw = raw.trim();
    if let Ok(value) = serde_json::from_str::<Value>(raw) {
        return value;
    }
    if raw.len() >= 2 && raw.starts_with('\'') && raw.ends_with('\'') {
        return Value::String(raw[1..raw.len() - 1].to_string());
    }
    Value::String(raw.to_string())
}

pub fn infer_type(value: &Value) -> VarType {
    match value {
        Value::Bool(_) => VarType::Boolean,
        Value::Number(_) => VarType::Number,
        Value::String(_) => VarType::String,
        Value::Array(_) => VarType::Array,
        Value::Null | Value::Object(_) => VarType::Object,
    }
}

/// Non-blank, non-comment lines with their document line numbers.
fn content_lines(body: &str, first_line: usize) -> impl Iterator<Item = (usize, &str)> {
    body.lines().enumerate().filter_map(move |(i, line)| {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
            None
        } else {
            Some((first_line + i, line))
        }
    })
}

fn parse_state(body: &str, first_line: usize) -> Result<RuntimeMetadata, ParseError> {
    let mut variables: Vec<VariableDecl> = Vec::new();
    for (line_no, line) in content_lines(body, first_line) {
        let caps = state_line().captures(line).ok_or_else(|| {
            ParseError::malformed("state", line_no, format!("expected `$name = value`, found `{}`", line))
        })?;
        let name = caps[1].to_string();
        let raw_value = caps[2].trim();
        if raw_value.is_empty() {
            return Err(ParseError::malformed(
                "state",
                line_no,
                format!("missing value for `${}`", name),
            ));
        }
        let value = literal_value(raw_value);
        let decl = VariableDecl {
            var_type: infer_type(&value),
            name,
            initial_value: value,
        };
        // A redeclaration overrides the earlier value but keeps its position
        match variables.iter_mut().find(|v| v.name == decl.name) {
            Some(existing) => *existing = decl,
            None => variables.push(decl),
        }
    }
    Ok(RuntimeMetadata::State { variables })
}

fn parse_set(body: &str, first_line: usize) -> Result<RuntimeMetadata, ParseError> {
    let mut assignments = Vec::new();
    for (line_no, line) in content_lines(body, first_line) {
        let caps = set_line().captures(line).ok_or_else(|| {
            ParseError::malformed("set", line_no, format!("expected `$name <op> expr`, found `{}`", line))
        })?;
        let expr = caps[3].trim().to_string();
        if expr.is_empty() {
            return Err(ParseError::malformed("set", line_no, "missing expression"));
        }
        let op = AssignOp::from_symbol(&caps[2]).unwrap_or(AssignOp::Assign);
        let var_type = match op {
            AssignOp::Assign => infer_type(&literal_value(&expr)),
            _ => VarType::Number,
        };
        assignments.push(Assignment {
            name: caps[1].to_string(),
            op,
            expr,
            var_type,
        });
    }
    Ok(RuntimeMetadata::Set { assignments })
}

/// Split on `,` or `|` outside double quotes.
fn split_field_parts(line: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (i, ch) in line.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ',' | '|' if !in_quotes => {
                parts.push(&line[start..i]);
                start = i + ch.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&line[start..]);
    parts
}

fn unquote(value: &str) -> &str {
    let value = value.trim();
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

fn field_var_type(field_type: &str) -> Option<VarType> {
    match field_type {
        "text" | "string" | "choice" | "select" | "textarea" => Some(VarType::String),
        "number" | "int" | "integer" | "float" => Some(VarType::Number),
        "toggle" | "checkbox" | "bool" | "boolean" => Some(VarType::Boolean),
        "list" | "array" | "multiselect" => Some(VarType::Array),
        "object" | "json" => Some(VarType::Object),
        _ => None,
    }
}

fn parse_form(body: &str, first_line: usize) -> Result<RuntimeMetadata, ParseError> {
    let mut fields = Vec::new();
    for (line_no, line) in content_lines(body, first_line) {
        let line = line
            .strip_prefix("- ")
            .or_else(|| line.strip_prefix("* "))
            .unwrap_or(line);

        let mut var = None;
        let mut field_type = "text".to_string();
        let mut label = None;
        let mut required = false;

        for part in split_field_parts(line) {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (key, value) = part.split_once(':').ok_or_else(|| {
                ParseError::malformed("form", line_no, format!("expected `key: value`, found `{}`", part))
            })?;
            let value = unquote(value);
            match key.trim().to_ascii_lowercase().as_str() {
                "var" => {
                    let name = value.trim_start_matches('$');
                    if !ident().is_match(name) {
                        return Err(ParseError::malformed(
                            "form",
                            line_no,
                            format!("invalid variable name `{}`", value),
                        ));
                    }
                    var = Some(name.to_string());
                }
                "type" => field_type = value.to_ascii_lowercase(),
                "label" => label = Some(value.to_string()),
                "required" => {
                    required = match value.to_ascii_lowercase().as_str() {
                        "true" | "yes" => true,
                        "false" | "no" => false,
                        other => {
                            return Err(ParseError::malformed(
                                "form",
                                line_no,
                                format!("`required` must be true or false, found `{}`", other),
                            ))
                        }
                    }
                }
                other => {
                    return Err(ParseError::malformed(
                        "form",
                        line_no,
                        format!("unknown field attribute `{}`", other),
                    ))
                }
            }
        }

        let var = var.ok_or_else(|| {
            ParseError::malformed("form", line_no, "field line is missing the required `var:` key")
        })?;
        let var_type = field_var_type(&field_type).ok_or_else(|| {
            ParseError::malformed("form", line_no, format!("unknown field type `{}`", field_type))
        })?;
        fields.push(FormField {
            var,
            field_type,
            var_type,
            label,
            required,
        });
    }
    Ok(RuntimeMetadata::Form { fields })
}

fn parse_nav(body: &str, first_line: usize) -> Result<RuntimeMetadata, ParseError> {
    let mut choices = Vec::new();
    for (line_no, line) in content_lines(body, first_line) {
        let caps = nav_line().captures(line).ok_or_else(|| {
            ParseError::malformed("nav", line_no, format!("expected `- \"Label\" → target`, found `{}`", line))
        })?;
        choices.push(NavChoice {
            label: caps[1].to_string(),
            target: caps[2].trim().to_string(),
        });
    }
    Ok(RuntimeMetadata::Nav { choices })
}

fn measure_panel(body: &str) -> RuntimeMetadata {
    RuntimeMetadata::Panel {
        width: body.lines().map(|l| l.chars().count()).max().unwrap_or(0),
        height: body.lines().count(),
    }
}

fn parse_map(body: &str, first_line: usize) -> Result<RuntimeMetadata, ParseError> {
    let mut viewport_size = None;
    let mut provider = None;
    let mut sprites = None;
    let mut extra = BTreeMap::new();
    for (line_no, line) in content_lines(body, first_line) {
        let (key, value) = line.split_once(':').ok_or_else(|| {
            ParseError::malformed("map", line_no, format!("expected `key: value`, found `{}`", line))
        })?;
        let value = unquote(value).to_string();
        match key.trim() {
            "viewport" => {
                let caps = viewport().captures(&value).ok_or_else(|| {
                    ParseError::malformed("map", line_no, format!("viewport must be `WxH`, found `{}`", value))
                })?;
                let dim = |i: usize| {
                    caps[i].parse::<u32>().map_err(|e| {
                        ParseError::malformed("map", line_no, format!("viewport: {}", e))
                    })
                };
                viewport_size = Some(Viewport {
                    width: dim(1)?,
                    height: dim(2)?,
                });
            }
            "provider" => provider = Some(value),
            "sprites" | "sprite" => sprites = Some(value),
            other => {
                extra.insert(other.to_string(), value);
            }
        }
    }
    Ok(RuntimeMetadata::Map {
        viewport: viewport_size,
        provider,
        sprites,
        extra,
    })
}

fn is_fence_line(line: &str) -> bool {
    let line = line.trim_start();
    line.starts_with("```") || line.starts_with("~~~")
}

fn parse_if(body: &str, first_line: usize) -> Result<Block, ParseError> {
    let lines: Vec<&str> = body.lines().collect();
    let cond_idx = lines
        .iter()
        .position(|l| !l.trim().is_empty())
        .ok_or_else(|| ParseError::malformed("if", first_line, "missing condition"))?;

    let cond_line = lines[cond_idx].trim();
    let condition = cond_line.strip_prefix("if ").unwrap_or(cond_line).trim();
    if condition.is_empty() || condition == "if" {
        return Err(ParseError::malformed("if", first_line + cond_idx, "missing condition"));
    }

    let rest = &lines[cond_idx + 1..];
    let mut in_fence = false;
    let mut else_pos = None;
    for (i, line) in rest.iter().enumerate() {
        if is_fence_line(line) {
            in_fence = !in_fence;
        } else if !in_fence && line.trim().eq_ignore_ascii_case("else") {
            else_pos = Some(i);
            break;
        }
    }

    // Lines before the then-branch, relative to the document
    let then_offset = first_line + cond_idx;
    let (then_lines, else_lines) = match else_pos {
        Some(pos) => (&rest[..pos], Some(&rest[pos + 1..])),
        None => (rest, None),
    };

    let mut children = parse_nested(&then_lines.join("\n"), then_offset)?;
    let else_index = match else_lines {
        Some(else_lines) => {
            let split = children.len();
            let else_offset = then_offset + then_lines.len() + 1;
            children.extend(parse_nested(&else_lines.join("\n"), else_offset)?);
            Some(split)
        }
        None => None,
    };

    Ok(Block::new(BlockKind::IfElse, BlockContent::Raw(condition.to_string()))
        .with_children(children)
        .with_metadata(RuntimeMetadata::IfElse {
            condition: condition.to_string(),
            else_index,
        }))
}

/// Rebuild the metadata of a runtime block from its raw body.
pub fn metadata_for(kind: &BlockKind, body: &str) -> Result<RuntimeMetadata, ParseError> {
    let block = parse_runtime(kind, body, 1)?;
    block
        .runtime_metadata
        .ok_or_else(|| ParseError::malformed(kind.tag(), 1, "block carries no metadata"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_state_literals() {
        let body = "# inventory\n$name = \"Ayla\"\n$alive = true\n$bag = [\"rope\"]\n$title = 'the Brave'\n$mood = grumpy\n";
        let RuntimeMetadata::State { variables } = parse_state(body, 1).unwrap() else {
            panic!("expected state metadata");
        };
        let types: Vec<_> = variables.iter().map(|v| v.var_type).collect();
        assert_eq!(
            types,
            vec![VarType::String, VarType::Boolean, VarType::Array, VarType::String, VarType::String]
        );
        assert_eq!(variables[3].initial_value, json!("the Brave"));
        assert_eq!(variables[4].initial_value, json!("grumpy"));
    }

    #[test]
    fn test_state_redeclaration_keeps_position() {
        let RuntimeMetadata::State { variables } = parse_state("$a = 1\n$b = 2\n$a = 3", 1).unwrap() else {
            panic!("expected state metadata");
        };
        assert_eq!(variables.len(), 2);
        assert_eq!(variables[0].name, "a");
        assert_eq!(variables[0].initial_value, json!(3));
    }

    #[test]
    fn test_state_rejects_bad_line() {
        let err = parse_state("$hp = 1\nhp = 2", 10).unwrap_err();
        assert_eq!(err.line(), 11);
    }

    #[test]
    fn test_set_operators() {
        let RuntimeMetadata::Set { assignments } = parse_set("$gold -= 10\n$door = \"open\"", 1).unwrap() else {
            panic!("expected set metadata");
        };
        assert_eq!(assignments[0].op, AssignOp::Sub);
        assert_eq!(assignments[0].var_type, VarType::Number);
        assert_eq!(assignments[1].var_type, VarType::String);
    }

    #[test]
    fn test_form_fields() {
        let body = "- var: $name, type: text, label: \"Your name, hero\", required: true\nvar: $age | type: number";
        let RuntimeMetadata::Form { fields } = parse_form(body, 1).unwrap() else {
            panic!("expected form metadata");
        };
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0].var, "name");
        assert_eq!(fields[0].label.as_deref(), Some("Your name, hero"));
        assert!(fields[0].required);
        assert_eq!(fields[1].var_type, VarType::Number);
        assert!(!fields[1].required);
    }

    #[test]
    fn test_form_unknown_type() {
        let err = parse_form("var: $x, type: hologram", 1).unwrap_err();
        assert!(err.to_string().contains("hologram"));
    }

    #[test]
    fn test_nav_choices() {
        let RuntimeMetadata::Nav { choices } =
            parse_nav("- \"Enter the cave\" → cave.md\n* \"Go home\" -> home.md", 1).unwrap()
        else {
            panic!("expected nav metadata");
        };
        assert_eq!(choices[0].target, "cave.md");
        assert_eq!(choices[1].label, "Go home");
    }

    #[test]
    fn test_map_viewport() {
        let meta = parse_map("viewport: 80x24\nprovider: tiles\nlayer: ground", 1).unwrap();
        let RuntimeMetadata::Map { viewport, provider, extra, .. } = meta else {
            panic!("expected map metadata");
        };
        assert_eq!(viewport, Some(Viewport { width: 80, height: 24 }));
        assert_eq!(provider.as_deref(), Some("tiles"));
        assert_eq!(extra.get("layer").map(String::as_str), Some("ground"));
        assert!(parse_map("viewport: wide", 1).is_err());
    }

    #[test]
    fn test_panel_measures() {
        assert_eq!(
            measure_panel("+--+\n|  |\n+--+"),
            RuntimeMetadata::Panel { width: 4, height: 3 }
        );
    }

    #[test]
    fn test_if_without_else() {
        let block = parse_if("$torch\nIt is bright.", 1).unwrap();
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
    fn test_if_branch_error_lines() {
        let body = "if $x\n```state\nbad\n```";
        let err = parse_if(body, 7).unwrap_err();
        assert_eq!(err.line(), 9);
    }

    #[test]
    fn test_passthrough_body() {
        let block = parse_passthrough("{\n  \"type\": \"bookmark\",\n  \"bookmark\": {}\n}", 1).unwrap();
        assert_eq!(
            block.kind,
            BlockKind::Unmapped {
                remote_type: "bookmark".to_string()
            }
        );
    }
}
