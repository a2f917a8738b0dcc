//! Frontmatter splitting and external data binding extraction.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::HashSet;
use std::fmt;
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FrontmatterError {
    #[error("Invalid YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Frontmatter must be a YAML mapping")]
    NotAMapping,

    #[error("Invalid data binding `{name}`: {reason}")]
    InvalidBinding { name: String, reason: String },
}

static FRONTMATTER_REGEX: OnceLock<Regex> = OnceLock::new();

fn frontmatter_regex() -> &'static Regex {
    FRONTMATTER_REGEX.get_or_init(|| {
        Regex::new(r"(?s)\A---[ \t]*\r?\n(.*?)\r?\n---[ \t]*(?:\r?\n(.*))?\z").expect("valid regex")
    })
}

/// Kind of external data source a document binds to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Provider {
    Sqlite,
    RemoteDocService,
    Other(String),
}

impl Provider {
    pub fn as_str(&self) -> &str {
        match self {
            Provider::Sqlite => "sqlite",
            Provider::RemoteDocService => "remote-doc-service",
            Provider::Other(name) => name,
        }
    }
}

impl From<String> for Provider {
    fn from(s: String) -> Self {
        match s.to_lowercase().as_str() {
            "sqlite" => Provider::Sqlite,
            "remote-doc-service" | "notion" => Provider::RemoteDocService,
            _ => Provider::Other(s),
        }
    }
}

impl From<Provider> for String {
    fn from(p: Provider) -> Self {
        p.as_str().to_string()
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// External data source configuration attached to a document.
///
/// At most one binding exists per `(document_path, namespace)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbBinding {
    pub document_path: String,
    pub provider: Provider,
    pub connection_path: String,
    /// Variable prefix used to address bound data, e.g. `$db`
    pub namespace: String,
    /// Path expressions such as `$db.npc[*].name`
    pub bind_config: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DataSourceSpec {
    provider: String,
    #[serde(default)]
    path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    bind: Vec<BindEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum BindEntry {
    Var { var: String },
    Path(String),
}

impl BindEntry {
    fn into_path(self) -> String {
        match self {
            BindEntry::Var { var } | BindEntry::Path(var) => var,
        }
    }
}

/// Parsed document frontmatter.
///
/// The full mapping is kept so keys this crate does not understand survive
/// a round trip through the remote page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocFrontmatter {
    raw: Mapping,
}

impl DocFrontmatter {
    pub fn from_yaml(yaml: &str) -> Result<Self, FrontmatterError> {
        let value: Value = serde_yaml::from_str(yaml)?;
        let raw = match value {
            Value::Mapping(map) => map,
            Value::Null => Mapping::new(),
            _ => return Err(FrontmatterError::NotAMapping),
        };
        let fm = Self { raw };
        // Surface binding errors at parse time rather than at sync time
        fm.bindings("")?;
        Ok(fm)
    }

    pub fn to_yaml(&self) -> Result<String, FrontmatterError> {
        Ok(serde_yaml::to_string(&self.raw)?)
    }

    pub fn title(&self) -> Option<&str> {
        self.raw.get("title").and_then(Value::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Data bindings declared under `data:`, attributed to `document_path`.
    pub fn bindings(&self, document_path: &str) -> Result<Vec<DbBinding>, FrontmatterError> {
        let Some(data) = self.raw.get("data") else {
            return Ok(Vec::new());
        };
        let Value::Mapping(sources) = data else {
            return Err(FrontmatterError::InvalidBinding {
                name: "data".to_string(),
                reason: "expected a mapping of binding names".to_string(),
            });
        };

        let mut seen = HashSet::new();
        let mut bindings = Vec::with_capacity(sources.len());
        for (key, value) in sources {
            let name = key.as_str().unwrap_or_default().to_string();
            let spec: DataSourceSpec = serde_yaml::from_value(value.clone()).map_err(|e| {
                FrontmatterError::InvalidBinding {
                    name: name.clone(),
                    reason: e.to_string(),
                }
            })?;
            if spec.path.is_empty() {
                return Err(FrontmatterError::InvalidBinding {
                    name,
                    reason: "missing `path`".to_string(),
                });
            }
            let namespace = spec.namespace.unwrap_or_else(|| format!("${}", name));
            if !seen.insert(namespace.clone()) {
                return Err(FrontmatterError::InvalidBinding {
                    name,
                    reason: format!("namespace `{}` is bound twice", namespace),
                });
            }
            bindings.push(DbBinding {
                document_path: document_path.to_string(),
                provider: Provider::from(spec.provider),
                connection_path: spec.path,
                namespace,
                bind_config: spec.bind.into_iter().map(BindEntry::into_path).collect(),
            });
        }
        Ok(bindings)
    }

    /// Replace the `data:` entry with the binding's namespace, or add one.
    pub fn set_binding(&mut self, binding: &DbBinding) -> Result<(), FrontmatterError> {
        let spec = DataSourceSpec {
            provider: binding.provider.as_str().to_string(),
            path: binding.connection_path.clone(),
            namespace: Some(binding.namespace.clone()),
            bind: binding
                .bind_config
                .iter()
                .map(|var| BindEntry::Var { var: var.clone() })
                .collect(),
        };
        let spec = serde_yaml::to_value(spec)?;

        let existing = self.bindings(&binding.document_path)?;
        if !self.raw.contains_key("data") {
            self.raw
                .insert(Value::String("data".to_string()), Value::Mapping(Mapping::new()));
        }
        let Some(Value::Mapping(sources)) = self.raw.get_mut("data") else {
            return Err(FrontmatterError::InvalidBinding {
                name: "data".to_string(),
                reason: "expected a mapping of binding names".to_string(),
            });
        };

        let key = sources
            .iter()
            .zip(&existing)
            .find(|(_, b)| b.namespace == binding.namespace)
            .and_then(|((k, _), _)| k.as_str().map(str::to_string))
            .unwrap_or_else(|| binding.namespace.trim_start_matches('$').to_string());
        sources.insert(Value::String(key), spec);
        Ok(())
    }
}

/// Split leading frontmatter off a document.
///
/// Returns the parsed frontmatter, if any, and the markdown body.
///
/// # Example
///
/// ```
/// use blockbridge_core::frontmatter::split_frontmatter;
///
/// let content = "---\ntitle: Tavern\n---\n# Hello\n";
/// let (fm, body) = split_frontmatter(content).unwrap();
/// assert_eq!(fm.unwrap().title(), Some("Tavern"));
/// assert!(body.starts_with("# Hello"));
/// ```
pub fn split_frontmatter(content: &str) -> Result<(Option<DocFrontmatter>, &str), FrontmatterError> {
    let Some(captures) = frontmatter_regex().captures(content) else {
        return Ok((None, content));
    };
    let yaml = captures.get(1).map_or("", |m| m.as_str());
    let body = captures.get(2).map_or("", |m| m.as_str());
    Ok((Some(DocFrontmatter::from_yaml(yaml)?), body))
}

#[cfg(test)]
mod tests {
    use super::*;

    const WORLD: &str = r#"---
title: World
data:
  db:
    provider: sqlite
    path: "./data/world.db"
    namespace: "$db"
    bind:
      - var: "$db.npc[*].name"
---
# Body
"#;

    #[test]
    fn test_bindings_from_data_section() {
        let (fm, body) = split_frontmatter(WORLD).unwrap();
        let fm = fm.unwrap();
        assert!(body.starts_with("# Body"));

        let bindings = fm.bindings("world.md").unwrap();
        assert_eq!(bindings.len(), 1);
        let b = &bindings[0];
        assert_eq!(b.document_path, "world.md");
        assert_eq!(b.provider, Provider::Sqlite);
        assert_eq!(b.connection_path, "./data/world.db");
        assert_eq!(b.namespace, "$db");
        assert_eq!(b.bind_config, vec!["$db.npc[*].name".to_string()]);
    }

    #[test]
    fn test_no_frontmatter() {
        let (fm, body) = split_frontmatter("# Just a heading\n").unwrap();
        assert!(fm.is_none());
        assert_eq!(body, "# Just a heading\n");
    }

    #[test]
    fn test_namespace_defaults_to_binding_name() {
        let yaml = "data:\n  lore:\n    provider: notion\n    path: abc123\n";
        let fm = DocFrontmatter::from_yaml(yaml).unwrap();
        let b = &fm.bindings("x.md").unwrap()[0];
        assert_eq!(b.namespace, "$lore");
        assert_eq!(b.provider, Provider::RemoteDocService);
    }

    #[test]
    fn test_duplicate_namespace_rejected() {
        let yaml = "data:\n  a:\n    provider: sqlite\n    path: a.db\n    namespace: $db\n  b:\n    provider: sqlite\n    path: b.db\n    namespace: $db\n";
        let err = DocFrontmatter::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, FrontmatterError::InvalidBinding { .. }));
    }

    #[test]
    fn test_missing_path_rejected() {
        let yaml = "data:\n  db:\n    provider: sqlite\n";
        assert!(DocFrontmatter::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_set_binding_replaces_by_namespace() {
        let (fm, _) = split_frontmatter(WORLD).unwrap();
        let mut fm = fm.unwrap();
        let mut binding = fm.bindings("world.md").unwrap().remove(0);
        binding.connection_path = "./data/other.db".to_string();
        fm.set_binding(&binding).unwrap();

        let bindings = fm.bindings("world.md").unwrap();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].connection_path, "./data/other.db");
        assert_eq!(fm.title(), Some("World"));
    }
}
