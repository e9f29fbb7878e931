//! Environment templating.
//!
//! Environment definitions are JSON values whose strings may reference other
//! variables as `{KEY}`, or reach into a structured variable with
//! `{KEY[0][subkey]}`. A string consisting of exactly one placeholder is
//! replaced by the referenced value itself, so maps and lists survive;
//! placeholders embedded in text are rendered as text.

use std::collections::{BTreeMap, HashMap};

use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Maximum nesting of maps and lists a definition may have.
pub const MAX_DEPTH: usize = 16;

lazy_static! {
    static ref PLACEHOLDER: Regex =
        Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)((?:\[[^\[\]{}]+\])*)\}").unwrap();
    static ref INDEX: Regex = Regex::new(r"\[([^\[\]]+)\]").unwrap();
}

/// When a definition is resolved relative to the predefined variables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvStage {
    /// Against the raw hook environment, before predefined variables exist.
    Before,
    #[default]
    After,
}

/// A definition with an explicit stage, written as `{value, stage}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StagedValue {
    pub value: Value,
    #[serde(default)]
    pub stage: EnvStage,
}

/// Variants are tried in order. A map is only taken as staged when it has a
/// `value` key and nothing besides `stage`; every other value is plain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvDefinition {
    Staged(StagedValue),
    Plain(Value),
}

impl EnvDefinition {
    pub fn staged(value: Value, stage: EnvStage) -> Self {
        EnvDefinition::Staged(StagedValue { value, stage })
    }

    pub fn value(&self) -> &Value {
        match self {
            EnvDefinition::Staged(staged) => &staged.value,
            EnvDefinition::Plain(value) => value,
        }
    }

    pub fn stage(&self) -> EnvStage {
        match self {
            EnvDefinition::Staged(staged) => staged.stage,
            EnvDefinition::Plain(_) => EnvStage::After,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateWarning {
    #[error("variable `{variable}` references `{placeholder}`, which is not defined")]
    Unresolved {
        variable: String,
        placeholder: String,
    },
    #[error("variable `{variable}` cannot index into `{placeholder}`")]
    NotIndexable {
        variable: String,
        placeholder: String,
    },
    #[error("variable `{variable}` is nested deeper than {MAX_DEPTH} levels")]
    TooDeep { variable: String },
}

impl TemplateWarning {
    pub fn variable(&self) -> &str {
        match self {
            TemplateWarning::Unresolved { variable, .. }
            | TemplateWarning::NotIndexable { variable, .. }
            | TemplateWarning::TooDeep { variable } => variable,
        }
    }
}

enum Failure {
    Unresolved(String),
    NotIndexable(String),
    TooDeep,
}

impl Failure {
    fn into_warning(self, variable: &str) -> TemplateWarning {
        let variable = variable.to_string();
        match self {
            Failure::Unresolved(placeholder) => TemplateWarning::Unresolved {
                variable,
                placeholder,
            },
            Failure::NotIndexable(placeholder) => TemplateWarning::NotIndexable {
                variable,
                placeholder,
            },
            Failure::TooDeep => TemplateWarning::TooDeep { variable },
        }
    }
}

/// Look up `KEY[a][0]` in the environment. Values holding JSON text can be
/// indexed into.
fn lookup(env: &HashMap<String, String>, key: &str, path: &str, placeholder: &str) -> Result<Value, Failure> {
    let raw = env
        .get(key)
        .ok_or_else(|| Failure::Unresolved(placeholder.to_string()))?;
    if path.is_empty() {
        return Ok(Value::String(raw.clone()));
    }

    let mut current: Value = serde_json::from_str(raw)
        .map_err(|_| Failure::NotIndexable(placeholder.to_string()))?;
    for index in INDEX.captures_iter(path) {
        let segment = &index[1];
        let next = match &current {
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            Value::Object(map) => map.get(segment),
            _ => return Err(Failure::NotIndexable(placeholder.to_string())),
        };
        current = next
            .cloned()
            .ok_or_else(|| Failure::Unresolved(placeholder.to_string()))?;
    }
    Ok(current)
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn resolve_str(template: &str, env: &HashMap<String, String>) -> Result<Value, Failure> {
    if let Some(caps) = PLACEHOLDER.captures(template) {
        let whole = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
        if whole.len() == template.len() {
            return lookup(env, &caps[1], &caps[2], whole);
        }
    }

    let mut failure = None;
    let rendered = PLACEHOLDER.replace_all(template, |caps: &Captures| {
        match lookup(env, &caps[1], &caps[2], &caps[0]) {
            Ok(value) => as_text(&value),
            Err(e) => {
                if failure.is_none() {
                    failure = Some(e);
                }
                String::new()
            }
        }
    });
    match failure {
        Some(e) => Err(e),
        None => Ok(Value::String(rendered.into_owned())),
    }
}

fn resolve_value(value: &Value, env: &HashMap<String, String>, depth: usize) -> Result<Value, Failure> {
    if depth > MAX_DEPTH {
        return Err(Failure::TooDeep);
    }
    match value {
        Value::String(s) => resolve_str(s, env),
        Value::Array(items) => items
            .iter()
            .map(|item| resolve_value(item, env, depth + 1))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| Ok((k.clone(), resolve_value(v, env, depth + 1)?)))
            .collect::<Result<serde_json::Map<_, _>, _>>()
            .map(Value::Object),
        scalar => Ok(scalar.clone()),
    }
}

/// Resolve a single value against the environment.
pub fn resolve(variable: &str, value: &Value, env: &HashMap<String, String>) -> Result<Value, TemplateWarning> {
    resolve_value(value, env, 0).map_err(|e| e.into_warning(variable))
}

/// Render a plain string template, e.g. a redirect URL.
pub fn render(variable: &str, template: &str, env: &HashMap<String, String>) -> Result<String, TemplateWarning> {
    resolve(variable, &Value::String(template.to_string()), env).map(|v| as_text(&v))
}

/// Resolve every definition of `stage` against `env`. Variables that cannot
/// be resolved are left out and reported.
pub fn resolve_definitions(
    definitions: &BTreeMap<String, EnvDefinition>,
    stage: EnvStage,
    env: &HashMap<String, String>,
) -> (HashMap<String, String>, Vec<TemplateWarning>) {
    let mut resolved = HashMap::new();
    let mut warnings = vec![];
    for (name, definition) in definitions.iter().filter(|(_, d)| d.stage() == stage) {
        match resolve(name, definition.value(), env) {
            Ok(value) => {
                resolved.insert(name.clone(), as_text(&value));
            }
            Err(warning) => {
                log::warn!("dropping environment variable: {warning}");
                warnings.push(warning);
            }
        }
    }
    (resolved, warnings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_definition_shapes() {
        let parse = |yaml: &str| serde_yaml::from_str::<EnvDefinition>(yaml).unwrap();

        let staged = parse("{value: '{RKW_SESSION_ID}', stage: before}");
        assert_eq!(staged.stage(), EnvStage::Before);
        assert_eq!(staged.value(), &json!("{RKW_SESSION_ID}"));
        assert_eq!(parse("{value: 1}"), EnvDefinition::staged(json!(1), EnvStage::After));

        // an unknown key keeps the whole map as a plain value
        let plain = parse("{value: a, stag: before}");
        assert_eq!(plain, EnvDefinition::Plain(json!({"value": "a", "stag": "before"})));
        assert_eq!(plain.stage(), EnvStage::After);
        assert_eq!(parse("text"), EnvDefinition::Plain(json!("text")));
    }

    fn env() -> HashMap<String, String> {
        HashMap::from([
            ("RKW_SESSION_ID".to_string(), "abc".to_string()),
            ("HOST".to_string(), "example.com".to_string()),
            (
                "MODELS".to_string(),
                json!([{"path": "/models/a", "revision": "main"}]).to_string(),
            ),
        ])
    }

    #[test]
    fn test_embedded_placeholders_render_as_text() {
        let value = resolve("URL", &json!("https://{HOST}/session/{RKW_SESSION_ID}"), &env()).unwrap();
        assert_eq!(value, json!("https://example.com/session/abc"));
    }

    #[test]
    fn test_whole_placeholder_keeps_structure() {
        let value = resolve("FIRST", &json!("{MODELS[0]}"), &env()).unwrap();
        assert_eq!(value, json!({"path": "/models/a", "revision": "main"}));

        let value = resolve("PATH", &json!("{MODELS[0][path]}"), &env()).unwrap();
        assert_eq!(value, json!("/models/a"));
    }

    #[test]
    fn test_nested_trees_are_walked() {
        let value = resolve(
            "CFG",
            &json!({"session": "{RKW_SESSION_ID}", "ports": [3389, "{HOST}"], "debug": true}),
            &env(),
        )
        .unwrap();
        assert_eq!(
            value,
            json!({"session": "abc", "ports": [3389, "example.com"], "debug": true})
        );
    }

    #[test]
    fn test_unresolved_and_unindexable_references() {
        let err = resolve("X", &json!("{MISSING}"), &env()).unwrap_err();
        assert_eq!(
            err,
            TemplateWarning::Unresolved {
                variable: "X".to_string(),
                placeholder: "{MISSING}".to_string()
            }
        );
        assert!(matches!(
            resolve("X", &json!("{HOST[0]}"), &env()).unwrap_err(),
            TemplateWarning::NotIndexable { .. }
        ));
        assert!(matches!(
            resolve("X", &json!("{MODELS[3]}"), &env()).unwrap_err(),
            TemplateWarning::Unresolved { .. }
        ));
    }

    #[test]
    fn test_depth_is_bounded() {
        let mut value = json!("leaf");
        for _ in 0..=MAX_DEPTH {
            value = json!([value]);
        }
        assert_eq!(
            resolve("DEEP", &value, &env()).unwrap_err(),
            TemplateWarning::TooDeep {
                variable: "DEEP".to_string()
            }
        );
    }

    #[test]
    fn test_definitions_by_stage() {
        let definitions: BTreeMap<String, EnvDefinition> = serde_yaml::from_str(
            r#"
PLAIN: "{HOST}"
EARLY:
  value: "{HOST}:1"
  stage: before
LATE:
  value: "{NOT_YET}"
NUMBER: 8080
"#,
        )
        .unwrap();

        let (before, warnings) = resolve_definitions(&definitions, EnvStage::Before, &env());
        assert_eq!(before, HashMap::from([("EARLY".to_string(), "example.com:1".to_string())]));
        assert!(warnings.is_empty());

        let (after, warnings) = resolve_definitions(&definitions, EnvStage::After, &env());
        assert_eq!(after["PLAIN"], "example.com");
        assert_eq!(after["NUMBER"], "8080");
        assert!(!after.contains_key("LATE"));
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].variable(), "LATE");
    }

    #[test]
    fn test_render_text() {
        assert_eq!(
            render("redirect", "{HOST}/session/{RKW_SESSION_ID}/", &env()).unwrap(),
            "example.com/session/abc/"
        );
    }
}
