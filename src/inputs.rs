//! Resolution of templated configuration inputs into concrete strings,
//! plus the argument-list and key/value-map builders used for launches.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{McpError, Result};

/// A templated input value: a literal or default string, optionally
/// containing `{variable}` placeholders filled from declared variables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default)]
    pub is_required: bool,
    #[serde(default)]
    pub variables: HashMap<String, VariableSpec>,
}

/// A named sub-variable of an input template
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VariableSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default)]
    pub is_required: bool,
}

/// A launch-argument spec from declarative package metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArgumentSpec {
    #[serde(rename = "type")]
    pub kind: ArgumentKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub input: InputSpec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgumentKind {
    Positional,
    Named,
}

/// A named value spec (environment variables, header-like inputs)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyValueSpec {
    pub name: String,
    #[serde(flatten)]
    pub input: InputSpec,
}

/// Resolve an input into its concrete string.
///
/// Starts from `value` falling back to `default`; `Ok(None)` when neither is
/// present (absence is not an error here, callers decide). Each declared
/// variable resolves the same way and substitutes every literal `{name}`
/// occurrence, first level only. A required variable that resolves to
/// nothing fails. Placeholders with no declared variable pass through
/// untouched.
pub fn resolve_input(input: &InputSpec) -> Result<Option<String>> {
    let template = input.value.clone().or_else(|| input.default.clone());
    let Some(mut resolved) = template else {
        return Ok(None);
    };

    for (name, variable) in &input.variables {
        let value = variable.value.clone().or_else(|| variable.default.clone());
        match value {
            Some(value) => {
                resolved = resolved.replace(&format!("{{{}}}", name), &value);
            }
            None if variable.is_required => {
                return Err(McpError::MissingRequiredVariable(name.clone()));
            }
            None => {}
        }
    }

    Ok(Some(resolved))
}

/// Build the positional/named argument list for a launch.
///
/// `overrides` supplies externally provided values keyed by position index;
/// an override is used verbatim, everything else resolves through
/// [`resolve_input`]. Named arguments render as `name=value`, positional
/// arguments as the bare value. Unresolved optional arguments are omitted,
/// unresolved required ones fail. Output order follows spec order.
pub fn build_argument_list(
    specs: &[ArgumentSpec],
    overrides: &HashMap<usize, String>,
) -> Result<Vec<String>> {
    let mut args = Vec::new();

    for (position, spec) in specs.iter().enumerate() {
        let value = match overrides.get(&position) {
            Some(value) => Some(value.clone()),
            None => resolve_input(&spec.input)?,
        };

        match value {
            Some(value) => match spec.kind {
                ArgumentKind::Named => {
                    let name = spec.name.as_deref().unwrap_or_default();
                    args.push(format!("{}={}", name, value));
                }
                ArgumentKind::Positional => args.push(value),
            },
            None if spec.input.is_required => {
                return Err(McpError::MissingRequiredArgument(describe_argument(
                    spec, position,
                )));
            }
            None => {}
        }
    }

    Ok(args)
}

fn describe_argument(spec: &ArgumentSpec, position: usize) -> String {
    match &spec.name {
        Some(name) => format!("named argument '{}' (position {})", name, position),
        None => format!("positional argument at position {}", position),
    }
}

/// Build a flat string-to-string map from named value specs.
///
/// Same resolution rule as [`build_argument_list`] but keyed by name;
/// used for environment variables and header-like inputs.
pub fn build_value_map(
    specs: &[KeyValueSpec],
    overrides: &HashMap<String, String>,
) -> Result<HashMap<String, String>> {
    let mut map = HashMap::new();

    for spec in specs {
        let value = match overrides.get(&spec.name) {
            Some(value) => Some(value.clone()),
            None => resolve_input(&spec.input)?,
        };

        match value {
            Some(value) => {
                map.insert(spec.name.clone(), value);
            }
            None if spec.input.is_required => {
                return Err(McpError::MissingRequiredValue(spec.name.clone()));
            }
            None => {}
        }
    }

    Ok(map)
}
