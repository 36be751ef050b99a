//! Strict type coercion of raw layer values into a parameter's declared type.

use crate::error::{Error, Result};
use crate::step::{ParamType, ParameterSpec};
use serde_json::Value;

/// Coerce a raw value. `split_lists` enables comma splitting of plain
/// strings for list parameters (used for environment variables).
pub fn coerce(param: &ParameterSpec, raw: &Value, layer: &str, split_lists: bool) -> Result<Value> {
    let invalid = |problem: &str| {
        Error::config_invalid_value(
            &param.name,
            Some(layer.to_string()),
            Some(display(raw)),
            problem,
        )
    };

    match param.kind {
        ParamType::String => match raw {
            Value::String(_) => Ok(raw.clone()),
            Value::Number(n) => Ok(Value::String(n.to_string())),
            Value::Bool(b) => Ok(Value::String(b.to_string())),
            _ => Err(invalid("expected a string")),
        },
        ParamType::Int => match raw {
            Value::Number(n) => n
                .as_i64()
                .map(Value::from)
                .ok_or_else(|| invalid("expected an integer")),
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| invalid("expected an integer")),
            _ => Err(invalid("expected an integer")),
        },
        ParamType::Bool => match raw {
            Value::Bool(_) => Ok(raw.clone()),
            Value::String(s) => match s.trim() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(invalid("expected 'true' or 'false'")),
            },
            _ => Err(invalid("expected a boolean")),
        },
        ParamType::StringList => match raw {
            Value::Array(items) => items
                .iter()
                .map(|item| match item {
                    Value::String(_) => Ok(item.clone()),
                    Value::Number(n) => Ok(Value::String(n.to_string())),
                    Value::Bool(b) => Ok(Value::String(b.to_string())),
                    _ => Err(invalid("expected a list of strings")),
                })
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            Value::String(s) if split_lists => Ok(Value::Array(
                s.split(',')
                    .map(str::trim)
                    .filter(|part| !part.is_empty())
                    .map(|part| Value::String(part.to_string()))
                    .collect(),
            )),
            Value::String(_) => Ok(Value::Array(vec![raw.clone()])),
            Value::Number(n) => Ok(Value::Array(vec![Value::String(n.to_string())])),
            _ => Err(invalid("expected a list of strings")),
        },
    }
}

/// Check `possibleValues` membership. Lists are checked element-wise.
pub fn check_possible_values(param: &ParameterSpec, value: &Value, layer: &str) -> Result<()> {
    let Some(allowed) = &param.possible_values else {
        return Ok(());
    };
    let candidates: Vec<&Value> = match value {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    };
    for candidate in candidates {
        if !allowed.contains(candidate) {
            let allowed_list: Vec<String> = allowed.iter().map(display).collect();
            return Err(Error::config_invalid_value(
                &param.name,
                Some(layer.to_string()),
                Some(display(candidate)),
                format!("value not allowed, expected one of: {}", allowed_list.join(", ")),
            ));
        }
    }
    Ok(())
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ints_parse_strictly() {
        let p = ParameterSpec::int("maxRuntimeInMinutes");
        assert_eq!(coerce(&p, &json!("60"), "CLI flags", false).unwrap(), json!(60));
        assert_eq!(coerce(&p, &json!(240), "custom config", false).unwrap(), json!(240));
        let err = coerce(&p, &json!("60m"), "CLI flags", false).unwrap_err();
        assert!(err.message.contains("maxRuntimeInMinutes"));
        assert!(err.message.contains("CLI flags"));
        assert!(coerce(&p, &json!(1.5), "custom config", false).is_err());
    }

    #[test]
    fn bools_accept_only_true_and_false() {
        let p = ParameterSpec::bool("verbose");
        assert_eq!(coerce(&p, &json!("true"), "env", false).unwrap(), json!(true));
        assert_eq!(coerce(&p, &json!(false), "file", false).unwrap(), json!(false));
        assert!(coerce(&p, &json!("yes"), "env", false).is_err());
        assert!(coerce(&p, &json!("1"), "env", false).is_err());
    }

    #[test]
    fn lists_from_env_split_on_commas() {
        let p = ParameterSpec::list("runningStates");
        assert_eq!(
            coerce(&p, &json!("RUNNING, QUEUED"), "environment", true).unwrap(),
            json!(["RUNNING", "QUEUED"])
        );
        assert_eq!(
            coerce(&p, &json!("a,b"), "CLI flags", false).unwrap(),
            json!(["a,b"])
        );
    }

    #[test]
    fn possible_values_are_enforced() {
        let p = ParameterSpec::string("submitMethod").possible_values(&["POST", "PUT"]);
        assert!(check_possible_values(&p, &json!("POST"), "default").is_ok());
        let err = check_possible_values(&p, &json!("GET"), "CLI flags").unwrap_err();
        assert!(err.message.contains("submitMethod"));
        assert!(err.message.contains("POST, PUT"));
    }
}
