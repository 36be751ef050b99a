//! Direct access to the pipeline environment for scripts between steps.

use super::{read_inline_or_file, read_stdin};
use crate::error::{Error, Result};
use crate::pipeline_env::{validate_key, EnvValue};
use crate::runner::{RunContext, Step};
use crate::step::{ParameterSpec, StepSpec};
use serde_json::{json, Map, Value};

pub fn read_step() -> Step {
    Step::new(
        StepSpec::new("readPipelineEnv", "Print the pipeline environment as one JSON object"),
        read,
    )
}

pub fn write_step() -> Step {
    Step::new(
        StepSpec::new(
            "writePipelineEnv",
            "Write a JSON object (from --value or stdin) into the pipeline environment",
        )
        .param(
            ParameterSpec::string("value")
                .describe("JSON object, or @file; stdin when omitted"),
        ),
        write,
    )
}

fn read(ctx: &RunContext) -> Result<Value> {
    Ok(Value::Object(ctx.pe.load_all()?))
}

/// Parse the object to write. Keys may use `/` or `.` as separator.
fn parse_entries(raw: &str) -> Result<Vec<(String, EnvValue)>> {
    let parsed: Value = serde_json::from_str(raw)
        .map_err(|e| Error::validation_invalid_argument("value", format!("invalid JSON: {}", e)))?;
    let Value::Object(object) = parsed else {
        return Err(Error::validation_invalid_argument(
            "value",
            "expected a JSON object of key/value pairs",
        ));
    };

    let mut entries = Vec::with_capacity(object.len());
    for (key, value) in object {
        let key = key.trim_matches('/').replace('/', ".");
        validate_key(&key)?;
        let value = match value {
            Value::String(text) => EnvValue::Text(text),
            other => EnvValue::Json(other),
        };
        entries.push((key, value));
    }
    Ok(entries)
}

fn write(ctx: &RunContext) -> Result<Value> {
    let raw = match ctx.config.str("value") {
        Some(value) => read_inline_or_file(value, "value")?,
        None => read_stdin("value")?,
    };
    let entries = parse_entries(&raw)?;

    let mut written = Map::new();
    for (key, value) in entries {
        written.insert(key.clone(), json!(value.kind()));
        ctx.pe.write(&key, value)?;
    }
    tracing::info!(keys = written.len(), "pipeline environment updated");
    Ok(json!({ "written": written }))
}
