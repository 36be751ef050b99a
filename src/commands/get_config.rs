use crate::error::{Error, Result};
use crate::runner::{RunContext, Step};
use crate::secrets::REDACTION_MARKER;
use crate::step::{ParameterSpec, StepSpec};
use serde_json::{json, Value};

pub fn step() -> Step {
    Step::new(
        StepSpec::new(
            "getConfig",
            "Resolve and print the configuration of another step",
        )
        .param(
            ParameterSpec::string("stepName")
                .mandatory()
                .describe("Step whose configuration is resolved"),
        ),
        run,
    )
}

fn run(ctx: &RunContext) -> Result<Value> {
    let name = ctx.config.require_str("stepName")?;
    let target = super::find(name).ok_or_else(|| {
        Error::config_invalid_value("stepName", None, Some(name.to_string()), "unknown step")
            .with_hint(format!(
                "Known steps: {}",
                super::all()
                    .iter()
                    .map(|s| s.name().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))
    })?;

    let resolved = ctx.resolve(&target.spec)?;
    let values: serde_json::Map<String, Value> = resolved
        .values
        .iter()
        .map(|(k, v)| {
            let shown = if resolved.secret_names.contains(k) && !v.is_null() {
                Value::String(REDACTION_MARKER.to_string())
            } else {
                v.clone()
            };
            (k.clone(), shown)
        })
        .collect();

    tracing::debug!(step = %resolved.step, parameters = values.len(), "configuration resolved");
    Ok(json!({
        "step": resolved.step,
        "values": values,
        "sources": resolved.sources,
    }))
}
