//! `remoteJobExecute`: submit a job to any HTTP backend, poll it to a
//! terminal state and collect what it produced.

use super::{client_options, connection_params, duration_param, read_inline_or_file};
use crate::artifact::ArtifactSpec;
use crate::config::ResolvedConfig;
use crate::error::{Error, Result};
use crate::http::{Method, Request};
use crate::job::classifier::parse_path;
use crate::job::{
    Classifier, IdExtractor, JobDescriptor, JsonStateClassifier, PatternClassifier, PollSpec,
    SentinelClassifier, StateTable, StatusUrl, Submission,
};
use crate::pipeline_env::ValueKind;
use crate::runner::{RunContext, Step};
use crate::step::{ParameterSpec, StepSpec};
use regex::Regex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

pub const ID_KEY: &str = "remoteJob.id";
pub const STATE_KEY: &str = "remoteJob.state";

const RUNNING_STATES: &[&str] = &["NEW", "QUEUED", "PENDING", "STARTED", "RUNNING", "IN_PROGRESS"];
const SUCCESS_STATES: &[&str] = &["FINISHED", "SUCCEEDED", "SUCCESS", "COMPLETED"];
const FAILURE_STATES: &[&str] = &["FAILED", "FAILURE", "FAIL", "ERROR"];
const ABORTED_STATES: &[&str] = &["ABORTED", "CANCELLED", "CANCELED"];

pub fn spec() -> StepSpec {
    let mut spec = StepSpec::new(
        "remoteJobExecute",
        "Submit a long-running remote job, poll it until it finishes and download its artifacts",
    )
    .param(ParameterSpec::string("jobName").default_value("remoteJob"))
    // submission
    .param(ParameterSpec::string("submitUrl").mandatory())
    .param(
        ParameterSpec::string("submitMethod")
            .default_value("POST")
            .possible_values(&["POST", "PUT"]),
    )
    .param(ParameterSpec::string("submitBody").describe("Request body, or @file"))
    .param(ParameterSpec::string("submitContentType").default_value("application/json"))
    .param(ParameterSpec::list("headers").describe("Extra `Name: value` headers for every request"))
    // job id
    .param(ParameterSpec::string("jobIdPath").default_value("$.id"))
    .param(ParameterSpec::string("jobIdPattern").describe("Regex; first group is the id"))
    .param(ParameterSpec::string("jobIdHeader"))
    .param(ParameterSpec::bool("jobIdFromBody").default_value(false))
    // status
    .param(ParameterSpec::string("statusUrl").describe("Template; {id} is the job id"))
    .param(ParameterSpec::string("statusUrlHeader").describe("Submit response header holding the status URL"))
    .param(ParameterSpec::string("statusUrlPath").describe("JSONPath into the submit response"))
    .param(ParameterSpec::string("statePath").default_value("$.state"))
    .param(ParameterSpec::string("reasonPath"))
    .param(ParameterSpec::string("statePattern").describe("Regex for non-JSON status bodies"))
    .param(ParameterSpec::string("reasonPattern"))
    .param(ParameterSpec::string("successPattern").describe("Sentinel marking success in plain text"))
    .param(ParameterSpec::string("failurePattern"))
    .param(ParameterSpec::list("runningStates").default_value(RUNNING_STATES.to_vec()))
    .param(ParameterSpec::list("successStates").default_value(SUCCESS_STATES.to_vec()))
    .param(ParameterSpec::list("failureStates").default_value(FAILURE_STATES.to_vec()))
    .param(ParameterSpec::list("abortedStates").default_value(ABORTED_STATES.to_vec()))
    // polling
    .param(ParameterSpec::int("pollIntervalInSeconds").default_value(10))
    .param(ParameterSpec::int("maxRuntimeInMinutes").default_value(360))
    .param(ParameterSpec::int("maxRuntimeInSeconds").describe("Overrides maxRuntimeInMinutes"))
    .param(ParameterSpec::string("errorDetailsUrl").describe("Fetched after a failure; {id} is the job id"))
    .param(
        ParameterSpec::list("artifacts")
            .describe("file=url[|pe=key][|optional][|onFailure]; {id} is the job id"),
    )
    .output(ID_KEY, ValueKind::Text)
    .output(STATE_KEY, ValueKind::Text);
    for param in connection_params() {
        spec = spec.param(param);
    }
    spec
}

pub fn step() -> Step {
    Step::new(spec(), run)
}

fn compile_regex(config: &ResolvedConfig, name: &str) -> Result<Option<Regex>> {
    config
        .str(name)
        .map(|raw| {
            Regex::new(raw).map_err(|e| {
                Error::config_invalid_value(name, None, Some(raw.to_string()), e.to_string())
            })
        })
        .transpose()
}

fn headers(config: &ResolvedConfig) -> Result<Vec<(String, String)>> {
    config
        .list("headers")
        .iter()
        .map(|entry| {
            entry
                .split_once(':')
                .map(|(n, v)| (n.trim().to_string(), v.trim().to_string()))
                .filter(|(n, _)| !n.is_empty())
                .ok_or_else(|| {
                    Error::config_invalid_value("headers", None, Some(entry.clone()), "expected 'Name: value'")
                })
        })
        .collect()
}

fn table(config: &ResolvedConfig) -> StateTable {
    StateTable {
        running: config.list("runningStates"),
        success: config.list("successStates"),
        failure: config.list("failureStates"),
        aborted: config.list("abortedStates"),
    }
}

fn classifier(config: &ResolvedConfig) -> Result<Arc<dyn Classifier>> {
    if let Some(success) = compile_regex(config, "successPattern")? {
        return Ok(Arc::new(SentinelClassifier::new(
            success,
            compile_regex(config, "failurePattern")?,
        )));
    }
    if let Some(state) = compile_regex(config, "statePattern")? {
        return Ok(Arc::new(PatternClassifier::new(
            state,
            compile_regex(config, "reasonPattern")?,
            table(config),
        )));
    }
    let state = parse_path(config.str("statePath").unwrap_or("$.state"), "statePath")?;
    let reason = config
        .str("reasonPath")
        .map(|p| parse_path(p, "reasonPath"))
        .transpose()?;
    Ok(Arc::new(JsonStateClassifier::new(state, reason, table(config))))
}

fn id_extractor(config: &ResolvedConfig) -> Result<IdExtractor> {
    if let Some(header) = config.string("jobIdHeader") {
        return Ok(IdExtractor::Header(header));
    }
    if let Some(pattern) = compile_regex(config, "jobIdPattern")? {
        return Ok(IdExtractor::Pattern(pattern));
    }
    if config.bool("jobIdFromBody") {
        return Ok(IdExtractor::Body);
    }
    Ok(IdExtractor::JsonPath(parse_path(
        config.str("jobIdPath").unwrap_or("$.id"),
        "jobIdPath",
    )?))
}

fn status_url(config: &ResolvedConfig) -> Result<StatusUrl> {
    if let Some(header) = config.string("statusUrlHeader") {
        return Ok(StatusUrl::Header(header));
    }
    if let Some(path) = config.str("statusUrlPath") {
        return Ok(StatusUrl::JsonPath(parse_path(path, "statusUrlPath")?));
    }
    match config.string("statusUrl") {
        Some(template) => Ok(StatusUrl::Template(template)),
        None => Err(Error::config_missing_parameter("statusUrl")
            .with_hint("Set statusUrl, statusUrlHeader or statusUrlPath")),
    }
}

fn max_runtime(config: &ResolvedConfig) -> Result<Duration> {
    if let Some(runtime) = duration_param(config, "maxRuntimeInSeconds", Duration::from_secs(1))? {
        return Ok(runtime);
    }
    Ok(duration_param(config, "maxRuntimeInMinutes", Duration::from_secs(60))?
        .unwrap_or(Duration::from_secs(360 * 60)))
}

/// Build the job descriptor from the resolved parameters.
pub fn descriptor(config: &ResolvedConfig) -> Result<JobDescriptor> {
    let headers = headers(config)?;
    let method = match config.str("submitMethod").unwrap_or("POST") {
        "PUT" => Method::PUT,
        _ => Method::POST,
    };

    let mut request = Request::new(method, config.require_str("submitUrl")?);
    for (name, value) in &headers {
        request.set_header(name, value.as_str());
    }
    if let Some(body) = config.str("submitBody") {
        let body = read_inline_or_file(body, "submitBody")?;
        request = request
            .header(
                "Content-Type",
                config.str("submitContentType").unwrap_or("application/json"),
            )
            .body(body);
    }

    let artifacts = config
        .list("artifacts")
        .iter()
        .map(|entry| ArtifactSpec::parse(entry))
        .collect::<Result<Vec<_>>>()?;

    Ok(JobDescriptor {
        name: config.str("jobName").unwrap_or("remoteJob").to_string(),
        submission: Submission {
            request,
            id: id_extractor(config)?,
            status_url: status_url(config)?,
        },
        poll: PollSpec {
            interval: duration_param(config, "pollIntervalInSeconds", Duration::from_secs(1))?
                .unwrap_or(Duration::from_secs(10)),
            max_runtime: max_runtime(config)?,
            headers,
        },
        classifier: classifier(config)?,
        error_details_url: config.string("errorDetailsUrl"),
        artifacts,
    })
}

fn run(ctx: &RunContext) -> Result<Value> {
    let descriptor = descriptor(&ctx.config)?;
    let http = ctx.http_client(client_options(&ctx.config)?)?;

    let result = ctx.job_driver(http.clone()).drive(&descriptor)?;
    ctx.publish(ID_KEY, result.id())?;
    ctx.publish(STATE_KEY, result.state().name())?;
    ctx.telemetry.add_custom("jobState", result.state().name());
    ctx.telemetry
        .add_custom("jobDurationMillis", result.elapsed().as_millis().to_string());

    let sink = ctx.artifact_sink(http);
    let artifacts = sink.collect(&result, &descriptor.artifacts)?;
    sink.register(&ctx.pe, &descriptor.artifacts, &artifacts)?;

    let result = result.into_result()?;
    Ok(json!({
        "jobId": result.id(),
        "state": result.state().name(),
        "elapsedMillis": result.elapsed().as_millis() as u64,
        "attempts": result.handle.attempts,
        "artifacts": artifacts,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Outcome;
    use std::collections::{BTreeMap, BTreeSet};

    fn config(overrides: Value) -> ResolvedConfig {
        let mut values: BTreeMap<String, Value> = BTreeMap::new();
        for param in &spec().params {
            if let Some(default) = &param.default {
                values.insert(param.name.clone(), default.clone());
            }
        }
        for (k, v) in overrides.as_object().unwrap() {
            values.insert(k.clone(), v.clone());
        }
        ResolvedConfig {
            step: "remoteJobExecute".to_string(),
            values,
            sources: BTreeMap::new(),
            secret_names: BTreeSet::new(),
        }
    }

    #[test]
    fn defaults_build_a_json_descriptor() {
        let d = descriptor(&config(json!({
            "submitUrl": "https://ci/jobs",
            "statusUrl": "https://ci/jobs/{id}",
            "submitBody": "{\"k\":1}",
            "headers": ["Accept: application/json"]
        })))
        .unwrap();
        assert_eq!(d.poll.interval, Duration::from_secs(10));
        assert_eq!(d.poll.max_runtime, Duration::from_secs(360 * 60));
        assert_eq!(d.submission.request.header_value("Content-Type"), Some("application/json"));
        assert_eq!(d.submission.request.header_value("Accept"), Some("application/json"));
        assert_eq!(d.classifier.classify(r#"{"state":"queued"}"#).unwrap(), Outcome::Running);
        assert_eq!(d.classifier.classify(r#"{"state":"FINISHED"}"#).unwrap(), Outcome::Succeeded);
    }

    #[test]
    fn seconds_override_minutes() {
        let d = descriptor(&config(json!({
            "submitUrl": "https://ci/jobs",
            "statusUrl": "https://ci/jobs/{id}",
            "maxRuntimeInSeconds": 3
        })))
        .unwrap();
        assert_eq!(d.poll.max_runtime, Duration::from_secs(3));
    }

    #[test]
    fn sentinel_patterns_take_precedence() {
        let d = descriptor(&config(json!({
            "submitUrl": "https://ci/jobs",
            "statusUrl": "https://ci/jobs/{id}/log",
            "successPattern": "BUILD SUCCESSFUL",
            "failurePattern": "BUILD FAILED.*"
        })))
        .unwrap();
        assert_eq!(d.classifier.classify("compiling...").unwrap(), Outcome::Running);
        assert_eq!(
            d.classifier.classify("x\nBUILD FAILED in 3s\n").unwrap(),
            Outcome::Failed("BUILD FAILED in 3s".to_string())
        );
    }

    #[test]
    fn missing_status_location_is_a_config_error() {
        let err = descriptor(&config(json!({ "submitUrl": "https://ci/jobs" }))).unwrap_err();
        assert_eq!(err.code.kind(), "ConfigError");
    }

    #[test]
    fn invalid_values_are_rejected() {
        let base = json!({ "submitUrl": "https://ci/jobs", "statusUrl": "https://ci/{id}" });
        let mut bad_interval = base.clone();
        bad_interval["pollIntervalInSeconds"] = json!(0);
        assert!(descriptor(&config(bad_interval)).is_err());

        let mut bad_regex = base.clone();
        bad_regex["statePattern"] = json!("(unclosed");
        assert!(descriptor(&config(bad_regex)).is_err());

        let mut bad_artifact = base;
        bad_artifact["artifacts"] = json!(["../x=https://ci/x"]);
        assert!(descriptor(&config(bad_artifact)).is_err());
    }

    #[test]
    fn runtimes_beyond_the_clock_are_config_errors() {
        let base = json!({ "submitUrl": "https://ci/jobs", "statusUrl": "https://ci/{id}" });
        for (name, value) in [
            ("maxRuntimeInSeconds", i64::MAX),
            ("maxRuntimeInMinutes", i64::MAX / 2),
            ("maxRuntimeInMinutes", 1_000_000),
            ("pollIntervalInSeconds", i64::MAX),
        ] {
            let mut values = base.clone();
            values[name] = json!(value);
            let err = descriptor(&config(values)).unwrap_err();
            assert_eq!(err.code.kind(), "ConfigError", "{}={}", name, value);
            assert_eq!(err.details["parameter"], name);
        }
    }
}
