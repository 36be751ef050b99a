mod support;

use pipestep::error::ErrorCategory;
use pipestep::http::scripted::Reply;
use pipestep::pipeline_env::{EnvValue, PipelineEnv};
use serde_json::{json, Value};
use support::Harness;

const SUBMIT: &str = "https://ci.example/jobs";
const STATUS: &str = "https://ci.example/jobs/J1";
const LOGS: &str = "https://ci.example/jobs/J1/logs";

fn job_flags(extra: Value) -> Value {
    let mut flags = json!({
        "submitUrl": SUBMIT,
        "submitBody": "{\"pipeline\":\"nightly\"}",
        "statusUrl": "https://ci.example/jobs/{id}",
        "pollIntervalInSeconds": 1,
        "maxRuntimeInSeconds": 10,
        "maxRetries": -1
    });
    for (k, v) in extra.as_object().unwrap() {
        flags[k] = v.clone();
    }
    flags
}

#[test]
fn long_job_succeeds_and_publishes_its_artifact() {
    let harness = Harness::new();
    let t = &harness.transport;
    t.push("POST", SUBMIT, Reply::ok_json(json!({"id": "J1"})));
    t.push("GET", STATUS, Reply::ok_json(json!({"state": "RUNNING"})));
    t.push("GET", STATUS, Reply::ok_json(json!({"state": "RUNNING"})));
    t.push("GET", STATUS, Reply::ok_json(json!({"state": "FINISHED"})));
    t.push("GET", LOGS, Reply::status(200).body(b"PK\x03\x04logs".to_vec()));

    let outcome = harness.run(
        "remoteJobExecute",
        job_flags(json!({
            "artifacts": ["logs.zip=https://ci.example/jobs/{id}/logs|pe=build.logs"]
        })),
    );

    assert!(outcome.success(), "{:?}", outcome.diagnostic);
    let output = outcome.output.unwrap();
    assert_eq!(output["state"], json!("SUCCEEDED"));
    assert_eq!(output["attempts"], json!(3));
    assert!(output["elapsedMillis"].as_u64().unwrap() >= 3000);

    let logs = harness.root().join("out").join("logs.zip");
    assert_eq!(std::fs::read(&logs).unwrap(), b"PK\x03\x04logs");

    let pe = PipelineEnv::open(&harness.root());
    assert_eq!(
        pe.read("build.logs").unwrap(),
        Some(EnvValue::Text(logs.display().to_string()))
    );
    assert_eq!(
        pe.read("remoteJob.state").unwrap(),
        Some(EnvValue::Text("SUCCEEDED".to_string()))
    );

    // No poll before the first full interval.
    let timed = t.timed_requests();
    let submitted = timed[0].0;
    let first_poll = timed.iter().find(|(_, r)| r.url == STATUS).unwrap().0;
    assert!(first_poll.duration_since(submitted).as_millis() >= 900);
}

#[test]
fn long_job_times_out_with_service_category() {
    let harness = Harness::new();
    let t = &harness.transport;
    t.push("POST", SUBMIT, Reply::ok_json(json!({"id": "J1"})));
    t.push("GET", STATUS, Reply::ok_json(json!({"state": "RUNNING"})).repeat());

    let outcome = harness.run("remoteJobExecute", job_flags(json!({"maxRuntimeInSeconds": 2})));

    assert_eq!(outcome.exit_code, 1);
    let err = outcome.error.as_ref().unwrap();
    assert_eq!(err.code.kind(), "JobTimedOut");
    assert_eq!(err.category(), ErrorCategory::Service);
    assert_eq!(outcome.telemetry.error_category, ErrorCategory::Service);
    assert!(outcome
        .diagnostic
        .as_deref()
        .unwrap()
        .starts_with("remoteJobExecute: JobTimedOut [service]"));
    assert!(err.details["elapsedMillis"].as_u64().unwrap() >= 2000);

    let pe = PipelineEnv::open(&harness.root());
    assert_eq!(
        pe.read("remoteJob.state").unwrap(),
        Some(EnvValue::Text("TIMED_OUT".to_string()))
    );
}

#[test]
fn failed_job_reports_backend_reason_and_details() {
    let harness = Harness::new();
    let t = &harness.transport;
    t.push("POST", SUBMIT, Reply::ok_json(json!({"id": "J1"})));
    t.push(
        "GET",
        STATUS,
        Reply::ok_json(json!({"state": "FAILED", "message": "unit tests failed"})),
    );
    t.push("GET", "https://ci.example/jobs/J1/console", Reply::status(200).body("3 tests failed"));
    t.push("GET", LOGS, Reply::status(200).body("log"));

    let outcome = harness.run(
        "remoteJobExecute",
        job_flags(json!({
            "reasonPath": "$.message",
            "errorDetailsUrl": "https://ci.example/jobs/{id}/console",
            "artifacts": [
                "logs.txt=https://ci.example/jobs/{id}/logs|onFailure",
                "app.jar=https://ci.example/jobs/{id}/app.jar"
            ]
        })),
    );

    assert_eq!(outcome.exit_code, 1);
    let err = outcome.error.unwrap();
    assert_eq!(err.code.kind(), "JobFailed");
    assert_eq!(err.details["reason"], json!("unit tests failed"));
    assert_eq!(err.details["errorDetails"], json!("3 tests failed"));
    assert!(harness.root().join("out/logs.txt").is_file());
    assert!(!harness.root().join("out/app.jar").exists());
}

#[test]
fn csrf_token_is_fetched_before_the_submit() {
    let harness = Harness::new();
    let t = &harness.transport;
    t.push(
        "HEAD",
        "https://ci.example/api/",
        Reply::status(200).header("X-Csrf-Token", "abc"),
    );
    t.push("POST", SUBMIT, Reply::ok_json(json!({"id": "J1"})));
    t.push("GET", STATUS, Reply::ok_json(json!({"state": "FINISHED"})));

    let outcome = harness.run(
        "remoteJobExecute",
        job_flags(json!({"csrfUrl": "https://ci.example/api/"})),
    );
    assert!(outcome.success(), "{:?}", outcome.diagnostic);

    let requests = t.requests();
    assert_eq!(requests[0].method.as_str(), "HEAD");
    assert_eq!(requests[0].header_value("X-Csrf-Token"), Some("fetch"));
    assert_eq!(requests[1].method.as_str(), "POST");
    assert_eq!(requests[1].header_value("X-Csrf-Token"), Some("abc"));
    // Polls are reads and carry no token.
    assert_eq!(requests[2].header_value("X-Csrf-Token"), None);
}

#[test]
fn bearer_token_is_fetched_once_for_the_whole_job() {
    let harness = Harness::new();
    let t = &harness.transport;
    let token_url = "https://auth.example/oauth/token";
    t.push(
        "POST",
        token_url,
        Reply::ok_json(json!({"access_token": "tok-1", "token_type": "bearer", "expires_in": 3600}))
            .repeat(),
    );
    t.push("POST", SUBMIT, Reply::ok_json(json!({"id": "J1"})));
    t.push("GET", STATUS, Reply::ok_json(json!({"state": "RUNNING"})));
    t.push("GET", STATUS, Reply::ok_json(json!({"state": "FINISHED"})));

    let outcome = harness.run(
        "remoteJobExecute",
        job_flags(json!({
            "tokenUrl": token_url,
            "clientId": "pipeline",
            "clientSecret": "client-secret-value"
        })),
    );
    assert!(outcome.success(), "{:?}", outcome.diagnostic);

    assert_eq!(t.count("POST", token_url), 1);
    let submit = t.requests().into_iter().find(|r| r.url == SUBMIT).unwrap();
    assert_eq!(submit.header_value("Authorization"), Some("Bearer tok-1"));
    assert!(harness.secrets.contains("client-secret-value"));
    assert!(harness.secrets.contains("tok-1"));
}

#[test]
fn rejected_submit_fails_without_polling() {
    let harness = Harness::new();
    let t = &harness.transport;
    t.push("POST", SUBMIT, Reply::status(400).body("pipeline 'nightly' unknown"));

    let outcome = harness.run("remoteJobExecute", job_flags(json!({})));
    assert_eq!(outcome.exit_code, 1);
    assert_eq!(outcome.error.unwrap().code.kind(), "JobFailed");
    assert_eq!(t.count("GET", STATUS), 0);
}

#[test]
fn oversized_runtime_is_rejected_before_submit() {
    let harness = Harness::new();
    let t = &harness.transport;
    t.push("POST", SUBMIT, Reply::ok_json(json!({"id": "J1"})));

    let outcome = harness.run(
        "remoteJobExecute",
        job_flags(json!({ "maxRuntimeInSeconds": i64::MAX })),
    );
    assert_eq!(outcome.exit_code, 1);
    let err = outcome.error.unwrap();
    assert_eq!(err.code.kind(), "ConfigError");
    assert_eq!(err.category(), ErrorCategory::Configuration);
    assert_eq!(t.count("POST", SUBMIT), 0);
}
