mod support;

use pipestep::http::scripted::Reply;
use pipestep::pipeline_env::{EnvValue, PipelineEnv};
use serde_json::json;
use support::Harness;

const HOST: &str = "https://cpi.example";
const TOKEN_URL: &str = "https://auth.example/oauth/token";
const DEPLOY: &str =
    "https://cpi.example/api/v1/DeployIntegrationDesigntimeArtifact?Id='flow1'&Version='Active'";
const STATUS: &str = "https://cpi.example/api/v1/BuildAndDeployStatus(TaskId='task-7')";

fn harness() -> Harness {
    let harness = Harness::new();
    let key = json!({
        "oauth": {
            "url": HOST,
            "clientid": "cpi-client",
            "clientsecret": "cpi-secret",
            "tokenurl": TOKEN_URL
        }
    });
    harness.write(
        ".pipeline/credentials/cpi-key/apiServiceKey",
        &key.to_string(),
    );
    harness.transport.push(
        "POST",
        TOKEN_URL,
        Reply::ok_json(json!({"access_token": "cpi-token", "expires_in": 3600})).repeat(),
    );
    harness
        .transport
        .push("POST", DEPLOY, Reply::status(202).body("task-7"));
    harness
}

fn flags() -> serde_json::Value {
    json!({
        "integrationFlowId": "flow1",
        "cpiApiServiceKeyCredentialsId": "cpi-key",
        "pollIntervalInSeconds": 1,
        "maxRetries": -1
    })
}

#[test]
fn deploy_polls_until_success() {
    let harness = harness();
    let t = &harness.transport;
    t.push("GET", STATUS, Reply::ok_json(json!({"d": {"Status": "DEPLOYING"}})));
    t.push("GET", STATUS, Reply::ok_json(json!({"d": {"Status": "SUCCESS"}})));

    let outcome = harness.run("integrationArtifactDeploy", flags());
    assert!(outcome.success(), "{:?}", outcome.diagnostic);
    assert_eq!(outcome.output.unwrap()["taskId"], json!("task-7"));
    assert_eq!(t.count("POST", TOKEN_URL), 1);

    let deploy = t.requests().into_iter().find(|r| r.url == DEPLOY).unwrap();
    assert_eq!(deploy.header_value("Authorization"), Some("Bearer cpi-token"));
    assert_eq!(
        PipelineEnv::open(&harness.root())
            .read("integrationArtifact.deployStatus")
            .unwrap(),
        Some(EnvValue::Text("SUCCEEDED".to_string()))
    );
}

#[test]
fn failed_deploy_carries_runtime_error_information() {
    let harness = harness();
    let t = &harness.transport;
    t.push("GET", STATUS, Reply::ok_json(json!({"d": {"Status": "FAIL"}})));
    t.push(
        "GET",
        "https://cpi.example/api/v1/IntegrationRuntimeArtifacts('flow1')/ErrorInformation/$value",
        Reply::status(200).body("{\"message\":\"adapter missing\"}"),
    );

    let outcome = harness.run("integrationArtifactDeploy", flags());
    assert_eq!(outcome.exit_code, 1);
    let err = outcome.error.unwrap();
    assert_eq!(err.code.kind(), "JobFailed");
    assert!(err.details["errorDetails"]
        .as_str()
        .unwrap()
        .contains("adapter missing"));
    assert!(!format!("{:?}", outcome.diagnostic).contains("cpi-secret"));
}

#[test]
fn missing_service_key_is_a_configuration_error() {
    let harness = Harness::new();
    let outcome = harness.run(
        "integrationArtifactDeploy",
        json!({"integrationFlowId": "flow1"}),
    );
    assert_eq!(outcome.exit_code, 1);
    assert!(outcome
        .diagnostic
        .unwrap()
        .starts_with("integrationArtifactDeploy: ConfigError [configuration]"));
}
