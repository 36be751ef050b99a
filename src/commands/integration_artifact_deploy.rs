//! `integrationArtifactDeploy`: deploy a designtime integration flow and wait
//! for the runtime to report the build-and-deploy task as done.

use super::{connection_params, duration_param};
use crate::config::ResolvedConfig;
use crate::error::{Error, Result};
use crate::http::{Auth, ClientOptions, Request};
use crate::job::classifier::parse_path;
use crate::job::{
    IdExtractor, JobDescriptor, JsonStateClassifier, PollSpec, StateTable, StatusUrl, Submission,
};
use crate::pipeline_env::ValueKind;
use crate::runner::{RunContext, Step};
use crate::step::{ParameterSpec, StepSpec};
use crate::token::ClientCredentials;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

pub const STATUS_KEY: &str = "integrationArtifact.deployStatus";

#[derive(Debug, Deserialize)]
struct ServiceKey {
    oauth: OAuth,
}

#[derive(Debug, Deserialize)]
struct OAuth {
    /// API host.
    url: String,
    #[serde(rename = "clientid")]
    client_id: String,
    #[serde(rename = "clientsecret")]
    client_secret: String,
    #[serde(rename = "tokenurl")]
    token_url: String,
}

pub fn step() -> Step {
    let mut spec = StepSpec::new(
        "integrationArtifactDeploy",
        "Deploy an integration flow to the runtime and wait for the deployment to finish",
    )
    .param(ParameterSpec::string("integrationFlowId").mandatory().alias("iFlowId"))
    .param(ParameterSpec::string("cpiApiServiceKeyCredentialsId"))
    .param(
        ParameterSpec::string("apiServiceKey")
            .from_credential("cpiApiServiceKeyCredentialsId", "apiServiceKey")
            .describe("Service key JSON with an `oauth` section"),
    )
    .param(ParameterSpec::int("pollIntervalInSeconds").default_value(10))
    .param(ParameterSpec::int("maxRuntimeInMinutes").default_value(6))
    .output(STATUS_KEY, ValueKind::Text);
    for param in connection_params()
        .into_iter()
        .filter(|p| matches!(p.name.as_str(), "maxRetries" | "requestTimeoutInSeconds"))
    {
        spec = spec.param(param);
    }
    Step::new(spec, run)
}

fn service_key(config: &ResolvedConfig) -> Result<ServiceKey> {
    let raw = config.require_str("apiServiceKey")?;
    serde_json::from_str(raw).map_err(|e| {
        // Never echo the key itself.
        Error::config_invalid_value("apiServiceKey", None, None, format!("not a service key: {}", e))
    })
}

fn descriptor(config: &ResolvedConfig, host: &str) -> Result<JobDescriptor> {
    let flow = config.require_str("integrationFlowId")?;
    let host = host.trim_end_matches('/');
    let table = StateTable::new(&["DEPLOYING"], &["SUCCESS"], &["FAIL", "FAIL_ON_LICENSE_ERROR"]);

    Ok(JobDescriptor {
        name: format!("deploy {}", flow),
        submission: Submission {
            request: Request::post(format!(
                "{}/api/v1/DeployIntegrationDesigntimeArtifact?Id='{}'&Version='Active'",
                host, flow
            ))
            .header("Accept", "application/json"),
            id: IdExtractor::Body,
            status_url: StatusUrl::Template(format!(
                "{}/api/v1/BuildAndDeployStatus(TaskId='{{id}}')",
                host
            )),
        },
        poll: PollSpec {
            interval: duration_param(config, "pollIntervalInSeconds", Duration::from_secs(1))?
                .unwrap_or(Duration::from_secs(10)),
            max_runtime: duration_param(config, "maxRuntimeInMinutes", Duration::from_secs(60))?
                .unwrap_or(Duration::from_secs(6 * 60)),
            headers: vec![("Accept".to_string(), "application/json".to_string())],
        },
        classifier: Arc::new(JsonStateClassifier::new(
            parse_path("$.d.Status", "statePath")?,
            None,
            table,
        )),
        error_details_url: Some(format!(
            "{}/api/v1/IntegrationRuntimeArtifacts('{}')/ErrorInformation/$value",
            host, flow
        )),
        artifacts: Vec::new(),
    })
}

fn run(ctx: &RunContext) -> Result<Value> {
    let key = service_key(&ctx.config)?;
    ctx.secrets.register(&key.oauth.client_secret);

    let options = ClientOptions {
        auth: Auth::ClientCredentials(ClientCredentials {
            token_url: key.oauth.token_url.clone(),
            client_id: key.oauth.client_id.clone(),
            client_secret: key.oauth.client_secret.clone(),
            scope: None,
        }),
        max_retries: ctx.config.int("maxRetries").unwrap_or(0),
        ..ClientOptions::default()
    };
    let http = ctx.http_client(options)?;
    let descriptor = descriptor(&ctx.config, &key.oauth.url)?;

    let result = ctx.job_driver(http).drive(&descriptor)?;
    ctx.publish(STATUS_KEY, result.state().name())?;
    if let Some(details) = &result.error_details {
        tracing::error!(flow = %descriptor.name, details = %details, "deployment failed");
    }

    let result = result.into_result()?;
    tracing::info!(flow = %descriptor.name, "integration flow deployed");
    Ok(json!({
        "integrationFlowId": ctx.config.require_str("integrationFlowId")?,
        "taskId": result.id(),
        "status": result.state().name(),
    }))
}
