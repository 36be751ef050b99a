//! Long-running remote jobs: submit, poll until terminal, harvest error details.
//!
//! ```text
//! NEW --submit--> SUBMITTED --poll--> RUNNING* --poll--> SUCCEEDED | FAILED | ABORTED
//!                                         \--deadline--> TIMED_OUT
//!                                          \--signal---> CANCELLED
//! ```

pub mod classifier;

pub use classifier::{
    Classifier, JsonStateClassifier, Outcome, PatternClassifier, SentinelClassifier, StateTable,
};

use crate::artifact::ArtifactSpec;
use crate::cancel::CancellationToken;
use crate::error::{Error, JobDetails, Result};
use crate::http::{HttpClient, Request};
use crate::utils::template;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use serde_json_path::JsonPath;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

const SUBMIT_PREVIEW_LIMIT: usize = 1024;
const ERROR_DETAILS_LIMIT: u64 = 64 * 1024;

/// Upper bound for a poll interval or a job's maximum runtime.
pub const MAX_POLL_DURATION: Duration = Duration::from_secs(366 * 24 * 60 * 60);

/// How the backend-assigned job id is recovered from the submit response.
#[derive(Debug)]
pub enum IdExtractor {
    JsonPath(JsonPath),
    /// First capture group. For backends that only report the id in prose.
    Pattern(Regex),
    /// The whole (trimmed) body is the id.
    Body,
    Header(String),
}

impl IdExtractor {
    fn extract(&self, headers: &[(String, String)], body: &str) -> Option<String> {
        let id = match self {
            IdExtractor::JsonPath(path) => {
                let value: Value = serde_json::from_str(body).ok()?;
                match path.query(&value).first()? {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    _ => return None,
                }
            }
            IdExtractor::Pattern(re) => {
                let caps = re.captures(body)?;
                caps.get(1).or_else(|| caps.get(0))?.as_str().to_string()
            }
            IdExtractor::Body => body.trim().trim_matches('"').to_string(),
            IdExtractor::Header(name) => headers
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.clone())?,
        };
        let id = id.trim().to_string();
        (!id.is_empty()).then_some(id)
    }
}

/// Where to poll. Templates substitute `{id}`.
#[derive(Debug)]
pub enum StatusUrl {
    Template(String),
    Header(String),
    JsonPath(JsonPath),
}

#[derive(Debug)]
pub struct Submission {
    pub request: Request,
    pub id: IdExtractor,
    pub status_url: StatusUrl,
}

#[derive(Debug, Clone)]
pub struct PollSpec {
    pub interval: Duration,
    pub max_runtime: Duration,
    pub headers: Vec<(String, String)>,
}

impl PollSpec {
    fn validate(&self, job: &str) -> Result<()> {
        let check = |name: &str, value: Duration| {
            if value.is_zero() || value > MAX_POLL_DURATION {
                return Err(Error::config_invalid_value(
                    name,
                    None,
                    Some(format!("{}s", value.as_secs())),
                    format!("out of range for job '{}'", job),
                ));
            }
            Ok(())
        };
        check("pollInterval", self.interval)?;
        check("maxRuntime", self.max_runtime)
    }
}

pub struct JobDescriptor {
    pub name: String,
    pub submission: Submission,
    pub poll: PollSpec,
    pub classifier: Arc<dyn Classifier>,
    /// GET after FAILED/ABORTED; `{id}` is substituted.
    pub error_details_url: Option<String>,
    pub artifacts: Vec<ArtifactSpec>,
}

impl fmt::Debug for JobDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobDescriptor")
            .field("name", &self.name)
            .field("submission", &self.submission)
            .field("poll", &self.poll)
            .field("error_details_url", &self.error_details_url)
            .field("artifacts", &self.artifacts)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    New,
    Submitted,
    Running,
    Succeeded,
    Failed(String),
    Aborted(String),
    TimedOut,
    Cancelled,
}

impl JobState {
    fn rank(&self) -> u8 {
        match self {
            JobState::New => 0,
            JobState::Submitted => 1,
            JobState::Running => 2,
            _ => 3,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 3
    }

    pub fn name(&self) -> &'static str {
        match self {
            JobState::New => "NEW",
            JobState::Submitted => "SUBMITTED",
            JobState::Running => "RUNNING",
            JobState::Succeeded => "SUCCEEDED",
            JobState::Failed(_) => "FAILED",
            JobState::Aborted(_) => "ABORTED",
            JobState::TimedOut => "TIMED_OUT",
            JobState::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Failed(reason) | JobState::Aborted(reason) => {
                write!(f, "{} ({})", self.name(), reason)
            }
            other => f.write_str(other.name()),
        }
    }
}

/// Live state of one job. Only the driver mutates it.
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub id: String,
    pub created_at: Instant,
    pub deadline: Instant,
    pub last_state: JobState,
    pub last_observed_at: Instant,
    pub attempts: u32,
    pub transitions: Vec<JobState>,
}

impl JobHandle {
    fn new(id: String, max_runtime: Duration) -> Self {
        let created_at = Instant::now();
        Self {
            id,
            created_at,
            deadline: created_at.checked_add(max_runtime).unwrap_or(created_at),
            last_state: JobState::Submitted,
            last_observed_at: created_at,
            attempts: 0,
            transitions: vec![JobState::New, JobState::Submitted],
        }
    }

    /// Record an observation. States never regress and a terminal state is final.
    fn advance(&mut self, next: JobState) {
        self.last_observed_at = Instant::now();
        if self.last_state.is_terminal() || next.rank() < self.last_state.rank() {
            return;
        }
        self.transitions.push(next.clone());
        self.last_state = next;
    }
}

#[derive(Debug, Clone)]
pub struct JobResult {
    pub name: String,
    pub handle: JobHandle,
    pub error_details: Option<String>,
    pub completed_at: Instant,
}

impl JobResult {
    pub fn state(&self) -> &JobState {
        &self.handle.last_state
    }

    pub fn id(&self) -> &str {
        &self.handle.id
    }

    pub fn elapsed(&self) -> Duration {
        self.completed_at.duration_since(self.handle.created_at)
    }

    fn details(&self, reason: Option<String>) -> JobDetails {
        JobDetails {
            job: self.name.clone(),
            job_id: Some(self.handle.id.clone()),
            reason,
            error_details: self.error_details.clone(),
            elapsed_millis: Some(self.elapsed().as_millis() as u64),
        }
    }

    /// Turn a non-successful terminal state into the matching error.
    pub fn into_result(self) -> Result<JobResult> {
        match self.state().clone() {
            JobState::Succeeded => Ok(self),
            JobState::Failed(reason) => Err(Error::job_failed(self.details(Some(reason)))),
            JobState::Aborted(reason) => Err(Error::job_aborted(self.details(Some(reason)))),
            JobState::TimedOut => Err(Error::job_timed_out(self.details(None))),
            JobState::Cancelled => Err(Error::job_cancelled(self.details(None))),
            other => Err(Error::internal_unexpected(format!(
                "job '{}' stopped in non-terminal state {}",
                self.name, other
            ))),
        }
    }
}

pub struct JobDriver {
    http: Arc<HttpClient>,
    cancel: CancellationToken,
}

impl JobDriver {
    pub fn new(http: Arc<HttpClient>, cancel: CancellationToken) -> Self {
        Self { http, cancel }
    }

    fn redact(&self, text: &str) -> String {
        self.http.secrets().redact(text)
    }

    fn submit(&self, descriptor: &JobDescriptor) -> Result<(JobHandle, String)> {
        let submission = &descriptor.submission;
        let response = self.http.execute(submission.request.clone())?;
        if !response.is_success() {
            let status = response.status;
            let preview = self.redact(&response.preview(SUBMIT_PREVIEW_LIMIT));
            return Err(Error::job_submit_failed(&descriptor.name, status, preview));
        }
        let headers = response.headers.clone();
        let body = response.text()?;

        let id = submission.id.extract(&headers, &body).ok_or_else(|| {
            Error::http_parse(
                format!("submit response of job '{}'", descriptor.name),
                "no job id found",
            )
        })?;

        let status_url = match &submission.status_url {
            StatusUrl::Template(t) => Some(template::render_braces(t, &[("id", id.as_str())])),
            StatusUrl::Header(name) => headers
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.clone()),
            StatusUrl::JsonPath(path) => serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|v| path.query(&v).first().and_then(|s| s.as_str().map(str::to_string))),
        }
        .ok_or_else(|| {
            Error::http_parse(
                format!("submit response of job '{}'", descriptor.name),
                "no status URL found",
            )
        })?;

        tracing::info!(job = %descriptor.name, id = %id, "job submitted");
        Ok((JobHandle::new(id, descriptor.poll.max_runtime), status_url))
    }

    fn poll_once(&self, descriptor: &JobDescriptor, status_url: &str) -> Result<Outcome> {
        let mut request = Request::get(status_url);
        for (name, value) in &descriptor.poll.headers {
            request.set_header(name, value.as_str());
        }
        let body = self.http.send(request)?.text()?;
        descriptor.classifier.classify(&body)
    }

    fn harvest_error_details(&self, descriptor: &JobDescriptor, id: &str) -> Option<String> {
        let url = descriptor.error_details_url.as_ref()?;
        let url = template::render_braces(url, &[("id", id)]);
        let fetched = self.http.get(&url).and_then(|response| {
            use std::io::Read;
            let mut buf = Vec::new();
            let mut body = response.body;
            (&mut body)
                .take(ERROR_DETAILS_LIMIT)
                .read_to_end(&mut buf)
                .map_err(|e| Error::http_parse("error details", e.to_string()))?;
            Ok(String::from_utf8_lossy(&buf).into_owned())
        });
        match fetched {
            Ok(details) => Some(self.redact(&details)),
            Err(err) => {
                tracing::warn!(job = %descriptor.name, error = %self.redact(&err.message), "could not fetch error details");
                None
            }
        }
    }

    /// Drive one job to a terminal state. `Err` is reserved for failures of
    /// the protocol itself (submit rejected, transport exhausted, unparsable
    /// responses); a job that ends badly is an `Ok` with a terminal state.
    pub fn drive(&self, descriptor: &JobDescriptor) -> Result<JobResult> {
        descriptor.poll.validate(&descriptor.name)?;
        let (mut handle, status_url) = self.submit(descriptor)?;
        let interval = descriptor.poll.interval;
        let mut next_tick = handle.created_at;

        loop {
            next_tick = next_tick.checked_add(interval).unwrap_or(handle.deadline);
            if self.cancel.sleep_until(next_tick) {
                tracing::warn!(job = %descriptor.name, id = %handle.id, "polling cancelled");
                handle.advance(JobState::Cancelled);
                break;
            }

            handle.attempts += 1;
            let outcome = self.poll_once(descriptor, &status_url)?;
            tracing::debug!(job = %descriptor.name, attempt = handle.attempts, outcome = ?outcome, "polled job");

            let state = match outcome {
                Outcome::Running => JobState::Running,
                Outcome::Succeeded => JobState::Succeeded,
                Outcome::Failed(reason) => JobState::Failed(self.redact(&reason)),
                Outcome::Aborted(reason) => JobState::Aborted(self.redact(&reason)),
            };
            handle.advance(state);
            if handle.last_state.is_terminal() {
                break;
            }
            if Instant::now() > handle.deadline {
                handle.advance(JobState::TimedOut);
                break;
            }
        }

        let error_details = match handle.last_state {
            JobState::Failed(_) | JobState::Aborted(_) => {
                self.harvest_error_details(descriptor, &handle.id)
            }
            _ => None,
        };

        tracing::info!(job = %descriptor.name, id = %handle.id, state = %handle.last_state, "job finished");
        Ok(JobResult {
            name: descriptor.name.clone(),
            completed_at: handle.last_observed_at,
            handle,
            error_details,
        })
    }

    /// Drive several jobs concurrently, one poll loop per thread. Results
    /// come back in descriptor order; no ordering between jobs is implied.
    pub fn drive_all(&self, descriptors: &[JobDescriptor]) -> Vec<Result<JobResult>> {
        std::thread::scope(|scope| {
            let workers: Vec<_> = descriptors
                .iter()
                .map(|descriptor| scope.spawn(move || self.drive(descriptor)))
                .collect();
            workers
                .into_iter()
                .map(|worker| {
                    worker.join().unwrap_or_else(|_| {
                        Err(Error::internal_unexpected("job poll loop panicked"))
                    })
                })
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::scripted::{Reply, ScriptedTransport};
    use crate::http::ClientOptions;
    use crate::secrets::SecretRegistry;
    use crate::token::TokenCache;
    use serde_json::json;

    fn driver(transport: Arc<ScriptedTransport>, cancel: CancellationToken) -> JobDriver {
        let http = HttpClient::new(
            transport,
            ClientOptions {
                max_retries: -1,
                ..ClientOptions::default()
            },
            Arc::new(SecretRegistry::new()),
            Arc::new(TokenCache::default()),
        );
        JobDriver::new(Arc::new(http), cancel)
    }

    fn descriptor(base: &str, interval_ms: u64, max_runtime_ms: u64) -> JobDescriptor {
        JobDescriptor {
            name: "build".to_string(),
            submission: Submission {
                request: Request::post(format!("{}/jobs", base)).json(&json!({"kind": "build"})),
                id: IdExtractor::JsonPath(JsonPath::parse("$.id").unwrap()),
                status_url: StatusUrl::Template(format!("{}/jobs/{{id}}", base)),
            },
            poll: PollSpec {
                interval: Duration::from_millis(interval_ms),
                max_runtime: Duration::from_millis(max_runtime_ms),
                headers: vec![("Accept".to_string(), "application/json".to_string())],
            },
            classifier: Arc::new(JsonStateClassifier::new(
                JsonPath::parse("$.state").unwrap(),
                Some(JsonPath::parse("$.message").unwrap()),
                StateTable::new(&["RUNNING"], &["FINISHED"], &["FAILED"]),
            )),
            error_details_url: Some(format!("{}/jobs/{{id}}/log", base)),
            artifacts: Vec::new(),
        }
    }

    #[test]
    fn success_after_running_polls() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push("POST", "https://h/jobs", Reply::ok_json(json!({"id": "J1"})));
        transport.push("GET", "https://h/jobs/J1", Reply::ok_json(json!({"state": "RUNNING"})));
        transport.push("GET", "https://h/jobs/J1", Reply::ok_json(json!({"state": "RUNNING"})));
        transport.push("GET", "https://h/jobs/J1", Reply::ok_json(json!({"state": "FINISHED"})));

        let result = driver(transport.clone(), CancellationToken::new())
            .drive(&descriptor("https://h", 20, 5_000))
            .unwrap();

        assert_eq!(result.state(), &JobState::Succeeded);
        assert_eq!(result.id(), "J1");
        assert_eq!(result.handle.attempts, 3);
        assert!(result.elapsed() >= Duration::from_millis(60));
        assert_eq!(
            result.handle.transitions,
            vec![
                JobState::New,
                JobState::Submitted,
                JobState::Running,
                JobState::Running,
                JobState::Succeeded
            ]
        );
    }

    #[test]
    fn first_poll_waits_one_interval() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push("POST", "https://h/jobs", Reply::ok_json(json!({"id": "J1"})));
        transport.push("GET", "https://h/jobs/J1", Reply::ok_json(json!({"state": "FINISHED"})));

        driver(transport.clone(), CancellationToken::new())
            .drive(&descriptor("https://h", 50, 5_000))
            .unwrap();

        let timed = transport.timed_requests();
        assert!(timed[1].0.duration_since(timed[0].0) >= Duration::from_millis(50));
        assert_eq!(timed[1].1.header_value("Accept"), Some("application/json"));
    }

    #[test]
    fn deadline_turns_into_timeout() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push("POST", "https://h/jobs", Reply::ok_json(json!({"id": "J2"})));
        transport.push(
            "GET",
            "https://h/jobs/J2",
            Reply::ok_json(json!({"state": "RUNNING"})).repeat(),
        );

        let result = driver(transport, CancellationToken::new())
            .drive(&descriptor("https://h", 20, 50))
            .unwrap();

        assert_eq!(result.state(), &JobState::TimedOut);
        assert!(result.completed_at >= result.handle.created_at + Duration::from_millis(50));
        let err = result.into_result().unwrap_err();
        assert_eq!(err.code.kind(), "JobTimedOut");
    }

    #[test]
    fn failure_harvests_error_details() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push("POST", "https://h/jobs", Reply::ok_json(json!({"id": "J3"})));
        transport.push(
            "GET",
            "https://h/jobs/J3",
            Reply::ok_json(json!({"state": "FAILED", "message": "compile error"})),
        );
        transport.push("GET", "https://h/jobs/J3/log", Reply::status(200).body("line 12: syntax"));

        let result = driver(transport, CancellationToken::new())
            .drive(&descriptor("https://h", 10, 5_000))
            .unwrap();

        assert_eq!(result.state(), &JobState::Failed("compile error".to_string()));
        assert_eq!(result.error_details.as_deref(), Some("line 12: syntax"));
        let err = result.into_result().unwrap_err();
        assert_eq!(err.code.kind(), "JobFailed");
        assert!(err.message.contains("compile error"));
    }

    #[test]
    fn harvest_failure_keeps_original_reason() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push("POST", "https://h/jobs", Reply::ok_json(json!({"id": "J4"})));
        transport.push(
            "GET",
            "https://h/jobs/J4",
            Reply::ok_json(json!({"state": "FAILED", "message": "quota"})),
        );
        transport.push("GET", "https://h/jobs/J4/log", Reply::status(500));

        let result = driver(transport, CancellationToken::new())
            .drive(&descriptor("https://h", 10, 5_000))
            .unwrap();
        assert_eq!(result.state(), &JobState::Failed("quota".to_string()));
        assert!(result.error_details.is_none());
    }

    #[test]
    fn rejected_submit_is_submit_error() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push("POST", "https://h/jobs", Reply::status(400).body("bad descriptor"));

        let err = driver(transport, CancellationToken::new())
            .drive(&descriptor("https://h", 10, 5_000))
            .unwrap_err();
        assert_eq!(err.code.as_str(), "job.submit_failed");
        assert_eq!(err.details["status"], 400);
        assert_eq!(err.details["bodyPreview"], "bad descriptor");
    }

    #[test]
    fn cancellation_stops_polling() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push("POST", "https://h/jobs", Reply::ok_json(json!({"id": "J5"})));
        transport.push(
            "GET",
            "https://h/jobs/J5",
            Reply::ok_json(json!({"state": "RUNNING"})).repeat(),
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(60));
            trigger.cancel();
        });

        let result = driver(transport, cancel)
            .drive(&descriptor("https://h", 20, 60_000))
            .unwrap();
        assert_eq!(result.state(), &JobState::Cancelled);
        assert_eq!(result.into_result().unwrap_err().code.kind(), "JobCancelled");
    }

    #[test]
    fn id_from_prose_by_pattern() {
        let extractor = IdExtractor::Pattern(
            Regex::new(r#"Use "xs bg-deploy -i (\S+) -a resume""#).unwrap(),
        );
        let body = "Process started.\nUse \"xs bg-deploy -i 4711 -a resume\" to resume the process.";
        assert_eq!(extractor.extract(&[], body).as_deref(), Some("4711"));
        assert_eq!(IdExtractor::Body.extract(&[], "\"abc\"\n").as_deref(), Some("abc"));
    }

    #[test]
    fn concurrent_jobs_keep_separate_handles() {
        let transport = Arc::new(ScriptedTransport::new());
        for (base, id) in [("https://a", "A1"), ("https://b", "B1")] {
            transport.push("POST", &format!("{}/jobs", base), Reply::ok_json(json!({"id": id})));
            transport.push(
                "GET",
                &format!("{}/jobs/{}", base, id),
                Reply::ok_json(json!({"state": "FINISHED"})),
            );
        }
        let results = driver(transport, CancellationToken::new()).drive_all(&[
            descriptor("https://a", 10, 5_000),
            descriptor("https://b", 10, 5_000),
        ]);
        let ids: Vec<String> = results
            .into_iter()
            .map(|r| r.unwrap().id().to_string())
            .collect();
        assert_eq!(ids, vec!["A1", "B1"]);
    }

    #[test]
    fn unrepresentable_runtime_fails_before_submit() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push("POST", "https://h/jobs", Reply::ok_json(json!({"id": "J9"})));

        let mut too_long = descriptor("https://h", 10, 5_000);
        too_long.poll.max_runtime = Duration::from_secs(u64::MAX);
        let err = driver(transport.clone(), CancellationToken::new())
            .drive(&too_long)
            .unwrap_err();

        assert_eq!(err.code.kind(), "ConfigError");
        assert_eq!(err.details["parameter"], "maxRuntime");
        assert_eq!(transport.count("POST", "https://h/jobs"), 0);
    }
}
