//! Splunk HTTP Event Collector sink.
//!
//! Telemetry is posted once per step. Buffered log records ride along only
//! when the step failed and `sendLogs` is set, in batches.

use super::{LogRecord, Sink};
use crate::config::SplunkConfig;
use crate::error::{Error, Result};
use crate::http::{ClientOptions, HttpClient, Request, TransportFactory, TransportOptions};
use crate::secrets::SecretRegistry;
use crate::telemetry::TelemetryRecord;
use crate::token::TokenCache;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const BATCH_SIZE: usize = 5000;
const TOKEN_PREFIX: &str = "Splunk ";

#[derive(Serialize)]
struct Event<'a> {
    messages: &'a [LogRecord],
    telemetry: &'a TelemetryRecord,
    #[serde(rename = "correlationId")]
    correlation_id: &'a str,
}

#[derive(Serialize)]
struct Envelope<'a> {
    host: &'a str,
    sourcetype: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    index: Option<&'a str>,
    event: Event<'a>,
}

pub struct SplunkSink {
    http: HttpClient,
    url: String,
    authorization: String,
    index: Option<String>,
    send_logs: bool,
    correlation_id: String,
    host: String,
    buffer: Mutex<Vec<LogRecord>>,
}

impl SplunkSink {
    pub fn new(
        config: &SplunkConfig,
        correlation_id: &str,
        factory: &dyn TransportFactory,
        secrets: Arc<SecretRegistry>,
    ) -> Result<Self> {
        let options = ClientOptions {
            max_retries: 1,
            transport: TransportOptions {
                request_timeout: Duration::from_secs(10),
                ..TransportOptions::default()
            },
            ..ClientOptions::default()
        };
        let http = HttpClient::build(factory, options, secrets, Arc::new(TokenCache::default()))?;
        Ok(Self::with_client(config, correlation_id, http))
    }

    pub fn with_client(config: &SplunkConfig, correlation_id: &str, http: HttpClient) -> Self {
        let authorization = if config.token.starts_with(TOKEN_PREFIX) {
            config.token.clone()
        } else {
            format!("{}{}", TOKEN_PREFIX, config.token)
        };
        http.secrets().register(&config.token);
        http.secrets().register(&authorization);
        let host = std::env::var("HOSTNAME")
            .ok()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "n/a".to_string());
        Self {
            http,
            url: config.url.clone(),
            authorization,
            index: config.index.clone().filter(|i| !i.is_empty()),
            send_logs: config.send_logs,
            correlation_id: correlation_id.to_string(),
            host,
            buffer: Mutex::new(Vec::new()),
        }
    }

    fn post(&self, telemetry: &TelemetryRecord, messages: &[LogRecord]) -> Result<()> {
        let envelope = Envelope {
            host: &self.host,
            sourcetype: "_json",
            index: self.index.as_deref(),
            event: Event {
                messages,
                telemetry,
                correlation_id: &self.correlation_id,
            },
        };
        let body = serde_json::to_value(&envelope)
            .map_err(|e| Error::internal_json(e.to_string(), Some("encode Splunk event".to_string())))?;
        let request = Request::post(&self.url)
            .json(&body)
            .header("Authorization", self.authorization.as_str());
        self.http.send(request)?;
        Ok(())
    }
}

impl Sink for SplunkSink {
    fn name(&self) -> &str {
        "splunk"
    }

    fn on_log(&self, record: &LogRecord) {
        match self.buffer.lock() {
            Ok(mut guard) => guard.push(record.clone()),
            Err(poisoned) => poisoned.into_inner().push(record.clone()),
        }
    }

    fn on_finish(&self, telemetry: &TelemetryRecord) -> Result<()> {
        let messages = match self.buffer.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        if telemetry.error_code == 0 || !self.send_logs || messages.is_empty() {
            return self.post(telemetry, &[]);
        }
        for batch in messages.chunks(BATCH_SIZE) {
            self.post(telemetry, batch)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use crate::http::scripted::{Reply, ScriptedTransport};
    use crate::telemetry::Telemetry;
    use std::collections::BTreeMap;

    fn sink(transport: Arc<ScriptedTransport>, send_logs: bool) -> SplunkSink {
        let http = HttpClient::new(
            transport,
            ClientOptions {
                max_retries: -1,
                ..ClientOptions::default()
            },
            Arc::new(SecretRegistry::new()),
            Arc::new(TokenCache::default()),
        );
        let config = SplunkConfig {
            url: "https://splunk/services/collector".to_string(),
            token: "hec-token".to_string(),
            index: Some("pipelines".to_string()),
            send_logs,
        };
        SplunkSink::with_client(&config, "run-1", http)
    }

    fn feed(sink: &SplunkSink, count: usize) {
        for i in 0..count {
            sink.on_log(&LogRecord {
                time: "t".to_string(),
                level: "info".to_string(),
                step: "s".to_string(),
                message: format!("line {}", i),
                fields: BTreeMap::new(),
            });
        }
    }

    #[test]
    fn success_posts_telemetry_only() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push(
            "POST",
            "https://splunk/services/collector",
            Reply::status(200).repeat(),
        );
        let sink = sink(transport.clone(), true);
        feed(&sink, 3);
        sink.on_finish(&Telemetry::start("s").finish(false, None, None)).unwrap();

        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].header_value("Authorization"), Some("Splunk hec-token"));
        let body: serde_json::Value =
            serde_json::from_slice(requests[0].body.as_deref().unwrap()).unwrap();
        assert_eq!(body["index"], "pipelines");
        assert_eq!(body["event"]["messages"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn failure_with_send_logs_posts_batches() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push(
            "POST",
            "https://splunk/services/collector",
            Reply::status(200).repeat(),
        );
        let sink = sink(transport.clone(), true);
        feed(&sink, BATCH_SIZE + 1);
        let telemetry = Telemetry::start("s");
        telemetry.set_error_category(ErrorCategory::Service);
        sink.on_finish(&telemetry.finish(true, None, None)).unwrap();

        assert_eq!(transport.count("POST", "https://splunk/services/collector"), 2);
    }

    #[test]
    fn rejected_post_is_reported() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push("POST", "https://splunk/services/collector", Reply::status(403));
        let sink = sink(transport, false);
        assert!(sink
            .on_finish(&Telemetry::start("s").finish(true, None, None))
            .is_err());
    }
}
