//! Step logging: a `tracing` layer that formats, redacts and fans out.
//!
//! Every event is rendered in the selected [`LogFormat`], passed through the
//! secret registry, written to stderr, and handed to the hook bus as a
//! [`LogRecord`]. Secrets never reach a sink unredacted.

use crate::error::{Error, Result};
use crate::hooks::{HookBus, LogRecord};
use crate::secrets::SecretRegistry;
use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::io::Write;
use std::sync::{Arc, Mutex};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Default,
    Timestamp,
    Plain,
    /// GitHub Actions workflow commands.
    Github,
}

impl LogFormat {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "" | "default" => Ok(LogFormat::Default),
            "timestamp" => Ok(LogFormat::Timestamp),
            "plain" => Ok(LogFormat::Plain),
            "github" => Ok(LogFormat::Github),
            other => Err(Error::validation_invalid_argument(
                "logFormat",
                format!("unknown log format '{}' (default, timestamp, plain, github)", other),
            )),
        }
    }

    /// GitHub Actions always wins; it is what the runner renders.
    pub fn detect(requested: Option<&str>) -> Result<Self> {
        if std::env::var("GITHUB_ACTIONS").map(|v| v == "true").unwrap_or(false) {
            return Ok(LogFormat::Github);
        }
        LogFormat::parse(requested.unwrap_or_default())
    }
}

fn level_name(level: &Level) -> &'static str {
    match *level {
        Level::ERROR => "error",
        Level::WARN => "warn",
        Level::INFO => "info",
        Level::DEBUG => "debug",
        Level::TRACE => "trace",
    }
}

#[derive(Default)]
struct FieldCollector {
    message: String,
    fields: BTreeMap<String, String>,
}

impl Visit for FieldCollector {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.insert(field.name().to_string(), value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.fields
                .insert(field.name().to_string(), format!("{:?}", value));
        }
    }
}

/// Render one line (without trailing newline).
pub fn render(
    format: LogFormat,
    level: &str,
    step: &str,
    message: &str,
    fields: &BTreeMap<String, String>,
) -> String {
    let mut tail = String::new();
    if !fields.is_empty() {
        let joined: Vec<String> = fields.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        let _ = write!(tail, " [{}]", joined.join(" "));
    }
    match format {
        LogFormat::Default => format!("{:<5} {:<6} - {}{}", level, step, message, tail),
        LogFormat::Timestamp => format!(
            "{} {:<5} {:<6} {}{}",
            chrono::Local::now().format("%H:%M:%S"),
            level,
            step,
            message,
            tail
        ),
        LogFormat::Plain => format!("{}{}", message, tail),
        LogFormat::Github => match level {
            "error" => format!("::error::{}{}", message, tail),
            "warn" => format!("::warning::{}{}", message, tail),
            "debug" | "trace" => format!("::debug::{}{}", message, tail),
            _ => format!("{}{}", message, tail),
        },
    }
}

pub struct StepLayer {
    step: String,
    format: LogFormat,
    secrets: Arc<SecretRegistry>,
    bus: Arc<HookBus>,
    writer: Mutex<Box<dyn Write + Send>>,
}

impl StepLayer {
    pub fn new(step: &str, format: LogFormat, secrets: Arc<SecretRegistry>, bus: Arc<HookBus>) -> Self {
        Self {
            step: step.to_string(),
            format,
            secrets,
            bus,
            writer: Mutex::new(Box::new(std::io::stderr())),
        }
    }

    pub fn with_writer(mut self, writer: Box<dyn Write + Send>) -> Self {
        self.writer = Mutex::new(writer);
        self
    }
}

impl<S: Subscriber> Layer<S> for StepLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut collected = FieldCollector::default();
        event.record(&mut collected);

        let level = level_name(event.metadata().level());
        let message = self.secrets.redact(&collected.message);
        let fields: BTreeMap<String, String> = collected
            .fields
            .into_iter()
            .map(|(k, v)| (k, self.secrets.redact(&v)))
            .collect();
        let line = self
            .secrets
            .redact(&render(self.format, level, &self.step, &message, &fields));

        if let Ok(mut writer) = self.writer.lock() {
            let _ = writeln!(writer, "{}", line);
        }
        self.bus.on_log(&LogRecord {
            time: chrono::Utc::now().to_rfc3339(),
            level: level.to_string(),
            step: self.step.clone(),
            message,
            fields,
        });
    }
}

/// `RUST_LOG` wins; otherwise `info`, or `debug` with `--verbose`.
pub fn env_filter(verbose: bool) -> EnvFilter {
    let fallback = if verbose {
        "debug,hyper=info,hyper_util=info,reqwest=info,rustls=info"
    } else {
        "info"
    };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback))
}

/// Install the process-wide subscriber. Returns `false` if one was already set.
pub fn init_logging(
    step: &str,
    verbose: bool,
    format: LogFormat,
    secrets: Arc<SecretRegistry>,
    bus: Arc<HookBus>,
) -> bool {
    tracing_subscriber::registry()
        .with(env_filter(verbose))
        .with(StepLayer::new(step, format, secrets, bus))
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::Sink;

    #[derive(Clone, Default)]
    struct Buffer(Arc<Mutex<Vec<u8>>>);

    impl Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Capture(Mutex<Vec<LogRecord>>);

    impl Sink for Capture {
        fn name(&self) -> &str {
            "capture"
        }

        fn on_log(&self, record: &LogRecord) {
            self.0.lock().unwrap().push(record.clone());
        }
    }

    #[test]
    fn registered_secret_never_reaches_output() {
        let secrets = Arc::new(SecretRegistry::new());
        let bus = Arc::new(HookBus::new());
        let capture = Arc::new(Capture::default());
        bus.register(capture.clone());
        let buffer = Buffer::default();
        let layer = StepLayer::new("deploy", LogFormat::Plain, secrets.clone(), bus)
            .with_writer(Box::new(buffer.clone()));
        let subscriber = tracing_subscriber::registry().with(layer);

        secrets.register("hunter2");
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(user = "admin", token = "hunter2", "using pw hunter2 ok");
        });

        let written = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
        assert_eq!(written, "using pw *** ok [token=*** user=admin]\n");
        let records = capture.0.lock().unwrap();
        assert_eq!(records[0].message, "using pw *** ok");
        assert_eq!(records[0].fields["token"], "***");
    }

    #[test]
    fn formats_follow_selection() {
        let fields = BTreeMap::new();
        assert_eq!(
            render(LogFormat::Default, "info", "build", "started", &fields),
            "info  build  - started"
        );
        assert_eq!(render(LogFormat::Github, "warn", "build", "slow", &fields), "::warning::slow");
        assert_eq!(render(LogFormat::Github, "info", "build", "done", &fields), "done");
        assert!(LogFormat::parse("fancy").is_err());
    }
}
