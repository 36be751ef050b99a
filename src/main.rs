use clap::{Arg, ArgAction, ArgMatches, Args, Command, CommandFactory, FromArgMatches, Parser};
use serde_json::{json, Map, Value};
use std::process::ExitCode;
use std::sync::Arc;

mod output;

use pipestep::cancel::{install_signal_handler, CancellationToken};
use pipestep::commands;
use pipestep::hooks::HookBus;
use pipestep::log::{init_logging, LogFormat};
use pipestep::runner::{Collaborators, GeneralOptions};
use pipestep::secrets::SecretRegistry;
use pipestep::step::{ParamType, StepSpec};
use pipestep::{Error, Step, StepRunner};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "pipestep")]
#[command(version = VERSION)]
#[command(about = "Pipeline steps for CI/CD servers, sharing one persisted environment")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
}

/// Flags accepted by every step.
#[derive(Args, Debug, Clone, Default)]
struct GlobalArgs {
    /// Correlation id of the pipeline run
    #[arg(long = "correlationId", global = true)]
    correlation_id: Option<String>,
    /// Debug logging
    #[arg(long, short = 'v', global = true)]
    verbose: bool,
    /// Do not deliver telemetry to hooks
    #[arg(long = "noTelemetry", global = true)]
    no_telemetry: bool,
    /// Host-provided parameter file (JSON or YAML)
    #[arg(long = "stepConfig", global = true)]
    step_config: Option<String>,
    /// Project configuration (default: <envRootPath>/config.yml)
    #[arg(long = "customConfig", global = true)]
    custom_config: Option<String>,
    /// Defaults file; repeatable (default: <envRootPath>/defaults.yaml)
    #[arg(long = "defaultConfig", global = true)]
    default_config: Vec<String>,
    /// Root of the pipeline environment
    #[arg(long = "envRootPath", global = true)]
    env_root: Option<String>,
    #[arg(long = "stageName", global = true)]
    stage_name: Option<String>,
    /// Inline parameter JSON
    #[arg(long = "parametersJSON", global = true)]
    parameters_json: Option<String>,
    /// default, timestamp, plain or github
    #[arg(long = "logFormat", global = true)]
    log_format: Option<String>,
    /// Directory of file-mounted credentials
    #[arg(long = "credentialsRoot", global = true)]
    credentials_root: Option<String>,
    /// Skip the customDefaults list of the custom config file
    #[arg(long = "ignoreCustomDefaults", global = true)]
    ignore_custom_defaults: bool,
}

impl From<GlobalArgs> for GeneralOptions {
    fn from(args: GlobalArgs) -> Self {
        GeneralOptions {
            correlation_id: args.correlation_id,
            verbose: args.verbose,
            no_telemetry: args.no_telemetry,
            step_config: args.step_config,
            custom_config: args.custom_config,
            default_config: args.default_config,
            env_root: args.env_root,
            stage_name: args.stage_name,
            parameters_json: args.parameters_json,
            log_format: args.log_format,
            credentials_root: args.credentials_root,
            ignore_custom_defaults: args.ignore_custom_defaults,
        }
    }
}

fn step_command(spec: &StepSpec) -> Command {
    let mut cmd = Command::new(spec.name.clone()).about(spec.description.clone());
    for param in &spec.params {
        let mut arg = Arg::new(param.name.clone())
            .long(param.name.clone())
            .help(param.description.clone());
        arg = match param.kind {
            ParamType::String => arg.action(ArgAction::Set),
            ParamType::Int => arg
                .action(ArgAction::Set)
                .allow_negative_numbers(true)
                .value_parser(clap::value_parser!(i64)),
            ParamType::Bool => arg
                .action(ArgAction::Set)
                .num_args(0..=1)
                .default_missing_value("true")
                .value_parser(clap::value_parser!(bool)),
            ParamType::StringList => arg.action(ArgAction::Append),
        };
        cmd = cmd.arg(arg);
    }
    cmd
}

fn build_augmented_command(steps: &[Step]) -> Command {
    let mut cmd = Cli::command()
        .subcommand_required(true)
        .arg_required_else_help(true);
    for step in steps {
        cmd = cmd.subcommand(step_command(&step.spec));
    }
    cmd
}

/// Flags given on the command line, keyed by parameter name.
fn step_flags(spec: &StepSpec, matches: &ArgMatches) -> Map<String, Value> {
    let mut flags = Map::new();
    for param in &spec.params {
        let name = param.name.as_str();
        let value = match param.kind {
            ParamType::String => matches.get_one::<String>(name).map(|v| json!(v)),
            ParamType::Int => matches.get_one::<i64>(name).map(|v| json!(v)),
            ParamType::Bool => matches.get_one::<bool>(name).map(|v| json!(v)),
            ParamType::StringList => matches
                .get_many::<String>(name)
                .map(|values| Value::Array(values.map(|v| json!(v)).collect())),
        };
        if let Some(value) = value {
            flags.insert(param.name.clone(), value);
        }
    }
    flags
}

fn fail_early(err: Error, secrets: &SecretRegistry) -> ExitCode {
    let _ = output::print_error(&err, secrets);
    ExitCode::from(1)
}

fn main() -> ExitCode {
    let steps = commands::all();
    let matches = build_augmented_command(&steps).get_matches();

    let cli = match Cli::from_arg_matches(&matches) {
        Ok(cli) => cli,
        Err(e) => e.exit(),
    };
    let Some((name, sub_matches)) = matches.subcommand() else {
        return ExitCode::from(2);
    };
    let Some(step) = steps.iter().find(|s| s.name() == name) else {
        return ExitCode::from(2);
    };

    let secrets = SecretRegistry::global();
    let bus = Arc::new(HookBus::new());
    let format = match LogFormat::detect(cli.global.log_format.as_deref()) {
        Ok(format) => format,
        Err(err) => return fail_early(err, &secrets),
    };
    init_logging(step.name(), cli.global.verbose, format, secrets.clone(), bus.clone());

    let cancel = CancellationToken::new();
    install_signal_handler(&cancel);

    let flags = step_flags(&step.spec, sub_matches);
    let collaborators = Collaborators {
        secrets: secrets.clone(),
        hooks: bus,
        cancel,
        ..Collaborators::default()
    };
    let runner = StepRunner::new(cli.global.into(), collaborators);
    let outcome = runner.run(step, flags);

    if let Err(err) = output::print_outcome(&outcome, &secrets) {
        eprintln!("{}", secrets.redact(&err.message));
    }
    // Last line on stderr, for CI log views that show only the tail.
    if let Some(diagnostic) = &outcome.diagnostic {
        eprintln!("{}", diagnostic);
    }
    ExitCode::from(output::exit_code_to_u8(outcome.exit_code))
}
