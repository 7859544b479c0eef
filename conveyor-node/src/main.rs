use std::path::PathBuf;
use std::process;

use anyhow::Context as _;
use crossbeam_channel as chan;

use conveyor::config::{Config, ConfigError};
use conveyor::registry::{self, BuildContext, Category, Registry};
use conveyor::temp::RunDir;
use conveyor::{logger, temp};

use conveyor_node::runtime::{self, Runtime};
use conveyor_node::signals;

pub const NAME: &str = "conveyor-node";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub const HELP_MSG: &str = r#"
Usage

   conveyor-node <command> --config <path> [<option>...]

Commands

    run                  Start a run and block until the source is exhausted
                         or a signal arrives
    probe                Validate the config, list discovered extensions

Options

    --config   <path>    Config file to use
    --version            Print program version
    --help               Print help

Exit codes

    0    success
    1    unexpected error
    2    configuration error
    3    missing extension
    130  interrupted
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Run,
    Probe,
}

#[derive(Debug)]
struct Options {
    command: Command,
    config: PathBuf,
}

impl Options {
    fn from_env() -> Result<Self, anyhow::Error> {
        use lexopt::prelude::*;

        let mut parser = lexopt::Parser::from_env();
        let mut command = None;
        let mut config = None;

        while let Some(arg) = parser.next()? {
            match arg {
                Value(value) if command.is_none() => {
                    command = Some(match value.to_string_lossy().as_ref() {
                        "run" => Command::Run,
                        "probe" => Command::Probe,
                        other => anyhow::bail!("unknown command `{other}`"),
                    });
                }
                Long("config") => {
                    let value = parser.value()?;
                    config = Some(PathBuf::from(value));
                }
                Long("help") | Short('h') => {
                    println!("{HELP_MSG}");
                    process::exit(0);
                }
                Long("version") => {
                    println!("{NAME} {VERSION}");
                    process::exit(0);
                }
                _ => anyhow::bail!(arg.unexpected()),
            }
        }
        let command = command.ok_or_else(|| anyhow::anyhow!("a command is required; see --help"))?;
        let config =
            config.ok_or_else(|| anyhow::anyhow!("a --config <path> is required; see --help"))?;

        Ok(Self { command, config })
    }
}

fn execute() -> anyhow::Result<i32> {
    let options = Options::from_env()?;
    let config = Config::load(&options.config)
        .with_context(|| format!("couldn't load config {}", options.config.display()))?;

    let level = match logger::env_level() {
        Some(level) => level,
        None => config.log.level()?,
    };
    logger::init(level).ok();

    log::info!(target: "node", "Starting {NAME} {VERSION}..");

    match options.command {
        Command::Probe => probe(&config),
        Command::Run => run(config),
    }
}

fn probe(config: &Config) -> anyhow::Result<i32> {
    let temp = std::sync::Arc::new(RunDir::create(&temp::base_dir(
        config.pipes.temp_dir.as_deref(),
    ))?);
    let registry = Registry::load(config, &BuildContext { temp })?;

    for category in Category::ALL {
        let ids = registry.list(*category);
        println!("{category}s: {}", ids.join(", "));
    }
    println!("configuration OK");

    Ok(0)
}

fn run(config: Config) -> anyhow::Result<i32> {
    let (notify, signals) = chan::bounded(2);
    signals::install(notify)?;

    let outcome = Runtime::init(config, signals)?.run()?;
    println!("{}", outcome.summary);

    Ok(if outcome.interrupted { 130 } else { 0 })
}

/// Map a fatal error onto the documented exit codes.
fn exit_code(err: &anyhow::Error) -> i32 {
    if let Some(e) = err.downcast_ref::<registry::Error>() {
        return if e.is_missing_extension() { 3 } else { 2 };
    }
    if err.downcast_ref::<ConfigError>().is_some() {
        return 2;
    }
    if let Some(e) = err.downcast_ref::<runtime::Error>() {
        return match e {
            runtime::Error::Config(_) => 2,
            runtime::Error::Registry(e) if e.is_missing_extension() => 3,
            runtime::Error::Registry(_) => 2,
            _ => 1,
        };
    }
    1
}

fn main() {
    let code = match execute() {
        Ok(code) => code,
        Err(err) => {
            if log::max_level() == log::LevelFilter::Off {
                eprintln!("Fatal: {err:#}");
            } else if let Some(src) = err.source() {
                log::error!(target: "node", "Fatal: {err}: {src}");
            } else {
                log::error!(target: "node", "Fatal: {err}");
            }
            exit_code(&err)
        }
    };
    process::exit(code);
}
