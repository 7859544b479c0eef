//! The forked parse child. Spawned by the supervisor with stdin/stdout
//! bound to the frame protocol; not meant to be run by hand.

use std::process;

use conveyor::logger;
use conveyor_node::child;

pub const HELP_MSG: &str = r#"
Usage

   conveyor-worker [--memory-high-water <bytes>]

Serves framed parse requests on stdin/stdout. Spawned by conveyor-node;
not meant to be run by hand.
"#;

fn options() -> Result<child::Config, lexopt::Error> {
    use lexopt::prelude::*;

    let mut parser = lexopt::Parser::from_env();
    let mut memory_high_water = 0;

    while let Some(arg) = parser.next()? {
        match arg {
            Long("memory-high-water") => {
                memory_high_water = parser.value()?.parse()?;
            }
            Long("help") | Short('h') => {
                println!("{HELP_MSG}");
                process::exit(0);
            }
            _ => return Err(arg.unexpected()),
        }
    }
    Ok(child::Config { memory_high_water })
}

fn main() {
    // Standard output carries the protocol; log to standard error.
    logger::init_stderr(logger::env_level().unwrap_or(log::Level::Info)).ok();

    let config = match options() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Fatal: {err}");
            process::exit(1);
        }
    };
    if let Err(err) = child::run(config) {
        log::error!(target: "child", "Fatal: {err}");
        process::exit(1);
    }
}
