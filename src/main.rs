use std::io::{self, BufRead};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use env_logger::Builder;
use log::LevelFilter;

use jtag_chain::cmd;
use jtag_chain::config::SessionConfig;
use jtag_chain::error::Error;
use jtag_chain::session::Session;

#[derive(Debug, clap::Parser)]
#[clap(name = "jtagctl", about = "Drive a JTAG chain and the memory behind it.")]
struct Opts {
    /// Session file describing the cable, the parts and the bus.
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Run these commands and exit instead of reading commands from stdin.
    #[clap(short, long = "exec")]
    exec: Vec<String>,

    /// More logging, repeat for even more.
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbose: u8) {
    let mut builder = Builder::new();
    builder.filter_level(match verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    });
    // RUST_LOG wins over -v
    if let Ok(s) = std::env::var("RUST_LOG") {
        builder.parse_filters(&s);
    }
    builder.init();
}

fn report(err: &Error) {
    eprintln!("error ({}): {err}", err.kind());
}

fn main() -> ExitCode {
    let opts = Opts::parse();
    init_logging(opts.verbose);

    let session = match &opts.config {
        Some(path) => SessionConfig::from_file(path).and_then(|config| config.build()),
        None => Ok(Session::new()),
    };
    let mut session = match session {
        Ok(session) => session,
        Err(err) => {
            report(&err);
            return ExitCode::FAILURE;
        }
    };

    let stdout = io::stdout();
    let mut out = stdout.lock();
    // Commands from stdin carry on after a failure, `--exec` stops at the first one
    let result = if opts.exec.is_empty() {
        let stdin = io::stdin();
        let lines = stdin.lock().lines().map(|l| l.map_err(Error::from));
        cmd::run_script(&mut session, lines, &mut out, true, report)
    } else {
        cmd::run_script(&mut session, opts.exec.iter().cloned().map(Ok), &mut out, false, report)
    };

    match result {
        Ok(0) => ExitCode::SUCCESS,
        Ok(failed) => {
            log::warn!("{failed} commands failed");
            ExitCode::FAILURE
        }
        Err(err) => {
            report(&err);
            ExitCode::FAILURE
        }
    }
}
