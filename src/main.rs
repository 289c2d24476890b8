/*!
 * Pulsar - prefork master/worker server
 *
 * Startup: parse the two-flag command line, load and validate the
 * configuration, initialize logging and signals, materialize the first
 * cycle (adopting inherited sockets when the upgrade environment variable
 * is present), optionally daemonize, write the pidfile, and hand control
 * to the master or single-process cycle.
 */

use std::env;
use std::path::PathBuf;
use std::process;

use anyhow::Context;
use clap::{crate_version, Arg, ArgAction, Command};

use pulsar::config::{load_config, DEFAULT_CONFIG_PATH};
use pulsar::core::clock;
use pulsar::cycle::Cycle;
use pulsar::event::accept::AcceptMutex;
use pulsar::process::master::master_process_cycle;
use pulsar::process::worker::single_process_cycle;
use pulsar::process::{signals, ProcessTable, Server};
use pulsar::{daemon, logging, pidfile};

fn main() {
    process::exit(run());
}

fn run() -> i32 {
    let cmd = Command::new("pulsar")
        .version(crate_version!())
        .about("Prefork master/worker server core")
        .arg(
            Arg::new("test")
                .short('t')
                .help("Test the configuration and exit")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .value_name("FILE")
                .help("Configuration file path"),
        );

    let matches = match cmd.try_get_matches() {
        Ok(m) => m,
        Err(e) => {
            use clap::error::ErrorKind;
            let is_info = matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion);
            let _ = e.print();
            // Unknown flags and positional arguments exit 1
            return if is_info { 0 } else { 1 };
        }
    };

    let test_config = matches.get_flag("test");
    let config_path = matches
        .get_one::<String>("config")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    match run_server(test_config, config_path) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("pulsar: {:#}", e);
            1
        }
    }
}

fn run_server(test_config: bool, config_path: PathBuf) -> anyhow::Result<i32> {
    let config = load_config(&config_path)?;
    config.validate()?;

    if test_config {
        println!(
            "the configuration file {} was tested successfully",
            config_path.display()
        );
        return Ok(0);
    }

    let log = logging::init_logging(&config)?;
    signals::init()?;
    clock::update();

    let master = config.master;
    let daemonize = config.daemon;
    let pid_path = config.pid_path.clone();

    let cycle = Cycle::init(config, &log, None)?;
    let inherited = cycle.inherited;

    if daemonize && !inherited {
        daemon::daemonize()?;
    }

    // The upgrading binary parks its pid next to the old master's until the
    // handoff commits
    let pidfile_path = if inherited {
        pidfile::newbin_path(&pid_path)
    } else {
        pid_path.clone()
    };
    pidfile::create(&pidfile_path, process::id())?;

    // Created before any fork so the whole fleet maps the same word
    let accept_mutex = if master && cycle.config.accept_mutex && cycle.config.worker_count() > 1 {
        Some(AcceptMutex::new().context("accept mutex allocation failed")?)
    } else {
        None
    };

    let server = Server {
        cycle,
        procs: ProcessTable::new(),
        accept_mutex,
        args: env::args_os().collect(),
        config_path,
        log,
        noaccepting: false,
        restart: false,
    };

    if master {
        master_process_cycle(server)
    } else {
        single_process_cycle(server)
    }
}
