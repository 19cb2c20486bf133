extern crate clap;
extern crate nimbusio;
#[macro_use]
extern crate slog;
extern crate sloggers;
#[macro_use]
extern crate trackable;

use clap::{App, Arg, ArgMatches, SubCommand};
use sloggers::Build;
use std::env;
use trackable::error::Failure;

use nimbusio::daemon::{self, NimbusioDaemonBuilder};
use nimbusio::{Error, NimbusioConfig, Result};

fn main() {
    let long_version = format!(
        "{} ({}, {})",
        env!("CARGO_PKG_VERSION"),
        nimbusio::build_information::BUILD_PROFILE,
        nimbusio::build_information::BUILD_RUSTC_VERSION
    );
    let matches = App::new("nimbusio")
        .version(env!("CARGO_PKG_VERSION"))
        .long_version(long_version.as_str())
        .subcommand(
            SubCommand::with_name("start")
                .about("Starts the data writers of the local nodes")
                .arg(config_file_arg())
                .arg(
                    Arg::with_name("SAMPLING_RATE")
                        .long("sampling-rate")
                        .takes_value(true)
                        .default_value("0.001"),
                )
                .arg(
                    Arg::with_name("EXECUTOR_THREADS")
                        .long("threads")
                        .takes_value(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("check-nodes")
                .about("Loads the node file and shows the reachability of each node")
                .arg(
                    Arg::with_name("NODE_FILE")
                        .long("node-file")
                        .takes_value(true)
                        .default_value("nodes.yml"),
                ),
        )
        .arg(
            Arg::with_name("LOGLEVEL")
                .short("l")
                .long("loglevel")
                .takes_value(true)
                .possible_values(&["debug", "info", "warning"])
                .default_value("info"),
        )
        .arg(
            Arg::with_name("LOGFILE")
                .long("logfile")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("MAX_CONCURRENT_LOGS")
                .long("max_concurrent_logs")
                .takes_value(true)
                .default_value("4096"),
        )
        .get_matches();

    // Logger
    let loglevel = match matches.value_of("LOGLEVEL").unwrap() {
        "debug" => sloggers::types::Severity::Debug,
        "info" => sloggers::types::Severity::Info,
        "warning" => sloggers::types::Severity::Warning,
        _ => unreachable!(),
    };
    let max_concurrent_logs = track_try_unwrap!(matches
        .value_of("MAX_CONCURRENT_LOGS")
        .unwrap()
        .parse()
        .map_err(Failure::from_error));
    let logger_builder = if let Some(filepath) = matches.value_of("LOGFILE") {
        let mut builder = sloggers::file::FileLoggerBuilder::new(filepath);
        builder.level(loglevel);
        builder.channel_size(max_concurrent_logs);
        sloggers::LoggerBuilder::File(builder)
    } else {
        let mut builder = sloggers::terminal::TerminalLoggerBuilder::new();
        builder.level(loglevel);
        builder.channel_size(max_concurrent_logs);
        sloggers::LoggerBuilder::Terminal(builder)
    };

    // SubCommands
    if let Some(matches) = matches.subcommand_matches("start") {
        // START DATA WRITERS
        let logger = track_try_unwrap!(logger_builder.build());
        let config = track_try_unwrap!(load_config(matches));
        let logger = logger.new(o!("shard" => config.shard_id));

        let mut daemon = NimbusioDaemonBuilder::new(logger);
        daemon.sampling_rate = track_try_unwrap!(matches
            .value_of("SAMPLING_RATE")
            .unwrap()
            .parse()
            .map_err(Error::from));
        if let Some(threads) = matches.value_of("EXECUTOR_THREADS") {
            daemon.executor_threads = track_try_unwrap!(threads.parse().map_err(Error::from));
        }

        let daemon = track_try_unwrap!(daemon.finish(config));
        track_try_unwrap!(daemon.run());

        // NOTE: ログ出力(非同期)用に少し待機
        std::thread::sleep(std::time::Duration::from_millis(100));
    } else if let Some(matches) = matches.subcommand_matches("check-nodes") {
        // CHECK NODES
        let logger = track_try_unwrap!(logger_builder.build());
        let node_file = matches.value_of("NODE_FILE").unwrap();
        let nodes = track_try_unwrap!(daemon::check_nodes(&logger, node_file));
        for (node, handoff) in nodes {
            let handoff = handoff.map_or_else(|| "-".to_owned(), |h| h.to_string());
            println!(
                "{}\t{}\t{}\treachable={}\thandoff={}",
                node.id, node.name, node.addr, node.reachable, handoff
            );
        }

        // NOTE: ログ出力(非同期)用に少し待機
        std::thread::sleep(std::time::Duration::from_millis(100));
    } else {
        println!("Usage: {}", matches.usage());
        std::process::exit(1);
    }
}

fn config_file_arg<'a, 'b>() -> Arg<'a, 'b> {
    Arg::with_name("CONFIG_FILE")
        .help(
            "Sets the configuration file \
             (the default is the value of NIMBUSIO_CONFIG environment variable)",
        )
        .long("config")
        .takes_value(true)
}

/// 設定ファイルを読み込む。ファイルが指定されていなければデフォルト値を使う。
fn load_config(matches: &ArgMatches) -> Result<NimbusioConfig> {
    let path = matches
        .value_of("CONFIG_FILE")
        .map(|v| v.to_string())
        .or_else(|| env::var("NIMBUSIO_CONFIG").ok());
    if let Some(path) = path {
        track!(NimbusioConfig::from_yaml(path))
    } else {
        Ok(NimbusioConfig::default())
    }
}
