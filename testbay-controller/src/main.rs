#![forbid(unsafe_code)]

use std::path::PathBuf;

use clap::{command, value_parser, Arg, ArgAction};
use color_eyre::eyre::{Result, WrapErr};
use testbay::bootstrap::BootstrapTemplate;
use testbay::center::JobCenter;
use testbay::hooks::Hooks;
use testbay::log::*;
use testbay::session::SessionStore;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::util::SubscriberInitExt;

mod config;
mod http_server;

fn install_logger(verbose: usize, quiet: bool, json: bool) {
    let level = if quiet && verbose == 0 {
        LevelFilter::ERROR
    } else {
        match verbose {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    };
    let logging_config = tracing_subscriber::fmt::SubscriberBuilder::default()
        .with_timer(tracing_subscriber::fmt::time::UtcTime::new(
            time::macros::format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"),
        ))
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::NONE)
        .with_max_level(level);

    if json {
        logging_config.json().finish().init();
    } else {
        logging_config.compact().finish().init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = command!()
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .help("Path to the configuration file.")
                .value_parser(value_parser!(PathBuf))
                .default_value("/etc/testbay/testbay.yaml"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Turn debugging information on. Overrides -q. Can specify up to -vv.")
                .action(ArgAction::Count),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .help("Only log errors. Overridden by -v.")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .help("Log JSON lines instead of text.")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    install_logger(
        matches.get_count("verbose") as usize,
        matches.get_flag("quiet"),
        matches.get_flag("json"),
    );
    install_color_eyre()?;

    let config_path = matches
        .get_one::<PathBuf>("config")
        .cloned()
        .unwrap_or_else(|| PathBuf::from("/etc/testbay/testbay.yaml"));
    let config = config::Config::load(&config_path).await?;

    let inventory = config.inventory()?;
    inventory
        .check()
        .await
        .wrap_err("inventory check failed")?;

    tokio::fs::create_dir_all(&config.session_path)
        .await
        .wrap_err_with(|| format!("can't create {}", config.session_path.display()))?;
    let mut center = JobCenter::new(SessionStore::new(&config.session_path));
    if let Some(hooks_path) = &config.hooks_path {
        center = center.with_hooks(Hooks::new(hooks_path));
    }
    if let Some(template) = &config.bootstrap_template {
        center = center.with_bootstrap(BootstrapTemplate::from_file(template).await?);
    }
    let recovered = center.recover(&inventory).await?;
    info!("controller: recovered {} jobs", recovered);

    let state = http_server::AppState::new(center, inventory, config.backends.primary_profile.clone());
    http_server::run_server(config.listen, state).await
}
