use clap::{Arg, Command};
use dmarcator::config::{Config, ListenAddress, DEFAULT_CONFIG_PATH};
use dmarcator::message::header_fields;
use dmarcator::milter::Milter;
use dmarcator::policy::Policy;
use dmarcator::session::{Response, Session};
use log::LevelFilter;
use std::process;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    let matches = Command::new("dmarcator")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Milter rejecting mail that failed DMARC for selected sender domains")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("The configuration file to use")
                .default_value(DEFAULT_CONFIG_PATH),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable debug logging")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Check the configuration, print it and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("test-email")
                .long("test-email")
                .value_name("FILE")
                .help("Evaluate the header of a stored message and exit")
                .action(clap::ArgAction::Set),
        )
        .get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    // Timestamps are added by the service manager
    env_logger::Builder::new()
        .filter_level(log_level)
        .parse_default_env()
        .format_timestamp(None)
        .format_target(false)
        .init();

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or(DEFAULT_CONFIG_PATH);

    let config = match Config::from_file(config_path).and_then(Config::resolve) {
        Ok(config) => config,
        Err(e) => {
            log::error!("{e:#}");
            process::exit(1);
        }
    };

    let (policy, address) = match config.policy().and_then(|p| Ok((p, config.listen_address()?))) {
        Ok(parts) => parts,
        Err(e) => {
            log::error!("{e:#}");
            process::exit(1);
        }
    };

    if matches.get_flag("test-config") {
        print_config(&config, &policy);
        return;
    }

    if let Some(email_file) = matches.get_one::<String>("test-email") {
        test_email_file(policy, email_file);
        return;
    }

    if let ListenAddress::Unix(_) = address {
        // Permissions of the socket created by bind
        unsafe {
            libc::umask(config.umask as libc::mode_t);
        }
    }

    let milter = Milter::new(policy);
    if let Err(e) = milter.run(&address, shutdown_signal()).await {
        log::error!("Failed to serve: {e:#}");
        process::exit(1);
    }
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            log::warn!("Failed to install SIGTERM handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
    log::info!("Received shutdown signal");
}

fn print_config(config: &Config, policy: &Policy) {
    println!("Configuration is valid.");
    println!("Reject domains: {}", policy.reject_domains.len());
    println!();
    match config.to_toml() {
        Ok(text) => print!("{text}"),
        Err(e) => {
            eprintln!("Failed to render configuration: {e}");
            process::exit(1);
        }
    }
}

fn test_email_file(policy: Policy, email_file: &str) {
    let content = match std::fs::read_to_string(email_file) {
        Ok(content) => content,
        Err(e) => {
            eprintln!("Error reading email file {email_file}: {e}");
            process::exit(1);
        }
    };

    let mut session = Session::new(Arc::new(policy));
    session.set_queue_id("TEST");
    session.on_mail_from(false);
    for (name, value) in header_fields(&content) {
        session.on_header(&name, &value);
    }

    match session.on_headers_end() {
        Response::Reject(rejection) => println!("Result: REJECT ({rejection})"),
        Response::Accept | Response::Continue => println!("Result: ACCEPT"),
    }
}
