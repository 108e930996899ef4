mod cli;

use std::process::ExitCode;

use portal_config::toml_loader;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, reload, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    let args = cli::parse();

    // Installed before the config is read so loader messages are kept.
    // RUST_LOG wins over the configured level.
    let from_env = EnvFilter::try_from_default_env().ok();
    let env_pinned = from_env.is_some();
    let initial = from_env.unwrap_or_else(|| {
        EnvFilter::new(cli::log_directive(args.log_level.unwrap_or_default()))
    });
    let (filter, filter_handle) = reload::Layer::new(initial);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    // Validated once, after flags are applied.
    let loaded = match args.config.as_deref() {
        Some(path) => toml_loader::load_from_path(path),
        None => toml_loader::load_default(),
    };
    let mut config = match loaded {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Failed to load config");
            return ExitCode::FAILURE;
        }
    };
    args.apply(&mut config);
    if let Err(e) = portal_config::validation::validate(&config) {
        tracing::error!(error = %e, "Invalid config");
        return ExitCode::FAILURE;
    }

    if !env_pinned {
        let directive = cli::log_directive(config.logging.level);
        if let Err(e) = filter_handle.reload(EnvFilter::new(directive)) {
            tracing::warn!(error = %e, "Could not apply configured log level");
        }
    }

    if args.print_config {
        println!("{}", portal_config::config_to_json(&config));
        return ExitCode::SUCCESS;
    }

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    match portal_relay::run(&config, shutdown).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "portal-relay failed");
            ExitCode::FAILURE
        }
    }
}
