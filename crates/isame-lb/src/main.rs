//! isame-lb command-line entry point.
//!
//! ```bash
//! # start the load balancer
//! isame-lb run -c configs/dev.toml
//!
//! # validate a configuration file without starting anything
//! isame-lb check -c configs/dev.toml
//!
//! # print version information
//! isame-lb version
//! ```

use anyhow::Result;
use argh::FromArgs;

use isame_common::Config;
use isame_proxy::LbServer;

/// isame-lb - HTTP/HTTPS reverse-proxy load balancer
#[derive(FromArgs)]
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Run(RunArgs),
    Check(CheckArgs),
    Version(VersionArgs),
}

/// start the load balancer
#[derive(FromArgs)]
#[argh(subcommand, name = "run")]
struct RunArgs {
    /// path to the configuration file
    #[argh(option, short = 'c', default = "\"configs/dev.toml\".into()")]
    config: String,
}

/// validate a configuration file and exit
#[derive(FromArgs)]
#[argh(subcommand, name = "check")]
struct CheckArgs {
    /// path to the configuration file
    #[argh(option, short = 'c', default = "\"configs/dev.toml\".into()")]
    config: String,
}

/// print version information
#[derive(FromArgs)]
#[argh(subcommand, name = "version")]
struct VersionArgs {}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // keep `check` and `version` output clean for scripting
    if matches!(cli.command, Commands::Run(_)) {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    match cli.command {
        Commands::Run(args) => {
            tracing::info!("isame load balancer starting");

            let config = Config::load_with_defaults(&args.config)?;
            if config.upstreams.is_empty() {
                tracing::warn!(
                    "no upstreams configured; every proxied request will be answered with 503"
                );
            }
            tracing::info!(
                service = %config.service,
                version = %config.version,
                upstreams = config.upstreams.len(),
                health_checks = config.health.enabled,
                metrics = config.metrics.enabled,
                "configuration loaded"
            );

            let server = LbServer::new(config)?;
            server.run().await?;

            tracing::info!("isame load balancer stopped");
            Ok(())
        }
        Commands::Check(args) => match Config::load(&args.config) {
            Ok(config) => {
                println!(
                    "{}: OK ({} upstreams, {} backends)",
                    args.config,
                    config.upstreams.len(),
                    config.backend_count()
                );
                Ok(())
            }
            Err(err) => {
                eprintln!("{}: {}", args.config, err);
                std::process::exit(1);
            }
        },
        Commands::Version(_) => {
            println!("isame-lb {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
