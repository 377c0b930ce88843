//! Endpoint CLI - main entry point

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use endpoint_cli::{
    cli::{Cli, Commands},
    config::{load_config, to_toml},
    demo::{run_demo, DemoOptions},
};

fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let cli = Cli::parse();

    // Initialize logging
    setup_logging(cli.verbose);

    // Load configuration
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Demo {
            capacity,
            messages,
            fail_after,
        } => {
            let options = DemoOptions {
                capacity,
                messages,
                fail_after,
                ..DemoOptions::default()
            };
            let report = run_demo(&config, &options)?;

            println!("sent:       {}", report.sent);
            println!("succeeded:  {}", report.succeeded);
            println!("failed:     {}", report.failed);
            println!("overflowed: {}", report.stats.overflowed);
            let transitions: Vec<String> =
                report.transitions.iter().map(ToString::to_string).collect();
            println!("states:     {}", transitions.join(" -> "));
        }
        Commands::Config => {
            print!("{}", to_toml(&config)?);
        }
    }

    info!("Endpoint CLI exited successfully");
    Ok(())
}

/// Setup logging based on verbosity level; `RUST_LOG` takes precedence
fn setup_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
