use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "renderd")]
#[command(about = "Headless-browser rendering service")]
#[command(version)]
pub struct Cli {
    #[arg(long, help = "Port the HTTP listener binds to")]
    pub port: Option<u16>,

    #[arg(long, help = "Address the HTTP listener binds to")]
    pub host: Option<String>,

    #[arg(long, help = "Minimum browser processes kept alive")]
    pub min_browsers: Option<usize>,

    #[arg(long, help = "Maximum browser processes ever launched")]
    pub max_browsers: Option<usize>,

    #[arg(long, help = "Maximum concurrent leases per browser")]
    pub max_contexts: Option<usize>,

    #[arg(long, help = "Chrome executable path")]
    pub chrome_path: Option<String>,

    #[arg(long, help = "Enable verbose logging")]
    pub verbose: bool,
}

impl Cli {
    /// Apply CLI overrides on top of the environment-sourced configuration.
    pub fn apply(&self, config: &mut crate::Config) {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(min) = self.min_browsers {
            config.pool.min_browsers = min;
        }
        if let Some(max) = self.max_browsers {
            config.pool.max_browsers = max;
        }
        if let Some(contexts) = self.max_contexts {
            config.pool.max_contexts_per_browser = contexts;
        }
        if let Some(path) = &self.chrome_path {
            config.chrome_path = Some(path.clone());
        }
    }
}

/// Logging setup: `LOG_LEVEL` drives the filter, `--verbose` bumps the
/// default to debug.
pub fn setup_logging(verbose: bool) -> Result<(), Box<dyn std::error::Error>> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("LOG_LEVEL")
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    Ok(())
}
