use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use followsnap::{BrowserConfig, PollSettings};
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// CLI arguments
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Snapshot the outstanding follow-ups dashboard table into Postgres"
)]
pub struct Args {
    /// Dashboard URL to log into
    #[arg(
        long,
        env = "FOLLOWSNAP_DASHBOARD_URL",
        default_value = "https://sys.callpotential.com/ui/v2/dashboard"
    )]
    pub dashboard_url: String,

    /// Postgres connection string; required unless --dry-run
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: Option<String>,

    /// Browser binary to launch
    #[arg(long, env = "FOLLOWSNAP_BROWSER", default_value = "chromium")]
    pub browser: PathBuf,

    /// DevTools port the browser listens on
    #[arg(long, default_value_t = 9222)]
    pub devtools_port: u16,

    /// Attach to an already-running browser instead of launching one
    #[arg(long)]
    pub attach: bool,

    /// Show the browser window instead of running headless
    #[arg(long)]
    pub headed: bool,

    /// Table-populated probes before giving up
    #[arg(long, default_value_t = 20)]
    pub poll_attempts: u32,

    /// Seconds between probes
    #[arg(long, default_value_t = 3)]
    pub poll_interval: u64,

    /// Absolute floor of non-zero count cells for a populated table
    #[arg(long, default_value_t = 10)]
    pub min_nonzero: u32,

    /// Fraction of rows that must show a non-zero count cell
    #[arg(long, default_value_t = 0.05)]
    pub nonzero_fraction: f64,

    /// Directory for failure screenshots
    #[arg(long, default_value = "screenshots")]
    pub screenshot_dir: PathBuf,

    /// Print extracted records as JSON instead of writing to the database
    #[arg(long)]
    pub dry_run: bool,
}

impl Args {
    pub fn browser_config(&self) -> BrowserConfig {
        BrowserConfig {
            binary: self.browser.clone(),
            debug_port: self.devtools_port,
            headless: !self.headed,
            attach: self.attach,
            ..BrowserConfig::default()
        }
    }

    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            max_attempts: self.poll_attempts,
            interval: Duration::from_secs(self.poll_interval),
            min_nonzero: self.min_nonzero,
            nonzero_fraction: self.nonzero_fraction,
        }
    }
}

pub fn init_logging() -> Result<()> {
    let log_level = std::env::var("LOG_LEVEL")
        .map(|level| match level.to_lowercase().as_str() {
            "error" => Level::ERROR,
            "warn" => Level::WARN,
            "debug" => Level::DEBUG,
            "trace" => Level::TRACE,
            _ => Level::INFO,
        })
        .unwrap_or(Level::INFO);

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(log_level.into()))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults() {
        let args = Args::try_parse_from(["followsnap"]).unwrap();
        assert_eq!(args.devtools_port, 9222);
        assert_eq!(args.poll_attempts, 20);
        assert_eq!(args.poll_interval, 3);
        assert_eq!(args.min_nonzero, 10);
        assert!((args.nonzero_fraction - 0.05).abs() < f64::EPSILON);
        assert_eq!(args.screenshot_dir, PathBuf::from("screenshots"));
        assert!(!args.attach);
        assert!(!args.headed);
        assert!(!args.dry_run);
    }

    #[test]
    fn test_headed_flag_disables_headless() {
        let args = Args::try_parse_from(["followsnap", "--headed", "--devtools-port", "9400"])
            .unwrap();
        let config = args.browser_config();
        assert!(!config.headless);
        assert_eq!(config.debug_port, 9400);
    }

    #[test]
    fn test_poll_settings_mapping() {
        let args = Args::try_parse_from([
            "followsnap",
            "--poll-attempts",
            "5",
            "--poll-interval",
            "1",
        ])
        .unwrap();
        let settings = args.poll_settings();
        assert_eq!(settings.max_attempts, 5);
        assert_eq!(settings.interval, Duration::from_secs(1));
    }
}
