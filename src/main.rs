use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod api;
mod browser;
mod config;
mod database;
mod error;
mod extract;
mod models;
mod price_parser;
mod spreadsheet;
#[cfg(test)]
mod test_support;
mod traits;

use config::Config;
use price_parser::{Mode, PriceParser};

/// Wildberries price scraper: seller API, storefront browser, or both
#[derive(Parser)]
#[command(name = "wb-price-parser", version)]
struct Cli {
    /// Repeat the run on a cron schedule (with seconds), e.g. "0 0 9 * * *".
    /// Falls back to the SCHEDULE variable.
    #[arg(long, global = true)]
    schedule: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List every nmID of every cabinet into the article workbook
    LoadIds,
    /// Prices, titles and cabinets from the seller API
    Api {
        /// Price the whole catalog instead of the article list
        #[arg(long)]
        all: bool,
    },
    /// Storefront prices through a WebDriver browser
    Browser {
        /// Scrape a seller or brand listing instead of the article list
        #[arg(long = "seller-url")]
        seller_urls: Vec<String>,
    },
    /// API data plus loyalty prices from the storefront
    Hybrid,
}

impl From<Command> for Mode {
    fn from(command: Command) -> Self {
        match command {
            Command::LoadIds => Self::LoadIds,
            Command::Api { all } => Self::Api { all },
            Command::Browser { seller_urls } => Self::Browser { seller_urls },
            Command::Hybrid => Self::Hybrid,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    let schedule = cli.schedule.or_else(|| config.schedule.clone());
    let mode = Mode::from(cli.command);

    info!("Starting WB price parser ({})", mode.name());

    let parser = PriceParser::new(config).await?;

    let Some(schedule) = schedule else {
        return parser.run(&mode).await;
    };

    // Run once immediately, then on schedule
    if let Err(e) = parser.run(&mode).await {
        error!("Error during initial run: {:#}", e);
    }

    let sched = JobScheduler::new().await?;
    let running = Arc::new(Mutex::new(()));

    let job_parser = parser.clone();
    sched
        .add(Job::new_async(schedule.as_str(), move |_uuid, _l| {
            let parser = job_parser.clone();
            let mode = mode.clone();
            let running = running.clone();
            Box::pin(async move {
                let Ok(_guard) = running.try_lock() else {
                    warn!("Previous run is still in progress, skipping this one");
                    return;
                };
                if let Err(e) = parser.run(&mode).await {
                    error!("Error during scheduled run: {:#}", e);
                }
            })
        })?)
        .await?;

    info!("Scheduler started with '{}'", schedule);
    sched.start().await?;

    // Keep the program running
    loop {
        tokio::time::sleep(tokio::time::Duration::from_secs(30)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subcommands_map_to_modes() {
        let cli = Cli::try_parse_from([
            "wb-price-parser",
            "browser",
            "--seller-url",
            "https://www.wildberries.ru/seller/1",
            "--seller-url",
            "https://www.wildberries.ru/brands/x",
        ])
        .unwrap();
        assert_eq!(
            Mode::from(cli.command),
            Mode::Browser {
                seller_urls: vec![
                    "https://www.wildberries.ru/seller/1".into(),
                    "https://www.wildberries.ru/brands/x".into()
                ]
            }
        );

        let cli = Cli::try_parse_from(["wb-price-parser", "api", "--all", "--schedule", "0 0 9 * * *"]).unwrap();
        assert_eq!(Mode::from(cli.command), Mode::Api { all: true });
        assert_eq!(cli.schedule.as_deref(), Some("0 0 9 * * *"));

        assert!(Cli::try_parse_from(["wb-price-parser"]).is_err());
    }
}
