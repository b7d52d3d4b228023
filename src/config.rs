//! Environment-driven configuration
//!
//! Every setting comes from the process environment, optionally seeded from a
//! `.env` file. Cabinet tokens live in variables named after the cabinet, e.g.
//! `COSMO=eyJhbGc...`.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{info, warn};

use crate::models::Cabinet;

const DEFAULT_CABINETS: &str = "COSMO,MMA,MAB,MAU,DREAMLAB,BEAUTYLAB";
const DEFAULT_ARTICLE_SHEETS: &str = "Данные для парсера ВБ,WBarticules,WB,Артикулы,Sheet1";
const MAX_PRICES_BATCH: usize = 1000;

#[derive(Debug, Clone)]
pub struct Config {
    pub cabinets: Vec<Cabinet>,
    pub api: ApiConfig,
    pub browser: BrowserConfig,
    pub spreadsheet: SpreadsheetConfig,
    pub google: Option<GoogleSheetConfig>,
    pub database_url: String,
    pub resume: bool,
    pub schedule: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub prices_url: String,
    pub content_url: String,
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_base: Duration,
    pub page_delay: Duration,
    pub batch_size: usize,
}

#[derive(Debug, Clone)]
pub struct BrowserConfig {
    pub webdriver_url: String,
    pub headless: bool,
    /// `host:port` of a Chrome started with `--remote-debugging-port`
    pub debugger_address: Option<String>,
    pub parallel_tabs: usize,
    pub tab_open_delay: Duration,
    pub page_settle: Duration,
    pub batch_delay_min: Duration,
    pub batch_delay_max: Duration,
    pub captcha_wait: Duration,
    pub captcha_retries: u32,
    pub reload_wait: Duration,
    pub checkpoint_every: usize,
    pub cookies_file: Option<String>,
    pub wait_for_login: bool,
    pub login_timeout: Duration,
    pub login_cookie: String,
    pub max_catalog_pages: u32,
}

#[derive(Debug, Clone)]
pub struct SpreadsheetConfig {
    pub articles_file: String,
    pub article_sheets: Vec<String>,
    pub output_file: String,
    pub output_sheet: String,
}

#[derive(Debug, Clone)]
pub struct GoogleSheetConfig {
    pub api_url: String,
    pub spreadsheet_id: String,
    pub worksheet: String,
    pub credentials_file: String,
    pub append_only: bool,
}

impl Config {
    /// Load `.env` (if any) and read the process environment
    pub fn from_env() -> Result<Self> {
        if let Ok(path) = dotenvy::dotenv() {
            info!("Loaded settings from {}", path.display());
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let cabinets = env
            .list("WB_CABINETS", DEFAULT_CABINETS)
            .into_iter()
            .filter_map(|name| match env.get(&name) {
                Some(token) => Some(Cabinet { name, token }),
                None => {
                    warn!("No API token for cabinet {}, skipping it", name);
                    None
                }
            })
            .collect();

        let api = ApiConfig {
            prices_url: env.string(
                "WB_PRICES_API_URL",
                "https://discounts-prices-api.wildberries.ru/api/v2/list/goods/filter",
            ),
            content_url: env.string(
                "WB_CONTENT_API_URL",
                "https://content-api.wildberries.ru/content/v2/get/cards/list",
            ),
            timeout: Duration::from_secs(env.parse("API_TIMEOUT_SECS", 30)?),
            max_retries: env.parse("API_MAX_RETRIES", 3)?,
            retry_base: Duration::from_millis(env.parse("API_RETRY_BASE_MS", 500)?),
            page_delay: Duration::from_millis(env.parse("API_PAGE_DELAY_MS", 200)?),
            batch_size: env
                .parse("API_BATCH_SIZE", MAX_PRICES_BATCH)?
                .clamp(1, MAX_PRICES_BATCH),
        };

        let batch_delay_min = Duration::from_millis(env.parse("BATCH_DELAY_MIN_MS", 500)?);
        let batch_delay_max = Duration::from_millis(env.parse("BATCH_DELAY_MAX_MS", 1000)?);
        if batch_delay_max < batch_delay_min {
            bail!("BATCH_DELAY_MAX_MS must not be lower than BATCH_DELAY_MIN_MS");
        }

        let browser = BrowserConfig {
            webdriver_url: env.string("WEBDRIVER_URL", "http://localhost:9515"),
            headless: env.flag("HEADLESS_MODE", false)?,
            debugger_address: env.get("CHROME_DEBUGGER_ADDRESS"),
            parallel_tabs: env.parse::<usize>("PARALLEL_TABS", 10)?.max(1),
            tab_open_delay: Duration::from_millis(env.parse("TAB_OPEN_DELAY_MS", 300)?),
            page_settle: Duration::from_millis(env.parse("PAGE_SETTLE_MS", 2000)?),
            batch_delay_min,
            batch_delay_max,
            captcha_wait: Duration::from_secs(env.parse("CAPTCHA_WAIT_SECS", 30)?),
            captcha_retries: env.parse("CAPTCHA_RETRIES", 2)?,
            reload_wait: Duration::from_secs(env.parse("RELOAD_WAIT_SECS", 5)?),
            checkpoint_every: env.parse::<usize>("CHECKPOINT_EVERY", 20)?.max(1),
            cookies_file: env.get("COOKIES_FILE"),
            wait_for_login: env.flag("WAIT_FOR_MANUAL_LOGIN", false)?,
            login_timeout: Duration::from_secs(env.parse("MANUAL_LOGIN_TIMEOUT", 120)?),
            login_cookie: env.string("LOGIN_COOKIE", "x_wbaas_token"),
            max_catalog_pages: env.parse("MAX_CATALOG_PAGES", 10)?,
        };

        let spreadsheet = SpreadsheetConfig {
            articles_file: env.string("ARTICLES_FILE", "Articles.xlsx"),
            article_sheets: env.list("ARTICLE_SHEET_NAMES", DEFAULT_ARTICLE_SHEETS),
            output_file: env.string("OUTPUT_FILE", "data/wb_prices.xlsx"),
            output_sheet: env.string("OUTPUT_SHEET", "Парсер ВБ"),
        };

        let google = if env.flag("GOOGLE_SHEETS_ENABLED", false)? {
            let url = env
                .get("GOOGLE_SHEET_URL")
                .context("GOOGLE_SHEETS_ENABLED is set but GOOGLE_SHEET_URL is empty")?;
            let spreadsheet_id = spreadsheet_id_from_url(&url)
                .with_context(|| format!("Cannot find a spreadsheet id in {url}"))?;
            Some(GoogleSheetConfig {
                api_url: env.string(
                    "GOOGLE_SHEETS_API_URL",
                    "https://sheets.googleapis.com/v4/spreadsheets",
                ),
                spreadsheet_id,
                worksheet: env.string("GOOGLE_SHEET_NAME", "Лист1"),
                credentials_file: env.string("GOOGLE_SERVICE_ACCOUNT_FILE", "google-credentials.json"),
                append_only: env.flag("GOOGLE_SHEET_APPEND_ONLY", true)?,
            })
        } else {
            None
        };

        Ok(Self {
            cabinets,
            api,
            browser,
            spreadsheet,
            google,
            database_url: env.string("DATABASE_URL", "sqlite:data/prices.db"),
            resume: env.flag("RESUME", true)?,
            schedule: env.get("SCHEDULE"),
        })
    }

    /// Cabinets with a token, or an error when none is configured
    pub fn require_cabinets(&self) -> Result<&[Cabinet]> {
        if self.cabinets.is_empty() {
            bail!(
                "No cabinet API tokens found. Put one line per cabinet into .env, e.g. COSMO=<token>"
            );
        }
        Ok(&self.cabinets)
    }
}

/// Extract the id from `https://docs.google.com/spreadsheets/d/<id>/edit`.
/// A bare id is accepted as is.
pub fn spreadsheet_id_from_url(url: &str) -> Option<String> {
    let url = url.trim();
    if let Some((_, rest)) = url.split_once("/d/") {
        let id = rest.split(['/', '?', '#']).next().unwrap_or_default();
        return (!id.is_empty()).then(|| id.to_string());
    }
    let bare = !url.is_empty() && url.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    bare.then(|| url.to_string())
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn list(&self, key: &str, default: &str) -> Vec<String> {
        self.string(key, default)
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(ToString::to_string)
            .collect()
    }

    fn flag(&self, key: &str, default: bool) -> Result<bool> {
        match self.get(key) {
            None => Ok(default),
            Some(value) => match value.to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(true),
                "false" | "0" | "no" | "off" => Ok(false),
                other => bail!("{key} must be a boolean, got '{other}'"),
            },
        }
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            None => Ok(default),
            Some(value) => value
                .parse()
                .map_err(|e| anyhow::anyhow!("{key} has an invalid value '{value}': {e}")),
        }
    }
}
