//! WebDriver session on the storefront
//!
//! One Chrome session, driven serially. Batches of product pages are opened
//! as extra tabs next to a main window that is never closed.

pub mod batch;
pub mod catalog;

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use thirtyfour::prelude::*;
use thirtyfour::{ChromiumLikeCapabilities, Cookie, WindowHandle};
use tracing::{debug, info, warn};

use crate::config::BrowserConfig;
use crate::extract::{CatalogExtractor, article_from_url};
use crate::models::ProductLink;
use batch::{PageSnapshot, TabId, TabPool};
use catalog::{ListingPages, walk_catalog};

const STOREFRONT_HOME: &str = "https://www.wildberries.ru";
const CAPTCHA_TITLE: &str = "Почти готово";
const LOGIN_POLL_INTERVAL: Duration = Duration::from_secs(2);
const WALLET_CLICK_SETTLE: Duration = Duration::from_millis(500);
const SCROLL_STEP_DELAY: Duration = Duration::from_millis(400);
const MAX_SCROLL_STEPS: usize = 40;

pub struct BrowserSession {
    driver: WebDriver,
    main_window: WindowHandle,
    /// Handles of the current batch, indexed by `TabId`
    tabs: Vec<WindowHandle>,
    wallet_button: Vec<String>,
    config: BrowserConfig,
}

impl BrowserSession {
    /// Connect to the WebDriver server, or attach to a Chrome that was
    /// started with remote debugging when `debugger_address` is set.
    pub async fn start(config: &BrowserConfig, wallet_button: &[String]) -> Result<Self> {
        let mut caps = DesiredCapabilities::chrome();
        match &config.debugger_address {
            Some(address) => {
                info!("Attaching to running Chrome at {}", address);
                caps.add_experimental_option("debuggerAddress", address.as_str())?;
            }
            None => {
                if config.headless {
                    caps.set_headless()?;
                }
                caps.add_arg("--no-sandbox")?;
                caps.add_arg("--disable-dev-shm-usage")?;
                caps.add_arg("--window-size=1920,1080")?;
            }
        }

        let driver = WebDriver::new(config.webdriver_url.as_str(), caps)
            .await
            .with_context(|| format!("Failed to connect to WebDriver at {}", config.webdriver_url))?;
        let main_window = driver.window().await?;

        info!("Browser session started via {}", config.webdriver_url);

        Ok(Self {
            driver,
            main_window,
            tabs: Vec::new(),
            wallet_button: wallet_button.to_vec(),
            config: config.clone(),
        })
    }

    /// Load cookies saved by a previous run, if the file exists
    pub async fn restore_cookies(&self) -> Result<()> {
        let Some(path) = &self.config.cookies_file else {
            return Ok(());
        };
        if !Path::new(path).exists() {
            debug!("No cookie file at {}", path);
            return Ok(());
        }

        let raw = tokio::fs::read_to_string(path).await?;
        let cookies: Vec<Cookie> =
            serde_json::from_str(&raw).with_context(|| format!("Invalid cookie file {path}"))?;

        // Cookies can only be set on the domain that is currently open
        self.driver.goto(STOREFRONT_HOME).await?;
        let mut restored = 0;
        for cookie in cookies {
            match self.driver.add_cookie(cookie).await {
                Ok(()) => restored += 1,
                Err(e) => debug!("Skipped a cookie: {}", e),
            }
        }
        self.driver.refresh().await?;

        info!("Restored {} cookies from {}", restored, path);
        Ok(())
    }

    pub async fn save_cookies(&self) -> Result<()> {
        let Some(path) = &self.config.cookies_file else {
            return Ok(());
        };

        self.driver.switch_to_window(self.main_window.clone()).await?;
        let cookies = self.driver.get_all_cookies().await?;
        if let Some(parent) = Path::new(path).parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, serde_json::to_string_pretty(&cookies)?).await?;

        info!("Saved {} cookies to {}", cookies.len(), path);
        Ok(())
    }

    /// Give the user time to log in by hand so that loyalty prices show up.
    /// Continues as a guest when the session cookie never appears.
    pub async fn wait_for_login(&self) -> Result<()> {
        if self.has_login_cookie().await {
            info!("Already logged in");
            return Ok(());
        }

        self.driver.goto(STOREFRONT_HOME).await?;
        info!(
            "Log in to the storefront in the browser window; waiting up to {:?}",
            self.config.login_timeout
        );

        let deadline = Instant::now() + self.config.login_timeout;
        while Instant::now() < deadline {
            if self.has_login_cookie().await {
                info!("Login detected");
                return Ok(());
            }
            tokio::time::sleep(LOGIN_POLL_INTERVAL).await;
        }

        warn!(
            "No login within {:?}, continuing as guest; card prices may be missing",
            self.config.login_timeout
        );
        Ok(())
    }

    async fn has_login_cookie(&self) -> bool {
        self.driver
            .get_named_cookie(self.config.login_cookie.as_str())
            .await
            .is_ok()
    }

    /// Walk a seller or brand listing and collect its product links
    pub async fn collect_catalog(
        &self,
        seller_url: &str,
        extractor: &CatalogExtractor,
    ) -> Result<Vec<ProductLink>> {
        self.driver.switch_to_window(self.main_window.clone()).await?;
        walk_catalog(self, extractor, seller_url, self.config.max_catalog_pages).await
    }

    async fn wait_out_captcha(&self) -> Result<()> {
        for attempt in 1..=self.config.captcha_retries {
            if !self.driver.title().await?.contains(CAPTCHA_TITLE) {
                return Ok(());
            }
            warn!(
                "Captcha on catalog page, waiting {:?} ({}/{})",
                self.config.captcha_wait, attempt, self.config.captcha_retries
            );
            tokio::time::sleep(self.config.captcha_wait).await;
            self.driver.refresh().await?;
        }
        Ok(())
    }

    /// Listings load more cards as they scroll
    async fn scroll_to_bottom(&self) -> Result<()> {
        for _ in 0..MAX_SCROLL_STEPS {
            let at_bottom = self
                .driver
                .execute(
                    "window.scrollBy(0, window.innerHeight); \
                     return window.innerHeight + window.scrollY >= document.body.scrollHeight;",
                    Vec::new(),
                )
                .await?;
            if at_bottom.json().as_bool().unwrap_or(true) {
                break;
            }
            tokio::time::sleep(SCROLL_STEP_DELAY).await;
        }
        Ok(())
    }

    /// Some layouts only show the wallet price after its button is clicked
    async fn reveal_wallet_price(&self) {
        for selector in &self.wallet_button {
            if let Ok(button) = self.driver.find(By::Css(selector.as_str())).await
                && button.click().await.is_ok()
            {
                tokio::time::sleep(WALLET_CLICK_SETTLE).await;
                return;
            }
        }
    }

    fn handle(&self, tab: TabId) -> Result<WindowHandle> {
        self.tabs
            .get(tab)
            .cloned()
            .with_context(|| format!("Unknown tab {tab}"))
    }

    pub async fn quit(self) -> Result<()> {
        self.driver.quit().await?;
        info!("Browser session closed");
        Ok(())
    }
}

#[async_trait]
impl ListingPages for BrowserSession {
    async fn listing_html(&self, url: &str) -> Result<String> {
        self.driver.goto(url).await?;
        tokio::time::sleep(self.config.page_settle).await;
        self.wait_out_captcha().await?;
        self.scroll_to_bottom().await?;
        Ok(self.driver.source().await?)
    }
}

#[async_trait]
impl TabPool for BrowserSession {
    async fn open_tabs(&mut self, links: &[ProductLink]) -> Result<Vec<Option<TabId>>> {
        self.tabs.clear();
        let mut ids = Vec::with_capacity(links.len());

        for (index, link) in links.iter().enumerate() {
            let known = self.driver.windows().await?;
            if let Err(e) = self
                .driver
                .execute("window.open(arguments[0], '_blank');", vec![json!(link.url)])
                .await
            {
                warn!("Failed to open tab for {}: {}", link.article, e);
                ids.push(None);
                continue;
            }

            let opened = self
                .driver
                .windows()
                .await?
                .into_iter()
                .find(|handle| !known.contains(handle));
            match opened {
                Some(handle) => {
                    self.tabs.push(handle);
                    ids.push(Some(self.tabs.len() - 1));
                }
                None => {
                    warn!("No new window appeared for {}", link.article);
                    ids.push(None);
                }
            }

            if index + 1 < links.len() {
                tokio::time::sleep(self.config.tab_open_delay).await;
            }
        }

        debug!("Opened {} of {} tabs", self.tabs.len(), links.len());
        tokio::time::sleep(self.config.page_settle).await;
        Ok(ids)
    }

    async fn snapshot(&mut self, tab: TabId, link: &ProductLink) -> Result<PageSnapshot> {
        self.driver.switch_to_window(self.handle(tab)?).await?;

        let current = self.driver.current_url().await?;
        if article_from_url(current.as_str()).as_deref() != Some(link.article.as_str()) {
            debug!("Tab shows {} instead of {}, navigating", current, link.article);
            self.driver.goto(link.url.as_str()).await?;
            tokio::time::sleep(self.config.page_settle).await;
        }

        self.reveal_wallet_price().await;

        Ok(PageSnapshot {
            title: self.driver.title().await?,
            html: self.driver.source().await?,
        })
    }

    async fn reload(&mut self, tab: TabId) -> Result<()> {
        self.driver.switch_to_window(self.handle(tab)?).await?;
        self.driver.refresh().await?;
        Ok(())
    }

    async fn close_tabs(&mut self) -> Result<()> {
        for handle in std::mem::take(&mut self.tabs) {
            if let Err(e) = self.driver.switch_to_window(handle).await {
                debug!("Tab already gone: {}", e);
                continue;
            }
            if let Err(e) = self.driver.close_window().await {
                debug!("Failed to close tab: {}", e);
            }
        }
        self.driver.switch_to_window(self.main_window.clone()).await?;
        Ok(())
    }
}
