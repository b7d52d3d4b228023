//! Fixed-size batches of browser tabs: open, extract, retry, close

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, warn};

use crate::config::BrowserConfig;
use crate::extract::{PageExtractor, PageOutcome};
use crate::models::ProductLink;

/// Index of a tab within the current batch
pub type TabId = usize;

/// What a tab showed when it was read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageSnapshot {
    pub title: String,
    pub html: String,
}

/// A set of browser tabs that can be opened, read and reloaded
#[async_trait]
pub trait TabPool: Send {
    /// Open one tab per link. `None` marks a tab that failed to open.
    async fn open_tabs(&mut self, links: &[ProductLink]) -> Result<Vec<Option<TabId>>>;

    /// Title and source of a tab, making sure it shows `link`
    async fn snapshot(&mut self, tab: TabId, link: &ProductLink) -> Result<PageSnapshot>;

    async fn reload(&mut self, tab: TabId) -> Result<()>;

    /// Close every tab of the batch
    async fn close_tabs(&mut self) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub captcha_wait: Duration,
    pub captcha_retries: u32,
    pub reload_wait: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &BrowserConfig) -> Self {
        Self {
            captcha_wait: config.captcha_wait,
            captcha_retries: config.captcha_retries,
            reload_wait: config.reload_wait,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TabOutcome {
    Page(PageOutcome),
    /// The tab never opened
    TabMissing,
    /// Reading the tab failed
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PageResult {
    pub link: ProductLink,
    pub outcome: TabOutcome,
}

/// Scrapes links one batch of tabs at a time
pub struct BatchScraper<P> {
    pool: P,
    extractor: PageExtractor,
    policy: RetryPolicy,
}

impl<P: TabPool> BatchScraper<P> {
    pub fn new(pool: P, extractor: PageExtractor, policy: RetryPolicy) -> Self {
        Self {
            pool,
            extractor,
            policy,
        }
    }

    pub fn into_pool(self) -> P {
        self.pool
    }

    /// Results come back in the order of `links`
    pub async fn scrape_batch(&mut self, links: &[ProductLink]) -> Result<Vec<PageResult>> {
        let tabs = match self.pool.open_tabs(links).await {
            Ok(tabs) => tabs,
            Err(e) => {
                self.close_quietly().await;
                return Err(e);
            }
        };

        let mut results = Vec::with_capacity(links.len());
        for (index, link) in links.iter().enumerate() {
            let outcome = match tabs.get(index).copied().flatten() {
                Some(tab) => match self.scrape_tab(tab, link).await {
                    Ok(outcome) => TabOutcome::Page(outcome),
                    Err(e) => {
                        warn!("Failed to read tab for {}: {:#}", link.article, e);
                        TabOutcome::Failed(e.to_string())
                    }
                },
                None => TabOutcome::TabMissing,
            };
            results.push(PageResult {
                link: link.clone(),
                outcome,
            });
        }

        self.close_quietly().await;
        Ok(results)
    }

    async fn scrape_tab(&mut self, tab: TabId, link: &ProductLink) -> Result<PageOutcome> {
        let mut outcome = self.read(tab, link).await?;

        let mut attempt = 0;
        while outcome.is_challenge() && attempt < self.policy.captcha_retries {
            attempt += 1;
            warn!(
                "{:?} on {}, waiting {:?} before reload ({}/{})",
                outcome, link.article, self.policy.captcha_wait, attempt, self.policy.captcha_retries
            );
            tokio::time::sleep(self.policy.captcha_wait).await;
            self.pool.reload(tab).await?;
            outcome = self.read(tab, link).await?;
        }

        if outcome == PageOutcome::PriceMissing {
            debug!("No price on {}, reloading once", link.article);
            self.pool.reload(tab).await?;
            tokio::time::sleep(self.policy.reload_wait).await;
            outcome = self.read(tab, link).await?;
        }

        Ok(outcome)
    }

    async fn read(&mut self, tab: TabId, link: &ProductLink) -> Result<PageOutcome> {
        let snapshot = self.pool.snapshot(tab, link).await?;
        Ok(self.extractor.extract(&snapshot.title, &snapshot.html))
    }

    async fn close_quietly(&mut self) {
        if let Err(e) = self.pool.close_tabs().await {
            warn!("Failed to close batch tabs: {:#}", e);
        }
    }
}

/// Counts processed rows and says when a checkpoint is due
#[derive(Debug)]
pub struct Checkpointer {
    every: usize,
    pending: usize,
}

impl Checkpointer {
    pub fn new(every: usize) -> Self {
        Self {
            every: every.max(1),
            pending: 0,
        }
    }

    pub fn record(&mut self, rows: usize) -> bool {
        self.pending += rows;
        if self.pending >= self.every {
            self.pending = 0;
            true
        } else {
            false
        }
    }
}

/// Uniform pause between `min` and `max`
pub fn random_delay(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let millis = rand::thread_rng().gen_range(min.as_millis()..=max.as_millis());
    Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX))
}
