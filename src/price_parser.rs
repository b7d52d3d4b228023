use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Instant;

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::api::WbApiClient;
use crate::browser::BrowserSession;
use crate::browser::batch::{BatchScraper, Checkpointer, PageResult, RetryPolicy, TabOutcome, random_delay};
use crate::config::Config;
use crate::database::Database;
use crate::extract::{CatalogExtractor, PageExtractor, PageOutcome, article_from_cell};
use crate::models::{
    Cabinet, PriceInfo, PriceRow, ProductInfo, ProductLink, ScrapeStatus, UNKNOWN_CABINET,
};
use crate::spreadsheet::google::{GoogleSheetsClient, GoogleSheetsSink, sheet_range};
use crate::spreadsheet::{ExcelSink, read_articles, write_articles};
use crate::traits::{CatalogSelectors, PageSelectors, ResultSink};

const DEFAULT_ARTICLES_SHEET: &str = "Данные для парсера ВБ";

/// Which strategy a run uses
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    LoadIds,
    Api { all: bool },
    Browser { seller_urls: Vec<String> },
    Hybrid,
}

impl Mode {
    pub fn name(&self) -> &'static str {
        match self {
            Self::LoadIds => "load-ids",
            Self::Api { all: false } => "api",
            Self::Api { all: true } => "api-all",
            Self::Browser { .. } => "browser",
            Self::Hybrid => "hybrid",
        }
    }
}

/// What the seller API knows about the articles of a run
#[derive(Debug, Default)]
struct ApiData {
    products: HashMap<String, ProductInfo>,
    prices: HashMap<String, PriceInfo>,
}

#[derive(Clone)]
pub struct PriceParser {
    config: Config,
    api: WbApiClient,
    database: Database,
    page_selectors: PageSelectors,
    page_extractor: PageExtractor,
    catalog_extractor: CatalogExtractor,
}

impl PriceParser {
    pub async fn new(config: Config) -> Result<Self> {
        let api = WbApiClient::new(&config.api)?;
        let database = Database::connect(&config.database_url).await?;
        let page_selectors = PageSelectors::default();
        let page_extractor = PageExtractor::new(&page_selectors)?;
        let catalog_extractor = CatalogExtractor::new(&CatalogSelectors::default())?;

        Ok(Self {
            config,
            api,
            database,
            page_selectors,
            page_extractor,
            catalog_extractor,
        })
    }

    pub async fn run(&self, mode: &Mode) -> Result<()> {
        info!("Starting {} run", mode.name());
        match mode {
            Mode::LoadIds => self.load_ids().await,
            Mode::Api { all } => self.run_api(*all).await,
            Mode::Browser { seller_urls } => self.run_browser(seller_urls).await,
            Mode::Hybrid => self.run_hybrid().await,
        }
    }

    /// Write every nmID of every cabinet into the article list workbook
    pub async fn load_ids(&self) -> Result<()> {
        let cabinets = self.config.require_cabinets()?;
        let catalog = self.catalog(cabinets).await;
        if catalog.is_empty() {
            bail!("No cards were listed by any cabinet");
        }

        let mut articles: Vec<(String, String)> = catalog
            .into_iter()
            .map(|product| (product.article, product.cabinet))
            .collect();
        articles.sort_by_key(|(article, _)| article.parse::<i64>().unwrap_or(i64::MAX));

        let sheet = self
            .config
            .spreadsheet
            .article_sheets
            .first()
            .map_or(DEFAULT_ARTICLES_SHEET, String::as_str);
        write_articles(Path::new(&self.config.spreadsheet.articles_file), sheet, &articles)?;

        info!("Loaded {} articles from {} cabinets", articles.len(), cabinets.len());
        Ok(())
    }

    /// Titles, prices and cabinets from the seller API alone
    pub async fn run_api(&self, all: bool) -> Result<()> {
        let cabinets = self.config.require_cabinets()?;
        let catalog = self.catalog(cabinets).await;

        let articles: Vec<String> = if all {
            catalog.iter().map(|p| p.article.clone()).collect()
        } else {
            self.input_articles().await?
        };

        if articles.is_empty() {
            bail!("No articles to price");
        }

        let api = self.api_data(cabinets, catalog, &articles).await;
        let now = Utc::now();
        let rows: Vec<PriceRow> = articles
            .iter()
            .map(|article| {
                api_row(now, article, api.products.get(article), api.prices.get(article))
            })
            .collect();

        let mode = Mode::Api { all };
        let mut run = self.start_run(&mode, &articles, false).await?;
        for row in rows {
            run.push(row);
        }
        self.finish_run(run).await?;
        Ok(())
    }

    /// Storefront prices for the article list, or for seller listings
    pub async fn run_browser(&self, seller_urls: &[String]) -> Result<()> {
        let mode = Mode::Browser {
            seller_urls: seller_urls.to_vec(),
        };
        let links = if seller_urls.is_empty() {
            Some(self.input_links().await?)
        } else {
            None
        };
        self.browse(&mode, links, seller_urls, &ApiData::default()).await
    }

    /// API data first, then the storefront for the loyalty prices
    pub async fn run_hybrid(&self) -> Result<()> {
        let cabinets = self.config.require_cabinets()?;
        let articles = self.input_articles().await?;
        let catalog = self.catalog(cabinets).await;
        let api = self.api_data(cabinets, catalog, &articles).await;

        let links: Vec<ProductLink> = articles
            .iter()
            .map(|article| {
                let mut link = ProductLink::for_article(article.as_str());
                link.title = api.products.get(article).map(|p| p.title.clone());
                link
            })
            .collect();

        self.browse(&Mode::Hybrid, Some(links), &[], &api).await
    }

    async fn browse(
        &self,
        mode: &Mode,
        links: Option<Vec<ProductLink>>,
        seller_urls: &[String],
        api: &ApiData,
    ) -> Result<()> {
        let browser = &self.config.browser;
        let session = BrowserSession::start(browser, &self.page_selectors.wallet_button).await?;

        if let Err(e) = session.restore_cookies().await {
            warn!("Failed to restore cookies: {:#}", e);
        }
        if browser.wait_for_login
            && let Err(e) = session.wait_for_login().await
        {
            warn!("Login wait failed: {:#}", e);
        }

        let links = match links {
            Some(links) => links,
            None => self.collect_links(&session, seller_urls).await,
        };

        let mut scraper = BatchScraper::new(
            session,
            self.page_extractor.clone(),
            RetryPolicy::from_config(browser),
        );
        let outcome = self.scrape_links(mode, &mut scraper, links, api).await;

        let session = scraper.into_pool();
        if let Err(e) = session.save_cookies().await {
            warn!("Failed to save cookies: {:#}", e);
        }
        if let Err(e) = session.quit().await {
            warn!("Failed to close the browser: {:#}", e);
        }

        outcome
    }

    async fn collect_links(&self, session: &BrowserSession, seller_urls: &[String]) -> Vec<ProductLink> {
        let mut links = Vec::new();
        let mut seen = HashSet::new();

        for url in seller_urls {
            match session.collect_catalog(url, &self.catalog_extractor).await {
                Ok(found) => {
                    info!("Collected {} products from {}", found.len(), url);
                    links.extend(found.into_iter().filter(|l| seen.insert(l.article.clone())));
                }
                Err(e) => error!("Failed to collect products from {}: {:#}", url, e),
            }
        }

        links
    }

    async fn scrape_links(
        &self,
        mode: &Mode,
        scraper: &mut BatchScraper<BrowserSession>,
        links: Vec<ProductLink>,
        api: &ApiData,
    ) -> Result<()> {
        if links.is_empty() {
            bail!("No products to scrape");
        }

        let browser = &self.config.browser;
        let articles: Vec<String> = links.iter().map(|l| l.article.clone()).collect();
        let mut run = self.start_run(mode, &articles, self.config.resume).await?;

        let pending: Vec<ProductLink> = links
            .into_iter()
            .filter(|link| !run.is_done(&link.article))
            .collect();
        if pending.len() < articles.len() {
            info!(
                "Resuming: {} of {} products already done",
                articles.len() - pending.len(),
                articles.len()
            );
        }

        let batch_count = pending.len().div_ceil(browser.parallel_tabs);
        let mut checkpointer = Checkpointer::new(browser.checkpoint_every);

        for (index, batch) in pending.chunks(browser.parallel_tabs).enumerate() {
            info!("Batch {}/{}: {} products", index + 1, batch_count, batch.len());

            let results = match scraper.scrape_batch(batch).await {
                Ok(results) => results,
                Err(e) => {
                    error!("Batch {} failed: {:#}", index + 1, e);
                    batch
                        .iter()
                        .map(|link| PageResult {
                            link: link.clone(),
                            outcome: TabOutcome::Failed(e.to_string()),
                        })
                        .collect()
                }
            };

            let now = Utc::now();
            for result in &results {
                let row = browser_row(now, result, api);
                info!(
                    "{} [{}]: after {:?}, card {:?}",
                    row.article, row.status, row.price_after_discount, row.price_with_card
                );
                run.push(row);
            }

            if checkpointer.record(results.len()) {
                run.checkpoint().await;
            }

            if index + 1 < batch_count {
                tokio::time::sleep(random_delay(browser.batch_delay_min, browser.batch_delay_max))
                    .await;
            }
        }

        self.finish_run(run).await?;
        Ok(())
    }

    /// Every card of every cabinet; an article belongs to the first cabinet listing it
    async fn catalog(&self, cabinets: &[Cabinet]) -> Vec<ProductInfo> {
        let mut seen = HashSet::new();
        let mut products = Vec::new();

        for cabinet in cabinets {
            match self.api.list_cards(cabinet).await {
                Ok(cards) => {
                    info!("[{}] {} cards", cabinet.name, cards.len());
                    for card in cards {
                        let article = card.nm_id.to_string();
                        if seen.insert(article.clone()) {
                            products.push(ProductInfo {
                                title: card.display_title(),
                                cabinet: cabinet.name.clone(),
                                article,
                            });
                        }
                    }
                }
                Err(e) if e.is_unauthorized() => warn!("[{}] {}, skipping cabinet", cabinet.name, e),
                Err(e) => error!("[{}] Failed to list cards: {}", cabinet.name, e),
            }
        }

        products
    }

    async fn api_data(&self, cabinets: &[Cabinet], catalog: Vec<ProductInfo>, articles: &[String]) -> ApiData {
        let wanted: HashSet<&str> = articles.iter().map(String::as_str).collect();
        let products = catalog
            .into_iter()
            .filter(|p| wanted.contains(p.article.as_str()))
            .map(|p| (p.article.clone(), p))
            .collect();

        let mut prices: HashMap<String, PriceInfo> = HashMap::new();
        for cabinet in cabinets {
            let missing: Vec<String> = articles
                .iter()
                .filter(|a| !prices.contains_key(*a))
                .cloned()
                .collect();
            if missing.is_empty() {
                break;
            }

            match self.api.fetch_prices(cabinet, &missing).await {
                Ok(found) => {
                    info!("[{}] prices for {} of {} articles", cabinet.name, found.len(), missing.len());
                    prices.extend(found);
                }
                Err(e) if e.is_unauthorized() => warn!("[{}] {}, skipping cabinet", cabinet.name, e),
                Err(e) => error!("[{}] Failed to fetch prices: {}", cabinet.name, e),
            }
        }

        ApiData { products, prices }
    }

    /// Article list from the input workbook, or from the online sheet when
    /// the workbook is missing
    async fn input_articles(&self) -> Result<Vec<String>> {
        let spreadsheet = &self.config.spreadsheet;
        let path = Path::new(&spreadsheet.articles_file);

        let articles = if path.exists() {
            read_articles(path, &spreadsheet.article_sheets)?
        } else if let Some(google) = &self.config.google {
            info!("{} not found, reading articles from the online sheet", path.display());
            let client = GoogleSheetsClient::from_config(google)?;
            let values = client.read_values(&sheet_range(&google.worksheet, "A:B")).await?;
            articles_from_columns(&values)
        } else {
            bail!("Article list {} not found", path.display());
        };

        if articles.is_empty() {
            bail!("No articles found in the article list");
        }
        Ok(articles)
    }

    async fn input_links(&self) -> Result<Vec<ProductLink>> {
        Ok(self
            .input_articles()
            .await?
            .into_iter()
            .map(ProductLink::for_article)
            .collect())
    }

    async fn start_run(&self, mode: &Mode, articles: &[String], resume: bool) -> Result<Run> {
        let input_key = run_key(mode.name(), Utc::now(), articles);
        let key = self.database.open_run(&input_key, mode.name(), resume).await?;
        let done = self.database.completed_rows(&key).await?;

        Ok(Run {
            mode: mode.name(),
            done: done.iter().map(|row| row.article.clone()).collect(),
            order: articles
                .iter()
                .enumerate()
                .map(|(i, a)| (a.clone(), i))
                .collect(),
            sinks: self.sinks(&key),
            key,
            rows: done,
            fresh: Vec::new(),
            started: Instant::now(),
        })
    }

    async fn finish_run(&self, run: Run) -> Result<RunSummary> {
        let key = run.key.clone();
        let summary = run.finish().await;
        self.database.finish_run(&key).await?;
        Ok(summary)
    }

    fn sinks(&self, run_key: &str) -> Vec<Box<dyn ResultSink>> {
        let spreadsheet = &self.config.spreadsheet;
        let mut sinks: Vec<Box<dyn ResultSink>> = vec![
            Box::new(self.database.sink(run_key)),
            Box::new(ExcelSink::new(&spreadsheet.output_file, spreadsheet.output_sheet.as_str())),
        ];

        if let Some(google) = &self.config.google {
            match GoogleSheetsClient::from_config(google) {
                Ok(client) => sinks.push(Box::new(GoogleSheetsSink::new(
                    client,
                    google.worksheet.as_str(),
                    google.append_only,
                ))),
                Err(e) => error!("Google Sheets output disabled: {:#}", e),
            }
        }

        sinks
    }
}

/// Rows of one run and the sinks they go to
struct Run {
    key: String,
    mode: &'static str,
    /// Input position of each article, for output order
    order: HashMap<String, usize>,
    /// Articles restored from an earlier attempt of this run
    done: HashSet<String>,
    rows: Vec<PriceRow>,
    /// Rows not yet handed to the sinks
    fresh: Vec<PriceRow>,
    sinks: Vec<Box<dyn ResultSink>>,
    started: Instant,
}

impl Run {
    fn is_done(&self, article: &str) -> bool {
        self.done.contains(article)
    }

    fn push(&mut self, row: PriceRow) {
        self.fresh.push(row.clone());
        self.rows.push(row);
    }

    /// Hand the rows to every sink; a failing sink does not stop the others
    async fn checkpoint(&mut self) {
        let order = &self.order;
        self.rows
            .sort_by_key(|row| order.get(&row.article).copied().unwrap_or(usize::MAX));

        for sink in &self.sinks {
            if let Err(e) = sink.save(&self.rows, &self.fresh).await {
                error!("Failed to save to {}: {:#}", sink.name(), e);
            }
        }
        info!("Checkpoint: {} rows saved", self.rows.len());
        self.fresh.clear();
    }

    async fn finish(mut self) -> RunSummary {
        self.checkpoint().await;
        let summary = RunSummary::from_rows(&self.rows);
        let elapsed = self.started.elapsed().as_secs_f64();
        let rate = if elapsed > 0.0 {
            summary.total as f64 / elapsed
        } else {
            0.0
        };

        info!(
            "Run {} ({}) done: {} rows, {} ok, {} sold out, {} failed in {:.1}s ({:.2} rows/s)",
            self.mode, self.key, summary.total, summary.ok, summary.sold_out, summary.failed, elapsed, rate
        );
        summary
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RunSummary {
    total: usize,
    ok: usize,
    sold_out: usize,
    failed: usize,
}

impl RunSummary {
    fn from_rows(rows: &[PriceRow]) -> Self {
        let count = |status: ScrapeStatus| rows.iter().filter(|r| r.status == status).count();
        let ok = count(ScrapeStatus::Ok);
        let sold_out = count(ScrapeStatus::SoldOut);
        Self {
            total: rows.len(),
            ok,
            sold_out,
            failed: rows.len() - ok - sold_out,
        }
    }
}

/// Same strategy, same day and same input give the same key, so a restart
/// can find its unfinished run
fn run_key(mode: &str, now: DateTime<Utc>, articles: &[String]) -> String {
    let input = format!("{}:{}:{}", mode, now.format("%Y-%m-%d"), articles.join(","));
    format!("{:x}", md5::compute(input))
}

/// Articles from sheet rows, column B first, then column A
fn articles_from_columns(values: &[Vec<String>]) -> Vec<String> {
    let mut seen = HashSet::new();
    values
        .iter()
        .filter_map(|row| {
            let second = row.get(1).and_then(|cell| article_from_cell(cell));
            second.or_else(|| row.first().and_then(|cell| article_from_cell(cell)))
        })
        .filter(|article| seen.insert(article.clone()))
        .collect()
}

fn positive(value: f64) -> Option<f64> {
    (value > 0.0).then_some(value)
}

fn api_row(
    now: DateTime<Utc>,
    article: &str,
    product: Option<&ProductInfo>,
    price: Option<&PriceInfo>,
) -> PriceRow {
    let title = product.map_or("", |p| p.title.as_str());
    let cabinet = price
        .map(|p| p.cabinet.as_str())
        .or(product.map(|p| p.cabinet.as_str()))
        .unwrap_or(UNKNOWN_CABINET);

    let Some(price) = price else {
        return PriceRow::empty(now, cabinet, article, title, ScrapeStatus::NotFound);
    };

    let mut row = PriceRow::empty(now, cabinet, article, title, ScrapeStatus::Ok).with_prices(
        positive(price.price),
        positive(price.discounted_price),
        positive(price.club_discounted_price),
    );
    row.discount_percent = row.discount_percent.or(price.discount);
    row.card_discount_percent = row.card_discount_percent.or(price.club_discount);
    row.stock_count = price.stocks;

    if row.price_after_discount.is_none() && row.price_before_discount.is_none() {
        row.status = ScrapeStatus::NotFound;
    }
    row
}

fn browser_row(now: DateTime<Utc>, result: &PageResult, api: &ApiData) -> PriceRow {
    let article = result.link.article.as_str();
    let product = api.products.get(article);
    let price = api.prices.get(article);

    let cabinet = price
        .map(|p| p.cabinet.as_str())
        .or(product.map(|p| p.cabinet.as_str()))
        .unwrap_or(UNKNOWN_CABINET);
    let title = |page_title: Option<&String>| {
        product
            .map(|p| p.title.clone())
            .or_else(|| page_title.cloned())
            .or_else(|| result.link.title.clone())
            .unwrap_or_default()
    };

    let mut row = match &result.outcome {
        TabOutcome::Page(PageOutcome::Prices(prices)) => {
            let before = price
                .and_then(|p| positive(p.discounted_price))
                .or(prices.before);
            PriceRow::empty(now, cabinet, article, &title(prices.title.as_ref()), ScrapeStatus::Ok)
                .with_prices(before, prices.after, prices.card)
        }
        TabOutcome::Page(PageOutcome::SoldOut { title: page_title }) => {
            PriceRow::empty(now, cabinet, article, &title(page_title.as_ref()), ScrapeStatus::SoldOut)
        }
        TabOutcome::Page(PageOutcome::Captcha) => {
            PriceRow::empty(now, cabinet, article, &title(None), ScrapeStatus::Captcha)
        }
        TabOutcome::Page(PageOutcome::Blocked) => {
            PriceRow::empty(now, cabinet, article, &title(None), ScrapeStatus::Blocked)
        }
        TabOutcome::Page(PageOutcome::PriceMissing) => {
            PriceRow::empty(now, cabinet, article, &title(None), ScrapeStatus::NotFound)
        }
        TabOutcome::TabMissing | TabOutcome::Failed(_) => {
            PriceRow::empty(now, cabinet, article, &title(None), ScrapeStatus::Error)
        }
    };

    row.stock_count = price.and_then(|p| p.stocks);
    row
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::PagePrices;
    use crate::test_support::closed_port;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    fn price_info() -> PriceInfo {
        PriceInfo {
            cabinet: "COSMO".into(),
            price: 2500.0,
            discounted_price: 1500.0,
            club_discounted_price: 1425.0,
            discount: Some(40.0),
            club_discount: Some(5.0),
            stocks: Some(12),
        }
    }

    fn product_info() -> ProductInfo {
        ProductInfo {
            article: "111".into(),
            title: "Шампунь".into(),
            cabinet: "MMA".into(),
        }
    }

    fn page_result(outcome: TabOutcome) -> PageResult {
        PageResult {
            link: ProductLink::for_article("111"),
            outcome,
        }
    }

    #[test]
    fn api_rows_take_prices_and_cabinet_from_the_pricing_response() {
        let row = api_row(Utc::now(), "111", Some(&product_info()), Some(&price_info()));

        assert_eq!(row.cabinet, "COSMO");
        assert_eq!(row.title, "Шампунь");
        assert_eq!(row.price_before_discount, Some(2500.0));
        assert_eq!(row.price_after_discount, Some(1500.0));
        assert_eq!(row.price_with_card, Some(1425.0));
        assert_eq!(row.discount_percent, Some(40.0));
        assert_eq!(row.card_discount_percent, Some(5.0));
        assert_eq!(row.stock_count, Some(12));
        assert_eq!(row.status, ScrapeStatus::Ok);
    }

    #[test]
    fn api_discounts_fill_in_when_prices_cannot_give_them() {
        let info = PriceInfo {
            price: 0.0,
            ..price_info()
        };

        let row = api_row(Utc::now(), "111", None, Some(&info));

        assert_eq!(row.price_before_discount, None);
        assert_eq!(row.discount_percent, Some(40.0));
        assert_eq!(row.card_discount_percent, Some(5.0));
    }

    #[test]
    fn unpriced_articles_are_not_found() {
        let row = api_row(Utc::now(), "999", None, None);

        assert_eq!(row.status, ScrapeStatus::NotFound);
        assert_eq!(row.cabinet, UNKNOWN_CABINET);
        assert_eq!(row.price_after_discount, None);
    }

    #[test]
    fn hybrid_rows_take_the_pre_loyalty_price_from_the_api() {
        let mut api = ApiData::default();
        api.products.insert("111".into(), product_info());
        api.prices.insert("111".into(), price_info());
        let result = page_result(TabOutcome::Page(PageOutcome::Prices(PagePrices {
            title: Some("Страница".into()),
            before: Some(3000.0),
            after: Some(1400.0),
            card: Some(1330.0),
        })));

        let row = browser_row(Utc::now(), &result, &api);

        assert_eq!(row.price_before_discount, Some(1500.0));
        assert_eq!(row.price_after_discount, Some(1400.0));
        assert_eq!(row.price_with_card, Some(1330.0));
        assert_eq!(row.discount_percent, Some(6.7));
        assert_eq!(row.card_discount_percent, Some(5.0));
        assert_eq!(row.title, "Шампунь");
        assert_eq!(row.cabinet, "COSMO");
        assert_eq!(row.stock_count, Some(12));
    }

    #[test]
    fn browser_rows_fall_back_to_page_data() {
        let result = page_result(TabOutcome::Page(PageOutcome::Prices(PagePrices {
            title: Some("Маска".into()),
            before: Some(2000.0),
            after: Some(1500.0),
            card: None,
        })));

        let row = browser_row(Utc::now(), &result, &ApiData::default());

        assert_eq!(row.price_before_discount, Some(2000.0));
        assert_eq!(row.discount_percent, Some(25.0));
        assert_eq!(row.card_discount_percent, None);
        assert_eq!(row.title, "Маска");
        assert_eq!(row.cabinet, UNKNOWN_CABINET);
    }

    #[test]
    fn failed_pages_are_recorded_with_their_reason() {
        let api = ApiData::default();
        let status = |outcome| browser_row(Utc::now(), &page_result(outcome), &api).status;

        assert_eq!(status(TabOutcome::Page(PageOutcome::Captcha)), ScrapeStatus::Captcha);
        assert_eq!(status(TabOutcome::Page(PageOutcome::Blocked)), ScrapeStatus::Blocked);
        assert_eq!(status(TabOutcome::Page(PageOutcome::PriceMissing)), ScrapeStatus::NotFound);
        assert_eq!(
            status(TabOutcome::Page(PageOutcome::SoldOut { title: None })),
            ScrapeStatus::SoldOut
        );
        assert_eq!(status(TabOutcome::TabMissing), ScrapeStatus::Error);
        assert_eq!(status(TabOutcome::Failed("gone".into())), ScrapeStatus::Error);
    }

    #[test]
    fn run_key_depends_on_mode_day_and_input() {
        let day = DateTime::parse_from_rfc3339("2025-03-01T10:00:00Z").unwrap().with_timezone(&Utc);
        let later = DateTime::parse_from_rfc3339("2025-03-01T22:00:00Z").unwrap().with_timezone(&Utc);
        let next_day = DateTime::parse_from_rfc3339("2025-03-02T10:00:00Z").unwrap().with_timezone(&Utc);
        let articles = vec!["1".to_string(), "2".to_string()];

        let key = run_key("browser", day, &articles);
        assert_eq!(key.len(), 32);
        assert_eq!(key, run_key("browser", later, &articles));
        assert_ne!(key, run_key("hybrid", day, &articles));
        assert_ne!(key, run_key("browser", next_day, &articles));
        assert_ne!(key, run_key("browser", day, &articles[..1]));
    }

    #[test]
    fn sheet_columns_prefer_b_then_a() {
        let values = vec![
            vec!["Название".into(), "Артикул".into()],
            vec!["Шампунь".into(), "111".into()],
            vec!["222".into()],
            vec!["https://www.wildberries.ru/catalog/333/detail.aspx".into(), "".into()],
            vec!["Дубль".into(), "111".into()],
        ];

        assert_eq!(articles_from_columns(&values), ["111", "222", "333"]);
    }

    #[test]
    fn summary_counts_failures() {
        let now = Utc::now();
        let rows = vec![
            PriceRow::empty(now, "A", "1", "", ScrapeStatus::Ok),
            PriceRow::empty(now, "A", "2", "", ScrapeStatus::SoldOut),
            PriceRow::empty(now, "A", "3", "", ScrapeStatus::Captcha),
            PriceRow::empty(now, "A", "4", "", ScrapeStatus::Error),
        ];

        assert_eq!(
            RunSummary::from_rows(&rows),
            RunSummary {
                total: 4,
                ok: 1,
                sold_out: 1,
                failed: 2
            }
        );
    }

    struct RecordingSink {
        saves: Arc<Mutex<Vec<(Vec<String>, usize)>>>,
    }

    #[async_trait]
    impl ResultSink for RecordingSink {
        fn name(&self) -> &str {
            "recording"
        }

        async fn save(&self, all: &[PriceRow], fresh: &[PriceRow]) -> Result<()> {
            let articles = all.iter().map(|r| r.article.clone()).collect();
            self.saves.lock().unwrap().push((articles, fresh.len()));
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl ResultSink for FailingSink {
        fn name(&self) -> &str {
            "failing"
        }

        async fn save(&self, _all: &[PriceRow], _fresh: &[PriceRow]) -> Result<()> {
            bail!("disk full")
        }
    }

    #[tokio::test]
    async fn checkpoints_reach_every_sink_in_input_order() {
        let saves = Arc::new(Mutex::new(Vec::new()));
        let now = Utc::now();
        let mut run = Run {
            key: "key".into(),
            mode: "browser",
            order: [("1", 0), ("2", 1), ("3", 2)]
                .into_iter()
                .map(|(a, i)| (a.to_string(), i))
                .collect(),
            done: HashSet::from(["2".to_string()]),
            rows: vec![PriceRow::empty(now, "A", "2", "", ScrapeStatus::Ok)],
            fresh: Vec::new(),
            sinks: vec![
                Box::new(FailingSink) as Box<dyn ResultSink>,
                Box::new(RecordingSink {
                    saves: saves.clone(),
                }),
            ],
            started: Instant::now(),
        };

        assert!(run.is_done("2"));
        run.push(PriceRow::empty(now, "A", "3", "", ScrapeStatus::Ok));
        run.push(PriceRow::empty(now, "A", "1", "", ScrapeStatus::Captcha));
        run.checkpoint().await;
        let summary = run.finish().await;

        let saves = saves.lock().unwrap();
        assert_eq!(saves[0], (vec!["1".to_string(), "2".into(), "3".into()], 2));
        assert_eq!(saves[1].1, 0);
        assert_eq!(summary.failed, 1);
    }

    async fn parser_in(dir: &Path, vars: &[(&str, &str)]) -> PriceParser {
        let output = dir.join("out.xlsx").display().to_string();
        let mut env: HashMap<String, String> = HashMap::from([
            ("DATABASE_URL".to_string(), "sqlite::memory:".to_string()),
            ("OUTPUT_FILE".to_string(), output),
            ("ARTICLES_FILE".to_string(), dir.join("missing.xlsx").display().to_string()),
        ]);
        env.extend(vars.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())));

        let config = Config::from_lookup(|key| env.get(key).cloned()).unwrap();
        PriceParser::new(config).await.unwrap()
    }

    #[tokio::test]
    async fn a_finished_run_starts_over_on_the_next_tick() {
        let dir = tempdir().unwrap();
        let parser = parser_in(dir.path(), &[]).await;
        let mode = Mode::Browser { seller_urls: vec![] };
        let articles = vec!["111".to_string(), "222".to_string()];

        let mut run = parser.start_run(&mode, &articles, true).await.unwrap();
        for article in &articles {
            run.push(PriceRow::empty(Utc::now(), "COSMO", article, "", ScrapeStatus::Ok));
        }
        let first_key = run.key.clone();
        parser.finish_run(run).await.unwrap();

        let run = parser.start_run(&mode, &articles, true).await.unwrap();
        assert_ne!(run.key, first_key);
        assert!(articles.iter().all(|article| !run.is_done(article)));
        assert!(run.rows.is_empty());
    }

    #[tokio::test]
    async fn an_interrupted_run_resumes_its_finished_articles() {
        let dir = tempdir().unwrap();
        let parser = parser_in(dir.path(), &[]).await;
        let articles = vec!["111".to_string(), "222".to_string()];

        let mut run = parser.start_run(&Mode::Hybrid, &articles, true).await.unwrap();
        run.push(PriceRow::empty(Utc::now(), "COSMO", "111", "", ScrapeStatus::Ok));
        run.push(PriceRow::empty(Utc::now(), "COSMO", "222", "", ScrapeStatus::Captcha));
        run.checkpoint().await;
        let first_key = run.key.clone();
        drop(run);

        let run = parser.start_run(&Mode::Hybrid, &articles, true).await.unwrap();
        assert_eq!(run.key, first_key);
        assert!(run.is_done("111"));
        assert!(!run.is_done("222"));
        assert_eq!(run.rows.len(), 1);
    }

    #[tokio::test]
    async fn an_empty_catalog_does_not_touch_the_output() {
        let dir = tempdir().unwrap();
        let content_url = format!("{}/cards", closed_port().await);
        let parser = parser_in(
            dir.path(),
            &[
                ("WB_CABINETS", "COSMO"),
                ("COSMO", "token"),
                ("WB_CONTENT_API_URL", content_url.as_str()),
                ("API_MAX_RETRIES", "0"),
            ],
        )
        .await;

        let err = parser.run_api(true).await.unwrap_err();

        assert!(err.to_string().contains("No articles"));
        assert!(!dir.path().join("out.xlsx").exists());
    }
}
