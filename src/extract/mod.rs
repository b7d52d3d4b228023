//! Offline extraction of prices and product links from storefront HTML

use std::collections::HashSet;

use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};

use crate::models::product_url;
use crate::traits::{CatalogSelectors, PageSelectors};

static CATALOG_ARTICLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/catalog/(\d+)").expect("catalog article regex is valid"));

const CAPTCHA_TITLE: &str = "Почти готово";
const CAPTCHA_MARKER: &str = "captcha";
const BLOCKED_MARKER: &str = "подозрительная активность";
const UNAVAILABLE_KEYWORDS: [&str; 3] = ["нет в наличии", "товар недоступен", "недоступен для заказа"];

/// Prices read from a product page
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PagePrices {
    pub title: Option<String>,
    pub before: Option<f64>,
    pub after: Option<f64>,
    pub card: Option<f64>,
}

/// What a product page showed
#[derive(Debug, Clone, PartialEq)]
pub enum PageOutcome {
    Captcha,
    Blocked,
    SoldOut { title: Option<String> },
    Prices(PagePrices),
    PriceMissing,
}

impl PageOutcome {
    /// Anti-bot pages that go away by waiting
    pub fn is_challenge(&self) -> bool {
        matches!(self, Self::Captcha | Self::Blocked)
    }
}

/// Product page extractor with its selector chains compiled once
#[derive(Debug, Clone)]
pub struct PageExtractor {
    before: Vec<Selector>,
    after: Vec<Selector>,
    card: Vec<Selector>,
    sold_out: Vec<Selector>,
    title: Vec<Selector>,
}

impl PageExtractor {
    pub fn new(selectors: &PageSelectors) -> Result<Self> {
        Ok(Self {
            before: compile_chain("price before", &selectors.price_before)?,
            after: compile_chain("price after", &selectors.price_after)?,
            card: compile_chain("card price", &selectors.price_card)?,
            sold_out: compile_chain("sold out", &selectors.sold_out)?,
            title: compile_chain("title", &selectors.title)?,
        })
    }

    /// Classify a product page from its window title and source
    pub fn extract(&self, page_title: &str, html: &str) -> PageOutcome {
        let lowered = html.to_lowercase();

        if page_title.contains(CAPTCHA_TITLE) || lowered.contains(CAPTCHA_MARKER) {
            return PageOutcome::Captcha;
        }
        if lowered.contains(BLOCKED_MARKER) {
            return PageOutcome::Blocked;
        }

        let document = Html::parse_document(html);
        let title = first_text(&document, &self.title).or_else(|| {
            let trimmed = page_title.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        });

        if self.sold_out.iter().any(|s| document.select(s).next().is_some()) {
            return PageOutcome::SoldOut { title };
        }

        let prices = PagePrices {
            before: first_price(&document, &self.before),
            after: first_price(&document, &self.after),
            card: first_price(&document, &self.card),
            title,
        };

        if prices.before.is_some() || prices.after.is_some() || prices.card.is_some() {
            return PageOutcome::Prices(prices);
        }

        if UNAVAILABLE_KEYWORDS.iter().any(|k| lowered.contains(k)) {
            return PageOutcome::SoldOut { title: prices.title };
        }

        PageOutcome::PriceMissing
    }
}

/// A product found on a listing page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub article: String,
    pub name: Option<String>,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CatalogPage {
    pub links: Vec<CatalogEntry>,
    pub next_page: Option<String>,
}

/// Listing page extractor for seller and brand catalogs
#[derive(Debug, Clone)]
pub struct CatalogExtractor {
    containers: Vec<Selector>,
    name: Selector,
    link: Vec<Selector>,
    next: Vec<Selector>,
}

impl CatalogExtractor {
    pub fn new(selectors: &CatalogSelectors) -> Result<Self> {
        Ok(Self {
            containers: compile_chain("product container", &selectors.product_container)?,
            name: compile("name", &selectors.name)?,
            link: compile_chain("link", &selectors.link)?,
            next: compile_chain("next page", &selectors.pagination_next)?,
        })
    }

    pub fn extract_catalog(&self, html: &str, base_url: &str) -> CatalogPage {
        let document = Html::parse_document(html);
        let base = Url::parse(base_url).ok();

        let cards: Vec<ElementRef> = self
            .containers
            .iter()
            .map(|s| document.select(s).collect::<Vec<_>>())
            .find(|found| !found.is_empty())
            .unwrap_or_default();

        let mut seen = HashSet::new();
        let mut links = Vec::new();

        for card in cards {
            let article = card
                .value()
                .attr("data-nm-id")
                .map(str::trim)
                .filter(|id| !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()))
                .map(str::to_string)
                .or_else(|| {
                    self.link
                        .iter()
                        .flat_map(|s| card.select(s))
                        .filter_map(|a| a.value().attr("href"))
                        .find_map(article_from_url)
                });

            let Some(article) = article else { continue };
            if !seen.insert(article.clone()) {
                continue;
            }

            let name = card
                .select(&self.name)
                .next()
                .and_then(|el| el.value().attr("aria-label"))
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_string);

            links.push(CatalogEntry {
                url: product_url(&article),
                article,
                name,
            });
        }

        let next_page = self
            .next
            .iter()
            .flat_map(|s| document.select(s))
            .filter_map(|a| a.value().attr("href"))
            .find_map(|href| match &base {
                Some(base) => base.join(href).ok().map(String::from),
                None => href.starts_with("http").then(|| href.to_string()),
            });

        CatalogPage { links, next_page }
    }
}

/// nmID from a `/catalog/<digits>/` storefront link
pub fn article_from_url(url: &str) -> Option<String> {
    CATALOG_ARTICLE
        .captures(url)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Article from a spreadsheet cell: a bare number or a storefront link
pub fn article_from_cell(cell: &str) -> Option<String> {
    let cell = cell.trim();
    // Numeric cells can come back as "145623987.0"
    let digits = cell.strip_suffix(".0").unwrap_or(cell);
    if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
        return Some(digits.to_string());
    }
    article_from_url(cell)
}

/// Parse a displayed price such as `1 299,50 ₽`
pub fn parse_price_text(text: &str) -> Option<f64> {
    let cleaned: String = text
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '₽')
        .map(|c| if c == ',' { '.' } else { c })
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();

    if !cleaned.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }
    cleaned.trim_matches('.').parse().ok()
}

fn compile(what: &str, selector: &str) -> Result<Selector> {
    Selector::parse(selector)
        .map_err(|e| anyhow::anyhow!("Failed to parse {} selector '{}': {:?}", what, selector, e))
}

fn compile_chain(what: &str, chain: &[String]) -> Result<Vec<Selector>> {
    chain.iter().map(|s| compile(what, s)).collect()
}

fn element_text(element: ElementRef) -> String {
    element.text().collect::<String>().trim().to_string()
}

fn first_text(document: &Html, chain: &[Selector]) -> Option<String> {
    chain
        .iter()
        .flat_map(|s| document.select(s))
        .map(element_text)
        .find(|text| !text.is_empty())
}

fn first_price(document: &Html, chain: &[Selector]) -> Option<f64> {
    chain
        .iter()
        .flat_map(|s| document.select(s))
        .find_map(|el| parse_price_text(&element_text(el)))
}
