//! Data models for scraped price rows and the marketplace entities they come from

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Storefront product page for an article
pub const PRODUCT_URL_TEMPLATE: &str = "https://www.wildberries.ru/catalog/{}/detail.aspx";

/// Storefront URL of an article's product page
pub fn product_url(article: &str) -> String {
    PRODUCT_URL_TEMPLATE.replace("{}", article)
}

/// Cabinet label used when no cabinet claimed an article
pub const UNKNOWN_CABINET: &str = "unknown";

/// A seller account with its own API token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cabinet {
    pub name: String,
    pub token: String,
}

/// A product to open in the browser
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductLink {
    pub article: String,
    pub title: Option<String>,
    pub url: String,
}

impl ProductLink {
    pub fn for_article(article: impl Into<String>) -> Self {
        let article = article.into();
        let url = product_url(&article);
        Self {
            article,
            title: None,
            url,
        }
    }
}

/// Catalog information about an article, as listed by its cabinet
#[derive(Debug, Clone, PartialEq)]
pub struct ProductInfo {
    pub article: String,
    pub title: String,
    pub cabinet: String,
}

/// Prices reported by the batch-pricing API for one article
#[derive(Debug, Clone, PartialEq)]
pub struct PriceInfo {
    pub cabinet: String,
    /// Base price without any discount
    pub price: f64,
    /// Price after the seller discount, before the loyalty discount
    pub discounted_price: f64,
    /// Price after the loyalty (club) discount
    pub club_discounted_price: f64,
    pub discount: Option<f64>,
    pub club_discount: Option<f64>,
    pub stocks: Option<i64>,
}

/// Why a row ended up the way it did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrapeStatus {
    Ok,
    SoldOut,
    NotFound,
    Captcha,
    Blocked,
    Error,
}

impl ScrapeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::SoldOut => "sold_out",
            Self::NotFound => "not_found",
            Self::Captcha => "captcha",
            Self::Blocked => "blocked",
            Self::Error => "error",
        }
    }

    /// Rows with a final status are not scraped again when a run resumes
    pub fn is_final(self) -> bool {
        matches!(self, Self::Ok | Self::SoldOut)
    }
}

impl fmt::Display for ScrapeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScrapeStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(Self::Ok),
            "sold_out" => Ok(Self::SoldOut),
            "not_found" => Ok(Self::NotFound),
            "captcha" => Ok(Self::Captcha),
            "blocked" => Ok(Self::Blocked),
            "error" => Ok(Self::Error),
            other => Err(anyhow::anyhow!("Unknown scrape status: {other}")),
        }
    }
}

/// One output row: the flat record written to every sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRow {
    pub scraped_at: DateTime<Utc>,
    pub cabinet: String,
    pub article: String,
    pub title: String,
    pub price_before_discount: Option<f64>,
    pub price_after_discount: Option<f64>,
    pub price_with_card: Option<f64>,
    pub discount_percent: Option<f64>,
    pub card_discount_percent: Option<f64>,
    pub stock_count: Option<i64>,
    pub status: ScrapeStatus,
}

impl PriceRow {
    /// Row without prices, used when an article could not be priced
    pub fn empty(
        scraped_at: DateTime<Utc>,
        cabinet: &str,
        article: &str,
        title: &str,
        status: ScrapeStatus,
    ) -> Self {
        Self {
            scraped_at,
            cabinet: cabinet.to_string(),
            article: article.to_string(),
            title: title.to_string(),
            price_before_discount: None,
            price_after_discount: None,
            price_with_card: None,
            discount_percent: None,
            card_discount_percent: None,
            stock_count: None,
            status,
        }
    }

    /// Fill the three prices and derive both percentages from them
    pub fn with_prices(mut self, before: Option<f64>, after: Option<f64>, card: Option<f64>) -> Self {
        self.price_before_discount = before;
        self.price_after_discount = after;
        self.price_with_card = card;
        self.discount_percent = discount_percent(before, after);
        self.card_discount_percent = discount_percent(after, card);
        self
    }
}

/// `(1 - after / before) * 100`, rounded to one decimal.
///
/// Undefined when `before` is zero or missing, or `after` is missing.
pub fn discount_percent(before: Option<f64>, after: Option<f64>) -> Option<f64> {
    let before = before.filter(|value| *value > 0.0)?;
    let after = after?;
    let percent = (1.0 - after / before) * 100.0;
    Some((percent * 10.0).round() / 10.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discount_percent_rounds_to_one_decimal() {
        assert_eq!(discount_percent(Some(1000.0), Some(700.0)), Some(30.0));
        assert_eq!(discount_percent(Some(999.0), Some(750.0)), Some(24.9));
        assert_eq!(discount_percent(Some(300.0), Some(300.0)), Some(0.0));
    }

    #[test]
    fn discount_percent_is_undefined_without_a_base_price() {
        assert_eq!(discount_percent(None, Some(100.0)), None);
        assert_eq!(discount_percent(Some(0.0), Some(100.0)), None);
        assert_eq!(discount_percent(Some(100.0), None), None);
    }

    #[test]
    fn with_prices_derives_both_percentages() {
        let row = PriceRow::empty(Utc::now(), "COSMO", "123", "Shampoo", ScrapeStatus::Ok)
            .with_prices(Some(2000.0), Some(1500.0), Some(1425.0));

        assert_eq!(row.discount_percent, Some(25.0));
        assert_eq!(row.card_discount_percent, Some(5.0));
    }

    #[test]
    fn product_link_points_at_the_storefront_card() {
        let link = ProductLink::for_article("145623987");
        assert_eq!(
            link.url,
            "https://www.wildberries.ru/catalog/145623987/detail.aspx"
        );
    }

    #[test]
    fn status_round_trips_through_its_column_value() {
        for status in [
            ScrapeStatus::Ok,
            ScrapeStatus::SoldOut,
            ScrapeStatus::NotFound,
            ScrapeStatus::Captcha,
            ScrapeStatus::Blocked,
            ScrapeStatus::Error,
        ] {
            assert_eq!(status.as_str().parse::<ScrapeStatus>().unwrap(), status);
        }
        assert!("pending".parse::<ScrapeStatus>().is_err());
    }
}
