//! Seams shared by the scraping strategies and their outputs

use anyhow::Result;
use async_trait::async_trait;

use crate::models::PriceRow;

/// CSS selector fallback chains for a storefront product page.
///
/// Within a chain, the first selector whose text parses wins.
#[derive(Debug, Clone)]
pub struct PageSelectors {
    /// Struck-through price before the seller discount
    pub price_before: Vec<String>,
    /// Price after the seller discount
    pub price_after: Vec<String>,
    /// Price with the loyalty wallet/card
    pub price_card: Vec<String>,
    /// Any match means the product is sold out
    pub sold_out: Vec<String>,
    /// Button that reveals the wallet price when clicked
    pub wallet_button: Vec<String>,
    pub title: Vec<String>,
}

impl Default for PageSelectors {
    fn default() -> Self {
        Self {
            price_before: strings(&[
                "del.price-block__old-price",
                "del[class*='old-price']",
                "s.price-block__old-price",
                "span[class*='old-price']",
                "del[class*='priceBlockOldPrice']",
            ]),
            price_after: strings(&[
                "ins.price-block__final-price",
                "ins[class*='final-price']",
                "ins[class*='priceBlockFinalPrice']",
                "span[class*='final-price']",
                "h2.mo-typography_color_primary",
                "h2[class*='mo-typography'][class*='color_primary']",
            ]),
            price_card: strings(&[
                "h2.mo-typography_color_danger",
                "h2[class*='mo-typography'][class*='color_danger']",
                "span[class*='priceBlockWalletPrice']",
                "span[class*='wallet-price']",
            ]),
            sold_out: strings(&["h2[class*='soldOutProduct']"]),
            wallet_button: strings(&["button[class*='priceBlockWalletPrice']"]),
            title: strings(&["h1[class*='productTitle']", "h1.product-page__title", "h1"]),
        }
    }
}

/// CSS selectors for a seller or brand listing page
#[derive(Debug, Clone)]
pub struct CatalogSelectors {
    /// Product card containers, tried in order until one matches
    pub product_container: Vec<String>,
    /// Element within the card whose `aria-label` names the product
    pub name: String,
    /// Product link within the card
    pub link: Vec<String>,
    /// Next page link
    pub pagination_next: Vec<String>,
}

impl Default for CatalogSelectors {
    fn default() -> Self {
        Self {
            product_container: strings(&[
                "article.product-card",
                "div.product-card",
                "div[data-nm-id]",
                "div.j-card-item",
            ]),
            name: "a[aria-label]".to_string(),
            link: strings(&["a.product-card__link", "a[href*='/catalog/']"]),
            pagination_next: strings(&["a.pagination-next", "a[rel='next']"]),
        }
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(ToString::to_string).collect()
}

/// Destination for the rows of a run
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Display name used in logs
    fn name(&self) -> &str;

    /// Persist a checkpoint.
    ///
    /// # Arguments
    /// * `all` - Every row of the run so far, in output order
    /// * `fresh` - Rows produced since the previous save
    async fn save(&self, all: &[PriceRow], fresh: &[PriceRow]) -> Result<()>;
}
