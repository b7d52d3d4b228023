//! HTTP client for the Wildberries seller API
//!
//! Two endpoints matter here: the batch-pricing filter (prices and discounts
//! for up to 1000 nmIDs per request) and the content cards list (the
//! cabinet's catalog, cursor-paginated). Both authenticate with the cabinet
//! token in a bare `Authorization` header.

pub mod types;

use std::collections::HashMap;
use std::time::Duration;

use reqwest::header::AUTHORIZATION;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::config::ApiConfig;
use crate::error::{ApiError, ApiResult};
use crate::models::{Cabinet, PriceInfo};
use types::{Card, CardsListRequest, CardsListResponse, Goods, GoodsFilterRequest, GoodsFilterResponse};

/// Cards per content API page; the API refuses more
const CARDS_PAGE_LIMIT: usize = 100;
/// Hard stop for runaway cursors
const MAX_CARD_PAGES: usize = 1000;
const PREVIEW_CHARS: usize = 300;

/// Seller API client with retries on transient failures
#[derive(Clone)]
pub struct WbApiClient {
    client: Client,
    config: ApiConfig,
}

impl WbApiClient {
    pub fn new(config: &ApiConfig) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    /// Prices for the given articles, keyed by nmID.
    ///
    /// Articles that are not numeric are ignored. A 404 for a batch means the
    /// cabinet owns none of its articles and is not an error.
    pub async fn fetch_prices(
        &self,
        cabinet: &Cabinet,
        articles: &[String],
    ) -> ApiResult<HashMap<String, PriceInfo>> {
        let nm_ids: Vec<i64> = articles
            .iter()
            .filter(|a| !a.is_empty() && a.chars().all(|c| c.is_ascii_digit()))
            .filter_map(|a| a.parse().ok())
            .collect();

        let mut prices = HashMap::new();
        let batches = nm_ids.chunks(self.config.batch_size).collect::<Vec<_>>();

        for (index, batch) in batches.iter().enumerate() {
            let request = GoodsFilterRequest {
                limit: self.config.batch_size,
                offset: 0,
                nm_list: batch.to_vec(),
            };

            let goods = match self
                .post_json::<_, GoodsFilterResponse>(cabinet, &self.config.prices_url, &request)
                .await
            {
                Ok(response) => response.into_goods(),
                Err(ApiError::Status { status, .. }) if status == StatusCode::NOT_FOUND => {
                    debug!("[{}] batch {} has no goods in this cabinet", cabinet.name, index + 1);
                    Vec::new()
                }
                Err(e) => return Err(e),
            };

            info!(
                "[{}] prices batch {}/{}: {} of {} goods found",
                cabinet.name,
                index + 1,
                batches.len(),
                goods.len(),
                batch.len()
            );

            for item in goods {
                if let Some(info) = price_info_from_goods(&item, &cabinet.name) {
                    prices.insert(item.nm_id.to_string(), info);
                }
            }

            if index + 1 < batches.len() {
                tokio::time::sleep(self.config.page_delay).await;
            }
        }

        Ok(prices)
    }

    /// Every card of the cabinet, following the content API cursor
    pub async fn list_cards(&self, cabinet: &Cabinet) -> ApiResult<Vec<Card>> {
        let mut cards = Vec::new();
        let mut cursor = None;

        for page in 1..=MAX_CARD_PAGES {
            let request = CardsListRequest::page(CARDS_PAGE_LIMIT, cursor.as_ref());
            let response: CardsListResponse = self
                .post_json(cabinet, &self.config.content_url, &request)
                .await?;
            let (page_cards, next_cursor) = response.into_page();

            if page_cards.is_empty() {
                break;
            }

            cards.extend(page_cards);
            info!("[{}] cards page {}: {} cards so far", cabinet.name, page, cards.len());

            match next_cursor {
                Some(next) if next.has_next(CARDS_PAGE_LIMIT) => cursor = Some(next),
                _ => break,
            }

            tokio::time::sleep(self.config.page_delay).await;
        }

        Ok(cards)
    }

    async fn post_json<B, T>(&self, cabinet: &Cabinet, url: &str, body: &B) -> ApiResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let mut last_failure = String::new();

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay = backoff_delay(self.config.retry_base, attempt);
                warn!(
                    "[{}] retrying {} in {:?} (attempt {}/{}): {}",
                    cabinet.name,
                    url,
                    delay,
                    attempt + 1,
                    self.config.max_retries + 1,
                    last_failure
                );
                tokio::time::sleep(delay).await;
            }

            let response = match self
                .client
                .post(url)
                .header(AUTHORIZATION, &cabinet.token)
                .json(body)
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) if e.is_timeout() || e.is_connect() => {
                    last_failure = e.to_string();
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let status = response.status();
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                return Err(ApiError::Unauthorized {
                    cabinet: cabinet.name.clone(),
                    status,
                });
            }
            if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                last_failure = format!("status {status}");
                continue;
            }

            let text = response.text().await?;
            if !status.is_success() {
                return Err(ApiError::Status {
                    status,
                    body: preview(&text),
                });
            }

            return serde_json::from_str(&text).map_err(|source| ApiError::Decode {
                source,
                preview: preview(&text),
            });
        }

        Err(ApiError::RetriesExhausted {
            attempts: self.config.max_retries + 1,
            last: last_failure,
        })
    }
}

/// `base * 2^(attempt - 1)` for the retry that follows attempt number `attempt`
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2_u32.saturating_pow(attempt.saturating_sub(1)))
}

fn preview(body: &str) -> String {
    let mut preview: String = body.chars().take(PREVIEW_CHARS).collect();
    if preview.len() < body.len() {
        preview.push_str("...");
    }
    preview
}

/// Prices come from the first size; missing prices fall back down the chain
/// `price -> discountedPrice -> clubDiscountedPrice`.
fn price_info_from_goods(goods: &Goods, cabinet: &str) -> Option<PriceInfo> {
    let size = goods.sizes.first()?;
    let positive = |value: Option<f64>| value.filter(|v| *v > 0.0);

    let price = positive(size.price).unwrap_or(0.0);
    let discounted_price = positive(size.discounted_price).unwrap_or(price);
    let club_discounted_price = positive(size.club_discounted_price).unwrap_or(discounted_price);

    let stocks = size
        .stocks
        .filter(|s| *s > 0)
        .or(size.wh.filter(|s| *s > 0))
        .or(goods.stocks);

    Some(PriceInfo {
        cabinet: cabinet.to_string(),
        price,
        discounted_price,
        club_discounted_price,
        discount: positive(goods.discount),
        club_discount: positive(goods.club_discount),
        stocks,
    })
}
