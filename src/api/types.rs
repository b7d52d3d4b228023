//! Request/response structures for the Wildberries seller API

use serde::{Deserialize, Serialize};

// ============================================================================
// Prices API: POST /api/v2/list/goods/filter
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct GoodsFilterRequest {
    pub limit: usize,
    pub offset: usize,
    #[serde(rename = "nmList")]
    pub nm_list: Vec<i64>,
}

/// The goods list arrives either under `data` or at the top level
#[derive(Debug, Clone, Deserialize, Default)]
pub struct GoodsFilterResponse {
    #[serde(default)]
    pub data: Option<GoodsList>,
    #[serde(rename = "listGoods", default)]
    pub list_goods: Vec<Goods>,
}

impl GoodsFilterResponse {
    pub fn into_goods(self) -> Vec<Goods> {
        match self.data {
            Some(data) if !data.list_goods.is_empty() => data.list_goods,
            _ => self.list_goods,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct GoodsList {
    #[serde(rename = "listGoods", default)]
    pub list_goods: Vec<Goods>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Goods {
    #[serde(rename = "nmID")]
    pub nm_id: i64,
    #[serde(default)]
    pub sizes: Vec<GoodsSize>,
    /// Seller discount, percent
    #[serde(default)]
    pub discount: Option<f64>,
    /// Loyalty (club) discount, percent
    #[serde(rename = "clubDiscount", default)]
    pub club_discount: Option<f64>,
    #[serde(default)]
    pub stocks: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GoodsSize {
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(rename = "discountedPrice", default)]
    pub discounted_price: Option<f64>,
    #[serde(rename = "clubDiscountedPrice", default)]
    pub club_discounted_price: Option<f64>,
    #[serde(default)]
    pub stocks: Option<i64>,
    #[serde(default)]
    pub wh: Option<i64>,
}

// ============================================================================
// Content API: POST /content/v2/get/cards/list
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct CardsListRequest {
    pub settings: CardsSettings,
}

#[derive(Debug, Clone, Serialize)]
pub struct CardsSettings {
    pub cursor: CardsCursorRequest,
    pub filter: CardsFilter,
}

#[derive(Debug, Clone, Serialize)]
pub struct CardsCursorRequest {
    pub limit: usize,
    #[serde(rename = "updatedAt", skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(rename = "nmID", skip_serializing_if = "Option::is_none")]
    pub nm_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CardsFilter {
    /// -1 lists cards with and without photos
    #[serde(rename = "withPhoto")]
    pub with_photo: i32,
}

impl CardsListRequest {
    pub fn page(limit: usize, cursor: Option<&CardsCursor>) -> Self {
        Self {
            settings: CardsSettings {
                cursor: CardsCursorRequest {
                    limit,
                    updated_at: cursor.and_then(|c| c.updated_at.clone()),
                    nm_id: cursor.and_then(|c| c.nm_id),
                },
                filter: CardsFilter { with_photo: -1 },
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CardsListResponse {
    #[serde(default)]
    pub cards: Vec<Card>,
    #[serde(default)]
    pub cursor: Option<CardsCursor>,
    #[serde(default)]
    pub data: Option<CardsData>,
}

impl CardsListResponse {
    /// Cards and cursor, whichever envelope they came in
    pub fn into_page(self) -> (Vec<Card>, Option<CardsCursor>) {
        match self.data {
            Some(data) if self.cards.is_empty() => (data.cards, data.cursor.or(self.cursor)),
            _ => (self.cards, self.cursor),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CardsData {
    #[serde(default)]
    pub cards: Vec<Card>,
    #[serde(default)]
    pub cursor: Option<CardsCursor>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CardsCursor {
    #[serde(rename = "updatedAt", default)]
    pub updated_at: Option<String>,
    #[serde(rename = "nmID", default)]
    pub nm_id: Option<i64>,
    #[serde(default)]
    pub total: Option<i64>,
}

impl CardsCursor {
    /// Whether another page should be requested after this one
    pub fn has_next(&self, limit: usize) -> bool {
        let positioned = self.updated_at.as_deref().is_some_and(|s| !s.is_empty())
            && self.nm_id.is_some_and(|id| id > 0);
        let full_page = self.total.is_none_or(|total| total >= limit as i64);
        positioned && full_page
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Card {
    #[serde(rename = "nmID")]
    pub nm_id: i64,
    #[serde(rename = "vendorCode", default)]
    pub vendor_code: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(rename = "subjectName", default)]
    pub subject_name: Option<String>,
}

impl Card {
    /// Title, else subject, else vendor code, else a placeholder with the nmID
    pub fn display_title(&self) -> String {
        [self.title.as_deref(), self.subject_name.as_deref(), Some(self.vendor_code.as_str())]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|t| !t.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("Товар {}", self.nm_id))
    }
}
