//! Google Sheets v4 over REST, authenticated as a service account

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::HEADER;
use crate::config::GoogleSheetConfig;
use crate::models::PriceRow;
use crate::traits::ResultSink;

const SHEETS_SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
/// Refresh the access token this long before it expires
const TOKEN_REFRESH_MARGIN_SECS: i64 = 60;

/// The parts of a service-account key file that are needed to sign in
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccount {
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

impl ServiceAccount {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read service account file {}", path.display()))?;
        serde_json::from_str(&raw).context("Invalid service account file")
    }
}

#[derive(Debug, Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    ASSERTION_LIFETIME_SECS
}

#[derive(Debug, Deserialize, Default)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

struct CachedToken {
    value: String,
    expires_at: DateTime<Utc>,
}

pub struct GoogleSheetsClient {
    client: Client,
    /// `https://sheets.googleapis.com/v4/spreadsheets`
    api_url: String,
    account: ServiceAccount,
    spreadsheet_id: String,
    token: Mutex<Option<CachedToken>>,
}

impl GoogleSheetsClient {
    pub fn new(
        account: ServiceAccount,
        api_url: impl Into<String>,
        spreadsheet_id: impl Into<String>,
    ) -> Result<Self> {
        Ok(Self {
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()?,
            api_url: api_url.into(),
            account,
            spreadsheet_id: spreadsheet_id.into(),
            token: Mutex::new(None),
        })
    }

    pub fn from_config(config: &GoogleSheetConfig) -> Result<Self> {
        let account = ServiceAccount::from_file(Path::new(&config.credentials_file))?;
        Self::new(account, config.api_url.as_str(), config.spreadsheet_id.as_str())
    }

    /// Signed JWT that is exchanged for an access token
    fn assertion(&self, now: DateTime<Utc>) -> Result<String> {
        let claims = Claims {
            iss: &self.account.client_email,
            scope: SHEETS_SCOPE,
            aud: &self.account.token_uri,
            iat: now.timestamp(),
            exp: now.timestamp() + ASSERTION_LIFETIME_SECS,
        };
        let key = EncodingKey::from_rsa_pem(self.account.private_key.as_bytes())
            .context("Service account private key is not a valid RSA PEM")?;
        encode(&Header::new(Algorithm::RS256), &claims, &key).context("Failed to sign the token assertion")
    }

    async fn access_token(&self) -> Result<String> {
        let mut cached = self.token.lock().await;
        let now = Utc::now();

        if let Some(token) = cached.as_ref()
            && token.expires_at > now + Duration::seconds(TOKEN_REFRESH_MARGIN_SECS)
        {
            return Ok(token.value.clone());
        }

        let assertion = self.assertion(now)?;
        let response = self
            .client
            .post(&self.account.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("Google token exchange failed with {}: {}", status, body);
        }

        let token: TokenResponse = response.json().await?;
        debug!("Obtained a Google access token valid for {}s", token.expires_in);

        let value = token.access_token.clone();
        *cached = Some(CachedToken {
            value: token.access_token,
            expires_at: now + Duration::seconds(token.expires_in),
        });
        Ok(value)
    }

    fn values_url(&self, range: &str, action: &str) -> String {
        format!(
            "{}/{}/values/{}{}",
            self.api_url.trim_end_matches('/'),
            self.spreadsheet_id,
            urlencoding::encode(range),
            action
        )
    }

    pub async fn append_rows(&self, range: &str, rows: Vec<Vec<Value>>) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let count = rows.len();
        let url = format!(
            "{}?valueInputOption=USER_ENTERED&insertDataOption=INSERT_ROWS",
            self.values_url(range, ":append")
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(self.access_token().await?)
            .json(&json!({ "values": rows }))
            .send()
            .await?;
        check(response, "append").await?;

        debug!("Appended {} rows to {}", count, range);
        Ok(())
    }

    pub async fn clear(&self, range: &str) -> Result<()> {
        let response = self
            .client
            .post(self.values_url(range, ":clear"))
            .bearer_auth(self.access_token().await?)
            .json(&json!({}))
            .send()
            .await?;
        check(response, "clear").await?;
        Ok(())
    }

    /// Cell values of a range as displayed text
    pub async fn read_values(&self, range: &str) -> Result<Vec<Vec<String>>> {
        let response = self
            .client
            .get(self.values_url(range, ""))
            .bearer_auth(self.access_token().await?)
            .send()
            .await?;
        let response = check(response, "read").await?;
        let range: ValueRange = response.json().await?;

        Ok(range
            .values
            .into_iter()
            .map(|row| row.iter().map(value_text).collect())
            .collect())
    }
}

async fn check(response: reqwest::Response, action: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    bail!("Google Sheets {} failed with {}: {}", action, status, body)
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// A1 range for a whole worksheet, quoted so any sheet name works
pub fn sheet_range(worksheet: &str, cells: &str) -> String {
    let quoted = format!("'{}'", worksheet.replace('\'', "''"));
    if cells.is_empty() {
        quoted
    } else {
        format!("{quoted}!{cells}")
    }
}

/// One price row as sheet cells, in `HEADER` order
pub fn row_values(row: &PriceRow) -> Vec<Value> {
    let number = |value: Option<f64>| value.map_or_else(|| json!(""), |v| json!(v));
    let article = row
        .article
        .parse::<i64>()
        .map_or_else(|_| json!(row.article), |id| json!(id));

    vec![
        json!(row.scraped_at.format("%Y-%m-%d %H:%M:%S").to_string()),
        json!(row.cabinet),
        article,
        json!(row.title),
        number(row.price_before_discount),
        number(row.price_after_discount),
        number(row.price_with_card),
        number(row.discount_percent),
        number(row.card_discount_percent),
        row.stock_count.map_or_else(|| json!(""), |s| json!(s)),
        json!(row.status.as_str()),
    ]
}

fn header_values() -> Vec<Value> {
    HEADER.iter().map(|h| json!(h)).collect()
}

/// Writes rows to a worksheet, either replacing its contents once per run
/// or appending to what is already there.
pub struct GoogleSheetsSink {
    client: GoogleSheetsClient,
    worksheet: String,
    append_only: bool,
    started: AtomicBool,
}

impl GoogleSheetsSink {
    pub fn new(client: GoogleSheetsClient, worksheet: impl Into<String>, append_only: bool) -> Self {
        Self {
            client,
            worksheet: worksheet.into(),
            append_only,
            started: AtomicBool::new(false),
        }
    }

    async fn start(&self, all: &[PriceRow]) -> Result<()> {
        let whole_sheet = sheet_range(&self.worksheet, "");

        if self.append_only {
            let first_row = self
                .client
                .read_values(&sheet_range(&self.worksheet, "A1:K1"))
                .await?;
            if first_row.iter().all(|row| row.iter().all(String::is_empty)) {
                self.client.append_rows(&whole_sheet, vec![header_values()]).await?;
            }
            return Ok(());
        }

        self.client.clear(&whole_sheet).await?;
        let mut rows = Vec::with_capacity(all.len() + 1);
        rows.push(header_values());
        rows.extend(all.iter().map(row_values));
        self.client.append_rows(&whole_sheet, rows).await?;
        info!("Replaced worksheet '{}' with {} rows", self.worksheet, all.len());
        Ok(())
    }
}

#[async_trait]
impl ResultSink for GoogleSheetsSink {
    fn name(&self) -> &str {
        "google-sheets"
    }

    async fn save(&self, all: &[PriceRow], fresh: &[PriceRow]) -> Result<()> {
        if !self.started.load(Ordering::SeqCst) {
            self.start(all).await?;
            self.started.store(true, Ordering::SeqCst);
            if !self.append_only {
                return Ok(());
            }
        }

        let rows = fresh.iter().map(row_values).collect();
        self.client
            .append_rows(&sheet_range(&self.worksheet, ""), rows)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ScrapeStatus;
    use crate::test_support::canned_server;

    const SHEETS: &str = "https://sheets.googleapis.com/v4/spreadsheets";

    fn account() -> ServiceAccount {
        serde_json::from_value(json!({
            "type": "service_account",
            "client_email": "parser@project.iam.gserviceaccount.com",
            "private_key": "not a key",
            "project_id": "project"
        }))
        .unwrap()
    }

    #[test]
    fn service_account_defaults_the_token_endpoint() {
        let account = account();
        assert_eq!(account.token_uri, DEFAULT_TOKEN_URI);
        assert_eq!(account.client_email, "parser@project.iam.gserviceaccount.com");
    }

    #[test]
    fn a_broken_private_key_cannot_sign() {
        let client = GoogleSheetsClient::new(account(), SHEETS, "sheet-id").unwrap();
        let err = client.assertion(Utc::now()).unwrap_err();
        assert!(err.to_string().contains("RSA PEM"));
    }

    #[test]
    fn ranges_are_quoted_and_encoded() {
        assert_eq!(sheet_range("Лист1", ""), "'Лист1'");
        assert_eq!(sheet_range("O'Brien", "A1:K1"), "'O''Brien'!A1:K1");

        let client = GoogleSheetsClient::new(account(), format!("{SHEETS}/"), "abc").unwrap();
        assert_eq!(
            client.values_url("'Data'!A1", ":append"),
            "https://sheets.googleapis.com/v4/spreadsheets/abc/values/%27Data%27%21A1:append"
        );
    }

    #[test]
    fn rows_are_encoded_in_header_order() {
        let row = PriceRow::empty(Utc::now(), "COSMO", "145623987", "Шампунь", ScrapeStatus::Ok)
            .with_prices(Some(2000.0), Some(1500.0), None);

        let values = row_values(&row);

        assert_eq!(values.len(), HEADER.len());
        assert_eq!(values[2], json!(145623987));
        assert_eq!(values[5], json!(1500.0));
        assert_eq!(values[6], json!(""));
        assert_eq!(values[7], json!(25.0));
        assert_eq!(values[10], json!("ok"));
    }

    #[test]
    fn displayed_values_become_text() {
        assert_eq!(value_text(&json!("1 500 ₽")), "1 500 ₽");
        assert_eq!(value_text(&json!(42)), "42");
        assert_eq!(value_text(&Value::Null), "");
    }

    /// Client for a canned server, already holding a valid token
    fn client_at(base: &str) -> GoogleSheetsClient {
        let mut client = GoogleSheetsClient::new(account(), base, "sheet").unwrap();
        *client.token.get_mut() = Some(CachedToken {
            value: "token".into(),
            expires_at: Utc::now() + Duration::hours(1),
        });
        client
    }

    fn rows(articles: &[&str]) -> Vec<PriceRow> {
        articles
            .iter()
            .map(|a| PriceRow::empty(Utc::now(), "COSMO", *a, "Шампунь", ScrapeStatus::Ok))
            .collect()
    }

    fn sent_values(body: &str) -> Vec<Vec<Value>> {
        let body: Value = serde_json::from_str(body).unwrap();
        serde_json::from_value(body["values"].clone()).unwrap()
    }

    #[tokio::test]
    async fn replace_mode_rewrites_once_then_appends() {
        let ok = || (200, "{}".to_string());
        let (base, seen) = canned_server(vec![ok(), ok(), ok()]).await;
        let sink = GoogleSheetsSink::new(client_at(&base), "Prices", false);

        let first = rows(&["1", "2"]);
        sink.save(&first, &first).await.unwrap();
        let mut all = first.clone();
        all.extend(rows(&["3"]));
        sink.save(&all, &all[2..]).await.unwrap();

        let requests = seen.lock().unwrap();
        assert_eq!(requests.len(), 3);
        assert!(requests[0].line.starts_with("POST /sheet/values/%27Prices%27:clear"));
        assert!(requests[1].line.contains(":append"));
        let written = sent_values(&requests[1].body);
        assert_eq!(written.len(), 3);
        assert_eq!(written[0][0], json!("Дата"));
        assert_eq!(written[2][2], json!(2));
        let appended = sent_values(&requests[2].body);
        assert_eq!(appended.len(), 1);
        assert_eq!(appended[0][2], json!(3));
    }

    #[tokio::test]
    async fn append_mode_adds_a_header_to_an_empty_sheet() {
        let (base, seen) = canned_server(vec![
            (200, json!({"range": "'Prices'!A1:K1"}).to_string()),
            (200, "{}".into()),
            (200, "{}".into()),
        ])
        .await;
        let sink = GoogleSheetsSink::new(client_at(&base), "Prices", true);

        let fresh = rows(&["1", "2"]);
        sink.save(&fresh, &fresh).await.unwrap();

        let requests = seen.lock().unwrap();
        assert_eq!(requests.len(), 3);
        assert!(requests[0].line.starts_with("GET /sheet/values/%27Prices%27%21A1%3AK1"));
        assert_eq!(sent_values(&requests[1].body), vec![header_values()]);
        assert_eq!(sent_values(&requests[2].body).len(), 2);
    }

    #[tokio::test]
    async fn append_mode_keeps_an_existing_header() {
        let (base, seen) = canned_server(vec![
            (200, json!({"values": [["Дата", "Кабинет"]]}).to_string()),
            (200, "{}".into()),
            (200, "{}".into()),
        ])
        .await;
        let sink = GoogleSheetsSink::new(client_at(&base), "Prices", true);

        sink.save(&rows(&["1"]), &rows(&["1"])).await.unwrap();
        sink.save(&rows(&["1", "2"]), &rows(&["2"])).await.unwrap();

        let requests = seen.lock().unwrap();
        assert_eq!(requests.len(), 3);
        assert!(requests[1..].iter().all(|r| r.line.contains(":append")));
        assert_eq!(sent_values(&requests[1].body)[0][2], json!(1));
        assert_eq!(sent_values(&requests[2].body)[0][2], json!(2));
    }

    #[tokio::test]
    async fn a_failed_first_save_is_retried_in_full() {
        let (base, seen) = canned_server(vec![
            (500, "backend error".into()),
            (200, "{}".into()),
            (200, "{}".into()),
        ])
        .await;
        let sink = GoogleSheetsSink::new(client_at(&base), "Prices", false);

        let first = rows(&["1"]);
        let err = sink.save(&first, &first).await.unwrap_err();
        assert!(err.to_string().contains("clear failed"));

        let all = rows(&["1", "2"]);
        sink.save(&all, &all[1..]).await.unwrap();

        let requests = seen.lock().unwrap();
        assert_eq!(requests.len(), 3);
        assert!(requests[1].line.contains(":clear"));
        assert_eq!(sent_values(&requests[2].body).len(), 3);
    }
}
