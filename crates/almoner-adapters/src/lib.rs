//! External HTTP collaborators: the CRM sync client and the payment
//! provider's transaction-reporting client.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;

pub const CRATE_NAME: &str = "almoner-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Retry an idempotent request, backing off on retryable statuses and
/// transport errors. `build` constructs a fresh request per attempt; the
/// final attempt's response is returned as-is for the caller's status check.
async fn send_retrying<F>(backoff: &BackoffPolicy, build: F) -> Result<reqwest::Response, reqwest::Error>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let mut last_request_error: Option<reqwest::Error> = None;

    for attempt in 0..=backoff.max_retries {
        match build().send().await {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() || !matches!(classify_status(status), RetryDisposition::Retryable) {
                    return Ok(resp);
                }
                if attempt < backoff.max_retries {
                    tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                    continue;
                }
                return Ok(resp);
            }
            Err(err) => {
                if matches!(classify_reqwest_error(&err), RetryDisposition::Retryable)
                    && attempt < backoff.max_retries
                {
                    last_request_error = Some(err);
                    tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                    continue;
                }
                return Err(err);
            }
        }
    }

    Err(last_request_error.expect("retry loop captures a request error"))
}

#[derive(Debug, Error)]
pub enum CrmError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("crm returned status {status} for {url}")]
    Status { status: u16, url: String },
    #[error("crm has no account id for {email} after conflict recovery")]
    MissingAccountId { email: String },
}

/// Fields pushed to the external constituent-relationship store.
#[derive(Debug, Clone, PartialEq)]
pub struct ConstituentUpdate {
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub last_amount: Decimal,
    pub lifetime_total: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrmOutcome {
    Created { account_id: String },
    Updated { account_id: String },
}

/// Contract consumed by the sync queue, the live ingestion path, and the
/// backfill aggregator.
#[async_trait]
pub trait CrmApi: Send + Sync {
    async fn upsert_constituent(&self, update: &ConstituentUpdate) -> Result<CrmOutcome, CrmError>;

    /// Raise the receipt-automation flag, then reset it after a fixed delay
    /// via a detached task. The reset is fire-and-forget: its failure is
    /// logged and never surfaced.
    async fn trigger_receipt(&self, email: &str) -> Result<(), CrmError>;
}

#[derive(Debug, Clone)]
pub struct CrmConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
    pub receipt_reset_delay: Duration,
    pub backoff: BackoffPolicy,
}

impl CrmConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            timeout: Duration::from_secs(20),
            receipt_reset_delay: Duration::from_secs(60),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// HTTP implementation of [`CrmApi`].
///
/// The external system has no atomic upsert, so every push is
/// search-then-branch: create on miss, update by the CRM's own account id on
/// hit. A unique-key conflict during create (another actor created the
/// record between search and create) is recovered by one re-search + update.
#[derive(Debug, Clone)]
pub struct HttpCrm {
    inner: Arc<CrmInner>,
}

#[derive(Debug)]
struct CrmInner {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    receipt_reset_delay: Duration,
    backoff: BackoffPolicy,
}

#[derive(Debug, Deserialize)]
struct AccountSearchResponse {
    #[serde(default)]
    results: Vec<AccountSearchResult>,
}

#[derive(Debug, Deserialize)]
struct AccountSearchResult {
    account_id: String,
}

#[derive(Debug, Deserialize)]
struct AccountCreateResponse {
    account_id: String,
}

enum CreateAttempt {
    Created(String),
    DuplicateKey,
}

impl HttpCrm {
    pub fn new(config: CrmConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("building crm http client")?;
        Ok(Self {
            inner: Arc::new(CrmInner {
                client,
                base_url: config.base_url.trim_end_matches('/').to_string(),
                api_key: config.api_key,
                receipt_reset_delay: config.receipt_reset_delay,
                backoff: config.backoff,
            }),
        })
    }
}

impl CrmInner {
    fn accounts_url(&self, suffix: &str) -> String {
        format!("{}/accounts{}", self.base_url, suffix)
    }

    async fn search_account_id(&self, email: &str) -> Result<Option<String>, CrmError> {
        let url = self.accounts_url("/search");
        let resp = send_retrying(&self.backoff, || {
            self.client
                .get(&url)
                .header("X-Api-Key", &self.api_key)
                .query(&[("email", email)])
        })
        .await?;

        // The CRM reports a miss as 404; that is an empty result, not a
        // failure.
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = check_status(resp).await.map_err(status_to_crm)?;
        let body: AccountSearchResponse = resp.json().await?;
        Ok(body.results.into_iter().next().map(|r| r.account_id))
    }

    async fn create_account(&self, update: &ConstituentUpdate) -> Result<CreateAttempt, CrmError> {
        let url = self.accounts_url("");
        let form = reqwest::multipart::Form::new()
            .text("email", update.email.clone())
            .text("first_name", update.first_name.clone())
            .text("last_name", update.last_name.clone())
            .text("last_donation_amount", update.last_amount.to_string())
            .text("lifetime_donated", update.lifetime_total.to_string());

        let resp = self
            .client
            .post(&url)
            .header("X-Api-Key", &self.api_key)
            .multipart(form)
            .send()
            .await?;

        if resp.status() == StatusCode::CONFLICT {
            return Ok(CreateAttempt::DuplicateKey);
        }
        let resp = check_status(resp).await.map_err(status_to_crm)?;
        let body: AccountCreateResponse = resp.json().await?;
        Ok(CreateAttempt::Created(body.account_id))
    }

    async fn update_account(
        &self,
        account_id: &str,
        update: &ConstituentUpdate,
    ) -> Result<(), CrmError> {
        let url = self.accounts_url(&format!("/{account_id}"));
        let resp = self
            .client
            .put(&url)
            .header("X-Api-Key", &self.api_key)
            .form(&[
                ("email", update.email.as_str()),
                ("first_name", update.first_name.as_str()),
                ("last_name", update.last_name.as_str()),
                ("last_donation_amount", &update.last_amount.to_string()),
                ("lifetime_donated", &update.lifetime_total.to_string()),
            ])
            .send()
            .await?;
        check_status(resp).await.map_err(status_to_crm)?;
        Ok(())
    }

    async fn set_receipt_flag(&self, account_id: &str, pending: bool) -> Result<(), CrmError> {
        let url = self.accounts_url(&format!("/{account_id}"));
        let resp = self
            .client
            .put(&url)
            .header("X-Api-Key", &self.api_key)
            .form(&[("receipt_pending", if pending { "true" } else { "false" })])
            .send()
            .await?;
        check_status(resp).await.map_err(status_to_crm)?;
        Ok(())
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, (u16, String)> {
    let status = resp.status();
    if status.is_success() {
        Ok(resp)
    } else {
        Err((status.as_u16(), resp.url().to_string()))
    }
}

fn status_to_crm((status, url): (u16, String)) -> CrmError {
    CrmError::Status { status, url }
}

#[async_trait]
impl CrmApi for HttpCrm {
    async fn upsert_constituent(&self, update: &ConstituentUpdate) -> Result<CrmOutcome, CrmError> {
        let inner = &self.inner;

        if let Some(account_id) = inner.search_account_id(&update.email).await? {
            inner.update_account(&account_id, update).await?;
            return Ok(CrmOutcome::Updated { account_id });
        }

        match inner.create_account(update).await? {
            CreateAttempt::Created(account_id) => Ok(CrmOutcome::Created { account_id }),
            CreateAttempt::DuplicateKey => {
                // Lost the create race; the record now exists, so re-search
                // and retry as an update, at most once.
                match inner.search_account_id(&update.email).await? {
                    Some(account_id) => {
                        inner.update_account(&account_id, update).await?;
                        Ok(CrmOutcome::Updated { account_id })
                    }
                    None => Err(CrmError::MissingAccountId {
                        email: update.email.clone(),
                    }),
                }
            }
        }
    }

    async fn trigger_receipt(&self, email: &str) -> Result<(), CrmError> {
        let inner = Arc::clone(&self.inner);
        let account_id = inner
            .search_account_id(email)
            .await?
            .ok_or_else(|| CrmError::MissingAccountId {
                email: email.to_string(),
            })?;

        inner.set_receipt_flag(&account_id, true).await?;

        // The reset is detached from the caller's lifetime: the triggering
        // request completes long before the delay elapses, and nothing ever
        // awaits this task.
        let delay = inner.receipt_reset_delay;
        let email = email.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(err) = inner.set_receipt_flag(&account_id, false).await {
                warn!(%email, error = %err, "receipt flag reset failed; automation may re-fire on next trigger");
            }
        });

        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("provider returned status {status} for {url}")]
    Status { status: u16, url: String },
}

fn status_to_provider((status, url): (u16, String)) -> ProviderError {
    ProviderError::Status { status, url }
}

/// One page of the provider's transaction-reporting endpoint.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TransactionsPage {
    #[serde(default)]
    pub transaction_details: Vec<TransactionDetail>,
    #[serde(default)]
    pub total_pages: u32,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TransactionDetail {
    pub transaction_info: TransactionInfo,
    #[serde(default)]
    pub payer_info: Option<PayerInfo>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TransactionInfo {
    #[serde(default)]
    pub transaction_id: Option<String>,
    #[serde(default)]
    pub transaction_status: Option<String>,
    pub transaction_amount: ProviderAmount,
    #[serde(default)]
    pub transaction_initiation_date: Option<DateTime<Utc>>,
}

impl TransactionInfo {
    /// Only fully settled transactions count toward lifetime totals.
    pub fn is_settled(&self) -> bool {
        self.transaction_status.as_deref() == Some("S")
    }

    pub fn currency_matches(&self, filter: Option<&str>) -> bool {
        match filter {
            None => true,
            Some(code) => self
                .transaction_amount
                .currency_code
                .as_deref()
                .is_some_and(|c| c.eq_ignore_ascii_case(code)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProviderAmount {
    #[serde(default)]
    pub currency_code: Option<String>,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PayerInfo {
    #[serde(default)]
    pub email_address: Option<String>,
    #[serde(default)]
    pub payer_name: Option<ProviderPayerName>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProviderPayerName {
    #[serde(default)]
    pub given_name: Option<String>,
    #[serde(default)]
    pub surname: Option<String>,
    #[serde(default)]
    pub alternate_full_name: Option<String>,
}

impl PayerInfo {
    pub fn display_name(&self) -> String {
        let Some(name) = &self.payer_name else {
            return String::new();
        };
        match (&name.given_name, &name.surname) {
            (Some(given), Some(surname)) => format!("{given} {surname}"),
            (Some(given), None) => given.clone(),
            _ => name.alternate_full_name.clone().unwrap_or_default(),
        }
    }
}

/// Read access to the provider's transaction history, behind a trait so the
/// backfill aggregator is testable against synthetic transaction sets.
#[async_trait]
pub trait TransactionSource: Send + Sync {
    async fn search_transactions(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        page: u32,
        page_size: u32,
    ) -> Result<TransactionsPage, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub base_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl ProviderConfig {
    pub fn new(
        base_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            timeout: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Transaction-reporting client using OAuth2 client-credentials, with the
/// bearer token cached until shortly before expiry.
#[derive(Debug)]
pub struct ProviderClient {
    client: reqwest::Client,
    base_url: String,
    client_id: String,
    client_secret: String,
    backoff: BackoffPolicy,
    token: Mutex<Option<CachedToken>>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

/// Provider timestamps are ISO-8601 with no fractional seconds.
pub fn provider_timestamp(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

impl ProviderClient {
    pub fn new(config: ProviderConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("building provider http client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client_id: config.client_id,
            client_secret: config.client_secret,
            backoff: config.backoff,
            token: Mutex::new(None),
        })
    }

    async fn access_token(&self) -> Result<String, ProviderError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() + Duration::from_secs(60) {
                return Ok(token.access_token.clone());
            }
        }

        let url = format!("{}/v1/oauth2/token", self.base_url);
        let resp = send_retrying(&self.backoff, || {
            self.client
                .post(&url)
                .basic_auth(&self.client_id, Some(&self.client_secret))
                .form(&[("grant_type", "client_credentials")])
        })
        .await?;
        let resp = check_status(resp).await.map_err(status_to_provider)?;
        let body: TokenResponse = resp.json().await?;

        let token = CachedToken {
            access_token: body.access_token.clone(),
            expires_at: Instant::now() + Duration::from_secs(body.expires_in),
        };
        *cached = Some(token);
        Ok(body.access_token)
    }
}

#[async_trait]
impl TransactionSource for ProviderClient {
    async fn search_transactions(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        page: u32,
        page_size: u32,
    ) -> Result<TransactionsPage, ProviderError> {
        let token = self.access_token().await?;
        let url = format!("{}/v1/reporting/transactions", self.base_url);
        let resp = send_retrying(&self.backoff, || {
            self.client
                .get(&url)
                .bearer_auth(&token)
                .query(&[
                    ("start_date", provider_timestamp(start)),
                    ("end_date", provider_timestamp(end)),
                    ("page", page.to_string()),
                    ("page_size", page_size.to_string()),
                    ("fields", "transaction_info,payer_info".to_string()),
                ])
        })
        .await?;
        let resp = check_status(resp).await.map_err(status_to_provider)?;
        Ok(resp.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::CONFLICT),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn provider_timestamps_have_no_fractional_seconds() {
        let ts = Utc
            .with_ymd_and_hms(2026, 1, 31, 23, 59, 59)
            .single()
            .unwrap();
        assert_eq!(provider_timestamp(ts), "2026-01-31T23:59:59Z");
    }

    #[test]
    fn transactions_page_deserializes() {
        let body = serde_json::json!({
            "transaction_details": [{
                "transaction_info": {
                    "transaction_id": "TX1",
                    "transaction_status": "S",
                    "transaction_amount": {"currency_code": "USD", "value": "25.00"},
                    "transaction_initiation_date": "2026-01-15T08:00:00Z"
                },
                "payer_info": {
                    "email_address": "a@x.com",
                    "payer_name": {"given_name": "Ada", "surname": "Lovelace"}
                }
            }],
            "total_pages": 3,
            "total_items": 41
        });
        let page: TransactionsPage = serde_json::from_value(body).unwrap();
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.transaction_details.len(), 1);
        let detail = &page.transaction_details[0];
        assert!(detail.transaction_info.is_settled());
        assert_eq!(
            detail.payer_info.as_ref().unwrap().display_name(),
            "Ada Lovelace"
        );
    }

    #[test]
    fn pending_transactions_are_not_settled() {
        let info: TransactionInfo = serde_json::from_value(serde_json::json!({
            "transaction_status": "P",
            "transaction_amount": {"value": "5.00"}
        }))
        .unwrap();
        assert!(!info.is_settled());
    }

    #[test]
    fn currency_filter_matches_case_insensitively() {
        let info: TransactionInfo = serde_json::from_value(serde_json::json!({
            "transaction_status": "S",
            "transaction_amount": {"currency_code": "usd", "value": "5.00"}
        }))
        .unwrap();
        assert!(info.currency_matches(None));
        assert!(info.currency_matches(Some("USD")));
        assert!(!info.currency_matches(Some("EUR")));
    }

    #[test]
    fn payer_name_falls_back_to_alternate_full_name() {
        let payer: PayerInfo = serde_json::from_value(serde_json::json!({
            "email_address": "b@x.com",
            "payer_name": {"alternate_full_name": "Sporty's Awards"}
        }))
        .unwrap();
        assert_eq!(payer.display_name(), "Sporty's Awards");
    }

    #[test]
    fn search_response_tolerates_missing_results() {
        let resp: AccountSearchResponse = serde_json::from_str("{}").unwrap();
        assert!(resp.results.is_empty());
    }
}
