//! Core domain model and webhook normalization for Almoner.
//!
//! Everything in this crate is pure and deterministic: payload parsing,
//! amount handling, and display-name selection perform no I/O, which makes
//! this the layer exercised by the bulk of the unit tests.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "almoner-core";

/// Source tag recorded on every donation accepted from the live webhook.
pub const WEBHOOK_SOURCE: &str = "paypal";

/// REST event type accepted by the normalizer. Every other event type is
/// acknowledged and dropped.
pub const CAPTURE_COMPLETED_EVENT: &str = "PAYMENT.CAPTURE.COMPLETED";

/// Expected webhook rejections. These are not faults: the endpoint
/// acknowledges them so the provider stops redelivering.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("unhandled event type: {0}")]
    UnhandledEventType(String),
    #[error("unhandled notification status: txn_type={txn_type}, payment_status={payment_status}")]
    UnhandledStatus {
        txn_type: String,
        payment_status: String,
    },
    #[error("payload carries no payer email")]
    MissingEmail,
}

/// Canonical, provider-agnostic donation event handed to the ingestion
/// pipeline. `email` is the donor identity and is always lowercase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DonationEvent {
    pub email: String,
    pub raw_first_name: String,
    pub raw_last_name: String,
    /// Non-negative, normalized to two decimal places.
    pub amount: Decimal,
    pub occurred_at: DateTime<Utc>,
    /// Dedup key when the provider supplies one. Events without a
    /// transaction id are never deduplicated.
    pub external_txn_id: Option<String>,
}

/// The two incompatible webhook shapes, distinguished once at the parsing
/// boundary so downstream consumers never sniff payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookPayload {
    RestCapture(RestCaptureEvent),
    LegacyIpn(LegacyIpnEvent),
}

/// Structured REST webhook event carrying a completed capture.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RestCaptureEvent {
    pub event_type: String,
    #[serde(default)]
    pub create_time: Option<DateTime<Utc>>,
    pub resource: CaptureResource,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CaptureResource {
    pub id: String,
    pub amount: CaptureAmount,
    #[serde(default)]
    pub payer: Option<CapturePayer>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CaptureAmount {
    #[serde(default)]
    pub currency_code: Option<String>,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CapturePayer {
    #[serde(default)]
    pub email_address: Option<String>,
    #[serde(default)]
    pub name: Option<PayerName>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PayerName {
    #[serde(default)]
    pub given_name: Option<String>,
    #[serde(default)]
    pub surname: Option<String>,
}

/// Legacy form-encoded payment notification. Field names follow the wire
/// format; all are optional because the notification format predates any
/// schema guarantee.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct LegacyIpnEvent {
    #[serde(default)]
    pub txn_type: Option<String>,
    #[serde(default)]
    pub payment_status: Option<String>,
    #[serde(default)]
    pub payer_email: Option<String>,
    #[serde(default)]
    pub receiver_email: Option<String>,
    #[serde(default)]
    pub custom: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub mc_gross: Option<String>,
    #[serde(default)]
    pub txn_id: Option<String>,
}

impl WebhookPayload {
    /// Parse a raw body into one of the two recognized shapes based on the
    /// request content type.
    pub fn parse(raw_body: &[u8], content_type: &str) -> Result<Self, Rejection> {
        // Content types may carry parameters, e.g. "application/json; charset=utf-8".
        let media_type = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        match media_type.as_str() {
            "application/json" => {
                let event: RestCaptureEvent = serde_json::from_slice(raw_body)
                    .map_err(|err| Rejection::Malformed(err.to_string()))?;
                Ok(Self::RestCapture(event))
            }
            "application/x-www-form-urlencoded" => {
                let event: LegacyIpnEvent = serde_urlencoded::from_bytes(raw_body)
                    .map_err(|err| Rejection::Malformed(err.to_string()))?;
                Ok(Self::LegacyIpn(event))
            }
            other => Err(Rejection::UnsupportedContentType(other.to_string())),
        }
    }
}

/// Map a provider payload into the canonical [`DonationEvent`].
///
/// `received_at` is the server-side receipt time; it becomes `occurred_at`
/// whenever the provider omits a usable timestamp, keeping this function
/// fully deterministic for callers that pin it.
pub fn normalize(
    raw_body: &[u8],
    content_type: &str,
    received_at: DateTime<Utc>,
) -> Result<DonationEvent, Rejection> {
    match WebhookPayload::parse(raw_body, content_type)? {
        WebhookPayload::RestCapture(event) => normalize_rest(event, received_at),
        WebhookPayload::LegacyIpn(event) => normalize_ipn(event, received_at),
    }
}

fn normalize_rest(
    event: RestCaptureEvent,
    received_at: DateTime<Utc>,
) -> Result<DonationEvent, Rejection> {
    if event.event_type != CAPTURE_COMPLETED_EVENT {
        return Err(Rejection::UnhandledEventType(event.event_type));
    }

    let payer = event.resource.payer.unwrap_or(CapturePayer {
        email_address: None,
        name: None,
    });
    let email = normalize_email(payer.email_address.as_deref()).ok_or(Rejection::MissingEmail)?;
    let name = payer.name.unwrap_or(PayerName {
        given_name: None,
        surname: None,
    });

    Ok(DonationEvent {
        email,
        raw_first_name: name.given_name.unwrap_or_default(),
        raw_last_name: name.surname.unwrap_or_default(),
        amount: parse_amount(&event.resource.amount.value)?,
        occurred_at: event.create_time.unwrap_or(received_at),
        external_txn_id: Some(event.resource.id),
    })
}

fn normalize_ipn(
    event: LegacyIpnEvent,
    received_at: DateTime<Utc>,
) -> Result<DonationEvent, Rejection> {
    let txn_type = event.txn_type.unwrap_or_default();
    let payment_status = event.payment_status.unwrap_or_default();
    if !txn_type.eq_ignore_ascii_case("web_accept")
        || !payment_status.eq_ignore_ascii_case("completed")
    {
        return Err(Rejection::UnhandledStatus {
            txn_type,
            payment_status,
        });
    }

    // Older notifications occasionally omit payer_email; the receiver/custom
    // passthrough fields are the documented fallback.
    let email = normalize_email(event.payer_email.as_deref())
        .or_else(|| normalize_email(event.receiver_email.as_deref()))
        .or_else(|| normalize_email(event.custom.as_deref()))
        .ok_or(Rejection::MissingEmail)?;

    let gross = event
        .mc_gross
        .ok_or_else(|| Rejection::Malformed("missing mc_gross".to_string()))?;

    // The legacy shape carries no machine-parseable timestamp, so the
    // donation is dated at receipt.
    Ok(DonationEvent {
        email,
        raw_first_name: event.first_name.unwrap_or_default(),
        raw_last_name: event.last_name.unwrap_or_default(),
        amount: parse_amount(&gross)?,
        occurred_at: received_at,
        external_txn_id: event.txn_id.filter(|id| !id.trim().is_empty()),
    })
}

fn normalize_email(raw: Option<&str>) -> Option<String> {
    let trimmed = raw?.trim();
    if trimmed.is_empty() || !trimmed.contains('@') {
        return None;
    }
    Some(trimmed.to_ascii_lowercase())
}

/// Parse a provider-formatted amount string into a two-decimal [`Decimal`].
///
/// Accepts thousands separators and a leading currency symbol; rejects
/// anything negative or unparseable.
pub fn parse_amount(raw: &str) -> Result<Decimal, Rejection> {
    let cleaned = raw.trim().trim_start_matches('$').replace(',', "");
    let amount: Decimal = cleaned
        .parse()
        .map_err(|_| Rejection::Malformed(format!("unparseable amount: {raw}")))?;
    if amount.is_sign_negative() {
        return Err(Rejection::Malformed(format!("negative amount: {raw}")));
    }
    Ok(amount.round_dp(2))
}

/// Durable donor row. Identity is the (lowercase) email; the record is
/// created on first donation and never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DonorRecord {
    pub id: Uuid,
    pub email: String,
    pub legal_first_name: String,
    pub legal_last_name: String,
    pub preferred_first_name: Option<String>,
    pub preferred_last_name: Option<String>,
    /// Denormalized single-field name kept for donors imported before the
    /// first/last split existed.
    pub full_name: Option<String>,
    /// Monotonically non-decreasing sum of every ingested donation.
    pub lifetime_donated: Decimal,
    pub last_donation_amount: Option<Decimal>,
    /// Dirty flag: the external CRM may not reflect the latest ledger state.
    pub pending_update: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only donation row. `external_txn_id`, when present, is the
/// uniqueness key absorbing duplicate provider deliveries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DonationRecord {
    pub id: Uuid,
    pub donor_id: Uuid,
    pub donation_date: DateTime<Utc>,
    pub amount: Decimal,
    pub source: String,
    pub raw_email: String,
    pub external_txn_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Pick the name pair presented to the external CRM.
///
/// Preference order: explicitly curated preferred names, then the
/// denormalized full-name field split on whitespace, then the legal name
/// parts captured from the provider.
pub fn display_name(donor: &DonorRecord) -> (String, String) {
    let preferred_first = donor
        .preferred_first_name
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty());
    let preferred_last = donor
        .preferred_last_name
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty());
    if preferred_first.is_some() || preferred_last.is_some() {
        return (
            preferred_first.unwrap_or_default().to_string(),
            preferred_last.unwrap_or_default().to_string(),
        );
    }

    if let Some(full) = donor
        .full_name
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        return split_full_name(full);
    }

    (
        donor.legal_first_name.clone(),
        donor.legal_last_name.clone(),
    )
}

/// Split a single denormalized name field into a (first, rest) pair on
/// whitespace. `"Catherine & Warren Casleton"` becomes
/// `("Catherine", "& Warren Casleton")`.
pub fn split_full_name(full: &str) -> (String, String) {
    let mut parts = full.split_whitespace();
    let first = parts.next().unwrap_or_default().to_string();
    let rest = parts.collect::<Vec<_>>().join(" ");
    (first, rest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn received_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).single().unwrap()
    }

    fn rest_capture_body(event_type: &str, email: Option<&str>, value: &str, id: &str) -> Vec<u8> {
        let payer = match email {
            Some(email) => serde_json::json!({
                "email_address": email,
                "name": {"given_name": "Ada", "surname": "Lovelace"}
            }),
            None => serde_json::json!({}),
        };
        serde_json::to_vec(&serde_json::json!({
            "event_type": event_type,
            "create_time": "2026-02-28T18:00:00Z",
            "resource": {
                "id": id,
                "amount": {"currency_code": "USD", "value": value},
                "payer": payer
            }
        }))
        .unwrap()
    }

    #[test]
    fn rest_capture_completed_normalizes() {
        let body = rest_capture_body(CAPTURE_COMPLETED_EVENT, Some("Ada@Example.COM"), "25.00", "T1");
        let event = normalize(&body, "application/json", received_at()).unwrap();
        assert_eq!(event.email, "ada@example.com");
        assert_eq!(event.raw_first_name, "Ada");
        assert_eq!(event.raw_last_name, "Lovelace");
        assert_eq!(event.amount, "25.00".parse::<Decimal>().unwrap());
        assert_eq!(event.external_txn_id.as_deref(), Some("T1"));
        assert_eq!(
            event.occurred_at,
            Utc.with_ymd_and_hms(2026, 2, 28, 18, 0, 0).single().unwrap()
        );
    }

    #[test]
    fn rest_other_event_types_rejected() {
        let body = rest_capture_body("PAYMENT.CAPTURE.REFUNDED", Some("a@x.com"), "25.00", "T1");
        let err = normalize(&body, "application/json", received_at()).unwrap_err();
        assert_eq!(
            err,
            Rejection::UnhandledEventType("PAYMENT.CAPTURE.REFUNDED".to_string())
        );
    }

    #[test]
    fn rest_missing_email_rejected() {
        let body = rest_capture_body(CAPTURE_COMPLETED_EVENT, None, "25.00", "T1");
        let err = normalize(&body, "application/json", received_at()).unwrap_err();
        assert_eq!(err, Rejection::MissingEmail);
    }

    #[test]
    fn rest_content_type_parameters_are_ignored() {
        let body = rest_capture_body(CAPTURE_COMPLETED_EVENT, Some("a@x.com"), "10.00", "T9");
        let event = normalize(&body, "application/json; charset=utf-8", received_at()).unwrap();
        assert_eq!(event.email, "a@x.com");
    }

    #[test]
    fn ipn_web_accept_completed_normalizes() {
        let body = b"txn_type=web_accept&payment_status=Completed&payer_email=Don%40Example.com\
                     &first_name=Don&last_name=Giver&mc_gross=50.00&txn_id=IPN1";
        let event = normalize(body, "application/x-www-form-urlencoded", received_at()).unwrap();
        assert_eq!(event.email, "don@example.com");
        assert_eq!(event.amount, "50.00".parse::<Decimal>().unwrap());
        assert_eq!(event.external_txn_id.as_deref(), Some("IPN1"));
        // Legacy notifications are dated at receipt.
        assert_eq!(event.occurred_at, received_at());
    }

    #[test]
    fn ipn_status_matching_is_case_insensitive() {
        let body = b"txn_type=WEB_ACCEPT&payment_status=COMPLETED&payer_email=a%40x.com&mc_gross=5";
        assert!(normalize(body, "application/x-www-form-urlencoded", received_at()).is_ok());
    }

    #[test]
    fn ipn_pending_status_rejected() {
        let body = b"txn_type=web_accept&payment_status=Pending&payer_email=a%40x.com&mc_gross=5.00";
        let err = normalize(body, "application/x-www-form-urlencoded", received_at()).unwrap_err();
        assert_eq!(
            err,
            Rejection::UnhandledStatus {
                txn_type: "web_accept".to_string(),
                payment_status: "Pending".to_string(),
            }
        );
    }

    #[test]
    fn ipn_subscription_txn_type_rejected() {
        let body = b"txn_type=subscr_payment&payment_status=Completed&payer_email=a%40x.com&mc_gross=5";
        assert!(matches!(
            normalize(body, "application/x-www-form-urlencoded", received_at()),
            Err(Rejection::UnhandledStatus { .. })
        ));
    }

    #[test]
    fn ipn_email_falls_back_to_custom_field() {
        let body = b"txn_type=web_accept&payment_status=Completed&custom=fallback%40x.com&mc_gross=5.00";
        let event = normalize(body, "application/x-www-form-urlencoded", received_at()).unwrap();
        assert_eq!(event.email, "fallback@x.com");
    }

    #[test]
    fn ipn_without_any_email_rejected() {
        let body = b"txn_type=web_accept&payment_status=Completed&mc_gross=5.00&txn_id=T";
        let err = normalize(body, "application/x-www-form-urlencoded", received_at()).unwrap_err();
        assert_eq!(err, Rejection::MissingEmail);
    }

    #[test]
    fn ipn_blank_txn_id_disables_dedup() {
        let body = b"txn_type=web_accept&payment_status=Completed&payer_email=a%40x.com&mc_gross=5&txn_id=";
        let event = normalize(body, "application/x-www-form-urlencoded", received_at()).unwrap();
        assert_eq!(event.external_txn_id, None);
    }

    #[test]
    fn unknown_content_type_rejected() {
        let err = normalize(b"<xml/>", "text/xml", received_at()).unwrap_err();
        assert_eq!(err, Rejection::UnsupportedContentType("text/xml".to_string()));
    }

    #[test]
    fn malformed_json_rejected() {
        assert!(matches!(
            normalize(b"{not json", "application/json", received_at()),
            Err(Rejection::Malformed(_))
        ));
    }

    #[test]
    fn amounts_are_cleaned_and_rounded() {
        assert_eq!(
            parse_amount("$1,234.5").unwrap(),
            "1234.50".parse::<Decimal>().unwrap()
        );
        assert_eq!(parse_amount("10.005").unwrap(), "10.00".parse::<Decimal>().unwrap());
        assert!(matches!(parse_amount("-3.00"), Err(Rejection::Malformed(_))));
        assert!(matches!(parse_amount("ten"), Err(Rejection::Malformed(_))));
    }

    fn donor_with_names(
        preferred: Option<(&str, &str)>,
        full: Option<&str>,
        legal: (&str, &str),
    ) -> DonorRecord {
        DonorRecord {
            id: Uuid::new_v4(),
            email: "a@x.com".to_string(),
            legal_first_name: legal.0.to_string(),
            legal_last_name: legal.1.to_string(),
            preferred_first_name: preferred.map(|(f, _)| f.to_string()),
            preferred_last_name: preferred.map(|(_, l)| l.to_string()),
            full_name: full.map(str::to_string),
            lifetime_donated: Decimal::ZERO,
            last_donation_amount: None,
            pending_update: false,
            created_at: received_at(),
            updated_at: received_at(),
        }
    }

    #[test]
    fn display_name_prefers_curated_names() {
        let donor = donor_with_names(Some(("Sister", "Agatha")), Some("S Agatha"), ("S", "A"));
        assert_eq!(display_name(&donor), ("Sister".to_string(), "Agatha".to_string()));
    }

    #[test]
    fn display_name_splits_full_name_on_whitespace() {
        let donor = donor_with_names(None, Some("Catherine & Warren Casleton"), ("C", "C"));
        assert_eq!(
            display_name(&donor),
            ("Catherine".to_string(), "& Warren Casleton".to_string())
        );
    }

    #[test]
    fn display_name_falls_back_to_legal_parts() {
        let donor = donor_with_names(None, None, ("Don", "Giver"));
        assert_eq!(display_name(&donor), ("Don".to_string(), "Giver".to_string()));
    }
}
