//! Durable donor/donation ledger + audit snapshot storage for Almoner.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use almoner_core::{DonationEvent, DonationRecord, DonorRecord};

pub const CRATE_NAME: &str = "almoner-storage";

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Result of recording one donation event against the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// A new donation row was written and the donor's lifetime total now
    /// includes it.
    Recorded { new_lifetime: Decimal },
    /// A donation with this transaction id already exists; nothing changed.
    Duplicate,
}

/// The ledger contract consumed by the ingestion service and the sync queue.
///
/// `record_donation` is the only mutation path for donation rows and runs as
/// one transaction: the donation insert's uniqueness constraint decides
/// whether the donor's lifetime total is incremented, so a replayed delivery
/// can never double-count.
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn find_donor(&self, email: &str) -> Result<Option<DonorRecord>, LedgerError>;

    async fn record_donation(
        &self,
        event: &DonationEvent,
        source: &str,
    ) -> Result<IngestOutcome, LedgerError>;

    /// Mark a donor's CRM representation as current again. Called by the
    /// sync queue after a successful push.
    async fn clear_pending(&self, email: &str) -> Result<(), LedgerError>;
}

/// Postgres-backed ledger.
#[derive(Debug, Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, LedgerError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), LedgerError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn donor_from_row(row: &sqlx::postgres::PgRow) -> Result<DonorRecord, sqlx::Error> {
        Ok(DonorRecord {
            id: row.try_get("id")?,
            email: row.try_get("email")?,
            legal_first_name: row.try_get("legal_first_name")?,
            legal_last_name: row.try_get("legal_last_name")?,
            preferred_first_name: row.try_get("preferred_first_name")?,
            preferred_last_name: row.try_get("preferred_last_name")?,
            full_name: row.try_get("full_name")?,
            lifetime_donated: row.try_get("lifetime_donated")?,
            last_donation_amount: row.try_get("last_donation_amount")?,
            pending_update: row.try_get("pending_update")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl Ledger for PgLedger {
    async fn find_donor(&self, email: &str) -> Result<Option<DonorRecord>, LedgerError> {
        let row = sqlx::query(
            r#"
            SELECT id, email, legal_first_name, legal_last_name,
                   preferred_first_name, preferred_last_name, full_name,
                   lifetime_donated, last_donation_amount, pending_update,
                   created_at, updated_at
              FROM donors
             WHERE email = $1
            "#,
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::donor_from_row).transpose().map_err(Into::into)
    }

    async fn record_donation(
        &self,
        event: &DonationEvent,
        source: &str,
    ) -> Result<IngestOutcome, LedgerError> {
        let mut tx = self.pool.begin().await?;

        // A shell row so the donation FK resolves; names and totals are only
        // touched once the donation insert is known to be new.
        sqlx::query(
            r#"
            INSERT INTO donors (id, email, legal_first_name, legal_last_name)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (email) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&event.email)
        .bind(&event.raw_first_name)
        .bind(&event.raw_last_name)
        .execute(&mut *tx)
        .await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO donations
                (id, donor_id, donation_date, amount, source, raw_email, external_txn_id)
            SELECT $1, d.id, $2, $3, $4, $5, $6
              FROM donors d
             WHERE d.email = $5
            ON CONFLICT (external_txn_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(event.occurred_at)
        .bind(event.amount)
        .bind(source)
        .bind(&event.email)
        .bind(&event.external_txn_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            // Replayed delivery. The transaction commits without touching the
            // donor, which is what keeps the lifetime total exactly-once.
            tx.commit().await?;
            return Ok(IngestOutcome::Duplicate);
        }

        let row = sqlx::query(
            r#"
            UPDATE donors
               SET legal_first_name = $1,
                   legal_last_name = $2,
                   lifetime_donated = lifetime_donated + $3,
                   last_donation_amount = $3,
                   pending_update = TRUE,
                   updated_at = now()
             WHERE email = $4
            RETURNING lifetime_donated
            "#,
        )
        .bind(&event.raw_first_name)
        .bind(&event.raw_last_name)
        .bind(event.amount)
        .bind(&event.email)
        .fetch_one(&mut *tx)
        .await?;
        let new_lifetime: Decimal = row.try_get("lifetime_donated")?;

        tx.commit().await?;
        Ok(IngestOutcome::Recorded { new_lifetime })
    }

    async fn clear_pending(&self, email: &str) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            UPDATE donors
               SET pending_update = FALSE,
                   updated_at = now()
             WHERE email = $1
            "#,
        )
        .bind(email)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// In-memory ledger with the same transactional semantics as [`PgLedger`].
/// Used by tests and local development without a database.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    inner: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    donors: HashMap<String, DonorRecord>,
    donations: Vec<DonationRecord>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn donation_count_for(&self, email: &str) -> usize {
        let state = self.inner.lock().expect("ledger lock poisoned");
        let Some(donor) = state.donors.get(email) else {
            return 0;
        };
        let donor_id = donor.id;
        state
            .donations
            .iter()
            .filter(|d| d.donor_id == donor_id)
            .count()
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn find_donor(&self, email: &str) -> Result<Option<DonorRecord>, LedgerError> {
        let state = self.inner.lock().expect("ledger lock poisoned");
        Ok(state.donors.get(email).cloned())
    }

    async fn record_donation(
        &self,
        event: &DonationEvent,
        source: &str,
    ) -> Result<IngestOutcome, LedgerError> {
        let mut state = self.inner.lock().expect("ledger lock poisoned");

        if let Some(txn_id) = &event.external_txn_id {
            let replayed = state
                .donations
                .iter()
                .any(|d| d.external_txn_id.as_deref() == Some(txn_id));
            if replayed {
                return Ok(IngestOutcome::Duplicate);
            }
        }

        let now = Utc::now();
        let donor = state
            .donors
            .entry(event.email.clone())
            .or_insert_with(|| DonorRecord {
                id: Uuid::new_v4(),
                email: event.email.clone(),
                legal_first_name: String::new(),
                legal_last_name: String::new(),
                preferred_first_name: None,
                preferred_last_name: None,
                full_name: None,
                lifetime_donated: Decimal::ZERO,
                last_donation_amount: None,
                pending_update: false,
                created_at: now,
                updated_at: now,
            });
        donor.legal_first_name = event.raw_first_name.clone();
        donor.legal_last_name = event.raw_last_name.clone();
        donor.lifetime_donated += event.amount;
        donor.last_donation_amount = Some(event.amount);
        donor.pending_update = true;
        donor.updated_at = now;
        let new_lifetime = donor.lifetime_donated;
        let donor_id = donor.id;

        state.donations.push(DonationRecord {
            id: Uuid::new_v4(),
            donor_id,
            donation_date: event.occurred_at,
            amount: event.amount,
            source: source.to_string(),
            raw_email: event.email.clone(),
            external_txn_id: event.external_txn_id.clone(),
            created_at: now,
        });

        Ok(IngestOutcome::Recorded { new_lifetime })
    }

    async fn clear_pending(&self, email: &str) -> Result<(), LedgerError> {
        let mut state = self.inner.lock().expect("ledger lock poisoned");
        if let Some(donor) = state.donors.get_mut(email) {
            donor.pending_update = false;
            donor.updated_at = Utc::now();
        }
        Ok(())
    }
}

/// One donor's line in the backfill audit snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub total: Decimal,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct WrittenSnapshot {
    pub path: PathBuf,
    pub sha256: String,
    pub byte_size: u64,
    pub entries: usize,
}

/// Writes the timestamped JSON audit artifact produced by a backfill run,
/// using an atomic temp-file rename so a crashed run never leaves a torn
/// document behind.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn snapshot_file_name(taken_at: DateTime<Utc>) -> String {
        format!("lifetime_totals_{}.json", taken_at.format("%Y%m%d_%H%M%S"))
    }

    pub async fn write(
        &self,
        taken_at: DateTime<Utc>,
        totals: &BTreeMap<String, SnapshotEntry>,
    ) -> anyhow::Result<WrittenSnapshot> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating snapshot directory {}", self.root.display()))?;

        let bytes = serde_json::to_vec_pretty(totals).context("serializing audit snapshot")?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let sha256 = hex::encode(hasher.finalize());

        let final_path = self.root.join(Self::snapshot_file_name(taken_at));
        let temp_path = self.root.join(format!(".{}.tmp", Uuid::new_v4()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp snapshot file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp snapshot file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp snapshot file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &final_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp snapshot {} -> {}",
                    temp_path.display(),
                    final_path.display()
                )
            });
        }

        Ok(WrittenSnapshot {
            path: final_path,
            sha256,
            byte_size: bytes.len() as u64,
            entries: totals.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn event(email: &str, amount: &str, txn_id: Option<&str>) -> DonationEvent {
        DonationEvent {
            email: email.to_string(),
            raw_first_name: "Ada".to_string(),
            raw_last_name: "Lovelace".to_string(),
            amount: amount.parse().expect("amount"),
            occurred_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap(),
            external_txn_id: txn_id.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn lifetime_total_is_exact_decimal_sum() {
        let ledger = MemoryLedger::new();
        for (amount, txn) in [("25.00", "T1"), ("10.00", "T2"), ("0.10", "T3"), ("0.20", "T4")] {
            ledger
                .record_donation(&event("a@x.com", amount, Some(txn)), "paypal")
                .await
                .unwrap();
        }
        let donor = ledger.find_donor("a@x.com").await.unwrap().unwrap();
        assert_eq!(donor.lifetime_donated, "35.30".parse::<Decimal>().unwrap());
        assert_eq!(ledger.donation_count_for("a@x.com"), 4);
        assert!(donor.pending_update);
    }

    #[tokio::test]
    async fn replayed_txn_id_is_a_noop() {
        let ledger = MemoryLedger::new();
        let first = ledger
            .record_donation(&event("a@x.com", "25.00", Some("T1")), "paypal")
            .await
            .unwrap();
        assert_eq!(
            first,
            IngestOutcome::Recorded {
                new_lifetime: "25.00".parse().unwrap()
            }
        );

        for _ in 0..3 {
            let replay = ledger
                .record_donation(&event("a@x.com", "25.00", Some("T1")), "paypal")
                .await
                .unwrap();
            assert_eq!(replay, IngestOutcome::Duplicate);
        }

        let donor = ledger.find_donor("a@x.com").await.unwrap().unwrap();
        assert_eq!(donor.lifetime_donated, "25.00".parse::<Decimal>().unwrap());
        assert_eq!(ledger.donation_count_for("a@x.com"), 1);
    }

    #[tokio::test]
    async fn missing_txn_id_is_never_deduplicated() {
        let ledger = MemoryLedger::new();
        ledger
            .record_donation(&event("a@x.com", "5.00", None), "paypal")
            .await
            .unwrap();
        ledger
            .record_donation(&event("a@x.com", "5.00", None), "paypal")
            .await
            .unwrap();
        let donor = ledger.find_donor("a@x.com").await.unwrap().unwrap();
        assert_eq!(donor.lifetime_donated, "10.00".parse::<Decimal>().unwrap());
        assert_eq!(ledger.donation_count_for("a@x.com"), 2);
    }

    #[tokio::test]
    async fn names_track_latest_event() {
        let ledger = MemoryLedger::new();
        ledger
            .record_donation(&event("a@x.com", "5.00", Some("T1")), "paypal")
            .await
            .unwrap();
        let mut renamed = event("a@x.com", "5.00", Some("T2"));
        renamed.raw_first_name = "Augusta".to_string();
        ledger.record_donation(&renamed, "paypal").await.unwrap();

        let donor = ledger.find_donor("a@x.com").await.unwrap().unwrap();
        assert_eq!(donor.legal_first_name, "Augusta");
    }

    #[tokio::test]
    async fn clear_pending_resets_dirty_flag() {
        let ledger = MemoryLedger::new();
        ledger
            .record_donation(&event("a@x.com", "5.00", Some("T1")), "paypal")
            .await
            .unwrap();
        ledger.clear_pending("a@x.com").await.unwrap();
        let donor = ledger.find_donor("a@x.com").await.unwrap().unwrap();
        assert!(!donor.pending_update);
    }

    #[tokio::test]
    async fn snapshot_write_is_atomic_and_hashed() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        let taken_at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap();

        let mut totals = BTreeMap::new();
        totals.insert(
            "a@x.com".to_string(),
            SnapshotEntry {
                total: "35.00".parse().unwrap(),
                name: "Ada Lovelace".to_string(),
            },
        );

        let written = store.write(taken_at, &totals).await.expect("snapshot");
        assert_eq!(written.entries, 1);
        assert!(written.path.exists());
        assert_eq!(
            written.path.file_name().unwrap().to_str().unwrap(),
            "lifetime_totals_20260301_120000.json"
        );

        let raw = std::fs::read(&written.path).unwrap();
        let mut hasher = Sha256::new();
        hasher.update(&raw);
        assert_eq!(hex::encode(hasher.finalize()), written.sha256);

        let parsed: BTreeMap<String, SnapshotEntry> = serde_json::from_slice(&raw).unwrap();
        assert_eq!(parsed, totals);
    }
}
