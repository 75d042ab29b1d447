//! Persistence and outbound plumbing: debug artifacts, the job status store,
//! the shared retry policy and the completion-callback HTTP client.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use encerra_core::{ClientRecord, JobRecord, JobStatus, TaxId, ValidationError, YesNo};
use reqwest::StatusCode;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Diagnostic files (CAPTCHA captures, failure screenshots). Nothing reads them back.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn artifact_relative_path(
        &self,
        captured_at: DateTime<Utc>,
        category: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let day = captured_at.format("%Y%m%d").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(day)
            .join(category)
            .join(format!("{content_hash}.{ext}"))
    }

    /// Store bytes under a hash-addressed path using an atomic temp-file rename.
    pub async fn store_bytes(
        &self,
        captured_at: DateTime<Utc>,
        category: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredArtifact> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path =
            self.artifact_relative_path(captured_at, category, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating artifact directory {}", parent.display()))?;

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking artifact path {}", absolute_path.display()))?
        {
            return Ok(StoredArtifact {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp artifact file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp artifact file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp artifact file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(StoredArtifact {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: false,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(StoredArtifact {
                    content_hash,
                    relative_path,
                    absolute_path,
                    byte_size: bytes.len(),
                    deduplicated: true,
                })
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp artifact {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

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

/// Bounded attempts with capped exponential backoff between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

/// Terminal failure of a retried operation.
#[derive(Debug, Error)]
#[error("gave up after {attempts} attempt(s): {last_error}")]
pub struct RetryExhausted<E: std::fmt::Display> {
    pub attempts: u32,
    pub last_error: E,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Policy that runs the operation exactly once.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt_index).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    /// Runs `op` with 1-based attempt numbers until it succeeds or attempts run out.
    pub async fn run<T, E, F, Fut>(&self, op: F) -> Result<T, RetryExhausted<E>>
    where
        E: std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run_while(op, |_| true).await
    }

    /// Like [`RetryPolicy::run`], but stops early when `should_retry` rejects an error.
    pub async fn run_while<T, E, F, Fut, P>(
        &self,
        mut op: F,
        should_retry: P,
    ) -> Result<T, RetryExhausted<E>>
    where
        E: std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if attempt >= max_attempts || !should_retry(&err) => {
                    return Err(RetryExhausted {
                        attempts: attempt,
                        last_error: err,
                    });
                }
                Err(_) => {
                    tokio::time::sleep(self.delay_for_attempt(attempt - 1)).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct CallbackClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for CallbackClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: Some(concat!("encerra/", env!("CARGO_PKG_VERSION")).to_string()),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl CallbackError {
    fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Request(err) => classify_reqwest_error(err),
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
        }
    }
}

/// Posts JSON notifications to the coordinator endpoint.
#[derive(Debug, Clone)]
pub struct CallbackClient {
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl CallbackClient {
    pub fn new(config: CallbackClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            retry: config.retry,
        })
    }

    pub async fn post_json<B>(&self, url: &str, body: &B) -> Result<u16, CallbackError>
    where
        B: Serialize + ?Sized,
    {
        let span = info_span!("completion_callback", url);
        let client = &self.client;
        self.retry
            .run_while(
                |attempt| async move {
                    let resp = client.post(url).json(body).send().await?;
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(status.as_u16());
                    }
                    warn!(attempt, status = status.as_u16(), "callback rejected");
                    Err(CallbackError::HttpStatus {
                        status: status.as_u16(),
                        url: resp.url().to_string(),
                    })
                },
                |err| err.disposition() == RetryDisposition::Retryable,
            )
            .instrument(span)
            .await
            .map_err(|exhausted| exhausted.last_error)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt row: {0}")]
    Decode(#[from] ValidationError),
}

/// Dashboard filter; `None` fields match everything.
#[derive(Debug, Clone, Default)]
pub struct ClientFilter {
    pub name: Option<String>,
    pub omission: Option<YesNo>,
    pub debt: Option<YesNo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientOverview {
    #[serde(flatten)]
    pub client: ClientRecord,
    pub status: JobStatus,
    pub progress: u8,
    pub last_update: Option<DateTime<Utc>>,
}

const UPSERT_CLIENT_SQL: &str = r#"
    INSERT INTO clients (tax_id, internal_id, name, omission_flag, debt_flag, updated_at)
    VALUES (?, ?, ?, ?, ?, ?)
    ON CONFLICT (tax_id) DO UPDATE
       SET internal_id = excluded.internal_id,
           name = excluded.name,
           omission_flag = excluded.omission_flag,
           debt_flag = excluded.debt_flag,
           updated_at = excluded.updated_at
     WHERE clients.internal_id IS NOT excluded.internal_id
        OR clients.name IS NOT excluded.name
        OR clients.omission_flag IS NOT excluded.omission_flag
        OR clients.debt_flag IS NOT excluded.debt_flag
"#;

/// Clients and per-client job status. Writes for one tax id are serialized and
/// each one runs in its own transaction.
#[derive(Debug, Clone)]
pub struct StatusStore {
    pool: SqlitePool,
    row_locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl StatusStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await?;
        let store = Self::from_pool(pool);
        store.migrate().await?;
        Ok(store)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            row_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Per tax id write lock. Entries nobody holds are pruned on the way in.
    async fn row_lock(&self, tax_id: &TaxId) -> Arc<Mutex<()>> {
        let mut map = self.row_locks.lock().await;
        map.retain(|_, lock| Arc::strong_count(lock) > 1);
        map.entry(tax_id.as_str().to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Insert-or-replace the whole batch in one transaction. Returns rows actually changed.
    pub async fn upsert_clients(&self, records: &[ClientRecord]) -> Result<u64, StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let mut changed = 0u64;
        for record in records {
            let result = sqlx::query(UPSERT_CLIENT_SQL)
                .bind(record.tax_id.as_str())
                .bind(&record.internal_id)
                .bind(&record.name)
                .bind(record.omission.as_str())
                .bind(record.debt.as_str())
                .bind(now)
                .execute(&mut *tx)
                .await?;
            changed += result.rows_affected();
        }
        tx.commit().await?;
        Ok(changed)
    }

    pub async fn get_client(&self, tax_id: &TaxId) -> Result<Option<ClientRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT tax_id, internal_id, name, omission_flag, debt_flag
              FROM clients
             WHERE tax_id = ?
            "#,
        )
        .bind(tax_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(client_from_row).transpose()
    }

    pub async fn list_clients(&self, filter: &ClientFilter) -> Result<Vec<ClientOverview>, StoreError> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            r#"
            SELECT c.tax_id, c.internal_id, c.name, c.omission_flag, c.debt_flag,
                   j.status, j.progress, j.last_update
              FROM clients c
              LEFT JOIN jobs j ON j.tax_id = c.tax_id
             WHERE 1 = 1
            "#,
        );
        if let Some(name) = &filter.name {
            qb.push(" AND c.name = ").push_bind(name.clone());
        }
        if let Some(omission) = filter.omission {
            qb.push(" AND c.omission_flag = ").push_bind(omission.as_str());
        }
        if let Some(debt) = filter.debt {
            qb.push(" AND c.debt_flag = ").push_bind(debt.as_str());
        }
        qb.push(" ORDER BY c.name, c.tax_id");

        let rows = qb.build().fetch_all(&self.pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let status: Option<String> = row.try_get("status")?;
            let progress: Option<i64> = row.try_get("progress")?;
            out.push(ClientOverview {
                client: client_from_row(&row)?,
                status: status
                    .as_deref()
                    .map(JobStatus::from_str)
                    .transpose()?
                    .unwrap_or(JobStatus::Pending),
                progress: clamp_progress(progress.unwrap_or(0)),
                last_update: row.try_get("last_update")?,
            });
        }
        Ok(out)
    }

    /// Resets the job row for a new run, overwriting any previous terminal state.
    pub async fn start_job(&self, tax_id: &TaxId, job_id: &str) -> Result<JobRecord, StoreError> {
        let lock = self.row_lock(tax_id).await;
        let _guard = lock.lock().await;
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO jobs (tax_id, job_id, status, progress, started_at, last_update)
            VALUES (?, ?, 'pending', 0, ?, ?)
            ON CONFLICT (tax_id) DO UPDATE
               SET job_id = excluded.job_id,
                   status = 'pending',
                   progress = 0,
                   started_at = excluded.started_at,
                   last_update = excluded.last_update
            "#,
        )
        .bind(tax_id.as_str())
        .bind(job_id)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(JobRecord {
            tax_id: tax_id.clone(),
            job_id: Some(job_id.to_string()),
            status: JobStatus::Pending,
            progress: 0,
            started_at: Some(now),
            last_update: Some(now),
        })
    }

    /// Sets status and progress. Progress never moves backwards within a job.
    pub async fn update_job(
        &self,
        tax_id: &TaxId,
        status: JobStatus,
        progress: u8,
    ) -> Result<JobRecord, StoreError> {
        let lock = self.row_lock(tax_id).await;
        let _guard = lock.lock().await;
        let now = Utc::now();
        let progress = progress.min(100);
        // One write statement; no read snapshot is open when the write lock is taken.
        let row = sqlx::query(
            r#"
            INSERT INTO jobs (tax_id, job_id, status, progress, started_at, last_update)
            VALUES (?, NULL, ?, ?, ?, ?)
            ON CONFLICT (tax_id) DO UPDATE
               SET status = excluded.status,
                   progress = MAX(jobs.progress, excluded.progress),
                   last_update = excluded.last_update
            RETURNING job_id, progress, started_at
            "#,
        )
        .bind(tax_id.as_str())
        .bind(status.as_str())
        .bind(i64::from(progress))
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        let stored: i64 = row.try_get("progress")?;
        Ok(JobRecord {
            tax_id: tax_id.clone(),
            job_id: row.try_get("job_id")?,
            status,
            progress: clamp_progress(stored),
            started_at: row.try_get("started_at")?,
            last_update: Some(now),
        })
    }

    /// Current job state; a known client without a job reads as pending.
    pub async fn job_status(&self, tax_id: &TaxId) -> Result<Option<JobRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT job_id, status, progress, started_at, last_update FROM jobs WHERE tax_id = ?",
        )
        .bind(tax_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            let status: String = row.try_get("status")?;
            let progress: i64 = row.try_get("progress")?;
            return Ok(Some(JobRecord {
                tax_id: tax_id.clone(),
                job_id: row.try_get("job_id")?,
                status: status.parse()?,
                progress: clamp_progress(progress),
                started_at: row.try_get("started_at")?,
                last_update: row.try_get("last_update")?,
            }));
        }

        Ok(self.get_client(tax_id).await?.map(|_| JobRecord {
            tax_id: tax_id.clone(),
            job_id: None,
            status: JobStatus::Pending,
            progress: 0,
            started_at: None,
            last_update: None,
        }))
    }
}

fn client_from_row(row: &SqliteRow) -> Result<ClientRecord, StoreError> {
    let tax_id: String = row.try_get("tax_id")?;
    let omission: String = row.try_get("omission_flag")?;
    let debt: String = row.try_get("debt_flag")?;
    Ok(ClientRecord {
        internal_id: row.try_get("internal_id")?,
        tax_id: TaxId::parse(&tax_id)?,
        name: row.try_get("name")?,
        omission: omission.parse()?,
        debt: debt.parse()?,
    })
}

fn clamp_progress(value: i64) -> u8 {
    value.clamp(0, 100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::tempdir;

    fn client(tax_id: &str, name: &str, omission: YesNo) -> ClientRecord {
        ClientRecord {
            internal_id: format!("IM-{}", &tax_id[..4]),
            tax_id: TaxId::parse(tax_id).unwrap(),
            name: name.to_string(),
            omission,
            debt: YesNo::No,
        }
    }

    async fn temp_store() -> (tempfile::TempDir, StatusStore) {
        let dir = tempdir().expect("tempdir");
        let store = StatusStore::open(dir.path().join("encerra.db"))
            .await
            .expect("open store");
        (dir, store)
    }

    #[test]
    fn artifact_hashing_is_stable() {
        let hash = ArtifactStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn atomic_writes_deduplicate_by_hash_path() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        let captured_at = DateTime::parse_from_rfc3339("2025-04-02T12:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        let first = store
            .store_bytes(captured_at, "captcha", "png", b"\x89PNG same")
            .await
            .expect("first store");
        let second = store
            .store_bytes(captured_at, "captcha", "png", b"\x89PNG same")
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.relative_path.starts_with("20250402/captcha"));
        assert!(first.absolute_path.exists());
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100), Duration::from_millis(350));

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn retry_stops_at_first_success() {
        let policy = RetryPolicy::new(5, Duration::ZERO, Duration::ZERO);
        let calls = AtomicU32::new(0);
        let calls_ref = &calls;
        let value = policy
            .run(|attempt| async move {
                calls_ref.fetch_add(1, Ordering::SeqCst);
                if attempt < 3 {
                    Err(format!("attempt {attempt} failed"))
                } else {
                    Ok(attempt * 10)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 30);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_exhaustion_reports_attempts_and_last_error() {
        let policy = RetryPolicy::new(4, Duration::ZERO, Duration::ZERO);
        let err = policy
            .run(|attempt| async move { Err::<(), _>(format!("boom {attempt}")) })
            .await
            .unwrap_err();
        assert_eq!(err.attempts, 4);
        assert_eq!(err.last_error, "boom 4");
    }

    #[tokio::test]
    async fn non_retryable_errors_stop_immediately() {
        let policy = RetryPolicy::new(10, Duration::ZERO, Duration::ZERO);
        let err = policy
            .run_while(
                |attempt| async move { Err::<(), _>(format!("fatal {attempt}")) },
                |_| false,
            )
            .await
            .unwrap_err();
        assert_eq!(err.attempts, 1);
    }

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(classify_status(StatusCode::BAD_REQUEST), RetryDisposition::NonRetryable);
    }

    #[tokio::test]
    async fn identical_roster_upsert_is_a_noop() {
        let (_dir, store) = temp_store().await;
        let roster = vec![
            client("35496100000135", "Exatta Contabilidade", YesNo::Yes),
            client("11111111000192", "Outra Empresa", YesNo::No),
        ];

        assert_eq!(store.upsert_clients(&roster).await.unwrap(), 2);
        let before = store.list_clients(&ClientFilter::default()).await.unwrap();

        assert_eq!(store.upsert_clients(&roster).await.unwrap(), 0);
        let after = store.list_clients(&ClientFilter::default()).await.unwrap();

        assert_eq!(before.len(), 2);
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn roster_upsert_is_last_write_wins() {
        let (_dir, store) = temp_store().await;
        store
            .upsert_clients(&[client("35496100000135", "Old Name", YesNo::No)])
            .await
            .unwrap();
        let changed = store
            .upsert_clients(&[client("35496100000135", "New Name", YesNo::Yes)])
            .await
            .unwrap();
        assert_eq!(changed, 1);

        let tax_id = TaxId::parse("35496100000135").unwrap();
        let stored = store.get_client(&tax_id).await.unwrap().unwrap();
        assert_eq!(stored.name, "New Name");
        assert_eq!(stored.omission, YesNo::Yes);
    }

    #[tokio::test]
    async fn client_filter_matches_flags_and_name() {
        let (_dir, store) = temp_store().await;
        store
            .upsert_clients(&[
                client("35496100000135", "Alpha", YesNo::Yes),
                client("11111111000192", "Beta", YesNo::No),
            ])
            .await
            .unwrap();

        let omitted = store
            .list_clients(&ClientFilter {
                omission: Some(YesNo::Yes),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(omitted.len(), 1);
        assert_eq!(omitted[0].client.name, "Alpha");
        assert_eq!(omitted[0].status, JobStatus::Pending);

        let by_name = store
            .list_clients(&ClientFilter {
                name: Some("Beta".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_name.len(), 1);
    }

    #[tokio::test]
    async fn job_progress_never_moves_backwards() {
        let (_dir, store) = temp_store().await;
        let tax_id = TaxId::parse("35496100000135").unwrap();
        store.start_job(&tax_id, "job-1").await.unwrap();

        store.update_job(&tax_id, JobStatus::InProgress, 40).await.unwrap();
        let record = store.update_job(&tax_id, JobStatus::InProgress, 10).await.unwrap();
        assert_eq!(record.progress, 40);

        let done = store.update_job(&tax_id, JobStatus::Completed, 100).await.unwrap();
        assert_eq!(done.progress, 100);
        assert_eq!(done.job_id.as_deref(), Some("job-1"));

        let restarted = store.start_job(&tax_id, "job-2").await.unwrap();
        assert_eq!(restarted.progress, 0);
        let read = store.job_status(&tax_id).await.unwrap().unwrap();
        assert_eq!(read.status, JobStatus::Pending);
        assert_eq!(read.progress, 0);
        assert_eq!(read.job_id.as_deref(), Some("job-2"));
    }

    #[tokio::test]
    async fn job_status_distinguishes_unknown_and_idle_clients() {
        let (_dir, store) = temp_store().await;
        let known = TaxId::parse("35496100000135").unwrap();
        let unknown = TaxId::parse("99999999000199").unwrap();
        store
            .upsert_clients(&[client("35496100000135", "Alpha", YesNo::No)])
            .await
            .unwrap();

        let idle = store.job_status(&known).await.unwrap().unwrap();
        assert_eq!(idle.status, JobStatus::Pending);
        assert!(idle.last_update.is_none());
        assert!(store.job_status(&unknown).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn updates_without_a_started_job_create_the_row() {
        let (_dir, store) = temp_store().await;
        let tax_id = TaxId::parse("35496100000135").unwrap();
        let record = store.update_job(&tax_id, JobStatus::Completed, 100).await.unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert!(store.job_status(&tax_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn concurrent_updates_for_one_tax_id_keep_the_maximum() {
        let (_dir, store) = temp_store().await;
        let tax_id = TaxId::parse("35496100000135").unwrap();
        store.start_job(&tax_id, "job-1").await.unwrap();

        let mut handles = Vec::new();
        for progress in [5u8, 60, 20, 90, 45] {
            let store = store.clone();
            let tax_id = tax_id.clone();
            handles.push(tokio::spawn(async move {
                store.update_job(&tax_id, JobStatus::InProgress, progress).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let record = store.job_status(&tax_id).await.unwrap().unwrap();
        assert_eq!(record.progress, 90);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn parallel_jobs_on_distinct_tax_ids_lose_no_writes() {
        let (_dir, store) = temp_store().await;
        let tax_ids = [
            "35496100000135",
            "11111111000192",
            "22222222000122",
            "33333333000133",
            "44444444000144",
        ];

        let mut handles = Vec::new();
        for raw in tax_ids {
            let store = store.clone();
            let tax_id = TaxId::parse(raw).unwrap();
            handles.push(tokio::spawn(async move {
                store.start_job(&tax_id, raw).await?;
                for progress in 0..=100u8 {
                    store.update_job(&tax_id, JobStatus::InProgress, progress).await?;
                }
                store.update_job(&tax_id, JobStatus::Completed, 100).await
            }));
        }
        for handle in handles {
            let record = handle.await.unwrap().expect("no write may fail");
            assert_eq!((record.status, record.progress), (JobStatus::Completed, 100));
        }

        for raw in tax_ids {
            let record = store
                .job_status(&TaxId::parse(raw).unwrap())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(record.status, JobStatus::Completed);
            assert_eq!(record.progress, 100);
            assert_eq!(record.job_id.as_deref(), Some(raw));
        }
    }

    #[tokio::test]
    async fn idle_row_locks_are_pruned() {
        let (_dir, store) = temp_store().await;
        for raw in ["35496100000135", "11111111000192", "22222222000122"] {
            let tax_id = TaxId::parse(raw).unwrap();
            store.update_job(&tax_id, JobStatus::Pending, 0).await.unwrap();
        }
        assert_eq!(store.row_locks.lock().await.len(), 1);
    }

    async fn callback_server(statuses: Vec<u16>) -> (String, Arc<AtomicU32>) {
        use axum::{extract::State, http::StatusCode as AxumStatus, routing::post, Router};

        let hits = Arc::new(AtomicU32::new(0));
        let statuses = Arc::new(statuses);
        let app = Router::new()
            .route(
                "/encerramento_concluido",
                post(
                    |State((hits, statuses)): State<(Arc<AtomicU32>, Arc<Vec<u16>>)>| async move {
                        let n = hits.fetch_add(1, Ordering::SeqCst) as usize;
                        let code = statuses.get(n).or(statuses.last()).copied().unwrap_or(200);
                        AxumStatus::from_u16(code).unwrap()
                    },
                ),
            )
            .with_state((hits.clone(), statuses));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/encerramento_concluido"), hits)
    }

    fn quick_callback_client(attempts: u32) -> CallbackClient {
        CallbackClient::new(CallbackClientConfig {
            retry: RetryPolicy::new(attempts, Duration::ZERO, Duration::ZERO),
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn callback_retries_server_errors_until_accepted() {
        let (url, hits) = callback_server(vec![503, 200]).await;
        let client = quick_callback_client(3);

        let code = client
            .post_json(&url, &serde_json::json!({"tax_id": "35496100000135"}))
            .await
            .unwrap();
        assert_eq!(code, 200);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn callback_gives_up_at_once_on_client_errors() {
        let (url, hits) = callback_server(vec![400]).await;
        let client = quick_callback_client(3);

        let err = client
            .post_json(&url, &serde_json::json!({"tax_id": "35496100000135"}))
            .await
            .unwrap_err();
        assert!(matches!(err, CallbackError::HttpStatus { status: 400, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
