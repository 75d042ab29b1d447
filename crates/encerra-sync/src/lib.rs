//! Job orchestration: configuration, status notification, the per-client
//! closing run and the bounded job coordinator.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use encerra_adapters::{
    Authenticator, CaptchaResolver, Credentials, OcrEngine, PeriodCloser, PortalDriver,
    PortalError, PortalProfile, ProgressSink, RosterExtractor, TesseractCli, WebDriverPortal,
    CAPTCHA_MAX_ATTEMPTS,
};
use encerra_core::{BatchSummary, JobRequest, JobStatus, Period, TaxId};
use encerra_storage::{
    ArtifactStore, CallbackClient, CallbackClientConfig, RetryPolicy, StatusStore, StoreError,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, oneshot, Semaphore};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const DEFAULT_WORKERS: usize = 5;
pub const DEFAULT_PERIOD_ATTEMPTS: u32 = 2;
const EVENT_BUFFER: usize = 256;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{var} must be an http(s) url, got {value:?}")]
    InvalidUrl { var: &'static str, value: String },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

#[derive(Clone)]
pub struct AppConfig {
    pub portal_url: Option<String>,
    pub crc: String,
    pub password: String,
    pub webdriver_url: String,
    pub headless: bool,
    pub db_path: PathBuf,
    pub artifacts_dir: PathBuf,
    pub listen_addr: String,
    pub workers: usize,
    pub callback_url: Option<String>,
    pub profile_path: Option<PathBuf>,
    pub captcha_attempts: u32,
    pub period_attempts: u32,
    pub screenshot_on_failure: bool,
    pub tesseract_bin: PathBuf,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("portal_url", &self.portal_url)
            .field("crc", &self.crc)
            .field("password", &"***")
            .field("webdriver_url", &self.webdriver_url)
            .field("headless", &self.headless)
            .field("db_path", &self.db_path)
            .field("artifacts_dir", &self.artifacts_dir)
            .field("listen_addr", &self.listen_addr)
            .field("workers", &self.workers)
            .field("callback_url", &self.callback_url)
            .field("profile_path", &self.profile_path)
            .field("captcha_attempts", &self.captcha_attempts)
            .field("period_attempts", &self.period_attempts)
            .field("screenshot_on_failure", &self.screenshot_on_failure)
            .field("tesseract_bin", &self.tesseract_bin)
            .finish()
    }
}

fn flag(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "TRUE" | "True" | "yes")
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            portal_url: non_empty("ENCERRA_PORTAL_URL"),
            crc: lookup("ENCERRA_CRC").unwrap_or_default(),
            password: lookup("ENCERRA_PASSWORD").unwrap_or_default(),
            webdriver_url: non_empty("ENCERRA_WEBDRIVER_URL")
                .unwrap_or_else(|| "http://localhost:4444".to_string()),
            headless: lookup("ENCERRA_HEADLESS").map(|v| flag(&v)).unwrap_or(true),
            db_path: non_empty("ENCERRA_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./encerra.db")),
            artifacts_dir: non_empty("ENCERRA_ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./artifacts")),
            listen_addr: non_empty("ENCERRA_LISTEN_ADDR")
                .unwrap_or_else(|| "127.0.0.1:5000".to_string()),
            workers: lookup("ENCERRA_WORKERS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(DEFAULT_WORKERS),
            callback_url: non_empty("ENCERRA_CALLBACK_URL"),
            profile_path: non_empty("ENCERRA_PROFILE_PATH").map(PathBuf::from),
            captcha_attempts: lookup("ENCERRA_CAPTCHA_ATTEMPTS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(CAPTCHA_MAX_ATTEMPTS),
            period_attempts: lookup("ENCERRA_PERIOD_ATTEMPTS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(DEFAULT_PERIOD_ATTEMPTS),
            screenshot_on_failure: lookup("ENCERRA_SCREENSHOT_ON_FAILURE")
                .map(|v| flag(&v))
                .unwrap_or(true),
            tesseract_bin: non_empty("ENCERRA_TESSERACT_BIN")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("tesseract")),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.crc.trim().is_empty() {
            return Err(ConfigError::Missing("ENCERRA_CRC"));
        }
        if self.password.is_empty() {
            return Err(ConfigError::Missing("ENCERRA_PASSWORD"));
        }
        if self.workers == 0 {
            return Err(ConfigError::Zero("ENCERRA_WORKERS"));
        }
        if self.captcha_attempts == 0 {
            return Err(ConfigError::Zero("ENCERRA_CAPTCHA_ATTEMPTS"));
        }
        if self.period_attempts == 0 {
            return Err(ConfigError::Zero("ENCERRA_PERIOD_ATTEMPTS"));
        }
        check_url("ENCERRA_WEBDRIVER_URL", &self.webdriver_url)?;
        if let Some(url) = &self.portal_url {
            check_url("ENCERRA_PORTAL_URL", url)?;
        }
        if let Some(url) = &self.callback_url {
            check_url("ENCERRA_CALLBACK_URL", url)?;
        }
        Ok(())
    }

    /// Built-in profile, or the YAML override, with the portal url applied last.
    pub fn load_profile(&self) -> Result<PortalProfile, PortalError> {
        let mut profile = match &self.profile_path {
            Some(path) => PortalProfile::from_yaml_file(path)?,
            None => PortalProfile::default(),
        };
        if let Some(url) = &self.portal_url {
            profile.login_url = url.clone();
        }
        Ok(profile)
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            crc: self.crc.clone(),
            password: self.password.clone(),
        }
    }
}

fn check_url(var: &'static str, value: &str) -> Result<(), ConfigError> {
    let rest = value
        .strip_prefix("http://")
        .or_else(|| value.strip_prefix("https://"));
    match rest {
        Some(host) if !host.is_empty() => Ok(()),
        _ => Err(ConfigError::InvalidUrl {
            var,
            value: value.to_string(),
        }),
    }
}

/// Pushed to WebSocket listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusEvent {
    StatusUpdate {
        tax_id: TaxId,
        status: JobStatus,
        progress: u8,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        period: Option<String>,
    },
    JobCompleted {
        tax_id: TaxId,
        job_id: Option<String>,
        summary: Option<BatchSummary>,
    },
    JobFailed {
        tax_id: TaxId,
        job_id: Option<String>,
        error: String,
    },
}

/// Body of the completion callback sent to the coordinator endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionNotice {
    pub tax_id: TaxId,
    pub status: JobStatus,
    pub progress: u8,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StatusNotifier {
    events: broadcast::Sender<StatusEvent>,
    callback: Option<(CallbackClient, String)>,
}

impl Default for StatusNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusNotifier {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            events,
            callback: None,
        }
    }

    pub fn with_callback(mut self, client: CallbackClient, url: impl Into<String>) -> Self {
        self.callback = Some((client, url.into()));
        self
    }

    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let notifier = Self::new();
        match &config.callback_url {
            Some(url) => {
                let client = CallbackClient::new(CallbackClientConfig::default())
                    .context("building completion callback client")?;
                Ok(notifier.with_callback(client, url.clone()))
            }
            None => Ok(notifier),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    /// Fire and forget; having no listeners is not an error.
    pub fn publish(&self, event: StatusEvent) {
        let _ = self.events.send(event);
    }

    pub async fn job_completed(&self, tax_id: &TaxId, job_id: Option<String>, summary: BatchSummary) {
        self.publish(StatusEvent::JobCompleted {
            tax_id: tax_id.clone(),
            job_id,
            summary: Some(summary),
        });
        self.post_completion(tax_id, JobStatus::Completed, 100).await;
    }

    pub async fn job_failed(&self, tax_id: &TaxId, job_id: Option<String>, error: String, progress: u8) {
        self.publish(StatusEvent::JobFailed {
            tax_id: tax_id.clone(),
            job_id,
            error,
        });
        self.post_completion(tax_id, JobStatus::Error, progress).await;
    }

    async fn post_completion(&self, tax_id: &TaxId, status: JobStatus, progress: u8) {
        let Some((client, url)) = &self.callback else {
            return;
        };
        let notice = CompletionNotice {
            tax_id: tax_id.clone(),
            status,
            progress,
            timestamp: Utc::now(),
        };
        match client.post_json(url, &notice).await {
            Ok(code) => info!(tax_id = %tax_id, code, "completion callback delivered"),
            Err(err) => warn!(tax_id = %tax_id, error = %err, "completion callback failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStage {
    Session,
    Login,
    Roster,
    OpenClient,
    MovementMenu,
}

impl fmt::Display for JobStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Session => "browser session",
            Self::Login => "login",
            Self::Roster => "roster extraction",
            Self::OpenClient => "open client",
            Self::MovementMenu => "movement menu",
        })
    }
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("a closing job for {0} is already running")]
    AlreadyRunning(TaxId),
    #[error("{stage} failed: {source}")]
    Stage {
        stage: JobStage,
        #[source]
        source: PortalError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("worker stopped before reporting a result")]
    WorkerLost,
}

/// Opens one isolated browser session per job.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self) -> Result<Box<dyn PortalDriver>, PortalError>;
}

#[derive(Debug, Clone)]
pub struct WebDriverSessions {
    webdriver_url: String,
    headless: bool,
    profile: PortalProfile,
}

impl WebDriverSessions {
    pub fn new(webdriver_url: impl Into<String>, headless: bool, profile: PortalProfile) -> Self {
        Self {
            webdriver_url: webdriver_url.into(),
            headless,
            profile,
        }
    }

    pub fn from_config(config: &AppConfig, profile: PortalProfile) -> Self {
        Self::new(config.webdriver_url.clone(), config.headless, profile)
    }
}

#[async_trait]
impl SessionFactory for WebDriverSessions {
    async fn open(&self) -> Result<Box<dyn PortalDriver>, PortalError> {
        let portal =
            WebDriverPortal::connect(&self.webdriver_url, self.headless, self.profile.clone())
                .await?;
        Ok(Box::new(portal))
    }
}

/// Runs one client's closing job end to end against an open session.
#[derive(Debug, Clone)]
pub struct ClosingOrchestrator {
    store: StatusStore,
    notifier: StatusNotifier,
    authenticator: Authenticator,
    roster: RosterExtractor,
    period_retry: RetryPolicy,
    artifacts: Option<ArtifactStore>,
}

impl ClosingOrchestrator {
    pub fn new(
        store: StatusStore,
        notifier: StatusNotifier,
        authenticator: Authenticator,
        roster: RosterExtractor,
    ) -> Self {
        Self {
            store,
            notifier,
            authenticator,
            roster,
            period_retry: RetryPolicy::new(
                DEFAULT_PERIOD_ATTEMPTS,
                Duration::from_millis(500),
                Duration::from_secs(5),
            ),
            artifacts: None,
        }
    }

    pub fn from_config(
        config: &AppConfig,
        profile: &PortalProfile,
        store: StatusStore,
        notifier: StatusNotifier,
    ) -> Self {
        let artifacts = ArtifactStore::new(config.artifacts_dir.clone());
        let ocr: Arc<dyn OcrEngine> = Arc::new(TesseractCli::new(config.tesseract_bin.clone()));
        let captcha = CaptchaResolver::new(
            ocr,
            RetryPolicy::new(
                config.captcha_attempts,
                Duration::from_millis(200),
                Duration::from_secs(1),
            ),
        )
        .with_artifacts(artifacts.clone());
        let orchestrator = Self::new(
            store,
            notifier,
            Authenticator::new(config.credentials(), captcha),
            RosterExtractor::new(profile),
        )
        .with_period_retry(RetryPolicy::new(
            config.period_attempts,
            Duration::from_millis(500),
            Duration::from_secs(5),
        ));
        if config.screenshot_on_failure {
            orchestrator.with_artifacts(artifacts)
        } else {
            orchestrator
        }
    }

    pub fn with_period_retry(mut self, retry: RetryPolicy) -> Self {
        self.period_retry = retry;
        self
    }

    /// Enables failure screenshots.
    pub fn with_artifacts(mut self, artifacts: ArtifactStore) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    pub fn store(&self) -> &StatusStore {
        &self.store
    }

    pub fn notifier(&self) -> &StatusNotifier {
        &self.notifier
    }

    async fn set_status(&self, tax_id: &TaxId, status: JobStatus, progress: u8, period: Option<Period>) -> u8 {
        let progress = match self.store.update_job(tax_id, status, progress).await {
            Ok(record) => record.progress,
            Err(err) => {
                warn!(tax_id = %tax_id, status = %status, error = %err, "status update not persisted");
                progress
            }
        };
        self.notifier.publish(StatusEvent::StatusUpdate {
            tax_id: tax_id.clone(),
            status,
            progress,
            period: period.map(|p| p.to_string()),
        });
        progress
    }

    /// Opens a session, runs the job and always closes the session.
    pub async fn execute(
        &self,
        sessions: &dyn SessionFactory,
        request: &JobRequest,
    ) -> Result<BatchSummary, CoordinatorError> {
        let driver = match sessions.open().await {
            Ok(driver) => driver,
            Err(err) => return Err(self.abort(request, JobStage::Session, err, None).await),
        };
        let result = self.run(driver.as_ref(), request).await;
        if let Err(err) = driver.shutdown().await {
            warn!(tax_id = %request.tax_id, error = %err, "browser session did not close cleanly");
        }
        result
    }

    pub async fn run(
        &self,
        driver: &dyn PortalDriver,
        request: &JobRequest,
    ) -> Result<BatchSummary, CoordinatorError> {
        let span = info_span!(
            "closing_job",
            job_id = %request.job_id,
            tax_id = %request.tax_id,
            start = %request.range.start,
            end = %request.range.end
        );
        self.run_stages(driver, request).instrument(span).await
    }

    async fn run_stages(
        &self,
        driver: &dyn PortalDriver,
        request: &JobRequest,
    ) -> Result<BatchSummary, CoordinatorError> {
        let tax_id = &request.tax_id;
        self.set_status(tax_id, JobStatus::Starting, 0, None).await;

        self.set_status(tax_id, JobStatus::LoggingIn, 0, None).await;
        if let Err(err) = self.authenticator.login(driver).await {
            return Err(self.abort(request, JobStage::Login, err, Some(driver)).await);
        }

        self.set_status(tax_id, JobStatus::Extracting, 0, None).await;
        let clients = match self.roster.extract(driver).await {
            Ok(clients) => clients,
            Err(err) => return Err(self.abort(request, JobStage::Roster, err, Some(driver)).await),
        };
        match self.store.upsert_clients(&clients).await {
            Ok(changed) => info!(clients = clients.len(), changed, "roster persisted"),
            Err(err) => warn!(error = %err, "roster not persisted"),
        }

        if let Err(err) = driver.open_client(tax_id).await {
            return Err(self.abort(request, JobStage::OpenClient, err, Some(driver)).await);
        }

        self.set_status(tax_id, JobStatus::InProgress, 0, None).await;
        let mut closer = PeriodCloser::new(request.ledger, self.period_retry);
        if let Some(artifacts) = &self.artifacts {
            closer = closer.with_failure_screenshots(artifacts.clone());
        }
        let periods = request.range.periods();
        let sink = JobProgress {
            orchestrator: self,
            tax_id,
        };
        let summary = match closer.run_batch(driver, &periods, &sink).await {
            Ok(summary) => summary,
            Err(err) => {
                return Err(self
                    .abort(request, JobStage::MovementMenu, err, Some(driver))
                    .await)
            }
        };

        self.set_status(tax_id, JobStatus::Completed, 100, None).await;
        self.notifier
            .job_completed(tax_id, Some(request.job_id.to_string()), summary)
            .await;
        info!(
            closed = summary.closed,
            already_closed = summary.already_closed,
            failed = summary.failed,
            "closing job completed"
        );
        Ok(summary)
    }

    /// Marks the job as failed; progress already reached is kept.
    async fn abort(
        &self,
        request: &JobRequest,
        stage: JobStage,
        source: PortalError,
        driver: Option<&dyn PortalDriver>,
    ) -> CoordinatorError {
        error!(tax_id = %request.tax_id, %stage, error = %source, "closing job failed");
        if let (Some(driver), Some(artifacts)) = (driver, &self.artifacts) {
            match driver.screenshot().await {
                Ok(png) => {
                    if let Err(err) = artifacts.store_bytes(Utc::now(), "job-failure", "png", &png).await {
                        warn!(error = %err, "failure screenshot not stored");
                    }
                }
                Err(err) => warn!(error = %err, "failure screenshot unavailable"),
            }
        }
        let progress = self
            .set_status(&request.tax_id, JobStatus::Error, 0, None)
            .await;
        let err = CoordinatorError::Stage { stage, source };
        self.notifier
            .job_failed(
                &request.tax_id,
                Some(request.job_id.to_string()),
                err.to_string(),
                progress,
            )
            .await;
        err
    }
}

struct JobProgress<'a> {
    orchestrator: &'a ClosingOrchestrator,
    tax_id: &'a TaxId,
}

#[async_trait]
impl<'a> ProgressSink for JobProgress<'a> {
    async fn period_started(&self, period: Period, index: usize, total: usize, percent: u8) {
        info!(period = %period, index, total, percent, "closing period");
        self.orchestrator
            .set_status(self.tax_id, JobStatus::InProgress, percent, Some(period))
            .await;
    }
}

/// Result channel for one submitted job.
#[derive(Debug)]
pub struct JobHandle {
    pub job_id: Uuid,
    pub tax_id: TaxId,
    result: oneshot::Receiver<Result<BatchSummary, CoordinatorError>>,
}

impl JobHandle {
    pub async fn wait(self) -> Result<BatchSummary, CoordinatorError> {
        self.result.await.unwrap_or(Err(CoordinatorError::WorkerLost))
    }
}

/// Admits jobs into a bounded worker pool, one live job per tax id.
#[derive(Clone)]
pub struct JobCoordinator {
    orchestrator: Arc<ClosingOrchestrator>,
    sessions: Arc<dyn SessionFactory>,
    permits: Arc<Semaphore>,
    live: Arc<Mutex<HashSet<TaxId>>>,
}

impl fmt::Debug for JobCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobCoordinator")
            .field("available_workers", &self.permits.available_permits())
            .finish_non_exhaustive()
    }
}

struct LiveGuard {
    live: Arc<Mutex<HashSet<TaxId>>>,
    tax_id: TaxId,
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        let mut live = match self.live.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        live.remove(&self.tax_id);
    }
}

impl JobCoordinator {
    pub fn new(
        orchestrator: ClosingOrchestrator,
        sessions: Arc<dyn SessionFactory>,
        workers: usize,
    ) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
            sessions,
            permits: Arc::new(Semaphore::new(workers.max(1))),
            live: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn store(&self) -> &StatusStore {
        self.orchestrator.store()
    }

    pub fn notifier(&self) -> &StatusNotifier {
        self.orchestrator.notifier()
    }

    pub fn is_live(&self, tax_id: &TaxId) -> bool {
        match self.live.lock() {
            Ok(live) => live.contains(tax_id),
            Err(poisoned) => poisoned.into_inner().contains(tax_id),
        }
    }

    fn claim(&self, tax_id: &TaxId) -> Option<LiveGuard> {
        let mut live = match self.live.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !live.insert(tax_id.clone()) {
            return None;
        }
        Some(LiveGuard {
            live: Arc::clone(&self.live),
            tax_id: tax_id.clone(),
        })
    }

    /// Records the job as pending and queues it; the job waits for a free worker.
    pub async fn submit(&self, request: JobRequest) -> Result<JobHandle, CoordinatorError> {
        let guard = self
            .claim(&request.tax_id)
            .ok_or_else(|| CoordinatorError::AlreadyRunning(request.tax_id.clone()))?;

        let record = self
            .store()
            .start_job(&request.tax_id, &request.job_id.to_string())
            .await?;
        self.notifier().publish(StatusEvent::StatusUpdate {
            tax_id: record.tax_id.clone(),
            status: record.status,
            progress: record.progress,
            period: None,
        });

        let (tx, rx) = oneshot::channel();
        let handle = JobHandle {
            job_id: request.job_id,
            tax_id: request.tax_id.clone(),
            result: rx,
        };

        let orchestrator = Arc::clone(&self.orchestrator);
        let sessions = Arc::clone(&self.sessions);
        let permits = Arc::clone(&self.permits);
        tokio::spawn(async move {
            let result = match permits.acquire_owned().await {
                Ok(_permit) => orchestrator.execute(sessions.as_ref(), &request).await,
                Err(_) => Err(CoordinatorError::WorkerLost),
            };
            drop(guard);
            let _ = tx.send(result);
        });

        info!(job_id = %handle.job_id, tax_id = %handle.tax_id, "closing job queued");
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use encerra_adapters::testing::{ScriptedOcr, ScriptedPortal};
    use encerra_adapters::ClosingStep;
    use encerra_core::{LedgerKind, PeriodRange};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    const TAX_ID: &str = "35496100000135";

    fn roster_html() -> String {
        std::fs::read_to_string(
            PathBuf::from(env!("CARGO_MANIFEST_DIR"))
                .join("../../fixtures/portal/carteira_clientes.html"),
        )
        .unwrap()
    }

    fn p(month: u32, year: u32) -> Period {
        Period::new(month, year).unwrap()
    }

    fn portal() -> ScriptedPortal {
        ScriptedPortal::new()
            .with_captcha_answer("AB12")
            .with_roster_html(&roster_html())
    }

    fn request(start: &str, end: &str) -> JobRequest {
        JobRequest::new(
            TaxId::parse(TAX_ID).unwrap(),
            PeriodRange::parse(start, end).unwrap(),
            LedgerKind::ServicesTaken,
        )
    }

    async fn orchestrator(answers: &[&str]) -> (TempDir, ClosingOrchestrator) {
        orchestrator_with(answers, StatusNotifier::new()).await
    }

    async fn orchestrator_with(
        answers: &[&str],
        notifier: StatusNotifier,
    ) -> (TempDir, ClosingOrchestrator) {
        let dir = tempfile::tempdir().unwrap();
        let store = StatusStore::open(dir.path().join("encerra.db")).await.unwrap();
        let quick = RetryPolicy::new(CAPTCHA_MAX_ATTEMPTS, Duration::ZERO, Duration::ZERO);
        let captcha = CaptchaResolver::new(Arc::new(ScriptedOcr::new(answers.iter().copied())), quick);
        let auth = Authenticator::new(
            Credentials {
                crc: "012452".into(),
                password: "secret".into(),
            },
            captcha,
        );
        let orchestrator = ClosingOrchestrator::new(
            store,
            notifier,
            auth,
            RosterExtractor::new(&PortalProfile::default()),
        )
        .with_period_retry(RetryPolicy::new(2, Duration::ZERO, Duration::ZERO));
        (dir, orchestrator)
    }

    fn drain(rx: &mut broadcast::Receiver<StatusEvent>) -> Vec<StatusEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn config_defaults_apply_when_unset() {
        let config = AppConfig::from_lookup(lookup(&[
            ("ENCERRA_CRC", "012452"),
            ("ENCERRA_PASSWORD", "secret"),
        ]));
        assert_eq!(config.workers, 5);
        assert_eq!(config.captcha_attempts, 10);
        assert_eq!(config.period_attempts, 2);
        assert!(config.headless);
        assert_eq!(config.listen_addr, "127.0.0.1:5000");
        assert!(config.validate().is_ok());
        assert!(!format!("{config:?}").contains("secret"));
    }

    #[test]
    fn config_validation_rejects_bad_values() {
        let missing = AppConfig::from_lookup(lookup(&[("ENCERRA_PASSWORD", "x")]));
        assert_eq!(missing.validate(), Err(ConfigError::Missing("ENCERRA_CRC")));

        let zero = AppConfig::from_lookup(lookup(&[
            ("ENCERRA_CRC", "1"),
            ("ENCERRA_PASSWORD", "x"),
            ("ENCERRA_WORKERS", "0"),
        ]));
        assert_eq!(zero.validate(), Err(ConfigError::Zero("ENCERRA_WORKERS")));

        let bad_url = AppConfig::from_lookup(lookup(&[
            ("ENCERRA_CRC", "1"),
            ("ENCERRA_PASSWORD", "x"),
            ("ENCERRA_CALLBACK_URL", "localhost:5000/encerramento_concluido"),
        ]));
        assert!(matches!(
            bad_url.validate(),
            Err(ConfigError::InvalidUrl {
                var: "ENCERRA_CALLBACK_URL",
                ..
            })
        ));
    }

    #[test]
    fn portal_url_overrides_profile() {
        let config = AppConfig::from_lookup(lookup(&[(
            "ENCERRA_PORTAL_URL",
            "https://homolog.sigiss.test/index.php",
        )]));
        let profile = config.load_profile().unwrap();
        assert_eq!(profile.login_url, "https://homolog.sigiss.test/index.php");
    }

    #[test]
    fn status_events_serialize_with_type_tag() {
        let event = StatusEvent::StatusUpdate {
            tax_id: TaxId::parse(TAX_ID).unwrap(),
            status: JobStatus::InProgress,
            progress: 42,
            period: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "status_update");
        assert_eq!(json["status"], "in_progress");
        assert_eq!(json["progress"], 42);
    }

    #[tokio::test]
    async fn full_run_completes_despite_a_failing_period() {
        let (_dir, orchestrator) = orchestrator(&["AB12"]).await;
        let mut rx = orchestrator.notifier().subscribe();
        let portal = portal()
            .with_closed(p(12, 2023))
            .fail_step(p(1, 2024), ClosingStep::InitiateClosing, 5);
        let request = request("11/2023", "02/2024");

        let summary = orchestrator.run(&portal, &request).await.unwrap();
        assert_eq!(summary.total, 4);
        assert_eq!(summary.closed, 2);
        assert_eq!(summary.already_closed, 1);
        assert_eq!(summary.failed, 1);

        let record = orchestrator
            .store()
            .job_status(&request.tax_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.progress, 100);

        let roster = orchestrator
            .store()
            .list_clients(&Default::default())
            .await
            .unwrap();
        assert_eq!(roster.len(), 3);
        assert_eq!(portal.opened_client(), Some(request.tax_id.clone()));

        let events = drain(&mut rx);
        let statuses: Vec<(JobStatus, u8)> = events
            .iter()
            .filter_map(|e| match e {
                StatusEvent::StatusUpdate { status, progress, .. } => Some((*status, *progress)),
                _ => None,
            })
            .collect();
        assert_eq!(statuses.first(), Some(&(JobStatus::Starting, 0)));
        assert!(statuses.windows(2).all(|w| w[0].1 <= w[1].1));
        assert!(statuses
            .iter()
            .all(|(status, progress)| *progress < 100 || *status == JobStatus::Completed));
        let in_progress: Vec<u8> = statuses
            .iter()
            .filter(|(s, _)| *s == JobStatus::InProgress)
            .map(|(_, pct)| *pct)
            .collect();
        assert_eq!(in_progress, vec![0, 0, 25, 50, 75]);
        assert!(matches!(events.last(), Some(StatusEvent::JobCompleted { .. })));
    }

    #[tokio::test]
    async fn login_failure_marks_job_error() {
        let (_dir, orchestrator) = orchestrator(&["????"]).await;
        let mut rx = orchestrator.notifier().subscribe();
        let portal = portal();
        let request = request("01/2024", "03/2024");

        let err = orchestrator.run(&portal, &request).await.unwrap_err();
        assert!(matches!(
            err,
            CoordinatorError::Stage {
                stage: JobStage::Login,
                ..
            }
        ));
        let record = orchestrator
            .store()
            .job_status(&request.tax_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, JobStatus::Error);
        assert_eq!(portal.count_calls("roster_html"), 0);
        assert!(matches!(drain(&mut rx).last(), Some(StatusEvent::JobFailed { .. })));
    }

    #[tokio::test]
    async fn roster_timeout_is_fatal_before_opening_the_client() {
        let (_dir, orchestrator) = orchestrator(&["AB12"]).await;
        let mut rx = orchestrator.notifier().subscribe();
        let portal = portal().with_missing_roster();
        let request = request("01/2024", "03/2024");

        let err = orchestrator.run(&portal, &request).await.unwrap_err();
        assert!(matches!(
            err,
            CoordinatorError::Stage {
                stage: JobStage::Roster,
                source: PortalError::Timeout { .. },
            }
        ));
        let record = orchestrator
            .store()
            .job_status(&request.tax_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, JobStatus::Error);
        assert_eq!(portal.count_calls("open_client"), 0);
        assert!(portal.step_calls().is_empty());
        assert!(matches!(drain(&mut rx).last(), Some(StatusEvent::JobFailed { .. })));
    }

    #[tokio::test]
    async fn unreachable_callback_does_not_change_the_outcome() {
        let callback = CallbackClient::new(CallbackClientConfig {
            retry: RetryPolicy::new(2, Duration::ZERO, Duration::ZERO),
            ..Default::default()
        })
        .unwrap();
        let notifier =
            StatusNotifier::new().with_callback(callback, "http://127.0.0.1:9/encerramento_concluido");
        let (_dir, orchestrator) = orchestrator_with(&["AB12"], notifier).await;
        let mut rx = orchestrator.notifier().subscribe();
        let portal = portal();
        let request = request("01/2024", "02/2024");

        let summary = orchestrator.run(&portal, &request).await.unwrap();
        assert_eq!(summary.closed, 2);
        let record = orchestrator
            .store()
            .job_status(&request.tax_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!((record.status, record.progress), (JobStatus::Completed, 100));
        assert!(matches!(drain(&mut rx).last(), Some(StatusEvent::JobCompleted { .. })));
    }

    #[tokio::test]
    async fn missing_client_is_fatal_but_roster_is_kept() {
        let (_dir, orchestrator) = orchestrator(&["AB12"]).await;
        let portal = portal().without_client(TaxId::parse(TAX_ID).unwrap());
        let request = request("01/2024", "01/2024");

        let err = orchestrator.run(&portal, &request).await.unwrap_err();
        assert!(matches!(
            err,
            CoordinatorError::Stage {
                stage: JobStage::OpenClient,
                ..
            }
        ));
        assert_eq!(
            orchestrator
                .store()
                .list_clients(&Default::default())
                .await
                .unwrap()
                .len(),
            3
        );
        assert!(portal.step_calls().is_empty());
    }

    #[tokio::test]
    async fn reversed_range_completes_without_touching_periods() {
        let (_dir, orchestrator) = orchestrator(&["AB12"]).await;
        let portal = portal();
        let request = request("05/2024", "01/2024");

        let summary = orchestrator.run(&portal, &request).await.unwrap();
        assert_eq!(summary, BatchSummary::default());
        assert_eq!(portal.count_calls("open_movement_menu"), 0);
        let record = orchestrator
            .store()
            .job_status(&request.tax_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!((record.status, record.progress), (JobStatus::Completed, 100));
    }

    struct GatedSessions {
        portal: ScriptedPortal,
        gate: Arc<Semaphore>,
        opened: AtomicUsize,
    }

    #[async_trait]
    impl SessionFactory for GatedSessions {
        async fn open(&self) -> Result<Box<dyn PortalDriver>, PortalError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            self.gate
                .acquire()
                .await
                .map_err(|err| PortalError::Session(err.to_string()))?
                .forget();
            Ok(Box::new(self.portal.clone()))
        }
    }

    struct NoBrowser;

    #[async_trait]
    impl SessionFactory for NoBrowser {
        async fn open(&self) -> Result<Box<dyn PortalDriver>, PortalError> {
            Err(PortalError::Session("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn coordinator_rejects_second_live_job_for_same_client() {
        let (_dir, orchestrator) = orchestrator(&["AB12"]).await;
        let sessions = Arc::new(GatedSessions {
            portal: portal(),
            gate: Arc::new(Semaphore::new(0)),
            opened: AtomicUsize::new(0),
        });
        let coordinator = JobCoordinator::new(orchestrator, sessions.clone(), 5);

        let first = coordinator.submit(request("01/2024", "02/2024")).await.unwrap();
        let second = coordinator.submit(request("01/2024", "02/2024")).await;
        assert!(matches!(second, Err(CoordinatorError::AlreadyRunning(_))));
        assert!(coordinator.is_live(&first.tax_id));

        sessions.gate.add_permits(1);
        let summary = first.wait().await.unwrap();
        assert_eq!(summary.total, 2);
        assert!(!coordinator.is_live(&TaxId::parse(TAX_ID).unwrap()));

        sessions.gate.add_permits(1);
        let again = coordinator.submit(request("03/2024", "03/2024")).await.unwrap();
        assert!(again.wait().await.is_ok());
        assert_eq!(sessions.portal.count_calls("shutdown"), 2);
    }

    #[tokio::test]
    async fn coordinator_bounds_concurrent_sessions() {
        let (_dir, orchestrator) = orchestrator(&["AB12"]).await;
        let sessions = Arc::new(GatedSessions {
            portal: portal(),
            gate: Arc::new(Semaphore::new(0)),
            opened: AtomicUsize::new(0),
        });
        let coordinator = JobCoordinator::new(orchestrator, sessions.clone(), 1);

        let first = coordinator.submit(request("01/2024", "01/2024")).await.unwrap();
        let mut other = request("01/2024", "01/2024");
        other.tax_id = TaxId::parse("11111111000192").unwrap();
        let second = coordinator.submit(other).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sessions.opened.load(Ordering::SeqCst), 1);

        sessions.gate.add_permits(2);
        assert!(first.wait().await.is_ok());
        assert!(second.wait().await.is_ok());
        assert_eq!(sessions.opened.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn session_failure_is_reported_as_job_error() {
        let (_dir, orchestrator) = orchestrator(&["AB12"]).await;
        let coordinator = JobCoordinator::new(orchestrator, Arc::new(NoBrowser), 5);

        let handle = coordinator.submit(request("01/2024", "01/2024")).await.unwrap();
        let tax_id = handle.tax_id.clone();
        let err = handle.wait().await.unwrap_err();
        assert!(matches!(
            err,
            CoordinatorError::Stage {
                stage: JobStage::Session,
                ..
            }
        ));
        let record = coordinator.store().job_status(&tax_id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Error);
    }
}
