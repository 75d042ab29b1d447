//! Portal automation: the driver contract, CAPTCHA pipeline, login, roster
//! extraction and the per-period closing state machine.

use std::fmt;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use encerra_core::{
    progress_percent, BatchSummary, ClientRecord, LedgerKind, Period, PeriodOutcome, TaxId,
    ValidationError, YesNo,
};
use encerra_storage::{ArtifactStore, RetryPolicy};
use image::{GrayImage, ImageFormat, Luma};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, info_span, warn, Instrument};

pub mod webdriver;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use webdriver::WebDriverPortal;

/// Pixels darker than this become black, everything else white.
pub const CAPTCHA_THRESHOLD: u8 = 140;
pub const CAPTCHA_LEN: usize = 4;
pub const CAPTCHA_MAX_ATTEMPTS: u32 = 10;

/// Cells a portfolio row must carry: internal id, tax id, name, omission, debt.
pub const ROSTER_CELLS: usize = 5;

#[derive(Debug, Error)]
pub enum PortalError {
    #[error("could not open webdriver session: {0}")]
    Session(String),
    #[error("{step} failed: {message}")]
    Command { step: &'static str, message: String },
    #[error("timed out after {after:?} waiting for {what}")]
    Timeout { what: String, after: Duration },
    #[error("unexpected page title {found:?} (expected {expected:?})")]
    UnexpectedPage { expected: String, found: String },
    #[error("session not authenticated after {attempts} captcha attempt(s)")]
    NotAuthenticated { attempts: u32 },
    #[error("client {0} not found in portfolio")]
    ClientNotFound(TaxId),
    #[error("captcha image: {0}")]
    Image(#[from] image::ImageError),
    #[error("ocr failed: {0}")]
    Ocr(String),
    #[error("portal profile: {0}")]
    Profile(#[from] serde_yaml::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl PortalError {
    pub fn command(step: &'static str, err: impl fmt::Display) -> Self {
        Self::Command {
            step,
            message: err.to_string(),
        }
    }
}

/// Selectors, labels and URLs of the target portal. Every field has a default
/// for the Açailândia SIGISS instance; a YAML file may override any subset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortalProfile {
    pub login_url: String,
    pub expected_title: String,
    pub accountant_entry_xpath: String,
    pub crc_field_css: String,
    pub password_field_css: String,
    pub captcha_image_css: String,
    pub captcha_refresh_css: String,
    pub captcha_answer_css: String,
    pub login_button_label: String,
    pub login_error_css: String,
    pub main_frame_css: String,
    pub client_menu_label: String,
    pub portfolio_link_text: String,
    pub roster_row_css: String,
    pub client_search_css: String,
    pub search_button_label: String,
    pub client_result_css: String,
    pub access_button_css: String,
    pub movement_menu_label: String,
    pub change_period_label: String,
    pub month_select_css: String,
    pub year_input_css: String,
    pub confirm_period_label: String,
    pub closing_menu_xpath: String,
    pub closed_indicator_text: String,
    pub services_taken_href: String,
    pub services_provided_href: String,
    pub close_month_label: String,
    pub overlay_close_css: String,
    pub element_timeout_ms: u64,
    pub roster_timeout_ms: u64,
    pub status_probe_ms: u64,
    pub settle_ms: u64,
}

impl Default for PortalProfile {
    fn default() -> Self {
        Self {
            login_url: "https://acailandia.sigiss.com.br/acailandia/index.php".into(),
            expected_title: ".:: PREFEITURA - Açailândia ::.".into(),
            accountant_entry_xpath:
                "//tr[contains(normalize-space(.), 'vinculados a contadores')]//a".into(),
            crc_field_css: "input[placeholder='CRC do Contador']".into(),
            password_field_css: "input[type='password']".into(),
            captcha_image_css: "div#div-img-captcha img".into(),
            captcha_refresh_css: "#div-img-captcha".into(),
            captcha_answer_css: "#confirma".into(),
            login_button_label: "Login".into(),
            login_error_css: "#mensagem-erro".into(),
            main_frame_css: "#main".into(),
            client_menu_label: "Contribuinte".into(),
            portfolio_link_text: "Carteira de Clientes".into(),
            roster_row_css: "tr.line".into(),
            client_search_css: "#cnpj".into(),
            search_button_label: "Pesquisar".into(),
            client_result_css: "td.cell.center".into(),
            access_button_css: "button[name='btnAcessar']".into(),
            movement_menu_label: "Movimento".into(),
            change_period_label: "Alterar".into(),
            month_select_css: "select[name='mes']".into(),
            year_input_css: "input[name='ano']".into(),
            confirm_period_label: "Ok".into(),
            closing_menu_xpath: "//td[@class='textBold' and contains(@onclick, 'tableEncerra_t') and contains(., 'Encerramento')]".into(),
            closed_indicator_text: "Escrituração já foi Encerrada".into(),
            services_taken_href: "../fechamento/tomado.php".into(),
            services_provided_href: "../fechamento/prestado.php".into(),
            close_month_label: "Encerrar Mês".into(),
            overlay_close_css: ".iconFechar".into(),
            element_timeout_ms: 30_000,
            roster_timeout_ms: 60_000,
            status_probe_ms: 5_000,
            settle_ms: 1_000,
        }
    }
}

impl PortalProfile {
    pub fn from_yaml_str(input: &str) -> Result<Self, PortalError> {
        Ok(serde_yaml::from_str(input)?)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, PortalError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&raw)
    }

    pub fn closing_href(&self, ledger: LedgerKind) -> &str {
        match ledger {
            LedgerKind::ServicesTaken => &self.services_taken_href,
            LedgerKind::ServicesProvided => &self.services_provided_href,
        }
    }

    /// Link shown in the closing submenu once the ledger for the period is closed.
    pub fn closed_indicator_xpath(&self, ledger: LedgerKind) -> String {
        format!(
            "//a[@href={} and contains(text(), {})]",
            xpath_literal(self.closing_href(ledger)),
            xpath_literal(&self.closed_indicator_text)
        )
    }

    pub fn closing_link_css(&self, ledger: LedgerKind) -> String {
        format!("a[href=\"{}\"]", self.closing_href(ledger))
    }

    pub fn element_timeout(&self) -> Duration {
        Duration::from_millis(self.element_timeout_ms)
    }

    pub fn roster_timeout(&self) -> Duration {
        Duration::from_millis(self.roster_timeout_ms)
    }

    pub fn status_probe(&self) -> Duration {
        Duration::from_millis(self.status_probe_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

/// XPath matching a button (or button-like input) whose label contains `label`.
pub fn button_xpath(label: &str) -> String {
    let label = xpath_literal(label);
    format!(
        "//*[(self::button or self::input[@type='button' or @type='submit']) and (contains(normalize-space(.), {label}) or contains(@value, {label}))]"
    )
}

pub fn link_xpath(text: &str) -> String {
    format!("//a[contains(normalize-space(.), {})]", xpath_literal(text))
}

fn xpath_literal(value: &str) -> String {
    if !value.contains('\'') {
        format!("'{value}'")
    } else if !value.contains('"') {
        format!("\"{value}\"")
    } else {
        let parts: Vec<String> = value.split('\'').map(|p| format!("'{p}'")).collect();
        format!("concat({})", parts.join(", \"'\", "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    Submitted,
    Rejected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosingStatus {
    Open,
    AlreadyClosed,
}

/// The portal capabilities the agent needs. One value wraps one browser session.
#[async_trait]
pub trait PortalDriver: Send + Sync {
    /// Portal root, title check and the accountant entry point.
    async fn open_login(&self) -> Result<(), PortalError>;
    async fn fill_credentials(&self, crc: &str, password: &str) -> Result<(), PortalError>;
    async fn captcha_png(&self) -> Result<Vec<u8>, PortalError>;
    async fn refresh_captcha(&self) -> Result<(), PortalError>;
    async fn submit_login(&self, answer: &str) -> Result<LoginOutcome, PortalError>;
    async fn is_authenticated(&self) -> Result<bool, PortalError>;

    /// Opens the client portfolio and returns the listing frame's document.
    async fn roster_html(&self) -> Result<String, PortalError>;
    async fn open_client(&self, tax_id: &TaxId) -> Result<(), PortalError>;

    async fn open_movement_menu(&self) -> Result<(), PortalError>;
    async fn select_period(&self, period: Period) -> Result<(), PortalError>;
    async fn open_closing_menu(&self) -> Result<(), PortalError>;
    async fn closing_status(
        &self,
        period: Period,
        ledger: LedgerKind,
    ) -> Result<ClosingStatus, PortalError>;
    async fn initiate_closing(&self, ledger: LedgerKind) -> Result<(), PortalError>;
    async fn confirm_and_dismiss(&self) -> Result<(), PortalError>;

    async fn screenshot(&self) -> Result<Vec<u8>, PortalError>;
    async fn shutdown(&self) -> Result<(), PortalError>;
}

#[async_trait]
pub trait OcrEngine: Send + Sync {
    async fn recognize(&self, png: &[u8]) -> Result<String, PortalError>;
}

/// Runs the `tesseract` binary in single-line mode, feeding the image on stdin.
#[derive(Debug, Clone)]
pub struct TesseractCli {
    binary: PathBuf,
    page_segmentation: u8,
}

impl TesseractCli {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            page_segmentation: 7,
        }
    }
}

impl Default for TesseractCli {
    fn default() -> Self {
        Self::new("tesseract")
    }
}

#[async_trait]
impl OcrEngine for TesseractCli {
    async fn recognize(&self, png: &[u8]) -> Result<String, PortalError> {
        let mut child = Command::new(&self.binary)
            .arg("stdin")
            .arg("stdout")
            .arg("--psm")
            .arg(self.page_segmentation.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| PortalError::Ocr(format!("spawning {}: {err}", self.binary.display())))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(png).await?;
        }
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(PortalError::Ocr(format!(
                "{} exited with {}: {}",
                self.binary.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Grayscale then binarize at [`CAPTCHA_THRESHOLD`]; returns a PNG.
pub fn threshold_captcha(png: &[u8]) -> Result<Vec<u8>, PortalError> {
    let gray = image::load_from_memory(png)?.to_luma8();
    let (width, height) = gray.dimensions();
    let binary = GrayImage::from_fn(width, height, |x, y| {
        let Luma([value]) = *gray.get_pixel(x, y);
        Luma([if value < CAPTCHA_THRESHOLD { 0 } else { 255 }])
    });
    let mut out = Cursor::new(Vec::new());
    binary.write_to(&mut out, ImageFormat::Png)?;
    Ok(out.into_inner())
}

/// Only the shape is checked: exactly four ASCII alphanumerics.
pub fn is_plausible_captcha(text: &str) -> bool {
    text.chars().count() == CAPTCHA_LEN && text.chars().all(|c| c.is_ascii_alphanumeric())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptchaOutcome {
    Accepted { attempts: u32 },
    /// Soft failure; the caller decides with the authenticated-state check.
    Exhausted { attempts: u32 },
}

impl CaptchaOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Accepted { attempts } | Self::Exhausted { attempts } => *attempts,
        }
    }
}

#[derive(Debug, Error)]
enum CaptchaAttemptError {
    #[error("unreadable captcha: {0}")]
    Unreadable(String),
    #[error("login rejected: {0}")]
    Rejected(String),
    #[error(transparent)]
    Portal(PortalError),
}

impl CaptchaAttemptError {
    fn is_retryable(&self) -> bool {
        !matches!(self, Self::Portal(_))
    }
}

#[derive(Clone)]
pub struct CaptchaResolver {
    ocr: Arc<dyn OcrEngine>,
    retry: RetryPolicy,
    artifacts: Option<ArtifactStore>,
}

impl CaptchaResolver {
    pub fn new(ocr: Arc<dyn OcrEngine>, retry: RetryPolicy) -> Self {
        Self {
            ocr,
            retry,
            artifacts: None,
        }
    }

    pub fn with_artifacts(mut self, artifacts: ArtifactStore) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    /// Reads the challenge, submits plausible answers and refreshes on any
    /// rejection until the attempt budget runs out.
    pub async fn resolve(&self, driver: &dyn PortalDriver) -> Result<CaptchaOutcome, PortalError> {
        let ocr = self.ocr.as_ref();
        let artifacts = self.artifacts.as_ref();

        let result = self
            .retry
            .run_while(
                move |attempt| async move {
                    if attempt > 1 {
                        driver
                            .refresh_captcha()
                            .await
                            .map_err(CaptchaAttemptError::Portal)?;
                    }
                    let raw = driver
                        .captcha_png()
                        .await
                        .map_err(CaptchaAttemptError::Portal)?;
                    archive(artifacts, "captcha", &raw).await;
                    let binary = threshold_captcha(&raw)
                        .map_err(|err| CaptchaAttemptError::Unreadable(err.to_string()))?;
                    let text = ocr
                        .recognize(&binary)
                        .await
                        .map_err(|err| CaptchaAttemptError::Unreadable(err.to_string()))?;
                    debug!(attempt, ocr = %text, "captcha read");

                    if !is_plausible_captcha(&text) {
                        archive(artifacts, "captcha-rejected", &binary).await;
                        return Err(CaptchaAttemptError::Unreadable(text));
                    }

                    match driver
                        .submit_login(&text)
                        .await
                        .map_err(CaptchaAttemptError::Portal)?
                    {
                        LoginOutcome::Submitted => Ok(attempt),
                        LoginOutcome::Rejected(message) => {
                            archive(artifacts, "captcha-rejected", &binary).await;
                            Err(CaptchaAttemptError::Rejected(message))
                        }
                    }
                },
                CaptchaAttemptError::is_retryable,
            )
            .await;

        match result {
            Ok(attempts) => Ok(CaptchaOutcome::Accepted { attempts }),
            Err(exhausted) => match exhausted.last_error {
                CaptchaAttemptError::Portal(err) => Err(err),
                last => {
                    warn!(attempts = exhausted.attempts, error = %last, "captcha attempts exhausted");
                    Ok(CaptchaOutcome::Exhausted {
                        attempts: exhausted.attempts,
                    })
                }
            },
        }
    }
}

async fn archive(artifacts: Option<&ArtifactStore>, category: &str, bytes: &[u8]) {
    let Some(store) = artifacts else {
        return;
    };
    match store.store_bytes(Utc::now(), category, "png", bytes).await {
        Ok(stored) => debug!(path = %stored.relative_path.display(), "artifact stored"),
        Err(err) => warn!(error = %err, category, "failed to store artifact"),
    }
}

#[derive(Clone)]
pub struct Credentials {
    pub crc: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("crc", &self.crc)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct Authenticator {
    credentials: Credentials,
    captcha: CaptchaResolver,
}

impl fmt::Debug for CaptchaResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptchaResolver")
            .field("retry", &self.retry)
            .field("artifacts", &self.artifacts)
            .finish_non_exhaustive()
    }
}

impl Authenticator {
    pub fn new(credentials: Credentials, captcha: CaptchaResolver) -> Self {
        Self {
            credentials,
            captcha,
        }
    }

    /// Any navigation failure is fatal; CAPTCHA exhaustion is settled by the
    /// authenticated-state check.
    pub async fn login(&self, driver: &dyn PortalDriver) -> Result<CaptchaOutcome, PortalError> {
        driver.open_login().await?;
        driver
            .fill_credentials(&self.credentials.crc, &self.credentials.password)
            .await?;
        let outcome = self.captcha.resolve(driver).await?;

        if !driver.is_authenticated().await? {
            return Err(PortalError::NotAuthenticated {
                attempts: outcome.attempts(),
            });
        }
        info!(attempts = outcome.attempts(), "logged in");
        Ok(outcome)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RosterParse {
    pub records: Vec<ClientRecord>,
    pub skipped: usize,
}

fn cell_text(cell: scraper::ElementRef<'_>) -> String {
    cell.text()
        .collect::<String>()
        .replace('\u{a0}', "")
        .trim()
        .to_string()
}

/// Parses every portfolio row in one pass over the frame document.
pub fn parse_roster_html(html: &str, row_css: &str) -> Result<RosterParse, PortalError> {
    let document = Html::parse_document(html);
    let rows = Selector::parse(row_css)
        .map_err(|err| PortalError::command("parse roster selector", err))?;
    let cells = Selector::parse("td").map_err(|err| PortalError::command("parse cell selector", err))?;

    let mut parsed = RosterParse::default();
    for (index, row) in document.select(&rows).enumerate() {
        let values: Vec<String> = row.select(&cells).map(cell_text).collect();
        if values.len() < ROSTER_CELLS {
            warn!(row = index + 1, cells = values.len(), "roster row has too few cells");
            parsed.skipped += 1;
            continue;
        }
        let record = TaxId::parse(&values[1]).and_then(|tax_id| {
            Ok(ClientRecord {
                internal_id: values[0].clone(),
                tax_id,
                name: values[2].clone(),
                omission: YesNo::parse_portal(&values[3])?,
                debt: YesNo::parse_portal(&values[4])?,
            })
        });
        match record {
            Ok(record) => parsed.records.push(record),
            Err(err) => {
                warn!(row = index + 1, error = %err, "skipping roster row");
                parsed.skipped += 1;
            }
        }
    }
    Ok(parsed)
}

#[derive(Debug, Clone)]
pub struct RosterExtractor {
    row_css: String,
}

impl RosterExtractor {
    pub fn new(profile: &PortalProfile) -> Self {
        Self {
            row_css: profile.roster_row_css.clone(),
        }
    }

    pub async fn extract(&self, driver: &dyn PortalDriver) -> Result<Vec<ClientRecord>, PortalError> {
        let html = driver.roster_html().await?;
        let parsed = parse_roster_html(&html, &self.row_css)?;
        info!(
            clients = parsed.records.len(),
            skipped = parsed.skipped,
            "roster extracted"
        );
        Ok(parsed.records)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClosingStep {
    SelectPeriod,
    OpenClosingMenu,
    CheckStatus,
    InitiateClosing,
    ConfirmAndDismiss,
}

impl ClosingStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SelectPeriod => "select_period",
            Self::OpenClosingMenu => "open_closing_menu",
            Self::CheckStatus => "check_status",
            Self::InitiateClosing => "initiate_closing",
            Self::ConfirmAndDismiss => "confirm_and_dismiss",
        }
    }
}

impl fmt::Display for ClosingStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("{step}: {source}")]
pub struct StepFailure {
    pub step: ClosingStep,
    #[source]
    pub source: PortalError,
}

fn at(step: ClosingStep) -> impl FnOnce(PortalError) -> StepFailure {
    move |source| StepFailure { step, source }
}

/// Receives progress before each period is attempted.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn period_started(&self, period: Period, index: usize, total: usize, percent: u8);
}

/// Closes one period of one client. Failures never escape a period.
#[derive(Debug, Clone)]
pub struct PeriodCloser {
    ledger: LedgerKind,
    retry: RetryPolicy,
    artifacts: Option<ArtifactStore>,
    screenshot_on_failure: bool,
}

impl PeriodCloser {
    pub fn new(ledger: LedgerKind, retry: RetryPolicy) -> Self {
        Self {
            ledger,
            retry,
            artifacts: None,
            screenshot_on_failure: false,
        }
    }

    pub fn with_failure_screenshots(mut self, artifacts: ArtifactStore) -> Self {
        self.artifacts = Some(artifacts);
        self.screenshot_on_failure = true;
        self
    }

    pub fn ledger(&self) -> LedgerKind {
        self.ledger
    }

    async fn attempt(
        &self,
        driver: &dyn PortalDriver,
        period: Period,
    ) -> Result<PeriodOutcome, StepFailure> {
        driver
            .select_period(period)
            .await
            .map_err(at(ClosingStep::SelectPeriod))?;
        driver
            .open_closing_menu()
            .await
            .map_err(at(ClosingStep::OpenClosingMenu))?;

        let status = driver
            .closing_status(period, self.ledger)
            .await
            .map_err(at(ClosingStep::CheckStatus))?;
        if status == ClosingStatus::AlreadyClosed {
            return Ok(PeriodOutcome::AlreadyClosed);
        }

        driver
            .initiate_closing(self.ledger)
            .await
            .map_err(at(ClosingStep::InitiateClosing))?;
        driver
            .confirm_and_dismiss()
            .await
            .map_err(at(ClosingStep::ConfirmAndDismiss))?;
        Ok(PeriodOutcome::Closed)
    }

    /// A retry starts over at period selection, so a closing that went through
    /// on the failed attempt reads as already closed.
    pub async fn close_period(&self, driver: &dyn PortalDriver, period: Period) -> PeriodOutcome {
        let span = info_span!("close_period", period = %period, ledger = self.ledger.as_str());
        async {
            let result = self
                .retry
                .run(move |attempt| async move {
                    let outcome = self.attempt(driver, period).await;
                    if let Err(failure) = &outcome {
                        warn!(attempt, step = %failure.step, error = %failure.source, "period attempt failed");
                    }
                    outcome
                })
                .await;

            match result {
                Ok(PeriodOutcome::AlreadyClosed) => {
                    info!("period already closed, skipping");
                    PeriodOutcome::AlreadyClosed
                }
                Ok(outcome) => {
                    info!("period closed");
                    outcome
                }
                Err(exhausted) => {
                    warn!(
                        attempts = exhausted.attempts,
                        step = %exhausted.last_error.step,
                        "period failed"
                    );
                    self.capture_failure(driver).await;
                    PeriodOutcome::Failed
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn capture_failure(&self, driver: &dyn PortalDriver) {
        if !self.screenshot_on_failure {
            return;
        }
        match driver.screenshot().await {
            Ok(png) => archive(self.artifacts.as_ref(), "period-failure", &png).await,
            Err(err) => warn!(error = %err, "failure screenshot unavailable"),
        }
    }

    /// Runs every period in order. Only the movement-menu preflight can fail the batch.
    pub async fn run_batch(
        &self,
        driver: &dyn PortalDriver,
        periods: &[Period],
        sink: &dyn ProgressSink,
    ) -> Result<BatchSummary, PortalError> {
        let mut summary = BatchSummary::default();
        if periods.is_empty() {
            return Ok(summary);
        }
        driver.open_movement_menu().await?;

        let total = periods.len();
        for (index, period) in periods.iter().copied().enumerate() {
            sink.period_started(period, index, total, progress_percent(index, total))
                .await;
            summary.record(self.close_period(driver, period).await);
        }
        info!(
            total = summary.total,
            closed = summary.closed,
            already_closed = summary.already_closed,
            failed = summary.failed,
            "batch finished"
        );
        Ok(summary)
    }
}
