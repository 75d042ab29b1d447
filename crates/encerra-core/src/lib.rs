//! Core domain model for ledger-closing jobs: tax ids, periods, clients and job state.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Oldest year the portal accepts for a ledger period.
pub const MIN_PERIOD_YEAR: u16 = 2000;

pub const TAX_ID_LEN: usize = 14;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid tax id {input:?}: expected {TAX_ID_LEN} digits, got {digits}")]
    TaxId { input: String, digits: usize },
    #[error("invalid period {input:?}: expected MMYYYY")]
    PeriodFormat { input: String },
    #[error("invalid period month {month} (expected 1-12)")]
    PeriodMonth { month: u32 },
    #[error("invalid period year {year} (minimum {MIN_PERIOD_YEAR})")]
    PeriodYear { year: u32 },
    #[error("invalid flag value {0:?}")]
    Flag(String),
    #[error("unknown job status {0:?}")]
    JobStatus(String),
}

/// Strips every non-digit, e.g. `35.496.100/0001-35` -> `35496100000135`.
pub fn normalize_tax_id(input: &str) -> String {
    input.chars().filter(char::is_ascii_digit).collect()
}

/// Drops the `/` separator from a period, e.g. `07/2023` -> `072023`. Any other
/// character is kept so the 6-digit check rejects it.
pub fn normalize_period(input: &str) -> String {
    input.trim().chars().filter(|c| *c != '/').collect()
}

/// CNPJ, always held as exactly 14 ASCII digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaxId(String);

impl TaxId {
    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        let digits = normalize_tax_id(input);
        if digits.len() != TAX_ID_LEN {
            return Err(ValidationError::TaxId {
                input: input.to_string(),
                digits: digits.len(),
            });
        }
        Ok(Self(digits))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TaxId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TaxId> for String {
    fn from(value: TaxId) -> Self {
        value.0
    }
}

/// One calendar month targeted for closing. Field order gives chronological `Ord`.
/// Serialized as `MM/YYYY`; deserialization goes through the same validation as parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Period {
    year: u16,
    month: u8,
}

impl Period {
    pub fn new(month: u32, year: u32) -> Result<Self, ValidationError> {
        if !(1..=12).contains(&month) {
            return Err(ValidationError::PeriodMonth { month });
        }
        if year < u32::from(MIN_PERIOD_YEAR) || year > 9999 {
            return Err(ValidationError::PeriodYear { year });
        }
        Ok(Self {
            year: year as u16,
            month: month as u8,
        })
    }

    /// Parses the 6-digit `MMYYYY` encoding exchanged with callers.
    pub fn parse_compact(input: &str) -> Result<Self, ValidationError> {
        if input.len() != 6 || !input.chars().all(|c| c.is_ascii_digit()) {
            return Err(ValidationError::PeriodFormat {
                input: input.to_string(),
            });
        }
        let month: u32 = input[..2].parse().map_err(|_| ValidationError::PeriodFormat {
            input: input.to_string(),
        })?;
        let year: u32 = input[2..].parse().map_err(|_| ValidationError::PeriodFormat {
            input: input.to_string(),
        })?;
        Self::new(month, year)
    }

    /// Accepts user input such as `07/2023` or `072023`.
    pub fn parse_input(input: &str) -> Result<Self, ValidationError> {
        Self::parse_compact(&normalize_period(input))
    }

    /// Parses numeric strings, tolerating a missing leading zero on the month.
    pub fn from_parts(month: &str, year: &str) -> Result<Self, ValidationError> {
        let format_err = || ValidationError::PeriodFormat {
            input: format!("{month}/{year}"),
        };
        let month: u32 = month.trim().parse().map_err(|_| format_err())?;
        let year: u32 = year.trim().parse().map_err(|_| format_err())?;
        Self::new(month, year)
    }

    pub fn month(&self) -> u8 {
        self.month
    }

    pub fn year(&self) -> u16 {
        self.year
    }

    /// Two-digit month as the portal's month selector expects it.
    pub fn month_code(&self) -> String {
        format!("{:02}", self.month)
    }

    pub fn year_text(&self) -> String {
        self.year.to_string()
    }

    pub fn compact(&self) -> String {
        format!("{:02}{:04}", self.month, self.year)
    }

    fn month_index(&self) -> u32 {
        u32::from(self.year) * 12 + u32::from(self.month) - 1
    }

    fn from_month_index(index: u32) -> Self {
        Self {
            year: (index / 12) as u16,
            month: (index % 12 + 1) as u8,
        }
    }

    pub fn next(&self) -> Self {
        Self::from_month_index(self.month_index() + 1)
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}/{:04}", self.month, self.year)
    }
}

impl TryFrom<String> for Period {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse_input(&value)
    }
}

impl From<Period> for String {
    fn from(value: Period) -> Self {
        value.to_string()
    }
}

/// Inclusive month-by-month sequence from `start` to `end`; empty when `start > end`.
pub fn generate_periods(start: Period, end: Period) -> Vec<Period> {
    if start > end {
        return Vec::new();
    }
    (start.month_index()..=end.month_index())
        .map(Period::from_month_index)
        .collect()
}

pub fn generate_periods_from_parts(
    start_month: &str,
    start_year: &str,
    end_month: &str,
    end_year: &str,
) -> Result<Vec<Period>, ValidationError> {
    let start = Period::from_parts(start_month, start_year)?;
    let end = Period::from_parts(end_month, end_year)?;
    Ok(generate_periods(start, end))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodRange {
    pub start: Period,
    pub end: Period,
}

impl PeriodRange {
    pub fn parse(start: &str, end: &str) -> Result<Self, ValidationError> {
        Ok(Self {
            start: Period::parse_input(start)?,
            end: Period::parse_input(end)?,
        })
    }

    pub fn periods(&self) -> Vec<Period> {
        generate_periods(self.start, self.end)
    }
}

/// Which book is closed: services taken (tomados) or services provided (prestados).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerKind {
    #[default]
    #[serde(alias = "tomados", alias = "tomado")]
    ServicesTaken,
    #[serde(alias = "prestados", alias = "prestado")]
    ServicesProvided,
}

impl LedgerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ServicesTaken => "services_taken",
            Self::ServicesProvided => "services_provided",
        }
    }
}

impl FromStr for LedgerKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "services_taken" | "tomados" | "tomado" => Ok(Self::ServicesTaken),
            "services_provided" | "prestados" | "prestado" => Ok(Self::ServicesProvided),
            other => Err(ValidationError::Flag(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum YesNo {
    Yes,
    No,
}

impl YesNo {
    /// Reads the portal's `Sim` / `Não` cells.
    pub fn parse_portal(input: &str) -> Result<Self, ValidationError> {
        match input.trim().to_lowercase().as_str() {
            "sim" | "s" | "yes" => Ok(Self::Yes),
            "não" | "nao" | "n" | "no" => Ok(Self::No),
            other => Err(ValidationError::Flag(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Yes => "yes",
            Self::No => "no",
        }
    }
}

impl FromStr for YesNo {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_portal(s)
    }
}

/// One row of the accountant's client portfolio.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRecord {
    pub internal_id: String,
    pub tax_id: TaxId,
    pub name: String,
    pub omission: YesNo,
    pub debt: YesNo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Starting,
    LoggingIn,
    Extracting,
    InProgress,
    Completed,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Starting => "starting",
            Self::LoggingIn => "logging_in",
            Self::Extracting => "extracting",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" | "pendente" => Ok(Self::Pending),
            "starting" | "iniciando" => Ok(Self::Starting),
            "logging_in" | "iniciando_login" => Ok(Self::LoggingIn),
            "extracting" | "extraindo_dados" => Ok(Self::Extracting),
            "in_progress" | "em_processo" => Ok(Self::InProgress),
            "completed" | "concluido" => Ok(Self::Completed),
            "error" | "erro" => Ok(Self::Error),
            other => Err(ValidationError::JobStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub tax_id: TaxId,
    pub job_id: Option<String>,
    pub status: JobStatus,
    pub progress: u8,
    pub started_at: Option<DateTime<Utc>>,
    pub last_update: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodOutcome {
    AlreadyClosed,
    Closed,
    Failed,
}

/// Counts of per-period outcomes for one batch; individual outcomes are not kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub closed: usize,
    pub already_closed: usize,
    pub failed: usize,
}

impl BatchSummary {
    pub fn record(&mut self, outcome: PeriodOutcome) {
        self.total += 1;
        match outcome {
            PeriodOutcome::AlreadyClosed => self.already_closed += 1,
            PeriodOutcome::Closed => self.closed += 1,
            PeriodOutcome::Failed => self.failed += 1,
        }
    }
}

/// `floor(index / total * 100)`, the progress reported before period `index` starts.
pub fn progress_percent(index: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    let pct = index.min(total) * 100 / total;
    pct as u8
}

/// A validated closing request for one client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub job_id: Uuid,
    pub tax_id: TaxId,
    pub range: PeriodRange,
    pub ledger: LedgerKind,
}

impl JobRequest {
    pub fn new(tax_id: TaxId, range: PeriodRange, ledger: LedgerKind) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            tax_id,
            range,
            ledger,
        }
    }

    /// Normalizes and validates raw submission fields.
    pub fn from_submission(
        tax_id: &str,
        period_start: &str,
        period_end: &str,
        ledger: LedgerKind,
    ) -> Result<Self, ValidationError> {
        let tax_id = TaxId::parse(tax_id)?;
        let range = PeriodRange::parse(period_start, period_end)?;
        Ok(Self::new(tax_id, range, ledger))
    }
}
