//! In-memory portal and OCR doubles for state machine and orchestrator tests.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::io::Cursor;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use encerra_core::{LedgerKind, Period, TaxId};
use image::{GrayImage, ImageFormat, Luma};

use crate::{ClosingStatus, ClosingStep, LoginOutcome, OcrEngine, PortalDriver, PortalError};

const STEP_CALLS: [&str; 5] = [
    "select_period",
    "open_closing_menu",
    "closing_status",
    "initiate_closing",
    "confirm_and_dismiss",
];

/// Small gradient image standing in for a captured challenge.
pub fn sample_captcha_png() -> Vec<u8> {
    let img = GrayImage::from_fn(8, 4, |x, y| Luma([(x * 30 + y * 10) as u8]));
    let mut out = Cursor::new(Vec::new());
    // Encoding an in-memory 8x4 image cannot fail.
    let _ = img.write_to(&mut out, ImageFormat::Png);
    out.into_inner()
}

#[derive(Debug, Default)]
struct ScriptState {
    captcha_answer: Option<String>,
    authenticated: bool,
    authenticated_regardless: bool,
    unreachable: bool,
    broken_movement_menu: bool,
    missing_roster: bool,
    roster_html: String,
    missing_clients: HashSet<TaxId>,
    opened_client: Option<TaxId>,
    closed: BTreeSet<Period>,
    current: Option<Period>,
    failures: HashMap<(Period, ClosingStep), u32>,
    fail_after_closing: HashMap<Period, u32>,
    calls: Vec<String>,
}

/// Scripted [`PortalDriver`]. Clones share state so a test can inspect a
/// driver after handing it to the code under test.
#[derive(Debug, Clone, Default)]
pub struct ScriptedPortal {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedPortal {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ScriptState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn edit(self, f: impl FnOnce(&mut ScriptState)) -> Self {
        f(&mut self.state());
        self
    }

    pub fn with_captcha_answer(self, answer: &str) -> Self {
        self.edit(|s| s.captcha_answer = Some(answer.to_string()))
    }

    pub fn authenticated_regardless(self) -> Self {
        self.edit(|s| s.authenticated_regardless = true)
    }

    pub fn with_unreachable_portal(self) -> Self {
        self.edit(|s| s.unreachable = true)
    }

    pub fn with_broken_movement_menu(self) -> Self {
        self.edit(|s| s.broken_movement_menu = true)
    }

    /// The portfolio rows never show up, so the roster wait times out.
    pub fn with_missing_roster(self) -> Self {
        self.edit(|s| s.missing_roster = true)
    }

    pub fn with_roster_html(self, html: &str) -> Self {
        self.edit(|s| s.roster_html = html.to_string())
    }

    pub fn without_client(self, tax_id: TaxId) -> Self {
        self.edit(|s| {
            s.missing_clients.insert(tax_id);
        })
    }

    pub fn with_closed(self, period: Period) -> Self {
        self.edit(|s| {
            s.closed.insert(period);
        })
    }

    /// `step` fails for `period` the next `times` times it runs.
    pub fn fail_step(self, period: Period, step: ClosingStep, times: u32) -> Self {
        self.edit(|s| {
            s.failures.insert((period, step), times);
        })
    }

    /// The closing goes through but the dismiss step still reports failure.
    pub fn fail_after_closing(self, period: Period, times: u32) -> Self {
        self.edit(|s| {
            s.fail_after_closing.insert(period, times);
        })
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn count_calls(&self, name: &str) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|call| call.split(' ').next() == Some(name))
            .count()
    }

    pub fn step_calls(&self) -> Vec<String> {
        self.state()
            .calls
            .iter()
            .filter(|call| {
                call.split(' ')
                    .next()
                    .is_some_and(|name| STEP_CALLS.contains(&name))
            })
            .cloned()
            .collect()
    }

    pub fn is_closed(&self, period: Period) -> bool {
        self.state().closed.contains(&period)
    }

    pub fn opened_client(&self) -> Option<TaxId> {
        self.state().opened_client.clone()
    }

    fn log(&self, call: String) -> MutexGuard<'_, ScriptState> {
        let mut state = self.state();
        state.calls.push(call);
        state
    }
}

fn scripted_failure(state: &mut ScriptState, step: ClosingStep) -> Result<(), PortalError> {
    let Some(period) = state.current else {
        return Ok(());
    };
    if let Some(remaining) = state.failures.get_mut(&(period, step)) {
        if *remaining > 0 {
            *remaining -= 1;
            return Err(PortalError::command(step.as_str(), "scripted failure"));
        }
    }
    Ok(())
}

#[async_trait]
impl PortalDriver for ScriptedPortal {
    async fn open_login(&self) -> Result<(), PortalError> {
        let state = self.log("open_login".into());
        if state.unreachable {
            return Err(PortalError::command("open portal", "connection refused"));
        }
        Ok(())
    }

    async fn fill_credentials(&self, _crc: &str, _password: &str) -> Result<(), PortalError> {
        self.log("fill_credentials".into());
        Ok(())
    }

    async fn captcha_png(&self) -> Result<Vec<u8>, PortalError> {
        self.log("captcha_png".into());
        Ok(sample_captcha_png())
    }

    async fn refresh_captcha(&self) -> Result<(), PortalError> {
        self.log("refresh_captcha".into());
        Ok(())
    }

    async fn submit_login(&self, answer: &str) -> Result<LoginOutcome, PortalError> {
        let mut state = self.log(format!("submit_login {answer}"));
        if state.captcha_answer.as_deref() == Some(answer) {
            state.authenticated = true;
            Ok(LoginOutcome::Submitted)
        } else {
            Ok(LoginOutcome::Rejected("Código de verificação inválido".into()))
        }
    }

    async fn is_authenticated(&self) -> Result<bool, PortalError> {
        let state = self.log("is_authenticated".into());
        Ok(state.authenticated || state.authenticated_regardless)
    }

    async fn roster_html(&self) -> Result<String, PortalError> {
        let state = self.log("roster_html".into());
        if state.missing_roster {
            return Err(PortalError::Timeout {
                what: "portfolio rows".into(),
                after: std::time::Duration::from_secs(60),
            });
        }
        Ok(state.roster_html.clone())
    }

    async fn open_client(&self, tax_id: &TaxId) -> Result<(), PortalError> {
        let mut state = self.log(format!("open_client {tax_id}"));
        if state.missing_clients.contains(tax_id) {
            return Err(PortalError::ClientNotFound(tax_id.clone()));
        }
        state.opened_client = Some(tax_id.clone());
        Ok(())
    }

    async fn open_movement_menu(&self) -> Result<(), PortalError> {
        let state = self.log("open_movement_menu".into());
        if state.broken_movement_menu {
            return Err(PortalError::Timeout {
                what: "Movimento".into(),
                after: std::time::Duration::from_secs(30),
            });
        }
        Ok(())
    }

    async fn select_period(&self, period: Period) -> Result<(), PortalError> {
        let mut state = self.log(format!("select_period {period}"));
        state.current = Some(period);
        scripted_failure(&mut state, ClosingStep::SelectPeriod)
    }

    async fn open_closing_menu(&self) -> Result<(), PortalError> {
        let mut state = self.log("open_closing_menu".into());
        scripted_failure(&mut state, ClosingStep::OpenClosingMenu)
    }

    async fn closing_status(
        &self,
        period: Period,
        ledger: LedgerKind,
    ) -> Result<ClosingStatus, PortalError> {
        let mut state = self.log(format!("closing_status {period} {}", ledger.as_str()));
        scripted_failure(&mut state, ClosingStep::CheckStatus)?;
        if state.closed.contains(&period) {
            Ok(ClosingStatus::AlreadyClosed)
        } else {
            Ok(ClosingStatus::Open)
        }
    }

    async fn initiate_closing(&self, ledger: LedgerKind) -> Result<(), PortalError> {
        let mut state = self.log(format!("initiate_closing {}", ledger.as_str()));
        scripted_failure(&mut state, ClosingStep::InitiateClosing)
    }

    async fn confirm_and_dismiss(&self) -> Result<(), PortalError> {
        let mut state = self.log("confirm_and_dismiss".into());
        scripted_failure(&mut state, ClosingStep::ConfirmAndDismiss)?;
        let Some(period) = state.current else {
            return Err(PortalError::command("confirm_and_dismiss", "no period selected"));
        };
        state.closed.insert(period);
        if let Some(remaining) = state.fail_after_closing.get_mut(&period) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(PortalError::command("confirm_and_dismiss", "overlay did not close"));
            }
        }
        Ok(())
    }

    async fn screenshot(&self) -> Result<Vec<u8>, PortalError> {
        self.log("screenshot".into());
        Ok(sample_captcha_png())
    }

    async fn shutdown(&self) -> Result<(), PortalError> {
        self.log("shutdown".into());
        Ok(())
    }
}

/// Returns queued answers in order, then repeats the last one.
#[derive(Debug, Default)]
pub struct ScriptedOcr {
    answers: Mutex<VecDeque<String>>,
    last: Mutex<String>,
}

impl ScriptedOcr {
    pub fn new<'a>(answers: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            answers: Mutex::new(answers.into_iter().map(str::to_string).collect()),
            last: Mutex::new(String::new()),
        }
    }
}

#[async_trait]
impl OcrEngine for ScriptedOcr {
    async fn recognize(&self, _png: &[u8]) -> Result<String, PortalError> {
        let next = self
            .answers
            .lock()
            .map_err(|_| PortalError::Ocr("poisoned".into()))?
            .pop_front();
        let mut last = self
            .last
            .lock()
            .map_err(|_| PortalError::Ocr("poisoned".into()))?;
        if let Some(answer) = next {
            *last = answer;
        }
        Ok(last.clone())
    }
}
