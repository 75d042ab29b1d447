//! [`PortalDriver`] over a W3C WebDriver session.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use encerra_core::{normalize_tax_id, LedgerKind, Period, TaxId};
use fantoccini::elements::Element;
use fantoccini::{Client, ClientBuilder, Locator};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::{
    button_xpath, link_xpath, ClosingStatus, LoginOutcome, PortalDriver, PortalError,
    PortalProfile,
};

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// One browser session. Nothing is shared between sessions.
#[derive(Debug, Clone)]
pub struct WebDriverPortal {
    client: Client,
    profile: PortalProfile,
}

impl WebDriverPortal {
    pub async fn connect(
        webdriver_url: &str,
        headless: bool,
        profile: PortalProfile,
    ) -> Result<Self, PortalError> {
        let mut caps = Map::new();
        let mut args = vec![Value::from("--window-size=1366,900")];
        if headless {
            args.push(Value::from("--headless=new"));
        }
        caps.insert("goog:chromeOptions".into(), json!({ "args": args }));
        caps.insert(
            "moz:firefoxOptions".into(),
            json!({ "args": if headless { vec!["-headless"] } else { Vec::new() } }),
        );

        let client = ClientBuilder::native()
            .capabilities(caps)
            .connect(webdriver_url)
            .await
            .map_err(|err| PortalError::Session(err.to_string()))?;
        info!(webdriver_url, headless, "webdriver session opened");
        Ok(Self { client, profile })
    }

    pub fn profile(&self) -> &PortalProfile {
        &self.profile
    }

    async fn top(&self) -> Result<(), PortalError> {
        self.client
            .enter_frame(None)
            .await
            .map_err(|err| PortalError::command("enter top frame", err))
    }

    async fn main_frame(&self) -> Result<(), PortalError> {
        self.top().await?;
        let frame = self
            .wait_for(
                Locator::Css(&self.profile.main_frame_css),
                self.profile.element_timeout(),
            )
            .await?;
        frame
            .enter_frame()
            .await
            .map_err(|err| PortalError::command("enter main frame", err))?;
        Ok(())
    }

    async fn wait_for(&self, locator: Locator<'_>, timeout: Duration) -> Result<Element, PortalError> {
        let what = format!("{locator:?}");
        self.client
            .wait()
            .at_most(timeout)
            .every(POLL_INTERVAL)
            .for_element(locator)
            .await
            .map_err(|_| PortalError::Timeout {
                what,
                after: timeout,
            })
    }

    async fn click(&self, locator: Locator<'_>, step: &'static str) -> Result<(), PortalError> {
        let element = self.wait_for(locator, self.profile.element_timeout()).await?;
        element
            .click()
            .await
            .map_err(|err| PortalError::command(step, err))?;
        Ok(())
    }

    async fn fill(&self, locator: Locator<'_>, value: &str, step: &'static str) -> Result<(), PortalError> {
        let element = self.wait_for(locator, self.profile.element_timeout()).await?;
        element
            .clear()
            .await
            .map_err(|err| PortalError::command(step, err))?;
        element
            .send_keys(value)
            .await
            .map_err(|err| PortalError::command(step, err))?;
        Ok(())
    }

    async fn visible(&self, locator: Locator<'_>) -> Result<bool, PortalError> {
        let elements = self
            .client
            .find_all(locator)
            .await
            .map_err(|err| PortalError::command("find elements", err))?;
        for element in elements {
            if element.is_displayed().await.unwrap_or(false) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn settle(&self) {
        tokio::time::sleep(self.profile.settle()).await;
    }
}

#[async_trait]
impl PortalDriver for WebDriverPortal {
    async fn open_login(&self) -> Result<(), PortalError> {
        self.client
            .goto(&self.profile.login_url)
            .await
            .map_err(|err| PortalError::command("open portal", err))?;
        let title = self
            .client
            .title()
            .await
            .map_err(|err| PortalError::command("read title", err))?;
        if title.trim() != self.profile.expected_title {
            return Err(PortalError::UnexpectedPage {
                expected: self.profile.expected_title.clone(),
                found: title,
            });
        }
        self.click(
            Locator::XPath(&self.profile.accountant_entry_xpath),
            "open accountant login",
        )
        .await
    }

    async fn fill_credentials(&self, crc: &str, password: &str) -> Result<(), PortalError> {
        self.fill(Locator::Css(&self.profile.crc_field_css), crc, "fill crc")
            .await?;
        self.fill(
            Locator::Css(&self.profile.password_field_css),
            password,
            "fill password",
        )
        .await
    }

    async fn captcha_png(&self) -> Result<Vec<u8>, PortalError> {
        let image = self
            .wait_for(
                Locator::Css(&self.profile.captcha_image_css),
                self.profile.element_timeout(),
            )
            .await?;
        image
            .screenshot()
            .await
            .map_err(|err| PortalError::command("capture captcha", err))
    }

    async fn refresh_captcha(&self) -> Result<(), PortalError> {
        self.click(
            Locator::Css(&self.profile.captcha_refresh_css),
            "refresh captcha",
        )
        .await?;
        self.settle().await;
        Ok(())
    }

    async fn submit_login(&self, answer: &str) -> Result<LoginOutcome, PortalError> {
        self.fill(
            Locator::Css(&self.profile.captcha_answer_css),
            answer,
            "fill captcha",
        )
        .await?;
        let login = button_xpath(&self.profile.login_button_label);
        self.click(Locator::XPath(&login), "submit login").await?;
        tokio::time::sleep(self.profile.settle() * 3).await;

        let errors = self
            .client
            .find_all(Locator::Css(&self.profile.login_error_css))
            .await
            .map_err(|err| PortalError::command("read login error", err))?;
        for element in errors {
            let text = element.text().await.unwrap_or_default();
            let text = text.trim();
            if !text.is_empty() {
                return Ok(LoginOutcome::Rejected(text.to_string()));
            }
        }
        Ok(LoginOutcome::Submitted)
    }

    async fn is_authenticated(&self) -> Result<bool, PortalError> {
        self.top().await?;
        let menu = button_xpath(&self.profile.client_menu_label);
        self.visible(Locator::XPath(&menu)).await
    }

    async fn roster_html(&self) -> Result<String, PortalError> {
        self.top().await?;
        let menu = button_xpath(&self.profile.client_menu_label);
        self.click(Locator::XPath(&menu), "open client menu").await?;
        let portfolio = link_xpath(&self.profile.portfolio_link_text);
        self.click(Locator::XPath(&portfolio), "open client portfolio")
            .await?;

        self.main_frame().await?;
        self.wait_for(
            Locator::Css(&self.profile.roster_row_css),
            self.profile.roster_timeout(),
        )
        .await?;
        self.client
            .source()
            .await
            .map_err(|err| PortalError::command("read portfolio frame", err))
    }

    async fn open_client(&self, tax_id: &TaxId) -> Result<(), PortalError> {
        self.main_frame().await?;
        self.fill(
            Locator::Css(&self.profile.client_search_css),
            tax_id.as_str(),
            "fill client search",
        )
        .await?;
        let search = button_xpath(&self.profile.search_button_label);
        self.click(Locator::XPath(&search), "search client").await?;

        let deadline = Instant::now() + self.profile.element_timeout();
        loop {
            let cells = self
                .client
                .find_all(Locator::Css(&self.profile.client_result_css))
                .await
                .map_err(|err| PortalError::command("list search results", err))?;
            for cell in cells {
                let text = cell.text().await.unwrap_or_default();
                if normalize_tax_id(&text) == tax_id.as_str() {
                    cell.click()
                        .await
                        .map_err(|err| PortalError::command("select client", err))?;
                    self.click(
                        Locator::Css(&self.profile.access_button_css),
                        "access client",
                    )
                    .await?;
                    debug!(tax_id = %tax_id, "client opened");
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Err(PortalError::ClientNotFound(tax_id.clone()));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn open_movement_menu(&self) -> Result<(), PortalError> {
        self.top().await?;
        let movement = button_xpath(&self.profile.movement_menu_label);
        self.click(Locator::XPath(&movement), "open movement menu")
            .await?;
        self.main_frame().await?;
        let change = button_xpath(&self.profile.change_period_label);
        self.wait_for(Locator::XPath(&change), self.profile.element_timeout() * 2)
            .await?;
        Ok(())
    }

    async fn select_period(&self, period: Period) -> Result<(), PortalError> {
        self.open_movement_menu().await?;
        let change = button_xpath(&self.profile.change_period_label);
        self.click(Locator::XPath(&change), "change period").await?;
        self.settle().await;

        let month = self
            .wait_for(
                Locator::Css(&self.profile.month_select_css),
                self.profile.element_timeout(),
            )
            .await?;
        month
            .select_by_value(&period.month_code())
            .await
            .map_err(|err| PortalError::command("select month", err))?;
        self.fill(
            Locator::Css(&self.profile.year_input_css),
            &period.year_text(),
            "fill year",
        )
        .await?;

        let ok = button_xpath(&self.profile.confirm_period_label);
        self.click(Locator::XPath(&ok), "confirm period").await?;
        tokio::time::sleep(self.profile.settle() * 3).await;
        Ok(())
    }

    async fn open_closing_menu(&self) -> Result<(), PortalError> {
        self.main_frame().await?;
        self.click(
            Locator::XPath(&self.profile.closing_menu_xpath),
            "open closing menu",
        )
        .await?;
        tokio::time::sleep(self.profile.settle() * 2).await;
        Ok(())
    }

    async fn closing_status(
        &self,
        period: Period,
        ledger: LedgerKind,
    ) -> Result<ClosingStatus, PortalError> {
        let indicator = self.profile.closed_indicator_xpath(ledger);
        let link = self.profile.closing_link_css(ledger);
        let deadline = Instant::now() + self.profile.status_probe();
        loop {
            if self.visible(Locator::XPath(&indicator)).await? {
                debug!(period = %period, "closed indicator visible");
                return Ok(ClosingStatus::AlreadyClosed);
            }
            if self.visible(Locator::Css(&link)).await? || Instant::now() >= deadline {
                return Ok(ClosingStatus::Open);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn initiate_closing(&self, ledger: LedgerKind) -> Result<(), PortalError> {
        let link = self.profile.closing_link_css(ledger);
        let element = self
            .wait_for(Locator::Css(&link), self.profile.element_timeout() * 3 / 2)
            .await?;
        element
            .click()
            .await
            .map_err(|err| PortalError::command("open closing page", err))?;
        self.settle().await;

        self.main_frame().await?;
        let close_month = button_xpath(&self.profile.close_month_label);
        self.click(Locator::XPath(&close_month), "close month").await
    }

    async fn confirm_and_dismiss(&self) -> Result<(), PortalError> {
        // The confirmation dialog may take a while to show up, or never do.
        let deadline = Instant::now() + self.profile.element_timeout() / 3;
        loop {
            match self.client.accept_alert().await {
                Ok(()) => {
                    debug!("closing dialog accepted");
                    break;
                }
                Err(_) if Instant::now() < deadline => tokio::time::sleep(POLL_INTERVAL).await,
                Err(_) => break,
            }
        }
        self.settle().await;

        self.main_frame().await?;
        self.click(
            Locator::Css(&self.profile.overlay_close_css),
            "dismiss overlay",
        )
        .await?;
        self.settle().await;
        Ok(())
    }

    async fn screenshot(&self) -> Result<Vec<u8>, PortalError> {
        self.client
            .screenshot()
            .await
            .map_err(|err| PortalError::command("screenshot", err))
    }

    async fn shutdown(&self) -> Result<(), PortalError> {
        self.client
            .clone()
            .close()
            .await
            .map_err(|err| PortalError::command("close session", err))
    }
}
