//! WebDriver session adapter
//!
//! Talks the W3C WebDriver JSON protocol to a chromedriver instance over HTTP.
//! Controls are located by XPath; waits are polled at `poll_interval`.

use super::{BootstrapError, Element, Key, SessionBootstrap, SessionError, SessionHandle, Signal};
use async_trait::async_trait;
use reqwest::{Client as HttpClient, Method};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Key under which WebDriver serializes element references
const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

/// Upper bound for a single driver round-trip
const DRIVER_HTTP_TIMEOUT_SECS: u64 = 30;

// WebDriver key code points
const KEY_NULL: char = '\u{E000}';
const KEY_SHIFT: char = '\u{E008}';
const KEY_CONTROL: char = '\u{E009}';
const KEY_ENTER: char = '\u{E007}';
const KEY_DELETE: char = '\u{E017}';

/// Chrome arguments used for every automated session
const CHROME_ARGS: &[&str] = &[
    "--disable-dev-shm-usage",
    "--disable-infobars",
    "--disable-notifications",
    "--start-maximized",
    "--no-sandbox",
    "--log-level=3",
];

fn xpath(signal: Signal) -> &'static str {
    match signal {
        Signal::ChatList => "//div[@id='pane-side']",
        Signal::InputReady => "//footer//div[@contenteditable='true'][@role='textbox']",
        Signal::InvalidNumber => {
            "//div[@role='dialog']//div[contains(text(), 'invalid') or contains(text(), 'not on WhatsApp')]"
        }
        Signal::AttachButton => "//div[@title='Attach'] | //button[@title='Attach']",
        Signal::FileInput => "//input[@type='file']",
        Signal::UploadSend => "//div[@role='dialog']//*[@data-icon='send'] | //div[@aria-label='Send']",
        Signal::UploadCancel => "//div[@role='button'][@aria-label='Close'] | //*[@data-icon='x']",
        Signal::CaptionBox => "//div[@contenteditable='true'][@aria-label='Add a caption']",
    }
}

fn key_sequence(key: Key) -> String {
    match key {
        Key::SelectAll => format!("{KEY_CONTROL}a{KEY_NULL}"),
        Key::Delete => KEY_DELETE.to_string(),
        Key::SoftNewline => format!("{KEY_SHIFT}{KEY_ENTER}{KEY_NULL}"),
        Key::Submit => KEY_ENTER.to_string(),
    }
}

/// Connection parameters for chromedriver and the target surface
#[derive(Debug, Clone)]
pub struct WebDriverConfig {
    /// chromedriver base URL, e.g. `http://localhost:9515`
    pub webdriver_url: String,
    /// Base URL of the messaging surface
    pub web_url: String,
    /// Chrome user data directory for profile reuse
    pub user_data_dir: Option<PathBuf>,
    /// Profile inside `user_data_dir`
    pub profile_name: String,
    /// Extra time granted for a QR scan when no session is stored
    pub qr_scan_timeout: Duration,
    /// Delay between two polls of a wait
    pub poll_interval: Duration,
}

impl WebDriverConfig {
    fn capabilities(&self) -> Value {
        let mut args: Vec<String> = CHROME_ARGS.iter().map(|a| (*a).to_string()).collect();
        if let Some(dir) = self.user_data_dir.as_ref().filter(|d| d.exists()) {
            let profile_path = if self.profile_name == "Default" {
                dir.clone()
            } else {
                dir.join(&self.profile_name)
            };
            args.push(format!("--user-data-dir={}", profile_path.display()));
        }
        json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "goog:chromeOptions": {
                        "args": args,
                        "excludeSwitches": ["enable-logging"],
                    }
                }
            }
        })
    }
}

fn driver_client() -> HttpClient {
    HttpClient::builder()
        .timeout(Duration::from_secs(DRIVER_HTTP_TIMEOUT_SECS))
        .build()
        .unwrap_or_else(|_| HttpClient::new())
}

/// Sends one WebDriver command and unwraps its `value` payload.
async fn send_command(
    client: &HttpClient,
    method: Method,
    url: &str,
    body: Option<Value>,
) -> Result<Value, SessionError> {
    let mut request = client.request(method, url);
    if let Some(body) = body {
        request = request.json(&body);
    }

    let response = request
        .send()
        .await
        .map_err(|e| SessionError::Transport(e.to_string()))?;
    let status = response.status();
    let payload: Value = response
        .json()
        .await
        .map_err(|e| SessionError::Protocol(format!("{status}: {e}")))?;
    let value = payload.get("value").cloned().unwrap_or(Value::Null);

    if status.is_success() {
        return Ok(value);
    }

    Err(SessionError::Driver {
        error: value
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string(),
        message: value
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    })
}

fn parse_elements(value: &Value) -> Result<Vec<Element>, SessionError> {
    let items = value
        .as_array()
        .ok_or_else(|| SessionError::Protocol(format!("expected element list, got {value}")))?;
    items
        .iter()
        .map(|item| {
            item.get(ELEMENT_KEY)
                .and_then(Value::as_str)
                .map(|id| Element(id.to_string()))
                .ok_or_else(|| SessionError::Protocol(format!("not an element reference: {item}")))
        })
        .collect()
}

/// Stale or detached elements are expected while the page re-renders.
fn is_transient_lookup_error(err: &SessionError) -> bool {
    matches!(err, SessionError::Driver { error, .. }
        if error == "stale element reference" || error == "no such element")
}

/// A live chromedriver session
pub struct WebDriverSession {
    client: HttpClient,
    /// `{webdriver_url}/session/{id}`; `None` once closed
    session_url: Option<String>,
    web_url: String,
    poll_interval: Duration,
}

impl WebDriverSession {
    fn url(&self, path: &str) -> Result<String, SessionError> {
        self.session_url
            .as_ref()
            .map(|base| format!("{base}{path}"))
            .ok_or(SessionError::Closed)
    }

    async fn command(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, SessionError> {
        let url = self.url(path)?;
        send_command(&self.client, method, &url, body).await
    }

    /// Load an absolute URL in the current tab
    ///
    /// # Errors
    ///
    /// Returns a `SessionError` if the driver rejects the navigation.
    pub async fn load(&self, url: &str) -> Result<(), SessionError> {
        self.command(Method::POST, "/url", Some(json!({ "url": url })))
            .await
            .map(|_| ())
    }

    async fn is_interactable(&self, element: &Element) -> Result<bool, SessionError> {
        let id = element.id();
        let displayed = self
            .command(Method::GET, &format!("/element/{id}/displayed"), None)
            .await?;
        if displayed.as_bool() != Some(true) {
            return Ok(false);
        }
        let enabled = self
            .command(Method::GET, &format!("/element/{id}/enabled"), None)
            .await?;
        Ok(enabled.as_bool() == Some(true))
    }

    async fn send_value(&self, element: &Element, text: &str) -> Result<(), SessionError> {
        self.command(
            Method::POST,
            &format!("/element/{}/value", element.id()),
            Some(json!({ "text": text })),
        )
        .await
        .map(|_| ())
    }
}

#[async_trait]
impl SessionHandle for WebDriverSession {
    #[instrument(skip(self))]
    async fn navigate(&self, contact: &str) -> Result<(), SessionError> {
        let url = format!("{}/send?phone={contact}", self.web_url.trim_end_matches('/'));
        self.load(&url).await
    }

    async fn wait_for_any(
        &self,
        signals: &[Signal],
        timeout: Duration,
    ) -> Result<Option<Signal>, SessionError> {
        let deadline = Instant::now() + timeout;
        loop {
            for signal in signals {
                match self.find_all(*signal).await {
                    Ok(found) if !found.is_empty() => return Ok(Some(*signal)),
                    Ok(_) => {}
                    Err(e) if is_transient_lookup_error(&e) => {}
                    Err(e) => return Err(e),
                }
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn wait_interactable(
        &self,
        signal: Signal,
        timeout: Duration,
    ) -> Result<Option<Element>, SessionError> {
        let deadline = Instant::now() + timeout;
        loop {
            for element in self.find_all(signal).await? {
                match self.is_interactable(&element).await {
                    Ok(true) => return Ok(Some(element)),
                    Ok(false) => {}
                    Err(e) if is_transient_lookup_error(&e) => {}
                    Err(e) => return Err(e),
                }
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn find_all(&self, signal: Signal) -> Result<Vec<Element>, SessionError> {
        let value = self
            .command(
                Method::POST,
                "/elements",
                Some(json!({ "using": "xpath", "value": xpath(signal) })),
            )
            .await?;
        parse_elements(&value)
    }

    async fn click(&self, element: &Element) -> Result<(), SessionError> {
        self.command(
            Method::POST,
            &format!("/element/{}/click", element.id()),
            Some(json!({})),
        )
        .await
        .map(|_| ())
    }

    async fn type_text(&self, element: &Element, text: &str) -> Result<(), SessionError> {
        self.send_value(element, text).await
    }

    async fn send_keys(&self, element: &Element, key: Key) -> Result<(), SessionError> {
        self.send_value(element, &key_sequence(key)).await
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        let Some(url) = self.session_url.take() else {
            return Ok(());
        };
        send_command(&self.client, Method::DELETE, &url, None).await?;
        debug!(session = %url, "WebDriver session deleted");
        Ok(())
    }
}

impl Drop for WebDriverSession {
    fn drop(&mut self) {
        let Some(url) = self.session_url.take() else {
            return;
        };
        warn!(session = %url, "WebDriver session dropped without close, deleting in background");
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let client = self.client.clone();
            handle.spawn(async move {
                if let Err(e) = send_command(&client, Method::DELETE, &url, None).await {
                    warn!(error = %e, "Background session delete failed");
                }
            });
        }
    }
}

/// Opens Chrome sessions through chromedriver and waits for login
pub struct ChromeBootstrap {
    config: WebDriverConfig,
    client: HttpClient,
}

impl ChromeBootstrap {
    /// Create a bootstrap for the given driver configuration
    #[must_use]
    pub fn new(config: WebDriverConfig) -> Self {
        Self {
            config,
            client: driver_client(),
        }
    }
}

#[async_trait]
impl SessionBootstrap for ChromeBootstrap {
    #[instrument(skip(self), fields(driver = %self.config.webdriver_url))]
    async fn open(&self) -> Result<Box<dyn SessionHandle>, BootstrapError> {
        let base = self.config.webdriver_url.trim_end_matches('/');
        let value = send_command(
            &self.client,
            Method::POST,
            &format!("{base}/session"),
            Some(self.config.capabilities()),
        )
        .await?;
        let session_id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| SessionError::Protocol(format!("missing sessionId in {value}")))?;
        info!(session_id, "Chrome WebDriver session created");

        let mut session = WebDriverSession {
            client: self.client.clone(),
            session_url: Some(format!("{base}/session/{session_id}")),
            web_url: self.config.web_url.clone(),
            poll_interval: self.config.poll_interval,
        };

        if let Err(e) = session.load(&self.config.web_url).await {
            if let Err(close_err) = session.close().await {
                warn!(error = %close_err, "Failed to release session after load error");
            }
            return Err(e.into());
        }
        Ok(Box::new(session))
    }

    async fn authenticate(&self, session: &dyn SessionHandle, timeout: Duration) -> bool {
        match session.wait_for_any(&[Signal::ChatList], timeout).await {
            Ok(Some(_)) => {
                info!("Using existing web session");
                return true;
            }
            Ok(None) => info!("No existing session found, waiting for QR code scan"),
            Err(e) => {
                error!(error = %e, "Login check failed");
                return false;
            }
        }

        match session
            .wait_for_any(&[Signal::ChatList], self.config.qr_scan_timeout)
            .await
        {
            Ok(Some(_)) => {
                info!("Login successful");
                true
            }
            Ok(None) => {
                error!(
                    timeout_secs = self.config.qr_scan_timeout.as_secs(),
                    "Login timed out waiting for QR code scan"
                );
                false
            }
            Err(e) => {
                error!(error = %e, "Login check failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MockSessionHandle;

    fn config() -> WebDriverConfig {
        WebDriverConfig {
            webdriver_url: "http://localhost:9515".to_string(),
            web_url: "https://web.example.com".to_string(),
            user_data_dir: None,
            profile_name: "Default".to_string(),
            qr_scan_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_millis(500),
        }
    }

    #[test]
    fn soft_newline_releases_shift() {
        let seq = key_sequence(Key::SoftNewline);
        assert_eq!(seq.chars().collect::<Vec<_>>(), vec![KEY_SHIFT, KEY_ENTER, KEY_NULL]);
        assert_eq!(key_sequence(Key::Submit), KEY_ENTER.to_string());
    }

    #[test]
    fn parses_element_references() -> Result<(), SessionError> {
        let value = json!([{ ELEMENT_KEY: "a-1" }, { ELEMENT_KEY: "b-2" }]);
        let elements = parse_elements(&value)?;
        assert_eq!(elements, vec![Element("a-1".into()), Element("b-2".into())]);
        Ok(())
    }

    #[test]
    fn rejects_non_element_payload() {
        let value = json!([{ "something": "else" }]);
        assert!(matches!(parse_elements(&value), Err(SessionError::Protocol(_))));
        assert!(matches!(parse_elements(&json!({})), Err(SessionError::Protocol(_))));
    }

    #[test]
    fn capabilities_skip_missing_profile_dir() {
        let mut cfg = config();
        cfg.user_data_dir = Some(PathBuf::from("/definitely/not/here"));
        let caps = cfg.capabilities();
        let args = caps["capabilities"]["alwaysMatch"]["goog:chromeOptions"]["args"]
            .as_array()
            .map(Vec::len);
        assert_eq!(args, Some(CHROME_ARGS.len()));
    }

    #[test]
    fn capabilities_use_named_profile() -> Result<(), std::io::Error> {
        let dir = tempfile::tempdir()?;
        let mut cfg = config();
        cfg.user_data_dir = Some(dir.path().to_path_buf());
        cfg.profile_name = "Work".to_string();
        let caps = cfg.capabilities();
        let expected = format!("--user-data-dir={}", dir.path().join("Work").display());
        let found = caps["capabilities"]["alwaysMatch"]["goog:chromeOptions"]["args"]
            .as_array()
            .is_some_and(|args| args.iter().any(|a| a.as_str() == Some(expected.as_str())));
        assert!(found);
        Ok(())
    }

    #[tokio::test]
    async fn closed_session_rejects_commands() {
        let mut session = WebDriverSession {
            client: driver_client(),
            session_url: None,
            web_url: "https://web.example.com".to_string(),
            poll_interval: Duration::from_millis(10),
        };
        assert!(matches!(session.navigate("123").await, Err(SessionError::Closed)));
        assert!(session.close().await.is_ok());
    }

    #[tokio::test]
    async fn stored_login_skips_qr_wait() {
        let mut session = MockSessionHandle::new();
        session
            .expect_wait_for_any()
            .withf(|signals, timeout| {
                signals == [Signal::ChatList] && *timeout == Duration::from_secs(5)
            })
            .times(1)
            .returning(|_, _| Ok(Some(Signal::ChatList)));

        let bootstrap = ChromeBootstrap::new(config());
        assert!(bootstrap.authenticate(&session, Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn login_fails_when_qr_scan_times_out() {
        let mut session = MockSessionHandle::new();
        session
            .expect_wait_for_any()
            .times(2)
            .returning(|_, _| Ok(None));

        let bootstrap = ChromeBootstrap::new(config());
        assert!(!bootstrap.authenticate(&session, Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn login_fails_on_driver_error() {
        let mut session = MockSessionHandle::new();
        session
            .expect_wait_for_any()
            .times(1)
            .returning(|_, _| Err(SessionError::Closed));

        let bootstrap = ChromeBootstrap::new(config());
        assert!(!bootstrap.authenticate(&session, Duration::from_secs(5)).await);
    }

    #[test]
    fn stale_lookups_are_transient() {
        let stale = SessionError::Driver {
            error: "stale element reference".into(),
            message: String::new(),
        };
        assert!(is_transient_lookup_error(&stale));
        assert!(!is_transient_lookup_error(&SessionError::Closed));
    }
}
