// 🚗 WebDriver client - W3C wire protocol over reqwest
//
// Talks to a running chromedriver/selenium endpoint. One instance owns one
// remote session; quitting deletes it.

use std::path::Path;

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{Browser, Cookie, ElementId, Selector};
use crate::error::BrowserError;

/// Key under which W3C drivers return element references
const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

pub struct WebDriverBrowser {
    client: reqwest::Client,
    endpoint: String,
    session_id: String,
}

#[derive(Deserialize)]
struct WireReply {
    value: Value,
}

impl WebDriverBrowser {
    /// Start a Chrome session whose downloads land in `download_dir`.
    pub async fn connect(endpoint: &str, download_dir: &Path, headless: bool) -> Result<Self, BrowserError> {
        let client = reqwest::Client::new();
        let endpoint = endpoint.trim_end_matches('/').to_string();

        let mut args = vec![
            "--no-sandbox",
            "--disable-dev-shm-usage",
            "--disable-gpu",
            "--window-size=1920,1080",
        ];
        if headless {
            args.push("--headless=new");
        }

        let capabilities = json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "goog:chromeOptions": {
                        "args": args,
                        "prefs": {
                            "download.default_directory": download_dir.display().to_string(),
                            "download.prompt_for_download": false,
                            "download.directory_upgrade": true,
                            "safebrowsing.enabled": true
                        }
                    }
                }
            }
        });

        let resp = client
            .post(format!("{}/session", endpoint))
            .json(&capabilities)
            .send()
            .await?;
        let value = read_reply(resp, "new session").await?;

        let session_id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| BrowserError::Driver("new session reply without sessionId".into()))?
            .to_string();

        info!(endpoint = %endpoint, session_id = %session_id, headless, "webdriver session started");

        Ok(WebDriverBrowser {
            client,
            endpoint,
            session_id,
        })
    }

    async fn command(&self, method: Method, path: &str, body: Option<Value>, context: &str) -> Result<Value, BrowserError> {
        let url = format!("{}/session/{}{}", self.endpoint, self.session_id, path);
        debug!(method = %method, path = %path, "webdriver command");

        let mut request = self.client.request(method, &url);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let resp = request.send().await?;
        read_reply(resp, context).await
    }

    async fn locate(&self, path: &str, selector: &Selector) -> Result<Value, BrowserError> {
        let (using, value) = selector.locator();
        self.command(
            Method::POST,
            path,
            Some(json!({ "using": using, "value": value })),
            &selector.to_string(),
        )
        .await
    }
}

async fn read_reply(resp: reqwest::Response, context: &str) -> Result<Value, BrowserError> {
    let status = resp.status();
    let reply: WireReply = resp.json().await?;

    if status.is_success() {
        return Ok(reply.value);
    }

    let error = reply.value.get("error").and_then(Value::as_str).unwrap_or("unknown error");
    let message = reply.value.get("message").and_then(Value::as_str).unwrap_or("");
    Err(classify(error, message, context))
}

/// Map a W3C error code onto the session's error taxonomy.
fn classify(error: &str, message: &str, context: &str) -> BrowserError {
    match error {
        "no such element" => BrowserError::ElementNotFound { selector: context.to_string() },
        "stale element reference" => BrowserError::StaleElement { selector: context.to_string() },
        "timeout" | "script timeout" => BrowserError::Timeout {
            what: context.to_string(),
            after: std::time::Duration::ZERO,
        },
        _ => BrowserError::Driver(format!("{}: {} ({})", error, message, context)),
    }
}

fn element_id(value: &Value) -> Result<ElementId, BrowserError> {
    value
        .get(ELEMENT_KEY)
        .and_then(Value::as_str)
        .map(|id| ElementId(id.to_string()))
        .ok_or_else(|| BrowserError::Driver(format!("reply is not an element: {}", value)))
}

fn element_ref(element: &ElementId) -> Value {
    json!({ ELEMENT_KEY: element.0 })
}

#[async_trait]
impl Browser for WebDriverBrowser {
    async fn goto(&self, url: &str) -> Result<(), BrowserError> {
        self.command(Method::POST, "/url", Some(json!({ "url": url })), url).await?;
        Ok(())
    }

    async fn current_url(&self) -> Result<String, BrowserError> {
        let value = self.command(Method::GET, "/url", None, "current url").await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn find(&self, selector: &Selector) -> Result<ElementId, BrowserError> {
        let value = self.locate("/element", selector).await?;
        element_id(&value)
    }

    async fn find_all(&self, selector: &Selector) -> Result<Vec<ElementId>, BrowserError> {
        let value = self.locate("/elements", selector).await?;
        value
            .as_array()
            .map(|items| items.iter().map(element_id).collect())
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn find_within(&self, parent: &ElementId, selector: &Selector) -> Result<ElementId, BrowserError> {
        let value = self.locate(&format!("/element/{}/element", parent.0), selector).await?;
        element_id(&value)
    }

    async fn click(&self, element: &ElementId) -> Result<(), BrowserError> {
        self.command(Method::POST, &format!("/element/{}/click", element.0), Some(json!({})), &element.0)
            .await?;
        Ok(())
    }

    async fn send_keys(&self, element: &ElementId, text: &str) -> Result<(), BrowserError> {
        self.command(
            Method::POST,
            &format!("/element/{}/value", element.0),
            Some(json!({ "text": text })),
            &element.0,
        )
        .await?;
        Ok(())
    }

    async fn submit(&self, element: &ElementId) -> Result<(), BrowserError> {
        // W3C dropped the submit endpoint; submit the owning form from script
        let script = "const f = arguments[0].form; if (f) { f.requestSubmit ? f.requestSubmit() : f.submit(); }";
        self.command(
            Method::POST,
            "/execute/sync",
            Some(json!({ "script": script, "args": [element_ref(element)] })),
            &element.0,
        )
        .await?;
        Ok(())
    }

    async fn attribute(&self, element: &ElementId, name: &str) -> Result<Option<String>, BrowserError> {
        let value = self
            .command(
                Method::GET,
                &format!("/element/{}/attribute/{}", element.0, urlencoding::encode(name)),
                None,
                &element.0,
            )
            .await?;
        Ok(value.as_str().map(str::to_string))
    }

    async fn text(&self, element: &ElementId) -> Result<String, BrowserError> {
        let value = self
            .command(Method::GET, &format!("/element/{}/text", element.0), None, &element.0)
            .await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn page_source(&self) -> Result<String, BrowserError> {
        let value = self.command(Method::GET, "/source", None, "page source").await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn cookies(&self) -> Result<Vec<Cookie>, BrowserError> {
        let value = self.command(Method::GET, "/cookie", None, "cookies").await?;
        let cookies = value
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|c| {
                        Some(Cookie {
                            name: c.get("name")?.as_str()?.to_string(),
                            value: c.get("value")?.as_str()?.to_string(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(cookies)
    }

    async fn quit(&self) -> Result<(), BrowserError> {
        self.command(Method::DELETE, "", None, "quit").await?;
        info!(session_id = %self.session_id, "webdriver session deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_transient_codes() {
        assert!(classify("no such element", "", "name=email_otp").is_not_found());
        assert!(classify("stale element reference", "", "x").is_transient());
        assert!(classify("timeout", "", "x").is_transient());

        let other = classify("invalid session id", "gone", "x");
        assert!(!other.is_transient());
        assert!(other.to_string().contains("invalid session id"));
    }

    #[test]
    fn test_element_id_extraction() {
        let value = json!({ ELEMENT_KEY: "abc-123" });
        assert_eq!(element_id(&value).unwrap(), ElementId("abc-123".into()));
        assert!(element_id(&json!({ "foo": "bar" })).is_err());
        assert_eq!(element_ref(&ElementId("abc".into()))[ELEMENT_KEY], "abc");
    }
}
