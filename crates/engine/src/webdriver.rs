//! W3C WebDriver sessions over HTTP
//!
//! Talks to a Selenium grid hub (or any W3C endpoint) with plain JSON
//! requests. Both the W3C `{"value": {"sessionId": ..}}` and the legacy
//! `{"sessionId": .., "value": ..}` new-session replies are accepted.

use std::time::Duration;

use async_trait::async_trait;
use kite_common::{select_remote, EndpointKind, EndpointSpec, Negotiated, RemoteConfig};
use reqwest::{Method, Url};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::session::{Session, SessionError, SessionFactory};

/// Settings for talking to the grid
#[derive(Debug, Clone)]
pub struct WebDriverConfig {
    /// Grids endpoints without an address of their own are spread over
    pub remotes: Vec<RemoteConfig>,
    /// Hub used when neither the endpoint nor a remote provides one
    pub default_hub: Option<String>,
    /// Budget for session creation, which may queue on the grid
    pub create_timeout: Duration,
    /// Budget for every other command
    pub command_timeout: Duration,
}

impl Default for WebDriverConfig {
    fn default() -> Self {
        Self {
            remotes: Vec::new(),
            default_hub: None,
            create_timeout: Duration::from_secs(300),
            command_timeout: Duration::from_secs(60),
        }
    }
}

/// Creates sessions on a WebDriver grid
pub struct WebDriverSessionFactory {
    client: reqwest::Client,
    config: WebDriverConfig,
}

impl WebDriverSessionFactory {
    pub fn new(config: WebDriverConfig) -> Result<Self, SessionError> {
        let client = reqwest::Client::builder()
            .timeout(config.command_timeout)
            .build()
            .map_err(|e| SessionError::Command(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn hub_for(&self, endpoint: &EndpointSpec) -> Result<Url, SessionError> {
        let remote = match endpoint.remote_address {
            Some(_) => None,
            None => select_remote(&self.config.remotes, endpoint)
                .map(|remote| remote.address())
                .transpose()
                .map_err(|e| SessionError::BadAddress(e.to_string()))?,
        };
        let address = endpoint
            .remote_address
            .as_deref()
            .or(remote.as_deref())
            .or(self.config.default_hub.as_deref())
            .ok_or_else(|| SessionError::NoAddress(endpoint.to_string()))?;

        let url = Url::parse(address).map_err(|_| SessionError::BadAddress(address.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(SessionError::BadAddress(address.to_string()));
        }
        Ok(url)
    }
}

/// Capabilities requested for an endpoint
pub fn capabilities(endpoint: &EndpointSpec, test_name: &str) -> Value {
    let mut caps = Map::new();

    match endpoint.kind {
        EndpointKind::Browser => {
            caps.insert("browserName".into(), json!(endpoint.name));
            if let Some(version) = &endpoint.version {
                caps.insert("browserVersion".into(), json!(version));
            }
            if let Some(platform) = &endpoint.platform {
                caps.insert("platformName".into(), json!(platform));
            }

            let mut args = endpoint.flags.clone();
            if endpoint.headless {
                args.push("--headless".to_string());
            }
            match endpoint.name.to_lowercase().as_str() {
                "chrome" => {
                    args.push("--use-fake-ui-for-media-stream".to_string());
                    args.push("--use-fake-device-for-media-stream".to_string());
                    caps.insert("goog:chromeOptions".into(), json!({ "args": args }));
                }
                "firefox" => {
                    caps.insert(
                        "moz:firefoxOptions".into(),
                        json!({
                            "args": args,
                            "prefs": {
                                "media.navigator.streams.fake": true,
                                "media.navigator.permission.disabled": true
                            }
                        }),
                    );
                }
                _ => {}
            }
        }
        EndpointKind::App => {
            caps.insert("appium:appPackage".into(), json!(endpoint.name));
        }
    }

    if let Some(mobile) = &endpoint.mobile {
        caps.insert("platformName".into(), json!(mobile.platform_name));
        caps.insert("appium:deviceName".into(), json!(mobile.device_name));
        if let Some(version) = &mobile.platform_version {
            caps.insert("appium:platformVersion".into(), json!(version));
        }
    }

    caps.insert("kite:testName".into(), json!(test_name));

    json!({ "capabilities": { "alwaysMatch": Value::Object(caps) } })
}

/// First string value among `keys`, covering W3C and legacy capability names
fn first_text(caps: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| caps.get(*k).and_then(Value::as_str))
        .map(str::to_string)
}

/// Pull the error message out of a WebDriver error reply
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/value/message")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.to_string())
}

#[async_trait]
impl SessionFactory for WebDriverSessionFactory {
    async fn create(
        &self,
        endpoint: &EndpointSpec,
        test_name: &str,
    ) -> Result<Box<dyn Session>, SessionError> {
        let hub = self.hub_for(endpoint)?;
        let url = format!("{}/session", hub.as_str().trim_end_matches('/'));
        let creation_error = |message: String| SessionError::Creation {
            endpoint: endpoint.to_string(),
            message,
        };

        debug!(
            "Requesting {} from {}",
            endpoint,
            hub.host_str().unwrap_or_default()
        );
        let resp = self
            .client
            .post(&url)
            .timeout(self.config.create_timeout)
            .json(&capabilities(endpoint, test_name))
            .send()
            .await
            .map_err(|e| creation_error(e.to_string()))?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| creation_error(e.to_string()))?;
        if !status.is_success() {
            return Err(creation_error(error_message(&body)));
        }

        let reply: Value = serde_json::from_str(&body).map_err(|e| creation_error(e.to_string()))?;
        let (id, caps) = match reply.pointer("/value/sessionId").and_then(Value::as_str) {
            Some(id) => (id.to_string(), reply.pointer("/value/capabilities").cloned()),
            None => match reply.get("sessionId").and_then(Value::as_str) {
                Some(id) => (id.to_string(), reply.get("value").cloned()),
                None => return Err(creation_error("reply carries no session id".to_string())),
            },
        };

        let caps = caps.unwrap_or(Value::Null);
        let negotiated = Negotiated {
            version: first_text(&caps, &["browserVersion", "version"]),
            platform: first_text(&caps, &["platformName", "platform"]),
        };

        info!("Session {} created for {}", id, endpoint);
        Ok(Box::new(WebDriverSession {
            client: self.client.clone(),
            base: format!("{}/{}", url, id),
            id,
            negotiated,
            closed: false,
        }))
    }
}

/// A session on a WebDriver grid
pub struct WebDriverSession {
    client: reqwest::Client,
    base: String,
    id: String,
    negotiated: Negotiated,
    closed: bool,
}

impl WebDriverSession {
    async fn command(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, SessionError> {
        if self.closed {
            return Err(SessionError::Released);
        }

        let url = format!("{}{}", self.base, path);
        let mut request = self.client.request(method, &url);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| SessionError::Command(e.to_string()))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| SessionError::Command(e.to_string()))?;

        if !status.is_success() {
            return Err(SessionError::Command(format!(
                "{} {}: {}",
                status.as_u16(),
                path,
                error_message(&text)
            )));
        }

        let reply: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
        Ok(reply.get("value").cloned().unwrap_or(Value::Null))
    }
}

#[async_trait]
impl Session for WebDriverSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn negotiated(&self) -> Negotiated {
        self.negotiated.clone()
    }

    async fn is_alive(&self) -> bool {
        self.command(Method::GET, "/url", None).await.is_ok()
    }

    async fn navigate(&self, url: &str) -> Result<(), SessionError> {
        self.command(Method::POST, "/url", Some(json!({ "url": url })))
            .await
            .map(|_| ())
    }

    async fn execute_script(&self, script: &str, args: Vec<Value>) -> Result<Value, SessionError> {
        self.command(
            Method::POST,
            "/execute/sync",
            Some(json!({ "script": script, "args": args })),
        )
        .await
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        if self.closed {
            return Ok(());
        }
        let result = self.command(Method::DELETE, "", None).await;
        self.closed = true;
        if let Err(e) = &result {
            warn!("Grid refused to delete session {}: {}", self.id, e);
        }
        result.map(|_| ())
    }
}
