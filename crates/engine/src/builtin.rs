//! Bundled WebRTC scripts
//!
//! Both scripts read their settings from the test payload:
//!
//! | key                  | default | meaning                                     |
//! |----------------------|---------|---------------------------------------------|
//! | `url`                | none    | page opened in every session                |
//! | `peerConnection`     | `pc`    | global holding the page's RTCPeerConnection |
//! | `connectTimeoutSecs` | 60      | how long to wait for ICE to connect         |
//! | `pollIntervalMs`     | 1000    | delay between state checks                  |
//! | `holdSecs`           | 0       | steady-state duration once load is reached  |
//! | `selectedStats`      | all     | stats report types kept by get-stats        |

use std::time::Duration;

use async_trait::async_trait;
use kite_common::Phase;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use crate::script::{ScriptContext, ScriptError, TestScript};
use crate::session::Session;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageSettings {
    url: Option<String>,
    #[serde(default = "default_peer_connection")]
    peer_connection: String,
    #[serde(default = "default_connect_timeout")]
    connect_timeout_secs: u64,
    #[serde(default = "default_poll_interval")]
    poll_interval_ms: u64,
    #[serde(default)]
    hold_secs: u64,
    #[serde(default)]
    selected_stats: Vec<String>,
}

fn default_peer_connection() -> String {
    "pc".to_string()
}

fn default_connect_timeout() -> u64 {
    60
}

fn default_poll_interval() -> u64 {
    1000
}

impl PageSettings {
    fn from_payload(payload: &Value) -> Result<Self, ScriptError> {
        serde_json::from_value(payload.clone()).map_err(|e| ScriptError::Payload(e.to_string()))
    }
}

const ICE_STATE_SCRIPT: &str =
    "const pc = window[arguments[0]]; return pc ? pc.iceConnectionState : null;";

const GET_STATS_SCRIPT: &str = "const pc = window[arguments[0]]; \
    if (!pc) { return null; } \
    return pc.getStats().then(report => { \
        const out = []; report.forEach(s => out.push(s)); return out; });";

/// Open the page in every session, once per run
async fn open_pages(ctx: &ScriptContext<'_>, settings: &PageSettings) -> Result<(), ScriptError> {
    if ctx.phase == Phase::LoadReached {
        return Ok(());
    }
    let url = settings
        .url
        .as_deref()
        .ok_or_else(|| ScriptError::Payload("missing url".to_string()))?;

    for session in ctx.sessions {
        debug!("Session {} opening {}", session.id(), url);
        session.navigate(url).await?;
    }
    Ok(())
}

async fn wait_for_connection(
    session: &dyn Session,
    settings: &PageSettings,
) -> Result<String, ScriptError> {
    let deadline = Instant::now() + Duration::from_secs(settings.connect_timeout_secs);
    let mut last = String::from("unknown");

    loop {
        let state = session
            .execute_script(ICE_STATE_SCRIPT, vec![json!(settings.peer_connection)])
            .await?;
        if let Some(state) = state.as_str() {
            last = state.to_string();
        }

        match last.as_str() {
            "connected" | "completed" => return Ok(last),
            "failed" | "closed" => {
                return Err(ScriptError::Assertion(format!(
                    "session {} ICE state is {}",
                    session.id(),
                    last
                )))
            }
            _ => {}
        }

        if Instant::now() >= deadline {
            return Err(ScriptError::Assertion(format!(
                "session {} did not connect within {}s (last state {})",
                session.id(),
                settings.connect_timeout_secs,
                last
            )));
        }
        sleep(Duration::from_millis(settings.poll_interval_ms)).await;
    }
}

/// Hold the sessions open for the steady-state period
async fn hold(ctx: &ScriptContext<'_>, settings: &PageSettings) -> Result<(), ScriptError> {
    if ctx.phase != Phase::LoadReached || settings.hold_secs == 0 {
        return Ok(());
    }
    let deadline = Instant::now() + Duration::from_secs(settings.hold_secs);
    while Instant::now() < deadline {
        for session in ctx.sessions {
            if !session.is_alive().await {
                return Err(ScriptError::Failed(format!(
                    "session {} died during steady state",
                    session.id()
                )));
            }
        }
        sleep(Duration::from_millis(settings.poll_interval_ms)).await;
    }
    Ok(())
}

/// Waits until every session's peer connection reports connected
pub struct IceConnectionScript;

#[async_trait]
impl TestScript for IceConnectionScript {
    async fn run(&self, ctx: ScriptContext<'_>) -> Result<Value, ScriptError> {
        let settings = PageSettings::from_payload(ctx.payload)?;
        open_pages(&ctx, &settings).await?;
        hold(&ctx, &settings).await?;

        let mut states = Vec::with_capacity(ctx.sessions.len());
        for (session, endpoint) in ctx.sessions.iter().zip(ctx.tuple.iter()) {
            let state = wait_for_connection(session.as_ref(), &settings).await?;
            states.push(json!({
                "session": session.id(),
                "endpoint": endpoint.label(),
                "iceConnectionState": state,
            }));
        }

        info!("{}: all {} peer(s) connected", ctx.tuple.label(), states.len());
        Ok(json!({ "result": "SUCCESSFUL", "sessions": states }))
    }
}

/// Collects getStats() reports from every session
pub struct GetStatsScript;

#[async_trait]
impl TestScript for GetStatsScript {
    async fn run(&self, ctx: ScriptContext<'_>) -> Result<Value, ScriptError> {
        let settings = PageSettings::from_payload(ctx.payload)?;
        open_pages(&ctx, &settings).await?;
        hold(&ctx, &settings).await?;

        let mut collected = Vec::with_capacity(ctx.sessions.len());
        for (session, endpoint) in ctx.sessions.iter().zip(ctx.tuple.iter()) {
            wait_for_connection(session.as_ref(), &settings).await?;

            let report = session
                .execute_script(GET_STATS_SCRIPT, vec![json!(settings.peer_connection)])
                .await?;
            let stats = select_stats(report, &settings.selected_stats);
            collected.push(json!({
                "session": session.id(),
                "endpoint": endpoint.label(),
                "stats": stats,
            }));
        }
        Ok(json!({ "result": "SUCCESSFUL", "stats": collected }))
    }
}

/// Keep the reports whose `type` is selected; everything when none are
fn select_stats(report: Value, selected: &[String]) -> Value {
    match report {
        Value::Array(entries) if !selected.is_empty() => Value::Array(
            entries
                .into_iter()
                .filter(|entry| {
                    entry
                        .get("type")
                        .and_then(Value::as_str)
                        .map(|t| selected.iter().any(|s| s == t))
                        .unwrap_or(false)
                })
                .collect(),
        ),
        other => other,
    }
}
