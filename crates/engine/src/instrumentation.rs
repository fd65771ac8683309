//! Network instrumentation scenarios
//!
//! Each scenario shapes the network with a shell command before a pass over
//! the tests and undoes it with its clean command afterwards. Command failures
//! are logged and the pass goes ahead under whatever conditions are in place.

use std::time::Duration;

use kite_common::{InstrumentationConfig, ScenarioConfig};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};

pub struct NetworkInstrumentation {
    scenarios: Vec<ScenarioConfig>,
    command_timeout: Duration,
}

impl NetworkInstrumentation {
    pub fn new(config: &InstrumentationConfig) -> Self {
        Self {
            scenarios: config.scenarios.clone(),
            command_timeout: Duration::from_secs(config.command_timeout),
        }
    }

    /// Passes over the tests one job makes: one per scenario
    pub fn passes(&self) -> usize {
        self.scenarios.len().max(1)
    }

    pub fn scenario(&self, index: usize) -> Option<&ScenarioConfig> {
        self.scenarios.get(index)
    }

    /// Run the command of scenario `index`, returning the scenario name
    pub async fn apply(&self, index: usize) -> Option<String> {
        let scenario = self.scenario(index)?;
        info!("Applying network scenario {}", scenario.name);
        if let Err(e) = run_shell(&scenario.command, self.command_timeout).await {
            warn!("Scenario {} command failed: {}", scenario.name, e);
        }
        Some(scenario.name.clone())
    }

    /// Run the clean command of scenario `index`, if it has one
    pub async fn clean(&self, index: usize) {
        let Some(scenario) = self.scenario(index) else {
            return;
        };
        let Some(command) = &scenario.clean_command else {
            return;
        };
        info!("Cleaning network scenario {}", scenario.name);
        if let Err(e) = run_shell(command, self.command_timeout).await {
            warn!("Scenario {} clean command failed: {}", scenario.name, e);
        }
    }
}

/// Run `command` through `sh -c`, returning its stdout
pub async fn run_shell(command: &str, timeout: Duration) -> EngineResult<String> {
    debug!("Running {}", command);
    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(timeout, child)
        .await
        .map_err(|_| EngineError::Command(format!("{} timed out after {:?}", command, timeout)))??;

    if !output.status.success() {
        return Err(EngineError::Command(format!(
            "{} exited with {}: {}",
            command,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario(name: &str, command: String, clean: Option<String>) -> ScenarioConfig {
        ScenarioConfig {
            name: name.to_string(),
            command,
            clean_command: clean,
        }
    }

    #[tokio::test]
    async fn test_apply_and_clean() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("lossy");
        let instrumentation = NetworkInstrumentation::new(&InstrumentationConfig {
            scenarios: vec![scenario(
                "lossy",
                format!("touch {}", marker.display()),
                Some(format!("rm {}", marker.display())),
            )],
            command_timeout: 5,
        });

        assert_eq!(instrumentation.passes(), 1);
        assert_eq!(instrumentation.apply(0).await.as_deref(), Some("lossy"));
        assert!(marker.exists());
        instrumentation.clean(0).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_failing_command_still_names_scenario() {
        let instrumentation = NetworkInstrumentation::new(&InstrumentationConfig {
            scenarios: vec![scenario("broken", "exit 3".to_string(), None)],
            command_timeout: 5,
        });
        assert_eq!(instrumentation.apply(0).await.as_deref(), Some("broken"));
        instrumentation.clean(0).await;
        assert!(instrumentation.apply(1).await.is_none());
    }

    #[tokio::test]
    async fn test_run_shell() {
        let out = run_shell("echo shaped", Duration::from_secs(5)).await.unwrap();
        assert_eq!(out.trim(), "shaped");

        let err = run_shell("echo oops >&2; exit 2", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("oops"));

        let err = run_shell("sleep 5", Duration::from_millis(100)).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn test_no_scenarios_is_one_pass() {
        let instrumentation = NetworkInstrumentation::new(&InstrumentationConfig::default());
        assert_eq!(instrumentation.passes(), 1);
        assert!(instrumentation.scenario(0).is_none());
    }
}
