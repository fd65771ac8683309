//! Core types for KITE

use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};

/// Kind of participant in a test tuple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    #[default]
    Browser,
    App,
}

impl std::fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointKind::Browser => write!(f, "browser"),
            EndpointKind::App => write!(f, "app"),
        }
    }
}

/// Mobile device description for app endpoints or mobile browsers
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MobileSpec {
    pub device_name: String,
    pub platform_name: String,
    #[serde(default)]
    pub platform_version: Option<String>,
}

/// Capabilities reported by the grid once a session exists
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Negotiated {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
}

/// One participant of a test: a browser or a mobile app.
///
/// Equality and hashing only consider the identity fields
/// (kind, name, version, platform, mobile). Grid routing, flags and the
/// negotiated record are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSpec {
    #[serde(default)]
    pub kind: EndpointKind,

    /// Browser name, or app package for app endpoints
    #[serde(alias = "browserName", alias = "app")]
    pub name: String,

    #[serde(default)]
    pub version: Option<String>,

    #[serde(default)]
    pub platform: Option<String>,

    #[serde(default)]
    pub mobile: Option<MobileSpec>,

    /// Extra command line flags passed to the browser
    #[serde(default)]
    pub flags: Vec<String>,

    #[serde(default)]
    pub headless: bool,

    /// Grid hub for this endpoint, overriding the config-wide address
    #[serde(default)]
    pub remote_address: Option<String>,

    /// Filled in by the runner that owns this copy
    #[serde(skip)]
    pub negotiated: Negotiated,
}

impl EndpointSpec {
    pub fn browser(name: impl Into<String>) -> Self {
        Self {
            kind: EndpointKind::Browser,
            name: name.into(),
            version: None,
            platform: None,
            mobile: None,
            flags: Vec::new(),
            headless: false,
            remote_address: None,
            negotiated: Negotiated::default(),
        }
    }

    pub fn app(package: impl Into<String>, mobile: MobileSpec) -> Self {
        Self {
            kind: EndpointKind::App,
            mobile: Some(mobile),
            ..Self::browser(package)
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }

    pub fn with_remote_address(mut self, address: impl Into<String>) -> Self {
        self.remote_address = Some(address.into());
        self
    }

    /// Short label such as `LIN_ch_70`
    pub fn label(&self) -> String {
        let platform = self
            .mobile
            .as_ref()
            .map(|m| m.platform_name.as_str())
            .or(self.platform.as_deref())
            .unwrap_or("ANY");
        let mut label = format!(
            "{}_{}",
            prefix(&platform.to_uppercase(), 3),
            prefix(&self.name, 2)
        );
        match self.kind {
            EndpointKind::Browser => {
                if let Some(version) = &self.version {
                    label.push('_');
                    label.push_str(version);
                }
            }
            EndpointKind::App => {
                if let Some(mobile) = &self.mobile {
                    label = format!(
                        "{}_{}",
                        prefix(&platform.to_uppercase(), 3),
                        prefix(&mobile.device_name, 2)
                    );
                }
            }
        }
        label
    }

    fn identity(
        &self,
    ) -> (
        EndpointKind,
        &str,
        Option<&str>,
        Option<&str>,
        Option<&MobileSpec>,
    ) {
        (
            self.kind,
            self.name.as_str(),
            self.version.as_deref(),
            self.platform.as_deref(),
            self.mobile.as_ref(),
        )
    }
}

fn prefix(value: &str, len: usize) -> &str {
    match value.char_indices().nth(len) {
        Some((idx, _)) => &value[..idx],
        None => value,
    }
}

impl PartialEq for EndpointSpec {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for EndpointSpec {}

impl Hash for EndpointSpec {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

impl std::fmt::Display for EndpointSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)?;
        if let Some(version) = &self.version {
            write!(f, " {}", version)?;
        }
        if let Some(platform) = &self.platform {
            write!(f, " ({})", platform)?;
        }
        if let Some(mobile) = &self.mobile {
            write!(f, " [{}]", mobile.device_name)?;
        }
        Ok(())
    }
}

/// Ordered group of endpoints tested together
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tuple {
    pub id: usize,
    pub endpoints: Vec<EndpointSpec>,
}

impl Tuple {
    pub fn new(id: usize, endpoints: Vec<EndpointSpec>) -> Self {
        Self { id, endpoints }
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, EndpointSpec> {
        self.endpoints.iter()
    }

    /// Test case name built from the endpoint labels, e.g. `LIN_ch_70-WIN_fi_63`
    pub fn label(&self) -> String {
        self.endpoints
            .iter()
            .map(EndpointSpec::label)
            .collect::<Vec<_>>()
            .join("-")
    }
}

impl std::ops::Index<usize> for Tuple {
    type Output = EndpointSpec;

    fn index(&self, index: usize) -> &Self::Output {
        &self.endpoints[index]
    }
}

/// Execution stage of a test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Default,
    RampUp,
    LoadReached,
}

impl Phase {
    /// Phases of a run, in execution order. The last one is terminal.
    pub fn for_run(load_test: bool) -> Vec<Phase> {
        if load_test {
            vec![Phase::RampUp, Phase::LoadReached]
        } else {
            vec![Phase::Default]
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Phase::Default => "DEFAULT",
            Phase::RampUp => "RAMPUP",
            Phase::LoadReached => "LOADREACHED",
        }
    }

    pub fn short_name(&self) -> &'static str {
        match self {
            Phase::Default => "DF",
            Phase::RampUp => "RU",
            Phase::LoadReached => "LR",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Final result of one tuple
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum TestOutcome {
    /// The script completed and returned a payload
    Success(serde_json::Value),
    /// The script raised an error or exceeded its time budget
    ScriptFailure(String),
    /// Sessions could not be acquired from the grid
    GridFailure(String),
    /// The run was interrupted or hit its deadline before a result existed
    Aborted(String),
}

impl TestOutcome {
    pub fn kind(&self) -> &'static str {
        match self {
            TestOutcome::Success(_) => "success",
            TestOutcome::ScriptFailure(_) => "script_failure",
            TestOutcome::GridFailure(_) => "grid_failure",
            TestOutcome::Aborted(_) => "aborted",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TestOutcome::Success(_))
    }

    /// Payload as it appears in a result envelope
    pub fn payload(&self) -> serde_json::Value {
        match self {
            TestOutcome::Success(value) => value.clone(),
            TestOutcome::ScriptFailure(msg)
            | TestOutcome::GridFailure(msg)
            | TestOutcome::Aborted(msg) => serde_json::Value::String(msg.clone()),
        }
    }

    /// Error text, if the outcome is not a success
    pub fn message(&self) -> Option<&str> {
        match self {
            TestOutcome::Success(_) => None,
            TestOutcome::ScriptFailure(msg)
            | TestOutcome::GridFailure(msg)
            | TestOutcome::Aborted(msg) => Some(msg),
        }
    }
}

/// Lifecycle of one scheduler run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Created,
    Running,
    Completed,
    Interrupted,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Interrupted)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Created => write!(f, "created"),
            RunState::Running => write!(f, "running"),
            RunState::Completed => write!(f, "completed"),
            RunState::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// Counts per outcome kind for a finished batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub run_id: String,
    pub test_name: String,
    pub state: RunState,
    pub total: usize,
    pub passed: usize,
    pub script_failures: usize,
    pub grid_failures: usize,
    pub aborted: usize,
    pub duration_ms: u64,
}

impl BatchSummary {
    pub fn record(&mut self, outcome: &TestOutcome) {
        self.total += 1;
        match outcome {
            TestOutcome::Success(_) => self.passed += 1,
            TestOutcome::ScriptFailure(_) => self.script_failures += 1,
            TestOutcome::GridFailure(_) => self.grid_failures += 1,
            TestOutcome::Aborted(_) => self.aborted += 1,
        }
    }
}
