//! KITE Matrix Engine
//!
//! Runs a test script across every tuple of browser endpoints built from a
//! config, with bounded concurrency, session acquisition retries, ramp-up
//! pacing and load-test phase barriers.
//!
//! # Example
//!
//! ```ignore
//! let config = KiteConfig::load(Path::new("interop.json"))?;
//! let test = &config.tests[0];
//! let tuples = matrix::tuples_for(&config, test)?;
//!
//! let factory = Arc::new(WebDriverSessionFactory::new(WebDriverConfig::default())?);
//! let script = ScriptRegistry::with_builtins().resolve(&test.test_impl)?;
//! let ctx = RunContext::new(test.clone(), factory, script, reporter)
//!     .with_endpoints(config.endpoints.clone());
//!
//! let runner = MatrixRunner::new(ctx, tuples)?;
//! let reports = runner.run().await?;
//! ```

pub mod builtin;
pub mod context;
pub mod coordination;
pub mod error;
pub mod instrumentation;
pub mod matrix;
pub mod platform;
pub mod policy;
pub mod reporter;
pub mod runner;
pub mod scheduler;
pub mod script;
pub mod session;
pub mod webdriver;

pub use context::RunContext;
pub use error::{EngineError, EngineResult};
pub use instrumentation::NetworkInstrumentation;
pub use matrix::{build_tuples, tuples_for, tuples_from_matrix};
pub use reporter::{
    CompositeReporter, HttpCallbackReporter, JsonFileReporter, ResultEnvelope, ResultReporter,
    ResultStoreReporter,
};
pub use runner::{DeliveryMode, RunnerOutcome, TestReport, TestRunner};
pub use scheduler::MatrixRunner;
pub use script::{ScriptContext, ScriptError, ScriptRegistry, TestScript};
pub use session::{Session, SessionError, SessionFactory};
pub use webdriver::{WebDriverConfig, WebDriverSessionFactory};
