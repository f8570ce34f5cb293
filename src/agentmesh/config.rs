//! Runner configuration.
//!
//! [`RunnerConfig`] gathers every knob the core runtime consumes, with the
//! defaults embedders almost always want. Configs are constructed in code —
//! the crate deliberately pulls in no config-file parsing; a front-end that
//! reads TOML/YAML maps its values onto these structs.
//!
//! [`RunnerConfig::validate`] catches out-of-range values and structurally
//! invalid mixed plans up front, so misconfigurations surface as startup
//! failures rather than mid-dispatch surprises. When embedded in a CLI, the
//! conventional exit codes are `0` for success, `1` for runtime failure,
//! and `2` for configuration errors.
//!
//! # Example
//!
//! ```rust
//! use agentmesh::{OrchestrationMode, RunnerConfig};
//! use std::time::Duration;
//!
//! let mut config = RunnerConfig::default();
//! config.queue_size = 256;
//! config.orchestration.mode = OrchestrationMode::Collaborative;
//! config.orchestration.timeout = Duration::from_secs(10);
//! config.validate().unwrap();
//! ```

use crate::agentmesh::errors::{ErrorCategory, ErrorSeverity};
use crate::agentmesh::orchestrator::MixedPlan;
use crate::agentmesh::retry::RetryPolicy;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default runner queue capacity.
pub const DEFAULT_QUEUE_SIZE: usize = 100;

/// Default worker pool size.
pub const DEFAULT_MAX_CONCURRENT_AGENTS: usize = 10;

/// Default grace period granted to in-flight handlers at shutdown.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Default per-dispatch timeout.
pub const DEFAULT_ORCHESTRATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Default recovery agent name.
pub const DEFAULT_ERROR_HANDLER: &str = "error-handler";

/// A configuration value the core cannot accept.
#[derive(Debug, Clone)]
pub enum ConfigError {
    /// A scalar option is out of range.
    InvalidValue {
        /// The offending option.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },
    /// The mixed plan is structurally invalid.
    InvalidPlan(String),
    /// An enum-style option had an unrecognized value.
    UnknownMode(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidValue { field, reason } => {
                write!(f, "invalid value for '{}': {}", field, reason)
            }
            ConfigError::InvalidPlan(msg) => write!(f, "invalid mixed plan: {}", msg),
            ConfigError::UnknownMode(mode) => {
                write!(f, "unknown orchestration mode '{}'", mode)
            }
        }
    }
}

impl Error for ConfigError {}

/// Which dispatch discipline the runner builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrchestrationMode {
    /// Metadata-selected single agent (the default).
    #[default]
    Route,
    /// All agents in parallel with merged outputs.
    Collaborative,
    /// A declared pipeline.
    Sequential,
    /// One agent iterated to a predicate.
    Loop,
    /// A static plan of groups and segments.
    Mixed,
}

impl OrchestrationMode {
    /// Stable configuration label.
    pub fn as_str(&self) -> &'static str {
        match self {
            OrchestrationMode::Route => "route",
            OrchestrationMode::Collaborative => "collaborative",
            OrchestrationMode::Sequential => "sequential",
            OrchestrationMode::Loop => "loop",
            OrchestrationMode::Mixed => "mixed",
        }
    }
}

impl fmt::Display for OrchestrationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for OrchestrationMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "route" => Ok(OrchestrationMode::Route),
            "collaborative" => Ok(OrchestrationMode::Collaborative),
            "sequential" => Ok(OrchestrationMode::Sequential),
            "loop" => Ok(OrchestrationMode::Loop),
            "mixed" => Ok(OrchestrationMode::Mixed),
            other => Err(ConfigError::UnknownMode(other.to_string())),
        }
    }
}

/// Options consumed by the orchestrator the runner builds.
#[derive(Debug, Clone)]
pub struct OrchestrationConfig {
    /// Which discipline to build.
    pub mode: OrchestrationMode,
    /// Per-dispatch timeout.
    pub timeout: Duration,
    /// Collaborative failure threshold (`0.0..=1.0`).
    pub failure_threshold: f64,
    /// Bounded concurrency inside collaborative dispatches.
    pub concurrency_limit: usize,
    /// Loop iteration ceiling (`1..=100`).
    pub max_iterations: usize,
    /// Participants of a collaborative dispatch. Empty means "all
    /// registered agents".
    pub collaborative_agents: Vec<String>,
    /// Declared pipeline for sequential mode. Empty means registration
    /// order.
    pub sequential_agents: Vec<String>,
    /// The iterated agent for loop mode. `None` means the first registered.
    pub loop_agent: Option<String>,
    /// The plan for mixed mode. Required when `mode` is `Mixed`.
    pub mixed_plan: Option<MixedPlan>,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            mode: OrchestrationMode::Route,
            timeout: DEFAULT_ORCHESTRATION_TIMEOUT,
            failure_threshold: 0.5,
            concurrency_limit: 10,
            max_iterations: 5,
            collaborative_agents: Vec::new(),
            sequential_agents: Vec::new(),
            loop_agent: None,
            mixed_plan: None,
        }
    }
}

/// Circuit-breaker parameters for the error router.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Maximum follow-ups per `(session, category)` inside the window.
    pub threshold: u32,
    /// Sliding window length.
    pub window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            window: Duration::from_secs(60),
        }
    }
}

/// Error-routing policy.
///
/// Absent configuration (the default) leaves routing disabled: failures
/// surface to the trace only.
#[derive(Debug, Clone)]
pub struct ErrorRoutingConfig {
    /// Master switch.
    pub enabled: bool,
    /// Fallback recovery agent.
    pub default_handler: String,
    /// Exact `(category, severity)` → agent mappings.
    pub exact_handlers: HashMap<(ErrorCategory, ErrorSeverity), String>,
    /// Category → agent mappings.
    pub category_handlers: HashMap<ErrorCategory, String>,
    /// Severity → agent mappings.
    pub severity_handlers: HashMap<ErrorSeverity, String>,
    /// Runaway-loop protection.
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for ErrorRoutingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            default_handler: DEFAULT_ERROR_HANDLER.to_string(),
            exact_handlers: HashMap::new(),
            category_handlers: HashMap::new(),
            severity_handlers: HashMap::new(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// Everything the runner consumes.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Event queue capacity. Emitters block while the queue is full.
    pub queue_size: usize,
    /// Worker pool size.
    pub max_concurrent_agents: usize,
    /// How long in-flight handlers get to observe cancellation at shutdown
    /// before their results are discarded.
    pub grace_period: Duration,
    /// Session assigned to events that carry none. Generated when absent.
    pub session_id: Option<String>,
    /// Orchestrator selection and tuning.
    pub orchestration: OrchestrationConfig,
    /// Runner-level retry policy for retryable dispatch failures.
    pub retry: RetryPolicy,
    /// Error-routing policy.
    pub error_routing: ErrorRoutingConfig,
    /// When set, `dump_trace` also writes `<session>.trace.json` here.
    pub trace_dir: Option<PathBuf>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            queue_size: DEFAULT_QUEUE_SIZE,
            max_concurrent_agents: DEFAULT_MAX_CONCURRENT_AGENTS,
            grace_period: DEFAULT_GRACE_PERIOD,
            session_id: None,
            orchestration: OrchestrationConfig::default(),
            retry: RetryPolicy::default(),
            error_routing: ErrorRoutingConfig::default(),
            trace_dir: None,
        }
    }
}

impl RunnerConfig {
    /// Reject out-of-range values and structurally invalid plans.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "queue_size",
                reason: "must be at least 1".into(),
            });
        }
        if self.max_concurrent_agents == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_concurrent_agents",
                reason: "must be at least 1".into(),
            });
        }
        if !(0.0..=1.0).contains(&self.orchestration.failure_threshold) {
            return Err(ConfigError::InvalidValue {
                field: "orchestration.failure_threshold",
                reason: "must be within 0.0..=1.0".into(),
            });
        }
        if self.orchestration.concurrency_limit == 0 {
            return Err(ConfigError::InvalidValue {
                field: "orchestration.concurrency_limit",
                reason: "must be at least 1".into(),
            });
        }
        if self.orchestration.mode == OrchestrationMode::Loop {
            let iterations = self.orchestration.max_iterations;
            if iterations == 0 || iterations > 100 {
                return Err(ConfigError::InvalidValue {
                    field: "orchestration.max_iterations",
                    reason: "must be within 1..=100".into(),
                });
            }
        }
        if self.orchestration.mode == OrchestrationMode::Mixed {
            match &self.orchestration.mixed_plan {
                None => {
                    return Err(ConfigError::InvalidPlan(
                        "mixed mode requires a plan".into(),
                    ))
                }
                Some(plan) => plan
                    .check_structure()
                    .map_err(|e| ConfigError::InvalidPlan(e.to_string()))?,
            }
        }
        Ok(())
    }
}
