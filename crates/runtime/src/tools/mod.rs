//! Tool registry
//!
//! Name-to-handler lookup with data-driven parameter validation,
//! dataset-shape preconditions, and atomic usage statistics. Categories
//! are informational only; dispatch never depends on them.

pub mod schema;

pub use schema::{ParamKind, ParamSchema};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::types::{
    ColumnKind, CorrelationId, Dataset, OutputType, SessionId, ToolError, UserId,
};

/// Informational tool category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    Descriptive,
    Inferential,
    Regression,
    Clustering,
    Classification,
    TimeSeries,
    Visualization,
    DataQuality,
    Survival,
    Custom,
}

impl ToolCategory {
    pub fn all() -> &'static [ToolCategory] {
        &[
            ToolCategory::Descriptive,
            ToolCategory::Inferential,
            ToolCategory::Regression,
            ToolCategory::Clustering,
            ToolCategory::Classification,
            ToolCategory::TimeSeries,
            ToolCategory::Visualization,
            ToolCategory::DataQuality,
            ToolCategory::Survival,
            ToolCategory::Custom,
        ]
    }
}

/// Registered description of a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Globally unique name; dispatch key.
    pub name: String,
    pub display: String,
    pub description: String,
    pub category: ToolCategory,
    pub params: HashMap<String, ParamSchema>,
    pub required: Vec<String>,
    pub optional: Vec<String>,
    pub is_active: bool,
    pub is_premium: bool,
    /// Dataset-shape preconditions.
    pub min_cols: u64,
    pub max_cols: Option<u64>,
    pub min_rows: u64,
    pub max_rows: Option<u64>,
    pub required_col_types: Vec<ColumnKind>,
    pub output_types: Vec<OutputType>,
    /// Per-invocation resource hints.
    pub timeout_s: u64,
    pub memory_mb: u64,
    /// Whether a failure of this tool escalates to run failure.
    pub critical: bool,
}

impl ToolSpec {
    /// Minimal active spec; callers adjust fields as needed.
    pub fn new(name: impl Into<String>, category: ToolCategory) -> Self {
        let name = name.into();
        Self {
            display: name.clone(),
            description: String::new(),
            name,
            category,
            params: HashMap::new(),
            required: Vec::new(),
            optional: Vec::new(),
            is_active: true,
            is_premium: false,
            min_cols: 1,
            max_cols: None,
            min_rows: 1,
            max_rows: None,
            required_col_types: Vec::new(),
            output_types: vec![OutputType::Table],
            timeout_s: 60,
            memory_mb: 256,
            critical: false,
        }
    }
}

/// Everything a handler needs for one invocation.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub tool: String,
    pub parameters: Value,
    pub caller: UserId,
    pub dataset: Option<Dataset>,
    pub session: Option<SessionId>,
    pub correlation_id: Option<CorrelationId>,
    /// Retrieved context relevant to this invocation, when the caller
    /// assembled any.
    pub context: Option<String>,
}

/// What a handler returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    pub output_type: OutputType,
    pub data: Value,
    /// One-line summary used as the agent step observation.
    pub summary: String,
    /// LLM tokens the handler itself consumed, when it called one.
    #[serde(default)]
    pub tokens_used: u64,
}

/// A registered analytical operation.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn run(&self, invocation: ToolInvocation) -> Result<ToolOutput, ToolError>;
}

/// Rolling usage statistics for one tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolUsage {
    pub count: u64,
    pub successes: u64,
    pub errors: u64,
    pub avg_wall_ms: f64,
    pub last_used: Option<DateTime<Utc>>,
}

struct RegisteredTool {
    spec: ToolSpec,
    handler: Arc<dyn ToolHandler>,
    usage: Mutex<ToolUsage>,
}

/// Name → handler registry.
#[derive(Default)]
pub struct ToolRegistry {
    tools: DashMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert a tool by name. Re-registering replaces the spec and
    /// handler but keeps accumulated usage statistics.
    pub fn register(&self, spec: ToolSpec, handler: Arc<dyn ToolHandler>) {
        let name = spec.name.clone();
        match self.tools.get_mut(&name) {
            Some(mut existing) => {
                existing.spec = spec;
                existing.handler = handler;
            }
            None => {
                self.tools.insert(
                    name.clone(),
                    RegisteredTool {
                        spec,
                        handler,
                        usage: Mutex::new(ToolUsage::default()),
                    },
                );
            }
        }
        tracing::debug!(tool = %name, "tool registered");
    }

    /// Active tools only; inactive registrations are invisible here.
    pub fn lookup(&self, name: &str) -> Option<ToolSpec> {
        self.tools
            .get(name)
            .filter(|t| t.spec.is_active)
            .map(|t| t.spec.clone())
    }

    pub fn deactivate(&self, name: &str) -> bool {
        match self.tools.get_mut(name) {
            Some(mut tool) => {
                tool.spec.is_active = false;
                true
            }
            None => false,
        }
    }

    /// Validate parameters and dataset-shape preconditions against a
    /// spec. Returns every problem found, not just the first.
    pub fn validate(
        spec: &ToolSpec,
        parameters: &Value,
        dataset: Option<&Dataset>,
    ) -> Result<(), ToolError> {
        let mut errors = Vec::new();

        // A null parameter bag is treated as empty.
        let empty = serde_json::Map::new();
        let object = match parameters.as_object() {
            Some(object) => object,
            None if parameters.is_null() => &empty,
            None => {
                return Err(ToolError::InvalidInput {
                    errors: vec!["parameters must be an object".to_string()],
                })
            }
        };

        for required in &spec.required {
            if !object.contains_key(required) {
                errors.push(format!("missing required parameter '{}'", required));
            }
        }

        for (name, value) in object {
            match spec.params.get(name) {
                Some(param_schema) => {
                    schema::validate_value(name, value, param_schema, &mut errors)
                }
                None => errors.push(format!("unknown parameter '{}'", name)),
            }
        }

        if !errors.is_empty() {
            return Err(ToolError::InvalidInput { errors });
        }

        if let Some(dataset) = dataset {
            if dataset.column_count < spec.min_cols {
                return Err(ToolError::PreconditionFailed(format!(
                    "needs at least {} columns, dataset has {}",
                    spec.min_cols, dataset.column_count
                )));
            }
            if let Some(max_cols) = spec.max_cols {
                if dataset.column_count > max_cols {
                    return Err(ToolError::PreconditionFailed(format!(
                        "needs at most {} columns, dataset has {}",
                        max_cols, dataset.column_count
                    )));
                }
            }
            if dataset.row_count < spec.min_rows {
                return Err(ToolError::PreconditionFailed(format!(
                    "needs at least {} rows, dataset has {}",
                    spec.min_rows, dataset.row_count
                )));
            }
            if let Some(max_rows) = spec.max_rows {
                if dataset.row_count > max_rows {
                    return Err(ToolError::PreconditionFailed(format!(
                        "needs at most {} rows, dataset has {}",
                        max_rows, dataset.row_count
                    )));
                }
            }
            for required_kind in &spec.required_col_types {
                if !dataset.columns.iter().any(|c| c.kind == *required_kind) {
                    return Err(ToolError::PreconditionFailed(format!(
                        "needs a {} column",
                        required_kind
                    )));
                }
            }
        }

        Ok(())
    }

    /// Validate, dispatch, and record usage. Statistics are updated even
    /// when the handler fails; the handler's result is surfaced
    /// unchanged.
    pub async fn invoke(
        &self,
        invocation: ToolInvocation,
        deadline: Option<Duration>,
    ) -> Result<ToolOutput, ToolError> {
        let name = invocation.tool.clone();
        let (spec, handler) = {
            let tool = self
                .tools
                .get(&name)
                .filter(|t| t.spec.is_active)
                .ok_or_else(|| ToolError::UnknownTool(name.clone()))?;
            (tool.spec.clone(), Arc::clone(&tool.handler))
        };

        Self::validate(&spec, &invocation.parameters, invocation.dataset.as_ref())?;

        let budget = Duration::from_secs(spec.timeout_s);
        let effective = deadline.map_or(budget, |d| d.min(budget));

        let started = std::time::Instant::now();
        let result = match tokio::time::timeout(effective, handler.run(invocation)).await {
            Ok(result) => result,
            Err(_) => Err(ToolError::HandlerFailed {
                tool: name.clone(),
                reason: format!("timed out after {:?}", effective),
            }),
        };
        let wall_ms = started.elapsed().as_millis() as u64;

        self.record_usage(&name, result.is_ok(), wall_ms);
        result
    }

    fn record_usage(&self, name: &str, success: bool, wall_ms: u64) {
        if let Some(tool) = self.tools.get(name) {
            let mut usage = tool.usage.lock();
            usage.count += 1;
            if success {
                usage.successes += 1;
            } else {
                usage.errors += 1;
            }
            // Race-free under the lock: rolling average over count samples.
            usage.avg_wall_ms =
                ((usage.count - 1) as f64 * usage.avg_wall_ms + wall_ms as f64) / usage.count as f64;
            usage.last_used = Some(Utc::now());
        }
    }

    /// Case-insensitive substring search over active tools.
    pub fn search(&self, query: &str, category: Option<ToolCategory>) -> Vec<ToolSpec> {
        let needle = query.to_lowercase();
        let mut specs: Vec<ToolSpec> = self
            .tools
            .iter()
            .filter(|t| t.spec.is_active)
            .filter(|t| category.map_or(true, |c| t.spec.category == c))
            .filter(|t| {
                t.spec.name.to_lowercase().contains(&needle)
                    || t.spec.display.to_lowercase().contains(&needle)
                    || t.spec.description.to_lowercase().contains(&needle)
            })
            .map(|t| t.spec.clone())
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    /// Active tool counts per category.
    pub fn categories(&self) -> HashMap<ToolCategory, usize> {
        let mut counts = HashMap::new();
        for tool in self.tools.iter().filter(|t| t.spec.is_active) {
            *counts.entry(tool.spec.category).or_insert(0) += 1;
        }
        counts
    }

    /// Usage statistics, for one tool or all of them.
    pub fn usage_stats(&self, name: Option<&str>) -> HashMap<String, ToolUsage> {
        match name {
            Some(name) => self
                .tools
                .get(name)
                .map(|t| {
                    let mut map = HashMap::new();
                    map.insert(name.to_string(), t.usage.lock().clone());
                    map
                })
                .unwrap_or_default(),
            None => self
                .tools
                .iter()
                .map(|t| (t.key().clone(), t.usage.lock().clone()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DatasetColumn;
    use serde_json::json;

    struct EchoHandler;

    #[async_trait]
    impl ToolHandler for EchoHandler {
        async fn run(&self, invocation: ToolInvocation) -> Result<ToolOutput, ToolError> {
            Ok(ToolOutput {
                output_type: OutputType::Table,
                data: invocation.parameters,
                summary: "echoed".to_string(),
                tokens_used: 0,
            })
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl ToolHandler for FailingHandler {
        async fn run(&self, invocation: ToolInvocation) -> Result<ToolOutput, ToolError> {
            Err(ToolError::HandlerFailed {
                tool: invocation.tool,
                reason: "boom".to_string(),
            })
        }
    }

    fn stats_spec() -> ToolSpec {
        let mut spec = ToolSpec::new("descriptive_statistics", ToolCategory::Descriptive);
        spec.params.insert(
            "columns".to_string(),
            ParamSchema::array_of(ParamSchema::string()),
        );
        spec.required = vec!["columns".to_string()];
        spec.required_col_types = vec![ColumnKind::Numeric];
        spec
    }

    fn inv(tool: &str, parameters: Value, dataset: Option<Dataset>) -> ToolInvocation {
        ToolInvocation {
            tool: tool.to_string(),
            parameters,
            caller: UserId::new(),
            dataset,
            session: None,
            correlation_id: None,
            context: None,
        }
    }

    fn dataset(rows: u64) -> Dataset {
        Dataset {
            id: crate::types::DatasetId::new(),
            owner: UserId::new(),
            name: "people".to_string(),
            origin_format: "csv".to_string(),
            content_hash: "h".to_string(),
            storage_path: "datasets/x/h".to_string(),
            row_count: rows,
            column_count: 2,
            columns: vec![
                DatasetColumn {
                    name: "age".to_string(),
                    kind: ColumnKind::Numeric,
                },
                DatasetColumn {
                    name: "city".to_string(),
                    kind: ColumnKind::Categorical,
                },
            ],
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn invoke_validates_and_dispatches() {
        let registry = ToolRegistry::new();
        registry.register(stats_spec(), Arc::new(EchoHandler));

        let output = registry
            .invoke(
                inv("descriptive_statistics", json!({"columns": ["age"]}), Some(dataset(200))),
                None,
            )
            .await
            .unwrap();
        assert_eq!(output.summary, "echoed");

        let err = registry
            .invoke(
                inv("descriptive_statistics", json!({"columns": [1]}), Some(dataset(200))),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidInput { .. }));
    }

    #[tokio::test]
    async fn unknown_and_inactive_tools_are_invisible() {
        let registry = ToolRegistry::new();
        assert!(matches!(
            registry.invoke(inv("missing", json!({}), None), None).await,
            Err(ToolError::UnknownTool(_))
        ));

        registry.register(stats_spec(), Arc::new(EchoHandler));
        assert!(registry.lookup("descriptive_statistics").is_some());
        assert!(registry.deactivate("descriptive_statistics"));
        assert!(registry.lookup("descriptive_statistics").is_none());
    }

    #[tokio::test]
    async fn usage_stats_update_even_on_failure() {
        let registry = ToolRegistry::new();
        let mut spec = ToolSpec::new("flaky", ToolCategory::Custom);
        spec.min_cols = 0;
        spec.min_rows = 0;
        registry.register(spec, Arc::new(FailingHandler));

        let _ = registry.invoke(inv("flaky", json!({}), None), None).await;
        let stats = registry.usage_stats(Some("flaky"));
        let usage = &stats["flaky"];
        assert_eq!(usage.count, 1);
        assert_eq!(usage.errors, 1);
        assert!(usage.last_used.is_some());
    }

    #[tokio::test]
    async fn dataset_shape_preconditions_hold() {
        let registry = ToolRegistry::new();
        let mut spec = stats_spec();
        spec.min_rows = 100;
        registry.register(spec, Arc::new(EchoHandler));

        let err = registry
            .invoke(
                inv("descriptive_statistics", json!({"columns": ["age"]}), Some(dataset(10))),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::PreconditionFailed(_)));
    }

    #[test]
    fn rolling_average_is_exact() {
        let registry = ToolRegistry::new();
        let mut spec = ToolSpec::new("t", ToolCategory::Custom);
        spec.min_cols = 0;
        spec.min_rows = 0;
        registry.register(spec, Arc::new(EchoHandler));
        registry.record_usage("t", true, 100);
        registry.record_usage("t", true, 200);
        registry.record_usage("t", false, 600);
        let usage = registry.usage_stats(Some("t"))["t"].clone();
        assert_eq!(usage.count, 3);
        assert!((usage.avg_wall_ms - 300.0).abs() < 1e-9);
    }
}
