//! Shared fixtures for integration tests

// Each integration test binary compiles this module separately and uses
// a different subset of it.
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;

use datalyst_runtime::config::Config;
use datalyst_runtime::tools::{ToolCategory, ToolHandler, ToolInvocation, ToolOutput, ToolSpec};
use datalyst_runtime::types::{
    ColumnKind, Dataset, DatasetColumn, LlmError, OutputType, ToolError, UserId,
};
use datalyst_runtime::{
    AnalyticsRuntime, DatasetUpload, LlmProvider, ParamSchema, ProviderReply,
};

/// Provider that replays scripted replies, then repeats the last one.
pub struct ScriptedProvider {
    replies: Mutex<VecDeque<String>>,
    fallback: String,
}

impl ScriptedProvider {
    pub fn new(replies: Vec<String>) -> Self {
        let fallback = replies
            .last()
            .cloned()
            .unwrap_or_else(|| "ok".to_string());
        Self {
            replies: Mutex::new(replies.into()),
            fallback,
        }
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn probe(&self) -> Result<(), LlmError> {
        Ok(())
    }

    async fn generate(&self, _prompt: &str) -> Result<ProviderReply, LlmError> {
        let next = self
            .replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        Ok(ProviderReply::PlainText(next))
    }
}

/// Handler standing in for the descriptive-statistics leaf: returns a
/// fixed numeric summary of the requested columns.
pub struct StatsHandler;

#[async_trait]
impl ToolHandler for StatsHandler {
    async fn run(&self, invocation: ToolInvocation) -> Result<ToolOutput, ToolError> {
        let columns: Vec<String> = invocation
            .parameters
            .get("columns")
            .and_then(|c| c.as_array())
            .map(|cols| {
                cols.iter()
                    .filter_map(|c| c.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_else(|| vec!["age".to_string()]);

        let rows: Vec<serde_json::Value> = columns
            .iter()
            .map(|column| json!({ "column": column, "mean": 41.5, "std": 12.3, "count": 200 }))
            .collect();

        Ok(ToolOutput {
            output_type: OutputType::Table,
            data: json!({ "data": rows }),
            summary: format!("mean of {} is 41.5 (n=200)", columns.join(", ")),
            tokens_used: 0,
        })
    }
}

/// JSON plan with one `descriptive_statistics` step per entry in
/// `descriptions`.
pub fn plan_json(descriptions: &[&str]) -> String {
    let steps: Vec<serde_json::Value> = descriptions
        .iter()
        .enumerate()
        .map(|(i, description)| {
            json!({
                "step_number": i + 1,
                "tool_name": "descriptive_statistics",
                "description": description,
                "parameters": { "columns": ["age"] },
                "expected_output": "summary statistics"
            })
        })
        .collect();
    json!({
        "plan_name": "Scenario Plan",
        "steps": steps,
        "estimated_duration": "5 minutes",
        "complexity": "low",
        "confidence": 0.9
    })
    .to_string()
}

pub struct Fixture {
    pub runtime: Arc<AnalyticsRuntime>,
    pub user: UserId,
    pub dataset: Dataset,
    _media: tempfile::TempDir,
}

/// Assemble a runtime around a scripted provider, one user with a
/// 100k-token quota, and a 200-row dataset with `{age: numeric,
/// city: categorical}`.
pub async fn fixture(provider_replies: Vec<String>) -> Fixture {
    let media = tempfile::tempdir().expect("tempdir");
    let mut config = Config::default();
    config.storage.media_root = media.path().to_path_buf();
    config.sandbox.work_root = media.path().join("sandbox");

    let provider = Arc::new(ScriptedProvider::new(provider_replies));
    let runtime = AnalyticsRuntime::with_provider(config, provider).expect("runtime");

    let user = UserId::new();
    runtime.accountant.ensure(user);
    runtime.accountant.set_quota(user, 100_000);

    let dataset = runtime
        .datasets
        .register(
            user,
            DatasetUpload {
                name: "people",
                origin_format: "csv",
                payload: b"age,city\n34,berlin\n49,lagos\n",
                row_count: 200,
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
            },
        )
        .await
        .expect("dataset");

    let mut spec = ToolSpec::new("descriptive_statistics", ToolCategory::Descriptive);
    spec.description = "Summary statistics per column".to_string();
    spec.params.insert(
        "columns".to_string(),
        ParamSchema::array_of(ParamSchema::string()),
    );
    spec.optional = vec!["columns".to_string()];
    runtime.tools.register(spec, Arc::new(StatsHandler));

    Fixture {
        runtime,
        user,
        dataset,
        _media: media,
    }
}
