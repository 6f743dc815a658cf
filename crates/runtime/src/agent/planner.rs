//! Plan generation
//!
//! Turns a free-form goal into an ordered plan by prompting the LLM with
//! the dataset description and retrieved context. Parsing is defensive:
//! on any failure the planner falls back to a minimal deterministic plan
//! and preserves the raw model output for offline debugging. A run never
//! fails to start because of a malformed plan.

use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

use super::types::{Plan, PlanStep};
use crate::llm::{GenerateRequest, LlmRouter, PromptParts};
use crate::types::{Dataset, UserId};
use crate::vector::{NoteManager, NoteScope, SearchHit};

/// Context entries concatenated into a planning prompt.
const MAX_CONTEXT_ENTRIES: usize = 10;

/// Model-facing JSON contract for plans.
const PLAN_FORMAT: &str = r#"Respond with a single JSON object:
{
  "plan_name": "...",
  "steps": [
    {
      "step_number": 1,
      "tool_name": "descriptive_statistics",
      "description": "...",
      "parameters": {"columns": ["col1"]},
      "expected_output": "..."
    }
  ],
  "estimated_duration": "minutes",
  "complexity": "low|medium|high",
  "confidence": 0.0
}"#;

#[derive(Deserialize)]
struct PlanOutline {
    #[serde(default)]
    plan_name: String,
    steps: Vec<StepOutline>,
    #[serde(default)]
    estimated_duration: String,
    #[serde(default)]
    complexity: String,
    #[serde(default)]
    confidence: f32,
}

#[derive(Deserialize)]
struct StepOutline {
    tool_name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    parameters: Value,
    #[serde(default)]
    expected_output: String,
}

/// Generates plans through the LLM router with retrieved context.
pub struct Planner {
    router: Arc<LlmRouter>,
    notes: Arc<NoteManager>,
}

impl Planner {
    pub fn new(router: Arc<LlmRouter>, notes: Arc<NoteManager>) -> Self {
        Self { router, notes }
    }

    /// Generate a plan for `goal` over `dataset`. Infallible by design:
    /// every failure path degrades to the fallback plan.
    pub async fn generate(&self, dataset: &Dataset, goal: &str, user: UserId) -> (Plan, u64) {
        let rag_context = self.planning_context(dataset, goal, user).await;

        let prompt = format!(
            "Generate an analysis plan for the goal below.\n\n\
             Analysis goal: {}\n\n{}",
            goal, PLAN_FORMAT
        );

        let generation = self
            .router
            .generate(GenerateRequest {
                prompt: &prompt,
                user,
                parts: PromptParts {
                    dataset: Some(dataset),
                    context_messages: &[],
                    analysis_result: None,
                    rag_context: rag_context.as_deref(),
                },
            })
            .await;

        match generation {
            Ok(generation) => {
                let tokens = generation.input_tokens + generation.output_tokens;
                match parse_plan(&generation.text) {
                    Some(plan) => (plan, tokens),
                    None => {
                        tracing::warn!("plan output unparseable, using fallback plan");
                        (fallback_plan(Some(generation.text)), tokens)
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "plan generation failed, using fallback plan");
                (fallback_plan(None), 0)
            }
        }
    }

    /// Gather planning context: short, medium, and long phrasings of the
    /// goal over dataset scope (preferred) and global scope.
    async fn planning_context(
        &self,
        dataset: &Dataset,
        goal: &str,
        user: UserId,
    ) -> Option<String> {
        let short: String = goal.chars().take(50).collect();
        let medium: String = goal.chars().take(120).collect();
        let queries = [
            short,
            format!("analysis {}", medium),
            format!("{} dataset {}", goal, dataset.name),
        ];

        let mut hits: Vec<SearchHit> = Vec::new();
        for query in &queries {
            if let Ok(dataset_hits) = self
                .notes
                .search_text(query, NoteScope::Dataset, Some(dataset.id), Some(user), 3, 0.6)
                .await
            {
                hits.extend(dataset_hits);
            }
        }
        for query in &queries {
            if let Ok(global_hits) = self
                .notes
                .search_text(query, NoteScope::Global, None, Some(user), 2, 0.6)
                .await
            {
                hits.extend(global_hits);
            }
        }

        hits.truncate(MAX_CONTEXT_ENTRIES);
        if hits.is_empty() {
            return None;
        }
        Some(
            hits.iter()
                .map(|hit| format!("- {}: {}", hit.note.title, hit.note.text))
                .collect::<Vec<_>>()
                .join("\n"),
        )
    }
}

/// Parse a model reply into a plan. Tolerates code fences and
/// surrounding prose; returns `None` instead of guessing on malformed
/// output.
pub fn parse_plan(text: &str) -> Option<Plan> {
    let json = extract_json_object(text)?;
    let outline: PlanOutline = serde_json::from_str(&json).ok()?;
    if outline.steps.is_empty() {
        return None;
    }

    // Indexes are re-densified in declaration order: models sometimes
    // skip or repeat step numbers.
    let steps = outline
        .steps
        .into_iter()
        .enumerate()
        .map(|(i, step)| PlanStep {
            index: i as u32 + 1,
            tool_name: step.tool_name,
            description: step.description,
            parameters: step.parameters,
            expected_output: step.expected_output,
        })
        .collect::<Vec<_>>();

    Some(Plan {
        name: if outline.plan_name.is_empty() {
            "Analysis Plan".to_string()
        } else {
            outline.plan_name
        },
        steps,
        estimated_duration: outline.estimated_duration,
        complexity: outline.complexity,
        confidence: outline.confidence.clamp(0.0, 1.0),
        raw_output: None,
        human_feedback: Vec::new(),
    })
}

/// Minimal deterministic plan used when the model's output could not be
/// parsed (or the call failed). The raw output travels with the plan.
pub fn fallback_plan(raw_output: Option<String>) -> Plan {
    Plan {
        name: "Basic Analysis Plan".to_string(),
        steps: vec![PlanStep {
            index: 1,
            tool_name: "descriptive_statistics".to_string(),
            description: "Generate descriptive statistics for all columns".to_string(),
            parameters: Value::Object(serde_json::Map::new()),
            expected_output: "Summary statistics for all columns".to_string(),
        }],
        estimated_duration: "15 minutes".to_string(),
        complexity: "low".to_string(),
        confidence: 0.5,
        raw_output,
        human_feedback: Vec::new(),
    }
}

/// Find the outermost JSON object in possibly fenced, prose-wrapped text.
fn extract_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..start + offset + ch.len_utf8()].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fenced_plan_json() {
        let text = r#"Here is the plan:
```json
{
  "plan_name": "Age Summary",
  "steps": [
    {"step_number": 1, "tool_name": "descriptive_statistics",
     "description": "Summarize age", "parameters": {"columns": ["age"]},
     "expected_output": "mean and spread"}
  ],
  "estimated_duration": "5 minutes",
  "complexity": "low",
  "confidence": 0.9
}
```
Good luck!"#;
        let plan = parse_plan(text).unwrap();
        assert_eq!(plan.name, "Age Summary");
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].tool_name, "descriptive_statistics");
        assert!((plan.confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn densifies_step_indexes() {
        let text = r#"{"steps": [
            {"step_number": 3, "tool_name": "a"},
            {"tool_name": "b"},
            {"step_number": 1, "tool_name": "c"}
        ]}"#;
        let plan = parse_plan(text).unwrap();
        let indexes: Vec<u32> = plan.steps.iter().map(|s| s.index).collect();
        assert_eq!(indexes, vec![1, 2, 3]);
    }

    #[test]
    fn malformed_output_yields_none() {
        assert!(parse_plan("no json here").is_none());
        assert!(parse_plan("{\"steps\": []}").is_none());
        assert!(parse_plan("{\"steps\": [{\"bad\": true}]}").is_none());
    }

    #[test]
    fn fallback_preserves_raw_output() {
        let plan = fallback_plan(Some("gibberish".to_string()));
        assert_eq!(plan.steps.len(), 1);
        assert!(plan.confidence <= 0.5);
        assert_eq!(plan.raw_output.as_deref(), Some("gibberish"));
    }

    #[test]
    fn json_extraction_handles_braces_in_strings() {
        let text = r#"{"steps": [{"tool_name": "t", "description": "use {braces}"}]} trailing"#;
        let plan = parse_plan(text).unwrap();
        assert_eq!(plan.steps[0].description, "use {braces}");
    }
}
