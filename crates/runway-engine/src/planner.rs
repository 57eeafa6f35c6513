//! Heuristic planner and tool-intent matching
//!
//! The default [`Planner`] implementation: a rule-based plan classifier plus
//! regex intent matching for the built-in tools. Model-backed planners plug
//! in through the same trait.

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use runway_core::{ChatMode, PlanType, RunState};
use serde_json::json;

use crate::collab::{PlanDecision, PlanError, Planner, ToolSelection};
use crate::tools::ToolDescriptor;

fn regex(pattern: &'static str, cell: &'static OnceLock<Regex>) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("static pattern compiles"))
}

fn symbol_expr() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    regex(r"(-?\d+(?:\.\d+)?)\s*([+\-*/])\s*(-?\d+(?:\.\d+)?)", &CELL)
}

fn repo_url() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    regex(r"github\.com/(?P<repo>[A-Za-z0-9_.-]+/[A-Za-z0-9_.-]+)", &CELL)
}

fn repo_keyword() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    regex(
        r"(?i)(?:repo|repository)\s+(?P<repo>[A-Za-z0-9_.-]+/[A-Za-z0-9_.-]+)",
        &CELL,
    )
}

fn file_hint() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    regex(
        r"(?i)file\s+(?:at\s+|from\s+)?(?P<path>[A-Za-z0-9_.\-/]+)",
        &CELL,
    )
}

/// Rule-based planner mirroring the pipeline's default policy.
pub struct HeuristicPlanner;

impl HeuristicPlanner {
    pub fn new() -> Self {
        Self
    }

    fn choose_plan(state: &RunState) -> (PlanType, String) {
        let message = state.message.trim();
        if message.is_empty() {
            return (PlanType::CannotAnswer, "empty message".to_string());
        }
        if message.len() < 6 {
            return (PlanType::NeedsClarification, "very short message".to_string());
        }
        if state.mode == ChatMode::Research && state.context.is_none() {
            return (
                PlanType::NeedsClarification,
                "research mode without context".to_string(),
            );
        }
        let lowered = message.to_lowercase();
        if ["illegal", "forbidden", "unsafe"]
            .iter()
            .any(|kw| lowered.contains(kw))
        {
            return (PlanType::CannotAnswer, "potentially unsafe request".to_string());
        }
        if message.ends_with('?') {
            return (PlanType::DirectAnswer, "question detected".to_string());
        }
        (PlanType::DirectAnswer, "default direct answer path".to_string())
    }
}

impl Default for HeuristicPlanner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Planner for HeuristicPlanner {
    async fn plan(
        &self,
        state: &RunState,
        allowed_tools: &[ToolDescriptor],
    ) -> Result<PlanDecision, PlanError> {
        let (plan_type, reason) = Self::choose_plan(state);
        let selected_tool = if plan_type == PlanType::DirectAnswer {
            match_tool_intent(&state.message, allowed_tools)
        } else {
            None
        };
        Ok(PlanDecision {
            plan_type,
            reason,
            selected_tool,
        })
    }
}

/// Match a message against the tools' known intents.
pub fn match_tool_intent(
    message: &str,
    tools: &[ToolDescriptor],
) -> Option<ToolSelection> {
    let has = |name: &str| tools.iter().any(|d| d.name == name);

    if has("calculator") {
        if let Some(arguments) = detect_calculator(message) {
            return Some(ToolSelection {
                tool_name: "calculator".to_string(),
                arguments,
            });
        }
    }

    if let Some(repo) = extract_repo(message) {
        if has("github.read_file") {
            if let Some(path) = file_hint()
                .captures(message)
                .and_then(|c| c.name("path"))
                .map(|m| m.as_str().trim_matches(|c| c == '"' || c == '\'').to_string())
            {
                return Some(ToolSelection {
                    tool_name: "github.read_file".to_string(),
                    arguments: json!({"repo": repo, "path": path}),
                });
            }
        }
        if has("github.list_files") {
            return Some(ToolSelection {
                tool_name: "github.list_files".to_string(),
                arguments: json!({"repo": repo}),
            });
        }
    }
    None
}

fn detect_calculator(message: &str) -> Option<serde_json::Value> {
    let captures = symbol_expr().captures(message)?;
    let a: f64 = captures.get(1)?.as_str().parse().ok()?;
    let b: f64 = captures.get(3)?.as_str().parse().ok()?;
    let operation = match captures.get(2)?.as_str() {
        "+" => "add",
        "-" => "subtract",
        "*" => "multiply",
        "/" => "divide",
        _ => return None,
    };
    Some(json!({"operation": operation, "a": a, "b": b}))
}

fn extract_repo(message: &str) -> Option<String> {
    if let Some(captures) = repo_url().captures(message) {
        return captures.name("repo").map(|m| m.as_str().to_string());
    }
    if let Some(captures) = repo_keyword().captures(message) {
        return captures.name("repo").map(|m| m.as_str().to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{CalculatorServer, GithubServer, ToolRegistry, ToolServer};
    use std::sync::Arc;

    fn tools() -> Vec<ToolDescriptor> {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(CalculatorServer::new()) as Arc<dyn ToolServer>);
        registry.register(Arc::new(GithubServer::new(None)) as Arc<dyn ToolServer>);
        registry.list()
    }

    fn state(message: &str, mode: ChatMode) -> RunState {
        let mut state = RunState::empty("run-1");
        state.message = message.to_string();
        state.mode = mode;
        state
    }

    #[tokio::test]
    async fn test_question_is_direct_answer() {
        let planner = HeuristicPlanner::new();
        let decision = planner
            .plan(&state("What is strategy?", ChatMode::Answer), &tools())
            .await
            .unwrap();
        assert_eq!(decision.plan_type, PlanType::DirectAnswer);
        assert!(decision.selected_tool.is_none());
    }

    #[tokio::test]
    async fn test_short_message_needs_clarification() {
        let planner = HeuristicPlanner::new();
        let decision = planner
            .plan(&state("hey", ChatMode::Answer), &tools())
            .await
            .unwrap();
        assert_eq!(decision.plan_type, PlanType::NeedsClarification);
    }

    #[tokio::test]
    async fn test_unsafe_keyword_cannot_answer() {
        let planner = HeuristicPlanner::new();
        let decision = planner
            .plan(&state("tell me something illegal", ChatMode::Answer), &tools())
            .await
            .unwrap();
        assert_eq!(decision.plan_type, PlanType::CannotAnswer);
    }

    #[test]
    fn test_calculator_symbol_intent() {
        let selection = match_tool_intent("17 + 32", &tools()).expect("selection");
        assert_eq!(selection.tool_name, "calculator");
        assert_eq!(
            selection.arguments,
            json!({"operation": "add", "a": 17.0, "b": 32.0})
        );
    }

    #[test]
    fn test_division_intent() {
        let selection = match_tool_intent("what is 10 / 4?", &tools()).expect("selection");
        assert_eq!(
            selection.arguments,
            json!({"operation": "divide", "a": 10.0, "b": 4.0})
        );
    }

    #[test]
    fn test_repo_listing_intent() {
        let selection =
            match_tool_intent("list the files in repo acme/docs", &tools()).expect("selection");
        assert_eq!(selection.tool_name, "github.list_files");
        assert_eq!(selection.arguments, json!({"repo": "acme/docs"}));
    }

    #[test]
    fn test_no_intent_for_plain_question() {
        assert!(match_tool_intent("what is strategy?", &tools()).is_none());
    }
}
