//! 平台工具：把子任务与子 Recipe 交给任务扇出
//!
//! `platform__dispatch_tasks` 派发临时指令；每个已挂载的子 Recipe 暴露为 `subrecipe__<name>`。
//! SubTask 会话看不到这些工具，扇出不会递归。

use std::collections::HashMap;
use std::path::Path;

use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::agent::{Agent, ToolCall, ToolDescriptor};
use crate::core::AgentError;
use crate::extensions::builtin::schema_of;
use crate::recipe::{load_recipe_file, SubRecipe};
use crate::tasks::{DispatchMode, Task, TaskRunner};

pub const DISPATCH_TOOL: &str = "platform__dispatch_tasks";
pub const SUBRECIPE_PREFIX: &str = "subrecipe__";

#[derive(Debug, Deserialize, JsonSchema)]
struct TaskSpec {
    /// 子任务的完整指令
    instructions: String,
    /// 子任务可用的扩展名；不填则没有任何扩展
    #[serde(default)]
    extensions: Vec<String>,
    /// 串行模式下失败时跳过后续任务
    #[serde(default)]
    blocking: bool,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct DispatchArgs {
    tasks: Vec<TaskSpec>,
    /// parallel（默认）或 sequential
    #[serde(default)]
    mode: DispatchMode,
}

#[derive(Debug, Deserialize, JsonSchema, Default)]
struct SubRecipeArgs {
    /// 每个元素是一次运行的参数表；不填则按默认参数运行一次
    #[serde(default)]
    runs: Vec<HashMap<String, String>>,
}

pub fn is_platform_tool(name: &str) -> bool {
    name == DISPATCH_TOOL || name.starts_with(SUBRECIPE_PREFIX)
}

pub fn descriptors(sub_recipes: &[SubRecipe]) -> Vec<ToolDescriptor> {
    let mut out = vec![ToolDescriptor {
        name: DISPATCH_TOOL.to_string(),
        description: "Run independent sub-tasks, each in its own session with only the listed extensions. \
                      Returns one result per task in submission order."
            .to_string(),
        parameters: schema_of::<DispatchArgs>(),
    }];
    for sub in sub_recipes {
        out.push(ToolDescriptor {
            name: format!("{SUBRECIPE_PREFIX}{}", sub.name),
            description: sub
                .description
                .clone()
                .unwrap_or_else(|| format!("Run the '{}' sub-recipe", sub.name)),
            parameters: schema_of::<SubRecipeArgs>(),
        });
    }
    out
}

fn invalid_args(tool: &str, e: impl std::fmt::Display) -> AgentError {
    AgentError::ToolExecutionFailed(format!("{tool}: invalid arguments: {e}"))
}

impl Agent {
    pub(crate) async fn run_platform_tool(
        &self,
        call: &ToolCall,
        runner: &dyn TaskRunner,
        cancel: &CancellationToken,
    ) -> Result<String, AgentError> {
        let (tasks, mode) = if call.tool == DISPATCH_TOOL {
            let args: DispatchArgs =
                serde_json::from_value(call.args.clone()).map_err(|e| invalid_args(&call.tool, e))?;
            let tasks = args
                .tasks
                .into_iter()
                .map(|spec| Task {
                    blocking: spec.blocking,
                    ..Task::instructions(spec.instructions, spec.extensions)
                })
                .collect::<Vec<_>>();
            (tasks, args.mode)
        } else {
            self.sub_recipe_tasks(call).await?
        };

        if tasks.is_empty() {
            return Err(invalid_args(&call.tool, "no tasks given"));
        }
        tracing::info!(session_id = %self.session_id(), tool = %call.tool, count = tasks.len(), "dispatching sub-tasks");
        let results = runner.run_tasks(self.session_id(), tasks, mode, cancel).await;
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        serde_json::to_string_pretty(&results).map_err(|e| AgentError::ToolExecutionFailed(e.to_string()))
    }

    async fn sub_recipe_tasks(&self, call: &ToolCall) -> Result<(Vec<Task>, DispatchMode), AgentError> {
        let name = call.tool.trim_start_matches(SUBRECIPE_PREFIX);
        let sub = self
            .sub_recipes()
            .await
            .into_iter()
            .find(|s| s.name == name)
            .ok_or_else(|| AgentError::HallucinatedTool(call.tool.clone()))?;
        let args: SubRecipeArgs = match &call.args {
            Value::Null => SubRecipeArgs::default(),
            other => serde_json::from_value(other.clone()).map_err(|e| invalid_args(&call.tool, e))?,
        };
        let runs = if args.runs.is_empty() {
            vec![HashMap::new()]
        } else {
            args.runs
        };
        let mode = if sub.sequential_when_repeated && runs.len() > 1 {
            DispatchMode::Sequential
        } else {
            DispatchMode::Parallel
        };

        let mut tasks = Vec::with_capacity(runs.len());
        for run in runs {
            let mut params = sub.values.clone().unwrap_or_default();
            params.extend(run);
            let (recipe, _) = load_recipe_file(Path::new(&sub.path), &params, None)
                .map_err(|e| AgentError::ToolExecutionFailed(format!("{}: {e}", call.tool)))?;
            let allowed: Vec<String> = recipe
                .extension_configs()
                .iter()
                .map(|c| c.name().to_string())
                .collect();
            tasks.push(Task::recipe(recipe, allowed));
        }
        Ok((tasks, mode))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::agent::test_support::agent_with;
    use crate::execution::RecipeSource;
    use crate::llm::MockLlmClient;
    use crate::session::SessionType;
    use crate::tasks::{TaskResult, TaskStatus};

    #[derive(Default)]
    struct RecordingRunner {
        seen: Mutex<Vec<(Vec<Task>, DispatchMode)>>,
    }

    #[async_trait]
    impl TaskRunner for RecordingRunner {
        async fn run_tasks(
            &self,
            parent_session_id: &str,
            tasks: Vec<Task>,
            mode: DispatchMode,
            _cancel: &CancellationToken,
        ) -> Vec<TaskResult> {
            let results = (0..tasks.len())
                .map(|i| TaskResult {
                    task_id: format!("task_{}", i + 1),
                    session_id: format!("{parent_session_id}__task_{}", i + 1),
                    status: TaskStatus::Completed,
                    output: Some("ok".into()),
                    error: None,
                })
                .collect();
            self.seen.lock().unwrap().push((tasks, mode));
            results
        }
    }

    #[tokio::test]
    async fn test_dispatch_tool_builds_scoped_tasks() {
        let agent = agent_with(MockLlmClient::default(), SessionType::User);
        let runner = RecordingRunner::default();
        let call = ToolCall {
            tool: DISPATCH_TOOL.into(),
            args: json!({
                "tasks": [
                    {"instructions": "count lines", "extensions": ["developer"]},
                    {"instructions": "say hi", "blocking": true}
                ],
                "mode": "sequential"
            }),
        };
        let out = agent
            .run_platform_tool(&call, &runner, &CancellationToken::new())
            .await
            .unwrap();
        assert!(out.contains("test-session__task_1"));

        let seen = runner.seen.lock().unwrap();
        let (tasks, mode) = &seen[0];
        assert_eq!(*mode, DispatchMode::Sequential);
        assert_eq!(tasks[0].extensions, vec!["developer".to_string()]);
        assert!(tasks[1].extensions.is_empty());
        assert!(tasks[1].blocking);
        assert_eq!(tasks[0].source, RecipeSource::text("count lines"));
    }

    #[tokio::test]
    async fn test_sub_recipe_runs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("child.yaml");
        std::fs::write(
            &path,
            "title: child\nparameters:\n  - key: n\n    input_type: number\n    requirement: required\nprompt: count to {{ n }}\nextensions:\n  - type: builtin\n    name: echo\n",
        )
        .unwrap();

        let agent = agent_with(MockLlmClient::default(), SessionType::User);
        agent
            .add_sub_recipes(vec![SubRecipe {
                name: "count".into(),
                path: path.to_string_lossy().to_string(),
                values: None,
                sequential_when_repeated: true,
                description: None,
            }])
            .await;
        let runner = RecordingRunner::default();
        let call = ToolCall {
            tool: "subrecipe__count".into(),
            args: json!({"runs": [{"n": "1"}, {"n": "2"}]}),
        };
        agent
            .run_platform_tool(&call, &runner, &CancellationToken::new())
            .await
            .unwrap();

        let seen = runner.seen.lock().unwrap();
        let (tasks, mode) = &seen[0];
        assert_eq!(*mode, DispatchMode::Sequential);
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].extensions, vec!["echo".to_string()]);
        match &tasks[1].source {
            RecipeSource::Inline { recipe } => assert_eq!(recipe.prompt.as_deref(), Some("count to 2")),
            other => panic!("unexpected {other:?}"),
        }

        let unknown = ToolCall {
            tool: "subrecipe__missing".into(),
            args: json!({}),
        };
        assert!(matches!(
            agent.run_platform_tool(&unknown, &runner, &CancellationToken::new()).await,
            Err(AgentError::HallucinatedTool(_))
        ));
    }
}
