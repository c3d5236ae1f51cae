//! 归一化的执行请求
//!
//! 交互消息、Recipe 文件、内联 Recipe、调度任务、扇出子任务都先变成 ExecutionRequest，
//! 执行器只认这一种输入。

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::extensions::ExtensionScope;
use crate::recipe::Recipe;
use crate::session::SessionType;

/// Recipe 来源
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecipeSource {
    File {
        path: PathBuf,
        #[serde(default)]
        params: HashMap<String, String>,
    },
    Inline {
        recipe: Box<Recipe>,
    },
    Text {
        text: String,
    },
}

impl RecipeSource {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        RecipeSource::File {
            path: path.into(),
            params: HashMap::new(),
        }
    }

    pub fn inline(recipe: Recipe) -> Self {
        RecipeSource::Inline {
            recipe: Box::new(recipe),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        RecipeSource::Text { text: text.into() }
    }
}

/// 执行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// 实时消费者在线，事件流式推送
    #[default]
    Interactive,
    /// 调度器触发，缓冲到结束
    Background,
    /// 扇出子任务，扩展受白名单约束
    SubTask,
}

impl ExecutionMode {
    pub fn session_type(&self) -> SessionType {
        match self {
            ExecutionMode::Interactive => SessionType::User,
            ExecutionMode::Background => SessionType::Scheduled,
            ExecutionMode::SubTask => SessionType::SubAgent,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub session_id: String,
    pub source: RecipeSource,
    #[serde(default)]
    pub mode: ExecutionMode,
    /// 扩展白名单；None 表示使用 Recipe 声明的全部扩展
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<ExtensionScope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_session_id: Option<String>,
    /// 新建会话时的工作目录；默认取配置
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
}

impl ExecutionRequest {
    pub fn new(session_id: impl Into<String>, source: RecipeSource, mode: ExecutionMode) -> Self {
        Self {
            session_id: session_id.into(),
            source,
            mode,
            scope: None,
            schedule_id: None,
            parent_session_id: None,
            working_dir: None,
        }
    }

    /// 交互式的一条用户消息
    pub fn interactive(session_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(session_id, RecipeSource::text(text), ExecutionMode::Interactive)
    }

    pub fn with_scope(mut self, scope: ExtensionScope) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn with_schedule(mut self, schedule_id: impl Into<String>) -> Self {
        self.schedule_id = Some(schedule_id.into());
        self
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent_session_id = Some(parent.into());
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_wire_shape() {
        let src: RecipeSource =
            serde_json::from_str(r#"{"type": "file", "path": "daily.yaml", "params": {"topic": "rust"}}"#)
                .unwrap();
        match src {
            RecipeSource::File { path, params } => {
                assert_eq!(path, PathBuf::from("daily.yaml"));
                assert_eq!(params["topic"], "rust");
            }
            other => panic!("unexpected {other:?}"),
        }
        let req: ExecutionRequest =
            serde_json::from_str(r#"{"session_id": "s", "source": {"type": "text", "text": "hi"}}"#).unwrap();
        assert_eq!(req.mode, ExecutionMode::Interactive);
        assert_eq!(ExecutionMode::SubTask.session_type(), SessionType::SubAgent);
    }
}
