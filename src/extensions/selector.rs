//! 工具选择策略：决定每一步把哪些工具写进 prompt
//!
//! all 暴露全部工具；keyword 按最近用户文本与工具名 / 描述的词重叠度取前 N 个。

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::extensions::ToolEntry;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum ToolSelection {
    #[default]
    All,
    Keyword { max_tools: usize },
}

fn words(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
        .map(|w| w.to_lowercase())
        .collect()
}

impl ToolSelection {
    pub fn select(&self, tools: Vec<ToolEntry>, query: Option<&str>) -> Vec<ToolEntry> {
        match self {
            ToolSelection::All => tools,
            ToolSelection::Keyword { max_tools } => {
                let query_words = words(query.unwrap_or_default());
                let mut scored: Vec<(usize, usize, ToolEntry)> = tools
                    .into_iter()
                    .enumerate()
                    .map(|(idx, entry)| {
                        let haystack = format!("{} {}", entry.full_name.replace("__", " "), entry.description());
                        let score = words(&haystack).intersection(&query_words).count();
                        (score, idx, entry)
                    })
                    .collect();
                // 分数降序，同分保持原顺序
                scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
                scored
                    .into_iter()
                    .take(*max_tools)
                    .map(|(_, _, entry)| entry)
                    .collect()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extensions::{ExtensionCatalog, ExtensionConfig, ExtensionContext, ExtensionSet};

    fn tools() -> Vec<ToolEntry> {
        let ctx = ExtensionContext {
            working_dir: std::env::temp_dir(),
            allowed_commands: vec![],
            tool_timeout: std::time::Duration::from_secs(1),
        };
        let catalog = ExtensionCatalog::with_builtins();
        let mut set = ExtensionSet::new();
        set.insert(catalog.instantiate(&ExtensionConfig::builtin("developer"), &ctx).unwrap());
        set.insert(catalog.instantiate(&ExtensionConfig::builtin("echo"), &ctx).unwrap());
        set.tools(None)
    }

    #[test]
    fn test_all_keeps_everything() {
        let all = tools();
        let n = all.len();
        assert_eq!(ToolSelection::All.select(all, Some("anything")).len(), n);
    }

    #[test]
    fn test_keyword_ranks_by_overlap() {
        let picked = ToolSelection::Keyword { max_tools: 1 }.select(tools(), Some("please read the file notes.txt"));
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].full_name, "developer__read_file");
    }
}
