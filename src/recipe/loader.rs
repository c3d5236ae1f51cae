//! Recipe 解析与加载
//!
//! 支持 YAML / JSON / TOML；先屏蔽占位符再解析，读出参数声明后求参数值并回填。
//! 文件中子 Recipe 的相对路径按父 Recipe 所在目录解析。

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::recipe::template::{mask, placeholders, resolve_parameters, unmask_value};
use crate::recipe::{Recipe, RecipeError, RecipeParameter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecipeFormat {
    Yaml,
    Json,
    Toml,
}

impl RecipeFormat {
    pub fn from_path(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("json") => RecipeFormat::Json,
            Some("toml") => RecipeFormat::Toml,
            _ => RecipeFormat::Yaml,
        }
    }
}

fn to_value(masked: &str, format: RecipeFormat) -> Result<serde_json::Value, RecipeError> {
    let parse = |e: String| RecipeError::Parse(e);
    match format {
        RecipeFormat::Json => serde_json::from_str(masked).map_err(|e| parse(e.to_string())),
        RecipeFormat::Toml => {
            let value: toml::Value = toml::from_str(masked).map_err(|e| parse(e.to_string()))?;
            serde_json::to_value(value).map_err(|e| parse(e.to_string()))
        }
        // YAML 是 JSON 的超集
        RecipeFormat::Yaml => serde_yaml::from_str(masked).map_err(|e| parse(e.to_string())),
    }
}

/// 解析 Recipe 文本并代入参数
pub fn parse_recipe(
    content: &str,
    format: RecipeFormat,
    params: &HashMap<String, String>,
) -> Result<Recipe, RecipeError> {
    let mut value = to_value(&mask(content), format)?;

    let declared: Vec<RecipeParameter> = match value.get("parameters") {
        Some(raw) if !raw.is_null() => serde_json::from_value(raw.clone())
            .map_err(|e| RecipeError::Parse(format!("parameters: {e}")))?,
        _ => Vec::new(),
    };

    let undeclared: Vec<String> = placeholders(content)
        .into_iter()
        .filter(|name| !declared.iter().any(|p| &p.key == name))
        .collect();
    if !undeclared.is_empty() {
        return Err(RecipeError::UndeclaredPlaceholders(undeclared));
    }

    let values = resolve_parameters(&declared, params)?;
    unmask_value(&mut value, &values);

    let recipe: Recipe =
        serde_json::from_value(value).map_err(|e| RecipeError::Parse(e.to_string()))?;
    recipe.validate()?;
    Ok(recipe)
}

/// 从文件加载；`search_dir` 为 Recipe 库目录，路径不存在时按 `<search_dir>/<name>.yaml` 查找
pub fn load_recipe_file(
    path: &Path,
    params: &HashMap<String, String>,
    search_dir: Option<&Path>,
) -> Result<(Recipe, PathBuf), RecipeError> {
    let resolved = resolve_path(path, search_dir)?;
    let content = std::fs::read_to_string(&resolved).map_err(|e| RecipeError::Io {
        path: resolved.clone(),
        message: e.to_string(),
    })?;
    let mut recipe = parse_recipe(&content, RecipeFormat::from_path(&resolved), params)?;

    if let (Some(parent), Some(subs)) = (resolved.parent(), recipe.sub_recipes.as_mut()) {
        for sub in subs.iter_mut() {
            let p = Path::new(&sub.path);
            if p.is_relative() {
                sub.path = parent.join(p).to_string_lossy().to_string();
            }
        }
    }

    tracing::debug!(path = %resolved.display(), title = %recipe.title, "recipe loaded");
    Ok((recipe, resolved))
}

fn resolve_path(path: &Path, search_dir: Option<&Path>) -> Result<PathBuf, RecipeError> {
    if path.is_file() {
        return Ok(path.to_path_buf());
    }
    if let Some(dir) = search_dir {
        let candidates = [
            dir.join(path),
            dir.join(format!("{}.yaml", path.display())),
            dir.join(format!("{}.yml", path.display())),
            dir.join(format!("{}.json", path.display())),
        ];
        if let Some(found) = candidates.into_iter().find(|c| c.is_file()) {
            return Ok(found);
        }
    }
    Err(RecipeError::NotFound(path.to_path_buf()))
}
