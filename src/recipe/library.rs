//! 本地 Recipe 库：`<data_dir>/recipes` 下的 YAML 文件，文件名即 id

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::recipe::loader::{load_recipe_file, RecipeFormat};
use crate::recipe::template::mask;
use crate::recipe::{Recipe, RecipeError};

#[derive(Debug, Clone, Serialize)]
pub struct RecipeManifest {
    pub id: String,
    pub title: String,
    pub description: String,
    pub path: PathBuf,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RecipeLibrary {
    dir: PathBuf,
}

/// 标题转 id：小写字母数字，其余折叠为 `-`
pub fn slugify(title: &str) -> String {
    let mut out = String::new();
    for c in title.chars() {
        if c.is_alphanumeric() {
            out.extend(c.to_lowercase());
        } else if !out.ends_with('-') && !out.is_empty() {
            out.push('-');
        }
    }
    let trimmed = out.trim_end_matches('-').to_string();
    if trimmed.is_empty() {
        "recipe".to_string()
    } else {
        trimmed
    }
}

fn is_recipe_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml" | "yml" | "json" | "toml")
    )
}

impl RecipeLibrary {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 保存为 `<slug>.yaml`，返回 id；同名覆盖
    pub fn save(&self, recipe: &Recipe) -> Result<String, RecipeError> {
        recipe.validate()?;
        let io = |path: &Path, e: std::io::Error| RecipeError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        };
        std::fs::create_dir_all(&self.dir).map_err(|e| io(&self.dir, e))?;
        let id = slugify(&recipe.title);
        let path = self.dir.join(format!("{id}.yaml"));
        let yaml = serde_yaml::to_string(recipe).map_err(|e| RecipeError::Parse(e.to_string()))?;
        std::fs::write(&path, yaml).map_err(|e| io(&path, e))?;
        tracing::info!(id = %id, path = %path.display(), "recipe saved");
        Ok(id)
    }

    /// 按修改时间倒序；无法解析的文件跳过
    pub fn list(&self) -> Vec<RecipeManifest> {
        if !self.dir.is_dir() {
            return Vec::new();
        }
        let mut manifests: Vec<RecipeManifest> = walkdir::WalkDir::new(&self.dir)
            .max_depth(1)
            .follow_links(false)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file() && is_recipe_file(e.path()))
            .filter_map(|entry| {
                let path = entry.path().to_path_buf();
                match Self::read_manifest(&path) {
                    Ok(m) => Some(m),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "skip unreadable recipe");
                        None
                    }
                }
            })
            .collect();
        manifests.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
        manifests
    }

    fn read_manifest(path: &Path) -> Result<RecipeManifest, RecipeError> {
        let content = std::fs::read_to_string(path).map_err(|e| RecipeError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let masked = mask(&content);
        let recipe: Recipe = match RecipeFormat::from_path(path) {
            RecipeFormat::Json => serde_json::from_str(&masked).map_err(|e| RecipeError::Parse(e.to_string()))?,
            RecipeFormat::Toml => toml::from_str(&masked).map_err(|e| RecipeError::Parse(e.to_string()))?,
            RecipeFormat::Yaml => serde_yaml::from_str(&masked).map_err(|e| RecipeError::Parse(e.to_string()))?,
        };
        let last_modified = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        Ok(RecipeManifest {
            id: path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default(),
            title: recipe.title,
            description: recipe.description,
            path: path.to_path_buf(),
            last_modified,
        })
    }

    fn find(&self, id: &str) -> Result<PathBuf, RecipeError> {
        self.list()
            .into_iter()
            .find(|m| m.id == id)
            .map(|m| m.path)
            .ok_or_else(|| RecipeError::NotInLibrary(id.to_string()))
    }

    pub fn load(&self, id: &str, params: &HashMap<String, String>) -> Result<Recipe, RecipeError> {
        let path = self.find(id)?;
        load_recipe_file(&path, params, Some(&self.dir)).map(|(recipe, _)| recipe)
    }

    pub fn delete(&self, id: &str) -> Result<(), RecipeError> {
        let path = self.find(id)?;
        std::fs::remove_file(&path).map_err(|e| RecipeError::Io {
            path: path.clone(),
            message: e.to_string(),
        })?;
        tracing::info!(id = %id, "recipe deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Daily News Digest!"), "daily-news-digest");
        assert_eq!(slugify("  "), "recipe");
    }

    #[test]
    fn test_save_list_load_delete() {
        let dir = tempfile::tempdir().unwrap();
        let lib = RecipeLibrary::new(dir.path().join("recipes"));
        assert!(lib.list().is_empty());

        let recipe = Recipe::builder()
            .title("Weekly Report")
            .description("collects numbers")
            .instructions("write the weekly report")
            .build()
            .unwrap();
        let id = lib.save(&recipe).unwrap();
        assert_eq!(id, "weekly-report");
        std::fs::write(lib.dir().join("broken.yaml"), "title: [").unwrap();

        let listed = lib.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].title, "Weekly Report");

        let loaded = lib.load(&id, &HashMap::new()).unwrap();
        assert_eq!(loaded.instructions, recipe.instructions);

        lib.delete(&id).unwrap();
        assert_eq!(
            lib.load(&id, &HashMap::new()).unwrap_err(),
            RecipeError::NotInLibrary(id)
        );
    }
}
