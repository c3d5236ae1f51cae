//! developer 扩展：白名单 Shell 与沙箱文件读取
//!
//! 所有路径与命令都限定在会话工作目录内：SafeFs 校验路径不逃逸，ShellTool 只允许白名单命令名，
//! 并拒绝 rm -rf、wget、chmod 777 等危险子串。

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;
use tokio::process::Command;

use crate::extensions::builtin::schema_of;
use crate::extensions::{Extension, ExtensionContext, Tool, ToolRegistry};

/// 禁止的命令子串（即使命令名在白名单中也不允许）
pub const FORBIDDEN_SUBSTR: &[&str] = &[
    "rm -rf",
    "rm -fr",
    "rm -r",
    "wget ",
    "curl | sh",
    "chmod 777",
    "chmod +s",
    "mkfs",
    "dd if=",
    "> /dev/sd",
    ":(){ :|:& };:", // fork bomb
];

/// 返回命中的危险子串
pub fn forbidden_pattern(raw: &str) -> Option<&'static str> {
    let lower = raw.to_lowercase();
    FORBIDDEN_SUBSTR.iter().copied().find(|p| lower.contains(p))
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ShellArgs {
    /// 要执行的命令（命令名须在白名单中）
    command: String,
}

/// Shell 工具：仅允许白名单内命令，在工作目录下执行
pub struct ShellTool {
    allowed_commands: HashSet<String>,
    working_dir: PathBuf,
    timeout: Duration,
}

impl ShellTool {
    pub fn new(allowed_commands: &[String], working_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            allowed_commands: allowed_commands.iter().map(|s| s.to_lowercase()).collect(),
            working_dir: working_dir.into(),
            timeout,
        }
    }

    fn check(&self, raw: &str) -> Result<(), String> {
        if let Some(pattern) = forbidden_pattern(raw) {
            return Err(format!("Forbidden pattern: {pattern}"));
        }
        let lower = raw.to_lowercase();
        let name = lower.split_whitespace().next().unwrap_or("");
        if name.is_empty() {
            return Err("Empty command".to_string());
        }
        if self.allowed_commands.contains(name) {
            Ok(())
        } else {
            Err(format!("Command '{name}' not in allowlist"))
        }
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Run a whitelisted shell command in the session working directory."
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<ShellArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let args: ShellArgs = serde_json::from_value(args).map_err(|e| e.to_string())?;
        let command = args.command.trim();
        self.check(command)?;

        tracing::info!(command = %command, "shell tool execute");

        let mut cmd = Command::new("sh");
        cmd.args(["-c", command])
            .current_dir(&self.working_dir)
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| format!("Command timed out after {}s", self.timeout.as_secs()))?
            .map_err(|e| format!("Execution failed: {e}"))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if !output.status.success() {
            return Err(format!("Exit {:?}\nstderr: {}", output.status.code(), stderr.trim()));
        }
        Ok(if stderr.is_empty() {
            stdout
        } else {
            format!("{}\nstderr: {}", stdout.trim(), stderr.trim())
        })
    }
}

/// 沙箱文件系统：绑定根目录，resolve 校验路径在根下，防止路径逃逸
#[derive(Debug, Clone)]
pub struct SafeFs {
    root_dir: PathBuf,
}

impl SafeFs {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        let root = root_dir.as_ref().to_path_buf();
        let root_dir = root.canonicalize().unwrap_or(root);
        Self { root_dir }
    }

    pub fn resolve(&self, path: &str) -> Result<PathBuf, String> {
        let path = path.trim_start_matches("./");
        let canonical = self
            .root_dir
            .join(path)
            .canonicalize()
            .map_err(|_| format!("Path not found: {path}"))?;
        if canonical.starts_with(&self.root_dir) {
            Ok(canonical)
        } else {
            Err(format!("Path escape attempt: {path}"))
        }
    }

    pub fn read_file(&self, path: &str) -> Result<String, String> {
        let resolved = self.resolve(path)?;
        std::fs::read_to_string(&resolved).map_err(|e| format!("Read failed: {e}"))
    }

    pub fn list_dir(&self, path: &str) -> Result<Vec<String>, String> {
        let base = if path.is_empty() || path == "." {
            self.root_dir.clone()
        } else {
            self.resolve(path)?
        };
        let mut entries = Vec::new();
        for e in std::fs::read_dir(&base).map_err(|e| format!("List failed: {e}"))? {
            let e = e.map_err(|e| e.to_string())?;
            let name = e.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            let suffix = if e.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                "/"
            } else {
                ""
            };
            entries.push(format!("{name}{suffix}"));
        }
        entries.sort();
        Ok(entries)
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct PathArgs {
    /// 相对工作目录的路径
    #[serde(default)]
    path: Option<String>,
}

pub struct ReadFileTool {
    fs: SafeFs,
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a file relative to the session working directory."
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<PathArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let args: PathArgs = serde_json::from_value(args).map_err(|e| e.to_string())?;
        let path = args.path.unwrap_or_default();
        tracing::info!(path = %path, "read_file tool execute");
        self.fs.read_file(&path)
    }
}

pub struct ListDirTool {
    fs: SafeFs,
}

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List a directory relative to the session working directory (default '.')."
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<PathArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let args: PathArgs = serde_json::from_value(args).map_err(|e| e.to_string())?;
        let path = args.path.unwrap_or_else(|| ".".to_string());
        Ok(self.fs.list_dir(&path)?.join("\n"))
    }
}

pub fn developer_extension(ctx: &ExtensionContext) -> Extension {
    let mut tools = ToolRegistry::new();
    tools.register(ShellTool::new(
        &ctx.allowed_commands,
        ctx.working_dir.clone(),
        ctx.tool_timeout,
    ));
    tools.register(ReadFileTool {
        fs: SafeFs::new(&ctx.working_dir),
    });
    tools.register(ListDirTool {
        fs: SafeFs::new(&ctx.working_dir),
    });
    Extension::new(
        "developer",
        "Shell commands and file reading inside the working directory",
        tools,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell(dir: &Path) -> ShellTool {
        ShellTool::new(
            &["echo".to_string(), "ls".to_string()],
            dir,
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_shell_allowlist() {
        let dir = tempfile::tempdir().unwrap();
        let tool = shell(dir.path());
        let out = tool
            .execute(serde_json::json!({"command": "echo hello"}))
            .await
            .unwrap();
        assert_eq!(out.trim(), "hello");

        let err = tool
            .execute(serde_json::json!({"command": "python -c 1"}))
            .await
            .unwrap_err();
        assert!(err.contains("not in allowlist"));

        let err = tool
            .execute(serde_json::json!({"command": "echo x; rm -rf /"}))
            .await
            .unwrap_err();
        assert!(err.contains("Forbidden"));
    }

    #[tokio::test]
    async fn test_shell_runs_in_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "x").unwrap();
        let out = shell(dir.path())
            .execute(serde_json::json!({"command": "ls"}))
            .await
            .unwrap();
        assert!(out.contains("marker.txt"));
    }

    #[test]
    fn test_safe_fs_blocks_escape() {
        let root = tempfile::tempdir().unwrap();
        let inner = root.path().join("inner");
        std::fs::create_dir(&inner).unwrap();
        std::fs::write(root.path().join("secret.txt"), "s").unwrap();
        std::fs::write(inner.join("ok.txt"), "ok").unwrap();

        let fs = SafeFs::new(&inner);
        assert_eq!(fs.read_file("ok.txt").unwrap(), "ok");
        assert!(fs.read_file("../secret.txt").unwrap_err().contains("escape"));
        assert_eq!(fs.list_dir(".").unwrap(), vec!["ok.txt".to_string()]);
    }
}
