//! Recipe 安全扫描：隐藏 Unicode 字符与 retry 命令中的危险模式
//!
//! 扫描只产出警告，由调用方决定是否继续（CLI 会打印并要求 `--yes` 才运行）。

use serde::Serialize;

use crate::extensions::builtin::forbidden_pattern;
use crate::recipe::{Recipe, SuccessCheck};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecurityWarning {
    pub field: String,
    pub message: String,
}

fn is_invisible(c: char) -> bool {
    matches!(
        c,
        '\u{200B}'..='\u{200F}'
            | '\u{202A}'..='\u{202E}'
            | '\u{2060}'..='\u{2064}'
            | '\u{2066}'..='\u{2069}'
            | '\u{FEFF}'
            | '\u{E0000}'..='\u{E007F}'
    )
}

fn scan_text(field: &str, text: &str, out: &mut Vec<SecurityWarning>) {
    let hidden: Vec<String> = text
        .chars()
        .filter(|c| is_invisible(*c))
        .map(|c| format!("U+{:04X}", c as u32))
        .collect();
    if !hidden.is_empty() {
        out.push(SecurityWarning {
            field: field.to_string(),
            message: format!("contains invisible characters: {}", hidden.join(" ")),
        });
    }
}

fn scan_command(field: &str, command: &str, out: &mut Vec<SecurityWarning>) {
    scan_text(field, command, out);
    if let Some(pattern) = forbidden_pattern(command) {
        out.push(SecurityWarning {
            field: field.to_string(),
            message: format!("shell command contains '{pattern}'"),
        });
    }
}

pub fn scan_recipe(recipe: &Recipe) -> Vec<SecurityWarning> {
    let mut out = Vec::new();
    scan_text("title", &recipe.title, &mut out);
    scan_text("description", &recipe.description, &mut out);
    if let Some(i) = &recipe.instructions {
        scan_text("instructions", i, &mut out);
    }
    if let Some(p) = &recipe.prompt {
        scan_text("prompt", p, &mut out);
    }
    for (idx, activity) in recipe.activities.iter().flatten().enumerate() {
        scan_text(&format!("activities[{idx}]"), activity, &mut out);
    }
    if let Some(retry) = &recipe.retry {
        for (idx, check) in retry.checks.iter().enumerate() {
            let SuccessCheck::Shell { command } = check;
            scan_command(&format!("retry.checks[{idx}]"), command, &mut out);
        }
        if let Some(cmd) = &retry.on_failure {
            scan_command("retry.on_failure", cmd, &mut out);
        }
    }
    out
}
