//! 参数模板：`{{ key }}` 占位符
//!
//! 解析时先把占位符替换为哨兵串，保证 YAML 结构不被 `{{` 破坏；
//! 读出参数声明、确定取值后，再在解析后的值树里把哨兵替换成真实值。

use std::collections::{BTreeSet, HashMap};
use std::sync::OnceLock;

use regex::Regex;

use crate::recipe::{ParameterInputType, ParameterRequirement, RecipeError, RecipeParameter};

const SENTINEL_PREFIX: &str = "__APIARY_PARAM_";
const SENTINEL_SUFFIX: &str = "__APIARYEND";

fn placeholder_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").ok())
        .as_ref()
}

fn sentinel_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"__APIARY_PARAM_([A-Za-z_][A-Za-z0-9_]*?)__APIARYEND").ok())
        .as_ref()
}

/// 文本中出现的全部占位符名
pub fn placeholders(text: &str) -> BTreeSet<String> {
    let Some(re) = placeholder_re() else {
        return BTreeSet::new();
    };
    re.captures_iter(text)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

/// 占位符替换为哨兵串
pub fn mask(text: &str) -> String {
    let Some(re) = placeholder_re() else {
        return text.to_string();
    };
    re.replace_all(text, |c: &regex::Captures<'_>| {
        format!("{SENTINEL_PREFIX}{}{SENTINEL_SUFFIX}", &c[1])
    })
    .into_owned()
}

/// 哨兵串替换为取值；没有取值的恢复成原占位符
pub fn unmask(text: &str, values: &HashMap<String, String>) -> String {
    let Some(re) = sentinel_re() else {
        return text.to_string();
    };
    re.replace_all(text, |c: &regex::Captures<'_>| match values.get(&c[1]) {
        Some(v) => v.clone(),
        None => format!("{{{{ {} }}}}", &c[1]),
    })
    .into_owned()
}

/// 直接渲染文本中的占位符（未知占位符保持原样）
pub fn render(text: &str, values: &HashMap<String, String>) -> String {
    unmask(&mask(text), values)
}

/// 在 JSON 值树中逐个字符串替换哨兵
pub fn unmask_value(value: &mut serde_json::Value, values: &HashMap<String, String>) {
    match value {
        serde_json::Value::String(s) => {
            if s.contains(SENTINEL_PREFIX) {
                *s = unmask(s, values);
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                unmask_value(item, values);
            }
        }
        serde_json::Value::Object(map) => {
            for (_, v) in map.iter_mut() {
                unmask_value(v, values);
            }
        }
        _ => {}
    }
}

/// 结合声明、调用方取值与默认值得出最终参数表
pub fn resolve_parameters(
    declared: &[RecipeParameter],
    supplied: &HashMap<String, String>,
) -> Result<HashMap<String, String>, RecipeError> {
    let mut resolved = supplied.clone();
    let mut missing = Vec::new();

    for param in declared {
        let value = supplied
            .get(&param.key)
            .cloned()
            .or_else(|| param.default.clone());
        match value {
            Some(v) => {
                validate_value(param, &v)?;
                resolved.insert(param.key.clone(), v);
            }
            None => {
                if param.requirement != ParameterRequirement::Optional {
                    missing.push(param.key.clone());
                }
            }
        }
    }

    if missing.is_empty() {
        Ok(resolved)
    } else {
        Err(RecipeError::MissingParameters(missing))
    }
}

fn validate_value(param: &RecipeParameter, value: &str) -> Result<(), RecipeError> {
    let invalid = |reason: String| RecipeError::InvalidParameter {
        key: param.key.clone(),
        reason,
    };
    match param.input_type {
        ParameterInputType::Select => {
            let options = param.options.as_deref().unwrap_or_default();
            if !options.iter().any(|o| o == value) {
                return Err(invalid(format!("must be one of: {}", options.join(", "))));
            }
        }
        ParameterInputType::Number => {
            if value.trim().parse::<f64>().is_err() {
                return Err(invalid(format!("'{value}' is not a number")));
            }
        }
        ParameterInputType::Boolean => {
            if !matches!(value.trim(), "true" | "false") {
                return Err(invalid(format!("'{value}' is not a boolean")));
            }
        }
        ParameterInputType::String | ParameterInputType::Date | ParameterInputType::File => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn param(key: &str, requirement: ParameterRequirement, default: Option<&str>) -> RecipeParameter {
        RecipeParameter {
            key: key.into(),
            input_type: ParameterInputType::String,
            requirement,
            description: String::new(),
            default: default.map(String::from),
            options: None,
        }
    }

    #[test]
    fn test_placeholders_and_render() {
        let text = "Summarise {{ topic }} in {{lang}} ({{ topic }})";
        let names: Vec<String> = placeholders(text).into_iter().collect();
        assert_eq!(names, vec!["lang".to_string(), "topic".to_string()]);

        let mut values = HashMap::new();
        values.insert("topic".to_string(), "rust".to_string());
        assert_eq!(render(text, &values), "Summarise rust in {{ lang }} (rust)");
    }

    #[test]
    fn test_mask_keeps_yaml_parseable() {
        let yaml = "prompt: {{ topic }}\n";
        assert!(serde_yaml::from_str::<serde_json::Value>(&mask(yaml)).is_ok());
    }

    #[test]
    fn test_resolve_defaults_and_missing() {
        let declared = vec![
            param("topic", ParameterRequirement::Required, None),
            param("lang", ParameterRequirement::Optional, Some("en")),
            param("who", ParameterRequirement::UserPrompt, None),
        ];
        let mut supplied = HashMap::new();
        supplied.insert("topic".to_string(), "rust".to_string());
        let err = resolve_parameters(&declared, &supplied).unwrap_err();
        assert_eq!(err, RecipeError::MissingParameters(vec!["who".into()]));

        supplied.insert("who".to_string(), "me".to_string());
        let resolved = resolve_parameters(&declared, &supplied).unwrap();
        assert_eq!(resolved["lang"], "en");
    }

    #[test]
    fn test_select_and_number_validation() {
        let mut p = param("mode", ParameterRequirement::Required, None);
        p.input_type = ParameterInputType::Select;
        p.options = Some(vec!["fast".into(), "slow".into()]);
        let mut supplied = HashMap::new();
        supplied.insert("mode".to_string(), "medium".to_string());
        assert!(matches!(
            resolve_parameters(&[p], &supplied),
            Err(RecipeError::InvalidParameter { .. })
        ));

        let mut n = param("count", ParameterRequirement::Required, None);
        n.input_type = ParameterInputType::Number;
        let mut supplied = HashMap::new();
        supplied.insert("count".to_string(), "12".to_string());
        assert!(resolve_parameters(&[n], &supplied).is_ok());
    }
}
