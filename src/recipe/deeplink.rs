//! Recipe 分享链接：`apiary://recipe?config=<base64(json)>`

use base64::engine::general_purpose::{STANDARD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;

use crate::recipe::{Recipe, RecipeError};

pub const DEEPLINK_PREFIX: &str = "apiary://recipe?config=";

pub fn encode(recipe: &Recipe) -> Result<String, RecipeError> {
    let json = serde_json::to_vec(recipe).map_err(|e| RecipeError::Deeplink(e.to_string()))?;
    Ok(format!("{DEEPLINK_PREFIX}{}", URL_SAFE_NO_PAD.encode(json)))
}

/// 接受完整链接或裸 token；标准 / URL 安全字母表都可以
pub fn decode(link: &str) -> Result<Recipe, RecipeError> {
    let token = link.trim();
    let token = token.strip_prefix(DEEPLINK_PREFIX).unwrap_or(token);
    let token = token.split('&').next().unwrap_or(token);

    let bytes = URL_SAFE_NO_PAD
        .decode(token)
        .or_else(|_| URL_SAFE.decode(token))
        .or_else(|_| STANDARD.decode(token))
        .map_err(|e| RecipeError::Deeplink(e.to_string()))?;
    let recipe: Recipe =
        serde_json::from_slice(&bytes).map_err(|e| RecipeError::Deeplink(e.to_string()))?;
    recipe.validate()?;
    Ok(recipe)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_round_trip() {
        let recipe = Recipe::builder()
            .title("Share me")
            .instructions("do the thing")
            .activities(vec!["Run it".into()])
            .build()
            .unwrap();
        let link = encode(&recipe).unwrap();
        assert!(link.starts_with(DEEPLINK_PREFIX));
        assert_eq!(decode(&link).unwrap(), recipe);
    }

    #[test]
    fn test_bare_standard_token() {
        let json = r#"{"title":"t","instructions":"go"}"#;
        let token = STANDARD.encode(json);
        assert_eq!(decode(&token).unwrap().title, "t");
    }

    #[test]
    fn test_garbage() {
        assert!(matches!(decode("apiary://recipe?config=!!!"), Err(RecipeError::Deeplink(_))));
    }
}
