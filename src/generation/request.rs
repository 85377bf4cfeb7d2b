//! Caller input helpers: model strings, multi-image prompts, chat messages.

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

use crate::error::{JimengError, Result};

/// Size used when a model string carries none.
pub const DEFAULT_SIZE: u32 = 1024;

/// Assets expected from a multi-image prompt without an explicit count.
pub const DEFAULT_MULTI_IMAGE_COUNT: usize = 4;

/// Only this model produces several images per prompt.
const MULTI_IMAGE_MODEL: &str = "jimeng-4.0";

/// Words that ask for a series of images.
const SERIES_WORDS: &[&str] = &["连续", "绘本", "故事"];

lazy_static! {
    static ref SIZE: Regex = Regex::new(r"(\d+)[\W\w](\d+)").expect("size pattern");
    static ref IMAGE_COUNT: Regex = Regex::new(r"(\d+)张").expect("count pattern");
}

/// A model string split into name and size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    /// Model name without the size suffix
    pub name: String,
    /// Width, always even
    pub width: u32,
    /// Height, always even
    pub height: u32,
}

fn round_up_even(value: u32) -> u32 {
    value.div_ceil(2) * 2
}

/// Parse `name` or `name:WxH`.
///
/// Sides are rounded up to even numbers. A missing or unreadable size falls
/// back to 1024×1024.
pub fn parse_model(model: &str) -> ModelSpec {
    let (name, size) = match model.split_once(':') {
        Some((name, size)) => (name, size),
        None => (model, ""),
    };
    let (width, height) = SIZE
        .captures(size)
        .and_then(|caps| Some((caps[1].parse::<u32>().ok()?, caps[2].parse::<u32>().ok()?)))
        .filter(|(w, h)| *w > 0 && *h > 0)
        .map_or((DEFAULT_SIZE, DEFAULT_SIZE), |(w, h)| (round_up_even(w), round_up_even(h)));

    ModelSpec {
        name: name.trim().to_string(),
        width,
        height,
    }
}

/// Whether a prompt asks for a series of images.
pub fn is_multi_image_prompt(prompt: &str) -> bool {
    SERIES_WORDS.iter().any(|word| prompt.contains(word)) || IMAGE_COUNT.is_match(prompt)
}

/// Minimum assets to wait for, when the model and prompt ask for several.
pub fn expected_assets(model: &str, prompt: &str) -> Option<usize> {
    if model != MULTI_IMAGE_MODEL || !is_multi_image_prompt(prompt) {
        return None;
    }
    let count = IMAGE_COUNT
        .captures(prompt)
        .and_then(|caps| caps[1].parse().ok())
        .filter(|n: &usize| *n > 0)
        .unwrap_or(DEFAULT_MULTI_IMAGE_COUNT);
    Some(count)
}

/// Prompt text from the last chat message.
///
/// Content may be a string or a list of parts; text parts are joined.
pub fn prompt_from_messages(messages: &[Value]) -> Result<String> {
    let last = messages
        .last()
        .ok_or_else(|| JimengError::Validation("messages must not be empty".to_string()))?;

    match last.get("content") {
        Some(Value::String(text)) => Ok(text.clone()),
        Some(Value::Array(parts)) => Ok(parts
            .iter()
            .filter(|part| part.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n")),
        _ => Err(JimengError::Validation(
            "last message has no text content".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_model_with_size() {
        assert_eq!(
            parse_model("jimeng-4.0:1920x1080"),
            ModelSpec {
                name: "jimeng-4.0".into(),
                width: 1920,
                height: 1080
            }
        );
        let odd = parse_model("jimeng-3.0:1023*767");
        assert_eq!((odd.width, odd.height), (1024, 768));
    }

    #[test]
    fn test_parse_model_defaults() {
        let plain = parse_model("jimeng-video-3.0");
        assert_eq!(plain.name, "jimeng-video-3.0");
        assert_eq!((plain.width, plain.height), (1024, 1024));

        let junk = parse_model("jimeng-4.0:big");
        assert_eq!((junk.width, junk.height), (1024, 1024));
    }

    #[test]
    fn test_multi_image_detection() {
        assert!(is_multi_image_prompt("画一个连续的故事"));
        assert!(is_multi_image_prompt("生成6张猫"));
        assert!(!is_multi_image_prompt("a cat"));

        assert_eq!(expected_assets("jimeng-4.0", "生成6张猫"), Some(6));
        assert_eq!(expected_assets("jimeng-4.0", "一本绘本"), Some(4));
        assert_eq!(expected_assets("jimeng-3.0", "生成6张猫"), None);
        assert_eq!(expected_assets("jimeng-4.0", "a cat"), None);
    }

    #[test]
    fn test_prompt_from_messages() {
        let messages = vec![
            json!({"role": "user", "content": "first"}),
            json!({"role": "user", "content": "a cat"}),
        ];
        assert_eq!(prompt_from_messages(&messages).unwrap(), "a cat");

        let parts = vec![json!({"role": "user", "content": [
            {"type": "text", "text": "a cat"},
            {"type": "image_url", "image_url": {"url": "https://a/1.png"}},
            {"type": "text", "text": "on a mat"}
        ]})];
        assert_eq!(prompt_from_messages(&parts).unwrap(), "a cat\non a mat");

        assert!(matches!(prompt_from_messages(&[]), Err(JimengError::Validation(_))));
    }
}
