use std::collections::BTreeMap;

use serde_json::Value;

use super::command_registry::{
    CommandSpec, MULTI_PATH_COMMANDS, NO_ARG_COMMANDS, SINGLE_PATH_COMMANDS, STYLE_COMMANDS,
};
use crate::styles::{HairColor, Haircut, Look};

#[derive(Debug, Clone, PartialEq)]
pub struct Intent {
    pub action: String,
    pub raw: String,
    pub style_update: BTreeMap<String, Value>,
    pub command_args: BTreeMap<String, Value>,
}

impl Intent {
    fn new(action: &str, raw: &str) -> Self {
        Self {
            action: action.to_string(),
            raw: raw.to_string(),
            style_update: BTreeMap::new(),
            command_args: BTreeMap::new(),
        }
    }
}

fn find_action(command: &str, specs: &[CommandSpec]) -> Option<&'static str> {
    specs
        .iter()
        .find(|spec| spec.command == command)
        .map(|spec| spec.action)
}

fn parse_path_args(arg: &str) -> Vec<String> {
    if arg.trim().is_empty() {
        return Vec::new();
    }
    match shell_words::split(arg) {
        Ok(parts) => parts
            .into_iter()
            .filter(|value| !value.is_empty())
            .collect(),
        Err(_) => arg
            .split_whitespace()
            .map(str::to_string)
            .filter(|value| !value.is_empty())
            .collect(),
    }
}

fn parse_single_path_arg(arg: &str) -> String {
    let parts = parse_path_args(arg);
    match parts.len() {
        0 => String::new(),
        1 => parts[0].clone(),
        _ => parts.join(" "),
    }
}

/// Free text like `mullet ginger hbo` names one option per category. Returns `None`
/// when any word is not a known option.
fn parse_style_words(text: &str) -> Option<BTreeMap<String, Value>> {
    let mut update = BTreeMap::new();
    for word in text.split([' ', ',', '+']).filter(|word| !word.is_empty()) {
        if let Some(haircut) = Haircut::parse(word) {
            update.insert("haircut".to_string(), Value::String(haircut.value().into()));
        } else if let Some(color) = HairColor::parse(word) {
            update.insert("color".to_string(), Value::String(color.value().into()));
        } else if let Some(look) = Look::parse(word) {
            update.insert("look".to_string(), Value::String(look.value().into()));
        } else {
            return None;
        }
    }
    (!update.is_empty()).then_some(update)
}

pub fn parse_intent(text: &str) -> Intent {
    let raw_trimmed = text.trim();
    if raw_trimmed.is_empty() {
        return Intent::new("noop", text);
    }

    if let Some(slash_tail) = raw_trimmed.strip_prefix('/') {
        let command_len = slash_tail
            .chars()
            .take_while(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
            .count();
        if command_len > 0 {
            let command = slash_tail[..command_len].to_ascii_lowercase();
            let arg = slash_tail[command_len..].trim();

            if let Some(action) = find_action(&command, STYLE_COMMANDS) {
                let mut intent = Intent::new(action, text);
                intent.command_args.insert(
                    "value".to_string(),
                    Value::String(arg.to_ascii_lowercase()),
                );
                return intent;
            }

            if let Some(action) = find_action(&command, SINGLE_PATH_COMMANDS) {
                let mut intent = Intent::new(action, text);
                intent.command_args.insert(
                    "path".to_string(),
                    Value::String(parse_single_path_arg(arg)),
                );
                return intent;
            }

            if let Some(action) = find_action(&command, MULTI_PATH_COMMANDS) {
                let mut intent = Intent::new(action, text);
                intent.command_args.insert(
                    "paths".to_string(),
                    Value::Array(
                        parse_path_args(arg)
                            .into_iter()
                            .map(Value::String)
                            .collect(),
                    ),
                );
                return intent;
            }

            if let Some(action) = find_action(&command, NO_ARG_COMMANDS) {
                return Intent::new(action, text);
            }

            let mut intent = Intent::new("unknown", text);
            intent
                .command_args
                .insert("command".to_string(), Value::String(command));
            intent
                .command_args
                .insert("arg".to_string(), Value::String(arg.to_string()));
            return intent;
        }
    }

    if let Some(update) = parse_style_words(raw_trimmed) {
        let mut intent = Intent::new("style", text);
        intent.style_update = update;
        return intent;
    }

    let mut intent = Intent::new("unknown", text);
    intent.command_args.insert(
        "arg".to_string(),
        Value::String(raw_trimmed.to_string()),
    );
    intent
}
