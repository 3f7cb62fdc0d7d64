use anyhow::{Context, Result};
use minijinja::Environment;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const BOS_TOKEN: &str = "<s>";
pub const EOS_TOKEN: &str = "</s>";
pub const ASSISTANT_MARKER: &str = "<|assistant|>";
const CHAT_TEMPLATE_NAME: &str = "hf_chat_template";

/// TinyLlama-Chat (Zephyr-style) markup: each turn is wrapped in a role
/// marker and closed with the eos token, and the generation cue is a bare
/// assistant marker at the end.
const DEFAULT_CHAT_TEMPLATE: &str = r#"{% for message in messages %}{% if message.role == "system" %}{{ "<|system|>\n" ~ message.content ~ eos_token ~ "\n" }}{% elif message.role == "user" %}{{ "<|user|>\n" ~ message.content ~ eos_token ~ "\n" }}{% elif message.role == "assistant" %}{{ "<|assistant|>\n" ~ message.content ~ eos_token ~ "\n" }}{% endif %}{% if loop.last and add_generation_prompt %}{{ "<|assistant|>\n" }}{% endif %}{% endfor %}"#;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

/// Keep only turns the model template knows how to render: user/assistant
/// roles with non-empty content. Everything else is dropped, not rejected.
pub fn filter_history(turns: &[ChatTurn]) -> Vec<ChatTurn> {
    turns
        .iter()
        .filter(|t| matches!(t.role.as_str(), "user" | "assistant"))
        .filter(|t| !t.content.trim().is_empty())
        .cloned()
        .collect()
}

/// Filter the caller-supplied history and append `message` as the final user
/// turn. `None` means there is nothing usable to send to the model.
pub fn assemble_turns(message: &str, history: &[ChatTurn]) -> Option<Vec<ChatTurn>> {
    if message.trim().is_empty() {
        return None;
    }
    let mut turns = filter_history(history);
    turns.push(ChatTurn::user(message));
    Some(turns)
}

/// Take the text after the last assistant marker and trim it. Generated
/// output always follows the generation cue, so everything before the last
/// marker is prompt echo.
pub fn extract_reply(decoded: &str) -> String {
    let tail = decoded
        .rsplit_once(ASSISTANT_MARKER)
        .map(|(_, tail)| tail)
        .unwrap_or(decoded);
    let end = tail.find(EOS_TOKEN).unwrap_or(tail.len());
    tail[..end].trim().to_string()
}

#[derive(Serialize)]
struct TemplateContext<'a> {
    bos_token: &'a str,
    eos_token: &'a str,
    messages: &'a [ChatTurn],
    add_generation_prompt: bool,
}

/// Compiled chat template, constructed once at startup and shared read-only
/// with the request handler.
pub struct PromptTemplate {
    env: Environment<'static>,
}

impl PromptTemplate {
    /// Compile the embedded TinyLlama template, or a replacement read from
    /// `override_path` (the `CHAT_TEMPLATE_PATH` hook).
    pub fn load(override_path: Option<&Path>) -> Result<Self> {
        let mut env = Environment::new();
        match override_path {
            Some(path) => {
                let raw = fs::read_to_string(path).with_context(|| {
                    format!("failed to read chat template ({})", path.display())
                })?;
                let src: &'static str = Box::leak(raw.into_boxed_str());
                env.add_template(CHAT_TEMPLATE_NAME, src).with_context(|| {
                    format!("failed to compile chat template ({})", path.display())
                })?;
            }
            None => {
                env.add_template(CHAT_TEMPLATE_NAME, DEFAULT_CHAT_TEMPLATE)
                    .context("failed to compile built-in chat template")?;
            }
        }
        Ok(Self { env })
    }

    /// Render a full prompt, generation cue included.
    pub fn render(&self, turns: &[ChatTurn]) -> Result<String> {
        let ctx = TemplateContext {
            bos_token: BOS_TOKEN,
            eos_token: EOS_TOKEN,
            messages: turns,
            add_generation_prompt: true,
        };
        let prompt = self.env.get_template(CHAT_TEMPLATE_NAME)?.render(&ctx)?;
        Ok(prompt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(role: &str, content: &str) -> ChatTurn {
        ChatTurn {
            role: role.into(),
            content: content.into(),
        }
    }

    #[test]
    fn filter_drops_foreign_roles_and_empty_content() {
        let history = vec![
            turn("system", "ignored"),
            turn("user", "prior turn"),
            turn("assistant", "   "),
            turn("tool", "also ignored"),
            turn("assistant", "kept"),
        ];
        let filtered = filter_history(&history);
        assert_eq!(filtered, vec![turn("user", "prior turn"), turn("assistant", "kept")]);
    }

    #[test]
    fn filter_is_idempotent() {
        let history = vec![
            turn("system", "ignored"),
            turn("user", "hi"),
            turn("assistant", ""),
        ];
        let once = filter_history(&history);
        let twice = filter_history(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn assemble_rejects_whitespace_only_message() {
        assert!(assemble_turns("", &[]).is_none());
        assert!(assemble_turns("   \n", &[turn("user", "earlier")]).is_none());
    }

    #[test]
    fn assemble_appends_message_as_final_user_turn() {
        let turns = assemble_turns("Hi", &[turn("assistant", "hello")]).unwrap();
        assert_eq!(turns.last().unwrap(), &turn("user", "Hi"));
        assert_eq!(turns.len(), 2);
    }

    #[test]
    fn empty_history_renders_exactly_one_user_turn() {
        let template = PromptTemplate::load(None).unwrap();
        let turns = assemble_turns("Hello", &[]).unwrap();
        let prompt = template.render(&turns).unwrap();
        assert_eq!(prompt.matches("<|user|>").count(), 1);
        assert_eq!(prompt, "<|user|>\nHello</s>\n<|assistant|>\n");
    }

    #[test]
    fn render_ends_with_generation_cue() {
        let template = PromptTemplate::load(None).unwrap();
        let turns = vec![turn("user", "a"), turn("assistant", "b"), turn("user", "c")];
        let prompt = template.render(&turns).unwrap();
        assert!(prompt.ends_with("<|assistant|>\n"));
        assert!(prompt.contains("<|user|>\na</s>\n<|assistant|>\nb</s>\n<|user|>\nc</s>\n"));
    }

    #[test]
    fn system_entries_never_reach_the_prompt() {
        let template = PromptTemplate::load(None).unwrap();
        let history = vec![turn("system", "ignored"), turn("user", "prior turn")];
        let turns = assemble_turns("Hi", &history).unwrap();
        let prompt = template.render(&turns).unwrap();
        assert!(prompt.contains("prior turn"));
        assert!(!prompt.contains("ignored"));
        assert!(!prompt.contains("<|system|>"));
    }

    #[test]
    fn extract_takes_text_after_last_marker() {
        let decoded = "<|user|>\nHi\n<|assistant|>\nfirst\n<|user|>\nMore\n<|assistant|>\n  the reply  ";
        assert_eq!(extract_reply(decoded), "the reply");
    }

    #[test]
    fn extracted_reply_never_contains_the_marker() {
        let decoded = "<|user|>\nHi\n<|assistant|>\nanswer";
        let reply = extract_reply(decoded);
        assert!(!reply.contains(ASSISTANT_MARKER));
    }

    #[test]
    fn extract_stops_at_stray_eos() {
        let decoded = "<|assistant|>\nanswer</s>\n<|user|>ghost turn";
        assert_eq!(extract_reply(decoded), "answer");
    }

    #[test]
    fn extract_without_marker_returns_trimmed_input() {
        assert_eq!(extract_reply("  plain text  "), "plain text");
    }
}
