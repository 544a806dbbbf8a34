use std::path::PathBuf;
use std::sync::OnceLock;

use chatrelay_core::{BotConfig, WHITELIST_ALL};
use chatrelay_schema::InboundEvent;
use regex::Regex;

/// What an accepted event contributes to the turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Text(String),
    /// Voice message to transcribe; the transcript becomes the text
    Voice(PathBuf),
}

/// Decides which inbound events start a turn and extracts their text.
#[derive(Debug, Clone)]
pub struct InboundFilter {
    bot: BotConfig,
}

impl InboundFilter {
    pub fn new(bot: BotConfig) -> Self {
        Self { bot }
    }

    pub fn bot(&self) -> &BotConfig {
        &self.bot
    }

    /// What to act on, or `None` when the event is ignored.
    ///
    /// Groups: whitelisted rooms only; voice messages when enabled, own
    /// messages need a self prefix, others must mention the bot. Single chats:
    /// whitelisted senders only; own messages need a self prefix, others a
    /// trigger prefix when any is configured (so voice only passes without one).
    pub fn accept(&self, event: &InboundEvent) -> Option<Admission> {
        let text = event.text.trim();
        let accepted = if event.is_group {
            if !listed(&self.bot.group_whitelist, event.conversation_id.as_str()) {
                return None;
            }
            if let Some(voice) = &event.voice {
                return self.bot.group_voice_msg.then(|| Admission::Voice(voice.clone()));
            }
            if event.from_self {
                strip_any_prefix(text, &self.bot.self_prefix)?
            } else if event.is_mention {
                strip_mentions(text)
            } else {
                return None;
            }
        } else {
            if !listed(&self.bot.single_chat_whitelist, &event.sender.handle) {
                return None;
            }
            if event.from_self {
                strip_any_prefix(text, &self.bot.self_prefix)?
            } else if self.bot.single_chat_prefix.is_empty() {
                if let Some(voice) = &event.voice {
                    return Some(Admission::Voice(voice.clone()));
                }
                text.to_string()
            } else {
                strip_any_prefix(text, &self.bot.single_chat_prefix)?
            }
        };

        // A bare mention still counts when it quotes something or carries files
        if accepted.is_empty() && event.quoted.is_none() && event.attachments.is_empty() {
            return None;
        }
        Some(Admission::Text(accepted))
    }
}

fn listed(whitelist: &[String], id: &str) -> bool {
    whitelist.iter().any(|w| w == WHITELIST_ALL || w == id)
}

fn strip_any_prefix(text: &str, prefixes: &[String]) -> Option<String> {
    prefixes
        .iter()
        .filter(|p| !p.is_empty())
        .find_map(|p| text.strip_prefix(p.as_str()))
        .map(|rest| rest.trim().to_string())
}

/// Remove every `@name` up to and including the following whitespace
/// (the transport separates mentions with U+2005, which `\s` covers).
pub fn strip_mentions(text: &str) -> String {
    static MENTION: OnceLock<Regex> = OnceLock::new();
    let re = MENTION.get_or_init(|| Regex::new(r"@.*?(\s|$)").expect("mention pattern is valid"));
    re.replace_all(text, "").trim().to_string()
}
