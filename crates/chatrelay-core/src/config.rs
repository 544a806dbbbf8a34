use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chatrelay_provider::OpenAiSettings;
use chatrelay_schema::ConversationId;
use serde::{Deserialize, Serialize};

use crate::monitor::MonitorConfig;
use crate::preset::DEFAULT_PRESET;
use crate::run_driver::PollPolicy;

/// Wildcard entry for the whitelists.
pub const WHITELIST_ALL: &str = "$all";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub openai: OpenAiSettings,
    #[serde(default)]
    pub assistant: AssistantConfig,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub bot: BotConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default = "default_presets_dir")]
    pub presets_dir: PathBuf,
    #[serde(default = "default_preset_name")]
    pub default_preset: String,
    /// conversation id -> preset name
    #[serde(default)]
    pub group_presets: HashMap<String, String>,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

fn default_presets_dir() -> PathBuf {
    PathBuf::from("presets")
}

fn default_preset_name() -> String {
    DEFAULT_PRESET.to_string()
}

fn default_scratch_dir() -> PathBuf {
    PathBuf::from("temp")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            openai: OpenAiSettings::default(),
            assistant: AssistantConfig::default(),
            run: RunConfig::default(),
            bot: BotConfig::default(),
            admin: AdminConfig::default(),
            presets_dir: default_presets_dir(),
            default_preset: default_preset_name(),
            group_presets: HashMap::new(),
            tools: ToolsConfig::default(),
            monitor: MonitorConfig::default(),
            scratch_dir: default_scratch_dir(),
            log_dir: default_log_dir(),
        }
    }
}

impl RelayConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&text)
            .with_context(|| format!("failed to parse yaml file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.openai.chat_model.trim().is_empty() {
            return Err(anyhow!("openai.chat_model must not be empty"));
        }
        if self.assistant.name.trim().is_empty() {
            return Err(anyhow!("assistant.name must not be empty"));
        }
        if self.run.backoff_factor < 1.0 {
            return Err(anyhow!("run.backoff_factor must be >= 1.0"));
        }
        if self.run.max_poll_interval_ms < self.run.poll_interval_ms {
            return Err(anyhow!(
                "run.max_poll_interval_ms must not be below run.poll_interval_ms"
            ));
        }
        for watch in &self.monitor.watches {
            if !watch.live_pointer.starts_with('/') {
                return Err(anyhow!(
                    "monitor watch {}: live_pointer must start with '/'",
                    watch.name
                ));
            }
        }
        Ok(())
    }

    /// Preset assignments to seed the session registry with.
    pub fn preset_assignments(&self) -> HashMap<ConversationId, String> {
        self.group_presets
            .iter()
            .map(|(conv, preset)| (ConversationId::new(conv.as_str()), preset.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantConfig {
    #[serde(default = "default_assistant_name")]
    pub name: String,
    #[serde(default = "default_assistant_description")]
    pub description: String,
}

fn default_assistant_name() -> String {
    "chatrelay".to_string()
}

fn default_assistant_description() -> String {
    "You are a helpful assistant.".to_string()
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            name: default_assistant_name(),
            description: default_assistant_description(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// 0 disables the deadline
    #[serde(default = "default_max_run_secs")]
    pub max_run_secs: u64,
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_max_poll_interval_ms() -> u64 {
    2000
}

fn default_backoff_factor() -> f64 {
    1.5
}

fn default_max_run_secs() -> u64 {
    600
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_poll_interval_ms: default_max_poll_interval_ms(),
            backoff_factor: default_backoff_factor(),
            max_run_secs: default_max_run_secs(),
        }
    }
}

impl RunConfig {
    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            initial: Duration::from_millis(self.poll_interval_ms),
            max: Duration::from_millis(self.max_poll_interval_ms),
            factor: self.backoff_factor,
            deadline: (self.max_run_secs > 0).then(|| Duration::from_secs(self.max_run_secs)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    #[serde(default = "default_whitelist")]
    pub group_whitelist: Vec<String>,
    #[serde(default = "default_whitelist")]
    pub single_chat_whitelist: Vec<String>,
    /// Own messages are only handled when they start with one of these
    #[serde(default)]
    pub self_prefix: Vec<String>,
    /// Empty means every single-chat message triggers a turn
    #[serde(default = "default_single_chat_prefix")]
    pub single_chat_prefix: Vec<String>,
    /// Transcribe voice messages in whitelisted groups and answer them
    #[serde(default)]
    pub group_voice_msg: bool,
}

fn default_whitelist() -> Vec<String> {
    vec![WHITELIST_ALL.to_string()]
}

fn default_single_chat_prefix() -> Vec<String> {
    vec!["$ai".to_string()]
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            group_whitelist: default_whitelist(),
            single_chat_whitelist: default_whitelist(),
            self_prefix: Vec::new(),
            single_chat_prefix: default_single_chat_prefix(),
            group_voice_msg: false,
        }
    }
}

/// Admin command names, in help order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminCommand {
    Help,
    ClearChat,
    LoadPreset,
    ResetPreset,
    ListPreset,
    ChatId,
}

impl AdminCommand {
    pub const ALL: [AdminCommand; 6] = [
        AdminCommand::Help,
        AdminCommand::ClearChat,
        AdminCommand::LoadPreset,
        AdminCommand::ResetPreset,
        AdminCommand::ListPreset,
        AdminCommand::ChatId,
    ];

    pub fn description(self) -> &'static str {
        match self {
            AdminCommand::Help => "show this help",
            AdminCommand::ClearChat => "clear the memory of this conversation",
            AdminCommand::LoadPreset => "<preset name> load a preset for this conversation",
            AdminCommand::ResetPreset => "drop the preset of this conversation",
            AdminCommand::ListPreset => "list available presets",
            AdminCommand::ChatId => "show the id of this conversation",
        }
    }

    fn default_keyword(self) -> &'static str {
        match self {
            AdminCommand::Help => "$help",
            AdminCommand::ClearChat => "$clear",
            AdminCommand::LoadPreset => "$preset",
            AdminCommand::ResetPreset => "$reset_preset",
            AdminCommand::ListPreset => "$list_preset",
            AdminCommand::ChatId => "$chat_id",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    /// Sender handles allowed to run admin commands
    #[serde(default)]
    pub admins: Vec<String>,
    /// command -> keyword typed in chat
    #[serde(default = "default_keywords")]
    pub commands: BTreeMap<AdminCommand, String>,
}

fn default_keywords() -> BTreeMap<AdminCommand, String> {
    AdminCommand::ALL
        .iter()
        .map(|c| (*c, c.default_keyword().to_string()))
        .collect()
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            admins: Vec::new(),
            commands: default_keywords(),
        }
    }
}

impl AdminConfig {
    pub fn is_admin(&self, handle: &str) -> bool {
        self.admins.iter().any(|a| a == handle)
    }

    /// Longest keyword wins so `$preset` never shadows `$presets`-style keys.
    pub fn match_command<'a>(&self, text: &'a str) -> Option<(AdminCommand, &'a str)> {
        self.commands
            .iter()
            .filter(|(_, keyword)| !keyword.is_empty() && text.starts_with(keyword.as_str()))
            .max_by_key(|(_, keyword)| keyword.len())
            .map(|(command, keyword)| (*command, text[keyword.len()..].trim()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "enabled")]
    pub text_to_image: bool,
    #[serde(default = "enabled")]
    pub text_to_speech: bool,
    #[serde(default = "enabled")]
    pub audio_transcript: bool,
    #[serde(default = "enabled")]
    pub browse_link: bool,
    #[serde(default)]
    pub bing_search: Option<BingSearchConfig>,
}

fn enabled() -> bool {
    true
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            text_to_image: true,
            text_to_speech: true,
            audio_transcript: true,
            browse_link: true,
            bing_search: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BingSearchConfig {
    #[serde(default = "enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
}
