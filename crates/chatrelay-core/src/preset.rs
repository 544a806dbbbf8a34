//! Presets: a system prompt plus a message template, loaded from
//! `<presets_dir>/<name>.yaml`.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chatrelay_schema::SenderIdentity;
use serde::Deserialize;

pub const DEFAULT_PRESET: &str = "default";
const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";
const DEFAULT_TEMPLATE: &str = "{message}";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preset {
    pub name: String,
    pub description: String,
    pub system_prompt: String,
    /// Placeholders: `{message}`, `{handle}` (alias `{wxcode}`), `{nickname}`
    pub message_template: String,
}

/// Keys left empty in YAML deserialize as `None`, same as missing keys.
#[derive(Debug, Deserialize)]
struct PresetFile {
    #[serde(default)]
    desc: Option<String>,
    #[serde(default)]
    sys_prompt: Option<String>,
    #[serde(default)]
    msg_format: Option<String>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl Preset {
    pub fn builtin_default() -> Self {
        Self {
            name: DEFAULT_PRESET.to_string(),
            description: "Built-in default preset".to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            message_template: DEFAULT_TEMPLATE.to_string(),
        }
    }

    pub fn from_yaml(name: &str, text: &str) -> Result<Self> {
        let file: PresetFile =
            serde_yaml::from_str(text).with_context(|| format!("invalid preset {name}"))?;
        Ok(Self {
            name: name.to_string(),
            description: file.desc.unwrap_or_default(),
            system_prompt: non_blank(file.sys_prompt).unwrap_or_default(),
            message_template: non_blank(file.msg_format)
                .unwrap_or_else(|| DEFAULT_TEMPLATE.to_string()),
        })
    }

    pub fn render(&self, message: &str, sender: &SenderIdentity) -> String {
        render_template(
            &self.message_template,
            &[
                ("message", message),
                ("handle", sender.handle.as_str()),
                ("wxcode", sender.handle.as_str()),
                ("nickname", sender.display_name.as_str()),
            ],
        )
    }
}

/// Single pass, so placeholder-looking text inside a value is left alone.
fn render_template(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let tail = &rest[start + 1..];
        let hit = vars
            .iter()
            .find(|(key, _)| tail.starts_with(key) && tail[key.len()..].starts_with('}'));
        match hit {
            Some((key, value)) => {
                out.push_str(value);
                rest = &tail[key.len() + 1..];
            }
            None => {
                out.push('{');
                rest = tail;
            }
        }
    }
    out.push_str(rest);
    out
}

#[derive(Debug, Clone)]
pub struct PresetLibrary {
    presets: BTreeMap<String, Arc<Preset>>,
    default_name: String,
}

impl PresetLibrary {
    pub fn new(presets: Vec<Preset>, default_name: &str) -> Self {
        let mut map: BTreeMap<String, Arc<Preset>> = presets
            .into_iter()
            .map(|p| (p.name.clone(), Arc::new(p)))
            .collect();
        if !map.contains_key(default_name) {
            let mut fallback = Preset::builtin_default();
            fallback.name = default_name.to_string();
            map.insert(default_name.to_string(), Arc::new(fallback));
        }
        Self {
            presets: map,
            default_name: default_name.to_string(),
        }
    }

    /// Load every `*.yaml` file in `dir`. A missing directory yields only the
    /// built-in default.
    pub fn load_dir(dir: &Path, default_name: &str) -> Result<Self> {
        let mut presets = Vec::new();
        if dir.is_dir() {
            let entries = std::fs::read_dir(dir)
                .with_context(|| format!("failed to read preset dir {}", dir.display()))?;
            for entry in entries {
                let path = entry?.path();
                let is_yaml = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e == "yaml" || e == "yml");
                if !is_yaml {
                    continue;
                }
                let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                let text = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                presets.push(Preset::from_yaml(name, &text)?);
            }
        } else {
            tracing::warn!(dir = %dir.display(), "preset directory missing, using built-in default");
        }
        let library = Self::new(presets, default_name);
        tracing::info!(count = library.presets.len(), "presets loaded");
        Ok(library)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Preset>> {
        self.presets.get(name).cloned()
    }

    pub fn default_preset(&self) -> Arc<Preset> {
        // `new` always inserts the default
        self.presets
            .get(&self.default_name)
            .cloned()
            .unwrap_or_else(|| Arc::new(Preset::builtin_default()))
    }

    /// The named preset, or the default when the name is unknown or absent.
    pub fn resolve(&self, name: Option<&str>) -> Arc<Preset> {
        name.and_then(|n| self.get(n))
            .unwrap_or_else(|| self.default_preset())
    }

    pub fn default_name(&self) -> &str {
        &self.default_name
    }

    pub fn names(&self) -> Vec<String> {
        self.presets.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Preset>> {
        self.presets.values()
    }
}

impl Default for PresetLibrary {
    fn default() -> Self {
        Self::new(Vec::new(), DEFAULT_PRESET)
    }
}
