use std::sync::Arc;

use chatrelay_provider::{AssistantBackend, MediaBackend};

use crate::config::ToolsConfig;
use crate::image_tool::TextToImageTool;
use crate::scratch::ScratchDir;
use crate::speech_tool::{AudioTranscriptTool, TextToSpeechTool};
use crate::tool::ToolRegistry;
use crate::web_fetch_tool::BrowseLinkTool;
use crate::web_search_tool::BingSearchTool;

/// Shared handles the built-in tools are constructed from.
#[derive(Clone)]
pub struct ToolDeps {
    pub backend: Arc<dyn AssistantBackend>,
    pub media: Arc<dyn MediaBackend>,
    pub scratch: ScratchDir,
    pub proxy: Option<String>,
}

/// Build the registry of enabled tools. A tool whose configuration is
/// unusable is skipped with a warning instead of failing startup.
pub fn builtin_tools(config: &ToolsConfig, deps: &ToolDeps) -> ToolRegistry {
    let mut registry = ToolRegistry::new();

    if config.text_to_image {
        registry.register(TextToImageTool::new(deps.media.clone(), deps.scratch.clone()));
    }
    if config.text_to_speech {
        registry.register(TextToSpeechTool::new(deps.media.clone(), deps.scratch.clone()));
    }
    if config.audio_transcript {
        registry.register(AudioTranscriptTool::new(
            deps.backend.clone(),
            deps.media.clone(),
            deps.scratch.clone(),
        ));
    }
    if config.browse_link {
        match BrowseLinkTool::new(deps.proxy.as_deref()) {
            Ok(tool) => registry.register(tool),
            Err(e) => tracing::warn!(tool = "browse_link", error = %e, "tool skipped"),
        }
    }
    if let Some(bing) = config.bing_search.as_ref().filter(|b| b.enabled) {
        match bing.api_key.as_deref().map(str::trim).filter(|k| !k.is_empty()) {
            Some(key) => registry.register(BingSearchTool::new(key, bing.endpoint.as_deref())),
            None => tracing::warn!(tool = "bing_search", "tool skipped: api_key missing"),
        }
    }

    tracing::info!(tools = ?registry.names(), "tools registered");
    registry
}
