use std::sync::Arc;

use async_trait::async_trait;
use chatrelay_provider::{AssistantBackend, MediaBackend, ToolDef};
use chatrelay_schema::OutputFragment;
use serde::Deserialize;

use crate::scratch::ScratchDir;
use crate::tool::{Tool, ToolContext, ToolError};

#[derive(Debug, Deserialize)]
pub struct TextToSpeechArgs {
    pub text: String,
}

pub struct TextToSpeechTool {
    media: Arc<dyn MediaBackend>,
    scratch: ScratchDir,
}

impl TextToSpeechTool {
    pub fn new(media: Arc<dyn MediaBackend>, scratch: ScratchDir) -> Self {
        Self { media, scratch }
    }
}

#[async_trait]
impl Tool for TextToSpeechTool {
    type Args = TextToSpeechArgs;

    fn definition(&self) -> ToolDef {
        ToolDef {
            name: "text_to_speech".into(),
            description: "Generate audio speech according to user provided text. 根据用户提供的文本生成语音. Only call this function when user wants you to speak, read out loud, or generate audio speech.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "text": {
                        "type": "string",
                        "description": "User provided text for generating the speech audio. 用户提供的文本，用于生成语音"
                    }
                },
                "required": ["text"]
            }),
        }
    }

    async fn invoke(&self, args: TextToSpeechArgs, ctx: &ToolContext<'_>) -> Result<String, ToolError> {
        ctx.emit(OutputFragment::text("Generating speech...")).await;
        tracing::info!(chars = args.text.chars().count(), "synthesizing speech");

        let audio = self.media.synthesize_speech(&args.text).await?;
        let path = self
            .scratch
            .write(&ScratchDir::timestamped_name("speech", "mp3"), &audio)
            .await
            .map_err(|e| ToolError::failed(format!("cannot save speech: {e}")))?;

        ctx.emit(OutputFragment::audio(path)).await;
        Ok("Speech generated and sent to the user".to_string())
    }
}

#[derive(Debug, Deserialize)]
pub struct AudioTranscriptArgs {
    pub file_id: String,
}

/// Transcribes an audio file the backend already holds.
pub struct AudioTranscriptTool {
    backend: Arc<dyn AssistantBackend>,
    media: Arc<dyn MediaBackend>,
    scratch: ScratchDir,
}

impl AudioTranscriptTool {
    pub fn new(
        backend: Arc<dyn AssistantBackend>,
        media: Arc<dyn MediaBackend>,
        scratch: ScratchDir,
    ) -> Self {
        Self {
            backend,
            media,
            scratch,
        }
    }
}

#[async_trait]
impl Tool for AudioTranscriptTool {
    type Args = AudioTranscriptArgs;

    fn definition(&self) -> ToolDef {
        ToolDef {
            name: "audio_transcript".into(),
            description: "Generate transcript based on audio file".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "file_id": {
                        "type": "string",
                        "description": "OpenAI file id of the audio file"
                    }
                },
                "required": ["file_id"]
            }),
        }
    }

    async fn invoke(&self, args: AudioTranscriptArgs, ctx: &ToolContext<'_>) -> Result<String, ToolError> {
        ctx.emit(OutputFragment::text("Analyzing audio...")).await;
        tracing::info!(file_id = %args.file_id, "transcribing audio");

        let file = self.backend.download_file(&args.file_id).await?;
        let name = if file.filename.is_empty() {
            format!("{}.mp3", file.id)
        } else {
            format!("{}_{}", file.id, file.filename)
        };
        let path = self
            .scratch
            .write(&name, &file.bytes)
            .await
            .map_err(|e| ToolError::failed(format!("cannot save audio: {e}")))?;

        Ok(self.media.transcribe(&path).await?)
    }
}
