use std::sync::Arc;

use async_trait::async_trait;
use chatrelay_provider::{MediaBackend, ToolDef};
use chatrelay_schema::OutputFragment;
use serde::Deserialize;

use crate::scratch::ScratchDir;
use crate::tool::{Tool, ToolContext, ToolError};

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ImageQuality {
    Standard,
    Hd,
}

impl ImageQuality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Hd => "hd",
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TextToImageArgs {
    pub prompt: String,
    pub quality: ImageQuality,
}

/// Generates an image, downloads it into scratch and sends it to the user.
pub struct TextToImageTool {
    media: Arc<dyn MediaBackend>,
    scratch: ScratchDir,
}

impl TextToImageTool {
    pub fn new(media: Arc<dyn MediaBackend>, scratch: ScratchDir) -> Self {
        Self { media, scratch }
    }
}

#[async_trait]
impl Tool for TextToImageTool {
    type Args = TextToImageArgs;

    fn definition(&self) -> ToolDef {
        ToolDef {
            name: "text_to_image".into(),
            description: "Generate image or photo based on user text prompt when user explicitly requests to generate iamge or photo".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "prompt": {
                        "type": "string",
                        "description": "User's text description of the desired image."
                    },
                    "quality": {
                        "type": "string",
                        "description": "The quality of the image that will be generated. hd creates images with finer details and greater consistency across the image.",
                        "enum": ["standard", "hd"]
                    }
                },
                "required": ["prompt", "quality"]
            }),
        }
    }

    async fn invoke(&self, args: TextToImageArgs, ctx: &ToolContext<'_>) -> Result<String, ToolError> {
        ctx.emit(OutputFragment::text(format!(
            "Generating your image ({})...",
            args.quality.as_str()
        )))
        .await;

        let image = self
            .media
            .generate_image(&args.prompt, args.quality.as_str())
            .await?;
        let revised = image.revised_prompt.unwrap_or_default();

        let bytes = match self.media.fetch_bytes(&image.url).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(url = %image.url, error = %e, "generated image download failed");
                return Ok(format!(
                    "Failed to download the image. Image url: {}, revised prompt: {revised}",
                    image.url
                ));
            }
        };
        let path = self
            .scratch
            .write(&ScratchDir::timestamped_name("openai_image", "png"), &bytes)
            .await
            .map_err(|e| ToolError::failed(format!("cannot save image: {e}")))?;

        ctx.emit(OutputFragment::image(path)).await;
        Ok(format!(
            "Image generated and sent to the user. Revised prompt: {revised}"
        ))
    }
}
