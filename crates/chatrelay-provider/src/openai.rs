use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{
    AssistantBackend, AssistantProfile, BackendError, BackendMessage, FilePurpose,
    GeneratedImage, MediaBackend, NewMessage, RemoteFile, Result, Run, ToolDef, ToolOutput,
};

const ASSISTANTS_BETA: &str = "assistants=v2";
const PAGE_LIMIT: &str = "100";

/// Connection and media settings for the OpenAI-compatible backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiSettings {
    /// Inline key; when absent the key is read from `api_key_env`
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default = "default_chat_model")]
    pub chat_model: String,
    #[serde(default = "default_image_model")]
    pub image_model: String,
    #[serde(default = "default_image_quality")]
    pub image_quality: String,
    #[serde(default = "default_image_size")]
    pub image_size: String,
    #[serde(default = "default_speech_model")]
    pub speech_model: String,
    #[serde(default = "default_voice")]
    pub voice: String,
    #[serde(default = "default_voice_speed")]
    pub voice_speed: f32,
    #[serde(default = "default_transcript_model")]
    pub transcript_model: String,
    #[serde(default)]
    pub transcript_prompt: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".into()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_chat_model() -> String {
    "gpt-4o".into()
}
fn default_image_model() -> String {
    "dall-e-3".into()
}
fn default_image_quality() -> String {
    "standard".into()
}
fn default_image_size() -> String {
    "1024x1024".into()
}
fn default_speech_model() -> String {
    "tts-1-hd".into()
}
fn default_voice() -> String {
    "alloy".into()
}
fn default_voice_speed() -> f32 {
    1.0
}
fn default_transcript_model() -> String {
    "whisper-1".into()
}
fn default_request_timeout_secs() -> u64 {
    60
}

impl Default for OpenAiSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            api_key_env: default_api_key_env(),
            base_url: default_base_url(),
            proxy: None,
            chat_model: default_chat_model(),
            image_model: default_image_model(),
            image_quality: default_image_quality(),
            image_size: default_image_size(),
            speech_model: default_speech_model(),
            voice: default_voice(),
            voice_speed: default_voice_speed(),
            transcript_model: default_transcript_model(),
            transcript_prompt: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl OpenAiSettings {
    pub fn resolve_api_key(&self) -> Result<String> {
        if let Some(key) = self.api_key.as_ref().filter(|k| !k.is_empty()) {
            return Ok(key.clone());
        }
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| BackendError::Config(format!("{} is not set", self.api_key_env)))
    }
}

/// Assistants v2 client plus the image/speech/transcription endpoints.
#[derive(Debug, Clone)]
pub struct OpenAiAssistants {
    client: reqwest::Client,
    api_key: String,
    api_base: String,
    settings: OpenAiSettings,
}

impl OpenAiAssistants {
    pub fn new(api_key: impl Into<String>, settings: OpenAiSettings) -> Result<Self> {
        let mut builder =
            reqwest::Client::builder().timeout(Duration::from_secs(settings.request_timeout_secs));
        if let Some(proxy) = settings.proxy.as_deref().filter(|p| !p.is_empty()) {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| BackendError::Config(format!("invalid proxy {proxy}: {e}")))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| BackendError::Config(e.to_string()))?;

        Ok(Self {
            client,
            api_key: api_key.into(),
            api_base: settings.base_url.trim_end_matches('/').to_string(),
            settings,
        })
    }

    pub fn from_settings(settings: OpenAiSettings) -> Result<Self> {
        let api_key = settings.resolve_api_key()?;
        Self::new(api_key, settings)
    }

    pub fn settings(&self) -> &OpenAiSettings {
        &self.settings
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.api_base, path))
            .header("authorization", format!("Bearer {}", self.api_key))
            .header("OpenAI-Beta", ASSISTANTS_BETA)
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response> {
        let resp = req.send().await.map_err(BackendError::from_transport)?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(BackendError::from_response(status, &text));
        }
        Ok(resp)
    }

    async fn send_json<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T> {
        let resp = self.send(req).await?;
        resp.json::<T>()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))
    }

    async fn find_assistant(&self, name: &str) -> Result<Option<String>> {
        let mut after: Option<String> = None;
        loop {
            let mut req = self
                .request(Method::GET, "/assistants")
                .query(&[("order", "desc"), ("limit", PAGE_LIMIT)]);
            if let Some(cursor) = after.as_deref() {
                req = req.query(&[("after", cursor)]);
            }
            let page: ApiList<ApiAssistant> = self.send_json(req).await?;
            if let Some(found) = page
                .data
                .iter()
                .find(|a| a.name.as_deref() == Some(name))
            {
                return Ok(Some(found.id.clone()));
            }
            match page.next_cursor() {
                Some(cursor) => after = Some(cursor),
                None => return Ok(None),
            }
        }
    }

    async fn file_part(&self, path: &Path) -> Result<Part> {
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "upload".to_string());
        let mime = mime_guess::from_path(path).first_or_octet_stream();
        Part::bytes(bytes)
            .file_name(file_name)
            .mime_str(mime.as_ref())
            .map_err(|e| BackendError::Decode(e.to_string()))
    }
}

#[async_trait]
impl AssistantBackend for OpenAiAssistants {
    async fn ensure_assistant(&self, profile: &AssistantProfile) -> Result<String> {
        let body = ApiAssistantBody::from_profile(profile);
        match self.find_assistant(&profile.name).await? {
            Some(id) => {
                let updated: ApiAssistant = self
                    .send_json(
                        self.request(Method::POST, &format!("/assistants/{id}"))
                            .json(&body),
                    )
                    .await?;
                tracing::info!(assistant_id = %updated.id, name = %profile.name, "assistant updated");
                Ok(updated.id)
            }
            None => {
                let created: ApiAssistant = self
                    .send_json(self.request(Method::POST, "/assistants").json(&body))
                    .await?;
                tracing::info!(assistant_id = %created.id, name = %profile.name, "assistant created");
                Ok(created.id)
            }
        }
    }

    async fn create_session(&self) -> Result<String> {
        let thread: ApiObject = self
            .send_json(
                self.request(Method::POST, "/threads")
                    .json(&serde_json::json!({})),
            )
            .await?;
        Ok(thread.id)
    }

    async fn delete_session(&self, session_id: &str) -> Result<()> {
        self.send(self.request(Method::DELETE, &format!("/threads/{session_id}")))
            .await?;
        Ok(())
    }

    async fn upload_file(&self, path: &Path, purpose: FilePurpose) -> Result<String> {
        let form = Form::new()
            .text("purpose", purpose.as_str())
            .part("file", self.file_part(path).await?);
        let file: ApiObject = self
            .send_json(self.request(Method::POST, "/files").multipart(form))
            .await?;
        tracing::debug!(file_id = %file.id, purpose = purpose.as_str(), path = %path.display(), "file uploaded");
        Ok(file.id)
    }

    async fn create_message(&self, session_id: &str, message: &NewMessage) -> Result<String> {
        let created: ApiObject = self
            .send_json(
                self.request(Method::POST, &format!("/threads/{session_id}/messages"))
                    .json(message),
            )
            .await?;
        Ok(created.id)
    }

    async fn create_run(
        &self,
        session_id: &str,
        assistant_id: &str,
        instructions: Option<&str>,
    ) -> Result<Run> {
        let body = ApiRunRequest {
            assistant_id,
            instructions,
        };
        self.send_json(
            self.request(Method::POST, &format!("/threads/{session_id}/runs"))
                .json(&body),
        )
        .await
    }

    async fn retrieve_run(&self, session_id: &str, run_id: &str) -> Result<Run> {
        self.send_json(self.request(
            Method::GET,
            &format!("/threads/{session_id}/runs/{run_id}"),
        ))
        .await
    }

    async fn submit_tool_outputs(
        &self,
        session_id: &str,
        run_id: &str,
        outputs: &[ToolOutput],
    ) -> Result<Run> {
        self.send_json(
            self.request(
                Method::POST,
                &format!("/threads/{session_id}/runs/{run_id}/submit_tool_outputs"),
            )
            .json(&ApiToolOutputs {
                tool_outputs: outputs,
            }),
        )
        .await
    }

    async fn cancel_run(&self, session_id: &str, run_id: &str) -> Result<Run> {
        self.send_json(self.request(
            Method::POST,
            &format!("/threads/{session_id}/runs/{run_id}/cancel"),
        ))
        .await
    }

    async fn list_messages_after(
        &self,
        session_id: &str,
        after: Option<&str>,
    ) -> Result<Vec<BackendMessage>> {
        let mut messages = Vec::new();
        let mut cursor = after.map(str::to_string);
        loop {
            let mut req = self
                .request(Method::GET, &format!("/threads/{session_id}/messages"))
                .query(&[("order", "asc"), ("limit", PAGE_LIMIT)]);
            if let Some(c) = cursor.as_deref() {
                req = req.query(&[("after", c)]);
            }
            let page: ApiList<BackendMessage> = self.send_json(req).await?;
            let next = page.next_cursor();
            messages.extend(page.data);
            match next {
                Some(c) => cursor = Some(c),
                None => return Ok(messages),
            }
        }
    }

    async fn download_file(&self, file_id: &str) -> Result<RemoteFile> {
        let meta: ApiFile = self
            .send_json(self.request(Method::GET, &format!("/files/{file_id}")))
            .await?;
        let resp = self
            .send(self.request(Method::GET, &format!("/files/{file_id}/content")))
            .await?;
        let bytes = resp.bytes().await.map_err(BackendError::from_transport)?;
        Ok(RemoteFile {
            id: meta.id,
            filename: meta.filename,
            bytes: bytes.to_vec(),
        })
    }
}

#[async_trait]
impl MediaBackend for OpenAiAssistants {
    async fn generate_image(&self, prompt: &str, quality: &str) -> Result<GeneratedImage> {
        let body = serde_json::json!({
            "model": self.settings.image_model,
            "prompt": prompt,
            "n": 1,
            "size": self.settings.image_size,
            "quality": quality,
        });
        let resp: ApiImageResponse = self
            .send_json(self.request(Method::POST, "/images/generations").json(&body))
            .await?;
        let image = resp
            .data
            .into_iter()
            .next()
            .and_then(|d| d.url.map(|url| (url, d.revised_prompt)))
            .ok_or_else(|| BackendError::Decode("image response carried no url".into()))?;
        Ok(GeneratedImage {
            url: image.0,
            revised_prompt: image.1,
        })
    }

    async fn synthesize_speech(&self, text: &str) -> Result<Vec<u8>> {
        let body = serde_json::json!({
            "model": self.settings.speech_model,
            "input": text,
            "voice": self.settings.voice,
            "speed": self.settings.voice_speed,
        });
        let resp = self
            .send(self.request(Method::POST, "/audio/speech").json(&body))
            .await?;
        let bytes = resp.bytes().await.map_err(BackendError::from_transport)?;
        Ok(bytes.to_vec())
    }

    async fn transcribe(&self, path: &Path) -> Result<String> {
        let mut form = Form::new()
            .text("model", self.settings.transcript_model.clone())
            .text("response_format", "text")
            .part("file", self.file_part(path).await?);
        if let Some(prompt) = self.settings.transcript_prompt.clone() {
            form = form.text("prompt", prompt);
        }
        let resp = self
            .send(
                self.request(Method::POST, "/audio/transcriptions")
                    .multipart(form),
            )
            .await?;
        let text = resp.text().await.map_err(BackendError::from_transport)?;
        Ok(text.trim().to_string())
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
        // no credentials: the url points outside the backend
        let resp = self.send(self.client.get(url)).await?;
        let bytes = resp.bytes().await.map_err(BackendError::from_transport)?;
        Ok(bytes.to_vec())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ApiList<T> {
    pub data: Vec<T>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub last_id: Option<String>,
}

impl<T: HasId> ApiList<T> {
    fn next_cursor(&self) -> Option<String> {
        if !self.has_more {
            return None;
        }
        self.last_id
            .clone()
            .or_else(|| self.data.last().map(|item| item.id().to_string()))
    }
}

pub(crate) trait HasId {
    fn id(&self) -> &str;
}

impl HasId for BackendMessage {
    fn id(&self) -> &str {
        &self.id
    }
}

impl HasId for ApiAssistant {
    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ApiObject {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ApiAssistant {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ApiFile {
    pub id: String,
    #[serde(default)]
    pub filename: String,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct ApiAssistantBody<'a> {
    pub model: &'a str,
    pub name: &'a str,
    pub description: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<&'a str>,
    pub tools: Vec<ApiAssistantTool<'a>>,
}

impl<'a> ApiAssistantBody<'a> {
    fn from_profile(profile: &'a AssistantProfile) -> Self {
        let mut tools = vec![ApiAssistantTool::CodeInterpreter, ApiAssistantTool::FileSearch];
        tools.extend(
            profile
                .tools
                .iter()
                .map(|function| ApiAssistantTool::Function { function }),
        );
        Self {
            model: &profile.model,
            name: &profile.name,
            description: &profile.description,
            instructions: profile.instructions.as_deref(),
            tools,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum ApiAssistantTool<'a> {
    CodeInterpreter,
    FileSearch,
    Function { function: &'a ToolDef },
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct ApiRunRequest<'a> {
    pub assistant_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<&'a str>,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct ApiToolOutputs<'a> {
    pub tool_outputs: &'a [ToolOutput],
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ApiImageResponse {
    #[serde(default)]
    pub data: Vec<ApiImageData>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ApiImageData {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub revised_prompt: Option<String>,
}
