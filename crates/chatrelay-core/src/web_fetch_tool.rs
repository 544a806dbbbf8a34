use async_trait::async_trait;
use chatrelay_provider::ToolDef;
use chatrelay_schema::OutputFragment;
use serde::Deserialize;

use crate::tool::{Tool, ToolContext, ToolError};

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MAX_CHARS: usize = 20_000;
const MAX_REDIRECTS: usize = 5;
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36";

#[derive(Debug, Deserialize)]
pub struct BrowseLinkArgs {
    pub url: String,
}

/// Fetches a page and hands its readable text back to the assistant.
pub struct BrowseLinkTool {
    client: reqwest::Client,
}

impl BrowseLinkTool {
    /// Uses the same outbound proxy as the backend client when one is set.
    pub fn new(proxy: Option<&str>) -> Result<Self, reqwest::Error> {
        let mut builder = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .user_agent(USER_AGENT);
        if let Some(proxy) = proxy.filter(|p| !p.is_empty()) {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        Ok(Self {
            client: builder.build()?,
        })
    }
}

#[async_trait]
impl Tool for BrowseLinkTool {
    type Args = BrowseLinkArgs;

    fn definition(&self) -> ToolDef {
        ToolDef {
            name: "browse_link".into(),
            description: "Access url and retrieve web page content. 访问url并获取网页内容.\n                Call this function if user explicitly asks you to access certain url and get web page content.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "url": {
                        "type": "string",
                        "description": "User provided URL of the web page"
                    }
                },
                "required": ["url"]
            }),
        }
    }

    async fn invoke(&self, args: BrowseLinkArgs, ctx: &ToolContext<'_>) -> Result<String, ToolError> {
        let url = args.url.trim();
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ToolError::InvalidArguments(format!(
                "only http:// and https:// urls are supported: {url}"
            )));
        }
        ctx.emit(OutputFragment::text("Fetching the link...")).await;

        let resp = self
            .client
            .get(url)
            .header(
                "Accept",
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            )
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ToolError::failed(format!("request timed out after {DEFAULT_TIMEOUT_SECS}s: {url}"))
                } else if e.is_redirect() {
                    ToolError::failed(format!("too many redirects (>{MAX_REDIRECTS}): {url}"))
                } else {
                    ToolError::failed(format!("fetch failed: {e}"))
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ToolError::failed(format!("HTTP {status} fetching {url}")));
        }
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_lowercase();
        let body = resp
            .text()
            .await
            .map_err(|e| ToolError::failed(format!("cannot read response body: {e}")))?;

        Ok(truncate_page(page_text(&content_type, body)))
    }
}

fn page_text(content_type: &str, body: String) -> String {
    if content_type.contains("html") || body.trim_start().starts_with('<') {
        htmd::convert(&body).unwrap_or_else(|_| strip_tags(&body))
    } else {
        body
    }
}

fn truncate_page(text: String) -> String {
    if text.chars().count() <= MAX_CHARS {
        return text;
    }
    let mut out: String = text.chars().take(MAX_CHARS).collect();
    out.push_str("\n\n[content truncated]");
    out
}

/// Fallback when markdown conversion fails.
fn strip_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::FragmentSink;
    use chatrelay_schema::{ConversationId, DeliveryStatus};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Discard;

    #[async_trait]
    impl FragmentSink for Discard {
        async fn emit(&self, _fragment: OutputFragment) -> DeliveryStatus {
            DeliveryStatus::DELIVERED
        }
    }

    #[test]
    fn strip_tags_keeps_text() {
        assert_eq!(strip_tags("<p>Hello <b>world</b></p>"), "Hello world");
    }

    #[test]
    fn long_pages_are_truncated() {
        let out = truncate_page("a".repeat(MAX_CHARS + 10));
        assert!(out.ends_with("[content truncated]"));
    }

    #[tokio::test]
    async fn rejects_non_http_urls() {
        let tool = BrowseLinkTool::new(None).unwrap();
        let conv = ConversationId::from("c");
        let ctx = ToolContext::new(&conv, &Discard);
        let err = tool
            .invoke(
                BrowseLinkArgs {
                    url: "file:///etc/passwd".into(),
                },
                &ctx,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[tokio::test]
    async fn html_is_converted_to_text() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/html")
                    .set_body_string("<html><body><h1>Title</h1><p>Body text</p></body></html>"),
            )
            .mount(&server)
            .await;

        let tool = BrowseLinkTool::new(None).unwrap();
        let conv = ConversationId::from("c");
        let ctx = ToolContext::new(&conv, &Discard);
        let out = tool
            .invoke(
                BrowseLinkArgs {
                    url: format!("{}/page", server.uri()),
                },
                &ctx,
            )
            .await
            .unwrap();
        assert!(out.contains("Title"));
        assert!(out.contains("Body text"));
        assert!(!out.contains("<p>"));
    }
}
