use async_trait::async_trait;
use chatrelay_provider::ToolDef;
use chatrelay_schema::OutputFragment;
use serde::Deserialize;

use crate::tool::{Tool, ToolContext, ToolError};

pub const DEFAULT_BING_ENDPOINT: &str = "https://api.bing.microsoft.com";
const SEARCH_PATH: &str = "/v7.0/search";
const RESULT_COUNT: &str = "5";
const DEFAULT_TIMEOUT_SECS: u64 = 15;
const NOISY_KEYS: [&str; 6] = [
    "id",
    "isFamilyFriendly",
    "displayUrl",
    "cachedPageUrl",
    "language",
    "isNavigational",
];

#[derive(Debug, Deserialize)]
pub struct BingSearchArgs {
    pub search_query: String,
}

pub struct BingSearchTool {
    api_key: String,
    search_url: String,
    client: reqwest::Client,
}

impl BingSearchTool {
    pub fn new(api_key: impl Into<String>, endpoint: Option<&str>) -> Self {
        let endpoint = endpoint
            .filter(|e| !e.is_empty())
            .unwrap_or(DEFAULT_BING_ENDPOINT);
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Self {
            api_key: api_key.into(),
            search_url: format!("{}{SEARCH_PATH}", endpoint.trim_end_matches('/')),
            client,
        }
    }
}

#[derive(Deserialize)]
struct BingResponse {
    #[serde(rename = "webPages")]
    web_pages: Option<BingWebPages>,
}

#[derive(Deserialize)]
struct BingWebPages {
    #[serde(default)]
    value: Vec<serde_json::Map<String, serde_json::Value>>,
}

#[async_trait]
impl Tool for BingSearchTool {
    type Args = BingSearchArgs;

    fn definition(&self) -> ToolDef {
        ToolDef {
            name: "bing_search".into(),
            description: "Search Internet for web results using Bing Search engine. 使用必应搜索引擎, 搜索互联网上的内容.  \n                当用户需要互联网上的最新内容是, 调用这个函数。\n                Use this function when:\n                - User is asking about current events or something that requires real-time information (weather, sports scores, etc.)\n                - User is asking about some term you are totally unfamiliar with (it might be new)".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "search_query": {
                        "type": "string",
                        "description": "Query term or keywords for the search. 提交给搜索引擎的搜索关键词。"
                    }
                },
                "required": ["search_query"]
            }),
        }
    }

    async fn invoke(&self, args: BingSearchArgs, ctx: &ToolContext<'_>) -> Result<String, ToolError> {
        let query = args.search_query;
        ctx.emit(OutputFragment::text(format!("Searching Bing: {query}")))
            .await;
        tracing::info!(%query, "bing search");

        let resp = self
            .client
            .get(&self.search_url)
            .header("Ocp-Apim-Subscription-Key", &self.api_key)
            .query(&[
                ("q", query.as_str()),
                ("count", RESULT_COUNT),
                ("textFormat", "HTML"),
                ("mkt", "zh-CN"),
                ("freshness", "Week"),
            ])
            .send()
            .await
            .map_err(|e| ToolError::failed(format!("search request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ToolError::failed(format!(
                "Bing search API error (HTTP {status}): {body}"
            )));
        }

        let parsed: BingResponse = resp
            .json()
            .await
            .map_err(|e| ToolError::failed(format!("cannot parse search response: {e}")))?;

        let results = trim_results(parsed.web_pages.map(|w| w.value).unwrap_or_default());
        if results.is_empty() {
            return Ok(format!("No results found for: {query}"));
        }
        serde_json::to_string(&results)
            .map_err(|e| ToolError::failed(format!("cannot encode results: {e}")))
    }
}

fn trim_results(
    mut results: Vec<serde_json::Map<String, serde_json::Value>>,
) -> Vec<serde_json::Map<String, serde_json::Value>> {
    for result in &mut results {
        for key in NOISY_KEYS {
            result.remove(key);
        }
    }
    results
}
