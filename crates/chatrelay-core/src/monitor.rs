//! Background status monitor: polls watched endpoints on a fixed interval
//! and notifies subscribed conversations when one goes live.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chatrelay_schema::{ConversationId, OutputFragment, ReplyTarget};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::emitter::ReplyEmitter;

const REQUEST_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default)]
    pub watches: Vec<WatchConfig>,
}

fn default_interval_secs() -> u64 {
    30
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            watches: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    pub name: String,
    pub url: String,
    /// JSON pointer to the "live" flag, e.g. `/data/live_status`
    pub live_pointer: String,
    #[serde(default)]
    pub title_pointer: Option<String>,
    /// Link included in the notification
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub subscribers: Vec<String>,
    #[serde(default)]
    pub proxy: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveStatus {
    pub live: bool,
    pub title: Option<String>,
}

#[async_trait]
pub trait StatusSource: Send + Sync {
    fn name(&self) -> &str;

    fn link(&self) -> Option<&str> {
        None
    }

    async fn check(&self) -> Result<LiveStatus>;
}

pub struct HttpStatusSource {
    config: WatchConfig,
    client: reqwest::Client,
}

impl HttpStatusSource {
    pub fn new(config: WatchConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS));
        if let Some(proxy) = config.proxy.as_deref().filter(|p| !p.is_empty()) {
            let proxy = reqwest::Proxy::all(proxy).with_context(|| format!("invalid proxy {proxy}"))?;
            builder = builder.proxy(proxy);
        }
        let client = builder.build().context("failed to build status http client")?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl StatusSource for HttpStatusSource {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn link(&self) -> Option<&str> {
        self.config.link.as_deref()
    }

    async fn check(&self) -> Result<LiveStatus> {
        let resp = self
            .client
            .get(&self.config.url)
            .send()
            .await
            .with_context(|| format!("status request to {} failed", self.config.url))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!("status endpoint {} returned {status}", self.config.url));
        }
        let body: Value = resp.json().await.context("status endpoint returned invalid json")?;
        parse_status(
            &body,
            &self.config.live_pointer,
            self.config.title_pointer.as_deref(),
        )
    }
}

pub fn parse_status(body: &Value, live_pointer: &str, title_pointer: Option<&str>) -> Result<LiveStatus> {
    let flag = body
        .pointer(live_pointer)
        .ok_or_else(|| anyhow!("live flag {live_pointer} missing from status response"))?;
    let live = match flag {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_i64() == Some(1),
        Value::String(s) => matches!(s.as_str(), "1" | "true" | "live"),
        _ => false,
    };
    let title = title_pointer
        .and_then(|p| body.pointer(p))
        .and_then(|v| v.as_str())
        .map(str::to_string);
    Ok(LiveStatus { live, title })
}

struct Watch {
    source: Box<dyn StatusSource>,
    subscribers: Vec<ConversationId>,
    /// `None` until the first successful check
    last_live: Option<bool>,
}

pub struct StatusMonitor {
    watches: Vec<Watch>,
    emitter: ReplyEmitter,
    interval: Duration,
}

impl StatusMonitor {
    pub fn new(emitter: ReplyEmitter, interval: Duration) -> Self {
        Self {
            watches: Vec::new(),
            emitter,
            interval,
        }
    }

    pub fn from_config(config: &MonitorConfig, emitter: ReplyEmitter) -> Result<Self> {
        let mut monitor = Self::new(emitter, Duration::from_secs(config.interval_secs.max(1)));
        for watch in &config.watches {
            let subscribers = watch
                .subscribers
                .iter()
                .map(|s| ConversationId::new(s.as_str()))
                .collect();
            let source = HttpStatusSource::new(watch.clone())
                .with_context(|| format!("monitor watch {}", watch.name))?;
            monitor.watch(Box::new(source), subscribers);
        }
        Ok(monitor)
    }

    pub fn watch(&mut self, source: Box<dyn StatusSource>, subscribers: Vec<ConversationId>) {
        tracing::info!(watch = source.name(), subscribers = subscribers.len(), "status watch added");
        self.watches.push(Watch {
            source,
            subscribers,
            last_live: None,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.watches.is_empty()
    }

    /// Check every watch once. Returns the number of notifications sent.
    pub async fn tick(&mut self) -> usize {
        let mut sent = 0;
        for watch in &mut self.watches {
            let status = match watch.source.check().await {
                Ok(status) => status,
                Err(e) => {
                    tracing::warn!(watch = watch.source.name(), error = %e, "status check failed");
                    continue;
                }
            };

            let went_live = status.live && watch.last_live != Some(true);
            watch.last_live = Some(status.live);
            if !went_live {
                continue;
            }

            let text = notification_text(watch.source.name(), &status, watch.source.link());
            tracing::info!(watch = watch.source.name(), subscribers = watch.subscribers.len(), "sending live notification");
            for conversation_id in &watch.subscribers {
                let target = ReplyTarget::new(conversation_id.clone());
                if self
                    .emitter
                    .send(&target, &OutputFragment::text(text.clone()))
                    .await
                    .is_delivered()
                {
                    sent += 1;
                }
            }
        }
        sent
    }

    pub fn spawn(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(interval_secs = self.interval.as_secs(), "status monitor started");
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.tick().await;
            }
        })
    }
}

fn notification_text(name: &str, status: &LiveStatus, link: Option<&str>) -> String {
    let mut text = format!("{name} is live now!");
    if let Some(title) = status.title.as_deref().filter(|t| !t.is_empty()) {
        text.push_str(&format!("\n{title}"));
    }
    if let Some(link) = link {
        text.push_str(&format!("\n{link}"));
    }
    text
}
