//! pagelive - voice session demo host
//!
//! Opens a live voice session with the default PulseAudio devices and the
//! primary screen as the video source, logs everything the assistant says and
//! does, and disconnects on Ctrl-C.

use anyhow::Context;
use futures_util::future::BoxFuture;
use pagelive::audio::{PulseMicrophone, PulseSpeaker, SystemClock};
use pagelive::tools::{register_page_capabilities, HandlerResult, PageBridge, ScrollDirection};
use pagelive::video::{ScreenSource, VideoSource};
use pagelive::{
    CapabilityRegistry, MediaDevices, SessionConfig, SessionEvent, SessionManager, TimeoutClass,
    WebSocketConnector,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Page bridge for running without a page preview: every action is logged and acknowledged.
struct ConsolePage;

impl PageBridge for ConsolePage {
    fn click(&self, number: u32) -> BoxFuture<'_, HandlerResult> {
        Box::pin(async move {
            info!("[page] click #{}", number);
            Ok(json!({ "clicked": number }))
        })
    }

    fn scroll(&self, direction: ScrollDirection, amount: Option<u32>) -> BoxFuture<'_, HandlerResult> {
        Box::pin(async move {
            info!("[page] scroll {:?} by {:?}", direction, amount);
            Ok(json!({ "scrolled": true }))
        })
    }

    fn get_page_elements(&self) -> BoxFuture<'_, HandlerResult> {
        Box::pin(async { Ok(json!({ "elements": [] })) })
    }

    fn highlight_by_number(&self, number: u32) -> BoxFuture<'_, HandlerResult> {
        Box::pin(async move {
            info!("[page] highlight #{}", number);
            Ok(json!({ "highlighted": number }))
        })
    }

    fn navigate(&self, url: &str) -> BoxFuture<'_, HandlerResult> {
        let url = url.to_string();
        Box::pin(async move {
            info!("[page] navigate to {}", url);
            Ok(json!({ "url": url }))
        })
    }
}

#[derive(Debug, Deserialize)]
struct ReadFileArgs {
    path: String,
}

fn build_registry() -> CapabilityRegistry {
    let mut registry = CapabilityRegistry::new();
    register_page_capabilities(&mut registry, Arc::new(ConsolePage));
    registry.register_typed(
        "read_file",
        "Read a UTF-8 text file from the local project.",
        json!({
            "type": "object",
            "properties": { "path": { "type": "string" } },
            "required": ["path"]
        }),
        TimeoutClass::Slow,
        |args: ReadFileArgs| async move {
            tokio::fs::read_to_string(&args.path)
                .await
                .map(|contents| json!({ "contents": contents }))
                .map_err(|e| format!("Could not read {}: {}", args.path, e))
        },
    );
    registry
}

fn log_event(event: SessionEvent) {
    match event {
        SessionEvent::StatusChanged(status) => info!("Status: {:?}", status),
        SessionEvent::Reconnecting { attempt, delay } => {
            warn!("Reconnect attempt {} in {:?}", attempt, delay)
        }
        SessionEvent::Failed(reason) => error!("Session failed: {}", reason),
        SessionEvent::InputTranscript(t) if t.is_final => info!("You: {}", t.text),
        SessionEvent::OutputTranscript(t) if t.is_final => info!("Assistant: {}", t.text),
        SessionEvent::InputTranscript(_) | SessionEvent::OutputTranscript(_) => {}
        SessionEvent::Text(text) => info!("Assistant (text): {}", text),
        SessionEvent::Interrupted => info!("Interrupted"),
        SessionEvent::GenerationComplete => debug!("Generation complete"),
        SessionEvent::TurnComplete => debug!("Turn complete"),
        SessionEvent::ToolCallsCancelled(ids) => info!("Tool calls cancelled: {:?}", ids),
        SessionEvent::ToolBatchFailed(results) => {
            error!("Tool batch of {} call(s) failed", results.len())
        }
        SessionEvent::Level { .. } => {}
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    info!("Starting pagelive");

    let config = SessionConfig::from_env().context("GEMINI_API_KEY must be set")?;
    let connector = Arc::new(WebSocketConnector::new(&config));
    let registry = Arc::new(build_registry());
    info!("Registered {} capabilities", registry.len());

    let video = match ScreenSource::new() {
        Ok(screen) => Some(Arc::new(screen) as Arc<dyn VideoSource>),
        Err(e) => {
            warn!("Screen capture unavailable, streaming audio only: {:#}", e);
            None
        }
    };
    let devices = MediaDevices {
        microphone: Some(Arc::new(PulseMicrophone::default())),
        speaker: Some(Arc::new(PulseSpeaker::default())),
        video,
        clock: Arc::new(SystemClock::new()),
    };

    let manager = SessionManager::new(config, connector, registry, devices);
    let mut events = manager.subscribe();
    let logger = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    debug!("Event log skipped {} event(s)", n)
                }
                Err(_) => break,
            }
        }
    });

    manager.connect().await.context("Could not open the live session")?;
    info!("Session open, speak to the assistant (Ctrl-C to quit)");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    manager.disconnect().await;
    drop(manager);
    logger.abort();
    Ok(())
}
