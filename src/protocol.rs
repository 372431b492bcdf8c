//! Live API wire protocol
//!
//! Client and server JSON messages exchanged over the BidiGenerateContent
//! websocket, and the flattening of server messages into [`ServerEvent`]s.

use crate::codec;
use crate::config::SessionConfig;
use crate::tools::{ToolCall, ToolResult};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

/// Generation configuration for setup.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_resolution: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Part {
    pub text: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Content {
    pub parts: Vec<Part>,
}

/// A capability declaration exposed to the model.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SessionResumptionConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
}

/// Session setup message.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct BidiGenerateContentSetup {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Tool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_resumption: Option<SessionResumptionConfig>,
}

impl BidiGenerateContentSetup {
    /// Build the setup message for a new session.
    pub fn from_config(
        config: &SessionConfig,
        declarations: Vec<FunctionDeclaration>,
        resumption_handle: Option<String>,
    ) -> Self {
        let speech_config = config.voice_name.as_ref().map(|voice| {
            serde_json::json!({
                "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": voice } }
            })
        });

        let generation_config = GenerationConfig {
            response_modalities: vec![config.response_modality.as_str().to_string()],
            temperature: config.temperature,
            media_resolution: config.media_resolution.map(|r| r.as_str().to_string()),
            speech_config,
        };

        Self {
            model: config.model.clone(),
            generation_config: Some(generation_config),
            system_instruction: config.system_instruction.as_ref().map(|text| Content {
                parts: vec![Part { text: text.clone() }],
            }),
            tools: if declarations.is_empty() {
                Vec::new()
            } else {
                vec![Tool {
                    function_declarations: declarations,
                }]
            },
            session_resumption: Some(SessionResumptionConfig {
                handle: resumption_handle,
            }),
        }
    }
}

/// Inline media payload
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub data: String,
    pub mime_type: String,
}

/// A chunk of realtime input (audio or video)
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<Blob>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video: Option<Blob>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponse {
    pub function_responses: Vec<ToolResult>,
}

/// Message sent from client to server.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(BidiGenerateContentSetup),
    RealtimeInput(RealtimeInput),
    ToolResponse(ToolResponse),
}

impl ClientMessage {
    /// Microphone frame already encoded as PCM16 LE.
    pub fn audio(pcm: &[u8]) -> Self {
        ClientMessage::RealtimeInput(RealtimeInput {
            audio: Some(Blob {
                data: codec::encode_base64(pcm),
                mime_type: codec::INPUT_MIME_TYPE.to_string(),
            }),
            video: None,
        })
    }

    /// Compressed video frame.
    pub fn video(jpeg: &[u8], mime_type: &str) -> Self {
        ClientMessage::RealtimeInput(RealtimeInput {
            audio: None,
            video: Some(Blob {
                data: codec::encode_base64(jpeg),
                mime_type: mime_type.to_string(),
            }),
        })
    }

    pub fn tool_response(results: Vec<ToolResult>) -> Self {
        ClientMessage::ToolResponse(ToolResponse {
            function_responses: results,
        })
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Short label for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Setup(_) => "setup",
            ClientMessage::RealtimeInput(RealtimeInput { audio: Some(_), .. }) => "audio",
            ClientMessage::RealtimeInput(_) => "video",
            ClientMessage::ToolResponse(_) => "toolResponse",
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Transcription {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub is_final: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelPart {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<ModelPart>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<ModelTurn>,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub generation_complete: bool,
    #[serde(default)]
    pub input_transcription: Option<Transcription>,
    #[serde(default)]
    pub output_transcription: Option<Transcription>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallMessage {
    #[serde(default)]
    pub function_calls: Vec<ToolCall>,
}

#[derive(Debug, Deserialize)]
pub struct ToolCallCancellation {
    #[serde(default)]
    pub ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    #[serde(default)]
    pub time_left: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResumptionUpdate {
    #[serde(default)]
    pub new_handle: Option<String>,
    #[serde(default)]
    pub resumable: Option<bool>,
}

/// Server -> client message. Exactly one field is normally present.
#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub tool_call: Option<ToolCallMessage>,
    #[serde(default)]
    pub tool_call_cancellation: Option<ToolCallCancellation>,
    #[serde(default)]
    pub go_away: Option<GoAway>,
    #[serde(default)]
    pub session_resumption_update: Option<SessionResumptionUpdate>,
}

/// Transcript from the Live API
#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub text: String,
    pub is_final: bool,
}

/// A single decoded event from the server, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    SetupComplete,
    /// 24 kHz PCM16 LE audio payload
    Audio(Vec<u8>),
    Text(String),
    InputTranscription(Transcript),
    OutputTranscription(Transcript),
    /// The user barged in; queued playback must stop
    Interrupted,
    /// The model finished generating; audio may still be playing
    GenerationComplete,
    TurnComplete,
    ToolCalls(Vec<ToolCall>),
    ToolCallCancellation(Vec<String>),
    GoAway { time_left: Option<String> },
    SessionResumption(String),
}

impl ServerMessage {
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// Flatten into events. Undecodable audio parts are logged and skipped.
    pub fn into_events(self) -> Vec<ServerEvent> {
        let mut events = Vec::new();

        if self.setup_complete.is_some() {
            events.push(ServerEvent::SetupComplete);
        }

        if let Some(content) = self.server_content {
            push_content_events(content, &mut events);
        }

        if let Some(tool_call) = self.tool_call {
            if tool_call.function_calls.is_empty() {
                warn!("Received tool call message without function calls");
            } else {
                events.push(ServerEvent::ToolCalls(tool_call.function_calls));
            }
        }

        if let Some(cancellation) = self.tool_call_cancellation {
            events.push(ServerEvent::ToolCallCancellation(cancellation.ids));
        }

        if let Some(go_away) = self.go_away {
            events.push(ServerEvent::GoAway {
                time_left: go_away.time_left,
            });
        }

        if let Some(update) = self.session_resumption_update {
            if update.resumable.unwrap_or(true) {
                if let Some(handle) = update.new_handle.filter(|h| !h.is_empty()) {
                    events.push(ServerEvent::SessionResumption(handle));
                }
            }
        }

        events
    }
}

fn push_content_events(content: ServerContent, events: &mut Vec<ServerEvent>) {
    // Interruption first so a stale tail of audio is never scheduled after it.
    if content.interrupted {
        events.push(ServerEvent::Interrupted);
    }

    if let Some(t) = content.input_transcription.filter(|t| !t.text.is_empty()) {
        events.push(ServerEvent::InputTranscription(Transcript {
            text: t.text,
            is_final: t.is_final,
        }));
    }

    if let Some(t) = content.output_transcription.filter(|t| !t.text.is_empty()) {
        events.push(ServerEvent::OutputTranscription(Transcript {
            text: t.text,
            is_final: t.is_final,
        }));
    }

    if let Some(model_turn) = content.model_turn {
        for part in model_turn.parts {
            if let Some(text) = part.text.filter(|t| !t.is_empty()) {
                events.push(ServerEvent::Text(text));
            } else if let Some(inline_data) = part.inline_data {
                match inline_data.data.as_deref().map(codec::decode_audio_payload) {
                    Some(Ok(data)) if !data.is_empty() => events.push(ServerEvent::Audio(data)),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!("Dropping inline audio: {}", e);
                    }
                    None => {
                        warn!("Received inline data without data field ({:?})", inline_data.mime_type);
                    }
                }
            }
        }
    }

    if content.generation_complete {
        events.push(ServerEvent::GenerationComplete);
    }

    if content.turn_complete {
        events.push(ServerEvent::TurnComplete);
    }
}
