//! Wire types for the analysis service.
//!
//! The streaming session and the stateless generate-content endpoint share
//! the same content model (`Content` / `Part` / `InlineData`), so both
//! channels serialise frames identically.

use serde::{Deserialize, Serialize};

/// MIME type of inline frames.
pub const JPEG_MIME_TYPE: &str = "image/jpeg";

/// Inline binary payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub mime_type: String,
    /// Base64-encoded bytes
    pub data: String,
}

/// One part of a content turn: text or inline data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<InlineData>,
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            inline_data: None,
        }
    }

    pub fn jpeg(base64: String) -> Self {
        Self {
            text: None,
            inline_data: Some(InlineData {
                mime_type: JPEG_MIME_TYPE.to_string(),
                data: base64,
            }),
        }
    }
}

/// A content turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    /// A user turn with the given parts.
    pub fn user(parts: Vec<Part>) -> Self {
        Self {
            role: Some("user".to_string()),
            parts,
        }
    }

    /// Concatenated text of all text parts.
    pub fn joined_text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| p.text.as_deref())
            .collect::<Vec<_>>()
            .join("")
    }
}

/// Sampling parameters.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_modalities: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_mime_type: Option<String>,

    pub temperature: f32,
    pub max_output_tokens: u32,
    pub candidate_count: u32,
}

impl GenerationConfig {
    /// Text-only responses for the streaming session.
    pub fn streaming(temperature: f32, max_output_tokens: u32) -> Self {
        Self {
            response_modalities: Some(vec!["TEXT".to_string()]),
            response_mime_type: None,
            temperature,
            max_output_tokens,
            candidate_count: 1,
        }
    }

    /// JSON responses for stateless requests.
    pub fn json(temperature: f32, max_output_tokens: u32) -> Self {
        Self {
            response_modalities: None,
            response_mime_type: Some("application/json".to_string()),
            temperature,
            max_output_tokens,
            candidate_count: 1,
        }
    }
}

// ============================================================================
// Streaming session: outbound
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionResumption {
    pub handle: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: Content,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_resumption: Option<SessionResumption>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientContent {
    pub turns: Vec<Content>,
    pub turn_complete: bool,
}

/// Messages sent on the streaming session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(Setup),
    ClientContent(ClientContent),
}

impl ClientMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ============================================================================
// Streaming session: inbound
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<Content>,

    #[serde(default)]
    pub turn_complete: bool,

    #[serde(default)]
    pub generation_complete: bool,

    #[serde(default)]
    pub interrupted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResumptionUpdate {
    #[serde(default)]
    pub new_handle: Option<String>,

    #[serde(default)]
    pub resumable: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    /// Remaining connection time, e.g. "10s"
    #[serde(default)]
    pub time_left: Option<String>,
}

/// Raw inbound frame. Any combination of fields may be present.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,

    #[serde(default)]
    pub server_content: Option<ServerContent>,

    #[serde(default)]
    pub session_resumption_update: Option<SessionResumptionUpdate>,

    #[serde(default)]
    pub go_away: Option<GoAway>,
}

impl ServerMessage {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }
}

// ============================================================================
// Stateless generate-content
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentRequest {
    pub contents: Vec<Content>,
    pub generation_config: GenerationConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Candidate {
    #[serde(default)]
    pub content: Option<Content>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenerateContentResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
}

impl GenerateContentResponse {
    /// Text of the first part of the first candidate.
    pub fn first_text(&self) -> Option<&str> {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .and_then(|c| c.parts.first())
            .and_then(|p| p.text.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn test_setup_message_shape() {
        let message = ClientMessage::Setup(Setup {
            model: "models/test".to_string(),
            generation_config: GenerationConfig::streaming(0.7, 200),
            system_instruction: Content {
                role: None,
                parts: vec![Part::text("be a coach")],
            },
            session_resumption: None,
        });

        let value: Value = serde_json::from_str(&message.to_json().unwrap()).unwrap();
        assert_eq!(value["setup"]["model"], "models/test");
        assert_eq!(
            value["setup"]["generationConfig"]["responseModalities"],
            json!(["TEXT"])
        );
        assert_eq!(value["setup"]["generationConfig"]["maxOutputTokens"], 200);
        assert_eq!(
            value["setup"]["systemInstruction"]["parts"][0]["text"],
            "be a coach"
        );
        assert!(value["setup"].get("sessionResumption").is_none());
        assert!(value["setup"]["generationConfig"].get("responseMimeType").is_none());
    }

    #[test]
    fn test_client_content_shape() {
        let message = ClientMessage::ClientContent(ClientContent {
            turns: vec![Content::user(vec![
                Part::text("analyse"),
                Part::jpeg("AAAA".to_string()),
            ])],
            turn_complete: true,
        });

        let value: Value = serde_json::from_str(&message.to_json().unwrap()).unwrap();
        let turn = &value["clientContent"]["turns"][0];
        assert_eq!(turn["role"], "user");
        assert_eq!(turn["parts"][0]["text"], "analyse");
        assert_eq!(turn["parts"][1]["inlineData"]["mimeType"], "image/jpeg");
        assert_eq!(turn["parts"][1]["inlineData"]["data"], "AAAA");
        assert_eq!(value["clientContent"]["turnComplete"], true);
    }

    #[test]
    fn test_parse_server_messages() {
        let ack = ServerMessage::parse(r#"{"setupComplete":{}}"#).unwrap();
        assert!(ack.is_setup_complete());

        let content = ServerMessage::parse(
            r#"{"serverContent":{"modelTurn":{"parts":[{"text":"{\"outcome\":"},{"text":"\"make\"}"}]},"turnComplete":true}}"#,
        )
        .unwrap();
        let server_content = content.server_content.unwrap();
        assert!(server_content.turn_complete);
        assert_eq!(
            server_content.model_turn.unwrap().joined_text(),
            r#"{"outcome":"make"}"#
        );

        let resume = ServerMessage::parse(
            r#"{"sessionResumptionUpdate":{"newHandle":"h-1","resumable":true}}"#,
        )
        .unwrap();
        assert_eq!(
            resume.session_resumption_update.unwrap().new_handle.as_deref(),
            Some("h-1")
        );

        let go_away = ServerMessage::parse(r#"{"goAway":{"timeLeft":"10s"}}"#).unwrap();
        assert_eq!(go_away.go_away.unwrap().time_left.as_deref(), Some("10s"));

        // Unknown fields are tolerated
        let unknown = ServerMessage::parse(r#"{"usageMetadata":{"totalTokenCount":3}}"#).unwrap();
        assert_eq!(unknown, ServerMessage::default());
    }

    #[test]
    fn test_generate_content_first_text() {
        let response: GenerateContentResponse = serde_json::from_value(json!({
            "candidates": [{"content": {"role": "model", "parts": [{"text": "hello"}]}}]
        }))
        .unwrap();
        assert_eq!(response.first_text(), Some("hello"));

        let empty: GenerateContentResponse = serde_json::from_value(json!({})).unwrap();
        assert_eq!(empty.first_text(), None);
    }
}
