use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(id: impl Into<String>, role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

/// A message as the chat endpoint sees it: no id, no timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiMessage {
    pub role: MessageRole,
    pub content: String,
}

impl From<&ChatMessage> for ApiMessage {
    fn from(msg: &ChatMessage) -> Self {
        Self {
            role: msg.role,
            content: msg.content.clone(),
        }
    }
}

/// Request body posted to the chat endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ApiMessage>,
    /// Language name (not code), e.g. "Hindi".
    pub language: String,
}

/// One `data:` event of the streamed reply.
///
/// Every level is optional so that any shape the gateway sends still
/// deserializes; a missing piece just means "no delta".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamChunk {
    #[serde(default)]
    pub choices: Vec<StreamChoice>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamChoice {
    #[serde(default)]
    pub delta: StreamDelta,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamDelta {
    #[serde(default)]
    pub content: Option<String>,
}

impl StreamChunk {
    /// Text at `choices[0].delta.content`, if present and non-empty.
    pub fn into_content(self) -> Option<String> {
        self.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.delta.content)
            .filter(|content| !content.is_empty())
    }
}

/// JSON body returned by the chat endpoint on a non-2xx status.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub error: Option<String>,
}

pub const LANGUAGE_NAMES: &[(&str, &str)] = &[
    ("en", "English"),
    ("hi", "Hindi"),
    ("ta", "Tamil"),
    ("te", "Telugu"),
    ("bn", "Bengali"),
    ("mr", "Marathi"),
    ("gu", "Gujarati"),
    ("kn", "Kannada"),
    ("ml", "Malayalam"),
    ("pa", "Punjabi"),
];

/// Resolve a language code to the name the chat endpoint expects.
/// Unknown codes are passed through unchanged.
pub fn language_name(code: &str) -> &str {
    LANGUAGE_NAMES
        .iter()
        .find(|(known, _)| *known == code)
        .map(|(_, name)| *name)
        .unwrap_or(code)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AyurvedicRemedy {
    pub name: String,
    pub usage: String,
    pub benefits: String,
    #[serde(default)]
    pub preparation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MedicineScanResponse {
    #[serde(default)]
    pub medicine_name: Option<String>,
    /// 0..1
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub uses: Option<String>,
    #[serde(default)]
    pub extracted_text: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub ayurvedic_remedies: Vec<AyurvedicRemedy>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosisType {
    Skin,
    Eye,
    Tongue,
    Nail,
}

impl DiagnosisType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiagnosisType::Skin => "skin",
            DiagnosisType::Eye => "eye",
            DiagnosisType::Tongue => "tongue",
            DiagnosisType::Nail => "nail",
        }
    }
}

impl fmt::Display for DiagnosisType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DiagnosisType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "skin" => Ok(DiagnosisType::Skin),
            "eye" => Ok(DiagnosisType::Eye),
            "tongue" => Ok(DiagnosisType::Tongue),
            "nail" => Ok(DiagnosisType::Nail),
            other => Err(format!(
                "unknown diagnosis type '{}' (expected skin, eye, tongue or nail)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    None,
    Mild,
    Moderate,
    Severe,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosisCondition {
    pub name: String,
    pub severity: Severity,
    /// 0..1
    pub confidence: f64,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualDiagnosisResponse {
    #[serde(default)]
    pub conditions: Vec<DiagnosisCondition>,
    /// 0..1
    #[serde(default)]
    pub confidence: f64,
    pub analysis_type: DiagnosisType,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub ayurvedic_remedies: Vec<AyurvedicRemedy>,
    #[serde(default)]
    pub recommendations: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
}
