use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use strum::{Display, EnumString};
use validator::Validate;

/// Current wall clock in unix milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Category of artifact being generated.
///
/// Known categories carry cross-check rules against the theme (see
/// [`ContentType::requires_character_traits`]); anything else goes through
/// `Custom`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Backstory,
    CharacterDescription,
    LocationDescription,
    ItemDescription,
    QuestHook,
    Dialogue,
    Lore,
    Encounter,
    Custom(String),
}

impl ContentType {
    pub fn as_str(&self) -> &str {
        match self {
            ContentType::Backstory => "backstory",
            ContentType::CharacterDescription => "character_description",
            ContentType::LocationDescription => "location_description",
            ContentType::ItemDescription => "item_description",
            ContentType::QuestHook => "quest_hook",
            ContentType::Dialogue => "dialogue",
            ContentType::Lore => "lore",
            ContentType::Encounter => "encounter",
            ContentType::Custom(name) => name.as_str(),
        }
    }

    pub fn requires_character_traits(&self) -> bool {
        matches!(
            self,
            ContentType::Backstory | ContentType::CharacterDescription
        )
    }

    pub fn requires_world_elements(&self) -> bool {
        matches!(self, ContentType::LocationDescription | ContentType::Lore)
    }
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ContentType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_lowercase().as_str() {
            "backstory" => ContentType::Backstory,
            "character_description" => ContentType::CharacterDescription,
            "location_description" => ContentType::LocationDescription,
            "item_description" => ContentType::ItemDescription,
            "quest_hook" => ContentType::QuestHook,
            "dialogue" => ContentType::Dialogue,
            "lore" => ContentType::Lore,
            "encounter" => ContentType::Encounter,
            _ => ContentType::Custom(s.trim().to_string()),
        })
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// A rendered prompt: either single-turn text or an ordered chat transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Prompt {
    Text(String),
    Messages(Vec<ChatMessage>),
}

impl Prompt {
    /// Chat form of the prompt. A flat string becomes one user message.
    pub fn to_messages(&self) -> Vec<ChatMessage> {
        match self {
            Prompt::Text(text) => vec![ChatMessage::user(text.clone())],
            Prompt::Messages(messages) => messages.clone(),
        }
    }

    /// Canonical text used for fingerprinting.
    pub fn canonical_text(&self) -> String {
        match self {
            Prompt::Text(text) => text.clone(),
            Prompt::Messages(messages) => messages
                .iter()
                .map(|m| format!("{}:{}", m.role, m.content))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

impl From<&str> for Prompt {
    fn from(value: &str) -> Self {
        Prompt::Text(value.to_string())
    }
}

impl From<String> for Prompt {
    fn from(value: String) -> Self {
        Prompt::Text(value)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThemeElements {
    #[serde(default)]
    pub key_words: Vec<String>,
    #[serde(default)]
    pub excluded_words: Vec<String>,
    #[serde(default)]
    pub style_guide: Option<String>,
    #[serde(default)]
    pub character_traits: Vec<String>,
    #[serde(default)]
    pub world_elements: Vec<String>,
}

/// Genre, tone, and style constraints a generated artifact must satisfy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThemeContext {
    pub id: String,
    pub name: String,
    pub genre: String,
    #[serde(default)]
    pub sub_genres: Vec<String>,
    #[serde(default)]
    pub tone: String,
    #[serde(default)]
    pub elements: ThemeElements,
}

impl ThemeContext {
    /// Label used for metrics; the primary genre.
    pub fn theme_type(&self) -> &str {
        if self.genre.is_empty() {
            "none"
        } else {
            &self.genre
        }
    }
}

/// Per-request generation parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[validate(length(min = 1))]
    pub model: String,

    /// Attempted exactly once when the primary model fails. Empty disables fallback.
    #[serde(default)]
    pub fallback_model: String,

    #[validate(range(min = 0.0, max = 1.0))]
    pub temperature: f32,

    #[validate(range(min = 1))]
    pub max_tokens: u32,

    #[serde(default)]
    #[validate(range(min = -2.0, max = 2.0))]
    pub presence_penalty: f32,

    #[serde(default)]
    #[validate(range(min = -2.0, max = 2.0))]
    pub frequency_penalty: f32,

    #[serde(default)]
    pub stop_sequences: Vec<String>,

    #[serde(default)]
    pub stream: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o".to_string(),
            fallback_model: "gpt-4o-mini".to_string(),
            temperature: 0.7,
            max_tokens: 1000,
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
            stop_sequences: Vec::new(),
            stream: false,
        }
    }
}

impl GenerationConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            fallback_model: String::new(),
            ..Default::default()
        }
    }

    pub fn with_fallback(mut self, model: impl Into<String>) -> Self {
        self.fallback_model = model.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn has_fallback(&self) -> bool {
        !self.fallback_model.is_empty() && self.fallback_model != self.model
    }
}

/// Parameters for a single provider call against one concrete model.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderRequest {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub presence_penalty: f32,
    pub frequency_penalty: f32,
    pub stop_sequences: Vec<String>,
}

impl ProviderRequest {
    pub fn for_model(config: &GenerationConfig, model: &str) -> Self {
        Self {
            model: model.to_string(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            presence_penalty: config.presence_penalty,
            frequency_penalty: config.frequency_penalty,
            stop_sequences: config.stop_sequences.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

/// Text and usage returned by a provider call.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub usage: TokenUsage,
    pub model: String,
}

/// One increment of a streamed completion. `usage` is only set on the last delta.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamDelta {
    pub content: String,
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationMetadata {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub generation_time_ms: u64,
    pub model_name: String,
    pub cached: bool,
}

impl GenerationMetadata {
    pub fn from_usage(usage: TokenUsage, generation_time_ms: u64, model_name: &str) -> Self {
        Self {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
            generation_time_ms,
            model_name: model_name.to_string(),
            cached: false,
        }
    }
}

/// Outcome of the optional theme-fit check. Never fails the primary generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThemeCompatibility {
    pub valid: bool,
    pub reason: Option<String>,
}

impl ThemeCompatibility {
    pub fn incompatible(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationResult {
    pub content: String,
    pub metadata: GenerationMetadata,
    pub theme_context: Option<ThemeContext>,
    pub content_type: ContentType,
    #[serde(default)]
    pub theme_compatibility: Option<ThemeCompatibility>,
}

/// Snapshot of one rate-limit scope after a check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitInfo {
    pub key: String,
    pub limit: u64,
    pub remaining: u64,
    /// Unix seconds at which the current window ends.
    pub reset_at: i64,
    pub ttl_seconds: u64,
    pub allowed: bool,
}

impl RateLimitInfo {
    /// Builds the info for `count` requests seen in the window. `remaining` saturates at 0.
    pub fn from_count(
        key: impl Into<String>,
        limit: u64,
        count: u64,
        reset_at: i64,
        ttl_seconds: u64,
    ) -> Self {
        Self {
            key: key.into(),
            limit,
            remaining: limit.saturating_sub(count),
            reset_at,
            ttl_seconds,
            allowed: count <= limit,
        }
    }

    pub fn retry_after_secs(&self, now_secs: i64) -> u64 {
        (self.reset_at - now_secs).max(0) as u64
    }
}

/// Result of one atomic sliding-window acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlidingWindowOutcome {
    /// Entries in the window after the call, including this request when allowed.
    pub count: u64,
    pub allowed: bool,
    pub oldest_ms: Option<i64>,
}

/// A cached value with its lifetime. Times are unix milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheItem {
    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,
    pub content_type: String,
    pub created_at: i64,
    pub expires_at: i64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl CacheItem {
    pub fn new(
        content: Vec<u8>,
        content_type: impl Into<String>,
        ttl: Duration,
        metadata: HashMap<String, String>,
    ) -> Self {
        let created_at = now_millis();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1);
        Self {
            content,
            content_type: content_type.into(),
            created_at,
            expires_at: created_at.saturating_add(ttl_ms),
            metadata,
        }
    }

    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_millis())
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ValidationSeverity {
    Error,
    Warning,
}

/// A single finding from request validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub field: String,
    pub message: String,
    pub severity: ValidationSeverity,
}

impl ValidationResult {
    pub fn error(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            severity: ValidationSeverity::Error,
        }
    }

    pub fn warning(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            severity: ValidationSeverity::Warning,
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == ValidationSeverity::Error
    }
}
