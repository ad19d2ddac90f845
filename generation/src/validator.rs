//! Pre-flight request checks, run before any cache or provider access.

use config::ModelCatalog;
use errors::GenerationError;
use gen_core::types::{ContentType, GenerationConfig, ThemeContext, ValidationResult};

const MAX_SUB_GENRES: usize = 3;
const RECOMMENDED_MIN_ELEMENTS: usize = 2;
const TOKEN_WARNING_RATIO: f64 = 0.75;
const HIGH_TEMPERATURE: f32 = 0.9;
const SOFT_PENALTY_BOUND: f32 = 1.5;
const HARD_PENALTY_BOUND: f32 = 2.0;

pub struct RequestValidator {
    catalog: ModelCatalog
}

impl RequestValidator {
    pub fn new(catalog: ModelCatalog) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    /// Fails with the first error finding; otherwise returns the warnings.
    pub fn validate(
        &self,
        content_type: &ContentType,
        theme: Option<&ThemeContext>,
        config: Option<&GenerationConfig>
    ) -> Result<Vec<ValidationResult>, GenerationError> {
        let findings = self.findings(content_type, theme, config);
        if let Some(first) = findings.iter().find(|f| f.is_error()) {
            return Err(GenerationError::validation(&first.field, &first.message));
        }
        Ok(findings)
    }

    /// Every finding, errors and warnings, in check order.
    pub fn findings(
        &self,
        content_type: &ContentType,
        theme: Option<&ThemeContext>,
        config: Option<&GenerationConfig>
    ) -> Vec<ValidationResult> {
        let mut findings = Vec::new();

        if content_type.as_str().trim().is_empty() {
            findings.push(ValidationResult::error(
                "content_type",
                "Content type is required"
            ));
        }

        if let Some(theme) = theme {
            check_theme(theme, &mut findings);
            check_content_type_against_theme(content_type, theme, &mut findings);
        }

        if let Some(config) = config {
            self.check_config(config, &mut findings);
        }

        findings
    }

    fn check_config(&self, config: &GenerationConfig, findings: &mut Vec<ValidationResult>) {
        match self.catalog.context_window(&config.model) {
            None => findings.push(ValidationResult::error(
                "config.model",
                format!("Unknown model: {}", config.model)
            )),
            Some(window) => check_max_tokens(config.max_tokens, window, findings)
        }
        if config.max_tokens == 0 {
            findings.push(ValidationResult::error(
                "config.max_tokens",
                "Max tokens must be greater than 0"
            ));
        }

        if !(0.0..=1.0).contains(&config.temperature) {
            findings.push(ValidationResult::error(
                "config.temperature",
                "Temperature must be between 0 and 1"
            ));
        } else if config.temperature == 0.0 {
            findings.push(ValidationResult::warning(
                "config.temperature",
                "Temperature of 0 produces deterministic, repetitive output"
            ));
        } else if config.temperature > HIGH_TEMPERATURE {
            findings.push(ValidationResult::warning(
                "config.temperature",
                "Temperature above 0.9 may produce incoherent output"
            ));
        }

        check_penalty("config.presence_penalty", config.presence_penalty, findings);
        check_penalty("config.frequency_penalty", config.frequency_penalty, findings);

        if !config.fallback_model.is_empty() && !self.catalog.contains(&config.fallback_model) {
            findings.push(ValidationResult::error(
                "config.fallback_model",
                format!("Unknown fallback model: {}", config.fallback_model)
            ));
        }
    }
}

fn check_max_tokens(max_tokens: u32, window: u32, findings: &mut Vec<ValidationResult>) {
    if max_tokens > window {
        findings.push(ValidationResult::error(
            "config.max_tokens",
            format!("Max tokens {max_tokens} exceeds the model context window of {window}")
        ));
    } else if f64::from(max_tokens) > f64::from(window) * TOKEN_WARNING_RATIO {
        findings.push(ValidationResult::warning(
            "config.max_tokens",
            format!("Max tokens {max_tokens} uses more than 75% of the {window}-token window")
        ));
    }
}

fn check_penalty(field: &str, value: f32, findings: &mut Vec<ValidationResult>) {
    if !(-HARD_PENALTY_BOUND..=HARD_PENALTY_BOUND).contains(&value) {
        findings.push(ValidationResult::error(
            field,
            "Penalty must be between -2 and 2"
        ));
    } else if !(-SOFT_PENALTY_BOUND..=SOFT_PENALTY_BOUND).contains(&value) {
        findings.push(ValidationResult::warning(
            field,
            "Penalty outside [-1.5, 1.5] may degrade output quality"
        ));
    }
}

fn check_theme(theme: &ThemeContext, findings: &mut Vec<ValidationResult>) {
    let elements = &theme.elements;

    if elements.key_words.is_empty() {
        findings.push(ValidationResult::error(
            "theme.elements.key_words",
            "Theme must have at least one key word"
        ));
    }

    if elements
        .style_guide
        .as_deref()
        .is_none_or(|guide| guide.trim().is_empty())
    {
        findings.push(ValidationResult::error(
            "theme.elements.style_guide",
            "Theme must have a style guide"
        ));
    }

    if theme
        .sub_genres
        .iter()
        .any(|sub| sub.eq_ignore_ascii_case(&theme.genre))
    {
        findings.push(ValidationResult::error(
            "theme.sub_genres",
            "Sub-genres cannot include the primary genre"
        ));
    }

    if theme.sub_genres.len() > MAX_SUB_GENRES {
        findings.push(ValidationResult::warning(
            "theme.sub_genres",
            "More than 3 sub-genres may dilute the theme"
        ));
    }

    if elements.character_traits.len() < RECOMMENDED_MIN_ELEMENTS {
        findings.push(ValidationResult::warning(
            "theme.elements.character_traits",
            "At least 2 character traits are recommended"
        ));
    }

    if elements.world_elements.len() < RECOMMENDED_MIN_ELEMENTS {
        findings.push(ValidationResult::warning(
            "theme.elements.world_elements",
            "At least 2 world elements are recommended"
        ));
    }
}

fn check_content_type_against_theme(
    content_type: &ContentType,
    theme: &ThemeContext,
    findings: &mut Vec<ValidationResult>
) {
    if content_type.requires_character_traits() && theme.elements.character_traits.is_empty() {
        findings.push(ValidationResult::error(
            "theme.elements.character_traits",
            format!("Content type {content_type} requires character traits")
        ));
    }
    if content_type.requires_world_elements() && theme.elements.world_elements.is_empty() {
        findings.push(ValidationResult::error(
            "theme.elements.world_elements",
            format!("Content type {content_type} requires world elements")
        ));
    }
}
