use gen_core::traits::PromptBuilder;
use gen_core::types::{ChatMessage, ContentType, Prompt, ThemeContext};

#[derive(Debug, Clone)]
pub struct PromptTemplate {
    pub system: String,
    pub user: String
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self {
            system: GENERATION_SYSTEM.to_string(),
            user: GENERATION_USER.to_string()
        }
    }
}

/// Renders a system + user chat prompt from a template and the theme.
#[derive(Debug, Clone, Default)]
pub struct DefaultPromptBuilder {
    template: PromptTemplate
}

impl DefaultPromptBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_template(template: PromptTemplate) -> Self {
        Self { template }
    }

    fn theme_section(theme: Option<&ThemeContext>) -> String {
        let Some(theme) = theme else {
            return "No theme constraints apply.".to_string();
        };

        let mut lines = vec![format!("Theme: {} ({})", theme.name, theme.genre)];
        if !theme.sub_genres.is_empty() {
            lines.push(format!("Sub-genres: {}", theme.sub_genres.join(", ")));
        }
        if !theme.tone.is_empty() {
            lines.push(format!("Tone: {}", theme.tone));
        }

        let elements = &theme.elements;
        push_list(&mut lines, "Key words", &elements.key_words);
        push_list(&mut lines, "Never use", &elements.excluded_words);
        push_list(&mut lines, "Character traits", &elements.character_traits);
        push_list(&mut lines, "World elements", &elements.world_elements);
        if let Some(guide) = &elements.style_guide {
            lines.push(format!("Style guide: {guide}"));
        }
        lines.join("\n")
    }
}

fn push_list(lines: &mut Vec<String>, label: &str, items: &[String]) {
    if !items.is_empty() {
        lines.push(format!("{label}: {}", items.join(", ")));
    }
}

fn humanize(content_type: &ContentType) -> String {
    content_type.as_str().replace('_', " ")
}

impl PromptBuilder for DefaultPromptBuilder {
    fn build(&self, content_type: &ContentType, theme: Option<&ThemeContext>) -> Prompt {
        let user = self
            .template
            .user
            .replace("{content_type}", &humanize(content_type))
            .replace("{theme}", &Self::theme_section(theme));

        Prompt::Messages(vec![
            ChatMessage::system(self.template.system.clone()),
            ChatMessage::user(user),
        ])
    }
}

/// Prompt for the secondary check of a generated text against its theme.
/// The reply must begin with "valid" when the text fits.
pub fn theme_validation_prompt(content: &str, theme: &ThemeContext) -> Prompt {
    Prompt::Messages(vec![
        ChatMessage::system(THEME_CHECK_SYSTEM),
        ChatMessage::user(format!(
            "{}\n\nText:\n{content}",
            DefaultPromptBuilder::theme_section(Some(theme))
        )),
    ])
}

const GENERATION_SYSTEM: &str = "\
You are a game writer producing content for a themed world. Stay strictly within the theme. \
                                 Never use excluded words. Return only the requested content.";

const GENERATION_USER: &str = "\
Write a {content_type} that fits the following theme.

{theme}";

const THEME_CHECK_SYSTEM: &str = "\
You review game writing for theme consistency. Answer \"valid\" if the text fits the theme. \
                                  Otherwise answer \"invalid: \" followed by a one-line reason.";
