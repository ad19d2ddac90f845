use anyhow::{Result, bail};
use clap::Args;
use config::Config;
use gen_core::types::{ContentType, GenerationConfig, ValidationResult};
use generation::RequestValidator;
use std::path::PathBuf;

use crate::output;

#[derive(Args)]
pub struct ValidateArgs {
    #[arg(value_name = "CONTENT_TYPE")]
    pub content_type: String,

    /// Theme context as a JSON file
    #[arg(long, value_name = "PATH")]
    pub theme: Option<PathBuf>,

    #[arg(long)]
    pub model: Option<String>,

    #[arg(long)]
    pub fallback: Option<String>,

    #[arg(long)]
    pub temperature: Option<f32>,

    #[arg(long)]
    pub max_tokens: Option<u32>,

    /// Output findings as JSON
    #[arg(long)]
    pub json: bool,

    /// Fail on warnings (exit code 1)
    #[arg(long)]
    pub strict: bool
}

pub fn run(args: ValidateArgs, config: &Config) -> Result<()> {
    let Ok(content_type) = args.content_type.parse::<ContentType>();
    let theme = args.theme.as_deref().map(super::load_theme).transpose()?;

    let mut generation = GenerationConfig::new(
        args.model
            .clone()
            .unwrap_or_else(|| config.generation.default_model.clone())
    )
    .with_fallback(args.fallback.clone().unwrap_or_default());
    if let Some(temperature) = args.temperature {
        generation = generation.with_temperature(temperature);
    }
    if let Some(max_tokens) = args.max_tokens {
        generation = generation.with_max_tokens(max_tokens);
    }

    let validator = RequestValidator::new(config.model_catalog());
    let findings = validator.findings(&content_type, theme.as_ref(), Some(&generation));
    report(&findings, args.json)?;

    let errors = findings.iter().filter(|f| f.is_error()).count();
    let warnings = findings.len() - errors;
    if errors > 0 {
        bail!("validation failed with {errors} error(s)");
    }
    if args.strict && warnings > 0 {
        bail!("validation produced {warnings} warning(s) in strict mode");
    }
    Ok(())
}

fn report(findings: &[ValidationResult], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(findings)?);
        return Ok(());
    }

    output::header("Request Validation");
    if findings.is_empty() {
        output::success("no findings");
        return Ok(());
    }
    for finding in findings {
        let line = format!("{}: {}", finding.field, finding.message);
        if finding.is_error() {
            output::error(&line);
        } else {
            output::warn(&line);
        }
    }
    Ok(())
}
