//! Layered parsing of model output into typed values.
//!
//! Strict JSON first, then a bounded repair pass over the most likely JSON
//! span. Callers learn which layer succeeded through [`ParseQuality`].

use errors::GenerationError;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Bytes of model output scanned when looking for a JSON span.
pub const MAX_REPAIR_SCAN: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseQuality {
    Strict,
    Repaired
}

#[derive(Debug, Clone, PartialEq)]
pub struct Parsed<T> {
    pub value: T,
    pub quality: ParseQuality
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("Unparseable output: {reason}")]
    Unparseable { reason: String }
}

impl From<ParseError> for GenerationError {
    fn from(error: ParseError) -> Self {
        match error {
            ParseError::Unparseable { reason } => GenerationError::Parse { reason }
        }
    }
}

pub fn parse_structured<T: DeserializeOwned>(text: &str) -> Result<Parsed<T>, ParseError> {
    let trimmed = text.trim();
    let strict_error = match serde_json::from_str::<T>(trimmed) {
        Ok(value) => {
            return Ok(Parsed {
                value,
                quality: ParseQuality::Strict
            });
        }
        Err(e) => e
    };

    let candidates = [fenced_block(trimmed), balanced_span(trimmed)];
    for candidate in candidates.into_iter().flatten() {
        if let Ok(value) = serde_json::from_str::<T>(candidate) {
            return Ok(Parsed {
                value,
                quality: ParseQuality::Repaired
            });
        }
        if let Ok(value) = serde_json::from_str::<T>(&strip_trailing_commas(candidate)) {
            return Ok(Parsed {
                value,
                quality: ParseQuality::Repaired
            });
        }
    }

    Err(ParseError::Unparseable {
        reason: strict_error.to_string()
    })
}

/// Body of the first fenced code block, preferring a `json` fence.
fn fenced_block(text: &str) -> Option<&str> {
    let body = match text.split_once("```json") {
        Some((_, rest)) => rest,
        None => text.split_once("```")?.1
    };
    let (inner, _) = body.split_once("```")?;
    Some(inner.trim())
}

/// First balanced `{...}` or `[...]` span within the scan bound.
fn balanced_span(text: &str) -> Option<&str> {
    let bytes = &text.as_bytes()[..text.len().min(MAX_REPAIR_SCAN)];
    let start = bytes.iter().position(|b| *b == b'{' || *b == b'[')?;

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, byte) in bytes[start..].iter().enumerate() {
        if in_string {
            match byte {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Drops commas that directly precede a closing bracket, outside strings.
fn strip_trailing_commas(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in chars.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if *c == '\\' {
                escaped = true;
            } else if *c == '"' {
                in_string = false;
            }
            out.push(*c);
            continue;
        }
        if *c == '"' {
            in_string = true;
        } else if *c == ',' {
            let next = chars[i + 1..].iter().find(|n| !n.is_whitespace());
            if matches!(next, Some('}' | ']')) {
                continue;
            }
        }
        out.push(*c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Npc {
        name: String,
        traits: Vec<String>
    }

    #[test]
    fn test_strict_json() {
        let parsed: Parsed<Npc> =
            parse_structured("  {\"name\": \"Mira\", \"traits\": [\"sly\"]}\n").unwrap();
        assert_eq!(parsed.quality, ParseQuality::Strict);
        assert_eq!(parsed.value.name, "Mira");
    }

    #[test]
    fn test_fenced_block_with_prose() {
        let text = "Here is your character:\n```json\n{\"name\": \"Orrin\", \"traits\": []}\n```\nEnjoy!";
        let parsed: Parsed<Npc> = parse_structured(text).unwrap();
        assert_eq!(parsed.quality, ParseQuality::Repaired);
        assert_eq!(parsed.value.name, "Orrin");
    }

    #[test]
    fn test_balanced_span_with_braces_in_strings() {
        let text = "Sure! {\"name\": \"Brace } Man\", \"traits\": [\"odd]\"]} Hope that helps.";
        let parsed: Parsed<Npc> = parse_structured(text).unwrap();
        assert_eq!(parsed.value.name, "Brace } Man");
        assert_eq!(parsed.value.traits, vec!["odd]".to_string()]);
    }

    #[test]
    fn test_trailing_commas_repaired() {
        let text = "```\n{\"name\": \"Vel\", \"traits\": [\"calm\", \"tall\",],}\n```";
        let parsed: Parsed<Npc> = parse_structured(text).unwrap();
        assert_eq!(parsed.quality, ParseQuality::Repaired);
        assert_eq!(parsed.value.traits.len(), 2);
    }

    #[test]
    fn test_array_span() {
        let parsed: Parsed<Vec<u32>> = parse_structured("values: [1, 2, 3] done").unwrap();
        assert_eq!(parsed.value, vec![1, 2, 3]);
    }

    #[test]
    fn test_commas_inside_strings_are_kept() {
        assert_eq!(strip_trailing_commas("[\"a,]\",]"), "[\"a,]\"]");
    }

    #[test]
    fn test_unparseable() {
        let result: Result<Parsed<Npc>, _> = parse_structured("I cannot help with that.");
        assert!(matches!(result, Err(ParseError::Unparseable { .. })));

        let err: GenerationError = result.unwrap_err().into();
        assert_eq!(err.kind(), "parse");
    }

    #[test]
    fn test_span_beyond_scan_bound_is_ignored() {
        let text = format!("{}{{\"name\": \"Far\", \"traits\": []}}", " x".repeat(MAX_REPAIR_SCAN));
        let result: Result<Parsed<Npc>, _> = parse_structured(&text);
        assert!(result.is_err());
    }
}
