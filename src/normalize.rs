//! Envelope validation and structured extraction.
//!
//! Both entry points take the HTTP status and the raw body and never
//! fail: every error ends up as `NormalizedResult::failure`.

use std::sync::OnceLock;
use log::{error, trace, warn};
use regex::Regex;
use serde_json::Value;

use crate::error::Error;
use crate::response::{NormalizedResult, RawServerEnvelope, ResultValue};

const THINK_OPEN: &str = "<think>";

fn think_block() -> &'static Regex
{   static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
      Regex::new(r"(?s)^\s*<think>.*?</think>\s*")
        .unwrap_or_else(|e| panic!("invalid think pattern: {}", e))
    })
}

fn json_fence() -> &'static Regex
{   static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
      Regex::new(r"(?s)```json(.*?)```")
        .unwrap_or_else(|e| panic!("invalid fence pattern: {}", e))
    })
}

fn is_success(status: u16) -> bool
{   (200..300).contains(&status)
}

/// Validate a plain-text reply.
pub fn secure_text_response(status: u16, body: &str) -> NormalizedResult
{   match text_response(status, body)
    {   Ok(result) => result
      , Err(e) => {
          error!("Text response rejected ({}): {}", e.tag(), e);
          NormalizedResult::failure(e)
        }
    }
}

fn text_response(
  status: u16
, body: &str
) -> Result<NormalizedResult, Error>
{   trace!("Envelope status {}: {}", status, body);

    let parsed: Value = serde_json::from_str(body)
      .map_err(|e| Error::ServerEnvelopeDecode(e.to_string()))?;

    if !is_success(status)
    {   let message = parsed.get("error")
          .and_then(Value::as_str)
          .filter(|m| !m.is_empty())
          .unwrap_or("Unknown error")
          .to_string();
        return Err(Error::Http { status, message });
    }

    // completion flag first, the counters may be garbage mid-answer
    if parsed.get("done").and_then(Value::as_bool) != Some(true)
    {   return Err(Error::IncompleteAnswer);
    }

    let envelope: RawServerEnvelope = serde_json::from_value(parsed)
      .map_err(|e| Error::Other(e.to_string()))?;

    let text = envelope.text()
      .ok_or_else(|| {
        Error::Other(
          "response carries neither message content nor response text"
            .to_string()
        )
      })?
      .to_string();

    Ok(NormalizedResult::text(
      crate::repair::repair_or_keep(text),
      &envelope
    ))
}

/// Validate a reply to a schema-constrained request and parse the
/// model's text into a JSON object.
pub fn secure_json_response(status: u16, body: &str) -> NormalizedResult
{   let text_result = secure_text_response(status, body);

    let message = match text_result.result()
    {   Some(ResultValue::Text(s)) => s.clone()
      , Some(ResultValue::Json(_)) | None => return text_result
    };

    match extract_json(&message)
    {   Ok(extracted) => text_result.into_structured(
          extracted.value,
          extracted.thinking,
          extracted.markdown
        )
      , Err(e) => {
          error!("Structured extraction failed ({}): {}", e.tag(), e);
          NormalizedResult::failure(e)
        }
    }
}

/// A JSON object recovered from model output
#[derive(Debug, Clone, PartialEq)]
pub struct Extracted
{   pub value: serde_json::Map<String, Value>
  , /// A leading reasoning block was removed
    pub thinking: bool
  , /// The object was wrapped in a ```json fence
    pub markdown: bool
}

/// Remove a leading `<think>...</think>` block.
/// Returns the remaining text and whether a block was found.
pub fn strip_reasoning_block(text: &str) -> (String, bool)
{   if !text.trim().starts_with(THINK_OPEN)
    {   return (text.to_string(), false);
    }
    warn!("Model returned a reasoning block before JSON");
    let stripped = think_block().replace(text, "");
    (stripped.trim().to_string(), true)
}

/// Keep only the interior of the first ```json fence, if any.
pub fn strip_markdown_fence(text: &str) -> (String, bool)
{   match json_fence().captures(text).and_then(|c| c.get(1))
    {   Some(inner) => {
          warn!("Model returned markdown instead of only JSON");
          (inner.as_str().trim().to_string(), true)
        }
      , None => (text.to_string(), false)
    }
}

/// Unwrap and parse model output into a JSON object.
pub fn extract_json(text: &str) -> Result<Extracted, Error>
{   let (text, thinking) = strip_reasoning_block(text);
    let (text, markdown) = strip_markdown_fence(&text);

    let value: Value = serde_json::from_str(&text)
      .map_err(|e| Error::ModelOutputDecode(e.to_string()))?;

    match value
    {   Value::Object(map) => Ok(Extracted
        {   value: map
          , thinking
          , markdown
        })
      , other => Err(Error::Other(format!(
          "expected a JSON object, got {}",
          json_kind(&other)
        )))
    }
}

fn json_kind(value: &Value) -> &'static str
{   match value
    {   Value::Null => "null"
      , Value::Bool(_) => "a boolean"
      , Value::Number(_) => "a number"
      , Value::String(_) => "a string"
      , Value::Array(_) => "an array"
      , Value::Object(_) => "an object"
    }
}
