//! Server envelope and the normalized result handed to callers

use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};

const NANOS_PER_SECOND: f64 = 1_000_000_000.0;

// ===== Wire Types =====

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct EnvelopeMessage
{   #[serde(default)]
    pub content: Option<String>
}

/// Raw JSON reply of the generate and chat endpoints.
/// Every field is optional, absence is decided by the normalizer.
/// The completion flag is read off the raw body before decoding.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawServerEnvelope
{   /// Chat shape
    #[serde(default)]
    pub message: Option<EnvelopeMessage>
  , /// Completion shape
    #[serde(default)]
    pub response: Option<String>
  , #[serde(default)]
    pub total_duration: Option<u64>
  , #[serde(default)]
    pub load_duration: Option<u64>
  , #[serde(default)]
    pub prompt_eval_duration: Option<u64>
  , #[serde(default)]
    pub eval_duration: Option<u64>
  , #[serde(default)]
    pub prompt_eval_count: Option<u64>
  , #[serde(default)]
    pub eval_count: Option<u64>
}

impl RawServerEnvelope
{   /// Answer text of whichever shape the server used
    pub fn text(&self) -> Option<&str>
    {   match &self.message
        {   Some(message) => message.content.as_deref()
          , None => self.response.as_deref()
        }
    }
}

/// Nanosecond counter to seconds, absent counts as zero
pub fn nanos_to_seconds(nanos: Option<u64>) -> f64
{   nanos.unwrap_or(0) as f64 / NANOS_PER_SECOND
}

// ===== Normalized Result =====

/// Answer payload of a successful request
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ResultValue
{   Text(String)
  , Json(serde_json::Map<String, serde_json::Value>)
}

impl ResultValue
{   pub fn as_text(&self) -> Option<&str>
    {   match self
        {   ResultValue::Text(s) => Some(s)
          , ResultValue::Json(_) => None
        }
    }

    pub fn as_json(&self)
      -> Option<&serde_json::Map<String, serde_json::Value>>
    {   match self
        {   ResultValue::Json(map) => Some(map)
          , ResultValue::Text(_) => None
        }
    }
}

/// Diagnostic side channel of a result
#[derive(Debug, Clone, PartialEq)]
pub enum Info
{   /// Plain text success
    Empty
  , /// Structured success with the unwrapping that was needed
    Structured
    {   thinking: bool
      , markdown: bool
    }
  , Failure(crate::error::Error)
}

impl Serialize for Info
{   fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
      S: Serializer
    {   match self
        {   Info::Empty => serializer.serialize_map(Some(0))?.end()
          , Info::Structured { thinking, markdown } => {
              let mut map = serializer.serialize_map(Some(2))?;
              map.serialize_entry("thinking", thinking)?;
              map.serialize_entry("markdown", markdown)?;
              map.end()
            }
          , Info::Failure(error) => {
              let mut map = serializer.serialize_map(Some(1))?;
              map.serialize_entry("error", &error.to_string())?;
              map.end()
            }
        }
    }
}

/// Stable output of one request/response cycle.
///
/// A result without a value always carries an error in `info` and
/// zeroed numbers, so callers never need to null-check the metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedResult
{   result: Option<ResultValue>
  , #[serde(rename = "time")]
    elapsed_time_seconds: f64
  , #[serde(rename = "time_load")]
    load_time_seconds: f64
  , #[serde(rename = "time_read")]
    read_time_seconds: f64
  , #[serde(rename = "time_write")]
    write_time_seconds: f64
  , #[serde(rename = "token")]
    output_token_count: u64
  , #[serde(rename = "input_token")]
    input_token_count: u64
  , info: Info
}

impl NormalizedResult
{   pub fn failure(error: crate::error::Error) -> Self
    {   NormalizedResult
        {   result: None
          , elapsed_time_seconds: 0.0
          , load_time_seconds: 0.0
          , read_time_seconds: 0.0
          , write_time_seconds: 0.0
          , output_token_count: 0
          , input_token_count: 0
          , info: Info::Failure(error)
        }
    }

    /// Text success carrying the envelope's telemetry
    pub fn text(text: String, envelope: &RawServerEnvelope) -> Self
    {   NormalizedResult
        {   result: Some(ResultValue::Text(text))
          , elapsed_time_seconds: nanos_to_seconds(
              envelope.total_duration
            )
          , load_time_seconds: nanos_to_seconds(envelope.load_duration)
          , read_time_seconds: nanos_to_seconds(
              envelope.prompt_eval_duration
            )
          , write_time_seconds: nanos_to_seconds(envelope.eval_duration)
          , output_token_count: envelope.eval_count.unwrap_or(0)
          , input_token_count: envelope.prompt_eval_count.unwrap_or(0)
          , info: Info::Empty
        }
    }

    /// Replace the text payload with a parsed JSON object,
    /// keeping timings and token counts.
    pub(crate) fn into_structured(
      self
    , value: serde_json::Map<String, serde_json::Value>
    , thinking: bool
    , markdown: bool
    ) -> Self
    {   NormalizedResult
        {   result: Some(ResultValue::Json(value))
          , info: Info::Structured { thinking, markdown }
          , ..self
        }
    }

    pub fn result(&self) -> Option<&ResultValue>
    {   self.result.as_ref()
    }

    pub fn into_result(self) -> Option<ResultValue>
    {   self.result
    }

    pub fn is_success(&self) -> bool
    {   self.result.is_some()
    }

    pub fn elapsed_time_seconds(&self) -> f64
    {   self.elapsed_time_seconds
    }

    pub fn load_time_seconds(&self) -> f64
    {   self.load_time_seconds
    }

    pub fn read_time_seconds(&self) -> f64
    {   self.read_time_seconds
    }

    pub fn write_time_seconds(&self) -> f64
    {   self.write_time_seconds
    }

    pub fn output_token_count(&self) -> u64
    {   self.output_token_count
    }

    pub fn input_token_count(&self) -> u64
    {   self.input_token_count
    }

    pub fn info(&self) -> &Info
    {   &self.info
    }

    pub fn error(&self) -> Option<&crate::error::Error>
    {   match &self.info
        {   Info::Failure(e) => Some(e)
          , _ => None
        }
    }

    /// Tokens per second while reading the prompt, 0 if unmeasured
    pub fn read_tokens_per_second(&self) -> f64
    {   if self.read_time_seconds > 0.0
        {   self.input_token_count as f64 / self.read_time_seconds
        } else
        {   0.0
        }
    }

    /// Tokens per second while generating, 0 if unmeasured
    pub fn write_tokens_per_second(&self) -> f64
    {   if self.write_time_seconds > 0.0
        {   self.output_token_count as f64 / self.write_time_seconds
        } else
        {   0.0
        }
    }
}
