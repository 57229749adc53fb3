//! Configuration for the Ollama server connection and generation options

use std::fs;
use std::path::Path;
use std::time::Duration;
use log::debug;
use serde::{Deserialize, Serialize};

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:11434";
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_KEEP_ALIVE: &str = "5m";

/// Full set of generation options sent with every request.
/// Defaults mirror the server's own defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationOptions
{   /// Context window size in tokens
    pub num_ctx: u32
  , /// Look-back window for repetition, 0 = disabled, -1 = num_ctx
    pub repeat_last_n: i32
  , pub repeat_penalty: f64
  , pub temperature: f64
  , pub seed: i64
  , pub stop: Vec<String>
  , /// Max tokens to generate, -1 = unbounded
    pub num_predict: i32
  , pub top_k: i32
  , pub top_p: f64
  , pub min_p: f64
  , /// Options this crate does not model explicitly
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>
}

impl Default for GenerationOptions
{   fn default() -> Self
    {   GenerationOptions
        {   num_ctx: 2048
          , repeat_last_n: 64
          , repeat_penalty: 1.1
          , temperature: 0.8
          , seed: 0
          , stop: vec![]
          , num_predict: -1
          , top_k: 40
          , top_p: 0.9
          , min_p: 0.0
          , extra: serde_json::Map::new()
        }
    }
}

/// Caller-supplied partial options. Every key left as `None`
/// keeps the value of the options it is merged over.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptionOverrides
{   #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_ctx: Option<u32>
  , #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat_last_n: Option<i32>
  , #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat_penalty: Option<f64>
  , #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>
  , #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>
  , #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>
  , #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_predict: Option<i32>
  , #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<i32>
  , #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>
  , #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_p: Option<f64>
  , #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>
}

impl OptionOverrides
{   pub fn with_temperature(mut self, temperature: f64) -> Self
    {   self.temperature = Some(temperature);
        self
    }

    pub fn with_num_ctx(mut self, num_ctx: u32) -> Self
    {   self.num_ctx = Some(num_ctx);
        self
    }

    pub fn with_seed(mut self, seed: i64) -> Self
    {   self.seed = Some(seed);
        self
    }

    pub fn with_num_predict(mut self, num_predict: i32) -> Self
    {   self.num_predict = Some(num_predict);
        self
    }

    pub fn with_stop(mut self, stop: Vec<String>) -> Self
    {   self.stop = Some(stop);
        self
    }
}

impl GenerationOptions
{   /// Shallow per-key merge: each key set in `overrides` replaces
    /// the corresponding value, every other key is kept.
    pub fn merged_with(
      &self
    , overrides: &OptionOverrides
    ) -> GenerationOptions
    {   let mut extra = self.extra.clone();
        for (key, value) in &overrides.extra
        {   extra.insert(key.clone(), value.clone());
        }

        GenerationOptions
        {   num_ctx: overrides.num_ctx.unwrap_or(self.num_ctx)
          , repeat_last_n: overrides.repeat_last_n
              .unwrap_or(self.repeat_last_n)
          , repeat_penalty: overrides.repeat_penalty
              .unwrap_or(self.repeat_penalty)
          , temperature: overrides.temperature
              .unwrap_or(self.temperature)
          , seed: overrides.seed.unwrap_or(self.seed)
          , stop: overrides.stop.clone()
              .unwrap_or_else(|| self.stop.clone())
          , num_predict: overrides.num_predict
              .unwrap_or(self.num_predict)
          , top_k: overrides.top_k.unwrap_or(self.top_k)
          , top_p: overrides.top_p.unwrap_or(self.top_p)
          , min_p: overrides.min_p.unwrap_or(self.min_p)
          , extra
        }
    }
}

/// Connection and request configuration for one Ollama server.
/// Read-only once handed to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaConfig
{   /// Base URL including scheme and port
    pub base_url: String
  , /// Request timeout in seconds
    pub timeout_secs: u64
  , /// Debug streaming: echo tokens, return no value
    pub stream: bool
  , /// Ask reasoning models to think before answering
    pub think: bool
  , /// How long the server keeps the model loaded
    pub keep_alive: String
  , /// Options every request starts from
    pub options: GenerationOptions
}

impl Default for OllamaConfig
{   fn default() -> Self
    {   OllamaConfig
        {   base_url: DEFAULT_BASE_URL.to_string()
          , timeout_secs: DEFAULT_TIMEOUT_SECS
          , stream: false
          , think: false
          , keep_alive: DEFAULT_KEEP_ALIVE.to_string()
          , options: GenerationOptions::default()
        }
    }
}

impl OllamaConfig
{   pub fn new(base_url: impl Into<String>) -> Self
    {   OllamaConfig
        {   base_url: base_url.into()
          , ..OllamaConfig::default()
        }
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self
    {   self.timeout_secs = secs;
        self
    }

    pub fn with_stream(mut self, stream: bool) -> Self
    {   self.stream = stream;
        self
    }

    pub fn with_think(mut self, think: bool) -> Self
    {   self.think = think;
        self
    }

    pub fn timeout(&self) -> Duration
    {   Duration::from_secs(self.timeout_secs)
    }

    /// Base URL without a trailing slash
    pub fn endpoint(&self, path: &str) -> String
    {   format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    /// Options for one request: defaults merged with the caller's.
    pub fn effective_options(
      &self
    , overrides: Option<&OptionOverrides>
    ) -> GenerationOptions
    {   match overrides
        {   Some(o) => self.options.merged_with(o)
          , None => self.options.clone()
        }
    }

    pub fn validate(&self) -> Result<(), crate::error::Error>
    {   if !(self.base_url.starts_with("http://")
          || self.base_url.starts_with("https://"))
        {   return Err(crate::error::Error::InvalidConfiguration(
              format!("base_url must be http(s): {}", self.base_url)
            ));
        }
        if self.timeout_secs == 0
        {   return Err(crate::error::Error::InvalidConfiguration(
              "timeout_secs must be greater than zero".to_string()
            ));
        }
        Ok(())
    }

    pub fn from_toml_str(s: &str)
      -> Result<Self, crate::error::Error>
    {   let config: OllamaConfig = toml::from_str(s)
          .map_err(|e| {
            crate::error::Error::InvalidConfiguration(e.to_string())
          })?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_toml_file(path: &Path)
      -> Result<Self, crate::error::Error>
    {   debug!("Loading config from {}", path.display());
        let contents = fs::read_to_string(path)
          .map_err(|e| {
            crate::error::Error::InvalidConfiguration(
              format!("{}: {}", path.display(), e)
            )
          })?;
        Self::from_toml_str(&contents)
    }
}
