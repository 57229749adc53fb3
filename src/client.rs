use std::io::Write;
use std::ops::ControlFlow;
use std::time::Duration;
use futures_util::StreamExt;
use log::{debug, error, info, trace, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{OllamaConfig, OptionOverrides};
use crate::error::Error;
use crate::request::{ChatMessage, RequestEnvelope, TransportFlags};
use crate::response::NormalizedResult;

// ===== Server Types =====

/// One entry of the model list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelTag
{   pub name: String
  , #[serde(default)]
    pub model: Option<String>
  , #[serde(default)]
    pub size: u64
  , #[serde(default)]
    pub digest: String
  , #[serde(default)]
    pub modified_at: Option<String>
}

#[derive(Debug, Clone, Deserialize)]
struct TagsResponse
{   #[serde(default)]
    models: Vec<ModelTag>
}

#[derive(Debug, Clone, Deserialize)]
struct PullProgress
{   #[serde(default)]
    status: Option<String>
  , #[serde(default)]
    error: Option<String>
  , #[serde(default)]
    completed: Option<u64>
  , #[serde(default)]
    total: Option<u64>
}

/// How a model pull ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome
{   /// The server reported `success`
    Completed
  , /// The progress stream closed without a `success` status
    StreamEnded
}

// ===== Client =====

/// Client for one Ollama server. Every call awaits exactly one
/// HTTP exchange; there is no retry and no shared mutable state.
#[derive(Debug, Clone)]
pub struct OllamaClient
{   config: OllamaConfig
  , http_client: reqwest::Client
}

impl OllamaClient
{   pub fn new(config: OllamaConfig) -> Result<Self, Error>
    {   config.validate()?;
        debug!("Creating OllamaClient for {}", config.base_url);

        let http_client = reqwest::Client::builder()
          .connect_timeout(config.timeout())
          .build()
          .map_err(|e| Error::InvalidConfiguration(e.to_string()))?;

        Ok(OllamaClient
        {   config
          , http_client
        })
    }

    pub fn config(&self) -> &OllamaConfig
    {   &self.config
    }

    fn map_reqwest_error(&self, e: reqwest::Error) -> Error
    {   if e.is_timeout()
        {   error!(
              "The request took too long, adjust the timeout ({}s)",
              self.config.timeout_secs
            );
            Error::Timeout(self.config.timeout())
        } else
        {   error!("Request exception: {}", e);
            Error::from(e)
        }
    }

    /// Single prompt completion. A schema requests structured output.
    pub async fn completion(
      &self
    , prompt: &str
    , model: &str
    , schema: Option<Value>
    , options: Option<&OptionOverrides>
    ) -> NormalizedResult
    {   let mut request = RequestEnvelope::completion(
          model,
          prompt,
          self.config.effective_options(options)
        );
        request.schema = schema;
        self.send(&request).await
    }

    /// Chat over an ordered message list. A schema requests
    /// structured output.
    pub async fn chat(
      &self
    , messages: Vec<ChatMessage>
    , model: &str
    , schema: Option<Value>
    , options: Option<&OptionOverrides>
    ) -> NormalizedResult
    {   let mut request = RequestEnvelope::chat(
          model,
          messages,
          self.config.effective_options(options)
        );
        request.schema = schema;
        self.send(&request).await
    }

    /// Send a prepared request. Never fails: transport problems come
    /// back as a failure result.
    pub async fn send(&self, request: &RequestEnvelope) -> NormalizedResult
    {   match self.exchange(request).await
        {   Ok(result) => result
          , Err(e) => NormalizedResult::failure(e)
        }
    }

    async fn exchange(
      &self
    , request: &RequestEnvelope
    ) -> Result<NormalizedResult, Error>
    {   let url = self.config.endpoint(request.path());
        let flags = TransportFlags::from_config(&self.config);
        let payload = request.to_payload(&flags);

        debug!("POST {} model={}", url, request.model);
        trace!("Payload: {}", payload);

        let response = self.http_client
          .post(&url)
          .header("Content-Type", "application/json")
          .header("accept", "application/json")
          .timeout(self.config.timeout())
          .json(&payload)
          .send()
          .await
          .map_err(|e| self.map_reqwest_error(e))?;

        let status = response.status();
        trace!("Response status: {}", status);

        if self.config.stream && status.is_success()
        {   return self.consume_stream(response).await;
        }

        let body = response.text()
          .await
          .map_err(|e| self.map_reqwest_error(e))?;

        Ok(if request.is_structured()
        {   crate::normalize::secure_json_response(status.as_u16(), &body)
        } else
        {   crate::normalize::secure_text_response(status.as_u16(), &body)
        })
    }

    /// Debug streaming: echo content fragments to stdout until the
    /// server reports completion. Yields no retrievable value.
    async fn consume_stream(
      &self
    , response: reqwest::Response
    ) -> Result<NormalizedResult, Error>
    {   let mut stdout = std::io::stdout();

        self.for_each_json_line(response, None, |chunk| {
          let content = chunk.get("message")
            .and_then(|m| m.get("content"))
            .or_else(|| chunk.get("response"))
            .and_then(Value::as_str);

          if let Some(content) = content
          {   let _ = write!(stdout, "{}", content);
              let _ = stdout.flush();
          }

          if chunk.get("done").and_then(Value::as_bool) == Some(true)
          {   ControlFlow::Break(())
          } else
          {   ControlFlow::Continue(())
          }
        })
        .await?;

        let _ = writeln!(stdout);
        warn!("Streaming mode is for debugging, no result is returned");
        Ok(NormalizedResult::failure(Error::StreamingNoValue))
    }

    /// List the models available on the server
    pub async fn models(&self) -> Result<Vec<ModelTag>, Error>
    {   let url = self.config.endpoint("/api/tags");
        debug!("GET {}", url);

        let response = self.http_client
          .get(&url)
          .header("accept", "application/json")
          .timeout(self.config.timeout())
          .send()
          .await
          .map_err(|e| self.map_reqwest_error(e))?;

        let status = response.status();
        let body = response.text()
          .await
          .map_err(|e| self.map_reqwest_error(e))?;

        if !status.is_success()
        {   error!("Model list failed with status {}: {}", status, body);
            return Err(http_error(status.as_u16(), &body));
        }

        let tags: TagsResponse = serde_json::from_str(&body)
          .map_err(|e| {
            error!("Failed to parse model list: {}", e);
            Error::ServerEnvelopeDecode(e.to_string())
          })?;

        debug!("Retrieved {} models", tags.models.len());
        Ok(tags.models)
    }

    /// Download `name:tag` onto the server, logging progress.
    /// No overall timeout applies: downloads may take a long time.
    /// The configured timeout bounds the wait for the response head
    /// and for every progress chunk after it.
    pub async fn pull_model(
      &self
    , name: &str
    , tag: &str
    ) -> Result<PullOutcome, Error>
    {   let url = self.config.endpoint("/api/pull");
        let model = format!("{}:{}", name, tag);
        debug!("POST {} model={}", url, model);

        let limit = self.config.timeout();
        let request = self.http_client
          .post(&url)
          .header("Content-Type", "application/json")
          .header("accept", "application/json")
          .json(&serde_json::json!({ "model": model }))
          .send();
        let response = tokio::time::timeout(limit, request)
          .await
          .map_err(|_| self.stalled(limit))?
          .map_err(|e| self.map_reqwest_error(e))?;

        let status = response.status();
        if !status.is_success()
        {   let body = response.text().await.unwrap_or_default();
            error!("Pull failed with status {}: {}", status, body);
            if status == reqwest::StatusCode::NOT_FOUND
            {   return Err(Error::NotFound(model));
            }
            return Err(http_error(status.as_u16(), &body));
        }

        let mut outcome = PullOutcome::StreamEnded;
        let mut failure: Option<Error> = None;

        self.for_each_json_line(response, Some(limit), |line| {
          let progress: PullProgress = match serde_json::from_value(line)
          {   Ok(p) => p
            , Err(e) => {
                warn!("Skipping unreadable pull progress: {}", e);
                return ControlFlow::Continue(());
              }
          };

          if let Some(message) = progress.error
          {   error!("Pull of {} failed: {}", model, message);
              failure = Some(Error::Other(message));
              return ControlFlow::Break(());
          }

          let status = progress.status.unwrap_or_default();
          match (progress.completed, progress.total)
          {   (Some(done), Some(total)) if total > 0 => {
                info!("Pulling model: {} ({}/{})", status, done, total);
              }
            , _ => info!("Pulling model: {}", status)
          }

          if status == "success"
          {   outcome = PullOutcome::Completed;
              ControlFlow::Break(())
          } else
          {   ControlFlow::Continue(())
          }
        })
        .await?;

        match failure
        {   Some(e) => Err(e)
          , None => Ok(outcome)
        }
    }

    fn stalled(&self, limit: Duration) -> Error
    {   error!(
          "No data from the server within {}s, giving up",
          limit.as_secs_f64()
        );
        Error::Timeout(limit)
    }

    /// Feed each line of a line-delimited JSON body to `f` until it
    /// breaks or the body ends. Undecodable lines are logged and skipped.
    /// With `idle` set, a gap longer than that between chunks is a
    /// timeout.
    async fn for_each_json_line<F>(
      &self
    , response: reqwest::Response
    , idle: Option<Duration>
    , mut f: F
    ) -> Result<(), Error>
    where
      F: FnMut(Value) -> ControlFlow<()>
    {   let mut stream = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();

        loop
        {   let next = match idle
            {   Some(limit) => tokio::time::timeout(limit, stream.next())
                  .await
                  .map_err(|_| self.stalled(limit))?
              , None => stream.next().await
            };
            let chunk = match next
            {   Some(chunk) => chunk.map_err(|e| self.map_reqwest_error(e))?
              , None => break
            };
            buffer.extend_from_slice(&chunk);

            while let Some(pos) = buffer.iter().position(|&b| b == b'\n')
            {   let line: Vec<u8> = buffer.drain(..=pos).collect();
                if let ControlFlow::Break(()) = dispatch_line(&line, &mut f)
                {   return Ok(());
                }
            }
        }

        if !buffer.is_empty()
        {   let _ = dispatch_line(&buffer, &mut f);
        }
        Ok(())
    }
}

/// Build an HTTP error from a non-success body, preferring the
/// server's `error` field.
fn http_error(status: u16, body: &str) -> Error
{   let message = serde_json::from_str::<Value>(body)
      .ok()
      .and_then(|v| {
        v.get("error")
          .and_then(Value::as_str)
          .filter(|m| !m.is_empty())
          .map(str::to_string)
      })
      .unwrap_or_else(|| "Unknown error".to_string());
    Error::Http { status, message }
}

fn dispatch_line<F>(line: &[u8], f: &mut F) -> ControlFlow<()>
where
  F: FnMut(Value) -> ControlFlow<()>
{   let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if text.is_empty()
    {   return ControlFlow::Continue(());
    }
    match serde_json::from_str::<Value>(text)
    {   Ok(value) => f(value)
      , Err(e) => {
          error!("Failed to decode JSON during streaming: {}", e);
          ControlFlow::Continue(())
        }
    }
}
