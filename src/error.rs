use std::fmt;
use std::time::Duration;

/// Error type for every failure the normalization layer can observe.
/// Implements Clone and PartialEq so it can live inside a
/// `NormalizedResult` and be compared in tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error
{   /// The request did not finish within the configured timeout
    Timeout(Duration)
  , /// Network-level failure (refused connection, DNS, broken body)
    Transport(String)
  , /// Non-success HTTP status with the server-supplied message
    Http
    {   status: u16
      , message: String
    }
  , /// The server returned before the model finished its answer
    IncompleteAnswer
  , /// The HTTP body itself is not valid JSON
    ServerEnvelopeDecode(String)
  , /// The model's text, after unwrapping, is not valid JSON
    ModelOutputDecode(String)
  , /// Debug streaming consumed the answer, nothing to return
    StreamingNoValue
  , /// Text repair produced an implausible result (non-fatal)
    TextRepair(String)
  , /// Requested model or resource does not exist on the server
    NotFound(String)
  , /// Invalid configuration
    InvalidConfiguration(String)
  , /// Reading or writing local files
    Io(String)
  , /// Anything else, carrying its textual description
    Other(String)
}

impl Error
{   /// Short machine-friendly tag for logs and CSV diagnostics.
    pub fn tag(&self) -> &'static str
    {   match self
        {   Error::Timeout(_) => "timeout"
          , Error::Transport(_) => "transport"
          , Error::Http { .. } => "http"
          , Error::IncompleteAnswer => "incomplete_answer"
          , Error::ServerEnvelopeDecode(_) => "server_envelope_decode"
          , Error::ModelOutputDecode(_) => "model_output_decode"
          , Error::StreamingNoValue => "streaming"
          , Error::TextRepair(_) => "text_repair"
          , Error::NotFound(_) => "not_found"
          , Error::InvalidConfiguration(_) => "invalid_configuration"
          , Error::Io(_) => "io"
          , Error::Other(_) => "other"
        }
    }
}

impl fmt::Display for Error
{   fn fmt(&self, f: &mut fmt::Formatter<'_>)
      -> fmt::Result
    {   match self
        {   Error::Timeout(limit) => {
              write!(f,
                "Request timeout ({}s) reached",
                limit.as_secs_f64()
              )
            }
          , Error::Transport(msg) => {
              write!(f, "Request exception: {}", msg)
            }
          , Error::Http { message, .. } => {
              write!(f, "{}", message)
            }
          , Error::IncompleteAnswer => {
              write!(f, "Incomplete answer")
            }
          , Error::ServerEnvelopeDecode(_) => {
              write!(f,
                "JSON decode error on the ollama server's response"
              )
            }
          , Error::ModelOutputDecode(_) => {
              write!(f, "JSON decode error on the model's response")
            }
          , Error::StreamingNoValue => {
              write!(f, "Streaming mode does not retrieve a value")
            }
          , Error::TextRepair(msg) => {
              write!(f, "Text repair failed: {}", msg)
            }
          , Error::NotFound(what) => {
              write!(f, "Not found: {}", what)
            }
          , Error::InvalidConfiguration(msg) => {
              write!(f, "Invalid configuration: {}", msg)
            }
          , Error::Io(msg) => {
              write!(f, "I/O error: {}", msg)
            }
          , Error::Other(msg) => {
              write!(f, "{}", msg)
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<String> for Error
{   fn from(s: String) -> Self
    {   Error::Other(s)
    }
}

impl From<&str> for Error
{   fn from(s: &str) -> Self
    {   Error::Other(s.to_string())
    }
}

impl From<std::io::Error> for Error
{   fn from(e: std::io::Error) -> Self
    {   Error::Io(e.to_string())
    }
}

impl From<reqwest::Error> for Error
{   fn from(e: reqwest::Error) -> Self
    {   Error::Transport(e.to_string())
    }
}
