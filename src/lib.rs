pub mod error;
pub mod config;
pub mod request;
pub mod response;
pub mod repair;
pub mod normalize;
pub mod client;
pub mod benchmark;

/*

ollama-bench sits between an Ollama server and benchmark code.
Whatever the server sends back (timeouts, HTTP errors, half-finished
answers, reasoning blocks, markdown-wrapped JSON), callers get the
same NormalizedResult: a value or an error, plus timings and tokens.

ollama-bench/
├── src/
│   ├── lib.rs          # Re-exports
│   ├── error.rs        # Error taxonomy
│   ├── config.rs       # Server config and generation options
│   ├── request.rs      # Completion / chat request envelopes
│   ├── response.rs     # Server envelope and NormalizedResult
│   ├── repair.rs       # Mojibake repair
│   ├── normalize.rs    # Envelope validation, JSON extraction
│   ├── client.rs       # HTTP transport, models, pull
│   ├── benchmark.rs    # Question set runner and CSV rows
│   └── main.rs         # CLI
└── tests/              # Mock-server integration tests

*/

pub use client::{ModelTag, OllamaClient, PullOutcome};
pub use config::{GenerationOptions, OllamaConfig, OptionOverrides};
pub use error::Error;
pub use request::{ChatMessage, Conversation, RequestEnvelope, Role};
pub use response::{Info, NormalizedResult, RawServerEnvelope, ResultValue};
