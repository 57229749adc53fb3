//! Request envelopes for the generate and chat endpoints

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Role of one chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role
{   System
  , User
  , Assistant
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage
{   pub role: Role
  , pub content: String
}

impl ChatMessage
{   pub fn system(content: impl Into<String>) -> Self
    {   ChatMessage
        {   role: Role::System
          , content: content.into()
        }
    }

    pub fn user(content: impl Into<String>) -> Self
    {   ChatMessage
        {   role: Role::User
          , content: content.into()
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self
    {   ChatMessage
        {   role: Role::Assistant
          , content: content.into()
        }
    }
}

/// What is being asked: a single prompt or an ordered conversation
#[derive(Debug, Clone, PartialEq)]
pub enum Conversation
{   Completion(String)
  , Chat(Vec<ChatMessage>)
}

/// One request to the server, before transport flags are added
#[derive(Debug, Clone, PartialEq)]
pub struct RequestEnvelope
{   pub model: String
  , pub conversation: Conversation
  , /// JSON schema for structured output; selects JSON extraction
    pub schema: Option<Value>
  , pub options: crate::config::GenerationOptions
}

/// Flags every request carries regardless of the caller
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransportFlags
{   pub think: bool
  , pub stream: bool
  , pub keep_alive: String
}

impl TransportFlags
{   pub fn from_config(config: &crate::config::OllamaConfig) -> Self
    {   TransportFlags
        {   think: config.think
          , stream: config.stream
          , keep_alive: config.keep_alive.clone()
        }
    }
}

impl RequestEnvelope
{   pub fn completion(
      model: impl Into<String>
    , prompt: impl Into<String>
    , options: crate::config::GenerationOptions
    ) -> Self
    {   RequestEnvelope
        {   model: model.into()
          , conversation: Conversation::Completion(prompt.into())
          , schema: None
          , options
        }
    }

    pub fn chat(
      model: impl Into<String>
    , messages: Vec<ChatMessage>
    , options: crate::config::GenerationOptions
    ) -> Self
    {   RequestEnvelope
        {   model: model.into()
          , conversation: Conversation::Chat(messages)
          , schema: None
          , options
        }
    }

    pub fn with_schema(mut self, schema: Value) -> Self
    {   self.schema = Some(schema);
        self
    }

    pub fn is_structured(&self) -> bool
    {   self.schema.is_some()
    }

    /// Endpoint path for this request shape
    pub fn path(&self) -> &'static str
    {   match self.conversation
        {   Conversation::Completion(_) => "/api/generate"
          , Conversation::Chat(_) => "/api/chat"
        }
    }

    /// JSON body sent to the server, transport flags included
    pub fn to_payload(&self, flags: &TransportFlags) -> Value
    {   let mut payload = json!({
          "model": self.model,
          "options": self.options,
          "think": flags.think,
          "stream": flags.stream,
          "keep_alive": flags.keep_alive,
        });

        match &self.conversation
        {   Conversation::Completion(prompt) => {
              payload["prompt"] = json!(prompt);
            }
          , Conversation::Chat(messages) => {
              payload["messages"] = json!(messages);
            }
        }

        if let Some(schema) = &self.schema
        {   payload["format"] = schema.clone();
        }

        payload
    }
}
