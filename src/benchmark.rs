//! Benchmark driver: runs a question set against several models and
//! appends one semicolon-delimited CSV row per answered question.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::client::OllamaClient;
use crate::config::OptionOverrides;
use crate::error::Error;
use crate::request::ChatMessage;
use crate::response::{NormalizedResult, ResultValue};

pub const DELIMITER: &str = ";";
pub const DEFAULT_DELAY_MS: u64 = 200;
const SNIPPET_CHARS: usize = 50;

pub const HEADER: [&str; 14] = [
  "id", "category", "model",
  "time_total", "time_read", "time_write",
  "input_tokens", "output_tokens",
  "tps_read", "tps_write",
  "question", "model_answer", "ground_truth", "context_snippet",
];

// ===== Question Set =====

/// Question identifiers are numeric in most sets, but not all
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QuestionId
{   Number(i64)
  , Text(String)
}

impl fmt::Display for QuestionId
{   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {   match self
        {   QuestionId::Number(n) => write!(f, "{}", n)
          , QuestionId::Text(s) => write!(f, "{}", s)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question
{   pub id: QuestionId
  , #[serde(default)]
    pub category: String
  , pub question: String
  , #[serde(default)]
    pub context_text: String
  , #[serde(default)]
    pub ground_truth: String
}

pub fn parse_questions(json: &str) -> Result<Vec<Question>, Error>
{   serde_json::from_str(json)
      .map_err(|e| Error::Other(format!("invalid question set: {}", e)))
}

pub fn load_questions(path: &Path) -> Result<Vec<Question>, Error>
{   debug!("Loading questions from {}", path.display());
    let contents = std::fs::read_to_string(path)
      .map_err(|e| Error::Io(format!("{}: {}", path.display(), e)))?;
    parse_questions(&contents)
}

/// System prompt restricting the model to the supplied rule context.
/// Answers are expected in German with English football terms.
pub fn build_system_prompt(context_text: &str) -> String
{   format!(
      "Du bist ein strikter Regel-Analyst für die National Football \
       League (NFL). Deine Aufgabe ist es, Fragen ausschließlich basierend \
       auf dem untenstehenden Kontext zu beantworten.\n\n\
       Befolge strikt diese Anweisungen:\n\
       1. **Wissensbegrenzung:** Nutze NUR Informationen aus dem Abschnitt \
       'KONTEXT'. Greife NICHT auf dein internes Trainingswissen zurück.\n\
       2. **Rejection:** Wenn die Antwort auf die Frage nicht eindeutig im \
       Kontext steht, antworte exakt mit: 'Dazu habe ich keine \
       Informationen.' (Erfinde nichts!).\n\
       3. **Sprache:** Antworte in deutscher Sprache. Behalte englische \
       Fachbegriffe (z.B. 'Touchdown', 'Fumble', 'Line of Scrimmage') bei, \
       da diese im deutschen American Football Standard sind.\n\
       4. **Präzision:** Antworte direkt und faktenbasiert. Vermeide \
       Einleitungen wie 'Laut dem Text...'.\n\n\
       KONTEXT:\n{}",
      context_text
    )
}

/// Messages sent for one question
pub fn question_messages(question: &Question) -> Vec<ChatMessage>
{   vec![
      ChatMessage::system(build_system_prompt(&question.context_text))
    , ChatMessage::user(question.question.clone())
    ]
}

// ===== CSV Rows =====

/// One answered question, formatted for the results file
#[derive(Debug, Clone, PartialEq)]
pub struct BenchmarkRow
{   pub id: String
  , pub category: String
  , pub model: String
  , pub time_total: f64
  , pub time_read: f64
  , pub time_write: f64
  , pub input_tokens: u64
  , pub output_tokens: u64
  , pub tps_read: f64
  , pub tps_write: f64
  , pub question: String
  , pub model_answer: String
  , pub ground_truth: String
  , pub context_snippet: String
}

/// First characters of the context, or `EMPTY`
pub fn context_snippet(context: &str) -> String
{   if context.is_empty()
    {   return "EMPTY".to_string();
    }
    let head: String = context.chars().take(SNIPPET_CHARS).collect();
    format!("{}...", head)
}

fn answer_text(value: &ResultValue) -> String
{   match value
    {   ResultValue::Text(s) => s.clone()
      , ResultValue::Json(map) => serde_json::Value::Object(map.clone())
          .to_string()
    }
}

impl BenchmarkRow
{   /// Row for a successful result, `None` when the result failed
    pub fn from_result(
      question: &Question
    , model: &str
    , result: &NormalizedResult
    ) -> Option<Self>
    {   let answer = result.result().map(answer_text)?;
        Some(BenchmarkRow
        {   id: question.id.to_string()
          , category: question.category.clone()
          , model: model.to_string()
          , time_total: result.elapsed_time_seconds()
          , time_read: result.read_time_seconds()
          , time_write: result.write_time_seconds()
          , input_tokens: result.input_token_count()
          , output_tokens: result.output_token_count()
          , tps_read: result.read_tokens_per_second()
          , tps_write: result.write_tokens_per_second()
          , question: question.question.clone()
          , model_answer: answer
          , ground_truth: question.ground_truth.clone()
          , context_snippet: context_snippet(&question.context_text)
        })
    }

    /// Field values in header order, with display rounding
    pub fn fields(&self) -> [String; 14]
    {   [ self.id.clone()
        , self.category.clone()
        , self.model.clone()
        , format!("{:.3}", self.time_total)
        , format!("{:.3}", self.time_read)
        , format!("{:.3}", self.time_write)
        , self.input_tokens.to_string()
        , self.output_tokens.to_string()
        , format!("{:.2}", self.tps_read)
        , format!("{:.2}", self.tps_write)
        , self.question.clone()
        , self.model_answer.clone()
        , self.ground_truth.clone()
        , self.context_snippet.clone()
        ]
    }
}

/// Quote a field only when it needs it, doubling inner quotes
pub fn escape_field(field: &str) -> String
{   let needs_quotes = field.contains(DELIMITER)
      || field.contains('"')
      || field.contains('\n')
      || field.contains('\r');
    if needs_quotes
    {   format!("\"{}\"", field.replace('"', "\"\""))
    } else
    {   field.to_string()
    }
}

pub fn format_record<I, S>(fields: I) -> String
where
  I: IntoIterator<Item = S>
, S: AsRef<str>
{   let mut line = fields.into_iter()
      .map(|f| escape_field(f.as_ref()))
      .collect::<Vec<_>>()
      .join(DELIMITER);
    line.push('\n');
    line
}

/// Append-only results file. Rows are flushed one by one so an
/// aborted run keeps everything written so far.
pub struct CsvSink
{   file: File
  , path: PathBuf
}

impl CsvSink
{   /// Open `path` for appending, writing the header to new files
    pub fn open(path: &Path) -> Result<Self, Error>
    {   let is_new = std::fs::metadata(path)
          .map(|m| m.len() == 0)
          .unwrap_or(true);

        let mut file = OpenOptions::new()
          .create(true)
          .append(true)
          .open(path)
          .map_err(|e| Error::Io(format!("{}: {}", path.display(), e)))?;

        if is_new
        {   file.write_all(format_record(HEADER).as_bytes())?;
            file.flush()?;
        }

        Ok(CsvSink
        {   file
          , path: path.to_path_buf()
        })
    }

    pub fn path(&self) -> &Path
    {   &self.path
    }

    pub fn write_row(&mut self, row: &BenchmarkRow) -> Result<(), Error>
    {   self.file.write_all(format_record(row.fields()).as_bytes())?;
        self.file.flush()?;
        Ok(())
    }
}

// ===== Runner =====

#[derive(Debug, Clone)]
pub struct BenchmarkSettings
{   pub models: Vec<String>
  , pub options: OptionOverrides
  , /// Pause after every request to spare the server
    pub delay: Duration
}

impl Default for BenchmarkSettings
{   fn default() -> Self
    {   BenchmarkSettings
        {   models: vec![]
          , options: OptionOverrides::default()
              .with_temperature(0.0)
              .with_num_ctx(8192)
              .with_seed(42)
          , delay: Duration::from_millis(DEFAULT_DELAY_MS)
        }
    }
}

/// Counts of one benchmark run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary
{   pub rows_written: usize
  , pub failed: usize
  , pub skipped_models: Vec<String>
}

pub struct BenchmarkRunner<'a>
{   client: &'a OllamaClient
  , settings: BenchmarkSettings
}

impl<'a> BenchmarkRunner<'a>
{   pub fn new(client: &'a OllamaClient, settings: BenchmarkSettings) -> Self
    {   BenchmarkRunner
        {   client
          , settings
        }
    }

    /// Load the model into memory with a trivial chat.
    async fn warm_up(&self, model: &str) -> Result<(), Error>
    {   info!("Loading model {}", model);
        let result = self.client
          .chat(vec![ChatMessage::user("Hi")], model, None, None)
          .await;
        match result.error()
        {   Some(e) => Err(e.clone())
          , None => Ok(())
        }
    }

    /// Ask every question to every model, appending rows to `sink`.
    /// Failed answers are logged and skipped; only file errors abort.
    pub async fn run(
      &self
    , questions: &[Question]
    , sink: &mut CsvSink
    ) -> Result<RunSummary, Error>
    {   let mut summary = RunSummary::default();
        info!(
          "Starting benchmark: {} questions, models {:?}, output {}",
          questions.len(),
          self.settings.models,
          sink.path().display()
        );

        for model in &self.settings.models
        {   if let Err(e) = self.warm_up(model).await
            {   error!("Could not load model {}: {}", model, e);
                summary.skipped_models.push(model.clone());
                continue;
            }

            for (i, question) in questions.iter().enumerate()
            {   info!(
                  "Question {}/{} (id {}) to {}",
                  i + 1,
                  questions.len(),
                  question.id,
                  model
                );

                let result = self.client
                  .chat(
                    question_messages(question),
                    model,
                    None,
                    Some(&self.settings.options)
                  )
                  .await;

                match BenchmarkRow::from_result(question, model, &result)
                {   Some(row) => {
                      sink.write_row(&row)?;
                      summary.rows_written += 1;
                    }
                  , None => {
                      let reason = result.error()
                        .map(|e| e.to_string())
                        .unwrap_or_default();
                      warn!("No answer for id {}: {}", question.id, reason);
                      summary.failed += 1;
                    }
                }

                if !self.settings.delay.is_zero()
                {   tokio::time::sleep(self.settings.delay).await;
                }
            }
            info!("Finished run for {}", model);
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests
{   use super::*;
    use crate::response::RawServerEnvelope;

    fn question(context: &str) -> Question
    {   Question
        {   id: QuestionId::Number(7)
          , category: "Penalties".into()
          , question: "Was ist ein Safety?".into()
          , context_text: context.into()
          , ground_truth: "2 Punkte".into()
        }
    }

    #[test]
    fn test_parse_questions_mixed_ids()
    {   let qs = parse_questions(
          r#"[
            {"id": 1, "category": "Scoring", "question": "Q1",
             "context_text": "ctx", "ground_truth": "A1"},
            {"id": "B-2", "question": "Q2"}
          ]"#
        ).unwrap();
        assert_eq!(qs.len(), 2);
        assert_eq!(qs[0].id.to_string(), "1");
        assert_eq!(qs[1].id, QuestionId::Text("B-2".into()));
        assert_eq!(qs[1].context_text, "");
    }

    #[test]
    fn test_context_snippet()
    {   assert_eq!(context_snippet(""), "EMPTY");
        assert_eq!(context_snippet("kurz"), "kurz...");
        let long = "ä".repeat(80);
        assert_eq!(context_snippet(&long).chars().count(), 53);
    }

    #[test]
    fn test_escape_field()
    {   assert_eq!(escape_field("plain"), "plain");
        assert_eq!(escape_field("a;b"), "\"a;b\"");
        assert_eq!(escape_field("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(escape_field("two\nlines"), "\"two\nlines\"");
    }

    #[test]
    fn test_row_from_result_rounds_for_display()
    {   let envelope = RawServerEnvelope
        {   response: Some("Zwei Punkte; Ball tot.".into())
          , total_duration: Some(1_234_567_890)
          , prompt_eval_duration: Some(500_000_000)
          , eval_duration: Some(3_000_000_000)
          , prompt_eval_count: Some(100)
          , eval_count: Some(10)
          , ..RawServerEnvelope::default()
        };
        let result = NormalizedResult::text(
          "Zwei Punkte; Ball tot.".into(),
          &envelope
        );
        let row = BenchmarkRow::from_result(
          &question("Ein Safety ist..."),
          "llama3.1:8b",
          &result
        ).unwrap();
        let fields = row.fields();

        assert_eq!(fields[0], "7");
        assert_eq!(fields[3], "1.235");
        assert_eq!(fields[4], "0.500");
        assert_eq!(fields[8], "200.00");
        assert_eq!(fields[9], "3.33");
        assert_eq!(fields[13], "Ein Safety ist......");

        let line = format_record(fields);
        assert!(line.contains("\"Zwei Punkte; Ball tot.\""));
        assert!(line.ends_with('\n'));
    }

    #[test]
    fn test_failed_result_yields_no_row()
    {   let result = NormalizedResult::failure(Error::IncompleteAnswer);
        assert!(
          BenchmarkRow::from_result(&question(""), "m", &result).is_none()
        );
    }

    #[test]
    fn test_sink_writes_header_once()
    {   let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.csv");

        let row = BenchmarkRow
        {   id: "1".into()
          , category: "c".into()
          , model: "m".into()
          , time_total: 1.0
          , time_read: 0.0
          , time_write: 0.0
          , input_tokens: 0
          , output_tokens: 0
          , tps_read: 0.0
          , tps_write: 0.0
          , question: "q".into()
          , model_answer: "a".into()
          , ground_truth: "g".into()
          , context_snippet: "EMPTY".into()
        };

        {   let mut sink = CsvSink::open(&path).unwrap();
            sink.write_row(&row).unwrap();
        }
        {   let mut sink = CsvSink::open(&path).unwrap();
            sink.write_row(&row).unwrap();
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], HEADER.join(DELIMITER));
        assert_eq!(lines[1], "1;c;m;1.000;0.000;0.000;0;0;0.00;0.00;q;a;g;EMPTY");
    }

    #[test]
    fn test_system_prompt_embeds_context()
    {   let prompt = build_system_prompt("Regel 11");
        assert!(prompt.ends_with("KONTEXT:\nRegel 11"));
        let messages = question_messages(&question("Regel 11"));
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, "Was ist ein Safety?");
    }
}
