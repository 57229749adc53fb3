use std::time::Duration;
use httpmock::prelude::*;
use serde_json::json;

use ollama_bench::benchmark::{
  parse_questions, BenchmarkRunner, BenchmarkSettings, CsvSink,
};
use ollama_bench::{
  ChatMessage, Error, Info, OllamaClient, OllamaConfig, OptionOverrides,
  PullOutcome,
};

fn client_for(server: &MockServer) -> OllamaClient
{   OllamaClient::new(OllamaConfig::new(server.base_url()))
      .expect("valid config")
}

fn chat_reply(content: &str) -> serde_json::Value
{   json!({
      "model": "llama3.1:8b",
      "created_at": "2025-01-01T00:00:00Z",
      "message": {"role": "assistant", "content": content},
      "done": true,
      "done_reason": "stop",
      "total_duration": 2_500_000_000u64,
      "load_duration": 500_000_000u64,
      "prompt_eval_count": 40,
      "prompt_eval_duration": 200_000_000u64,
      "eval_count": 80,
      "eval_duration": 1_600_000_000u64
    })
}

#[tokio::test]
async fn test_chat_text_round_trip()
{   let server = MockServer::start_async().await;
    let mock = server.mock(|when, then| {
      when.method(POST)
        .path("/api/chat")
        .json_body_partial(
          r#"{"model": "llama3.1:8b", "stream": false, "think": false,
              "keep_alive": "5m",
              "messages": [{"role": "user", "content": "Hi"}]}"#
        );
      then.status(200).json_body(chat_reply("Hallo!"));
    });

    let client = client_for(&server);
    let result = client
      .chat(vec![ChatMessage::user("Hi")], "llama3.1:8b", None, None)
      .await;

    mock.assert();
    assert_eq!(result.result().and_then(|v| v.as_text()), Some("Hallo!"));
    assert_eq!(result.elapsed_time_seconds(), 2.5);
    assert_eq!(result.read_time_seconds(), 0.2);
    assert_eq!(result.write_time_seconds(), 1.6);
    assert_eq!(result.input_token_count(), 40);
    assert_eq!(result.output_token_count(), 80);
    assert_eq!(result.info(), &Info::Empty);
}

#[tokio::test]
async fn test_completion_merges_options_over_defaults()
{   let server = MockServer::start_async().await;
    let mock = server.mock(|when, then| {
      when.method(POST)
        .path("/api/generate")
        .json_body_partial(
          r#"{"prompt": "Write a haiku",
              "options": {"temperature": 0.0, "seed": 42,
                          "num_ctx": 2048, "top_k": 40,
                          "repeat_last_n": 64, "num_predict": -1}}"#
        );
      then.status(200).json_body(json!({
        "model": "phi4:latest",
        "response": "Old pond, frog jumps in",
        "done": true
      }));
    });

    let overrides = OptionOverrides::default()
      .with_temperature(0.0)
      .with_seed(42);
    let client = client_for(&server);
    let result = client
      .completion("Write a haiku", "phi4:latest", None, Some(&overrides))
      .await;

    mock.assert();
    assert!(result.is_success());
    assert_eq!(result.elapsed_time_seconds(), 0.0);
}

#[tokio::test]
async fn test_structured_chat_unwraps_markdown()
{   let server = MockServer::start_async().await;
    let schema = json!({
      "type": "object",
      "properties": {"lines": {"type": "array", "items": {"type": "string"}}},
      "required": ["lines"]
    });
    let mock = server.mock(|when, then| {
      when.method(POST)
        .path("/api/chat")
        .json_body_partial(
          r#"{"format": {"type": "object", "required": ["lines"]}}"#
        );
      then.status(200).json_body(chat_reply(
        "<think>\nplan the haiku\n</think>\n```json\n{\"lines\": [\"a\", \"b\", \"c\"]}\n```"
      ));
    });

    let client = client_for(&server);
    let result = client
      .chat(
        vec![ChatMessage::user("Write a haiku")],
        "gemma3:12b",
        Some(schema),
        None
      )
      .await;

    mock.assert();
    let value = result.result()
      .and_then(|v| v.as_json())
      .expect("structured result");
    assert_eq!(value["lines"], json!(["a", "b", "c"]));
    assert_eq!(
      result.info(),
      &Info::Structured { thinking: true, markdown: true }
    );
    assert_eq!(result.output_token_count(), 80);
}

#[tokio::test]
async fn test_structured_request_with_prose_answer()
{   let server = MockServer::start_async().await;
    server.mock(|when, then| {
      when.method(POST).path("/api/generate");
      then.status(200).json_body(json!({
        "response": "not json",
        "done": true
      }));
    });

    let client = client_for(&server);
    let result = client
      .completion("q", "phi4:latest", Some(json!({"type": "object"})), None)
      .await;

    assert!(result.result().is_none());
    assert!(matches!(result.error(), Some(Error::ModelOutputDecode(_))));
    assert_eq!(
      serde_json::to_value(&result).unwrap()["info"]["error"],
      "JSON decode error on the model's response"
    );
}

#[tokio::test]
async fn test_server_error_message_is_surfaced()
{   let server = MockServer::start_async().await;
    server.mock(|when, then| {
      when.method(POST).path("/api/chat");
      then.status(500).json_body(json!({"error": "model not found"}));
    });

    let client = client_for(&server);
    let result = client
      .chat(vec![ChatMessage::user("Hi")], "nope", None, None)
      .await;

    assert!(result.result().is_none());
    assert_eq!(
      result.error().map(|e| e.to_string()),
      Some("model not found".to_string())
    );
    assert_eq!(result.output_token_count(), 0);
}

#[tokio::test]
async fn test_incomplete_answer_from_server()
{   let server = MockServer::start_async().await;
    server.mock(|when, then| {
      when.method(POST).path("/api/generate");
      then.status(200).json_body(json!({
        "response": "The line of scrim",
        "done": false
      }));
    });

    let client = client_for(&server);
    let result = client.completion("q", "phi4:latest", None, None).await;
    assert_eq!(result.error(), Some(&Error::IncompleteAnswer));
}

#[tokio::test]
async fn test_non_json_body_is_an_envelope_decode_error()
{   let server = MockServer::start_async().await;
    server.mock(|when, then| {
      when.method(POST).path("/api/generate");
      then.status(502).body("<html>Bad Gateway</html>");
    });

    let client = client_for(&server);
    let result = client.completion("q", "phi4:latest", None, None).await;
    assert!(matches!(result.error(), Some(Error::ServerEnvelopeDecode(_))));
}

#[tokio::test]
async fn test_timeout_becomes_failure_result()
{   let server = MockServer::start_async().await;
    server.mock(|when, then| {
      when.method(POST).path("/api/generate");
      then.status(200)
        .delay(Duration::from_secs(3))
        .json_body(json!({"response": "late", "done": true}));
    });

    let client = OllamaClient::new(
      OllamaConfig::new(server.base_url()).with_timeout_secs(1)
    ).unwrap();
    let result = client.completion("q", "phi4:latest", None, None).await;

    assert!(result.result().is_none());
    assert_eq!(
      result.error(),
      Some(&Error::Timeout(Duration::from_secs(1)))
    );
    assert_eq!(
      result.error().map(|e| e.to_string()),
      Some("Request timeout (1s) reached".to_string())
    );
}

#[tokio::test]
async fn test_connection_refused_becomes_failure_result()
{   let client = OllamaClient::new(
      OllamaConfig::new("http://127.0.0.1:1").with_timeout_secs(2)
    ).unwrap();
    let result = client.completion("q", "phi4:latest", None, None).await;

    assert!(result.result().is_none());
    assert!(matches!(result.error(), Some(Error::Transport(_))));
}

#[tokio::test]
async fn test_streaming_mode_returns_no_value()
{   let server = MockServer::start_async().await;
    let body = [
      r#"{"message": {"role": "assistant", "content": "Touch"}, "done": false}"#,
      "garbage",
      r#"{"message": {"role": "assistant", "content": "down"}, "done": false}"#,
      r#"{"message": {"role": "assistant", "content": ""}, "done": true}"#,
      r#"{"message": {"role": "assistant", "content": "ignored"}, "done": false}"#,
    ].join("\n");
    let mock = server.mock(|when, then| {
      when.method(POST)
        .path("/api/chat")
        .json_body_partial(r#"{"stream": true}"#);
      then.status(200)
        .header("content-type", "application/x-ndjson")
        .body(body);
    });

    let client = OllamaClient::new(
      OllamaConfig::new(server.base_url()).with_stream(true)
    ).unwrap();
    let result = client
      .chat(vec![ChatMessage::user("Hi")], "llama3.1:8b", None, None)
      .await;

    mock.assert();
    assert!(result.result().is_none());
    assert_eq!(result.error(), Some(&Error::StreamingNoValue));
}

#[tokio::test]
async fn test_models_lists_names()
{   let server = MockServer::start_async().await;
    server.mock(|when, then| {
      when.method(GET).path("/api/tags");
      then.status(200).json_body(json!({
        "models": [
          {"name": "llama3.1:8b", "model": "llama3.1:8b", "size": 4920753328u64,
           "digest": "46e0c10c039e", "modified_at": "2025-01-01T00:00:00Z"},
          {"name": "phi4:latest"}
        ]
      }));
    });

    let models = client_for(&server).models().await.unwrap();
    let names: Vec<&str> = models.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(names, vec!["llama3.1:8b", "phi4:latest"]);
    assert_eq!(models[0].size, 4920753328);
}

#[tokio::test]
async fn test_models_distinguishes_failures()
{   let server = MockServer::start_async().await;
    server.mock(|when, then| {
      when.method(GET).path("/api/tags");
      then.status(200).body("not valid json");
    });
    let result = client_for(&server).models().await;
    assert!(matches!(result, Err(Error::ServerEnvelopeDecode(_))));

    let failing = MockServer::start_async().await;
    failing.mock(|when, then| {
      when.method(GET).path("/api/tags");
      then.status(500).json_body(json!({"error": "overloaded"}));
    });
    let result = client_for(&failing).models().await;
    assert_eq!(
      result,
      Err(Error::Http { status: 500, message: "overloaded".into() })
    );
}

#[tokio::test]
async fn test_pull_model_until_success()
{   let server = MockServer::start_async().await;
    let body = [
      r#"{"status": "pulling manifest"}"#,
      r#"{"status": "pulling 6a0746a1ec1a", "total": 100, "completed": 50}"#,
      r#"{"status": "verifying sha256 digest"}"#,
      r#"{"status": "success"}"#,
    ].join("\n");
    let mock = server.mock(|when, then| {
      when.method(POST)
        .path("/api/pull")
        .json_body(json!({"model": "llama3.1:8b"}));
      then.status(200).body(body);
    });

    let outcome = client_for(&server)
      .pull_model("llama3.1", "8b")
      .await
      .unwrap();
    mock.assert();
    assert_eq!(outcome, PullOutcome::Completed);
}

#[tokio::test]
async fn test_pull_model_outcomes()
{   let ended = MockServer::start_async().await;
    ended.mock(|when, then| {
      when.method(POST).path("/api/pull");
      then.status(200).body("{\"status\": \"pulling manifest\"}\n");
    });
    assert_eq!(
      client_for(&ended).pull_model("phi4", "latest").await,
      Ok(PullOutcome::StreamEnded)
    );

    let missing = MockServer::start_async().await;
    missing.mock(|when, then| {
      when.method(POST).path("/api/pull");
      then.status(404).json_body(json!({"error": "not found"}));
    });
    assert_eq!(
      client_for(&missing).pull_model("nope", "1b").await,
      Err(Error::NotFound("nope:1b".into()))
    );

    let broken = MockServer::start_async().await;
    broken.mock(|when, then| {
      when.method(POST).path("/api/pull");
      then.status(200)
        .body("{\"error\": \"pull model manifest: file does not exist\"}\n");
    });
    assert!(matches!(
      client_for(&broken).pull_model("nope", "1b").await,
      Err(Error::Other(_))
    ));
}

#[tokio::test]
async fn test_pull_model_times_out_waiting_for_response()
{   let server = MockServer::start_async().await;
    server.mock(|when, then| {
      when.method(POST).path("/api/pull");
      then.status(200)
        .delay(Duration::from_secs(3))
        .body("{\"status\": \"success\"}\n");
    });

    let client = OllamaClient::new(
      OllamaConfig::new(server.base_url()).with_timeout_secs(1)
    ).unwrap();
    assert_eq!(
      client.pull_model("llama3.1", "8b").await,
      Err(Error::Timeout(Duration::from_secs(1)))
    );
}

#[tokio::test]
async fn test_pull_model_times_out_on_stalled_progress()
{   use tokio::io::{AsyncReadExt, AsyncWriteExt};

    // one progress chunk, then the connection stays open and silent
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
      .await
      .unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      let (mut socket, _) = listener.accept().await.unwrap();
      let mut request = [0u8; 4096];
      let _ = socket.read(&mut request).await;

      let line = "{\"status\": \"pulling manifest\"}\n";
      let head = "HTTP/1.1 200 OK\r\n\
        Content-Type: application/x-ndjson\r\n\
        Transfer-Encoding: chunked\r\n\r\n";
      let chunk = format!("{:x}\r\n{}\r\n", line.len(), line);
      socket.write_all(head.as_bytes()).await.unwrap();
      socket.write_all(chunk.as_bytes()).await.unwrap();
      socket.flush().await.unwrap();
      tokio::time::sleep(Duration::from_secs(30)).await;
    });

    let client = OllamaClient::new(
      OllamaConfig::new(format!("http://{}", addr)).with_timeout_secs(1)
    ).unwrap();
    let outcome = tokio::time::timeout(
      Duration::from_secs(10),
      client.pull_model("llama3.1", "8b")
    ).await
      .expect("pull returns once progress stalls");

    assert_eq!(outcome, Err(Error::Timeout(Duration::from_secs(1))));
}

#[tokio::test]
async fn test_benchmark_run_writes_rows()
{   let server = MockServer::start_async().await;
    let mock = server.mock(|when, then| {
      when.method(POST).path("/api/chat");
      then.status(200).json_body(chat_reply("Zwei Punkte; der Ball ist tot."));
    });

    let questions = parse_questions(
      r#"[
        {"id": 1, "category": "Scoring", "question": "Was ist ein Safety?",
         "context_text": "Ein Safety zählt zwei Punkte.",
         "ground_truth": "2 Punkte"},
        {"id": 2, "category": "Timing", "question": "Wie lang ist ein Viertel?"}
      ]"#
    ).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("results.csv");
    let mut sink = CsvSink::open(&path).unwrap();

    let client = client_for(&server);
    let settings = BenchmarkSettings
    {   models: vec!["llama3.1:8b".to_string()]
      , delay: Duration::ZERO
      , ..BenchmarkSettings::default()
    };
    let summary = BenchmarkRunner::new(&client, settings)
      .run(&questions, &mut sink)
      .await
      .unwrap();

    // warm-up plus one call per question
    mock.assert_hits(3);
    assert_eq!(summary.rows_written, 2);
    assert_eq!(summary.failed, 0);
    assert!(summary.skipped_models.is_empty());

    let contents = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with("id;category;model;time_total"));
    assert!(lines[1].starts_with("1;Scoring;llama3.1:8b;2.500;0.200;1.600;40;80;200.00;50.00;"));
    assert!(lines[1].contains("\"Zwei Punkte; der Ball ist tot.\""));
    assert!(lines[2].ends_with(";EMPTY"));
}

#[tokio::test]
async fn test_benchmark_skips_model_that_fails_warm_up()
{   let server = MockServer::start_async().await;
    server.mock(|when, then| {
      when.method(POST).path("/api/chat");
      then.status(404).json_body(json!({"error": "model 'ghost' not found"}));
    });

    let questions = parse_questions(r#"[{"id": 1, "question": "Q"}]"#)
      .unwrap();
    let dir = tempfile::tempdir().unwrap();
    let mut sink = CsvSink::open(&dir.path().join("out.csv")).unwrap();

    let client = client_for(&server);
    let settings = BenchmarkSettings
    {   models: vec!["ghost".to_string()]
      , delay: Duration::ZERO
      , ..BenchmarkSettings::default()
    };
    let summary = BenchmarkRunner::new(&client, settings)
      .run(&questions, &mut sink)
      .await
      .unwrap();

    assert_eq!(summary.rows_written, 0);
    assert_eq!(summary.skipped_models, vec!["ghost".to_string()]);
}
