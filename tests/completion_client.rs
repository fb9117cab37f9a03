use agent_workflow::config::Config;
use agent_workflow::llm::{
    ChatMessage, CompletionClient, HttpCompletionClient, LlmError, collect_stream,
};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config(base_url: &str) -> Config {
    let base_url = base_url.to_string();
    Config::from_lookup(move |key| match key {
        "LLM_API_KEY" => Some("sk-test".to_string()),
        "LLM_BASE_URL" => Some(base_url.clone()),
        "LLM_MODEL" => Some("test-model".to_string()),
        "LLM_TIMEOUT_SECS" => Some("5".to_string()),
        _ => None,
    })
    .unwrap()
}

fn reply(text: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "choices": [{ "message": { "role": "assistant", "content": text } }]
    }))
}

#[tokio::test]
async fn complete_sends_model_and_auth() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_partial_json(json!({ "model": "test-model", "stream": false })))
        .respond_with(reply("pong"))
        .expect(1)
        .mount(&server)
        .await;

    let client = HttpCompletionClient::new(config(&server.uri())).unwrap();
    let text = client.complete(&[ChatMessage::user("ping")]).await.unwrap();
    assert_eq!(text, "pong");
}

#[tokio::test]
async fn busy_server_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(reply("recovered"))
        .expect(1)
        .mount(&server)
        .await;

    let client = HttpCompletionClient::new(config(&server.uri())).unwrap();
    let text = client.complete(&[ChatMessage::user("ping")]).await.unwrap();
    assert_eq!(text, "recovered");
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
        .expect(1)
        .mount(&server)
        .await;

    let client = HttpCompletionClient::new(config(&server.uri())).unwrap();
    let err = client.complete(&[ChatMessage::user("ping")]).await.unwrap_err();
    match err {
        LlmError::ApiError { status, message } => {
            assert_eq!(status, 401);
            assert_eq!(message, "bad key");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn streamed_reply_is_reassembled() {
    let server = MockServer::start().await;
    let body = concat!(
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
        ": keep-alive\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
        "data: [DONE]\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({ "stream": true })))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let client = HttpCompletionClient::new(config(&server.uri())).unwrap();
    let stream = client.stream(&[ChatMessage::user("hi")]).await.unwrap();
    assert_eq!(collect_stream(stream).await.unwrap(), "Hello");
}
