use newsloop::llm::remote::RemoteLlmClient;
use newsloop::llm::LlmClient;

#[tokio::test]
async fn analyze_parses_sentiment_and_impact_from_fenced_json() {
    let mut server = mockito::Server::new_async().await;

    let mock = server
        .mock("POST", "/")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{
                "choices": [{
                    "message": {
                        "role": "assistant",
                        "content": "```json\n{\"sentiment\": {\"label\": \"negative\", \"score\": -0.6}, \"impact\": {\"overall\": 0.7, \"urgency\": 0.4, \"factors\": [\"supply chain\"]}}\n```"
                    }
                }],
                "usage": {
                    "prompt_tokens": 120,
                    "completion_tokens": 40,
                    "prompt_tokens_details": {"cached_tokens": 20}
                }
            }"#,
        )
        .create_async()
        .await;

    let client = RemoteLlmClient::new(server.url(), "fake-api-key", "gpt-4.1-mini", 10, None);
    let result = client.analyze("irrelevant prompt").await.unwrap();

    assert_eq!(result.sentiment["label"], "negative");
    assert_eq!(result.impact["overall"], 0.7);
    assert_eq!(result.tokens_used.input, 120);
    assert_eq!(result.tokens_used.output, 40);
    assert_eq!(result.tokens_used.cached, 20);

    mock.assert_async().await;
}

#[tokio::test]
async fn analyze_surfaces_http_error_status() {
    let mut server = mockito::Server::new_async().await;

    let mock = server
        .mock("POST", "/")
        .with_status(429)
        .with_header("content-type", "application/json")
        .with_body(r#"{"error": {"message": "Rate limit exceeded"}}"#)
        .create_async()
        .await;

    let client = RemoteLlmClient::new(server.url(), "fake-api-key", "gpt-4.1-mini", 10, None);
    let err = client.analyze("prompt").await.unwrap_err();

    assert!(err.to_string().contains("429"));
    mock.assert_async().await;
}

#[tokio::test]
async fn analyze_times_out_on_slow_response() {
    let mut server = mockito::Server::new_async().await;

    let _mock = server
        .mock("POST", "/")
        .with_status(200)
        .with_chunked_body(|w| {
            std::thread::sleep(std::time::Duration::from_secs(3));
            w.write_all(b"too late")
        })
        .create_async()
        .await;

    let client = RemoteLlmClient::new(server.url(), "fake-api-key", "gpt-4.1-mini", 1, None);
    let err = client.analyze("prompt").await.unwrap_err();

    assert!(err.to_string().contains("timed out"));
}

#[tokio::test]
async fn analyze_errors_when_response_has_no_json() {
    let mut server = mockito::Server::new_async().await;

    let mock = server
        .mock("POST", "/")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{
                "choices": [{"message": {"role": "assistant", "content": "no json here"}}],
                "usage": {"prompt_tokens": 5, "completion_tokens": 3}
            }"#,
        )
        .create_async()
        .await;

    let client = RemoteLlmClient::new(server.url(), "fake-api-key", "gpt-4.1-mini", 10, None);
    let err = client.analyze("prompt").await.unwrap_err();

    assert!(err.to_string().contains("No valid JSON"));
    mock.assert_async().await;
}
