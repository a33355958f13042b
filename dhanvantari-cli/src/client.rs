use crate::error::ChatError;
use crate::stream::LineParser;
use dhanvantari_shared::{ChatRequest, ErrorBody};
use futures::StreamExt;
use reqwest::{Client, Response};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What the stream task reports back to the session owner.
#[derive(Debug)]
pub enum StreamEvent {
    Delta(String),
    Done,
    Failed(ChatError),
}

#[derive(Clone)]
pub struct ChatClient {
    http: Client,
    chat_url: String,
    api_key: String,
}

impl ChatClient {
    pub fn new(chat_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            chat_url: chat_url.into(),
            api_key: api_key.into(),
        }
    }

    /// Send the request on a background task and return the channel its
    /// events arrive on. The channel closes when the task ends; cancelling
    /// the token ends it early and drops the connection.
    pub fn start_chat(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> mpsc::UnboundedReceiver<StreamEvent> {
        let (tx, rx) = mpsc::unbounded_channel::<StreamEvent>();
        let client = self.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Chat request cancelled before the stream opened");
                }
                result = client.open_stream(&request) => {
                    match result {
                        Ok(response) => pump(response, &tx, &cancel).await,
                        Err(e) => {
                            if tx.send(StreamEvent::Failed(e)).is_err() {
                                error!("Failed to report chat error to receiver");
                            }
                        }
                    }
                }
            }
        });

        rx
    }

    /// Post the request and check the status before any body is read.
    pub async fn open_stream(&self, request: &ChatRequest) -> Result<Response, ChatError> {
        info!(
            "Sending {} messages to chat endpoint (language: {})",
            request.messages.len(),
            request.language
        );

        let response = self
            .http
            .post(&self.chat_url)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorBody>(&text)
                .ok()
                .and_then(|body| body.error)
                .unwrap_or(text);
            error!("Chat endpoint returned {}: {}", status, message);
            return Err(ChatError::from_status(status, message));
        }

        debug!("Chat stream opened");
        Ok(response)
    }
}

async fn pump(
    response: Response,
    events: &mpsc::UnboundedSender<StreamEvent>,
    cancel: &CancellationToken,
) {
    let mut body = std::pin::pin!(response.bytes_stream());
    let mut parser = LineParser::new();
    let mut received = false;

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Chat stream cancelled");
                return;
            }
            chunk = body.next() => chunk,
        };

        match chunk {
            Some(Ok(bytes)) => {
                for delta in parser.push_bytes(&bytes) {
                    received = true;
                    if events.send(StreamEvent::Delta(delta)).is_err() {
                        warn!("Receiver dropped, abandoning chat stream");
                        return;
                    }
                }
                if parser.is_done() {
                    break;
                }
            }
            Some(Err(e)) if !received => {
                if events.send(StreamEvent::Failed(ChatError::Body(e))).is_err() {
                    error!("Failed to report body error to receiver");
                }
                return;
            }
            Some(Err(e)) => {
                warn!("Chat stream dropped mid-answer: {}", e);
                break;
            }
            None => break,
        }
    }

    for delta in parser.finish() {
        if events.send(StreamEvent::Delta(delta)).is_err() {
            return;
        }
    }
    if events.send(StreamEvent::Done).is_err() {
        error!("Failed to send done event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::{Conversation, Notice};
    use dhanvantari_shared::{language_name, ApiMessage, MessageRole};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const CHAT_PATH: &str = "/functions/v1/dhanvantari-chat";

    const HELLO: &str = concat!(
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n",
        "data: [DONE]\n",
    );

    fn request(text: &str) -> ChatRequest {
        ChatRequest {
            messages: vec![ApiMessage {
                role: MessageRole::User,
                content: text.to_string(),
            }],
            language: language_name("hi").to_string(),
        }
    }

    async fn collect(mut rx: mpsc::UnboundedReceiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    fn client_for(server: &MockServer) -> ChatClient {
        ChatClient::new(format!("{}{}", server.uri(), CHAT_PATH), "test-key")
    }

    /// Serves one request with a 200 chunked event stream, writes `chunk`
    /// (if any) and then closes the socket before the terminating chunk.
    async fn cut_off_stream(chunk: Option<&'static str>) -> ChatClient {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();

            // Read the whole request so closing doesn't reset the connection
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    return;
                }
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(end) = text.find("\r\n\r\n") {
                    let length = text[..end]
                        .lines()
                        .find_map(|line| {
                            let (name, value) = line.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if request.len() >= end + 4 + length {
                        break;
                    }
                }
            }

            socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\n\
                      content-type: text/event-stream\r\n\
                      transfer-encoding: chunked\r\n\r\n",
                )
                .await
                .unwrap();
            if let Some(data) = chunk {
                let framed = format!("{:x}\r\n{}\r\n", data.len(), data);
                socket.write_all(framed.as_bytes()).await.unwrap();
            }
            socket.flush().await.unwrap();
        });

        ChatClient::new(format!("http://{}{}", addr, CHAT_PATH), "test-key")
    }

    async fn run_exchange(client: &ChatClient, conversation: &mut Conversation) -> Vec<Notice> {
        conversation.append_user_message("hi");
        let request = ChatRequest {
            messages: conversation.api_messages(),
            language: "English".into(),
        };
        let mut rx = client.start_chat(request, CancellationToken::new());
        let mut notices = Vec::new();
        while let Some(event) = rx.recv().await {
            notices.extend(conversation.apply(event));
        }
        notices
    }

    #[tokio::test]
    async fn streams_deltas_then_done() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(CHAT_PATH))
            .and(header("authorization", "Bearer test-key"))
            .and(header("content-type", "application/json"))
            .and(body_partial_json(serde_json::json!({
                "language": "Hindi",
                "messages": [{"role": "user", "content": "namaste"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_raw(HELLO, "text/event-stream"))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let events = collect(client.start_chat(request("namaste"), CancellationToken::new())).await;

        assert_eq!(events.len(), 3, "events: {:?}", events);
        assert!(matches!(&events[0], StreamEvent::Delta(d) if d == "Hel"));
        assert!(matches!(&events[1], StreamEvent::Delta(d) if d == "lo"));
        assert!(matches!(events[2], StreamEvent::Done));
    }

    #[tokio::test]
    async fn stream_without_sentinel_flushes_residual() {
        let server = MockServer::start().await;
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\
                    data: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}";
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let events = collect(client.start_chat(request("x"), CancellationToken::new())).await;

        let deltas: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Delta(d) => Some(d.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(deltas, vec!["a", "b"]);
        assert!(matches!(events.last(), Some(StreamEvent::Done)));
    }

    #[tokio::test]
    async fn rate_limit_short_circuits() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_json(serde_json::json!({
                "error": "Rate limit exceeded. Please try again in a moment."
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let events = collect(client.start_chat(request("x"), CancellationToken::new())).await;

        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            StreamEvent::Failed(ChatError::RateLimited(m)) if m.starts_with("Rate limit")
        ));
    }

    #[tokio::test]
    async fn payment_required_maps_to_credits_exhausted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(402).set_body_json(serde_json::json!({
                "error": "AI credits exhausted. Please add credits to continue."
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let events = collect(client.start_chat(request("x"), CancellationToken::new())).await;
        assert!(matches!(
            events.as_slice(),
            [StreamEvent::Failed(ChatError::CreditsExhausted(_))]
        ));
    }

    #[tokio::test]
    async fn non_json_error_body_is_kept_as_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("upstream unavailable"))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client.open_stream(&request("x")).await.unwrap_err();
        match err {
            ChatError::Http { status, message } => {
                assert_eq!(status.as_u16(), 503);
                assert_eq!(message, "upstream unavailable");
            }
            other => panic!("expected Http, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_network_error() {
        let client = ChatClient::new("http://127.0.0.1:1/chat", "key");
        let err = client.open_stream(&request("x")).await.unwrap_err();
        assert!(matches!(err, ChatError::Network(_)));
    }

    #[tokio::test]
    async fn cancellation_closes_the_channel_without_events() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(HELLO, "text/event-stream")
                    .set_delay(Duration::from_secs(30)),
            )
            .mount(&server)
            .await;

        let client = client_for(&server);
        let cancel = CancellationToken::new();
        let mut rx = client.start_chat(request("x"), cancel.clone());
        cancel.cancel();

        let next = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("stream task should stop after cancellation");
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn conversation_assembles_streamed_answer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(HELLO, "text/event-stream"))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let mut conversation = Conversation::default();
        conversation.append_user_message("hi");
        let request = ChatRequest {
            messages: conversation.api_messages(),
            language: "English".into(),
        };

        let mut rx = client.start_chat(request, CancellationToken::new());
        let mut notices = Vec::new();
        while let Some(event) = rx.recv().await {
            notices.extend(conversation.apply(event));
        }

        assert!(notices.is_empty());
        assert!(!conversation.is_busy());
        let last = conversation.messages().last().unwrap();
        assert_eq!(last.role, MessageRole::Assistant);
        assert_eq!(last.content, "Hello");
    }

    #[tokio::test]
    async fn conversation_rolls_back_on_rate_limit() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let mut conversation = Conversation::with_greeting();
        conversation.append_user_message("hi");
        let request = ChatRequest {
            messages: conversation.api_messages(),
            language: "English".into(),
        };

        let mut rx = client.start_chat(request, CancellationToken::new());
        let mut notices = Vec::new();
        while let Some(event) = rx.recv().await {
            notices.extend(conversation.apply(event));
        }

        assert_eq!(notices, vec![Notice::RateLimited]);
        assert!(!conversation.is_busy());
        assert_eq!(conversation.messages().len(), 1);
        assert!(conversation.messages().iter().all(|m| m.role == MessageRole::Assistant));
    }

    #[tokio::test]
    async fn body_lost_before_any_content_is_a_body_error() {
        let client = cut_off_stream(None).await;
        let events = collect(client.start_chat(request("hi"), CancellationToken::new())).await;

        assert_eq!(events.len(), 1, "events: {:?}", events);
        assert!(matches!(events[0], StreamEvent::Failed(ChatError::Body(_))));
    }

    #[tokio::test]
    async fn conversation_rolls_back_when_body_is_lost() {
        let client = cut_off_stream(None).await;
        let mut conversation = Conversation::default();

        let notices = run_exchange(&client, &mut conversation).await;

        assert_eq!(notices, vec![Notice::Failed]);
        assert!(!conversation.is_busy());
        assert!(conversation.messages().is_empty());
    }

    #[tokio::test]
    async fn connection_drop_after_content_ends_the_stream() {
        let client = cut_off_stream(Some("data: {\"choices\":[{\"delta\":{\"content\":\"part\"}}]}\n")).await;
        let events = collect(client.start_chat(request("hi"), CancellationToken::new())).await;

        assert_eq!(events.len(), 2, "events: {:?}", events);
        assert!(matches!(&events[0], StreamEvent::Delta(d) if d == "part"));
        assert!(matches!(events[1], StreamEvent::Done));
    }

    #[tokio::test]
    async fn conversation_keeps_partial_answer_after_drop() {
        let client = cut_off_stream(Some("data: {\"choices\":[{\"delta\":{\"content\":\"part\"}}]}\n")).await;
        let mut conversation = Conversation::default();

        let notices = run_exchange(&client, &mut conversation).await;

        assert!(notices.is_empty(), "notices: {:?}", notices);
        assert!(!conversation.is_busy());
        assert_eq!(conversation.messages().len(), 2);
        let last = conversation.messages().last().unwrap();
        assert_eq!(last.role, MessageRole::Assistant);
        assert_eq!(last.content, "part");
        assert!(!last.id.starts_with(crate::conversation::STREAMING_PREFIX));
    }
}
