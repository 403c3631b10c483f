//! Streamable HTTP transport against a wiremock server.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use lattice_mcp_client::transport::StreamableHttpTransport;
use lattice_mcp_client::{
    AuthResult, McpError, OAuthClientProvider, OAuthTokens, Transport, TransportEvent,
};
use lattice_mcp_types::{JsonRpcMessage, JsonRpcRequest, RequestId};
use parking_lot::RwLock;
use serde_json::json;
use tokio::sync::mpsc;
use url::Url;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn transport_for(server: &MockServer) -> StreamableHttpTransport {
    let url = Url::parse(&format!("{}/mcp", server.uri())).expect("url");
    StreamableHttpTransport::new(reqwest::Client::new(), url)
}

fn ping(id: i64) -> JsonRpcMessage {
    JsonRpcRequest::new(id, "ping").into()
}

async fn next_message(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> JsonRpcMessage {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event within timeout")
            .expect("channel open");
        match event {
            TransportEvent::Message(message) => return message,
            TransportEvent::Error(e) => panic!("unexpected transport error: {e}"),
            TransportEvent::Closed => panic!("transport closed"),
        }
    }
}

fn response_id(message: &JsonRpcMessage) -> Option<RequestId> {
    match message {
        JsonRpcMessage::Response(response) => Some(response.id.clone()),
        _ => None,
    }
}

async fn mount_get_not_allowed(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/mcp"))
        .respond_with(ResponseTemplate::new(405))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_get_405_then_json_post_is_dispatched() {
    let server = MockServer::start().await;
    mount_get_not_allowed(&server).await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(header("accept", "application/json, text/event-stream"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": {}})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let transport = transport_for(&server);
    let (tx, mut rx) = mpsc::unbounded_channel();
    transport.start(tx).await.expect("405 on GET is not an error");

    transport.send(vec![ping(1)]).await.expect("send");
    let message = next_message(&mut rx).await;
    assert_eq!(response_id(&message), Some(RequestId::Number(1)));
}

#[tokio::test]
async fn test_session_id_is_captured_and_replayed() {
    let server = MockServer::start().await;
    mount_get_not_allowed(&server).await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(header("mcp-session-id", "session-42"))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .respond_with(ResponseTemplate::new(202).insert_header("mcp-session-id", "session-42"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/mcp"))
        .and(header("mcp-session-id", "session-42"))
        .respond_with(ResponseTemplate::new(405))
        .expect(1)
        .mount(&server)
        .await;

    let transport = transport_for(&server);
    let (tx, mut rx) = mpsc::unbounded_channel();
    transport.start(tx).await.expect("start");
    assert_eq!(transport.session_id(), None);

    transport.send(vec![ping(1)]).await.expect("first send");
    assert_eq!(transport.session_id().as_deref(), Some("session-42"));
    transport.send(vec![ping(2)]).await.expect("second send");

    transport.close().await.expect("405 on DELETE is tolerated");
    assert_eq!(transport.session_id(), None);
    assert!(matches!(rx.recv().await, Some(TransportEvent::Closed)));
}

#[tokio::test]
async fn test_sse_post_response_is_dispatched_and_checkpointed() {
    let server = MockServer::start().await;
    mount_get_not_allowed(&server).await;
    let body = "id: evt-7\nevent: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":3,\"result\":{\"ok\":true}}\n\n";
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let transport = transport_for(&server);
    let (tx, mut rx) = mpsc::unbounded_channel();
    transport.start(tx).await.expect("start");
    transport.send(vec![ping(3)]).await.expect("send");

    let message = next_message(&mut rx).await;
    assert_eq!(response_id(&message), Some(RequestId::Number(3)));
    assert_eq!(transport.last_event_id().as_deref(), Some("evt-7"));
}

#[tokio::test]
async fn test_get_stream_delivers_server_messages() {
    let server = MockServer::start().await;
    let body = "id: 1\ndata: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/tools/list_changed\"}\n\n";
    Mock::given(method("GET"))
        .and(path("/mcp"))
        .and(header("accept", "text/event-stream"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let transport = transport_for(&server);
    let (tx, mut rx) = mpsc::unbounded_channel();
    transport.start(tx).await.expect("start");

    let message = next_message(&mut rx).await;
    assert_eq!(message.method(), Some("notifications/tools/list_changed"));
}

#[tokio::test]
async fn test_get_resumes_from_last_event_id() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/mcp"))
        .and(header("last-event-id", "41"))
        .respond_with(ResponseTemplate::new(405))
        .expect(1)
        .mount(&server)
        .await;

    let transport = transport_for(&server).with_last_event_id("41");
    let (tx, _rx) = mpsc::unbounded_channel();
    transport.start(tx).await.expect("start");
}

#[tokio::test]
async fn test_get_failure_is_fatal_and_reported() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/mcp"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let transport = transport_for(&server);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let err = transport.start(tx).await.unwrap_err();
    assert!(matches!(err, McpError::Http { status: 500, .. }));
    assert!(matches!(
        rx.recv().await,
        Some(TransportEvent::Error(McpError::Http { status: 500, .. }))
    ));
}

#[tokio::test]
async fn test_unexpected_content_type_is_an_error() {
    let server = MockServer::start().await;
    mount_get_not_allowed(&server).await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("<html></html>", "text/html"))
        .mount(&server)
        .await;

    let transport = transport_for(&server);
    let (tx, _rx) = mpsc::unbounded_channel();
    transport.start(tx).await.expect("start");
    assert!(matches!(
        transport.send(vec![ping(1)]).await,
        Err(McpError::Transport(_))
    ));
}

/// Hands out a stale token until asked to authorize.
struct RotatingProvider {
    token: RwLock<String>,
    authorizations: AtomicUsize,
}

impl RotatingProvider {
    fn new() -> Self {
        Self {
            token: RwLock::new("stale".to_string()),
            authorizations: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl OAuthClientProvider for RotatingProvider {
    async fn tokens(&self) -> Option<OAuthTokens> {
        Some(OAuthTokens::bearer(self.token.read().clone()))
    }

    async fn authorize(&self, _server_url: &Url) -> lattice_mcp_client::Result<AuthResult> {
        self.authorizations.fetch_add(1, Ordering::SeqCst);
        *self.token.write() = "fresh".to_string();
        Ok(AuthResult::Authorized)
    }

    async fn finish_authorization(
        &self,
        _server_url: &Url,
        _code: &str,
    ) -> lattice_mcp_client::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_unauthorized_post_reauthorizes_once_and_retries() {
    let server = MockServer::start().await;
    mount_get_not_allowed(&server).await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(header("authorization", "Bearer fresh"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"jsonrpc": "2.0", "id": 9, "result": {}})),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;

    let provider = Arc::new(RotatingProvider::new());
    let transport = transport_for(&server).with_auth_provider(provider.clone());
    let (tx, mut rx) = mpsc::unbounded_channel();
    transport.start(tx).await.expect("start");
    transport.send(vec![ping(9)]).await.expect("send after re-auth");

    assert_eq!(provider.authorizations.load(Ordering::SeqCst), 1);
    let message = next_message(&mut rx).await;
    assert_eq!(response_id(&message), Some(RequestId::Number(9)));
}

#[tokio::test]
async fn test_repeated_unauthorized_is_fatal() {
    let server = MockServer::start().await;
    mount_get_not_allowed(&server).await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .respond_with(ResponseTemplate::new(401))
        .expect(2)
        .mount(&server)
        .await;

    let provider = Arc::new(RotatingProvider::new());
    let transport = transport_for(&server).with_auth_provider(provider.clone());
    let (tx, _rx) = mpsc::unbounded_channel();
    transport.start(tx).await.expect("start");

    let err = transport.send(vec![ping(1)]).await.unwrap_err();
    assert!(err.is_unauthorized());
    assert_eq!(provider.authorizations.load(Ordering::SeqCst), 1);
}
