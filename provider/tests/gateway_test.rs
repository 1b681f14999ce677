//! End-to-end tests: a real provider against a loopback fake gateway and a
//! mocked Ollama server, plus the connection write path on a real socket.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use llmhub_provider::config::{
    AdmissionPolicy, BackendConfig, BackendKind, Config, GatewayConfig, ProviderConfig,
};
use llmhub_common::{InferenceResponse, ProviderMessage, Registration, Usage};
use llmhub_provider::gateway::{
    connect, run_heartbeat, ConnectOptions, ConnectionState, GatewaySender,
};
use llmhub_provider::session::Session;
use llmhub_provider::{Error, Provider};

type Ws = WebSocketStream<TcpStream>;

/// Accept one provider connection and hand it to `script`.
///
/// Returns the hub URL to configure and the path the provider dialed.
async fn fake_gateway<F, Fut>(script: F) -> (String, Arc<Mutex<String>>)
where
    F: FnOnce(Ws) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let dialed = Arc::new(Mutex::new(String::new()));
    let dialed_path = dialed.clone();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            *dialed_path.lock().unwrap() = req.uri().path().to_string();
            Ok(resp)
        };
        let ws = tokio_tungstenite::accept_hdr_async(stream, callback)
            .await
            .unwrap();
        script(ws).await;
    });

    (format!("http://{}", addr), dialed)
}

async fn next_json(ws: &mut Ws) -> Option<Value> {
    while let Some(frame) = ws.next().await {
        match frame {
            Ok(Message::Text(text)) => return Some(serde_json::from_str(&text).unwrap()),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
    None
}

async fn send_json(ws: &mut Ws, value: Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

async fn mock_ollama() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "models": [{ "name": "llama3:latest" }, { "name": "mistral" }]
        })))
        .mount(&server)
        .await;
    server
}

/// Wait for detached request tasks to finish their bookkeeping.
async fn settle(session: &Session) {
    for _ in 0..100 {
        if session.queue_depth() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn config(hub_url: &str, backend_url: &str) -> Config {
    Config {
        provider: ProviderConfig {
            model: "llama3".to_string(),
            description: "test box".to_string(),
            max_concurrent: 2,
            token: "tok-123".to_string(),
            admission: AdmissionPolicy::Unbounded,
        },
        backend: BackendConfig {
            kind: BackendKind::Ollama,
            url: Some(backend_url.to_string()),
            api_key: None,
        },
        gateway: GatewayConfig {
            hub_url: hub_url.to_string(),
            handshake_timeout_secs: 5,
            ..GatewayConfig::default()
        },
        status_api: None,
    }
}

#[tokio::test]
async fn test_registration_frame_and_path() {
    let ollama = mock_ollama().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (hub_url, dialed) = fake_gateway(move |mut ws| async move {
        let register = next_json(&mut ws).await.unwrap();
        tx.send(register).unwrap();
        send_json(&mut ws, json!({ "type": "registered" })).await;
        let _ = next_json(&mut ws).await;
    })
    .await;

    let provider = Provider::start(config(&hub_url, &ollama.uri())).await.unwrap();
    let register = rx.recv().await.unwrap();

    assert_eq!(*dialed.lock().unwrap(), "/provider/ws");
    assert_eq!(register["type"], "register");
    assert_eq!(register["model"], "llama3");
    assert_eq!(register["backend"], "ollama");
    assert_eq!(register["price"], 0.0);
    assert_eq!(register["description"], "test box");
    assert_eq!(register["max_concurrent"], 2);
    assert_eq!(register["token"], "tok-123");
    assert_eq!(
        register["provider_id"].as_str(),
        Some(provider.session().provider_id())
    );
    assert_eq!(provider.session().provider_id().len(), 8);
}

#[tokio::test]
async fn test_handshake_error_surfaces_message() {
    let ollama = mock_ollama().await;
    let (hub_url, _) = fake_gateway(|mut ws| async move {
        let _ = next_json(&mut ws).await;
        send_json(&mut ws, json!({ "type": "error", "message": "invalid provider token" })).await;
        let _ = next_json(&mut ws).await;
    })
    .await;

    match Provider::start(config(&hub_url, &ollama.uri())).await {
        Err(Error::Handshake(msg)) => assert!(msg.contains("invalid provider token")),
        Err(e) => panic!("Expected handshake error, got {}", e),
        Ok(_) => panic!("Expected handshake error"),
    }
}

#[tokio::test]
async fn test_handshake_timeout() {
    let ollama = mock_ollama().await;
    let (hub_url, _) = fake_gateway(|mut ws| async move {
        // Read the register frame, then say nothing until the provider gives up.
        let _ = next_json(&mut ws).await;
        let _ = next_json(&mut ws).await;
    })
    .await;

    let mut config = config(&hub_url, &ollama.uri());
    config.gateway.handshake_timeout_secs = 1;

    match Provider::start(config).await {
        Err(Error::Handshake(msg)) => assert!(msg.contains("timed out")),
        Err(e) => panic!("Expected handshake error, got {}", e),
        Ok(_) => panic!("Expected handshake error"),
    }
}

#[tokio::test]
async fn test_unhealthy_backend_fails_before_connecting() {
    let ollama = mock_ollama().await;
    let mut config = config("http://127.0.0.1:1", &ollama.uri());
    config.provider.model = "phi3".to_string();

    match Provider::start(config).await {
        Err(Error::ModelNotFound { model, available }) => {
            assert_eq!(model, "phi3");
            assert_eq!(available, vec!["llama3:latest", "mistral"]);
        }
        Err(e) => panic!("Expected ModelNotFound, got {}", e),
        Ok(_) => panic!("Expected ModelNotFound"),
    }
}

#[tokio::test]
async fn test_requests_are_served_until_gateway_closes() {
    let ollama = mock_ollama().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(body_partial_json(json!({ "stream": false })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "response": "Paris",
            "done": true,
            "prompt_eval_count": 7,
            "eval_count": 1
        })))
        .mount(&ollama)
        .await;
    let ndjson = [
        r#"{"response":"1","done":false}"#,
        r#"{"response":", 2","done":false}"#,
        r#"{"response":", 3","done":true,"prompt_eval_count":4,"eval_count":3}"#,
    ]
    .join("\n");
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(body_partial_json(json!({ "stream": true })))
        .respond_with(ResponseTemplate::new(200).set_body_string(ndjson))
        .mount(&ollama)
        .await;

    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
    let (hub_url, _) = fake_gateway(move |mut ws| async move {
        let _register = next_json(&mut ws).await.unwrap();
        send_json(&mut ws, json!({ "type": "registered" })).await;
        send_json(&mut ws, json!({ "type": "ping" })).await;
        send_json(&mut ws, json!({ "type": "something_new" })).await;
        send_json(
            &mut ws,
            json!({
                "type": "request",
                "request_id": "r1",
                "model": "llama3",
                "prompt": "Capital of France?",
                "params": { "max_tokens": 8 }
            }),
        )
        .await;
        send_json(
            &mut ws,
            json!({
                "type": "request",
                "request_id": "r2",
                "model": "llama3",
                "prompt": "Count to 3",
                "params": { "stream": true }
            }),
        )
        .await;

        let mut response_seen = false;
        let mut stream_done = false;
        while !(response_seen && stream_done) {
            let Some(frame) = next_json(&mut ws).await else {
                break;
            };
            match frame["type"].as_str() {
                Some("response") => response_seen = true,
                Some("stream_token") if frame["done"] == true => stream_done = true,
                _ => {}
            }
            tx.send(frame).unwrap();
        }
        ws.close(None).await.unwrap();
    })
    .await;

    let provider = Provider::start(config(&hub_url, &ollama.uri())).await.unwrap();
    let session = provider.session();
    let result = tokio::time::timeout(
        Duration::from_secs(10),
        provider.run(CancellationToken::new()),
    )
    .await
    .unwrap();
    assert!(matches!(result, Err(Error::Transport(_))));

    settle(&session).await;

    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(frame);
    }

    let heartbeat = frames.iter().find(|f| f["type"] == "heartbeat").unwrap();
    assert_eq!(heartbeat["model"], "llama3");
    assert_eq!(heartbeat["gpu_util"], 0.0);

    let response = frames.iter().find(|f| f["type"] == "response").unwrap();
    assert_eq!(response["request_id"], "r1");
    assert_eq!(response["text"], "Paris");
    assert_eq!(response["provider_id"], session.provider_id());
    assert_eq!(response["usage"]["total_tokens"], 8);

    let tokens: Vec<&Value> = frames
        .iter()
        .filter(|f| f["type"] == "stream_token" && f["request_id"] == "r2")
        .collect();
    let indices: Vec<u64> = tokens.iter().map(|t| t["index"].as_u64().unwrap()).collect();
    assert_eq!(indices, vec![0, 1, 2, 3]);

    let (terminal, fragments) = tokens.split_last().unwrap();
    let joined: String = fragments
        .iter()
        .map(|t| t["token"].as_str().unwrap())
        .collect();
    assert_eq!(joined, "1, 2, 3");
    assert_eq!(terminal["done"], true);
    assert_eq!(terminal["text"], "1, 2, 3");
    assert_eq!(terminal["usage"]["completion_tokens"], 3);

    assert!(!frames.iter().any(|f| f["type"] == "error"));
    assert_eq!(session.queue_depth(), 0);
    assert_eq!(session.request_count(), 2);
}

#[tokio::test]
async fn test_backend_failure_becomes_error_frame() {
    let ollama = mock_ollama().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(500).set_body_string("out of memory"))
        .mount(&ollama)
        .await;

    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
    let (hub_url, _) = fake_gateway(move |mut ws| async move {
        let _ = next_json(&mut ws).await;
        send_json(&mut ws, json!({ "type": "registered" })).await;
        send_json(
            &mut ws,
            json!({ "type": "request", "request_id": "r-err", "prompt": "Hi" }),
        )
        .await;
        while let Some(frame) = next_json(&mut ws).await {
            let is_error = frame["type"] == "error";
            tx.send(frame).unwrap();
            if is_error {
                break;
            }
        }
        ws.close(None).await.unwrap();
    })
    .await;

    let provider = Provider::start(config(&hub_url, &ollama.uri())).await.unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(10), provider.run(CancellationToken::new()))
        .await
        .unwrap();

    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(frame);
    }
    let errors: Vec<&Value> = frames.iter().filter(|f| f["type"] == "error").collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["request_id"], "r-err");
    let message = errors[0]["message"].as_str().unwrap();
    assert!(message.starts_with("inference failed: "));
    assert!(message.contains("out of memory"));
    assert!(!frames.iter().any(|f| f["type"] == "response"));
}

#[tokio::test]
async fn test_cancellation_stops_cleanly() {
    let ollama = mock_ollama().await;
    let (closed_tx, closed_rx) = tokio::sync::oneshot::channel();
    let (hub_url, _) = fake_gateway(move |mut ws| async move {
        let _ = next_json(&mut ws).await;
        send_json(&mut ws, json!({ "type": "registered" })).await;
        // Drain heartbeats until the provider closes the socket.
        while next_json(&mut ws).await.is_some() {}
        let _ = closed_tx.send(());
    })
    .await;

    let provider = Provider::start(config(&hub_url, &ollama.uri())).await.unwrap();
    let cancel = CancellationToken::new();
    let run = tokio::spawn(provider.run(cancel.clone()));

    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();

    let result = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
    tokio::time::timeout(Duration::from_secs(5), closed_rx)
        .await
        .unwrap()
        .unwrap();
}

fn registration() -> Registration {
    Registration {
        provider_id: "ab12cd34".to_string(),
        model: "llama3".to_string(),
        backend: "ollama".to_string(),
        price: 0.0,
        description: String::new(),
        max_concurrent: 4,
        token: "tok-123".to_string(),
    }
}

fn connect_options(hub_url: &str, write_timeout: Duration) -> ConnectOptions {
    ConnectOptions {
        hub_url: hub_url.to_string(),
        registration: registration(),
        handshake_timeout: Duration::from_secs(5),
        write_timeout,
    }
}

fn response_frame(request_id: &str, text: String) -> ProviderMessage {
    ProviderMessage::Response(InferenceResponse {
        request_id: request_id.to_string(),
        text,
        provider_id: "ab12cd34".to_string(),
        latency_ms: 1,
        usage: Usage::new(1, 1),
    })
}

#[tokio::test]
async fn test_concurrent_sends_arrive_as_whole_frames() {
    const TASKS: usize = 8;
    const PER_TASK: usize = 25;
    const TEXT_LEN: usize = 16 * 1024;

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let (hub_url, _) = fake_gateway(move |mut ws| async move {
        let _ = next_json(&mut ws).await;
        send_json(&mut ws, json!({ "type": "registered" })).await;
        while let Some(Ok(frame)) = ws.next().await {
            match frame {
                Message::Text(text) => {
                    if tx.send(text).is_err() {
                        break;
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    })
    .await;

    let (connection, _reader) = connect(connect_options(&hub_url, Duration::from_secs(5)))
        .await
        .unwrap();
    let connection = Arc::new(connection);
    assert_eq!(connection.state(), ConnectionState::Active);

    let session = Arc::new(Session::new(
        "ab12cd34".to_string(),
        "llama3".to_string(),
        BackendKind::Ollama,
        4,
    ));
    let cancel = CancellationToken::new();
    let heartbeat = tokio::spawn(run_heartbeat(
        connection.clone(),
        session,
        Duration::from_millis(5),
        cancel.clone(),
    ));

    let mut senders = Vec::new();
    for task in 0..TASKS {
        let connection = connection.clone();
        senders.push(tokio::spawn(async move {
            let fill = char::from(b'a' + task as u8);
            for n in 0..PER_TASK {
                let text = fill.to_string().repeat(TEXT_LEN);
                let frame = response_frame(&format!("t{}-{}", task, n), text);
                connection.send(&frame).await.unwrap();
            }
        }));
    }
    for sender in senders {
        sender.await.unwrap();
    }
    cancel.cancel();
    heartbeat.await.unwrap();

    let mut responses = 0;
    let mut heartbeats = 0;
    while responses < TASKS * PER_TASK {
        let text = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let frame: Value = serde_json::from_str(&text).unwrap();
        assert!(frame.is_object());
        match frame["type"].as_str() {
            Some("response") => {
                let request_id = frame["request_id"].as_str().unwrap();
                let task: usize = request_id[1..request_id.find('-').unwrap()].parse().unwrap();
                let fill = char::from(b'a' + task as u8);
                let body = frame["text"].as_str().unwrap();
                assert_eq!(body.len(), TEXT_LEN);
                assert!(body.chars().all(|c| c == fill));
                responses += 1;
            }
            Some("heartbeat") => heartbeats += 1,
            other => panic!("Unexpected frame type {:?}", other),
        }
    }
    assert!(heartbeats >= 1);

    connection.close().await;
    assert_eq!(connection.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_send_times_out_when_gateway_stops_reading() {
    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
    let (hub_url, _) = fake_gateway(move |mut ws| async move {
        let _ = next_json(&mut ws).await;
        send_json(&mut ws, json!({ "type": "registered" })).await;
        // Hold the socket open without reading from it.
        let _ = release_rx.await;
        drop(ws);
    })
    .await;

    let (connection, _reader) = connect(connect_options(&hub_url, Duration::from_millis(300)))
        .await
        .unwrap();

    let big = "x".repeat(1024 * 1024);
    let mut outcome = None;
    for n in 0..500 {
        let frame = response_frame(&format!("r{}", n), big.clone());
        if let Err(e) = connection.send(&frame).await {
            outcome = Some(e);
            break;
        }
    }

    match outcome {
        Some(Error::Transport(msg)) => assert_eq!(msg, "timed out writing response frame"),
        other => panic!("Expected write timeout, got {:?}", other),
    }
    let _ = release_tx.send(());
}
