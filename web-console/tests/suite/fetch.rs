use std::time::Duration;

use anyhow::Result;
use code_web_console_protocol::WebviewInbound;
use pretty_assertions::assert_eq;
use serde_json::Value;
use serde_json::json;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::ResponseTemplate;
use wiremock::matchers::body_bytes;
use wiremock::matchers::method;
use wiremock::matchers::path;

use super::support::next_frame;
use super::support::test_relay;

const SLOW_STREAM_EVENTS: usize = 5;

fn inbound(message: Value) -> Result<WebviewInbound> {
    Ok(WebviewInbound::from_value(message)?)
}

/// Next frame, which must be a `to-webview` message; returns its payload.
async fn next_message(frames: &mut mpsc::Receiver<String>) -> Result<Value> {
    let frame = next_frame(frames).await?;
    anyhow::ensure!(frame["type"] == "to-webview", "unexpected frame {frame}");
    Ok(frame["message"].clone())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn json_response_is_reserialized_for_origin_only() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/status"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-upstream", "yes")
                .set_body_json(json!({"ok": true, "items": [1, 2]})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let relay = test_relay();
    let (client, mut frames) = relay.connect().await;
    let (_bystander, mut bystander_frames) = relay.connect().await;
    next_frame(&mut frames).await?;
    next_frame(&mut bystander_frames).await?;

    relay
        .handle_webview_message(
            client,
            inbound(json!({
                "type": "fetch",
                "requestId": "f1",
                "url": format!("{}/api/status", server.uri()),
            }))?,
        )
        .await?;

    let response = next_message(&mut frames).await?;
    assert_eq!(response["type"], "fetch-response");
    assert_eq!(response["responseType"], "success");
    assert_eq!(response["requestId"], "f1");
    assert_eq!(response["status"], 200);
    assert_eq!(response["headers"]["x-upstream"], "yes");
    let body: Value = serde_json::from_str(response["bodyJsonString"].as_str().unwrap_or_default())?;
    assert_eq!(body, json!({"ok": true, "items": [1, 2]}));
    assert!(bystander_frames.try_recv().is_err());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn base64_request_body_is_decoded_and_binary_reply_encoded() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/upload"))
        .and(body_bytes(b"hello".to_vec()))
        .respond_with(ResponseTemplate::new(201).set_body_raw(b"abc".to_vec(), "text/plain"))
        .expect(1)
        .mount(&server)
        .await;

    let relay = test_relay();
    let (client, mut frames) = relay.connect().await;
    next_frame(&mut frames).await?;

    relay
        .handle_webview_message(
            client,
            inbound(json!({
                "type": "fetch",
                "requestId": "f2",
                "url": format!("{}/upload", server.uri()),
                "method": "POST",
                "headers": {"X-Codex-Base64": "1"},
                "body": "aGVsbG8=",
            }))?,
        )
        .await?;

    let response = next_message(&mut frames).await?;
    assert_eq!(response["responseType"], "success");
    assert_eq!(response["status"], 201);
    let body: Value = serde_json::from_str(response["bodyJsonString"].as_str().unwrap_or_default())?;
    assert_eq!(body, json!({"base64": "YWJj", "contentType": "text/plain"}));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transport_failure_reports_error_result() -> Result<()> {
    let unused = TcpListener::bind("127.0.0.1:0").await?;
    let url = format!("http://{}/gone", unused.local_addr()?);
    drop(unused);

    let relay = test_relay();
    let (client, mut frames) = relay.connect().await;
    next_frame(&mut frames).await?;

    relay
        .handle_webview_message(
            client,
            inbound(json!({"type": "fetch", "requestId": "f3", "url": url}))?,
        )
        .await?;

    let response = next_message(&mut frames).await?;
    assert_eq!(response["type"], "fetch-response");
    assert_eq!(response["responseType"], "error");
    assert_eq!(response["requestId"], "f3");
    assert_eq!(response["status"], 500);
    assert!(response["error"].as_str().is_some_and(|error| !error.is_empty()));
    assert!(response.get("bodyJsonString").is_none());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sse_stream_is_relayed_as_events_then_completes() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/events"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            "event: delta\ndata: one\n\n: keep-alive\n\ndata: two\ndata: three\n\ndata: tail",
            "text/event-stream",
        ))
        .mount(&server)
        .await;

    let relay = test_relay();
    let (client, mut frames) = relay.connect().await;
    next_frame(&mut frames).await?;

    relay
        .handle_webview_message(
            client,
            inbound(json!({
                "type": "fetch-stream",
                "requestId": "s1",
                "url": format!("{}/events", server.uri()),
            }))?,
        )
        .await?;

    let expected = [
        json!({"type": "fetch-stream-event", "requestId": "s1", "event": "delta", "data": "one"}),
        json!({"type": "fetch-stream-event", "requestId": "s1", "event": "message", "data": "two\nthree"}),
        json!({"type": "fetch-stream-event", "requestId": "s1", "event": "message", "data": "tail"}),
        json!({"type": "fetch-stream-complete", "requestId": "s1"}),
    ];
    for message in expected {
        assert_eq!(next_message(&mut frames).await?, message);
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn long_stream_waits_for_a_reading_client() -> Result<()> {
    const EVENTS: usize = 2000;
    let body: String = (0..EVENTS).map(|n| format!("data: {n}\n\n")).collect();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/burst"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let relay = test_relay();
    let (client, mut frames) = relay.connect().await;
    next_frame(&mut frames).await?;

    let reader = tokio::spawn(async move {
        let mut events = 0;
        loop {
            let frame = next_frame(&mut frames).await?;
            match frame["message"]["type"].as_str() {
                Some("fetch-stream-event") => events += 1,
                Some("fetch-stream-complete") => return anyhow::Ok(events),
                _ => anyhow::bail!("unexpected frame {frame}"),
            }
            tokio::task::yield_now().await;
        }
    });

    relay
        .handle_webview_message(
            client,
            inbound(json!({
                "type": "fetch-stream",
                "requestId": "burst",
                "url": format!("{}/burst", server.uri()),
            }))?,
        )
        .await?;

    assert_eq!(reader.await??, EVENTS);
    assert!(relay.clients().is_connected(client).await);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bodyless_stream_reports_error() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let relay = test_relay();
    let (client, mut frames) = relay.connect().await;
    next_frame(&mut frames).await?;

    relay
        .handle_webview_message(
            client,
            inbound(json!({"type": "fetch-stream", "requestId": "s0", "url": server.uri()}))?,
        )
        .await?;
    assert_eq!(
        next_message(&mut frames).await?,
        json!({"type": "fetch-stream-error", "requestId": "s0", "error": "No response body"})
    );
    Ok(())
}

/// Serves every connection a chunked SSE body, one event every 100ms.
async fn start_slow_sse_server() -> Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|window| window == b"\r\n\r\n") {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let head = "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ntransfer-encoding: chunked\r\n\r\n";
                if stream.write_all(head.as_bytes()).await.is_err() {
                    return;
                }
                for n in 0..SLOW_STREAM_EVENTS {
                    let event = format!("data: {n}\n\n");
                    let chunk = format!("{:x}\r\n{event}\r\n", event.len());
                    if stream.write_all(chunk.as_bytes()).await.is_err() {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                let _ = stream.write_all(b"0\r\n\r\n").await;
            });
        }
    });
    Ok(format!("http://{addr}/stream"))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelling_one_stream_leaves_the_other_running() -> Result<()> {
    let url = start_slow_sse_server().await?;
    let relay = test_relay();
    let (first, mut first_frames) = relay.connect().await;
    let (second, mut second_frames) = relay.connect().await;
    next_frame(&mut first_frames).await?;
    next_frame(&mut second_frames).await?;

    relay
        .handle_webview_message(
            first,
            inbound(json!({"type": "fetch-stream", "requestId": "a", "url": url}))?,
        )
        .await?;
    relay
        .handle_webview_message(
            second,
            inbound(json!({"type": "fetch-stream", "requestId": "b", "url": url}))?,
        )
        .await?;

    assert_eq!(next_message(&mut first_frames).await?["data"], "0");
    relay
        .handle_webview_message(
            first,
            inbound(json!({"type": "cancel-fetch-stream", "requestId": "a"}))?,
        )
        .await?;

    for n in 0..SLOW_STREAM_EVENTS {
        let event = next_message(&mut second_frames).await?;
        assert_eq!(event["requestId"], "b");
        assert_eq!(event["data"], n.to_string());
    }
    assert_eq!(
        next_message(&mut second_frames).await?,
        json!({"type": "fetch-stream-complete", "requestId": "b"})
    );

    assert!(first_frames.try_recv().is_err());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disconnect_cancels_client_streams() -> Result<()> {
    let url = start_slow_sse_server().await?;
    let relay = test_relay();
    let (client, mut frames) = relay.connect().await;
    next_frame(&mut frames).await?;

    relay
        .handle_webview_message(
            client,
            inbound(json!({"type": "fetch-stream", "requestId": "d", "url": url}))?,
        )
        .await?;
    assert_eq!(next_message(&mut frames).await?["data"], "0");
    assert_eq!(relay.fetches_in_flight().await, 1);

    relay.disconnect(client).await;
    assert_eq!(relay.fetches_in_flight().await, 0);
    Ok(())
}
