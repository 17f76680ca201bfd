//! End-to-end session over a real local socket: resolve the session URL from
//! the page location, dial before the server accepts, exchange requests and
//! notifications, then close.

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use wsmux::{session_socket_url, MuxError, WsMux};

#[tokio::test]
async fn recorder_session_round_trip() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let page_url = format!("http://127.0.0.1:{port}/recorder/index.html?ws=session-token");
    let socket_url = session_socket_url(&page_url, "session-token").unwrap();
    assert_eq!(
        socket_url.as_str(),
        format!("ws://127.0.0.1:{port}/session-token")
    );

    // Dial before the server accepts; requests issued now suspend until open.
    let mux = WsMux::connect(socket_url);
    let (note_tx, mut note_rx) = mpsc::unbounded_channel();
    mux.set_sink(move |note| {
        let _ = note_tx.send(note);
    });

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        // Push a notification before answering anything.
        ws.send(Message::text(
            json!({"method": "modeChanged", "params": {"mode": "recording"}}).to_string(),
        ))
        .await
        .unwrap();

        // Answer two requests out of order.
        let mut requests = Vec::new();
        while requests.len() < 2 {
            match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => {
                    let request: Value = serde_json::from_str(text.as_str()).unwrap();
                    requests.push(request);
                }
                Message::Ping(_) | Message::Pong(_) => {}
                other => panic!("unexpected message: {other:?}"),
            }
        }
        for request in requests.iter().rev() {
            let reply = match request["method"].as_str().unwrap() {
                "setMode" => json!({"id": request["id"]}),
                "source" => json!({"id": request["id"], "result": "await page.goto(...)"}),
                method => json!({"id": request["id"], "error": format!("unknown method {method}")}),
            };
            ws.send(Message::text(reply.to_string())).await.unwrap();
        }

        // One more request gets an error reply, then the server closes.
        loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => {
                    let request: Value = serde_json::from_str(text.as_str()).unwrap();
                    ws.send(Message::text(
                        json!({"id": request["id"], "error": "recorder stopped"}).to_string(),
                    ))
                    .await
                    .unwrap();
                    break;
                }
                _ => {}
            }
        }
        ws.send(Message::Close(None)).await.unwrap();
    });

    let set_mode = {
        let mux = mux.clone();
        tokio::spawn(async move {
            mux.send("setMode", Some(json!({"mode": "recording"}))).await
        })
    };
    let source = {
        let mux = mux.clone();
        tokio::spawn(async move { mux.send("source", None).await })
    };

    // Each call resolves with its own response regardless of reply order.
    assert_eq!(set_mode.await.unwrap().unwrap(), Value::Null);
    assert_eq!(source.await.unwrap().unwrap(), json!("await page.goto(...)"));

    let note = note_rx.recv().await.unwrap();
    assert_eq!(note.method, "modeChanged");
    assert_eq!(note.params, Some(json!({"mode": "recording"})));

    let err = mux.send("stop", None).await.unwrap_err();
    assert!(matches!(err, MuxError::Remote(message) if message == "recorder stopped"));

    server.await.unwrap();

    // The server closed; the next request fails with a connection-closed
    // error once the driver winds down.
    assert!(matches!(
        mux.send("late", None).await,
        Err(MuxError::ConnectionClosed)
    ));
}
