//! Client connection talking to a server connection over an in-memory pipe.

use hypertwo::{Config, Connection, H2Error, Request, Response};

async fn connected_pair() -> (Connection, Connection) {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let server = tokio::spawn(Connection::accept(server_io, Config::default()));
    let client = Connection::connect(client_io, Config::default())
        .await
        .unwrap();
    let server = server.await.unwrap().unwrap();
    (client, server)
}

/// Answers every request by echoing its body back.
fn spawn_echo(server: Connection) {
    tokio::spawn(async move {
        while let Some((request, responder)) = server.accept_request().await {
            let body = request.body.clone();
            let response = Response::new(
                200,
                vec![("x-echo-path".to_owned(), request.path().to_owned())],
                body,
            );
            let _ = responder.send(response).await;
        }
    });
}

#[tokio::test]
async fn post_is_echoed() {
    let (client, server) = connected_pair().await;
    spawn_echo(server);

    let response = client
        .request(Request::post(
            "https://example.com/echo".parse().unwrap(),
            None,
            "ping-pong",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.header("x-echo-path"), Some("/echo"));
    assert_eq!(response.body.as_ref(), b"ping-pong");
}

#[tokio::test]
async fn empty_body_request() {
    let (client, server) = connected_pair().await;
    tokio::spawn(async move {
        while let Some((request, responder)) = server.accept_request().await {
            assert!(request.body.is_empty());
            assert_eq!(request.method(), "GET");
            let _ = responder.send(Response::new(204, vec![], "")).await;
        }
    });

    let response = client
        .request(Request::get("https://example.com/".parse().unwrap(), None))
        .await
        .unwrap();
    assert_eq!(response.status(), 204);
    assert!(response.body.is_empty());
}

#[tokio::test]
async fn request_headers_reach_the_server() {
    let (client, server) = connected_pair().await;
    tokio::spawn(async move {
        while let Some((request, responder)) = server.accept_request().await {
            assert_eq!(request.method(), "PUT");
            assert_eq!(request.path(), "/thing/7");
            assert_eq!(request.header(":authority"), Some("example.com"));
            assert_eq!(request.header("x-trace"), Some("abc123"));
            // hop-by-hop headers never cross the wire
            assert!(request.header("connection").is_none());
            let _ = responder.send(Response::new(200, vec![], "done")).await;
        }
    });

    let response = client
        .request(Request::new(
            hypertwo::Method::Put,
            "https://example.com/thing/7".parse().unwrap(),
            Some(vec![
                ("X-Trace".to_owned(), "abc123".to_owned()),
                ("Connection".to_owned(), "close".to_owned()),
            ]),
            "payload",
        ))
        .await
        .unwrap();
    assert_eq!(response.body.as_ref(), b"done");
}

#[tokio::test]
async fn concurrent_requests_interleave() {
    let (client, server) = connected_pair().await;
    spawn_echo(server);

    let mut pending = Vec::new();
    for i in 0..8 {
        let client = client.clone();
        pending.push(tokio::spawn(async move {
            let body = format!("request-{}", i);
            let response = client
                .request(Request::post(
                    format!("https://example.com/{}", i).parse().unwrap(),
                    None,
                    body.clone(),
                ))
                .await
                .unwrap();
            assert_eq!(response.body.as_ref(), body.as_bytes());
        }));
    }
    for task in pending {
        task.await.unwrap();
    }
}

#[tokio::test]
async fn body_larger_than_the_flow_window() {
    let (client, server) = connected_pair().await;
    spawn_echo(server);

    // several times the 65535 byte initial window, so progress requires
    // WINDOW_UPDATE round-trips in both directions
    let body = vec![0x42u8; 300_000];
    let response = client
        .request(Request::post(
            "https://example.com/big".parse().unwrap(),
            None,
            body.clone(),
        ))
        .await
        .unwrap();
    assert_eq!(response.body.len(), body.len());
    assert!(response.body.iter().all(|&byte| byte == 0x42));
}

#[tokio::test]
async fn shutdown_refuses_new_requests() {
    let (client, server) = connected_pair().await;
    spawn_echo(server);

    client.shutdown().await.unwrap();
    let err = client
        .request(Request::get("https://example.com/".parse().unwrap(), None))
        .await
        .unwrap_err();
    assert!(matches!(err, H2Error::GoingAway));
}

#[tokio::test]
async fn trailing_responses_survive_many_exchanges() {
    let (client, server) = connected_pair().await;
    spawn_echo(server);

    // dynamic-table state on both hpack directions must stay in sync across
    // repeated blocks with repeated custom fields
    for round in 0..5 {
        let response = client
            .request(Request::post(
                "https://example.com/loop".parse().unwrap(),
                Some(vec![("x-round".to_owned(), "same-value".to_owned())]),
                format!("round {}", round),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.body.as_ref(), format!("round {}", round).as_bytes());
    }
}
