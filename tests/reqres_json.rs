#![cfg(feature = "json")]
use hypertwo::{Config, Connection, Request, Response};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CreateUser {
    name: String,
    job: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CreateUserResponse {
    name: String,
    job: String,
    id: String,
}

#[tokio::test]
async fn create_user() {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let server = tokio::spawn(Connection::accept(server_io, Config::default()));
    let client = Connection::connect(client_io, Config::default())
        .await
        .unwrap();
    let server = server.await.unwrap().unwrap();

    tokio::spawn(async move {
        while let Some((request, responder)) = server.accept_request().await {
            assert_eq!(request.header("content-type"), Some("application/json"));
            let user: CreateUser = serde_json::from_slice(&request.body).unwrap();
            let reply = CreateUserResponse {
                name: user.name,
                job: user.job,
                id: "42".to_owned(),
            };
            let response = Response::new(
                201,
                vec![("content-type".to_owned(), "application/json".to_owned())],
                serde_json::to_vec(&reply).unwrap(),
            );
            let _ = responder.send(response).await;
        }
    });

    let response = client
        .request(
            Request::post_json(
                "https://users.example/api/users/".parse().unwrap(),
                &CreateUser {
                    name: "morpheus".to_string(),
                    job: "leader".to_string(),
                },
            )
            .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), 201);

    let data: CreateUserResponse = response.json().unwrap();
    assert_eq!(data.name, "morpheus");
    assert_eq!(data.job, "leader");
    assert_eq!(data.id, "42");
}
