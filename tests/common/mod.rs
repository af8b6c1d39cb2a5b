//! Shared helpers for the integration suites: spin up a real server on an
//! ephemeral port and hand out connected clients.

#![allow(dead_code)]

use znsocket::server::ServerBuilder;
use znsocket::{Client, Server};

/// Start a default server; returns its `znsocket://` URL.
pub async fn start_server() -> String {
    start_server_with(Server::builder()).await
}

/// Start a server from a customised builder; returns its URL.
pub async fn start_server_with(builder: ServerBuilder) -> String {
    let server = builder.bind("127.0.0.1:0").await.expect("bind server");
    let addr = server.local_addr().expect("local addr");
    tokio::spawn(server.run());
    format!("znsocket://{addr}")
}

/// Connect a client with default settings.
pub async fn connect(url: &str) -> Client {
    Client::connect(url).await.expect("connect client")
}
