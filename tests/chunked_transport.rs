//! Chunked-transport round trips with a lowered size limit.

mod common;

use common::start_server_with;
use pretty_assertions::assert_eq;
use serde_json::json;
use znsocket::{Client, Dict, Server};

/// A payload zlib cannot shrink below the test's size limits.
fn noisy_string(len: usize) -> String {
    let mut state = 0x9e37_79b9_7f4a_7c15u64;
    let alphabet: Vec<char> = ('a'..='z').chain('A'..='Z').chain('0'..='9').collect();
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            alphabet[(state % alphabet.len() as u64) as usize]
        })
        .collect()
}

#[tokio::test]
async fn large_value_round_trips_byte_exact() {
    // 100 kB limit on both sides forces a split for a ~400 kB payload.
    let url = start_server_with(Server::builder().max_message_size(100 * 1024)).await;
    let client = Client::builder()
        .max_message_size(100 * 1024)
        .connect(&url)
        .await
        .unwrap();

    let payload = noisy_string(400 * 1024);
    let dct = Dict::new(client.clone(), "blobs").await.unwrap();
    dct.set("data", json!(payload.clone())).await.unwrap();

    let back = dct.get("data").await.unwrap().into_plain();
    assert_eq!(back, json!(payload));
}

#[tokio::test]
async fn lowered_limit_forces_splitting_for_small_payloads() {
    // The same payload fits comfortably under the default 80 MiB limit but
    // must be chunked once the limit drops to 4 kB.
    let url = start_server_with(Server::builder().max_message_size(4 * 1024)).await;
    let client = Client::builder()
        .max_message_size(4 * 1024)
        .connect(&url)
        .await
        .unwrap();

    let payload = noisy_string(64 * 1024);
    client
        .call("set", json!({"name": "k", "value": payload.clone()}))
        .await
        .unwrap();
    assert_eq!(
        client.call("get", json!({"name": "k"})).await.unwrap(),
        json!(payload)
    );
}

#[tokio::test]
async fn compressible_payload_survives_the_limit() {
    let url = start_server_with(Server::builder().max_message_size(8 * 1024)).await;
    let client = Client::builder()
        .max_message_size(8 * 1024)
        .connect(&url)
        .await
        .unwrap();

    // Repetitive content compresses to a single frame.
    let payload = "abc".repeat(100_000);
    client
        .call("set", json!({"name": "k", "value": payload.clone()}))
        .await
        .unwrap();
    assert_eq!(
        client.call("get", json!({"name": "k"})).await.unwrap(),
        json!(payload)
    );
}

#[tokio::test]
async fn large_pipeline_round_trips() {
    let url = start_server_with(Server::builder().max_message_size(16 * 1024)).await;
    let client = Client::builder()
        .max_message_size(16 * 1024)
        .connect(&url)
        .await
        .unwrap();

    let chunk = noisy_string(2 * 1024);
    let mut pipeline = client.pipeline();
    for i in 0..64 {
        pipeline.add("set", json!({"name": format!("k{i}"), "value": chunk.clone()}));
    }
    let results = pipeline.execute().await.unwrap();
    assert_eq!(results.len(), 64);

    assert_eq!(
        client.call("get", json!({"name": "k63"})).await.unwrap(),
        json!(chunk)
    );
}
