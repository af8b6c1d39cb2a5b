//! End-to-end storage command tests over a real server and socket.

mod common;

use common::{connect, start_server};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

#[tokio::test]
async fn list_push_and_range() {
    let url = start_server().await;
    let c = connect(&url).await;

    assert_eq!(
        c.call("rpush", json!({"name": "L", "value": "a"})).await.unwrap(),
        json!(1)
    );
    assert_eq!(
        c.call("rpush", json!({"name": "L", "value": "b"})).await.unwrap(),
        json!(2)
    );
    assert_eq!(c.call("llen", json!({"name": "L"})).await.unwrap(), json!(2));
    assert_eq!(
        c.call("lrange", json!({"name": "L", "start": 0, "end": -1}))
            .await
            .unwrap(),
        json!(["a", "b"])
    );
}

#[tokio::test]
async fn lpush_reverses_prefix() {
    let url = start_server().await;
    let c = connect(&url).await;

    for v in ["a", "b", "c"] {
        c.call("lpush", json!({"name": "L", "value": v})).await.unwrap();
    }
    assert_eq!(
        c.call("lrange", json!({"name": "L", "start": 0, "end": -1}))
            .await
            .unwrap(),
        json!(["c", "b", "a"])
    );
}

#[tokio::test]
async fn hash_lifecycle() {
    let url = start_server().await;
    let c = connect(&url).await;

    c.call("hset", json!({"name": "H", "key": "f", "value": "v"}))
        .await
        .unwrap();
    assert_eq!(
        c.call("hget", json!({"name": "H", "key": "f"})).await.unwrap(),
        json!("v")
    );
    assert_eq!(
        c.call("hdel", json!({"name": "H", "key": "f"})).await.unwrap(),
        json!(1)
    );
    assert_eq!(
        c.call("hget", json!({"name": "H", "key": "f"})).await.unwrap(),
        Value::Null
    );
    // Removing the last field removed the key itself.
    assert_eq!(c.call("exists", json!({"name": "H"})).await.unwrap(), json!(0));
}

#[tokio::test]
async fn scalars_round_trip_as_strings() {
    let url = start_server().await;
    let c = connect(&url).await;

    for (value, expected) in [
        (json!("text"), json!("text")),
        (json!(7), json!("7")),
        (json!(1.25), json!("1.25")),
    ] {
        c.call("set", json!({"name": "k", "value": value})).await.unwrap();
        assert_eq!(c.call("get", json!({"name": "k"})).await.unwrap(), expected);
        c.call("delete", json!({"name": "k"})).await.unwrap();
    }
}

#[tokio::test]
async fn compound_values_are_rejected() {
    let url = start_server().await;
    let c = connect(&url).await;

    for value in [json!(true), json!([1]), json!({"a": 1})] {
        let err = c
            .call("set", json!({"name": "k", "value": value}))
            .await
            .unwrap_err();
        assert_eq!(err.to_wire().kind, "DataError");
    }
}

#[tokio::test]
async fn incr_and_wrongtype_errors() {
    let url = start_server().await;
    let c = connect(&url).await;

    assert_eq!(c.call("incr", json!({"name": "n"})).await.unwrap(), json!(1));
    assert_eq!(
        c.call("incr", json!({"name": "n", "amount": 9})).await.unwrap(),
        json!(10)
    );
    assert_eq!(c.call("decr", json!({"name": "n"})).await.unwrap(), json!(9));

    c.call("set", json!({"name": "t", "value": "abc"})).await.unwrap();
    let err = c.call("incr", json!({"name": "t"})).await.unwrap_err();
    assert!(err.to_string().contains("not an integer"));

    c.call("rpush", json!({"name": "L", "value": "a"})).await.unwrap();
    let err = c.call("get", json!({"name": "L"})).await.unwrap_err();
    assert!(err.to_string().starts_with("WRONGTYPE"));
}

#[tokio::test]
async fn copy_leaves_source_untouched() {
    let url = start_server().await;
    let c = connect(&url).await;

    for v in ["a", "b"] {
        c.call("rpush", json!({"name": "src", "value": v})).await.unwrap();
    }
    assert_eq!(
        c.call("copy", json!({"src": "src", "dst": "dst"})).await.unwrap(),
        json!(true)
    );
    c.call("rpush", json!({"name": "dst", "value": "c"})).await.unwrap();
    assert_eq!(
        c.call("lrange", json!({"name": "src", "start": 0, "end": -1}))
            .await
            .unwrap(),
        json!(["a", "b"])
    );
    // A second copy onto the same destination fails.
    assert_eq!(
        c.call("copy", json!({"src": "src", "dst": "dst"})).await.unwrap(),
        json!(false)
    );
}

#[tokio::test]
async fn lrem_removes_all_occurrences() {
    let url = start_server().await;
    let c = connect(&url).await;

    for v in ["x", "a", "x", "x", "b"] {
        c.call("rpush", json!({"name": "L", "value": v})).await.unwrap();
    }
    assert_eq!(
        c.call("lrem", json!({"name": "L", "count": 0, "value": "x"}))
            .await
            .unwrap(),
        json!(3)
    );
    assert_eq!(c.call("llen", json!({"name": "L"})).await.unwrap(), json!(2));
}

#[tokio::test]
async fn lindex_null_index_is_data_error() {
    let url = start_server().await;
    let c = connect(&url).await;

    let err = c
        .call("lindex", json!({"name": "L", "index": null}))
        .await
        .unwrap_err();
    assert_eq!(err.to_wire().kind, "DataError");
}

#[tokio::test]
async fn set_with_expiry_disappears() {
    let url = start_server().await;
    let c = connect(&url).await;

    c.call("set", json!({"name": "k", "value": "v", "ex": 0}))
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    assert_eq!(c.call("get", json!({"name": "k"})).await.unwrap(), Value::Null);
    assert_eq!(c.call("exists", json!({"name": "k"})).await.unwrap(), json!(0));
}

#[tokio::test]
async fn set_nx_returns_null_when_guard_fails() {
    let url = start_server().await;
    let c = connect(&url).await;

    assert_eq!(
        c.call("set", json!({"name": "k", "value": "v", "nx": true}))
            .await
            .unwrap(),
        json!(true)
    );
    assert_eq!(
        c.call("set", json!({"name": "k", "value": "w", "nx": true}))
            .await
            .unwrap(),
        Value::Null
    );
    assert_eq!(c.call("get", json!({"name": "k"})).await.unwrap(), json!("v"));
}

#[tokio::test]
async fn flushall_clears_the_store() {
    let url = start_server().await;
    let c = connect(&url).await;

    c.call("set", json!({"name": "k", "value": "v"})).await.unwrap();
    c.call("sadd", json!({"name": "s", "value": "m"})).await.unwrap();
    c.flushall().await.unwrap();
    assert_eq!(c.call("exists", json!({"name": "k"})).await.unwrap(), json!(0));
    assert_eq!(c.call("scard", json!({"name": "s"})).await.unwrap(), json!(0));
}

#[tokio::test]
async fn two_servers_are_isolated() {
    // Storage is per-instance state, not process-global.
    let url_a = start_server().await;
    let url_b = start_server().await;
    let a = connect(&url_a).await;
    let b = connect(&url_b).await;

    a.call("set", json!({"name": "k", "value": "from-a"})).await.unwrap();
    assert_eq!(b.call("get", json!({"name": "k"})).await.unwrap(), Value::Null);
}
