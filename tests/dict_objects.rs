//! Distributed dict behavior over a live server.

mod common;

use common::{connect, start_server};
use pretty_assertions::assert_eq;
use serde_json::{json, Map, Value};
use znsocket::{Dict, FallbackPolicy, List, ObjectRef};

#[tokio::test]
async fn set_get_del_round_trip() {
    let url = start_server().await;
    let client = connect(&url).await;
    let dct = Dict::new(client, "d").await.unwrap();

    dct.set("a", json!(1)).await.unwrap();
    dct.set("b", json!("two")).await.unwrap();
    assert_eq!(dct.len().await.unwrap(), 2);
    assert_eq!(dct.get("a").await.unwrap().into_plain(), json!(1));
    assert!(dct.contains("b").await.unwrap());

    dct.del("a").await.unwrap();
    assert!(!dct.contains("a").await.unwrap());
    let err = dct.get("a").await.unwrap_err();
    assert_eq!(err.to_wire().kind, "KeyError");
    let err = dct.del("a").await.unwrap_err();
    assert_eq!(err.to_wire().kind, "KeyError");
}

#[tokio::test]
async fn get_or_returns_default() {
    let url = start_server().await;
    let client = connect(&url).await;
    let dct = Dict::new(client, "d").await.unwrap();

    let value = dct.get_or("missing", json!("fallback")).await.unwrap();
    assert_eq!(value.into_plain(), json!("fallback"));
}

#[tokio::test]
async fn keys_values_items_agree() {
    let url = start_server().await;
    let client = connect(&url).await;
    let dct = Dict::new(client, "d").await.unwrap();

    dct.update(vec![
        ("a".to_string(), ObjectRef::Value(json!(1))),
        ("b".to_string(), ObjectRef::Value(json!(2))),
    ])
    .await
    .unwrap();

    let mut keys = dct.keys().await.unwrap();
    keys.sort();
    assert_eq!(keys, vec!["a", "b"]);

    let mut items: Vec<(String, Value)> = dct
        .items()
        .await
        .unwrap()
        .into_iter()
        .map(|(k, v)| (k, v.into_plain()))
        .collect();
    items.sort_by(|x, y| x.0.cmp(&y.0));
    assert_eq!(items, vec![("a".to_string(), json!(1)), ("b".to_string(), json!(2))]);

    assert_eq!(dct.values().await.unwrap().len(), 2);
}

#[tokio::test]
async fn hgetall_equality_matches_mapping() {
    let url = start_server().await;
    let client = connect(&url).await;
    let dct = Dict::new(client, "d").await.unwrap();
    dct.set("x", json!(10)).await.unwrap();

    let mut expected = Map::new();
    expected.insert("x".to_string(), json!(10));
    assert!(dct.eq_map(&expected).await.unwrap());
}

#[tokio::test]
async fn union_prefers_other() {
    let url = start_server().await;
    let client = connect(&url).await;
    let dct = Dict::new(client, "d").await.unwrap();
    dct.set("a", json!(1)).await.unwrap();
    dct.set("b", json!(2)).await.unwrap();

    let mut other = Map::new();
    other.insert("b".to_string(), json!(20));
    other.insert("c".to_string(), json!(30));
    let merged = dct.union(&other).await.unwrap();
    assert_eq!(merged.get("a"), Some(&json!(1)));
    assert_eq!(merged.get("b"), Some(&json!(20)));
    assert_eq!(merged.get("c"), Some(&json!(30)));
    // The dict itself is unchanged.
    assert_eq!(dct.get("b").await.unwrap().into_plain(), json!(2));
}

#[tokio::test]
async fn nested_references_rehydrate() {
    let url = start_server().await;
    let client = connect(&url).await;
    let dct = Dict::new(client.clone(), "d").await.unwrap();
    let lst = List::new(client.clone(), "l").await.unwrap();
    lst.push(json!("x")).await.unwrap();

    dct.set("data", &lst).await.unwrap();
    let nested = dct.get("data").await.unwrap().into_list().expect("nested list");
    assert_eq!(nested.get(0).await.unwrap().into_plain(), json!("x"));
}

#[tokio::test]
async fn self_reference_is_rejected() {
    let url = start_server().await;
    let client = connect(&url).await;
    let dct = Dict::new(client, "d").await.unwrap();
    let err = dct.set("me", &dct).await.unwrap_err();
    assert!(matches!(err, znsocket::Error::SelfReference));
}

#[tokio::test]
async fn copy_is_independent(){
    let url = start_server().await;
    let client = connect(&url).await;
    let dct = Dict::new(client.clone(), "orig").await.unwrap();
    dct.set("a", json!(1)).await.unwrap();

    let copy = dct.copy("dup").await.unwrap();
    copy.set("b", json!(2)).await.unwrap();
    assert_eq!(dct.len().await.unwrap(), 1);
    assert_eq!(copy.len().await.unwrap(), 2);
}

#[tokio::test]
async fn frozen_fallback_reads_through_and_rejects_writes() {
    let url = start_server().await;
    let client = connect(&url).await;
    let source = Dict::new(client.clone(), "source").await.unwrap();
    source.set("a", json!(1)).await.unwrap();

    let view = Dict::builder(client.clone(), "view")
        .fallback("source")
        .fallback_policy(FallbackPolicy::Frozen)
        .build()
        .await
        .unwrap();

    assert_eq!(view.len().await.unwrap(), 1);
    assert_eq!(view.get("a").await.unwrap().into_plain(), json!(1));
    assert!(view.contains("a").await.unwrap());
    let err = view.set("b", json!(2)).await.unwrap_err();
    assert_eq!(err.to_wire().kind, "FrozenStorageError");
}

#[tokio::test]
async fn copy_fallback_materialises_once() {
    let url = start_server().await;
    let client = connect(&url).await;
    let source = Dict::new(client.clone(), "source").await.unwrap();
    source.set("a", json!(1)).await.unwrap();

    let view = Dict::builder(client.clone(), "view")
        .fallback("source")
        .fallback_policy(FallbackPolicy::Copy)
        .build()
        .await
        .unwrap();

    view.set("b", json!(2)).await.unwrap();
    assert_eq!(view.len().await.unwrap(), 2);
    assert_eq!(source.len().await.unwrap(), 1);
}
