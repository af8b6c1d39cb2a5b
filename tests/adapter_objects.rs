//! Adapter behavior: reads served by the owning client, frozen writes,
//! nested adapters, and cleanup on disconnect.

mod common;

use common::{connect, start_server};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use znsocket::{Dict, DictAdapter, List, ListAdapter, Segments, Transformed};

fn sample_mapping() -> HashMap<String, Value> {
    HashMap::from([
        ("a".to_string(), json!(1)),
        ("b".to_string(), json!(2)),
        ("c".to_string(), json!(3)),
    ])
}

#[tokio::test]
async fn dict_adapter_serves_reads_and_freezes_writes() {
    let url = start_server().await;
    let owner = connect(&url).await;
    let _adapter = DictAdapter::new(&owner, "shared", sample_mapping())
        .await
        .unwrap();

    let reader = connect(&url).await;
    let dct = Dict::new(reader, "shared").await.unwrap();

    assert_eq!(dct.len().await.unwrap(), 3);
    let mut keys = dct.keys().await.unwrap();
    keys.sort();
    assert_eq!(keys, vec!["a", "b", "c"]);
    assert_eq!(dct.get("b").await.unwrap().into_plain(), json!(2));
    assert!(dct.contains("c").await.unwrap());
    assert!(!dct.contains("z").await.unwrap());

    let err = dct.set("d", json!(4)).await.unwrap_err();
    assert_eq!(err.to_wire().kind, "FrozenStorageError");

    let err = dct.get("missing").await.unwrap_err();
    assert_eq!(err.to_wire().kind, "KeyError");
}

#[tokio::test]
async fn list_adapter_serves_reads_and_slices() {
    let url = start_server().await;
    let owner = connect(&url).await;
    let data = vec![json!(10), json!(20), json!(30), json!(40)];
    let _adapter = ListAdapter::new(&owner, "readings", data).await.unwrap();

    let reader = connect(&url).await;
    let lst = List::new(reader, "readings").await.unwrap();

    assert_eq!(lst.len().await.unwrap(), 4);
    assert_eq!(lst.get(1).await.unwrap().into_plain(), json!(20));
    assert_eq!(lst.get(-1).await.unwrap().into_plain(), json!(40));
    let tail: Vec<_> = lst
        .slice(Some(1), None, None)
        .await
        .unwrap()
        .into_iter()
        .map(znsocket::ObjectValue::into_plain)
        .collect();
    assert_eq!(tail, vec![json!(20), json!(30), json!(40)]);

    let err = lst.push(json!(50)).await.unwrap_err();
    assert_eq!(err.to_wire().kind, "FrozenStorageError");
    assert!(lst.get(9).await.is_err());
}

#[tokio::test]
async fn adapter_copy_materialises_a_real_list() {
    let url = start_server().await;
    let owner = connect(&url).await;
    let data = vec![json!("a"), json!("b")];
    let _adapter = ListAdapter::new(&owner, "src", data).await.unwrap();

    let reader = connect(&url).await;
    let lst = List::new(reader.clone(), "src").await.unwrap();
    let copy = lst.copy("materialised").await.unwrap();

    assert_eq!(
        copy.plain_values().await.unwrap(),
        vec![json!("a"), json!("b")]
    );
    // The copy is a plain list, writable by anyone.
    copy.push(json!("c")).await.unwrap();
    assert_eq!(copy.len().await.unwrap(), 3);
}

#[tokio::test]
async fn register_adapter_over_existing_data_fails() {
    let url = start_server().await;
    let c = connect(&url).await;
    let lst = List::new(c.clone(), "taken").await.unwrap();
    lst.push(json!(1)).await.unwrap();

    let err = ListAdapter::new(&c, "taken", vec![json!(1)])
        .await
        .unwrap_err();
    assert_eq!(err.to_wire().kind, "KeyError");
}

#[tokio::test]
async fn nested_adapters_via_item_transform() {
    let url = start_server().await;
    let owner = connect(&url).await;
    let rows = vec![
        json!({"name": "John", "age": 30}),
        json!({"name": "Jane", "age": 25}),
    ];
    let transform: znsocket::ItemTransform = std::sync::Arc::new(|item, key, client| {
        Box::pin(async move {
            let Value::Object(map) = item else {
                return Ok(Transformed::Value(item));
            };
            let adapter = DictAdapter::new(&client, &key, map).await?;
            Ok(Transformed::Ref(adapter.key().to_string()))
        })
    });
    let _adapter = ListAdapter::with_transform(&owner, "rows", rows, transform)
        .await
        .unwrap();

    let reader = connect(&url).await;
    let lst = List::new(reader.clone(), "rows").await.unwrap();
    assert_eq!(lst.len().await.unwrap(), 2);

    let row = lst.get(0).await.unwrap().into_dict().expect("nested dict");
    assert_eq!(row.get("name").await.unwrap().into_plain(), json!("John"));

    // The child adapter is registered under the suggested `<parent>:<index>`
    // key and owned by the same socket.
    let child_key = "znsocket.Dict:znsocket.List:rows:0";
    let exists = reader
        .call("adapter_exists", json!({"key": child_key}))
        .await
        .unwrap();
    assert_eq!(exists, json!(true));

    // A second access reuses the child instead of re-registering.
    let row_again = lst.get(0).await.unwrap().into_dict().expect("nested dict");
    assert_eq!(row_again.get("age").await.unwrap().into_plain(), json!(30));
}

#[tokio::test]
async fn disconnect_cleans_up_adapters() {
    let url = start_server().await;
    let owner = connect(&url).await;
    let _adapter = DictAdapter::new(&owner, "ephemeral", sample_mapping())
        .await
        .unwrap();

    let watcher = connect(&url).await;
    let key = "znsocket.Dict:ephemeral";
    assert_eq!(
        watcher.call("adapter_exists", json!({"key": key})).await.unwrap(),
        json!(true)
    );

    owner.close().await;

    // Cleanup happens within a bounded delay of the disconnect.
    let mut exists = json!(true);
    for _ in 0..20 {
        exists = watcher
            .call("adapter_exists", json!({"key": key}))
            .await
            .unwrap();
        if exists == json!(false) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(exists, json!(false));

    // Reads now fail with a missing-key error.
    let err = watcher
        .call("adapter:get", json!({"key": key, "method": "len"}))
        .await
        .unwrap_err();
    assert_eq!(err.to_wire().kind, "KeyError");
}

#[tokio::test]
async fn segments_over_an_adapter_origin() {
    let url = start_server().await;
    let owner = connect(&url).await;
    let data = vec![json!(0), json!(1), json!(2), json!(3), json!(4)];
    let _adapter = ListAdapter::new(&owner, "frames", data).await.unwrap();

    let reader = connect(&url).await;
    let origin = List::new(reader.clone(), "frames").await.unwrap();
    let view = Segments::from_list(&origin, "edited").await.unwrap();

    assert_eq!(view.len().await.unwrap(), 5);
    view.set(2, json!("X")).await.unwrap();
    let values: Vec<_> = view
        .to_vec()
        .await
        .unwrap()
        .into_iter()
        .map(znsocket::ObjectValue::into_plain)
        .collect();
    assert_eq!(
        values,
        vec![json!(0), json!(1), json!("X"), json!(3), json!(4)]
    );
    // The adapter-backed origin still reads the original data.
    assert_eq!(origin.get(2).await.unwrap().into_plain(), json!(2));
}

#[tokio::test]
async fn unknown_adapter_method_is_not_implemented() {
    let url = start_server().await;
    let owner = connect(&url).await;
    let _adapter = DictAdapter::new(&owner, "d", sample_mapping()).await.unwrap();

    let reader = connect(&url).await;
    let err = reader
        .call(
            "adapter:get",
            json!({"key": "znsocket.Dict:d", "method": "reverse"}),
        )
        .await
        .unwrap_err();
    assert_eq!(err.to_wire().kind, "NotImplementedError");
}
