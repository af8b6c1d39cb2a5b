//! Piece-table behavior: copy-on-write edits, raw table layouts, and model
//! equivalence against a plain vector.

mod common;

use common::{connect, start_server};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use serde_json::{json, Value};
use znsocket::{Client, List, Segments};

async fn seeded(n: i64) -> (Client, List, Segments) {
    let url = start_server().await;
    let client = connect(&url).await;
    let origin = List::new(client.clone(), "origin").await.unwrap();
    let values: Vec<_> = (0..n).map(|i| json!(i).into()).collect();
    origin.extend(values).await.unwrap();
    let segments = Segments::from_list(&origin, "view").await.unwrap();
    (client, origin, segments)
}

fn plain(values: Vec<znsocket::ObjectValue>) -> Vec<Value> {
    values.into_iter().map(|v| v.into_plain()).collect()
}

#[tokio::test]
async fn from_list_covers_the_origin() {
    let (_client, origin, segments) = seeded(5).await;
    assert_eq!(segments.len().await.unwrap(), 5);
    assert_eq!(
        plain(segments.to_vec().await.unwrap()),
        vec![json!(0), json!(1), json!(2), json!(3), json!(4)]
    );
    assert_eq!(
        segments.raw_segments().await.unwrap(),
        vec![(0, 5, origin.key().to_string())]
    );
    assert!(segments.get(10).await.is_err());
}

#[tokio::test]
async fn set_splices_into_three_segments() {
    let (_client, origin, segments) = seeded(5).await;
    let o = origin.key().to_string();
    let v = "znsocket.List:view".to_string();

    segments.set(2, json!("x")).await.unwrap();
    assert_eq!(
        plain(segments.to_vec().await.unwrap()),
        vec![json!(0), json!(1), json!("x"), json!(3), json!(4)]
    );
    assert_eq!(
        segments.raw_segments().await.unwrap(),
        vec![(0, 2, o.clone()), (0, 1, v.clone()), (3, 5, o.clone())]
    );

    segments.set(0, json!("y")).await.unwrap();
    assert_eq!(
        plain(segments.to_vec().await.unwrap()),
        vec![json!("y"), json!(1), json!("x"), json!(3), json!(4)]
    );
    assert_eq!(
        segments.raw_segments().await.unwrap(),
        vec![
            (1, 2, v.clone()),
            (1, 2, o.clone()),
            (0, 1, v.clone()),
            (3, 5, o.clone()),
        ]
    );

    segments.set(4, json!("z")).await.unwrap();
    assert_eq!(
        plain(segments.to_vec().await.unwrap()),
        vec![json!("y"), json!(1), json!("x"), json!(3), json!("z")]
    );
    assert_eq!(
        segments.raw_segments().await.unwrap(),
        vec![
            (1, 2, v.clone()),
            (1, 2, o.clone()),
            (0, 1, v.clone()),
            (3, 4, o.clone()),
            (2, 3, v.clone()),
        ]
    );

    // The origin never changes.
    assert_eq!(
        origin.plain_values().await.unwrap(),
        vec![json!(0), json!(1), json!(2), json!(3), json!(4)]
    );

    assert!(segments.set(10, json!("nope")).await.is_err());
}

#[tokio::test]
async fn delete_splices_out_one_element() {
    let (_client, origin, segments) = seeded(5).await;
    let o = origin.key().to_string();

    segments.delete(2).await.unwrap();
    assert_eq!(
        plain(segments.to_vec().await.unwrap()),
        vec![json!(0), json!(1), json!(3), json!(4)]
    );
    assert_eq!(
        segments.raw_segments().await.unwrap(),
        vec![(0, 2, o.clone()), (3, 5, o.clone())]
    );

    segments.delete(0).await.unwrap();
    assert_eq!(segments.len().await.unwrap(), 3);
    assert_eq!(
        segments.raw_segments().await.unwrap(),
        vec![(1, 2, o.clone()), (3, 5, o.clone())]
    );

    segments.delete(-1).await.unwrap();
    assert_eq!(
        plain(segments.to_vec().await.unwrap()),
        vec![json!(1), json!(3)]
    );
    assert_eq!(
        segments.raw_segments().await.unwrap(),
        vec![(1, 2, o.clone()), (3, 4, o.clone())]
    );

    assert!(segments.delete(10).await.is_err());
}

#[tokio::test]
async fn insert_splits_and_interposes() {
    let (_client, origin, segments) = seeded(5).await;
    let o = origin.key().to_string();
    let v = "znsocket.List:view".to_string();

    segments.insert(2, json!("x")).await.unwrap();
    assert_eq!(
        plain(segments.to_vec().await.unwrap()),
        vec![json!(0), json!(1), json!("x"), json!(2), json!(3), json!(4)]
    );
    assert_eq!(
        segments.raw_segments().await.unwrap(),
        vec![(0, 2, o.clone()), (0, 1, v.clone()), (2, 5, o.clone())]
    );

    segments.insert(0, json!("y")).await.unwrap();
    assert_eq!(
        plain(segments.to_vec().await.unwrap()),
        vec![json!("y"), json!(0), json!(1), json!("x"), json!(2), json!(3), json!(4)]
    );

    // Negative index means "before that element from the end".
    segments.insert(-1, json!("z")).await.unwrap();
    assert_eq!(
        plain(segments.to_vec().await.unwrap()),
        vec![
            json!("y"),
            json!(0),
            json!(1),
            json!("x"),
            json!(2),
            json!(3),
            json!("z"),
            json!(4)
        ]
    );
}

#[tokio::test]
async fn extend_and_push_append_at_the_end() {
    let (_client, _origin, segments) = seeded(5).await;
    segments
        .extend(vec![json!(5).into(), json!(6).into(), json!(7).into()])
        .await
        .unwrap();
    segments.push(json!(8)).await.unwrap();
    assert_eq!(
        plain(segments.to_vec().await.unwrap()),
        (0..9).map(|i| json!(i)).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn origin_stays_untouched_by_every_edit() {
    let (_client, origin, segments) = seeded(5).await;
    segments.set(2, json!("X")).await.unwrap();
    segments.insert(0, json!("Y")).await.unwrap();
    segments.delete(4).await.unwrap();
    segments.push(json!("Z")).await.unwrap();
    assert_eq!(
        origin.plain_values().await.unwrap(),
        vec![json!(0), json!(1), json!(2), json!(3), json!(4)]
    );
}

/// Length always equals the sum of the segment spans.
async fn span_invariant(segments: &Segments) {
    let table = segments.raw_segments().await.unwrap();
    let span_sum: i64 = table.iter().map(|(s, e, _)| (e - s).max(0)).sum();
    assert_eq!(segments.len().await.unwrap() as i64, span_sum);
}

#[derive(Debug, Clone)]
enum Op {
    Set(u8, u8),
    Insert(u8, u8),
    Delete(u8),
    Push(u8),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (any::<u8>(), any::<u8>()).prop_map(|(i, v)| Op::Set(i, v)),
        (any::<u8>(), any::<u8>()).prop_map(|(i, v)| Op::Insert(i, v)),
        any::<u8>().prop_map(Op::Delete),
        any::<u8>().prop_map(Op::Push),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 8, .. ProptestConfig::default() })]

    /// Applying the same edits to the view and to a plain vector produces
    /// the same sequence, while the origin never changes.
    #[test]
    fn behaves_like_a_plain_vector(ops in proptest::collection::vec(op_strategy(), 1..10)) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async move {
            let (_client, origin, segments) = seeded(6).await;
            let mut model: Vec<Value> = (0..6).map(|i| json!(i)).collect();

            for op in ops {
                match op {
                    Op::Set(i, v) => {
                        if model.is_empty() {
                            continue;
                        }
                        let idx = (i as usize) % model.len();
                        model[idx] = json!(v);
                        segments.set(idx as i64, json!(v)).await.unwrap();
                    },
                    Op::Insert(i, v) => {
                        let idx = (i as usize) % (model.len() + 1);
                        model.insert(idx, json!(v));
                        segments.insert(idx as i64, json!(v)).await.unwrap();
                    },
                    Op::Delete(i) => {
                        if model.is_empty() {
                            continue;
                        }
                        let idx = (i as usize) % model.len();
                        model.remove(idx);
                        segments.delete(idx as i64).await.unwrap();
                    },
                    Op::Push(v) => {
                        model.push(json!(v));
                        segments.push(json!(v)).await.unwrap();
                    },
                }
                span_invariant(&segments).await;
            }

            prop_assert_eq!(plain(segments.to_vec().await.unwrap()), model);
            prop_assert_eq!(
                origin.plain_values().await.unwrap(),
                (0..6).map(|i| json!(i)).collect::<Vec<_>>()
            );
            Ok(())
        })?;
    }
}
