use std::sync::Arc;

use serde_json::{json, Value as JsonValue};

use firestore_emulator::model::DatabaseId;
use firestore_emulator::remote::FirestoreRpc;
use firestore_emulator::watch::{DocumentChangeKind, ListenerEvent};
use firestore_emulator::EmulatorDatabase;

const ROOT: &str = "projects/demo/databases/(default)/documents";

fn database() -> Arc<EmulatorDatabase> {
    EmulatorDatabase::new(DatabaseId::new("demo", "(default)"))
}

fn name(path: &str) -> String {
    format!("{ROOT}/{path}")
}

async fn set(db: &EmulatorDatabase, path: &str, n: i64) {
    db.commit(json!({
        "writes": [{
            "update": {
                "name": name(path),
                "fields": { "n": { "integerValue": n.to_string() } }
            }
        }]
    }))
    .await
    .unwrap();
}

async fn delete(db: &EmulatorDatabase, path: &str) {
    db.commit(json!({ "writes": [{ "delete": name(path) }] }))
        .await
        .unwrap();
}

fn add_cities_query(stream: &firestore_emulator::remote::ListenStream, target_id: i64) {
    stream
        .request(&json!({
            "addTarget": {
                "targetId": target_id,
                "query": {
                    "parent": ROOT,
                    "structuredQuery": {
                        "from": [{ "collectionId": "cities" }],
                        "orderBy": [{ "field": { "fieldPath": "n" } }]
                    }
                }
            }
        }))
        .unwrap();
}

fn frame_kind(frame: &JsonValue) -> &'static str {
    if frame.get("targetChange").is_some() {
        "targetChange"
    } else if frame.get("documentChange").is_some() {
        "documentChange"
    } else if frame.get("documentDelete").is_some() {
        "documentDelete"
    } else if frame.get("documentRemove").is_some() {
        "documentRemove"
    } else {
        "unknown"
    }
}

#[tokio::test]
async fn wire_frames_follow_the_listen_protocol() {
    let db = database();
    set(&db, "cities/a", 1).await;

    let stream = db.listen().await.unwrap();
    add_cities_query(&stream, 1);

    // ADD, then the initial snapshot, then CURRENT.
    let add = stream.next_response().await.unwrap();
    assert_eq!(add["targetChange"]["targetChangeType"], json!("ADD"));
    assert_eq!(add["targetChange"]["targetIds"], json!([1]));

    let change = stream.next_response().await.unwrap();
    assert_eq!(frame_kind(&change), "documentChange");
    assert_eq!(
        change["documentChange"]["document"]["name"],
        json!(name("cities/a"))
    );
    assert_eq!(change["documentChange"]["targetIds"], json!([1]));

    let current = stream.next_response().await.unwrap();
    assert_eq!(current["targetChange"]["targetChangeType"], json!("CURRENT"));

    // A later commit produces a documentChange plus the global NO_CHANGE
    // watermark.
    set(&db, "cities/b", 2).await;
    let frames: Vec<JsonValue> = stream.drain_responses();
    let kinds: Vec<&str> = frames.iter().map(frame_kind).collect();
    assert_eq!(kinds, vec!["documentChange", "targetChange", "targetChange"]);
    assert_eq!(
        frames[1]["targetChange"]["targetChangeType"],
        json!("CURRENT")
    );
    assert_eq!(
        frames[2]["targetChange"]["targetChangeType"],
        json!("NO_CHANGE")
    );
    assert!(frames[2]["targetChange"]["readTime"].is_string());
}

#[tokio::test]
async fn deletion_emits_document_delete_frame() {
    let db = database();
    set(&db, "cities/a", 1).await;
    let stream = db.listen().await.unwrap();
    add_cities_query(&stream, 1);
    stream.drain_responses();

    delete(&db, "cities/a").await;
    let frames = stream.drain_responses();
    assert_eq!(frame_kind(&frames[0]), "documentDelete");
    assert_eq!(
        frames[0]["documentDelete"]["document"],
        json!(name("cities/a"))
    );
    assert_eq!(
        frames[0]["documentDelete"]["removedTargetIds"],
        json!([1])
    );
}

#[tokio::test]
async fn window_eviction_emits_document_remove_frame() {
    let db = database();
    set(&db, "cities/m", 10).await;
    set(&db, "cities/n", 20).await;

    let stream = db.listen().await.unwrap();
    stream
        .request(&json!({
            "addTarget": {
                "targetId": 1,
                "query": {
                    "parent": ROOT,
                    "structuredQuery": {
                        "from": [{ "collectionId": "cities" }],
                        "orderBy": [{ "field": { "fieldPath": "n" } }],
                        "limit": 2
                    }
                }
            }
        }))
        .unwrap();
    stream.drain_responses();

    // The new smallest value enters the window; the old tail is evicted but
    // still exists, so the wire says documentRemove rather than delete.
    set(&db, "cities/a", 5).await;
    let frames = stream.drain_responses();
    let kinds: Vec<&str> = frames.iter().map(frame_kind).collect();
    assert_eq!(
        kinds,
        vec!["documentRemove", "documentChange", "targetChange", "targetChange"]
    );
    assert_eq!(
        frames[0]["documentRemove"]["document"],
        json!(name("cities/n"))
    );
    assert_eq!(
        frames[1]["documentChange"]["document"]["name"],
        json!(name("cities/a"))
    );
}

#[tokio::test]
async fn limit_window_keeps_exactly_two_in_order() {
    let db = database();
    set(&db, "cities/m", 10).await;
    set(&db, "cities/n", 20).await;

    let stream = db.listen().await.unwrap();
    stream
        .request(&json!({
            "addTarget": {
                "targetId": 5,
                "query": {
                    "parent": ROOT,
                    "structuredQuery": {
                        "from": [{ "collectionId": "cities" }],
                        "orderBy": [{ "field": { "fieldPath": "n" } }],
                        "limit": 2
                    }
                }
            }
        }))
        .unwrap();
    stream.session().drain_events();

    set(&db, "cities/a", 5).await;
    let events = stream.session().drain_events();
    let mut added = Vec::new();
    let mut removed = Vec::new();
    for event in &events {
        if let ListenerEvent::Changes { changes, .. } = event {
            for change in changes {
                match change.kind {
                    DocumentChangeKind::Added => {
                        added.push((change.document.path(), change.old_index, change.new_index))
                    }
                    DocumentChangeKind::Removed => {
                        removed.push((change.document.path(), change.old_index, change.new_index))
                    }
                    DocumentChangeKind::Modified => panic!("no modification expected"),
                }
            }
        }
    }
    assert_eq!(added, vec![("cities/a".to_string(), -1, 0)]);
    assert_eq!(removed, vec![("cities/n".to_string(), 1, -1)]);

    // The window still holds exactly two documents in ascending order.
    let results = db
        .run_query(json!({
            "parent": ROOT,
            "structuredQuery": {
                "from": [{ "collectionId": "cities" }],
                "orderBy": [{ "field": { "fieldPath": "n" } }],
                "limit": 2
            }
        }))
        .await
        .unwrap();
    let names: Vec<&str> = results
        .iter()
        .filter_map(|r| r["document"]["name"].as_str())
        .collect();
    assert_eq!(names, vec![name("cities/a").as_str(), name("cities/m").as_str()]);
}

#[tokio::test]
async fn document_targets_listen_by_name() {
    let db = database();
    let stream = db.listen().await.unwrap();
    stream
        .request(&json!({
            "addTarget": {
                "targetId": 3,
                "documents": { "documents": [name("cities/a")] }
            }
        }))
        .unwrap();
    stream.drain_responses();

    // Unrelated path: nothing for this target.
    set(&db, "cities/b", 1).await;
    assert!(stream.drain_responses().is_empty());

    set(&db, "cities/a", 1).await;
    let frames = stream.drain_responses();
    assert_eq!(frame_kind(&frames[0]), "documentChange");
}

#[tokio::test]
async fn remove_target_stops_deliveries() {
    let db = database();
    let stream = db.listen().await.unwrap();
    add_cities_query(&stream, 4);
    stream.drain_responses();

    stream.request(&json!({ "removeTarget": 4 })).unwrap();
    let frames = stream.drain_responses();
    assert_eq!(frames[0]["targetChange"]["targetChangeType"], json!("REMOVE"));

    set(&db, "cities/a", 1).await;
    assert!(stream.drain_responses().is_empty());
}

#[tokio::test]
async fn server_assigned_ids_must_not_mix_with_client_ids() {
    let db = database();
    let stream = db.listen().await.unwrap();
    stream
        .request(&json!({
            "addTarget": {
                "query": {
                    "parent": ROOT,
                    "structuredQuery": { "from": [{ "collectionId": "cities" }] }
                }
            }
        }))
        .unwrap();
    let add = stream.next_response().await.unwrap();
    assert_eq!(add["targetChange"]["targetChangeType"], json!("ADD"));
    assert_eq!(add["targetChange"]["targetIds"], json!([2]));

    add_cities_query(&stream, 9);
    let frames = stream.drain_responses();
    let removal = frames
        .iter()
        .find(|f| f["targetChange"]["targetChangeType"] == json!("REMOVE"))
        .unwrap();
    assert_eq!(removal["targetChange"]["targetIds"], json!([9]));
    assert_eq!(removal["targetChange"]["cause"]["code"], json!(3));
}

#[tokio::test]
async fn invalid_listen_query_errors_on_the_stream() {
    let db = database();
    let stream = db.listen().await.unwrap();
    stream
        .request(&json!({
            "addTarget": {
                "targetId": 1,
                "query": {
                    "parent": ROOT,
                    "structuredQuery": {
                        "from": [{ "collectionId": "cities" }],
                        "where": {
                            "fieldFilter": {
                                "field": { "fieldPath": "tags" },
                                "op": "ARRAY_CONTAINS",
                                "value": { "nullValue": null }
                            }
                        }
                    }
                }
            }
        }))
        .unwrap();

    let frame = stream.next_response().await.unwrap();
    assert_eq!(frame["targetChange"]["targetChangeType"], json!("REMOVE"));
    assert_eq!(frame["targetChange"]["cause"]["code"], json!(3));
}

#[tokio::test]
async fn modifications_report_old_and_new_indices() {
    let db = database();
    set(&db, "cities/a", 1).await;
    set(&db, "cities/b", 2).await;

    let stream = db.listen().await.unwrap();
    add_cities_query(&stream, 1);
    stream.session().drain_events();

    // Bump a's value above b's so the relative order flips.
    set(&db, "cities/a", 9).await;
    let events = stream.session().drain_events();
    let mut modified = Vec::new();
    for event in &events {
        if let ListenerEvent::Changes { changes, .. } = event {
            for change in changes {
                if change.kind == DocumentChangeKind::Modified {
                    modified.push((change.document.path(), change.old_index, change.new_index));
                }
            }
        }
    }
    assert_eq!(modified, vec![("cities/a".to_string(), 0, 1)]);
}

#[tokio::test]
async fn blocking_reader_sees_frames_without_a_runtime() {
    let db = database();
    set(&db, "cities/a", 1).await;
    let stream = db.listen().await.unwrap();
    add_cities_query(&stream, 1);

    let frame = stream.next_response_blocking().unwrap();
    assert_eq!(frame["targetChange"]["targetChangeType"], json!("ADD"));
}
