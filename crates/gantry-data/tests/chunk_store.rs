use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use futures::{StreamExt, TryStreamExt, stream};
use gantry_common::types::{ByteRange, KeyContext};
use gantry_data::DataDriver;
use gantry_data::chunk::{ChunkStoreBackend, ChunkStoreConfig};
use tokio::sync::Mutex;

type Store = Arc<Mutex<HashMap<String, Bytes>>>;

async fn put_chunk(
    State(store): State<Store>,
    Path(key): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<usize>().ok());
    if declared != Some(body.len()) {
        return StatusCode::BAD_REQUEST;
    }
    store.lock().await.insert(key, body);
    StatusCode::OK
}

async fn get_chunk(
    State(store): State<Store>,
    Path(key): Path<String>,
    headers: HeaderMap,
) -> axum::response::Response {
    let Some(data) = store.lock().await.get(&key).cloned() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let range = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("bytes="))
        .and_then(|value| value.split_once('-'))
        .and_then(|(start, end)| Some((start.parse::<usize>().ok()?, end.parse::<usize>().ok()?)));
    match range {
        Some((start, end)) => {
            let end = end.min(data.len() - 1);
            (StatusCode::PARTIAL_CONTENT, data.slice(start..=end)).into_response()
        }
        None => (StatusCode::OK, data).into_response(),
    }
}

async fn delete_chunk(State(store): State<Store>, Path(key): Path<String>) -> StatusCode {
    match store.lock().await.remove(&key) {
        Some(_) => StatusCode::OK,
        None => StatusCode::NOT_FOUND,
    }
}

async fn spawn_chunk_server() -> (String, Store) {
    let store: Store = Arc::default();
    let app = Router::new()
        .route("/proxy/arc/.conf", get(|| async { "{}" }))
        .route(
            "/proxy/arc/{key}",
            get(get_chunk).put(put_chunk).delete(delete_chunk),
        )
        .with_state(store.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr.to_string(), store)
}

fn body(parts: &[&'static str]) -> gantry_common::ByteStream {
    let chunks: Vec<std::io::Result<Bytes>> = parts
        .iter()
        .map(|part| Ok(Bytes::from_static(part.as_bytes())))
        .collect();
    stream::iter(chunks).boxed()
}

#[tokio::test]
async fn chunk_store_put_get_delete() {
    let (addr, store) = spawn_chunk_server().await;
    let backend = ChunkStoreBackend::new(&ChunkStoreConfig::new(vec![addr])).unwrap();
    let ctx = KeyContext::new("bucket", "owner", "ns");

    let key = backend
        .put(body(&["I am ", "a body"]), 11, &ctx, "req")
        .await
        .unwrap();
    assert_eq!(key.len(), 40);
    assert_eq!(
        store.lock().await.get(&key).map(|b| b.to_vec()),
        Some(b"I am a body".to_vec())
    );

    let whole: Vec<Bytes> = backend.get(&key, None, "req").await.unwrap().try_collect().await.unwrap();
    assert_eq!(whole.concat(), b"I am a body");

    let range = ByteRange::new(5, 10).unwrap();
    let ranged: Vec<Bytes> = backend
        .get(&key, Some(range), "req")
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(ranged.concat(), b"a body");

    backend.delete(&key, "req").await.unwrap();
    assert!(backend.delete(&key, "req").await.unwrap_err().is_not_found());
    assert!(matches!(backend.get(&key, None, "req").await, Err(err) if err.is_not_found()));
}

#[tokio::test]
async fn chunk_store_healthcheck() {
    let (addr, _store) = spawn_chunk_server().await;
    let backend = ChunkStoreBackend::new(&ChunkStoreConfig::new(vec![addr])).unwrap();
    assert!(backend.healthcheck("req").await.is_ok());

    let unreachable = ChunkStoreBackend::new(&ChunkStoreConfig::new(vec![
        "127.0.0.1:1".to_string(),
    ]))
    .unwrap();
    assert!(!unreachable.healthcheck("req").await.is_ok());
}
