use cubecache_service::manifest::{Cube, FragmentId, blob_url};
use cubecache_service::storage::{StorageClient, StorageError};
use cubecache_test::BlobServer;

use crate::utils::{setup_storage, wait_until_cached};

const MANIFEST: &str = r#"{
    "data": [{"file-extension": "f32", "shapes": [[64, 64, 64]], "prefix": "src"}],
    "attributes": [],
    "line-numbers": [[1, 2], [1, 2], [0, 4]],
    "line-labels": ["inline", "crossline", "time"]
}"#;

fn fragments() -> Vec<FragmentId> {
    (0..4)
        .map(|i| FragmentId {
            prefix: "src".into(),
            shape: [64, 64, 64],
            index: [i, 0, 0],
            extension: "f32".into(),
        })
        .collect()
}

fn cube_server() -> BlobServer {
    let server = BlobServer::new();
    server.put("cube/manifest.json", MANIFEST, "\"0x10\"");
    for id in fragments() {
        let content = format!("samples of {}", id.path());
        server.put(&format!("cube/{}", id.path()), content, &format!("\"{}\"", id.index[0]));
    }
    server
}

#[tokio::test]
async fn test_warm_reads_revalidate() {
    let (storage, cache) = setup_storage();
    let server = cube_server();
    let container = server.blob_url("cube");

    let cube = Cube::open(&storage, container.clone()).await.unwrap();
    let cold = cube.fetch_fragments(&fragments()).await.unwrap();

    let paths = fragments().iter().map(FragmentId::path).collect::<Vec<_>>();
    for path in paths.iter().map(String::as_str).chain(["manifest.json"]) {
        let url = blob_url(&container, path).unwrap();
        wait_until_cached(cache.as_ref(), &url).await;
    }
    let cold_requests = server.requests();
    assert_eq!(cold_requests.len(), 5);
    assert!(cold_requests.iter().all(|r| r.if_none_match.is_none()));

    let cube = Cube::open(&storage, container).await.unwrap();
    let warm = cube.fetch_fragments(&fragments()).await.unwrap();
    assert_eq!(cold, warm);
    assert_eq!(&warm[2][..], b"samples of src/64-64-64/2-0-0.f32");

    let warm_requests = server.requests();
    assert_eq!(warm_requests.len(), 5);
    assert!(warm_requests.iter().all(|r| r.if_none_match.is_some()));
}

#[tokio::test]
async fn test_modified_blob_is_refused() {
    let (storage, cache) = setup_storage();
    let server = cube_server();
    let container = server.blob_url("cube");

    let manifest = blob_url(&container, "manifest.json").unwrap();
    storage.get(&manifest).await.unwrap();
    wait_until_cached(cache.as_ref(), &manifest).await;

    server.put("cube/manifest.json", "{}", "\"0x11\"");

    let result = Cube::open(&storage, container).await;
    assert_eq!(result.unwrap_err(), StorageError::InternalError);
}

#[tokio::test]
async fn test_cache_shared_across_tokens() {
    let (storage, cache) = setup_storage();
    let server = cube_server();

    let mut first = server.blob_url("cube");
    first.set_query(Some("sig=first"));
    let mut second = server.blob_url("cube");
    second.set_query(Some("sig=second"));

    Cube::open(&storage, first.clone()).await.unwrap();
    wait_until_cached(cache.as_ref(), &blob_url(&first, "manifest.json").unwrap()).await;
    Cube::open(&storage, second).await.unwrap();

    assert_eq!(
        server.all_hits(),
        [("/blobs/cube/manifest.json".to_owned(), 2)]
    );
}
