use cubecache_service::manifest::{Cube, FragmentId};
use cubecache_service::storage::StorageError;
use cubecache_test::BlobServer;

use crate::utils::setup_storage;

/// Tries to read a single fragment of the cube in `container`.
async fn read_fragment(server: &BlobServer, container: &str) -> Result<bytes::Bytes, StorageError> {
    let (storage, _cache) = setup_storage();
    let fragment = FragmentId {
        prefix: "src".into(),
        shape: [64, 64, 64],
        index: [0, 0, 0],
        extension: "f32".into(),
    };

    let cube = Cube::open(&storage, server.url(container)).await?;
    cube.fetch_fragment(&fragment).await
}

#[tokio::test]
async fn test_manifest_missing() {
    let server = BlobServer::new();
    let error = read_fragment(&server, "blobs/cube").await.unwrap_err();

    insta::assert_snapshot!(error.to_string(), @"not found: localhost/blobs/cube/manifest.json");
    assert_eq!(server.accesses(), 1);
}

#[tokio::test]
async fn test_manifest_forbidden() {
    let server = BlobServer::new();
    let error = read_fragment(&server, "respond_statuscode/403/cube").await.unwrap_err();

    insta::assert_snapshot!(error.to_string(), @"permission denied: 403 Forbidden");
    assert_eq!(server.accesses(), 1);
}

#[tokio::test]
async fn test_manifest_unauthorized() {
    let server = BlobServer::new();
    let error = read_fragment(&server, "respond_statuscode/401/cube").await.unwrap_err();

    insta::assert_snapshot!(error.to_string(), @"permission denied: 401 Unauthorized");
    assert_eq!(server.accesses(), 1);
}

#[tokio::test]
async fn test_manifest_server_error() {
    let server = BlobServer::new();
    let error = read_fragment(&server, "respond_statuscode/500/cube").await.unwrap_err();

    insta::assert_snapshot!(error.to_string(), @"internal error");
    assert_eq!(server.accesses(), 1);
}

#[tokio::test]
async fn test_fragment_missing() {
    let server = BlobServer::new();
    server.put(
        "cube/manifest.json",
        r#"{"line-numbers": [], "line-labels": []}"#,
        "\"0x1\"",
    );
    let error = read_fragment(&server, "blobs/cube").await.unwrap_err();

    insta::assert_snapshot!(error.to_string(), @"not found: localhost/blobs/cube/src/64-64-64/0-0-0.f32");
    assert_eq!(
        server.all_hits(),
        [
            ("/blobs/cube/manifest.json".to_owned(), 1),
            ("/blobs/cube/src/64-64-64/0-0-0.f32".to_owned(), 1),
        ]
    );
}
