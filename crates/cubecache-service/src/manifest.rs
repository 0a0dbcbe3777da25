//! Cubes, and the manifest that gates access to them.
//!
//! A cube lives in a blob container, addressed by a URL that may carry an access token in its
//! query string. The container holds the cube's `manifest.json` and the fragments of its volumes
//! and attributes.
//!
//! Reading the manifest doubles as the authorization check for the whole cube: a caller who cannot
//! read the manifest must not read any of the fragments. This is enforced by the types, as
//! fragments can only be fetched through a [`Cube`], and the only way to get a `Cube` is to
//! [`open`](Cube::open) it, which reads and parses the manifest first.

use std::fmt;

use bytes::Bytes;
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::storage::{StorageClient, StorageError};

/// Name of the manifest blob within a cube's container.
pub const MANIFEST_BLOB: &str = "manifest.json";

/// Creates the URL of the blob at `path` within `container`.
///
/// The query of `container`, if any, is kept. Fails for URLs that cannot have a path.
pub fn blob_url(container: &Url, path: &str) -> Result<Url, StorageError> {
    let mut url = container.clone();
    match url.path_segments_mut() {
        Ok(mut segments) => {
            segments
                .pop_if_empty()
                .extend(path.split('/').filter(|s| !s.is_empty()));
        }
        Err(()) => {
            tracing::error!("Container `{}` cannot hold blobs", container.scheme());
            return Err(StorageError::InternalError);
        }
    }
    Ok(url)
}

/// The description of a cube, stored next to its fragments.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Manifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format_version: Option<u32>,
    /// The volumes with the cube's samples, usually in different fragment shapes.
    #[serde(default)]
    pub data: Vec<Volume>,
    /// Surfaces attached to the cube, like coordinates.
    #[serde(default)]
    pub attributes: Vec<Attribute>,
    /// The line numbers of each dimension.
    pub line_numbers: Vec<Vec<i64>>,
    /// The names of the dimensions.
    pub line_labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utm_to_lineno: Option<Vec<Vec<f64>>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Volume {
    pub file_extension: String,
    /// The fragment shapes this volume is available in.
    pub shapes: Vec<[u32; 3]>,
    pub prefix: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
}

impl Volume {
    /// Identifies the fragment at `index` when the volume is split into fragments of `shape`.
    pub fn fragment(&self, shape: [u32; 3], index: [u32; 3]) -> FragmentId {
        FragmentId {
            prefix: self.prefix.clone(),
            shape,
            index,
            extension: self.file_extension.clone(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Attribute {
    #[serde(rename = "type")]
    pub ty: String,
    pub layout: String,
    pub file_extension: String,
    pub labels: Vec<String>,
    pub shapes: Vec<[u32; 3]>,
    pub prefix: String,
}

impl Attribute {
    /// Identifies the fragment at `index` when the attribute is split into fragments of `shape`.
    pub fn fragment(&self, shape: [u32; 3], index: [u32; 3]) -> FragmentId {
        FragmentId {
            prefix: self.prefix.clone(),
            shape,
            index,
            extension: self.file_extension.clone(),
        }
    }
}

/// Identifies a single fragment blob within a cube's container.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FragmentId {
    pub prefix: String,
    pub shape: [u32; 3],
    pub index: [u32; 3],
    pub extension: String,
}

impl FragmentId {
    /// The path of the fragment blob, relative to the container.
    ///
    /// For example `src/64-64-64/0-1-2.f32`.
    pub fn path(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for FragmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [s0, s1, s2] = self.shape;
        let [i0, i1, i2] = self.index;
        write!(
            f,
            "{}/{s0}-{s1}-{s2}/{i0}-{i1}-{i2}.{}",
            self.prefix, self.extension
        )
    }
}

/// A cube whose manifest was read successfully.
///
/// Holding a `Cube` proves that the caller was allowed to read the manifest, which is the
/// precondition for reading any of its fragments.
#[derive(Debug)]
pub struct Cube<S> {
    storage: S,
    container: Url,
    manifest: Manifest,
}

impl<S: StorageClient> Cube<S> {
    /// Opens the cube in `container`, reading and parsing its manifest.
    ///
    /// Errors of the manifest read are returned as they are. A manifest that cannot be parsed is
    /// an [`InternalError`](StorageError::InternalError).
    pub async fn open(storage: S, container: Url) -> Result<Self, StorageError> {
        let url = blob_url(&container, MANIFEST_BLOB)?;
        let raw = storage.get(&url).await?;
        let manifest: Manifest = serde_json::from_slice(&raw)?;

        tracing::debug!(
            volumes = manifest.data.len(),
            attributes = manifest.attributes.len(),
            "Opened cube `{}`",
            container.path(),
        );

        Ok(Self {
            storage,
            container,
            manifest,
        })
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn container(&self) -> &Url {
        &self.container
    }

    /// Reads a single fragment.
    pub async fn fetch_fragment(&self, id: &FragmentId) -> Result<Bytes, StorageError> {
        let url = blob_url(&self.container, &id.path())?;
        self.storage.get(&url).await
    }

    /// Reads all fragments concurrently, in the order given.
    ///
    /// The first error aborts all outstanding reads.
    pub async fn fetch_fragments(&self, ids: &[FragmentId]) -> Result<Vec<Bytes>, StorageError> {
        try_join_all(ids.iter().map(|id| self.fetch_fragment(id))).await
    }
}
