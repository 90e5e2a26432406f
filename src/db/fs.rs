use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::info;

use super::{GatewayError, PersistenceGateway};
use crate::models::RoomId;

/// Stores one snapshot file per room under `<root>/<resource_type>/<resource_id>.snap`.
pub struct FsGateway {
    root: PathBuf,
}

impl FsGateway {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, room_id: &RoomId) -> PathBuf {
        self.root
            .join(sanitize(room_id.resource_type()))
            .join(format!("{}.snap", sanitize(room_id.resource_id())))
    }
}

/// Keeps file names portable; anything outside `[A-Za-z0-9_-]` is hex-escaped.
fn sanitize(part: &str) -> String {
    let mut out = String::with_capacity(part.len());
    for b in part.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02x}", b));
        }
    }
    out
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), std::io::Error> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    let tmp = path.with_extension("snap.tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await
}

#[async_trait]
impl PersistenceGateway for FsGateway {
    async fn load(&self, room_id: &RoomId) -> Result<Option<Vec<u8>>, GatewayError> {
        match tokio::fs::read(self.path_for(room_id)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn store(&self, room_id: &RoomId, snapshot: Vec<u8>) -> Result<(), GatewayError> {
        let path = self.path_for(room_id);
        write_atomic(&path, &snapshot).await?;
        info!("Snapshot for room {} written to {} ({} bytes)", room_id, path.display(), snapshot.len());
        Ok(())
    }
}
