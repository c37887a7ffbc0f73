//! Chunk object store
//!
//! Layout: `bucket_<bucket_id>/file_<file_id>/chunk_<index>.bin` relative to
//! the operator root. Each chunk owns a unique path, so concurrent writes of
//! different chunks never collide.

use opendal::Operator;

use cvault_core::{CvaultError, CvaultResult};

/// Object path of a chunk.
pub fn chunk_key(bucket_id: u64, file_id: u64, index: u32) -> String {
    format!("bucket_{bucket_id}/file_{file_id}/chunk_{index}.bin")
}

#[derive(Debug, Clone)]
pub struct ObjectStore {
    op: Operator,
}

impl ObjectStore {
    pub fn new(op: Operator) -> Self {
        Self { op }
    }

    pub fn operator(&self) -> &Operator {
        &self.op
    }

    /// Write one sealed chunk and return its object key.
    ///
    /// Any backend error maps to `StorageWriteFailure`.
    pub async fn put_chunk(
        &self,
        bucket_id: u64,
        file_id: u64,
        index: u32,
        sealed: Vec<u8>,
    ) -> CvaultResult<String> {
        let key = chunk_key(bucket_id, file_id, index);
        let len = sealed.len();
        self.op.write(&key, sealed).await.map_err(|e| {
            CvaultError::StorageWriteFailure(format!("writing {key}: {e}"))
        })?;
        tracing::debug!(object = %key, bytes = len, "chunk object written");
        Ok(key)
    }

    /// Raw stored bytes. Digest and AEAD checks happen in `ChunkProcessor::open`.
    pub async fn get_chunk(&self, object_key: &str) -> CvaultResult<Vec<u8>> {
        match self.op.read(object_key).await {
            Ok(buf) => Ok(buf.to_vec()),
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => Err(CvaultError::NotFound(
                format!("chunk object {object_key}"),
            )),
            Err(e) => Err(CvaultError::Other(anyhow::anyhow!(
                "reading {object_key}: {e}"
            ))),
        }
    }
}
