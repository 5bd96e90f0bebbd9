//! gRPC service implementation for the key-value plugin.

use std::io::ErrorKind;
use std::path::PathBuf;

use plugrt::plugin::WorkerPool;
use tonic::{Request, Response, Status};
use tracing::{debug, info};

use crate::proto::kv_server::Kv;
use crate::proto::{Empty, GetRequest, GetResponse, PutRequest};

/// Suffix appended to every stored value.
const WRITTEN_BY: &[u8] = b"\n\nWritten from plugin-rust";

pub struct KvService {
    data_dir: PathBuf,
    pool: WorkerPool,
}

impl KvService {
    pub fn new(data_dir: impl Into<PathBuf>, pool: WorkerPool) -> Self {
        Self {
            data_dir: data_dir.into(),
            pool,
        }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, Status> {
        if key.is_empty() {
            return Err(Status::invalid_argument("key must not be empty"));
        }
        if key.contains(['/', '\\']) || key == "." || key == ".." || key.contains('\0') {
            return Err(Status::invalid_argument(format!("invalid key '{}'", key)));
        }
        Ok(self.data_dir.join(format!("kv_{}", key)))
    }
}

#[tonic::async_trait]
impl Kv for KvService {
    async fn get(&self, request: Request<GetRequest>) -> Result<Response<GetResponse>, Status> {
        let _permit = self.pool.acquire().await?;
        let key = request.into_inner().key;
        let path = self.path_for(&key)?;

        debug!(key = %key, "Get");
        match tokio::fs::read(&path).await {
            Ok(value) => Ok(Response::new(GetResponse { value })),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(Status::not_found(format!("no value for key '{}'", key)))
            }
            Err(e) => Err(Status::internal(format!(
                "failed to read key '{}': {}",
                key, e
            ))),
        }
    }

    async fn put(&self, request: Request<PutRequest>) -> Result<Response<Empty>, Status> {
        let _permit = self.pool.acquire().await?;
        let PutRequest { key, mut value } = request.into_inner();
        let path = self.path_for(&key)?;

        value.extend_from_slice(WRITTEN_BY);
        tokio::fs::write(&path, &value).await.map_err(|e| {
            Status::internal(format!("failed to write key '{}': {}", key, e))
        })?;

        info!(key = %key, bytes = value.len(), "Stored value");
        Ok(Response::new(Empty {}))
    }
}
