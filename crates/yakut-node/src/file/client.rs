//! Client side of the standard file service.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use yakut_common::types::{NodeId, Priority};
use yakut_dsdl::DataType;

use super::error::{FileErrorCode, FileServiceError};
use super::{CHUNK_SIZE, FileInfo, data_bytes, path_text, response_error};
use crate::node::{Client, Node};
use crate::types;

/// Result alias for file service requests.
pub type Result<T> = std::result::Result<T, FileServiceError>;

/// Called with `(bytes_done, bytes_total)`; the total is unknown for reads.
pub type Progress<'a> = &'a mut dyn FnMut(u64, Option<u64>);

/// Talks to the file server of one remote node.
pub struct FileClient<'a> {
    node: &'a Node,
    server: NodeId,
    /// Per-request response timeout.
    pub timeout: Duration,
    /// Priority of every request.
    pub priority: Priority,
}

impl<'a> FileClient<'a> {
    /// Creates a client for the file server at `server`.
    #[must_use]
    pub const fn new(node: &'a Node, server: NodeId, timeout: Duration) -> Self {
        Self {
            node,
            server,
            timeout,
            priority: Priority::Nominal,
        }
    }

    /// The server node-ID.
    #[must_use]
    pub const fn server(&self) -> NodeId {
        self.server
    }

    fn client(&self, dtype: &Arc<DataType>) -> Result<Client> {
        let mut client = self.node.make_client(dtype, self.server, None)?;
        client.timeout = self.timeout;
        client.priority = self.priority;
        Ok(client)
    }

    async fn call(&self, client: &Client, request: &Value) -> Result<Value> {
        match client.call(request).await? {
            Some((response, _)) => Ok(response),
            None => Err(FileServiceError::Timeout { node_id: self.server }),
        }
    }

    fn check(&self, response: &Value, path: &str) -> Result<()> {
        match response_error(response) {
            FileErrorCode::Ok => Ok(()),
            code => Err(FileServiceError::Remote {
                node_id: self.server,
                code,
                path: path.to_owned(),
            }),
        }
    }

    /// Names of the entries in `dir`, in server order.
    ///
    /// # Errors
    ///
    /// Fails on timeout; the partial listing is lost.
    pub async fn list(&self, dir: &str) -> Result<Vec<String>> {
        let client = self.client(&types::FILE_LIST.load()?)?;
        let mut names = Vec::new();
        for index in 0_u32.. {
            let request = json!({"entry_index": index, "directory_path": {"path": dir}});
            let response = self.call(&client, &request).await?;
            let name = path_text(response.get("entry_base_name"));
            if name.is_empty() {
                break;
            }
            names.push(name);
        }
        Ok(names)
    }

    /// Attributes of `path`.
    ///
    /// # Errors
    ///
    /// Fails on timeout or when the server reports an error.
    pub async fn get_info(&self, path: &str) -> Result<FileInfo> {
        let client = self.client(&types::FILE_GET_INFO.load()?)?;
        let response = self.call(&client, &json!({"path": {"path": path}})).await?;
        self.check(&response, path)?;
        Ok(FileInfo::from_response(&response))
    }

    /// Reads the whole file. A chunk shorter than the maximum ends it.
    ///
    /// # Errors
    ///
    /// Fails on timeout or when the server reports an error.
    pub async fn read(&self, path: &str, progress: Progress<'_>) -> Result<Vec<u8>> {
        let client = self.client(&types::FILE_READ.load()?)?;
        let mut out = Vec::new();
        loop {
            let request = json!({"offset": out.len(), "path": {"path": path}});
            let response = self.call(&client, &request).await?;
            self.check(&response, path)?;
            let chunk = data_bytes(response.get("data"));
            out.extend_from_slice(&chunk);
            progress(out.len() as u64, None);
            if chunk.len() < CHUNK_SIZE {
                return Ok(out);
            }
        }
    }

    /// Writes `data` to `path` in chunks, then sends an empty chunk to mark
    /// the end.
    ///
    /// # Errors
    ///
    /// Fails on timeout or when the server reports an error.
    pub async fn write(&self, path: &str, data: &[u8], progress: Progress<'_>) -> Result<()> {
        let client = self.client(&types::FILE_WRITE.load()?)?;
        let total = data.len() as u64;
        let mut offset = 0_usize;
        for chunk in data.chunks(CHUNK_SIZE).chain(std::iter::once(&[][..])) {
            let request = json!({"offset": offset, "path": {"path": path}, "data": {"value": chunk}});
            let response = self.call(&client, &request).await?;
            self.check(&response, path)?;
            offset += chunk.len();
            progress(offset as u64, Some(total));
        }
        Ok(())
    }

    async fn modify(&self, source: &str, destination: &str, preserve_source: bool, overwrite: bool) -> Result<()> {
        let client = self.client(&types::FILE_MODIFY.load()?)?;
        let request = json!({
            "preserve_source": preserve_source,
            "overwrite_destination": overwrite,
            "source": {"path": source},
            "destination": {"path": destination},
        });
        let response = self.call(&client, &request).await?;
        let subject = if source.is_empty() { destination } else { source };
        self.check(&response, subject)
    }

    /// Moves `source` to `destination`.
    ///
    /// # Errors
    ///
    /// Fails on timeout or when the server reports an error.
    pub async fn move_(&self, source: &str, destination: &str, overwrite: bool) -> Result<()> {
        self.modify(source, destination, false, overwrite).await
    }

    /// Copies `source` to `destination`.
    ///
    /// # Errors
    ///
    /// Fails on timeout or when the server reports an error.
    pub async fn copy(&self, source: &str, destination: &str, overwrite: bool) -> Result<()> {
        self.modify(source, destination, true, overwrite).await
    }

    /// Creates `path` if missing and updates its modification time.
    ///
    /// # Errors
    ///
    /// Fails on timeout or when the server reports an error.
    pub async fn touch(&self, path: &str) -> Result<()> {
        self.modify("", path, false, false).await
    }

    /// Removes `path`.
    ///
    /// # Errors
    ///
    /// Fails on timeout or when the server reports an error.
    pub async fn remove(&self, path: &str) -> Result<()> {
        self.modify(path, "", false, false).await
    }
}
