//! The standard file service: a server over local directories and a client
//! for remote nodes.

pub mod client;
pub mod error;
pub mod server;

use std::time::Duration;

use serde::Serialize;
use serde_json::{Value, json};
use yakut_common::types::{NodeId, Priority};

pub use client::FileClient;
pub use error::{FileErrorCode, FileServiceError};
pub use server::FileServer;

use crate::error::Result;
use crate::info::bytes_from_builtin;
use crate::node::{Client, Node};
use crate::register::remote::Outcome;
use crate::types;

/// Bytes carried in one read or write request.
pub const CHUNK_SIZE: usize = 256;

/// Path separator of `uavcan.file.Path`.
pub const SEPARATOR: char = '/';

/// Attributes reported by `uavcan.file.GetInfo`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FileInfo {
    /// Size in bytes.
    pub size: u64,
    /// Seconds since the Unix epoch.
    pub timestamp: u64,
    /// Regular file rather than directory.
    pub is_file_not_directory: bool,
    /// Symbolic link.
    pub is_link: bool,
    /// Readable by the server.
    pub is_readable: bool,
    /// Writable by the server.
    pub is_writable: bool,
}

impl FileInfo {
    pub(crate) fn from_response(response: &Value) -> Self {
        let flag = |k: &str| response.get(k).and_then(Value::as_bool).unwrap_or(false);
        let num = |k: &str| response.get(k).and_then(Value::as_u64).unwrap_or(0);
        Self {
            size: num("size"),
            timestamp: num("unix_timestamp_of_last_modification"),
            is_file_not_directory: flag("is_file_not_directory"),
            is_link: flag("is_link"),
            is_readable: flag("is_readable"),
            is_writable: flag("is_writeable"),
        }
    }
}

/// Text of a `uavcan.file.Path.2.0` builtin value.
pub(crate) fn path_text(path: Option<&Value>) -> String {
    path.and_then(|p| p.get("path").or(Some(p)))
        .and_then(bytes_from_builtin)
        .map(|b| String::from_utf8_lossy(&b).into_owned())
        .unwrap_or_default()
}

/// Bytes of a `uavcan.primitive.Unstructured.1.0` builtin value.
pub(crate) fn data_bytes(data: Option<&Value>) -> Vec<u8> {
    data.and_then(|d| d.get("value").or(Some(d)))
        .and_then(bytes_from_builtin)
        .unwrap_or_default()
}

/// The error code of a response with an `error` field.
pub(crate) fn response_error(response: &Value) -> FileErrorCode {
    let code = response
        .pointer("/error/value")
        .and_then(Value::as_u64)
        .and_then(|c| u16::try_from(c).ok())
        .unwrap_or(0);
    FileErrorCode::from_code(code)
}

/// One directory entry of a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    /// Entry base name.
    pub name: String,
    /// Attributes, if requested and available.
    pub info: Option<FileInfo>,
}

/// What [`list_files`] asks for.
#[derive(Debug, Clone, Copy)]
pub struct ListOptions {
    /// Tolerate nodes without the file services.
    pub optional_service: bool,
    /// Query the attributes of every entry.
    pub get_info: bool,
    /// Per-request response timeout.
    pub timeout: Duration,
}

/// Lists `dir` on every node in `node_ids`.
///
/// A node that does not answer the first request is taken to lack the
/// service and maps to `None`. A later timeout leaves the listing incomplete
/// and is always an error.
///
/// # Errors
///
/// Fails only on local problems such as an anonymous node.
pub async fn list_files(
    node: &Node,
    node_ids: &[NodeId],
    dir: &str,
    options: ListOptions,
    progress: &mut dyn FnMut(&str),
) -> Result<Outcome<Option<Vec<FileEntry>>>> {
    let mut out = Outcome::default();
    let list_type = types::FILE_LIST.load()?;
    let info_type = types::FILE_GET_INFO.load()?;
    let unavailable = |out: &mut Outcome<Option<Vec<FileEntry>>>, what: &str, nid: NodeId| {
        if options.optional_service {
            out.warnings.push(format!(
                "File {what} service is not accessible at node {nid}, ignoring as requested"
            ));
        } else {
            out.errors.push(format!("File {what} service is not accessible at node {nid}"));
        }
    };
    for &nid in node_ids {
        let client = configure(node.make_client(&list_type, nid, None)?, options.timeout);
        let mut entries = Vec::new();
        let mut service = true;
        for index in 0..=u16::MAX {
            progress(&format!("List {nid:>5}: {index:>5}"));
            let request = json!({"entry_index": index, "directory_path": {"path": dir}});
            match client.call(&request).await? {
                Some((response, _)) => {
                    let name = path_text(response.get("entry_base_name"));
                    if name.is_empty() {
                        break;
                    }
                    entries.push(FileEntry { name, info: None });
                }
                None if index == 0 => {
                    service = false;
                    unavailable(&mut out, "list", nid);
                    break;
                }
                None => {
                    out.errors
                        .push(format!("Request #{index} to node {nid} has timed out, data incomplete"));
                    break;
                }
            }
        }
        tracing::debug!(node_id = %nid, count = entries.len(), "file names fetched");
        if service && options.get_info {
            let client = configure(node.make_client(&info_type, nid, None)?, options.timeout);
            for (index, entry) in entries.iter_mut().enumerate() {
                progress(&format!("GetInfo {nid:>5}: {}", entry.name));
                let request = json!({"path": {"path": join(dir, &entry.name)}});
                match client.call(&request).await? {
                    Some((response, _)) => match response_error(&response) {
                        FileErrorCode::Ok => entry.info = Some(FileInfo::from_response(&response)),
                        code => out
                            .errors
                            .push(format!("GetInfo error {code} for file {} at node {nid}", entry.name)),
                    },
                    None if index == 0 => {
                        unavailable(&mut out, "info", nid);
                        break;
                    }
                    None => {
                        out.errors.push(format!(
                            "GetInfo for file {} to node {nid} has timed out, data incomplete",
                            entry.name
                        ));
                        break;
                    }
                }
            }
        }
        let _ = out.data_per_node.insert(nid, service.then_some(entries));
    }
    Ok(out)
}

fn configure(mut client: Client, timeout: Duration) -> Client {
    client.timeout = timeout;
    client.priority = Priority::Nominal;
    client
}

/// Joins a directory and an entry name with the path separator.
#[must_use]
pub fn join(dir: &str, entry: &str) -> String {
    let dir = dir.trim_end_matches(SEPARATOR);
    if dir.is_empty() { entry.to_owned() } else { format!("{dir}{SEPARATOR}{entry}") }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn path_and_data_accept_text_and_byte_lists() {
        assert_eq!(path_text(Some(&json!({"path": "a/b"}))), "a/b");
        assert_eq!(path_text(Some(&json!({"path": [104, 105]}))), "hi");
        assert_eq!(path_text(None), "");
        assert_eq!(data_bytes(Some(&json!({"value": [0, 255]}))), vec![0, 255]);
        assert_eq!(data_bytes(Some(&json!({"value": "ok"}))), b"ok".to_vec());
    }

    #[test]
    fn join_skips_empty_directory() {
        assert_eq!(join("", "x.bin"), "x.bin");
        assert_eq!(join("fw/", "x.bin"), "fw/x.bin");
    }
}
