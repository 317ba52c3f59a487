//! A file server exposing one or more local directories as a single tree.
//!
//! When several roots hold the same entry, the first root wins. Handlers run
//! synchronously on the dispatcher, so every operation is a short `std::fs`
//! call bounded by the chunk size.

use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use serde_json::{Value, json};

use super::error::FileErrorCode;
use super::{CHUNK_SIZE, data_bytes, path_text};
use crate::error::Result;
use crate::node::{Handler, Node};
use crate::types;

/// Serves the standard file services from local root directories.
#[derive(Debug, Clone)]
pub struct FileServer {
    roots: Arc<Vec<PathBuf>>,
}

impl FileServer {
    /// Installs the GetInfo, List, Modify, Read and Write servers on `node`.
    ///
    /// # Errors
    ///
    /// Fails if a server cannot be registered.
    pub fn new(node: &Node, roots: Vec<PathBuf>) -> Result<Self> {
        let server = Self { roots: Arc::new(roots) };
        tracing::info!(roots = ?server.roots, "file server roots");

        let s = server.clone();
        let on_get_info: Handler = Arc::new(move |req, _| Some(s.get_info(req)));
        let s = server.clone();
        let on_list: Handler = Arc::new(move |req, _| Some(s.list(req)));
        let s = server.clone();
        let on_modify: Handler = Arc::new(move |req, _| Some(s.modify(req)));
        let s = server.clone();
        let on_read: Handler = Arc::new(move |req, _| Some(s.read(req)));
        let s = server.clone();
        let on_write: Handler = Arc::new(move |req, _| Some(s.write(req)));

        let _ = node.serve(&types::FILE_GET_INFO.load()?, None, on_get_info)?;
        let _ = node.serve(&types::FILE_LIST.load()?, None, on_list)?;
        let _ = node.serve(&types::FILE_MODIFY.load()?, None, on_modify)?;
        let _ = node.serve(&types::FILE_READ.load()?, None, on_read)?;
        let _ = node.serve(&types::FILE_WRITE.load()?, None, on_write)?;
        Ok(server)
    }

    /// The served directories in precedence order.
    #[must_use]
    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Finds a remote-visible path in the roots. Returns the local path of the
    /// first root holding it. Paths escaping the root are never located.
    #[must_use]
    pub fn locate(&self, path: &str) -> Option<PathBuf> {
        let relative = sanitize(path)?;
        self.roots.iter().map(|r| r.join(&relative)).find(|p| p.exists())
    }

    /// The local path a new file at `path` would be created under.
    fn target(&self, path: &str) -> Option<PathBuf> {
        let relative = sanitize(path)?;
        self.locate(path)
            .or_else(|| self.roots.first().map(|r| r.join(relative)))
    }

    /// Entries of a remote-visible directory across all roots, sorted.
    fn entries(&self, dir: &str) -> Vec<String> {
        let Some(relative) = sanitize(dir) else {
            return Vec::new();
        };
        let mut names = BTreeSet::new();
        for root in self.roots.iter() {
            let Ok(rd) = fs::read_dir(root.join(&relative)) else {
                continue;
            };
            names.extend(rd.flatten().map(|e| e.file_name().to_string_lossy().into_owned()));
        }
        names.into_iter().collect()
    }

    fn get_info(&self, request: &Value) -> Value {
        let path = path_text(request.get("path"));
        let Some(local) = self.locate(&path) else {
            tracing::debug!(path, "get info: not found");
            return json!({"error": FileErrorCode::NotFound.to_builtin()});
        };
        match fs::symlink_metadata(&local).and_then(|link| fs::metadata(&local).map(|m| (link, m))) {
            Ok((link, meta)) => {
                let mtime = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map_or(0, |d| d.as_secs());
                json!({
                    "error": FileErrorCode::Ok.to_builtin(),
                    "size": meta.len(),
                    "unix_timestamp_of_last_modification": mtime,
                    "is_file_not_directory": meta.is_file(),
                    "is_link": link.file_type().is_symlink(),
                    "is_readable": fs::File::open(&local).is_ok() || meta.is_dir(),
                    "is_writeable": !meta.permissions().readonly(),
                })
            }
            Err(e) => json!({"error": FileErrorCode::from_io(&e).to_builtin()}),
        }
    }

    fn list(&self, request: &Value) -> Value {
        let index = request.get("entry_index").and_then(Value::as_u64).unwrap_or(0);
        let dir = path_text(request.get("directory_path"));
        let entries = self.entries(&dir);
        let name = usize::try_from(index).ok().and_then(|i| entries.get(i));
        // An empty name marks the end of the listing.
        json!({"entry_base_name": {"path": name.map_or("", String::as_str)}})
    }

    fn modify(&self, request: &Value) -> Value {
        let flag = |k: &str| request.get(k).and_then(Value::as_bool).unwrap_or(false);
        let source = path_text(request.get("source"));
        let destination = path_text(request.get("destination"));
        let code = match self.apply_modify(&source, &destination, flag("preserve_source"), flag("overwrite_destination")) {
            Ok(()) => FileErrorCode::Ok,
            Err(code) => code,
        };
        tracing::debug!(source, destination, %code, "modify");
        json!({"error": code.to_builtin()})
    }

    fn apply_modify(
        &self,
        source: &str,
        destination: &str,
        preserve_source: bool,
        overwrite: bool,
    ) -> std::result::Result<(), FileErrorCode> {
        let io_code = |e: io::Error| FileErrorCode::from_io(&e);
        if source.is_empty() {
            // Touch.
            let dst = self.target(destination).ok_or(FileErrorCode::InvalidValue)?;
            let file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&dst)
                .map_err(io_code)?;
            return file.set_modified(std::time::SystemTime::now()).map_err(io_code);
        }
        let src = self.locate(source).ok_or(FileErrorCode::NotFound)?;
        if destination.is_empty() {
            // Remove.
            let result = if src.is_dir() { fs::remove_dir_all(&src) } else { fs::remove_file(&src) };
            return result.map_err(io_code);
        }
        let dst = self.target(destination).ok_or(FileErrorCode::InvalidValue)?;
        if dst.exists() {
            if !overwrite {
                return Err(FileErrorCode::InvalidValue);
            }
            let result = if dst.is_dir() { fs::remove_dir_all(&dst) } else { fs::remove_file(&dst) };
            result.map_err(io_code)?;
        }
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).map_err(io_code)?;
        }
        if preserve_source {
            copy_recursive(&src, &dst).map_err(io_code)
        } else {
            fs::rename(&src, &dst).map_err(io_code)
        }
    }

    fn read(&self, request: &Value) -> Value {
        let path = path_text(request.get("path"));
        let offset = request.get("offset").and_then(Value::as_u64).unwrap_or(0);
        let Some(local) = self.locate(&path) else {
            return json!({"error": FileErrorCode::NotFound.to_builtin()});
        };
        match read_chunk(&local, offset) {
            Ok(data) => json!({"error": FileErrorCode::Ok.to_builtin(), "data": {"value": data}}),
            Err(e) => json!({"error": FileErrorCode::from_io(&e).to_builtin()}),
        }
    }

    fn write(&self, request: &Value) -> Value {
        let path = path_text(request.get("path"));
        let offset = request.get("offset").and_then(Value::as_u64).unwrap_or(0);
        let data = data_bytes(request.get("data"));
        let Some(local) = self.target(&path) else {
            return json!({"error": FileErrorCode::InvalidValue.to_builtin()});
        };
        let code = match write_chunk(&local, offset, &data) {
            Ok(()) => FileErrorCode::Ok,
            Err(e) => FileErrorCode::from_io(&e),
        };
        json!({"error": code.to_builtin()})
    }
}

/// Relative form of a remote-visible path, or `None` if it leaves the root.
fn sanitize(path: &str) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for c in Path::new(path.trim_start_matches('/')).components() {
        match c {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(out)
}

fn read_chunk(path: &Path, offset: u64) -> io::Result<Vec<u8>> {
    let mut file = fs::File::open(path)?;
    let _ = file.seek(SeekFrom::Start(offset))?;
    let mut data = Vec::with_capacity(CHUNK_SIZE);
    let _ = file.take(CHUNK_SIZE as u64).read_to_end(&mut data)?;
    Ok(data)
}

/// Writes `data` at `offset`. An empty chunk ends the transfer and truncates
/// the file there.
fn write_chunk(path: &Path, offset: u64, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::OpenOptions::new().create(true).write(true).truncate(false).open(path)?;
    if data.is_empty() {
        return file.set_len(offset);
    }
    if offset == 0 {
        file.set_len(0)?;
    }
    let _ = file.seek(SeekFrom::Start(offset))?;
    file.write_all(data)
}

fn copy_recursive(src: &Path, dst: &Path) -> io::Result<()> {
    if src.is_dir() {
        fs::create_dir_all(dst)?;
        for entry in fs::read_dir(src)? {
            let entry = entry?;
            copy_recursive(&entry.path(), &dst.join(entry.file_name()))?;
        }
        Ok(())
    } else {
        fs::copy(src, dst).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn server(roots: Vec<PathBuf>) -> FileServer {
        FileServer { roots: Arc::new(roots) }
    }

    #[test]
    fn sanitize_rejects_escapes() {
        assert_eq!(sanitize("/a/./b"), Some(PathBuf::from("a/b")));
        assert_eq!(sanitize(""), Some(PathBuf::new()));
        assert_eq!(sanitize("a/../../etc"), None);
    }

    #[test]
    fn first_root_takes_precedence_and_listing_is_merged() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        fs::write(a.path().join("x"), b"first").unwrap();
        fs::write(b.path().join("x"), b"second").unwrap();
        fs::write(b.path().join("y"), b"only b").unwrap();
        let s = server(vec![a.path().to_path_buf(), b.path().to_path_buf()]);

        assert_eq!(s.locate("x"), Some(a.path().join("x")));
        assert_eq!(s.locate("y"), Some(b.path().join("y")));
        assert_eq!(s.entries(""), vec!["x".to_owned(), "y".to_owned()]);

        let r = s.list(&json!({"entry_index": 1, "directory_path": {"path": ""}}));
        assert_eq!(r["entry_base_name"]["path"], "y");
        let r = s.list(&json!({"entry_index": 2, "directory_path": {"path": ""}}));
        assert_eq!(r["entry_base_name"]["path"], "");
    }

    #[test]
    fn read_returns_chunks_from_offset() {
        let dir = tempfile::tempdir().unwrap();
        let content: Vec<u8> = (0..=255_u8).chain(0..10).collect();
        fs::write(dir.path().join("blob"), &content).unwrap();
        let s = server(vec![dir.path().to_path_buf()]);

        let r = s.read(&json!({"offset": 0, "path": {"path": "blob"}}));
        assert_eq!(r["error"]["value"], 0);
        assert_eq!(data_bytes(r.get("data")).len(), CHUNK_SIZE);
        let r = s.read(&json!({"offset": 256, "path": {"path": "blob"}}));
        assert_eq!(data_bytes(r.get("data")), (0..10).collect::<Vec<u8>>());
        let r = s.read(&json!({"offset": 0, "path": {"path": "missing"}}));
        assert_eq!(r["error"]["value"], 2);
    }

    #[test]
    fn write_then_truncate_with_empty_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let s = server(vec![dir.path().to_path_buf()]);
        let r = s.write(&json!({"offset": 0, "path": {"path": "sub/f"}, "data": {"value": "hello world"}}));
        assert_eq!(r["error"]["value"], 0);
        let r = s.write(&json!({"offset": 5, "path": {"path": "sub/f"}, "data": {"value": []}}));
        assert_eq!(r["error"]["value"], 0);
        assert_eq!(fs::read(dir.path().join("sub/f")).unwrap(), b"hello");
    }

    #[test]
    fn modify_covers_touch_copy_move_remove() {
        let dir = tempfile::tempdir().unwrap();
        let s = server(vec![dir.path().to_path_buf()]);
        let req = |src: &str, dst: &str, preserve: bool, overwrite: bool| {
            json!({
                "preserve_source": preserve,
                "overwrite_destination": overwrite,
                "source": {"path": src},
                "destination": {"path": dst},
            })
        };
        assert_eq!(s.modify(&req("", "a", false, false))["error"]["value"], 0);
        assert!(dir.path().join("a").is_file());

        assert_eq!(s.modify(&req("a", "b", true, false))["error"]["value"], 0);
        assert!(dir.path().join("a").is_file() && dir.path().join("b").is_file());

        assert_eq!(s.modify(&req("a", "b", false, false))["error"]["value"], 22);
        assert_eq!(s.modify(&req("a", "b", false, true))["error"]["value"], 0);
        assert!(!dir.path().join("a").exists());

        assert_eq!(s.modify(&req("b", "", false, false))["error"]["value"], 0);
        assert!(!dir.path().join("b").exists());
        assert_eq!(s.modify(&req("b", "", false, false))["error"]["value"], 2);
    }

    #[test]
    fn get_info_reports_attributes() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("f"), b"1234").unwrap();
        let s = server(vec![dir.path().to_path_buf()]);
        let r = s.get_info(&json!({"path": {"path": "f"}}));
        assert_eq!(r["error"]["value"], 0);
        assert_eq!(r["size"], 4);
        assert_eq!(r["is_file_not_directory"], true);
        assert_eq!(r["is_readable"], true);
        let r = s.get_info(&json!({"path": {"path": ""}}));
        assert_eq!(r["is_file_not_directory"], false);
    }
}
