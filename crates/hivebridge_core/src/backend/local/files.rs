//! Local file storage.
//!
//! Files are blobs keyed by normalized path; folders exist implicitly
//! whenever a file path passes through them.

use super::{now_epoch_ms, SharedConn, VaultContext};
use crate::backend::{FileInfo, FileKind, ReadStream, VaultFiles, WriteStream};
use crate::error::{BackendError, BackendErrorKind, BackendResult};
use async_trait::async_trait;
use log::warn;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::{Cursor, Write};
use std::sync::PoisonError;

pub(super) struct LocalFiles {
    context: VaultContext,
}

impl LocalFiles {
    pub(super) fn new(context: VaultContext) -> Self {
        Self { context }
    }
}

#[async_trait]
impl VaultFiles for LocalFiles {
    async fn upload(&self, path: &str) -> BackendResult<WriteStream> {
        let path = normalize_path(path)?;
        self.context.session.ensure().await?;
        Ok(Box::new(FileWriter::new(
            self.context.conn.clone(),
            self.context.owner_did.clone(),
            path,
        )))
    }

    async fn download(&self, path: &str) -> BackendResult<ReadStream> {
        let path = normalize_path(path)?;
        let content = self
            .context
            .run(move |conn, owner| read_file(conn, owner, &path))
            .await?;
        Ok(Box::new(Cursor::new(content)))
    }

    async fn delete(&self, path: &str) -> BackendResult<bool> {
        let path = normalize_path(path)?;
        self.context
            .run(move |conn, owner| {
                if delete_tree(conn, owner, &path)? == 0 {
                    return Err(item_not_found(&path));
                }
                Ok(true)
            })
            .await
    }

    async fn move_file(&self, src: &str, dst: &str) -> BackendResult<bool> {
        let src = normalize_path(src)?;
        let dst = normalize_path(dst)?;
        self.context
            .run(move |conn, owner| {
                let content = read_file(conn, owner, &src)?;
                store_file(conn, owner, &dst, &content)?;
                if src != dst {
                    conn.execute(
                        "DELETE FROM files WHERE owner_did = ?1 AND path = ?2",
                        params![owner, src],
                    )?;
                }
                Ok(true)
            })
            .await
    }

    async fn copy_file(&self, src: &str, dst: &str) -> BackendResult<bool> {
        let src = normalize_path(src)?;
        let dst = normalize_path(dst)?;
        self.context
            .run(move |conn, owner| {
                let content = read_file(conn, owner, &src)?;
                store_file(conn, owner, &dst, &content)?;
                Ok(true)
            })
            .await
    }

    async fn hash(&self, path: &str) -> BackendResult<String> {
        let path = normalize_path(path)?;
        self.context
            .run(move |conn, owner| {
                let content = read_file(conn, owner, &path)?;
                Ok(format!("{:x}", Sha256::digest(&content)))
            })
            .await
    }

    async fn list(&self, folder: &str) -> BackendResult<Vec<FileInfo>> {
        let folder = folder.trim().trim_matches('/').to_string();
        self.context
            .run(move |conn, owner| {
                let entries = entries_under(conn, owner, &folder)?;
                if entries.is_empty() && !folder.is_empty() {
                    return Err(item_not_found(&folder));
                }
                Ok(child_infos(&folder, entries))
            })
            .await
    }

    async fn stat(&self, path: &str) -> BackendResult<FileInfo> {
        let path = normalize_path(path)?;
        self.context
            .run(move |conn, owner| {
                let file = conn
                    .query_row(
                        "SELECT length(content), updated_at FROM files
                         WHERE owner_did = ?1 AND path = ?2",
                        params![owner, path],
                        |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
                    )
                    .optional()?;
                if let Some((size, updated_at)) = file {
                    return Ok(FileInfo {
                        name: base_name(&path).to_string(),
                        size: size.max(0) as u64,
                        last_modified: updated_at,
                        kind: FileKind::File,
                    });
                }

                let entries = entries_under(conn, owner, &path)?;
                let Some(last_modified) = entries.iter().map(|entry| entry.updated_at).max()
                else {
                    return Err(item_not_found(&path));
                };
                Ok(FileInfo {
                    name: base_name(&path).to_string(),
                    size: 0,
                    last_modified,
                    kind: FileKind::Folder,
                })
            })
            .await
    }
}

/// Upload stream that persists the written bytes on flush and on drop.
pub(super) struct FileWriter {
    conn: SharedConn,
    owner_did: String,
    path: String,
    buffer: Vec<u8>,
    dirty: bool,
}

impl FileWriter {
    pub(super) fn new(conn: SharedConn, owner_did: String, path: String) -> Self {
        Self {
            conn,
            owner_did,
            path,
            buffer: Vec::new(),
            dirty: true,
        }
    }

    fn persist(&mut self) -> std::io::Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        store_file(&conn, &self.owner_did, &self.path, &self.buffer)
            .map_err(|err| std::io::Error::other(err.to_string()))?;
        self.dirty = false;
        Ok(())
    }
}

impl Write for FileWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        self.dirty = true;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.persist()
    }
}

impl Drop for FileWriter {
    fn drop(&mut self) {
        if let Err(err) = self.persist() {
            warn!(
                "event=file_upload module=local_files status=error error_code=persist_on_drop error={}",
                err
            );
        }
    }
}

struct FileEntry {
    path: String,
    size: u64,
    updated_at: i64,
}

pub(super) fn normalize_path(path: &str) -> BackendResult<String> {
    let normalized = path.trim().trim_matches('/');
    if normalized.is_empty() {
        return Err(BackendError::other("file path must not be empty"));
    }
    Ok(normalized.to_string())
}

pub(super) fn read_file(conn: &Connection, owner: &str, path: &str) -> BackendResult<Vec<u8>> {
    conn.query_row(
        "SELECT content FROM files WHERE owner_did = ?1 AND path = ?2",
        params![owner, path],
        |row| row.get::<_, Vec<u8>>(0),
    )
    .optional()?
    .ok_or_else(|| item_not_found(path))
}

fn store_file(conn: &Connection, owner: &str, path: &str, content: &[u8]) -> BackendResult<()> {
    conn.execute(
        "INSERT INTO files (owner_did, path, content, updated_at) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (owner_did, path)
         DO UPDATE SET content = excluded.content, updated_at = excluded.updated_at",
        params![owner, path, content, now_epoch_ms()],
    )?;
    Ok(())
}

/// Removes `path` and everything stored below it. Paths compare
/// case-sensitively.
fn delete_tree(conn: &Connection, owner: &str, path: &str) -> BackendResult<usize> {
    let removed = conn.execute(
        "DELETE FROM files
         WHERE owner_did = ?1 AND (path = ?2 OR substr(path, 1, length(?3)) = ?3)",
        params![owner, path, folder_prefix(path)],
    )?;
    Ok(removed)
}

fn entries_under(conn: &Connection, owner: &str, folder: &str) -> BackendResult<Vec<FileEntry>> {
    let mut stmt = conn.prepare(
        "SELECT path, length(content), updated_at FROM files
         WHERE owner_did = ?1 AND substr(path, 1, length(?2)) = ?2 ORDER BY path",
    )?;
    let entries = stmt
        .query_map(params![owner, folder_prefix(folder)], |row| {
            Ok(FileEntry {
                path: row.get(0)?,
                size: row.get::<_, i64>(1)?.max(0) as u64,
                updated_at: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}

/// Collapses nested entries into the immediate children of `folder`.
fn child_infos(folder: &str, entries: Vec<FileEntry>) -> Vec<FileInfo> {
    let mut children = BTreeMap::<String, FileInfo>::new();
    for entry in entries {
        let relative = if folder.is_empty() {
            entry.path.as_str()
        } else {
            &entry.path[folder.len() + 1..]
        };
        match relative.split_once('/') {
            None => {
                children.insert(
                    relative.to_string(),
                    FileInfo {
                        name: relative.to_string(),
                        size: entry.size,
                        last_modified: entry.updated_at,
                        kind: FileKind::File,
                    },
                );
            }
            Some((child_folder, _)) => {
                let info = children
                    .entry(child_folder.to_string())
                    .or_insert_with(|| FileInfo {
                        name: child_folder.to_string(),
                        size: 0,
                        last_modified: entry.updated_at,
                        kind: FileKind::Folder,
                    });
                info.last_modified = info.last_modified.max(entry.updated_at);
            }
        }
    }
    children.into_values().collect()
}

/// Prefix shared by every path below `folder`; empty for the vault root.
fn folder_prefix(folder: &str) -> String {
    if folder.is_empty() {
        String::new()
    } else {
        format!("{folder}/")
    }
}

fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn item_not_found(path: &str) -> BackendError {
    BackendError::new(
        BackendErrorKind::FileNotFound,
        format!("Item not found: {path}"),
    )
}
