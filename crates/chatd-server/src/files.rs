//! Content-addressed upload storage.
//!
//! Files are named by the hex SHA-256 of their bytes and sorted into a
//! directory by MIME prefix. The `UserFiles` row counts references; bytes
//! hit the disk only for the first reference and leave it with the last.
//!
//! ```text
//!   save:    [insert-or-bump row, returning its count] ──► [read ref_count]
//!            ──► own count == 1 ? write
//!   release: [decrement row] ──► ref_count <= 0 ? unlink + [delete row]
//! ```

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chatd_core::ClientId;
use chatd_pipeline::{Ctx, ExecResult};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::db::userfile::{self, Released};
use crate::worker::{DbCtx, DbPipeline, WorkerEnv};

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[derive(Debug, Clone)]
pub struct FileStore {
    img_dir: PathBuf,
    vid_dir: PathBuf,
    file_dir: PathBuf,
}

impl FileStore {
    pub fn new(img_dir: PathBuf, vid_dir: PathBuf, file_dir: PathBuf) -> Self {
        Self {
            img_dir,
            vid_dir,
            file_dir,
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(config.img_dir(), config.vid_dir(), config.file_dir())
    }

    pub fn create_dirs(&self) -> io::Result<()> {
        for dir in [&self.img_dir, &self.vid_dir, &self.file_dir] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn dir_for(&self, mime: &str) -> &Path {
        if mime.starts_with("image/") {
            &self.img_dir
        } else if mime.starts_with("video/") {
            &self.vid_dir
        } else {
            &self.file_dir
        }
    }

    pub fn path_for(&self, mime: &str, hash: &str) -> PathBuf {
        self.dir_for(mime).join(hash)
    }

    /// Write through a temporary name so a reader never sees half a file.
    pub fn write(&self, mime: &str, hash: &str, bytes: &[u8]) -> io::Result<PathBuf> {
        let path = self.path_for(mime, hash);
        let tmp = path.with_extension("part");
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(bytes)?;
            f.sync_data()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(path)
    }

    pub fn remove(&self, mime: &str, hash: &str) -> io::Result<()> {
        match fs::remove_file(self.path_for(mime, hash)) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

/// A stored upload, as seen by the save continuation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedFile {
    pub hash: String,
    pub size: usize,
    pub mime_type: String,
    /// Bytes were written by this save rather than already present.
    pub written: bool,
}

const SAVE_FAILED: &str = "Failed to save file";

/// Store `bytes` as one chain of two statements. `then` runs once both
/// have resolved and the bytes are on disk.
pub fn save<F>(
    db: &mut DbPipeline,
    owner: Option<ClientId>,
    label: &'static str,
    mime: String,
    bytes: Vec<u8>,
    then: F,
) -> chatd_pipeline::Result<()>
where
    F: FnOnce(&mut WorkerEnv, &mut DbPipeline, SavedFile) -> ExecResult + Send + 'static,
{
    let hash = sha256_hex(&bytes);
    let size = bytes.len();
    let row = (hash.clone(), mime.clone());

    let head = new_ctx(label, owner).then(move |env, db, nodes| {
        let [insert, count, ..] = nodes else {
            return Err(SAVE_FAILED.into());
        };
        if let Some(e) = insert.error().or(count.error()) {
            warn!(%hash, error = e, "file row not stored");
            return Err(SAVE_FAILED.into());
        }
        // Our own statement's count decides; the later read may already
        // include a concurrent upload of the same bytes.
        let written = insert.payload().ref_count() == Some(1);
        let refs = count.payload().ref_count().unwrap_or(0);
        if written {
            if let Err(e) = env.server().files().write(&mime, &hash, &bytes) {
                error!(%hash, error = %e, "file write failed");
                return Err(SAVE_FAILED.into());
            }
            info!(%hash, size, mime = %mime, "file stored");
        } else {
            debug!(%hash, refs, "duplicate upload, bytes not rewritten");
        }
        then(
            env,
            db,
            SavedFile {
                hash,
                size,
                mime_type: mime,
                written,
            },
        )
    });
    userfile::insert(db, head, &row.0, size, &row.1)?;
    userfile::ref_count(db, new_ctx(label, owner), &row.0)
}

/// Drop one reference to `hash`; the last one unlinks the bytes and the row.
pub fn release(db: &mut DbPipeline, hash: &str) -> chatd_pipeline::Result<()> {
    let owned = hash.to_string();
    let ctx = DbCtx::new("release_file").then(move |env, db, nodes| {
        let released = nodes[0].payload_mut().take_data::<Option<Released>>().flatten();
        let Some(released) = released else {
            debug!(hash = %owned, "release of unknown file");
            return Ok(());
        };
        if released.ref_count > 0 {
            return Ok(());
        }
        if let Err(e) = env.server().files().remove(&released.mime_type, &owned) {
            warn!(hash = %owned, error = %e, "unlink failed");
        }
        info!(hash = %owned, "file removed");
        userfile::delete_unreferenced(db, DbCtx::new("release_file"), &owned)
            .map_err(|e| e.to_string().into())
    });
    userfile::decrement(db, ctx, hash)
}

fn new_ctx(label: &'static str, owner: Option<ClientId>) -> DbCtx {
    match owner {
        Some(owner) => Ctx::for_owner(label, owner),
        None => Ctx::new(label),
    }
}
