//! Directory spool: one `.eml` file per accepted message.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::backend::Enqueuer;

/// Writes each message to `<id>.eml` with the envelope prepended as
/// `X-Mxgate-*` header lines. Files appear under their final name only once
/// fully written.
pub struct SpoolEnqueuer {
    dir: PathBuf,
}

impl SpoolEnqueuer {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).with_context(|| format!("failed to create spool directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn envelope(id: &str, sender: &str, recipients: &[String]) -> String {
    let mut headers = String::new();
    headers.push_str(&format!("X-Mxgate-Id: {}\r\n", id));
    headers.push_str(&format!("X-Mxgate-Date: {}\r\n", Utc::now().to_rfc2822()));
    headers.push_str(&format!("X-Mxgate-MailFrom: <{}>\r\n", sender));
    for rcpt in recipients {
        headers.push_str(&format!("X-Mxgate-RcptTo: <{}>\r\n", rcpt));
    }
    headers
}

impl Enqueuer for SpoolEnqueuer {
    fn enqueue(&self, sender: &str, recipients: &[String], message: &[u8]) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let tmp_path = self.dir.join(format!(".{}.tmp", id));
        let final_path = self.dir.join(format!("{}.eml", id));

        let write = || -> std::io::Result<()> {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(envelope(&id, sender, recipients).as_bytes())?;
            file.write_all(message)?;
            file.sync_all()
        };
        if let Err(err) = write() {
            let _ = fs::remove_file(&tmp_path);
            return Err(err).with_context(|| format!("failed to write {}", tmp_path.display()));
        }
        fs::rename(&tmp_path, &final_path).with_context(|| format!("failed to spool {}", final_path.display()))?;

        info!(id = %id, path = %final_path.display(), bytes = message.len(), "message spooled");
        Ok(id)
    }
}
