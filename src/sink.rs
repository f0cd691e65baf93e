//!
//! src/sink.rs
//!
//! Raw payload archive: every provider response is written to disk as
//! zstd-compressed json, keyed by track, so any reconciliation decision
//! can be audited or replayed against the exact bytes it saw.
//!

use std::{fs, path::{Path, PathBuf}};

use serde_json::Value;

use crate::errors::PipelineError;
use crate::fetch::SourceKind;

pub struct RawSink {
    root: PathBuf,
    level: i32,
}

impl RawSink {
    pub fn new(root: impl AsRef<Path>, level: i32) -> Self {
        Self { root: root.as_ref().to_path_buf(), level: level.clamp(0, 21) }
    }

    pub fn write_json(&self, kind: SourceKind, key: &str, json: &Value)
        -> Result<PathBuf, PipelineError> {
        let rel = Self::rel_path(kind, &Self::sanitize_key(key));
        let path = self.root.join(rel);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp = tempfile::NamedTempFile::new_in(
            path.parent().unwrap_or(&self.root)
        )?;
        {
            let mut enc = zstd::stream::write::Encoder::new(temp.as_file(), self.level)
                .map_err(|e| PipelineError::Io(e))?;
            serde_json::to_writer(&mut enc, json)?;
            enc.finish().map_err(PipelineError::Io)?;
        }
        temp.persist(&path)
            .map_err(|e| PipelineError::Io(e.error))?;

        Ok(path)
    }

    fn rel_path(kind: SourceKind, key: &str) -> PathBuf {
        match kind {
            SourceKind::Primary =>
                PathBuf::from("lyrics/primary").join(format!("{key}.json.zst")),
            SourceKind::Secondary =>
                PathBuf::from("lyrics/secondary").join(format!("{key}.json.zst")),
        }
    }

    fn sanitize_key(key: &str) -> String {
        key.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn writes_and_sanitizes_keys() {
        let dir = tempfile::tempdir().unwrap();
        let sink = RawSink::new(dir.path(), 3);
        let path = sink.write_json(
            SourceKind::Primary,
            "track/with:odd chars",
            &json!({"plainLyrics": "la la la"}),
        ).unwrap();
        assert!(path.ends_with("lyrics/primary/track_with_odd_chars.json.zst"));
        assert!(path.exists());
    }
}
