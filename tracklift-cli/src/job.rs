use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracklift_engine::{MediaType, Track};

use crate::error::{AppError, Result};

/// A job file: the tracks to acquire. Segment indices come from position.
#[derive(Debug, Deserialize)]
pub struct JobDocument {
    pub tracks: Vec<Track>,
}

impl JobDocument {
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut document: JobDocument = serde_json::from_str(content)?;
        if document.tracks.is_empty() {
            return Err(AppError::InvalidInput("job contains no tracks".into()));
        }

        let mut seen = BTreeSet::new();
        for track in &mut document.tracks {
            if !seen.insert(track.id.clone()) {
                return Err(AppError::InvalidInput(format!(
                    "duplicate track id `{}`",
                    track.id
                )));
            }
            track.renumber_segments();
        }
        Ok(document)
    }

    /// DRM systems named by the protected tracks.
    pub fn scopes(&self) -> BTreeSet<String> {
        self.tracks
            .iter()
            .filter_map(|t| t.protection.as_ref())
            .map(|p| p.system().as_str().to_string())
            .collect()
    }
}

/// `<dir>/<track id>.<ext>`, with path separators in the id replaced.
pub fn output_path(dir: &Path, track: &Track) -> PathBuf {
    let stem: String = track
        .id
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let ext = match track.kind {
        MediaType::Video => "mp4",
        MediaType::Audio => "m4a",
        MediaType::Subtitle => "vtt",
    };
    dir.join(format!("{stem}.{ext}"))
}
