use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::{Child, Command};

use crate::error::{Error, Result};

/// `max(int(name[:-3]) for name matching \d+\.ts) + 1`, or 1 if the
/// directory has no numbered segments yet. Guarantees monotonically
/// increasing segment numbers across supervisor restarts.
pub fn compute_start_number(hls_dir: &Path) -> u64 {
    let mut max_seen: Option<u64> = None;
    if let Ok(entries) = std::fs::read_dir(hls_dir) {
        for entry in entries.flatten() {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(stem) = name.strip_suffix(".ts") {
                    if let Ok(n) = stem.parse::<u64>() {
                        max_seen = Some(max_seen.map_or(n, |m| m.max(n)));
                    }
                }
            }
        }
    }
    max_seen.map_or(1, |m| m + 1)
}

pub struct Segmenter {
    pub child: Child,
    pub start_number: u64,
    pub playlist_path: PathBuf,
}

/// Spawns the HLS segmenter reading MPEG-TS from stdin (the cleaner's
/// output). Video is re-encoded to H.264 baseline level 3.1 with a fixed
/// GOP so segment boundaries land on keyframes; audio to AAC stereo
/// 128kbps. Output is a rolling 10-entry HLS window with `start_number`
/// recomputed before every spawn.
pub async fn spawn(hls_dir: &Path) -> Result<Segmenter> {
    tokio::fs::create_dir_all(hls_dir).await?;
    let start_number = compute_start_number(hls_dir);
    let segment_pattern = hls_dir.join("%d.ts");
    let playlist_path = hls_dir.join("live.m3u8");

    let child = Command::new("ffmpeg")
        .args([
            "-re",
            "-threads",
            "1",
            "-fflags",
            "+genpts+igndts",
            "-analyzeduration",
            "10M",
            "-probesize",
            "10M",
            "-i",
            "pipe:0",
            "-map",
            "0:v:0",
            "-map",
            "0:a?",
            "-c:v",
            "libx264",
            "-profile:v",
            "baseline",
            "-level",
            "3.1",
            "-pix_fmt",
            "yuv420p",
            "-g",
            "48",
            "-sc_threshold",
            "0",
            "-keyint_min",
            "48",
            "-preset",
            "veryfast",
            "-c:a",
            "aac",
            "-b:a",
            "128k",
            "-ac",
            "2",
            "-f",
            "hls",
            "-hls_time",
            "4",
            "-hls_list_size",
            "10",
            "-hls_flags",
            "delete_segments+append_list+omit_endlist+independent_segments",
            "-start_number",
        ])
        .arg(start_number.to_string())
        .args(["-hls_segment_filename"])
        .arg(&segment_pattern)
        .arg(&playlist_path)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::Other(e.into()))?;

    Ok(Segmenter { child, start_number, playlist_path })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_number_is_one_when_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(compute_start_number(dir.path()), 1);
    }

    #[test]
    fn start_number_continues_after_existing_segments() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("0.ts"), b"").unwrap();
        std::fs::write(dir.path().join("7.ts"), b"").unwrap();
        std::fs::write(dir.path().join("3.ts"), b"").unwrap();
        assert_eq!(compute_start_number(dir.path()), 8);
    }

    #[test]
    fn start_number_ignores_non_segment_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("live.m3u8"), b"").unwrap();
        std::fs::write(dir.path().join("5.ts"), b"").unwrap();
        assert_eq!(compute_start_number(dir.path()), 6);
    }
}
