//! Assembles downloaded pieces into their destination file(s) on disk.
//!
//! A torrent's pieces map onto one contiguous logical byte stream; for a
//! multi-file torrent that stream is the concatenation of every file in
//! `info.files` order. Writing a piece means slicing it against each file's
//! byte range and writing the overlapping portion at the right offset.
use crate::torrent::file::TorrentFile;
use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::instrument;

pub struct Output {
    base_dir: PathBuf,
}

impl Output {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Creates every destination file up front, preallocated to its final
    /// length, so later piece writes can seek directly to their offset.
    #[instrument(skip(self, torrent))]
    pub fn prepare(&self, torrent: &TorrentFile) -> Result<()> {
        if torrent.info.is_directory {
            for file in &torrent.info.files {
                let path = self.file_path(torrent, file);
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("creating directory {}", parent.display()))?;
                    set_dir_permissions(parent)?;
                }
                create_preallocated(&path, file.length as u64)?;
            }
        } else {
            fs::create_dir_all(&self.base_dir)
                .with_context(|| format!("creating directory {}", self.base_dir.display()))?;
            let path = self.base_dir.join(&torrent.info.name);
            create_preallocated(&path, torrent.info.length.unwrap_or(0) as u64)?;
        }
        Ok(())
    }

    /// Writes one piece's verified bytes to the file(s) that own its byte
    /// range.
    #[instrument(skip(self, torrent, data), fields(piece = index, len = data.len()))]
    pub fn write_piece(&self, torrent: &TorrentFile, index: usize, data: &[u8]) -> Result<()> {
        let piece_start = index as i64 * torrent.info.piece_length;
        let piece_end = piece_start + data.len() as i64;

        if !torrent.info.is_directory {
            let path = self.base_dir.join(&torrent.info.name);
            return write_at(&path, piece_start as u64, data);
        }

        let mut current_data_position: i64 = 0;
        for file in &torrent.info.files {
            let file_start = current_data_position;
            let file_end = file_start + file.length;

            if file_end > piece_start && file_start < piece_end {
                let overlap_start = piece_start.max(file_start);
                let overlap_end = piece_end.min(file_end);
                let slice_start = (overlap_start - piece_start) as usize;
                let slice_end = (overlap_end - piece_start) as usize;
                let file_offset = (overlap_start - file_start) as u64;

                let path = self.file_path(torrent, file);
                write_at(&path, file_offset, &data[slice_start..slice_end])?;
            }
            current_data_position = file_end;
        }
        Ok(())
    }

    fn file_path(&self, torrent: &TorrentFile, file: &crate::torrent::file::FileDict) -> PathBuf {
        let mut path = self.base_dir.join(&torrent.info.name);
        for component in &file.path {
            path = path.join(component);
        }
        path
    }
}

fn create_preallocated(path: &Path, length: u64) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    file.set_len(length)
        .with_context(|| format!("preallocating {} to {} bytes", path.display(), length))?;
    set_file_permissions(path)?;
    Ok(())
}

fn write_at(path: &Path, offset: u64, data: &[u8]) -> Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .open(path)
        .with_context(|| format!("opening {} for writing", path.display()))?;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(data)
        .with_context(|| format!("writing {} bytes at offset {} of {}", data.len(), offset, path.display()))?;
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o660))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::file::{FileDict, InfoDict, TorrentFile};

    fn multi_file_torrent() -> TorrentFile {
        TorrentFile {
            announce: "http://tracker.local".to_string(),
            announce_list: Vec::new(),
            creation_date: None,
            comment: String::new(),
            created_by: String::new(),
            encoding: String::new(),
            info: InfoDict {
                piece_length: 4,
                pieces: Vec::new(),
                private: false,
                name: "bundle".to_string(),
                length: None,
                files: vec![
                    FileDict { length: 3, path: vec!["a.txt".to_string()] },
                    FileDict { length: 5, path: vec!["b.txt".to_string()] },
                ],
                is_directory: true,
            },
            info_hash: [0u8; 20],
            pieces_hash: Vec::new(),
        }
    }

    #[test]
    fn writes_piece_spanning_two_files() {
        let dir = tempfile::tempdir().unwrap();
        let out = Output::new(dir.path());
        let torrent = multi_file_torrent();
        out.prepare(&torrent).unwrap();

        // Piece 0 covers bytes [0,4): all 3 bytes of a.txt, then 1 byte of b.txt.
        out.write_piece(&torrent, 0, b"WXYZ").unwrap();

        let a = fs::read(dir.path().join("bundle/a.txt")).unwrap();
        let b = fs::read(dir.path().join("bundle/b.txt")).unwrap();
        assert_eq!(&a, b"WXY");
        assert_eq!(&b[..1], b"Z");
    }
}
