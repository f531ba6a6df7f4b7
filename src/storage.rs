//! Writing completed pieces to the output files.
//!
//! The torrent payload is the logical concatenation of its files. A
//! precomputed offset table maps any byte range of that concatenation to
//! the files it touches; a completed piece is split across them by binary
//! search and written at the translated offsets. Files are created lazily
//! on first write, pre-sized to their final length, and closed once fully
//! written.
use crate::torrent::{Layout, Metainfo};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsafe output path: {0}")]
    UnsafePath(String),

    #[error("piece {0} does not fit the payload")]
    PieceOutOfRange(u32),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// One output file and its range in the concatenated payload.
#[derive(Debug)]
struct FileSlot {
    path: PathBuf,
    /// Absolute range `[start, end)` in the concatenation.
    start: u64,
    end: u64,
    /// Open handle, present only between first write and finalize.
    file: Option<File>,
    written: u64,
}

impl FileSlot {
    fn length(&self) -> u64 {
        self.end - self.start
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()> {
        if self.file.is_none() {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            // Fail rather than clobber an existing file at the target path.
            let file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.path)?;
            file.set_len(self.length())?;
            debug!(path = %self.path.display(), size = self.length(), "created output file");
            self.file = Some(file);
        }
        if let Some(file) = self.file.as_mut() {
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(data)?;
        }
        self.written += data.len() as u64;
        if self.written == self.length() {
            // Fully written; drop the handle.
            self.file = None;
            debug!(path = %self.path.display(), "output file complete");
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct Storage {
    slots: Vec<FileSlot>,
    piece_length: u64,
    total_size: u64,
}

impl Storage {
    /// Builds the offset table for a torrent under `out_dir`.
    ///
    /// Single-file torrents write `out_dir/<name>`; multi-file torrents
    /// write `out_dir/<name>/<path>`. Every path component is validated
    /// here: empty, `.`, `..`, and separator-bearing components are
    /// refused, so a hostile metainfo cannot escape the output directory.
    pub fn new(metainfo: &Metainfo, out_dir: &Path) -> StorageResult<Self> {
        let name = if metainfo.info.suggested_name.is_empty() {
            "download"
        } else {
            metainfo.info.suggested_name.as_str()
        };
        check_component(name)?;

        let mut slots = Vec::new();
        match &metainfo.info.layout {
            Layout::Single { length } => {
                slots.push(FileSlot {
                    path: out_dir.join(name),
                    start: 0,
                    end: *length,
                    file: None,
                    written: 0,
                });
            }
            Layout::Multi { files } => {
                let root = out_dir.join(name);
                let mut offset = 0;
                for entry in files {
                    let mut path = root.clone();
                    for component in entry.path.split('/') {
                        check_component(component)?;
                        path.push(component);
                    }
                    slots.push(FileSlot {
                        path,
                        start: offset,
                        end: offset + entry.length,
                        file: None,
                        written: 0,
                    });
                    offset += entry.length;
                }
            }
        }
        Ok(Self {
            slots,
            piece_length: metainfo.info.piece_length,
            total_size: metainfo.total_size(),
        })
    }

    /// Writes one completed piece at its offset in the payload, splitting
    /// it across every file the piece's range overlaps.
    pub fn write_piece(&mut self, index: u32, data: &[u8]) -> StorageResult<()> {
        let piece_start = u64::from(index) * self.piece_length;
        let piece_end = piece_start + data.len() as u64;
        if piece_end > self.total_size || piece_start >= piece_end {
            return Err(StorageError::PieceOutOfRange(index));
        }
        // First slot whose range reaches past the piece start.
        let mut slot_index = self.slots.partition_point(|slot| slot.end <= piece_start);
        while slot_index < self.slots.len() && self.slots[slot_index].start < piece_end {
            let slot = &mut self.slots[slot_index];
            let start = piece_start.max(slot.start);
            let end = piece_end.min(slot.end);
            let data_range = (start - piece_start) as usize..(end - piece_start) as usize;
            slot.write_at(start - slot.start, &data[data_range])?;
            slot_index += 1;
        }
        Ok(())
    }

    pub fn total_written(&self) -> u64 {
        self.slots.iter().map(|slot| slot.written).sum()
    }
}

fn check_component(component: &str) -> StorageResult<()> {
    if component.is_empty()
        || component == "."
        || component == ".."
        || component.contains('/')
        || component.contains('\\')
    {
        return Err(StorageError::UnsafePath(component.to_owned()));
    }
    Ok(())
}
