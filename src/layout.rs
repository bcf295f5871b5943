use std::path::PathBuf;

use crate::torrent::{FileEntry, Torrent};

/// A contiguous byte range inside exactly one destination file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSpan {
    /// Index into the layout's file table.
    pub file: usize,
    /// Path relative to the download root.
    pub path: PathBuf,
    /// Offset inside the file.
    pub offset: u64,
    /// Bytes covered by this span.
    pub length: usize,
}

/// Maps piece indices onto the flat address space formed by concatenating
/// the destination files in declared order.
///
/// Pure bookkeeping: no I/O, deterministic for a given file list.
#[derive(Debug, Clone)]
pub struct FileLayout {
    files: Vec<FileEntry>,
    piece_length: usize,
    total_length: u64,
    num_pieces: usize,
}

impl FileLayout {
    pub fn new(files: Vec<FileEntry>, piece_length: usize) -> Self {
        let total_length: u64 = files.iter().map(|f| f.length).sum();
        let num_pieces = total_length.div_ceil(piece_length as u64) as usize;
        Self {
            files,
            piece_length,
            total_length,
            num_pieces,
        }
    }

    pub fn for_torrent(torrent: &Torrent) -> Self {
        Self::new(torrent.files(), torrent.piece_length())
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    pub fn num_pieces(&self) -> usize {
        self.num_pieces
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    /// Effective size of piece `index`; the final piece carries the
    /// remainder and may be shorter than the declared piece length.
    pub fn piece_size(&self, index: usize) -> usize {
        let start = index as u64 * self.piece_length as u64;
        let end = (start + self.piece_length as u64).min(self.total_length);
        end.saturating_sub(start) as usize
    }

    /// Spans covering the global range `[index * piece_length, +piece_len)`,
    /// in file order, each with its file-local offset.
    pub fn spans(&self, index: usize, piece_len: usize) -> Vec<FileSpan> {
        let start = index as u64 * self.piece_length as u64;
        let end = start + piece_len as u64;

        let mut spans = Vec::new();
        let mut file_start = 0u64;
        for (file, entry) in self.files.iter().enumerate() {
            let file_end = file_start + entry.length;
            let lo = start.max(file_start);
            let hi = end.min(file_end);
            if lo < hi {
                spans.push(FileSpan {
                    file,
                    path: entry.path.clone(),
                    offset: lo - file_start,
                    length: (hi - lo) as usize,
                });
            }
            file_start = file_end;
            if file_start >= end {
                break;
            }
        }
        spans
    }
}
