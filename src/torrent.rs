use serde::Deserialize;
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{Error, Result};

/// Length of a SHA-1 digest; piece hashes and the info hash are this size.
pub const HASH_LEN: usize = 20;

/// Immutable parsed view of a `.torrent` file.
///
/// Constructed once at startup and shared by reference with every other
/// component; the info hash is computed at construction from the canonical
/// re-encoding of the info dictionary.
#[derive(Debug, Deserialize)]
pub struct Torrent {
    pub announce: String,
    pub info: Info,
    #[serde(skip)]
    info_hash: [u8; HASH_LEN],
}

/// The `info` dictionary of a `.torrent` file.
#[derive(Debug, Deserialize)]
pub struct Info {
    pub name: String,
    #[serde(rename = "piece length")]
    pub piece_length: i64,
    pub pieces: ByteBuf,
    pub length: Option<i64>,
    pub files: Option<Vec<InfoFile>>,
}

/// One entry of the `files` list in a multi-file torrent.
#[derive(Debug, Deserialize)]
pub struct InfoFile {
    pub length: i64,
    pub path: Vec<String>,
}

/// A destination file: path relative to the download root plus final size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: PathBuf,
    pub length: u64,
}

impl Torrent {
    /// Reads and parses a `.torrent` file from disk.
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = fs::read(path).map_err(|e| Error::Metadata(format!("{}: {e}", path.display())))?;
        Self::from_bytes(&data)
    }

    /// Parses torrent metadata from a raw bencoded buffer.
    ///
    /// The buffer is decoded twice: once into a generic value tree to
    /// recover the exact bytes of the `info` dictionary for hashing, once
    /// into the typed structure.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let tree: BTreeMap<String, serde_bencode::value::Value> =
            serde_bencode::from_bytes(data).map_err(|e| Error::Metadata(e.to_string()))?;

        let info_value = tree
            .get("info")
            .ok_or_else(|| Error::Metadata("missing info dictionary".into()))?;
        let info_bytes =
            serde_bencode::to_bytes(info_value).map_err(|e| Error::Metadata(e.to_string()))?;

        let digest = Sha1::digest(&info_bytes);
        let mut info_hash = [0u8; HASH_LEN];
        info_hash.copy_from_slice(&digest);

        let torrent: Torrent =
            serde_bencode::from_bytes(data).map_err(|e| Error::Metadata(e.to_string()))?;
        let torrent = Torrent {
            info_hash,
            ..torrent
        };
        torrent.validate()?;
        Ok(torrent)
    }

    fn validate(&self) -> Result<()> {
        if self.info.piece_length <= 0 {
            return Err(Error::Metadata("piece length must be positive".into()));
        }
        if self.info.pieces.len() % HASH_LEN != 0 {
            return Err(Error::Metadata(format!(
                "pieces field length {} is not a multiple of {HASH_LEN}",
                self.info.pieces.len()
            )));
        }
        let total = self.total_size();
        if total == 0 {
            return Err(Error::Metadata("torrent has no content".into()));
        }
        let expected = total.div_ceil(self.info.piece_length as u64) as usize;
        if self.pieces_count() != expected {
            return Err(Error::Metadata(format!(
                "{} piece hashes for {} expected pieces",
                self.pieces_count(),
                expected
            )));
        }
        Ok(())
    }

    /// SHA-1 of the bencoded info dictionary, computed at construction.
    pub fn info_hash(&self) -> [u8; HASH_LEN] {
        self.info_hash
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn is_multi_file(&self) -> bool {
        self.info.files.is_some()
    }

    /// Total content size across all files.
    pub fn total_size(&self) -> u64 {
        self.files().iter().map(|f| f.length).sum()
    }

    /// Destination files in declared order.
    ///
    /// Multi-file torrents nest every path under a directory named from the
    /// info `name` field; single-file torrents produce one entry named from
    /// it directly.
    pub fn files(&self) -> Vec<FileEntry> {
        match &self.info.files {
            Some(files) => files
                .iter()
                .map(|f| {
                    let mut path = PathBuf::from(&self.info.name);
                    for part in &f.path {
                        path.push(part);
                    }
                    FileEntry {
                        path,
                        length: f.length.max(0) as u64,
                    }
                })
                .collect(),
            None => vec![FileEntry {
                path: PathBuf::from(&self.info.name),
                length: self.info.length.unwrap_or(0).max(0) as u64,
            }],
        }
    }

    pub fn pieces_count(&self) -> usize {
        self.info.pieces.len() / HASH_LEN
    }

    /// Declared piece size; the final piece may be shorter.
    pub fn piece_length(&self) -> usize {
        self.info.piece_length as usize
    }

    /// Expected SHA-1 digest of piece `index`.
    ///
    /// Callers must keep `index < pieces_count()`.
    pub fn piece_hash(&self, index: usize) -> [u8; HASH_LEN] {
        let mut hash = [0u8; HASH_LEN];
        hash.copy_from_slice(&self.info.pieces[index * HASH_LEN..(index + 1) * HASH_LEN]);
        hash
    }

    pub fn log_summary(&self) {
        info!(
            name = %self.info.name,
            announce = %self.announce,
            info_hash = %hex::encode(self.info_hash),
            piece_length = self.piece_length(),
            pieces = self.pieces_count(),
            total_bytes = self.total_size(),
            files = self.files().len(),
            "loaded torrent"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bstr(out: &mut Vec<u8>, value: &[u8]) {
        out.extend_from_slice(format!("{}:", value.len()).as_bytes());
        out.extend_from_slice(value);
    }

    /// Hand-assembled single-file torrent; returns the full document and
    /// the exact info-dictionary bytes for hash comparison.
    fn single_file_torrent(name: &str, piece_length: usize, content: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let mut pieces = Vec::new();
        for chunk in content.chunks(piece_length) {
            pieces.extend_from_slice(&Sha1::digest(chunk));
        }

        let mut info = Vec::new();
        info.extend_from_slice(b"d6:length");
        info.extend_from_slice(format!("i{}e", content.len()).as_bytes());
        info.extend_from_slice(b"4:name");
        bstr(&mut info, name.as_bytes());
        info.extend_from_slice(b"12:piece length");
        info.extend_from_slice(format!("i{piece_length}e").as_bytes());
        info.extend_from_slice(b"6:pieces");
        bstr(&mut info, &pieces);
        info.push(b'e');

        let mut doc = Vec::new();
        doc.extend_from_slice(b"d8:announce");
        bstr(&mut doc, b"http://tracker.test/announce");
        doc.extend_from_slice(b"4:info");
        doc.extend_from_slice(&info);
        doc.push(b'e');
        (doc, info)
    }

    #[test]
    fn parses_single_file_torrent() {
        let content = vec![7u8; 100_000];
        let (doc, info) = single_file_torrent("demo.bin", 32_768, &content);
        let torrent = Torrent::from_bytes(&doc).unwrap();

        assert_eq!(torrent.name(), "demo.bin");
        assert!(!torrent.is_multi_file());
        assert_eq!(torrent.total_size(), 100_000);
        assert_eq!(torrent.piece_length(), 32_768);
        assert_eq!(torrent.pieces_count(), 4);
        assert_eq!(
            torrent.files(),
            vec![FileEntry {
                path: PathBuf::from("demo.bin"),
                length: 100_000,
            }]
        );

        let expected: [u8; HASH_LEN] = Sha1::digest(&info).into();
        assert_eq!(torrent.info_hash(), expected);
    }

    #[test]
    fn parses_multi_file_torrent() {
        let piece_length = 16_384;
        let content = vec![1u8; 20_000];
        let mut pieces = Vec::new();
        for chunk in content.chunks(piece_length) {
            pieces.extend_from_slice(&Sha1::digest(chunk));
        }

        let mut info = Vec::new();
        info.extend_from_slice(b"d5:filesl");
        info.extend_from_slice(b"d6:lengthi12000e4:pathl5:a.txtee");
        info.extend_from_slice(b"d6:lengthi8000e4:pathl3:sub5:b.txtee");
        info.extend_from_slice(b"e4:name4:demo12:piece lengthi16384e6:pieces");
        bstr(&mut info, &pieces);
        info.push(b'e');

        let mut doc = Vec::new();
        doc.extend_from_slice(b"d8:announce");
        bstr(&mut doc, b"http://tracker.test/announce");
        doc.extend_from_slice(b"4:info");
        doc.extend_from_slice(&info);
        doc.push(b'e');

        let torrent = Torrent::from_bytes(&doc).unwrap();
        assert!(torrent.is_multi_file());
        assert_eq!(torrent.total_size(), 20_000);
        assert_eq!(
            torrent
                .files()
                .iter()
                .map(|f| f.path.clone())
                .collect::<Vec<_>>(),
            vec![PathBuf::from("demo/a.txt"), PathBuf::from("demo/sub/b.txt")]
        );
    }

    #[test]
    fn piece_hashes_are_indexed_slices() {
        let content: Vec<u8> = (0..70_000u32).map(|i| (i % 251) as u8).collect();
        let (doc, _) = single_file_torrent("demo.bin", 32_768, &content);
        let torrent = Torrent::from_bytes(&doc).unwrap();

        let last: [u8; HASH_LEN] = Sha1::digest(&content[65_536..]).into();
        assert_eq!(torrent.piece_hash(2), last);
    }

    #[test]
    fn hash_count_mismatch_is_rejected() {
        let content = vec![7u8; 100_000];
        let (mut doc, _) = single_file_torrent("demo.bin", 32_768, &content);
        // Claim a larger content length than the hash list covers.
        let needle = b"6:lengthi100000e".as_slice();
        let pos = doc.windows(needle.len()).position(|w| w == needle).unwrap();
        doc.splice(pos..pos + needle.len(), b"6:lengthi999999e".iter().copied());

        assert!(matches!(
            Torrent::from_bytes(&doc),
            Err(Error::Metadata(_))
        ));
    }

    #[test]
    fn truncated_pieces_field_is_rejected() {
        let doc = b"d8:announce3:urk4:infod6:lengthi10e4:name1:x12:piece lengthi16384e6:pieces3:abcee";
        assert!(matches!(
            Torrent::from_bytes(doc),
            Err(Error::Metadata(_))
        ));
    }
}
