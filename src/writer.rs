use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Error, Result};
use crate::layout::FileLayout;

struct Target {
    path: PathBuf,
    file: Mutex<File>,
}

/// Owns the destination file handles and performs positioned piece writes.
///
/// Every file is created at its final size before the first write, so
/// out-of-order piece arrival never grows a file. Handles stay open for
/// the download's lifetime; writes to one file serialize on its mutex,
/// writes to different files do not contend.
pub struct FileWriter {
    layout: FileLayout,
    targets: Vec<Target>,
}

impl FileWriter {
    /// Creates every destination file under `root` (parent directories
    /// included) sized to its final length.
    pub async fn preallocate(layout: FileLayout, root: &Path) -> Result<Self> {
        let mut targets = Vec::with_capacity(layout.files().len());
        for entry in layout.files() {
            let path = resolve(root, &entry.path)?;
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await.map_err(|e| Error::Persistence {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)
                .await
                .map_err(|e| Error::Persistence {
                    path: path.clone(),
                    source: e,
                })?;
            file.set_len(entry.length)
                .await
                .map_err(|e| Error::Persistence {
                    path: path.clone(),
                    source: e,
                })?;
            debug!(path = %path.display(), bytes = entry.length, "preallocated");
            targets.push(Target {
                path,
                file: Mutex::new(file),
            });
        }
        Ok(Self { layout, targets })
    }

    pub fn layout(&self) -> &FileLayout {
        &self.layout
    }

    /// Writes a verified piece into every file span it covers.
    pub async fn write_piece(&self, index: usize, bytes: &[u8]) -> Result<()> {
        let mut consumed = 0usize;
        for span in self.layout.spans(index, bytes.len()) {
            let chunk = &bytes[consumed..consumed + span.length];
            let target = &self.targets[span.file];
            let mut file = target.file.lock().await;
            file.seek(SeekFrom::Start(span.offset))
                .await
                .map_err(|e| Error::Persistence {
                    path: target.path.clone(),
                    source: e,
                })?;
            file.write_all(chunk).await.map_err(|e| Error::Persistence {
                path: target.path.clone(),
                source: e,
            })?;
            file.flush().await.map_err(|e| Error::Persistence {
                path: target.path.clone(),
                source: e,
            })?;
            consumed += span.length;
        }
        Ok(())
    }
}

/// Joins a metadata-relative path onto the download root, refusing the
/// absolute paths and `..` components a hostile torrent could carry.
fn resolve(root: &Path, relative: &Path) -> Result<PathBuf> {
    for component in relative.components() {
        match component {
            Component::Normal(_) => {}
            _ => {
                return Err(Error::Metadata(format!(
                    "unsafe path in torrent: {}",
                    relative.display()
                )));
            }
        }
    }
    Ok(root.join(relative))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::FileEntry;

    fn entry(path: &str, length: u64) -> FileEntry {
        FileEntry {
            path: PathBuf::from(path),
            length,
        }
    }

    #[tokio::test]
    async fn preallocates_every_file_at_final_size() {
        let dir = tempfile::tempdir().unwrap();
        let layout = FileLayout::new(
            vec![entry("demo/a.bin", 10_000), entry("demo/sub/b.bin", 3_000)],
            16_384,
        );
        let _writer = FileWriter::preallocate(layout, dir.path()).await.unwrap();

        let a = std::fs::metadata(dir.path().join("demo/a.bin")).unwrap();
        let b = std::fs::metadata(dir.path().join("demo/sub/b.bin")).unwrap();
        assert_eq!(a.len(), 10_000);
        assert_eq!(b.len(), 3_000);
    }

    #[tokio::test]
    async fn pieces_written_out_of_order_reproduce_the_content() {
        let dir = tempfile::tempdir().unwrap();
        let piece_length = 1_000;
        let content: Vec<u8> = (0..2_500u32).map(|i| (i % 251) as u8).collect();
        let layout = FileLayout::new(vec![entry("a.bin", 1_500), entry("b.bin", 1_000)], piece_length);
        let writer = FileWriter::preallocate(layout, dir.path()).await.unwrap();

        // Last piece first: preallocation means no file ever needs to grow.
        for index in [2usize, 0, 1] {
            let start = index * piece_length;
            let end = (start + piece_length).min(content.len());
            writer.write_piece(index, &content[start..end]).await.unwrap();
        }

        let mut written = std::fs::read(dir.path().join("a.bin")).unwrap();
        written.extend(std::fs::read(dir.path().join("b.bin")).unwrap());
        assert_eq!(written, content);
    }

    #[tokio::test]
    async fn parent_traversal_in_metadata_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let layout = FileLayout::new(vec![entry("../escape.bin", 100)], 16_384);
        let result = FileWriter::preallocate(layout, dir.path()).await;
        assert!(matches!(result, Err(Error::Metadata(_))));
    }
}
