//! Asynchronous JSONL reader with follow mode and file rotation detection

use std::io::SeekFrom;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::time::sleep;

#[cfg(unix)]
use std::os::unix::fs::MetadataExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Read existing lines from the beginning, end at EOF
    Once,
    /// Skip existing content and wait for appended lines
    Follow,
}

pub struct TailReader {
    path: PathBuf,
    mode: ReadMode,
    file: Option<BufReader<File>>,
    inode: Option<u64>,
    position: u64,
    line_number: u64,
    pending: Vec<u8>,
    poll_interval: Duration,
}

/// Trimmed text of one input line, `None` if blank. Invalid UTF-8 rejects
/// only this line.
pub fn decode_line(bytes: &[u8]) -> Result<Option<&str>, std::str::Utf8Error> {
    let line = std::str::from_utf8(bytes)?.trim();
    Ok((!line.is_empty()).then_some(line))
}

impl TailReader {
    pub fn new(path: PathBuf, mode: ReadMode) -> Self {
        Self {
            path,
            mode,
            file: None,
            inode: None,
            position: 0,
            line_number: 0,
            pending: Vec::new(),
            poll_interval: Duration::from_millis(100),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Open the file. Follow mode seeks to the end.
    pub async fn start(&mut self) -> std::io::Result<()> {
        let seek_end = self.mode == ReadMode::Follow;
        self.open(seek_end).await?;

        match self.mode {
            ReadMode::Once => log::info!("📖 Reading: {}", self.path.display()),
            ReadMode::Follow => log::info!("📖 Started tailing: {}", self.path.display()),
        }
        Ok(())
    }

    async fn open(&mut self, seek_end: bool) -> std::io::Result<()> {
        let file = File::open(&self.path).await?;

        #[cfg(unix)]
        {
            self.inode = Some(file.metadata().await?.ino());
        }

        let mut reader = BufReader::new(file);
        self.position = if seek_end {
            reader.seek(SeekFrom::End(0)).await?
        } else {
            0
        };
        self.line_number = 0;
        self.pending.clear();
        self.file = Some(reader);
        Ok(())
    }

    /// Next non-empty line, trimmed.
    ///
    /// In `Once` mode returns `None` at EOF. In `Follow` mode waits for more
    /// data and never returns `None`; a partial trailing line is held until
    /// its newline arrives. A line that is not valid UTF-8 is logged and
    /// skipped.
    pub async fn read_line(&mut self) -> std::io::Result<Option<String>> {
        loop {
            if self.mode == ReadMode::Follow && self.detect_rotation().await? {
                log::info!("🔄 File rotation detected, reopening: {}", self.path.display());
                // A rotated-in file is new content, read it from the start
                self.open(false).await?;
            }

            let reader = self.file.as_mut().ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotFound, "File not opened")
            })?;

            // Partial reads stay in `pending` if this future is dropped
            let read = reader.read_until(b'\n', &mut self.pending).await?;
            self.position += read as u64;

            if read == 0 {
                match self.mode {
                    ReadMode::Once if self.pending.is_empty() => return Ok(None),
                    // Unterminated last line
                    ReadMode::Once => {}
                    ReadMode::Follow => {
                        sleep(self.poll_interval).await;
                        continue;
                    }
                }
            } else if !self.pending.ends_with(b"\n") {
                continue;
            }

            let bytes = std::mem::take(&mut self.pending);
            self.line_number += 1;
            match decode_line(&bytes) {
                Ok(Some(line)) => return Ok(Some(line.to_string())),
                Ok(None) => continue,
                Err(e) => log::warn!(
                    "Skipping line {} of {}: {}",
                    self.line_number,
                    self.path.display(),
                    e
                ),
            }
        }
    }

    /// Physical line number of the last line read, blank lines included
    pub fn line_number(&self) -> u64 {
        self.line_number
    }

    /// Rotated (inode changed) or truncated below the read position
    async fn detect_rotation(&self) -> std::io::Result<bool> {
        let metadata = match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => metadata,
            // Between rename and recreate; keep reading the old handle
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e),
        };

        #[cfg(unix)]
        {
            if self.inode.map_or(false, |old| old != metadata.ino()) {
                return Ok(true);
            }
        }

        Ok(metadata.len() < self.position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    async fn append(path: &std::path::Path, data: &[u8]) {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .unwrap();
        file.write_all(data).await.unwrap();
        file.flush().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_once_from_start() {
        let temp_dir = tempfile::tempdir().unwrap();
        let file_path = temp_dir.path().join("events.jsonl");
        append(&file_path, b"line1\n\n  line2  \nline3").await;

        let mut reader = TailReader::new(file_path, ReadMode::Once);
        reader.start().await.unwrap();

        assert_eq!(reader.read_line().await.unwrap().as_deref(), Some("line1"));
        assert_eq!(reader.read_line().await.unwrap().as_deref(), Some("line2"));
        // Unterminated last line is still returned at EOF
        assert_eq!(reader.read_line().await.unwrap().as_deref(), Some("line3"));
        assert_eq!(reader.read_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_invalid_utf8_line_is_skipped() {
        let temp_dir = tempfile::tempdir().unwrap();
        let file_path = temp_dir.path().join("events.jsonl");
        append(&file_path, b"line1\n\xff\xfe broken\nline3\n").await;

        let mut reader = TailReader::new(file_path, ReadMode::Once);
        reader.start().await.unwrap();

        assert_eq!(reader.read_line().await.unwrap().as_deref(), Some("line1"));
        assert_eq!(reader.read_line().await.unwrap().as_deref(), Some("line3"));
        assert_eq!(reader.line_number(), 3);
        assert_eq!(reader.read_line().await.unwrap(), None);
    }

    #[test]
    fn test_decode_line() {
        assert_eq!(decode_line(b"  {\"a\":1}\r\n"), Ok(Some("{\"a\":1}")));
        assert_eq!(decode_line(b" \n"), Ok(None));
        assert!(decode_line(b"\xc3\x28\n").is_err());
    }

    #[tokio::test]
    async fn test_follow_skips_existing_content() {
        let temp_dir = tempfile::tempdir().unwrap();
        let file_path = temp_dir.path().join("events.jsonl");
        append(&file_path, b"line1\nline2\n").await;

        let mut reader = TailReader::new(file_path.clone(), ReadMode::Follow)
            .with_poll_interval(Duration::from_millis(10));
        reader.start().await.unwrap();

        append(&file_path, b"line3\n").await;

        let line = tokio::time::timeout(Duration::from_secs(2), reader.read_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(line, "line3");
    }

    #[tokio::test]
    async fn test_follow_waits_for_complete_line() {
        let temp_dir = tempfile::tempdir().unwrap();
        let file_path = temp_dir.path().join("events.jsonl");
        append(&file_path, b"").await;

        let mut reader = TailReader::new(file_path.clone(), ReadMode::Follow)
            .with_poll_interval(Duration::from_millis(10));
        reader.start().await.unwrap();

        append(&file_path, b"{\"topic\":").await;
        let early = tokio::time::timeout(Duration::from_millis(100), reader.read_line()).await;
        assert!(early.is_err());

        append(&file_path, b"\"t\"}\n").await;
        let line = tokio::time::timeout(Duration::from_secs(2), reader.read_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(line, "{\"topic\":\"t\"}");
    }

    #[tokio::test]
    async fn test_follow_reopens_after_truncation() {
        let temp_dir = tempfile::tempdir().unwrap();
        let file_path = temp_dir.path().join("events.jsonl");
        append(&file_path, b"old-line-one\nold-line-two\n").await;

        let mut reader = TailReader::new(file_path.clone(), ReadMode::Follow)
            .with_poll_interval(Duration::from_millis(10));
        reader.start().await.unwrap();

        tokio::fs::write(&file_path, b"new\n").await.unwrap();

        let line = tokio::time::timeout(Duration::from_secs(2), reader.read_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(line, "new");
    }
}
