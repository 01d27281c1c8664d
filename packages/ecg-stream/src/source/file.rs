// Capture replay source
//
// Streams a recorded capture one line per message, optionally throttled to
// simulate the device's pacing. Blank lines are skipped.

use super::{RawMessage, SourceMetadata, StreamSource};
use crate::types::{PipelineError, StreamResult};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

pub struct FileStreamSource {
    path: PathBuf,
    rate_limit_ms: Option<u64>,
    loop_playback: bool,
    is_connected: bool,
    messages_sent: u64,
}

impl FileStreamSource {
    pub fn new(path: impl Into<PathBuf>, rate_limit_ms: Option<u64>, loop_playback: bool) -> Self {
        Self {
            path: path.into(),
            rate_limit_ms,
            loop_playback,
            is_connected: false,
            messages_sent: 0,
        }
    }

    /// Send every line of the capture once. Returns whether the receiver is
    /// still open and how many messages went out.
    async fn play_once(&mut self, sender: &mpsc::Sender<RawMessage>) -> StreamResult<(bool, u64)> {
        let file = File::open(&self.path).await?;
        let mut lines = BufReader::new(file).lines();
        let mut sent = 0u64;

        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if sender.send(RawMessage::from(line)).await.is_err() {
                log::warn!("Message receiver closed, stopping file stream");
                return Ok((false, sent));
            }
            sent += 1;
            self.messages_sent += 1;

            if let Some(delay_ms) = self.rate_limit_ms {
                sleep(Duration::from_millis(delay_ms)).await;
            }
        }
        Ok((true, sent))
    }
}

#[async_trait]
impl StreamSource for FileStreamSource {
    async fn connect(&mut self) -> StreamResult<()> {
        if self.is_connected {
            return Ok(());
        }

        let metadata = tokio::fs::metadata(&self.path).await.map_err(|e| {
            PipelineError::Connection(format!("Cannot open {}: {}", self.path.display(), e))
        })?;
        if !metadata.is_file() {
            return Err(PipelineError::Connection(format!(
                "{} is not a file",
                self.path.display()
            )));
        }

        self.is_connected = true;
        log::info!(
            "Connected to capture file: {} ({} bytes)",
            self.path.display(),
            metadata.len()
        );
        Ok(())
    }

    async fn start(&mut self, sender: mpsc::Sender<RawMessage>) -> StreamResult<()> {
        if !self.is_connected {
            self.connect().await?;
        }

        log::info!("Starting capture playback");
        loop {
            let (open, sent) = self.play_once(&sender).await?;
            if !open {
                return Ok(());
            }
            if !self.loop_playback || sent == 0 {
                log::info!("Capture playback reached end of file");
                self.is_connected = false;
                return Ok(());
            }
            log::debug!("Capture playback looping after {} messages", sent);
        }
    }

    async fn stop(&mut self) -> StreamResult<()> {
        log::info!("Stopping capture playback");
        self.is_connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.is_connected
    }

    fn metadata(&self) -> SourceMetadata {
        SourceMetadata {
            source_type: "file".to_string(),
            lead_count: None,
            properties: [
                ("file_path".to_string(), self.path.display().to_string()),
                ("messages_sent".to_string(), self.messages_sent.to_string()),
            ]
            .into_iter()
            .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn capture(lines: &[&str]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
        file
    }

    #[tokio::test]
    async fn test_streams_each_line() {
        let file = capture(&["0:0.1,0.2", "", "1:0.3"]);
        let mut source = FileStreamSource::new(file.path(), None, false);
        source.connect().await.unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        source.start(tx).await.unwrap();

        assert_eq!(rx.recv().await, Some(RawMessage::from("0:0.1,0.2")));
        assert_eq!(rx.recv().await, Some(RawMessage::from("1:0.3")));
        assert_eq!(rx.recv().await, None);
        assert!(!source.is_connected());
    }

    #[tokio::test]
    async fn test_loop_playback_stops_when_receiver_drops() {
        let file = capture(&["0:1.0"]);
        let mut source = FileStreamSource::new(file.path(), None, true);

        let (tx, mut rx) = mpsc::channel(1);
        let consumer = tokio::spawn(async move {
            for _ in 0..5 {
                assert_eq!(rx.recv().await, Some(RawMessage::from("0:1.0")));
            }
        });

        source.start(tx).await.unwrap();
        consumer.await.unwrap();
        assert!(source.messages_sent >= 5);
    }

    #[tokio::test]
    async fn test_missing_file() {
        let mut source = FileStreamSource::new("/nonexistent/capture.ndjson", None, false);
        assert!(matches!(
            source.connect().await,
            Err(PipelineError::Connection(_))
        ));
    }
}
