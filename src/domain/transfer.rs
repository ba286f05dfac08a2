//! Completed artifact transfers.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

const BYTES_PER_MB: u64 = 1024 * 1024;

/// A finished download, sized from the filesystem after the fact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadTransfer {
    /// Remote location
    pub source_uri: String,

    /// Local file written
    pub destination_path: PathBuf,

    /// Human-readable label
    pub label: String,

    /// Size on disk once the transfer completed
    pub bytes_transferred: u64,

    /// Transport that succeeded (empty when the file was already present)
    pub transport: String,
}

impl DownloadTransfer {
    /// Size in whole megabytes
    pub fn megabytes(&self) -> u64 {
        self.bytes_transferred / BYTES_PER_MB
    }

    /// Whether the transfer was skipped because the file already existed
    pub fn was_skipped(&self) -> bool {
        self.transport.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_megabytes_truncates() {
        let transfer = DownloadTransfer {
            source_uri: "https://example.invalid/model.gguf".to_string(),
            destination_path: PathBuf::from("model.gguf"),
            label: "model".to_string(),
            bytes_transferred: 3 * BYTES_PER_MB + 12,
            transport: "http".to_string(),
        };
        assert_eq!(transfer.megabytes(), 3);
        assert!(!transfer.was_skipped());
    }
}
