//! Change notification source
//!
//! Notifications arrive one JSON object per line. Blank lines and lines
//! starting with `#` are ignored; lines that fail to parse are logged and
//! skipped so one bad record never stops the feed.

use std::io;
use std::path::{Path, PathBuf};

use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

use crate::reconciler::{ChangeNotification, Reconciler};

/// Longest accepted notification line
const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Where notifications are read from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationSource {
    Stdin,
    File(PathBuf),
}

impl NotificationSource {
    /// `None` and `-` both mean stdin.
    pub fn from_arg(path: Option<&Path>) -> Self {
        match path {
            Some(path) if path != Path::new("-") => NotificationSource::File(path.to_path_buf()),
            _ => NotificationSource::Stdin,
        }
    }

    pub async fn open(&self) -> io::Result<Box<dyn AsyncRead + Unpin + Send>> {
        match self {
            NotificationSource::Stdin => Ok(Box::new(tokio::io::stdin())),
            NotificationSource::File(path) => Ok(Box::new(tokio::fs::File::open(path).await?)),
        }
    }
}

impl std::fmt::Display for NotificationSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationSource::Stdin => write!(f, "stdin"),
            NotificationSource::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Counters of one feed run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FeedStats {
    pub delivered: usize,
    pub skipped: usize,
}

/// Feed notifications from `reader` to `reconciler` until EOF or `cancel`.
pub async fn feed<R>(reader: R, reconciler: &mut Reconciler, cancel: &CancellationToken) -> io::Result<FeedStats>
where
    R: AsyncRead + Unpin,
{
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    let mut stats = FeedStats::default();
    let mut line_number = 0usize;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!("Notification feed cancelled");
                break;
            }
            next = lines.next() => next,
        };

        let line = match next {
            None => break,
            Some(Ok(line)) => line,
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                line_number += 1;
                tracing::warn!("Skipping notification line {}: longer than {} bytes", line_number, MAX_LINE_LENGTH);
                stats.skipped += 1;
                continue;
            }
            Some(Err(LinesCodecError::Io(e))) => return Err(e),
        };
        line_number += 1;

        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        match serde_json::from_str::<ChangeNotification>(line) {
            Ok(notification) => {
                reconciler.handle(notification).await;
                stats.delivered += 1;
            }
            Err(e) => {
                tracing::warn!("Skipping notification line {}: {}", line_number, e);
                stats.skipped += 1;
            }
        }
    }

    if reconciler.pending() > 0 {
        tracing::warn!(
            "{} notifications left without a commit marker",
            reconciler.pending()
        );
    }
    Ok(stats)
}
