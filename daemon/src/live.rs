use pkgbuilderd_common::END_OF_LOG;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 1024;

/// Publish/subscribe channels for build output, keyed by build number.
///
/// Lines are only delivered to subscribers that are connected at the time
/// of publishing. Every stream ends with [`END_OF_LOG`].
#[derive(Debug, Default)]
pub struct LiveOutput {
    channels: Mutex<HashMap<i64, broadcast::Sender<String>>>,
}

impl LiveOutput {
    fn channels(&self) -> MutexGuard<'_, HashMap<i64, broadcast::Sender<String>>> {
        self.channels.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Create the channel of a build that is about to start.
    pub fn open(&self, bnum: i64) {
        self.channels()
            .entry(bnum)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
    }

    /// Follow the output of a running build. Returns None once the build
    /// finished or if it never started, its log is in the build record.
    pub fn subscribe(&self, bnum: i64) -> Option<broadcast::Receiver<String>> {
        self.channels()
            .get(&bnum)
            .map(|tx| tx.subscribe())
    }

    pub fn publish(&self, bnum: i64, line: &str) {
        let channels = self.channels();
        if let Some(tx) = channels.get(&bnum) {
            // no subscribers is fine
            let _ = tx.send(line.to_string());
        }
    }

    /// Send the end marker and drop the channel.
    pub fn finish(&self, bnum: i64) {
        if let Some(tx) = self.channels().remove(&bnum) {
            let _ = tx.send(END_OF_LOG.to_string());
        }
    }
}
