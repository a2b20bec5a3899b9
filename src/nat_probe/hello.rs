/**
 * nat_probe/hello.rs
 *
 * Periodic hello datagrams towards a peer's public mapping
 */

use crate::nat_probe::transport::Transport;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

/// Gap between two hellos
pub const HELLO_INTERVAL: Duration = Duration::from_secs(2);

/// Sends `HELLO #<seq> from <label>` to one target until told to stop
pub struct HelloSender<T> {
    transport: T,
    target: SocketAddr,
    label: String,
    interval: Duration,
    seq: u64,
}

impl<T: Transport> HelloSender<T> {
    pub fn new(transport: T, target: SocketAddr, label: impl Into<String>) -> Self {
        Self {
            transport,
            target,
            label: label.into(),
            interval: HELLO_INTERVAL,
            seq: 0,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn message(&self, seq: u64) -> String {
        format!("HELLO #{} from {}", seq, self.label)
    }

    /// Send the next hello; the sequence number advances even on failure
    pub async fn send_next(&mut self) -> io::Result<String> {
        let message = self.message(self.seq);
        self.seq += 1;
        self.transport.send_to(message.as_bytes(), self.target).await?;
        Ok(message)
    }

    /// Send until `shutdown` resolves or `count` hellos were attempted.
    ///
    /// Send errors are reported through `on_sent` and do not stop the loop.
    /// Returns how many hellos were delivered to the socket.
    pub async fn run<F, S>(mut self, count: Option<u64>, mut on_sent: F, shutdown: S) -> io::Result<u64>
    where
        F: FnMut(&io::Result<String>),
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut delivered = 0;

        loop {
            if count.is_some_and(|limit| self.seq >= limit) {
                break;
            }

            let result = self.send_next().await;
            match &result {
                Ok(message) => {
                    delivered += 1;
                    tracing::debug!(target_addr = %self.target, %message, "Hello sent");
                }
                Err(e) => tracing::warn!(target_addr = %self.target, error = %e, "Hello send failed"),
            }
            on_sent(&result);

            if count.is_some_and(|limit| self.seq >= limit) {
                break;
            }

            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        self.transport.close()?;
        Ok(delivered)
    }
}
