//! Bidirectional copy pump with per-direction byte accounting.
//!
//! A pump joins two byte streams and keeps copying until either side reaches
//! end-of-stream, a copy fails, or the owning scope is cancelled. Whatever
//! ends the pump, both endpoints are closed and the surviving copy task is
//! released.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bridge_metrics::Counter;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

const COPY_BUF_LEN: usize = 32 * 1024;
const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum PumpError {
    #[error("copy a->b failed: {0}")]
    AtoB(#[source] io::Error),

    #[error("copy b->a failed: {0}")]
    BtoA(#[source] io::Error),
}

/// Final byte totals, one per direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Totals {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

/// Copies bytes between two endpoints, optionally reporting running totals to
/// a pair of counters once per second.
#[derive(Default)]
pub struct Pump {
    a_to_b_counter: Option<Arc<dyn Counter>>,
    b_to_a_counter: Option<Arc<dyn Counter>>,
}

impl Pump {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach byte-total reporters, one per direction.
    pub fn with_reporters(a_to_b: Arc<dyn Counter>, b_to_a: Arc<dyn Counter>) -> Self {
        Self {
            a_to_b_counter: Some(a_to_b),
            b_to_a_counter: Some(b_to_a),
        }
    }

    /// Run until EOF on either direction, a copy error, or cancellation.
    ///
    /// Counts are monotonic and accounted separately per direction. The
    /// sampler forwards increments, so a backing counter accumulates exactly
    /// the running total.
    pub async fn run<A, B>(
        self,
        a: A,
        b: B,
        token: CancellationToken,
    ) -> Result<Totals, PumpError>
    where
        A: AsyncRead + AsyncWrite + Unpin + Send,
        B: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);

        let a_to_b = Arc::new(AtomicU64::new(0));
        let b_to_a = Arc::new(AtomicU64::new(0));

        let copy_a = copy_counted(a_read, b_write, a_to_b.clone());
        let copy_b = copy_counted(b_read, a_write, b_to_a.clone());
        tokio::pin!(copy_a);
        tokio::pin!(copy_b);

        let mut sampler = tokio::time::interval(SAMPLE_INTERVAL);
        sampler.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut reported = Totals::default();
        let mut result = Ok(());

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::debug!("pump cancelled");
                    break;
                }
                outcome = &mut copy_a => {
                    if let Err(err) = outcome {
                        result = Err(PumpError::AtoB(err));
                    }
                    break;
                }
                outcome = &mut copy_b => {
                    if let Err(err) = outcome {
                        result = Err(PumpError::BtoA(err));
                    }
                    break;
                }
                _ = sampler.tick() => {
                    self.report(&a_to_b, &b_to_a, &mut reported);
                }
            }
        }

        self.report(&a_to_b, &b_to_a, &mut reported);

        // Returning drops both copy futures and with them both endpoints:
        // whichever copy was still running is released and both streams
        // close.
        let totals = Totals {
            a_to_b: a_to_b.load(Ordering::Relaxed),
            b_to_a: b_to_a.load(Ordering::Relaxed),
        };

        result.map(|()| totals)
    }

    fn report(&self, a_to_b: &AtomicU64, b_to_a: &AtomicU64, reported: &mut Totals) {
        if let Some(counter) = &self.a_to_b_counter {
            let total = a_to_b.load(Ordering::Relaxed);
            counter.add(total - reported.a_to_b);
            reported.a_to_b = total;
        }

        if let Some(counter) = &self.b_to_a_counter {
            let total = b_to_a.load(Ordering::Relaxed);
            counter.add(total - reported.b_to_a);
            reported.b_to_a = total;
        }
    }
}

/// Copy until EOF, adding every chunk to `count`. EOF shuts the writer down
/// so the far side observes the close.
async fn copy_counted<R, W>(mut reader: R, mut writer: W, count: Arc<AtomicU64>) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_LEN];
    let mut total = 0u64;

    loop {
        let read = reader.read(&mut buf).await?;
        if read == 0 {
            let _ = writer.shutdown().await;
            return Ok(total);
        }

        writer.write_all(&buf[..read]).await?;
        total += read as u64;
        count.fetch_add(read as u64, Ordering::Relaxed);
    }
}
