//! Bidirectional byte relay between two established streams

use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt};

/// Pump bytes in both directions until each direction reaches end-of-stream,
/// then tear both sides down. Returns the byte counts for (a→b, b→a).
///
/// Completion of one direction propagates a shutdown to its write side so
/// that closing either endpoint winds down the whole tunnel. Pump errors are
/// logged and absorbed; the relay always waits for both directions.
pub async fn relay<A, B>(a: A, b: B) -> (u64, u64)
where
  A: AsyncRead + AsyncWrite + Unpin,
  B: AsyncRead + AsyncWrite + Unpin,
{
  let (mut a_read, mut a_write) = io::split(a);
  let (mut b_read, mut b_write) = io::split(b);

  let a_to_b = async {
    let copied = match io::copy(&mut a_read, &mut b_write).await {
      Ok(n) => n,
      Err(e) => {
        tracing::debug!("[relay] a→b pump ended: {}", e);
        0
      }
    };
    let _ = b_write.shutdown().await;
    copied
  };

  let b_to_a = async {
    let copied = match io::copy(&mut b_read, &mut a_write).await {
      Ok(n) => n,
      Err(e) => {
        tracing::debug!("[relay] b→a pump ended: {}", e);
        0
      }
    };
    let _ = a_write.shutdown().await;
    copied
  };

  tokio::join!(a_to_b, b_to_a)
}
