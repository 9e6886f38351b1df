//! Raw byte relay between an upgraded client connection and its backend

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Bytes moved in each direction over the lifetime of a splice
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpliceStats {
    pub client_to_backend: u64,
    pub backend_to_client: u64,
}

/// Relay bytes in both directions until both sides are finished.
///
/// End-of-stream on one side shuts down the write half of the other, so a
/// close propagates while data still in flight the other way is delivered.
/// An I/O error on either side ends the relay and drops both connections.
/// `pending` is written to the client before relaying; it holds backend bytes
/// that arrived together with the upgrade response.
pub async fn splice<C, B>(
    client: &mut C,
    backend: &mut B,
    pending: &[u8],
) -> std::io::Result<SpliceStats>
where
    C: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    if !pending.is_empty() {
        client.write_all(pending).await?;
        client.flush().await?;
    }

    let (client_to_backend, backend_to_client) =
        tokio::io::copy_bidirectional(client, backend).await?;

    let stats = SpliceStats {
        client_to_backend,
        backend_to_client: backend_to_client + pending.len() as u64,
    };
    debug!(
        client_to_backend = stats.client_to_backend,
        backend_to_client = stats.backend_to_client,
        "Splice finished"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt};

    #[tokio::test]
    async fn test_splice_relays_both_directions() {
        let (mut client_far, mut client_near) = duplex(1024);
        let (mut backend_near, mut backend_far) = duplex(1024);

        let relay = tokio::spawn(async move {
            splice(&mut client_near, &mut backend_near, b"hello").await
        });

        let mut greeting = [0u8; 5];
        client_far.read_exact(&mut greeting).await.unwrap();
        assert_eq!(&greeting, b"hello");

        client_far.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        backend_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        backend_far.write_all(b"pong").await.unwrap();
        client_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(client_far);
        drop(backend_far);

        let stats = relay.await.unwrap().unwrap();
        assert_eq!(stats.client_to_backend, 4);
        assert_eq!(stats.backend_to_client, 9);
    }

    #[tokio::test]
    async fn test_client_close_closes_backend() {
        let (client_far, mut client_near) = duplex(64);
        let (mut backend_near, mut backend_far) = duplex(64);

        let relay = tokio::spawn(async move {
            splice(&mut client_near, &mut backend_near, &[]).await
        });

        drop(client_far);

        let mut rest = Vec::new();
        let n = backend_far.read_to_end(&mut rest).await.unwrap();
        assert_eq!(n, 0);

        drop(backend_far);
        relay.await.unwrap().unwrap();
    }
}
