//! Bidirectional stream splicing.

use tokio::io::{copy_bidirectional_with_sizes, AsyncRead, AsyncWrite};

/// Splice two streams together until both directions reach EOF or either
/// fails, using the protocol's standard 32 KiB buffers.
///
/// Returns the number of bytes copied `a→b` and `b→a`.
pub async fn splice<A, B>(a: &mut A, b: &mut B) -> std::io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    copy_bidirectional_with_sizes(a, b, crate::SPLICE_BUFSIZE, crate::SPLICE_BUFSIZE).await
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

    #[tokio::test]
    async fn echo_through_splice() {
        let (mut app, mut app_far) = tokio::io::duplex(64);
        let (mut tunnel, mut tunnel_far) = tokio::io::duplex(64);

        let splicer = tokio::spawn(async move { splice(&mut app_far, &mut tunnel_far).await });

        // The tunnel side echoes whatever it receives.
        let echo = tokio::spawn(async move {
            let mut buf = [0_u8; 5];
            tunnel.read_exact(&mut buf).await.unwrap();
            tunnel.write_all(&buf).await.unwrap();
            tunnel.shutdown().await.unwrap();
            drop(tunnel);
        });

        app.write_all(b"hello").await.unwrap();
        app.shutdown().await.unwrap();
        let mut out = Vec::new();
        app.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello");

        echo.await.unwrap();
        let (ab, ba) = splicer.await.unwrap().unwrap();
        assert_eq!(ab, 5);
        assert_eq!(ba, 5);
    }
}
