//! Per-hop `Init` frames.

use semver::Version;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use url::Url;
use wireleap_sharetoken::Sharetoken;

/// The frame written to an open relay connection to extend it by one hop.
///
/// Relays read frames off the front of the byte stream; everything after
/// the final frame is payload.  Frames are newline-terminated JSON
/// documents, which keeps them self-describing and cheap to delimit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Init {
    /// The requested operation; currently always `"CONNECT"`.
    pub command: String,
    /// Protocol to dial the remote with (`tcp`, `udp`, or a forced
    /// `tcp4`/`tcp6` on the terminal hop).
    pub protocol: String,
    /// Where to connect: the next relay (`wireleap://…`) or the final
    /// target (`target://host:port`).
    pub remote: Url,
    /// The sharetoken paying for this hop.
    pub token: Sharetoken,
    /// Client-relay protocol version.
    pub version: Version,
}

impl Init {
    /// Construct a CONNECT frame.
    pub fn connect(protocol: impl Into<String>, remote: Url, token: Sharetoken) -> Self {
        Init {
            command: "CONNECT".into(),
            protocol: protocol.into(),
            remote,
            token,
            version: crate::PROTO_VERSION,
        }
    }

    /// Write this frame to `w`, newline-terminated.
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, w: &mut W) -> std::io::Result<()> {
        let mut buf = serde_json::to_vec(self)?;
        buf.push(b'\n');
        w.write_all(&buf).await?;
        w.flush().await
    }

    /// Read one frame from `r`.
    ///
    /// Used by the relay side of the protocol; in this workspace, only by
    /// test stubs.
    pub async fn read_from<R: AsyncBufRead + Unpin>(r: &mut R) -> std::io::Result<Self> {
        let mut line = String::new();
        let n = r.read_line(&mut line).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        serde_json::from_str(&line).map_err(Into::into)
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use wireleap_crypto::ed25519::gen_keypair;
    use wireleap_sharetoken::{ServiceKey, SkContract};

    /// A token for frame tests.
    fn token() -> Sharetoken {
        let mut sk = ServiceKey::new();
        sk.contract = Some(SkContract {
            pubkey: gen_keypair().verifying_key().into(),
            settlement_open: 1,
            settlement_close: 2,
        });
        Sharetoken::new(&sk, gen_keypair().verifying_key().into()).unwrap()
    }

    #[tokio::test]
    async fn frame_round_trip() {
        let init = Init::connect("tcp", "target://example.com:80".parse().unwrap(), token());
        let mut buf = Vec::new();
        init.write_to(&mut buf).await.unwrap();
        assert_eq!(buf.last(), Some(&b'\n'));

        let mut rd = std::io::Cursor::new(buf);
        let mut rd = tokio::io::BufReader::new(&mut rd);
        let got = Init::read_from(&mut rd).await.unwrap();
        assert_eq!(got.command, "CONNECT");
        assert_eq!(got.protocol, "tcp");
        assert_eq!(got.remote.as_str(), "target://example.com:80");
        assert_eq!(got.version, crate::PROTO_VERSION);
    }

    #[tokio::test]
    async fn frames_leave_payload_untouched() {
        let init = Init::connect("tcp", "wireleap://relay:13490".parse().unwrap(), token());
        let mut buf = Vec::new();
        init.write_to(&mut buf).await.unwrap();
        buf.extend_from_slice(b"payload bytes");

        let mut rd = tokio::io::BufReader::new(std::io::Cursor::new(buf));
        let _ = Init::read_from(&mut rd).await.unwrap();
        let mut rest = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut rd, &mut rest)
            .await
            .unwrap();
        assert_eq!(rest, b"payload bytes");
    }
}
