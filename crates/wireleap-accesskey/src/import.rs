//! Accesskey bundle import.

use semver::Version;
use url::Url;
use wireleap_sharetoken::Pof;

/// What an import accomplished.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct ImportSummary {
    /// The contract the bundle belongs to.
    pub contract: Url,
    /// Number of new pofs now in the store.
    pub imported: usize,
    /// Pofs skipped because they had already expired.
    pub skipped_expired: usize,
    /// Pofs skipped because we already hold one with the same digest.
    pub skipped_duplicate: usize,
    /// A newer client version advertised by the directory, if any.
    pub upgrade: Option<Version>,
}

/// Merge `incoming` pofs into `existing`, dropping expired ones and
/// duplicates (by digest).  Returns `(imported, expired, duplicate)`
/// counts.
pub(crate) fn merge_pofs(
    existing: &mut Vec<Pof>,
    incoming: Vec<Pof>,
    now: i64,
) -> (usize, usize, usize) {
    let (mut imported, mut expired, mut duplicate) = (0, 0, 0);
    for p in incoming {
        if p.is_expired_at(now) {
            tracing::info!("skipping expired accesskey {}", p.digest());
            expired += 1;
            continue;
        }
        if existing.iter().any(|p0| p0.digest() == p.digest()) {
            tracing::info!("skipping duplicate accesskey {}", p.digest());
            duplicate += 1;
            continue;
        }
        existing.push(p);
        imported += 1;
    }
    (imported, expired, duplicate)
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::useless_vec)]
    use super::*;

    /// A pof for merge tests.
    fn pof(nonce: &str, expiration: i64) -> Pof {
        Pof {
            pof_type: "sk".into(),
            expiration,
            nonce: nonce.into(),
            signature: "sig".into(),
        }
    }

    #[test]
    fn merge_drops_expired_and_duplicates() {
        let mut existing = vec![pof("held", 2000)];
        let incoming = vec![
            pof("held", 2000),  // duplicate
            pof("old", 500),    // expired
            pof("fresh", 2000), // new
        ];
        let (imported, expired, duplicate) = merge_pofs(&mut existing, incoming, 1000);
        assert_eq!((imported, expired, duplicate), (1, 1, 1));
        let nonces: Vec<_> = existing.iter().map(|p| p.nonce.as_str()).collect();
        assert_eq!(nonces, vec!["held", "fresh"]);
    }

    #[test]
    fn merge_into_empty() {
        let mut existing = Vec::new();
        let (imported, expired, duplicate) =
            merge_pofs(&mut existing, vec![pof("a", 10), pof("b", 10)], 5);
        assert_eq!((imported, expired, duplicate), (2, 0, 0));
    }
}
