//! Stable logical identities for tests across runs, branches and file moves.

pub mod resolver;

pub use self::resolver::{IdentityResolver, Resolved};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Separator between title segments in canonical form.
pub const TITLE_SEPARATOR: &str = " › ";

/// Separators reporters commonly embed inside a single title segment.
const EMBEDDED_SEPARATORS: [&str; 2] = [" › ", " > "];

/// Hex characters kept from the SHA-256 of the canonical title.
const FINGERPRINT_HEX_LEN: usize = 32;

/// A logical test case. The fingerprint depends on the title path only, so a
/// test moved to a different file keeps its identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestIdentity {
    /// Key used throughout storage. Equal to `fingerprint` unless a hash
    /// collision forced a file-path tiebreaker.
    pub id: String,
    pub fingerprint: String,
    pub title: String,
    pub first_file: String,
    pub last_file: String,
}

/// Canonicalise a title path: segments trimmed, empty ones dropped, embedded
/// separators split out, joined with [`TITLE_SEPARATOR`]. Case is preserved.
pub fn canonical_title<S: AsRef<str>>(segments: &[S]) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in segments {
        let mut pieces = vec![segment.as_ref()];
        for sep in EMBEDDED_SEPARATORS {
            pieces = pieces.into_iter().flat_map(|p| p.split(sep)).collect();
        }
        parts.extend(pieces.into_iter().map(str::trim).filter(|p| !p.is_empty()));
    }
    parts.join(TITLE_SEPARATOR)
}

/// Default fingerprint: truncated SHA-256 over the canonical title.
pub fn title_fingerprint(canonical: &str) -> String {
    let digest = hex::encode(Sha256::digest(canonical.as_bytes()));
    digest[..FINGERPRINT_HEX_LEN].to_string()
}

/// Short hash of a file path, used to disambiguate fingerprint collisions.
pub(crate) fn file_tiebreaker(file: &str) -> String {
    let digest = hex::encode(Sha256::digest(file.as_bytes()));
    digest[..8].to_string()
}
