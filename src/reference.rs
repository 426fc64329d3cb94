use std::fmt;
use std::str::FromStr;

use sha2::{Digest as _, Sha256, Sha512};

use crate::error::ParseError;

/// Tag assumed when a reference names neither a tag nor a digest.
pub const DEFAULT_TAG: &str = "latest";

const MAX_TAG_LEN: usize = 128;

/// Hash algorithms accepted in content digests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DigestAlgorithm {
    Sha256,
    Sha512,
}

impl DigestAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha256 => "sha256",
            DigestAlgorithm::Sha512 => "sha512",
        }
    }

    fn hex_len(&self) -> usize {
        match self {
            DigestAlgorithm::Sha256 => 64,
            DigestAlgorithm::Sha512 => 128,
        }
    }
}

/// Content digest in `algorithm:hex` form, e.g. `sha256:4f...`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    algorithm: DigestAlgorithm,
    hex: String,
}

impl Digest {
    /// Parse a digest string. The hex part must be lowercase and exactly as
    /// long as the algorithm's output.
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let malformed = |reason| ParseError::malformed(text, reason);

        let (algorithm, hex) = text
            .split_once(':')
            .ok_or_else(|| malformed("digest must have the form algorithm:hex"))?;

        let algorithm = match algorithm {
            "sha256" => DigestAlgorithm::Sha256,
            "sha512" => DigestAlgorithm::Sha512,
            _ => return Err(malformed("unsupported digest algorithm")),
        };

        if hex.len() != algorithm.hex_len() {
            return Err(malformed("digest hex has the wrong length"));
        }
        if !hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(malformed("digest hex must be lowercase hexadecimal"));
        }

        Ok(Digest {
            algorithm,
            hex: hex.to_string(),
        })
    }

    /// Compute the sha256 digest of raw content
    pub fn sha256_of(content: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(content);
        Digest {
            algorithm: DigestAlgorithm::Sha256,
            hex: hex::encode(hasher.finalize()),
        }
    }

    /// Check whether `content` hashes to this digest
    pub fn matches(&self, content: &[u8]) -> bool {
        let computed = match self.algorithm {
            DigestAlgorithm::Sha256 => hex::encode(Sha256::digest(content)),
            DigestAlgorithm::Sha512 => hex::encode(Sha512::digest(content)),
        };
        computed == self.hex
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.as_str(), self.hex)
    }
}

impl FromStr for Digest {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Digest::parse(s)
    }
}

/// What a reference points at inside a repository
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TagOrDigest {
    Tag(String),
    Digest(Digest),
}

/// Parsed `registry/repository:tag` or `registry/repository@digest`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    registry: String,
    repository: String,
    content: TagOrDigest,
}

impl Reference {
    /// Parse reference text.
    ///
    /// The registry host ends at the first `/`. After that, `@` always starts a
    /// digest (colons inside the digest are never split again); otherwise a `:`
    /// after the last path separator starts a tag. A reference with neither is
    /// treated as `:latest`. Registry and repository are lowercased.
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let input = text.trim();
        let malformed = |reason| ParseError::malformed(input, reason);

        if input.is_empty() {
            return Err(malformed("reference is empty"));
        }

        let (registry, rest) = input
            .split_once('/')
            .ok_or_else(|| malformed("reference has no repository"))?;

        if registry.is_empty() {
            return Err(malformed("registry is empty"));
        }
        if registry.chars().any(|c| c.is_whitespace() || matches!(c, '@' | '\\')) {
            return Err(malformed("registry contains invalid characters"));
        }
        if !is_valid_registry(registry) {
            return Err(malformed("registry is not a host name"));
        }

        let (name, content) = match rest.split_once('@') {
            Some((name, digest)) => {
                let digest = Digest::parse(digest)
                    .map_err(|_| malformed("digest is not of the form algorithm:hex"))?;
                // A `name:tag@digest` reference is pinned by the digest alone.
                let name = strip_tag(name).0;
                (name, TagOrDigest::Digest(digest))
            }
            None => {
                let (name, tag) = strip_tag(rest);
                let tag = tag.unwrap_or(DEFAULT_TAG);
                if !is_valid_tag(tag) {
                    return Err(malformed("tag contains invalid characters"));
                }
                (name, TagOrDigest::Tag(tag.to_string()))
            }
        };

        let repository = name.to_ascii_lowercase();
        if repository.is_empty() {
            return Err(malformed("repository is empty"));
        }
        if !repository.split('/').all(is_valid_path_segment) {
            return Err(malformed("repository has an invalid path segment"));
        }

        Ok(Reference {
            registry: registry.to_ascii_lowercase(),
            repository,
            content,
        })
    }

    /// Build a reference from already-validated parts
    pub fn new(registry: &str, repository: &str, content: TagOrDigest) -> Self {
        Reference {
            registry: registry.to_ascii_lowercase(),
            repository: repository.to_ascii_lowercase(),
            content,
        }
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn content(&self) -> &TagOrDigest {
        &self.content
    }

    pub fn is_digest(&self) -> bool {
        matches!(self.content, TagOrDigest::Digest(_))
    }

    pub fn tag(&self) -> Option<&str> {
        match &self.content {
            TagOrDigest::Tag(tag) => Some(tag),
            TagOrDigest::Digest(_) => None,
        }
    }

    pub fn digest(&self) -> Option<&Digest> {
        match &self.content {
            TagOrDigest::Digest(digest) => Some(digest),
            TagOrDigest::Tag(_) => None,
        }
    }

    /// Same registry and repository, different tag or digest
    pub fn with_content(&self, content: TagOrDigest) -> Self {
        Reference {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            content,
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.content {
            TagOrDigest::Tag(tag) => write!(f, "{}/{}:{}", self.registry, self.repository, tag),
            TagOrDigest::Digest(digest) => {
                write!(f, "{}/{}@{}", self.registry, self.repository, digest)
            }
        }
    }
}

impl FromStr for Reference {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Reference::parse(s)
    }
}

/// Split `name[:tag]`, only treating a colon after the last `/` as a tag separator
fn strip_tag(name: &str) -> (&str, Option<&str>) {
    let last_segment = name.rfind('/').map_or(0, |i| i + 1);
    match name[last_segment..].rfind(':') {
        Some(i) => {
            let at = last_segment + i;
            (&name[..at], Some(&name[at + 1..]))
        }
        None => (name, None),
    }
}

fn is_valid_tag(tag: &str) -> bool {
    let mut bytes = tag.bytes();
    let Some(first) = bytes.next() else {
        return false;
    };
    tag.len() <= MAX_TAG_LEN
        && (first.is_ascii_alphanumeric() || first == b'_')
        && bytes.all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'))
}

/// Host name (optionally with a port) starting and ending with an alphanumeric,
/// or a bracketed IPv6 literal
fn is_valid_registry(registry: &str) -> bool {
    if registry.starts_with('[') {
        return registry.contains(']');
    }
    let host = registry.split_once(':').map_or(registry, |(host, _)| host);
    match (host.bytes().next(), host.bytes().last()) {
        (Some(first), Some(last)) => {
            first.is_ascii_alphanumeric() && last.is_ascii_alphanumeric() && !host.contains("..")
        }
        _ => false,
    }
}

/// `[a-z0-9]+([._-][a-z0-9]+)*`, so `.` and `..` never pass
fn is_valid_path_segment(segment: &str) -> bool {
    let alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    let (Some(first), Some(last)) = (segment.bytes().next(), segment.bytes().last()) else {
        return false;
    };
    alnum(first)
        && alnum(last)
        && segment
            .bytes()
            .all(|b| alnum(b) || matches!(b, b'.' | b'_' | b'-'))
        && !segment.contains("..")
}
