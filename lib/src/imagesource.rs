//! Image source references.
//!
//! A deployment's payload is described by a URI-style reference such as
//! `oci://registry.example.com/os:1.2` or `dir:///srv/os-tree`.  A bare
//! reference with no scheme is treated as an OCI reference, and OCI
//! references without an explicit tag are normalized to `:latest`.

use std::fmt::Display;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

const SCHEME_OCI: &str = "oci";
const SCHEME_DIR: &str = "dir";
const SCHEME_RAW: &str = "raw";
const SCHEME_TAR: &str = "tar";

/// The kind of payload a deployment is installed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageKind {
    /// A container image reference.
    Oci,
    /// A plain directory tree on the host.
    Dir,
    /// A raw filesystem image, loop-mounted for extraction.
    Raw,
    /// A tar archive, handled by an external unpacker.
    Tar,
    /// No payload; the snapshot starts empty.
    #[default]
    Empty,
}

/// A tagged image reference plus the digest recorded after unpacking.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ImageSource {
    pub kind: ImageKind,
    /// Everything after the scheme separator, e.g. the OCI reference or
    /// the directory path.
    pub value: String,
    /// Content digest, populated by the unpacker.
    pub digest: Option<String>,
}

impl ImageSource {
    pub fn oci(reference: impl Into<String>) -> Self {
        Self {
            kind: ImageKind::Oci,
            value: normalize_oci_reference(&reference.into()),
            digest: None,
        }
    }

    pub fn dir(path: impl Into<String>) -> Self {
        Self {
            kind: ImageKind::Dir,
            value: path.into(),
            digest: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.kind, ImageKind::Empty)
    }
}

/// Append `:latest` when the final path component carries no tag.
fn normalize_oci_reference(reference: &str) -> String {
    let last = reference.rsplit('/').next().unwrap_or(reference);
    if last.contains(':') {
        reference.to_string()
    } else {
        format!("{reference}:latest")
    }
}

impl FromStr for ImageSource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Ok(Self::default());
        }
        let (scheme, value) = match s.split_once("://") {
            Some((scheme, value)) => (scheme, value),
            // No scheme means an OCI reference.
            None => return Ok(Self::oci(s)),
        };
        if value.is_empty() {
            return Err(anyhow!("empty image source reference in {s:?}"));
        }
        let kind = match scheme {
            SCHEME_OCI => return Ok(Self::oci(value)),
            SCHEME_DIR => ImageKind::Dir,
            SCHEME_RAW => ImageKind::Raw,
            SCHEME_TAR => ImageKind::Tar,
            o => return Err(anyhow!("unknown image source scheme {o:?} in {s:?}")),
        };
        Ok(Self {
            kind,
            value: value.to_string(),
            digest: None,
        })
    }
}

impl Display for ImageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scheme = match self.kind {
            ImageKind::Oci => SCHEME_OCI,
            ImageKind::Dir => SCHEME_DIR,
            ImageKind::Raw => SCHEME_RAW,
            ImageKind::Tar => SCHEME_TAR,
            ImageKind::Empty => return Ok(()),
        };
        write!(f, "{scheme}://{}", self.value)
    }
}

/// Wire form: `{uri: "<scheme>://<value>", digest: <opt>}`.
#[derive(Serialize, Deserialize)]
struct ImageSourceWire {
    uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    digest: Option<String>,
}

impl Serialize for ImageSource {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        ImageSourceWire {
            uri: self.to_string(),
            digest: self.digest.clone(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ImageSource {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = ImageSourceWire::deserialize(deserializer)?;
        let mut source = ImageSource::from_str(&wire.uri).map_err(serde::de::Error::custom)?;
        source.digest = wire.digest;
        Ok(source)
    }
}
