//! Data model for the records the rpm-ostree daemon exposes over DBus.
//!
//! The daemon hands out deployments, cached updates and package diffs as
//! `a{sv}` dictionaries and positional tuples.  Callers render those into
//! [`serde_json::Value`] at the bus boundary; everything here decodes
//! that rendering exactly once into named fields, failing with
//! [`ShapeError`] when the shape isn't what the daemon promises.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Result alias for decoding daemon records.
pub type Result<T> = std::result::Result<T, ShapeError>;

/// A record from the daemon did not have the expected shape.
#[derive(Debug, thiserror::Error)]
pub enum ShapeError {
    #[error("expected {expected} elements in {what}, found {found}")]
    Arity {
        what: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("invalid {what}: {reason}")]
    Invalid { what: &'static str, reason: String },
    #[error("failed to decode {what}: {source}")]
    Decode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// A single deployment, i.e. a bootable ostree commit, or a cached
/// update that has been downloaded but not yet deployed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Deployment {
    /// Only present for deployments written to the bootloader; a cached
    /// update has none.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub osname: String,
    pub checksum: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default)]
    pub container_image_reference: Option<String>,
    #[serde(default)]
    pub booted: bool,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub staged: bool,
    #[serde(default)]
    pub signatures: Vec<Value>,
    /// Position in the host's deployment list; assigned by the client
    /// during reconciliation, never sent by the daemon.
    #[serde(skip)]
    pub index: Option<usize>,
}

impl Deployment {
    /// Decode a deployment dictionary.  The daemon uses an empty
    /// dictionary to mean "no such deployment", which maps to `None`.
    pub fn from_value(v: &Value) -> Result<Option<Self>> {
        match v {
            Value::Null => Ok(None),
            Value::Object(m) if m.is_empty() => Ok(None),
            v => serde_json::from_value(v.clone())
                .map(Some)
                .map_err(|source| ShapeError::Decode {
                    what: "deployment",
                    source,
                }),
        }
    }

    /// The origin refspec, treating a container image reference as the
    /// origin when there is no ostree one.
    pub fn effective_origin(&self) -> Option<&str> {
        self.origin
            .as_deref()
            .or(self.container_image_reference.as_deref())
    }

    /// Whether this has been written out as a real deployment, as opposed
    /// to a cached update candidate.
    pub fn is_installed(&self) -> bool {
        self.id.is_some()
    }
}

/// Where a deployment came from: a remote plus branch for ostree repos,
/// or a transport plus image reference for containers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    pub remote: String,
    pub branch: Option<String>,
}

impl Origin {
    /// Split an origin string on its last `:`.
    ///
    /// OSTree repos look like `local:fedora/x86_64/coreos/testing`; OCI
    /// references like `ostree-unverified-registry:quay.io/fedora/fedora-coreos:stable`
    /// keep every earlier colon in the remote.
    pub fn parse(s: &str) -> Self {
        match s.rsplit_once(':') {
            Some((remote, branch)) => Self {
                remote: remote.to_string(),
                branch: Some(branch.to_string()),
            },
            None => Self {
                remote: s.to_string(),
                branch: None,
            },
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.branch.as_deref() {
            Some(branch) => write!(f, "{}:{}", self.remote, branch),
            None => f.write_str(&self.remote),
        }
    }
}

fn array<'a>(v: &'a Value, what: &'static str) -> Result<&'a [Value]> {
    v.as_array()
        .map(Vec::as_slice)
        .ok_or_else(|| ShapeError::Invalid {
            what,
            reason: format!("expected an array, found {v}"),
        })
}

/// The first `expected` elements of `v`; anything after them is ignored.
fn leading_elements<'a>(v: &'a Value, what: &'static str, expected: usize) -> Result<&'a [Value]> {
    let a = array(v, what)?;
    if a.len() < expected {
        return Err(ShapeError::Arity {
            what,
            expected,
            found: a.len(),
        });
    }
    Ok(&a[..expected])
}

fn elements<'a>(v: &'a Value, what: &'static str, expected: usize) -> Result<&'a [Value]> {
    let a = array(v, what)?;
    if a.len() != expected {
        return Err(ShapeError::Arity {
            what,
            expected,
            found: a.len(),
        });
    }
    Ok(a)
}

fn get_bool(a: &[Value], i: usize, what: &'static str) -> Result<bool> {
    a[i].as_bool().ok_or_else(|| ShapeError::Invalid {
        what,
        reason: format!("element {i} is not a boolean"),
    })
}

fn get_str(a: &[Value], i: usize, what: &'static str) -> Result<String> {
    a[i].as_str()
        .map(ToOwned::to_owned)
        .ok_or_else(|| ShapeError::Invalid {
            what,
            reason: format!("element {i} is not a string"),
        })
}

fn get_i64(a: &[Value], i: usize, what: &'static str) -> Result<i64> {
    a[i].as_i64().ok_or_else(|| ShapeError::Invalid {
        what,
        reason: format!("element {i} is not an integer"),
    })
}

fn get_u64(a: &[Value], i: usize, what: &'static str) -> Result<u64> {
    a[i].as_u64().ok_or_else(|| ShapeError::Invalid {
        what,
        reason: format!("element {i} is not an unsigned integer"),
    })
}

/// A GPG signature on a commit.
///
/// On the wire this is an `av` whose order libostree guarantees not to
/// change: valid, sig expired, key expired, key revoked, key missing,
/// fingerprint, timestamp, expiry timestamp, key algo, hash algo,
/// user name, user email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Signature {
    pub valid: bool,
    pub sig_expired: bool,
    pub key_expired: bool,
    pub key_revoked: bool,
    pub key_missing: bool,
    pub fingerprint: String,
    pub timestamp: i64,
    pub expiry_timestamp: i64,
    pub key_algo: String,
    pub hash_algo: String,
    pub user_name: String,
    pub user_email: String,
}

impl Signature {
    /// Newer libostree appends fields; only this prefix is decoded.
    const WIRE_LEN: usize = 12;

    pub fn from_wire(v: &Value) -> Result<Self> {
        const WHAT: &str = "signature";
        let a = leading_elements(v, WHAT, Self::WIRE_LEN)?;
        Ok(Self {
            valid: get_bool(a, 0, WHAT)?,
            sig_expired: get_bool(a, 1, WHAT)?,
            key_expired: get_bool(a, 2, WHAT)?,
            key_revoked: get_bool(a, 3, WHAT)?,
            key_missing: get_bool(a, 4, WHAT)?,
            fingerprint: get_str(a, 5, WHAT)?,
            timestamp: get_i64(a, 6, WHAT)?,
            expiry_timestamp: get_i64(a, 7, WHAT)?,
            key_algo: get_str(a, 8, WHAT)?,
            hash_algo: get_str(a, 9, WHAT)?,
            user_name: get_str(a, 10, WHAT)?,
            user_email: get_str(a, 11, WHAT)?,
        })
    }

    pub fn expired(&self) -> bool {
        self.sig_expired || self.key_expired
    }

    /// `Name <email>`, or whichever half is known.
    pub fn signed_by(&self) -> Option<String> {
        match (self.user_name.as_str(), self.user_email.as_str()) {
            ("", "") => None,
            ("", email) => Some(email.to_string()),
            (name, "") => Some(name.to_string()),
            (name, email) => Some(format!("{name} <{email}>")),
        }
    }

    /// Human label for the key type, e.g. `RSA key ID`.
    pub fn key_label(&self) -> Option<String> {
        (!self.key_algo.is_empty()).then(|| format!("{} key ID", self.key_algo))
    }
}

/// How a package changed between two deployments.  The discriminants
/// match the daemon's `u` type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added = 0,
    Removed = 1,
    Upgraded = 2,
    Downgraded = 3,
}

impl TryFrom<u64> for ChangeKind {
    type Error = ShapeError;

    fn try_from(v: u64) -> Result<Self> {
        match v {
            0 => Ok(Self::Added),
            1 => Ok(Self::Removed),
            2 => Ok(Self::Upgraded),
            3 => Ok(Self::Downgraded),
            o => Err(ShapeError::Invalid {
                what: "package change",
                reason: format!("unknown change type {o}"),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageChange {
    pub name: String,
    pub kind: ChangeKind,
    pub version: String,
    pub arch: String,
}

/// The four-way package diff between two commits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PackageDiff {
    pub adds: Vec<PackageChange>,
    pub removes: Vec<PackageChange>,
    pub up: Vec<PackageChange>,
    pub down: Vec<PackageChange>,
}

impl PackageDiff {
    /// Decode an `a(sua{sv})` diff list.  Removed packages report their
    /// previous version, everything else the new one.
    pub fn from_wire(v: &Value) -> Result<Self> {
        const WHAT: &str = "package diff";
        let list = v.as_array().ok_or_else(|| ShapeError::Invalid {
            what: WHAT,
            reason: format!("expected a list, found {v}"),
        })?;
        let mut diff = Self::default();
        for entry in list {
            let a = elements(entry, WHAT, 3)?;
            let name = get_str(a, 0, WHAT)?;
            let kind = ChangeKind::try_from(get_u64(a, 1, WHAT)?)?;
            let key = match kind {
                ChangeKind::Removed => "PreviousPackage",
                _ => "NewPackage",
            };
            let pkg = a[2].get(key).ok_or_else(|| ShapeError::Invalid {
                what: WHAT,
                reason: format!("{name}: missing {key}"),
            })?;
            let nevra = elements(pkg, WHAT, 3)?;
            let change = PackageChange {
                name,
                kind,
                version: get_str(nevra, 1, WHAT)?,
                arch: get_str(nevra, 2, WHAT)?,
            };
            match kind {
                ChangeKind::Added => diff.adds.push(change),
                ChangeKind::Removed => diff.removes.push(change),
                ChangeKind::Upgraded => diff.up.push(change),
                ChangeKind::Downgraded => diff.down.push(change),
            }
        }
        Ok(diff)
    }

    pub fn is_empty(&self) -> bool {
        self.adds.is_empty() && self.removes.is_empty() && self.up.is_empty() && self.down.is_empty()
    }
}

/// The booted deployment's installed packages, sorted case-insensitively
/// and split into two display columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstalledPackages {
    pub columns: [Vec<String>; 2],
}

impl InstalledPackages {
    /// Parse `rpm -qa` output, one package per line.  Returns `None`
    /// if there are no packages at all.
    pub fn from_rpm_output(output: &str) -> Option<Self> {
        let mut names: Vec<String> = output
            .lines()
            .filter(|l| !l.is_empty())
            .map(ToOwned::to_owned)
            .collect();
        if names.is_empty() {
            return None;
        }
        names.sort_by_cached_key(|n| n.to_lowercase());
        let half = names.len().div_ceil(2);
        let second = names.split_off(half);
        Some(Self {
            columns: [names, second],
        })
    }

    pub fn len(&self) -> usize {
        self.columns[0].len() + self.columns[1].len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().flatten().map(|s| s.as_str())
    }
}

/// Package information for one deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "type")]
pub enum PackageSet {
    Installed(InstalledPackages),
    Diff(PackageDiff),
}

impl PackageSet {
    pub fn is_empty(&self) -> bool {
        match self {
            PackageSet::Installed(p) => p.is_empty(),
            PackageSet::Diff(d) => d.is_empty(),
        }
    }
}

/// Decoded `DownloadProgress` transaction signal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DownloadProgress {
    pub start_time: u64,
    pub elapsed_secs: u64,
    pub outstanding_fetches: u64,
    pub outstanding_writes: u64,
    pub scanned_metadata: u64,
    pub metadata_fetched: u64,
    pub outstanding_metadata_fetches: u64,
    pub total_delta_parts: u64,
    pub fetched_delta_parts: u64,
    pub total_delta_superblocks: u64,
    pub total_delta_part_size: u64,
    pub fetched: u64,
    pub requested: u64,
    pub bytes_transferred: u64,
    pub bytes_sec: u64,
}

impl DownloadProgress {
    /// Decode the `((tt)(uu)(uuu)(uuut)(uu)(tt))` signal arguments.
    pub fn from_wire(args: &[Value]) -> Result<Self> {
        const WHAT: &str = "download progress";
        if args.len() != 6 {
            return Err(ShapeError::Arity {
                what: WHAT,
                expected: 6,
                found: args.len(),
            });
        }
        let time = elements(&args[0], WHAT, 2)?;
        let outstanding = elements(&args[1], WHAT, 2)?;
        let metadata = elements(&args[2], WHAT, 3)?;
        let delta = elements(&args[3], WHAT, 4)?;
        let content = elements(&args[4], WHAT, 2)?;
        let transfer = elements(&args[5], WHAT, 2)?;
        Ok(Self {
            start_time: get_u64(time, 0, WHAT)?,
            elapsed_secs: get_u64(time, 1, WHAT)?,
            outstanding_fetches: get_u64(outstanding, 0, WHAT)?,
            outstanding_writes: get_u64(outstanding, 1, WHAT)?,
            scanned_metadata: get_u64(metadata, 0, WHAT)?,
            metadata_fetched: get_u64(metadata, 1, WHAT)?,
            outstanding_metadata_fetches: get_u64(metadata, 2, WHAT)?,
            total_delta_parts: get_u64(delta, 0, WHAT)?,
            fetched_delta_parts: get_u64(delta, 1, WHAT)?,
            total_delta_superblocks: get_u64(delta, 2, WHAT)?,
            total_delta_part_size: get_u64(delta, 3, WHAT)?,
            fetched: get_u64(content, 0, WHAT)?,
            requested: get_u64(content, 1, WHAT)?,
            bytes_transferred: get_u64(transfer, 0, WHAT)?,
            bytes_sec: get_u64(transfer, 1, WHAT)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn origin_split() {
        let o = Origin::parse("local:fedora/x86_64/coreos/testing");
        assert_eq!(o.remote, "local");
        assert_eq!(o.branch.as_deref(), Some("fedora/x86_64/coreos/testing"));
        assert_eq!(o.to_string(), "local:fedora/x86_64/coreos/testing");

        let o = Origin::parse("justremote");
        assert_eq!(o.remote, "justremote");
        assert_eq!(o.branch, None);

        let o = Origin::parse("ostree-unverified-registry:quay.io/fedora/fedora-coreos:stable");
        assert_eq!(o.remote, "ostree-unverified-registry:quay.io/fedora/fedora-coreos");
        assert_eq!(o.branch.as_deref(), Some("stable"));
    }

    #[test]
    fn empty_deployment_dict() {
        assert_eq!(Deployment::from_value(&json!({})).unwrap(), None);
        assert_eq!(Deployment::from_value(&Value::Null).unwrap(), None);
        assert!(Deployment::from_value(&json!({"osname": "fedora"})).is_err());
    }

    #[test]
    fn container_origin() {
        let d = Deployment::from_value(&json!({
            "osname": "fedora",
            "checksum": "abc",
            "container-image-reference": "ostree-unverified-registry:quay.io/fedora/fedora-coreos:stable",
        }))
        .unwrap()
        .unwrap();
        assert!(!d.is_installed());
        assert_eq!(
            d.effective_origin(),
            Some("ostree-unverified-registry:quay.io/fedora/fedora-coreos:stable")
        );
    }

    #[test]
    fn signature() {
        let raw = json!([
            true, false, false, false, false, "ABCDEF0123", 1700000000, 0, "RSA", "SHA256",
            "Fedora", "fedora@example.org"
        ]);
        let sig = Signature::from_wire(&raw).unwrap();
        assert!(sig.valid);
        assert!(!sig.expired());
        assert_eq!(sig.fingerprint, "ABCDEF0123");
        assert_eq!(sig.signed_by().as_deref(), Some("Fedora <fedora@example.org>"));
        assert_eq!(sig.key_label().as_deref(), Some("RSA key ID"));

        // Primary key fingerprint and key expiry appended by newer libostree
        let mut extended = raw.as_array().unwrap().clone();
        extended.extend([json!("0123456789ABCDEF"), json!(1800000000), json!(0)]);
        let sig = Signature::from_wire(&Value::Array(extended)).unwrap();
        assert_eq!(sig.user_email, "fedora@example.org");

        let short = json!([true, false, false]);
        assert!(matches!(
            Signature::from_wire(&short),
            Err(ShapeError::Arity {
                expected: 12,
                found: 3,
                ..
            })
        ));
    }

    #[test]
    fn package_diff() {
        let raw = json!([
            ["foo", 0, {"NewPackage": ["foo", "1.0-1", "x86_64"]}],
            ["bar", 1, {"PreviousPackage": ["bar", "2.0-1", "noarch"]}],
            ["baz", 2, {"PreviousPackage": ["baz", "1-1", "x86_64"], "NewPackage": ["baz", "2-1", "x86_64"]}],
        ]);
        let diff = PackageDiff::from_wire(&raw).unwrap();
        assert_eq!(diff.adds.len(), 1);
        assert_eq!(diff.removes[0].version, "2.0-1");
        assert_eq!(diff.removes[0].arch, "noarch");
        assert_eq!(diff.up[0].version, "2-1");
        assert!(diff.down.is_empty());
        assert!(!diff.is_empty());

        assert!(PackageDiff::from_wire(&json!([])).unwrap().is_empty());
        assert!(PackageDiff::from_wire(&json!([["x", 7, {}]])).is_err());
        assert!(PackageDiff::from_wire(&json!([["x", 0, {}]])).is_err());
    }

    #[test]
    fn installed_columns() {
        let p = InstalledPackages::from_rpm_output("zlib\nBash\n\nacl\ncoreutils\nkernel\n").unwrap();
        assert_eq!(p.columns[0], vec!["acl", "Bash", "coreutils"]);
        assert_eq!(p.columns[1], vec!["kernel", "zlib"]);
        assert_eq!(p.len(), 5);
        assert!(InstalledPackages::from_rpm_output("\n").is_none());
    }

    #[test]
    fn download_progress() {
        let args = [
            json!([1700000000u64, 3]),
            json!([2, 0]),
            json!([10, 5, 1]),
            json!([0, 0, 0, 0]),
            json!([40, 100]),
            json!([4096, 1024]),
        ];
        let p = DownloadProgress::from_wire(&args).unwrap();
        assert_eq!(p.outstanding_fetches, 2);
        assert_eq!(p.requested, 100);
        assert_eq!(p.bytes_sec, 1024);
        assert!(DownloadProgress::from_wire(&args[..5]).is_err());
    }
}
