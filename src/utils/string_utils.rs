//! Filesystem-safe encoding of coordination resource names
//!
//! Lock keys, flag names and data names are arbitrary strings. The file
//! backend maps each one to a path that is valid on every platform and
//! spreads entries over a two-level directory fan-out so that no single
//! directory grows without bound.

use std::path::{Path, PathBuf};
use xxhash_rust::xxh3::{xxh3_64, xxh3_128};

/// Longest encoded name used verbatim as a file name
///
/// Leaves room for the extension under the common 255-byte component limit.
const MAX_ENCODED_NAME_LEN: usize = 200;

/// Encoded prefix kept in front of the hash of an over-long name
const HASHED_NAME_PREFIX_LEN: usize = 160;

/// Encode a resource name into a string usable as a single path component.
///
/// ASCII letters, digits, `-` and `_` pass through; every other byte of the
/// UTF-8 encoding becomes `.XX` (lowercase hex). The mapping is injective, so
/// distinct names never share a file.
///
/// # Examples
/// ```
/// # use crawl_coord::utils::string_utils::encode_resource_name;
/// assert_eq!(encode_resource_name("abc_DEF-1"), "abc_DEF-1");
/// assert_eq!(encode_resource_name("a/b"), "a.2fb");
/// assert_eq!(encode_resource_name("a.b"), "a.2eb");
/// ```
#[must_use]
pub fn encode_resource_name(name: &str) -> String {
    let mut encoded = String::with_capacity(name.len());
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            encoded.push(char::from(byte));
        } else {
            encoded.push('.');
            encoded.push_str(&format!("{byte:02x}"));
        }
    }
    encoded
}

/// Decode a name produced by [`encode_resource_name`].
///
/// Returns `None` for strings that are not valid encodings.
#[must_use]
pub fn decode_resource_name(encoded: &str) -> Option<String> {
    let bytes = encoded.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'.' {
            let hex = encoded.get(i + 1..i + 3)?;
            decoded.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            decoded.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(decoded).ok()
}

/// File-name form of a resource name
///
/// Short names are their [`encode_resource_name`] encoding. Names whose
/// encoding exceeds the file-name limit keep an encoded prefix followed by
/// `~` and a 128-bit hash of the full name; `~` never occurs in an encoding,
/// so hashed and verbatim forms cannot collide.
#[must_use]
pub fn resource_file_name(name: &str) -> String {
    let encoded = encode_resource_name(name);
    if encoded.len() <= MAX_ENCODED_NAME_LEN {
        return encoded;
    }
    // The encoding is pure ASCII, so any byte offset is a char boundary
    format!(
        "{}~{:032x}",
        &encoded[..HASHED_NAME_PREFIX_LEN],
        xxh3_128(name.as_bytes())
    )
}

/// Build the fan-out path of a resource under `root`:
/// `root/<h1>/<h2>/<file name><extension>` with `h1`, `h2` taken from a stable
/// hash of the name.
#[must_use]
pub fn fanout_path(root: &Path, name: &str, extension: &str) -> PathBuf {
    let hash = xxh3_64(name.as_bytes());
    let first = format!("{:02x}", hash & 0xff);
    let second = format!("{:02x}", (hash >> 8) & 0xff);
    root.join(first)
        .join(second)
        .join(format!("{}{extension}", resource_file_name(name)))
}
