//! Request path decoding and containment.

use std::path::{Component, Path, PathBuf};

use percent_encoding::percent_decode_str;

/// Why a request path was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathRejection {
    /// Malformed percent-escape or embedded NUL.
    BadRequest,
    /// The normalized path escapes the configured root.
    Forbidden,
}

/// Percent-decodes a request path. Rejects undecodable escapes and NUL
/// bytes outright.
pub fn decode(raw: &str) -> Result<String, PathRejection> {
    let decoded = percent_decode_str(raw)
        .decode_utf8()
        .map_err(|_| PathRejection::BadRequest)?;
    if decoded.contains('\0') {
        return Err(PathRejection::BadRequest);
    }
    Ok(decoded.into_owned())
}

/// Joins a decoded request path onto `root`, normalizing away `.` and
/// `..` components. Any traversal above the root is forbidden, however it
/// was spelled.
pub fn resolve(root: &Path, decoded: &str) -> Result<PathBuf, PathRejection> {
    let mut clean = PathBuf::new();
    for component in Path::new(decoded).components() {
        match component {
            Component::Normal(seg) => clean.push(seg),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                if !clean.pop() {
                    return Err(PathRejection::Forbidden);
                }
            }
            Component::Prefix(_) => return Err(PathRejection::Forbidden),
        }
    }
    Ok(root.join(clean))
}
