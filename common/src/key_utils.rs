use crate::constants::{MAX_NAME_LEN, META_KEY_PREFIX, RESERVED_SYSTEM_KEY};
use crate::error::StoreError;

/// Characters that would escape the double-quoted shell word the name ends up in.
const SHELL_FORBIDDEN: &[char] = &['"', '`', '$', '\\'];

pub fn meta_key_for(name: &str) -> String {
    format!("{}:{}", META_KEY_PREFIX, name)
}

pub fn name_from_meta_key(meta_key: &str) -> Option<&str> {
    meta_key.strip_prefix(META_KEY_PREFIX)?.strip_prefix(':')
}

/// Checks that a file name can be used both as a catalog key and as a path
/// relative to a node's storage root.
pub fn validate_name(name: &str) -> Result<(), StoreError> {
    let invalid = || StoreError::InvalidName(name.to_string());

    if name.is_empty() || name.len() > MAX_NAME_LEN || name == RESERVED_SYSTEM_KEY {
        return Err(invalid());
    }
    if name.starts_with('/') || name.ends_with('/') {
        return Err(invalid());
    }
    if name
        .chars()
        .any(|c| c.is_control() || SHELL_FORBIDDEN.contains(&c))
    {
        return Err(invalid());
    }
    if name.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..") {
        return Err(invalid());
    }
    Ok(())
}

/// Directory part of a file name, empty when the file sits at the root.
pub fn parent_dir(name: &str) -> &str {
    match name.rfind('/') {
        Some(idx) => &name[..idx],
        None => "",
    }
}

/// Joins a node storage root and a relative name without doubling slashes.
pub fn remote_path(root: &str, name: &str) -> String {
    if name.is_empty() {
        return root.to_string();
    }
    format!("{}/{}", root.trim_end_matches('/'), name)
}
