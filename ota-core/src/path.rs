//! Store path handling. Paths are absolute, `/`-separated, without a trailing
//! separator except for the root itself.

use crate::error::StoreError;

pub const ROOT: &str = "/";

/// Normalize `path` to the canonical absolute form. Rejects `..` components
/// and NUL bytes.
pub fn normalize(path: &str) -> Result<String, StoreError> {
    if path.contains('\0') {
        return Err(StoreError::InvalidPath(path.to_string()));
    }

    let mut out = String::with_capacity(path.len() + 1);
    for part in path.split(['/', '\\']) {
        match part {
            "" | "." => continue,
            ".." => return Err(StoreError::InvalidPath(path.to_string())),
            part => {
                out.push('/');
                out.push_str(part);
            }
        }
    }

    if out.is_empty() {
        out.push('/');
    }
    Ok(out)
}

/// Join a directory and a relative name. An empty directory means the root.
pub fn join(dir: &str, name: &str) -> Result<String, StoreError> {
    normalize(&format!("{dir}/{name}"))
}

/// Parent directory of a normalized path. The root is its own parent.
pub fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => ROOT,
        Some(idx) => &path[..idx],
    }
}

/// Last component of a normalized path.
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Validate a single file name coming from a client.
pub fn validate_filename(filename: &str) -> Result<(), StoreError> {
    if filename.is_empty()
        || filename.contains("..")
        || filename.chars().any(|c| matches!(c, '/' | '\\' | '\0'))
        || filename.len() > 128
    {
        return Err(StoreError::InvalidPath(filename.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("").unwrap(), "/");
        assert_eq!(normalize("/").unwrap(), "/");
        assert_eq!(normalize("a/b.txt").unwrap(), "/a/b.txt");
        assert_eq!(normalize("//a///c/").unwrap(), "/a/c");
        assert_eq!(normalize("/a/./b").unwrap(), "/a/b");
        assert!(normalize("/a/../etc").is_err());
        assert!(normalize("a\0b").is_err());
    }

    #[test]
    fn test_join() {
        assert_eq!(join("/", "fw.bin").unwrap(), "/fw.bin");
        assert_eq!(join("", "fw.bin").unwrap(), "/fw.bin");
        assert_eq!(join("/www", "index.html").unwrap(), "/www/index.html");
        assert!(join("/www", "../x").is_err());
    }

    #[test]
    fn test_parent_and_name() {
        assert_eq!(parent("/a/b.txt"), "/a");
        assert_eq!(parent("/a"), "/");
        assert_eq!(parent("/"), "/");
        assert_eq!(file_name("/a/b.txt"), "b.txt");
        assert_eq!(file_name("/a"), "a");
    }

    #[test]
    fn test_validate_filename() {
        assert!(validate_filename("config.json").is_ok());
        assert!(validate_filename("../etc/passwd").is_err());
        assert!(validate_filename("file/name").is_err());
        assert!(validate_filename("").is_err());
        assert!(validate_filename(&"a".repeat(129)).is_err());
    }
}
