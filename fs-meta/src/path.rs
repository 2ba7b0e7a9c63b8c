use drv_lib::{DrvError, DrvResult};

/// Validated absolute filesystem path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsPath(String);

impl FsPath {
    pub fn parse(path: impl Into<String>) -> DrvResult<Self> {
        let path = path.into();
        if !path.starts_with('/') {
            return Err(DrvError::Invalid(format!(
                "path must be absolute: {}",
                path
            )));
        }
        for comp in path.split('/') {
            if comp == "." || comp == ".." {
                return Err(DrvError::Invalid(format!(
                    "path must not contain '.' or '..': {}",
                    path
                )));
            }
        }
        Ok(Self(path))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Non-empty path components split by `/`.
    /// Example: `/a/b/` -> ["a", "b"], `/` -> []
    pub fn components(&self) -> Vec<&str> {
        self.0.split('/').filter(|s| !s.is_empty()).collect()
    }

    /// Split into parent path and final name. Returns `None` for the root.
    pub fn split_parent_name(&self) -> Option<(FsPath, String)> {
        let path = self.0.trim_end_matches('/');
        if path.is_empty() {
            return None;
        }
        let last_slash = path.rfind('/')?;
        let parent = if last_slash == 0 {
            "/".to_string()
        } else {
            path[..last_slash].to_string()
        };
        let name = path[last_slash + 1..].to_string();
        if name.is_empty() {
            None
        } else {
            Some((FsPath(parent), name))
        }
    }

    pub fn is_root(&self) -> bool {
        let s = self.0.trim_end_matches('/');
        s.is_empty()
    }
}

impl std::fmt::Display for FsPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_parent_name() {
        let path = FsPath::parse("/foo/bar/baz").unwrap();
        let (parent, name) = path.split_parent_name().unwrap();
        assert_eq!(parent.as_str(), "/foo/bar");
        assert_eq!(name, "baz");

        let root_child = FsPath::parse("/foo").unwrap();
        let (parent, name) = root_child.split_parent_name().unwrap();
        assert_eq!(parent.as_str(), "/");
        assert_eq!(name, "foo");

        let root = FsPath::parse("/").unwrap();
        assert!(root.split_parent_name().is_none());
        assert!(root.is_root());

        assert_eq!(
            FsPath::parse("/foo/bar/baz").unwrap().components(),
            vec!["foo", "bar", "baz"]
        );
        assert_eq!(FsPath::parse("/").unwrap().components(), Vec::<&str>::new());
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(FsPath::parse("relative/path").is_err());
        assert!(FsPath::parse("").is_err());
        assert!(FsPath::parse("/a/../b").is_err());
        assert!(FsPath::parse("/a/./b").is_err());
        // trailing slash is tolerated
        assert!(FsPath::parse("/a/b/").is_ok());
    }
}
