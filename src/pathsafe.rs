//! Sandbox-rooted path resolution.
//!
//! Every path that originates in untrusted input (archive entries, guest
//! `require` specifiers, guest `fs` arguments, `res.sendFile`) flows through
//! here. Resolution is lexical first, then verified against the filesystem,
//! so neither `..` hops nor symlink indirection can reach outside the root.

use std::path::{Component, Path, PathBuf};

/// Lexically normalize `candidate` against `root`, refusing any result that
/// would land outside `root`. Does not touch the filesystem.
///
/// `candidate` may be absolute (interpreted as rooted at `root`, the guest's
/// view of `/`) or relative to `root`.
pub fn resolve_under(root: &Path, candidate: &Path) -> Option<PathBuf> {
    let mut resolved = root.to_path_buf();
    let mut depth: usize = 0;

    for component in candidate.components() {
        match component {
            Component::Prefix(_) => return None,
            Component::RootDir => {
                resolved = root.to_path_buf();
                depth = 0;
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return None;
                }
                resolved.pop();
                depth -= 1;
            }
            Component::Normal(part) => {
                resolved.push(part);
                depth += 1;
            }
        }
    }
    Some(resolved)
}

/// Like [`resolve_under`] but additionally canonicalizes through the
/// filesystem, so symlinks inside the tree cannot point back out. The deepest
/// existing ancestor is canonicalized; non-existent tails are checked
/// lexically. Returns the resolved real path.
pub fn resolve_existing_under(root: &Path, candidate: &Path) -> Option<PathBuf> {
    let lexical = resolve_under(root, candidate)?;
    let canonical_root = root.canonicalize().ok()?;

    // Walk up to the deepest ancestor that exists, canonicalize it, and
    // verify it still sits under the root before re-attaching the tail.
    let mut existing = lexical.clone();
    let mut tail = Vec::new();
    loop {
        if existing.exists() {
            break;
        }
        match existing.file_name() {
            Some(name) => {
                tail.push(name.to_os_string());
                existing.pop();
            }
            None => return None,
        }
        if !existing.starts_with(&canonical_root) && !existing.starts_with(root) {
            return None;
        }
    }

    let mut real = existing.canonicalize().ok()?;
    if !real.starts_with(&canonical_root) {
        return None;
    }
    for name in tail.iter().rev() {
        real.push(name);
    }
    Some(real)
}

/// Validate an archive entry's relative path: no absolute components, no
/// parent hops, no prefix components.
pub fn archive_entry_is_safe(entry: &Path) -> bool {
    entry
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_under_plain() {
        let root = Path::new("/srv/pkg");
        assert_eq!(
            resolve_under(root, Path::new("lib/util.js")),
            Some(PathBuf::from("/srv/pkg/lib/util.js"))
        );
        assert_eq!(
            resolve_under(root, Path::new("/index.js")),
            Some(PathBuf::from("/srv/pkg/index.js"))
        );
        assert_eq!(
            resolve_under(root, Path::new("./a/./b.js")),
            Some(PathBuf::from("/srv/pkg/a/b.js"))
        );
    }

    #[test]
    fn test_resolve_under_contains_dotdot() {
        let root = Path::new("/srv/pkg");
        assert_eq!(
            resolve_under(root, Path::new("a/../b.js")),
            Some(PathBuf::from("/srv/pkg/b.js"))
        );
        assert_eq!(resolve_under(root, Path::new("../outside")), None);
        assert_eq!(resolve_under(root, Path::new("a/../../outside")), None);
        assert_eq!(resolve_under(root, Path::new("/../outside")), None);
    }

    #[test]
    fn test_resolve_existing_follows_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir(root.join("sub")).unwrap();
        std::fs::write(root.join("sub/real.txt"), b"x").unwrap();

        let inside = resolve_existing_under(root, Path::new("sub/real.txt")).unwrap();
        assert!(inside.ends_with("sub/real.txt"));

        #[cfg(unix)]
        {
            std::os::unix::fs::symlink("/etc", root.join("evil")).unwrap();
            assert_eq!(resolve_existing_under(root, Path::new("evil/passwd")), None);
        }
    }

    #[test]
    fn test_resolve_existing_nonexistent_tail() {
        let dir = tempfile::tempdir().unwrap();
        let resolved =
            resolve_existing_under(dir.path(), Path::new("made/up/file.js")).unwrap();
        assert!(resolved.ends_with("made/up/file.js"));
        assert_eq!(
            resolve_existing_under(dir.path(), Path::new("../made/up.js")),
            None
        );
    }

    #[test]
    fn test_archive_entry_is_safe() {
        assert!(archive_entry_is_safe(Path::new("a/b/c.js")));
        assert!(archive_entry_is_safe(Path::new("./a.js")));
        assert!(!archive_entry_is_safe(Path::new("../a.js")));
        assert!(!archive_entry_is_safe(Path::new("/etc/passwd")));
        assert!(!archive_entry_is_safe(Path::new("a/../../b.js")));
    }
}
