use std::path::Path;

/// Directory prefixes that must never be touched by worktree cleanup.
const PROTECTED_PREFIXES: [&str; 5] = ["/bin", "/usr", "/etc", "/sys", "/proc"];

/// Whether a worktree directory is safe to remove from disk.
///
/// Rejects empty paths, the filesystem root, any path containing a `..`
/// component, and anything under a system-root prefix. Callers must check
/// this before `remove_dir_all`.
pub fn is_safe_cleanup_path(path: &str) -> bool {
    if path.trim().is_empty() {
        return false;
    }
    let p = Path::new(path);
    if p == Path::new("/") {
        return false;
    }
    if p.components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return false;
    }
    for prefix in PROTECTED_PREFIXES {
        if p == Path::new(prefix) || p.starts_with(prefix) {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_root() {
        assert!(!is_safe_cleanup_path(""));
        assert!(!is_safe_cleanup_path("   "));
        assert!(!is_safe_cleanup_path("/"));
    }

    #[test]
    fn rejects_parent_traversal() {
        assert!(!is_safe_cleanup_path("/var/tmp/../etc"));
        assert!(!is_safe_cleanup_path("../worktrees/x"));
    }

    #[test]
    fn rejects_system_prefixes() {
        assert!(!is_safe_cleanup_path("/etc"));
        assert!(!is_safe_cleanup_path("/etc/passwd"));
        assert!(!is_safe_cleanup_path("/usr/local/share"));
        assert!(!is_safe_cleanup_path("/proc/self"));
    }

    #[test]
    fn accepts_ordinary_worktree_dirs() {
        assert!(is_safe_cleanup_path("/var/tmp/devflow/df-1234-fix-login"));
        assert!(is_safe_cleanup_path("/home/me/work/df-abcd-feature"));
    }
}
