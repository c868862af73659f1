//! Property tests for sandbox-rooted path resolution.
//!
//! The escape-proof invariant: whatever string a guest constructs, the
//! resolved path either stays under the root or resolution refuses it.

use std::path::Path;

use proptest::prelude::*;

use runlet::pathsafe::{archive_entry_is_safe, resolve_under};

fn path_segment() -> impl Strategy<Value = String> {
    prop_oneof![
        3 => "[a-zA-Z0-9_.-]{1,12}",
        2 => Just("..".to_string()),
        1 => Just(".".to_string()),
        1 => Just(String::new()),
    ]
}

fn guest_path() -> impl Strategy<Value = String> {
    (any::<bool>(), proptest::collection::vec(path_segment(), 0..8)).prop_map(
        |(absolute, segments)| {
            let joined = segments.join("/");
            if absolute {
                format!("/{}", joined)
            } else {
                joined
            }
        },
    )
}

proptest! {
    /// Every resolvable path lies under the root; everything else is refused.
    #[test]
    fn resolve_under_never_escapes(candidate in guest_path()) {
        let root = Path::new("/srv/sandbox/pkg");
        match resolve_under(root, Path::new(&candidate)) {
            Some(resolved) => prop_assert!(resolved.starts_with(root)),
            None => {
                // Refusals only happen when the path tries to climb out.
                prop_assert!(candidate.contains(".."));
            }
        }
    }

    /// Safe archive entries resolve under any root.
    #[test]
    fn safe_archive_entries_stay_inside(candidate in guest_path()) {
        let root = Path::new("/srv/sandbox/pkg");
        if archive_entry_is_safe(Path::new(&candidate)) {
            let resolved = resolve_under(root, Path::new(&candidate));
            prop_assert!(resolved.map(|p| p.starts_with(root)).unwrap_or(false));
        }
    }

    /// Resolution is idempotent over already-clean relative paths.
    #[test]
    fn clean_paths_roundtrip(segments in proptest::collection::vec("[a-z0-9]{1,8}", 1..6)) {
        let root = Path::new("/srv/sandbox/pkg");
        let relative = segments.join("/");
        let resolved = resolve_under(root, Path::new(&relative)).unwrap();
        prop_assert_eq!(resolved.strip_prefix(root).unwrap(), Path::new(&relative));
    }
}
