//! CommonJS module loading, host side.
//!
//! Relative requires resolve against the requiring module's directory and
//! must stay under the package root; the resolver tries the literal path,
//! then `.js`, then `/index.js`. Source crosses the bridge as text and the
//! guest shim compiles and caches it. Synchronous loads run under the
//! tighter load deadline, bracketed by `beginLoad`/`endLoad`.

use std::path::Path;
use std::time::Instant;

use rquickjs::function::Func;
use rquickjs::{Ctx, Object};

use crate::guest::path as guest_path;
use crate::guest::GuestModule;
use crate::pathsafe;
use crate::sandbox::bridge::throw_code;
use crate::sandbox::state::GuestCell;

/// Largest module source the loader will hand to the guest.
const MAX_MODULE_BYTES: u64 = 8 * 1024 * 1024;

/// A resolved module: guest-visible path, its directory, and the source.
#[derive(Debug)]
struct Located {
    guest_path: String,
    guest_dir: String,
    source: String,
}

fn locate(state: &GuestCell, spec: &str, from_dir: &str) -> Result<Located, (String, String)> {
    let denied = |p: &str| {
        (
            "EACCES".to_string(),
            format!("require of '{}' resolves outside the package root", p),
        )
    };
    let not_found = || {
        (
            "MODULE_NOT_FOUND".to_string(),
            format!("Cannot find module '{}'", spec),
        )
    };

    let root = state.borrow().package_root.clone();

    // Join without clamping: a `..` chain that climbs past the package root
    // is a denial, not a miss.
    let combined = if spec.starts_with('/') {
        spec.to_string()
    } else {
        format!("{}/{}", from_dir.trim_end_matches('/'), spec)
    };
    let Some(base_real) = pathsafe::resolve_under(&root, Path::new(&combined)) else {
        return Err(denied(&combined));
    };
    let base = match base_real.strip_prefix(&root) {
        Ok(relative) if relative.as_os_str().is_empty() => "/".to_string(),
        Ok(relative) => format!("/{}", relative.display()),
        Err(_) => return Err(denied(&combined)),
    };

    let candidates = [
        base.clone(),
        format!("{}.js", base),
        format!("{}/index.js", base.trim_end_matches('/')),
    ];

    for candidate in &candidates {
        let Some(real) = pathsafe::resolve_existing_under(&root, Path::new(candidate)) else {
            return Err(denied(candidate));
        };
        if !real.is_file() {
            continue;
        }
        let size = real.metadata().map(|m| m.len()).unwrap_or(0);
        if size > MAX_MODULE_BYTES {
            return Err((
                "ERR_FILE_TOO_LARGE".to_string(),
                format!("module '{}' exceeds the source size limit", candidate),
            ));
        }
        let source = std::fs::read_to_string(&real)
            .map_err(|e| ("EIO".to_string(), format!("{}: {}", candidate, e)))?;
        let guest_path = candidate.clone();
        let guest_dir = guest_path::dirname(&guest_path);
        return Ok(Located {
            guest_path,
            guest_dir,
            source,
        });
    }
    Err(not_found())
}

/// Host ops for the guest's `require` machinery, exposed as the `module`
/// entry of the ops table.
pub struct ModuleLoaderModule;

impl GuestModule for ModuleLoaderModule {
    fn name(&self) -> &'static str {
        "module"
    }

    fn ops<'js>(&self, ctx: &Ctx<'js>, state: &GuestCell) -> rquickjs::Result<Object<'js>> {
        let ops = Object::new(ctx.clone())?;

        let st = state.clone();
        ops.set(
            "load",
            Func::from(
                move |ctx: Ctx<'js>, spec: String, from_dir: String| -> rquickjs::Result<Object<'js>> {
                    match locate(&st, &spec, &from_dir) {
                        Ok(located) => {
                            let result = Object::new(ctx)?;
                            result.set("path", located.guest_path)?;
                            result.set("dir", located.guest_dir)?;
                            result.set("source", located.source)?;
                            Ok(result)
                        }
                        Err((code, message)) => Err(throw_code(&ctx, &code, &message)),
                    }
                },
            ),
        )?;

        let st = state.clone();
        ops.set(
            "beginLoad",
            Func::from(move || {
                let mut guard = st.borrow_mut();
                guard.load_depth += 1;
                if guard.load_depth == 1 {
                    let until = Instant::now() + guard.load_budget;
                    *guard.deadline.load_until.lock() = Some(until);
                }
            }),
        )?;

        let st = state.clone();
        ops.set(
            "endLoad",
            Func::from(move || {
                let mut guard = st.borrow_mut();
                guard.load_depth = guard.load_depth.saturating_sub(1);
                if guard.load_depth == 0 {
                    *guard.deadline.load_until.lock() = None;
                }
            }),
        )?;

        Ok(ops)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::state::{DeadlineState, GuestState};
    use std::time::Duration;

    fn state_with_root(root: &Path) -> GuestCell {
        GuestState::new(
            "fn-test".into(),
            root.canonicalize().unwrap(),
            vec![],
            DeadlineState::new(Instant::now() + Duration::from_secs(30)),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn test_locate_literal_then_js_then_index() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("exact.js"), "exports.a = 1;").unwrap();
        std::fs::create_dir(dir.path().join("pkg")).unwrap();
        std::fs::write(dir.path().join("pkg/index.js"), "exports.b = 2;").unwrap();
        let state = state_with_root(dir.path());

        let located = locate(&state, "./exact.js", "/").unwrap();
        assert_eq!(located.guest_path, "/exact.js");
        assert_eq!(located.guest_dir, "/");

        let located = locate(&state, "./exact", "/").unwrap();
        assert_eq!(located.guest_path, "/exact.js");

        let located = locate(&state, "./pkg", "/").unwrap();
        assert_eq!(located.guest_path, "/pkg/index.js");
        assert_eq!(located.guest_dir, "/pkg");
    }

    #[test]
    fn test_locate_relative_from_subdir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("lib")).unwrap();
        std::fs::write(dir.path().join("lib/a.js"), "exports.a = 1;").unwrap();
        std::fs::write(dir.path().join("top.js"), "exports.t = 1;").unwrap();
        let state = state_with_root(dir.path());

        let located = locate(&state, "../top", "/lib").unwrap();
        assert_eq!(located.guest_path, "/top.js");
    }

    #[test]
    fn test_locate_escape_denied() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with_root(dir.path());
        let (code, _message) = locate(&state, "../../../etc/passwd", "/").unwrap_err();
        assert_eq!(code, "EACCES");
    }

    #[test]
    fn test_locate_missing_module() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with_root(dir.path());
        let (code, message) = locate(&state, "./ghost", "/").unwrap_err();
        assert_eq!(code, "MODULE_NOT_FOUND");
        assert!(message.contains("./ghost"));
    }
}
