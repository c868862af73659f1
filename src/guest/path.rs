//! Emulated `path` module.
//!
//! Pure POSIX path string operations over the guest's virtual filesystem
//! view (the package root is `/`). No I/O.

use rquickjs::function::{Func, Rest};
use rquickjs::{Ctx, Object};

use crate::sandbox::state::GuestCell;

use super::GuestModule;

/// Normalize a POSIX path string: collapse `//`, resolve `.` and `..`,
/// keep the path relative or absolute as it came in.
pub fn normalize(path: &str) -> String {
    if path.is_empty() {
        return ".".to_string();
    }
    let absolute = path.starts_with('/');
    let trailing = path.len() > 1 && path.ends_with('/');
    let mut parts: Vec<&str> = Vec::new();

    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => match parts.last() {
                Some(&last) if last != ".." => {
                    parts.pop();
                }
                _ if absolute => {}
                _ => parts.push(".."),
            },
            other => parts.push(other),
        }
    }

    let mut result = String::new();
    if absolute {
        result.push('/');
    }
    result.push_str(&parts.join("/"));
    if result.is_empty() {
        return ".".to_string();
    }
    if trailing && result != "/" {
        result.push('/');
    }
    result
}

/// Join segments with `/` and normalize.
pub fn join(parts: &[String]) -> String {
    let joined: Vec<&str> = parts
        .iter()
        .map(|s| s.as_str())
        .filter(|s| !s.is_empty())
        .collect();
    if joined.is_empty() {
        return ".".to_string();
    }
    normalize(&joined.join("/"))
}

/// Resolve segments right-to-left into an absolute path; the guest's working
/// directory is `/`.
pub fn resolve(parts: &[String]) -> String {
    let mut stacked = String::new();
    for part in parts.iter().rev() {
        if part.is_empty() {
            continue;
        }
        if stacked.is_empty() {
            stacked = part.clone();
        } else {
            stacked = format!("{}/{}", part, stacked);
        }
        if part.starts_with('/') {
            break;
        }
    }
    if !stacked.starts_with('/') {
        stacked = format!("/{}", stacked);
    }
    let resolved = normalize(&stacked);
    // resolve() never keeps a trailing slash.
    if resolved.len() > 1 && resolved.ends_with('/') {
        resolved[..resolved.len() - 1].to_string()
    } else {
        resolved
    }
}

/// Directory part of a path.
pub fn dirname(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return if path.starts_with('/') { "/" } else { "." }.to_string();
    }
    match trimmed.rfind('/') {
        None => ".".to_string(),
        Some(0) => "/".to_string(),
        Some(index) => trimmed[..index].to_string(),
    }
}

/// Final path segment, optionally with a matched extension removed.
pub fn basename(path: &str, ext: Option<&str>) -> String {
    let trimmed = path.trim_end_matches('/');
    let base = match trimmed.rfind('/') {
        None => trimmed,
        Some(index) => &trimmed[index + 1..],
    };
    match ext {
        Some(ext) if !ext.is_empty() && base.ends_with(ext) && base.len() > ext.len() => {
            base[..base.len() - ext.len()].to_string()
        }
        _ => base.to_string(),
    }
}

/// Extension including the dot, or empty.
pub fn extname(path: &str) -> String {
    let base = basename(path, None);
    match base.rfind('.') {
        Some(index) if index > 0 => base[index..].to_string(),
        _ => String::new(),
    }
}

/// Relative path from `from` to `to`.
pub fn relative(from: &str, to: &str) -> String {
    let from = resolve(&[from.to_string()]);
    let to = resolve(&[to.to_string()]);
    if from == to {
        return String::new();
    }

    let from_parts: Vec<&str> = from.split('/').filter(|s| !s.is_empty()).collect();
    let to_parts: Vec<&str> = to.split('/').filter(|s| !s.is_empty()).collect();
    let common = from_parts
        .iter()
        .zip(to_parts.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut out: Vec<String> = Vec::new();
    for _ in common..from_parts.len() {
        out.push("..".to_string());
    }
    for part in &to_parts[common..] {
        out.push((*part).to_string());
    }
    out.join("/")
}

/// Split a path into `{root, dir, base, ext, name}`.
pub fn parse_parts(path: &str) -> (String, String, String, String, String) {
    let root = if path.starts_with('/') { "/" } else { "" }.to_string();
    let dir = if path.contains('/') {
        dirname(path)
    } else {
        String::new()
    };
    let base = basename(path, None);
    let ext = extname(path);
    let name = if ext.is_empty() {
        base.clone()
    } else {
        base[..base.len() - ext.len()].to_string()
    };
    (root, dir, base, ext, name)
}

/// Emulated `path` module: every op delegates to the pure functions above.
pub struct PathModule;

impl GuestModule for PathModule {
    fn name(&self) -> &'static str {
        "path"
    }

    fn ops<'js>(&self, ctx: &Ctx<'js>, _state: &GuestCell) -> rquickjs::Result<Object<'js>> {
        let ops = Object::new(ctx.clone())?;
        ops.set("sep", "/")?;
        ops.set("delimiter", ":")?;
        ops.set(
            "normalize",
            Func::from(|p: String| -> String { normalize(&p) }),
        )?;
        ops.set(
            "join",
            Func::from(|parts: Rest<String>| -> String { join(&parts.0) }),
        )?;
        ops.set(
            "resolve",
            Func::from(|parts: Rest<String>| -> String { resolve(&parts.0) }),
        )?;
        ops.set(
            "isAbsolute",
            Func::from(|p: String| -> bool { p.starts_with('/') }),
        )?;
        ops.set(
            "dirname",
            Func::from(|p: String| -> String { dirname(&p) }),
        )?;
        ops.set(
            "basename",
            Func::from(|p: String, ext: rquickjs::function::Opt<String>| -> String {
                basename(&p, ext.0.as_deref())
            }),
        )?;
        ops.set(
            "extname",
            Func::from(|p: String| -> String { extname(&p) }),
        )?;
        ops.set(
            "relative",
            Func::from(|from: String, to: String| -> String { relative(&from, &to) }),
        )?;
        ops.set(
            "parse",
            Func::from(|ctx: Ctx<'js>, p: String| -> rquickjs::Result<Object<'js>> {
                let (root, dir, base, ext, name) = parse_parts(&p);
                let parsed = Object::new(ctx)?;
                parsed.set("root", root)?;
                parsed.set("dir", dir)?;
                parsed.set("base", base)?;
                parsed.set("ext", ext)?;
                parsed.set("name", name)?;
                Ok(parsed)
            }),
        )?;
        ops.set(
            "format",
            Func::from(|parts: Object<'js>| -> rquickjs::Result<String> {
                let dir: Option<String> = parts.get("dir").ok().flatten();
                let root: Option<String> = parts.get("root").ok().flatten();
                let base: Option<String> = parts.get("base").ok().flatten();
                let name: Option<String> = parts.get("name").ok().flatten();
                let ext: Option<String> = parts.get("ext").ok().flatten();

                let base = base.unwrap_or_else(|| {
                    let name = name.unwrap_or_default();
                    let ext = ext.unwrap_or_default();
                    format!("{}{}", name, ext)
                });
                Ok(match dir.or(root) {
                    Some(dir) if !dir.is_empty() => {
                        if dir.ends_with('/') {
                            format!("{}{}", dir, base)
                        } else {
                            format!("{}/{}", dir, base)
                        }
                    }
                    _ => base,
                })
            }),
        )?;
        Ok(ops)
    }
}
