//! Emulated `mime` module, host side.
//!
//! Content-type lookups for the guest and for the response accumulator's
//! `type()`/`sendFile` helpers.

use rquickjs::function::Func;
use rquickjs::{Ctx, Object};

use crate::sandbox::state::GuestCell;

use super::GuestModule;

/// Content type for a path or bare extension, when one is known.
pub fn lookup(path_or_ext: &str) -> Option<String> {
    let candidate = path_or_ext.trim_start_matches('.');
    let guess = if candidate.contains('/') || candidate.contains('.') {
        mime_guess::from_path(path_or_ext)
    } else {
        mime_guess::from_ext(candidate)
    };
    guess.first().map(|m| m.essence_str().to_string())
}

/// Preferred extension for a content type.
pub fn extension(content_type: &str) -> Option<String> {
    mime_guess::get_mime_extensions_str(content_type)
        .and_then(|exts| exts.first())
        .map(|ext| (*ext).to_string())
}

/// Emulated `mime` module.
pub struct MimeModule;

impl GuestModule for MimeModule {
    fn name(&self) -> &'static str {
        "mime"
    }

    fn ops<'js>(&self, ctx: &Ctx<'js>, _state: &GuestCell) -> rquickjs::Result<Object<'js>> {
        let ops = Object::new(ctx.clone())?;
        ops.set(
            "lookup",
            Func::from(|p: String| -> Option<String> { lookup(&p) }),
        )?;
        ops.set(
            "extension",
            Func::from(|t: String| -> Option<String> { extension(&t) }),
        )?;
        Ok(ops)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_path_and_ext() {
        assert_eq!(lookup("report.pdf").as_deref(), Some("application/pdf"));
        assert_eq!(lookup("json").as_deref(), Some("application/json"));
        assert_eq!(lookup(".html").as_deref(), Some("text/html"));
        assert_eq!(lookup("mystery.unknownext"), None);
    }

    #[test]
    fn test_extension_for_type() {
        assert!(extension("text/html").is_some());
        assert_eq!(extension("application/x-never-heard-of-it"), None);
    }
}
