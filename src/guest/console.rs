//! Emulated `console` module, host side.
//!
//! Each console call appends a structured `{level, message, timestamp}`
//! record to the invocation's captured log and mirrors to the host logger.
//! Formatting (`%s`/`%d` substitution, object inspection) happens in the
//! guest-side shim before the line crosses the bridge.

use rquickjs::function::Func;
use rquickjs::{Ctx, Object};
use tracing::debug;

use crate::sandbox::state::GuestCell;
use crate::store::LogLevel;

use super::GuestModule;

/// Cap on a single captured console line; the tail is dropped with a marker.
const MAX_LINE_BYTES: usize = 16 * 1024;

/// Cap on captured lines per invocation.
const MAX_LINES: usize = 1_000;

/// Emulated `console` module.
pub struct ConsoleModule;

impl GuestModule for ConsoleModule {
    fn name(&self) -> &'static str {
        "console"
    }

    fn ops<'js>(&self, ctx: &Ctx<'js>, state: &GuestCell) -> rquickjs::Result<Object<'js>> {
        let ops = Object::new(ctx.clone())?;

        let st = state.clone();
        ops.set(
            "write",
            Func::from(move |level: String, mut message: String| {
                if message.len() > MAX_LINE_BYTES {
                    let mut cut = MAX_LINE_BYTES;
                    while !message.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    message.truncate(cut);
                    message.push_str("…[truncated]");
                }
                let mut guard = st.borrow_mut();
                debug!(
                    function_id = %guard.function_id,
                    level = %level,
                    "guest console: {}",
                    message
                );
                if guard.console.len() < MAX_LINES {
                    let level = LogLevel::from_method(&level);
                    guard.push_console(level, message);
                }
            }),
        )?;

        Ok(ops)
    }
}
