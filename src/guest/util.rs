//! Host ops behind the guest's `util` module.
//!
//! Almost all of `util` (inspect, format, promisify, types, parseArgs) is
//! pure shaping and lives in the guest shim; only the text codecs cross the
//! bridge.

use rquickjs::function::{Func, Opt};
use rquickjs::{ArrayBuffer, Ctx, Object, Value};

use crate::sandbox::bridge::{throw_code, value_to_bytes};
use crate::sandbox::state::GuestCell;

use super::GuestModule;

/// Decode bytes with a named encoding the emulation supports.
pub fn decode_text(bytes: &[u8], encoding: &str) -> Option<String> {
    match encoding {
        "utf-8" | "utf8" | "unicode-1-1-utf-8" => {
            Some(String::from_utf8_lossy(bytes).into_owned())
        }
        "latin1" | "iso-8859-1" | "ascii" => {
            Some(bytes.iter().map(|&b| b as char).collect())
        }
        _ => None,
    }
}

/// Host ops for the `util` module.
pub struct UtilModule;

impl GuestModule for UtilModule {
    fn name(&self) -> &'static str {
        "util"
    }

    fn ops<'js>(&self, ctx: &Ctx<'js>, _state: &GuestCell) -> rquickjs::Result<Object<'js>> {
        let ops = Object::new(ctx.clone())?;

        ops.set(
            "textEncode",
            Func::from(|ctx: Ctx<'js>, s: String| -> rquickjs::Result<ArrayBuffer<'js>> {
                ArrayBuffer::new(ctx, s.into_bytes())
            }),
        )?;

        ops.set(
            "textDecode",
            Func::from(
                |ctx: Ctx<'js>, data: Value<'js>, encoding: Opt<String>| -> rquickjs::Result<String> {
                    let bytes = value_to_bytes(&ctx, &data)?;
                    let encoding = encoding.0.unwrap_or_else(|| "utf-8".into());
                    decode_text(&bytes, &encoding.to_ascii_lowercase()).ok_or_else(|| {
                        throw_code(
                            &ctx,
                            "ERR_ENCODING_NOT_SUPPORTED",
                            &format!("the '{}' encoding is not supported", encoding),
                        )
                    })
                },
            ),
        )?;

        Ok(ops)
    }
}
