//! Host ops behind the guest's `Buffer` and text codecs.
//!
//! The `Buffer` class itself is a guest-side Uint8Array subclass; these ops
//! cover the encodings that need real codecs on the host.

use base64::Engine;
use rquickjs::function::Func;
use rquickjs::{ArrayBuffer, Ctx, Object, Value};

use crate::sandbox::bridge::{throw_code, value_to_bytes};
use crate::sandbox::state::GuestCell;

use super::GuestModule;

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

/// Host ops for the `buffer` module.
pub struct BufferModule;

impl GuestModule for BufferModule {
    fn name(&self) -> &'static str {
        "buffer"
    }

    fn ops<'js>(&self, ctx: &Ctx<'js>, _state: &GuestCell) -> rquickjs::Result<Object<'js>> {
        let ops = Object::new(ctx.clone())?;

        ops.set(
            "encodeUtf8",
            Func::from(|ctx: Ctx<'js>, s: String| -> rquickjs::Result<ArrayBuffer<'js>> {
                ArrayBuffer::new(ctx, s.into_bytes())
            }),
        )?;

        ops.set(
            "decodeUtf8",
            Func::from(|ctx: Ctx<'js>, data: Value<'js>| -> rquickjs::Result<String> {
                let bytes = value_to_bytes(&ctx, &data)?;
                Ok(String::from_utf8_lossy(&bytes).into_owned())
            }),
        )?;

        ops.set(
            "encodeBase64",
            Func::from(|ctx: Ctx<'js>, data: Value<'js>| -> rquickjs::Result<String> {
                let bytes = value_to_bytes(&ctx, &data)?;
                Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
            }),
        )?;

        ops.set(
            "decodeBase64",
            Func::from(|ctx: Ctx<'js>, s: String| -> rquickjs::Result<ArrayBuffer<'js>> {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(s.trim())
                    .map_err(|e| throw_code(&ctx, "EINVAL", &format!("invalid base64: {}", e)))?;
                ArrayBuffer::new(ctx, bytes)
            }),
        )?;

        ops.set(
            "encodeHex",
            Func::from(|ctx: Ctx<'js>, data: Value<'js>| -> rquickjs::Result<String> {
                let bytes = value_to_bytes(&ctx, &data)?;
                Ok(hex_encode(&bytes))
            }),
        )?;

        ops.set(
            "decodeHex",
            Func::from(|ctx: Ctx<'js>, s: String| -> rquickjs::Result<ArrayBuffer<'js>> {
                let bytes = hex_decode(s.trim())
                    .ok_or_else(|| throw_code(&ctx, "EINVAL", "invalid hex string"))?;
                ArrayBuffer::new(ctx, bytes)
            }),
        )?;

        Ok(ops)
    }
}
