//! Copy-only bridge between host and guest.
//!
//! Values cross the boundary as primitives, byte buffers, or JSON-shaped
//! structured clones; callbacks cross as [`Persistent`] function references
//! that the event loop invokes later. Nothing here hands the guest a live
//! host reference.

use rquickjs::{ArrayBuffer, Ctx, Exception, FromJs, Function, Persistent, Value};

use super::state::BridgeArg;

/// Convert a JSON value into a guest value (deep copy).
pub fn json_to_js<'js>(ctx: &Ctx<'js>, value: &serde_json::Value) -> rquickjs::Result<Value<'js>> {
    let encoded = serde_json::to_string(value)
        .map_err(|e| throw(ctx, &format!("bridge serialization failed: {}", e)))?;
    ctx.json_parse(encoded)
}

/// Convert a guest value into JSON (deep copy). `None` means the value has
/// no JSON form (`undefined`, functions, symbols).
pub fn js_to_json<'js>(
    ctx: &Ctx<'js>,
    value: Value<'js>,
) -> rquickjs::Result<Option<serde_json::Value>> {
    match ctx.json_stringify(value)? {
        Some(encoded) => {
            let encoded = encoded.to_string()?;
            Ok(Some(serde_json::from_str(&encoded).map_err(|e| {
                throw(ctx, &format!("bridge deserialization failed: {}", e))
            })?))
        }
        None => Ok(None),
    }
}

/// Convert a host-made [`BridgeArg`] into a guest value.
pub fn arg_to_js<'js>(ctx: &Ctx<'js>, arg: &BridgeArg) -> rquickjs::Result<Value<'js>> {
    match arg {
        BridgeArg::Null => Ok(Value::new_null(ctx.clone())),
        BridgeArg::Json(value) => json_to_js(ctx, value),
        BridgeArg::Bytes(bytes) => {
            let buffer = ArrayBuffer::new(ctx.clone(), bytes.clone())?;
            Ok(buffer.into_value())
        }
    }
}

/// Invoke a saved callback reference with host-made args. The callback's own
/// exceptions surface to the caller so the event loop can settle on them.
pub fn invoke_callback<'js>(
    ctx: &Ctx<'js>,
    callback: Persistent<Function<'static>>,
    args: &[BridgeArg],
) -> rquickjs::Result<()> {
    let function = callback.restore(ctx)?;
    match args.len() {
        0 => function.call::<_, ()>(()),
        1 => function.call::<_, ()>((arg_to_js(ctx, &args[0])?,)),
        2 => function.call::<_, ()>((arg_to_js(ctx, &args[0])?, arg_to_js(ctx, &args[1])?)),
        _ => {
            let converted = args
                .iter()
                .map(|a| arg_to_js(ctx, a))
                .collect::<rquickjs::Result<Vec<_>>>()?;
            function.call::<_, ()>((rquickjs::function::Rest(converted),))
        }
    }
}

/// Throw a plain guest exception with `message`.
pub fn throw(ctx: &Ctx<'_>, message: &str) -> rquickjs::Error {
    Exception::throw_message(ctx, message)
}

/// Throw a guest exception whose message carries an errno-style code prefix
/// (`"EACCES: ..."`). Guest shims split the prefix back out into `err.code`.
pub fn throw_code(ctx: &Ctx<'_>, code: &str, message: &str) -> rquickjs::Error {
    Exception::throw_message(ctx, &format!("{}: {}", code, message))
}

/// Map an I/O error onto the errno code Node would report.
pub fn io_error_code(e: &std::io::Error) -> &'static str {
    use std::io::ErrorKind;
    match e.kind() {
        ErrorKind::NotFound => "ENOENT",
        ErrorKind::PermissionDenied => "EACCES",
        ErrorKind::AlreadyExists => "EEXIST",
        ErrorKind::InvalidInput => "EINVAL",
        ErrorKind::TimedOut => "ETIMEDOUT",
        ErrorKind::ConnectionRefused => "ECONNREFUSED",
        ErrorKind::ConnectionReset => "ECONNRESET",
        ErrorKind::BrokenPipe => "EPIPE",
        ErrorKind::AddrInUse => "EADDRINUSE",
        ErrorKind::AddrNotAvailable => "EADDRNOTAVAIL",
        ErrorKind::WouldBlock => "EAGAIN",
        ErrorKind::Interrupted => "EINTR",
        ErrorKind::UnexpectedEof => "EOF",
        _ => "EIO",
    }
}

/// Bytes of a guest value that should behave like binary data: ArrayBuffer,
/// any typed-array view, or a UTF-8 string.
pub fn value_to_bytes<'js>(ctx: &Ctx<'js>, value: &Value<'js>) -> rquickjs::Result<Vec<u8>> {
    if let Some(string) = value.as_string() {
        return Ok(string.to_string()?.into_bytes());
    }
    if let Ok(buffer) = ArrayBuffer::from_js(ctx, value.clone()) {
        return Ok(buffer
            .as_bytes()
            .map(|b| b.to_vec())
            .unwrap_or_default());
    }
    if let Some(object) = value.as_object() {
        // Typed-array views expose their backing buffer plus offset/length.
        if let Ok(buffer) = object.get::<_, ArrayBuffer>("buffer") {
            let offset: usize = object.get("byteOffset").unwrap_or(0);
            let length: usize = object.get("byteLength").unwrap_or(0);
            if let Some(bytes) = buffer.as_bytes() {
                let end = (offset + length).min(bytes.len());
                return Ok(bytes[offset.min(end)..end].to_vec());
            }
        }
    }
    Err(throw_code(
        ctx,
        "EINVAL",
        "expected a string, ArrayBuffer, or typed array",
    ))
}
