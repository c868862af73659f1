//! Invocation-surface bridge ops.
//!
//! One ops object per invocation carrying the request mirror in, the
//! response accumulator writes out, and the settle signals that end the
//! event loop. Installed as the `invoke` entry of the ops table.

use std::path::Path;

use rquickjs::function::{Func, Opt};
use rquickjs::{Ctx, Object, Value};

use crate::pathsafe;
use crate::sandbox::bridge::{js_to_json, json_to_js, throw_code, value_to_bytes};
use crate::sandbox::state::{BodyPayload, GuestCell, Settled};

use super::RequestMirror;

pub fn build_invoke_ops<'js>(
    ctx: &Ctx<'js>,
    state: &GuestCell,
    request: &RequestMirror,
) -> rquickjs::Result<Object<'js>> {
    let ops = Object::new(ctx.clone())?;

    let mirror = serde_json::to_value(request)
        .map_err(|e| throw_code(ctx, "EINVAL", &format!("request mirror: {}", e)))?;
    ops.set(
        "request",
        Func::from(move |ctx: Ctx<'js>| -> rquickjs::Result<Value<'js>> {
            json_to_js(&ctx, &mirror)
        }),
    )?;

    let st = state.clone();
    ops.set(
        "resSetStatus",
        Func::from(move |code: i32| {
            let mut guard = st.borrow_mut();
            if !guard.response.ended {
                guard.response.status = Some(code.clamp(100, 599) as u16);
            }
        }),
    )?;

    let st = state.clone();
    ops.set(
        "resSetHeader",
        Func::from(move |name: String, value: String| {
            let mut guard = st.borrow_mut();
            if !guard.response.ended {
                guard.response.headers.insert(name.to_ascii_lowercase(), value);
            }
        }),
    )?;

    let st = state.clone();
    ops.set(
        "resGetHeader",
        Func::from(move |name: String| -> Option<String> {
            st.borrow().response.headers.get(&name.to_ascii_lowercase()).cloned()
        }),
    )?;

    let st = state.clone();
    ops.set(
        "resRemoveHeader",
        Func::from(move |name: String| {
            st.borrow_mut().response.headers.remove(&name.to_ascii_lowercase());
        }),
    )?;

    let st = state.clone();
    ops.set(
        "resWriteJson",
        Func::from(move |ctx: Ctx<'js>, encoded: String| -> rquickjs::Result<()> {
            let value: serde_json::Value = serde_json::from_str(&encoded)
                .map_err(|e| throw_code(&ctx, "EINVAL", &format!("res.json payload: {}", e)))?;
            let mut guard = st.borrow_mut();
            if !guard.response.ended {
                guard
                    .response
                    .headers
                    .entry("content-type".into())
                    .or_insert_with(|| "application/json".into());
                guard.response.body = BodyPayload::Json(value);
                guard.response.written = true;
            }
            Ok(())
        }),
    )?;

    let st = state.clone();
    ops.set(
        "resWriteText",
        Func::from(move |text: String| {
            let mut guard = st.borrow_mut();
            if !guard.response.ended {
                guard
                    .response
                    .headers
                    .entry("content-type".into())
                    .or_insert_with(|| "text/plain; charset=utf-8".into());
                guard.response.body = BodyPayload::Text(text);
                guard.response.written = true;
            }
        }),
    )?;

    let st = state.clone();
    ops.set(
        "resWriteBytes",
        Func::from(move |ctx: Ctx<'js>, data: Value<'js>| -> rquickjs::Result<()> {
            let bytes = value_to_bytes(&ctx, &data)?;
            let mut guard = st.borrow_mut();
            if !guard.response.ended {
                // Raw byte bodies are never JSON-wrapped; with no explicit
                // content-type they go out as an octet stream.
                guard
                    .response
                    .headers
                    .entry("content-type".into())
                    .or_insert_with(|| "application/octet-stream".into());
                guard.response.body = BodyPayload::Bytes(bytes);
                guard.response.written = true;
            }
            Ok(())
        }),
    )?;

    let st = state.clone();
    ops.set(
        "resSendFile",
        Func::from(move |ctx: Ctx<'js>, guest_path: String| -> rquickjs::Result<()> {
            let root = st.borrow().package_root.clone();
            let real = pathsafe::resolve_existing_under(&root, Path::new(&guest_path))
                .filter(|p| p.is_file())
                .ok_or_else(|| {
                    throw_code(
                        &ctx,
                        "EACCES",
                        &format!("sendFile '{}' is not a file under the package root", guest_path),
                    )
                })?;
            let content_type = crate::guest::mime::lookup(&guest_path)
                .unwrap_or_else(|| "application/octet-stream".into());
            let mut guard = st.borrow_mut();
            if !guard.response.ended {
                guard
                    .response
                    .headers
                    .entry("content-type".into())
                    .or_insert(content_type);
                guard.response.body = BodyPayload::File(real);
                guard.response.written = true;
            }
            Ok(())
        }),
    )?;

    let st = state.clone();
    ops.set(
        "resEnd",
        Func::from(move || {
            let mut guard = st.borrow_mut();
            guard.response.written = true;
            guard.response.ended = true;
        }),
    )?;

    let st = state.clone();
    ops.set(
        "settleReturn",
        Func::from(move |ctx: Ctx<'js>, value: Value<'js>| -> rquickjs::Result<()> {
            let json = if value.is_undefined() {
                None
            } else {
                js_to_json(&ctx, value)?
            };
            let mut guard = st.borrow_mut();
            if guard.settled.is_none() {
                guard.settled = Some(Settled::Return(json));
            }
            Ok(())
        }),
    )?;

    let st = state.clone();
    ops.set(
        "settleThrow",
        Func::from(move |message: String, stack: Opt<String>| {
            let mut guard = st.borrow_mut();
            if guard.settled.is_none() {
                guard.settled = Some(Settled::Threw {
                    message,
                    stack: stack.0,
                });
            }
        }),
    )?;

    let st = state.clone();
    ops.set(
        "settleBadExport",
        Func::from(move || {
            let mut guard = st.borrow_mut();
            if guard.settled.is_none() {
                guard.settled = Some(Settled::BadExport);
            }
        }),
    )?;

    Ok(ops)
}
