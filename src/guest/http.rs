//! Emulated `http` / `https` client, host side.
//!
//! The bridge op performs one full request/response exchange on the guest's
//! worker thread through the per-guest blocking client, whose keep-alive
//! pool is keyed by host:port and dies with the guest. The guest-side shim
//! shapes this into `ClientRequest` / `IncomingMessage` streams and the
//! `Agent` surface. Servers throw `ENOTSUP` in the shim.

use std::time::Duration;

use rquickjs::function::{Func, Opt};
use rquickjs::{ArrayBuffer, Ctx, Object, Value};

use crate::sandbox::bridge::{throw_code, value_to_bytes};
use crate::sandbox::state::GuestCell;

use super::GuestModule;

/// Emulated `http` (or `https`) module; both share one bridge op and differ
/// only in the defaults the shim applies.
pub struct HttpModule {
    name: &'static str,
    secure: bool,
}

impl HttpModule {
    pub fn plain() -> Self {
        Self {
            name: "http",
            secure: false,
        }
    }

    pub fn secure() -> Self {
        Self {
            name: "https",
            secure: true,
        }
    }
}

fn perform_request<'js>(
    ctx: &Ctx<'js>,
    state: &GuestCell,
    options: Object<'js>,
    body: Option<Value<'js>>,
) -> rquickjs::Result<Object<'js>> {
    let protocol: String = options
        .get::<_, Option<String>>("protocol")?
        .unwrap_or_else(|| "http:".into());
    let hostname: String = options
        .get::<_, Option<String>>("hostname")?
        .ok_or_else(|| throw_code(ctx, "EINVAL", "request requires a hostname"))?;
    let default_port = if protocol == "https:" { 443 } else { 80 };
    let port: u16 = options.get::<_, Option<u16>>("port")?.unwrap_or(default_port);
    let path: String = options
        .get::<_, Option<String>>("path")?
        .unwrap_or_else(|| "/".into());
    let method: String = options
        .get::<_, Option<String>>("method")?
        .unwrap_or_else(|| "GET".into());
    let timeout_ms: Option<f64> = options.get("timeout")?;

    let scheme = protocol.trim_end_matches(':');
    if scheme != "http" && scheme != "https" {
        return Err(throw_code(
            ctx,
            "EINVAL",
            &format!("unsupported protocol '{}'", protocol),
        ));
    }
    let url = format!("{}://{}:{}{}", scheme, hostname, port, path);

    let method = reqwest::Method::from_bytes(method.as_bytes())
        .map_err(|_| throw_code(ctx, "EINVAL", &format!("invalid method '{}'", method)))?;

    let remaining = state.borrow().remaining();
    if remaining.is_zero() {
        return Err(throw_code(ctx, "ETIMEDOUT", "invocation deadline reached"));
    }
    let timeout = match timeout_ms {
        Some(ms) if ms > 0.0 => remaining.min(Duration::from_millis(ms as u64)),
        _ => remaining,
    };

    let client = state
        .borrow_mut()
        .http_client()
        .map_err(|e| throw_code(ctx, "EIO", &e.to_string()))?;

    let mut request = client.request(method, &url).timeout(timeout);
    if let Some(headers) = options.get::<_, Option<Object>>("headers")? {
        for entry in headers.props::<String, String>() {
            let (name, value) = entry?;
            request = request.header(&name, &value);
        }
    }
    if let Some(body) = body {
        if !body.is_null() && !body.is_undefined() {
            request = request.body(value_to_bytes(ctx, &body)?);
        }
    }

    let response = request.send().map_err(|e| {
        let code = if e.is_timeout() {
            "ETIMEDOUT"
        } else if e.is_connect() {
            "ECONNREFUSED"
        } else {
            "EIO"
        };
        throw_code(ctx, code, &e.to_string())
    })?;

    let status = response.status();
    let result = Object::new(ctx.clone())?;
    result.set("statusCode", status.as_u16())?;
    result.set(
        "statusMessage",
        status.canonical_reason().unwrap_or("").to_string(),
    )?;

    let headers = Object::new(ctx.clone())?;
    for (name, value) in response.headers() {
        if let Ok(value) = value.to_str() {
            let key = name.as_str().to_ascii_lowercase();
            // Repeated headers (set-cookie) collapse onto a comma join,
            // matching what the shim exposes as message.headers.
            match headers.get::<_, Option<String>>(key.as_str())? {
                Some(existing) => headers.set(key.as_str(), format!("{}, {}", existing, value))?,
                None => headers.set(key.as_str(), value.to_string())?,
            }
        }
    }
    result.set("headers", headers)?;

    let body_bytes = response
        .bytes()
        .map_err(|e| throw_code(ctx, "ECONNRESET", &e.to_string()))?;
    result.set("body", ArrayBuffer::new(ctx.clone(), body_bytes.to_vec())?)?;
    Ok(result)
}

impl GuestModule for HttpModule {
    fn name(&self) -> &'static str {
        self.name
    }

    fn ops<'js>(&self, ctx: &Ctx<'js>, state: &GuestCell) -> rquickjs::Result<Object<'js>> {
        let ops = Object::new(ctx.clone())?;
        ops.set("secure", self.secure)?;

        let st = state.clone();
        ops.set(
            "request",
            Func::from(
                move |ctx: Ctx<'js>,
                      options: Object<'js>,
                      body: Opt<Value<'js>>|
                      -> rquickjs::Result<Object<'js>> {
                    perform_request(&ctx, &st, options, body.0)
                },
            ),
        )?;

        Ok(ops)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::state::{DeadlineState, GuestState};
    use rquickjs::{Context, Runtime};
    use std::time::Instant;

    #[test]
    fn test_request_rejects_bad_protocol() {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();
        let state = GuestState::new(
            "fn-test".into(),
            std::env::temp_dir(),
            vec![],
            DeadlineState::new(Instant::now() + Duration::from_secs(5)),
            Duration::from_secs(5),
        );
        context.with(|ctx| {
            let ops = HttpModule::plain().ops(&ctx, &state).unwrap();
            ctx.globals().set("__http", ops).unwrap();
            let caught: String = ctx
                .eval(
                    r#"
                    (function () {
                        try {
                            __http.request({ protocol: 'ftp:', hostname: 'x' });
                            return 'no-error';
                        } catch (e) { return String(e.message || e); }
                    })()
                    "#,
                )
                .unwrap();
            assert!(caught.contains("EINVAL"), "got {}", caught);
        });
    }

    #[test]
    fn test_request_requires_hostname() {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();
        let state = GuestState::new(
            "fn-test".into(),
            std::env::temp_dir(),
            vec![],
            DeadlineState::new(Instant::now() + Duration::from_secs(5)),
            Duration::from_secs(5),
        );
        context.with(|ctx| {
            let ops = HttpModule::secure().ops(&ctx, &state).unwrap();
            ctx.globals().set("__https", ops).unwrap();
            let secure: bool = ctx.eval("__https.secure").unwrap();
            assert!(secure);
            let caught: String = ctx
                .eval(
                    r#"
                    (function () {
                        try { __https.request({}); return 'no-error'; }
                        catch (e) { return String(e.message || e); }
                    })()
                    "#,
                )
                .unwrap();
            assert!(caught.contains("hostname"), "got {}", caught);
        });
    }
}
