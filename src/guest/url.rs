//! Emulated `url` module, host side.
//!
//! WHATWG parsing and serialization are bridged to the host's URL
//! implementation; the guest shim keeps the `URL` object surface (getters,
//! setters, `URLSearchParams`) and calls back in whenever a component
//! mutation needs re-parsing.

use rquickjs::function::{Func, Opt};
use rquickjs::{Ctx, Object};
use url::Url;

use crate::sandbox::bridge::throw_code;
use crate::sandbox::state::GuestCell;

use super::GuestModule;

fn parts_object<'js>(ctx: &Ctx<'js>, url: &Url) -> rquickjs::Result<Object<'js>> {
    let parts = Object::new(ctx.clone())?;
    parts.set("href", url.as_str())?;
    parts.set("protocol", format!("{}:", url.scheme()))?;
    parts.set("username", url.username())?;
    parts.set("password", url.password().unwrap_or(""))?;
    parts.set("hostname", url.host_str().unwrap_or(""))?;
    parts.set(
        "port",
        url.port().map(|p| p.to_string()).unwrap_or_default(),
    )?;
    parts.set(
        "host",
        match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            _ => String::new(),
        },
    )?;
    parts.set("pathname", url.path())?;
    parts.set(
        "search",
        url.query().map(|q| format!("?{}", q)).unwrap_or_default(),
    )?;
    parts.set(
        "hash",
        url.fragment().map(|f| format!("#{}", f)).unwrap_or_default(),
    )?;
    parts.set("origin", url.origin().ascii_serialization())?;
    Ok(parts)
}

fn parse_url<'js>(ctx: &Ctx<'js>, input: &str, base: Option<&str>) -> rquickjs::Result<Url> {
    let parsed = match base {
        Some(base) => {
            let base = Url::parse(base)
                .map_err(|e| throw_code(ctx, "ERR_INVALID_URL", &format!("'{}': {}", base, e)))?;
            base.join(input)
        }
        None => Url::parse(input),
    };
    parsed.map_err(|e| throw_code(ctx, "ERR_INVALID_URL", &format!("'{}': {}", input, e)))
}

/// Emulated `url` module.
pub struct UrlModule;

impl GuestModule for UrlModule {
    fn name(&self) -> &'static str {
        "url"
    }

    fn ops<'js>(&self, ctx: &Ctx<'js>, _state: &GuestCell) -> rquickjs::Result<Object<'js>> {
        let ops = Object::new(ctx.clone())?;

        ops.set(
            "parse",
            Func::from(
                |ctx: Ctx<'js>, input: String, base: Opt<String>| -> rquickjs::Result<Object<'js>> {
                    let url = parse_url(&ctx, &input, base.0.as_deref())?;
                    parts_object(&ctx, &url)
                },
            ),
        )?;

        ops.set(
            "canParse",
            Func::from(|input: String, base: Opt<String>| -> bool {
                match base.0 {
                    Some(base) => Url::parse(&base)
                        .ok()
                        .and_then(|b| b.join(&input).ok())
                        .is_some(),
                    None => Url::parse(&input).is_ok(),
                }
            }),
        )?;

        ops.set(
            "setComponent",
            Func::from(
                |ctx: Ctx<'js>,
                 href: String,
                 component: String,
                 value: String|
                 -> rquickjs::Result<Object<'js>> {
                    let mut url = parse_url(&ctx, &href, None)?;
                    let invalid =
                        |ctx: &Ctx<'js>| throw_code(ctx, "ERR_INVALID_URL", "invalid component value");
                    match component.as_str() {
                        "protocol" => {
                            let scheme = value.trim_end_matches(':');
                            url.set_scheme(scheme).map_err(|_| invalid(&ctx))?;
                        }
                        "hostname" | "host" => {
                            let (host, port) = match value.rsplit_once(':') {
                                Some((h, p)) if component == "host" && p.parse::<u16>().is_ok() => {
                                    (h.to_string(), p.parse::<u16>().ok())
                                }
                                _ => (value.clone(), None),
                            };
                            url.set_host(Some(&host)).map_err(|_| invalid(&ctx))?;
                            if let Some(port) = port {
                                url.set_port(Some(port)).map_err(|_| invalid(&ctx))?;
                            }
                        }
                        "port" => {
                            let port = if value.is_empty() {
                                None
                            } else {
                                Some(value.parse::<u16>().map_err(|_| invalid(&ctx))?)
                            };
                            url.set_port(port).map_err(|_| invalid(&ctx))?;
                        }
                        "pathname" => url.set_path(&value),
                        "search" => {
                            let trimmed = value.trim_start_matches('?');
                            url.set_query((!trimmed.is_empty()).then_some(trimmed));
                        }
                        "hash" => {
                            let trimmed = value.trim_start_matches('#');
                            url.set_fragment((!trimmed.is_empty()).then_some(trimmed));
                        }
                        "username" => {
                            url.set_username(&value).map_err(|_| invalid(&ctx))?;
                        }
                        "password" => {
                            url.set_password((!value.is_empty()).then_some(value.as_str()))
                                .map_err(|_| invalid(&ctx))?;
                        }
                        _ => return Err(invalid(&ctx)),
                    }
                    parts_object(&ctx, &url)
                },
            ),
        )?;

        ops.set(
            "resolve",
            Func::from(|ctx: Ctx<'js>, base: String, target: String| -> rquickjs::Result<String> {
                let url = parse_url(&ctx, &target, Some(&base))?;
                Ok(url.into())
            }),
        )?;

        ops.set(
            "encodeComponent",
            Func::from(|s: String| -> String { urlencoding::encode(&s).into_owned() }),
        )?;
        ops.set(
            "decodeComponent",
            Func::from(|ctx: Ctx<'js>, s: String| -> rquickjs::Result<String> {
                urlencoding::decode(&s)
                    .map(|c| c.into_owned())
                    .map_err(|e| throw_code(&ctx, "URIError", &e.to_string()))
            }),
        )?;

        Ok(ops)
    }
}
