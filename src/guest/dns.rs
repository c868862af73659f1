//! Emulated `dns` module, host side.
//!
//! Resolution goes through the host's resolver on the guest's worker thread.
//! The shim layers Node's callback and promise surfaces over these ops.

use std::net::ToSocketAddrs;

use rquickjs::function::Func;
use rquickjs::{Ctx, Object};

use crate::sandbox::bridge::throw_code;
use crate::sandbox::state::GuestCell;

use super::GuestModule;

fn lookup_all(hostname: &str) -> std::io::Result<Vec<std::net::IpAddr>> {
    Ok((hostname, 0)
        .to_socket_addrs()?
        .map(|addr| addr.ip())
        .collect())
}

/// Emulated `dns` module.
pub struct DnsModule;

impl GuestModule for DnsModule {
    fn name(&self) -> &'static str {
        "dns"
    }

    fn ops<'js>(&self, ctx: &Ctx<'js>, _state: &GuestCell) -> rquickjs::Result<Object<'js>> {
        let ops = Object::new(ctx.clone())?;

        ops.set(
            "lookup",
            Func::from(|ctx: Ctx<'js>, hostname: String| -> rquickjs::Result<Object<'js>> {
                let addrs = lookup_all(&hostname)
                    .map_err(|_| throw_code(&ctx, "ENOTFOUND", &format!("getaddrinfo ENOTFOUND {}", hostname)))?;
                let first = addrs.first().ok_or_else(|| {
                    throw_code(&ctx, "ENOTFOUND", &format!("getaddrinfo ENOTFOUND {}", hostname))
                })?;
                let result = Object::new(ctx)?;
                result.set("address", first.to_string())?;
                result.set("family", if first.is_ipv4() { 4 } else { 6 })?;
                Ok(result)
            }),
        )?;

        ops.set(
            "resolve4",
            Func::from(|ctx: Ctx<'js>, hostname: String| -> rquickjs::Result<Vec<String>> {
                let addrs = lookup_all(&hostname)
                    .map_err(|_| throw_code(&ctx, "ENOTFOUND", &format!("queryA ENOTFOUND {}", hostname)))?;
                Ok(addrs
                    .into_iter()
                    .filter(|a| a.is_ipv4())
                    .map(|a| a.to_string())
                    .collect())
            }),
        )?;

        ops.set(
            "resolve6",
            Func::from(|ctx: Ctx<'js>, hostname: String| -> rquickjs::Result<Vec<String>> {
                let addrs = lookup_all(&hostname)
                    .map_err(|_| throw_code(&ctx, "ENOTFOUND", &format!("queryAaaa ENOTFOUND {}", hostname)))?;
                Ok(addrs
                    .into_iter()
                    .filter(|a| a.is_ipv6())
                    .map(|a| a.to_string())
                    .collect())
            }),
        )?;

        Ok(ops)
    }
}
