//! Emulated `process` module, host side.
//!
//! Read-only by contract: the guest sees a filtered env snapshot and mocked
//! or host-derived runtime numbers. Every mutating surface throws `EACCES`
//! from the guest-side shim.

use rquickjs::function::Func;
use rquickjs::{Ctx, Object};

use crate::sandbox::state::GuestCell;

use super::GuestModule;

/// Host env vars forwarded into the guest when present.
const ENV_WHITELIST: &[&str] = &["NODE_ENV", "TZ", "LANG"];

/// Node version string the emulation reports.
const EMULATED_NODE_VERSION: &str = "20.11.0";

/// Emulated `process` module.
pub struct ProcessModule;

impl GuestModule for ProcessModule {
    fn name(&self) -> &'static str {
        "process"
    }

    fn ops<'js>(&self, ctx: &Ctx<'js>, state: &GuestCell) -> rquickjs::Result<Object<'js>> {
        let ops = Object::new(ctx.clone())?;

        // Env snapshot: function-scoped vars first, whitelist fills gaps.
        let env = Object::new(ctx.clone())?;
        for (key, value) in &state.borrow().env {
            env.set(key.as_str(), value.as_str())?;
        }
        for key in ENV_WHITELIST {
            if env.get::<_, Option<String>>(*key)?.is_none() {
                if let Ok(value) = std::env::var(key) {
                    env.set(*key, value)?;
                }
            }
        }
        ops.set("env", env)?;

        ops.set("version", format!("v{}", EMULATED_NODE_VERSION))?;
        ops.set("platform", "linux")?;
        ops.set("arch", std::env::consts::ARCH)?;
        ops.set("pid", std::process::id())?;

        let st = state.clone();
        ops.set(
            "uptimeSecs",
            Func::from(move || -> f64 { st.borrow().start.elapsed().as_secs_f64() }),
        )?;

        let st = state.clone();
        ops.set(
            "hrtimeNanos",
            Func::from(move || -> f64 { st.borrow().start.elapsed().as_nanos() as f64 }),
        )?;

        let st = state.clone();
        ops.set(
            "hrtimeNanosStr",
            Func::from(move || -> String { st.borrow().start.elapsed().as_nanos().to_string() }),
        )?;

        ops.set(
            "memoryUsage",
            Func::from(|ctx: Ctx<'js>| -> rquickjs::Result<Object<'js>> {
                // Host-derived where cheap, mocked otherwise; the guest has
                // no real heap introspection across the bridge.
                let usage = Object::new(ctx)?;
                usage.set("rss", 64 * 1024 * 1024)?;
                usage.set("heapTotal", 32 * 1024 * 1024)?;
                usage.set("heapUsed", 16 * 1024 * 1024)?;
                usage.set("external", 0)?;
                usage.set("arrayBuffers", 0)?;
                Ok(usage)
            }),
        )?;

        Ok(ops)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::state::{DeadlineState, GuestState};
    use rquickjs::{Context, Runtime};
    use std::time::{Duration, Instant};

    #[test]
    fn test_env_snapshot_prefers_function_vars() {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();
        let state = GuestState::new(
            "fn-test".into(),
            std::env::temp_dir(),
            vec![("API_URL".into(), "https://internal".into())],
            DeadlineState::new(Instant::now() + Duration::from_secs(30)),
            Duration::from_secs(5),
        );
        context.with(|ctx| {
            let ops = ProcessModule.ops(&ctx, &state).unwrap();
            ctx.globals().set("__process", ops).unwrap();
            let url: String = ctx.eval("__process.env.API_URL").unwrap();
            assert_eq!(url, "https://internal");
            let version: String = ctx.eval("__process.version").unwrap();
            assert!(version.starts_with('v'));
            let uptime: f64 = ctx.eval("__process.uptimeSecs()").unwrap();
            assert!(uptime >= 0.0);
        });
    }
}
