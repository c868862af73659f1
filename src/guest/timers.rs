//! Emulated `timers` module, host side.
//!
//! A timer is the host scheduling a saved callback reference back into the
//! guest after the requested delay; the event loop fires whatever is due.
//! `ref`/`unref` are structural no-ops in the guest shim; the invocation
//! deadline supersedes timer liveness.

use std::time::{Duration, Instant};

use rquickjs::function::Func;
use rquickjs::{Ctx, Function, Object, Persistent};

use crate::sandbox::state::GuestCell;

use super::GuestModule;

/// Longest single delay a guest may request; beyond the deadline it will
/// never fire anyway.
const MAX_DELAY_MS: f64 = 2_147_483_647.0;

/// Emulated `timers` module.
pub struct TimersModule;

impl GuestModule for TimersModule {
    fn name(&self) -> &'static str {
        "timers"
    }

    fn ops<'js>(&self, ctx: &Ctx<'js>, state: &GuestCell) -> rquickjs::Result<Object<'js>> {
        let ops = Object::new(ctx.clone())?;

        let st = state.clone();
        ops.set(
            "arm",
            Func::from(
                move |ctx: Ctx<'js>, delay_ms: f64, repeat: bool, callback: Function<'js>| -> f64 {
                    let delay = Duration::from_millis(delay_ms.clamp(0.0, MAX_DELAY_MS) as u64);
                    let saved = Persistent::save(&ctx, callback);
                    let id = st.borrow_mut().timers.arm(
                        Instant::now() + delay,
                        repeat.then_some(delay.max(Duration::from_millis(1))),
                        saved,
                        vec![],
                    );
                    id as f64
                },
            ),
        )?;

        let st = state.clone();
        ops.set(
            "clear",
            Func::from(move |id: f64| {
                st.borrow_mut().timers.clear(id as u64);
            }),
        )?;

        let st = state.clone();
        ops.set(
            "defer",
            Func::from(move |ctx: Ctx<'js>, callback: Function<'js>| {
                let saved = Persistent::save(&ctx, callback);
                st.borrow_mut()
                    .immediates
                    .push_back(crate::sandbox::state::PendingCall {
                        callback: saved,
                        args: vec![],
                    });
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

    #[test]
    fn test_arm_and_clear() {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();
        let state = GuestState::new(
            "fn-test".into(),
            std::env::temp_dir(),
            vec![],
            DeadlineState::new(Instant::now() + Duration::from_secs(30)),
            Duration::from_secs(5),
        );
        context.with(|ctx| {
            let ops = TimersModule.ops(&ctx, &state).unwrap();
            ctx.globals().set("__timers", ops).unwrap();
            let id: f64 = ctx.eval("__timers.arm(50, false, () => {})").unwrap();
            assert_eq!(id, 1.0);
            assert!(!state.borrow().timers.is_empty());

            ctx.eval::<(), _>("__timers.clear(1)").unwrap();
            assert!(state.borrow().timers.is_empty());

            ctx.eval::<(), _>("__timers.defer(() => {})").unwrap();
            assert_eq!(state.borrow().immediates.len(), 1);
        });
    }
}
