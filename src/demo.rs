//! Built-in demo component.
//!
//! Used by the `taskpool` binary, by its hidden `worker` subcommand (so process pools
//! can run it) and by the tests.

use std::sync::Arc;
use std::time::Duration;

use crate::registry::{Component, ComponentRegistry};

/// Arithmetic component with a few badly behaved methods.
#[derive(Debug, Default)]
pub struct Calc;

impl Calc {
    pub const ID: &'static str = "calc";

    pub fn component() -> Component<Calc> {
        Component::new(Self::ID, Calc::default)
            .method("plus", |_: &Calc, (a, b): (i64, i64)| Ok(a + b))
            .async_method("async_plus", |_: Arc<Calc>, (a, b): (i64, i64)| async move {
                tokio::task::yield_now().await;
                anyhow::Ok(a + b)
            })
            .async_method(
                "slow_plus",
                |_: Arc<Calc>, (a, b, ms): (i64, i64, u64)| async move {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    anyhow::Ok(a + b)
                },
            )
            .method("throw_error", |_: &Calc, ()| -> anyhow::Result<()> {
                anyhow::bail!("test error")
            })
            .method("crash", |_: &Calc, ()| -> anyhow::Result<()> {
                panic!("calc worker crashed on purpose")
            })
            .method("whoami", |_: &Calc, ()| Ok(whoami()))
    }
}

/// Identity of the execution unit running the call: `<pid>/<thread name>`.
fn whoami() -> String {
    let thread = std::thread::current();
    format!(
        "{}/{}",
        std::process::id(),
        thread.name().unwrap_or("unnamed")
    )
}

/// Registry with every demo component.
pub fn registry() -> ComponentRegistry {
    ComponentRegistry::new().with(Calc::component())
}
