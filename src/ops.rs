//! Ops backing the JS shims in `bootstrap.js`, and the extension that
//! registers them.

use deno_core::{op2, OpState};

use crate::fetch::op_prerender_fetch;

/// Severity of a captured console message, as sent by `bootstrap.js`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl ConsoleLevel {
    fn from_code(code: u32) -> Self {
        match code {
            0 => Self::Debug,
            2 => Self::Warn,
            3 => Self::Error,
            _ => Self::Info,
        }
    }
}

/// Console output captured from render code since the last drain, in the
/// order it was written.
#[derive(Debug, Default, Clone)]
pub struct ConsoleOutput {
    pub entries: Vec<(ConsoleLevel, String)>,
}

impl ConsoleOutput {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn push(&mut self, level: ConsoleLevel, msg: impl Into<String>) {
        self.entries.push((level, msg.into()));
    }

    /// Forward captured messages to `tracing` under the `sandbox` target.
    pub fn emit(&self, route: &str) {
        for (level, msg) in &self.entries {
            match level {
                ConsoleLevel::Debug => tracing::debug!(target: "sandbox", route, "{msg}"),
                ConsoleLevel::Info => tracing::info!(target: "sandbox", route, "{msg}"),
                ConsoleLevel::Warn => tracing::warn!(target: "sandbox", route, "{msg}"),
                ConsoleLevel::Error => tracing::error!(target: "sandbox", route, "{msg}"),
            }
        }
    }
}

#[op2(fast)]
pub fn op_prerender_console(state: &mut OpState, level: u32, #[string] msg: &str) {
    if let Some(output) = state.try_borrow_mut::<ConsoleOutput>() {
        output.push(ConsoleLevel::from_code(level), msg);
    }
}

deno_core::extension!(
    prerender_runtime,
    ops = [op_prerender_console, op_prerender_fetch],
    esm_entry_point = "ext:prerender_runtime/bootstrap.js",
    esm = ["ext:prerender_runtime/bootstrap.js" = "src/bootstrap.js"],
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_console_keeps_write_order() {
        let mut output = ConsoleOutput::default();
        assert!(output.is_empty());
        output.push(ConsoleLevel::from_code(2), "careful");
        output.push(ConsoleLevel::from_code(1), "rendering /");
        output.push(ConsoleLevel::from_code(9), "unknown level");
        assert_eq!(
            output.entries,
            vec![
                (ConsoleLevel::Warn, "careful".to_string()),
                (ConsoleLevel::Info, "rendering /".to_string()),
                (ConsoleLevel::Info, "unknown level".to_string()),
            ]
        );
    }
}
