//! Operator alerting.
//!
//! Every I/O failure is logged with its full cause chain and raises an
//! operator alert before being handed back to the caller.

use std::{
    error::Error,
    io::Write,
    sync::atomic::{AtomicUsize, Ordering},
};

use tracing::error;

pub trait OperatorAlert: Send + Sync {
    fn raise(&self, context: &str);
}

/// Rings the terminal bell on stderr.
#[derive(Debug, Default)]
pub struct TerminalBell;

impl OperatorAlert for TerminalBell {
    fn raise(&self, _context: &str) {
        let mut stderr = std::io::stderr();
        let _ = stderr.write_all(b"\x07");
        let _ = stderr.flush();
    }
}

/// Counts alerts instead of making noise. Used by tests and headless runs.
#[derive(Debug, Default)]
pub struct SilentAlert {
    raised: AtomicUsize,
}

impl SilentAlert {
    pub fn raised(&self) -> usize {
        self.raised.load(Ordering::Relaxed)
    }
}

impl OperatorAlert for SilentAlert {
    fn raise(&self, _context: &str) {
        self.raised.fetch_add(1, Ordering::Relaxed);
    }
}

/// Render an error together with every `source()` below it.
pub fn error_chain(err: &(dyn Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}

/// Log `err` with its cause chain and a captured backtrace, then alert.
pub fn report(alert: &dyn OperatorAlert, context: &str, err: &(dyn Error + 'static)) {
    let backtrace = std::backtrace::Backtrace::capture();
    error!(
        context,
        error = %error_chain(err),
        backtrace = %backtrace,
        "🚨 {}",
        context
    );
    alert.raise(context);
}
