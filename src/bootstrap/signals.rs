//! Process signal dispositions, applied once at startup.

use anyhow::Result;
use nix::libc;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};

/// What the process does when a signal arrives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Print `Error: signal N` to stderr and exit with status 1
    AbortWithDiagnostic,
    /// Exit with status 0
    Terminate,
    Ignore,
}

/// Outcome of applying one table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Installed,
    /// The OS never delivers this signal to a handler
    Uncatchable,
}

/// The kernel's signal table
pub fn disposition_table() -> Vec<(Signal, Disposition)> {
    vec![
        (Signal::SIGSEGV, Disposition::AbortWithDiagnostic),
        (Signal::SIGKILL, Disposition::Terminate),
        (Signal::SIGINT, Disposition::Terminate),
    ]
}

pub fn register_signal_handlers() -> Result<Vec<(Signal, Applied)>> {
    apply(&disposition_table())
}

pub fn apply(table: &[(Signal, Disposition)]) -> Result<Vec<(Signal, Applied)>> {
    let mut applied = Vec::with_capacity(table.len());
    for &(signal, disposition) in table {
        let outcome = apply_one(signal, disposition)?;
        match outcome {
            Applied::Installed => tracing::debug!(?signal, ?disposition, "registered signal handler"),
            Applied::Uncatchable => tracing::warn!(?signal, "signal cannot be caught, skipping"),
        }
        applied.push((signal, outcome));
    }
    Ok(applied)
}

fn apply_one(signal: Signal, disposition: Disposition) -> Result<Applied> {
    if matches!(signal, Signal::SIGKILL | Signal::SIGSTOP) {
        return Ok(Applied::Uncatchable);
    }

    match disposition {
        Disposition::AbortWithDiagnostic => {
            let action = SigAction::new(
                SigHandler::Handler(abort_with_diagnostic),
                SaFlags::empty(),
                SigSet::empty(),
            );
            unsafe { sigaction(signal, &action) }?;
        }
        Disposition::Terminate => {
            // signal-hook refuses fault signals; those go through sigaction
            if signal_hook::consts::FORBIDDEN.contains(&(signal as libc::c_int)) {
                let action = SigAction::new(
                    SigHandler::Handler(terminate),
                    SaFlags::empty(),
                    SigSet::empty(),
                );
                unsafe { sigaction(signal, &action) }?;
            } else {
                unsafe {
                    signal_hook::low_level::register(signal as libc::c_int, || {
                        signal_hook::low_level::exit(0);
                    })
                }?;
            }
        }
        Disposition::Ignore => {
            let action = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
            unsafe { sigaction(signal, &action) }?;
        }
    }
    Ok(Applied::Installed)
}

/// Format `Error: signal N:\n` into `buf` without allocating
fn format_diagnostic(sig: libc::c_int, buf: &mut [u8; 32]) -> usize {
    const PREFIX: &[u8] = b"Error: signal ";
    buf[..PREFIX.len()].copy_from_slice(PREFIX);
    let mut len = PREFIX.len();

    let mut digits = [0u8; 10];
    let mut n = sig.unsigned_abs();
    let mut count = 0;
    loop {
        digits[count] = b'0' + (n % 10) as u8;
        count += 1;
        n /= 10;
        if n == 0 {
            break;
        }
    }
    for digit in digits[..count].iter().rev() {
        buf[len] = *digit;
        len += 1;
    }
    buf[len] = b':';
    buf[len + 1] = b'\n';
    len + 2
}

// Only async-signal-safe calls below
extern "C" fn abort_with_diagnostic(sig: libc::c_int) {
    let mut buf = [0u8; 32];
    let len = format_diagnostic(sig, &mut buf);
    unsafe {
        libc::write(libc::STDERR_FILENO, buf.as_ptr().cast(), len);
        libc::_exit(1);
    }
}

extern "C" fn terminate(_sig: libc::c_int) {
    unsafe { libc::_exit(0) }
}
