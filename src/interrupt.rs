//! Ctrl-C handling for runs
//!
//! The first SIGINT cancels the run: nothing new is dispatched, in-flight
//! provider calls finish and their results are saved. A second SIGINT
//! kills the process.

use declarative::CancellationToken;
use std::sync::OnceLock;

static TOKEN: OnceLock<CancellationToken> = OnceLock::new();

#[cfg(unix)]
extern "C" fn on_sigint(_signal: libc::c_int) {
    if let Some(token) = TOKEN.get() {
        token.cancel();
    }
    // Restore the default disposition so a second Ctrl-C terminates
    unsafe {
        libc::signal(libc::SIGINT, libc::SIG_DFL);
    }
}

/// Route SIGINT to `token`. Only the first installed token is used.
pub fn install(token: &CancellationToken) {
    if TOKEN.set(token.clone()).is_err() {
        log::debug!("SIGINT handler already installed");
        return;
    }

    #[cfg(unix)]
    unsafe {
        let handler = on_sigint as extern "C" fn(libc::c_int);
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
    }
}
