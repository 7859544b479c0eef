//! Delivery of process signals to the runtime.
//!
//! The handler forwards each signal into a channel feeding the runtime's
//! select loop: the first signal asks for a graceful shutdown, a second
//! one cancels in-flight work.

use std::fmt;
use std::io;
use std::sync::Mutex;

use crossbeam_channel as chan;

/// A signal the runtime reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// `SIGINT`, usually an operator's ctrl-c.
    Interrupt,
    /// `SIGTERM`, usually a service manager.
    Terminate,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Interrupt => f.write_str("SIGINT"),
            Signal::Terminate => f.write_str("SIGTERM"),
        }
    }
}

/// Forwarded signals are sent via this channel.
static CHANNEL: Mutex<Option<chan::Sender<Signal>>> = Mutex::new(None);

/// Install the process-wide handler for [`Signal::Terminate`] and
/// [`Signal::Interrupt`], forwarding them into the given channel. May be
/// installed once per process.
pub fn install(sender: chan::Sender<Signal>) -> io::Result<()> {
    let mut channel = match CHANNEL.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    if channel.is_some() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "signal handler is already installed",
        ));
    }
    *channel = Some(sender);

    for signal in [libc::SIGTERM, libc::SIGINT] {
        // SAFETY: `forward` has the signature `signal` expects and is
        // async-signal-safe: it only tries a lock and a non-blocking send.
        if unsafe { libc::signal(signal, forward as libc::sighandler_t) } == libc::SIG_ERR {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Called by the OS when a handled signal is received.
extern "C" fn forward(signal: libc::c_int) {
    let signal = match signal {
        libc::SIGINT => Signal::Interrupt,
        libc::SIGTERM => Signal::Terminate,
        _ => return,
    };
    // Never block in a signal handler; if the runtime holds the lock or
    // the channel is full, the signal is dropped.
    if let Ok(guard) = CHANNEL.try_lock() {
        if let Some(sender) = &*guard {
            sender.try_send(signal).ok();
        }
    }
}
