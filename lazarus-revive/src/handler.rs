//! The `SIGSEGV`/`SIGBUS` handler of a revived process.
//!
//! The handler only reads the published context, touches atomics and the
//! worker's pipes, and writes fixed diagnostics before aborting.

use crate::arch::CapturedContext;
use crate::context::{FaultAction, RevivalContext};
use crate::error::{Result, RevivalError};
use crate::worker::{spawn_worker, SubmitError};
use std::cell::Cell;
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

static ACTIVE: AtomicPtr<RevivalContext> = AtomicPtr::new(ptr::null_mut());

thread_local! {
    /// Fault address this thread last returned to without moving the pc, or 0.
    static RETURNED_FROM: Cell<usize> = const { Cell::new(0) };
}

const FAULT_SIGNALS: [libc::c_int; 2] = [libc::SIGSEGV, libc::SIGBUS];

/// Publishes `ctx`, starts its worker and takes over `SIGSEGV` and `SIGBUS`.
///
/// A process gets one context; a second call fails.
pub fn install(ctx: &'static RevivalContext) -> Result<()> {
    let published = ctx as *const RevivalContext as *mut RevivalContext;
    if ACTIVE
        .compare_exchange(ptr::null_mut(), published, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return Err(RevivalError::AlreadyInstalled);
    }

    if let Err(e) = spawn_worker(ctx) {
        ACTIVE.store(ptr::null_mut(), Ordering::Release);
        return Err(RevivalError::Signal(e));
    }

    for sig in FAULT_SIGNALS {
        let mut act: libc::sigaction = unsafe { std::mem::zeroed() };
        act.sa_sigaction = handle_fault as usize;
        act.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART | libc::SA_ONSTACK;
        unsafe { libc::sigemptyset(&mut act.sa_mask) };

        if unsafe { libc::sigaction(sig, &act, ptr::null_mut()) } < 0 {
            return Err(RevivalError::Signal(io::Error::last_os_error()));
        }
    }
    log::info!(
        "Fault handler installed with {} trampolines",
        ctx.trampolines().len()
    );
    Ok(())
}

extern "C" fn handle_fault(
    sig: libc::c_int,
    info: *mut libc::siginfo_t,
    ucontext: *mut libc::c_void,
) {
    let ctx = ACTIVE.load(Ordering::Acquire);
    if ctx.is_null() || info.is_null() || ucontext.is_null() {
        die(b"fault before a revival context was installed", 0);
    }
    let ctx = unsafe { &*ctx };
    let uc = unsafe { &mut *(ucontext as *mut libc::ucontext_t) };
    let addr = unsafe { (*info).si_addr() } as usize;

    let returned_from = Some(RETURNED_FROM.get()).filter(|&a| a != 0);
    match ctx.classify(uc.pc(), addr, returned_from) {
        FaultAction::Resume(continuation) => {
            RETURNED_FROM.set(0);
            uc.set_pc(continuation);
        }
        FaultAction::Retry => RETURNED_FROM.set(addr),
        FaultAction::Materialize(index) => match ctx.faults().submit(addr, index) {
            Ok(()) => RETURNED_FROM.set(addr),
            Err(SubmitError::FromWorker) => die(b"fault on the materialization thread", addr),
            Err(SubmitError::Rejected) => die(b"segment could not be made writable", addr),
            Err(SubmitError::Pipe(_)) => die(b"lost contact with the materialization thread", addr),
        },
        FaultAction::Failed(_) => die(b"access to a segment that could not be mapped", addr),
        FaultAction::Unexpected if sig == libc::SIGBUS => die(b"unexpected SIGBUS", addr),
        FaultAction::Unexpected => die(b"unexpected SIGSEGV", addr),
    }
}

fn die(reason: &[u8], addr: usize) -> ! {
    let mut hex = [0u8; 18];
    let parts: [&[u8]; 5] = [b"lazarus: ", reason, b" at ", format_hex(addr, &mut hex), b"\n"];
    for part in parts {
        unsafe { libc::write(libc::STDERR_FILENO, part.as_ptr() as *const libc::c_void, part.len()) };
    }
    unsafe { libc::abort() }
}

/// `0x`-prefixed lowercase hex without allocating.
fn format_hex(mut value: usize, buf: &mut [u8; 18]) -> &[u8] {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut at = buf.len();
    loop {
        at -= 1;
        buf[at] = DIGITS[value & 0xf];
        value >>= 4;
        if value == 0 {
            break;
        }
    }
    at -= 2;
    buf[at..at + 2].copy_from_slice(b"0x");
    &buf[at..]
}
