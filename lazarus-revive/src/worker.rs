//! Hands write faults from signal handlers to one thread that is free to
//! allocate, lock and do file I/O.
//!
//! A faulting thread claims a slot, records the fault in it, writes the slot
//! index to the request pipe and blocks on the slot's ack pipe. Everything it
//! touches is allocated before the handler is installed.

use crate::context::RevivalContext;
use crate::error::Result;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

/// Threads that can wait on the worker at once; further ones spin for a slot.
pub const SLOTS: usize = 16;

const ACK_OK: u8 = 0;
const ACK_FAILED: u8 = 1;

/// Why a fault could not be handed over; the handler aborts on any of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    /// The worker itself faulted and would wait on itself.
    FromWorker,
    /// The worker could not make the segment writable.
    Rejected,
    /// A pipe read or write failed with this errno, or hit end of file.
    Pipe(i32),
}

struct Slot {
    busy: AtomicBool,
    addr: AtomicUsize,
    segment: AtomicUsize,
    tid: AtomicI32,
    ack: [RawFd; 2],
}

/// A fault read off the request pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultRequest {
    pub addr: usize,
    pub segment: usize,
    pub tid: libc::pid_t,
}

pub struct FaultQueue {
    requests: [RawFd; 2],
    slots: Vec<Slot>,
    worker: AtomicI32,
}

fn pipe() -> io::Result<[RawFd; 2]> {
    let mut fds = [-1; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fds)
}

fn errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn current_tid() -> libc::pid_t {
    unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
}

fn write_byte(fd: RawFd, byte: u8) -> std::result::Result<(), i32> {
    loop {
        let ret = unsafe { libc::write(fd, &byte as *const u8 as *const libc::c_void, 1) };
        match ret {
            1 => return Ok(()),
            -1 if errno() == libc::EINTR => continue,
            -1 => return Err(errno()),
            _ => return Err(libc::EIO),
        }
    }
}

/// `None` at end of file.
fn read_byte(fd: RawFd) -> std::result::Result<Option<u8>, i32> {
    let mut byte = 0u8;
    loop {
        let ret = unsafe { libc::read(fd, &mut byte as *mut u8 as *mut libc::c_void, 1) };
        match ret {
            1 => return Ok(Some(byte)),
            0 => return Ok(None),
            -1 if errno() == libc::EINTR => continue,
            _ => return Err(errno()),
        }
    }
}

impl FaultQueue {
    pub fn new() -> io::Result<Self> {
        let requests = pipe()?;
        let slots = (0..SLOTS)
            .map(|_| {
                Ok::<_, io::Error>(Slot {
                    busy: AtomicBool::new(false),
                    addr: AtomicUsize::new(0),
                    segment: AtomicUsize::new(0),
                    tid: AtomicI32::new(0),
                    ack: pipe()?,
                })
            })
            .collect::<io::Result<Vec<_>>>()?;
        Ok(Self {
            requests,
            slots,
            worker: AtomicI32::new(0),
        })
    }

    fn claim(&self) -> usize {
        loop {
            for (index, slot) in self.slots.iter().enumerate() {
                if slot
                    .busy
                    .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return index;
                }
            }
            unsafe { libc::sched_yield() };
        }
    }

    /// Blocks until the worker has made `segment` writable.
    ///
    /// Safe to call from a signal handler.
    pub fn submit(&self, addr: usize, segment: usize) -> std::result::Result<(), SubmitError> {
        let tid = current_tid();
        if tid == self.worker.load(Ordering::Acquire) {
            return Err(SubmitError::FromWorker);
        }

        let index = self.claim();
        let slot = &self.slots[index];
        slot.addr.store(addr, Ordering::Release);
        slot.segment.store(segment, Ordering::Release);
        slot.tid.store(tid, Ordering::Release);

        let reply = write_byte(self.requests[1], index as u8).and_then(|()| read_byte(slot.ack[0]));
        slot.busy.store(false, Ordering::Release);

        match reply {
            Ok(Some(ACK_OK)) => Ok(()),
            Ok(Some(_)) => Err(SubmitError::Rejected),
            Ok(None) => Err(SubmitError::Pipe(0)),
            Err(errno) => Err(SubmitError::Pipe(errno)),
        }
    }

    /// Answers requests until the request pipe closes.
    pub fn serve<F>(&self, mut handle: F)
    where
        F: FnMut(FaultRequest) -> Result<()>,
    {
        self.worker.store(current_tid(), Ordering::Release);
        loop {
            let index = match read_byte(self.requests[0]) {
                Ok(Some(index)) => index as usize,
                Ok(None) => return,
                Err(errno) => {
                    log::error!("Fault request pipe failed: {}", io::Error::from_raw_os_error(errno));
                    return;
                }
            };
            let Some(slot) = self.slots.get(index) else {
                log::error!("Fault request names slot {index} of {SLOTS}");
                continue;
            };
            let request = FaultRequest {
                addr: slot.addr.load(Ordering::Acquire),
                segment: slot.segment.load(Ordering::Acquire),
                tid: slot.tid.load(Ordering::Acquire),
            };
            log::debug!("Thread {} faulted at {:#x}", request.tid, request.addr);

            let status = match handle(request) {
                Ok(()) => ACK_OK,
                Err(e) => {
                    log::error!("Write fault at {:#x}: {e}", request.addr);
                    ACK_FAILED
                }
            };
            if let Err(errno) = write_byte(slot.ack[1], status) {
                log::error!("Fault ack pipe failed: {}", io::Error::from_raw_os_error(errno));
                return;
            }
        }
    }
}

impl Drop for FaultQueue {
    fn drop(&mut self) {
        let fds = self.requests.iter().chain(self.slots.iter().flat_map(|s| s.ack.iter()));
        for &fd in fds {
            unsafe { libc::close(fd) };
        }
    }
}

/// Starts the thread that materializes copy-on-write segments for `ctx`.
pub fn spawn_worker(ctx: &'static RevivalContext) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("lazarus-faults".to_string())
        .spawn(move || {
            ctx.faults()
                .serve(|request| ctx.materialize(request.segment));
        })
}
