//! Access to the interrupted program counter in a signal's saved context.

#[cfg(target_arch = "x86_64")]
mod x86_64;

#[cfg(target_arch = "aarch64")]
mod aarch64;

/// Register state the kernel saved when a signal interrupted a thread.
pub trait CapturedContext {
    fn pc(&self) -> usize;

    /// Execution continues at `pc` once the handler returns.
    fn set_pc(&mut self, pc: usize);
}
