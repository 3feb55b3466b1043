use super::CapturedContext;

impl CapturedContext for libc::ucontext_t {
    fn pc(&self) -> usize {
        self.uc_mcontext.pc as usize
    }

    fn set_pc(&mut self, pc: usize) {
        self.uc_mcontext.pc = pc as _;
    }
}
