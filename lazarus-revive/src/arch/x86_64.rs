use super::CapturedContext;

impl CapturedContext for libc::ucontext_t {
    fn pc(&self) -> usize {
        self.uc_mcontext.gregs[libc::REG_RIP as usize] as usize
    }

    fn set_pc(&mut self, pc: usize) {
        self.uc_mcontext.gregs[libc::REG_RIP as usize] = pc as libc::greg_t;
    }
}
