use crate::{
    config::MIN_STACK_SIZE,
    error::{Error, Result},
    preemption,
};
use core::{mem::MaybeUninit, ptr};
use std::io;

/// An owned stack region for one thread.
pub struct Stack {
    memory: Box<[MaybeUninit<u8>]>,
}

impl Stack {
    pub fn allocate(size: usize) -> Result<Stack> {
        if size < MIN_STACK_SIZE {
            return Err(Error::StackTooSmall {
                size,
                min: MIN_STACK_SIZE,
            });
        }

        let mut memory = Vec::new();
        memory
            .try_reserve_exact(size)
            .map_err(|_| Error::StackAlloc { size })?;
        // SAFETY: The capacity was reserved above and `MaybeUninit` needs no
        // initialization.
        unsafe { memory.set_len(size) };

        Ok(Stack {
            memory: memory.into_boxed_slice(),
        })
    }

    pub fn base(&mut self) -> *mut u8 {
        self.memory.as_mut_ptr().cast()
    }

    pub fn len(&self) -> usize {
        self.memory.len()
    }
}

/// Saved machine state of a suspended thread.
///
/// Boxed so that the address handed to `swapcontext` stays put while the
/// owning TCB moves around.
pub struct Context {
    registers: Box<libc::ucontext_t>,
}

impl Context {
    /// A context with nothing saved in it yet; only valid as the `from` side of
    /// a switch.
    pub fn empty() -> Context {
        // SAFETY: `ucontext_t` is plain old data.
        Context {
            registers: Box::new(unsafe { MaybeUninit::zeroed().assume_init() }),
        }
    }

    /// Prepares a context that starts executing `entry` on `stack`.
    ///
    /// The new context begins with the preemption tick masked; `entry` is
    /// expected to unmask it once it has set itself up.
    pub fn new(stack: &mut Stack, entry: extern "C" fn()) -> Result<Context> {
        let mut context = Context::empty();
        let registers: *mut libc::ucontext_t = &mut *context.registers;

        // SAFETY: `registers` points to a live, exclusively owned ucontext_t.
        unsafe {
            if libc::getcontext(registers) != 0 {
                return Err(Error::Context(io::Error::last_os_error()));
            }

            (*registers).uc_stack.ss_sp = stack.base().cast();
            (*registers).uc_stack.ss_size = stack.len();
            (*registers).uc_stack.ss_flags = 0;
            (*registers).uc_link = ptr::null_mut();
            libc::sigaddset(&mut (*registers).uc_sigmask, libc::SIGVTALRM);

            libc::makecontext(registers, entry, 0);
        }

        Ok(context)
    }

    /// Saves the current machine state into `from` and resumes `to`.
    ///
    /// # Safety
    /// Both pointers must be valid, and `to` must hold a context that was
    /// either prepared by [`Context::new`] or saved by a previous switch.
    pub unsafe fn switch(from: *mut Context, to: *mut Context) {
        let from: *mut libc::ucontext_t = &mut *(*from).registers;
        let to: *const libc::ucontext_t = &*(*to).registers;

        if libc::swapcontext(from, to) != 0 {
            panic!("swapcontext failed: {}", io::Error::last_os_error());
        }
    }
}

/// Performs a context switch between two threads.
///
/// # Safety
/// This function should only be called by the scheduler, with preemption
/// disabled and the running-thread slot already pointing at `to`'s owner.
pub unsafe fn switch_threads(from: *mut Context, to: *mut Context) {
    Context::switch(from, to);

    // We are back on `from`'s stack. The mask in force is the one saved when
    // this thread switched away, which always has the tick blocked.
    preemption::enable();
}
