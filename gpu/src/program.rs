//! Compiled compute programs.

use crate::driver::ProgramHandle;

/// A program compiled or loaded by the native driver.
///
/// Programs are plain handles: they can be copied and shared between threads,
/// and equality is handle equality. There is no destroy operation; the native
/// driver owns the program until the facade is disposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Program {
    handle: ProgramHandle,
}

impl Program {
    pub(crate) fn new(handle: ProgramHandle) -> Self {
        Program { handle }
    }

    pub fn handle(&self) -> ProgramHandle {
        self.handle
    }
}
