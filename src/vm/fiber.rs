//! Fiber host integration.
//!
//! Fibers are cooperative stacks owned by the host runtime; the
//! interpreter only keeps one operand stack and register set per fiber
//! and delegates CPU context switching through [`FiberHost`]. The three
//! fiber opcodes map onto the trait's methods.
//!
//! Fiber handles are opaque words chosen by the program (typically the
//! address of its Fiber object); the main fiber is handle 0.

use super::stack::OperandStack;
use vesper_core::{VmError, VmResult};

/// Handle of the fiber execution starts on.
pub const MAIN_FIBER: u64 = 0;

/// Host-supplied fiber primitives.
///
/// `spawn` and `swap` are notifications: by the time they are called the
/// interpreter has already parked the outgoing fiber's VM registers and
/// installed the target's. A host with real stacks performs its CPU
/// context switch here; a host without them can simply acknowledge.
pub trait FiberHost {
    /// Handle of the fiber the host considers current at startup.
    fn current(&self) -> u64;

    /// A new fiber was registered, ready to run its entry proc.
    fn spawn(&mut self, fiber: u64) -> VmResult<()>;

    /// Control is moving between two fibers.
    fn swap(&mut self, from: u64, to: u64) -> VmResult<()>;
}

/// Default host: interpreter-level switching only.
///
/// VM registers are still parked and restored per fiber, so purely
/// interpreted fibers cooperate correctly; there is no native CPU context
/// to switch. Blocking `lib_call`s block every fiber, which is the
/// documented behavior of a schedulerless embedding.
#[derive(Debug, Default)]
pub struct InlineFiberHost;

impl FiberHost for InlineFiberHost {
    fn current(&self) -> u64 {
        MAIN_FIBER
    }

    fn spawn(&mut self, _fiber: u64) -> VmResult<()> {
        Ok(())
    }

    fn swap(&mut self, _from: u64, _to: u64) -> VmResult<()> {
        Ok(())
    }
}

/// Host that rejects fiber use outright, for embeddings that must not
/// see concurrency.
#[derive(Debug, Default)]
pub struct NoFiberHost;

impl FiberHost for NoFiberHost {
    fn current(&self) -> u64 {
        MAIN_FIBER
    }

    fn spawn(&mut self, _fiber: u64) -> VmResult<()> {
        Err(VmError::FiberHost("fibers are disabled".into()))
    }

    fn swap(&mut self, _from: u64, _to: u64) -> VmResult<()> {
        Err(VmError::FiberHost("fibers are disabled".into()))
    }
}

/// Parked VM registers of a fiber that is not currently running.
pub(crate) struct FiberState {
    pub stack: OperandStack,
    pub frames: Vec<super::interpreter::Frame>,
    pub ip: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_host_acknowledges() {
        let mut host = InlineFiberHost;
        assert_eq!(host.current(), MAIN_FIBER);
        assert!(host.spawn(0x1000).is_ok());
        assert!(host.swap(MAIN_FIBER, 0x1000).is_ok());
    }

    #[test]
    fn no_fiber_host_rejects() {
        let mut host = NoFiberHost;
        assert!(matches!(host.spawn(1), Err(VmError::FiberHost(_))));
        assert!(matches!(host.swap(0, 1), Err(VmError::FiberHost(_))));
    }
}
