//! The debug-trap hook.
//!
//! The `debug_trap` opcode suspends the interpreter into an externally
//! supplied inspector with a read-only view of the VM state, and resumes
//! when it returns. What the inspector does with the view (REPL, logger,
//! test probe) is outside the core's contract.

/// One frame of the call stack, as shown to an inspector.
#[derive(Debug, Clone)]
pub struct FrameView {
    /// Qualified name of the def or block.
    pub name: String,
    /// Byte offset of the frame's locals region on the operand stack.
    pub frame_base: usize,
    /// Caller offset execution resumes at after this frame returns.
    pub return_ip: usize,
}

/// Read-only snapshot of the VM handed to [`Inspector::trap`].
#[derive(Debug)]
pub struct VmView<'a> {
    /// Offset of the instruction after the trap.
    pub ip: usize,
    /// Name of the def or block the trap executed in.
    pub location: &'a str,
    /// The live operand stack, bottom to top.
    pub stack: &'a [u8],
    /// The frame walk, outermost first.
    pub frames: Vec<FrameView>,
}

/// Externally supplied inspector invoked by `debug_trap`.
pub trait Inspector {
    /// Called with the VM suspended. Execution resumes on return.
    fn trap(&mut self, view: &VmView<'_>);
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        hits: usize,
    }

    impl Inspector for Recorder {
        fn trap(&mut self, view: &VmView<'_>) {
            self.hits += 1;
            assert!(view.stack.len() % 8 == 0);
        }
    }

    #[test]
    fn inspector_is_object_safe() {
        let mut recorder = Recorder { hits: 0 };
        let inspector: &mut dyn Inspector = &mut recorder;
        let view = VmView {
            ip: 4,
            location: "main",
            stack: &[0u8; 16],
            frames: vec![],
        };
        inspector.trap(&view);
        assert_eq!(recorder.hits, 1);
    }
}
