//! Call-frame bookkeeping for the VM's indirection stack.
//!
//! Unlike the teacher crate, which keeps a single stack and reads frame
//! metadata back out of it (see its own `frame.rs`), SPEC_FULL.md §3
//! describes two separate stacks: an operand stack of `ValueRef`s, and a
//! small indirection stack of `(nargs, saved fp, saved pc)` triples. This
//! module is that triple, plus the frame-relative addressing helpers the
//! teacher's `FrameMetadata` offered, adapted to the layout below.
//!
//! ```txt
//! ... <- frame pointer points here
//! ARG1
//! ARG2
//! ...
//! ARGN
//! LOCAL1
//! LOCAL2
//! ...
//! LOCALN
//! ```
//!
//! Arguments sit at negative offsets from `fp` (`-nargs..-1`); locals sit
//! at non-negative offsets (`0..n_locals-1`). The indirection stack itself
//! holds only integers and is not a GC root.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub nargs: i32,
    pub ret_frame_pointer: usize,
    pub ret_pc: usize,
}

impl Frame {
    pub fn new(nargs: i32, ret_frame_pointer: usize, ret_pc: usize) -> Self {
        Frame {
            nargs,
            ret_frame_pointer,
            ret_pc,
        }
    }

    /// Translate a frame-relative local index (as carried by
    /// `GETLOCAL`/`SETLOCAL`, negative for arguments) into an absolute
    /// operand-stack index.
    pub fn absolute_index(frame_pointer: usize, index: i32) -> Option<usize> {
        let abs = frame_pointer as i64 + index as i64;
        if abs < 0 { None } else { Some(abs as usize) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argument_indices_are_negative_offsets() {
        // 3 args, fp = 10 -> args live at 7, 8, 9.
        assert_eq!(Frame::absolute_index(10, -3), Some(7));
        assert_eq!(Frame::absolute_index(10, -1), Some(9));
    }

    #[test]
    fn local_indices_are_non_negative_offsets() {
        assert_eq!(Frame::absolute_index(10, 0), Some(10));
        assert_eq!(Frame::absolute_index(10, 2), Some(12));
    }

    #[test]
    fn underflowing_index_is_rejected() {
        assert_eq!(Frame::absolute_index(1, -5), None);
    }
}
