//! Register context layout of a suspended thread.
//!
//! A suspended thread is described entirely by its saved stack pointer. The
//! words directly above it hold the software-saved frame, followed by the
//! frame that exception entry pushes in hardware. Bootstrapping a new thread
//! is therefore nothing more than writing a synthetic pair of frames at the
//! top of its stack, which this module does as plain data construction.

use core::mem::size_of;

/// Thumb bit of xPSR; must be set in every frame the core returns into.
pub const XPSR_THUMB: u32 = 1 << 24;

/// EXC_RETURN value for "thread mode, process stack, basic frame".
pub const EXC_RETURN_THREAD_PSP: u32 = 0xFFFF_FFFD;

/// Bit of EXC_RETURN that is clear when the extended (FP) frame was stacked.
pub const EXC_RETURN_BASIC_FRAME: u32 = 1 << 4;

/// Stack alignment required at exception entry/return.
pub const STACK_ALIGN: usize = 8;

/// Unused words kept above the hardware frame of a fresh thread.
pub const TOP_PADDING: usize = 8;

/// Frame stacked by the core on exception entry.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HardwareFrame {
    pub r0: u32,
    pub r1: u32,
    pub r2: u32,
    pub r3: u32,
    pub r12: u32,
    pub lr: u32,
    pub pc: u32,
    pub xpsr: u32,
}

/// Callee-saved registers pushed by the switch routine, lowest address first.
///
/// Mirrors `stmdb r0!, {r4-r11, lr}`; `exc_return` is the handler's LR and
/// selects the stack and frame type used when the thread is resumed.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SoftwareFrame {
    pub r4: u32,
    pub r5: u32,
    pub r6: u32,
    pub r7: u32,
    pub r8: u32,
    pub r9: u32,
    pub r10: u32,
    pub r11: u32,
    pub exc_return: u32,
}

/// High floating point registers, saved below the software frame only when
/// the thread was using the FPU at the time it was switched out.
#[cfg(feature = "full-fpu")]
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FpFrame {
    pub s: [u32; 16],
}

/// Complete context a thread is first resumed from.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitialFrame {
    pub software: SoftwareFrame,
    pub hardware: HardwareFrame,
}

impl InitialFrame {
    pub const WORDS: usize = size_of::<InitialFrame>() / 4;

    /// Frame that starts executing `entry(arg)` and returns into `exit`.
    ///
    /// The stacked PC must have bit 0 clear; the Thumb bit lives in xPSR.
    /// LR keeps it so that the entry function's `bx lr` stays in Thumb state.
    pub fn new(entry: usize, arg: usize, exit: usize) -> Self {
        InitialFrame {
            software: SoftwareFrame {
                exc_return: EXC_RETURN_THREAD_PSP,
                ..SoftwareFrame::default()
            },
            hardware: HardwareFrame {
                r0: arg as u32,
                lr: exit as u32,
                pc: entry as u32 & !1,
                xpsr: XPSR_THUMB,
                ..HardwareFrame::default()
            },
        }
    }

    pub fn to_words(&self) -> [u32; Self::WORDS] {
        let s = &self.software;
        let h = &self.hardware;
        [
            s.r4, s.r5, s.r6, s.r7, s.r8, s.r9, s.r10, s.r11, s.exc_return, h.r0, h.r1, h.r2,
            h.r3, h.r12, h.lr, h.pc, h.xpsr,
        ]
    }

    pub fn from_words(w: &[u32; Self::WORDS]) -> Self {
        InitialFrame {
            software: SoftwareFrame {
                r4: w[0],
                r5: w[1],
                r6: w[2],
                r7: w[3],
                r8: w[4],
                r9: w[5],
                r10: w[6],
                r11: w[7],
                exc_return: w[8],
            },
            hardware: HardwareFrame {
                r0: w[9],
                r1: w[10],
                r2: w[11],
                r3: w[12],
                r12: w[13],
                lr: w[14],
                pc: w[15],
                xpsr: w[16],
            },
        }
    }
}

/// Smallest stack able to hold an initial frame plus `margin` bytes of
/// headroom, before alignment slack.
pub const fn min_stack_size(margin: usize) -> usize {
    size_of::<InitialFrame>() + TOP_PADDING + margin + STACK_ALIGN
}

/// Writes `frame` at the aligned top of `stack` and returns the stack
/// pointer the thread must be resumed with, or `None` if the frame would
/// leave less than `margin` bytes below it.
pub fn write_initial_frame(stack: &mut [u8], frame: &InitialFrame, margin: usize) -> Option<usize> {
    let base = stack.as_ptr() as usize;
    let top = (base + stack.len()) & !(STACK_ALIGN - 1);
    let frame_bytes = size_of::<InitialFrame>();
    let sp = top.checked_sub(TOP_PADDING + frame_bytes)?;
    if sp < base || sp - base < margin {
        return None;
    }

    let offset = sp - base;
    let words = frame.to_words();
    let dst = &mut stack[offset..offset + frame_bytes];
    for (chunk, word) in dst.chunks_exact_mut(4).zip(words.iter()) {
        chunk.copy_from_slice(&word.to_ne_bytes());
    }
    Some(sp)
}

/// Decodes the frame stored at `sp` inside `stack`.
pub fn read_initial_frame(stack: &[u8], sp: usize) -> Option<InitialFrame> {
    let base = stack.as_ptr() as usize;
    let offset = sp.checked_sub(base)?;
    let bytes = stack.get(offset..offset + size_of::<InitialFrame>())?;
    let mut words = [0u32; InitialFrame::WORDS];
    for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
        *word = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    Some(InitialFrame::from_words(&words))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn entry(_arg: usize) {}
    fn exit() {}

    #[test]
    fn test_frame_layout() {
        assert_eq!(size_of::<HardwareFrame>(), 32);
        assert_eq!(size_of::<SoftwareFrame>(), 36);
        assert_eq!(InitialFrame::WORDS, 17);
    }

    #[test]
    fn test_initial_frame_contents() {
        let frame = InitialFrame::new(entry as usize, 42, exit as usize);
        assert_eq!(frame.hardware.r0, 42);
        assert_eq!(frame.hardware.pc, entry as usize as u32 & !1);
        assert_eq!(frame.hardware.lr, exit as usize as u32);
        assert_eq!(frame.hardware.xpsr, XPSR_THUMB);
        assert_eq!(frame.software.exc_return, EXC_RETURN_THREAD_PSP);
        // Fresh threads never start with a stacked FP context.
        assert_ne!(frame.software.exc_return & EXC_RETURN_BASIC_FRAME, 0);
        assert_eq!(InitialFrame::from_words(&frame.to_words()), frame);
    }

    #[test]
    fn test_write_places_frame_below_top() {
        let mut stack = vec![0u8; 256];
        let frame = InitialFrame::new(entry as usize, 7, exit as usize);
        let sp = write_initial_frame(&mut stack, &frame, 8).unwrap();

        let base = stack.as_ptr() as usize;
        let top = base + stack.len();
        assert!(sp > base && sp < top);
        // Hardware frame must sit on an 8-byte boundary for exception return.
        assert_eq!((sp + size_of::<SoftwareFrame>()) % STACK_ALIGN, 0);
        assert_eq!(read_initial_frame(&stack, sp), Some(frame));
    }

    #[test]
    fn test_write_rejects_tiny_stack() {
        let mut stack = vec![0u8; 48];
        let frame = InitialFrame::new(entry as usize, 0, exit as usize);
        assert_eq!(write_initial_frame(&mut stack, &frame, 8), None);
    }
}
