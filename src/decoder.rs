//! Thin wrapper over `iced-x86` decode, giving the hook installer just
//! enough instruction metadata to size a prologue and classify branches.

use iced_x86::{Decoder, DecoderOptions, FlowControl, Instruction};

use crate::error::{Error, Result};

/// The decoded instructions covering at least `min_length` bytes of a
/// target function's prologue, plus their exact combined length.
pub struct Prologue {
    pub instructions: Vec<Instruction>,
    pub total_length: usize,
}

/// Decode whole instructions starting at `ip` until at least `min_length`
/// bytes have been consumed. Never returns a prologue that cuts an
/// instruction in half.
pub fn decode_prologue(code: &[u8], ip: u64, bitness: u32, min_length: usize) -> Result<Prologue> {
    let mut decoder = Decoder::with_ip(bitness, code, ip, DecoderOptions::NONE);
    let mut instructions = Vec::new();
    let mut total_length = 0usize;

    while total_length < min_length {
        if !decoder.can_decode() {
            return Err(Error::FailedDecodeInstruction);
        }
        let instr = decoder.decode();
        if instr.is_invalid() {
            return Err(Error::FailedDecodeInstruction);
        }
        total_length += instr.len();
        instructions.push(instr);
    }

    Ok(Prologue {
        instructions,
        total_length,
    })
}

/// Whether `instr` addresses memory relative to the instruction pointer
/// (`lea rax, [rip+disp]` and friends) and therefore needs its displacement
/// recomputed when moved to a different address.
pub fn is_ip_relative(instr: &Instruction) -> bool {
    instr.is_ip_rel_memory_operand()
}

/// Whether `instr` is a short (rel8) conditional or unconditional branch,
/// the form that may need widening to rel32 once relocated.
pub fn is_short_branch(instr: &Instruction) -> bool {
    matches!(
        instr.flow_control(),
        FlowControl::ConditionalBranch | FlowControl::UnconditionalBranch
    ) && instr.len() <= 2
}

/// The absolute target of a near branch or call, if `instr` is one.
pub fn near_branch_target(instr: &Instruction) -> Option<u64> {
    match instr.flow_control() {
        FlowControl::ConditionalBranch | FlowControl::UnconditionalBranch | FlowControl::Call => {
            Some(instr.near_branch_target())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_a_simple_prologue() {
        // push rbp; mov rbp, rsp; sub rsp, 0x20
        let bytes = [0x55, 0x48, 0x89, 0xE5, 0x48, 0x83, 0xEC, 0x20];
        let prologue = decode_prologue(&bytes, 0x1000, 64, 5).expect("decode");
        assert!(prologue.total_length >= 5);
        assert_eq!(prologue.instructions.len(), 3);
    }

    #[test]
    fn rejects_truncated_code() {
        let bytes = [0x0f, 0x0b]; // ud2, too short for min_length
        assert!(decode_prologue(&bytes, 0x1000, 64, 5).is_err());
    }

    #[test]
    fn detects_short_jmp() {
        let bytes = [0xEB, 0x10]; // jmp rel8
        let prologue = decode_prologue(&bytes, 0x1000, 64, 2).expect("decode");
        assert!(is_short_branch(&prologue.instructions[0]));
    }
}
