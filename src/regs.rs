use anyhow::{anyhow, Error, Result};

use std::str::FromStr;

/// The tracee's general-purpose register file, as read at one stop.
///
/// Only the sixteen addressable GPRs plus `RIP` are tracked; segment and
/// vector state is invisible to this tool.
#[derive(Clone, Copy, Debug, Default)]
pub struct RegisterFile {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
}

impl From<libc::user_regs_struct> for RegisterFile {
    fn from(user_regs: libc::user_regs_struct) -> Self {
        Self {
            rax: user_regs.rax,
            rbx: user_regs.rbx,
            rcx: user_regs.rcx,
            rdx: user_regs.rdx,
            rsi: user_regs.rsi,
            rdi: user_regs.rdi,
            rbp: user_regs.rbp,
            rsp: user_regs.rsp,
            r8: user_regs.r8,
            r9: user_regs.r9,
            r10: user_regs.r10,
            r11: user_regs.r11,
            r12: user_regs.r12,
            r13: user_regs.r13,
            r14: user_regs.r14,
            r15: user_regs.r15,
            rip: user_regs.rip,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Gpr {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    Rbp,
    Rsp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

/// How much of the underlying 64-bit register a spelling names.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Width {
    Qword,
    Dword,
    Word,
    LowByte,
    /// Bits [15:8]; only `ah`/`bh`/`ch`/`dh` exist.
    HighByte,
}

/// A recognized x86-64 register spelling, decomposed into the GPR it lives
/// in and the sub-width it names.
///
/// The recognized set is closed: the canonical 64/32/16/8-bit spellings of
/// the sixteen GPRs, plus the four legacy high-byte forms. Anything else is
/// an input error at parse time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Reg {
    gpr: Gpr,
    width: Width,
}

impl Reg {
    /// Concretize this spelling against a register file, zero-extending
    /// sub-widths into the returned `u64`.
    pub fn value(&self, regs: &RegisterFile) -> u64 {
        let full = match self.gpr {
            Gpr::Rax => regs.rax,
            Gpr::Rbx => regs.rbx,
            Gpr::Rcx => regs.rcx,
            Gpr::Rdx => regs.rdx,
            Gpr::Rsi => regs.rsi,
            Gpr::Rdi => regs.rdi,
            Gpr::Rbp => regs.rbp,
            Gpr::Rsp => regs.rsp,
            Gpr::R8 => regs.r8,
            Gpr::R9 => regs.r9,
            Gpr::R10 => regs.r10,
            Gpr::R11 => regs.r11,
            Gpr::R12 => regs.r12,
            Gpr::R13 => regs.r13,
            Gpr::R14 => regs.r14,
            Gpr::R15 => regs.r15,
        };

        match self.width {
            Width::Qword => full,
            Width::Dword => full as u32 as u64,
            Width::Word => full as u16 as u64,
            Width::LowByte => full as u8 as u64,
            Width::HighByte => (full >> 8) as u8 as u64,
        }
    }
}

impl FromStr for Reg {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self> {
        use Gpr::*;
        use Width::*;

        let (gpr, width) = match name {
            // 64 bit regs.
            "rax" => (Rax, Qword),
            "rbx" => (Rbx, Qword),
            "rcx" => (Rcx, Qword),
            "rdx" => (Rdx, Qword),
            "rsi" => (Rsi, Qword),
            "rdi" => (Rdi, Qword),
            "rbp" => (Rbp, Qword),
            "rsp" => (Rsp, Qword),
            "r8" => (R8, Qword),
            "r9" => (R9, Qword),
            "r10" => (R10, Qword),
            "r11" => (R11, Qword),
            "r12" => (R12, Qword),
            "r13" => (R13, Qword),
            "r14" => (R14, Qword),
            "r15" => (R15, Qword),

            // 32 bit regs.
            "eax" => (Rax, Dword),
            "ebx" => (Rbx, Dword),
            "ecx" => (Rcx, Dword),
            "edx" => (Rdx, Dword),
            "esi" => (Rsi, Dword),
            "edi" => (Rdi, Dword),
            "ebp" => (Rbp, Dword),
            "esp" => (Rsp, Dword),
            "r8d" => (R8, Dword),
            "r9d" => (R9, Dword),
            "r10d" => (R10, Dword),
            "r11d" => (R11, Dword),
            "r12d" => (R12, Dword),
            "r13d" => (R13, Dword),
            "r14d" => (R14, Dword),
            "r15d" => (R15, Dword),

            // 16 bit regs.
            "ax" => (Rax, Word),
            "bx" => (Rbx, Word),
            "cx" => (Rcx, Word),
            "dx" => (Rdx, Word),
            "si" => (Rsi, Word),
            "di" => (Rdi, Word),
            "bp" => (Rbp, Word),
            "sp" => (Rsp, Word),
            "r8w" => (R8, Word),
            "r9w" => (R9, Word),
            "r10w" => (R10, Word),
            "r11w" => (R11, Word),
            "r12w" => (R12, Word),
            "r13w" => (R13, Word),
            "r14w" => (R14, Word),
            "r15w" => (R15, Word),

            // 8 bit regs.
            "al" => (Rax, LowByte),
            "bl" => (Rbx, LowByte),
            "cl" => (Rcx, LowByte),
            "dl" => (Rdx, LowByte),
            "sil" => (Rsi, LowByte),
            "dil" => (Rdi, LowByte),
            "bpl" => (Rbp, LowByte),
            "spl" => (Rsp, LowByte),
            "r8b" => (R8, LowByte),
            "r9b" => (R9, LowByte),
            "r10b" => (R10, LowByte),
            "r11b" => (R11, LowByte),
            "r12b" => (R12, LowByte),
            "r13b" => (R13, LowByte),
            "r14b" => (R14, LowByte),
            "r15b" => (R15, LowByte),

            // 8 bit high regs. `sih` and friends are not Intel registers.
            "ah" => (Rax, HighByte),
            "bh" => (Rbx, HighByte),
            "ch" => (Rcx, HighByte),
            "dh" => (Rdx, HighByte),

            _ => return Err(anyhow!("unrecognized register name: {}", name)),
        };

        Ok(Reg { gpr, width })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_regs() -> RegisterFile {
        RegisterFile {
            rax: 0x9900aabbccddeeff,
            rsi: 0x00000000feedface,
            r8: 0x0123456789abcdef,
            ..Default::default()
        }
    }

    fn value_of(name: &str, regs: &RegisterFile) -> u64 {
        name.parse::<Reg>().unwrap().value(regs)
    }

    #[test]
    fn test_subwidth_narrowing() {
        let regs = dummy_regs();

        assert_eq!(value_of("rax", &regs), 0x9900aabbccddeeff);
        assert_eq!(value_of("eax", &regs), 0xccddeeff);
        assert_eq!(value_of("ax", &regs), 0xeeff);
        assert_eq!(value_of("al", &regs), 0xff);
        assert_eq!(value_of("ah", &regs), 0xee);
    }

    #[test]
    fn test_rsi_family_narrowing() {
        let regs = dummy_regs();

        assert_eq!(value_of("rsi", &regs), 0xfeedface);
        assert_eq!(value_of("esi", &regs), 0xfeedface);
        assert_eq!(value_of("si", &regs), 0xface);
        assert_eq!(value_of("sil", &regs), 0xce);
    }

    #[test]
    fn test_extended_registers() {
        let regs = dummy_regs();

        assert_eq!(value_of("r8", &regs), 0x0123456789abcdef);
        assert_eq!(value_of("r8d", &regs), 0x89abcdef);
        assert_eq!(value_of("r8w", &regs), 0xcdef);
        assert_eq!(value_of("r8b", &regs), 0xef);
    }

    #[test]
    fn test_zeroed_registers_decode_to_zero() {
        let regs = RegisterFile::default();

        for name in &["rbx", "ecx", "dx", "bl", "dh", "r15", "r12w"] {
            assert_eq!(value_of(name, &regs), 0);
        }
    }

    #[test]
    fn test_unrecognized_names() {
        assert!("rzx".parse::<Reg>().is_err());
        assert!("sih".parse::<Reg>().is_err());
        assert!("r8h".parse::<Reg>().is_err());
        assert!("rip".parse::<Reg>().is_err());
        assert!("RAX".parse::<Reg>().is_err());
        assert!("".parse::<Reg>().is_err());
    }
}
