use crate::tracer::parser::Instruction;
use strum::{Display, EnumString};

/// Decides which traced instructions transfer control into or out of a
/// function. Picked once per run.
pub trait BranchPolicy {
    fn is_call(&self, insn: &Instruction) -> bool;
    fn is_return(&self, insn: &Instruction) -> bool;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumString, Display)]
#[strum(ascii_case_insensitive)]
pub enum Arch {
    #[strum(to_string = "x86_64", serialize = "amd64", serialize = "x64", serialize = "x86")]
    X86_64,
    #[strum(to_string = "arm", serialize = "armv7", serialize = "thumb")]
    Arm,
    #[strum(to_string = "aarch64", serialize = "arm64")]
    Aarch64,
    #[strum(to_string = "riscv", serialize = "riscv64", serialize = "riscv32", serialize = "rv64")]
    RiscV,
}

#[derive(thiserror::Error, Debug)]
#[error("unsupported architecture {0:?}")]
pub struct UnsupportedArch(pub object::Architecture);

impl Arch {
    pub fn from_object(arch: object::Architecture) -> Result<Self, UnsupportedArch> {
        use object::Architecture as A;

        match arch {
            A::X86_64 | A::X86_64_X32 | A::I386 => Ok(Arch::X86_64),
            A::Arm => Ok(Arch::Arm),
            A::Aarch64 | A::Aarch64_Ilp32 => Ok(Arch::Aarch64),
            A::Riscv32 | A::Riscv64 => Ok(Arch::RiscV),
            other => Err(UnsupportedArch(other)),
        }
    }

    /// Thumb functions have the low bit of their symbol value set.
    pub fn code_address(&self, symbol_value: u64) -> u64 {
        match self {
            Arch::Arm => symbol_value & !1,
            _ => symbol_value,
        }
    }

    /// The addr2line binary of the usual cross toolchain
    pub fn addr2line_tool(&self) -> &'static str {
        match self {
            Arch::X86_64 => "addr2line",
            Arch::Arm => "arm-none-eabi-addr2line",
            Arch::Aarch64 => "aarch64-linux-gnu-addr2line",
            Arch::RiscV => "riscv64-unknown-elf-addr2line",
        }
    }
}

/// Skips x86 prefixes so `repz ret` and `bnd call` are seen as `ret` and `call`.
fn x86_opcode(insn: &Instruction) -> (&str, &str) {
    const PREFIXES: [&str; 9] = [
        "rep", "repz", "repe", "repnz", "repne", "bnd", "notrack", "lock", "data16",
    ];

    let mut mnemonic = insn.mnemonic.as_str();
    let mut operands = insn.operands.as_str();

    while PREFIXES.contains(&mnemonic) {
        let mut parts = operands.splitn(2, char::is_whitespace);
        match parts.next() {
            Some(next) if !next.is_empty() => {
                mnemonic = next;
                operands = parts.next().unwrap_or("").trim_start();
            }
            _ => break,
        }
    }

    (mnemonic, operands)
}

/// `.w`/`.n` width qualifiers don't change what a thumb instruction does.
fn arm_mnemonic(insn: &Instruction) -> &str {
    let m = insn.mnemonic.as_str();
    m.strip_suffix(".w")
        .or_else(|| m.strip_suffix(".n"))
        .unwrap_or(m)
}

/// `rd` of a RISC-V jump, `None` for the one-operand pseudo form.
fn riscv_link_register(operands: &str) -> Option<&str> {
    let (first, _) = operands.split_once(',')?;
    Some(first.trim())
}

fn squash(text: &str) -> String {
    text.chars().filter(|c| !c.is_whitespace()).collect()
}

impl BranchPolicy for Arch {
    fn is_call(&self, insn: &Instruction) -> bool {
        match self {
            Arch::X86_64 => {
                let (mnemonic, _) = x86_opcode(insn);
                matches!(mnemonic, "call" | "callq" | "calll" | "callw")
            }
            Arch::Arm => match arm_mnemonic(insn) {
                "bl" => true,
                "blx" => insn.operands.trim() != "lr",
                _ => false,
            },
            Arch::Aarch64 => matches!(insn.mnemonic.as_str(), "bl" | "blr"),
            Arch::RiscV => match insn.mnemonic.as_str() {
                "call" => true,
                "jal" | "jalr" => {
                    matches!(riscv_link_register(&insn.operands), None | Some("ra" | "x1"))
                }
                _ => false,
            },
        }
    }

    fn is_return(&self, insn: &Instruction) -> bool {
        match self {
            Arch::X86_64 => {
                let (mnemonic, _) = x86_opcode(insn);
                matches!(mnemonic, "ret" | "retq" | "retl" | "retw" | "retn")
            }
            Arch::Arm => {
                let operands = squash(&insn.operands);
                match arm_mnemonic(insn) {
                    "bx" => operands == "lr",
                    "mov" => operands == "pc,lr",
                    "pop" => operands.ends_with("pc}"),
                    "ldm" | "ldmia" | "ldmfd" => {
                        operands.starts_with("sp!,") && operands.ends_with("pc}")
                    }
                    _ => false,
                }
            }
            Arch::Aarch64 => matches!(insn.mnemonic.as_str(), "ret" | "retaa" | "retab"),
            Arch::RiscV => {
                let operands = squash(&insn.operands);
                match insn.mnemonic.as_str() {
                    "ret" => true,
                    "jr" => operands == "ra",
                    "jalr" => operands == "zero,0(ra)" || operands == "x0,0(x1)",
                    _ => false,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Arch, BranchPolicy};
    use crate::tracer::parser::{parse_line, Instruction, TraceLine};

    fn insn(text: &str) -> Instruction {
        match parse_line(&format!("f, 0x1000: {text}")) {
            TraceLine::Instruction(i) => i,
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn parse_names() {
        assert_eq!("amd64".parse::<Arch>().unwrap(), Arch::X86_64);
        assert_eq!("ARM64".parse::<Arch>().unwrap(), Arch::Aarch64);
        assert_eq!("rv64".parse::<Arch>().unwrap(), Arch::RiscV);
        assert_eq!("armv7".parse::<Arch>().unwrap(), Arch::Arm);
        assert!("mips".parse::<Arch>().is_err());
        assert_eq!(Arch::X86_64.to_string(), "x86_64");
    }

    #[test]
    fn x86() {
        let a = Arch::X86_64;
        assert!(a.is_call(&insn("call   0x401136 <g>")));
        assert!(a.is_call(&insn("callq  *%rax")));
        assert!(a.is_call(&insn("bnd call 0x401030 <puts@plt>")));
        assert!(!a.is_call(&insn("jmp    0x401140 <f+16>")));
        assert!(a.is_return(&insn("ret")));
        assert!(a.is_return(&insn("repz ret")));
        assert!(a.is_return(&insn("retq")));
        assert!(!a.is_return(&insn("mov    %rdi,-0x8(%rbp)")));
    }

    #[test]
    fn arm() {
        let a = Arch::Arm;
        assert!(a.is_call(&insn("bl\t0x10408 <g>")));
        assert!(a.is_call(&insn("blx\tr3")));
        assert!(!a.is_call(&insn("b.n\t0x10410 <f+8>")));
        assert!(a.is_return(&insn("bx\tlr")));
        assert!(a.is_return(&insn("pop\t{r7, pc}")));
        assert!(a.is_return(&insn("pop.w\t{r4, r5, r7, pc}")));
        assert!(a.is_return(&insn("ldmia.w\tsp!, {r4, pc}")));
        assert!(a.is_return(&insn("mov\tpc, lr")));
        assert!(!a.is_return(&insn("pop\t{r4, r7}")));
    }

    #[test]
    fn aarch64() {
        let a = Arch::Aarch64;
        assert!(a.is_call(&insn("bl\t0x400560 <g>")));
        assert!(a.is_call(&insn("blr\tx8")));
        assert!(!a.is_call(&insn("b\t0x400580 <f+32>")));
        assert!(a.is_return(&insn("ret")));
    }

    #[test]
    fn riscv() {
        let a = Arch::RiscV;
        assert!(a.is_call(&insn("jal\tra,0x10430 <g>")));
        assert!(a.is_call(&insn("jal\t0x10430 <g>")));
        assert!(a.is_call(&insn("jalr\ta5")));
        assert!(a.is_call(&insn("call\t0x10430 <g>")));
        assert!(!a.is_call(&insn("jal\tzero,0x10440 <f+16>")));
        assert!(a.is_return(&insn("ret")));
        assert!(a.is_return(&insn("jr\tra")));
        assert!(a.is_return(&insn("jalr\tzero,0(ra)")));
        assert!(!a.is_return(&insn("jr\ta5")));
    }

    #[test]
    fn thumb_bit() {
        assert_eq!(Arch::Arm.code_address(0x10409), 0x10408);
        assert_eq!(Arch::X86_64.code_address(0x1139), 0x1139);
    }
}
