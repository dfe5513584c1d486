use lazy_static::lazy_static;
use regex::Regex;
use tracing::trace;

/// One executed instruction as the debugger printed it:
/// `<function>, 0x<address>: <mnemonic> <operands>`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Instruction {
    pub function: String,
    pub address: u64,
    pub mnemonic: String,
    pub operands: String,
}

impl Instruction {
    /// `call *0x8(%rax)` only names where the destination is stored
    fn is_indirect(&self) -> bool {
        self.operands.trim_start().starts_with('*')
    }

    /// Destination of a direct branch, `0x401136` in `call 0x401136 <g>`.
    pub fn branch_address(&self) -> Option<u64> {
        lazy_static! {
            static ref PREFIXED: Regex = Regex::new(r"0x([0-9a-fA-F]+)").unwrap();
            // objdump style, `bl 10408 <f>`
            static ref BARE: Regex = Regex::new(r"(?:^|[\s,])([0-9a-fA-F]+)\s*<").unwrap();
        }

        if self.is_indirect() {
            return None;
        }

        let caps = PREFIXED
            .captures(&self.operands)
            .or_else(|| BARE.captures(&self.operands))?;

        u64::from_str_radix(caps.get(1)?.as_str(), 16).ok()
    }

    /// Symbol named by the operands, `g` in `call 0x401136 <g>` or `<g+4>`.
    pub fn branch_symbol(&self) -> Option<&str> {
        if self.is_indirect() {
            return None;
        }
        symbol_in(&self.operands).map(|(name, _)| name)
    }

    /// Whether the operands name the first instruction of `function`, `<f>`
    /// but not `<f+4>`.
    pub fn branches_to_start_of(&self, function: &str) -> bool {
        !self.is_indirect()
            && matches!(symbol_in(&self.operands), Some((name, false)) if name == function)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TraceLine {
    /// `TEXT_BASE 0x...`, where the tracer saw the text mapping
    TextBase(u64),
    Instruction(Instruction),
    CallMarker { caller: String, callee: String },
    Unparseable,
}

/// Symbol in `<name>` or `<name+off>`, and whether it had an offset
fn symbol_in(text: &str) -> Option<(&str, bool)> {
    lazy_static! {
        static ref SYMBOL: Regex = Regex::new(r"<([^<>+\s]+)(\+[^<>]*)?>").unwrap();
    }

    let caps = SYMBOL.captures(text)?;
    Some((caps.get(1)?.as_str(), caps.get(2).is_some()))
}

pub fn parse_line(line: &str) -> TraceLine {
    lazy_static! {
        static ref INSN: Regex =
            Regex::new(r"^\s*([^\s,\[\]]+),\s+0x([0-9a-fA-F]+):\s+(\S+)\s*(.*?)\s*$").unwrap();
        static ref CALL: Regex = Regex::new(r"^\[CALL\]\s+(\S+)\s+->\s+(.+?)\s*$").unwrap();
        static ref TEXT_BASE: Regex = Regex::new(r"^TEXT_BASE\s+0x([0-9a-fA-F]+)\s*$").unwrap();
        static ref IDENT: Regex = Regex::new(r"^[A-Za-z_.$][\w.@$]*$").unwrap();
    }

    let parsed = if let Some(caps) = INSN.captures(line) {
        // too many digits for a u64 is garbage, not an instruction
        match u64::from_str_radix(&caps[2], 16) {
            Ok(address) => TraceLine::Instruction(Instruction {
                function: caps[1].to_string(),
                address,
                mnemonic: caps[3].to_string(),
                operands: caps[4].to_string(),
            }),
            Err(_) => TraceLine::Unparseable,
        }
    } else if let Some(caps) = CALL.captures(line) {
        let raw = caps.get(2).map_or("", |m| m.as_str());
        // gdb writes the last operand of the call, usually `<name>`
        let callee = symbol_in(raw)
            .map(|(name, _)| name)
            .unwrap_or_else(|| raw.split_whitespace().last().unwrap_or(""))
            .trim_matches(|c| c == '<' || c == '>');

        // `*%rax` and friends don't tell us who is called
        if !IDENT.is_match(callee) {
            TraceLine::Unparseable
        } else {
            TraceLine::CallMarker {
                caller: caps[1].to_string(),
                callee: callee.to_string(),
            }
        }
    } else if let Some(caps) = TEXT_BASE.captures(line) {
        match u64::from_str_radix(&caps[1], 16) {
            Ok(base) => TraceLine::TextBase(base),
            Err(_) => TraceLine::Unparseable,
        }
    } else {
        TraceLine::Unparseable
    };

    trace!("{:x?}", parsed);

    parsed
}
