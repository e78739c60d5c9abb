//! The assembler emitter: resolves labels to instruction addresses and vreg
//! operands to physical registers, producing the VM's final line stream.

use std::fmt;

use crate::common::{Id, Map};
use crate::middle::lir::{Instr, Label};
use crate::middle::regalloc::{Allocation, PhysReg};

/// A primitive VM operation, stripped of vregs and labels. Stringifies as
/// its canonical upper-case mnemonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Read,
    Write,
    Load,
    Store,
    Add,
    Sub,
    Get,
    Put,
    Rst,
    Inc,
    Dec,
    Shl,
    Shr,
    Jump,
    Jpos,
    Jzero,
    Strk,
    Jumpr,
    Halt,
}

impl Opcode {
    pub fn mnemonic(self) -> &'static str {
        use Opcode::*;
        match self {
            Read => "READ",
            Write => "WRITE",
            Load => "LOAD",
            Store => "STORE",
            Add => "ADD",
            Sub => "SUB",
            Get => "GET",
            Put => "PUT",
            Rst => "RST",
            Inc => "INC",
            Dec => "DEC",
            Shl => "SHL",
            Shr => "SHR",
            Jump => "JUMP",
            Jpos => "JPOS",
            Jzero => "JZERO",
            Strk => "STRK",
            Jumpr => "JUMPR",
            Halt => "HALT",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mnemonic())
    }
}

/// An operand of a final `Line`: either a physical register (`a`..`h`) or a
/// resolved jump target (a decimal instruction address).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Reg(PhysReg),
    Addr(usize),
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Reg(r) => write!(f, "{r}"),
            Operand::Addr(a) => write!(f, "{a}"),
        }
    }
}

/// One line of the output text format: `(opcode, optional argument,
/// optional comment)`. Comments are documentation only; the VM ignores
/// them.
#[derive(Debug, Clone)]
pub struct Line {
    pub opcode: Opcode,
    pub operand: Option<Operand>,
    pub comment: Option<String>,
}

impl Line {
    fn new(opcode: Opcode, operand: Option<Operand>) -> Self {
        Line { opcode, operand, comment: None }
    }

    fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.opcode)?;
        if let Some(operand) = &self.operand {
            write!(f, " {operand}")?;
        }
        if let Some(comment) = &self.comment {
            write!(f, " # {comment}")?;
        }
        Ok(())
    }
}

/// The finished program: one `Line` per VM instruction, in execution order.
/// Address `i` (0-based) is exactly `lines[i]`, matching every `Operand::Addr`
/// this module resolved.
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub lines: Vec<Line>,
}

impl Program {
    /// The output text format: one instruction per line, trailing newline.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            out.push_str(&line.to_string());
            out.push('\n');
        }
        out
    }
}

/// Translate a colored LIR program into its final VM line stream.
///
/// Two passes: first walk every non-label instruction assigning
/// it a monotonically increasing address and record where each label
/// resolves to (the address of the next non-label instruction); then emit
/// one `Line` per non-label instruction with vreg/label operands replaced
/// by their physical register / resolved address.
pub fn assemble(allocation: &Allocation) -> Program {
    let flat = allocation.program.flatten();
    let procedure_names: Map<Label, ()> =
        allocation.program.procedures.iter().map(|(name, _)| (*name, ())).collect();

    let mut labels: Map<Id, usize> = Map::new();
    let mut addr = 0usize;
    for instr in &flat {
        match instr {
            Instr::Label(name) => {
                labels.insert(*name, addr);
            }
            _ => addr += 1,
        }
    }

    let mut lines = Vec::with_capacity(addr);
    for instr in &flat {
        if matches!(instr, Instr::Label(_)) {
            continue;
        }
        lines.push(to_line(instr, &allocation.colors, &labels, &procedure_names));
    }
    Program { lines }
}

fn reg(colors: &Map<crate::middle::lir::VReg, PhysReg>, v: crate::middle::lir::VReg) -> PhysReg {
    *colors.get(&v).expect("the allocator colors every vreg the emitter produced")
}

fn addr_of(labels: &Map<Id, usize>, label: Label) -> usize {
    *labels.get(&label).expect("every label the emitter referenced is defined somewhere in the program")
}

fn to_line(
    instr: &Instr,
    colors: &Map<crate::middle::lir::VReg, PhysReg>,
    labels: &Map<Id, usize>,
    procedure_names: &Map<Label, ()>,
) -> Line {
    use Instr::*;
    match instr {
        Read => Line::new(Opcode::Read, None),
        Write => Line::new(Opcode::Write, None),
        Load(r) => Line::new(Opcode::Load, Some(Operand::Reg(reg(colors, *r)))),
        Store(r) => Line::new(Opcode::Store, Some(Operand::Reg(reg(colors, *r)))),
        Add(r) => Line::new(Opcode::Add, Some(Operand::Reg(reg(colors, *r)))),
        Sub(r) => Line::new(Opcode::Sub, Some(Operand::Reg(reg(colors, *r)))),
        Get(r) => Line::new(Opcode::Get, Some(Operand::Reg(reg(colors, *r)))),
        Put(r) => Line::new(Opcode::Put, Some(Operand::Reg(reg(colors, *r)))),
        Rst(r) => Line::new(Opcode::Rst, Some(Operand::Reg(reg(colors, *r)))),
        Inc(r) => Line::new(Opcode::Inc, Some(Operand::Reg(reg(colors, *r)))),
        Dec(r) => Line::new(Opcode::Dec, Some(Operand::Reg(reg(colors, *r)))),
        Shl(r) => Line::new(Opcode::Shl, Some(Operand::Reg(reg(colors, *r)))),
        Shr(r) => Line::new(Opcode::Shr, Some(Operand::Reg(reg(colors, *r)))),
        Jump(label) => {
            let line = Line::new(Opcode::Jump, Some(Operand::Addr(addr_of(labels, *label))));
            if procedure_names.contains_key(label) {
                line.with_comment(format!("call {label}"))
            } else if **label == *"MAIN" {
                line.with_comment("enter MAIN")
            } else {
                line
            }
        }
        Jpos(label) => Line::new(Opcode::Jpos, Some(Operand::Addr(addr_of(labels, *label)))),
        Jzero(label) => Line::new(Opcode::Jzero, Some(Operand::Addr(addr_of(labels, *label)))),
        Strk(r) => Line::new(Opcode::Strk, Some(Operand::Reg(reg(colors, *r)))).with_comment("save return address"),
        Jumpr(r) => Line::new(Opcode::Jumpr, Some(Operand::Reg(reg(colors, *r)))).with_comment("return"),
        Label(_) => unreachable!("labels are resolved away before emission"),
        Halt => Line::new(Opcode::Halt, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::front::parse::parse;
    use crate::middle::{lower::lower, regalloc::allocate};

    fn assemble_src(src: &str) -> Program {
        let ast = parse(src).expect("parses");
        let lir = lower(&ast).expect("lowers");
        let allocation = allocate(lir).expect("allocates");
        assemble(&allocation)
    }

    #[test]
    fn mnemonics_are_upper_case() {
        let program = assemble_src("PROGRAM IS a IN a := 1; WRITE a; END");
        for line in &program.lines {
            assert_eq!(line.opcode.mnemonic(), line.opcode.mnemonic().to_uppercase());
        }
    }

    #[test]
    fn registers_print_as_lowercase_letters() {
        let program = assemble_src("PROGRAM IS a IN a := 1; WRITE a; END");
        for line in &program.lines {
            if let Some(Operand::Reg(r)) = line.operand {
                assert!(r.letter().is_ascii_lowercase());
            }
        }
    }

    #[test]
    fn jump_targets_are_in_range() {
        let program = assemble_src("PROGRAM IS a IN WHILE a > 0 DO a := a - 1; ENDWHILE END");
        for line in &program.lines {
            if let Some(Operand::Addr(a)) = line.operand {
                assert!(a <= program.lines.len(), "address {a} out of range for {} lines", program.lines.len());
            }
        }
    }

    #[test]
    fn program_starts_with_a_jump_to_main() {
        let program = assemble_src("PROGRAM IS IN END");
        assert_eq!(program.lines[0].opcode, Opcode::Jump);
    }

    #[test]
    fn ends_with_halt() {
        let program = assemble_src("PROGRAM IS IN END");
        assert_eq!(program.lines.last().unwrap().opcode, Opcode::Halt);
    }

    #[test]
    fn to_text_has_one_line_per_instruction() {
        let program = assemble_src("PROGRAM IS a IN a := 1; WRITE a; END");
        assert_eq!(program.to_text().lines().count(), program.lines.len());
    }
}
