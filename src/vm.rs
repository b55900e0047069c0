//! The virtual machine's instruction set and the assembler the code
//! generator uses to emit it.
//!
//! Bytecode is a list of fixed-size instructions over a flat operand
//! array. Handler identity travels through the opcode name table (the
//! `strum` derives below) so serialized bytecode stays portable across
//! library versions.
use std::fmt::Write as _;

use strum::{Display, EnumString, FromRepr};

/// The opcodes of the virtual machine. The discriminants are stable:
/// they are what the serialized form stores alongside the name table.
#[derive(Debug, Display, EnumString, FromRepr, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub(crate) enum Opcode {
    Null = 0,
    Halt = 1,
    Label = 2,
    Call = 3,
    ScanStart = 4,
    ScanChar = 5,
    ScanAccept = 6,
    ScanToken = 7,
    ScanError = 8,
    AstStart = 9,
    AstFinish = 10,
    AstNew = 11,
    AstForm = 12,
    AstLoad = 13,
    AstIndex = 14,
    AstChild = 15,
    AstChildSlice = 16,
    AstKind = 17,
    AstKindNum = 18,
    AstLocation = 19,
    AstLocationNum = 20,
    AstLexeme = 21,
    AstLexemeString = 22,
    Assign = 23,
    DumpStack = 24,
    Add = 25,
    Subtract = 26,
    Multiply = 27,
    Divide = 28,
    UnaryMinus = 29,
    Return = 30,
    Branch = 31,
    BranchEqual = 32,
    BranchNotEqual = 33,
    BranchLessThan = 34,
    BranchLessEqual = 35,
    BranchGreaterThan = 36,
    BranchGreaterEqual = 37,
}

pub(crate) const NUM_OPCODES: usize = 38;

impl Opcode {
    /// Every opcode in discriminant order.
    pub fn all() -> impl Iterator<Item = Opcode> {
        (0..NUM_OPCODES).map(|n| Opcode::from_repr(n as u8).unwrap())
    }

    /// The number of operands an instruction of this opcode owns.
    /// `ScanChar` is the one variable case: its first operand counts the
    /// `(low, high, target)` triples that follow.
    pub fn operand_count(self, operands: &[i64], offset: usize) -> usize {
        match self {
            Opcode::Null
            | Opcode::Halt
            | Opcode::Label
            | Opcode::Return
            | Opcode::ScanStart
            | Opcode::ScanToken
            | Opcode::DumpStack => 0,
            Opcode::Call
            | Opcode::Branch
            | Opcode::ScanError
            | Opcode::AstStart
            | Opcode::AstFinish
            | Opcode::AstNew
            | Opcode::AstChild
            | Opcode::AstKind
            | Opcode::AstKindNum
            | Opcode::AstLocation
            | Opcode::AstLocationNum
            | Opcode::AstLexeme
            | Opcode::AstLexemeString => 1,
            Opcode::ScanAccept | Opcode::AstIndex | Opcode::Assign | Opcode::UnaryMinus => 2,
            Opcode::AstForm
            | Opcode::AstLoad
            | Opcode::AstChildSlice
            | Opcode::Add
            | Opcode::Subtract
            | Opcode::Multiply
            | Opcode::Divide
            | Opcode::BranchEqual
            | Opcode::BranchNotEqual
            | Opcode::BranchLessThan
            | Opcode::BranchLessEqual
            | Opcode::BranchGreaterThan
            | Opcode::BranchGreaterEqual => 3,
            Opcode::ScanChar => 1 + 3 * operands[offset] as usize,
        }
    }
}

/// One instruction: its opcode, the source location that blame for a
/// runtime fault lands on, and the offset of its operand slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct VmInstruction {
    pub opcode: Opcode,
    pub location: i64,
    pub operand_offset: usize,
}

/// A named integer register with its value at parse start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct VmRegister {
    pub name: String,
    pub initial_value: i64,
}

/// A forward-referenceable code location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CodeLabel(usize);

/// An operand as the code generator writes it: a plain integer or a
/// label to resolve during assembly.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Operand {
    Int(i64),
    Lab(CodeLabel),
}

/// Two-pass assembler: the code generator emits instructions with
/// symbolic labels, then `assemble` resolves them into instruction pcs.
#[derive(Debug, Default)]
pub(crate) struct CodeAssembler {
    instructions: Vec<(Opcode, i64, Vec<Operand>)>,
    labels: Vec<Option<usize>>,
}

impl CodeAssembler {
    pub fn new() -> CodeAssembler {
        CodeAssembler::default()
    }

    /// The pc the next emitted instruction will occupy.
    pub fn here(&self) -> usize {
        self.instructions.len()
    }

    pub fn new_label(&mut self) -> CodeLabel {
        self.labels.push(None);
        CodeLabel(self.labels.len() - 1)
    }

    /// Bind a label to the current pc.
    pub fn bind(&mut self, label: CodeLabel) {
        assert!(self.labels[label.0].is_none(), "label bound twice");
        self.labels[label.0] = Some(self.instructions.len());
    }

    pub fn emit(&mut self, opcode: Opcode, location: i64, operands: Vec<Operand>) {
        self.instructions.push((opcode, location, operands));
    }

    /// Resolve labels and flatten into the instruction and operand
    /// arrays the engine executes.
    pub fn assemble(self) -> (Vec<VmInstruction>, Vec<i64>) {
        let mut instructions = Vec::with_capacity(self.instructions.len());
        let mut operand_list = Vec::new();
        for (opcode, location, operands) in self.instructions {
            let operand_offset = operand_list.len();
            for operand in operands {
                operand_list.push(match operand {
                    Operand::Int(value) => value,
                    Operand::Lab(label) => {
                        self.labels[label.0].expect("unbound label") as i64
                    }
                });
            }
            instructions.push(VmInstruction {
                opcode,
                location,
                operand_offset,
            });
        }
        (instructions, operand_list)
    }
}

/// Render an instruction listing for the ICode debug flag.
pub(crate) fn disassemble(instructions: &[VmInstruction], operands: &[i64]) -> String {
    let mut out = String::new();
    for (pc, instruction) in instructions.iter().enumerate() {
        let count = instruction
            .opcode
            .operand_count(operands, instruction.operand_offset);
        let _ = write!(out, "{pc:6}  {:<18}", instruction.opcode.to_string());
        for n in 0..count {
            let _ = write!(out, " {}", operands[instruction.operand_offset + n]);
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn opcode_names_round_trip() {
        for opcode in Opcode::all() {
            let name = opcode.to_string();
            assert_eq!(Opcode::from_str(&name).unwrap(), opcode);
        }
        assert_eq!(Opcode::from_repr(5), Some(Opcode::ScanChar));
        assert_eq!(Opcode::from_repr(38), None);
    }

    #[test]
    fn labels_resolve_forward_and_backward() {
        let mut asm = CodeAssembler::new();
        let top = asm.new_label();
        let done = asm.new_label();
        asm.bind(top);
        asm.emit(Opcode::Branch, -1, vec![Operand::Lab(done)]);
        asm.emit(Opcode::Branch, -1, vec![Operand::Lab(top)]);
        asm.bind(done);
        asm.emit(Opcode::Halt, -1, vec![]);
        let (instructions, operands) = asm.assemble();
        assert_eq!(instructions.len(), 3);
        assert_eq!(operands[instructions[0].operand_offset], 2);
        assert_eq!(operands[instructions[1].operand_offset], 0);
    }

    #[test]
    fn scan_char_operand_count_is_variable() {
        let operands = [2, 97, 98, 7, 99, 99, 9];
        assert_eq!(Opcode::ScanChar.operand_count(&operands, 0), 7);
        assert_eq!(Opcode::Halt.operand_count(&operands, 0), 0);
    }
}
