//! The frozen parser artifact: grammar metadata, parse tables and
//! bytecode, plus the round-trippable text serialization.
//!
//! Generating a parser is slow and the result is immutable, so the
//! artifact is shared behind an `Arc` by every parser instance that
//! recognizes the same language.
use std::io::Write as _;
use std::str::FromStr;

use ahash::AHashMap;

use crate::ast::KindMap;
use crate::codegen::CodeArtifacts;
use crate::errors::HoshiError;
use crate::grammar::Grammar;
use crate::lalr::LalrTables;
use crate::source::SourceBuffer;
use crate::vm::{Opcode, VmInstruction, VmRegister};

const MIN_SUPPORTED_VERSION: i64 = 0;
const CURRENT_VERSION: i64 = 1;

const FIRST_DATA: u8 = 0x20;
const LAST_DATA: u8 = 0x7a;
const ESCAPE: u8 = 0x7b; // {
const FIELD_SEPARATOR: u8 = 0x7c; // |
const BLOCK_SEPARATOR: u8 = 0x7d; // }
const FIELD_SEPARATOR_NEGATIVE: u8 = 0x7e; // ~

/// Block ids of the encoded form, in stream order.
mod block {
    pub const VERSION: i64 = 0;
    pub const KIND_MAP: i64 = 1;
    pub const SOURCE: i64 = 2;
    pub const LOOKAHEADS: i64 = 3;
    pub const ERROR_RECOVERY: i64 = 4;
    pub const ERROR_SYMBOL_NUM: i64 = 5;
    pub const EOF_SYMBOL_NUM: i64 = 6;
    pub const TOKEN_COUNT: i64 = 7;
    pub const TOKEN_NAME_LIST: i64 = 8;
    pub const TOKEN_IS_TERMINAL: i64 = 9;
    pub const TOKEN_KIND: i64 = 10;
    pub const TOKEN_LEXEME_NEEDED: i64 = 11;
    pub const RULE_COUNT: i64 = 12;
    pub const RULE_SIZE: i64 = 13;
    pub const RULE_LHS: i64 = 14;
    pub const RULE_TEXT: i64 = 15;
    pub const RULE_PC: i64 = 16;
    pub const SCANNER_PC: i64 = 17;
    pub const START_STATE: i64 = 18;
    pub const RESTART_STATE: i64 = 19;
    pub const CHECKED_INDEX_COUNT: i64 = 20;
    pub const CHECKED_INDEX: i64 = 21;
    pub const CHECKED_DATA_COUNT: i64 = 22;
    pub const CHECKED_DATA: i64 = 23;
    pub const NUM_OFFSETS: i64 = 24;
    pub const SYMBOL_NUM_OFFSET: i64 = 25;
    pub const SYMBOL_NUM_SHIFT: i64 = 26;
    pub const SYMBOL_NUM_MASK: i64 = 27;
    pub const ACTION_TYPE_OFFSET: i64 = 28;
    pub const ACTION_TYPE_SHIFT: i64 = 29;
    pub const ACTION_TYPE_MASK: i64 = 30;
    pub const RULE_NUM_OFFSET: i64 = 31;
    pub const RULE_NUM_SHIFT: i64 = 32;
    pub const RULE_NUM_MASK: i64 = 33;
    pub const STATE_NUM_OFFSET: i64 = 34;
    pub const STATE_NUM_SHIFT: i64 = 35;
    pub const STATE_NUM_MASK: i64 = 36;
    pub const FALLBACK_NUM_OFFSET: i64 = 37;
    pub const FALLBACK_NUM_SHIFT: i64 = 38;
    pub const FALLBACK_NUM_MASK: i64 = 39;
    pub const OPCODE_MAP: i64 = 40;
    pub const INSTRUCTION_COUNT: i64 = 41;
    pub const OPERAND_COUNT: i64 = 42;
    pub const INSTRUCTION_LIST: i64 = 43;
    pub const REGISTER_COUNT: i64 = 44;
    pub const REGISTER_LIST: i64 = 45;
    pub const AST_COUNT: i64 = 46;
    pub const STRING_COUNT: i64 = 47;
    pub const STRING_LIST: i64 = 48;
    pub const EOF: i64 = 49;
}

/// The immutable generated parser. Never mutated once built; parser
/// instances share it through an `Arc`.
#[derive(Debug, Clone, Default)]
pub(crate) struct ParserData {
    pub kind_map: KindMap,
    pub src: SourceBuffer,
    pub lookaheads: i64,
    pub error_recovery: bool,
    pub error_symbol_num: i64,
    pub eof_symbol_num: i64,
    pub token_name_list: Vec<String>,
    pub token_is_terminal: Vec<bool>,
    pub token_kind: Vec<i32>,
    pub token_lexeme_needed: Vec<bool>,
    pub rule_size: Vec<i64>,
    pub rule_lhs: Vec<i64>,
    pub rule_text: Vec<String>,
    pub rule_pc: Vec<i64>,
    pub scanner_pc: i64,
    pub tables: LalrTables,
    pub instructions: Vec<VmInstruction>,
    pub operands: Vec<i64>,
    pub registers: Vec<VmRegister>,
    pub ast_count: i64,
    pub strings: Vec<String>,
}

impl ParserData {
    /// Copy the salient grammar fields and attach the generated tables
    /// and bytecode. The working grammar is dropped right after this.
    pub fn build(
        gram: &Grammar,
        kind_map: KindMap,
        grammar_source: &str,
        tables: LalrTables,
        code: CodeArtifacts,
    ) -> ParserData {
        let mut prsd = ParserData {
            kind_map,
            src: SourceBuffer::new(grammar_source),
            lookaheads: gram.max_lookaheads as i64,
            error_recovery: gram.error_recovery,
            error_symbol_num: gram.symbol(gram.error_symbol).symbol_num,
            eof_symbol_num: gram.symbol(gram.eof_symbol).symbol_num,
            scanner_pc: code.scanner_pc,
            rule_pc: code.rule_pc,
            tables,
            instructions: code.instructions,
            operands: code.operands,
            registers: code.registers,
            ast_count: code.ast_count,
            strings: code.strings,
            ..ParserData::default()
        };

        let mut max_symbol_num = 0;
        for id in gram.symbol_ids() {
            let data = gram.symbol(id);
            if !data.is_nonterminal && data.symbol_num > max_symbol_num {
                max_symbol_num = data.symbol_num;
            }
        }
        let token_count = (max_symbol_num + 1) as usize;
        prsd.token_name_list = vec![String::new(); token_count];
        prsd.token_is_terminal = vec![false; token_count];
        prsd.token_kind = vec![-1; token_count];
        prsd.token_lexeme_needed = vec![false; token_count];

        let mut ids: Vec<_> = gram.symbol_ids().collect();
        ids.sort_by_key(|&id| gram.symbol(id).symbol_num);
        for id in ids {
            let data = gram.symbol(id);
            if data.is_nonterminal {
                continue;
            }
            let num = data.symbol_num as usize;
            prsd.token_name_list[num] = gram.symbol_name(id).to_string();
            prsd.token_is_terminal[num] = data.is_terminal;
            prsd.token_kind[num] = prsd.kind_map.kind_force(gram.symbol_name(id));
            prsd.token_lexeme_needed[num] = data.lexeme_needed;
        }

        for rule in &gram.rules {
            prsd.rule_size.push(rule.rhs.len() as i64);
            prsd.rule_lhs.push(gram.symbol(rule.lhs).symbol_num);
            prsd.rule_text.push(gram.rule_text(rule));
        }
        prsd
    }

    pub fn token_count(&self) -> usize {
        self.token_name_list.len()
    }

    //
    //  Encoding
    //

    /// Encode the whole artifact as 7-bit ASCII text.
    pub fn encode(&self) -> String {
        let mut out = Vec::new();
        let begin = |out: &mut Vec<u8>, id: i64| encode_int(id, out);
        let end = |out: &mut Vec<u8>| out.push(BLOCK_SEPARATOR);

        begin(&mut out, block::VERSION);
        encode_int(CURRENT_VERSION, &mut out);
        end(&mut out);

        begin(&mut out, block::KIND_MAP);
        for (name, kind) in self.kind_map.sorted_pairs() {
            encode_string(&name, &mut out);
            encode_int(kind as i64, &mut out);
        }
        end(&mut out);

        begin(&mut out, block::SOURCE);
        encode_string(&self.src.slice(0, -1), &mut out);
        end(&mut out);

        let int_block = |out: &mut Vec<u8>, id: i64, value: i64| {
            encode_int(id, out);
            encode_int(value, out);
            out.push(BLOCK_SEPARATOR);
        };
        int_block(&mut out, block::LOOKAHEADS, self.lookaheads);
        int_block(&mut out, block::ERROR_RECOVERY, self.error_recovery as i64);
        int_block(&mut out, block::ERROR_SYMBOL_NUM, self.error_symbol_num);
        int_block(&mut out, block::EOF_SYMBOL_NUM, self.eof_symbol_num);

        int_block(&mut out, block::TOKEN_COUNT, self.token_count() as i64);
        begin(&mut out, block::TOKEN_NAME_LIST);
        for name in &self.token_name_list {
            encode_string(name, &mut out);
        }
        end(&mut out);
        begin(&mut out, block::TOKEN_IS_TERMINAL);
        for &flag in &self.token_is_terminal {
            encode_int(flag as i64, &mut out);
        }
        end(&mut out);
        begin(&mut out, block::TOKEN_KIND);
        for &kind in &self.token_kind {
            encode_int(kind as i64, &mut out);
        }
        end(&mut out);
        begin(&mut out, block::TOKEN_LEXEME_NEEDED);
        for &flag in &self.token_lexeme_needed {
            encode_int(flag as i64, &mut out);
        }
        end(&mut out);

        int_block(&mut out, block::RULE_COUNT, self.rule_size.len() as i64);
        begin(&mut out, block::RULE_SIZE);
        for &size in &self.rule_size {
            encode_int(size, &mut out);
        }
        end(&mut out);
        begin(&mut out, block::RULE_LHS);
        for &lhs in &self.rule_lhs {
            encode_int(lhs, &mut out);
        }
        end(&mut out);
        begin(&mut out, block::RULE_TEXT);
        for text in &self.rule_text {
            encode_string(text, &mut out);
        }
        end(&mut out);
        begin(&mut out, block::RULE_PC);
        for &pc in &self.rule_pc {
            encode_int(pc, &mut out);
        }
        end(&mut out);
        int_block(&mut out, block::SCANNER_PC, self.scanner_pc);

        int_block(&mut out, block::START_STATE, self.tables.start_state);
        int_block(&mut out, block::RESTART_STATE, self.tables.restart_state);
        int_block(
            &mut out,
            block::CHECKED_INDEX_COUNT,
            self.tables.checked_index.len() as i64,
        );
        begin(&mut out, block::CHECKED_INDEX);
        for &index in &self.tables.checked_index {
            encode_int(index, &mut out);
        }
        end(&mut out);
        int_block(
            &mut out,
            block::CHECKED_DATA_COUNT,
            self.tables.checked_data.len() as i64,
        );
        begin(&mut out, block::CHECKED_DATA);
        for &word in &self.tables.checked_data {
            encode_int(word, &mut out);
        }
        end(&mut out);
        int_block(&mut out, block::NUM_OFFSETS, self.tables.num_offsets);
        for (id, value) in [
            (block::SYMBOL_NUM_OFFSET, self.tables.symbol_num_offset),
            (block::SYMBOL_NUM_SHIFT, self.tables.symbol_num_shift),
            (block::SYMBOL_NUM_MASK, self.tables.symbol_num_mask),
            (block::ACTION_TYPE_OFFSET, self.tables.action_type_offset),
            (block::ACTION_TYPE_SHIFT, self.tables.action_type_shift),
            (block::ACTION_TYPE_MASK, self.tables.action_type_mask),
            (block::RULE_NUM_OFFSET, self.tables.rule_num_offset),
            (block::RULE_NUM_SHIFT, self.tables.rule_num_shift),
            (block::RULE_NUM_MASK, self.tables.rule_num_mask),
            (block::STATE_NUM_OFFSET, self.tables.state_num_offset),
            (block::STATE_NUM_SHIFT, self.tables.state_num_shift),
            (block::STATE_NUM_MASK, self.tables.state_num_mask),
            (block::FALLBACK_NUM_OFFSET, self.tables.fallback_num_offset),
            (block::FALLBACK_NUM_SHIFT, self.tables.fallback_num_shift),
            (block::FALLBACK_NUM_MASK, self.tables.fallback_num_mask),
        ] {
            int_block(&mut out, id, value);
        }

        begin(&mut out, block::OPCODE_MAP);
        for opcode in Opcode::all() {
            encode_string(&opcode.to_string(), &mut out);
            encode_int(opcode as i64, &mut out);
        }
        end(&mut out);
        int_block(
            &mut out,
            block::INSTRUCTION_COUNT,
            self.instructions.len() as i64,
        );
        int_block(&mut out, block::OPERAND_COUNT, self.operands.len() as i64);
        begin(&mut out, block::INSTRUCTION_LIST);
        for instruction in &self.instructions {
            encode_int(instruction.opcode as i64, &mut out);
            encode_int(instruction.location, &mut out);
            encode_int(instruction.operand_offset as i64, &mut out);
            let count = instruction
                .opcode
                .operand_count(&self.operands, instruction.operand_offset);
            encode_int(count as i64, &mut out);
            for n in 0..count {
                encode_int(self.operands[instruction.operand_offset + n], &mut out);
            }
        }
        end(&mut out);

        int_block(&mut out, block::REGISTER_COUNT, self.registers.len() as i64);
        begin(&mut out, block::REGISTER_LIST);
        for register in &self.registers {
            encode_string(&register.name, &mut out);
            encode_int(register.initial_value, &mut out);
        }
        end(&mut out);
        int_block(&mut out, block::AST_COUNT, self.ast_count);
        int_block(&mut out, block::STRING_COUNT, self.strings.len() as i64);
        begin(&mut out, block::STRING_LIST);
        for string in &self.strings {
            encode_string(string, &mut out);
        }
        end(&mut out);

        begin(&mut out, block::EOF);
        end(&mut out);

        String::from_utf8(out).expect("encoded parser is not ASCII")
    }

    /// Decode an encoded artifact. `kind_map` lets the caller pin the
    /// kind numbering; leaving it `None` auto-assigns fresh integers.
    pub fn decode(
        text: &str,
        kind_map: Option<&AHashMap<String, i32>>,
    ) -> Result<ParserData, HoshiError> {
        let mut cursor = Cursor {
            bytes: text.as_bytes(),
            position: 0,
        };
        let mut prsd = ParserData::default();
        if let Some(map) = kind_map {
            prsd.kind_map.set(map)?;
        }
        let mut kind_remap: AHashMap<i32, i32> = AHashMap::new();
        let mut opcode_remap: AHashMap<i64, Opcode> = AHashMap::new();
        let mut rule_count = 0usize;
        let mut checked_index_count = 0usize;
        let mut checked_data_count = 0usize;
        let mut instruction_count = 0usize;
        let mut operand_count = 0usize;
        let mut register_count = 0usize;
        let mut string_count = 0usize;

        loop {
            let block_id = decode_int(&mut cursor)?;
            match block_id {
                block::VERSION => {
                    let version = decode_int(&mut cursor)?;
                    if !(MIN_SUPPORTED_VERSION..=CURRENT_VERSION).contains(&version) {
                        return Err(HoshiError::VersionMismatch(format!(
                            "encoded version {version} is not supported"
                        )));
                    }
                }
                block::KIND_MAP => {
                    while cursor.peek()? != BLOCK_SEPARATOR {
                        let name = decode_string(&mut cursor)?;
                        let old_kind = decode_int(&mut cursor)? as i32;
                        let new_kind = if kind_map.is_some() {
                            let kind = prsd.kind_map.kind(&name);
                            if kind < 0 {
                                return Err(HoshiError::KindMap(format!(
                                    "encoded kind {name} is missing from the supplied kind map"
                                )));
                            }
                            kind
                        } else {
                            prsd.kind_map.kind_force(&name)
                        };
                        kind_remap.insert(old_kind, new_kind);
                    }
                }
                block::SOURCE => {
                    prsd.src = SourceBuffer::new(&decode_string(&mut cursor)?);
                }
                block::LOOKAHEADS => prsd.lookaheads = decode_int(&mut cursor)?,
                block::ERROR_RECOVERY => {
                    prsd.error_recovery = decode_int(&mut cursor)? != 0;
                }
                block::ERROR_SYMBOL_NUM => prsd.error_symbol_num = decode_int(&mut cursor)?,
                block::EOF_SYMBOL_NUM => prsd.eof_symbol_num = decode_int(&mut cursor)?,
                block::TOKEN_COUNT => {
                    let count = decode_int(&mut cursor)? as usize;
                    prsd.token_name_list = vec![String::new(); count];
                    prsd.token_is_terminal = vec![false; count];
                    prsd.token_kind = vec![-1; count];
                    prsd.token_lexeme_needed = vec![false; count];
                }
                block::TOKEN_NAME_LIST => {
                    for n in 0..prsd.token_name_list.len() {
                        prsd.token_name_list[n] = decode_string(&mut cursor)?;
                    }
                }
                block::TOKEN_IS_TERMINAL => {
                    for n in 0..prsd.token_is_terminal.len() {
                        prsd.token_is_terminal[n] = decode_int(&mut cursor)? != 0;
                    }
                }
                block::TOKEN_KIND => {
                    for n in 0..prsd.token_kind.len() {
                        let old = decode_int(&mut cursor)? as i32;
                        prsd.token_kind[n] = *kind_remap.get(&old).unwrap_or(&old);
                    }
                }
                block::TOKEN_LEXEME_NEEDED => {
                    for n in 0..prsd.token_lexeme_needed.len() {
                        prsd.token_lexeme_needed[n] = decode_int(&mut cursor)? != 0;
                    }
                }
                block::RULE_COUNT => {
                    rule_count = decode_int(&mut cursor)? as usize;
                }
                block::RULE_SIZE => {
                    for _ in 0..rule_count {
                        prsd.rule_size.push(decode_int(&mut cursor)?);
                    }
                }
                block::RULE_LHS => {
                    for _ in 0..prsd.rule_size.len() {
                        prsd.rule_lhs.push(decode_int(&mut cursor)?);
                    }
                }
                block::RULE_TEXT => {
                    for _ in 0..prsd.rule_size.len() {
                        prsd.rule_text.push(decode_string(&mut cursor)?);
                    }
                }
                block::RULE_PC => {
                    for _ in 0..prsd.rule_size.len() {
                        prsd.rule_pc.push(decode_int(&mut cursor)?);
                    }
                }
                block::SCANNER_PC => prsd.scanner_pc = decode_int(&mut cursor)?,
                block::START_STATE => prsd.tables.start_state = decode_int(&mut cursor)?,
                block::RESTART_STATE => prsd.tables.restart_state = decode_int(&mut cursor)?,
                block::CHECKED_INDEX_COUNT => {
                    checked_index_count = decode_int(&mut cursor)? as usize;
                }
                block::CHECKED_INDEX => {
                    for _ in 0..checked_index_count {
                        prsd.tables.checked_index.push(decode_int(&mut cursor)?);
                    }
                }
                block::CHECKED_DATA_COUNT => {
                    checked_data_count = decode_int(&mut cursor)? as usize;
                }
                block::CHECKED_DATA => {
                    for _ in 0..checked_data_count {
                        prsd.tables.checked_data.push(decode_int(&mut cursor)?);
                    }
                }
                block::NUM_OFFSETS => prsd.tables.num_offsets = decode_int(&mut cursor)?,
                block::SYMBOL_NUM_OFFSET => {
                    prsd.tables.symbol_num_offset = decode_int(&mut cursor)?
                }
                block::SYMBOL_NUM_SHIFT => prsd.tables.symbol_num_shift = decode_int(&mut cursor)?,
                block::SYMBOL_NUM_MASK => prsd.tables.symbol_num_mask = decode_int(&mut cursor)?,
                block::ACTION_TYPE_OFFSET => {
                    prsd.tables.action_type_offset = decode_int(&mut cursor)?
                }
                block::ACTION_TYPE_SHIFT => {
                    prsd.tables.action_type_shift = decode_int(&mut cursor)?
                }
                block::ACTION_TYPE_MASK => {
                    prsd.tables.action_type_mask = decode_int(&mut cursor)?
                }
                block::RULE_NUM_OFFSET => prsd.tables.rule_num_offset = decode_int(&mut cursor)?,
                block::RULE_NUM_SHIFT => prsd.tables.rule_num_shift = decode_int(&mut cursor)?,
                block::RULE_NUM_MASK => prsd.tables.rule_num_mask = decode_int(&mut cursor)?,
                block::STATE_NUM_OFFSET => {
                    prsd.tables.state_num_offset = decode_int(&mut cursor)?
                }
                block::STATE_NUM_SHIFT => prsd.tables.state_num_shift = decode_int(&mut cursor)?,
                block::STATE_NUM_MASK => prsd.tables.state_num_mask = decode_int(&mut cursor)?,
                block::FALLBACK_NUM_OFFSET => {
                    prsd.tables.fallback_num_offset = decode_int(&mut cursor)?
                }
                block::FALLBACK_NUM_SHIFT => {
                    prsd.tables.fallback_num_shift = decode_int(&mut cursor)?
                }
                block::FALLBACK_NUM_MASK => {
                    prsd.tables.fallback_num_mask = decode_int(&mut cursor)?
                }
                block::OPCODE_MAP => {
                    while cursor.peek()? != BLOCK_SEPARATOR {
                        let name = decode_string(&mut cursor)?;
                        let code = decode_int(&mut cursor)?;
                        let opcode = Opcode::from_str(&name).map_err(|_| {
                            HoshiError::VersionMismatch(format!(
                                "encoded opcode {name} is unknown to this library"
                            ))
                        })?;
                        opcode_remap.insert(code, opcode);
                    }
                }
                block::INSTRUCTION_COUNT => {
                    instruction_count = decode_int(&mut cursor)? as usize;
                }
                block::OPERAND_COUNT => {
                    operand_count = decode_int(&mut cursor)? as usize;
                }
                block::INSTRUCTION_LIST => {
                    prsd.operands = vec![0; operand_count];
                    prsd.instructions = Vec::with_capacity(instruction_count);
                    for _ in 0..instruction_count {
                        let code = decode_int(&mut cursor)?;
                        let opcode = *opcode_remap.get(&code).ok_or_else(|| {
                            HoshiError::Decode(format!("instruction uses unmapped opcode {code}"))
                        })?;
                        let location = decode_int(&mut cursor)?;
                        let operand_offset = decode_int(&mut cursor)? as usize;
                        let count = decode_int(&mut cursor)? as usize;
                        if operand_offset + count > operand_count {
                            return Err(HoshiError::Decode(
                                "instruction operands overrun the operand list".to_string(),
                            ));
                        }
                        for n in 0..count {
                            prsd.operands[operand_offset + n] = decode_int(&mut cursor)?;
                        }
                        if opcode == Opcode::AstKindNum {
                            let old = prsd.operands[operand_offset] as i32;
                            prsd.operands[operand_offset] =
                                *kind_remap.get(&old).unwrap_or(&old) as i64;
                        }
                        prsd.instructions.push(VmInstruction {
                            opcode,
                            location,
                            operand_offset,
                        });
                    }
                }
                block::REGISTER_COUNT => {
                    register_count = decode_int(&mut cursor)? as usize;
                }
                block::REGISTER_LIST => {
                    for _ in 0..register_count {
                        let name = decode_string(&mut cursor)?;
                        let initial_value = decode_int(&mut cursor)?;
                        prsd.registers.push(VmRegister {
                            name,
                            initial_value,
                        });
                    }
                }
                block::AST_COUNT => prsd.ast_count = decode_int(&mut cursor)?,
                block::STRING_COUNT => {
                    string_count = decode_int(&mut cursor)? as usize;
                }
                block::STRING_LIST => {
                    for _ in 0..string_count {
                        prsd.strings.push(decode_string(&mut cursor)?);
                    }
                }
                block::EOF => {
                    cursor.expect(BLOCK_SEPARATOR)?;
                    return Ok(prsd);
                }
                _ => {
                    return Err(HoshiError::Decode(format!("unknown block id {block_id}")));
                }
            }
            cursor.expect(BLOCK_SEPARATOR)?;
        }
    }

    /// Write the encoded artifact as a C++ string-literal definition.
    pub fn export_cpp(&self, file_name: &str, identifier: &str) -> Result<(), HoshiError> {
        const MAX_WIDTH: usize = 75;
        let mut file = std::fs::File::create(file_name)?;
        write!(file, "static const char* {identifier} =\n{{\n    \"")?;
        let mut width = 5;
        for c in self.encode().chars() {
            if width > MAX_WIDTH {
                write!(file, "\"\n    \"")?;
                width = 5;
            }
            if c == '"' || c == '\\' {
                write!(file, "\\")?;
                width += 1;
            }
            write!(file, "{c}")?;
            width += 1;
        }
        writeln!(file, "\"\n}};")?;
        Ok(())
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl Cursor<'_> {
    fn peek(&self) -> Result<u8, HoshiError> {
        self.bytes
            .get(self.position)
            .copied()
            .ok_or_else(|| HoshiError::Decode("unexpected end of encoded parser".to_string()))
    }

    fn next(&mut self) -> Result<u8, HoshiError> {
        let byte = self.peek()?;
        self.position += 1;
        Ok(byte)
    }

    fn expect(&mut self, byte: u8) -> Result<(), HoshiError> {
        let found = self.next()?;
        if found != byte {
            return Err(HoshiError::Decode(format!(
                "expected separator {byte:#x} but found {found:#x} at offset {}",
                self.position - 1
            )));
        }
        Ok(())
    }
}

/// Integers are little-endian base-64 digit strings in the printable
/// range, terminated by `|`, or by `~` for negative values.
fn encode_int(value: i64, out: &mut Vec<u8>) {
    let negative = value < 0;
    let mut magnitude = value.unsigned_abs();
    while magnitude > 0 {
        out.push(FIRST_DATA + (magnitude & 0x3f) as u8);
        magnitude >>= 6;
    }
    out.push(if negative {
        FIELD_SEPARATOR_NEGATIVE
    } else {
        FIELD_SEPARATOR
    });
}

fn decode_int(cursor: &mut Cursor) -> Result<i64, HoshiError> {
    let mut result: i64 = 0;
    let mut shift = 0;
    loop {
        let byte = cursor.next()?;
        if byte >= FIRST_DATA && byte <= FIRST_DATA + 0x3f {
            result |= ((byte - FIRST_DATA) as i64) << shift;
            shift += 6;
        } else if byte == FIELD_SEPARATOR_NEGATIVE {
            return Ok(-result);
        } else if byte == FIELD_SEPARATOR {
            return Ok(result);
        } else {
            return Err(HoshiError::Decode(format!(
                "invalid encoded integer byte {byte:#x}"
            )));
        }
    }
}

/// Strings are 7-bit bytes in `0x20..=0x7a`, with `{HL` hex-pair
/// escapes for anything outside that range, terminated by `|`.
fn encode_string(value: &str, out: &mut Vec<u8>) {
    for &byte in value.as_bytes() {
        if (FIRST_DATA..=LAST_DATA).contains(&byte) {
            out.push(byte);
        } else {
            out.push(ESCAPE);
            out.push(FIRST_DATA + (byte >> 4));
            out.push(FIRST_DATA + (byte & 0x0f));
        }
    }
    out.push(FIELD_SEPARATOR);
}

fn decode_string(cursor: &mut Cursor) -> Result<String, HoshiError> {
    let mut bytes = Vec::new();
    loop {
        let byte = cursor.next()?;
        if byte == FIELD_SEPARATOR {
            break;
        } else if byte == ESCAPE {
            let high = cursor.next()?.wrapping_sub(FIRST_DATA);
            let low = cursor.next()?.wrapping_sub(FIRST_DATA);
            bytes.push((high << 4) | (low & 0x0f));
        } else if (FIRST_DATA..=LAST_DATA).contains(&byte) {
            bytes.push(byte);
        } else {
            return Err(HoshiError::Decode(format!(
                "invalid encoded string byte {byte:#x}"
            )));
        }
    }
    String::from_utf8(bytes)
        .map_err(|_| HoshiError::Decode("encoded string is not valid UTF-8".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_round_trip(value: i64) {
        let mut out = Vec::new();
        encode_int(value, &mut out);
        let mut cursor = Cursor {
            bytes: &out,
            position: 0,
        };
        assert_eq!(decode_int(&mut cursor).unwrap(), value);
        assert_eq!(cursor.position, out.len());
    }

    #[test]
    fn integers_round_trip() {
        for value in [0, 1, 63, 64, 65, 4095, -1, -64, i64::MAX, 1 << 40] {
            int_round_trip(value);
        }
    }

    #[test]
    fn strings_round_trip() {
        for value in ["", "hello", "a|b}c{d~", "tab\tnewline\n", "caf\u{00e9} \u{2603}"] {
            let mut out = Vec::new();
            encode_string(value, &mut out);
            assert!(out.iter().all(|&b| (0x20..0x7f).contains(&b)));
            let mut cursor = Cursor {
                bytes: &out,
                position: 0,
            };
            assert_eq!(decode_string(&mut cursor).unwrap(), value);
        }
    }

    #[test]
    fn truncated_streams_are_rejected() {
        assert!(ParserData::decode("", None).is_err());
        assert!(ParserData::decode("garbage", None).is_err());
    }

    #[test]
    fn empty_artifact_round_trips() {
        let prsd = ParserData::default();
        let encoded = prsd.encode();
        let decoded = ParserData::decode(&encoded, None).unwrap();
        assert_eq!(decoded.tables, prsd.tables);
        assert_eq!(decoded.instructions, prsd.instructions);
        assert_eq!(decoded.token_name_list, prsd.token_name_list);
    }
}
