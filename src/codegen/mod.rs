//! Single-pass code generation. A pre-scan collects function names and
//! arities, then the statement compiler walks the source once more and emits
//! machine code straight into the code buffer. There is no AST: every
//! construct lowers to bytes the moment it is recognised, and forward
//! control transfers go through reserved displacement slots patched when
//! their targets are reached.

pub mod buffer;
pub mod x86_64;

use self::buffer::CodeBuffer;
use self::x86_64 as x86;
use crate::error::CompileError;
use crate::lexer::{is_ident_start, is_ws, Cursor};
use crate::symbols::{FuncTable, LoopStack, VarTable, MAX_PARAMS};
use tracing::{debug, trace};

/// Source files larger than this are rejected up front.
pub const MAX_SOURCE_LEN: usize = 1 << 20;
/// Upper bound on generated code.
pub const MAX_CODE_LEN: usize = 4 << 20;

/// Stack frame reserved by the program prologue.
const TOP_FRAME: u32 = 0x2000;
/// Stack frame reserved by every function prologue.
const FN_FRAME: u32 = 0x400;

const SYS_READ: i32 = 0;
const SYS_WRITE: i32 = 1;
const SYS_EXIT: i32 = 60;
const STDIN: i32 = 0;
const STDOUT: i32 = 1;

/// Compile Wave source into raw machine code for the ELF writer.
pub fn compile(source: &[u8]) -> Result<Vec<u8>, CompileError> {
    if source.len() > MAX_SOURCE_LEN {
        return Err(CompileError::CapacityError(format!(
            "source exceeds {} bytes",
            MAX_SOURCE_LEN
        )));
    }

    let mut compiler = Compiler::new(source);
    compiler.prescan()?;
    debug!(functions = compiler.funcs.len(), "pre-scan complete");

    compiler.cur.reset();
    compiler.emit_program()?;

    if compiler.buf.pending_patches() != 0 {
        return Err(CompileError::CodegenError(
            "unpatched displacement slots remain".to_string(),
        ));
    }
    if compiler.buf.len() > MAX_CODE_LEN {
        return Err(CompileError::CapacityError(format!(
            "generated code exceeds {} bytes",
            MAX_CODE_LEN
        )));
    }

    debug!(bytes = compiler.buf.len(), "code generation complete");
    Ok(compiler.buf.into_bytes())
}

/// Fixed-point tuning block set by `unified { ... }`. Compile-time state
/// only; nothing here reaches the emitted code.
struct UnifiedField {
    i: i64,
    e: i64,
    r: i64,
}

struct Compiler<'a> {
    cur: Cursor<'a>,
    buf: CodeBuffer,
    vars: VarTable,
    funcs: FuncTable,
    loops: LoopStack,
    field: UnifiedField,
    fate_mode: bool,
    frame_size: u32,
}

enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Cmp(x86::Cond),
}

impl<'a> Compiler<'a> {
    fn new(source: &'a [u8]) -> Self {
        Self {
            cur: Cursor::new(source),
            buf: CodeBuffer::new(source.len().max(4096) * 4),
            vars: VarTable::new(),
            funcs: FuncTable::new(),
            loops: LoopStack::new(),
            field: UnifiedField { i: 0, e: 0, r: 0 },
            fate_mode: false,
            frame_size: TOP_FRAME,
        }
    }

    // First pass: record every `fn` name and parameter list so call sites
    // can be compiled before their callee's body is reached. Bodies are
    // skipped by brace counting; comments and string literals are honoured
    // so their contents cannot fake a declaration.
    fn prescan(&mut self) -> Result<(), CompileError> {
        loop {
            self.cur.skip_ws();
            match self.cur.peek() {
                0 => return Ok(()),
                b'#' => self.cur.skip_line(),
                b'"' => self.cur.skip_string_raw()?,
                _ if self.cur.probe_kw_ws("fn") => {
                    self.cur.consume(2);
                    let (name, params) = self.parse_fn_header()?;
                    trace!(name = %name, arity = params.len(), "function declared");
                    self.funcs.declare(&name, params)?;
                    self.skip_fn_body()?;
                }
                b if is_ident_start(b) => {
                    self.cur.parse_ident();
                }
                _ => {
                    self.cur.advance();
                }
            }
        }
    }

    /// Parse `NAME PARAM...` up to and including the opening brace.
    fn parse_fn_header(&mut self) -> Result<(String, Vec<String>), CompileError> {
        self.cur.skip_ws();
        if !is_ident_start(self.cur.peek()) {
            return Err(CompileError::SyntaxError(
                "expected function name after fn".to_string(),
            ));
        }
        let name = self.cur.parse_ident();
        let mut params = Vec::new();
        loop {
            self.cur.skip_ws();
            match self.cur.peek() {
                b'{' => {
                    self.cur.advance();
                    return Ok((name, params));
                }
                0 => {
                    return Err(CompileError::SyntaxError(format!(
                        "missing '{{' in function {}",
                        name
                    )))
                }
                b if is_ident_start(b) => {
                    if params.len() >= MAX_PARAMS {
                        return Err(CompileError::CapacityError(format!(
                            "too many parameters in function {} (limit {})",
                            name, MAX_PARAMS
                        )));
                    }
                    params.push(self.cur.parse_ident());
                }
                _ => {
                    return Err(CompileError::SyntaxError(format!(
                        "expected parameter name or '{{' in function {}",
                        name
                    )))
                }
            }
        }
    }

    /// Skip a function body during pre-scan. The opening brace has been
    /// consumed.
    fn skip_fn_body(&mut self) -> Result<(), CompileError> {
        let mut depth = 1usize;
        loop {
            match self.cur.peek() {
                0 => {
                    return Err(CompileError::SyntaxError(
                        "missing '}' at end of function".to_string(),
                    ))
                }
                b'#' => self.cur.skip_line(),
                b'"' => self.cur.skip_string_raw()?,
                b'{' => {
                    self.cur.advance();
                    depth += 1;
                }
                b'}' => {
                    self.cur.advance();
                    depth -= 1;
                    if depth == 0 {
                        return Ok(());
                    }
                }
                _ => {
                    self.cur.advance();
                }
            }
        }
    }

    // Second pass: the program prologue, every top-level statement in
    // source order, then a final exit so control never runs off the end.
    fn emit_program(&mut self) -> Result<(), CompileError> {
        x86::push_rbp(&mut self.buf);
        x86::mov_rbp_rsp(&mut self.buf);
        x86::sub_rsp_imm32(&mut self.buf, TOP_FRAME);

        loop {
            self.check_code_cap()?;
            self.cur.skip_ws();
            if self.cur.at_eof() {
                break;
            }
            self.compile_statement()?;
        }

        x86::mov_rdi_imm32(&mut self.buf, 0);
        x86::mov_rax_imm32(&mut self.buf, SYS_EXIT);
        x86::syscall(&mut self.buf);
        Ok(())
    }

    fn check_code_cap(&self) -> Result<(), CompileError> {
        if self.buf.len() > MAX_CODE_LEN {
            return Err(CompileError::CapacityError(format!(
                "generated code exceeds {} bytes",
                MAX_CODE_LEN
            )));
        }
        Ok(())
    }

    /// Compile statements until the closing brace of the current block.
    fn compile_block(&mut self) -> Result<(), CompileError> {
        loop {
            self.check_code_cap()?;
            self.cur.skip_ws();
            match self.cur.peek() {
                0 => {
                    return Err(CompileError::SyntaxError(
                        "missing '}' at end of block".to_string(),
                    ))
                }
                b'}' => {
                    self.cur.advance();
                    return Ok(());
                }
                _ => self.compile_statement()?,
            }
        }
    }

    fn expect_byte(&mut self, want: u8) -> Result<(), CompileError> {
        self.cur.skip_ws();
        if self.cur.peek() == want {
            self.cur.advance();
            Ok(())
        } else {
            Err(CompileError::SyntaxError(format!(
                "expected '{}'",
                want as char
            )))
        }
    }

    // Statement dispatch. Keyword probes inspect the raw bytes at the
    // cursor; `out` and `fn` demand a delimiter because an identifier may
    // start with them, the rest match on prefix alone and the handler
    // consumes the exact keyword length.
    fn compile_statement(&mut self) -> Result<(), CompileError> {
        if self.cur.peek() == b'#' {
            self.cur.skip_line();
            return Ok(());
        }
        if self.cur.probe("out")
            && (is_ws(self.cur.peek_at(3)) || self.cur.peek_at(3) == b'"')
        {
            self.cur.consume(3);
            return self.compile_string_output();
        }
        if self.cur.probe("emit") {
            self.cur.consume(4);
            return self.compile_string_output();
        }
        if self.cur.probe("byte") {
            self.cur.consume(4);
            return self.compile_write_byte();
        }
        if self.cur.probe("putchar") {
            self.cur.consume(7);
            return self.compile_write_byte();
        }
        if self.cur.probe("getchar") {
            self.cur.consume(7);
            self.expect_byte(b'(')?;
            self.expect_byte(b')')?;
            self.emit_getchar();
            return Ok(());
        }
        if self.cur.probe("syscall.exit") {
            self.cur.consume(12);
            self.expect_byte(b'(')?;
            self.compile_expr()?;
            self.expect_byte(b')')?;
            x86::mov_arg_from_rax(&mut self.buf, 0);
            x86::mov_rax_imm32(&mut self.buf, SYS_EXIT);
            x86::syscall(&mut self.buf);
            return Ok(());
        }
        if self.cur.probe("when") {
            self.cur.consume(4);
            return self.compile_when();
        }
        if self.cur.probe("loop") {
            self.cur.consume(4);
            return self.compile_loop();
        }
        if self.cur.probe("break") {
            self.cur.consume(5);
            let slot = x86::jmp_forward(&mut self.buf);
            return self.loops.add_break(slot);
        }
        if self.cur.probe("fate") {
            self.cur.consume(4);
            return self.compile_fate();
        }
        if self.cur.probe("unified") {
            self.cur.consume(7);
            return self.compile_unified();
        }
        if self.cur.probe_kw_ws("fn") {
            self.cur.consume(2);
            return self.compile_fn();
        }
        if self.cur.probe("->") {
            self.cur.consume(2);
            self.compile_expr()?;
            x86::add_rsp_imm32(&mut self.buf, self.frame_size);
            x86::pop_rbp(&mut self.buf);
            x86::ret(&mut self.buf);
            return Ok(());
        }

        if is_ident_start(self.cur.peek()) {
            let name = self.cur.parse_ident();
            self.cur.skip_inline_ws();
            if self.cur.peek() == b'=' && self.cur.peek_at(1) != b'=' {
                self.cur.advance();
                self.compile_expr()?;
                let offset = self.vars.lookup_or_define(&name)?;
                x86::store_local_rax(&mut self.buf, offset);
            } else if self.cur.peek() == b'(' {
                self.cur.advance();
                self.compile_call(&name)?;
            } else {
                trace!(token = %name, "skipping unrecognized line");
                self.cur.skip_line();
            }
            return Ok(());
        }

        // Anything else is an unrecognised line.
        self.cur.skip_line();
        Ok(())
    }

    /// `out` and `emit`: embed the literal behind a jump, then write it with
    /// a rip-relative source operand.
    fn compile_string_output(&mut self) -> Result<(), CompileError> {
        self.cur.skip_ws();
        if self.cur.peek() != b'"' {
            return Err(CompileError::SyntaxError(
                "expected string literal".to_string(),
            ));
        }
        let literal = self.cur.parse_string()?;

        let skip = x86::jmp_forward(&mut self.buf);
        let literal_offset = self.buf.offset();
        self.buf.emit_bytes(&literal);
        let after = self.buf.offset();
        self.buf.patch_rel32(skip, after)?;

        x86::mov_rax_imm32(&mut self.buf, SYS_WRITE);
        x86::mov_rdi_imm32(&mut self.buf, STDOUT);
        x86::lea_rsi_rip(&mut self.buf, literal_offset)?;
        x86::mov_rdx_imm32(&mut self.buf, literal.len() as i32);
        x86::syscall(&mut self.buf);
        Ok(())
    }

    /// `byte(expr)` / `putchar(expr)`: write the low byte of the value
    /// through a stack slot.
    fn compile_write_byte(&mut self) -> Result<(), CompileError> {
        self.expect_byte(b'(')?;
        self.compile_expr()?;
        self.expect_byte(b')')?;

        x86::push_rax(&mut self.buf);
        x86::store_al_rsp(&mut self.buf);
        x86::mov_rax_imm32(&mut self.buf, SYS_WRITE);
        x86::mov_rdi_imm32(&mut self.buf, STDOUT);
        x86::mov_rsi_rsp(&mut self.buf);
        x86::mov_rdx_imm32(&mut self.buf, 1);
        x86::syscall(&mut self.buf);
        x86::pop_rax(&mut self.buf);
        Ok(())
    }

    /// Inline `read(0, rsp, 1)` leaving the byte zero-extended in `rax`.
    /// The slot is pushed as zero, so end of input reads as 0.
    fn emit_getchar(&mut self) {
        x86::push_zero(&mut self.buf);
        x86::mov_rax_imm32(&mut self.buf, SYS_READ);
        x86::mov_rdi_imm32(&mut self.buf, STDIN);
        x86::mov_rsi_rsp(&mut self.buf);
        x86::mov_rdx_imm32(&mut self.buf, 1);
        x86::syscall(&mut self.buf);
        x86::movzx_rax_byte_rsp(&mut self.buf);
        x86::pop_rcx(&mut self.buf);
    }

    fn compile_when(&mut self) -> Result<(), CompileError> {
        self.compile_expr()?;
        x86::test_rax_rax(&mut self.buf);
        let end = x86::jz_forward(&mut self.buf);
        self.expect_byte(b'{')?;
        self.compile_block()?;
        let target = self.buf.offset();
        self.buf.patch_rel32(end, target)
    }

    fn compile_loop(&mut self) -> Result<(), CompileError> {
        self.expect_byte(b'{')?;
        let start = self.buf.offset();
        self.loops.push(start)?;
        trace!(depth = self.loops.depth(), start, "loop opened");

        self.compile_block()?;
        let frame = self
            .loops
            .pop()
            .ok_or_else(|| CompileError::CodegenError("loop stack underflow".to_string()))?;
        x86::jmp_to(&mut self.buf, frame.start)?;
        let exit = self.buf.offset();
        for slot in frame.breaks {
            self.buf.patch_rel32(slot, exit)?;
        }
        Ok(())
    }

    fn compile_fn(&mut self) -> Result<(), CompileError> {
        let (name, parsed_params) = self.parse_fn_header()?;

        let skip = x86::jmp_forward(&mut self.buf);
        let entry = self.buf.offset();
        let fixups = self.funcs.define(&name, entry, parsed_params)?;
        for slot in fixups {
            self.buf.patch_rel32(slot, entry)?;
        }
        let index = self
            .funcs
            .index_of(&name)
            .ok_or_else(|| CompileError::CodegenError("missing function entry".to_string()))?;
        let params = self.funcs.params_of(index);
        debug!(name = %name, entry, arity = params.len(), "function body");

        let mark = self.vars.enter_scope();
        let saved_frame = self.frame_size;
        self.frame_size = FN_FRAME;

        x86::push_rbp(&mut self.buf);
        x86::mov_rbp_rsp(&mut self.buf);
        x86::sub_rsp_imm32(&mut self.buf, FN_FRAME);
        for (i, param) in params.iter().take(x86::MAX_CALL_ARGS).enumerate() {
            let offset = self.vars.define(param)?;
            x86::spill_param(&mut self.buf, i, offset);
        }

        self.compile_block()?;

        // Default return value for bodies that never reach `->`.
        x86::xor_rax_rax(&mut self.buf);
        x86::add_rsp_imm32(&mut self.buf, FN_FRAME);
        x86::pop_rbp(&mut self.buf);
        x86::ret(&mut self.buf);

        self.vars.exit_scope(mark);
        self.frame_size = saved_frame;
        self.buf.patch_rel32(skip, self.buf.offset())
    }

    /// Call with up to four register arguments. The opening parenthesis has
    /// been consumed; the callee name decides the displacement strategy.
    fn compile_call(&mut self, name: &str) -> Result<(), CompileError> {
        let mut argc = 0usize;
        self.cur.skip_ws();
        if self.cur.peek() == b')' {
            self.cur.advance();
        } else {
            loop {
                if argc >= x86::MAX_CALL_ARGS {
                    return Err(CompileError::CapacityError(format!(
                        "too many arguments in call to {} (limit {})",
                        name,
                        x86::MAX_CALL_ARGS
                    )));
                }
                self.compile_expr()?;
                x86::mov_arg_from_rax(&mut self.buf, argc);
                argc += 1;
                self.cur.skip_ws();
                match self.cur.advance() {
                    b',' => continue,
                    b')' => break,
                    _ => {
                        return Err(CompileError::SyntaxError(format!(
                            "expected ',' or ')' in call to {}",
                            name
                        )))
                    }
                }
            }
        }

        match self.funcs.index_of(name) {
            Some(index) => match self.funcs.entry_of(index) {
                Some(entry) => x86::call_to(&mut self.buf, entry)?,
                None => {
                    // Callee body not reached yet; patched when it is.
                    let slot = x86::call_forward(&mut self.buf);
                    self.funcs.add_fixup(index, slot);
                }
            },
            None => {
                trace!(callee = %name, "call to undefined function");
                x86::call_unresolved(&mut self.buf);
            }
        }
        Ok(())
    }

    /// `unified { i: F, e: F, r: F }`: fixed-point tuning state, no code.
    fn compile_unified(&mut self) -> Result<(), CompileError> {
        self.expect_byte(b'{')?;
        loop {
            self.cur.skip_ws();
            match self.cur.peek() {
                b'}' => {
                    self.cur.advance();
                    break;
                }
                0 => {
                    return Err(CompileError::SyntaxError(
                        "missing '}' in unified block".to_string(),
                    ))
                }
                b if is_ident_start(b) => {
                    let key = self.cur.parse_ident();
                    self.expect_byte(b':')?;
                    self.cur.skip_ws();
                    if !self.cur.peek().is_ascii_digit() {
                        return Err(CompileError::SyntaxError(format!(
                            "expected number for unified field {}",
                            key
                        )));
                    }
                    let value = self.cur.parse_float_fixed();
                    match key.as_str() {
                        "i" => self.field.i = value,
                        "e" => self.field.e = value,
                        "r" => self.field.r = value,
                        other => {
                            return Err(CompileError::SyntaxError(format!(
                                "unknown unified field: {}",
                                other
                            )))
                        }
                    }
                    self.cur.skip_ws();
                    if self.cur.peek() == b',' {
                        self.cur.advance();
                    }
                }
                _ => {
                    return Err(CompileError::SyntaxError(
                        "expected field name in unified block".to_string(),
                    ))
                }
            }
        }
        debug!(
            i = self.field.i,
            e = self.field.e,
            r = self.field.r,
            "unified field updated"
        );
        Ok(())
    }

    /// `fate on|off`: compile-time toggle, no code.
    fn compile_fate(&mut self) -> Result<(), CompileError> {
        self.cur.skip_ws();
        if !is_ident_start(self.cur.peek()) {
            return Err(CompileError::SyntaxError(
                "expected on or off after fate".to_string(),
            ));
        }
        let mode = self.cur.parse_ident();
        match mode.as_str() {
            "on" => self.fate_mode = true,
            "off" => self.fate_mode = false,
            other => {
                return Err(CompileError::SyntaxError(format!(
                    "expected on or off after fate, got {}",
                    other
                )))
            }
        }
        debug!(enabled = self.fate_mode, "fate mode updated");
        Ok(())
    }

    // Flat-precedence expression compiler. Terms land in rax; for each
    // operator the left value is pushed, the right term compiled, the left
    // popped into rcx, and the operation applied. Strictly left to right,
    // every operator at the same precedence.
    fn compile_expr(&mut self) -> Result<(), CompileError> {
        self.compile_term()?;
        loop {
            self.cur.skip_ws();
            let op = match self.cur.peek() {
                b'+' => {
                    self.cur.advance();
                    BinOp::Add
                }
                // A minus is an operator unless it introduces `->`.
                b'-' if self.cur.peek_at(1) != b'>' => {
                    self.cur.advance();
                    BinOp::Sub
                }
                b'*' => {
                    self.cur.advance();
                    BinOp::Mul
                }
                b'/' => {
                    self.cur.advance();
                    BinOp::Div
                }
                b'=' if self.cur.peek_at(1) == b'=' => {
                    self.cur.consume(2);
                    BinOp::Cmp(x86::Cond::Eq)
                }
                b'!' if self.cur.peek_at(1) == b'=' => {
                    self.cur.consume(2);
                    BinOp::Cmp(x86::Cond::Ne)
                }
                b'>' if self.cur.peek_at(1) == b'=' => {
                    self.cur.consume(2);
                    BinOp::Cmp(x86::Cond::Ge)
                }
                b'>' => {
                    self.cur.advance();
                    BinOp::Cmp(x86::Cond::Gt)
                }
                b'<' if self.cur.peek_at(1) == b'=' => {
                    self.cur.consume(2);
                    BinOp::Cmp(x86::Cond::Le)
                }
                b'<' => {
                    self.cur.advance();
                    BinOp::Cmp(x86::Cond::Lt)
                }
                _ => return Ok(()),
            };

            x86::push_rax(&mut self.buf);
            self.compile_term()?;
            x86::pop_rcx(&mut self.buf);
            self.emit_binop(op);
        }
    }

    fn emit_binop(&mut self, op: BinOp) {
        match op {
            BinOp::Add => x86::add_rax_rcx(&mut self.buf),
            BinOp::Sub => {
                // Left is in rcx, right in rax; swap so rax - rcx applies.
                x86::xchg_rax_rcx(&mut self.buf);
                x86::sub_rax_rcx(&mut self.buf);
            }
            BinOp::Mul => x86::imul_rax_rcx(&mut self.buf),
            BinOp::Div => {
                x86::xchg_rax_rcx(&mut self.buf);
                x86::cqo_idiv_rcx(&mut self.buf);
            }
            BinOp::Cmp(cond) => x86::cmp_rcx_rax_setcc(&mut self.buf, cond),
        }
    }

    fn compile_term(&mut self) -> Result<(), CompileError> {
        self.cur.skip_ws();
        let b = self.cur.peek();

        if b.is_ascii_digit() || (b == b'-' && self.cur.peek_at(1).is_ascii_digit()) {
            let value = self.cur.parse_number();
            match i32::try_from(value) {
                Ok(small) => x86::mov_rax_imm32(&mut self.buf, small),
                Err(_) => x86::mov_rax_imm64(&mut self.buf, value),
            }
            return Ok(());
        }

        if is_ident_start(b) {
            let name = self.cur.parse_ident();
            if name == "getchar" {
                self.expect_byte(b'(')?;
                self.expect_byte(b')')?;
                self.emit_getchar();
                return Ok(());
            }
            if self.cur.peek() == b'(' {
                self.cur.advance();
                return self.compile_call(&name);
            }
            match self.vars.lookup(&name) {
                Some(offset) => x86::load_local_rax(&mut self.buf, offset),
                None => {
                    // Unknown names read as zero rather than failing.
                    trace!(name = %name, "unknown identifier in expression");
                    x86::xor_rax_rax(&mut self.buf);
                }
            }
            return Ok(());
        }

        Err(CompileError::SyntaxError(
            "expected expression term".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_src(src: &str) -> Vec<u8> {
        compile(src.as_bytes()).unwrap()
    }

    fn emitted(f: impl FnOnce(&mut CodeBuffer)) -> Vec<u8> {
        let mut buf = CodeBuffer::new(256);
        f(&mut buf);
        buf.into_bytes()
    }

    fn program_prologue() -> Vec<u8> {
        emitted(|buf| {
            x86::push_rbp(buf);
            x86::mov_rbp_rsp(buf);
            x86::sub_rsp_imm32(buf, TOP_FRAME);
        })
    }

    fn exit_zero_tail() -> Vec<u8> {
        emitted(|buf| {
            x86::mov_rdi_imm32(buf, 0);
            x86::mov_rax_imm32(buf, SYS_EXIT);
            x86::syscall(buf);
        })
    }

    fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack.windows(needle.len()).position(|w| w == needle)
    }

    fn read_i32(bytes: &[u8], at: usize) -> i32 {
        i32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())
    }

    #[test]
    fn empty_source_is_prologue_plus_exit() {
        let code = compile_src("");
        let mut expected = program_prologue();
        expected.extend(exit_zero_tail());
        assert_eq!(code, expected);
    }

    #[test]
    fn comments_and_junk_lines_emit_nothing() {
        let code = compile_src("# just a comment\n???\nwords with no meaning\n");
        assert_eq!(code, compile_src(""));
    }

    #[test]
    fn out_embeds_literal_behind_a_jump() {
        let code = compile_src("out \"Hi\\n\"");
        let base = program_prologue().len();

        // Jump over the 3 literal bytes.
        assert_eq!(code[base], 0xE9);
        assert_eq!(read_i32(&code, base + 1), 3);
        assert_eq!(&code[base + 5..base + 8], b"Hi\n");

        // write(1, literal, 3) with a backward rip displacement.
        let tail = emitted(|buf| {
            x86::mov_rax_imm32(buf, 1);
            x86::mov_rdi_imm32(buf, 1);
        });
        assert_eq!(&code[base + 8..base + 8 + tail.len()], &tail[..]);
        let lea_at = base + 8 + tail.len();
        assert_eq!(&code[lea_at..lea_at + 3], &[0x48, 0x8D, 0x35]);
        let disp = read_i32(&code, lea_at + 3);
        assert_eq!(lea_at as i64 + 7 + disp as i64, (base + 5) as i64);
    }

    #[test]
    fn emit_matches_out_byte_for_byte() {
        assert_eq!(compile_src("emit \"AB\""), compile_src("out \"AB\""));
    }

    #[test]
    fn arithmetic_is_flat_left_to_right() {
        let code = compile_src("x = 2 + 3 * 4");
        let expected = emitted(|buf| {
            x86::mov_rax_imm32(buf, 2);
            x86::push_rax(buf);
            x86::mov_rax_imm32(buf, 3);
            x86::pop_rcx(buf);
            x86::add_rax_rcx(buf);
            x86::push_rax(buf);
            x86::mov_rax_imm32(buf, 4);
            x86::pop_rcx(buf);
            x86::imul_rax_rcx(buf);
            x86::store_local_rax(buf, 8);
        });
        let base = program_prologue().len();
        assert_eq!(&code[base..base + expected.len()], &expected[..]);
    }

    #[test]
    fn subtraction_and_division_swap_operands() {
        let code = compile_src("x = 10 - 4 / 2");
        let expected = emitted(|buf| {
            x86::mov_rax_imm32(buf, 10);
            x86::push_rax(buf);
            x86::mov_rax_imm32(buf, 4);
            x86::pop_rcx(buf);
            x86::xchg_rax_rcx(buf);
            x86::sub_rax_rcx(buf);
            x86::push_rax(buf);
            x86::mov_rax_imm32(buf, 2);
            x86::pop_rcx(buf);
            x86::xchg_rax_rcx(buf);
            x86::cqo_idiv_rcx(buf);
            x86::store_local_rax(buf, 8);
        });
        let base = program_prologue().len();
        assert_eq!(&code[base..base + expected.len()], &expected[..]);
    }

    #[test]
    fn comparison_yields_a_flag() {
        let code = compile_src("x = 1 < 2");
        assert!(find(
            &code,
            &[0x48, 0x39, 0xC1, 0x0F, 0x9C, 0xC0, 0x48, 0x0F, 0xB6, 0xC0]
        )
        .is_some());
    }

    #[test]
    fn large_literals_use_the_imm64_form() {
        let code = compile_src("x = 5000000000");
        let expected = emitted(|buf| x86::mov_rax_imm64(buf, 5_000_000_000));
        assert!(find(&code, &expected).is_some());
    }

    #[test]
    fn variables_reuse_their_slots() {
        let code = compile_src("x = 1\ny = 2\nx = 3");
        let stores: Vec<usize> = code
            .windows(3)
            .enumerate()
            .filter(|(_, w)| *w == [0x48, 0x89, 0x85])
            .map(|(i, _)| i)
            .collect();
        assert_eq!(stores.len(), 3);
        assert_eq!(read_i32(&code, stores[0] + 3), -8);
        assert_eq!(read_i32(&code, stores[1] + 3), -16);
        assert_eq!(read_i32(&code, stores[2] + 3), -8);
    }

    #[test]
    fn unknown_identifier_reads_as_zero() {
        let code = compile_src("x = nothing");
        let expected = emitted(|buf| {
            x86::xor_rax_rax(buf);
            x86::store_local_rax(buf, 8);
        });
        let base = program_prologue().len();
        assert_eq!(&code[base..base + expected.len()], &expected[..]);
    }

    #[test]
    fn when_jumps_over_exactly_the_body() {
        let code = compile_src("when 1 { byte(48) }");
        let jz_at = find(&code, &[0x0F, 0x84]).unwrap();
        let disp = read_i32(&code, jz_at + 2);

        let body = emitted(|buf| {
            x86::mov_rax_imm32(buf, 48);
            x86::push_rax(buf);
            x86::store_al_rsp(buf);
            x86::mov_rax_imm32(buf, 1);
            x86::mov_rdi_imm32(buf, 1);
            x86::mov_rsi_rsp(buf);
            x86::mov_rdx_imm32(buf, 1);
            x86::syscall(buf);
            x86::pop_rax(buf);
        });
        assert_eq!(disp as usize, body.len());
        assert_eq!(&code[jz_at + 6..jz_at + 6 + body.len()], &body[..]);
    }

    #[test]
    fn empty_when_body_patches_to_zero() {
        let code = compile_src("when 1 { }");
        assert!(find(&code, &[0x0F, 0x84, 0x00, 0x00, 0x00, 0x00]).is_some());
    }

    #[test]
    fn loop_break_lands_after_the_back_edge() {
        let code = compile_src("loop { break }");
        // break jumps 5 bytes forward, past the back edge that jumps 10 back.
        let expected = [0xE9, 0x05, 0x00, 0x00, 0x00, 0xE9, 0xF6, 0xFF, 0xFF, 0xFF];
        assert!(find(&code, &expected).is_some());
    }

    #[test]
    fn nested_loops_patch_their_own_breaks() {
        let code = compile_src("loop { loop { break } break }");
        // Inner break and back edge, then the outer pair. Both loops share
        // the same start offset, so the outer back edge spans all 20 bytes.
        let expected = [
            0xE9, 0x05, 0x00, 0x00, 0x00, // inner break
            0xE9, 0xF6, 0xFF, 0xFF, 0xFF, // inner back edge (-10)
            0xE9, 0x05, 0x00, 0x00, 0x00, // outer break
            0xE9, 0xEC, 0xFF, 0xFF, 0xFF, // outer back edge (-20)
        ];
        assert!(find(&code, &expected).is_some());
    }

    #[test]
    fn break_outside_loop_fails() {
        assert!(matches!(
            compile(b"break"),
            Err(CompileError::SyntaxError(_))
        ));
    }

    #[test]
    fn function_body_is_skipped_and_called() {
        let code = compile_src("fn one { -> 1 }\none()");
        let base = program_prologue().len();

        // Skip jump over the body, then the prologue at the entry.
        assert_eq!(code[base], 0xE9);
        let entry = base + 5;
        assert_eq!(&code[entry..entry + 4], &[0x55, 0x48, 0x89, 0xE5]);

        // The call site targets the entry.
        let call_at = entry + find(&code[entry..], &[0xE8]).unwrap();
        let disp = read_i32(&code, call_at + 1);
        assert_eq!(call_at as i64 + 5 + disp as i64, entry as i64);
    }

    #[test]
    fn forward_call_is_patched_when_the_body_arrives() {
        let code = compile_src("ping()\nfn ping { }");
        let base = program_prologue().len();

        assert_eq!(code[base], 0xE8);
        let disp = read_i32(&code, base + 1);
        let target = (base as i64 + 5 + disp as i64) as usize;
        assert_eq!(code[target], 0x55);
    }

    #[test]
    fn call_to_unknown_function_keeps_zero_displacement() {
        let code = compile_src("nowhere(1)");
        assert!(find(&code, &[0xE8, 0x00, 0x00, 0x00, 0x00]).is_some());
    }

    #[test]
    fn parameters_spill_into_the_frame() {
        let code = compile_src("fn add a b { -> a + b }");
        let spills = emitted(|buf| {
            x86::spill_param(buf, 0, 8);
            x86::spill_param(buf, 1, 16);
        });
        assert!(find(&code, &spills).is_some());

        let body = emitted(|buf| {
            x86::load_local_rax(buf, 8);
            x86::push_rax(buf);
            x86::load_local_rax(buf, 16);
            x86::pop_rcx(buf);
            x86::add_rax_rcx(buf);
            x86::add_rsp_imm32(buf, FN_FRAME);
            x86::pop_rbp(buf);
            x86::ret(buf);
        });
        assert!(find(&code, &body).is_some());
    }

    #[test]
    fn function_scope_does_not_leak_into_top_level() {
        // `a` inside the function is a parameter; the later top-level `a`
        // must get the first top-level slot, not the parameter's.
        let code = compile_src("x = 1\nfn f a { -> a }\na = 2\n");
        let stores: Vec<usize> = code
            .windows(3)
            .enumerate()
            .filter(|(_, w)| *w == [0x48, 0x89, 0x85])
            .map(|(i, _)| i)
            .collect();
        // x at -8, then a at -16 in the top-level scope.
        assert_eq!(read_i32(&code, stores[0] + 3), -8);
        assert_eq!(read_i32(&code, *stores.last().unwrap() + 3), -16);
    }

    #[test]
    fn call_arguments_fill_registers_left_to_right() {
        let code = compile_src("fn f a b { }\nf(7, 8)");
        let args = emitted(|buf| {
            x86::mov_rax_imm32(buf, 7);
            x86::mov_arg_from_rax(buf, 0);
            x86::mov_rax_imm32(buf, 8);
            x86::mov_arg_from_rax(buf, 1);
        });
        assert!(find(&code, &args).is_some());
    }

    #[test]
    fn too_many_call_arguments_fail() {
        assert!(matches!(
            compile(b"f(1, 2, 3, 4, 5)"),
            Err(CompileError::CapacityError(_))
        ));
    }

    #[test]
    fn syscall_exit_moves_the_status() {
        let code = compile_src("syscall.exit(7)");
        let expected = emitted(|buf| {
            x86::mov_rax_imm32(buf, 7);
            x86::mov_arg_from_rax(buf, 0);
            x86::mov_rax_imm32(buf, 60);
            x86::syscall(buf);
        });
        assert!(find(&code, &expected).is_some());
    }

    #[test]
    fn getchar_reads_through_a_zeroed_slot() {
        let code = compile_src("x = getchar()");
        let expected = emitted(|buf| {
            x86::push_zero(buf);
            x86::mov_rax_imm32(buf, 0);
            x86::mov_rdi_imm32(buf, 0);
            x86::mov_rsi_rsp(buf);
            x86::mov_rdx_imm32(buf, 1);
            x86::syscall(buf);
            x86::movzx_rax_byte_rsp(buf);
            x86::pop_rcx(buf);
        });
        assert!(find(&code, &expected).is_some());
    }

    #[test]
    fn getchar_statement_matches_expression_form() {
        let a = compile_src("getchar()");
        let b = compile_src("x = getchar()");
        // Same read sequence; the assignment just adds the store.
        let read_seq = emitted(|buf| {
            x86::push_zero(buf);
            x86::mov_rax_imm32(buf, 0);
        });
        assert!(find(&a, &read_seq).is_some());
        assert!(find(&b, &read_seq).is_some());
    }

    #[test]
    fn unified_and_fate_emit_no_code() {
        let plain = compile_src("");
        assert_eq!(
            compile_src("unified { i: 1.5, e: 0.25, r: 2 }\nfate on\nfate off"),
            plain
        );
    }

    #[test]
    fn unified_rejects_unknown_fields() {
        assert!(matches!(
            compile(b"unified { q: 1.0 }"),
            Err(CompileError::SyntaxError(_))
        ));
    }

    #[test]
    fn fate_requires_a_mode() {
        assert!(matches!(
            compile(b"fate maybe"),
            Err(CompileError::SyntaxError(_))
        ));
    }

    #[test]
    fn unterminated_string_aborts() {
        assert!(matches!(
            compile(b"out \"oops"),
            Err(CompileError::SyntaxError(_))
        ));
    }

    #[test]
    fn duplicate_functions_abort() {
        assert!(matches!(
            compile(b"fn f { }\nfn f { }"),
            Err(CompileError::SyntaxError(_))
        ));
    }

    #[test]
    fn fn_inside_string_is_not_a_declaration() {
        let code = compile_src("out \"fn fake {\"\nsyscall.exit(0)");
        assert!(find(&code, b"fn fake {").is_some());
    }

    #[test]
    fn oversized_source_is_rejected() {
        let big = vec![b' '; MAX_SOURCE_LEN + 1];
        assert!(matches!(
            compile(&big),
            Err(CompileError::CapacityError(_))
        ));
    }

    #[test]
    fn compilation_is_deterministic() {
        let src = "i = 0\nloop { i = i + 1\nbyte(48 + i)\nwhen i >= 5 { break } }\nsyscall.exit(0)";
        assert_eq!(compile_src(src), compile_src(src));
    }

    #[test]
    fn return_after_assignment_is_not_subtraction() {
        // The minus of `->` must not be taken for an operator on the
        // previous expression.
        let code = compile_src("fn f {\nx = 1\n-> x\n}");
        let ret_seq = emitted(|buf| {
            x86::load_local_rax(buf, 8);
            x86::add_rsp_imm32(buf, FN_FRAME);
            x86::pop_rbp(buf);
            x86::ret(buf);
        });
        assert!(find(&code, &ret_seq).is_some());
    }
}
