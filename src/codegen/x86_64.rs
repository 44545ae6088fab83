//! x86-64 instruction emitters. Each helper writes one fixed encoding into
//! the code buffer; displacement-bearing forms either take a known target or
//! reserve a 4-byte slot for a later patch.
//!
//! Register discipline: expression results live in `rax`, stashed left
//! operands in `rcx`, call arguments in `rdi`/`rsi`/`rdx`/`rcx` per the
//! System V ABI.

use super::buffer::CodeBuffer;
use crate::error::CompileError;

/// Call arguments handled in registers.
pub const MAX_CALL_ARGS: usize = 4;

pub fn push_rbp(buf: &mut CodeBuffer) {
    buf.emit_u8(0x55); // push rbp
}

pub fn mov_rbp_rsp(buf: &mut CodeBuffer) {
    buf.emit_bytes(&[0x48, 0x89, 0xE5]); // mov rbp, rsp
}

pub fn sub_rsp_imm32(buf: &mut CodeBuffer, bytes: u32) {
    buf.emit_bytes(&[0x48, 0x81, 0xEC]); // sub rsp, imm32
    buf.emit_u32(bytes);
}

pub fn add_rsp_imm32(buf: &mut CodeBuffer, bytes: u32) {
    buf.emit_bytes(&[0x48, 0x81, 0xC4]); // add rsp, imm32
    buf.emit_u32(bytes);
}

pub fn pop_rbp(buf: &mut CodeBuffer) {
    buf.emit_u8(0x5D); // pop rbp
}

pub fn ret(buf: &mut CodeBuffer) {
    buf.emit_u8(0xC3); // ret
}

fn mov_imm32(buf: &mut CodeBuffer, modrm: u8, value: i32) {
    buf.emit_bytes(&[0x48, 0xC7, modrm]); // mov r64, imm32 (sign-extended)
    buf.emit_u32(value as u32);
}

pub fn mov_rax_imm32(buf: &mut CodeBuffer, value: i32) {
    mov_imm32(buf, 0xC0, value);
}

pub fn mov_rdi_imm32(buf: &mut CodeBuffer, value: i32) {
    mov_imm32(buf, 0xC7, value);
}

pub fn mov_rdx_imm32(buf: &mut CodeBuffer, value: i32) {
    mov_imm32(buf, 0xC2, value);
}

pub fn mov_rax_imm64(buf: &mut CodeBuffer, value: i64) {
    buf.emit_bytes(&[0x48, 0xB8]); // movabs rax, imm64
    buf.emit_u64(value as u64);
}

/// `mov [rbp - frame_offset], rax`
pub fn store_local_rax(buf: &mut CodeBuffer, frame_offset: u32) {
    buf.emit_bytes(&[0x48, 0x89, 0x85]); // mov [rbp+disp32], rax
    buf.emit_u32((frame_offset as i32).wrapping_neg() as u32);
}

/// `mov rax, [rbp - frame_offset]`
pub fn load_local_rax(buf: &mut CodeBuffer, frame_offset: u32) {
    buf.emit_bytes(&[0x48, 0x8B, 0x85]); // mov rax, [rbp+disp32]
    buf.emit_u32((frame_offset as i32).wrapping_neg() as u32);
}

// ModRM bytes for [rbp+disp32] stores from rdi, rsi, rdx, rcx.
const PARAM_SPILL_MODRM: [u8; MAX_CALL_ARGS] = [0xBD, 0xB5, 0x95, 0x8D];

/// Spill the n-th argument register into its parameter slot.
pub fn spill_param(buf: &mut CodeBuffer, index: usize, frame_offset: u32) {
    buf.emit_bytes(&[0x48, 0x89, PARAM_SPILL_MODRM[index]]);
    buf.emit_u32((frame_offset as i32).wrapping_neg() as u32);
}

// ModRM bytes for mov {rdi,rsi,rdx,rcx}, rax.
const ARG_FROM_RAX_MODRM: [u8; MAX_CALL_ARGS] = [0xC7, 0xC6, 0xC2, 0xC1];

/// Move `rax` into the n-th argument register.
pub fn mov_arg_from_rax(buf: &mut CodeBuffer, index: usize) {
    buf.emit_bytes(&[0x48, 0x89, ARG_FROM_RAX_MODRM[index]]);
}

pub fn push_rax(buf: &mut CodeBuffer) {
    buf.emit_u8(0x50); // push rax
}

pub fn pop_rax(buf: &mut CodeBuffer) {
    buf.emit_u8(0x58); // pop rax
}

pub fn pop_rcx(buf: &mut CodeBuffer) {
    buf.emit_u8(0x59); // pop rcx
}

/// Push a zeroed 8-byte slot.
pub fn push_zero(buf: &mut CodeBuffer) {
    buf.emit_bytes(&[0x6A, 0x00]); // push 0
}

pub fn xchg_rax_rcx(buf: &mut CodeBuffer) {
    buf.emit_bytes(&[0x48, 0x91]); // xchg rax, rcx
}

pub fn add_rax_rcx(buf: &mut CodeBuffer) {
    buf.emit_bytes(&[0x48, 0x01, 0xC8]); // add rax, rcx
}

pub fn sub_rax_rcx(buf: &mut CodeBuffer) {
    buf.emit_bytes(&[0x48, 0x29, 0xC8]); // sub rax, rcx
}

pub fn imul_rax_rcx(buf: &mut CodeBuffer) {
    buf.emit_bytes(&[0x48, 0x0F, 0xAF, 0xC1]); // imul rax, rcx
}

/// Signed division of `rax` by `rcx`, quotient in `rax`. `cqo` sign-extends
/// the dividend into `rdx` first.
pub fn cqo_idiv_rcx(buf: &mut CodeBuffer) {
    buf.emit_bytes(&[0x48, 0x99]); // cqo
    buf.emit_bytes(&[0x48, 0xF7, 0xF9]); // idiv rcx
}

pub fn xor_rax_rax(buf: &mut CodeBuffer) {
    buf.emit_bytes(&[0x48, 0x31, 0xC0]); // xor rax, rax
}

pub fn test_rax_rax(buf: &mut CodeBuffer) {
    buf.emit_bytes(&[0x48, 0x85, 0xC0]); // test rax, rax
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cond {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl Cond {
    fn setcc_opcode(self) -> u8 {
        match self {
            Cond::Eq => 0x94, // sete
            Cond::Ne => 0x95, // setne
            Cond::Gt => 0x9F, // setg
            Cond::Ge => 0x9D, // setge
            Cond::Lt => 0x9C, // setl
            Cond::Le => 0x9E, // setle
        }
    }
}

/// Compare left (`rcx`) against right (`rax`) and materialise the result as
/// 0 or 1 in `rax`.
pub fn cmp_rcx_rax_setcc(buf: &mut CodeBuffer, cond: Cond) {
    buf.emit_bytes(&[0x48, 0x39, 0xC1]); // cmp rcx, rax
    buf.emit_bytes(&[0x0F, cond.setcc_opcode(), 0xC0]); // setcc al
    buf.emit_bytes(&[0x48, 0x0F, 0xB6, 0xC0]); // movzx rax, al
}

fn rel32_to(buf: &mut CodeBuffer, target: usize) -> Result<(), CompileError> {
    let disp = target as i64 - (buf.offset() as i64 + 4);
    if disp < i32::MIN as i64 || disp > i32::MAX as i64 {
        return Err(CompileError::CodegenError(
            "branch displacement out of range".to_string(),
        ));
    }
    buf.emit_u32(disp as i32 as u32);
    Ok(())
}

/// `jz` with a reserved displacement slot; returns the slot offset.
pub fn jz_forward(buf: &mut CodeBuffer) -> usize {
    buf.emit_bytes(&[0x0F, 0x84]); // jz rel32
    buf.reserve_u32()
}

/// `jmp` with a reserved displacement slot; returns the slot offset.
pub fn jmp_forward(buf: &mut CodeBuffer) -> usize {
    buf.emit_u8(0xE9); // jmp rel32
    buf.reserve_u32()
}

/// `jmp` to an already-known offset.
pub fn jmp_to(buf: &mut CodeBuffer, target: usize) -> Result<(), CompileError> {
    buf.emit_u8(0xE9); // jmp rel32
    rel32_to(buf, target)
}

/// `call` to an already-known entry offset.
pub fn call_to(buf: &mut CodeBuffer, target: usize) -> Result<(), CompileError> {
    buf.emit_u8(0xE8); // call rel32
    rel32_to(buf, target)
}

/// `call` with a reserved displacement slot; returns the slot offset.
pub fn call_forward(buf: &mut CodeBuffer) -> usize {
    buf.emit_u8(0xE8); // call rel32
    buf.reserve_u32()
}

/// `call` with a zero displacement, for callees nothing ever declares.
pub fn call_unresolved(buf: &mut CodeBuffer) {
    buf.emit_u8(0xE8); // call rel32
    buf.emit_u32(0);
}

/// `lea rsi, [rip + disp32]` addressing an offset inside the code image.
pub fn lea_rsi_rip(buf: &mut CodeBuffer, target: usize) -> Result<(), CompileError> {
    buf.emit_bytes(&[0x48, 0x8D, 0x35]); // lea rsi, [rip+disp32]
    rel32_to(buf, target)
}

pub fn syscall(buf: &mut CodeBuffer) {
    buf.emit_bytes(&[0x0F, 0x05]); // syscall
}

pub fn mov_rsi_rsp(buf: &mut CodeBuffer) {
    buf.emit_u24(0x00E6_8948); // 48 89 E6  mov rsi, rsp
}

pub fn store_al_rsp(buf: &mut CodeBuffer) {
    buf.emit_u24(0x0024_0488); // 88 04 24  mov [rsp], al
}

pub fn movzx_rax_byte_rsp(buf: &mut CodeBuffer) {
    buf.emit_bytes(&[0x48, 0x0F, 0xB6, 0x04, 0x24]); // movzx rax, byte [rsp]
}
