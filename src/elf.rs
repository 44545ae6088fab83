//! Minimal ELF64 image writer: a 64-byte header, one RWX PT_LOAD program
//! header covering the whole file, then the raw code. The entry point is the
//! first code byte, which code generation guarantees is the program
//! prologue.

/// Load address of the single segment.
pub const BASE_ADDR: u64 = 0x40_0000;
/// ELF header plus one program header; the code starts here.
pub const HEADER_LEN: usize = 0x78;

const ELF_HEADER_LEN: u16 = 64;
const PROGRAM_HEADER_LEN: u16 = 56;

/// Wrap generated code into a runnable ELF64 image. Pure function of the
/// code bytes: identical input yields an identical image.
pub fn build_image(code: &[u8]) -> Vec<u8> {
    let file_size = (HEADER_LEN + code.len()) as u64;
    let mut image = Vec::with_capacity(HEADER_LEN + code.len());

    // e_ident: magic, 64-bit, little-endian, version 1, System V, padding.
    image.extend_from_slice(&[0x7F, b'E', b'L', b'F', 2, 1, 1, 0]);
    image.extend_from_slice(&[0u8; 8]);

    image.extend_from_slice(&2u16.to_le_bytes()); // e_type: ET_EXEC
    image.extend_from_slice(&0x3Eu16.to_le_bytes()); // e_machine: EM_X86_64
    image.extend_from_slice(&1u32.to_le_bytes()); // e_version
    image.extend_from_slice(&(BASE_ADDR + HEADER_LEN as u64).to_le_bytes()); // e_entry
    image.extend_from_slice(&(ELF_HEADER_LEN as u64).to_le_bytes()); // e_phoff
    image.extend_from_slice(&0u64.to_le_bytes()); // e_shoff
    image.extend_from_slice(&0u32.to_le_bytes()); // e_flags
    image.extend_from_slice(&ELF_HEADER_LEN.to_le_bytes()); // e_ehsize
    image.extend_from_slice(&PROGRAM_HEADER_LEN.to_le_bytes()); // e_phentsize
    image.extend_from_slice(&1u16.to_le_bytes()); // e_phnum
    image.extend_from_slice(&64u16.to_le_bytes()); // e_shentsize
    image.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
    image.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx

    image.extend_from_slice(&1u32.to_le_bytes()); // p_type: PT_LOAD
    image.extend_from_slice(&7u32.to_le_bytes()); // p_flags: R|W|X
    image.extend_from_slice(&0u64.to_le_bytes()); // p_offset
    image.extend_from_slice(&BASE_ADDR.to_le_bytes()); // p_vaddr
    image.extend_from_slice(&BASE_ADDR.to_le_bytes()); // p_paddr
    image.extend_from_slice(&file_size.to_le_bytes()); // p_filesz
    image.extend_from_slice(&file_size.to_le_bytes()); // p_memsz
    image.extend_from_slice(&0x1000u64.to_le_bytes()); // p_align

    image.extend_from_slice(code);
    image
}
