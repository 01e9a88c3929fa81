use alloc::vec::Vec;
use nom::bytes::complete::{tag, take};
use nom::combinator::{map, map_opt};
use nom::number::complete::{le_u16, le_u32, u8};
use nom::IResult;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ElfUsage {
    Relocatable,
    Executable,
    Shared,
    Core,
}

/// e_machine value for x86, the only machine this kernel runs on.
pub const MACHINE_X86: u16 = 0x03;

// Strictly 32-bit little-endian ELFs.
#[derive(Copy, Clone, Debug)]
pub struct ElfHeader {
    pub usage: ElfUsage,
    pub machine: u16,
    pub program_entry: u32,
    pub program_headers_offset: u32,
    pub program_header_entry_size: u16,
    pub program_header_count: u16,
}

impl ElfHeader {
    pub fn parse(bytes: &[u8]) -> IResult<&[u8], ElfHeader> {
        let (bytes, _) = tag([0x7F, b'E', b'L', b'F'])(bytes)?;

        // Elf Bit width and endianness. We don't parse 64-bit or
        // big-endian binaries.
        let (bytes, _) = tag([1])(bytes)?;
        let (bytes, _) = tag([1])(bytes)?;

        let (bytes, _header_version) = u8(bytes)?;
        let (bytes, _abi) = u8(bytes)?;

        let (bytes, _) = take(8usize)(bytes)?;

        let (bytes, usage) = map_opt(le_u16, |value| match value {
            1 => Some(ElfUsage::Relocatable),
            2 => Some(ElfUsage::Executable),
            3 => Some(ElfUsage::Shared),
            4 => Some(ElfUsage::Core),
            _ => None,
        })(bytes)?;

        let (bytes, machine) = le_u16(bytes)?;
        let (bytes, _elf_version) = le_u32(bytes)?;
        let (bytes, program_entry) = le_u32(bytes)?;
        let (bytes, program_headers_offset) = le_u32(bytes)?;
        let (bytes, _section_headers_offset) = le_u32(bytes)?;

        let (bytes, _flags) = le_u32(bytes)?;

        let (bytes, _elf_header_size) = le_u16(bytes)?;
        let (bytes, program_header_entry_size) = le_u16(bytes)?;
        let (bytes, program_header_count) = le_u16(bytes)?;
        let (bytes, _section_header_entry_size) = le_u16(bytes)?;
        let (bytes, _section_header_count) = le_u16(bytes)?;
        let (bytes, _section_header_index) = le_u16(bytes)?;

        Ok((
            bytes,
            ElfHeader {
                usage,
                machine,
                program_entry,
                program_headers_offset,
                program_header_entry_size,
                program_header_count,
            },
        ))
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ElfProgramType {
    Ignore,
    Load,
    Dynamic,
    Interpret,
    Note,
    Other(u32),
}

/// One program header. Segment contents are not sliced out here; demand
/// paging reads them from the file by offset when a page first faults.
#[derive(Copy, Clone, Debug)]
pub struct ElfProgramHeader {
    pub program_type: ElfProgramType,
    pub file_offset: u32,
    pub virtual_address: u32,
    pub file_size: u32,
    pub memory_size: u32,
    pub executable: bool,
    pub writable: bool,
    pub readable: bool,
}

impl ElfProgramHeader {
    pub fn parse(bytes: &[u8]) -> IResult<&[u8], Self> {
        let (bytes, program_type) = map(le_u32, |value| match value {
            0 => ElfProgramType::Ignore,
            1 => ElfProgramType::Load,
            2 => ElfProgramType::Dynamic,
            3 => ElfProgramType::Interpret,
            4 => ElfProgramType::Note,
            other => ElfProgramType::Other(other),
        })(bytes)?;

        let (bytes, file_offset) = le_u32(bytes)?;
        let (bytes, virtual_address) = le_u32(bytes)?;
        let (bytes, _physical_address) = le_u32(bytes)?;
        let (bytes, file_size) = le_u32(bytes)?;
        let (bytes, memory_size) = le_u32(bytes)?;
        let (bytes, flags) = le_u32(bytes)?;
        let (bytes, _alignment) = le_u32(bytes)?;

        let executable = flags & 1 != 0;
        let writable = flags & 2 != 0;
        let readable = flags & 4 != 0;

        Ok((
            bytes,
            ElfProgramHeader {
                program_type,
                file_offset,
                virtual_address,
                file_size,
                memory_size,
                executable,
                writable,
                readable,
            },
        ))
    }
}

#[derive(Clone, Debug)]
pub struct Elf {
    pub header: ElfHeader,
    pub program_headers: Vec<ElfProgramHeader>,
}

impl Elf {
    pub fn parse(full_bytes: &[u8]) -> IResult<&[u8], Elf> {
        let (bytes, header) = ElfHeader::parse(full_bytes)?;

        let (mut program_header_bytes, _) = take(header.program_headers_offset)(full_bytes)?;

        let mut program_headers = Vec::with_capacity(header.program_header_count as usize);

        for _ in 0..header.program_header_count {
            let (_, program_header) = ElfProgramHeader::parse(program_header_bytes)?;

            program_headers.push(program_header);

            (program_header_bytes, _) =
                take(header.program_header_entry_size)(program_header_bytes)?;
        }

        Ok((
            bytes,
            Elf {
                header,
                program_headers,
            },
        ))
    }

    pub fn parse_bytes(bytes: &[u8]) -> Result<Elf, nom::Err<nom::error::Error<&[u8]>>> {
        Ok(Self::parse(bytes)?.1)
    }
}

/// Builders for synthetic ELF images, shared with the loader tests.
#[cfg(test)]
pub(crate) mod test_images {
    use super::MACHINE_X86;
    use alloc::vec;
    use alloc::vec::Vec;

    pub(crate) const EHSIZE: usize = 52;
    pub(crate) const PHSIZE: usize = 32;

    /// Serializes a header for an x86 executable with `phnum` program
    /// headers directly after it.
    pub(crate) fn header(entry: u32, phnum: u16) -> Vec<u8> {
        let mut h = vec![0u8; EHSIZE];
        h[0..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
        h[4] = 1; // 32-bit
        h[5] = 1; // little-endian
        h[6] = 1;
        h[16..18].copy_from_slice(&2u16.to_le_bytes()); // executable
        h[18..20].copy_from_slice(&MACHINE_X86.to_le_bytes());
        h[20..24].copy_from_slice(&1u32.to_le_bytes());
        h[24..28].copy_from_slice(&entry.to_le_bytes());
        h[28..32].copy_from_slice(&(EHSIZE as u32).to_le_bytes());
        h[40..42].copy_from_slice(&(EHSIZE as u16).to_le_bytes());
        h[42..44].copy_from_slice(&(PHSIZE as u16).to_le_bytes());
        h[44..46].copy_from_slice(&phnum.to_le_bytes());
        h
    }

    pub(crate) fn program_header(
        p_type: u32,
        offset: u32,
        vaddr: u32,
        filesz: u32,
        memsz: u32,
        flags: u32,
    ) -> Vec<u8> {
        let mut p = vec![0u8; PHSIZE];
        p[0..4].copy_from_slice(&p_type.to_le_bytes());
        p[4..8].copy_from_slice(&offset.to_le_bytes());
        p[8..12].copy_from_slice(&vaddr.to_le_bytes());
        p[16..20].copy_from_slice(&filesz.to_le_bytes());
        p[20..24].copy_from_slice(&memsz.to_le_bytes());
        p[24..28].copy_from_slice(&flags.to_le_bytes());
        p
    }
}

#[cfg(test)]
mod test {
    use super::test_images::{header, program_header};
    use super::*;

    #[test]
    fn parses_header_and_program_headers() {
        let mut image = header(0x0804_8074, 2);
        image.extend(program_header(1, 0x1000, 0x0804_8000, 0x80, 0x100, 5));
        image.extend(program_header(0x6474_e551, 0, 0, 0, 0, 6));

        let elf = Elf::parse_bytes(&image).unwrap();
        assert_eq!(elf.header.usage, ElfUsage::Executable);
        assert_eq!(elf.header.machine, MACHINE_X86);
        assert_eq!(elf.header.program_entry, 0x0804_8074);
        assert_eq!(elf.program_headers.len(), 2);

        let load = &elf.program_headers[0];
        assert_eq!(load.program_type, ElfProgramType::Load);
        assert_eq!(load.file_offset, 0x1000);
        assert_eq!(load.virtual_address, 0x0804_8000);
        assert_eq!(load.file_size, 0x80);
        assert_eq!(load.memory_size, 0x100);
        assert!(load.executable && load.readable && !load.writable);

        assert_eq!(
            elf.program_headers[1].program_type,
            ElfProgramType::Other(0x6474_e551)
        );
    }

    #[test]
    fn rejects_non_elf_input() {
        let mut image = header(0, 0);
        image[1] = b'X';
        assert!(Elf::parse_bytes(&image).is_err());
        assert!(Elf::parse_bytes(b"short").is_err());
    }

    #[test]
    fn rejects_unsupported_width_and_endianness() {
        let mut wide = header(0, 0);
        wide[4] = 2; // 64-bit
        assert!(Elf::parse_bytes(&wide).is_err());

        let mut big = header(0, 0);
        big[5] = 2; // big-endian
        assert!(Elf::parse_bytes(&big).is_err());
    }

    #[test]
    fn steps_by_the_recorded_entry_size() {
        // Entries padded to 40 bytes; the parser must use the stride from
        // the header, not its own struct size.
        let mut image = header(0, 2);
        image[42..44].copy_from_slice(&40u16.to_le_bytes());
        let mut first = program_header(1, 0, 0x1000, 0, 0x1000, 4);
        first.resize(40, 0);
        image.extend(first);
        image.extend(program_header(4, 0, 0, 0, 0, 0));

        let elf = Elf::parse_bytes(&image).unwrap();
        assert_eq!(elf.program_headers[0].program_type, ElfProgramType::Load);
        assert_eq!(elf.program_headers[1].program_type, ElfProgramType::Note);
    }
}
