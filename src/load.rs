use crate::bytes::Cursor;
use crate::error::Error;
use crate::module::Sections;

/// Original container magic.
pub const VM_MAGIC: u32 = 0x12721444;
/// Container magic with a trailing jump-table length field.
pub const VM_MAGIC_VER2: u32 = 0x12721445;

/// Parse a QVM container and slice its sections.
///
/// The header is little-endian: magic, instruction count, CODE
/// offset/length, DATA offset/length, LIT length, BSS length and, for
/// version 2, the jump-table length. LIT follows DATA in the file, the
/// jump table follows LIT.
pub fn load(bytes: &[u8]) -> Result<Sections, Error> {
    let mut cursor = Cursor::new(bytes);
    let magic = cursor.read_u32()?;
    if magic != VM_MAGIC && magic != VM_MAGIC_VER2 {
        return Err(Error::MalformedModule("bad magic"));
    }
    let instruction_count = cursor.read_u32()?;
    let code_offset = cursor.read_u32()? as usize;
    let code_length = cursor.read_u32()? as usize;
    let data_offset = cursor.read_u32()? as usize;
    let data_length = cursor.read_u32()? as usize;
    let lit_length = cursor.read_u32()? as usize;
    let bss_length = cursor.read_u32()?;
    let jump_table_length = if magic == VM_MAGIC_VER2 {
        cursor.read_u32()? as usize
    } else {
        0
    };
    if jump_table_length % 4 != 0 {
        return Err(Error::MalformedModule("jump table length not a multiple of 4"));
    }

    let code = section(bytes, code_offset, code_length)?;
    let data = section(bytes, data_offset, data_length)?;
    let lit = section(bytes, data_offset + data_length, lit_length)?;
    let jump_bytes = section(bytes, data_offset + data_length + lit_length, jump_table_length)?;
    let jump_table = jump_bytes
        .chunks_exact(4)
        .map(|word| u32::from_le_bytes(word.try_into().unwrap()))
        .collect();

    Ok(Sections {
        instruction_count,
        code: code.to_vec(),
        data: data.to_vec(),
        lit: lit.to_vec(),
        bss_length,
        jump_table,
    })
}

fn section(bytes: &[u8], offset: usize, length: usize) -> Result<&[u8], Error> {
    offset
        .checked_add(length)
        .and_then(|end| bytes.get(offset..end))
        .ok_or(Error::TruncatedStream)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(fields: &[u32]) -> Vec<u8> {
        fields.iter().flat_map(|f| f.to_le_bytes()).collect()
    }

    #[test]
    fn load_sections() {
        // header: 32 bytes, then 3 bytes CODE, 4 bytes DATA, 2 bytes LIT
        let mut file = header(&[VM_MAGIC, 2, 32, 3, 35, 4, 2, 16]);
        file.extend_from_slice(&[6, 6, 4]);
        file.extend_from_slice(&[1, 2, 3, 4]);
        file.extend_from_slice(&[b'h', b'i']);

        let sections = load(&file).unwrap();
        assert_eq!(2, sections.instruction_count);
        assert_eq!(vec![6, 6, 4], sections.code);
        assert_eq!(vec![1, 2, 3, 4], sections.data);
        assert_eq!(vec![b'h', b'i'], sections.lit);
        assert_eq!(16, sections.bss_length);
        assert!(sections.jump_table.is_empty());
    }

    #[test]
    fn load_jump_table() {
        let mut file = header(&[VM_MAGIC_VER2, 0, 36, 0, 36, 0, 0, 0, 8]);
        file.extend_from_slice(&header(&[0x10, 0x20]));
        let sections = load(&file).unwrap();
        assert_eq!(vec![0x10, 0x20], sections.jump_table);
    }

    #[test]
    fn load_rejects_bad_magic() {
        let file = header(&[0xdeadbeef, 0, 32, 0, 32, 0, 0, 0]);
        assert!(matches!(load(&file), Err(Error::MalformedModule(_))));
    }

    #[test]
    fn load_rejects_short_section() {
        // CODE claims 8 bytes but the file ends after 2
        let mut file = header(&[VM_MAGIC, 0, 32, 8, 34, 0, 0, 0]);
        file.extend_from_slice(&[6, 4]);
        assert!(matches!(load(&file), Err(Error::TruncatedStream)));
    }
}
