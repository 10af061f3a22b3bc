//! Reads the declarations out of a binary class file. We only need enough to build a
//! `ClassDescriptor`: the constant pool, the class header and the names, types and modifiers of
//! fields and methods. Attributes, including method bodies, are skipped.

use crate::class::ClassDescriptor;
use crate::class::ClassHeader;
use crate::error::Context as _;
use crate::error::Result;
use crate::member::FieldDescriptor;
use crate::member::MethodDescriptor;
use crate::member::Modifiers;
use crate::name::ClassName;
use anyhow::bail;
use std::borrow::Cow;

const MAGIC: u32 = 0xCAFE_BABE;

mod tag {
    pub(super) const UTF8: u8 = 1;
    pub(super) const INTEGER: u8 = 3;
    pub(super) const FLOAT: u8 = 4;
    pub(super) const LONG: u8 = 5;
    pub(super) const DOUBLE: u8 = 6;
    pub(super) const CLASS: u8 = 7;
    pub(super) const STRING: u8 = 8;
    pub(super) const FIELD_REF: u8 = 9;
    pub(super) const METHOD_REF: u8 = 10;
    pub(super) const INTERFACE_METHOD_REF: u8 = 11;
    pub(super) const NAME_AND_TYPE: u8 = 12;
    pub(super) const METHOD_HANDLE: u8 = 15;
    pub(super) const METHOD_TYPE: u8 = 16;
    pub(super) const DYNAMIC: u8 = 17;
    pub(super) const INVOKE_DYNAMIC: u8 = 18;
    pub(super) const MODULE: u8 = 19;
    pub(super) const PACKAGE: u8 = 20;
}

enum Constant<'data> {
    Utf8(Cow<'data, str>),
    Class { name_index: u16 },
    /// Entries we don't need to look at, including the unusable slot after a long or double.
    Other,
}

struct ByteReader<'data> {
    data: &'data [u8],
    offset: usize,
}

struct ConstantPool<'data> {
    /// Index 0 is never valid, so it holds a placeholder.
    entries: Vec<Constant<'data>>,
}

pub(crate) fn parse_class(data: &[u8]) -> Result<ClassDescriptor> {
    let mut reader = ByteReader { data, offset: 0 };
    let magic = reader.u32()?;
    if magic != MAGIC {
        bail!("Not a class file: bad magic {magic:#010x}");
    }
    let _minor_version = reader.u16()?;
    let _major_version = reader.u16()?;
    let pool = ConstantPool::parse(&mut reader)?;

    let modifiers = Modifiers::from_bits_truncate(reader.u16()?);
    let name = pool.class_name(reader.u16()?)?;
    let super_index = reader.u16()?;
    let super_name = if super_index == 0 {
        None
    } else {
        Some(pool.class_name(super_index)?)
    };
    let interface_count = reader.u16()?;
    let interfaces = (0..interface_count)
        .map(|_| pool.class_name(reader.u16()?))
        .collect::<Result<Vec<_>>>()?;

    let mut fields = Vec::new();
    for _ in 0..reader.u16()? {
        let (modifiers, member_name, descriptor) = read_member(&mut reader, &pool)?;
        fields.push(
            FieldDescriptor::parse(&name, &format!("{member_name} {descriptor}"), modifiers)
                .with_context(|| format!("Invalid field in class `{name}`"))?,
        );
    }
    let mut methods = Vec::new();
    for _ in 0..reader.u16()? {
        let (modifiers, member_name, descriptor) = read_member(&mut reader, &pool)?;
        methods.push(
            MethodDescriptor::parse(&name, &format!("{member_name}{descriptor}"), modifiers)
                .with_context(|| format!("Invalid method in class `{name}`"))?,
        );
    }
    skip_attributes(&mut reader)?;

    Ok(ClassDescriptor::new(
        ClassHeader {
            name,
            modifiers,
            super_name,
            interfaces,
        },
        methods,
        fields,
    ))
}

fn read_member<'pool>(
    reader: &mut ByteReader,
    pool: &'pool ConstantPool,
) -> Result<(Modifiers, &'pool str, &'pool str)> {
    let modifiers = Modifiers::from_bits_truncate(reader.u16()?);
    let name = pool.utf8(reader.u16()?)?;
    let descriptor = pool.utf8(reader.u16()?)?;
    skip_attributes(reader)?;
    Ok((modifiers, name, descriptor))
}

fn skip_attributes(reader: &mut ByteReader) -> Result {
    for _ in 0..reader.u16()? {
        let _name_index = reader.u16()?;
        let length = reader.u32()?;
        reader.skip(length as usize)?;
    }
    Ok(())
}

impl<'data> ConstantPool<'data> {
    fn parse(reader: &mut ByteReader<'data>) -> Result<Self> {
        let count = usize::from(reader.u16()?);
        let mut entries = Vec::with_capacity(count);
        entries.push(Constant::Other);
        while entries.len() < count {
            let tag = reader.u8()?;
            let constant = match tag {
                tag::UTF8 => {
                    let length = usize::from(reader.u16()?);
                    let bytes = reader.bytes(length)?;
                    // Class files use a modified UTF-8 that only differs from the real thing for
                    // NUL and supplementary characters, neither of which turn up in names.
                    Constant::Utf8(String::from_utf8_lossy(bytes))
                }
                tag::CLASS => Constant::Class {
                    name_index: reader.u16()?,
                },
                tag::STRING | tag::METHOD_TYPE | tag::MODULE | tag::PACKAGE => {
                    reader.skip(2)?;
                    Constant::Other
                }
                tag::METHOD_HANDLE => {
                    reader.skip(3)?;
                    Constant::Other
                }
                tag::INTEGER
                | tag::FLOAT
                | tag::FIELD_REF
                | tag::METHOD_REF
                | tag::INTERFACE_METHOD_REF
                | tag::NAME_AND_TYPE
                | tag::DYNAMIC
                | tag::INVOKE_DYNAMIC => {
                    reader.skip(4)?;
                    Constant::Other
                }
                tag::LONG | tag::DOUBLE => {
                    reader.skip(8)?;
                    // Eight-byte constants take up two slots.
                    entries.push(Constant::Other);
                    Constant::Other
                }
                other => bail!(
                    "Unknown constant pool tag {other} at index {}",
                    entries.len()
                ),
            };
            entries.push(constant);
        }
        Ok(ConstantPool { entries })
    }

    fn utf8(&self, index: u16) -> Result<&str> {
        match self.entries.get(usize::from(index)) {
            Some(Constant::Utf8(text)) => Ok(text.as_ref()),
            _ => bail!("Constant pool index {index} isn't a UTF-8 entry"),
        }
    }

    fn class_name(&self, index: u16) -> Result<ClassName> {
        match self.entries.get(usize::from(index)) {
            Some(Constant::Class { name_index }) => Ok(ClassName::new(self.utf8(*name_index)?)),
            _ => bail!("Constant pool index {index} isn't a class entry"),
        }
    }
}

impl<'data> ByteReader<'data> {
    fn bytes(&mut self, length: usize) -> Result<&'data [u8]> {
        let Some(bytes) = self.data.get(self.offset..self.offset + length) else {
            bail!("Truncated class file at offset {}", self.offset);
        };
        self.offset += length;
        Ok(bytes)
    }

    fn skip(&mut self, length: usize) -> Result {
        self.bytes(length)?;
        Ok(())
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let bytes = self.bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let bytes = self.bytes(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}
