//! File and directory records describing shared content.

use serde::{Deserialize, Serialize};

use crate::builder::MessageBuilder;
use crate::reader::{MessageError, MessageReader};

/// Smallest encoded file: code, three length prefixes, size, attribute count.
const MIN_FILE_LEN: usize = 1 + 4 + 8 + 4 + 4;

/// Kind of a file attribute, kept as the raw wire code so codes this crate
/// has no name for survive a read and write unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileAttributeType(pub i32);

impl FileAttributeType {
    pub const BIT_RATE: Self = Self(0);
    /// Seconds.
    pub const LENGTH: Self = Self(1);
    pub const VARIABLE_BIT_RATE: Self = Self(2);
    pub const ENCODER: Self = Self(3);
    pub const SAMPLE_RATE: Self = Self(4);
    pub const BIT_DEPTH: Self = Self(5);

    /// Whether the code is one of the named kinds above.
    pub fn is_known(self) -> bool {
        (0..=5).contains(&self.0)
    }
}

impl From<i32> for FileAttributeType {
    fn from(raw: i32) -> Self {
        Self(raw)
    }
}

impl From<FileAttributeType> for i32 {
    fn from(kind: FileAttributeType) -> i32 {
        kind.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileAttribute {
    pub kind: FileAttributeType,
    pub value: i32,
}

/// A shared file as reported in search and browse responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct File {
    pub code: u8,
    pub filename: String,
    pub size: i64,
    pub extension: String,
    pub attributes: Vec<FileAttribute>,
}

impl File {
    pub fn new(filename: impl Into<String>, size: i64) -> Self {
        let filename = filename.into();
        let extension = filename
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_owned())
            .unwrap_or_default();
        Self {
            code: 1,
            filename,
            size,
            extension,
            attributes: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, kind: FileAttributeType, value: i32) -> Self {
        self.attributes.push(FileAttribute { kind, value });
        self
    }

    /// Value of the first attribute of `kind`, if present.
    pub fn attribute(&self, kind: FileAttributeType) -> Option<i32> {
        self.attributes
            .iter()
            .find(|a| a.kind == kind)
            .map(|a| a.value)
    }

    pub fn bit_rate(&self) -> Option<i32> {
        self.attribute(FileAttributeType::BIT_RATE)
    }

    /// Length in seconds.
    pub fn length(&self) -> Option<i32> {
        self.attribute(FileAttributeType::LENGTH)
    }

    pub(crate) fn read(reader: &mut MessageReader) -> Result<Self, MessageError> {
        let code = reader.read_byte()?;
        let filename = reader.read_string()?;
        let size = reader.read_long()?;
        let extension = reader.read_string()?;
        let count = reader.read_integer()?;
        let mut attributes = Vec::with_capacity(bounded_capacity(count, reader.remaining(), 8));
        for _ in 0..count.max(0) {
            let kind = FileAttributeType::from(reader.read_integer()?);
            let value = reader.read_integer()?;
            attributes.push(FileAttribute { kind, value });
        }
        Ok(Self {
            code,
            filename,
            size,
            extension,
            attributes,
        })
    }

    pub(crate) fn write(&self, builder: MessageBuilder) -> MessageBuilder {
        builder
            .write_byte(self.code)
            .write_string(&self.filename)
            .write_long(self.size)
            .write_string(&self.extension)
            .write_integer(self.attributes.len() as i32)
            .with(|b| {
                self.attributes.iter().fold(b, |b, a| {
                    b.write_integer(a.kind.into()).write_integer(a.value)
                })
            })
    }
}

/// Read `count` files. Capacity is bounded by what the remaining bytes could hold.
pub(crate) fn read_files(reader: &mut MessageReader, count: i32) -> Result<Vec<File>, MessageError> {
    let mut files = Vec::with_capacity(bounded_capacity(count, reader.remaining(), MIN_FILE_LEN));
    for _ in 0..count.max(0) {
        files.push(File::read(reader)?);
    }
    Ok(files)
}

pub(crate) fn write_files(builder: MessageBuilder, files: &[File]) -> MessageBuilder {
    files
        .iter()
        .fold(builder.write_integer(files.len() as i32), |b, f| f.write(b))
}

/// A declared element count is never trusted for preallocation.
fn bounded_capacity(declared: i32, remaining: usize, min_len: usize) -> usize {
    usize::try_from(declared)
        .unwrap_or(0)
        .min(remaining / min_len)
}

/// A shared directory and the files within it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directory {
    pub name: String,
    pub files: Vec<File>,
}

impl Directory {
    pub fn new(name: impl Into<String>, files: Vec<File>) -> Self {
        Self {
            name: name.into(),
            files,
        }
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub(crate) fn read(reader: &mut MessageReader) -> Result<Self, MessageError> {
        let name = reader.read_string()?;
        let count = reader.read_integer()?;
        let files = read_files(reader, count)?;
        Ok(Self { name, files })
    }

    pub(crate) fn write(&self, builder: MessageBuilder) -> MessageBuilder {
        write_files(builder.write_string(&self.name), &self.files)
    }
}
