//! Streaming ZIP writer.
//!
//! Entries are stored uncompressed and their sizes and checksums follow
//! the data in a descriptor, so nothing has to be known up front or seeked
//! back to. ZIP64 records are used where a size or offset needs them.

use bytes::{BufMut, BytesMut};
use chrono::{DateTime, Datelike, Timelike, Utc};
use crc32fast::Hasher;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use skyshard_common::{Error, Result};

const LOCAL_HEADER_SIG: u32 = 0x0403_4b50;
const DESCRIPTOR_SIG: u32 = 0x0807_4b50;
const CENTRAL_HEADER_SIG: u32 = 0x0201_4b50;
const ZIP64_END_SIG: u32 = 0x0606_4b50;
const ZIP64_LOCATOR_SIG: u32 = 0x0706_4b50;
const END_SIG: u32 = 0x0605_4b50;

const ZIP64_EXTRA_ID: u16 = 0x0001;
const VERSION_DEFAULT: u16 = 20;
const VERSION_ZIP64: u16 = 45;
/// Sizes in a trailing descriptor, UTF-8 names.
const FLAGS: u16 = 0x0008 | 0x0800;

const U16_LIMIT: u64 = 0xFFFF;
const U32_LIMIT: u64 = 0xFFFF_FFFF;

struct CentralEntry {
    name: String,
    comment: String,
    dos_time: u16,
    dos_date: u16,
    crc: u32,
    size: u64,
    offset: u64,
    zip64: bool,
}

struct OpenEntry {
    central: CentralEntry,
    hasher: Hasher,
}

/// Writes a ZIP archive to `W` one entry at a time.
pub struct ZipStreamWriter<W> {
    out: W,
    offset: u64,
    entries: Vec<CentralEntry>,
    current: Option<OpenEntry>,
    /// Entry size from which ZIP64 sizes are required.
    entry_limit: u64,
}

impl<W: AsyncWrite + Unpin> ZipStreamWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            offset: 0,
            entries: Vec::new(),
            current: None,
            entry_limit: U32_LIMIT,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_entry_limit(mut self, limit: u64) -> Self {
        self.entry_limit = limit;
        self
    }

    /// Bytes written so far.
    pub fn bytes_written(&self) -> u64 {
        self.offset
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len() + usize::from(self.current.is_some())
    }

    /// Bytes the open entry can still take. Zero when none is open.
    pub fn remaining(&self) -> u64 {
        match &self.current {
            Some(entry) if entry.central.zip64 => u64::MAX - entry.central.size,
            Some(entry) => self
                .entry_limit
                .saturating_sub(1)
                .saturating_sub(entry.central.size),
            None => 0,
        }
    }

    async fn emit(&mut self, buf: &[u8]) -> Result<()> {
        self.out.write_all(buf).await?;
        self.offset += buf.len() as u64;
        Ok(())
    }

    /// Open an entry. `size_hint` decides whether its sizes are recorded
    /// as ZIP64; once a smaller entry reaches 4 GiB, [`write_data`](Self::write_data)
    /// refuses more. Check [`remaining`](Self::remaining) first.
    pub async fn start_entry(
        &mut self,
        name: &str,
        modified: DateTime<Utc>,
        size_hint: u64,
    ) -> Result<()> {
        if self.current.is_some() {
            return Err(Error::InvalidState("Previous entry still open".to_string()));
        }
        if name.is_empty() || name.len() as u64 > U16_LIMIT {
            return Err(Error::InvalidInput(format!(
                "Entry name must be 1 to {} bytes",
                U16_LIMIT
            )));
        }

        let zip64 = size_hint >= self.entry_limit;
        let (dos_time, dos_date) = dos_datetime(modified);

        let mut header = BytesMut::with_capacity(30 + name.len() + 20);
        header.put_u32_le(LOCAL_HEADER_SIG);
        header.put_u16_le(if zip64 { VERSION_ZIP64 } else { VERSION_DEFAULT });
        header.put_u16_le(FLAGS);
        header.put_u16_le(0); // stored
        header.put_u16_le(dos_time);
        header.put_u16_le(dos_date);
        header.put_u32_le(0);
        if zip64 {
            header.put_u32_le(U32_LIMIT as u32);
            header.put_u32_le(U32_LIMIT as u32);
        } else {
            header.put_u32_le(0);
            header.put_u32_le(0);
        }
        header.put_u16_le(name.len() as u16);
        header.put_u16_le(if zip64 { 20 } else { 0 });
        header.put_slice(name.as_bytes());
        if zip64 {
            header.put_u16_le(ZIP64_EXTRA_ID);
            header.put_u16_le(16);
            header.put_u64_le(0);
            header.put_u64_le(0);
        }

        let offset = self.offset;
        self.emit(&header).await?;
        self.current = Some(OpenEntry {
            central: CentralEntry {
                name: name.to_string(),
                comment: String::new(),
                dos_time,
                dos_date,
                crc: 0,
                size: 0,
                offset,
                zip64,
            },
            hasher: Hasher::new(),
        });
        Ok(())
    }

    /// Append to the open entry.
    pub async fn write_data(&mut self, data: &[u8]) -> Result<()> {
        let entry = self
            .current
            .as_mut()
            .ok_or_else(|| Error::InvalidState("No entry open".to_string()))?;
        let size = entry.central.size + data.len() as u64;
        if !entry.central.zip64 && size >= self.entry_limit {
            return Err(Error::InvalidInput(format!(
                "{} exceeds 4 GiB but was not opened as ZIP64",
                entry.central.name
            )));
        }
        entry.hasher.update(data);
        entry.central.size = size;
        self.emit(data).await
    }

    /// Close the open entry, attaching `comment` to its directory record.
    pub async fn finish_entry(&mut self, comment: Option<&str>) -> Result<()> {
        let OpenEntry {
            mut central,
            hasher,
        } = self
            .current
            .take()
            .ok_or_else(|| Error::InvalidState("No entry open".to_string()))?;
        central.crc = hasher.finalize();
        if let Some(comment) = comment {
            central.comment = truncate_utf8(comment, U16_LIMIT as usize).to_string();
        }

        let mut descriptor = BytesMut::with_capacity(24);
        descriptor.put_u32_le(DESCRIPTOR_SIG);
        descriptor.put_u32_le(central.crc);
        if central.zip64 {
            descriptor.put_u64_le(central.size);
            descriptor.put_u64_le(central.size);
        } else {
            descriptor.put_u32_le(central.size as u32);
            descriptor.put_u32_le(central.size as u32);
        }
        self.emit(&descriptor).await?;
        self.entries.push(central);
        Ok(())
    }

    /// Write a complete small entry.
    pub async fn add_entry(&mut self, name: &str, modified: DateTime<Utc>, data: &[u8]) -> Result<()> {
        self.start_entry(name, modified, data.len() as u64).await?;
        self.write_data(data).await?;
        self.finish_entry(None).await
    }

    /// Write the central directory and hand back the sink.
    pub async fn finish(mut self) -> Result<W> {
        if self.current.is_some() {
            return Err(Error::InvalidState("Entry still open".to_string()));
        }

        let cd_offset = self.offset;
        let entries = std::mem::take(&mut self.entries);
        for entry in &entries {
            let record = central_record(entry, cd_offset);
            self.emit(&record).await?;
        }
        let cd_size = self.offset - cd_offset;
        let count = entries.len() as u64;

        let mut tail = BytesMut::with_capacity(98);
        let needs_zip64 = count >= U16_LIMIT || cd_offset >= U32_LIMIT || cd_size >= U32_LIMIT;
        if needs_zip64 {
            let end64_offset = self.offset;
            tail.put_u32_le(ZIP64_END_SIG);
            tail.put_u64_le(44);
            tail.put_u16_le(VERSION_ZIP64);
            tail.put_u16_le(VERSION_ZIP64);
            tail.put_u32_le(0);
            tail.put_u32_le(0);
            tail.put_u64_le(count);
            tail.put_u64_le(count);
            tail.put_u64_le(cd_size);
            tail.put_u64_le(cd_offset);

            tail.put_u32_le(ZIP64_LOCATOR_SIG);
            tail.put_u32_le(0);
            tail.put_u64_le(end64_offset);
            tail.put_u32_le(1);
        }
        tail.put_u32_le(END_SIG);
        tail.put_u16_le(0);
        tail.put_u16_le(0);
        tail.put_u16_le(count.min(U16_LIMIT) as u16);
        tail.put_u16_le(count.min(U16_LIMIT) as u16);
        tail.put_u32_le(cd_size.min(U32_LIMIT) as u32);
        tail.put_u32_le(cd_offset.min(U32_LIMIT) as u32);
        tail.put_u16_le(0);
        self.emit(&tail).await?;

        self.out.flush().await?;
        Ok(self.out)
    }
}

fn central_record(entry: &CentralEntry, cd_offset: u64) -> BytesMut {
    debug_assert!(entry.offset < cd_offset);
    let zip64 = entry.zip64 || entry.size >= U32_LIMIT || entry.offset >= U32_LIMIT;
    let mut record = BytesMut::with_capacity(46 + entry.name.len() + 28 + entry.comment.len());
    let version = if zip64 { VERSION_ZIP64 } else { VERSION_DEFAULT };

    record.put_u32_le(CENTRAL_HEADER_SIG);
    record.put_u16_le(version);
    record.put_u16_le(version);
    record.put_u16_le(FLAGS);
    record.put_u16_le(0);
    record.put_u16_le(entry.dos_time);
    record.put_u16_le(entry.dos_date);
    record.put_u32_le(entry.crc);
    if zip64 {
        record.put_u32_le(U32_LIMIT as u32);
        record.put_u32_le(U32_LIMIT as u32);
    } else {
        record.put_u32_le(entry.size as u32);
        record.put_u32_le(entry.size as u32);
    }
    record.put_u16_le(entry.name.len() as u16);
    record.put_u16_le(if zip64 { 28 } else { 0 });
    record.put_u16_le(entry.comment.len() as u16);
    record.put_u16_le(0); // disk
    record.put_u16_le(0); // internal attributes
    record.put_u32_le(0); // external attributes
    record.put_u32_le(if zip64 { U32_LIMIT as u32 } else { entry.offset as u32 });
    record.put_slice(entry.name.as_bytes());
    if zip64 {
        record.put_u16_le(ZIP64_EXTRA_ID);
        record.put_u16_le(24);
        record.put_u64_le(entry.size);
        record.put_u64_le(entry.size);
        record.put_u64_le(entry.offset);
    }
    record.put_slice(entry.comment.as_bytes());
    record
}

/// MS-DOS time and date. Dates before 1980 clamp to its start.
fn dos_datetime(at: DateTime<Utc>) -> (u16, u16) {
    if at.year() < 1980 {
        return (0, (1 << 5) | 1);
    }
    let time = (at.hour() << 11) | (at.minute() << 5) | (at.second() / 2);
    let date = (((at.year() - 1980).min(127) as u32) << 9) | (at.month() << 5) | at.day();
    (time as u16, date as u16)
}

fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Minimal ZIP reader for checking writer output in tests.
#[cfg(test)]
pub(crate) mod read {
    pub struct Entry {
        pub name: String,
        pub comment: String,
        pub crc: u32,
        pub data: Vec<u8>,
        pub zip64: bool,
    }

    fn u16_at(buf: &[u8], at: usize) -> u16 {
        u16::from_le_bytes([buf[at], buf[at + 1]])
    }

    fn u32_at(buf: &[u8], at: usize) -> u32 {
        u32::from_le_bytes(buf[at..at + 4].try_into().unwrap())
    }

    fn u64_at(buf: &[u8], at: usize) -> u64 {
        u64::from_le_bytes(buf[at..at + 8].try_into().unwrap())
    }

    /// Parse through the central directory and check every entry's
    /// local header, descriptor and checksum.
    pub fn entries(zip: &[u8]) -> Vec<Entry> {
        let end = zip.len() - 22;
        assert_eq!(u32_at(zip, end), 0x0605_4b50, "end record");
        let mut count = u16_at(zip, end + 10) as u64;
        let mut cd_offset = u32_at(zip, end + 16) as u64;
        if count == 0xFFFF || cd_offset == 0xFFFF_FFFF {
            let locator = end - 20;
            assert_eq!(u32_at(zip, locator), 0x0706_4b50, "zip64 locator");
            let end64 = u64_at(zip, locator + 8) as usize;
            assert_eq!(u32_at(zip, end64), 0x0606_4b50, "zip64 end record");
            count = u64_at(zip, end64 + 32);
            cd_offset = u64_at(zip, end64 + 48);
        }

        let mut at = cd_offset as usize;
        let mut out = Vec::new();
        for _ in 0..count {
            assert_eq!(u32_at(zip, at), 0x0201_4b50, "central header");
            let crc = u32_at(zip, at + 16);
            let mut size = u32_at(zip, at + 24) as u64;
            let name_len = u16_at(zip, at + 28) as usize;
            let extra_len = u16_at(zip, at + 30) as usize;
            let comment_len = u16_at(zip, at + 32) as usize;
            let mut offset = u32_at(zip, at + 42) as u64;
            let name_at = at + 46;
            let name = String::from_utf8(zip[name_at..name_at + name_len].to_vec()).unwrap();
            let zip64 = extra_len > 0;
            if zip64 {
                let extra = name_at + name_len;
                assert_eq!(u16_at(zip, extra), 0x0001);
                size = u64_at(zip, extra + 4);
                offset = u64_at(zip, extra + 20);
            }
            let comment_at = name_at + name_len + extra_len;
            let comment =
                String::from_utf8(zip[comment_at..comment_at + comment_len].to_vec()).unwrap();

            let local = offset as usize;
            assert_eq!(u32_at(zip, local), 0x0403_4b50, "local header");
            let data_at =
                local + 30 + u16_at(zip, local + 26) as usize + u16_at(zip, local + 28) as usize;
            let data = zip[data_at..data_at + size as usize].to_vec();
            let descriptor = data_at + size as usize;
            assert_eq!(u32_at(zip, descriptor), 0x0807_4b50, "descriptor");
            assert_eq!(u32_at(zip, descriptor + 4), crc);
            assert_eq!(crc32fast::hash(&data), crc, "checksum of {}", name);

            out.push(Entry {
                name,
                comment,
                crc,
                data,
                zip64,
            });
            at = comment_at + comment_len;
        }
        out
    }
}
