// SPDX-License-Identifier: Apache-2.0

//! Package container walk: end-of-central-directory scan (zip64 aware),
//! central directory listing, and per-entry data offsets.

use crate::constants::{
    CENTRAL_DIR_HEADER_SIGNATURE, EOCD_SIGNATURE, LOCAL_FILE_HEADER_SIGNATURE,
    ZIP64_EOCD_LOCATOR_SIGNATURE, ZIP64_EOCD_SIGNATURE,
};
use crate::error::{Result, UpdateError};
use crate::package::PkgIO;

fn bad(msg: impl Into<String>) -> UpdateError {
    UpdateError::BadPackage(msg.into())
}

#[derive(Debug, Clone)]
pub struct PkgEntry {
    pub name: String,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub offset: u64,
    pub method: u16,
    pub crc32: u32,
}

pub struct ZipParser;

impl ZipParser {
    /// Finds the end-of-central-directory record by scanning backwards from
    /// EOF; the package may carry a signature trailer and an archive
    /// comment, so the scan window covers both.
    pub async fn find_eocd<I: PkgIO>(io: &I) -> Result<(u64, u16)> {
        let file_size = io.size().await?;

        let max_comment_size = 65535;
        let eocd_min_size = 22;
        let max_search = std::cmp::min(file_size, (max_comment_size + eocd_min_size) as u64);
        let chunk_size = 8192;
        let mut current_pos = file_size;
        let mut eocd_pos = None;
        let mut buffer = vec![0u8; chunk_size];

        while current_pos > file_size.saturating_sub(max_search) && eocd_pos.is_none() {
            let read_size = std::cmp::min(
                chunk_size,
                (current_pos - file_size.saturating_sub(max_search)) as usize,
            );
            let read_pos = current_pos.saturating_sub(read_size as u64);

            io.read_at(read_pos, &mut buffer[..read_size]).await?;

            if read_size >= 4 {
                for i in (0..=read_size - 4).rev() {
                    if buffer[i..i + 4] == EOCD_SIGNATURE {
                        eocd_pos = Some(read_pos + i as u64);
                        break;
                    }
                }
            }

            current_pos = read_pos;
            if current_pos > 3 {
                current_pos -= 3;
            }
        }

        let eocd_offset = eocd_pos.ok_or_else(|| bad("no end-of-central-directory record"))?;

        let mut num_entries_buf = [0u8; 2];
        io.read_at(eocd_offset + 10, &mut num_entries_buf).await?;
        let num_entries = u16::from_le_bytes(num_entries_buf);

        Ok((eocd_offset, num_entries))
    }

    /// Follows the zip64 locator back to the zip64 EOCD when the 32-bit
    /// fields saturated.
    async fn read_zip64_eocd<I: PkgIO>(io: &I, eocd_offset: u64) -> Result<(u64, u64)> {
        if eocd_offset < 20 {
            return Err(bad("zip64 indicated but no room for a locator"));
        }

        let search_start = eocd_offset.saturating_sub(20);
        let mut buffer = vec![0u8; (eocd_offset - search_start) as usize];
        io.read_at(search_start, &mut buffer).await?;

        let mut zip64_eocd_offset = 0u64;
        let mut found_locator = false;

        if buffer.len() >= 4 {
            for i in (0..=buffer.len() - 4).rev() {
                if buffer[i..i + 4] == ZIP64_EOCD_LOCATOR_SIGNATURE {
                    found_locator = true;
                    if i + 16 <= buffer.len() {
                        zip64_eocd_offset =
                            u64::from_le_bytes(buffer[i + 8..i + 16].try_into().unwrap());
                    }
                    break;
                }
            }
        }

        if !found_locator {
            return Err(bad("zip64 locator not found"));
        }

        let mut zip64_eocd = [0u8; 56];
        io.read_at(zip64_eocd_offset, &mut zip64_eocd).await?;

        if zip64_eocd[0..4] != ZIP64_EOCD_SIGNATURE {
            return Err(bad("bad zip64 end-of-central-directory signature"));
        }

        let cd_offset = u64::from_le_bytes(zip64_eocd[48..56].try_into().unwrap());
        let num_entries = u64::from_le_bytes(zip64_eocd[32..40].try_into().unwrap());

        Ok((cd_offset, num_entries))
    }

    pub async fn central_directory_info<I: PkgIO>(io: &I) -> Result<(u64, usize)> {
        let (eocd_offset, num_entries) = Self::find_eocd(io).await?;

        let mut cd_offset_buf = [0u8; 4];
        io.read_at(eocd_offset + 16, &mut cd_offset_buf).await?;
        let cd_offset = u32::from_le_bytes(cd_offset_buf) as u64;

        if cd_offset == 0xFFFFFFFF || num_entries == 0xFFFF {
            let (real_cd_offset, real_num_entries) = Self::read_zip64_eocd(io, eocd_offset).await?;
            Ok((real_cd_offset, real_num_entries as usize))
        } else {
            Ok((cd_offset, num_entries as usize))
        }
    }

    /// Reads one central directory entry, returning it together with the
    /// offset of the next.
    async fn read_central_directory_entry<I: PkgIO>(
        io: &I,
        offset: u64,
    ) -> Result<(PkgEntry, u64)> {
        let mut entry_header = [0u8; 46];
        io.read_at(offset, &mut entry_header).await?;

        if entry_header[0..4] != CENTRAL_DIR_HEADER_SIGNATURE {
            return Err(bad("bad central directory header signature"));
        }

        let method = u16::from_le_bytes([entry_header[10], entry_header[11]]);
        let crc32 = u32::from_le_bytes(entry_header[16..20].try_into().unwrap());
        let filename_len = u16::from_le_bytes([entry_header[28], entry_header[29]]) as usize;
        let extra_len = u16::from_le_bytes([entry_header[30], entry_header[31]]) as usize;
        let comment_len = u16::from_le_bytes([entry_header[32], entry_header[33]]) as usize;

        let mut local_header_offset =
            u32::from_le_bytes(entry_header[42..46].try_into().unwrap()) as u64;
        let mut compressed_size =
            u32::from_le_bytes(entry_header[20..24].try_into().unwrap()) as u64;
        let mut uncompressed_size =
            u32::from_le_bytes(entry_header[24..28].try_into().unwrap()) as u64;

        let mut filename = vec![0u8; filename_len];
        io.read_at(offset + 46, &mut filename).await?;

        let mut extra_data = vec![0u8; extra_len];
        io.read_at(offset + 46 + filename_len as u64, &mut extra_data)
            .await?;

        // zip64 extra field carries the saturated values in a fixed order
        if local_header_offset == 0xFFFFFFFF
            || uncompressed_size == 0xFFFFFFFF
            || compressed_size == 0xFFFFFFFF
        {
            let mut pos = 0;
            while pos + 4 <= extra_data.len() {
                let header_id = u16::from_le_bytes([extra_data[pos], extra_data[pos + 1]]);
                let data_size =
                    u16::from_le_bytes([extra_data[pos + 2], extra_data[pos + 3]]) as usize;

                if header_id == 0x0001 && pos + 4 + data_size <= extra_data.len() {
                    let mut field_pos = pos + 4;
                    let field_end = pos + 4 + data_size;

                    if uncompressed_size == 0xFFFFFFFF && field_pos + 8 <= field_end {
                        uncompressed_size = u64::from_le_bytes(
                            extra_data[field_pos..field_pos + 8].try_into().unwrap(),
                        );
                        field_pos += 8;
                    }
                    if compressed_size == 0xFFFFFFFF && field_pos + 8 <= field_end {
                        compressed_size = u64::from_le_bytes(
                            extra_data[field_pos..field_pos + 8].try_into().unwrap(),
                        );
                        field_pos += 8;
                    }
                    if local_header_offset == 0xFFFFFFFF && field_pos + 8 <= field_end {
                        local_header_offset = u64::from_le_bytes(
                            extra_data[field_pos..field_pos + 8].try_into().unwrap(),
                        );
                    }
                    break;
                }
                pos += 4 + data_size;
            }
        }

        let next_offset = offset + 46 + filename_len as u64 + extra_len as u64 + comment_len as u64;

        Ok((
            PkgEntry {
                name: String::from_utf8_lossy(&filename).into_owned(),
                compressed_size,
                uncompressed_size,
                offset: local_header_offset,
                method,
                crc32,
            },
            next_offset,
        ))
    }

    /// Walks the central directory and lists every entry in order.
    pub async fn list_entries<I: PkgIO>(io: &I) -> Result<Vec<PkgEntry>> {
        let (cd_offset, num_entries) = Self::central_directory_info(io).await?;
        let mut entries = Vec::with_capacity(num_entries);
        let mut current_offset = cd_offset;

        for _ in 0..num_entries {
            let (entry, next_offset) =
                Self::read_central_directory_entry(io, current_offset).await?;
            current_offset = next_offset;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// The byte offset of an entry's data, past its local header. The local
    /// header's method must agree with the central directory.
    pub async fn data_offset<I: PkgIO>(io: &I, entry: &PkgEntry) -> Result<u64> {
        let mut local_header = [0u8; 30];
        io.read_at(entry.offset, &mut local_header).await?;

        if local_header[0..4] != LOCAL_FILE_HEADER_SIGNATURE {
            return Err(bad(format!("bad local header for entry {}", entry.name)));
        }

        let local_method = u16::from_le_bytes([local_header[8], local_header[9]]);
        if local_method != entry.method {
            return Err(bad(format!(
                "entry {} method disagrees between local header and central directory",
                entry.name
            )));
        }

        let local_filename_len = u16::from_le_bytes([local_header[26], local_header[27]]) as u64;
        let local_extra_len = u16::from_le_bytes([local_header[28], local_header[29]]) as u64;

        Ok(entry.offset + 30 + local_filename_len + local_extra_len)
    }
}

/// Minimal writer for the same container, enough to assemble packages in
/// the packaging CLI and in tests. Entries are stored or pre-compressed by
/// the caller; this only lays out headers and the directory.
pub struct ZipWriter {
    data: Vec<u8>,
    directory: Vec<u8>,
    count: u16,
}

impl Default for ZipWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl ZipWriter {
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            directory: Vec::new(),
            count: 0,
        }
    }

    /// Adds one entry whose on-disk bytes are `stored` (already in the
    /// representation `method` describes) and whose original bytes hash to
    /// `crc32` with length `uncompressed_len`.
    pub fn add_entry(
        &mut self,
        name: &str,
        stored: &[u8],
        method: u16,
        crc32: u32,
        uncompressed_len: u64,
    ) {
        let offset = self.data.len() as u32;
        let name_bytes = name.as_bytes();

        self.data.extend_from_slice(&LOCAL_FILE_HEADER_SIGNATURE);
        self.data.extend_from_slice(&20u16.to_le_bytes()); // version needed
        self.data.extend_from_slice(&0u16.to_le_bytes()); // flags
        self.data.extend_from_slice(&method.to_le_bytes());
        self.data.extend_from_slice(&0u32.to_le_bytes()); // dos time/date
        self.data.extend_from_slice(&crc32.to_le_bytes());
        self.data.extend_from_slice(&(stored.len() as u32).to_le_bytes());
        self.data.extend_from_slice(&(uncompressed_len as u32).to_le_bytes());
        self.data.extend_from_slice(&(name_bytes.len() as u16).to_le_bytes());
        self.data.extend_from_slice(&0u16.to_le_bytes()); // extra len
        self.data.extend_from_slice(name_bytes);
        self.data.extend_from_slice(stored);

        self.directory.extend_from_slice(&CENTRAL_DIR_HEADER_SIGNATURE);
        self.directory.extend_from_slice(&20u16.to_le_bytes()); // version made by
        self.directory.extend_from_slice(&20u16.to_le_bytes()); // version needed
        self.directory.extend_from_slice(&0u16.to_le_bytes()); // flags
        self.directory.extend_from_slice(&method.to_le_bytes());
        self.directory.extend_from_slice(&0u32.to_le_bytes()); // dos time/date
        self.directory.extend_from_slice(&crc32.to_le_bytes());
        self.directory.extend_from_slice(&(stored.len() as u32).to_le_bytes());
        self.directory.extend_from_slice(&(uncompressed_len as u32).to_le_bytes());
        self.directory.extend_from_slice(&(name_bytes.len() as u16).to_le_bytes());
        self.directory.extend_from_slice(&0u16.to_le_bytes()); // extra len
        self.directory.extend_from_slice(&0u16.to_le_bytes()); // comment len
        self.directory.extend_from_slice(&0u16.to_le_bytes()); // disk number
        self.directory.extend_from_slice(&0u16.to_le_bytes()); // internal attrs
        self.directory.extend_from_slice(&0u32.to_le_bytes()); // external attrs
        self.directory.extend_from_slice(&offset.to_le_bytes());
        self.directory.extend_from_slice(name_bytes);

        self.count += 1;
    }

    pub fn finish(mut self) -> Vec<u8> {
        let cd_offset = self.data.len() as u32;
        let cd_len = self.directory.len() as u32;
        self.data.extend_from_slice(&self.directory);

        self.data.extend_from_slice(&EOCD_SIGNATURE);
        self.data.extend_from_slice(&0u16.to_le_bytes()); // disk number
        self.data.extend_from_slice(&0u16.to_le_bytes()); // cd start disk
        self.data.extend_from_slice(&self.count.to_le_bytes());
        self.data.extend_from_slice(&self.count.to_le_bytes());
        self.data.extend_from_slice(&cd_len.to_le_bytes());
        self.data.extend_from_slice(&cd_offset.to_le_bytes());
        self.data.extend_from_slice(&0u16.to_le_bytes()); // comment len
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::METHOD_STORE;
    use crate::package::MemPkgIO;

    fn crc32_of(data: &[u8]) -> u32 {
        crate::package::reader::crc32(data)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn roundtrip_store_entries() {
        let mut writer = ZipWriter::new();
        writer.add_entry("a.txt", b"alpha", METHOD_STORE, crc32_of(b"alpha"), 5);
        writer.add_entry("b/c.bin", b"bravo!", METHOD_STORE, crc32_of(b"bravo!"), 6);
        let io = MemPkgIO {
            data: writer.finish(),
        };

        let entries = ZipParser::list_entries(&io).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "a.txt");
        assert_eq!(entries[1].name, "b/c.bin");
        assert_eq!(entries[1].uncompressed_size, 6);

        let offset = ZipParser::data_offset(&io, &entries[0]).await.unwrap();
        let mut data = vec![0u8; 5];
        io.read_at(offset, &mut data).await.unwrap();
        assert_eq!(&data, b"alpha");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn eocd_found_behind_trailer() {
        let mut writer = ZipWriter::new();
        writer.add_entry("x", b"payload", METHOD_STORE, crc32_of(b"payload"), 7);
        let mut data = writer.finish();
        // a signature trailer appended after the archive must not break the
        // directory scan
        data.extend_from_slice(&[0xEE; 300]);
        let io = MemPkgIO { data };

        let entries = ZipParser::list_entries(&io).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "x");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn garbage_is_rejected() {
        let io = MemPkgIO {
            data: vec![0u8; 64],
        };
        assert!(ZipParser::list_entries(&io).await.is_err());
    }
}
