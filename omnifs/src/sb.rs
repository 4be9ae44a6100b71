use crate::config::Config;
use crate::error::FsError;
use crate::users::USER_RECORD_SIZE;

pub const MAGIC: &[u8; 8] = b"OMNIFS01";
pub const FORMAT_VERSION: u32 = 0x0001_0000;

/// Space left between the end of the user table and the first data block.
pub const RESERVED_GAP: u64 = 1024;

const NAME_LEN: usize = 32;

/// The first region of the container, storing what is needed to reopen it and
/// verify the underlying file is formatted correctly.
///
/// Layout of the whole container:
///
/// ==========================================================
/// | Header | User Table | reserved gap | Data Region ...   |
/// ==========================================================
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerHeader {
    pub version: u32,
    /// Size of the whole container file in bytes.
    pub total_size: u64,
    /// Bytes reserved for the header region.
    pub header_size: u64,
    pub block_size: u32,
    pub max_users: u32,
    pub user_table_offset: u32,
    pub admin_username: String,
    pub admin_password: String,
    pub require_auth: bool,
    /// Seconds since epoch when the container was formatted.
    pub created: u64,
}

impl ContainerHeader {
    /// Number of bytes the encoded fields occupy at the start of the region.
    pub const ENCODED_LEN: usize = 8 + 4 + 8 + 8 + 4 + 4 + 4 + NAME_LEN + NAME_LEN + 1 + 8;

    /// Longest admin username or password the header can hold.
    pub const MAX_CREDENTIAL_LEN: usize = NAME_LEN;

    pub fn from_config(config: &Config, now: u64) -> Result<Self, FsError> {
        config.validate()?;
        let fs = &config.filesystem;
        Ok(Self {
            version: FORMAT_VERSION,
            total_size: fs.total_size,
            header_size: fs.header_size,
            block_size: fs.block_size,
            max_users: fs.max_users,
            user_table_offset: fs.header_size as u32,
            admin_username: config.security.admin_username.clone(),
            admin_password: config.security.admin_password.clone(),
            require_auth: config.security.require_auth,
            created: now,
        })
    }

    /// Byte offset of block 0.
    pub fn data_offset(&self) -> u64 {
        self.user_table_offset as u64
            + self.max_users as u64 * USER_RECORD_SIZE as u64
            + RESERVED_GAP
    }

    pub fn total_blocks(&self) -> u32 {
        let data = self.total_size.saturating_sub(self.data_offset());
        (data / self.block_size.max(1) as u64) as u32
    }

    /// Reads the header from the start of a buffer. The buffer may be longer
    /// than the encoded fields.
    pub fn parse(buf: &[u8]) -> Result<Self, FsError> {
        if buf.len() < Self::ENCODED_LEN {
            return Err(FsError::corrupt("container header truncated"));
        }
        if &buf[0..8] != MAGIC {
            return Err(FsError::corrupt("container magic constant invalid"));
        }

        let mut cursor = Cursor { buf, pos: 8 };
        let version = cursor.u32();
        let total_size = cursor.u64();
        let header_size = cursor.u64();
        let block_size = cursor.u32();
        let max_users = cursor.u32();
        let user_table_offset = cursor.u32();
        let admin_username = cursor.name();
        let admin_password = cursor.name();
        let require_auth = cursor.u8() != 0;
        let created = cursor.u64();

        if block_size == 0 || (user_table_offset as u64) < Self::ENCODED_LEN as u64 {
            return Err(FsError::corrupt("container header describes an impossible layout"));
        }

        Ok(Self {
            version,
            total_size,
            header_size,
            block_size,
            max_users,
            user_table_offset,
            admin_username,
            admin_password,
            require_auth,
            created,
        })
    }

    /// Serializes the header into a `header_size` buffer for writing to disk.
    /// The encoding is a series of struct fields with big endian alignment.
    pub fn serialize(&self) -> Vec<u8> {
        let mut encoded = Vec::with_capacity(self.header_size as usize);
        encoded.extend_from_slice(MAGIC);
        encoded.extend_from_slice(&self.version.to_be_bytes());
        encoded.extend_from_slice(&self.total_size.to_be_bytes());
        encoded.extend_from_slice(&self.header_size.to_be_bytes());
        encoded.extend_from_slice(&self.block_size.to_be_bytes());
        encoded.extend_from_slice(&self.max_users.to_be_bytes());
        encoded.extend_from_slice(&self.user_table_offset.to_be_bytes());
        encoded.extend_from_slice(&fixed_name(&self.admin_username));
        encoded.extend_from_slice(&fixed_name(&self.admin_password));
        encoded.push(self.require_auth as u8);
        encoded.extend_from_slice(&self.created.to_be_bytes());
        let region = (self.header_size as usize).max(Self::ENCODED_LEN);
        encoded.resize(region, 0);
        encoded
    }
}

fn fixed_name(value: &str) -> [u8; NAME_LEN] {
    let mut out = [0; NAME_LEN];
    let bytes = value.as_bytes();
    let len = bytes.len().min(NAME_LEN);
    out[..len].copy_from_slice(&bytes[..len]);
    out
}

/// Reads big endian fields off a buffer already checked to hold a full header.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> &'a [u8] {
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        out
    }

    fn u8(&mut self) -> u8 {
        self.take(1)[0]
    }

    fn u32(&mut self) -> u32 {
        u32::from_be_bytes(self.take(4).try_into().unwrap_or_default())
    }

    fn u64(&mut self) -> u64 {
        u64::from_be_bytes(self.take(8).try_into().unwrap_or_default())
    }

    fn name(&mut self) -> String {
        let raw = self.take(NAME_LEN);
        let end = raw.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
        String::from_utf8_lossy(&raw[..end]).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> ContainerHeader {
        ContainerHeader::from_config(&Config::default(), 1_700_000_000).unwrap()
    }

    #[test]
    fn can_encode_and_decode_headers() {
        let mut hdr = header();
        hdr.max_users = 5;
        hdr.require_auth = false;
        let encoded = hdr.serialize();
        assert_eq!(encoded.len(), hdr.header_size as usize);

        let parsed = ContainerHeader::parse(&encoded).unwrap();

        assert_eq!(parsed, hdr);
    }

    #[test]
    fn parsing_buffer_with_invalid_magic_fails() {
        let zero_buffer_with_right_size = vec![0; 4096];
        assert!(ContainerHeader::parse(&zero_buffer_with_right_size).is_err());
    }

    #[test]
    fn parsing_buffer_with_invalid_size_fails() {
        let encoded = header().serialize();
        assert!(ContainerHeader::parse(&encoded[..40]).is_err());
    }

    #[test]
    fn data_region_follows_user_table_and_gap() {
        let hdr = header();
        assert_eq!(
            hdr.data_offset(),
            4096 + 100 * USER_RECORD_SIZE as u64 + RESERVED_GAP
        );
        let data = hdr.total_size - hdr.data_offset();
        assert_eq!(hdr.total_blocks() as u64, data / 4096);
    }
}
