use super::{Bytes, RecordError, Result};

/// Emitted once per sampler stream, right after the manifest.
///
/// Layout:
/// ```text
/// i64 start_time_utc       Windows file time
/// i32 architecture
/// i32 rid_utf16_len        UTF-16 code units
/// u16 rid[rid_utf16_len]
/// i32 os_utf16_len
/// u16 os[os_utf16_len]
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessStart {
    pub start_time_utc: i64,
    pub architecture: i32,
    /// Runtime identifier, e.g. `osx-arm64`.
    pub rid: String,
    pub os: String,
}

impl ProcessStart {
    pub(crate) fn parse(b: &mut Bytes<'_>) -> Result<Self> {
        let start_time_utc = b.i64()?;
        let architecture = b.i32()?;
        let rid_len = b.i32()?;
        if rid_len < 0 {
            return Err(RecordError::Invalid("negative rid length"));
        }
        let rid = b.utf16(rid_len as usize)?;
        let os_len = b.i32()?;
        if os_len < 0 {
            return Err(RecordError::Invalid("negative os length"));
        }
        let os = b.utf16(os_len as usize)?;
        Ok(ProcessStart {
            start_time_utc,
            architecture,
            rid,
            os,
        })
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.start_time_utc.to_le_bytes());
        buf.extend_from_slice(&self.architecture.to_le_bytes());
        let rid: Vec<u16> = self.rid.encode_utf16().collect();
        buf.extend_from_slice(&(rid.len() as i32).to_le_bytes());
        for unit in &rid {
            buf.extend_from_slice(&unit.to_le_bytes());
        }
        let os: Vec<u16> = self.os.encode_utf16().collect();
        buf.extend_from_slice(&(os.len() as i32).to_le_bytes());
        for unit in &os {
            buf.extend_from_slice(&unit.to_le_bytes());
        }
    }
}
