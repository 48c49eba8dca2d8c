use super::{Bytes, RecordError, Result};

/// First sighting of a peer thread.
///
/// Layout: `u64 sampling_id, u64 thread_id, i32 name_len, u8 name[name_len]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThreadStart {
    pub sampling_id: u64,
    pub thread_id: u64,
    pub name: String,
}

impl ThreadStart {
    pub(crate) fn parse(b: &mut Bytes<'_>) -> Result<Self> {
        let sampling_id = b.u64()?;
        let thread_id = b.u64()?;
        let name_len = b.i32()?;
        if name_len < 0 {
            return Err(RecordError::Invalid("negative name length"));
        }
        let name = b.utf8(name_len as usize)?;
        Ok(ThreadStart {
            sampling_id,
            thread_id,
            name,
        })
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.sampling_id.to_le_bytes());
        buf.extend_from_slice(&self.thread_id.to_le_bytes());
        buf.extend_from_slice(&(self.name.len() as i32).to_le_bytes());
        buf.extend_from_slice(self.name.as_bytes());
    }
}

/// A previously seen thread no longer exists.
///
/// Layout: `u64 sampling_id, u64 thread_id`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThreadStop {
    pub sampling_id: u64,
    pub thread_id: u64,
}

impl ThreadStop {
    pub(crate) fn parse(b: &mut Bytes<'_>) -> Result<Self> {
        Ok(ThreadStop {
            sampling_id: b.u64()?,
            thread_id: b.u64()?,
        })
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.sampling_id.to_le_bytes());
        buf.extend_from_slice(&self.thread_id.to_le_bytes());
    }
}
