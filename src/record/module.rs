use super::{Bytes, RecordError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModuleEventKind {
    /// Present before the sampler attached; reported during enumeration.
    AlreadyLoaded,
    Loaded,
    Unloaded,
}

impl ModuleEventKind {
    fn from_raw(raw: i32) -> Result<Self> {
        match raw {
            0 => Ok(ModuleEventKind::AlreadyLoaded),
            1 => Ok(ModuleEventKind::Loaded),
            2 => Ok(ModuleEventKind::Unloaded),
            _ => Err(RecordError::Invalid("module event kind")),
        }
    }

    fn raw(self) -> i32 {
        match self {
            ModuleEventKind::AlreadyLoaded => 0,
            ModuleEventKind::Loaded => 1,
            ModuleEventKind::Unloaded => 2,
        }
    }
}

/// A native code region appearing or disappearing in the target.
///
/// Layout (48-byte fixed prefix):
/// ```text
/// i32 kind                 0 AlreadyLoaded, 1 Loaded, 2 Unloaded
/// u64 load_address
/// u64 size
/// i64 windows_file_time_utc
/// u8  uuid[16]
/// i32 path_utf8_len
/// u8  path[path_utf8_len]
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleEvent {
    pub kind: ModuleEventKind,
    pub load_address: u64,
    pub size: u64,
    pub file_time_utc: i64,
    pub uuid: [u8; 16],
    pub path: String,
}

impl ModuleEvent {
    pub(crate) fn parse(b: &mut Bytes<'_>) -> Result<Self> {
        let kind = ModuleEventKind::from_raw(b.i32()?)?;
        let load_address = b.u64()?;
        let size = b.u64()?;
        let file_time_utc = b.i64()?;
        let uuid: [u8; 16] = b.bytes(16)?.try_into().unwrap();
        let path_len = b.i32()?;
        if path_len < 0 {
            return Err(RecordError::Invalid("negative path length"));
        }
        let path = b.utf8(path_len as usize)?;
        Ok(ModuleEvent {
            kind,
            load_address,
            size,
            file_time_utc,
            uuid,
            path,
        })
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.kind.raw().to_le_bytes());
        buf.extend_from_slice(&self.load_address.to_le_bytes());
        buf.extend_from_slice(&self.size.to_le_bytes());
        buf.extend_from_slice(&self.file_time_utc.to_le_bytes());
        buf.extend_from_slice(&self.uuid);
        buf.extend_from_slice(&(self.path.len() as i32).to_le_bytes());
        buf.extend_from_slice(self.path.as_bytes());
    }
}
