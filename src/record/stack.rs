use super::{Bytes, RecordError, Result};

/// One periodic stack snapshot for one thread, frame-delta compressed.
///
/// Layout (32-byte fixed prefix):
/// ```text
/// u64 sampling_id
/// u64 thread_id
/// i32 run_state
/// i32 cpu_usage_permil     CPU x 1000 since the previous tick
/// i32 previous_frame_count frames shared with the previous stack (root side)
/// i32 frame_bytes
/// u64 frame[frame_bytes / 8]  delta frames, leaf first
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallStack {
    pub sampling_id: u64,
    pub thread_id: u64,
    pub run_state: i32,
    pub cpu_usage_permil: i32,
    pub previous_frame_count: i32,
    pub frames: Vec<u64>,
}

impl CallStack {
    pub(crate) fn parse(b: &mut Bytes<'_>) -> Result<Self> {
        let sampling_id = b.u64()?;
        let thread_id = b.u64()?;
        let run_state = b.i32()?;
        let cpu_usage_permil = b.i32()?;
        let previous_frame_count = b.i32()?;
        let frame_bytes = b.i32()?;
        if previous_frame_count < 0 {
            return Err(RecordError::Invalid("negative previous_frame_count"));
        }
        if frame_bytes < 0 || frame_bytes % 8 != 0 {
            return Err(RecordError::Invalid("frame_bytes not a multiple of 8"));
        }
        let mut frames = Vec::with_capacity(frame_bytes as usize / 8);
        for _ in 0..frame_bytes / 8 {
            frames.push(b.u64()?);
        }
        Ok(CallStack {
            sampling_id,
            thread_id,
            run_state,
            cpu_usage_permil,
            previous_frame_count,
            frames,
        })
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.sampling_id.to_le_bytes());
        buf.extend_from_slice(&self.thread_id.to_le_bytes());
        buf.extend_from_slice(&self.run_state.to_le_bytes());
        buf.extend_from_slice(&self.cpu_usage_permil.to_le_bytes());
        buf.extend_from_slice(&self.previous_frame_count.to_le_bytes());
        buf.extend_from_slice(&((self.frames.len() * 8) as i32).to_le_bytes());
        for frame in &self.frames {
            buf.extend_from_slice(&frame.to_le_bytes());
        }
    }
}
