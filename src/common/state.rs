//! State Serialization Channel.
//!
//! `StateWrap` is a bidirectional cursor used by every device's `do_state`.
//! The same call sequence both saves and restores: in `Write` mode values are
//! appended to the buffer, in `Read` mode they are overwritten from it, and in
//! `Measure` mode only the size is accumulated. Named markers are interleaved
//! between sections so a corrupt save can be traced back to the device that
//! wrote it.

use crate::common::error::StateError;

/// Cookie written by [`StateWrap::do_marker`].
pub const MARKER_COOKIE: u32 = 0x42;

pub type Result<T> = std::result::Result<T, StateError>;

/// Direction of a state pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateMode {
    /// Restore values from the buffer.
    Read,
    /// Append values to the buffer.
    Write,
    /// Only count bytes.
    Measure,
}

/// Sequential state reader/writer.
pub struct StateWrap {
    mode: StateMode,
    buf: Vec<u8>,
    pos: usize,
    measured: usize,
    last_marker: String,
}

impl StateWrap {
    /// Creates a channel that records state into a fresh buffer.
    pub fn writer() -> Self {
        Self::with_mode(StateMode::Write, Vec::new())
    }

    /// Creates a channel that restores state from `data`.
    pub fn reader(data: &[u8]) -> Self {
        Self::with_mode(StateMode::Read, data.to_vec())
    }

    /// Creates a channel that only measures how many bytes a save would take.
    pub fn measurer() -> Self {
        Self::with_mode(StateMode::Measure, Vec::new())
    }

    fn with_mode(mode: StateMode, buf: Vec<u8>) -> Self {
        Self {
            mode,
            buf,
            pos: 0,
            measured: 0,
            last_marker: String::from("start of state"),
        }
    }

    pub fn mode(&self) -> StateMode {
        self.mode
    }

    pub fn is_reading(&self) -> bool {
        self.mode == StateMode::Read
    }

    pub fn is_writing(&self) -> bool {
        self.mode == StateMode::Write
    }

    /// Bytes consumed (read), produced (write) or counted (measure) so far.
    pub fn position(&self) -> usize {
        match self.mode {
            StateMode::Read => self.pos,
            StateMode::Write => self.buf.len(),
            StateMode::Measure => self.measured,
        }
    }

    /// Bytes left to read. Always zero outside of `Read` mode.
    pub fn remaining(&self) -> usize {
        match self.mode {
            StateMode::Read => self.buf.len() - self.pos,
            _ => 0,
        }
    }

    /// Name of the last marker that was successfully passed.
    pub fn last_marker(&self) -> &str {
        &self.last_marker
    }

    /// Consumes the channel and returns the written bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Transfers a fixed-size byte slice.
    pub fn do_bytes(&mut self, data: &mut [u8]) -> Result<()> {
        match self.mode {
            StateMode::Read => {
                let remaining = self.remaining();
                if data.len() > remaining {
                    return Err(StateError::UnexpectedEof {
                        section: self.last_marker.clone(),
                        needed: data.len(),
                        remaining,
                    });
                }
                data.copy_from_slice(&self.buf[self.pos..self.pos + data.len()]);
                self.pos += data.len();
            }
            StateMode::Write => self.buf.extend_from_slice(data),
            StateMode::Measure => self.measured += data.len(),
        }
        Ok(())
    }

    pub fn do_u8(&mut self, v: &mut u8) -> Result<()> {
        let mut raw = [*v];
        self.do_bytes(&mut raw)?;
        *v = raw[0];
        Ok(())
    }

    pub fn do_bool(&mut self, v: &mut bool) -> Result<()> {
        let mut raw = u8::from(*v);
        self.do_u8(&mut raw)?;
        *v = raw != 0;
        Ok(())
    }

    pub fn do_u16(&mut self, v: &mut u16) -> Result<()> {
        let mut raw = v.to_le_bytes();
        self.do_bytes(&mut raw)?;
        *v = u16::from_le_bytes(raw);
        Ok(())
    }

    pub fn do_u32(&mut self, v: &mut u32) -> Result<()> {
        let mut raw = v.to_le_bytes();
        self.do_bytes(&mut raw)?;
        *v = u32::from_le_bytes(raw);
        Ok(())
    }

    pub fn do_u64(&mut self, v: &mut u64) -> Result<()> {
        let mut raw = v.to_le_bytes();
        self.do_bytes(&mut raw)?;
        *v = u64::from_le_bytes(raw);
        Ok(())
    }

    pub fn do_i64(&mut self, v: &mut i64) -> Result<()> {
        let mut raw = v.to_le_bytes();
        self.do_bytes(&mut raw)?;
        *v = i64::from_le_bytes(raw);
        Ok(())
    }

    pub fn do_u32_slice(&mut self, values: &mut [u32]) -> Result<()> {
        for v in values.iter_mut() {
            self.do_u32(v)?;
        }
        Ok(())
    }

    /// Transfers a length-prefixed byte vector.
    ///
    /// On read the vector is resized to the stored length.
    pub fn do_vec(&mut self, data: &mut Vec<u8>) -> Result<()> {
        let mut len: u32 = data
            .len()
            .try_into()
            .map_err(|_| StateError::Corrupt("vector length does not fit in u32"))?;
        self.do_u32(&mut len)?;
        if self.is_reading() {
            let len = len as usize;
            if len > self.remaining() {
                return Err(StateError::UnexpectedEof {
                    section: self.last_marker.clone(),
                    needed: len,
                    remaining: self.remaining(),
                });
            }
            data.resize(len, 0);
        }
        self.do_bytes(data)
    }

    /// Transfers a buffer whose length is fixed by the device, rejecting a
    /// stored length that does not match it.
    pub fn do_fixed_vec(&mut self, data: &mut [u8]) -> Result<()> {
        let mut len = data.len() as u32;
        self.do_u32(&mut len)?;
        if self.is_reading() && len as usize != data.len() {
            return Err(StateError::LengthMismatch {
                section: self.last_marker.clone(),
                expected: data.len(),
                found: len as usize,
            });
        }
        self.do_bytes(data)
    }

    pub fn do_string(&mut self, s: &mut String) -> Result<()> {
        let mut bytes = std::mem::take(s).into_bytes();
        self.do_vec(&mut bytes)?;
        *s = String::from_utf8(bytes).map_err(|_| StateError::Corrupt("invalid utf-8 string"))?;
        Ok(())
    }

    /// Writes or checks a section marker named after the preceding section.
    ///
    /// On read, a mismatching cookie aborts the load and reports which section
    /// last decoded cleanly.
    pub fn do_marker(&mut self, name: &str) -> Result<()> {
        let mut cookie = MARKER_COOKIE;
        self.do_u32(&mut cookie).map_err(|e| match e {
            StateError::UnexpectedEof {
                needed, remaining, ..
            } => StateError::UnexpectedEof {
                section: name.to_string(),
                needed,
                remaining,
            },
            other => other,
        })?;
        if self.is_reading() && cookie != MARKER_COOKIE {
            return Err(StateError::MarkerMismatch {
                after: name.to_string(),
                expected: MARKER_COOKIE,
                found: cookie,
            });
        }
        self.last_marker = name.to_string();
        Ok(())
    }

    /// Fails a read that stopped short of the end of its buffer.
    pub fn finish(&self) -> Result<()> {
        match self.remaining() {
            0 => Ok(()),
            remaining => Err(StateError::TrailingData {
                section: self.last_marker.clone(),
                remaining,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_mismatch_names_section() {
        let mut w = StateWrap::writer();
        let mut v = 7u32;
        w.do_u32(&mut v).unwrap();
        w.do_marker("Memory").unwrap();
        let mut bytes = w.into_bytes();
        bytes[4] ^= 0xFF;

        let mut r = StateWrap::reader(&bytes);
        let mut out = 0u32;
        r.do_u32(&mut out).unwrap();
        let err = r.do_marker("Memory").unwrap_err();
        assert!(matches!(err, StateError::MarkerMismatch { ref after, .. } if after == "Memory"));
    }

    #[test]
    fn measure_counts_without_buffering() {
        let mut m = StateWrap::measurer();
        let mut v = 1u64;
        m.do_u64(&mut v).unwrap();
        m.do_marker("x").unwrap();
        assert_eq!(m.position(), 12);
        assert!(m.into_bytes().is_empty());
    }
}
