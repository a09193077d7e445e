use log::trace;
use std::fmt;
use thiserror::Error;

/// Per-object existence state recorded in an object map.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ObjectState {
    #[default]
    Nonexistent = 0,
    Exists = 1,
    /// Write in flight; treated as modified.
    Pending = 2,
    /// Exists and unchanged since the previous snapshot.
    ExistsClean = 3,
}

impl ObjectState {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => ObjectState::Nonexistent,
            1 => ObjectState::Exists,
            2 => ObjectState::Pending,
            _ => ObjectState::ExistsClean,
        }
    }

    pub fn bits(self) -> u8 {
        self as u8
    }

    pub fn exists(self) -> bool {
        self != ObjectState::Nonexistent
    }
}

/// Per-object change classification across a snapshot range.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DiffState {
    #[default]
    Hole = 0,
    Data = 1,
    HoleUpdated = 2,
    DataUpdated = 3,
}

impl DiffState {
    pub fn is_data(self) -> bool {
        matches!(self, DiffState::Data | DiffState::DataUpdated)
    }

    pub fn is_hole(self) -> bool {
        matches!(self, DiffState::Hole | DiffState::HoleUpdated)
    }

    pub fn is_updated(self) -> bool {
        matches!(self, DiffState::HoleUpdated | DiffState::DataUpdated)
    }

    /// Folds one more snapshot's state for an index already in the diff.
    pub fn fold(self, state: ObjectState) -> Self {
        match state {
            ObjectState::Exists | ObjectState::Pending => DiffState::DataUpdated,
            ObjectState::ExistsClean if !self.is_data() => DiffState::DataUpdated,
            ObjectState::Nonexistent if !self.is_hole() => DiffState::HoleUpdated,
            _ => self,
        }
    }
}

impl fmt::Display for DiffState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DiffState::Hole => "hole",
            DiffState::Data => "data",
            DiffState::HoleUpdated => "hole_updated",
            DiffState::DataUpdated => "data_updated",
        };
        f.write_str(name)
    }
}

const COUNT_LEN: usize = 8;
const CRC_LEN: usize = 4;
const STATES_PER_BYTE: usize = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BitmapError {
    #[error("object map truncated: need {expected} bytes, have {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("object map has {0} trailing bytes")]
    TrailingBytes(usize),
    #[error("object map checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    Checksum { stored: u32, computed: u32 },
    #[error("object map count {0} does not fit in memory")]
    CountOverflow(u64),
}

/// Two-bit per-object state vector for one snapshot of an image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectMap {
    states: Vec<ObjectState>,
}

impl ObjectMap {
    pub fn new(len: usize) -> Self {
        Self {
            states: vec![ObjectState::Nonexistent; len],
        }
    }

    pub fn from_states(states: Vec<ObjectState>) -> Self {
        Self { states }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<ObjectState> {
        self.states.get(index).copied()
    }

    pub fn set(&mut self, index: usize, state: ObjectState) {
        self.states[index] = state;
    }

    /// Truncates, or pads with `Nonexistent`.
    pub fn resize(&mut self, len: usize) {
        self.states.resize(len, ObjectState::Nonexistent);
    }

    pub fn states(&self) -> &[ObjectState] {
        &self.states
    }

    /// Count, packed states (first object in the high bits), then CRC32 of
    /// everything before it; all little-endian.
    pub fn encode(&self) -> Vec<u8> {
        let packed_len = self.states.len().div_ceil(STATES_PER_BYTE);
        let mut buf = Vec::with_capacity(COUNT_LEN + packed_len + CRC_LEN);
        buf.extend_from_slice(&(self.states.len() as u64).to_le_bytes());
        for chunk in self.states.chunks(STATES_PER_BYTE) {
            let mut byte = 0u8;
            for (slot, state) in chunk.iter().enumerate() {
                byte |= state.bits() << (6 - 2 * slot);
            }
            buf.push(byte);
        }
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, BitmapError> {
        if bytes.len() < COUNT_LEN + CRC_LEN {
            return Err(BitmapError::Truncated {
                expected: COUNT_LEN + CRC_LEN,
                actual: bytes.len(),
            });
        }
        let mut count_bytes = [0u8; COUNT_LEN];
        count_bytes.copy_from_slice(&bytes[..COUNT_LEN]);
        let count = u64::from_le_bytes(count_bytes);
        let count_usize = usize::try_from(count).map_err(|_| BitmapError::CountOverflow(count))?;
        let packed_len = count_usize.div_ceil(STATES_PER_BYTE);
        let expected = COUNT_LEN
            .checked_add(packed_len)
            .and_then(|len| len.checked_add(CRC_LEN))
            .ok_or(BitmapError::CountOverflow(count))?;
        if bytes.len() < expected {
            return Err(BitmapError::Truncated {
                expected,
                actual: bytes.len(),
            });
        }
        if bytes.len() > expected {
            return Err(BitmapError::TrailingBytes(bytes.len() - expected));
        }
        let body_end = COUNT_LEN + packed_len;
        let mut crc_bytes = [0u8; CRC_LEN];
        crc_bytes.copy_from_slice(&bytes[body_end..expected]);
        let stored = u32::from_le_bytes(crc_bytes);
        let computed = crc32fast::hash(&bytes[..body_end]);
        if stored != computed {
            return Err(BitmapError::Checksum { stored, computed });
        }
        let mut states = Vec::with_capacity(count_usize);
        for byte in &bytes[COUNT_LEN..body_end] {
            for slot in 0..STATES_PER_BYTE {
                if states.len() == count_usize {
                    break;
                }
                states.push(ObjectState::from_bits(byte >> (6 - 2 * slot)));
            }
        }
        trace!("event=object_map_decode objects={}", states.len());
        Ok(Self { states })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_first_object_into_high_bits() {
        let map = ObjectMap::from_states(vec![
            ObjectState::ExistsClean,
            ObjectState::Nonexistent,
            ObjectState::Exists,
            ObjectState::Pending,
            ObjectState::Exists,
        ]);
        let bytes = map.encode();
        assert_eq!(&bytes[..8], &5u64.to_le_bytes());
        assert_eq!(bytes[8], 0b11_00_01_10);
        assert_eq!(bytes[9], 0b01_00_00_00);
        assert_eq!(bytes.len(), 8 + 2 + 4);
        assert_eq!(ObjectMap::decode(&bytes).unwrap(), map);
    }

    #[test]
    fn rejects_corruption() {
        let mut bytes = ObjectMap::new(9).encode();
        bytes[9] ^= 0x40;
        assert!(matches!(
            ObjectMap::decode(&bytes),
            Err(BitmapError::Checksum { .. })
        ));

        let bytes = ObjectMap::new(9).encode();
        assert!(matches!(
            ObjectMap::decode(&bytes[..bytes.len() - 1]),
            Err(BitmapError::Truncated { .. })
        ));

        let mut padded = bytes.clone();
        padded.push(0);
        assert_eq!(
            ObjectMap::decode(&padded),
            Err(BitmapError::TrailingBytes(1))
        );
    }

    #[test]
    fn fold_follows_transition_table() {
        use DiffState::*;
        use ObjectState::*;
        assert_eq!(Data.fold(Exists), DataUpdated);
        assert_eq!(Hole.fold(Pending), DataUpdated);
        assert_eq!(Data.fold(ExistsClean), Data);
        assert_eq!(HoleUpdated.fold(ExistsClean), DataUpdated);
        assert_eq!(DataUpdated.fold(Nonexistent), HoleUpdated);
        assert_eq!(Hole.fold(Nonexistent), Hole);
    }
}
