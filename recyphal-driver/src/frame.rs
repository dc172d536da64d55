//! Link-layer frame building blocks

/// Maximum transmission unit of a CAN interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Mtu {
    Classic,
    Fd,
}

impl From<Mtu> for usize {
    fn from(value: Mtu) -> Self {
        match value {
            Mtu::Classic => 8,
            Mtu::Fd => 64,
        }
    }
}

#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct IncorrectMtu;

impl TryFrom<usize> for Mtu {
    type Error = IncorrectMtu;
    fn try_from(value: usize) -> Result<Self, Self::Error> {
        match value {
            8 => Ok(Mtu::Classic),
            64 => Ok(Mtu::Fd),
            _ => Err(IncorrectMtu),
        }
    }
}

/// Byte length encoded by each CAN FD data length code.
const DLC_LENGTHS: [usize; 16] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 12, 16, 20, 24, 32, 48, 64];

/// A frame data length expressible with a CAN FD data length code.
///
/// Stored as the code itself; CAN FD supports only the sparse set of lengths
/// in the DLC table above 8 bytes, and Classic frames the subset below their
/// MTU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DataLength(u8);

impl DataLength {
    pub const MAX: usize = 64;

    pub fn new(value: usize) -> Option<Self> {
        let dlc = DLC_LENGTHS.iter().position(|&length| length == value)?;
        Some(Self(dlc as u8))
    }

    /// The largest valid length not exceeding `value`.
    pub fn new_floor(value: usize) -> Self {
        let dlc = DLC_LENGTHS
            .iter()
            .rposition(|&length| length <= value)
            .unwrap_or(0);
        Self(dlc as u8)
    }

    /// The smallest valid length not below `value`, if one exists.
    pub fn new_ceil(value: usize) -> Option<Self> {
        let dlc = DLC_LENGTHS.iter().position(|&length| length >= value)?;
        Some(Self(dlc as u8))
    }

    /// The raw data length code, as programmed into CAN hardware.
    pub fn dlc(&self) -> u8 {
        self.0
    }

    pub fn as_usize(&self) -> usize {
        DLC_LENGTHS[usize::from(self.0)]
    }
}

impl From<DataLength> for usize {
    fn from(value: DataLength) -> Self {
        value.as_usize()
    }
}

#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct InvalidLength;

/// Frame payload vector whose length is always DLC-expressible.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Data {
    bytes: heapless::Vec<u8, { DataLength::MAX }>,
}

impl Data {
    /// Creates a new vector from a slice of compatible length.
    pub fn new(data: &[u8]) -> Result<Self, InvalidLength> {
        DataLength::new(data.len()).ok_or(InvalidLength)?;
        let bytes = heapless::Vec::from_slice(data).map_err(|_| InvalidLength)?;
        Ok(Self { bytes })
    }

    pub fn new_zeros(length: DataLength) -> Self {
        let mut bytes = heapless::Vec::new();
        // Every DLC length fits the backing capacity.
        bytes.resize(length.as_usize(), 0).ok();
        Self { bytes }
    }

    pub fn length(&self) -> DataLength {
        DataLength::new_floor(self.bytes.len())
    }
}

impl core::ops::Deref for Data {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.bytes
    }
}

impl core::ops::DerefMut for Data {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_floor_ceil_bracket_every_length() {
        for len in 0..=80usize {
            let floor = DataLength::new_floor(len);
            assert!(floor.as_usize() <= len);
            assert!(DataLength::new(floor.as_usize()).is_some());

            match DataLength::new_ceil(len) {
                Some(ceil) => {
                    assert!(ceil.as_usize() >= len);
                    assert!(DataLength::new(ceil.as_usize()).is_some());
                    assert!(ceil.as_usize() - len < 16);
                }
                None => assert!(len > DataLength::MAX),
            }
        }
    }

    #[test]
    fn test_dlc_code_round_trip() {
        for dlc in 0..16u8 {
            let length = DataLength::new(DLC_LENGTHS[usize::from(dlc)]).unwrap();
            assert_eq!(length.dlc(), dlc);
            assert_eq!(usize::from(length), DLC_LENGTHS[usize::from(dlc)]);
        }
    }

    #[test]
    fn test_exact_lengths_only() {
        assert!(DataLength::new(8).is_some());
        assert!(DataLength::new(9).is_none());
        assert!(DataLength::new(48).is_some());
        assert!(DataLength::new(65).is_none());
    }

    #[test]
    fn test_data_keeps_dlc_valid_lengths() {
        let data = Data::new(&[1, 2, 3]).unwrap();
        assert_eq!(&data[..], &[1, 2, 3]);
        assert_eq!(data.length().as_usize(), 3);

        assert!(Data::new(&[0; 9]).is_err());
        assert!(Data::new(&[0; 65]).is_err());

        let mut padded = Data::new_zeros(DataLength::new(12).unwrap());
        assert_eq!(padded.len(), 12);
        padded[11] = 0xff;
        assert_eq!(padded[..11], [0; 11]);
    }
}
