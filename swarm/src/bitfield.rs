/// Packed bitset over piece or block indexes.
///
/// Bit order is MSB first within each byte, which is the order the wire
/// BITFIELD message uses, so the raw bytes can be sent and received as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitField(Vec<u8>);

impl BitField {
    pub fn new(data: &[u8]) -> Self {
        Self(data.to_vec())
    }

    /// All-zero field able to address `len` bits.
    pub fn empty(len: usize) -> Self {
        Self(vec![0; len.div_ceil(8).max(1)])
    }

    pub fn has(&self, index: usize) -> bool {
        let Some(byte) = self.0.get(index / 8) else {
            return false;
        };
        byte & mask(index) != 0
    }

    pub fn add(&mut self, index: usize) -> anyhow::Result<()> {
        let Some(byte) = self.0.get_mut(index / 8) else {
            anyhow::bail!("bit {index} is out of range");
        };
        *byte |= mask(index);
        Ok(())
    }

    pub fn remove(&mut self, index: usize) -> anyhow::Result<()> {
        let Some(byte) = self.0.get_mut(index / 8) else {
            anyhow::bail!("bit {index} is out of range");
        };
        *byte &= !mask(index);
        Ok(())
    }

    pub fn count_ones(&self) -> usize {
        self.0.iter().map(|byte| byte.count_ones() as usize).sum()
    }

    /// Indexes of set bits, ascending.
    pub fn pieces(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().enumerate().flat_map(|(i, byte)| {
            (0..8).filter_map(move |bit| (byte & (0x80 >> bit) != 0).then_some(i * 8 + bit))
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Check that the field is sized for exactly `len` bits and carries no
    /// set bits past the end. Wire bitfields that fail this are rejected.
    pub fn validate(&self, len: usize) -> anyhow::Result<()> {
        let capacity = self.0.len() * 8;
        let spare = capacity
            .checked_sub(len)
            .ok_or_else(|| anyhow::anyhow!("bitfield is too small for {len} bits"))?;
        anyhow::ensure!(spare < 8, "bitfield is too large for {len} bits");
        for bit in len..capacity {
            anyhow::ensure!(!self.has(bit), "bitfield has spare bit {bit} set");
        }
        Ok(())
    }
}

impl From<Vec<u8>> for BitField {
    fn from(value: Vec<u8>) -> Self {
        BitField(value)
    }
}

fn mask(index: usize) -> u8 {
    0x80 >> (index % 8)
}
