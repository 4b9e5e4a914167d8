//! Gorilla-style XOR chunk decoding (Prometheus chunk encoding 1).
//!
//! Layout: a 2-byte big-endian sample count followed by a bit stream. The
//! first sample stores its timestamp as a varint and its value raw; the
//! second a uvarint timestamp delta; later samples store delta-of-deltas in
//! variable-width buckets. Values are XORed against the previous value.

use super::Corruption;

/// Bit reader over a byte slice, most significant bit first.
pub(crate) struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read_bit(&mut self) -> Result<bool, Corruption> {
        let byte = self
            .data
            .get(self.pos / 8)
            .ok_or_else(|| Corruption::new("bit stream truncated"))?;
        let bit = byte & (0x80 >> (self.pos % 8)) != 0;
        self.pos += 1;
        Ok(bit)
    }

    pub(crate) fn read_bits(&mut self, n: u8) -> Result<u64, Corruption> {
        let mut out = 0u64;
        for _ in 0..n {
            out = (out << 1) | u64::from(self.read_bit()?);
        }
        Ok(out)
    }

    fn read_byte(&mut self) -> Result<u8, Corruption> {
        // Value fits in 8 bits
        Ok(self.read_bits(8)? as u8)
    }

    fn read_uvarint(&mut self) -> Result<u64, Corruption> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.read_byte()?;
            if shift >= 64 {
                return Err(Corruption::new("varint overflow"));
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    fn read_varint(&mut self) -> Result<i64, Corruption> {
        let u = self.read_uvarint()?;
        Ok(zigzag_decode(u))
    }
}

pub(crate) fn zigzag_decode(u: u64) -> i64 {
    ((u >> 1) as i64) ^ -((u & 1) as i64)
}

/// Iterator over the samples of one XOR chunk.
pub struct XorIterator<'a> {
    reader: BitReader<'a>,
    total: u16,
    read: u16,
    t: i64,
    t_delta: i64,
    value: u64,
    leading: u8,
    trailing: u8,
    failed: bool,
}

impl<'a> XorIterator<'a> {
    /// Opens the chunk payload (sample count header included).
    pub fn new(data: &'a [u8]) -> Result<Self, Corruption> {
        let (header, rest) = data
            .split_first_chunk::<2>()
            .ok_or_else(|| Corruption::new("xor chunk shorter than its header"))?;
        Ok(Self {
            reader: BitReader::new(rest),
            total: u16::from_be_bytes(*header),
            read: 0,
            t: 0,
            t_delta: 0,
            value: 0,
            leading: 0,
            trailing: 0,
            failed: false,
        })
    }

    /// Number of samples the header announces.
    #[must_use]
    pub fn sample_count(&self) -> usize {
        usize::from(self.total)
    }

    fn next_sample(&mut self) -> Result<(i64, f64), Corruption> {
        match self.read {
            0 => {
                self.t = self.reader.read_varint()?;
                self.value = self.reader.read_bits(64)?;
            }
            1 => {
                self.t_delta = self.reader.read_uvarint()? as i64;
                self.t = self.t.wrapping_add(self.t_delta);
                self.read_value()?;
            }
            _ => {
                let dod = self.read_dod()?;
                self.t_delta = self.t_delta.wrapping_add(dod);
                self.t = self.t.wrapping_add(self.t_delta);
                self.read_value()?;
            }
        }
        self.read += 1;
        Ok((self.t, f64::from_bits(self.value)))
    }

    fn read_dod(&mut self) -> Result<i64, Corruption> {
        let mut control = 0u8;
        for _ in 0..4 {
            control <<= 1;
            if !self.reader.read_bit()? {
                break;
            }
            control |= 1;
        }

        let size = match control {
            0b0000 => return Ok(0),
            0b0010 => 14,
            0b0110 => 17,
            0b1110 => 20,
            0b1111 => return Ok(self.reader.read_bits(64)? as i64),
            other => return Err(Corruption::new(format!("bad dod control bits {:#b}", other))),
        };

        let mut bits = self.reader.read_bits(size)? as i64;
        if bits > 1 << (size - 1) {
            bits -= 1 << size;
        }
        Ok(bits)
    }

    fn read_value(&mut self) -> Result<(), Corruption> {
        if !self.reader.read_bit()? {
            return Ok(());
        }
        if self.reader.read_bit()? {
            self.leading = self.reader.read_bits(5)? as u8;
            let mut significant = self.reader.read_bits(6)? as u8;
            // 64 significant bits wrap to 0 in six bits
            if significant == 0 {
                significant = 64;
            }
            self.trailing = 64u8
                .checked_sub(self.leading + significant)
                .ok_or_else(|| Corruption::new("xor value window out of range"))?;
        }

        let significant = 64 - self.leading - self.trailing;
        let bits = self.reader.read_bits(significant)?;
        self.value ^= bits << self.trailing;
        Ok(())
    }
}

impl Iterator for XorIterator<'_> {
    type Item = Result<(i64, f64), Corruption>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.read >= self.total {
            return None;
        }
        let sample = self.next_sample();
        if sample.is_err() {
            self.failed = true;
        }
        Some(sample)
    }
}


#[cfg(test)]
mod tests {
    use super::encode::xor_chunk;
    use super::*;
    use proptest::prelude::*;

    fn decode(data: &[u8]) -> Vec<(i64, f64)> {
        XorIterator::new(data)
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn test_regular_scrape_interval() {
        let samples: Vec<(i64, f64)> = (0..120)
            .map(|i| (1_600_000_000_000 + i * 15_000, i as f64 * 0.5))
            .collect();
        assert_eq!(decode(&xor_chunk(&samples)), samples);
    }

    #[test]
    fn test_jittered_timestamps_hit_every_bucket() {
        let samples = vec![
            (1_000, 1.0),
            (16_000, 1.0),
            (31_003, 2.5),
            (46_000, -3.25),
            (100_000, 1e300),
            (160_000, 0.0),
            (1_160_000, f64::MIN_POSITIVE),
            (1_160_001, 7.0),
            (900_000_000_000, 7.0),
        ];
        assert_eq!(decode(&xor_chunk(&samples)), samples);
    }

    #[test]
    fn test_single_sample() {
        assert_eq!(decode(&xor_chunk(&[(-5, 42.0)])), vec![(-5, 42.0)]);
    }

    #[test]
    fn test_truncated_chunk_fails() {
        let mut data = xor_chunk(&[(1, 1.0), (2, 2.0), (3, 3.0)]);
        data.truncate(6);
        let results: Vec<_> = XorIterator::new(&data).unwrap().collect();
        assert!(results.last().unwrap().is_err());
        assert!(XorIterator::new(&[0]).is_err());
    }

    proptest! {
        #[test]
        fn prop_decodes_what_prometheus_encodes(
            start in -1_000_000_000i64..1_000_000_000_000,
            steps in proptest::collection::vec((1i64..10_000_000, -1e12f64..1e12), 1..200),
        ) {
            let mut t = start;
            let samples: Vec<(i64, f64)> = steps
                .iter()
                .map(|&(dt, v)| {
                    t += dt;
                    (t, v)
                })
                .collect();
            prop_assert_eq!(decode(&xor_chunk(&samples)), samples);
        }
    }
}
