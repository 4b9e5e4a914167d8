//! Reader for the block index file (formats 1 and 2).
//!
//! Only the symbol table and the series section are decoded; postings are
//! not needed since every series of a block is visited. CRCs are skipped.

use memmap2::Mmap;
use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use super::Corruption;

const INDEX_MAGIC: u32 = 0xBAAD_D700;
const HEADER_LEN: usize = 5;
const TOC_LEN: usize = 6 * 8 + 4;
const SERIES_ALIGNMENT: usize = 16;

/// Cursor over a byte slice.
pub(crate) struct Decbuf<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decbuf<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn bytes(&mut self, n: usize) -> Result<&'a [u8], Corruption> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| Corruption::new("unexpected end of data"))?;
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    pub(crate) fn byte(&mut self) -> Result<u8, Corruption> {
        Ok(self.bytes(1)?[0])
    }

    pub(crate) fn be_u32(&mut self) -> Result<u32, Corruption> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn be_u64(&mut self) -> Result<u64, Corruption> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.bytes(8)?);
        Ok(u64::from_be_bytes(buf))
    }

    pub(crate) fn uvarint(&mut self) -> Result<u64, Corruption> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.byte()?;
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

    pub(crate) fn varint(&mut self) -> Result<i64, Corruption> {
        Ok(super::xor::zigzag_decode(self.uvarint()?))
    }

    fn uvarint_usize(&mut self) -> Result<usize, Corruption> {
        usize::try_from(self.uvarint()?).map_err(|_| Corruption::new("length out of range"))
    }

    fn uvarint_u32(&mut self) -> Result<u32, Corruption> {
        u32::try_from(self.uvarint()?).map_err(|_| Corruption::new("reference out of range"))
    }

    pub(crate) fn uvarint_str(&mut self) -> Result<&'a str, Corruption> {
        let len = self.uvarint_usize()?;
        std::str::from_utf8(self.bytes(len)?).map_err(|_| Corruption::new("symbol is not UTF-8"))
    }
}

/// Table of contents at the end of the index file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Toc {
    pub symbols: u64,
    pub series: u64,
    pub label_indices: u64,
    pub label_offset_table: u64,
    pub postings: u64,
    pub postings_offset_table: u64,
}

impl Toc {
    fn as_array(&self) -> [u64; 6] {
        [
            self.symbols,
            self.series,
            self.label_indices,
            self.label_offset_table,
            self.postings,
            self.postings_offset_table,
        ]
    }
}

/// Where a chunk of a series lives and the time range it covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkMeta {
    /// Inclusive minimum timestamp.
    pub min_time: i64,
    /// Inclusive maximum timestamp.
    pub max_time: i64,
    /// Segment sequence in the upper 32 bits, byte offset in the lower.
    pub reference: u64,
}

/// One decoded series entry.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesEntry {
    /// Label pairs, sorted by name.
    pub labels: Vec<(String, String)>,
    /// Chunks in time order.
    pub chunks: Vec<ChunkMeta>,
}

/// Memory-mapped index file.
pub struct IndexReader {
    data: Mmap,
    version: u8,
    toc: Toc,
    symbols: Vec<String>,
    // Format 1 refers to symbols by file offset
    symbol_offsets: HashMap<u32, usize>,
    series_end: usize,
}

impl IndexReader {
    /// Maps and validates an index file.
    pub fn open(path: &Path) -> Result<Self, Corruption> {
        let file = File::open(path)
            .map_err(|e| Corruption::new(format!("cannot open {}: {}", path.display(), e)))?;

        // SAFETY: the file is opened read-only and blocks of a snapshot are
        // immutable, so the mapped bytes do not change while we hold them.
        let data = unsafe { Mmap::map(&file) }
            .map_err(|e| Corruption::new(format!("cannot map {}: {}", path.display(), e)))?;

        if data.len() < HEADER_LEN + TOC_LEN {
            return Err(Corruption::new("index file too short"));
        }
        let mut header = Decbuf::new(&data[..HEADER_LEN]);
        if header.be_u32()? != INDEX_MAGIC {
            return Err(Corruption::new("invalid index magic number"));
        }
        let version = header.byte()?;
        if !matches!(version, 1 | 2) {
            return Err(Corruption::new(format!("unsupported index version {}", version)));
        }

        let toc_start = data.len() - TOC_LEN;
        let mut d = Decbuf::new(&data[toc_start..]);
        let toc = Toc {
            symbols: d.be_u64()?,
            series: d.be_u64()?,
            label_indices: d.be_u64()?,
            label_offset_table: d.be_u64()?,
            postings: d.be_u64()?,
            postings_offset_table: d.be_u64()?,
        };

        let series_end = toc
            .as_array()
            .into_iter()
            .filter(|&off| off > toc.series)
            .min()
            .and_then(|off| usize::try_from(off).ok())
            .unwrap_or(toc_start)
            .min(toc_start);

        let mut reader = Self {
            data,
            version,
            toc,
            symbols: Vec::new(),
            symbol_offsets: HashMap::new(),
            series_end,
        };
        reader.read_symbols()?;
        Ok(reader)
    }

    /// Index format version.
    #[must_use]
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Number of symbols in the table.
    #[must_use]
    pub fn symbol_count(&self) -> usize {
        self.symbols.len()
    }

    fn read_symbols(&mut self) -> Result<(), Corruption> {
        let start = usize::try_from(self.toc.symbols)
            .ok()
            .filter(|&s| s >= HEADER_LEN && s < self.data.len())
            .ok_or_else(|| Corruption::new("symbol table offset out of range"))?;

        let mut d = Decbuf::new(&self.data[start..]);
        let len = d.be_u32()? as usize;
        let content_start = start + 4;
        let mut content = Decbuf::new(d.bytes(len)?);
        let count = content.be_u32()?;

        let mut symbols = Vec::with_capacity(count as usize);
        let mut offsets = HashMap::new();
        for _ in 0..count {
            let offset = content_start + content.position();
            let symbol = content.uvarint_str()?.to_string();
            if self.version == 1 {
                let key = u32::try_from(offset)
                    .map_err(|_| Corruption::new("symbol offset out of range"))?;
                offsets.insert(key, symbols.len());
            }
            symbols.push(symbol);
        }

        self.symbols = symbols;
        self.symbol_offsets = offsets;
        Ok(())
    }

    fn symbol(&self, reference: u32) -> Result<&str, Corruption> {
        let idx = if self.version == 1 {
            self.symbol_offsets.get(&reference).copied()
        } else {
            Some(reference as usize)
        };
        idx.and_then(|i| self.symbols.get(i))
            .map(String::as_str)
            .ok_or_else(|| Corruption::new(format!("unknown symbol reference {}", reference)))
    }

    /// Offset of the first series entry, for use with [`next_series`](Self::next_series).
    #[must_use]
    pub fn series_start(&self) -> usize {
        usize::try_from(self.toc.series).unwrap_or(usize::MAX)
    }

    /// Decodes the series entry at `cursor` and advances it.
    ///
    /// Returns `None` at the end of the series section.
    pub fn next_series(&self, cursor: &mut usize) -> Result<Option<SeriesEntry>, Corruption> {
        let mut offset = *cursor;
        if self.version >= 2 {
            offset = offset.div_ceil(SERIES_ALIGNMENT) * SERIES_ALIGNMENT;
        }
        if offset >= self.series_end {
            *cursor = offset;
            return Ok(None);
        }

        let mut d = Decbuf::new(&self.data[offset..self.series_end]);
        let len = d.uvarint_usize()?;
        if len == 0 {
            *cursor = self.series_end;
            return Ok(None);
        }
        let body = d.bytes(len)?;
        d.bytes(4)?;
        *cursor = offset + d.position();

        self.decode_series(body).map(Some)
    }

    fn decode_series(&self, body: &[u8]) -> Result<SeriesEntry, Corruption> {
        let mut d = Decbuf::new(body);

        let label_count = d.uvarint_usize()?;
        let mut labels = Vec::with_capacity(label_count.min(64));
        for _ in 0..label_count {
            let name = self.symbol(d.uvarint_u32()?)?;
            let value = self.symbol(d.uvarint_u32()?)?;
            labels.push((name.to_string(), value.to_string()));
        }

        let chunk_count = d.uvarint_usize()?;
        let mut chunks = Vec::with_capacity(chunk_count.min(1024));
        let mut prev: Option<ChunkMeta> = None;
        for _ in 0..chunk_count {
            let meta = match prev {
                None => {
                    let min_time = d.varint()?;
                    let max_time = min_time.wrapping_add(d.uvarint()? as i64);
                    ChunkMeta {
                        min_time,
                        max_time,
                        reference: d.uvarint()?,
                    }
                }
                Some(p) => {
                    let min_time = p.max_time.wrapping_add(d.uvarint()? as i64);
                    let max_time = min_time.wrapping_add(d.uvarint()? as i64);
                    ChunkMeta {
                        min_time,
                        max_time,
                        reference: p.reference.wrapping_add_signed(d.varint()?),
                    }
                }
            };
            chunks.push(meta);
            prev = Some(meta);
        }

        Ok(SeriesEntry { labels, chunks })
    }
}
