//! Reader for the chunk segment files of a block (`chunks/000001`, ...).

use memmap2::Mmap;
use std::fs::{self, File};
use std::path::Path;

use super::index::Decbuf;
use super::Corruption;

const SEGMENT_MAGIC: u32 = 0x85BD_40DD;
const SEGMENT_HEADER_LEN: usize = 8;

/// Chunk encoding of Gorilla-compressed float samples.
pub const ENCODING_XOR: u8 = 1;

/// A raw chunk as stored on disk.
#[derive(Debug, Clone, Copy)]
pub struct RawChunk<'a> {
    /// Encoding byte.
    pub encoding: u8,
    /// Encoded payload.
    pub data: &'a [u8],
}

/// Memory-mapped segment files of one block.
pub struct ChunkReader {
    segments: Vec<Mmap>,
}

impl ChunkReader {
    /// Maps every segment in `dir`, ordered by file name.
    pub fn open(dir: &Path) -> Result<Self, Corruption> {
        let entries = fs::read_dir(dir)
            .map_err(|e| Corruption::new(format!("cannot list {}: {}", dir.display(), e)))?;

        let mut paths: Vec<_> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
            })
            .collect();
        paths.sort();

        let mut segments = Vec::with_capacity(paths.len());
        for path in paths {
            let file = File::open(&path)
                .map_err(|e| Corruption::new(format!("cannot open {}: {}", path.display(), e)))?;
            // SAFETY: segment files of a persisted block are never written
            // again and are opened read-only.
            let data = unsafe { Mmap::map(&file) }
                .map_err(|e| Corruption::new(format!("cannot map {}: {}", path.display(), e)))?;

            if data.len() < SEGMENT_HEADER_LEN {
                return Err(Corruption::new(format!("{} too short", path.display())));
            }
            let mut header = Decbuf::new(&data[..SEGMENT_HEADER_LEN]);
            if header.be_u32()? != SEGMENT_MAGIC {
                return Err(Corruption::new(format!(
                    "{}: invalid segment magic number",
                    path.display()
                )));
            }
            segments.push(data);
        }

        Ok(Self { segments })
    }

    /// Number of segment files.
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Looks up the chunk a series entry refers to.
    pub fn chunk(&self, reference: u64) -> Result<RawChunk<'_>, Corruption> {
        let seq = (reference >> 32) as usize;
        let offset = (reference & 0xffff_ffff) as usize;

        let segment = self
            .segments
            .get(seq)
            .ok_or_else(|| Corruption::new(format!("chunk segment {} not found", seq)))?;
        if offset < SEGMENT_HEADER_LEN || offset >= segment.len() {
            return Err(Corruption::new(format!(
                "chunk offset {} out of range in segment {}",
                offset, seq
            )));
        }

        let mut d = Decbuf::new(&segment[offset..]);
        let len = usize::try_from(d.uvarint()?)
            .map_err(|_| Corruption::new("chunk length out of range"))?;
        let encoding = d.byte()?;
        let data = d.bytes(len)?;
        Ok(RawChunk { encoding, data })
    }
}
