//! Writes minimal TSDB blocks for tests. CRC fields are zeroed.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::xor::encode::xor_chunk;

type Labels = Vec<(String, String)>;

fn put_uvarint(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push(v as u8 | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

fn put_varint(buf: &mut Vec<u8>, v: i64) {
    put_uvarint(buf, ((v << 1) ^ (v >> 63)) as u64);
}

fn pad_to(buf: &mut Vec<u8>, alignment: usize) {
    while buf.len() % alignment != 0 {
        buf.push(0);
    }
}

/// Builder for one block directory.
pub(crate) struct BlockBuilder {
    version: u8,
    series: Vec<(Labels, Vec<Vec<(i64, f64)>>)>,
    broken_refs: bool,
}

impl BlockBuilder {
    pub(crate) fn new() -> Self {
        Self {
            version: 2,
            series: Vec::new(),
            broken_refs: false,
        }
    }

    /// Use index format 1 (offset-based symbol refs, unaligned series).
    pub(crate) fn index_v1(mut self) -> Self {
        self.version = 1;
        self
    }

    /// Points the first series' first chunk at a missing segment.
    pub(crate) fn break_first_chunk(mut self) -> Self {
        self.broken_refs = true;
        self
    }

    /// Adds a series; each inner vec becomes one chunk.
    pub(crate) fn series(mut self, labels: &[(&str, &str)], chunks: Vec<Vec<(i64, f64)>>) -> Self {
        let mut labels: Labels = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        labels.sort();
        self.series.push((labels, chunks));
        self
    }

    /// Writes `<root>/<ulid>/` and returns its path.
    pub(crate) fn write(&self, root: &Path, ulid: &str) -> PathBuf {
        let dir = root.join(ulid);
        fs::create_dir_all(dir.join("chunks")).unwrap();

        // Segment file
        let mut segment = 0x85BD_40DDu32.to_be_bytes().to_vec();
        segment.extend_from_slice(&[1, 0, 0, 0]);
        let mut refs: Vec<Vec<(i64, i64, u64)>> = Vec::new();
        for (_, chunks) in &self.series {
            let mut metas = Vec::new();
            for samples in chunks {
                let data = xor_chunk(samples);
                let reference = segment.len() as u64;
                put_uvarint(&mut segment, data.len() as u64);
                segment.push(1);
                segment.extend_from_slice(&data);
                segment.extend_from_slice(&[0; 4]);
                let min = samples.first().map_or(0, |s| s.0);
                let max = samples.last().map_or(0, |s| s.0);
                metas.push((min, max, reference));
            }
            refs.push(metas);
        }
        if self.broken_refs {
            if let Some(first) = refs.first_mut().and_then(|m| m.first_mut()) {
                first.2 |= 7 << 32;
            }
        }
        fs::write(dir.join("chunks").join("000001"), &segment).unwrap();

        // Index
        let symbols: Vec<&str> = {
            let mut set: Vec<&str> = self
                .series
                .iter()
                .flat_map(|(labels, _)| labels.iter().flat_map(|(k, v)| [k.as_str(), v.as_str()]))
                .collect();
            set.sort_unstable();
            set.dedup();
            set
        };

        let mut index = 0xBAAD_D700u32.to_be_bytes().to_vec();
        index.push(self.version);

        let symbols_offset = index.len() as u64;
        let mut content = (symbols.len() as u32).to_be_bytes().to_vec();
        let mut symbol_refs: BTreeMap<&str, u64> = BTreeMap::new();
        for (i, &s) in symbols.iter().enumerate() {
            let reference = if self.version == 1 {
                symbols_offset + 4 + content.len() as u64
            } else {
                i as u64
            };
            symbol_refs.insert(s, reference);
            put_uvarint(&mut content, s.len() as u64);
            content.extend_from_slice(s.as_bytes());
        }
        index.extend_from_slice(&(content.len() as u32).to_be_bytes());
        index.extend_from_slice(&content);
        index.extend_from_slice(&[0; 4]);

        if self.version == 2 {
            pad_to(&mut index, 16);
        }
        let series_offset = index.len() as u64;
        for ((labels, _), metas) in self.series.iter().zip(&refs) {
            if self.version == 2 {
                pad_to(&mut index, 16);
            }
            let mut body = Vec::new();
            put_uvarint(&mut body, labels.len() as u64);
            for (k, v) in labels {
                put_uvarint(&mut body, symbol_refs[k.as_str()]);
                put_uvarint(&mut body, symbol_refs[v.as_str()]);
            }
            put_uvarint(&mut body, metas.len() as u64);
            let mut prev: Option<(i64, i64, u64)> = None;
            for &(min, max, reference) in metas {
                match prev {
                    None => {
                        put_varint(&mut body, min);
                        put_uvarint(&mut body, (max - min) as u64);
                        put_uvarint(&mut body, reference);
                    }
                    Some((_, prev_max, prev_ref)) => {
                        put_uvarint(&mut body, (min - prev_max) as u64);
                        put_uvarint(&mut body, (max - min) as u64);
                        put_varint(&mut body, reference as i64 - prev_ref as i64);
                    }
                }
                prev = Some((min, max, reference));
            }
            put_uvarint(&mut index, body.len() as u64);
            index.extend_from_slice(&body);
            index.extend_from_slice(&[0; 4]);
        }

        for offset in [symbols_offset, series_offset, 0, 0, 0, 0] {
            index.extend_from_slice(&offset.to_be_bytes());
        }
        index.extend_from_slice(&[0; 4]);
        fs::write(dir.join("index"), &index).unwrap();

        // Meta
        let all: Vec<i64> = self
            .series
            .iter()
            .flat_map(|(_, chunks)| chunks.iter().flatten().map(|s| s.0))
            .collect();
        let min_time = all.iter().copied().min().unwrap_or(0);
        let max_time = all.iter().copied().max().unwrap_or(0) + 1;
        let meta = serde_json::json!({
            "ulid": ulid,
            "minTime": min_time,
            "maxTime": max_time,
            "stats": {"numSamples": all.len(), "numSeries": self.series.len()},
            "version": 1,
        });
        fs::write(dir.join("meta.json"), meta.to_string()).unwrap();

        dir
    }
}
