//! Hash → hexagram decoding.
//!
//! The 64 hex digits are cut into six contiguous segments, bottom line first.
//! Lines 0..=4 take ten digits each; the top line takes the last fourteen
//! (its ten plus the four-digit remainder), so every digit is used:
//!
//! ```text
//! line:   0        1        2        3        4        5
//! digits: [0,10)   [10,20)  [20,30)  [30,40)  [40,50)  [50,64)
//! ```
//!
//! Within a segment the three signals come from disjoint digits:
//! - `bit`: parity of the segment integer (low bit of the last digit)
//! - `is_changing`: the first digit is an extreme nibble, `0` or `f`
//! - `energy_level`: digits `[1,5)` as a 16-bit integer over `0xffff`

use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};

use crate::error::FateError;
use crate::hash::{Hash, HASH_HEX_LEN};

pub const LINE_COUNT: usize = 6;
pub const SEGMENT_LEN: usize = 10;
pub const KEY_COUNT: u8 = 64;

const ENERGY_DIGITS: std::ops::Range<usize> = 1..5;

/// One line of a hexagram, index 0 at the bottom.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Line {
    pub bit: u8,
    pub is_changing: bool,
    pub energy_level: f64,
    pub raw_segment: String,
}

/// Traditional reading of a line: its bit combined with its stability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    OldYin,
    YoungYang,
    YoungYin,
    OldYang,
}

impl LineKind {
    /// Ritual number of the line (6, 7, 8 or 9).
    pub fn ritual_value(self) -> u8 {
        match self {
            LineKind::OldYin => 6,
            LineKind::YoungYang => 7,
            LineKind::YoungYin => 8,
            LineKind::OldYang => 9,
        }
    }
}

impl Line {
    pub fn is_yang(&self) -> bool {
        self.bit == 1
    }

    pub fn kind(&self) -> LineKind {
        match (self.bit, self.is_changing) {
            (0, true) => LineKind::OldYin,
            (0, false) => LineKind::YoungYin,
            (_, true) => LineKind::OldYang,
            (_, false) => LineKind::YoungYang,
        }
    }
}

/// Six lines. The key is derived from the lines on every call and is never
/// stored, so the two can't disagree.
#[derive(Debug, Clone, PartialEq)]
pub struct Hexagram {
    lines: [Line; LINE_COUNT],
}

impl Hexagram {
    pub fn from_lines(lines: [Line; LINE_COUNT]) -> Self {
        Self { lines }
    }

    pub fn lines(&self) -> &[Line; LINE_COUNT] {
        &self.lines
    }

    pub fn line(&self, index: usize) -> Option<&Line> {
        self.lines.get(index)
    }

    /// 6-bit key, line `i` contributing `bit << i`.
    pub fn key(&self) -> u8 {
        self.lines
            .iter()
            .enumerate()
            .fold(0u8, |acc, (i, line)| acc | ((line.bit & 1) << i))
    }

    pub fn lower_trigram(&self) -> u8 {
        self.key() & 0b111
    }

    pub fn upper_trigram(&self) -> u8 {
        self.key() >> 3
    }

    pub fn changing_lines(&self) -> Vec<usize> {
        self.lines
            .iter()
            .enumerate()
            .filter(|(_, l)| l.is_changing)
            .map(|(i, _)| i)
            .collect()
    }

    /// The "next" reading: every changing line inverted and settled.
    pub fn relating(&self) -> Hexagram {
        let lines = self.lines.clone().map(|mut line| {
            if line.is_changing {
                line.bit ^= 1;
                line.is_changing = false;
            }
            line
        });
        Hexagram { lines }
    }

    /// Mean energy across the six lines.
    pub fn energy(&self) -> f64 {
        self.lines.iter().map(|l| l.energy_level).sum::<f64>() / LINE_COUNT as f64
    }
}

impl Serialize for Hexagram {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("Hexagram", 2)?;
        s.serialize_field("key", &self.key())?;
        s.serialize_field("lines", &self.lines)?;
        s.end()
    }
}

/// Decode raw hash text. Malformed input is `InvalidHash` and yields nothing.
pub fn decode(input: &str) -> Result<Hexagram, FateError> {
    let hash = Hash::parse(input)?;
    Ok(decode_hash(&hash))
}

/// Decode an already-validated hash. Infallible and allocation-bounded.
pub fn decode_hash(hash: &Hash) -> Hexagram {
    let digits = hash.digits();
    Hexagram {
        lines: std::array::from_fn(|i| decode_segment(segment(digits, i))),
    }
}

fn segment(digits: &str, index: usize) -> &str {
    let start = index * SEGMENT_LEN;
    let end = if index == LINE_COUNT - 1 {
        HASH_HEX_LEN
    } else {
        start + SEGMENT_LEN
    };
    &digits[start..end]
}

fn decode_segment(seg: &str) -> Line {
    let bytes = seg.as_bytes();
    let last = nibble(bytes[bytes.len() - 1]);
    let first = nibble(bytes[0]);
    let energy = bytes[ENERGY_DIGITS]
        .iter()
        .fold(0u32, |acc, b| (acc << 4) | nibble(*b) as u32);

    Line {
        bit: last & 1,
        is_changing: first == 0x0 || first == 0xf,
        energy_level: energy as f64 / u16::MAX as f64,
        raw_segment: seg.to_string(),
    }
}

fn nibble(b: u8) -> u8 {
    match b {
        b'0'..=b'9' => b - b'0',
        b'a'..=b'f' => b - b'a' + 10,
        b'A'..=b'F' => b - b'A' + 10,
        _ => 0,
    }
}
