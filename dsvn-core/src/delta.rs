//! svndiff text deltas
//!
//! A delta turns a source text into a target text as a sequence of windows.
//! Each window describes one slice of the target in terms of a slice of the
//! source (the source view), earlier bytes of the same target window, and
//! literal new data. The serialized form is svndiff version 0:
//!
//! ```text
//! "SVN\0"
//! window* := sview_offset sview_len tview_len instr_len new_len instr[] new[]
//! instr   := (opcode << 6 | len) [len as varint if 0] [offset as varint]
//! ```
//!
//! Integers are big-endian base-128 varints with the high bit marking
//! continuation. Opcodes: 0 copy from source, 1 copy from target, 2 new data.

use thiserror::Error;

/// Magic + version prefix of an svndiff0 stream
pub const SVNDIFF0_HEADER: &[u8; 4] = b"SVN\0";

/// Default target bytes per window
pub const DEFAULT_WINDOW_SIZE: usize = 100 * 1024;

/// Minimum match length considered by the block matcher
const BLOCK_SIZE: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeltaError {
    #[error("invalid svndiff header")]
    InvalidHeader,

    #[error("truncated svndiff data")]
    Truncated,

    #[error("invalid delta instruction opcode {0}")]
    InvalidInstruction(u8),

    #[error("source view [{offset}, {offset}+{len}) exceeds source of {available} bytes")]
    SourceOutOfRange { offset: u64, len: u64, available: u64 },

    #[error("instruction reads outside its view")]
    ViewOutOfRange,

    #[error("window produced {actual} bytes, expected {expected}")]
    LengthMismatch { expected: u64, actual: u64 },
}

pub type Result<T> = std::result::Result<T, DeltaError>;

/// One delta instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaOp {
    /// Copy `len` bytes from the source view at `offset`
    Source { offset: u64, len: u64 },
    /// Copy `len` bytes of already produced target at `offset`; may overlap
    Target { offset: u64, len: u64 },
    /// Take the next `len` bytes of the window's new data
    New { len: u64 },
}

impl DeltaOp {
    fn len(&self) -> u64 {
        match *self {
            DeltaOp::Source { len, .. } | DeltaOp::Target { len, .. } | DeltaOp::New { len } => len,
        }
    }
}

/// One window of a text delta
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaWindow {
    pub sview_offset: u64,
    pub sview_len: u64,
    pub tview_len: u64,
    pub ops: Vec<DeltaOp>,
    pub new_data: Vec<u8>,
}

impl DeltaWindow {
    /// A window that carries `data` literally
    pub fn literal(data: &[u8]) -> Self {
        Self {
            sview_offset: 0,
            sview_len: 0,
            tview_len: data.len() as u64,
            ops: vec![DeltaOp::New {
                len: data.len() as u64,
            }],
            new_data: data.to_vec(),
        }
    }

    /// Append the serialized window to `out`
    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut instructions = Vec::new();
        for op in &self.ops {
            let (opcode, offset) = match *op {
                DeltaOp::Source { offset, .. } => (0u8, Some(offset)),
                DeltaOp::Target { offset, .. } => (1u8, Some(offset)),
                DeltaOp::New { .. } => (2u8, None),
            };
            let len = op.len();
            if len > 0 && len < 0x40 {
                instructions.push((opcode << 6) | len as u8);
            } else {
                instructions.push(opcode << 6);
                write_varint(&mut instructions, len);
            }
            if let Some(offset) = offset {
                write_varint(&mut instructions, offset);
            }
        }

        write_varint(out, self.sview_offset);
        write_varint(out, self.sview_len);
        write_varint(out, self.tview_len);
        write_varint(out, instructions.len() as u64);
        write_varint(out, self.new_data.len() as u64);
        out.extend_from_slice(&instructions);
        out.extend_from_slice(&self.new_data);
    }

    /// Decode one window starting at `pos`; returns the window and the
    /// position after it.
    pub fn decode(data: &[u8], pos: usize) -> Result<(Self, usize)> {
        let (sview_offset, pos) = read_varint(data, pos)?;
        let (sview_len, pos) = read_varint(data, pos)?;
        let (tview_len, pos) = read_varint(data, pos)?;
        let (instr_len, pos) = read_varint(data, pos)?;
        let (new_len, pos) = read_varint(data, pos)?;

        let instr_end = pos
            .checked_add(instr_len as usize)
            .ok_or(DeltaError::Truncated)?;
        let new_end = instr_end
            .checked_add(new_len as usize)
            .ok_or(DeltaError::Truncated)?;
        if new_end > data.len() {
            return Err(DeltaError::Truncated);
        }

        let instructions = &data[pos..instr_end];
        let mut ops = Vec::new();
        let mut ipos = 0;
        while ipos < instructions.len() {
            let byte = instructions[ipos];
            ipos += 1;
            let opcode = byte >> 6;
            let mut len = (byte & 0x3f) as u64;
            if len == 0 {
                let (l, next) = read_varint(instructions, ipos)?;
                len = l;
                ipos = next;
            }
            let op = match opcode {
                0 | 1 => {
                    let (offset, next) = read_varint(instructions, ipos)?;
                    ipos = next;
                    if opcode == 0 {
                        DeltaOp::Source { offset, len }
                    } else {
                        DeltaOp::Target { offset, len }
                    }
                }
                2 => DeltaOp::New { len },
                other => return Err(DeltaError::InvalidInstruction(other)),
            };
            ops.push(op);
        }

        let window = DeltaWindow {
            sview_offset,
            sview_len,
            tview_len,
            ops,
            new_data: data[instr_end..new_end].to_vec(),
        };
        Ok((window, new_end))
    }

    /// Reconstruct this window's target bytes from the whole source text,
    /// appending them to `out`.
    pub fn apply(&self, source: &[u8], out: &mut Vec<u8>) -> Result<()> {
        let start = self.sview_offset as usize;
        let end = start.saturating_add(self.sview_len as usize);
        if end > source.len() {
            return Err(DeltaError::SourceOutOfRange {
                offset: self.sview_offset,
                len: self.sview_len,
                available: source.len() as u64,
            });
        }
        let sview = &source[start..end];

        let mut tview: Vec<u8> = Vec::with_capacity(self.tview_len as usize);
        let mut new_pos = 0usize;
        for op in &self.ops {
            match *op {
                DeltaOp::Source { offset, len } => {
                    let from = offset as usize;
                    let to = from.checked_add(len as usize).ok_or(DeltaError::ViewOutOfRange)?;
                    let bytes = sview.get(from..to).ok_or(DeltaError::ViewOutOfRange)?;
                    tview.extend_from_slice(bytes);
                }
                DeltaOp::Target { offset, len } => {
                    let from = offset as usize;
                    if from >= tview.len() && len > 0 {
                        return Err(DeltaError::ViewOutOfRange);
                    }
                    // Byte at a time: the copy may read what it just wrote.
                    for i in 0..len as usize {
                        let b = tview[from + i];
                        tview.push(b);
                    }
                }
                DeltaOp::New { len } => {
                    let to = new_pos
                        .checked_add(len as usize)
                        .ok_or(DeltaError::ViewOutOfRange)?;
                    let bytes = self
                        .new_data
                        .get(new_pos..to)
                        .ok_or(DeltaError::ViewOutOfRange)?;
                    tview.extend_from_slice(bytes);
                    new_pos = to;
                }
            }
        }

        if tview.len() as u64 != self.tview_len {
            return Err(DeltaError::LengthMismatch {
                expected: self.tview_len,
                actual: tview.len() as u64,
            });
        }
        out.extend_from_slice(&tview);
        Ok(())
    }
}

/// Write a base-128 varint, most significant group first
pub fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    let mut groups = [0u8; 10];
    let mut n = 0;
    loop {
        groups[n] = (value & 0x7f) as u8;
        n += 1;
        value >>= 7;
        if value == 0 {
            break;
        }
    }
    for i in (0..n).rev() {
        let continuation = if i > 0 { 0x80 } else { 0 };
        out.push(groups[i] | continuation);
    }
}

/// Read a base-128 varint at `pos`; returns the value and the next position
pub fn read_varint(data: &[u8], pos: usize) -> Result<(u64, usize)> {
    let mut result: u64 = 0;
    let mut p = pos;
    loop {
        let byte = *data.get(p).ok_or(DeltaError::Truncated)?;
        result = (result << 7) | (byte & 0x7f) as u64;
        p += 1;
        if byte & 0x80 == 0 {
            break;
        }
        if p - pos >= 10 {
            return Err(DeltaError::Truncated);
        }
    }
    Ok((result, p))
}

/// Adler-style checksum over a fixed-size block that can roll one byte
struct RollingHash {
    a: u32,
    b: u32,
}

impl RollingHash {
    fn new(block: &[u8]) -> Self {
        let mut a: u32 = 0;
        let mut b: u32 = 0;
        for &byte in block {
            a = a.wrapping_add(byte as u32);
            b = b.wrapping_add(a);
        }
        Self { a, b }
    }

    fn roll(&mut self, out: u8, inp: u8) {
        self.a = self.a.wrapping_sub(out as u32).wrapping_add(inp as u32);
        self.b = self
            .b
            .wrapping_sub((BLOCK_SIZE as u32).wrapping_mul(out as u32))
            .wrapping_add(self.a);
    }

    fn digest(&self) -> u32 {
        (self.b << 16) | (self.a & 0xffff)
    }
}

fn push_new(ops: &mut Vec<DeltaOp>, new_data: &mut Vec<u8>, bytes: &[u8]) {
    if bytes.is_empty() {
        return;
    }
    new_data.extend_from_slice(bytes);
    if let Some(DeltaOp::New { len }) = ops.last_mut() {
        *len += bytes.len() as u64;
    } else {
        ops.push(DeltaOp::New {
            len: bytes.len() as u64,
        });
    }
}

/// Compute the instructions that rebuild `target` from `source`
fn diff_window(source: &[u8], target: &[u8]) -> (Vec<DeltaOp>, Vec<u8>) {
    let mut ops = Vec::new();
    let mut new_data = Vec::new();

    if source.len() < BLOCK_SIZE || target.len() < BLOCK_SIZE {
        push_new(&mut ops, &mut new_data, target);
        return (ops, new_data);
    }

    let mut index: std::collections::HashMap<u32, Vec<usize>> = std::collections::HashMap::new();
    let mut off = 0;
    while off + BLOCK_SIZE <= source.len() {
        let digest = RollingHash::new(&source[off..off + BLOCK_SIZE]).digest();
        index.entry(digest).or_default().push(off);
        off += BLOCK_SIZE;
    }

    let mut pos = 0usize;
    let mut pending = 0usize;
    let mut hash = RollingHash::new(&target[..BLOCK_SIZE]);
    while pos + BLOCK_SIZE <= target.len() {
        let best = index.get(&hash.digest()).and_then(|candidates| {
            candidates
                .iter()
                .filter(|&&c| source[c..c + BLOCK_SIZE] == target[pos..pos + BLOCK_SIZE])
                .map(|&c| {
                    let len = source[c..]
                        .iter()
                        .zip(&target[pos..])
                        .take_while(|(a, b)| a == b)
                        .count();
                    (c, len)
                })
                .max_by_key(|&(_, len)| len)
        });

        if let Some((mut s, _)) = best {
            let mut t = pos;
            while t > pending && s > 0 && source[s - 1] == target[t - 1] {
                s -= 1;
                t -= 1;
            }
            let len = source[s..]
                .iter()
                .zip(&target[t..])
                .take_while(|(a, b)| a == b)
                .count();
            push_new(&mut ops, &mut new_data, &target[pending..t]);
            ops.push(DeltaOp::Source {
                offset: s as u64,
                len: len as u64,
            });
            pos = t + len;
            pending = pos;
            if pos + BLOCK_SIZE <= target.len() {
                hash = RollingHash::new(&target[pos..pos + BLOCK_SIZE]);
            }
            continue;
        }

        if pos + BLOCK_SIZE < target.len() {
            hash.roll(target[pos], target[pos + BLOCK_SIZE]);
        }
        pos += 1;
    }
    push_new(&mut ops, &mut new_data, &target[pending..]);

    (ops, new_data)
}

/// Split `target` into windows of at most `window_size` bytes, each encoded
/// against the source slice at the same offset. An empty target yields no
/// windows.
pub fn delta_windows(source: &[u8], target: &[u8], window_size: usize) -> Vec<DeltaWindow> {
    let window_size = window_size.max(1);
    let mut windows = Vec::new();
    let mut offset = 0;
    while offset < target.len() {
        let tend = (offset + window_size).min(target.len());
        let chunk = &target[offset..tend];

        let sstart = offset.min(source.len());
        let send = (offset + window_size).min(source.len());
        let sview = &source[sstart..send];

        let (ops, new_data) = diff_window(sview, chunk);
        let uses_source = ops.iter().any(|op| matches!(op, DeltaOp::Source { .. }));
        let (sview_offset, sview_len) = if uses_source {
            (sstart as u64, sview.len() as u64)
        } else {
            (0, 0)
        };
        windows.push(DeltaWindow {
            sview_offset,
            sview_len,
            tview_len: chunk.len() as u64,
            ops,
            new_data,
        });
        offset = tend;
    }
    windows
}

/// Serialize windows as a complete svndiff0 stream
pub fn encode_svndiff(windows: &[DeltaWindow]) -> Vec<u8> {
    let mut out = SVNDIFF0_HEADER.to_vec();
    for window in windows {
        window.encode(&mut out);
    }
    out
}

/// Parse a complete svndiff0 stream
pub fn decode_svndiff(data: &[u8]) -> Result<Vec<DeltaWindow>> {
    if data.len() < 4 || &data[0..4] != SVNDIFF0_HEADER {
        return Err(DeltaError::InvalidHeader);
    }
    let mut pos = 4;
    let mut windows = Vec::new();
    while pos < data.len() {
        let (window, next) = DeltaWindow::decode(data, pos)?;
        windows.push(window);
        pos = next;
    }
    Ok(windows)
}

/// Rebuild the target text from `source` and a sequence of windows
pub fn apply_windows<'a, I>(source: &[u8], windows: I) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = &'a DeltaWindow>,
{
    let mut out = Vec::new();
    for window in windows {
        window.apply(source, &mut out)?;
    }
    Ok(out)
}

/// Rebuild the target text from `source` and an svndiff0 stream
pub fn apply_svndiff(source: &[u8], delta: &[u8]) -> Result<Vec<u8>> {
    let windows = decode_svndiff(delta)?;
    apply_windows(source, &windows)
}
