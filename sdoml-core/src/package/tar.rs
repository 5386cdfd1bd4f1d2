//! Plain ustar writer and reader.
//!
//! Entries are regular files with mode 0644, uid/gid 0 and mtime 0, so the
//! same samples always produce byte-identical archives.

use std::io::{self, Read, Write};

const BLOCK: usize = 512;
const NAME_MAX: usize = 100;

fn pad_len(len: u64) -> u64 {
    let rem = len % BLOCK as u64;
    if rem == 0 {
        0
    } else {
        BLOCK as u64 - rem
    }
}

fn write_octal_field(dst: &mut [u8], val: u64) {
    let digits = dst.len().saturating_sub(1);
    dst.fill(0);
    let s = format!("{:0digits$o}", val, digits = digits);
    let bytes = s.as_bytes();
    let start = digits.saturating_sub(bytes.len());
    dst[start..start + bytes.len()].copy_from_slice(bytes);
}

fn read_octal_field(src: &[u8]) -> Option<u64> {
    let text: String = src
        .iter()
        .take_while(|b| **b != 0)
        .map(|b| *b as char)
        .collect();
    let text = text.trim();
    if text.is_empty() {
        return Some(0);
    }
    u64::from_str_radix(text, 8).ok()
}

fn checksum(h: &[u8; BLOCK]) -> u32 {
    h.iter()
        .enumerate()
        .map(|(i, b)| if (148..156).contains(&i) { b' ' as u32 } else { *b as u32 })
        .sum()
}

fn header(name: &str, size: u64) -> io::Result<[u8; BLOCK]> {
    if name.is_empty() || name.len() > NAME_MAX {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("tar entry name must be 1..={NAME_MAX} bytes: {name:?}"),
        ));
    }
    let mut h = [0u8; BLOCK];
    h[..name.len()].copy_from_slice(name.as_bytes());
    write_octal_field(&mut h[100..108], 0o644);
    write_octal_field(&mut h[108..116], 0);
    write_octal_field(&mut h[116..124], 0);
    write_octal_field(&mut h[124..136], size);
    write_octal_field(&mut h[136..148], 0);
    h[156] = b'0';
    h[257..263].copy_from_slice(b"ustar\0");
    h[263..265].copy_from_slice(b"00");

    let chk = format!("{:06o}\0 ", checksum(&h));
    h[148..156].copy_from_slice(chk.as_bytes());
    Ok(h)
}

pub struct TarWriter<W: Write> {
    inner: W,
    entries: usize,
    bytes: u64,
}

impl<W: Write> TarWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            entries: 0,
            bytes: 0,
        }
    }

    pub fn entries(&self) -> usize {
        self.entries
    }

    /// Bytes written so far, headers and padding included.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn append(&mut self, name: &str, data: &[u8]) -> io::Result<()> {
        let size = data.len() as u64;
        self.inner.write_all(&header(name, size)?)?;
        self.inner.write_all(data)?;
        let pad = pad_len(size) as usize;
        if pad != 0 {
            self.inner.write_all(&[0u8; BLOCK][..pad])?;
        }
        self.entries += 1;
        self.bytes += BLOCK as u64 + size + pad as u64;
        Ok(())
    }

    /// Write the two terminating zero blocks and hand back the sink.
    pub fn finish(mut self) -> io::Result<W> {
        self.inner.write_all(&[0u8; 2 * BLOCK])?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

/// One archive member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TarEntry {
    pub name: String,
    pub data: Vec<u8>,
}

fn invalid(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// Read every member of an archive, verifying header checksums.
pub fn read_archive(mut reader: impl Read) -> io::Result<Vec<TarEntry>> {
    let mut entries = Vec::new();
    let mut h = [0u8; BLOCK];
    loop {
        match reader.read_exact(&mut h) {
            Ok(()) => {}
            // Tolerate archives missing their end-of-archive blocks.
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }
        if h.iter().all(|b| *b == 0) {
            break;
        }
        let stored = read_octal_field(&h[148..156])
            .ok_or_else(|| invalid(format!("bad checksum field in entry {}", entries.len())))?;
        if stored != u64::from(checksum(&h)) {
            return Err(invalid(format!("checksum mismatch in entry {}", entries.len())));
        }
        let name_len = h[..NAME_MAX].iter().position(|b| *b == 0).unwrap_or(NAME_MAX);
        let name = String::from_utf8_lossy(&h[..name_len]).to_string();
        let size = read_octal_field(&h[124..136])
            .ok_or_else(|| invalid(format!("bad size field for {name}")))?;

        // Grows with the bytes actually present, not the declared size.
        let mut data = Vec::new();
        reader.by_ref().take(size).read_to_end(&mut data)?;
        if data.len() as u64 != size {
            return Err(invalid(format!(
                "{name} is truncated: {} of {size} bytes",
                data.len()
            )));
        }
        let pad = pad_len(size) as usize;
        if pad != 0 {
            reader.read_exact(&mut h[..pad])?;
        }
        entries.push(TarEntry { name, data });
    }
    Ok(entries)
}
