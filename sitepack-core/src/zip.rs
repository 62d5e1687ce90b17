//! Minimal ZIP writer/reader: deflated entries, data descriptors, no ZIP64.

use anyhow::{bail, ensure, Context, Result};
use crc32fast::Hasher as Crc32;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use std::io::{self, Read, Seek, SeekFrom, Write};

const LOCAL_HEADER_SIG: u32 = 0x0403_4b50;
const DATA_DESCRIPTOR_SIG: u32 = 0x0807_4b50;
const CENTRAL_HEADER_SIG: u32 = 0x0201_4b50;
const END_OF_CENTRAL_DIR_SIG: u32 = 0x0605_4b50;

const VERSION: u16 = 20;
/// Sizes follow in a data descriptor; names are UTF-8.
const FLAGS: u16 = 0x0008 | 0x0800;
const METHOD_STORED: u16 = 0;
const METHOD_DEFLATE: u16 = 8;

/// MS-DOS timestamp for 1980-01-01 00:00, the earliest representable.
const DOS_TIME: u16 = 0;
const DOS_DATE: u16 = (1 << 5) | 1;

const LOCAL_HEADER_LEN: u64 = 30;
const END_OF_CENTRAL_DIR_LEN: u64 = 22;

struct CountingWriter<W> {
    inner: W,
    count: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct CentralRecord {
    name: String,
    crc32: u32,
    compressed: u32,
    uncompressed: u32,
    offset: u32,
}

pub struct ZipWriter<W: Write> {
    out: CountingWriter<W>,
    central: Vec<CentralRecord>,
}

fn u32_field(v: u64, what: &str) -> Result<u32> {
    u32::try_from(v).map_err(|_| anyhow::anyhow!("{} {} exceeds ZIP limits", what, v))
}

impl<W: Write> ZipWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { out: CountingWriter { inner, count: 0 }, central: Vec::new() }
    }

    /// Append one entry, deflating everything read from `data`.
    pub fn append(&mut self, name: &str, data: &mut dyn Read) -> Result<u64> {
        let name_len = u16::try_from(name.len()).context("entry name too long for ZIP")?;
        let offset = u32_field(self.out.count, "archive offset")?;

        let mut hdr = Vec::with_capacity(LOCAL_HEADER_LEN as usize + name.len());
        hdr.extend_from_slice(&LOCAL_HEADER_SIG.to_le_bytes());
        hdr.extend_from_slice(&VERSION.to_le_bytes());
        hdr.extend_from_slice(&FLAGS.to_le_bytes());
        hdr.extend_from_slice(&METHOD_DEFLATE.to_le_bytes());
        hdr.extend_from_slice(&DOS_TIME.to_le_bytes());
        hdr.extend_from_slice(&DOS_DATE.to_le_bytes());
        hdr.extend_from_slice(&[0u8; 12]); // crc + sizes, see data descriptor
        hdr.extend_from_slice(&name_len.to_le_bytes());
        hdr.extend_from_slice(&0u16.to_le_bytes());
        hdr.extend_from_slice(name.as_bytes());
        self.out.write_all(&hdr)?;

        let start = self.out.count;
        let mut crc = Crc32::new();
        let mut total = 0u64;
        {
            let mut enc = DeflateEncoder::new(&mut self.out, Compression::default());
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let n = data.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                crc.update(&buf[..n]);
                enc.write_all(&buf[..n])?;
                total += n as u64;
            }
            enc.finish()?;
        }
        let compressed = u32_field(self.out.count - start, "compressed size")?;
        let uncompressed = u32_field(total, "entry size")?;
        let crc32 = crc.finalize();

        let mut dd = Vec::with_capacity(16);
        dd.extend_from_slice(&DATA_DESCRIPTOR_SIG.to_le_bytes());
        dd.extend_from_slice(&crc32.to_le_bytes());
        dd.extend_from_slice(&compressed.to_le_bytes());
        dd.extend_from_slice(&uncompressed.to_le_bytes());
        self.out.write_all(&dd)?;

        self.central.push(CentralRecord { name: name.to_string(), crc32, compressed, uncompressed, offset });
        Ok(total)
    }

    /// Write the central directory and return the underlying writer.
    pub fn finish(mut self) -> Result<W> {
        let entries = u16::try_from(self.central.len()).context("too many entries for ZIP")?;
        let cd_start = u32_field(self.out.count, "central directory offset")?;
        for rec in &self.central {
            let mut c = Vec::with_capacity(46 + rec.name.len());
            c.extend_from_slice(&CENTRAL_HEADER_SIG.to_le_bytes());
            c.extend_from_slice(&VERSION.to_le_bytes()); // made by
            c.extend_from_slice(&VERSION.to_le_bytes()); // needed
            c.extend_from_slice(&FLAGS.to_le_bytes());
            c.extend_from_slice(&METHOD_DEFLATE.to_le_bytes());
            c.extend_from_slice(&DOS_TIME.to_le_bytes());
            c.extend_from_slice(&DOS_DATE.to_le_bytes());
            c.extend_from_slice(&rec.crc32.to_le_bytes());
            c.extend_from_slice(&rec.compressed.to_le_bytes());
            c.extend_from_slice(&rec.uncompressed.to_le_bytes());
            c.extend_from_slice(&(rec.name.len() as u16).to_le_bytes());
            c.extend_from_slice(&0u16.to_le_bytes()); // extra
            c.extend_from_slice(&0u16.to_le_bytes()); // comment
            c.extend_from_slice(&0u16.to_le_bytes()); // disk
            c.extend_from_slice(&0u16.to_le_bytes()); // internal attrs
            c.extend_from_slice(&0u32.to_le_bytes()); // external attrs
            c.extend_from_slice(&rec.offset.to_le_bytes());
            c.extend_from_slice(rec.name.as_bytes());
            self.out.write_all(&c)?;
        }
        let cd_len = u32_field(self.out.count - cd_start as u64, "central directory size")?;

        let mut eocd = Vec::with_capacity(END_OF_CENTRAL_DIR_LEN as usize);
        eocd.extend_from_slice(&END_OF_CENTRAL_DIR_SIG.to_le_bytes());
        eocd.extend_from_slice(&0u16.to_le_bytes());
        eocd.extend_from_slice(&0u16.to_le_bytes());
        eocd.extend_from_slice(&entries.to_le_bytes());
        eocd.extend_from_slice(&entries.to_le_bytes());
        eocd.extend_from_slice(&cd_len.to_le_bytes());
        eocd.extend_from_slice(&cd_start.to_le_bytes());
        eocd.extend_from_slice(&0u16.to_le_bytes());
        self.out.write_all(&eocd)?;
        self.out.flush()?;
        Ok(self.out.inner)
    }
}

fn le16(b: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([b[at], b[at + 1]])
}

fn le32(b: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

/// Read every entry of a ZIP stream via its central directory, checking the
/// CRC-32 and size of each.
pub fn read_entries<R: Read + Seek>(r: &mut R) -> Result<Vec<(String, Vec<u8>)>> {
    let flen = r.seek(SeekFrom::End(0))?;
    ensure!(flen >= END_OF_CENTRAL_DIR_LEN, "too short for a ZIP archive");
    // The end record may be followed by a comment of up to 64 KiB.
    let tail_len = flen.min(END_OF_CENTRAL_DIR_LEN + u16::MAX as u64);
    r.seek(SeekFrom::Start(flen - tail_len))?;
    let mut tail = vec![0u8; tail_len as usize];
    r.read_exact(&mut tail)?;
    let Some(eocd) = (0..=tail.len() - END_OF_CENTRAL_DIR_LEN as usize)
        .rev()
        .find(|&i| le32(&tail, i) == END_OF_CENTRAL_DIR_SIG)
    else {
        bail!("end of central directory not found");
    };
    let count = le16(&tail, eocd + 10) as usize;
    let cd_len = le32(&tail, eocd + 12) as usize;
    let cd_off = le32(&tail, eocd + 16) as u64;
    ensure!(cd_off + cd_len as u64 <= flen, "central directory out of bounds");

    let mut cd = vec![0u8; cd_len];
    r.seek(SeekFrom::Start(cd_off))?;
    r.read_exact(&mut cd)?;

    let mut out = Vec::with_capacity(count);
    let mut pos = 0usize;
    for _ in 0..count {
        ensure!(pos + 46 <= cd.len(), "truncated central directory");
        ensure!(le32(&cd, pos) == CENTRAL_HEADER_SIG, "bad central header signature");
        let method = le16(&cd, pos + 10);
        let crc = le32(&cd, pos + 16);
        let csize = le32(&cd, pos + 20) as u64;
        let expected_len = le32(&cd, pos + 24) as usize;
        let name_len = le16(&cd, pos + 28) as usize;
        let extra_len = le16(&cd, pos + 30) as usize;
        let comment_len = le16(&cd, pos + 32) as usize;
        let local_off = le32(&cd, pos + 42) as u64;
        let name_end = pos + 46 + name_len;
        ensure!(name_end <= cd.len(), "truncated central directory name");
        let name = std::str::from_utf8(&cd[pos + 46..name_end])
            .context("ZIP entry name is not UTF-8")?
            .to_string();
        pos = name_end + extra_len + comment_len;

        let mut lh = [0u8; LOCAL_HEADER_LEN as usize];
        r.seek(SeekFrom::Start(local_off))?;
        r.read_exact(&mut lh).with_context(|| format!("local header of {}", name))?;
        ensure!(le32(&lh, 0) == LOCAL_HEADER_SIG, "bad local header for {}", name);
        let skip = le16(&lh, 26) as u64 + le16(&lh, 28) as u64;
        r.seek(SeekFrom::Start(local_off + LOCAL_HEADER_LEN + skip))?;
        let mut raw = Vec::with_capacity(csize as usize);
        (&mut *r).take(csize).read_to_end(&mut raw)?;
        ensure!(raw.len() as u64 == csize, "truncated data for {}", name);

        let data = match method {
            METHOD_STORED => raw,
            METHOD_DEFLATE => {
                let mut d = Vec::with_capacity(expected_len);
                flate2::read::DeflateDecoder::new(&raw[..])
                    .read_to_end(&mut d)
                    .with_context(|| format!("inflate {}", name))?;
                d
            }
            other => bail!("unsupported compression method {} for {}", other, name),
        };
        ensure!(data.len() == expected_len, "size mismatch for {}", name);
        let mut h = Crc32::new();
        h.update(&data);
        ensure!(h.finalize() == crc, "CRC mismatch for {}", name);
        out.push((name, data));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn writes_readable_archive() {
        let mut zw = ZipWriter::new(Vec::new());
        zw.append(".metadata", &mut &b"meta"[..]).unwrap();
        zw.append("empty", &mut &b""[..]).unwrap();
        let big = vec![7u8; 200_000];
        zw.append("dir/big.bin", &mut &big[..]).unwrap();
        let bytes = zw.finish().unwrap();
        // Repetitive payload must actually be deflated.
        assert!(bytes.len() < 10_000);

        let got = read_entries(&mut Cursor::new(bytes)).unwrap();
        let names: Vec<_> = got.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, [".metadata", "empty", "dir/big.bin"]);
        assert_eq!(got[0].1, b"meta");
        assert!(got[1].1.is_empty());
        assert_eq!(got[2].1, big);
    }

    #[test]
    fn detects_corruption() {
        let mut zw = ZipWriter::new(Vec::new());
        zw.append("a", &mut &b"hello hello hello"[..]).unwrap();
        let mut bytes = zw.finish().unwrap();
        // Flip a bit inside the deflated payload.
        bytes[LOCAL_HEADER_LEN as usize + 2] ^= 0x40;
        assert!(read_entries(&mut Cursor::new(bytes)).is_err());
    }

    #[test]
    fn empty_archive_is_valid() {
        let bytes = ZipWriter::new(Vec::new()).finish().unwrap();
        assert_eq!(bytes.len() as u64, END_OF_CENTRAL_DIR_LEN);
        assert!(read_entries(&mut Cursor::new(bytes)).unwrap().is_empty());
    }
}
