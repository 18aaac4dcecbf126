//! Byte images and the loaders that produce them.
//!
//! A [`ByteImage`] is the unit every other component reads from: immutable bytes
//! placed at a base address inside the 64 KiB Z80 address space. Loaders turn a file
//! on disk into an image, recovering the load and entry addresses when the file
//! carries an AMSDOS header.

use std::fmt;
use std::path::Path;

use crate::{Address, AnalysisError, ADDRESS_SPACE};

/// Size of an AMSDOS file header.
pub const AMSDOS_HEADER_LEN: usize = 128;

/// Errors raised by image access
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ImageError {
    /// Address or slice outside the loaded image
    #[error("Address 0x{address:04x} (length {length}) is outside the image")]
    OutOfRange { address: Address, length: usize },

    /// Zero-length image
    #[error("Image is empty")]
    Empty,

    /// Image does not fit in the Z80 address space at its base
    #[error("Image of {length} bytes at 0x{base:04x} exceeds the 64K address space")]
    TooLarge { base: Address, length: usize },
}

/// Immutable bytes plus the address of the first byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByteImage {
    base: Address,
    bytes: Vec<u8>,
}

impl ByteImage {
    /// Place `bytes` at `base`.
    pub fn new(base: Address, bytes: Vec<u8>) -> Result<Self, ImageError> {
        if bytes.is_empty() {
            return Err(ImageError::Empty);
        }
        if base as usize + bytes.len() > ADDRESS_SPACE as usize {
            return Err(ImageError::TooLarge {
                base,
                length: bytes.len(),
            });
        }
        Ok(Self { base, bytes })
    }

    /// Address of the first byte
    pub fn base(&self) -> Address {
        self.base
    }

    /// Exclusive end address
    pub fn end(&self) -> Address {
        self.base + self.bytes.len() as Address
    }

    /// Number of bytes in the image
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Always false for a constructed image; kept for API symmetry with slices.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Raw contents
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Returns true if `addr` lies in `[base, end)`.
    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.base && addr < self.end()
    }

    /// Offset of `addr` from the base, if inside the image.
    pub fn offset_of(&self, addr: Address) -> Option<usize> {
        self.contains(addr).then(|| (addr - self.base) as usize)
    }

    /// Read one byte.
    pub fn read(&self, addr: Address) -> Result<u8, ImageError> {
        self.offset_of(addr)
            .map(|off| self.bytes[off])
            .ok_or(ImageError::OutOfRange {
                address: addr,
                length: 1,
            })
    }

    /// Read `length` bytes starting at `addr`; the whole slice must be inside the image.
    pub fn slice(&self, addr: Address, length: usize) -> Result<&[u8], ImageError> {
        let err = ImageError::OutOfRange {
            address: addr,
            length,
        };
        let off = self.offset_of(addr).ok_or(err)?;
        let end = off.checked_add(length).ok_or(err)?;
        self.bytes.get(off..end).ok_or(err)
    }

    /// Read a little-endian word.
    pub fn read_word(&self, addr: Address) -> Result<u16, ImageError> {
        let s = self.slice(addr, 2)?;
        Ok(u16::from_le_bytes([s[0], s[1]]))
    }
}

/// Container format an image was loaded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    /// Headerless memory dump
    Raw,
    /// AMSDOS binary file with a 128-byte header
    Amsdos,
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageFormat::Raw => write!(f, "raw"),
            ImageFormat::Amsdos => write!(f, "AMSDOS"),
        }
    }
}

/// An image plus whatever the container told us about it.
#[derive(Debug, Clone)]
pub struct LoadedImage {
    /// The loaded bytes at their load address
    pub image: ByteImage,
    /// Execution address, if the container records one
    pub entry_point: Option<Address>,
    /// Detected container
    pub format: ImageFormat,
}

/// Loader trait: turn file contents into a [`LoadedImage`].
pub trait ImageLoader: Send + Sync {
    /// Build the image from `data`.
    fn load(&self, data: &[u8]) -> Result<LoadedImage, AnalysisError>;
}

/// Takes the bytes as-is at a caller-chosen base.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawLoader {
    /// Load address of the first byte
    pub base: Address,
}

impl RawLoader {
    /// Construct a loader placing data at `base`.
    pub fn new(base: Address) -> Self {
        RawLoader { base }
    }
}

impl ImageLoader for RawLoader {
    fn load(&self, data: &[u8]) -> Result<LoadedImage, AnalysisError> {
        Ok(LoadedImage {
            image: ByteImage::new(self.base, data.to_vec())?,
            entry_point: None,
            format: ImageFormat::Raw,
        })
    }
}

/// Parsed fields of an AMSDOS header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AmsdosHeader {
    /// File type byte (2 = binary)
    pub file_type: u8,
    /// Load address
    pub load_address: u16,
    /// Logical length of the payload
    pub length: u16,
    /// Execution address
    pub entry_address: u16,
}

impl AmsdosHeader {
    /// Parse `data` if it starts with a header whose checksum is valid.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() <= AMSDOS_HEADER_LEN {
            return None;
        }
        let header = &data[..AMSDOS_HEADER_LEN];
        // An all-zero block trivially matches its zero checksum.
        if header[..67].iter().all(|&b| b == 0) {
            return None;
        }
        let sum: u16 = header[..67].iter().map(|&b| b as u16).sum();
        let stored = u16::from_le_bytes([header[67], header[68]]);
        if sum != stored {
            return None;
        }
        Some(Self {
            file_type: header[18],
            load_address: u16::from_le_bytes([header[21], header[22]]),
            length: u16::from_le_bytes([header[24], header[25]]),
            entry_address: u16::from_le_bytes([header[26], header[27]]),
        })
    }
}

/// Strips an AMSDOS header and loads the payload at the recorded address.
#[derive(Debug, Default, Clone, Copy)]
pub struct AmsdosLoader;

impl ImageLoader for AmsdosLoader {
    fn load(&self, data: &[u8]) -> Result<LoadedImage, AnalysisError> {
        let header = AmsdosHeader::parse(data)
            .ok_or_else(|| AnalysisError::Generic("no valid AMSDOS header".to_string()))?;
        let payload = &data[AMSDOS_HEADER_LEN..];
        let length = match header.length as usize {
            0 => payload.len(),
            n => n.min(payload.len()),
        };
        log::debug!(
            "AMSDOS header: type {}, load 0x{:04x}, length {}, entry 0x{:04x}",
            header.file_type,
            header.load_address,
            length,
            header.entry_address
        );
        Ok(LoadedImage {
            image: ByteImage::new(header.load_address as Address, payload[..length].to_vec())?,
            entry_point: Some(header.entry_address as Address),
            format: ImageFormat::Amsdos,
        })
    }
}

/// Pick the loader for `data`: AMSDOS when a valid header is present, raw otherwise.
pub fn detect_loader(data: &[u8], base: Address) -> Box<dyn ImageLoader> {
    if AmsdosHeader::parse(data).is_some() {
        Box::new(AmsdosLoader)
    } else {
        Box::new(RawLoader::new(base))
    }
}

/// Read a file and load it.
///
/// With `base` set the file is always taken raw at that address; without it the
/// format is detected and headerless files load at 0.
pub fn load_file<P: AsRef<Path>>(path: P, base: Option<Address>) -> Result<LoadedImage, AnalysisError> {
    let data = std::fs::read(path.as_ref())?;
    log::info!("Read {} bytes from {}", data.len(), path.as_ref().display());
    match base {
        Some(base) => RawLoader::new(base).load(&data),
        None => detect_loader(&data, 0).load(&data),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build an AMSDOS-wrapped file around `payload`.
    pub(crate) fn amsdos_file(load: u16, entry: u16, payload: &[u8]) -> Vec<u8> {
        let mut header = [0u8; AMSDOS_HEADER_LEN];
        header[1..9].copy_from_slice(b"GAME    ");
        header[9..12].copy_from_slice(b"BIN");
        header[18] = 2;
        header[21..23].copy_from_slice(&load.to_le_bytes());
        header[24..26].copy_from_slice(&(payload.len() as u16).to_le_bytes());
        header[26..28].copy_from_slice(&entry.to_le_bytes());
        header[64..66].copy_from_slice(&(payload.len() as u16).to_le_bytes());
        let sum: u16 = header[..67].iter().map(|&b| b as u16).sum();
        header[67..69].copy_from_slice(&sum.to_le_bytes());

        let mut file = header.to_vec();
        file.extend_from_slice(payload);
        file
    }

    #[test]
    fn test_read_and_slice_bounds() {
        let image = ByteImage::new(0x4000, vec![1, 2, 3, 4]).unwrap();

        assert_eq!(image.end(), 0x4004);
        assert_eq!(image.read(0x4000).unwrap(), 1);
        assert_eq!(image.read(0x4003).unwrap(), 4);
        assert_eq!(
            image.read(0x4004),
            Err(ImageError::OutOfRange { address: 0x4004, length: 1 })
        );
        assert!(image.read(0x3fff).is_err());

        assert_eq!(image.slice(0x4001, 3).unwrap(), &[2, 3, 4]);
        assert!(image.slice(0x4002, 3).is_err());
        assert_eq!(image.read_word(0x4000).unwrap(), 0x0201);
        assert!(image.read_word(0x4003).is_err());
    }

    #[test]
    fn test_construction_limits() {
        assert_eq!(ByteImage::new(0, Vec::new()), Err(ImageError::Empty));
        assert!(ByteImage::new(0xfff0, vec![0; 16]).is_ok());
        assert_eq!(
            ByteImage::new(0xfff0, vec![0; 17]),
            Err(ImageError::TooLarge { base: 0xfff0, length: 17 })
        );
    }

    #[test]
    fn test_amsdos_detection() {
        let file = amsdos_file(0x1200, 0x1234, &[0xc9, 0x00, 0x00]);

        let loaded = detect_loader(&file, 0).load(&file).unwrap();
        assert_eq!(loaded.format, ImageFormat::Amsdos);
        assert_eq!(loaded.image.base(), 0x1200);
        assert_eq!(loaded.image.len(), 3);
        assert_eq!(loaded.entry_point, Some(0x1234));
    }

    #[test]
    fn test_corrupt_header_loads_raw() {
        let mut file = amsdos_file(0x1200, 0x1234, &[0xc9]);
        file[67] ^= 0xff;

        let loaded = detect_loader(&file, 0x100).load(&file).unwrap();
        assert_eq!(loaded.format, ImageFormat::Raw);
        assert_eq!(loaded.image.base(), 0x100);
        assert_eq!(loaded.image.len(), file.len());
        assert_eq!(loaded.entry_point, None);
    }

    #[test]
    fn test_zero_block_is_not_a_header() {
        let file = vec![0u8; 256];
        assert!(AmsdosHeader::parse(&file).is_none());
    }
}
