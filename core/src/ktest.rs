use std::{
    fs::File,
    io::{self, Read, Write},
    path::Path,
    string::String,
    vec::Vec,
};

use crate::bitmask::ByteMask;

// KTEST FILE FORMAT
// ================================================================================================

/// Magic byte sequence identifying a KTest file.
const MAGIC: &[u8; 5] = b"KTEST";

/// Current file-format version. Version 4 added the havoced-location section.
const VERSION: u32 = 4;

/// First version carrying the havoced-location section.
const HAVOC_VERSION: u32 = 4;

#[derive(Debug, thiserror::Error)]
pub enum KTestError {
    #[error("i/o error")]
    Io(#[from] io::Error),
    #[error("invalid magic number")]
    InvalidMagic,
    #[error("unsupported file-format version {0} (current is {VERSION})")]
    UnsupportedVersion(u32),
    #[error("unexpected end of file")]
    UnexpectedEof,
    #[error("object name is not valid utf-8")]
    InvalidName,
}

/// One concrete assignment of a symbolic object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KTestObject {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// One havoced memory location: the value chosen for the final fixpoint round and the byte mask
/// that was forgotten.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KTestHavocedLocation {
    pub name: String,
    pub bytes: Vec<u8>,
    pub mask: ByteMask,
}

/// In-memory form of a test-case file.
///
/// The on-disk layout is fixed: the magic, then big-endian `u32` scalars and length-prefixed byte
/// strings in declaration order below. `to_file` followed by `from_file` reproduces the value
/// byte for byte.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KTest {
    pub args: Vec<String>,
    pub sym_argvs: u32,
    pub sym_argv_len: u32,
    pub objects: Vec<KTestObject>,
    pub havocs: Vec<KTestHavocedLocation>,
}

impl KTest {
    pub fn current_version() -> u32 {
        VERSION
    }

    /// Returns true iff the file at `path` starts with the KTest magic.
    pub fn is_ktest_file(path: impl AsRef<Path>) -> bool {
        let mut magic = [0u8; MAGIC.len()];
        match File::open(path) {
            Ok(mut f) => f.read_exact(&mut magic).is_ok() && &magic == MAGIC,
            Err(_) => false,
        }
    }

    /// Total number of object bytes (havoced locations excluded).
    pub fn num_bytes(&self) -> usize {
        self.objects.iter().map(|o| o.bytes.len()).sum()
    }

    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<(), KTestError> {
        let mut w = File::create(path)?;
        w.write_all(MAGIC)?;
        write_u32(&mut w, VERSION)?;
        write_u32(&mut w, self.args.len() as u32)?;
        for arg in &self.args {
            write_bytes(&mut w, arg.as_bytes())?;
        }
        write_u32(&mut w, self.sym_argvs)?;
        write_u32(&mut w, self.sym_argv_len)?;
        write_u32(&mut w, self.objects.len() as u32)?;
        for object in &self.objects {
            write_bytes(&mut w, object.name.as_bytes())?;
            write_bytes(&mut w, &object.bytes)?;
        }
        write_u32(&mut w, self.havocs.len() as u32)?;
        for havoc in &self.havocs {
            write_bytes(&mut w, havoc.name.as_bytes())?;
            write_bytes(&mut w, &havoc.bytes)?;
            debug_assert_eq!(havoc.mask.len() as usize, havoc.bytes.len());
            for word in havoc.mask.words() {
                write_u32(&mut w, *word)?;
            }
        }
        Ok(())
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<KTest, KTestError> {
        let mut r = File::open(path)?;
        let mut magic = [0u8; MAGIC.len()];
        read_exact(&mut r, &mut magic)?;
        if &magic != MAGIC {
            return Err(KTestError::InvalidMagic);
        }
        let version = read_u32(&mut r)?;
        if version > VERSION {
            return Err(KTestError::UnsupportedVersion(version));
        }

        let num_args = read_u32(&mut r)?;
        let mut args = Vec::with_capacity(num_args as usize);
        for _ in 0..num_args {
            args.push(read_string(&mut r)?);
        }
        let sym_argvs = read_u32(&mut r)?;
        let sym_argv_len = read_u32(&mut r)?;

        let num_objects = read_u32(&mut r)?;
        let mut objects = Vec::with_capacity(num_objects as usize);
        for _ in 0..num_objects {
            let name = read_string(&mut r)?;
            let bytes = read_vec(&mut r)?;
            objects.push(KTestObject { name, bytes });
        }

        let mut havocs = Vec::new();
        if version >= HAVOC_VERSION {
            let num_havocs = read_u32(&mut r)?;
            for _ in 0..num_havocs {
                let name = read_string(&mut r)?;
                let bytes = read_vec(&mut r)?;
                let num_words = (bytes.len() as u32).div_ceil(32);
                let mut words = Vec::with_capacity(num_words as usize);
                for _ in 0..num_words {
                    words.push(read_u32(&mut r)?);
                }
                let mask = ByteMask::from_words(words, bytes.len() as u32);
                havocs.push(KTestHavocedLocation { name, bytes, mask });
            }
        }

        Ok(KTest { args, sym_argvs, sym_argv_len, objects, havocs })
    }
}

// WIRE HELPERS
// ================================================================================================

fn write_u32(w: &mut impl Write, value: u32) -> io::Result<()> {
    w.write_all(&value.to_be_bytes())
}

fn write_bytes(w: &mut impl Write, bytes: &[u8]) -> io::Result<()> {
    write_u32(w, bytes.len() as u32)?;
    w.write_all(bytes)
}

fn read_exact(r: &mut impl Read, buf: &mut [u8]) -> Result<(), KTestError> {
    r.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => KTestError::UnexpectedEof,
        _ => KTestError::Io(e),
    })
}

fn read_u32(r: &mut impl Read) -> Result<u32, KTestError> {
    let mut buf = [0u8; 4];
    read_exact(r, &mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

fn read_vec(r: &mut impl Read) -> Result<Vec<u8>, KTestError> {
    let len = read_u32(r)?;
    let mut buf = vec![0; len as usize];
    read_exact(r, &mut buf)?;
    Ok(buf)
}

fn read_string(r: &mut impl Read) -> Result<String, KTestError> {
    String::from_utf8(read_vec(r)?).map_err(|_| KTestError::InvalidName)
}

#[cfg(test)]
mod tests {
    use std::string::ToString;

    use pretty_assertions::assert_eq;

    use super::*;

    fn sample() -> KTest {
        let mut mask = ByteMask::new(4);
        mask.set(0);
        mask.set(3);
        KTest {
            args: vec!["prog.bc".to_string(), "--sym-arg".to_string()],
            sym_argvs: 1,
            sym_argv_len: 8,
            objects: vec![
                KTestObject { name: "x".to_string(), bytes: vec![5, 0, 0, 0] },
                KTestObject { name: "buf".to_string(), bytes: vec![0xde, 0xad] },
            ],
            havocs: vec![KTestHavocedLocation {
                name: "counter".to_string(),
                bytes: vec![9, 0, 0, 0],
                mask,
            }],
        }
    }

    #[test]
    fn roundtrip_is_exact() {
        let dir = std::env::temp_dir();
        let path = dir.join("symbex_ktest_roundtrip.ktest");
        let ktest = sample();
        ktest.to_file(&path).unwrap();
        assert!(KTest::is_ktest_file(&path));
        let restored = KTest::from_file(&path).unwrap();
        assert_eq!(restored, ktest);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn num_bytes_counts_objects_only() {
        assert_eq!(sample().num_bytes(), 6);
    }

    #[test]
    fn garbage_is_not_a_ktest_file() {
        let path = std::env::temp_dir().join("symbex_ktest_garbage");
        std::fs::write(&path, b"BOUT\n123").unwrap();
        assert!(!KTest::is_ktest_file(&path));
        assert!(matches!(KTest::from_file(&path), Err(KTestError::InvalidMagic)));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn future_version_is_rejected() {
        let path = std::env::temp_dir().join("symbex_ktest_future.ktest");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"KTEST");
        bytes.extend_from_slice(&(VERSION + 1).to_be_bytes());
        std::fs::write(&path, &bytes).unwrap();
        assert!(matches!(KTest::from_file(&path), Err(KTestError::UnsupportedVersion(_))));
        std::fs::remove_file(&path).ok();
    }
}
