//! Response compression: the [`Compressor`] trait, the name registry and
//! the on-disk cache of compressed static files.

use flate2::{
    read::{GzDecoder, ZlibDecoder},
    write::{GzEncoder, ZlibEncoder},
    Compression,
};
use std::{
    collections::{hash_map::DefaultHasher, HashMap},
    fs::{self, File},
    hash::{Hash, Hasher},
    io::{self, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    sync::{Arc, PoisonError, RwLock},
    time::SystemTime,
};
use tracing::debug;

/// A content coding usable in `Content-Encoding`.
///
/// # Examples
/// ```
/// use trellis_web::compress::Compressor;
/// use std::{io, path::Path};
///
/// struct Identity;
///
/// impl Compressor for Identity {
///     fn name(&self) -> &'static str {
///         "identity"
///     }
///     fn compress(&self, data: &[u8]) -> io::Result<Vec<u8>> {
///         Ok(data.to_vec())
///     }
///     fn compress_file(&self, src: &Path, dst: &Path) -> io::Result<()> {
///         std::fs::copy(src, dst).map(|_| ())
///     }
///     fn decompress_file(&self, src: &Path, dst: &Path) -> io::Result<()> {
///         std::fs::copy(src, dst).map(|_| ())
///     }
/// }
/// ```
pub trait Compressor: Send + Sync + 'static {
    /// Token used in `Accept-Encoding` and `Content-Encoding`.
    fn name(&self) -> &'static str;

    fn compress(&self, data: &[u8]) -> io::Result<Vec<u8>>;

    /// Compresses the file `src` into a new file `dst`.
    fn compress_file(&self, src: &Path, dst: &Path) -> io::Result<()>;

    fn decompress_file(&self, src: &Path, dst: &Path) -> io::Result<()>;
}

pub struct Gzip;

impl Compressor for Gzip {
    fn name(&self) -> &'static str {
        "gzip"
    }

    fn compress(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(data)?;
        encoder.finish()
    }

    fn compress_file(&self, src: &Path, dst: &Path) -> io::Result<()> {
        let mut input = BufReader::new(File::open(src)?);
        let mut encoder = GzEncoder::new(BufWriter::new(File::create(dst)?), Compression::best());

        io::copy(&mut input, &mut encoder)?;
        encoder.finish()?.flush()
    }

    fn decompress_file(&self, src: &Path, dst: &Path) -> io::Result<()> {
        let mut decoder = GzDecoder::new(BufReader::new(File::open(src)?));
        let mut output = BufWriter::new(File::create(dst)?);

        io::copy(&mut decoder, &mut output)?;
        output.flush()
    }
}

/// `deflate` as HTTP means it: zlib-wrapped.
pub struct Deflate;

impl Compressor for Deflate {
    fn name(&self) -> &'static str {
        "deflate"
    }

    fn compress(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(data)?;
        encoder.finish()
    }

    fn compress_file(&self, src: &Path, dst: &Path) -> io::Result<()> {
        let mut input = BufReader::new(File::open(src)?);
        let mut encoder = ZlibEncoder::new(BufWriter::new(File::create(dst)?), Compression::best());

        io::copy(&mut input, &mut encoder)?;
        encoder.finish()?.flush()
    }

    fn decompress_file(&self, src: &Path, dst: &Path) -> io::Result<()> {
        let mut decoder = ZlibDecoder::new(BufReader::new(File::open(src)?));
        let mut output = BufWriter::new(File::create(dst)?);

        io::copy(&mut decoder, &mut output)?;
        output.flush()
    }
}

pub struct Brotli;

impl Brotli {
    const QUALITY: u32 = 9;
    const LGWIN: u32 = 22;
}

impl Compressor for Brotli {
    fn name(&self) -> &'static str {
        "br"
    }

    fn compress(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut params = brotli::enc::BrotliEncoderParams::default();
        params.quality = Self::QUALITY as i32;
        params.lgwin = Self::LGWIN as i32;

        let mut output = Vec::new();
        brotli::BrotliCompress(&mut &data[..], &mut output, &params)?;
        Ok(output)
    }

    fn compress_file(&self, src: &Path, dst: &Path) -> io::Result<()> {
        let mut input = BufReader::new(File::open(src)?);
        let mut writer =
            brotli::CompressorWriter::new(File::create(dst)?, 4096, Self::QUALITY, Self::LGWIN);

        io::copy(&mut input, &mut writer)?;
        writer.flush()?;
        writer.into_inner().sync_all()
    }

    fn decompress_file(&self, src: &Path, dst: &Path) -> io::Result<()> {
        let mut decoder = brotli::Decompressor::new(File::open(src)?, 4096);
        let mut output = BufWriter::new(File::create(dst)?);

        io::copy(&mut decoder, &mut output)?;
        output.flush()
    }
}

/// Registered compressors, in registration order.
#[derive(Clone)]
pub(crate) struct Compressors {
    list: Vec<Arc<dyn Compressor>>,
}

impl Default for Compressors {
    fn default() -> Self {
        Self {
            list: vec![Arc::new(Gzip), Arc::new(Deflate), Arc::new(Brotli)],
        }
    }
}

impl std::fmt::Debug for Compressors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.list.iter().map(|c| c.name())).finish()
    }
}

impl Compressors {
    /// Adds `compressor`, replacing one with the same name.
    pub(crate) fn register(&mut self, compressor: Arc<dyn Compressor>) {
        match self.list.iter_mut().find(|c| c.name() == compressor.name()) {
            Some(slot) => *slot = compressor,
            None => self.list.push(compressor),
        }
    }

    pub(crate) fn get(&self, name: &str) -> Option<&Arc<dyn Compressor>> {
        self.list.iter().find(|c| c.name().eq_ignore_ascii_case(name))
    }

    /// First coding listed in `accept_encoding` that has a compressor.
    ///
    /// Weights are not ranked; only `q=0` excludes a coding.
    pub(crate) fn negotiate(&self, accept_encoding: &str) -> Option<&'static str> {
        accept_encoding.split(',').find_map(|item| {
            let mut parts = item.split(';');
            let name = parts.next()?.trim();

            let refused = parts.any(|param| {
                let param = param.trim();
                param
                    .strip_prefix("q=")
                    .and_then(|q| q.trim().parse::<f32>().ok())
                    .is_some_and(|q| q <= 0.0)
            });

            match refused {
                true => None,
                false => self.get(name).map(|c| c.name()),
            }
        })
    }
}

struct CacheEntry {
    path: PathBuf,
    modified: SystemTime,
}

/// Compressed copies of static files, keyed by source path and coding.
///
/// An entry is rebuilt when the source modification time changes.
pub(crate) struct FileCache {
    dir: PathBuf,
    entries: RwLock<HashMap<(PathBuf, &'static str), CacheEntry>>,
}

impl FileCache {
    pub(crate) fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self {
            dir: dir.into(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Path of the compressed copy of `src`, built on a miss.
    pub(crate) fn get_or_compress(
        &self,
        src: &Path,
        compressor: &dyn Compressor,
    ) -> io::Result<PathBuf> {
        let modified = fs::metadata(src)?.modified()?;
        let key = (src.to_path_buf(), compressor.name());

        {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = entries.get(&key) {
                if entry.modified == modified && entry.path.is_file() {
                    return Ok(entry.path.clone());
                }
            }
        }

        fs::create_dir_all(&self.dir)?;
        let name = cache_name(src, compressor.name());
        let path = self.dir.join(&name);
        let tmp = self.dir.join(format!("{name}.{:016x}.tmp", rand::random::<u64>()));

        if let Err(err) = compressor.compress_file(src, &tmp) {
            let _ = fs::remove_file(&tmp);
            return Err(err);
        }
        fs::rename(&tmp, &path)?;
        debug!("cached {} copy of {} at {}", compressor.name(), src.display(), path.display());

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(
            key,
            CacheEntry {
                path: path.clone(),
                modified,
            },
        );

        Ok(path)
    }
}

fn cache_name(src: &Path, coding: &str) -> String {
    let mut hasher = DefaultHasher::new();
    src.hash(&mut hasher);
    format!("{:016x}.{coding}", hasher.finish())
}
