use anyhow::{Context, Result, anyhow, bail};
use sevenz_rust::{Password, SevenZReader};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::pipeline::ChunkSource;
use crate::stream::ChunkSink;

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
pub const DEFAULT_ENTRY_SUFFIX: &str = ".geojsonl";

/// Whether `path` names the first volume of a split archive (`*.001`).
pub fn is_multi_volume(path: &Path) -> bool {
    path.extension().and_then(|ext| ext.to_str()) == Some("001")
}

/// Every volume of a split set, starting from the `.001` file and stopping
/// at the first missing number.
pub fn volume_paths(first: &Path) -> Vec<PathBuf> {
    let mut paths = vec![first.to_path_buf()];
    for number in 2.. {
        let next = first.with_extension(format!("{number:03}"));
        if !next.is_file() {
            break;
        }
        paths.push(next);
    }
    paths
}

/// Read + Seek over a sequence of files as if they were concatenated.
pub struct MultiVolumeReader {
    volumes: Vec<File>,
    starts: Vec<u64>,
    len: u64,
    pos: u64,
}

impl MultiVolumeReader {
    pub fn open(paths: &[PathBuf]) -> Result<Self> {
        let mut volumes = Vec::with_capacity(paths.len());
        let mut starts = Vec::with_capacity(paths.len());
        let mut len = 0;
        for path in paths {
            let file = File::open(path)
                .with_context(|| format!("Archive: Failed to open volume {:?}", path))?;
            let size = file.metadata()?.len();
            starts.push(len);
            len += size;
            volumes.push(file);
        }
        tracing::debug!("Opened {} volumes, {} bytes total", volumes.len(), len);
        Ok(Self {
            volumes,
            starts,
            len,
            pos: 0,
        })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    fn volume_at(&self, pos: u64) -> usize {
        self.starts.partition_point(|&start| start <= pos).saturating_sub(1)
    }
}

impl Read for MultiVolumeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.pos >= self.len {
            return Ok(0);
        }
        let index = self.volume_at(self.pos);
        let start = self.starts[index];
        let end = self.starts.get(index + 1).copied().unwrap_or(self.len);
        let available = (end - self.pos).min(buf.len() as u64) as usize;

        let volume = &mut self.volumes[index];
        volume.seek(SeekFrom::Start(self.pos - start))?;
        let read = volume.read(&mut buf[..available])?;
        self.pos += read as u64;
        Ok(read)
    }
}

impl Seek for MultiVolumeReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => self.len.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
        };
        match target {
            Some(target) => {
                self.pos = target;
                Ok(target)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of archive",
            )),
        }
    }
}

/// The archive entry a pass streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub name: String,
    pub size: u64,
}

/// A (possibly split) 7z archive and the entry selected inside it.
pub struct ArchiveSource {
    volumes: Vec<PathBuf>,
    entry: EntryInfo,
    chunk_size: usize,
}

impl ArchiveSource {
    pub fn open(path: &Path, entry_suffix: &str, chunk_size: usize) -> Result<Self> {
        if !path.is_file() {
            bail!("Archive: Input file not found: {:?}", path);
        }
        let volumes = if is_multi_volume(path) {
            volume_paths(path)
        } else {
            vec![path.to_path_buf()]
        };
        if volumes.len() > 1 {
            tracing::info!("Archive: {} volumes starting at {:?}", volumes.len(), path);
        }

        let reader = open_reader(&volumes)?;
        let candidates: Vec<EntryInfo> = reader
            .archive()
            .files
            .iter()
            .filter(|entry| !entry.is_directory() && entry.name().ends_with(entry_suffix))
            .map(|entry| EntryInfo {
                name: entry.name().to_string(),
                size: entry.size(),
            })
            .collect();

        let Some(entry) = candidates.first().cloned() else {
            bail!("Archive: No entry ending with {:?} in {:?}", entry_suffix, path);
        };
        if candidates.len() > 1 {
            tracing::warn!(
                "Archive: {} entries end with {:?}, using {:?}",
                candidates.len(),
                entry_suffix,
                entry.name
            );
        }
        tracing::info!("Archive: streaming {:?} ({} bytes)", entry.name, entry.size);

        Ok(Self {
            volumes,
            entry,
            chunk_size: chunk_size.max(1),
        })
    }

    pub fn entry(&self) -> &EntryInfo {
        &self.entry
    }
}

fn open_reader(volumes: &[PathBuf]) -> Result<SevenZReader<MultiVolumeReader>> {
    let reader = MultiVolumeReader::open(volumes)?;
    let len = reader.len();
    SevenZReader::new(reader, len, Password::empty())
        .with_context(|| format!("Archive: Failed to read 7z archive {:?}", volumes[0]))
}

impl ChunkSource for ArchiveSource {
    fn pump(&mut self, sink: &mut dyn ChunkSink) -> Result<()> {
        let mut reader = open_reader(&self.volumes)?;
        let mut buf = vec![0u8; self.chunk_size];
        let mut sink_error = None;
        let mut found = false;

        let walked = reader.for_each_entries(|entry, data| {
            if entry.name() != self.entry.name {
                io::copy(data, &mut io::sink())?;
                return Ok(true);
            }
            found = true;
            loop {
                let read = data.read(&mut buf)?;
                if read == 0 {
                    break;
                }
                if let Err(err) = sink.write_chunk(&buf[..read]) {
                    sink_error = Some(err);
                    return Err(sevenz_rust::Error::from(io::Error::other(
                        "downstream write failed",
                    )));
                }
            }
            Ok(false)
        });

        if let Some(err) = sink_error {
            return Err(err);
        }
        walked.map_err(|err| anyhow!(err)).with_context(|| {
            format!("Archive: Failed to decompress {:?}", self.entry.name)
        })?;
        if !found {
            bail!("Archive: Entry {:?} disappeared between passes", self.entry.name);
        }
        sink.close()
    }
}
