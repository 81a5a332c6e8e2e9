use crate::{DaqError, DecodedEvent, MAX_CHANNELS, MB_SIZE};
use log::{debug, info};
use std::{
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

const RAW_EXTENSION: &str = "bin";

/// Create the output directory if it does not exist yet.
pub fn create_output_dir(path: &Path) -> Result<(), DaqError> {
    if path.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(path).map_err(|source| DaqError::OutDir {
        path: path.to_path_buf(),
        source,
    })?;
    info!("Output directory {} created", path.display());
    Ok(())
}

/// Insert `_<label>` before a `.bin` extension, or append it to any other name.
pub fn labeled_path(path: &Path, label: &str) -> PathBuf {
    match (path.extension(), path.file_stem()) {
        (Some(ext), Some(stem)) if ext == RAW_EXTENSION => {
            let mut name = stem.to_os_string();
            name.push(format!("_{label}.{RAW_EXTENSION}"));
            path.with_file_name(name)
        }
        _ => {
            let mut name = path.as_os_str().to_os_string();
            name.push(format!("_{label}"));
            PathBuf::from(name)
        }
    }
}

/// Outcome of a raw write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawWrite {
    /// Raw capture is off for this board.
    Skipped,
    Written,
    /// The write filled the file; later writes go to rotation `index`.
    Rotated { index: u32 },
}

/// Raw output of one board.
#[derive(Debug)]
struct RawFile {
    path: PathBuf,
    rotation_index: u32,
    current_size: u64,
    writer: BufWriter<File>,
}

/// Owns every output file handle of the run.
///
/// Each board has at most one raw file open at a time and, when waveform saving is
/// on, one text file per channel. Nothing else writes to these handles.
#[derive(Debug)]
pub struct OutputFileManager {
    dir: PathBuf,
    file_name: String,
    max_file_size: Option<u64>,
    raw: Vec<Option<RawFile>>,
    waves: Vec<[Option<BufWriter<File>>; MAX_CHANNELS]>,
}

impl OutputFileManager {
    /// Files rotate once they hold more than `max_file_size_mb` MiB, compared in
    /// bytes. `max_file_size_mb == 0` disables rotation.
    pub fn new(dir: &Path, file_name: &str, n_boards: usize, max_file_size_mb: u64) -> Self {
        Self {
            dir: dir.to_path_buf(),
            file_name: file_name.to_string(),
            max_file_size: (max_file_size_mb > 0).then(|| max_file_size_mb.saturating_mul(MB_SIZE)),
            raw: (0..n_boards).map(|_| None).collect(),
            waves: (0..n_boards).map(|_| Default::default()).collect(),
        }
    }

    pub fn raw_path(&self, board: usize, rotation_index: u32) -> PathBuf {
        self.dir.join(format!(
            "{}_{board}_{rotation_index}.{RAW_EXTENSION}",
            self.file_name
        ))
    }

    pub fn wave_path(&self, board: usize, channel: usize) -> PathBuf {
        self.dir
            .join(format!("{}_wave_{board}_{channel}.txt", self.file_name))
    }

    /// Open the raw file of `board` for `rotation_index`, closing any previous one.
    pub fn open(&mut self, board: usize, rotation_index: u32) -> Result<(), DaqError> {
        if let Some(mut previous) = self.raw[board].take() {
            previous.writer.flush().map_err(|source| DaqError::FileWrite {
                path: previous.path.clone(),
                source,
            })?;
        }
        let path = self.raw_path(board, rotation_index);
        let file = File::create(&path).map_err(|source| DaqError::FileOpen {
            path: path.clone(),
            source,
        })?;
        debug!("Board {board}: raw output {}", path.display());
        self.raw[board] = Some(RawFile {
            path,
            rotation_index,
            current_size: 0,
            writer: BufWriter::new(file),
        });
        Ok(())
    }

    pub fn is_open(&self, board: usize) -> bool {
        self.raw[board].is_some()
    }

    pub fn rotation_index(&self, board: usize) -> Option<u32> {
        self.raw[board].as_ref().map(|raw| raw.rotation_index)
    }

    pub fn current_size(&self, board: usize) -> Option<u64> {
        self.raw[board].as_ref().map(|raw| raw.current_size)
    }

    pub fn current_path(&self, board: usize) -> Option<&Path> {
        self.raw[board].as_ref().map(|raw| raw.path.as_path())
    }

    /// Append `bytes` to the raw file of `board`, rotating once it grows past the limit.
    ///
    /// The write that crosses the limit lands in the old file. If the next file
    /// can't be opened, raw capture for that board stops and the error is returned.
    pub fn write(&mut self, board: usize, bytes: &[u8]) -> Result<RawWrite, DaqError> {
        let Some(raw) = self.raw[board].as_mut() else {
            return Ok(RawWrite::Skipped);
        };
        if let Err(source) = raw.writer.write_all(bytes) {
            let path = raw.path.clone();
            self.raw[board] = None;
            return Err(DaqError::FileWrite { path, source });
        }
        raw.current_size += bytes.len() as u64;

        match self.max_file_size {
            Some(limit) if raw.current_size > limit => {
                let next = raw.rotation_index + 1;
                if let Err(e) = self.open(board, next) {
                    self.raw[board] = None;
                    return Err(e);
                }
                Ok(RawWrite::Rotated { index: next })
            }
            _ => Ok(RawWrite::Written),
        }
    }

    /// Close the raw file of `board` and, given a session label, rename it.
    ///
    /// Returns the final path, or `None` if no file was open. A failed rename
    /// leaves the file under its original name.
    pub fn close_and_finalize(
        &mut self,
        board: usize,
        label: Option<&str>,
    ) -> Option<Result<PathBuf, DaqError>> {
        let mut raw = self.raw[board].take()?;
        if let Err(source) = raw.writer.flush() {
            return Some(Err(DaqError::FileWrite {
                path: raw.path,
                source,
            }));
        }
        drop(raw.writer);

        let Some(label) = label else {
            return Some(Ok(raw.path));
        };
        let renamed = labeled_path(&raw.path, label);
        Some(
            fs::rename(&raw.path, &renamed)
                .map(|_| renamed.clone())
                .map_err(|source| DaqError::Rename {
                    from: raw.path,
                    to: renamed,
                    source,
                }),
        )
    }

    /// Append the waveforms of `events` to the per-channel files of `board`.
    ///
    /// Each line holds the event timestamp followed by the samples.
    pub fn write_waves(&mut self, board: usize, events: &[DecodedEvent]) -> Result<(), DaqError> {
        for event in events {
            for ch in event.channels() {
                if self.waves[board][ch].is_none() {
                    let path = self.wave_path(board, ch);
                    let file = OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(&path)
                        .map_err(|source| DaqError::FileOpen { path, source })?;
                    self.waves[board][ch] = Some(BufWriter::new(file));
                }
                let mut line = event.timestamp.to_string();
                for sample in event.waveform(ch) {
                    line.push(' ');
                    line.push_str(&sample.to_string());
                }
                line.push('\n');
                let Some(writer) = self.waves[board][ch].as_mut() else {
                    continue;
                };
                if let Err(source) = writer.write_all(line.as_bytes()) {
                    return Err(DaqError::FileWrite {
                        path: self.wave_path(board, ch),
                        source,
                    });
                }
            }
        }
        Ok(())
    }

    /// Flush and close every waveform file.
    pub fn close_waves(&mut self) {
        for board in self.waves.iter_mut() {
            for mut writer in board.iter_mut().filter_map(Option::take) {
                if let Err(e) = writer.flush() {
                    log::warn!("Can't flush waveform file: {e}");
                }
            }
        }
    }
}
