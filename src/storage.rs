//! Run files: a bincode [`RunHeader`] followed by the events back to back.

use std::{
    fs::File,
    io::{BufReader, BufWriter, ErrorKind, Write},
    path::{Path, PathBuf},
};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::{channel_map::NUM_CHANNELS, error::StorageError, features::progress_bar, waveform::Event};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunHeader {
    pub run: u32,
    pub events: u64,
    /// events carry a `toa` array
    pub has_toa: bool,
}

fn check_shape(event: &Event, index: u64, has_toa: bool) -> Result<(), StorageError> {
    let toa_len = event.toa.as_ref().map_or(0, Vec::len);
    let arrays = [
        ("adc", event.adc.len(), NUM_CHANNELS),
        ("tot", event.tot.len(), NUM_CHANNELS),
        ("toa", toa_len, if has_toa { NUM_CHANNELS } else { 0 }),
    ];
    for (array, actual, expected) in arrays {
        if actual != expected {
            return Err(StorageError::BadShape {
                event: index,
                array,
                expected,
                actual,
            });
        }
    }
    Ok(())
}

/// Streams the events of one run file. Iteration stops after the first
/// error.
#[derive(Debug)]
pub struct RunReader {
    path: PathBuf,
    header: RunHeader,
    reader: BufReader<File>,
    read: u64,
    failed: bool,
}

impl RunReader {
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StorageError::MissingRun(path.to_owned()))
            }
            Err(err) => return Err(err.into()),
        };
        let mut reader = BufReader::new(file);
        let header: RunHeader = bincode::deserialize_from(&mut reader)?;
        info!(
            "opened run {} ({} events{}) from {}",
            header.run,
            header.events,
            if header.has_toa { ", with ToA" } else { "" },
            path.display()
        );

        Ok(Self {
            path: path.to_owned(),
            header,
            reader,
            read: 0,
            failed: false,
        })
    }

    pub fn header(&self) -> &RunHeader {
        &self.header
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Decodes and drops the next `count` events. Unlike [`Iterator::nth`]
    /// a read error on the way is returned instead of swallowed.
    pub fn skip_events(&mut self, count: u64) -> Result<(), StorageError> {
        let target = self.read + count;
        if target > self.header.events {
            return Err(self.no_such_event(target));
        }
        while self.read < target {
            self.next().ok_or_else(|| self.no_such_event(target))??;
        }
        Ok(())
    }

    fn no_such_event(&self, event: u64) -> StorageError {
        StorageError::NoSuchEvent {
            file: self.path.display().to_string(),
            event,
            events: self.header.events,
        }
    }

    fn read_event(&mut self) -> Result<Event, StorageError> {
        let event: Event = bincode::deserialize_from(&mut self.reader).map_err(|err| {
            let eof = matches!(*err, bincode::ErrorKind::Io(ref io) if io.kind() == ErrorKind::UnexpectedEof);
            if eof {
                StorageError::Truncated {
                    file: self.path.display().to_string(),
                    expected: self.header.events,
                    actual: self.read,
                }
            } else {
                StorageError::Decode(err)
            }
        })?;
        check_shape(&event, self.read, self.header.has_toa)?;
        Ok(event)
    }
}

impl Iterator for RunReader {
    type Item = Result<Event, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.read >= self.header.events {
            return None;
        }
        let event = self.read_event();
        match event {
            Ok(_) => self.read += 1,
            Err(_) => self.failed = true,
        }
        Some(event)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.header.events - self.read) as usize;
        (0, Some(left))
    }
}

/// Reads a whole run into memory.
pub fn read_run(path: &Path) -> Result<(RunHeader, Vec<Event>), StorageError> {
    let reader = RunReader::open(path)?;
    let header = *reader.header();
    let events = reader.collect::<Result<Vec<_>, _>>()?;
    Ok((header, events))
}

/// Event `index` of a run.
pub fn read_event(path: &Path, index: u64) -> Result<Event, StorageError> {
    let mut reader = RunReader::open(path)?;
    if index >= reader.header().events {
        return Err(reader.no_such_event(index));
    }
    reader.skip_events(index)?;
    reader.next().ok_or_else(|| reader.no_such_event(index))?
}

/// Up to `count` events starting at event `first`, without holding the
/// rest of the run in memory.
pub fn read_window(path: &Path, first: u64, count: usize) -> Result<(RunHeader, Vec<Event>), StorageError> {
    let mut reader = RunReader::open(path)?;
    let header = *reader.header();
    if first >= header.events {
        return Err(reader.no_such_event(first));
    }
    reader.skip_events(first)?;
    let events = reader.take(count).collect::<Result<Vec<_>, _>>()?;
    Ok((header, events))
}

/// Writes a run file whose event count is declared up front.
#[derive(Debug)]
pub struct RunWriter {
    header: RunHeader,
    writer: BufWriter<File>,
    written: u64,
}

impl RunWriter {
    pub fn create(path: &Path, header: RunHeader) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut writer = BufWriter::new(File::create(path)?);
        bincode::serialize_into(&mut writer, &header)?;
        Ok(Self {
            header,
            writer,
            written: 0,
        })
    }

    pub fn write(&mut self, event: &Event) -> Result<(), StorageError> {
        if self.written >= self.header.events {
            return Err(StorageError::EventCountMismatch {
                expected: self.header.events,
                actual: self.written + 1,
            });
        }
        check_shape(event, self.written, self.header.has_toa)?;
        bincode::serialize_into(&mut self.writer, event)?;
        self.written += 1;
        Ok(())
    }

    pub fn finish(mut self) -> Result<RunHeader, StorageError> {
        if self.written != self.header.events {
            return Err(StorageError::EventCountMismatch {
                expected: self.header.events,
                actual: self.written,
            });
        }
        self.writer.flush()?;
        Ok(self.header)
    }
}

/// Concatenates the runs in `inputs` into run `run` at `output`.
///
/// Events go to a sibling `.tmp` file that replaces `output` only after
/// every input was read in full, so a failed combination leaves neither a
/// partial run nor a changed `output` behind.
pub fn combine_runs(
    inputs: &[PathBuf],
    output: &Path,
    run: u32,
) -> Result<RunHeader, StorageError> {
    let readers = inputs
        .iter()
        .map(|path| RunReader::open(path))
        .collect::<Result<Vec<_>, _>>()?;
    let Some(first) = readers.first() else {
        return Err(StorageError::NothingToCombine);
    };
    let has_toa = first.header().has_toa;
    if let Some(reader) = readers.iter().find(|reader| reader.header().has_toa != has_toa) {
        return Err(StorageError::MixedToa {
            first: first.path().to_owned(),
            other: reader.path().to_owned(),
        });
    }
    let header = RunHeader {
        run,
        events: readers.iter().map(|reader| reader.header().events).sum(),
        has_toa,
    };

    let partial = output.with_extension("tmp");
    match copy_events(readers, &partial, header) {
        Ok(header) => {
            std::fs::rename(&partial, output)?;
            Ok(header)
        }
        Err(err) => {
            if let Err(cleanup) = std::fs::remove_file(&partial) {
                if cleanup.kind() != ErrorKind::NotFound {
                    warn!("could not remove {}: {cleanup}", partial.display());
                }
            }
            Err(err)
        }
    }
}

fn copy_events(readers: Vec<RunReader>, path: &Path, header: RunHeader) -> Result<RunHeader, StorageError> {
    let pb = progress_bar(header.events);
    let mut writer = RunWriter::create(path, header)?;
    for reader in readers {
        pb.set_message(format!("run {:03}", reader.header().run));
        for event in reader {
            writer.write(&event?)?;
            pb.inc(1);
        }
    }
    pb.finish_and_clear();
    writer.finish()
}

/// Writes `events` as run `run`.
pub fn write_run(path: &Path, run: u32, events: &[Event]) -> Result<RunHeader, StorageError> {
    let has_toa = events.first().is_some_and(|event| event.toa.is_some());
    let mut writer = RunWriter::create(
        path,
        RunHeader {
            run,
            events: events.len() as u64,
            has_toa,
        },
    )?;
    for event in events {
        writer.write(event)?;
    }
    writer.finish()
}
