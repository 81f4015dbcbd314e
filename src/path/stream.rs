use std::sync::{Arc, Mutex};

use crate::core::types::{Data, Track};
use crate::observability::metrics as obs;

use super::StreamReader;

/// In-memory fan-out of bus items from one publisher to N readers.
///
/// `write_data` runs on the publisher's task and must stay wait-free:
/// readers absorb items through their own ring buffers and never block
/// the fan-out.
pub struct Stream {
    tracks: Vec<Track>,
    readers: Mutex<Vec<Arc<dyn StreamReader>>>,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream").field("tracks", &self.tracks).finish_non_exhaustive()
    }
}

impl Stream {
    pub fn new(tracks: Vec<Track>) -> Self {
        Self {
            tracks,
            readers: Mutex::new(Vec::new()),
        }
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn reader_count(&self) -> usize {
        self.readers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn add_reader(&self, reader: Arc<dyn StreamReader>) {
        let mut readers = self.readers.lock().unwrap_or_else(|e| e.into_inner());
        if !readers.iter().any(|r| Arc::ptr_eq(r, &reader)) {
            readers.push(reader);
        }
    }

    pub fn remove_reader(&self, reader: &Arc<dyn StreamReader>) {
        let mut readers = self.readers.lock().unwrap_or_else(|e| e.into_inner());
        readers.retain(|r| !Arc::ptr_eq(r, reader));
    }

    /// Fan one item out to every registered reader.
    pub fn write_data(&self, data: Arc<Data>) {
        obs::add_stream_items(1);
        let readers = self.readers.lock().unwrap_or_else(|e| e.into_inner());
        for reader in readers.iter() {
            reader.on_reader_data(&data);
        }
    }
}
