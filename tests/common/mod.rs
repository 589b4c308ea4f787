#![allow(dead_code)]

use stagehand::core::download::{RemoteBody, Transport};
use stagehand::core::process::TargetProcess;
use stagehand::error::{Result, UpdateError};
use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

/// Serves pages and files from memory.
#[derive(Default)]
pub struct MemoryTransport {
    pages: Mutex<HashMap<String, String>>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    pub downloads: AtomicUsize,
}

impl MemoryTransport {
    pub fn page(self, url: &str, body: &str) -> Self {
        self.pages
            .lock()
            .unwrap()
            .insert(url.to_string(), body.to_string());
        self
    }

    pub fn file(self, url: &str, data: Vec<u8>) -> Self {
        self.files.lock().unwrap().insert(url.to_string(), data);
        self
    }

    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }
}

impl Transport for MemoryTransport {
    fn content_length(&self, url: &str) -> Result<u64> {
        self.files
            .lock()
            .unwrap()
            .get(url)
            .map(|data| data.len() as u64)
            .ok_or_else(|| UpdateError::network(url, "404 Not Found"))
    }

    fn open(&self, url: &str) -> Result<RemoteBody> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        let data = self
            .files
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| UpdateError::network(url, "404 Not Found"))?;

        Ok(RemoteBody {
            content_length: Some(data.len() as u64),
            reader: Box::new(Cursor::new(data)),
        })
    }

    fn fetch_text(&self, url: &str) -> Result<String> {
        self.pages
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| UpdateError::network(url, "404 Not Found"))
    }
}

#[derive(Default)]
pub struct StubProcess {
    pub running: AtomicBool,
    pub stops: AtomicUsize,
}

impl TargetProcess for StubProcess {
    fn is_running(&self) -> Result<bool> {
        Ok(self.running.load(Ordering::SeqCst))
    }

    fn stop(&self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Builds a zip archive; names ending in `/` become directories.
pub fn zip_archive(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, content) in entries {
        if name.ends_with('/') {
            writer
                .add_directory(*name, SimpleFileOptions::default())
                .unwrap();
        } else {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(content.as_bytes()).unwrap();
        }
    }
    writer.finish().unwrap().into_inner()
}
