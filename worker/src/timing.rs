use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use tracing::{error, info};

/// Append-only CSV log of per-fragment execution times
/// (`<hash>,<seconds>`). Flushed per line so tail -f works while the worker
/// runs.
pub struct QueryTimeLog {
    file: Option<Mutex<File>>,
}

impl QueryTimeLog {
    pub fn open(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => Some(Mutex::new(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| format!("opening query time log {}", path.display()))?,
            )),
            None => None,
        };
        Ok(Self { file })
    }

    pub fn disabled() -> Self {
        Self { file: None }
    }

    pub fn record(&self, hash: &str, seconds: f64) {
        let Some(file) = &self.file else {
            return;
        };
        let line = format!("{hash},{seconds:.6}\n");
        match file.lock() {
            Ok(mut file) => {
                if let Err(e) = file.write_all(line.as_bytes()).and_then(|()| file.flush()) {
                    error!("failed to log query time for {hash}: {e}");
                } else {
                    info!("{hash}, {seconds:.6}s written to CSV");
                }
            }
            Err(_) => error!("query time log lock poisoned, dropping entry for {hash}"),
        }
    }
}
