/**
 * SINK JSONL - Persistence fichier append-only
 *
 * RÔLE : Backend minimal qui survit aux redémarrages sans moteur externe.
 *
 * FONCTIONNEMENT :
 * - `readings.jsonl` : une ligne `{device_id, reading}` par relevé
 * - `irrigation_events.jsonl` : une ligne par tentative d'arrosage
 * - Écritures sérialisées par un verrou async (pas de lignes entremêlées)
 * - Relecture en flux ligne à ligne, lignes illisibles ignorées
 */

use super::{EventSink, SinkError, SinkInfo};
use crate::clock::SharedClock;
use crate::models::{IrrigationEvent, Reading};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, info};

const READINGS_FILE: &str = "readings.jsonl";
const EVENTS_FILE: &str = "irrigation_events.jsonl";

#[derive(Debug, Serialize, Deserialize)]
struct ReadingLine {
    device_id: String,
    reading: Reading,
}

pub struct JsonlSink {
    dir: PathBuf,
    clock: SharedClock,
    write_lock: Mutex<()>,
}

impl JsonlSink {
    pub async fn open<P: Into<PathBuf>>(dir: P, clock: SharedClock) -> Result<Self, SinkError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        info!("[sink] jsonl storage at {:?}", dir);
        Ok(Self { dir, clock, write_lock: Mutex::new(()) })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn append<T: Serialize>(&self, file: &str, record: &T) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(file))
            .await?;
        f.write_all(&line).await?;
        f.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl EventSink for JsonlSink {
    async fn write_reading(&self, device_id: &str, reading: &Reading) -> Result<(), SinkError> {
        let record = ReadingLine { device_id: device_id.to_string(), reading: reading.clone() };
        self.append(READINGS_FILE, &record).await
    }

    async fn write_irrigation_event(&self, event: &IrrigationEvent) -> Result<(), SinkError> {
        self.append(EVENTS_FILE, event).await
    }

    async fn query_recent(&self, device_id: &str, window: time::Duration) -> Result<Vec<Reading>, SinkError> {
        let path = self.dir.join(READINGS_FILE);
        let file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        // Lecture ligne à ligne : le fichier n'est jamais chargé en entier
        let since = self.clock.now() - window;
        let mut lines = BufReader::new(file).lines();
        let mut readings = Vec::new();
        let mut skipped = 0usize;
        while let Some(line) = lines.next_line().await? {
            match serde_json::from_str::<ReadingLine>(&line) {
                Ok(record) if record.device_id == device_id && record.reading.observed_at >= since => {
                    readings.push(record.reading);
                }
                Ok(_) => {}
                Err(_) => skipped += 1,
            }
        }
        if skipped > 0 {
            debug!("[sink] skipped {skipped} unreadable lines in {:?}", path);
        }
        Ok(readings)
    }

    async fn ping(&self) -> Result<(), SinkError> {
        let meta = fs::metadata(&self.dir).await?;
        if !meta.is_dir() {
            return Err(SinkError::Unavailable(format!("{:?} is not a directory", self.dir)));
        }
        Ok(())
    }

    fn info(&self) -> SinkInfo {
        SinkInfo {
            name: "jsonl".into(),
            description: format!("append-only files in {}", self.dir.display()),
        }
    }
}
