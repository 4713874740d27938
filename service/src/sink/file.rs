//
// Copyright 2017-2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Append-only line sinks with size-based rotation

use super::EventSink;
use crate::error::SinkError;
use crate::event::Event;
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Line rendering used by a [`FileSink`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineFormat {
    /// [`Event::to_text_line`]
    Text,
    /// One JSON object per line
    Json,
}

/// Writes one line per event, rotating at `max_bytes`
///
/// Rotated files are named `<path>.1` (newest) through `<path>.<backups>`.
#[derive(Debug)]
pub struct FileSink {
    name: String,
    format: LineFormat,
    path: PathBuf,
    max_bytes: u64,
    backups: usize,
    file: Option<File>,
    written: u64,
}

impl FileSink {
    /// Create a sink; the file is opened on first write
    pub fn new(
        name: impl Into<String>,
        format: LineFormat,
        path: impl Into<PathBuf>,
        max_bytes: u64,
        backups: usize,
    ) -> Self {
        Self {
            name: name.into(),
            format,
            path: path.into(),
            max_bytes,
            backups,
            file: None,
            written: 0,
        }
    }

    /// Path of the active file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn render(&self, event: &Event) -> Result<String, SinkError> {
        let mut line = match self.format {
            LineFormat::Text => event.to_text_line(),
            LineFormat::Json => serde_json::to_string(event)?,
        };
        line.push('\n');
        Ok(line)
    }

    fn backup_path(&self, index: usize) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(format!(".{}", index));
        PathBuf::from(name)
    }

    async fn open(&mut self) -> Result<&mut File, SinkError> {
        if self.file.is_none() {
            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent).await?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            self.written = file.metadata().await?.len();
            debug!(sink = %self.name, path = %self.path.display(), "Opened event file");
            self.file = Some(file);
        }
        self.file.as_mut().ok_or(SinkError::Closed)
    }

    async fn rotate(&mut self) -> Result<(), SinkError> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
        }

        if self.backups == 0 {
            fs::remove_file(&self.path).await?;
        } else {
            for index in (1..self.backups).rev() {
                let from = self.backup_path(index);
                if fs::try_exists(&from).await? {
                    fs::rename(&from, self.backup_path(index + 1)).await?;
                }
            }
            fs::rename(&self.path, self.backup_path(1)).await?;
        }

        info!(sink = %self.name, path = %self.path.display(), "Rotated event file");
        self.written = 0;
        Ok(())
    }
}

#[async_trait]
impl EventSink for FileSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&mut self, event: &Event) -> Result<(), SinkError> {
        let line = self.render(event)?;
        let len = line.len() as u64;

        self.open().await?;
        if self.written > 0 && self.written + len > self.max_bytes {
            self.rotate().await?;
        }

        let result = async {
            let file = self.open().await?;
            file.write_all(line.as_bytes()).await?;
            file.flush().await?;
            Ok::<_, SinkError>(())
        }
        .await;

        match result {
            Ok(()) => {
                self.written += len;
                Ok(())
            }
            Err(e) => {
                // Reopen on the next attempt
                self.file = None;
                Err(e)
            }
        }
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        if let Some(file) = self.file.as_mut() {
            file.flush().await?;
            file.sync_data().await?;
        }
        Ok(())
    }
}
