//! Readers over on-disk chunks

use super::{BatchReader, BATCH_SIZE};
use crate::modification::apply_deletions;
use crate::query::filter::{accepts, Filter};
use crate::query::QueryContext;
use crate::storage::TsFileResource;
use crate::tsfile::{ChunkLoader, ChunkMetadata, TsFileReader};
use crate::{BatchData, Result, SeriesPath, TimeValuePair, Timestamp};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Reader over chunks of one series in one file, sealed or open.
///
/// Chunks are loaded one at a time. Deletion masks carried by the chunk
/// metadata are applied to every loaded point.
pub struct FileSeriesReader {
    path: PathBuf,
    loader: Option<ChunkLoader>,
    chunks: VecDeque<ChunkMetadata>,
    filter: Option<Filter>,
    reverse: bool,
    current: VecDeque<TimeValuePair>,
}

impl FileSeriesReader {
    pub fn new(
        path: impl Into<PathBuf>,
        mut chunks: Vec<ChunkMetadata>,
        filter: Option<Filter>,
        reverse: bool,
    ) -> Self {
        chunks.retain(|c| {
            !c.fully_deleted()
                && filter
                    .as_ref()
                    .map_or(true, |f| f.satisfy_start_end_time(c.start_time, c.end_time))
        });
        if reverse {
            chunks.reverse();
        }
        Self {
            path: path.into(),
            loader: None,
            chunks: chunks.into(),
            filter,
            reverse,
            current: VecDeque::new(),
        }
    }

    fn load_next_chunk(&mut self) -> Result<bool> {
        let Some(meta) = self.chunks.pop_front() else {
            return Ok(false);
        };
        let loader = match self.loader.take() {
            Some(loader) => loader,
            None => ChunkLoader::open(&self.path)?,
        };
        let chunk = loader.load(&meta);
        self.loader = Some(loader);

        let deleted_at: Timestamp = meta.deleted_at;
        let mut points: VecDeque<TimeValuePair> = chunk?
            .points
            .into_iter()
            .filter(|p| p.timestamp > deleted_at && accepts(self.filter.as_ref(), p))
            .collect();
        if self.reverse {
            points.make_contiguous().reverse();
        }
        self.current = points;
        Ok(true)
    }
}

impl BatchReader for FileSeriesReader {
    fn has_next(&mut self) -> Result<bool> {
        while self.current.is_empty() {
            if !self.load_next_chunk()? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn next_batch(&mut self) -> Result<BatchData> {
        let n = self.current.len().min(BATCH_SIZE);
        Ok(self.current.drain(..n).collect())
    }

    fn close(&mut self) {
        self.loader = None;
        self.chunks.clear();
        self.current.clear();
    }
}

/// Reader over the sealed files of a series, opening one file at a time
pub struct SealedTsFilesReader {
    path: SeriesPath,
    files: VecDeque<TsFileResource>,
    filter: Option<Filter>,
    ctx: Arc<QueryContext>,
    reverse: bool,
    current: Option<FileSeriesReader>,
}

impl SealedTsFilesReader {
    /// `files` are ordered oldest first; reverse mode starts at the newest
    pub fn new(
        path: SeriesPath,
        mut files: Vec<TsFileResource>,
        filter: Option<Filter>,
        ctx: Arc<QueryContext>,
        reverse: bool,
    ) -> Self {
        files.retain(|file| {
            let Some(start) = file.start_time(&path.device) else {
                return false;
            };
            let end = file.end_time(&path.device).unwrap_or(Timestamp::MAX);
            filter
                .as_ref()
                .map_or(true, |f| f.satisfy_start_end_time(start, end))
        });
        if reverse {
            files.reverse();
        }
        Self {
            path,
            files: files.into(),
            filter,
            ctx,
            reverse,
            current: None,
        }
    }

    fn open(&self, file: &TsFileResource) -> Result<FileSeriesReader> {
        let reader = TsFileReader::open(&file.path)?;
        let mut chunks = reader.chunk_metadata(&self.path.device, &self.path.measurement);
        let deletions = self.ctx.series_modifications(&file.path, &self.path)?;
        apply_deletions(&mut chunks, &deletions);
        debug!(
            "Query {} reads {} chunks of {} from {:?}",
            self.ctx.job_id(),
            chunks.len(),
            self.path,
            file.path
        );
        Ok(FileSeriesReader::new(
            file.path.clone(),
            chunks,
            self.filter.clone(),
            self.reverse,
        ))
    }
}

impl BatchReader for SealedTsFilesReader {
    fn has_next(&mut self) -> Result<bool> {
        loop {
            if let Some(current) = self.current.as_mut() {
                if current.has_next()? {
                    return Ok(true);
                }
                current.close();
                self.current = None;
            }
            let Some(file) = self.files.pop_front() else {
                return Ok(false);
            };
            self.current = Some(self.open(&file)?);
        }
    }

    fn next_batch(&mut self) -> Result<BatchData> {
        match self.current.as_mut() {
            Some(current) => current.next_batch(),
            None => Ok(Vec::new()),
        }
    }

    fn close(&mut self) {
        if let Some(mut current) = self.current.take() {
            current.close();
        }
        self.files.clear();
    }
}
