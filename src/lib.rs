//! A single-node append-only log store for time-keyed records.
//!
//! `Dls` is the facade a collaborator (the out-of-scope wire protocol /
//! connection handler) is expected to drive: it owns the async I/O pool
//! (C1), the checkpoint service (C6), and the per-channel storage engine
//! (C5), and wires the two background cooperative tasks the spec calls out
//! — the periodic write-flush tick and the periodic checkpoint commit —
//! on top of them.

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]

#[macro_use]
extern crate tracing;

pub mod aio;
pub mod bucket;
pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod error;
pub mod filter;
pub mod input_buffer;
pub mod iterator;
pub mod layout;
pub mod record;

use std::sync::Arc;

use tokio::task::JoinHandle;

pub use config::{DlsConfig, DlsConfigBuilder};
pub use engine::{Engine, FilteredIterator};
pub use error::DlsError;
pub use filter::RecordFilter;
pub use iterator::{FileIterator, NeoStepIterator, StepIterator};

use aio::AioPool;
use checkpoint::CheckpointService;

/// The top-level handle to a running store. Construct with [`Dls::open`];
/// call [`Dls::shutdown`] to stop the background tasks and leave a clean
/// (commit-log-free) data directory behind.
pub struct Dls {
    engine: Arc<Engine>,
    pool: Arc<AioPool>,
    checkpoint: Arc<CheckpointService>,
    data_dir: std::path::PathBuf,
    flush_task: JoinHandle<()>,
    commit_task: JoinHandle<()>,
}

impl Dls {
    /// Opens (or creates) a store rooted at `config.data_dir`, running
    /// startup truncation (spec.md §4.6) before accepting writes, and
    /// spawning the write-flush and checkpoint-commit background tasks.
    #[instrument(skip(config), fields(data_dir = %config.data_dir.display()))]
    pub async fn open(config: DlsConfig) -> Result<Self, DlsError> {
        std::fs::create_dir_all(&config.data_dir)?;
        checkpoint::recover(&config.data_dir)?;

        let pool = Arc::new(AioPool::new(config.number_of_thread_workers));
        let checkpoint = Arc::new(CheckpointService::new(&config.data_dir));
        let engine = Arc::new(Engine::new(config.clone(), pool.clone(), checkpoint.clone()));

        let flush_task = tokio::spawn(flush_tick(engine.clone(), config.write_flush_interval()));
        let commit_task = tokio::spawn(commit_tick(
            checkpoint.clone(),
            pool.clone(),
            config.checkpoint_commit_interval(),
        ));

        info!("store opened");
        Ok(Dls {
            engine,
            pool,
            checkpoint,
            data_dir: config.data_dir,
            flush_task,
            commit_task,
        })
    }

    /// Appends one record to `channel`.
    pub async fn put(&self, channel: &str, key: u64, value: &[u8]) -> Result<(), DlsError> {
        self.engine.put(channel, key, value).await
    }

    /// Streams `[min, max]` of `channel` in file order.
    pub async fn get_range(&self, channel: &str, min: u64, max: u64) -> Result<StepIterator, DlsError> {
        self.engine.get_range(channel, min, max).await
    }

    /// Streams `[min, max]` of `channel`, applying `filter` to each value.
    pub async fn get_range_filtered(
        &self,
        channel: &str,
        min: u64,
        max: u64,
        filter: RecordFilter,
    ) -> Result<FilteredIterator, DlsError> {
        self.engine.get_range_filtered(channel, min, max, filter).await
    }

    /// Streams every record in `channel`.
    pub async fn get_all(&self, channel: &str) -> Result<StepIterator, DlsError> {
        self.engine.get_all(channel).await
    }

    /// Flushes every open writer, across every channel, immediately.
    pub async fn flush(&self) {
        self.engine.flush_all().await;
    }

    /// Closes and unlinks a channel's entire directory tree.
    pub async fn remove_channel(&self, channel: &str) -> Result<(), DlsError> {
        self.engine.remove_channel(channel).await
    }

    /// Stops the background tasks, closes every open writer (final flush),
    /// commits one last time, and unlinks the commit log — leaving a data
    /// directory that needs no startup truncation on the next open (spec.md
    /// §7 shutdown sequence).
    #[instrument(skip(self))]
    pub async fn shutdown(self) -> Result<(), DlsError> {
        let Dls {
            engine,
            pool,
            checkpoint,
            data_dir,
            flush_task,
            commit_task,
        } = self;

        commit_task.abort();
        flush_task.abort();
        let _ = commit_task.await;
        let _ = flush_task.await;

        engine.close_all().await;
        checkpoint.commit(&pool).await?;
        drop(engine);
        drop(checkpoint);

        let log_path = data_dir.join(checkpoint::CHECKPOINT_FILE_NAME);
        match std::fs::remove_file(&log_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let pool = Arc::try_unwrap(pool)
            .unwrap_or_else(|_| panic!("AioPool still referenced by an in-flight iterator at shutdown"));
        pool.shutdown();

        info!("store shut down cleanly");
        Ok(())
    }
}

async fn flush_tick(engine: Arc<Engine>, interval: std::time::Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        engine.flush_all().await;
    }
}

async fn commit_tick(checkpoint: Arc<CheckpointService>, pool: Arc<AioPool>, interval: std::time::Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if let Err(source) = checkpoint.commit(&pool).await {
            warn!(%source, "checkpoint commit failed, will retry next interval");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_put_flush_shutdown_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let config = DlsConfigBuilder::from_path(dir.path())
            .checkpoint_commit_seconds(3600)
            .write_flush_ms(3_600_000)
            .build()
            .unwrap();

        let dls = Dls::open(config).await.unwrap();
        dls.put("c1", 0x570e13eb00000001, b"hello").await.unwrap();
        dls.flush().await;

        let mut iter = dls.get_range("c1", 0x570e13eb00000000, 0x570e13ebffffffff).await.unwrap();
        let (key, value) = iter.next().await.unwrap().unwrap();
        assert_eq!(key, 0x570e13eb00000001);
        assert_eq!(value, b"hello");
        assert!(iter.next().await.unwrap().is_none());
        drop(iter);

        dls.shutdown().await.unwrap();
        assert!(!dir.path().join(checkpoint::CHECKPOINT_FILE_NAME).exists());
    }

    #[tokio::test]
    async fn reopen_after_clean_shutdown_finds_prior_writes() {
        let dir = tempfile::tempdir().unwrap();
        let config = || {
            DlsConfigBuilder::from_path(dir.path())
                .checkpoint_commit_seconds(3600)
                .write_flush_ms(3_600_000)
                .build()
                .unwrap()
        };

        let dls = Dls::open(config()).await.unwrap();
        dls.put("c1", 1, b"first").await.unwrap();
        dls.flush().await;
        dls.shutdown().await.unwrap();

        let dls = Dls::open(config()).await.unwrap();
        let mut iter = dls.get_all("c1").await.unwrap();
        let (key, value) = iter.next().await.unwrap().unwrap();
        assert_eq!((key, value), (1, b"first".to_vec()));
        drop(iter);
        dls.shutdown().await.unwrap();
    }
}
