//! Conversion daemon: recovers interrupted work, then runs the worker pool and
//! the cleanup sweeper until Ctrl-C.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use meshconv::config::{default_config, load_config};
use meshconv::store::JobRecordStore;
use meshconv::{
    init_logging, ArtifactStore, CleanupSweeper, Config, Database, ExternalConverter,
    JobEventBroadcaster, MeshconvError, SqliteJobStore, SweepPolicy, WorkQueue, WorkQueueConfig,
    WorkerContext, WorkerPool, WorkerPoolConfig,
};

fn main() -> ExitCode {
    let config = match std::env::args_os().nth(1).map(PathBuf::from) {
        Some(path) => load_config(&path),
        None => default_config(),
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            eprintln!("meshconvd: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = init_logging(&config.logging) {
        eprintln!("meshconvd: {}", e);
        return ExitCode::FAILURE;
    }

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "meshconvd exited with an error");
            ExitCode::FAILURE
        }
    }
}

fn run(config: Config) -> Result<(), MeshconvError> {
    let db_path = config.storage.database_path();
    let db = Database::open(&db_path)?;
    tracing::info!(path = %db_path.display(), "Opened database");

    let store: Arc<dyn JobRecordStore> = Arc::new(SqliteJobStore::new(db.clone()));
    let queue = Arc::new(WorkQueue::new(db, WorkQueueConfig::from_config(&config)));

    let recovered = queue.recover_in_flight()?;
    if recovered > 0 {
        tracing::warn!(recovered, "Requeued work items interrupted by a previous run");
    }

    let artifacts = ArtifactStore::new(config.storage.uploads_dir(), config.storage.outputs_dir());
    artifacts.ensure_dirs()?;

    let events = JobEventBroadcaster::default();
    let event_logger = events.spawn_logger().map_err(|e| {
        tracing::warn!(error = %e, "Job event logger not started");
    });
    let ctx = WorkerContext {
        store: Arc::clone(&store),
        queue: Arc::clone(&queue),
        converter: Arc::new(ExternalConverter::from_config(&config.converter)),
        events: Some(events),
    };
    let pool = WorkerPool::start(ctx, WorkerPoolConfig::from_config(&config.workers));

    let sweeper = Arc::new(CleanupSweeper::new(
        store,
        Arc::clone(&queue),
        artifacts,
        SweepPolicy::from_config(&config),
    ))
    .start();

    let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })?;

    tracing::info!("meshconvd running, press Ctrl-C to stop");
    let _ = stop_rx.recv();

    tracing::info!("Shutdown requested");
    pool.shutdown();
    pool.wait();
    sweeper.stop();
    // The workers held the last broadcasters, so the logger has drained.
    if let Ok(handle) = event_logger {
        match handle.join() {
            Ok(logged) => tracing::debug!(logged, "Job event logger stopped"),
            Err(_) => tracing::error!("Job event logger panicked"),
        }
    }
    Ok(())
}
