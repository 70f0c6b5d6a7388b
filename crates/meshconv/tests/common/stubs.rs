//! Converter doubles.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use serde_json::json;

use meshconv::converter::{ConversionRequest, Converter};
use meshconv::error::ConversionError;
use meshconv::job::ConversionReport;

fn write_output(request: &ConversionRequest) -> Result<(), ConversionError> {
    std::fs::write(&request.output, b"ISO-10303-21;\nEND-ISO-10303-21;\n")?;
    Ok(())
}

fn report() -> ConversionReport {
    ConversionReport(json!({ "success": true, "facets": 100, "is_solid": true }))
}

/// Always succeeds with `{facets: 100}`.
pub struct Succeeding;

impl Converter for Succeeding {
    fn convert(&self, request: &ConversionRequest) -> Result<ConversionReport, ConversionError> {
        write_output(request)?;
        Ok(report())
    }
}

/// Always fails with "bad mesh" and counts its calls.
#[derive(Default)]
pub struct Failing {
    pub calls: AtomicU32,
}

impl Converter for Failing {
    fn convert(&self, _request: &ConversionRequest) -> Result<ConversionReport, ConversionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ConversionError::Failed("bad mesh".to_string()))
    }
}

/// Tracks how many conversions overlap.
#[derive(Default)]
pub struct ConcurrencyGauge {
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyGauge {
    fn enter(&self) {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Succeeds after holding the slot for a fixed time.
pub struct Slow {
    pub hold: Duration,
    pub gauge: ConcurrencyGauge,
    pub calls: AtomicU32,
}

impl Slow {
    pub fn new(hold: Duration) -> Self {
        Self {
            hold,
            gauge: ConcurrencyGauge::default(),
            calls: AtomicU32::new(0),
        }
    }
}

impl Converter for Slow {
    fn convert(&self, request: &ConversionRequest) -> Result<ConversionReport, ConversionError> {
        self.gauge.enter();
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.hold);
        self.gauge.exit();
        write_output(request)?;
        Ok(report())
    }
}

/// Blocks every conversion until the test sends a release token.
pub struct Gated {
    started_tx: Sender<String>,
    release_rx: Receiver<()>,
    pub gauge: ConcurrencyGauge,
}

/// Test-side ends of a [`Gated`] converter.
pub struct GateControl {
    pub started: Receiver<String>,
    release: Sender<()>,
}

impl GateControl {
    /// Lets one blocked conversion finish.
    pub fn release_one(&self) {
        self.release.send(()).expect("Gated converter dropped");
    }

    pub fn expect_started(&self, timeout: Duration) -> String {
        self.started
            .recv_timeout(timeout)
            .expect("No conversion started in time")
    }
}

pub fn gated() -> (Arc<Gated>, GateControl) {
    let (started_tx, started) = unbounded();
    let (release, release_rx) = unbounded();
    (
        Arc::new(Gated {
            started_tx,
            release_rx,
            gauge: ConcurrencyGauge::default(),
        }),
        GateControl { started, release },
    )
}

impl Converter for Gated {
    fn convert(&self, request: &ConversionRequest) -> Result<ConversionReport, ConversionError> {
        self.gauge.enter();
        let _ = self.started_tx.send(request.job_id.clone());
        let released = self.release_rx.recv();
        self.gauge.exit();
        released.map_err(|_| ConversionError::Failed("gate closed".to_string()))?;
        write_output(request)?;
        Ok(report())
    }
}
