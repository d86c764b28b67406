//! Digital predistortion of the baseband stream.
//!
//! The predistorter inverts the memoryless non-linearity of the downstream
//! power amplifier, either with an odd-order AM/AM + AM/PM polynomial or
//! with a magnitude-indexed lookup table. Coefficients come from a text
//! file produced by the external DPD estimator and can be swapped at
//! runtime; until a file has been loaded successfully the stage is a plain
//! pass-through.
//!
//! Frames are processed on a dedicated pipeline thread which fans each
//! frame out to a pool of worker threads in contiguous segments and
//! finishes the remainder itself. Handing a frame over therefore returns
//! the output of the frame submitted two calls earlier: the stage has a
//! fixed two-frame pipeline delay, and the first two submissions yield no
//! output at all.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{info, warn};

use crate::config::PredistorterConfig;
use crate::remote::{ParameterError, ParameterInfo, RemoteControllable};
use crate::types::{FrameEnvelope, IQSample};

/// Number of AM/AM coefficients; the AM/PM set has the same size.
pub const NUM_POLY_COEFS: usize = 5;

/// Number of lookup-table bins.
pub const LUT_ENTRIES: usize = 32;

/// Fixed pipeline delay of the stage, in frames.
pub const PIPELINE_DELAY_FRAMES: u64 = 2;

/// Errors raised while loading a coefficient file.
#[derive(Debug, thiserror::Error)]
pub enum CoefFileError {
    #[error("could not read coefficient file: {0}")]
    Io(#[from] std::io::Error),

    #[error("coefficient file has unknown format indicator {0}")]
    UnknownFormat(u32),

    #[error("invalid number of coefficients: {got}, expected {expected}")]
    WrongCoefCount { got: i64, expected: usize },

    #[error("coefficient file ended after {found} of {expected} values")]
    Truncated { expected: usize, found: usize },

    #[error("coefficient file contains an invalid number: '{0}'")]
    BadNumber(String),
}

/// Active predistortion model.
#[derive(Debug, Clone, PartialEq)]
pub enum DpdSettings {
    /// AM/AM and AM/PM polynomials over |x|² for odd orders 1, 3, 5, 7, 9.
    OddPoly {
        am: [f32; NUM_POLY_COEFS],
        pm: [f32; NUM_POLY_COEFS],
    },
    /// Complex correction factors indexed by the top five bits of the
    /// scaled input magnitude.
    Lut {
        scalefactor: f32,
        table: [IQSample; LUT_ENTRIES],
    },
}

impl DpdSettings {
    /// Number of coefficients carried by this model.
    pub fn num_coefficients(&self) -> usize {
        match self {
            DpdSettings::OddPoly { am, .. } => am.len(),
            DpdSettings::Lut { table, .. } => table.len(),
        }
    }
}

fn apply_settings(settings: &DpdSettings, input: &[IQSample], out: &mut [IQSample]) {
    match settings {
        DpdSettings::OddPoly { am, pm } => apply_poly(am, pm, input, out),
        DpdSettings::Lut { scalefactor, table } => apply_lut(*scalefactor, table, input, out),
    }
}

fn apply_poly(
    am: &[f32; NUM_POLY_COEFS],
    pm: &[f32; NUM_POLY_COEFS],
    input: &[IQSample],
    out: &mut [IQSample],
) {
    for (o, &x) in out.iter_mut().zip(input.iter()) {
        let mag_sq = x.re * x.re + x.im * x.im;

        let amplitude =
            am[0] + mag_sq * (am[1] + mag_sq * (am[2] + mag_sq * (am[3] + mag_sq * am[4])));

        let phase =
            -(pm[0] + mag_sq * (pm[1] + mag_sq * (pm[2] + mag_sq * (pm[3] + mag_sq * pm[4]))));

        let phase_sq = phase * phase;

        // Low-order approximations around 0, within 0.1% over the working
        // phase range.
        let cos_phase = 1.0 - phase_sq * (0.5 - phase_sq * (0.486666 - phase_sq * 0.00138888));
        let sin_phase = phase * (1.0 + phase_sq * (0.166666 + phase_sq * 0.00833333));

        *o = x * amplitude * IQSample::new(cos_phase, sin_phase);
    }
}

fn apply_lut(
    scalefactor: f32,
    table: &[IQSample; LUT_ENTRIES],
    input: &[IQSample],
    out: &mut [IQSample],
) {
    for (o, &x) in out.iter_mut().zip(input.iter()) {
        let mag = x.norm();

        // The scalefactor maps the magnitude onto the u32 range; the top
        // five bits of the scaled value select one of the 32 bins.
        let scaled = (mag * scalefactor).round() as u32;
        let index = (scaled >> 27) as usize;

        *o = x * table[index];
    }
}

struct TokenReader<'a> {
    tokens: std::str::SplitWhitespace<'a>,
    expected: usize,
    read: usize,
}

impl<'a> TokenReader<'a> {
    fn new(text: &'a str, expected: usize) -> Self {
        Self {
            tokens: text.split_whitespace(),
            expected,
            read: 0,
        }
    }

    fn next_token(&mut self) -> Result<&'a str, CoefFileError> {
        match self.tokens.next() {
            Some(t) => {
                self.read += 1;
                Ok(t)
            }
            None => Err(CoefFileError::Truncated {
                expected: self.expected,
                found: self.read,
            }),
        }
    }

    fn next_f32(&mut self) -> Result<f32, CoefFileError> {
        let token = self.next_token()?;
        token
            .parse()
            .map_err(|_| CoefFileError::BadNumber(token.to_string()))
    }

    fn next_i64(&mut self) -> Result<i64, CoefFileError> {
        let token = self.next_token()?;
        token
            .parse()
            .map_err(|_| CoefFileError::BadNumber(token.to_string()))
    }
}

/// Parse the text form of a coefficient file.
///
/// The first token is the format indicator: `1` for the odd-order
/// polynomial (coefficient count, then 5 AM and 5 PM values), `2` for the
/// lookup table (scalefactor, then 32 real correction factors).
pub fn parse_coefficients(text: &str) -> Result<DpdSettings, CoefFileError> {
    let mut reader = TokenReader::new(text, 2);
    let format = reader.next_i64()?;
    match format {
        1 => {
            reader.expected = 2 + 2 * NUM_POLY_COEFS;
            let n_coefs = reader.next_i64()?;
            if n_coefs != NUM_POLY_COEFS as i64 {
                return Err(CoefFileError::WrongCoefCount {
                    got: n_coefs,
                    expected: NUM_POLY_COEFS,
                });
            }
            let mut am = [0.0_f32; NUM_POLY_COEFS];
            let mut pm = [0.0_f32; NUM_POLY_COEFS];
            for c in am.iter_mut() {
                *c = reader.next_f32()?;
            }
            for c in pm.iter_mut() {
                *c = reader.next_f32()?;
            }
            Ok(DpdSettings::OddPoly { am, pm })
        }
        2 => {
            reader.expected = 2 + LUT_ENTRIES;
            let scalefactor = reader.next_f32()?;
            let mut table = [IQSample::new(1.0, 0.0); LUT_ENTRIES];
            for entry in table.iter_mut() {
                *entry = IQSample::new(reader.next_f32()?, 0.0);
            }
            Ok(DpdSettings::Lut { scalefactor, table })
        }
        other => Err(CoefFileError::UnknownFormat(other.max(0) as u32)),
    }
}

struct SegmentJob {
    settings: Arc<DpdSettings>,
    input: Vec<IQSample>,
    index: usize,
    done: mpsc::Sender<(usize, Vec<IQSample>)>,
}

struct Worker {
    job_tx: mpsc::Sender<SegmentJob>,
    handle: JoinHandle<()>,
}

/// Pool of persistent worker threads processing frame segments.
struct WorkerPool {
    workers: Vec<Worker>,
}

impl WorkerPool {
    fn new(num_workers: usize) -> Self {
        let mut workers = Vec::with_capacity(num_workers);
        for i in 0..num_workers {
            let (job_tx, job_rx) = mpsc::channel::<SegmentJob>();
            let spawned = thread::Builder::new()
                .name(format!("dpd-worker-{}", i))
                .spawn(move || {
                    while let Ok(job) = job_rx.recv() {
                        let mut out = vec![IQSample::new(0.0, 0.0); job.input.len()];
                        apply_settings(&job.settings, &job.input, &mut out);
                        // The pool may be torn down while jobs are in flight.
                        let _ = job.done.send((job.index, out));
                    }
                });
            match spawned {
                Ok(handle) => workers.push(Worker { job_tx, handle }),
                Err(e) => warn!(error = %e, "could not spawn predistorter worker"),
            }
        }
        Self { workers }
    }

    /// Apply `settings` to `input`, fanned out over the pool.
    ///
    /// Each worker gets one contiguous segment; the remainder after the last
    /// full segment is processed on the calling thread while the workers
    /// run, then the completed segments are collected in order.
    fn apply(&self, settings: &Arc<DpdSettings>, input: &[IQSample]) -> Vec<IQSample> {
        let n = input.len();
        let mut out = vec![IQSample::new(0.0, 0.0); n];
        let num_workers = self.workers.len();

        if num_workers == 0 || n < num_workers {
            apply_settings(settings, input, &mut out);
            return out;
        }

        let step = n / num_workers;
        let (done_tx, done_rx) = mpsc::channel();
        let mut dispatched = 0;
        let mut start = 0;
        for (index, worker) in self.workers.iter().enumerate() {
            let stop = start + step;
            let job = SegmentJob {
                settings: Arc::clone(settings),
                input: input[start..stop].to_vec(),
                index,
                done: done_tx.clone(),
            };
            if worker.job_tx.send(job).is_ok() {
                dispatched += 1;
            } else {
                apply_settings(settings, &input[start..stop], &mut out[start..stop]);
            }
            start = stop;
        }
        drop(done_tx);

        // Tail segment on the dispatching thread.
        apply_settings(settings, &input[start..], &mut out[start..]);

        for _ in 0..dispatched {
            if let Ok((index, segment)) = done_rx.recv() {
                let offset = index * step;
                out[offset..offset + segment.len()].copy_from_slice(&segment);
            }
        }
        out
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for worker in self.workers.drain(..) {
            drop(worker.job_tx);
            let _ = worker.handle.join();
        }
    }
}

fn pipeline_thread(
    in_rx: mpsc::Receiver<FrameEnvelope>,
    out_tx: mpsc::Sender<FrameEnvelope>,
    settings: Arc<Mutex<Option<Arc<DpdSettings>>>>,
    num_workers: usize,
) {
    let pool = WorkerPool::new(num_workers);
    while let Ok(mut envelope) = in_rx.recv() {
        // One snapshot per frame: a concurrent reload affects the next
        // frame, never part of this one.
        let snapshot = settings.lock().unwrap().clone();
        if let Some(active) = snapshot {
            envelope.samples = pool.apply(&active, &envelope.samples);
        }
        if out_tx.send(envelope).is_err() {
            break;
        }
    }
}

struct PipelineState {
    in_tx: Option<mpsc::Sender<FrameEnvelope>>,
    out_rx: mpsc::Receiver<FrameEnvelope>,
    submitted: u64,
    emitted: u64,
}

const PARAMETERS: &[ParameterInfo] = &[
    ParameterInfo {
        name: "ncoefs",
        description: "(Read-only) number of active coefficients",
    },
    ParameterInfo {
        name: "coeffile",
        description: "Coefficient file name; setting it loads the file",
    },
];

/// The pipelined predistortion stage.
pub struct Predistorter {
    settings: Arc<Mutex<Option<Arc<DpdSettings>>>>,
    coef_file: Mutex<Option<PathBuf>>,
    pipeline: Mutex<PipelineState>,
    pipeline_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Predistorter {
    /// Create the stage with its worker pool and pipeline thread.
    pub fn new(config: &PredistorterConfig) -> Result<Self, CoefFileError> {
        let num_workers = if config.num_workers == 0 {
            let n = thread::available_parallelism().map(NonZeroUsize::get).unwrap_or(1);
            info!(workers = n, "predistorter using auto-detected worker count");
            n
        } else {
            info!(workers = config.num_workers, "predistorter using configured worker count");
            config.num_workers
        };

        let settings: Arc<Mutex<Option<Arc<DpdSettings>>>> = Arc::new(Mutex::new(None));
        let (in_tx, in_rx) = mpsc::channel();
        let (out_tx, out_rx) = mpsc::channel();
        let thread_settings = Arc::clone(&settings);
        let handle = thread::Builder::new()
            .name("dpd-pipeline".to_string())
            .spawn(move || pipeline_thread(in_rx, out_tx, thread_settings, num_workers))?;

        let predistorter = Self {
            settings,
            coef_file: Mutex::new(None),
            pipeline: Mutex::new(PipelineState {
                in_tx: Some(in_tx),
                out_rx,
                submitted: 0,
                emitted: 0,
            }),
            pipeline_thread: Mutex::new(Some(handle)),
        };

        if let Some(path) = &config.coef_file {
            predistorter.load_coefficients(path)?;
        }
        Ok(predistorter)
    }

    /// Submit one frame and collect the output of the frame submitted two
    /// calls earlier.
    ///
    /// The first two calls return `None`: that is the stage's entire
    /// pre-roll. Afterwards call N returns frame N−2, carrying its own
    /// timestamp, so downstream bookkeeping needs no correction.
    pub fn process(&self, envelope: FrameEnvelope) -> Option<FrameEnvelope> {
        let mut pipe = self.pipeline.lock().unwrap();
        pipe.in_tx.as_ref()?.send(envelope).ok()?;
        pipe.submitted += 1;
        if pipe.submitted <= PIPELINE_DELAY_FRAMES {
            return None;
        }
        let frame = pipe.out_rx.recv().ok()?;
        pipe.emitted += 1;
        Some(frame)
    }

    /// Collect the frames still in flight after the last submission.
    pub fn drain(&self) -> Vec<FrameEnvelope> {
        let mut pipe = self.pipeline.lock().unwrap();
        let mut frames = Vec::new();
        while pipe.emitted < pipe.submitted {
            match pipe.out_rx.recv_timeout(std::time::Duration::from_secs(1)) {
                Ok(frame) => {
                    pipe.emitted += 1;
                    frames.push(frame);
                }
                Err(_) => break,
            }
        }
        frames
    }

    /// Load a coefficient file and swap it in for the next frame.
    ///
    /// On failure the previously active coefficients stay in place.
    pub fn load_coefficients(&self, path: &Path) -> Result<(), CoefFileError> {
        let text = std::fs::read_to_string(path)?;
        let parsed = parse_coefficients(&text)?;
        match &parsed {
            DpdSettings::OddPoly { am, pm } => {
                info!(coefs = am.len() + pm.len(), "loaded polynomial predistortion coefficients")
            }
            DpdSettings::Lut { table, .. } => {
                info!(entries = table.len(), "loaded predistortion lookup table")
            }
        }
        *self.settings.lock().unwrap() = Some(Arc::new(parsed));
        *self.coef_file.lock().unwrap() = Some(path.to_path_buf());
        Ok(())
    }

    /// Install settings directly, bypassing the file format.
    pub fn set_settings(&self, settings: DpdSettings) {
        *self.settings.lock().unwrap() = Some(Arc::new(settings));
    }

    /// Number of coefficients of the active model, 0 in pass-through.
    pub fn num_coefficients(&self) -> usize {
        self.settings
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.num_coefficients())
            .unwrap_or(0)
    }
}

impl Drop for Predistorter {
    fn drop(&mut self) {
        // Closing the input channel stops the pipeline thread, which tears
        // down the worker pool.
        self.pipeline.lock().unwrap().in_tx.take();
        if let Some(handle) = self.pipeline_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl RemoteControllable for Predistorter {
    fn rc_name(&self) -> &'static str {
        "predistorter"
    }

    fn parameters(&self) -> &'static [ParameterInfo] {
        PARAMETERS
    }

    fn set_parameter(&self, parameter: &str, value: &str) -> Result<(), ParameterError> {
        match parameter {
            "ncoefs" => Err(ParameterError::ReadOnly(parameter.to_string())),
            "coeffile" => self
                .load_coefficients(Path::new(value))
                .map_err(|e| ParameterError::invalid(parameter, e)),
            other => Err(ParameterError::Unknown(other.to_string())),
        }
    }

    fn get_parameter(&self, parameter: &str) -> Result<String, ParameterError> {
        match parameter {
            "ncoefs" => Ok(self.num_coefficients().to_string()),
            "coeffile" => Ok(self
                .coef_file
                .lock()
                .unwrap()
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default()),
            other => Err(ParameterError::Unknown(other.to_string())),
        }
    }
}
