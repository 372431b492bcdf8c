//! Gapless playback of model audio
//!
//! [`PlaybackScheduler`] owns the playback cursor and the active source set.
//! Each chunk starts at `max(cursor, now)` and pushes the cursor to its end, so
//! chunks play back to back however jittery their arrival. An interruption
//! stops every active source and resets the cursor.
//!
//! [`PlaybackPipeline`] pairs a scheduler with an output thread that writes
//! sources to an [`AudioSink`] in schedule order, feeding the level meter on
//! the way.

use super::meter::LevelMeter;
use crate::codec;
use crate::error::{LiveError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Samples written to the device per step; the stop flag is checked between steps.
const OUTPUT_BLOCK: usize = 480;

/// Monotonic clock the schedule is expressed in, in seconds.
pub trait AudioClock: Send + Sync + 'static {
    fn now(&self) -> f64;
}

/// Wall clock starting at zero when created.
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioClock for SystemClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

pub type SourceId = u64;

/// One scheduled chunk of decoded audio.
#[derive(Debug, Clone)]
pub struct ScheduledSource {
    pub id: SourceId,
    /// Start time on the [`AudioClock`]
    pub start: f64,
    pub duration: f64,
    pub samples: Arc<[f32]>,
    stopped: Arc<AtomicBool>,
}

impl ScheduledSource {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct SchedulerState {
    cursor: f64,
    next_id: SourceId,
    active: HashMap<SourceId, ScheduledSource>,
}

/// Playback cursor plus the set of scheduled and playing sources.
pub struct PlaybackScheduler {
    clock: Arc<dyn AudioClock>,
    sample_rate: u32,
    state: Mutex<SchedulerState>,
}

impl PlaybackScheduler {
    pub fn new(clock: Arc<dyn AudioClock>, sample_rate: u32) -> Self {
        Self {
            clock,
            sample_rate,
            state: Mutex::new(SchedulerState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, SchedulerState> {
        // Every critical section leaves the state consistent, so a poisoned
        // lock is still usable.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Schedule decoded samples right after everything already scheduled.
    pub fn schedule(&self, samples: Vec<f32>) -> ScheduledSource {
        let duration = codec::duration_secs(samples.len(), self.sample_rate);
        let now = self.clock.now();

        let mut state = self.state();
        let start = state.cursor.max(now);
        state.cursor = start + duration;
        let id = state.next_id;
        state.next_id += 1;

        let source = ScheduledSource {
            id,
            start,
            duration,
            samples: samples.into(),
            stopped: Arc::new(AtomicBool::new(false)),
        };
        state.active.insert(id, source.clone());
        debug!(
            "Scheduled source {} at {:.3}s for {:.3}s ({} active)",
            id,
            start,
            duration,
            state.active.len()
        );
        source
    }

    /// Decode a PCM16 payload and schedule it.
    pub fn schedule_pcm(&self, pcm: &[u8]) -> Result<ScheduledSource> {
        if pcm.len() % 2 != 0 {
            return Err(LiveError::Decode(format!("odd PCM16 payload length {}", pcm.len())));
        }
        Ok(self.schedule(codec::pcm16_to_f32(pcm)))
    }

    /// A source finished naturally. Returns false if it was already removed.
    pub fn finished(&self, id: SourceId) -> bool {
        self.state().active.remove(&id).is_some()
    }

    /// Stop and forget every active source and reset the cursor. Sources
    /// scheduled after this returns are unaffected. Returns how many were stopped.
    pub fn interrupt(&self) -> usize {
        let snapshot = {
            let mut state = self.state();
            state.cursor = 0.0;
            std::mem::take(&mut state.active)
        };
        for source in snapshot.values() {
            source.stop();
        }
        if !snapshot.is_empty() {
            info!("Playback interrupted, stopped {} source(s)", snapshot.len());
        }
        snapshot.len()
    }

    pub fn cursor(&self) -> f64 {
        self.state().cursor
    }

    pub fn active_count(&self) -> usize {
        self.state().active.len()
    }

    pub fn is_active(&self, id: SourceId) -> bool {
        self.state().active.contains_key(&id)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// An opened output device accepting mono `f32` samples.
pub trait AudioSink {
    /// Write samples, blocking while the device buffer is full.
    fn write(&mut self, samples: &[f32]) -> anyhow::Result<()>;

    /// Drop whatever the device has buffered but not yet played.
    fn discard(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Factory for output devices. `open` runs on the output thread.
pub trait AudioOutput: Send + Sync + 'static {
    fn open(&self, sample_rate: u32) -> anyhow::Result<Box<dyn AudioSink>>;
}

enum OutputCommand {
    Play(ScheduledSource),
    Discard,
    Shutdown,
}

/// Scheduler plus the output thread draining it.
pub struct PlaybackPipeline {
    scheduler: Arc<PlaybackScheduler>,
    meter: Arc<LevelMeter>,
    output: Mutex<Option<std_mpsc::Sender<OutputCommand>>>,
}

impl PlaybackPipeline {
    /// Open the output device and start the output thread.
    ///
    /// Blocks until the device is open; failure yields [`LiveError::MediaDevice`].
    pub fn start(output: Arc<dyn AudioOutput>, clock: Arc<dyn AudioClock>) -> Result<Self> {
        let sample_rate = codec::OUTPUT_SAMPLE_RATE;
        let scheduler = Arc::new(PlaybackScheduler::new(clock, sample_rate));
        let meter = Arc::new(LevelMeter::new(sample_rate));
        let (tx, rx) = std_mpsc::channel();
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<std::result::Result<(), String>>(1);

        let thread_scheduler = scheduler.clone();
        let thread_meter = meter.clone();
        std::thread::Builder::new()
            .name("audio-output".to_string())
            .spawn(move || {
                let sink = match output.open(sample_rate) {
                    Ok(sink) => {
                        let _ = ready_tx.send(Ok(()));
                        sink
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(format!("{:#}", e)));
                        return;
                    }
                };
                output_loop(sink, rx, &thread_scheduler, &thread_meter);
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                info!("Audio output started at {}Hz", sample_rate);
                Ok(Self {
                    scheduler,
                    meter,
                    output: Mutex::new(Some(tx)),
                })
            }
            Ok(Err(message)) => Err(LiveError::MediaDevice(message)),
            Err(_) => Err(LiveError::MediaDevice("output thread exited during startup".to_string())),
        }
    }

    pub fn scheduler(&self) -> &Arc<PlaybackScheduler> {
        &self.scheduler
    }

    pub fn meter(&self) -> &Arc<LevelMeter> {
        &self.meter
    }

    fn send(&self, command: OutputCommand) -> bool {
        let output = self.output.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match output.as_ref() {
            Some(tx) => tx.send(command).is_ok(),
            None => false,
        }
    }

    /// Decode and schedule an inbound audio payload. Dropped if the pipeline is stopped.
    pub fn enqueue(&self, pcm: &[u8]) -> Result<Option<ScheduledSource>> {
        if !self.is_running() {
            debug!("Playback stopped, ignoring {} byte audio chunk", pcm.len());
            return Ok(None);
        }
        let source = self.scheduler.schedule_pcm(pcm)?;
        if !self.send(OutputCommand::Play(source.clone())) {
            warn!("Audio output thread is gone");
            self.scheduler.finished(source.id);
            return Ok(None);
        }
        Ok(Some(source))
    }

    /// Barge-in: stop everything queued or playing.
    pub fn interrupt(&self) -> usize {
        let stopped = self.scheduler.interrupt();
        self.send(OutputCommand::Discard);
        self.meter.reset();
        stopped
    }

    pub fn is_running(&self) -> bool {
        self.output
            .lock()
            .map(|o| o.is_some())
            .unwrap_or(false)
    }

    /// Stop playback and release the device. Safe to call repeatedly.
    pub fn stop(&self) {
        self.scheduler.interrupt();
        self.meter.reset();
        let tx = self
            .output
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(tx) = tx {
            let _ = tx.send(OutputCommand::Discard);
            let _ = tx.send(OutputCommand::Shutdown);
            info!("Audio output stopped");
        }
    }
}

impl Drop for PlaybackPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn output_loop(
    mut sink: Box<dyn AudioSink>,
    commands: std_mpsc::Receiver<OutputCommand>,
    scheduler: &PlaybackScheduler,
    meter: &LevelMeter,
) {
    while let Ok(command) = commands.recv() {
        match command {
            OutputCommand::Play(source) => {
                if let Err(e) = play_source(sink.as_mut(), &source, meter) {
                    error!("Audio output write failed: {:#}", e);
                    scheduler.finished(source.id);
                    break;
                }
                scheduler.finished(source.id);
            }
            OutputCommand::Discard => {
                if let Err(e) = sink.discard() {
                    warn!("Failed to discard buffered audio: {:#}", e);
                }
            }
            OutputCommand::Shutdown => break,
        }
    }
    debug!("Audio output thread exiting");
}

fn play_source(sink: &mut dyn AudioSink, source: &ScheduledSource, meter: &LevelMeter) -> anyhow::Result<()> {
    for block in source.samples.chunks(OUTPUT_BLOCK) {
        if source.is_stopped() {
            debug!("Source {} stopped mid-playback", source.id);
            return Ok(());
        }
        meter.process(block);
        sink.write(block)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Default)]
    struct ManualClock(Mutex<f64>);

    impl ManualClock {
        fn set(&self, t: f64) {
            *self.0.lock().unwrap() = t;
        }
    }

    impl AudioClock for ManualClock {
        fn now(&self) -> f64 {
            *self.0.lock().unwrap()
        }
    }

    fn scheduler() -> (Arc<ManualClock>, PlaybackScheduler) {
        let clock = Arc::new(ManualClock::default());
        let scheduler = PlaybackScheduler::new(clock.clone(), 24_000);
        (clock, scheduler)
    }

    fn ms(millis: usize) -> Vec<f32> {
        vec![0.1; 24 * millis]
    }

    const EPS: f64 = 1e-9;

    #[test]
    fn test_back_to_back_chunks_have_no_gap() {
        let (clock, scheduler) = scheduler();
        clock.set(1.0);

        let sources: Vec<_> = (0..3).map(|_| scheduler.schedule(ms(200))).collect();

        assert!((sources[0].start - 1.0).abs() < EPS);
        for pair in sources.windows(2) {
            assert!((pair[1].start - pair[0].end()).abs() < EPS);
        }
        let span = sources[2].end() - sources[0].start;
        assert!((span - 0.6).abs() < EPS, "span {}", span);
        assert_eq!(scheduler.active_count(), 3);
    }

    #[test]
    fn test_jittery_arrivals_never_overlap() {
        let (clock, scheduler) = scheduler();
        let arrivals = [(0.0, 120), (0.05, 40), (0.5, 300), (0.55, 10), (2.0, 80), (2.0, 80)];

        let mut previous: Option<ScheduledSource> = None;
        for (at, len) in arrivals {
            clock.set(at);
            let source = scheduler.schedule(ms(len));
            assert!(source.start >= at - EPS);
            if let Some(prev) = &previous {
                assert!(source.start >= prev.start);
                assert!(source.start >= prev.end() - EPS, "overlap at {}", at);
            }
            previous = Some(source);
        }
    }

    #[test]
    fn test_interrupt_clears_and_resets_cursor() {
        let (clock, scheduler) = scheduler();
        clock.set(0.0);
        let a = scheduler.schedule(ms(500));
        let b = scheduler.schedule(ms(500));
        assert!((scheduler.cursor() - 1.0).abs() < EPS);

        clock.set(0.2);
        assert_eq!(scheduler.interrupt(), 2);
        assert!(a.is_stopped() && b.is_stopped());
        assert_eq!(scheduler.active_count(), 0);
        assert_eq!(scheduler.cursor(), 0.0);

        let next = scheduler.schedule(ms(100));
        assert!((next.start - 0.2).abs() < EPS);
        assert!(!next.is_stopped());
        assert_eq!(scheduler.interrupt(), 1);
        assert_eq!(scheduler.interrupt(), 0);
    }

    #[test]
    fn test_natural_completion_removes_source() {
        let (_clock, scheduler) = scheduler();
        let source = scheduler.schedule_pcm(&[0, 0, 0, 0]).unwrap();
        assert!(scheduler.is_active(source.id));
        assert!(scheduler.finished(source.id));
        assert!(!scheduler.finished(source.id));
        assert!(matches!(scheduler.schedule_pcm(&[0, 0, 0]), Err(LiveError::Decode(_))));
    }

    struct RecordingOutput {
        written: Arc<Mutex<usize>>,
    }

    struct RecordingSink {
        written: Arc<Mutex<usize>>,
    }

    impl AudioSink for RecordingSink {
        fn write(&mut self, samples: &[f32]) -> anyhow::Result<()> {
            *self.written.lock().unwrap() += samples.len();
            Ok(())
        }
    }

    impl AudioOutput for RecordingOutput {
        fn open(&self, _sample_rate: u32) -> anyhow::Result<Box<dyn AudioSink>> {
            Ok(Box::new(RecordingSink {
                written: self.written.clone(),
            }))
        }
    }

    struct BrokenOutput;

    impl AudioOutput for BrokenOutput {
        fn open(&self, _sample_rate: u32) -> anyhow::Result<Box<dyn AudioSink>> {
            anyhow::bail!("no such device")
        }
    }

    #[test]
    fn test_pipeline_plays_and_releases_sources() {
        let written = Arc::new(Mutex::new(0));
        let output = Arc::new(RecordingOutput {
            written: written.clone(),
        });
        let pipeline = PlaybackPipeline::start(output, Arc::new(SystemClock::new())).unwrap();

        let pcm = codec::f32_to_pcm16(&vec![0.25; 1200]);
        let source = pipeline.enqueue(&pcm).unwrap().unwrap();

        for _ in 0..200 {
            if !pipeline.scheduler().is_active(source.id) {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(!pipeline.scheduler().is_active(source.id));
        assert_eq!(*written.lock().unwrap(), 1200);
        assert!(pipeline.meter().level() > 0.2);

        pipeline.stop();
        pipeline.stop();
        assert!(!pipeline.is_running());
        assert!(pipeline.enqueue(&pcm).unwrap().is_none());
    }

    #[test]
    fn test_pipeline_reports_device_failure() {
        match PlaybackPipeline::start(Arc::new(BrokenOutput), Arc::new(SystemClock::new())) {
            Err(LiveError::MediaDevice(message)) => assert!(message.contains("no such device")),
            Err(other) => panic!("Unexpected error: {:?}", other),
            Ok(_) => panic!("expected a media device error"),
        }
    }
}
