//! Audio pipelines: microphone capture, gapless playback, the output level
//! meter and the PulseAudio devices behind them.

pub mod capture;
pub mod meter;
pub mod playback;
pub mod pulse;

pub use capture::{CapturePipeline, MicrophoneSource, MicrophoneStream};
pub use meter::LevelMeter;
pub use playback::{AudioClock, AudioOutput, AudioSink, PlaybackPipeline, PlaybackScheduler, ScheduledSource, SystemClock};
pub use pulse::{PulseMicrophone, PulseSpeaker};
