//! Core building blocks of the voice bridge session protocol: the control
//! message model, outbound audio framing, the no-input watchdog and DTMF
//! capture. Nothing in this crate performs network I/O.

pub mod audio_buffer;
pub mod dtmf;
pub mod error;
pub mod protocol;
pub mod settings;
pub mod timer;

pub use audio_buffer::AudioChunkBuffer;
pub use dtmf::{DtmfCapture, DtmfPolicy, DtmfState};
pub use error::{AudioBufferError, DtmfCaptureError, ProtocolError};
pub use settings::SessionSettings;
pub use timer::{NoInputTimer, TimerCallback, TimerState};
