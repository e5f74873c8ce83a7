//! Audio capture through ALSA

pub mod capture;
pub mod device;
pub mod format;

pub use capture::{AlsaCapture, AudioParameters};
pub use device::{find_alsa_device, split_device};
pub use format::{parse_sample_formats, SampleFormat};
