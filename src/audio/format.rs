//! Audio sample formats and their RTP encodings

use std::fmt;

use alsa::pcm::Format;

/// Sample formats accepted in the audio format list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleFormat {
    S16Be,
    S16Le,
    S24Be,
    S24Le,
    S32Be,
    S32Le,
    ALaw,
    MuLaw,
    S8,
    Mpeg,
}

impl SampleFormat {
    pub const ALL: [SampleFormat; 10] = [
        SampleFormat::S16Be,
        SampleFormat::S16Le,
        SampleFormat::S24Be,
        SampleFormat::S24Le,
        SampleFormat::S32Be,
        SampleFormat::S32Le,
        SampleFormat::ALaw,
        SampleFormat::MuLaw,
        SampleFormat::S8,
        SampleFormat::Mpeg,
    ];

    /// Parse an ALSA-style name (`S16_LE`, `MULAW`, ...)
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|f| f.name().eq_ignore_ascii_case(name.trim()))
    }

    pub fn name(&self) -> &'static str {
        match self {
            SampleFormat::S16Be => "S16_BE",
            SampleFormat::S16Le => "S16_LE",
            SampleFormat::S24Be => "S24_BE",
            SampleFormat::S24Le => "S24_LE",
            SampleFormat::S32Be => "S32_BE",
            SampleFormat::S32Le => "S32_LE",
            SampleFormat::ALaw => "ALAW",
            SampleFormat::MuLaw => "MULAW",
            SampleFormat::S8 => "S8",
            SampleFormat::Mpeg => "MPEG",
        }
    }

    pub fn to_alsa(&self) -> Format {
        match self {
            SampleFormat::S16Be => Format::S16BE,
            SampleFormat::S16Le => Format::S16LE,
            SampleFormat::S24Be => Format::S24BE,
            SampleFormat::S24Le => Format::S24LE,
            SampleFormat::S32Be => Format::S32BE,
            SampleFormat::S32Le => Format::S32LE,
            SampleFormat::ALaw => Format::ALaw,
            SampleFormat::MuLaw => Format::MuLaw,
            SampleFormat::S8 => Format::S8,
            SampleFormat::Mpeg => Format::MPEG,
        }
    }

    /// RTP encoding name
    pub fn rtp_encoding(&self) -> &'static str {
        match self {
            SampleFormat::ALaw => "PCMA",
            SampleFormat::MuLaw => "PCMU",
            SampleFormat::S8 => "L8",
            SampleFormat::S24Be | SampleFormat::S24Le => "L24",
            SampleFormat::S32Be | SampleFormat::S32Le => "L32",
            SampleFormat::Mpeg => "MPEG",
            SampleFormat::S16Be | SampleFormat::S16Le => "L16",
        }
    }

    /// `audio/<encoding>/<rate>/<channels>`
    pub fn rtp_mime(&self, sample_rate: u32, channels: u32) -> String {
        format!("audio/{}/{}/{}", self.rtp_encoding(), sample_rate, channels)
    }

    /// Bytes per sample as laid out in the capture buffer (1 for MPEG)
    pub fn physical_width(&self) -> usize {
        match self {
            SampleFormat::S16Be | SampleFormat::S16Le => 2,
            // 24-bit samples sit in 32-bit containers
            SampleFormat::S24Be | SampleFormat::S24Le => 4,
            SampleFormat::S32Be | SampleFormat::S32Le => 4,
            SampleFormat::ALaw | SampleFormat::MuLaw | SampleFormat::S8 | SampleFormat::Mpeg => 1,
        }
    }

    /// Sample width to byte-swap before sending, for little-endian linear PCM
    pub fn network_swap_width(&self) -> Option<usize> {
        match self {
            SampleFormat::S16Le => Some(2),
            SampleFormat::S32Le => Some(4),
            _ => None,
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Decode a list of names, skipping unknown ones
pub fn parse_sample_formats<S: AsRef<str>>(names: &[S]) -> Vec<SampleFormat> {
    names
        .iter()
        .filter_map(|name| {
            let parsed = SampleFormat::from_name(name.as_ref());
            if parsed.is_none() {
                tracing::warn!("Unknown audio format {}", name.as_ref());
            }
            parsed
        })
        .collect()
}
