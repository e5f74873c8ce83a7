use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Device is missing mandatory capabilities, or could not report them
    #[error("Capability error [{device}]: {reason}")]
    Capability { device: String, reason: String },

    /// No candidate format/resolution was accepted by the device
    #[error("Format error [{device}]: {reason}")]
    Format { device: String, reason: String },

    /// One media type's source could not be built
    #[error("Failed to create {media} source: {reason}")]
    SourceCreation { media: String, reason: String },

    /// The delivery server could not be created or nothing was registered
    #[error("Session registration failed: {0}")]
    SessionRegistration(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("Config serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("Video error: {0}")]
    VideoError(String),

    #[error("Video device lost [{device}]: {reason}")]
    VideoDeviceLost { device: String, reason: String },

    #[error("Audio error: {0}")]
    AudioError(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl AppError {
    /// Whether the error only removes one device/media type from the run
    pub fn is_per_device(&self) -> bool {
        matches!(
            self,
            AppError::Capability { .. } | AppError::Format { .. } | AppError::SourceCreation { .. }
        )
    }
}

/// Result type alias used across the crate
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_device_errors_are_classified() {
        let cap = AppError::Capability {
            device: "/dev/video0".into(),
            reason: "missing STREAMING".into(),
        };
        assert!(cap.is_per_device());
        assert!(cap.to_string().contains("/dev/video0"));

        let fatal = AppError::SessionRegistration("no legs".into());
        assert!(!fatal.is_per_device());
    }
}
