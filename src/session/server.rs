//! The seam between the orchestrator and a delivery protocol

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::leg::Session;
use crate::error::Result;

/// A server that sessions can be registered with, then served
#[async_trait]
pub trait SessionServer: Send + Sync {
    /// Register a session and return its playback URL
    fn add_session(&self, session: Session) -> Result<String>;

    /// Base URL of the HTTP side, if the server has one
    fn http_base_url(&self) -> Option<String> {
        None
    }

    /// Run until `cancel` fires
    async fn serve(&self, cancel: CancellationToken) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::error::AppError;
    use parking_lot::Mutex;

    /// Records every registration
    #[derive(Default)]
    pub struct RecordingServer {
        pub sessions: Mutex<Vec<Session>>,
        pub reject: Vec<String>,
        pub served: Mutex<bool>,
    }

    #[async_trait]
    impl SessionServer for RecordingServer {
        fn add_session(&self, session: Session) -> Result<String> {
            if self.reject.contains(&session.name) {
                return Err(AppError::SessionRegistration(format!(
                    "{} rejected",
                    session.name
                )));
            }
            let url = format!("rtsp://test/{}", session.name);
            self.sessions.lock().push(session);
            Ok(url)
        }

        fn http_base_url(&self) -> Option<String> {
            Some("http://test:8080".to_string())
        }

        async fn serve(&self, cancel: CancellationToken) -> Result<()> {
            *self.served.lock() = true;
            cancel.cancelled().await;
            Ok(())
        }
    }
}
