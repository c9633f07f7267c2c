use spyglass_api::ApiError;

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("stream_invalid_url:{0}")]
    InvalidUrl(String),
    #[error("stream_connect_failed:{0}")]
    Connect(String),
    #[error("stream_backend_failed:{0}")]
    Backend(#[from] ApiError),
    #[error("stream_not_authenticated")]
    NotAuthenticated,
    #[error("run_paused")]
    RunSuspended,
    #[error("run_finished")]
    RunFinished,
    #[error("no_pending_input")]
    NoPendingInput,
}
