#[derive(thiserror::Error, Debug)]
pub(crate) enum ServerError {
    // The Display strings below travel over the wire as negative reply
    // texts, so they must stay stable.
    #[error("expecting config request")]
    ExpectingConfigRequest,
    #[error("invalid config")]
    InvalidConfig,
    #[error("access to '{0}' denied")]
    AccessDenied(String),
    #[error("reverse port forwarding not enabled on server")]
    ReverseForwardingDisabled,
    #[error("server cannot listen on {0}")]
    CannotListen(String),
    #[error("invalid remote '{0}'")]
    InvalidRemote(String),
    #[error("invalid credentials spec, expected user:pass")]
    InvalidCredentials,
}
