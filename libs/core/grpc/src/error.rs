use thiserror::Error;

pub type ServerResult<T> = Result<T, ServerError>;

/// Errors raised while building or starting a gRPC server.
///
/// Per-call failures never show up here: handler errors and panics are turned
/// into gRPC statuses by the call chain.
#[derive(Error, Debug)]
pub enum ServerError {
  /// TLS certificate or key could not be loaded
  #[error("could not resolve TLS credentials (cert: {cert_path}, key: {key_path}): {reason}")]
  Credential {
    cert_path: String,
    key_path: String,
    reason: String,
  },

  /// A configuration option failed while being applied
  #[error("option `{option}` failed: {source}")]
  OptionApplication {
    option: String,
    #[source]
    source: Box<ServerError>,
  },

  /// The server is not in a state where it can serve
  #[error("invalid server configuration: {0}")]
  Configuration(String),

  /// The TCP listener could not be opened
  #[error("unable to listen on {addr}: {source}")]
  Bind {
    addr: String,
    #[source]
    source: std::io::Error,
  },

  /// tonic rejected an option or the serve loop failed
  #[error("transport error: {0}")]
  Transport(#[from] tonic::transport::Error),

  /// The accept loop ended without a shutdown request
  #[error("listener closed")]
  ListenerClosed,
}

impl ServerError {
  /// Wrap this error with the name of the option that produced it.
  pub(crate) fn in_option(self, option: impl Into<String>) -> Self {
    ServerError::OptionApplication {
      option: option.into(),
      source: Box::new(self),
    }
  }

  /// Walk through `OptionApplication` wrappers to the error that started it.
  pub fn root(&self) -> &ServerError {
    match self {
      ServerError::OptionApplication { source, .. } => source.root(),
      other => other,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_option_error_names_the_option() {
    let err = ServerError::Configuration("boom".to_string()).in_option("tls");
    let msg = err.to_string();
    assert!(msg.contains("`tls`"));
    assert!(msg.contains("boom"));
  }

  #[test]
  fn test_root_unwraps_nested_options() {
    let err = ServerError::ListenerClosed.in_option("inner").in_option("outer");
    assert!(matches!(err.root(), ServerError::ListenerClosed));
  }

  #[test]
  fn test_bind_error_contains_address() {
    let err = ServerError::Bind {
      addr: "127.0.0.1:1".to_string(),
      source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"),
    };
    assert!(err.to_string().contains("127.0.0.1:1"));
  }
}
