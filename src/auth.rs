//! Authentication as seen by the sync layer: a yes/no signal.

/// Whether remote calls on behalf of the user can be made.
pub trait AuthState: Send + Sync {
  fn is_authenticated(&self) -> bool;
}

/// Access token read once at start-up.
#[derive(Clone, Default)]
pub struct TokenAuth {
  token: Option<String>,
}

impl TokenAuth {
  pub fn new(token: Option<String>) -> Self {
    Self {
      token: token.filter(|t| !t.trim().is_empty()),
    }
  }

  /// Read the token from `SHOWSYNC_TOKEN`, falling back to `TRAKT_ACCESS_TOKEN`.
  pub fn from_env() -> Self {
    let token = std::env::var("SHOWSYNC_TOKEN")
      .ok()
      .or_else(|| std::env::var("TRAKT_ACCESS_TOKEN").ok());
    Self::new(token)
  }

  pub fn token(&self) -> Option<&str> {
    self.token.as_deref()
  }
}

impl AuthState for TokenAuth {
  fn is_authenticated(&self) -> bool {
    self.token.is_some()
  }
}

impl std::fmt::Debug for TokenAuth {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("TokenAuth")
      .field("token", &self.token.as_ref().map(|_| "<redacted>"))
      .finish()
  }
}
