use converge_remote::{ControlPlane, HttpBackend, MockBackend, RemoteConfig};
use std::path::PathBuf;

pub const BACKEND_ENV: &str = "CONVERGE_BACKEND";
pub const MOCK_FIXTURE_ENV: &str = "CONVERGE_MOCK_FIXTURE";

/// The control plane a reconcile talks to.
pub enum Backend {
    Http(HttpBackend),
    /// Offline control plane whose state lives in a JSON fixture. The fixture
    /// is loaded before and written back after every invocation.
    Mock { fixture: PathBuf },
}

impl Backend {
    /// `CONVERGE_BACKEND=mock` selects the fixture-backed mock; otherwise the
    /// HTTP endpoint from `--endpoint` or the remote config file is used.
    pub fn from_env(endpoint: Option<&str>) -> Result<Self, String> {
        if std::env::var(BACKEND_ENV).as_deref() == Ok("mock") {
            let fixture = std::env::var(MOCK_FIXTURE_ENV)
                .map_err(|_| format!("{BACKEND_ENV}=mock requires {MOCK_FIXTURE_ENV}"))?;
            return Ok(Backend::Mock {
                fixture: PathBuf::from(fixture),
            });
        }
        let config = match endpoint {
            Some(url) => RemoteConfig::new(url),
            None => RemoteConfig::load_default()
                .map_err(|e| format!("no --endpoint and no remote config: {e}"))?,
        };
        Ok(Backend::Http(HttpBackend::new(config)))
    }

    pub fn with_client<T>(&self, f: impl FnOnce(&dyn ControlPlane) -> T) -> Result<T, String> {
        match self {
            Backend::Http(http) => Ok(f(http)),
            Backend::Mock { fixture } => {
                let mock = MockBackend::load(fixture)
                    .map_err(|e| format!("mock fixture {}: {e}", fixture.display()))?;
                let out = f(&mock);
                mock.save(fixture)
                    .map_err(|e| format!("mock fixture {}: {e}", fixture.display()))?;
                Ok(out)
            }
        }
    }
}
