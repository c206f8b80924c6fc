//! Control-plane access for converge.
//!
//! Handlers talk to the managed-database control plane only through the
//! [`ControlPlane`] trait. [`HttpBackend`] speaks JSON over HTTP to a real
//! endpoint; [`MockBackend`] is an in-memory control plane with scripted
//! status transitions and injectable faults, used by tests and by the CLI's
//! offline mode.

pub mod api;
pub mod config;
pub mod http;
pub mod mock;

pub use api::{
    DbInstance, DbParameterGroup, Endpoint, EngineVersion, EngineVersionFilter, ModifyDbInstance,
    Parameter, ParameterGroupStatus, ParameterPage, SecurityGroup,
};
pub use config::RemoteConfig;
pub use http::HttpBackend;
pub use mock::{MockBackend, MockFault, MockFixture};

use converge_core::Fault;
use converge_schema::{
    DbInstanceIdentifier, DbInstanceRole, FaultKind, ParameterGroupName, ResourceArn, Tag,
};
use thiserror::Error;

/// Protocol version sent as `X-Converge-Protocol` header on all HTTP requests.
pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound on parameters per modify/reset call.
pub const MAX_PARAMETERS_PER_REQUEST: usize = 20;

#[derive(Debug, Error)]
pub enum RemoteError {
    /// The control plane rejected the call with an error code.
    #[error("{code}: {message}")]
    Service { code: String, message: String },
    #[error("HTTP {status} for {url}")]
    Http { status: u16, url: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("remote config error: {0}")]
    Config(String),
    #[error("remote I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RemoteError {
    pub fn service(code: &str, message: impl Into<String>) -> Self {
        RemoteError::Service {
            code: code.to_owned(),
            message: message.into(),
        }
    }
}

impl From<RemoteError> for Fault {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Service { code, message } => Fault::service(code, message),
            RemoteError::Http {
                status: 401 | 403, ..
            } => Fault::access_denied(err.to_string()),
            RemoteError::Config(_) => Fault::new(FaultKind::Validation, None, err.to_string()),
            other => Fault::client(other.to_string()),
        }
    }
}

/// Synchronous operations against the managed-database control plane.
///
/// Listing calls return every page.
pub trait ControlPlane: Send + Sync {
    fn describe_db_instance(&self, id: &DbInstanceIdentifier) -> Result<DbInstance, RemoteError>;

    fn modify_db_instance(&self, request: &ModifyDbInstance) -> Result<DbInstance, RemoteError>;

    fn reboot_db_instance(&self, id: &DbInstanceIdentifier) -> Result<DbInstance, RemoteError>;

    fn add_role_to_db_instance(
        &self,
        id: &DbInstanceIdentifier,
        role: &DbInstanceRole,
    ) -> Result<(), RemoteError>;

    fn remove_role_from_db_instance(
        &self,
        id: &DbInstanceIdentifier,
        role: &DbInstanceRole,
    ) -> Result<(), RemoteError>;

    fn add_tags(&self, arn: &ResourceArn, tags: &[Tag]) -> Result<(), RemoteError>;

    fn remove_tags(&self, arn: &ResourceArn, keys: &[String]) -> Result<(), RemoteError>;

    /// Groups matching `name`; empty when there is none.
    fn describe_db_parameter_groups(
        &self,
        name: &ParameterGroupName,
    ) -> Result<Vec<DbParameterGroup>, RemoteError>;

    fn describe_db_engine_versions(
        &self,
        filter: &EngineVersionFilter,
    ) -> Result<Vec<EngineVersion>, RemoteError>;

    /// The security group named `default` in `vpc_id`, if any.
    fn describe_default_security_group(
        &self,
        vpc_id: &str,
    ) -> Result<Option<SecurityGroup>, RemoteError>;

    fn describe_engine_default_parameters(
        &self,
        family: &str,
    ) -> Result<Vec<Parameter>, RemoteError>;

    fn describe_db_parameters(
        &self,
        name: &ParameterGroupName,
    ) -> Result<Vec<Parameter>, RemoteError>;

    fn modify_db_parameter_group(
        &self,
        name: &ParameterGroupName,
        parameters: &[Parameter],
    ) -> Result<(), RemoteError>;

    fn reset_db_parameter_group(
        &self,
        name: &ParameterGroupName,
        parameters: &[Parameter],
    ) -> Result<(), RemoteError>;
}
