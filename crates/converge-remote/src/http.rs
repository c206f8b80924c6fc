use crate::{
    ControlPlane, DbInstance, DbParameterGroup, EngineVersion, EngineVersionFilter,
    ModifyDbInstance, Parameter, ParameterPage, RemoteConfig, RemoteError, SecurityGroup,
};
use converge_schema::{DbInstanceIdentifier, DbInstanceRole, ParameterGroupName, ResourceArn, Tag};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::io::Read;
use std::time::Duration;

/// Upper bound on pages fetched by one paginated listing.
const MAX_PAGES: usize = 1000;

/// JSON-over-HTTP control-plane client.
///
/// Every operation is `POST <url>/<Action>` with a JSON body. Successful calls
/// answer 2xx with a JSON document; rejected calls answer 4xx/5xx with
/// `{"code": "...", "message": "..."}`.
pub struct HttpBackend {
    config: RemoteConfig,
    agent: ureq::Agent,
}

#[derive(Deserialize)]
struct ServiceErrorBody {
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct InstanceResponse {
    db_instance: DbInstance,
}

#[derive(Deserialize)]
struct ParameterGroupsResponse {
    #[serde(default)]
    db_parameter_groups: Vec<DbParameterGroup>,
}

#[derive(Deserialize)]
struct EngineVersionsResponse {
    #[serde(default)]
    db_engine_versions: Vec<EngineVersion>,
}

#[derive(Deserialize)]
struct SecurityGroupsResponse {
    #[serde(default)]
    security_groups: Vec<SecurityGroup>,
}

impl HttpBackend {
    pub fn new(config: RemoteConfig) -> Self {
        let agent_config = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .timeout_global(Some(Duration::from_secs(config.timeout_seconds)))
            .build();
        let agent = ureq::Agent::new_with_config(agent_config);
        Self { config, agent }
    }

    fn url(&self, action: &str) -> String {
        format!("{}/{action}", self.config.url)
    }

    fn post(&self, action: &str, body: &impl Serialize) -> Result<Vec<u8>, RemoteError> {
        let url = self.url(action);
        let payload =
            serde_json::to_vec(body).map_err(|e| RemoteError::Serialization(e.to_string()))?;
        tracing::debug!("POST {url} ({} bytes)", payload.len());

        let mut req = self
            .agent
            .post(&url)
            .header("Content-Type", "application/json")
            .header("X-Converge-Protocol", &crate::PROTOCOL_VERSION.to_string());
        if let Some(ref token) = self.config.auth_token {
            req = req.header("Authorization", &format!("Bearer {token}"));
        }

        let resp = match req.send(&payload[..]) {
            Ok(r) => r,
            Err(ureq::Error::StatusCode(status)) => {
                return Err(RemoteError::Http { status, url });
            }
            Err(e) => return Err(RemoteError::Transport(e.to_string())),
        };

        let status = resp.status().as_u16();
        let mut reader = resp.into_body().into_reader();
        let mut body = Vec::new();
        reader
            .read_to_end(&mut body)
            .map_err(|e| RemoteError::Transport(e.to_string()))?;

        if status >= 400 {
            if let Ok(err) = serde_json::from_slice::<ServiceErrorBody>(&body) {
                tracing::debug!("{action} rejected: {}", err.code);
                return Err(RemoteError::Service {
                    code: err.code,
                    message: err.message,
                });
            }
            return Err(RemoteError::Http { status, url });
        }
        Ok(body)
    }

    fn call<T: DeserializeOwned>(&self, action: &str, body: &impl Serialize) -> Result<T, RemoteError> {
        let bytes = self.post(action, body)?;
        serde_json::from_slice(&bytes).map_err(|e| RemoteError::Serialization(e.to_string()))
    }

    fn call_unit(&self, action: &str, body: &impl Serialize) -> Result<(), RemoteError> {
        self.post(action, body).map(|_| ())
    }

    /// Follow `marker` until the listing is complete. A marker seen twice or
    /// more than `MAX_PAGES` pages is a protocol error.
    fn paginate(
        &self,
        action: &str,
        mut request: serde_json::Value,
    ) -> Result<Vec<Parameter>, RemoteError> {
        let mut all = Vec::new();
        let mut seen = HashSet::new();
        for _ in 0..MAX_PAGES {
            let page: ParameterPage = self.call(action, &request)?;
            all.extend(page.parameters);
            match page.marker {
                Some(marker) if !marker.is_empty() => {
                    if !seen.insert(marker.clone()) {
                        return Err(RemoteError::Transport(format!(
                            "{action}: pagination marker {marker:?} repeated"
                        )));
                    }
                    request["marker"] = json!(marker);
                }
                _ => return Ok(all),
            }
        }
        Err(RemoteError::Transport(format!(
            "{action}: listing exceeded {MAX_PAGES} pages"
        )))
    }
}

impl ControlPlane for HttpBackend {
    fn describe_db_instance(&self, id: &DbInstanceIdentifier) -> Result<DbInstance, RemoteError> {
        let resp: InstanceResponse =
            self.call("DescribeDBInstances", &json!({ "identifier": id }))?;
        Ok(resp.db_instance)
    }

    fn modify_db_instance(&self, request: &ModifyDbInstance) -> Result<DbInstance, RemoteError> {
        let resp: InstanceResponse = self.call("ModifyDBInstance", request)?;
        Ok(resp.db_instance)
    }

    fn reboot_db_instance(&self, id: &DbInstanceIdentifier) -> Result<DbInstance, RemoteError> {
        let resp: InstanceResponse = self.call("RebootDBInstance", &json!({ "identifier": id }))?;
        Ok(resp.db_instance)
    }

    fn add_role_to_db_instance(
        &self,
        id: &DbInstanceIdentifier,
        role: &DbInstanceRole,
    ) -> Result<(), RemoteError> {
        self.call_unit(
            "AddRoleToDBInstance",
            &json!({ "identifier": id, "role_arn": role.role_arn, "feature_name": role.feature_name }),
        )
    }

    fn remove_role_from_db_instance(
        &self,
        id: &DbInstanceIdentifier,
        role: &DbInstanceRole,
    ) -> Result<(), RemoteError> {
        self.call_unit(
            "RemoveRoleFromDBInstance",
            &json!({ "identifier": id, "role_arn": role.role_arn, "feature_name": role.feature_name }),
        )
    }

    fn add_tags(&self, arn: &ResourceArn, tags: &[Tag]) -> Result<(), RemoteError> {
        self.call_unit("AddTagsToResource", &json!({ "arn": arn, "tags": tags }))
    }

    fn remove_tags(&self, arn: &ResourceArn, keys: &[String]) -> Result<(), RemoteError> {
        self.call_unit("RemoveTagsFromResource", &json!({ "arn": arn, "tag_keys": keys }))
    }

    fn describe_db_parameter_groups(
        &self,
        name: &ParameterGroupName,
    ) -> Result<Vec<DbParameterGroup>, RemoteError> {
        let resp: ParameterGroupsResponse =
            self.call("DescribeDBParameterGroups", &json!({ "name": name }))?;
        Ok(resp.db_parameter_groups)
    }

    fn describe_db_engine_versions(
        &self,
        filter: &EngineVersionFilter,
    ) -> Result<Vec<EngineVersion>, RemoteError> {
        let resp: EngineVersionsResponse = self.call("DescribeDBEngineVersions", filter)?;
        Ok(resp.db_engine_versions)
    }

    fn describe_default_security_group(
        &self,
        vpc_id: &str,
    ) -> Result<Option<SecurityGroup>, RemoteError> {
        let resp: SecurityGroupsResponse = self.call(
            "DescribeSecurityGroups",
            &json!({ "vpc_id": vpc_id, "group_name": "default" }),
        )?;
        Ok(resp.security_groups.into_iter().next())
    }

    fn describe_engine_default_parameters(
        &self,
        family: &str,
    ) -> Result<Vec<Parameter>, RemoteError> {
        self.paginate("DescribeEngineDefaultParameters", json!({ "family": family }))
    }

    fn describe_db_parameters(
        &self,
        name: &ParameterGroupName,
    ) -> Result<Vec<Parameter>, RemoteError> {
        self.paginate("DescribeDBParameters", json!({ "name": name }))
    }

    fn modify_db_parameter_group(
        &self,
        name: &ParameterGroupName,
        parameters: &[Parameter],
    ) -> Result<(), RemoteError> {
        self.call_unit(
            "ModifyDBParameterGroup",
            &json!({ "name": name, "parameters": parameters }),
        )
    }

    fn reset_db_parameter_group(
        &self,
        name: &ParameterGroupName,
        parameters: &[Parameter],
    ) -> Result<(), RemoteError> {
        self.call_unit(
            "ResetDBParameterGroup",
            &json!({ "name": name, "parameters": parameters }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone)]
    struct CapturedRequest {
        path: String,
        headers: HashMap<String, String>,
        body: String,
    }

    /// Answers each request with the next scripted `(status, body)`.
    struct MockServer {
        addr: String,
        _handle: std::thread::JoinHandle<()>,
        requests: Arc<Mutex<Vec<CapturedRequest>>>,
    }

    impl MockServer {
        fn start(responses: Vec<(u16, &str)>) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let addr = format!("http://{}", listener.local_addr().unwrap());
            let script: Arc<Mutex<VecDeque<(u16, String)>>> = Arc::new(Mutex::new(
                responses
                    .into_iter()
                    .map(|(s, b)| (s, b.to_owned()))
                    .collect(),
            ));
            let requests: Arc<Mutex<Vec<CapturedRequest>>> = Arc::new(Mutex::new(Vec::new()));
            let requests_clone = Arc::clone(&requests);

            let handle = std::thread::spawn(move || {
                for stream in listener.incoming() {
                    let Ok(mut stream) = stream else { break };
                    let mut reader = BufReader::new(stream.try_clone().unwrap());
                    let mut request_line = String::new();
                    if reader.read_line(&mut request_line).is_err() {
                        continue;
                    }
                    let path = request_line
                        .split_whitespace()
                        .nth(1)
                        .unwrap_or_default()
                        .to_owned();

                    let mut content_length = 0usize;
                    let mut headers = HashMap::new();
                    loop {
                        let mut line = String::new();
                        if reader.read_line(&mut line).is_err() || line.trim().is_empty() {
                            break;
                        }
                        if let Some((k, v)) = line.trim().split_once(": ") {
                            let key = k.to_lowercase();
                            if key == "content-length" {
                                content_length = v.trim().parse().unwrap_or(0);
                            }
                            headers.insert(key, v.to_owned());
                        }
                    }
                    let mut body = vec![0u8; content_length];
                    let _ = reader.read_exact(&mut body);
                    requests_clone.lock().unwrap().push(CapturedRequest {
                        path,
                        headers,
                        body: String::from_utf8_lossy(&body).into_owned(),
                    });

                    let (status, payload) = script
                        .lock()
                        .unwrap()
                        .pop_front()
                        .unwrap_or((500, String::new()));
                    let response = format!(
                        "HTTP/1.1 {status} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{payload}",
                        payload.len()
                    );
                    let _ = stream.write_all(response.as_bytes());
                    let _ = stream.flush();
                }
            });

            MockServer {
                addr,
                _handle: handle,
                requests,
            }
        }

        fn captured(&self) -> Vec<CapturedRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    fn backend(url: &str) -> HttpBackend {
        HttpBackend::new(RemoteConfig::new(url))
    }

    const INSTANCE: &str = r#"{"db_instance":{"identifier":"orders","status":"available","arn":"arn:db:orders","engine":"mysql","allocated_storage":100}}"#;

    #[test]
    fn describe_instance_posts_to_action_path() {
        let server = MockServer::start(vec![(200, INSTANCE)]);
        let instance = backend(&server.addr)
            .describe_db_instance(&DbInstanceIdentifier::new("orders"))
            .unwrap();
        assert!(instance.is_available());
        assert_eq!(instance.allocated_storage, 100);

        let reqs = server.captured();
        assert_eq!(reqs[0].path, "/DescribeDBInstances");
        assert!(reqs[0].body.contains("\"orders\""));
        assert_eq!(
            reqs[0].headers.get("x-converge-protocol").map(String::as_str),
            Some("1")
        );
    }

    #[test]
    fn service_error_body_becomes_service_error() {
        let server = MockServer::start(vec![(
            404,
            r#"{"code":"DBInstanceNotFound","message":"orders not found"}"#,
        )]);
        let err = backend(&server.addr)
            .describe_db_instance(&DbInstanceIdentifier::new("orders"))
            .unwrap_err();
        match err {
            RemoteError::Service { code, message } => {
                assert_eq!(code, "DBInstanceNotFound");
                assert_eq!(message, "orders not found");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn status_without_error_body_is_http_error() {
        let server = MockServer::start(vec![(403, "")]);
        let err = backend(&server.addr)
            .remove_tags(&ResourceArn::new("arn:db:orders"), &["team".to_owned()])
            .unwrap_err();
        assert!(matches!(err, RemoteError::Http { status: 403, .. }));
    }

    #[test]
    fn parameter_listing_follows_marker() {
        let server = MockServer::start(vec![
            (
                200,
                r#"{"parameters":[{"name":"a","value":"1"}],"marker":"page-2"}"#,
            ),
            (200, r#"{"parameters":[{"name":"b","value":"2"}]}"#),
        ]);
        let params = backend(&server.addr)
            .describe_db_parameters(&ParameterGroupName::new("orders-params"))
            .unwrap();
        assert_eq!(
            params.iter().map(|p| p.name.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        let reqs = server.captured();
        assert_eq!(reqs.len(), 2);
        assert!(!reqs[0].body.contains("marker"));
        assert!(reqs[1].body.contains("\"page-2\""));
    }

    #[test]
    fn repeated_marker_stops_the_listing() {
        let page = r#"{"parameters":[{"name":"a","value":"1"}],"marker":"page-2"}"#;
        let server = MockServer::start(vec![(200, page), (200, page), (200, page)]);
        let err = backend(&server.addr)
            .describe_db_parameters(&ParameterGroupName::new("orders-params"))
            .unwrap_err();
        assert!(matches!(err, RemoteError::Transport(ref m) if m.contains("repeated")), "{err}");
        assert_eq!(server.captured().len(), 2);
    }

    #[test]
    fn auth_token_sent_as_bearer_header() {
        let server = MockServer::start(vec![(200, "{}")]);
        let backend = HttpBackend::new(RemoteConfig::new(&server.addr).with_token("secret-42"));
        backend
            .add_tags(&ResourceArn::new("arn:db:orders"), &[Tag::new("team", "payments")])
            .unwrap();
        let reqs = server.captured();
        assert_eq!(
            reqs[0].headers.get("authorization").map(String::as_str),
            Some("Bearer secret-42")
        );
        assert_eq!(reqs[0].path, "/AddTagsToResource");
    }

    #[test]
    fn connection_refused_is_transport_error() {
        let err = backend("http://127.0.0.1:1")
            .describe_db_instance(&DbInstanceIdentifier::new("orders"))
            .unwrap_err();
        assert!(matches!(err, RemoteError::Transport(_)));
    }

    #[test]
    fn malformed_success_body_is_serialization_error() {
        let server = MockServer::start(vec![(200, "not json")]);
        let err = backend(&server.addr)
            .describe_db_instance(&DbInstanceIdentifier::new("orders"))
            .unwrap_err();
        assert!(matches!(err, RemoteError::Serialization(_)));
    }
}
