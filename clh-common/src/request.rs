//! JSON-over-HTTP requests against cluster nodes.
//!
//! Every request is recorded in the sandbox activity log (and, with verbose
//! REST diagnostics on, the full exchange in `rest.log`). Transport failures
//! trigger a sandbox scan before the original error is returned, so a node
//! that crashed shows up as its crash reason instead of "connection refused".

use std::fmt::Write as _;
use std::panic::Location;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::config::GlobalOverrides;
use crate::errors::{HarnessError, HarnessResult};
use crate::node::Endpoint;
use crate::sandbox::Sandbox;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause before scanning the sandbox after a transport failure, giving a
/// dying node time to flush its stack trace.
pub const DEFAULT_ERROR_CHECK_DELAY: Duration = Duration::from_secs(2);

const ERROR_KEYS: [&str; 4] = ["error", "Error", "errors", "Errors"];
const WARNING_KEYS: [&str; 4] = ["warning", "Warning", "warnings", "Warnings"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Method {
    #[default]
    Get,
    Post,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
        }
    }
}

/// One request's parameters.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub path: String,
    /// Used verbatim instead of the node's address plus `path`.
    pub full_url: Option<String>,
    pub method: Method,
    /// Parameters whose value is `None` are dropped before encoding.
    pub params: Vec<(String, Option<String>)>,
    pub timeout: Duration,
    /// Report `error` keys in the body without failing.
    pub ignore_remote_errors: bool,
    /// Skip the sandbox scan on transport failure (used while nodes boot).
    pub no_extra_error_check: bool,
    pub extra_comment: Option<String>,
    /// Return as soon as the response arrives, without parsing it.
    pub return_fast: bool,
}

impl RequestOptions {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            full_url: None,
            method: Method::Get,
            params: Vec::new(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
            ignore_remote_errors: false,
            no_extra_error_check: false,
            extra_comment: None,
            return_fast: false,
        }
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self {
            method: Method::Post,
            ..Self::get(path)
        }
    }

    pub fn full_url(url: impl Into<String>) -> Self {
        Self {
            full_url: Some(url.into()),
            ..Self::get("")
        }
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.params.push((key.into(), Some(value.to_string())));
        self
    }

    pub fn param_opt(mut self, key: impl Into<String>, value: Option<impl ToString>) -> Self {
        self.params.push((key.into(), value.map(|v| v.to_string())));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn ignore_remote_errors(mut self, ignore: bool) -> Self {
        self.ignore_remote_errors = ignore;
        self
    }

    pub fn no_extra_error_check(mut self, skip: bool) -> Self {
        self.no_extra_error_check = skip;
        self
    }

    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.extra_comment = Some(comment.into());
        self
    }

    pub fn return_fast(mut self, fast: bool) -> Self {
        self.return_fast = fast;
        self
    }

    /// Target URL with the non-null parameters appended.
    pub fn resolve_url(&self, endpoint: &Endpoint) -> String {
        let base = match &self.full_url {
            Some(url) => url.clone(),
            None => endpoint.url(&self.path),
        };
        let query = encode_query(&self.params);
        if query.is_empty() {
            base
        } else {
            format!("{base}?{query}")
        }
    }
}

/// `k=v&...` for every parameter that has a value.
pub fn encode_query(params: &[(String, Option<String>)]) -> String {
    params
        .iter()
        .filter_map(|(k, v)| v.as_ref().map(|v| (k, v)))
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Issues requests on behalf of nodes and callers.
pub struct RequestClient {
    sandbox: Arc<Sandbox>,
    overrides: GlobalOverrides,
    url_history: Mutex<Vec<String>>,
    error_check_delay: Duration,
}

impl std::fmt::Debug for RequestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestClient")
            .field("sandbox", &self.sandbox.root())
            .field("error_check_delay", &self.error_check_delay)
            .finish_non_exhaustive()
    }
}

impl RequestClient {
    pub fn new(sandbox: Arc<Sandbox>, overrides: GlobalOverrides) -> Self {
        Self {
            sandbox,
            overrides,
            url_history: Mutex::new(Vec::new()),
            error_check_delay: DEFAULT_ERROR_CHECK_DELAY,
        }
    }

    pub fn with_error_check_delay(mut self, delay: Duration) -> Self {
        self.error_check_delay = delay;
        self
    }

    pub fn sandbox(&self) -> &Arc<Sandbox> {
        &self.sandbox
    }

    pub fn overrides(&self) -> &GlobalOverrides {
        &self.overrides
    }

    /// Every URL that produced a response, oldest first.
    pub fn url_history(&self) -> Vec<String> {
        self.url_history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Issue one request and classify the reply.
    ///
    /// Returns `None` only with `return_fast`. Errors name the calling
    /// location so failures read like the test line that caused them.
    #[track_caller]
    pub fn request(&self, endpoint: &Endpoint, options: &RequestOptions) -> HarnessResult<Option<Value>> {
        let caller = Location::caller();
        let url = options.resolve_url(endpoint);

        self.sandbox
            .log_command(&format!("Start {url}"), options.extra_comment.as_deref());
        if self.sandbox.debug_rest() {
            let mut entry = format!("\n{}\n\n", "-".repeat(70));
            if let Some(comment) = &options.extra_comment {
                let _ = writeln!(entry, "# Extra comment info about this request: {comment}");
            }
            let _ = write!(entry, "{}\n{url}", options.method.as_str());
            self.sandbox.log_rest(&entry);
        }
        if self.overrides.verbose {
            info!(method = options.method.as_str(), url = %url, "request");
        }

        let config = ureq::Agent::config_builder()
            .timeout_global(Some(options.timeout))
            .http_status_as_error(false)
            .build();
        let agent: ureq::Agent = config.into();
        let sent = match options.method {
            Method::Get => agent.get(&url).call(),
            Method::Post => agent.post(&url).send_empty(),
        };

        let mut response = match sent {
            Ok(response) => response,
            Err(err) => return Err(self.transport_failure(&url, options, err)),
        };

        let status = response.status().as_u16();
        let body = match response.body_mut().read_to_string() {
            Ok(body) => body,
            Err(err) => return Err(self.transport_failure(&url, options, err)),
        };
        if self.sandbox.debug_rest() {
            self.sandbox
                .log_rest(&format!("\nHTTP status code: {status}\n{body}"));
        }

        if status >= 400 {
            error!(url = %url, status, body = %body, "request returned no usable response");
            return Err(HarnessError::Protocol(format!(
                "Maybe bad url? HTTP {status} from {url} in request at {caller}"
            )));
        }

        self.url_history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(url.clone());

        if options.return_fast {
            return Ok(None);
        }

        classify_body(&url, &body, options.ignore_remote_errors, caller).map(Some)
    }

    fn transport_failure(&self, url: &str, options: &RequestOptions, err: ureq::Error) -> HarnessError {
        if !options.no_extra_error_check {
            error!(url = %url, error = %err, "got exception on request, going to check sandbox, then rethrow");
            thread::sleep(self.error_check_delay);
            match self.sandbox.check_for_errors(false) {
                Ok(true) => warn!("sandbox reported (ignored) errors after request failure"),
                Ok(false) => {}
                Err(scan) => error!(error = %scan, "sandbox errors found after request failure"),
            }
        } else {
            debug!(url = %url, error = %err, "request failed");
        }
        if self.sandbox.debug_rest() {
            self.sandbox
                .log_rest(&format!("\nEXCEPTION CAUGHT DOING REQUEST: {err}"));
        }
        HarnessError::Transport {
            url: url.to_string(),
            source: Box::new(err),
        }
    }

    /// `GET /3/Cloud.json`.
    #[track_caller]
    pub fn get_cloud(
        &self,
        endpoint: &Endpoint,
        timeout: Duration,
        no_extra_error_check: bool,
    ) -> HarnessResult<Value> {
        let options = RequestOptions::get("3/Cloud.json")
            .timeout(timeout)
            .no_extra_error_check(no_extra_error_check);
        self.request(endpoint, &options)?
            .ok_or_else(|| HarnessError::Protocol("empty Cloud.json response".to_string()))
    }

    /// `POST /3/Shutdown.json`: ask the whole cloud to shut down.
    #[track_caller]
    pub fn shutdown_all(&self, endpoint: &Endpoint, timeout: Duration) -> HarnessResult<()> {
        let options = RequestOptions::post("3/Shutdown.json")
            .timeout(timeout)
            .no_extra_error_check(true)
            .return_fast(true);
        self.request(endpoint, &options).map(|_| ())
    }

    /// Write a marker line into the node's own log.
    #[track_caller]
    pub fn log_and_echo(&self, endpoint: &Endpoint, message: &str) -> HarnessResult<Value> {
        let options = RequestOptions::get("3/LogAndEcho.json").param("message", message);
        self.request(endpoint, &options)?
            .ok_or_else(|| HarnessError::Protocol("empty LogAndEcho.json response".to_string()))
    }
}

/// A JSON value that counts as "present" for error/warning keys.
fn is_set(value: &Value) -> bool {
    match value {
        Value::Null | Value::Bool(false) => false,
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        Value::Bool(true) | Value::Number(_) => true,
    }
}

/// Parse a response body and apply the error/warning key policy.
pub fn classify_body(
    url: &str,
    body: &str,
    ignore_remote_errors: bool,
    caller: &Location<'_>,
) -> HarnessResult<Value> {
    let json: Value = match serde_json::from_str(body) {
        Ok(json) => json,
        Err(err) => {
            error!(url = %url, body = %body, "could not decode json from the request");
            return Err(HarnessError::Decode {
                message: format!("could not decode any json from {url}: {err}"),
                body: body.to_string(),
            });
        }
    };

    let object = match &json {
        Value::Object(object) => object,
        Value::Array(_) => return Ok(json),
        _ => {
            error!(url = %url, body = %body, "json response is neither a list nor a map");
            return Err(HarnessError::Decode {
                message: format!("json responses should always be lists or maps, got {body} from {url}"),
                body: body.to_string(),
            });
        }
    };

    for key in ERROR_KEYS {
        if let Some(value) = object.get(key).filter(|v| is_set(v)) {
            let pretty = serde_json::to_string_pretty(&json).unwrap_or_else(|_| body.to_string());
            error!(url = %url, caller = %caller, "json {key}: {value}\n{pretty}");
            if !ignore_remote_errors {
                return Err(HarnessError::Remote {
                    url: url.to_string(),
                    value: value.clone(),
                });
            }
        }
    }

    for key in WARNING_KEYS {
        if let Some(value) = object.get(key).filter(|v| is_set(v)) {
            warn!(url = %url, caller = %caller, "json {key}: {value}");
        }
    }

    Ok(json)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> Endpoint {
        Endpoint::new("10.0.0.5", 54321)
    }

    #[test]
    fn test_none_params_are_dropped() {
        let options = RequestOptions::get("3/Parse.json")
            .param("src", "a b")
            .param_opt("hex", None::<String>)
            .param("n", 3);
        assert_eq!(
            options.resolve_url(&endpoint()),
            "http://10.0.0.5:54321/3/Parse.json?src=a%20b&n=3"
        );
    }

    #[test]
    fn test_full_url_wins() {
        let options = RequestOptions::full_url("http://other:1/x").param("a", 1);
        assert_eq!(options.resolve_url(&endpoint()), "http://other:1/x?a=1");
        assert_eq!(RequestOptions::get("/3/Cloud.json").resolve_url(&endpoint()), "http://10.0.0.5:54321/3/Cloud.json");
    }

    #[test]
    fn test_remote_error_is_raised() {
        let err = classify_body("u", r#"{"error": "disk full"}"#, false, Location::caller()).unwrap_err();
        match err {
            HarnessError::Remote { value, .. } => assert_eq!(value, Value::from("disk full")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_remote_error_can_be_ignored() {
        let json = classify_body("u", r#"{"Errors": ["disk full"], "x": 1}"#, true, Location::caller()).unwrap();
        assert_eq!(json["x"], 1);
    }

    #[test]
    fn test_null_error_and_warning_do_not_raise() {
        let json = classify_body("u", r#"{"error": null, "warning": "slow"}"#, false, Location::caller()).unwrap();
        assert_eq!(json["warning"], "slow");
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(
            classify_body("u", "<html>oops</html>", false, Location::caller()),
            Err(HarnessError::Decode { .. })
        ));
        assert!(matches!(
            classify_body("u", "42", false, Location::caller()),
            Err(HarnessError::Decode { .. })
        ));
        assert!(classify_body("u", "[1, 2]", false, Location::caller()).is_ok());
    }

    #[test]
    fn test_method_names() {
        assert_eq!(Method::Get.as_str(), "GET");
        assert_eq!(Method::Post.as_str(), "POST");
        assert_eq!(RequestOptions::post("x").method, Method::Post);
    }
}
