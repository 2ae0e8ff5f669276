//! Wire dialects.
//!
//! Every pool speaks newline-delimited JSON-RPC, but method names and
//! payload shapes differ. A [`Dialect`] turns the connection's intents
//! (subscribe, log in, submit, keep alive) into requests and interprets the
//! pool's replies and notifications. The connection state machine is the
//! same for all of them.

use std::sync::Arc;

use serde_json::{json, Value};

use super::descriptor::PoolDescriptor;
use super::job::Share;
use super::messages::error_reason;
use crate::config::{DialectKind, MethodNames, NetworkConfig};
use crate::error::{Error, Result};

/// A request to send: method name and params.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: String,
    pub params: Value,
}

impl Request {
    fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

/// Job fields as the pool sent them, before validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobParams {
    pub job_id: String,
    pub blob: String,
    pub target: String,
}

/// Per-login state a dialect needs for later requests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    /// Session identifier assigned at login (login dialect)
    pub id: Option<String>,

    /// Worker name submitted with shares (stratum dialect)
    pub user: String,
}

/// Result of a successful login.
#[derive(Debug, Clone)]
pub struct Authorized {
    pub session: Session,

    /// Some dialects deliver the first job in the login reply
    pub job: Option<JobParams>,
}

/// Interpreted notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Job(JobParams),
    /// The pool asked us to reconnect
    Reconnect,
    Unknown,
}

/// Pool's answer to a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitReply {
    Accepted,
    Rejected(String),
}

/// Protocol dialect spoken over a pool connection.
pub trait Dialect: Send + Sync {
    fn name(&self) -> &'static str;

    /// Subscribe request, for dialects with a subscribe step.
    fn subscribe(&self, agent: &str) -> Option<Request>;

    /// Check a subscribe reply.
    fn parse_subscribe(&self, result: Option<&Value>, error: Option<&Value>) -> Result<()> {
        match (result, error) {
            (_, Some(error)) => Err(Error::Protocol(format!(
                "subscribe failed: {}",
                error_reason(error)
            ))),
            (Some(_), None) => Ok(()),
            (None, None) => Err(Error::Protocol("empty subscribe reply".to_string())),
        }
    }

    /// Login/authorize request.
    fn authorize(&self, pool: &PoolDescriptor, agent: &str) -> Request;

    /// Interpret the login/authorize reply.
    ///
    /// Credential refusals map to [`Error::AuthorizationRejected`].
    fn parse_authorize(
        &self,
        pool: &PoolDescriptor,
        result: Option<&Value>,
        error: Option<&Value>,
    ) -> Result<Authorized>;

    /// Interpret a server notification.
    fn parse_notification(&self, method: &str, params: &Value) -> Result<Notification>;

    /// Share submission request; `stale` adds the dialect's stale marker.
    fn submit(&self, session: &Session, share: &Share, stale: bool) -> Request;

    /// Interpret a submission reply.
    fn parse_submit(&self, result: Option<&Value>, error: Option<&Value>) -> SubmitReply;

    /// Keep-alive request, if the dialect has one.
    fn keepalive(&self, session: &Session) -> Option<Request>;
}

/// Build the dialect selected in the network configuration.
pub fn dialect_for(network: &NetworkConfig) -> Arc<dyn Dialect> {
    match network.dialect {
        DialectKind::Login => Arc::new(LoginDialect::new(network.methods.clone())),
        DialectKind::Stratum => Arc::new(StratumDialect),
    }
}

/// CryptoNote-style dialect: `login`, `job`, `submit`, `keepalived`.
///
/// Method names are configurable for pools that rename them.
#[derive(Debug, Clone, Default)]
pub struct LoginDialect {
    methods: MethodNames,
}

impl LoginDialect {
    pub fn new(methods: MethodNames) -> Self {
        Self { methods }
    }
}

fn str_field<'a>(obj: &'a Value, key: &str, what: &str) -> Result<&'a str> {
    obj.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Protocol(format!("{} missing string field {}", what, key)))
}

fn login_job(params: &Value) -> Result<JobParams> {
    if !params.is_object() {
        return Err(Error::Protocol("job params not an object".to_string()));
    }
    Ok(JobParams {
        job_id: str_field(params, "job_id", "job")?.to_string(),
        blob: str_field(params, "blob", "job")?.to_string(),
        target: str_field(params, "target", "job")?.to_string(),
    })
}

impl Dialect for LoginDialect {
    fn name(&self) -> &'static str {
        "login"
    }

    fn subscribe(&self, _agent: &str) -> Option<Request> {
        None
    }

    fn authorize(&self, pool: &PoolDescriptor, agent: &str) -> Request {
        Request::new(
            &self.methods.login,
            json!({
                "login": pool.user,
                "pass": pool.password,
                "agent": agent,
                "algo": [pool.algo.to_string()],
            }),
        )
    }

    fn parse_authorize(
        &self,
        pool: &PoolDescriptor,
        result: Option<&Value>,
        error: Option<&Value>,
    ) -> Result<Authorized> {
        if let Some(error) = error {
            return Err(Error::AuthorizationRejected(error_reason(error)));
        }
        let result =
            result.ok_or_else(|| Error::Protocol("login reply has no result".to_string()))?;

        if let Some(status) = result.get("status").and_then(Value::as_str) {
            if !status.eq_ignore_ascii_case("OK") {
                return Err(Error::AuthorizationRejected(status.to_string()));
            }
        }

        let id = str_field(result, "id", "login reply")?;
        let job = match result.get("job") {
            Some(job) if !job.is_null() => Some(login_job(job)?),
            _ => None,
        };

        Ok(Authorized {
            session: Session {
                id: Some(id.to_string()),
                user: pool.user.clone(),
            },
            job,
        })
    }

    fn parse_notification(&self, method: &str, params: &Value) -> Result<Notification> {
        if method == self.methods.job {
            login_job(params).map(Notification::Job)
        } else {
            Ok(Notification::Unknown)
        }
    }

    fn submit(&self, session: &Session, share: &Share, stale: bool) -> Request {
        let mut params = json!({
            "id": session.id,
            "job_id": share.job.id,
            "nonce": share.nonce_hex(),
            "result": share.digest_hex(),
        });
        if stale {
            params["stale"] = Value::Bool(true);
        }
        Request::new(&self.methods.submit, params)
    }

    fn parse_submit(&self, result: Option<&Value>, error: Option<&Value>) -> SubmitReply {
        if let Some(error) = error {
            return SubmitReply::Rejected(error_reason(error));
        }
        match result {
            Some(Value::Bool(true)) => SubmitReply::Accepted,
            Some(result) => match result.get("status").and_then(Value::as_str) {
                Some(status) if status.eq_ignore_ascii_case("OK") => SubmitReply::Accepted,
                Some(status) => SubmitReply::Rejected(status.to_string()),
                None => SubmitReply::Rejected(format!("unexpected result {}", result)),
            },
            None => SubmitReply::Rejected("empty reply".to_string()),
        }
    }

    fn keepalive(&self, session: &Session) -> Option<Request> {
        Some(Request::new(
            &self.methods.keepalive,
            json!({ "id": session.id }),
        ))
    }
}

/// `mining.*` dialect: subscribe, authorize, notify, submit.
#[derive(Debug, Clone, Copy, Default)]
pub struct StratumDialect;

impl Dialect for StratumDialect {
    fn name(&self) -> &'static str {
        "stratum"
    }

    fn subscribe(&self, agent: &str) -> Option<Request> {
        Some(Request::new("mining.subscribe", json!([agent])))
    }

    fn authorize(&self, pool: &PoolDescriptor, _agent: &str) -> Request {
        Request::new("mining.authorize", json!([pool.user, pool.password]))
    }

    fn parse_authorize(
        &self,
        pool: &PoolDescriptor,
        result: Option<&Value>,
        error: Option<&Value>,
    ) -> Result<Authorized> {
        if let Some(error) = error {
            return Err(Error::AuthorizationRejected(error_reason(error)));
        }
        match result {
            Some(Value::Bool(true)) => Ok(Authorized {
                session: Session {
                    id: None,
                    user: pool.user.clone(),
                },
                job: None,
            }),
            Some(Value::Bool(false)) => Err(Error::AuthorizationRejected(
                "Pool returned false".to_string(),
            )),
            _ => Err(Error::Protocol("Invalid authorize response".to_string())),
        }
    }

    fn parse_notification(&self, method: &str, params: &Value) -> Result<Notification> {
        match method {
            "mining.notify" => {
                // [job_id, blob, target, clean_jobs]
                let arr = params.as_array().ok_or_else(|| {
                    Error::Protocol("mining.notify params not an array".to_string())
                })?;
                let field = |i: usize, name: &str| {
                    arr.get(i)
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .ok_or_else(|| {
                            Error::Protocol(format!("mining.notify missing {}", name))
                        })
                };
                Ok(Notification::Job(JobParams {
                    job_id: field(0, "job_id")?,
                    blob: field(1, "blob")?,
                    target: field(2, "target")?,
                }))
            }
            "client.reconnect" => Ok(Notification::Reconnect),
            _ => Ok(Notification::Unknown),
        }
    }

    fn submit(&self, session: &Session, share: &Share, stale: bool) -> Request {
        let mut params = vec![
            json!(session.user),
            json!(share.job.id),
            json!(share.nonce_hex()),
            json!(share.digest_hex()),
        ];
        if stale {
            params.push(Value::Bool(true));
        }
        Request::new("mining.submit", Value::Array(params))
    }

    fn parse_submit(&self, result: Option<&Value>, error: Option<&Value>) -> SubmitReply {
        if let Some(error) = error {
            return SubmitReply::Rejected(error_reason(error));
        }
        match result {
            Some(Value::Bool(true)) => SubmitReply::Accepted,
            _ => SubmitReply::Rejected("Pool returned false".to_string()),
        }
    }

    fn keepalive(&self, _session: &Session) -> Option<Request> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algo::Algorithm;
    use crate::pool::{Job, PoolId, NONCE_OFFSET};

    fn pool() -> PoolDescriptor {
        PoolDescriptor {
            host: "pool.example.com".to_string(),
            port: 3333,
            tls: false,
            user: "wallet".to_string(),
            password: "x".to_string(),
            keepalive: true,
            algo: Algorithm::Cryptonight,
            nicehash: false,
        }
    }

    fn share() -> Share {
        let blob = hex::encode(vec![0u8; NONCE_OFFSET + 37]);
        let job =
            Job::from_hex("j1", &blob, "ffffffff", Algorithm::Cryptonight, PoolId(0), 1, false)
                .unwrap();
        Share::new(Arc::new(job), 7, [0u8; 32])
    }

    #[test]
    fn login_reply_with_job() {
        let dialect = LoginDialect::default();
        let result = json!({
            "id": "sess-1",
            "job": {"job_id": "j1", "blob": "00", "target": "b88d0600", "id": "sess-1"},
            "status": "OK"
        });
        let auth = dialect.parse_authorize(&pool(), Some(&result), None).unwrap();
        assert_eq!(auth.session.id.as_deref(), Some("sess-1"));
        assert_eq!(auth.job.unwrap().job_id, "j1");
    }

    #[test]
    fn login_error_is_credential_failure() {
        let dialect = LoginDialect::default();
        let error = json!({"code": -1, "message": "Invalid address"});
        let err = dialect.parse_authorize(&pool(), None, Some(&error)).unwrap_err();
        assert!(err.is_credential());
        assert!(err.to_string().contains("Invalid address"));
    }

    #[test]
    fn login_reply_without_id_is_protocol_error() {
        let dialect = LoginDialect::default();
        let err = dialect
            .parse_authorize(&pool(), Some(&json!({"status": "OK"})), None)
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn custom_method_names() {
        let methods = MethodNames {
            login: "auth".to_string(),
            job: "work".to_string(),
            submit: "found".to_string(),
            keepalive: "ping".to_string(),
        };
        let dialect = LoginDialect::new(methods);
        assert_eq!(dialect.authorize(&pool(), "agent").method, "auth");

        let params = json!({"job_id": "j2", "blob": "00", "target": "ff"});
        assert!(matches!(
            dialect.parse_notification("work", &params).unwrap(),
            Notification::Job(_)
        ));
        assert_eq!(
            dialect.parse_notification("job", &params).unwrap(),
            Notification::Unknown
        );

        let session = Session {
            id: Some("s".into()),
            user: "wallet".into(),
        };
        assert_eq!(dialect.submit(&session, &share(), false).method, "found");
        assert_eq!(dialect.keepalive(&session).unwrap().method, "ping");
    }

    #[test]
    fn login_submit_carries_session_and_stale_marker() {
        let dialect = LoginDialect::default();
        let session = Session {
            id: Some("sess-1".into()),
            user: "wallet".into(),
        };

        let fresh = dialect.submit(&session, &share(), false);
        assert_eq!(fresh.params["id"], "sess-1");
        assert_eq!(fresh.params["job_id"], "j1");
        assert_eq!(fresh.params["nonce"], "07000000");
        assert!(fresh.params.get("stale").is_none());

        let stale = dialect.submit(&session, &share(), true);
        assert_eq!(stale.params["stale"], true);
    }

    #[test]
    fn login_submit_replies() {
        let dialect = LoginDialect::default();
        assert_eq!(
            dialect.parse_submit(Some(&json!({"status": "OK"})), None),
            SubmitReply::Accepted
        );
        assert_eq!(
            dialect.parse_submit(None, Some(&json!({"code": -1, "message": "Low difficulty share"}))),
            SubmitReply::Rejected("Low difficulty share".to_string())
        );
    }

    #[test]
    fn stratum_notify_and_reconnect() {
        let dialect = StratumDialect;
        let params = json!(["j9", "0707", "ffffffff", true]);
        assert_eq!(
            dialect.parse_notification("mining.notify", &params).unwrap(),
            Notification::Job(JobParams {
                job_id: "j9".into(),
                blob: "0707".into(),
                target: "ffffffff".into(),
            })
        );
        assert_eq!(
            dialect.parse_notification("client.reconnect", &json!([])).unwrap(),
            Notification::Reconnect
        );
        assert!(dialect
            .parse_notification("mining.notify", &json!({"job_id": "x"}))
            .is_err());
    }

    #[test]
    fn stratum_authorize_false_is_credential_failure() {
        let dialect = StratumDialect;
        let err = dialect
            .parse_authorize(&pool(), Some(&json!(false)), None)
            .unwrap_err();
        assert!(err.is_credential());
        assert!(dialect.parse_authorize(&pool(), Some(&json!(true)), None).is_ok());
    }

    #[test]
    fn stratum_submit_shape() {
        let dialect = StratumDialect;
        let session = Session {
            id: None,
            user: "wallet.rig".into(),
        };
        let req = dialect.submit(&session, &share(), true);
        assert_eq!(req.method, "mining.submit");
        assert_eq!(req.params[0], "wallet.rig");
        assert_eq!(req.params[1], "j1");
        assert_eq!(req.params[4], true);
        assert!(dialect.keepalive(&session).is_none());
    }
}
