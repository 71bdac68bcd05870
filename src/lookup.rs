//! Lookup-service client. The node depends on three answers from the lookup
//! service: its own registration (assigned id + API token), whether it is
//! currently active, and the delegation list. The rest of that API is not
//! modeled here.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::error::LookupError;
use crate::store::TrixelDelegation;
use crate::types::TrixelId;

/// Identity assigned by the lookup service on sign-up.
#[derive(Clone, Debug, PartialEq)]
pub struct Registration {
    pub id: u64,
    pub token: String,
    pub active: bool,
}

/// One sync answer. When `active` is false the delegation list is empty by
/// construction; a deactivated node serves nothing.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DelegationSync {
    pub active: bool,
    pub delegations: Vec<TrixelDelegation>,
}

#[async_trait]
pub trait LookupClient: Send + Sync {
    /// Sign this node up, announcing the host address it serves on.
    async fn register(&self, host: &str) -> Result<Registration, LookupError>;

    /// Pull the node's active flag and its current delegation list.
    async fn sync_delegation(&self, id: u64, token: &str) -> Result<DelegationSync, LookupError>;
}

#[derive(Debug, Deserialize)]
struct RegistrationAnswer {
    id: u64,
    token: String,
    #[serde(default)]
    active: bool,
}

#[derive(Debug, Deserialize)]
struct DetailAnswer {
    active: bool,
}

#[derive(Debug, Deserialize)]
struct DelegationAnswer {
    trixel_id: u64,
    #[serde(default)]
    exclude: bool,
}

fn delegations_from_wire(raw: Vec<DelegationAnswer>) -> Result<Vec<TrixelDelegation>, LookupError> {
    let mut delegations = Vec::with_capacity(raw.len());
    for entry in raw {
        let trixel = TrixelId::from_raw(entry.trixel_id)
            .ok_or(LookupError::MalformedResponse("a valid trixel id"))?;
        delegations.push(TrixelDelegation {
            trixel,
            exclude: entry.exclude,
        });
    }
    Ok(delegations)
}

async fn expect_status(
    response: reqwest::Response,
    expected: StatusCode,
) -> Result<reqwest::Response, LookupError> {
    match response.status() {
        status if status == expected => Ok(response),
        StatusCode::UNAUTHORIZED => Err(LookupError::AuthRejected),
        status => Err(LookupError::Status(status.as_u16())),
    }
}

/// Client for the real lookup service.
pub struct HttpLookupClient {
    http: reqwest::Client,
    base: Url,
}

impl HttpLookupClient {
    /// `base` is the versioned API root, e.g. `https://lookup.example.org/v1/`.
    pub fn new(base: &str, timeout: Duration) -> anyhow::Result<HttpLookupClient> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        // A trailing slash keeps joins relative to the API root.
        let base = Url::parse(&format!("{}/", base.trim_end_matches('/')))?;
        Ok(HttpLookupClient { http, base })
    }

    fn endpoint(&self, path: &str) -> Result<Url, LookupError> {
        Ok(self.base.join(path)?)
    }
}

#[async_trait]
impl LookupClient for HttpLookupClient {
    async fn register(&self, host: &str) -> Result<Registration, LookupError> {
        let mut url = self.endpoint("tms")?;
        url.query_pairs_mut().append_pair("host", host);
        debug!(%url, "signing up with the lookup service");
        let response = self.http.post(url).send().await?;
        let answer: RegistrationAnswer = expect_status(response, StatusCode::CREATED)
            .await?
            .json()
            .await?;
        Ok(Registration {
            id: answer.id,
            token: answer.token,
            active: answer.active,
        })
    }

    async fn sync_delegation(&self, id: u64, token: &str) -> Result<DelegationSync, LookupError> {
        let url = self.endpoint(&format!("tms/{id}"))?;
        let response = self.http.get(url).bearer_auth(token).send().await?;
        let detail: DetailAnswer = expect_status(response, StatusCode::OK)
            .await?
            .json()
            .await?;
        if !detail.active {
            return Ok(DelegationSync::default());
        }

        let url = self.endpoint(&format!("tms/{id}/delegations"))?;
        let response = self.http.get(url).bearer_auth(token).send().await?;
        let raw: Vec<DelegationAnswer> = expect_status(response, StatusCode::OK)
            .await?
            .json()
            .await?;
        Ok(DelegationSync {
            active: true,
            delegations: delegations_from_wire(raw)?,
        })
    }
}

/// In-memory stand-in for tests and the demo runner. Scripted answers are
/// consumed front to back; once the sync script runs dry the last successful
/// sync keeps repeating, so a long-running loop sees a stable picture.
#[derive(Default)]
pub struct ScriptedLookupClient {
    registrations: Mutex<VecDeque<Result<Registration, LookupError>>>,
    syncs: Mutex<VecDeque<Result<DelegationSync, LookupError>>>,
    last_sync: Mutex<Option<DelegationSync>>,
    register_calls: AtomicUsize,
    sync_calls: AtomicUsize,
}

impl ScriptedLookupClient {
    pub fn new() -> ScriptedLookupClient {
        ScriptedLookupClient::default()
    }

    pub fn push_registration(&self, answer: Result<Registration, LookupError>) {
        self.registrations.lock().push_back(answer);
    }

    pub fn push_sync(&self, answer: Result<DelegationSync, LookupError>) {
        self.syncs.lock().push_back(answer);
    }

    pub fn register_calls(&self) -> usize {
        self.register_calls.load(Ordering::SeqCst)
    }

    pub fn sync_calls(&self) -> usize {
        self.sync_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LookupClient for ScriptedLookupClient {
    async fn register(&self, _host: &str) -> Result<Registration, LookupError> {
        self.register_calls.fetch_add(1, Ordering::SeqCst);
        self.registrations
            .lock()
            .pop_front()
            .unwrap_or(Err(LookupError::Status(503)))
    }

    async fn sync_delegation(&self, _id: u64, _token: &str) -> Result<DelegationSync, LookupError> {
        self.sync_calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.syncs.lock().pop_front();
        match scripted {
            Some(Ok(sync)) => {
                *self.last_sync.lock() = Some(sync.clone());
                Ok(sync)
            }
            Some(Err(err)) => Err(err),
            None => match self.last_sync.lock().clone() {
                Some(sync) => Ok(sync),
                None => Err(LookupError::Status(503)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_answer_parses_with_active_defaulting_off() {
        let answer: RegistrationAnswer =
            serde_json::from_str(r#"{"id": 7, "token": "secret"}"#).unwrap();
        assert_eq!(answer.id, 7);
        assert_eq!(answer.token, "secret");
        assert!(!answer.active);
    }

    #[test]
    fn delegation_entries_default_to_include() {
        let raw: Vec<DelegationAnswer> = serde_json::from_str(
            r#"[{"trixel_id": 9}, {"trixel_id": 37, "exclude": true}]"#,
        )
        .unwrap();
        let delegations = delegations_from_wire(raw).unwrap();
        assert_eq!(delegations.len(), 2);
        assert!(!delegations[0].exclude);
        assert!(delegations[1].exclude);
    }

    #[test]
    fn invalid_trixel_ids_are_rejected() {
        let raw: Vec<DelegationAnswer> =
            serde_json::from_str(r#"[{"trixel_id": 7}]"#).unwrap();
        let err = delegations_from_wire(raw).unwrap_err();
        assert!(matches!(err, LookupError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn scripted_register_plays_answers_in_order() {
        let client = ScriptedLookupClient::new();
        client.push_registration(Err(LookupError::Status(503)));
        client.push_registration(Ok(Registration {
            id: 3,
            token: "t".into(),
            active: true,
        }));

        assert!(matches!(
            client.register("tms.example.org").await,
            Err(LookupError::Status(503))
        ));
        let registration = client.register("tms.example.org").await.unwrap();
        assert_eq!(registration.id, 3);
        assert_eq!(client.register_calls(), 2);
    }

    #[tokio::test]
    async fn scripted_sync_repeats_the_last_answer_once_dry() {
        let client = ScriptedLookupClient::new();
        let sync = DelegationSync {
            active: true,
            delegations: vec![TrixelDelegation {
                trixel: TrixelId::from_raw(9).unwrap(),
                exclude: false,
            }],
        };
        client.push_sync(Ok(sync.clone()));

        assert_eq!(client.sync_delegation(3, "t").await.unwrap(), sync);
        assert_eq!(client.sync_delegation(3, "t").await.unwrap(), sync);
        assert_eq!(client.sync_calls(), 2);
    }
}
