//! Lifecycle state of a certificate intent.
//!
//! Every lifecycle resource (`cert-enrollment`, `cert-distribution`) of a
//! (cert, scope) pair owns one [`StateInfo`] record: an append-only list of
//! actions, each naming the resource tree it produced. [`StateClient`] decides
//! whether a new Instantiate or Terminate may proceed by looking at the status
//! the synchronizer reports for the last tree.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::appcontext::AppContextClient;
use crate::error::Error;
use crate::store::{ResourceStore, StoreError};

const UPDATE_ATTEMPTS: usize = 5;

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum LifecycleState {
    Created,
    Instantiating,
    Instantiated,
    InstantiateFailed,
    Terminating,
    Terminated,
    TerminateFailed,
    Updated,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let message = match self {
            LifecycleState::Created => "Created",
            LifecycleState::Instantiating => "Instantiating",
            LifecycleState::Instantiated => "Instantiated",
            LifecycleState::InstantiateFailed => "InstantiateFailed",
            LifecycleState::Terminating => "Terminating",
            LifecycleState::Terminated => "Terminated",
            LifecycleState::TerminateFailed => "TerminateFailed",
            LifecycleState::Updated => "Updated",
        };
        write!(f, "{}", message)
    }
}

/// Externally requested transition
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Event {
    Instantiate,
    Terminate,
}

/// The two lifecycle resources tracked per certificate intent
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Lifecycle {
    Enrollment,
    Distribution,
}

impl Lifecycle {
    /// App name used both for the StateInfo record and the tree's app node
    pub fn app_name(&self) -> &'static str {
        match self {
            Lifecycle::Enrollment => "cert-enrollment",
            Lifecycle::Distribution => "cert-distribution",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ActionEntry {
    pub state: LifecycleState,
    /// Tree id the action applies to
    pub instance: String,
    pub time: DateTime<Utc>,
    pub revision: u64,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct StateInfo {
    #[serde(default)]
    pub status_ctx_id: String,
    #[serde(default)]
    pub actions: Vec<ActionEntry>,
}

impl StateInfo {
    pub fn last_action(&self) -> Option<&ActionEntry> {
        self.actions.last()
    }

    pub fn last_revision(&self) -> u64 {
        self.actions.last().map_or(0, |a| a.revision)
    }

    /// Tree id of the most recent run, if any
    pub fn status_ctx_id(&self) -> Option<&str> {
        if self.status_ctx_id.is_empty() {
            None
        } else {
            Some(self.status_ctx_id.as_str())
        }
    }

    fn append(&mut self, state: LifecycleState, tree_id: &str) {
        let entry = ActionEntry {
            state,
            instance: tree_id.to_string(),
            time: Utc::now(),
            revision: self.last_revision() + 1,
        };
        self.actions.push(entry);
        self.status_ctx_id = tree_id.to_string();
    }
}

/// Addresses one StateInfo record
pub trait StateKey: Send + Sync {
    fn store_key(&self) -> String;

    /// Human readable name used in error messages
    fn event_name(&self) -> String;
}

/// Result of a successful verification, consumed by [`StateClient::claim`]
#[derive(Clone, PartialEq, Debug)]
pub struct Verification {
    pub last_tree_id: Option<String>,
    /// Store version of the StateInfo observed during verification
    pub version: String,
}

/// The single source of truth for lifecycle state, shared by every scope
#[derive(Clone)]
pub struct StateClient {
    store: Arc<dyn ResourceStore>,
    contexts: AppContextClient,
}

impl StateClient {
    pub fn new(store: Arc<dyn ResourceStore>, contexts: AppContextClient) -> StateClient {
        StateClient { store, contexts }
    }

    async fn load<K: StateKey + ?Sized>(&self, key: &K) -> Result<(StateInfo, String), Error> {
        let record = self
            .store
            .get(&key.store_key())
            .await?
            .ok_or_else(|| Error::not_found(format!("{} has no state info", key.event_name())))?;
        Ok((serde_json::from_value(record.value)?, record.version))
    }

    pub async fn state_info<K: StateKey + ?Sized>(&self, key: &K) -> Result<StateInfo, Error> {
        Ok(self.load(key).await?.0)
    }

    /// Last recorded state, `None` when the lifecycle never ran
    pub async fn current_state<K: StateKey + ?Sized>(
        &self,
        key: &K,
    ) -> Result<Option<LifecycleState>, Error> {
        Ok(self.state_info(key).await?.last_action().map(|a| a.state))
    }

    /// Create an empty StateInfo; done once when the intent is created
    pub async fn create<K: StateKey + ?Sized>(&self, key: &K) -> Result<(), Error> {
        let value = serde_json::to_value(StateInfo::default())?;
        match self.store.create(&key.store_key(), value).await {
            Ok(_) => Ok(()),
            Err(StoreError::AlreadyExists(_)) => Err(Error::conflict(format!(
                "{} state info already exists",
                key.event_name()
            ))),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn delete<K: StateKey + ?Sized>(&self, key: &K) -> Result<(), Error> {
        self.store.delete(&key.store_key()).await?;
        Ok(())
    }

    /// Observe the current record without applying the transition table
    pub async fn observe<K: StateKey + ?Sized>(&self, key: &K) -> Result<Verification, Error> {
        let (info, version) = self.load(key).await?;
        Ok(Verification {
            last_tree_id: info.status_ctx_id().map(String::from),
            version,
        })
    }

    /// Decide whether `event` may proceed given the status of the last tree.
    ///
    /// A Terminated tree is deleted before an Instantiate proceeds. A tree that
    /// no longer exists counts as nothing running.
    pub async fn verify_state<K: StateKey + ?Sized>(
        &self,
        key: &K,
        event: Event,
    ) -> Result<Verification, Error> {
        let (info, version) = self.load(key).await?;
        let name = key.event_name();

        let tree_id = match info.status_ctx_id() {
            Some(id) => id.to_string(),
            None => {
                return Ok(Verification {
                    last_tree_id: None,
                    version,
                })
            }
        };

        let proceed = Verification {
            last_tree_id: Some(tree_id.clone()),
            version,
        };

        let status = match self.contexts.status(&tree_id).await? {
            Some(status) => status,
            None => {
                debug!(tree = %tree_id, "last tree no longer exists");
                return match event {
                    Event::Instantiate => Ok(proceed),
                    Event::Terminate => Err(Error::not_found(format!(
                        "{} has nothing to terminate, tree {} no longer exists",
                        name, tree_id
                    ))),
                };
            }
        };

        match (status, event) {
            (LifecycleState::Terminating, _) => {
                Err(Error::conflict(format!("{} is being terminated", name)))
            }
            (LifecycleState::Instantiating, _) => {
                Err(Error::conflict(format!("{} is in instantiating status", name)))
            }
            (LifecycleState::TerminateFailed, _) => Err(Error::conflict(format!(
                "{} has failed terminating, please delete the {} first",
                name, name
            ))),
            (LifecycleState::Terminated, Event::Instantiate) => {
                info!(tree = %tree_id, "deleting terminated tree before instantiating {}", name);
                self.contexts.delete(&tree_id).await?;
                Ok(proceed)
            }
            (LifecycleState::Terminated, Event::Terminate) => {
                Err(Error::conflict(format!("{} has already been terminated", name)))
            }
            (LifecycleState::Instantiated, Event::Instantiate) => {
                Err(Error::conflict(format!("{} has already been instantiated", name)))
            }
            (LifecycleState::Instantiated, Event::Terminate) => Ok(proceed),
            (LifecycleState::InstantiateFailed, Event::Instantiate) => Err(Error::conflict(
                format!(
                    "{} has failed instantiating before, please terminate and try again",
                    name
                ),
            )),
            (LifecycleState::InstantiateFailed, Event::Terminate) => Ok(proceed),
            (other, _) => Err(Error::conflict(format!(
                "{} is in an unexpected status {}, no action taken",
                name, other
            ))),
        }
    }

    /// Append `state` for `tree_id`, but only if nobody wrote the record since
    /// `verification` was taken.
    pub async fn claim<K: StateKey + ?Sized>(
        &self,
        key: &K,
        verification: &Verification,
        state: LifecycleState,
        tree_id: &str,
    ) -> Result<StateInfo, Error> {
        let (mut info, version) = self.load(key).await?;
        if version != verification.version {
            return Err(Error::conflict(format!(
                "{} was modified by a concurrent request",
                key.event_name()
            )));
        }
        info.append(state, tree_id);
        match self
            .store
            .replace(&key.store_key(), serde_json::to_value(&info)?, &version)
            .await
        {
            Ok(_) => Ok(info),
            Err(StoreError::Conflict(_)) => Err(Error::conflict(format!(
                "{} was modified by a concurrent request",
                key.event_name()
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Append `state` for `tree_id` with the next revision.
    pub async fn update_state<K: StateKey + ?Sized>(
        &self,
        key: &K,
        state: LifecycleState,
        tree_id: &str,
        create_if_not_exists: bool,
    ) -> Result<StateInfo, Error> {
        let store_key = key.store_key();
        for _ in 0..UPDATE_ATTEMPTS {
            let result = match self.store.get(&store_key).await? {
                Some(record) => {
                    let mut info: StateInfo = serde_json::from_value(record.value)?;
                    info.append(state, tree_id);
                    self.store
                        .replace(&store_key, serde_json::to_value(&info)?, &record.version)
                        .await
                        .map(|_| info)
                }
                None if create_if_not_exists => {
                    let mut info = StateInfo::default();
                    info.append(state, tree_id);
                    self.store
                        .create(&store_key, serde_json::to_value(&info)?)
                        .await
                        .map(|_| info)
                }
                None => {
                    return Err(Error::not_found(format!(
                        "{} has no state info",
                        key.event_name()
                    )))
                }
            };
            match result {
                Ok(info) => {
                    debug!(key = %store_key, state = %state, revision = info.last_revision(), "state updated");
                    return Ok(info);
                }
                Err(StoreError::Conflict(_)) | Err(StoreError::AlreadyExists(_)) => {
                    debug!(key = %store_key, "state info changed underneath, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(Error::conflict(format!(
            "{} kept changing while recording {}",
            key.event_name(),
            state
        )))
    }

    /// An intent can be removed once every lifecycle is terminated or never ran
    pub async fn ensure_deletable<K: StateKey + ?Sized>(&self, keys: &[&K]) -> Result<(), Error> {
        for key in keys {
            let state = match self.current_state(*key).await {
                Ok(state) => state,
                Err(Error::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            match state {
                None | Some(LifecycleState::Terminated) => {}
                Some(other) => {
                    return Err(Error::conflict(format!(
                        "{} must be terminated before deletion, current state {}",
                        key.event_name(),
                        other
                    )))
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appcontext::ResourceTree;
    use crate::store::MemoryStore;

    struct TestKey(&'static str);

    impl StateKey for TestKey {
        fn store_key(&self) -> String {
            format!("resources/test/{}/stateInfo", self.0)
        }

        fn event_name(&self) -> String {
            format!("cert-enrollment {}", self.0)
        }
    }

    fn client() -> (StateClient, AppContextClient) {
        let store: Arc<dyn ResourceStore> = Arc::new(MemoryStore::new());
        let contexts = AppContextClient::new(store.clone());
        (StateClient::new(store, contexts.clone()), contexts)
    }

    async fn with_tree(
        state: &StateClient,
        contexts: &AppContextClient,
        key: &TestKey,
        status: LifecycleState,
    ) -> String {
        let tree = ResourceTree::new("tree-1");
        contexts.save(&tree).await.unwrap();
        contexts.set_status(tree.id(), status).await.unwrap();
        state
            .update_state(key, LifecycleState::Instantiated, tree.id(), true)
            .await
            .unwrap();
        tree.id().to_string()
    }

    #[tokio::test]
    async fn missing_state_info_is_not_found() {
        let (state, _) = client();
        let err = state
            .verify_state(&TestKey("ca1"), Event::Instantiate)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn fresh_state_info_allows_instantiate() {
        let (state, _) = client();
        let key = TestKey("ca1");
        state.create(&key).await.unwrap();
        let verification = state.verify_state(&key, Event::Instantiate).await.unwrap();
        assert_eq!(verification.last_tree_id, None);
    }

    #[tokio::test]
    async fn instantiated_tree_rejects_instantiate_and_allows_terminate() {
        let (state, contexts) = client();
        let key = TestKey("ca1");
        let tree = with_tree(&state, &contexts, &key, LifecycleState::Instantiated).await;

        let err = state
            .verify_state(&key, Event::Instantiate)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already been instantiated"));

        let ok = state.verify_state(&key, Event::Terminate).await.unwrap();
        assert_eq!(ok.last_tree_id.as_deref(), Some(tree.as_str()));
    }

    #[tokio::test]
    async fn terminated_tree_is_deleted_before_instantiate() {
        let (state, contexts) = client();
        let key = TestKey("ca1");
        let tree = with_tree(&state, &contexts, &key, LifecycleState::Terminated).await;

        state.verify_state(&key, Event::Instantiate).await.unwrap();
        assert_eq!(contexts.status(&tree).await.unwrap(), None);
        assert!(matches!(
            contexts.load(&tree).await,
            Err(Error::NotFound(_))
        ));

        let err = state.verify_state(&key, Event::Terminate).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn terminated_tree_rejects_terminate() {
        let (state, contexts) = client();
        let key = TestKey("ca1");
        with_tree(&state, &contexts, &key, LifecycleState::Terminated).await;
        let err = state.verify_state(&key, Event::Terminate).await.unwrap_err();
        assert!(err.to_string().contains("already been terminated"));
    }

    #[tokio::test]
    async fn in_flight_and_failed_statuses_follow_the_transition_table() {
        let cases = [
            (LifecycleState::Terminating, Event::Instantiate, Some("being terminated")),
            (LifecycleState::Terminating, Event::Terminate, Some("being terminated")),
            (LifecycleState::Instantiating, Event::Instantiate, Some("instantiating status")),
            (LifecycleState::Instantiating, Event::Terminate, Some("instantiating status")),
            (LifecycleState::TerminateFailed, Event::Instantiate, Some("delete the")),
            (LifecycleState::TerminateFailed, Event::Terminate, Some("delete the")),
            (LifecycleState::InstantiateFailed, Event::Instantiate, Some("terminate and try again")),
            (LifecycleState::InstantiateFailed, Event::Terminate, None),
            (LifecycleState::Created, Event::Instantiate, Some("unexpected status")),
            (LifecycleState::Updated, Event::Terminate, Some("unexpected status")),
        ];

        for (status, event, expected) in cases {
            let (state, contexts) = client();
            let key = TestKey("ca1");
            with_tree(&state, &contexts, &key, status).await;
            let result = state.verify_state(&key, event).await;
            match expected {
                Some(fragment) => {
                    let err = result.unwrap_err();
                    assert!(matches!(err, Error::Conflict(_)), "{:?} {:?}", status, event);
                    assert!(
                        err.to_string().contains(fragment),
                        "{:?} {:?}: {}",
                        status,
                        event,
                        err
                    );
                }
                None => assert!(result.is_ok(), "{:?} {:?}", status, event),
            }
        }
    }

    #[tokio::test]
    async fn revisions_strictly_increase() {
        let (state, _) = client();
        let key = TestKey("ca1");
        state.create(&key).await.unwrap();
        for (i, s) in [
            LifecycleState::Instantiating,
            LifecycleState::Instantiated,
            LifecycleState::Terminating,
            LifecycleState::Terminated,
        ]
        .into_iter()
        .enumerate()
        {
            let info = state.update_state(&key, s, "t1", false).await.unwrap();
            assert_eq!(info.last_revision(), i as u64 + 1);
        }
        let info = state.state_info(&key).await.unwrap();
        let revisions: Vec<u64> = info.actions.iter().map(|a| a.revision).collect();
        assert_eq!(revisions, vec![1, 2, 3, 4]);
        assert_eq!(info.status_ctx_id(), Some("t1"));
    }

    #[tokio::test]
    async fn update_without_record_respects_create_flag() {
        let (state, _) = client();
        let key = TestKey("ca1");
        let err = state
            .update_state(&key, LifecycleState::Instantiated, "t1", false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        let info = state
            .update_state(&key, LifecycleState::Instantiated, "t1", true)
            .await
            .unwrap();
        assert_eq!(info.actions.len(), 1);
        assert_eq!(info.last_revision(), 1);
    }

    #[tokio::test]
    async fn second_concurrent_claim_loses() {
        let (state, _) = client();
        let key = TestKey("ca1");
        state.create(&key).await.unwrap();

        let first = state.verify_state(&key, Event::Instantiate).await.unwrap();
        let second = state.verify_state(&key, Event::Instantiate).await.unwrap();

        state
            .claim(&key, &first, LifecycleState::Instantiating, "t1")
            .await
            .unwrap();
        let err = state
            .claim(&key, &second, LifecycleState::Instantiating, "t2")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        let info = state.state_info(&key).await.unwrap();
        assert_eq!(info.status_ctx_id(), Some("t1"));
        assert_eq!(info.actions.len(), 1);
    }

    #[tokio::test]
    async fn deletion_requires_terminated_lifecycles() {
        let (state, _) = client();
        let enrollment = TestKey("enrollment");
        let distribution = TestKey("distribution");
        state.create(&enrollment).await.unwrap();
        state.create(&distribution).await.unwrap();
        state.ensure_deletable(&[&enrollment, &distribution]).await.unwrap();

        state
            .update_state(&enrollment, LifecycleState::Instantiated, "t1", false)
            .await
            .unwrap();
        assert!(state
            .ensure_deletable(&[&enrollment, &distribution])
            .await
            .is_err());

        state
            .update_state(&enrollment, LifecycleState::Terminated, "t1", false)
            .await
            .unwrap();
        state.ensure_deletable(&[&enrollment, &distribution]).await.unwrap();
    }
}
