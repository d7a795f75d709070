//! In-memory stand-ins for the API server used by the integration tests.
#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::marker::PhantomData;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use converge_core::JsonPatch;
use converge_ops::{AccessReviewer, Clock, ObjectApi};
use futures::future::BoxFuture;
use k8s_openapi::api::authorization::v1::ResourceAttributes;
use kube::api::PropagationPolicy;
use kube::error::ErrorResponse;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};

pub fn api_error(code: u16, reason: &str, message: &str) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".into(),
        message: message.into(),
        reason: reason.into(),
        code,
    })
}

pub fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

type Validator = Box<dyn Fn(&str, &Value, &Value) -> Option<kube::Error> + Send>;

struct Failure {
    verb: &'static str,
    code: u16,
    reason: String,
    message: String,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<String, Value>,
    rv: u64,
    calls: Vec<&'static str>,
    failures: VecDeque<Failure>,
    racy_gets: u32,
    deletes: Vec<(String, PropagationPolicy)>,
    field_managers: Vec<String>,
}

/// Single-collection store with resourceVersion compare-and-swap.
pub struct FakeApi<K> {
    kind: &'static str,
    state: Mutex<State>,
    validator: Mutex<Option<Validator>>,
    _kind: PhantomData<fn() -> K>,
}

impl<K: Serialize + DeserializeOwned> FakeApi<K> {
    pub fn new(kind: &'static str) -> Self {
        Self { kind, state: Mutex::new(State::default()), validator: Mutex::new(None), _kind: PhantomData }
    }

    /// Store `obj` as if another client had created it.
    pub fn seed(&self, obj: &K) -> K {
        let mut st = self.state.lock().unwrap();
        let mut v = serde_json::to_value(obj).unwrap();
        let name = v["metadata"]["name"].as_str().unwrap().to_string();
        stamp_server_fields(&mut st, &mut v, None);
        st.objects.insert(name, v.clone());
        serde_json::from_value(v).unwrap()
    }

    pub fn stored(&self, name: &str) -> Option<K> {
        let st = self.state.lock().unwrap();
        st.objects.get(name).map(|v| serde_json::from_value(v.clone()).unwrap())
    }

    pub fn names(&self) -> Vec<String> { self.state.lock().unwrap().objects.keys().cloned().collect() }

    pub fn calls(&self) -> Vec<&'static str> { self.state.lock().unwrap().calls.clone() }

    pub fn count(&self, verb: &str) -> usize { self.calls().iter().filter(|c| **c == verb).count() }

    pub fn writes(&self) -> usize {
        self.calls().iter().filter(|c| !matches!(**c, "get")).count()
    }

    pub fn deletes(&self) -> Vec<(String, PropagationPolicy)> { self.state.lock().unwrap().deletes.clone() }

    pub fn field_managers(&self) -> Vec<String> { self.state.lock().unwrap().field_managers.clone() }

    /// Fail the next call of `verb` with the given status.
    pub fn fail_next(&self, verb: &'static str, code: u16, reason: &str, message: &str) {
        self.state.lock().unwrap().failures.push_back(Failure {
            verb,
            code,
            reason: reason.into(),
            message: message.into(),
        });
    }

    /// The next `n` reads are each followed by a concurrent write bumping
    /// the object's resourceVersion.
    pub fn race_next_gets(&self, n: u32) { self.state.lock().unwrap().racy_gets = n; }

    /// Reject replaces for which `f(name, old, new)` returns an error.
    pub fn validate_with(&self, f: impl Fn(&str, &Value, &Value) -> Option<kube::Error> + Send + 'static) {
        *self.validator.lock().unwrap() = Some(Box::new(f));
    }

    fn begin(&self, verb: &'static str) -> Result<std::sync::MutexGuard<'_, State>, kube::Error> {
        let mut st = self.state.lock().unwrap();
        st.calls.push(verb);
        if let Some(pos) = st.failures.iter().position(|f| f.verb == verb) {
            let f = st.failures.remove(pos).unwrap();
            return Err(api_error(f.code, &f.reason, &f.message));
        }
        Ok(st)
    }

    fn not_found(&self, name: &str) -> kube::Error {
        api_error(404, "NotFound", &format!("{} {:?} not found", self.kind, name))
    }

    fn decode(v: &Value) -> Result<K, kube::Error> { serde_json::from_value(v.clone()).map_err(kube::Error::SerdeError) }
}

fn stamp_server_fields(st: &mut State, v: &mut Value, previous: Option<&Value>) {
    st.rv += 1;
    let meta = &mut v["metadata"];
    meta["resourceVersion"] = json!(st.rv.to_string());
    match previous {
        Some(prev) => {
            meta["uid"] = prev["metadata"]["uid"].clone();
            meta["creationTimestamp"] = prev["metadata"]["creationTimestamp"].clone();
        }
        None => {
            meta["uid"] = json!(format!("uid-{}", st.rv));
            meta["creationTimestamp"] = json!("2024-01-01T00:00:00Z");
        }
    }
}

#[async_trait]
impl<K> ObjectApi<K> for FakeApi<K>
where
    K: Serialize + DeserializeOwned + Send + Sync,
{
    async fn get(&self, name: &str) -> Result<K, kube::Error> {
        let mut st = self.begin("get")?;
        let Some(current) = st.objects.get(name).cloned() else { return Err(self.not_found(name)) };
        if st.racy_gets > 0 {
            st.racy_gets -= 1;
            let mut bumped = current.clone();
            stamp_server_fields(&mut st, &mut bumped, Some(&current));
            st.objects.insert(name.to_string(), bumped);
        }
        Self::decode(&current)
    }

    async fn create(&self, obj: &K) -> Result<K, kube::Error> {
        let mut st = self.begin("create")?;
        let mut v = serde_json::to_value(obj).map_err(kube::Error::SerdeError)?;
        let mut name = v["metadata"]["name"].as_str().unwrap_or_default().to_string();
        if name.is_empty() {
            let prefix = v["metadata"]["generateName"].as_str().unwrap_or_default().to_string();
            if prefix.is_empty() {
                return Err(api_error(422, "Invalid", &format!("{} is invalid: metadata.name: Required value", self.kind)));
            }
            name = format!("{}{}", prefix, st.rv + 1);
            v["metadata"]["name"] = json!(name);
        }
        if st.objects.contains_key(&name) {
            return Err(api_error(409, "AlreadyExists", &format!("{} {:?} already exists", self.kind, name)));
        }
        stamp_server_fields(&mut st, &mut v, None);
        st.objects.insert(name, v.clone());
        Self::decode(&v)
    }

    async fn replace(&self, name: &str, obj: &K) -> Result<K, kube::Error> {
        let mut st = self.begin("replace")?;
        let Some(current) = st.objects.get(name).cloned() else { return Err(self.not_found(name)) };
        let mut v = serde_json::to_value(obj).map_err(kube::Error::SerdeError)?;
        if let Some(rv) = v["metadata"]["resourceVersion"].as_str() {
            if Some(rv) != current["metadata"]["resourceVersion"].as_str() {
                return Err(api_error(
                    409,
                    "Conflict",
                    &format!("Operation cannot be fulfilled on {} {:?}: the object has been modified", self.kind, name),
                ));
            }
        }
        if let Some(validate) = self.validator.lock().unwrap().as_ref() {
            if let Some(err) = validate(name, &current, &v) {
                return Err(err);
            }
        }
        stamp_server_fields(&mut st, &mut v, Some(&current));
        st.objects.insert(name.to_string(), v.clone());
        Self::decode(&v)
    }

    async fn patch_json(&self, name: &str, patch: &JsonPatch) -> Result<K, kube::Error> {
        let mut st = self.begin("patch_json")?;
        let Some(current) = st.objects.get(name).cloned() else { return Err(self.not_found(name)) };
        let mut next = current.clone();
        let ops = serde_json::to_value(patch).map_err(kube::Error::SerdeError)?;
        let ops: json_patch::Patch = serde_json::from_value(ops).map_err(kube::Error::SerdeError)?;
        json_patch::patch(&mut next, &ops.0).map_err(|e| api_error(422, "Invalid", &e.to_string()))?;
        stamp_server_fields(&mut st, &mut next, Some(&current));
        st.objects.insert(name.to_string(), next.clone());
        Self::decode(&next)
    }

    async fn patch_labels(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
        field_manager: &str,
    ) -> Result<K, kube::Error> {
        let mut st = self.begin("patch_labels")?;
        let Some(current) = st.objects.get(name).cloned() else { return Err(self.not_found(name)) };
        st.field_managers.push(field_manager.to_string());
        let mut next = current.clone();
        if !next["metadata"]["labels"].is_object() {
            next["metadata"]["labels"] = json!({});
        }
        for (k, v) in labels {
            next["metadata"]["labels"][k] = json!(v);
        }
        stamp_server_fields(&mut st, &mut next, Some(&current));
        st.objects.insert(name.to_string(), next.clone());
        Self::decode(&next)
    }

    async fn delete(&self, name: &str, propagation: PropagationPolicy) -> Result<(), kube::Error> {
        let mut st = self.begin("delete")?;
        if st.objects.remove(name).is_none() {
            return Err(self.not_found(name));
        }
        st.deletes.push((name.to_string(), propagation));
        Ok(())
    }
}

/// Clock that never waits and records the requested delays.
#[derive(Debug, Default)]
pub struct InstantClock {
    pub delays: Mutex<Vec<Duration>>,
}

impl InstantClock {
    pub fn delays(&self) -> Vec<Duration> { self.delays.lock().unwrap().clone() }
}

impl Clock for InstantClock {
    fn sleep(&self, d: Duration) -> BoxFuture<'static, ()> {
        self.delays.lock().unwrap().push(d);
        Box::pin(async {})
    }
}

/// Clock whose sleeps never finish.
#[derive(Debug, Default)]
pub struct StuckClock;

impl Clock for StuckClock {
    fn sleep(&self, _d: Duration) -> BoxFuture<'static, ()> { Box::pin(futures::future::pending()) }
}

/// Reviewer that denies whatever `deny` matches and records every review.
pub struct FakeReviewer {
    deny: Box<dyn Fn(&ResourceAttributes) -> bool + Send + Sync>,
    fail_at: Option<usize>,
    pub reviews: Mutex<Vec<ResourceAttributes>>,
}

impl FakeReviewer {
    pub fn new(deny: impl Fn(&ResourceAttributes) -> bool + Send + Sync + 'static) -> Self {
        Self { deny: Box::new(deny), fail_at: None, reviews: Mutex::new(Vec::new()) }
    }

    pub fn allow_all() -> Self { Self::new(|_| false) }

    /// The review with this zero-based index fails with a server error.
    pub fn failing_at(mut self, n: usize) -> Self {
        self.fail_at = Some(n);
        self
    }

    pub fn reviews(&self) -> Vec<ResourceAttributes> { self.reviews.lock().unwrap().clone() }
}

#[async_trait]
impl AccessReviewer for FakeReviewer {
    async fn review(&self, attributes: ResourceAttributes) -> Result<bool, kube::Error> {
        let mut reviews = self.reviews.lock().unwrap();
        if self.fail_at == Some(reviews.len()) {
            return Err(api_error(500, "InternalError", "etcdserver: request timed out"));
        }
        let denied = (self.deny)(&attributes);
        reviews.push(attributes);
        Ok(!denied)
    }
}
