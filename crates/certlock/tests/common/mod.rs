//! Shared test fixtures: an in-process mutex service speaking the HTTP
//! wire contract, served through wiremock.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use certlock::{MutexServiceClient, MutexServiceLocker};
use parking_lot::Mutex;
use serde_json::json;
use wiremock::matchers::path;
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

pub const API_KEY: &str = "test-api-key";
pub const MUTEX_PATH: &str = "/api/v1/mutex";

#[derive(Debug)]
struct Lease {
    uuid: String,
    expires_at: Instant,
}

/// Stateful fake of the remote mutex service
#[derive(Clone, Default)]
pub struct FakeMutexService {
    leases: Arc<Mutex<HashMap<String, Lease>>>,
    next_uuid: Arc<AtomicUsize>,
    obtain_requests: Arc<AtomicUsize>,
    release_requests: Arc<AtomicUsize>,
}

impl FakeMutexService {
    pub fn obtain_requests(&self) -> usize {
        self.obtain_requests.load(Ordering::SeqCst)
    }

    pub fn release_requests(&self) -> usize {
        self.release_requests.load(Ordering::SeqCst)
    }

    /// Current live owner token of `resource`
    pub fn holder(&self, resource: &str) -> Option<String> {
        let leases = self.leases.lock();
        leases
            .get(resource)
            .filter(|lease| lease.expires_at > Instant::now())
            .map(|lease| lease.uuid.clone())
    }

    fn obtain(&self, params: &HashMap<String, String>) -> ResponseTemplate {
        self.obtain_requests.fetch_add(1, Ordering::SeqCst);

        let (Some(resource), Some(ttl)) = (params.get("resource_name"), params.get("ttl")) else {
            return ResponseTemplate::new(400);
        };
        let Ok(ttl) = ttl.parse::<u64>() else {
            return ResponseTemplate::new(400);
        };

        let now = Instant::now();
        let mut leases = self.leases.lock();
        if leases.get(resource).is_some_and(|lease| lease.expires_at > now) {
            return ResponseTemplate::new(200).set_body_json(json!({"obtained": false, "uuid": ""}));
        }

        let uuid = format!("uuid-{}", self.next_uuid.fetch_add(1, Ordering::SeqCst));
        leases.insert(
            resource.clone(),
            Lease {
                uuid: uuid.clone(),
                expires_at: now + Duration::from_secs(ttl),
            },
        );
        ResponseTemplate::new(200).set_body_json(json!({"obtained": true, "uuid": uuid}))
    }

    fn release(&self, params: &HashMap<String, String>) -> ResponseTemplate {
        self.release_requests.fetch_add(1, Ordering::SeqCst);

        let (Some(resource), Some(uuid)) = (params.get("resource_name"), params.get("uuid")) else {
            return ResponseTemplate::new(400);
        };

        let mut leases = self.leases.lock();
        let released = match leases.get(resource) {
            Some(lease) if lease.uuid == *uuid && lease.expires_at > Instant::now() => {
                leases.remove(resource);
                true
            }
            _ => false,
        };
        ResponseTemplate::new(200).set_body_json(json!({ "released": released }))
    }
}

impl Respond for FakeMutexService {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let params: HashMap<String, String> = request.url.query_pairs().into_owned().collect();
        if params.get("api_key").map(String::as_str) != Some(API_KEY) {
            return ResponseTemplate::new(401);
        }

        match request.method.as_str() {
            "GET" => self.obtain(&params),
            "DELETE" => self.release(&params),
            _ => ResponseTemplate::new(405),
        }
    }
}

/// Start a mock server running a fresh fake mutex service
pub async fn start_mutex_service() -> (MockServer, FakeMutexService) {
    let server = MockServer::start().await;
    let service = FakeMutexService::default();
    Mock::given(path(MUTEX_PATH))
        .respond_with(service.clone())
        .mount(&server)
        .await;
    (server, service)
}

pub fn client_for(server: &MockServer, api_key: &str) -> MutexServiceClient {
    MutexServiceClient::new(&server.uri(), api_key, Duration::from_secs(5)).unwrap()
}

/// A locker against `server`, as a separate process would create it
pub fn locker_for(server: &MockServer, poll_interval: Duration) -> MutexServiceLocker {
    MutexServiceLocker::new(client_for(server, API_KEY)).with_poll_interval(poll_interval)
}
