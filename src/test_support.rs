//! In-process stand-in for the server, used by unit tests.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::api::{ReplayRequest, ReplayResponse, ReplayTransport};
use crate::db;
use crate::error::ReplayError;
use crate::queue::{ActionQueue, QueuePolicy};

pub(crate) const TEST_BASE_URL: &str = "http://pharm.test";

/// What the fake server does with one request.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Scripted {
    Status(u16),
    Offline,
    /// Never answers; exercises the per-attempt timeout.
    Hang,
}

/// Answers requests from per-URL scripts, falling back to a default, and
/// records every request it sees.
pub(crate) struct ScriptedTransport {
    default: Scripted,
    scripts: Mutex<HashMap<String, VecDeque<Scripted>>>,
    calls: Mutex<Vec<ReplayRequest>>,
}

impl ScriptedTransport {
    pub fn new(default: Scripted) -> Arc<Self> {
        Arc::new(Self {
            default,
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Queue responses for requests to `path` (resolved against the test base URL).
    pub fn script(&self, path: &str, responses: &[Scripted]) {
        let url = format!("{TEST_BASE_URL}{path}");
        self.scripts
            .lock()
            .unwrap()
            .entry(url)
            .or_default()
            .extend(responses.iter().copied());
    }

    pub fn calls(&self) -> Vec<ReplayRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_paths(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .map(|c| c.url.trim_start_matches(TEST_BASE_URL).to_string())
            .collect()
    }
}

#[async_trait]
impl ReplayTransport for ScriptedTransport {
    async fn send(&self, request: &ReplayRequest) -> Result<ReplayResponse, ReplayError> {
        self.calls.lock().unwrap().push(request.clone());
        let next = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&request.url)
            .and_then(VecDeque::pop_front)
            .unwrap_or(self.default);

        match next {
            Scripted::Status(status) => Ok(ReplayResponse {
                status,
                body: String::new(),
            }),
            Scripted::Offline => Err(ReplayError::TransportFailure(format!(
                "Cannot reach server at {}",
                request.url
            ))),
            Scripted::Hang => {
                tokio::time::sleep(Duration::from_secs(3_600)).await;
                Ok(ReplayResponse {
                    status: 200,
                    body: String::new(),
                })
            }
        }
    }
}

pub(crate) fn test_policy() -> QueuePolicy {
    QueuePolicy {
        base_url: TEST_BASE_URL.to_string(),
        ..QueuePolicy::default()
    }
}

/// A queue over a fresh in-memory database.
pub(crate) fn test_queue(transport: Arc<ScriptedTransport>) -> ActionQueue {
    let db = Arc::new(db::open_in_memory().expect("open in-memory db"));
    ActionQueue::new(db, transport, test_policy())
}
