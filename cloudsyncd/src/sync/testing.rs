//! Scripted transport shared by the pipeline and engine tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use cloudsync_core::{Event, Method, Request, Transport};

#[derive(Debug, Clone)]
pub struct Performed {
    pub request_id: String,
    pub method: Method,
    pub path: String,
    pub started: Instant,
    pub finished: Instant,
}

#[derive(Debug, Clone)]
struct Scripted {
    status: u16,
    headers: Vec<(String, String)>,
}

#[derive(Default)]
struct Shared {
    responses: Mutex<HashMap<String, VecDeque<Scripted>>>,
    delays: Mutex<HashMap<String, Duration>>,
    live: Mutex<Vec<String>>,
    started: Mutex<Vec<String>>,
    performed: Mutex<Vec<Performed>>,
    hang: Mutex<bool>,
}

/// Clones share one script and one log.
#[derive(Clone, Default)]
pub struct MockTransport {
    shared: Arc<Shared>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a status for the next request to `path`; unscripted requests
    /// get the usual success status for their method.
    pub fn respond(&self, path: &str, status: u16) {
        self.respond_with_header(path, status, None);
    }

    pub fn respond_with_header(&self, path: &str, status: u16, header: Option<(&str, &str)>) {
        let headers = header
            .map(|(name, value)| vec![(name.to_string(), value.to_string())])
            .unwrap_or_default();
        self.shared
            .responses
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .push_back(Scripted { status, headers });
    }

    pub fn delay(&self, path: &str, delay: Duration) {
        self.shared
            .delays
            .lock()
            .unwrap()
            .insert(path.to_string(), delay);
    }

    /// Requests started from now on never complete.
    pub fn hang(&self) {
        *self.shared.hang.lock().unwrap() = true;
    }

    pub fn set_live(&self, request_ids: Vec<String>) {
        *self.shared.live.lock().unwrap() = request_ids;
    }

    pub fn started(&self) -> Vec<String> {
        self.shared.started.lock().unwrap().clone()
    }

    pub fn performed(&self) -> Vec<Performed> {
        self.shared.performed.lock().unwrap().clone()
    }

    pub fn performed_paths(&self) -> Vec<String> {
        self.performed()
            .into_iter()
            .map(|performed| performed.path)
            .collect()
    }

    fn default_status(method: Method) -> u16 {
        match method {
            Method::Put | Method::Mkcol | Method::Copy | Method::Move => 201,
            Method::Delete => 204,
            Method::Proppatch => 207,
            _ => 200,
        }
    }
}

impl Transport for MockTransport {
    async fn perform(&self, request: Request) -> Event {
        let path = request.url.path().to_string();
        let started = Instant::now();
        self.shared
            .started
            .lock()
            .unwrap()
            .push(request.request_id.clone());

        let hang = *self.shared.hang.lock().unwrap();
        if hang {
            std::future::pending::<()>().await;
        }
        let delay = self.shared.delays.lock().unwrap().get(&path).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self
            .shared
            .responses
            .lock()
            .unwrap()
            .get_mut(&path)
            .and_then(VecDeque::pop_front);
        let scripted = scripted.unwrap_or(Scripted {
            status: Self::default_status(request.method),
            headers: Vec::new(),
        });
        let mut event = Event::response(&request.request_id, scripted.status);
        for (name, value) in &scripted.headers {
            event = event.with_header(name, value.clone());
        }

        self.shared.performed.lock().unwrap().push(Performed {
            request_id: request.request_id.clone(),
            method: request.method,
            path,
            started,
            finished: Instant::now(),
        });
        event
    }

    async fn live_request_ids(&self) -> Vec<String> {
        self.shared.live.lock().unwrap().clone()
    }

    async fn await_live(&self, request_id: String) -> Option<Event> {
        let live = self.shared.live.lock().unwrap().contains(&request_id);
        live.then(|| Event::response(request_id, 200))
    }
}
