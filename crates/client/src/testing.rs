//! Scripted delta source for unit tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use stringboot_core::{DeltaRequest, DeltaResponse, Error};
use tokio::sync::Notify;

use crate::remote::DeltaSource;

/// Holds one fetch until released.
pub struct Gate(Arc<Notify>);

impl Gate {
    pub fn release(&self) {
        self.0.notify_one();
    }
}

#[derive(Default)]
struct Script {
    responses: VecDeque<Result<DeltaResponse, Error>>,
    requests: Vec<DeltaRequest>,
    gate: Option<Arc<Notify>>,
}

/// Replays queued responses in order and records every request.
#[derive(Default)]
pub struct ScriptedSource {
    script: Mutex<Script>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, response: DeltaResponse) {
        self.script.lock().unwrap().responses.push_back(Ok(response));
    }

    pub fn fail(&self, error: Error) {
        self.script.lock().unwrap().responses.push_back(Err(error));
    }

    /// Block the next fetch after it has taken its response.
    pub fn hold(&self) -> Gate {
        let notify = Arc::new(Notify::new());
        self.script.lock().unwrap().gate = Some(Arc::clone(&notify));
        Gate(notify)
    }

    pub fn requests(&self) -> Vec<DeltaRequest> {
        self.script.lock().unwrap().requests.clone()
    }

    pub async fn wait_for_requests(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.requests().len() < count {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
    }
}

#[async_trait]
impl DeltaSource for ScriptedSource {
    async fn fetch_delta(&self, request: &DeltaRequest) -> Result<DeltaResponse, Error> {
        let (response, gate) = {
            let mut script = self.script.lock().unwrap();
            script.requests.push(request.clone());
            let response = script
                .responses
                .pop_front()
                .unwrap_or_else(|| Err(Error::NetworkFailure("no scripted response".into())));
            (response, script.gate.take())
        };

        if let Some(gate) = gate {
            gate.notified().await;
        }
        response
    }
}
