// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Pairing: one-shot exchange of a daemon token with a panel.
//!
//! `axis pair` prints a 6-digit code. The panel posts that code; the local
//! operator is asked to accept, and on acceptance a fresh token pair is
//! persisted and returned. A code pairs at most one panel.

use rand::Rng;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{info, warn};

use crate::auth::{constant_time_eq, issue_node_token, IssuedToken};
use crate::error::Result;
use crate::protocol::{PairRequest, PairResponse};

pub const PROMPT_TIMEOUT: Duration = Duration::from_secs(90);
pub const CODE_TTL: Duration = Duration::from_secs(15 * 60);

/// Question put to the operator; answer `true` to accept
pub struct PairPrompt {
    pub panel_url: String,
    pub reply: oneshot::Sender<bool>,
}

type PersistFn = Box<dyn Fn(&IssuedToken, &str) -> Result<()> + Send + Sync>;

struct PairState {
    active: bool,
    code: String,
    expires_at: Instant,
    /// A prompt is on screen
    pending: bool,
}

pub struct Pairing {
    state: Mutex<PairState>,
    prompts: mpsc::Sender<PairPrompt>,
    persist: PersistFn,
    prompt_timeout: Duration,
    finished: Notify,
}

pub fn generate_code() -> String {
    format!("{:06}", rand::thread_rng().gen_range(0..1_000_000u32))
}

impl Pairing {
    pub fn new(
        code: String,
        ttl: Duration,
        persist: impl Fn(&IssuedToken, &str) -> Result<()> + Send + Sync + 'static,
    ) -> (Self, mpsc::Receiver<PairPrompt>) {
        let (tx, rx) = mpsc::channel(1);
        let pairing = Self {
            state: Mutex::new(PairState { active: true, code, expires_at: Instant::now() + ttl, pending: false }),
            prompts: tx,
            persist: Box::new(persist),
            prompt_timeout: PROMPT_TIMEOUT,
            finished: Notify::new(),
        };
        (pairing, rx)
    }

    pub fn code(&self) -> String {
        self.lock().code.clone()
    }

    pub fn is_active(&self) -> bool {
        let s = self.lock();
        s.active && Instant::now() < s.expires_at
    }

    /// Resolves once a panel has been paired
    pub async fn finished(&self) {
        self.finished.notified().await
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PairState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub async fn handle(&self, req: &PairRequest) -> PairResponse {
        {
            let mut s = self.lock();
            if !s.active || Instant::now() >= s.expires_at {
                return PairResponse::rejected("Pairing mode is not active");
            }
            if !constant_time_eq(req.code.trim(), &s.code) {
                warn!("Pairing attempt from {} with a wrong code", req.panel_url);
                return PairResponse::rejected("Invalid pairing code");
            }
            if s.pending {
                return PairResponse::rejected("Another pairing request is awaiting confirmation");
            }
            s.pending = true;
        }

        let outcome = self.ask_operator(&req.panel_url).await;
        let response = match outcome {
            Some(true) => self.accept(&req.panel_url),
            Some(false) => {
                info!("Pairing with {} rejected by operator", req.panel_url);
                PairResponse::rejected("Pairing rejected by user")
            }
            None => {
                warn!("Pairing request from {} timed out", req.panel_url);
                PairResponse::rejected("Pairing request timed out")
            }
        };
        self.lock().pending = false;
        response
    }

    /// `None` on timeout or when nobody is listening for prompts
    async fn ask_operator(&self, panel_url: &str) -> Option<bool> {
        let (tx, rx) = oneshot::channel();
        let prompt = PairPrompt { panel_url: panel_url.to_string(), reply: tx };
        if self.prompts.send(prompt).await.is_err() {
            return None;
        }
        match tokio::time::timeout(self.prompt_timeout, rx).await {
            Ok(Ok(answer)) => Some(answer),
            _ => None,
        }
    }

    fn accept(&self, panel_url: &str) -> PairResponse {
        let issued = issue_node_token();
        if let Err(e) = (self.persist)(&issued, panel_url) {
            warn!("Could not persist pairing token: {}", e);
            return PairResponse::rejected("Could not save pairing token");
        }
        self.lock().active = false;
        self.finished.notify_one();
        info!("Paired with panel {} (token id {})", panel_url, issued.token_id);
        PairResponse {
            success: true,
            token_id: Some(issued.token_id),
            token: Some(issued.token),
            error: None,
        }
    }
}
