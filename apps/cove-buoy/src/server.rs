//! Community map and websocket fan-out.
//!
//! One community per id, created by its first joiner and destroyed with its
//! last member. The first joiner's password sets the community verifier; the
//! verifier stored at creation is the one every later join is checked
//! against, and it is never overwritten.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use argon2::password_hash::{rand_core::OsRng, SaltString};
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, Path, Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, timeout_at, Instant};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

struct Community {
    /// PHC-format hash of the first joiner's password.
    verifier: String,
    members: HashMap<String, mpsc::UnboundedSender<Message>>,
}

/// Shared server state: the community map and the heartbeat interval `H`.
///
/// The map mutex is held only across map mutation, never across I/O.
#[derive(Clone)]
pub struct SignalingState {
    communities: Arc<Mutex<HashMap<String, Community>>>,
    next_conn: Arc<AtomicU64>,
    heartbeat: Duration,
}

#[derive(Debug, Deserialize)]
pub struct JoinParams {
    password: Option<String>,
}

impl SignalingState {
    pub fn new(heartbeat: Duration) -> Self {
        Self {
            communities: Arc::new(Mutex::new(HashMap::new())),
            next_conn: Arc::new(AtomicU64::new(0)),
            heartbeat,
        }
    }

    /// Number of live communities. Communities exist only while they have at
    /// least one member.
    pub fn community_count(&self) -> usize {
        self.communities.lock().unwrap().len()
    }

    pub fn member_count(&self, community_id: &str) -> usize {
        self.communities
            .lock()
            .unwrap()
            .get(community_id)
            .map(|c| c.members.len())
            .unwrap_or(0)
    }

    /// Forward one frame to every other member of the community, preserving
    /// the opcode. Best effort per recipient: a full or closed queue is that
    /// recipient's problem, not the sender's.
    fn broadcast_from(&self, community_id: &str, sender_id: &str, message: Message) {
        let communities = self.communities.lock().unwrap();
        let Some(community) = communities.get(community_id) else {
            return;
        };
        for (member_id, tx) in &community.members {
            if member_id == sender_id {
                continue;
            }
            let _ = tx.send(message.clone());
        }
    }

    fn remove_member(&self, community_id: &str, conn_id: &str) {
        let mut communities = self.communities.lock().unwrap();
        if let Some(community) = communities.get_mut(community_id) {
            community.members.remove(conn_id);
            if community.members.is_empty() {
                communities.remove(community_id);
                debug!(community = %community_id, "community removed");
            }
        }
    }

    /// Admit a connection: create the community on first join, verify the
    /// password against the stored verifier otherwise, and register the
    /// member's outbound queue.
    ///
    /// Password hashing and verification run on the blocking pool; the loop
    /// re-checks the map afterwards so a racing create or teardown is handled
    /// without ever holding the lock across the hash.
    async fn admit(
        &self,
        community_id: &str,
        password: &str,
        conn_id: &str,
        tx: &mpsc::UnboundedSender<Message>,
    ) -> bool {
        loop {
            let stored = {
                let communities = self.communities.lock().unwrap();
                communities.get(community_id).map(|c| c.verifier.clone())
            };
            match stored {
                None => {
                    let Some(verifier) = hash_password(password).await else {
                        return false;
                    };
                    let mut communities = self.communities.lock().unwrap();
                    match communities.entry(community_id.to_string()) {
                        std::collections::hash_map::Entry::Vacant(entry) => {
                            let mut members = HashMap::new();
                            members.insert(conn_id.to_string(), tx.clone());
                            entry.insert(Community { verifier, members });
                            info!(community = %community_id, "community created");
                            return true;
                        }
                        // Someone else created it first: verify against theirs.
                        std::collections::hash_map::Entry::Occupied(_) => continue,
                    }
                }
                Some(verifier) => {
                    if !verify_password(password, &verifier).await {
                        return false;
                    }
                    let mut communities = self.communities.lock().unwrap();
                    match communities.get_mut(community_id) {
                        Some(community) if community.verifier == verifier => {
                            community
                                .members
                                .insert(conn_id.to_string(), tx.clone());
                            return true;
                        }
                        // Recreated with a different secret, or gone entirely,
                        // while we were verifying: start over.
                        _ => continue,
                    }
                }
            }
        }
    }
}

async fn hash_password(password: &str) -> Option<String> {
    let password = password.to_string();
    tokio::task::spawn_blocking(move || {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .ok()
    })
    .await
    .ok()
    .flatten()
}

async fn verify_password(password: &str, verifier: &str) -> bool {
    let password = password.to_string();
    let verifier = verifier.to_string();
    tokio::task::spawn_blocking(move || {
        let Ok(parsed) = PasswordHash::new(&verifier) else {
            return false;
        };
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
    })
    .await
    .unwrap_or(false)
}

pub fn router(state: SignalingState) -> Router {
    Router::new()
        .route("/", get(missing_community))
        .route("/*path", get(websocket_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn missing_community() -> Response {
    (StatusCode::BAD_REQUEST, "missing community id").into_response()
}

/// Upgrade handler. The community id is the final non-empty path segment and
/// the password a query parameter; connections missing either are rejected
/// before the upgrade.
pub async fn websocket_handler(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
    Path(path): Path<String>,
    Query(params): Query<JoinParams>,
    State(state): State<SignalingState>,
) -> Response {
    let community_id = path
        .split('/')
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .last()
        .map(str::to_string);
    let Some(community_id) = community_id else {
        return (StatusCode::BAD_REQUEST, "missing community id").into_response();
    };
    let password = params.password.unwrap_or_default();
    if password.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "missing password").into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, community_id, password, state, remote_addr))
}

async fn handle_socket(
    mut socket: WebSocket,
    community_id: String,
    password: String,
    state: SignalingState,
    remote_addr: SocketAddr,
) {
    let conn_id = format!(
        "{}+{}",
        remote_addr,
        state.next_conn.fetch_add(1, Ordering::Relaxed)
    );
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    if !state.admit(&community_id, &password, &conn_id, &tx).await {
        warn!(conn = %conn_id, community = %community_id, "wrong password");
        let _ = socket.send(Message::Close(None)).await;
        return;
    }
    info!(conn = %conn_id, community = %community_id, "peer connected");

    let heartbeat = state.heartbeat;
    let (mut sender, mut receiver) = socket.split();

    // Writer: drains the member queue and pings every H/2. Both carry a write
    // deadline of H; a slow or dead socket terminates only this session.
    let writer_conn = conn_id.clone();
    let mut writer = tokio::spawn(async move {
        let mut pings = interval(heartbeat / 2);
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    let Some(message) = maybe else { break };
                    match timeout(heartbeat, sender.send(message)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            debug!(conn = %writer_conn, error = %err, "write failed");
                            break;
                        }
                        Err(_) => {
                            debug!(conn = %writer_conn, "write deadline exceeded");
                            break;
                        }
                    }
                }
                _ = pings.tick() => {
                    match timeout(heartbeat, sender.send(Message::Ping(Vec::new()))).await {
                        Ok(Ok(())) => {}
                        _ => {
                            debug!(conn = %writer_conn, "ping failed");
                            break;
                        }
                    }
                }
            }
        }
    });

    // Reader: read deadline H, reset only by pongs. Frames are forwarded in
    // arrival order, so per-sender ordering holds for every recipient.
    let mut deadline = Instant::now() + heartbeat;
    loop {
        tokio::select! {
            _ = &mut writer => break,
            result = timeout_at(deadline, receiver.next()) => {
                match result {
                    Err(_) => {
                        debug!(conn = %conn_id, "read deadline exceeded");
                        break;
                    }
                    Ok(None) => break,
                    Ok(Some(Err(err))) => {
                        debug!(conn = %conn_id, error = %err, "read failed");
                        break;
                    }
                    Ok(Some(Ok(message))) => match message {
                        Message::Pong(_) => {
                            deadline = Instant::now() + heartbeat;
                        }
                        Message::Close(_) => break,
                        Message::Ping(_) => {
                            // Answered automatically by the websocket layer.
                        }
                        message @ (Message::Text(_) | Message::Binary(_)) => {
                            state.broadcast_from(&community_id, &conn_id, message);
                        }
                    },
                }
            }
        }
    }

    writer.abort();
    state.remove_member(&community_id, &conn_id);
    info!(conn = %conn_id, community = %community_id, "peer disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn verifier_roundtrip() {
        let hash = hash_password("secret").await.expect("hash");
        assert!(verify_password("secret", &hash).await);
        assert!(!verify_password("wrong", &hash).await);
    }

    #[tokio::test]
    async fn first_joiner_sets_the_secret() {
        let state = SignalingState::new(Duration::from_secs(10));
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(state.admit("c", "pw", "a+0", &tx).await);
        assert!(!state.admit("c", "other", "b+1", &tx).await);
        assert!(state.admit("c", "pw", "b+2", &tx).await);
        assert_eq!(state.member_count("c"), 2);
    }

    #[tokio::test]
    async fn community_lifecycle_follows_membership() {
        let state = SignalingState::new(Duration::from_secs(10));
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(state.admit("c", "pw", "a+0", &tx).await);
        assert_eq!(state.community_count(), 1);
        state.remove_member("c", "a+0");
        assert_eq!(state.community_count(), 0);

        // Gone means gone: a new first joiner sets a new secret.
        assert!(state.admit("c", "different", "a+1", &tx).await);
        assert_eq!(state.community_count(), 1);
    }

    #[tokio::test]
    async fn broadcast_skips_sender() {
        let state = SignalingState::new(Duration::from_secs(10));
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        assert!(state.admit("c", "pw", "a+0", &tx_a).await);
        assert!(state.admit("c", "pw", "b+1", &tx_b).await);

        state.broadcast_from("c", "a+0", Message::Binary(vec![1, 2, 3]));
        assert!(matches!(rx_b.try_recv(), Ok(Message::Binary(b)) if b == vec![1, 2, 3]));
        assert!(rx_a.try_recv().is_err());
    }
}
