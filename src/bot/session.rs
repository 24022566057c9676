//! Ephemeral per-user conversation state.
//!
//! Each admin user has at most one tagged state (pending image, pending
//! video, or an active edit session) plus an independent consume-once
//! next-type hint. Every entry carries an explicit deadline; expired
//! entries are dropped lazily on access. Keys are never contended across
//! users, and same-user races are accepted last-writer-wins.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::bot::commands::PostType;
use crate::bot::vision::VisionPost;

pub const TTL_PENDING: Duration = Duration::from_secs(20 * 60);
pub const TTL_EDITING: Duration = Duration::from_secs(30 * 60);
pub const TTL_NEXT_TYPE: Duration = Duration::from_secs(30 * 60);

/// An image waiting for a destination confirmation or a text body.
#[derive(Debug, Clone)]
pub struct PendingImage {
    pub image_src: String,
    pub forced_type: Option<PostType>,
    /// Vision classification result, when the image was small enough to
    /// classify and the call succeeded.
    pub generated: Option<VisionPost>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoStage {
    AwaitPoster,
    AwaitText,
}

/// A stored video waiting for its poster image and then a text body.
#[derive(Debug, Clone)]
pub struct PendingVideo {
    pub stage: VideoStage,
    pub video_key: String,
    pub poster_key: Option<String>,
    pub video_message_id: String,
}

/// An open edit session referencing an existing post.
#[derive(Debug, Clone)]
pub struct EditingSession {
    pub id: i64,
    pub post_type: PostType,
}

#[derive(Debug, Clone)]
pub enum UserState {
    PendingImage(PendingImage),
    PendingVideo(PendingVideo),
    Editing(EditingSession),
}

struct Expiring<T> {
    value: T,
    deadline: Instant,
}

/// Keyed, TTL-bound session store.
pub struct SessionStore {
    states: Mutex<HashMap<String, Expiring<UserState>>>,
    next_type: Mutex<HashMap<String, Expiring<PostType>>>,
    ttl_pending: Duration,
    ttl_editing: Duration,
    ttl_next_type: Duration,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::with_ttls(TTL_PENDING, TTL_EDITING, TTL_NEXT_TYPE)
    }

    pub fn with_ttls(pending: Duration, editing: Duration, next_type: Duration) -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            next_type: Mutex::new(HashMap::new()),
            ttl_pending: pending,
            ttl_editing: editing,
            ttl_next_type: next_type,
        }
    }

    fn ttl_for(&self, state: &UserState) -> Duration {
        match state {
            UserState::Editing(_) => self.ttl_editing,
            _ => self.ttl_pending,
        }
    }

    /// Current state for a user, dropping it first if expired.
    pub fn state(&self, user_id: &str) -> Option<UserState> {
        let mut states = self.states.lock().unwrap();
        match states.get(user_id) {
            Some(e) if e.deadline > Instant::now() => Some(e.value.clone()),
            Some(_) => {
                states.remove(user_id);
                None
            }
            None => None,
        }
    }

    /// Replace the user's state; the TTL restarts from now.
    pub fn set_state(&self, user_id: &str, state: UserState) {
        let deadline = Instant::now() + self.ttl_for(&state);
        self.states
            .lock()
            .unwrap()
            .insert(user_id.to_string(), Expiring { value: state, deadline });
    }

    pub fn clear_state(&self, user_id: &str) {
        self.states.lock().unwrap().remove(user_id);
    }

    /// Consume the user's state if it is a pending image.
    pub fn take_pending_image(&self, user_id: &str) -> Option<PendingImage> {
        match self.state(user_id) {
            Some(UserState::PendingImage(p)) => {
                self.clear_state(user_id);
                Some(p)
            }
            _ => None,
        }
    }

    pub fn set_next_type(&self, user_id: &str, post_type: PostType) {
        let deadline = Instant::now() + self.ttl_next_type;
        self.next_type
            .lock()
            .unwrap()
            .insert(user_id.to_string(), Expiring { value: post_type, deadline });
    }

    /// Consume the next-type hint, if one is set and still fresh.
    pub fn take_next_type(&self, user_id: &str) -> Option<PostType> {
        let mut hints = self.next_type.lock().unwrap();
        let entry = hints.remove(user_id)?;
        if entry.deadline > Instant::now() {
            Some(entry.value)
        } else {
            None
        }
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}
