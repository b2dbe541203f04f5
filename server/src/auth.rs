//! Challenge/response authentication bookkeeping
//!
//! The master never does the cryptography itself. An [`Authenticator`]
//! turns a user's public key record into a challenge string plus an opaque
//! answer, and later checks a client's response against that answer. This
//! module only tracks which challenges a session has outstanding, throttles
//! requests and expires old ones.

use crate::config::Limits;
use log::info;
use protocol::Reply;
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub name: String,
    pub pubkey: String,
}

impl UserRecord {
    pub fn new(name: &str, pubkey: &str) -> Self {
        Self {
            name: name.to_string(),
            pubkey: pubkey.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct UserTable {
    users: HashMap<String, UserRecord>,
}

impl UserTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the record for `user.name`.
    pub fn insert(&mut self, user: UserRecord) {
        self.users.insert(user.name.clone(), user);
    }

    pub fn get(&self, name: &str) -> Option<&UserRecord> {
        self.users.get(name)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

/// Whatever the authenticator needs to check a response later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeAnswer(pub Vec<u8>);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedChallenge {
    pub challenge: String,
    pub answer: ChallengeAnswer,
}

pub trait Authenticator: Send {
    /// Creates a challenge for `user`, or `None` if the key is unusable.
    fn issue(&mut self, user: &UserRecord) -> Option<IssuedChallenge>;

    fn verify(&self, answer: &ChallengeAnswer, response: &str) -> bool;
}

#[derive(Debug, Clone)]
struct PendingAuth {
    id: u32,
    issued_at: u64,
    answer: ChallengeAnswer,
}

/// Outstanding challenges of one session, oldest first.
#[derive(Debug, Default)]
pub struct AuthState {
    pending: VecDeque<PendingAuth>,
    last_request: Option<u64>,
}

impl AuthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, id: u32) -> bool {
        self.pending.iter().any(|auth| auth.id == id)
    }

    /// Drops challenges older than `auth_time_ms`, failing each one.
    pub fn purge_expired(&mut self, now: u64, limits: &Limits) -> Vec<Reply> {
        let mut replies = Vec::new();
        self.pending.retain(|auth| {
            let expired = now.saturating_sub(auth.issued_at) > limits.auth_time_ms;
            if expired {
                replies.push(Reply::FailAuth(auth.id));
            }
            !expired
        });
        replies
    }

    /// Handles `reqauth`. Requests arriving faster than `auth_throttle_ms`
    /// are dropped without a reply.
    pub fn request(
        &mut self,
        id: u32,
        name: &str,
        now: u64,
        limits: &Limits,
        users: &UserTable,
        authenticator: Option<&mut (dyn Authenticator + 'static)>,
    ) -> Vec<Reply> {
        if let Some(last) = self.last_request {
            if now.saturating_sub(last) < limits.auth_throttle_ms {
                return Vec::new();
            }
        }
        self.last_request = Some(now);

        let mut replies = self.purge_expired(now, limits);

        let issued = users
            .get(name)
            .zip(authenticator)
            .and_then(|(user, authenticator)| authenticator.issue(user));
        let Some(issued) = issued else {
            replies.push(Reply::FailAuth(id));
            return replies;
        };

        while !self.pending.is_empty() && self.pending.len() >= limits.auth_limit {
            if let Some(oldest) = self.pending.pop_front() {
                replies.push(Reply::FailAuth(oldest.id));
            }
        }

        self.pending.push_back(PendingAuth {
            id,
            issued_at: now,
            answer: issued.answer,
        });
        replies.push(Reply::ChalAuth {
            id,
            challenge: issued.challenge,
        });
        replies
    }

    /// Handles `confauth`. The matching challenge is consumed either way.
    pub fn confirm(
        &mut self,
        id: u32,
        value: &str,
        now: u64,
        limits: &Limits,
        authenticator: Option<&(dyn Authenticator + 'static)>,
    ) -> Vec<Reply> {
        let mut replies = self.purge_expired(now, limits);

        let pending = self
            .pending
            .iter()
            .position(|auth| auth.id == id)
            .and_then(|index| self.pending.remove(index));

        let verified = match (pending, authenticator) {
            (Some(pending), Some(authenticator)) => authenticator.verify(&pending.answer, value),
            _ => false,
        };

        if verified {
            info!("Auth request {} succeeded", id);
            replies.push(Reply::SuccAuth(id));
        } else {
            replies.push(Reply::FailAuth(id));
        }
        replies
    }
}
