//! Lease, allocation request and reservation types

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::{AutobotError, AutobotResult};

/// Unique lease identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseId(pub Uuid);

impl LeaseId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LeaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LeaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for LeaseId {
    type Err = AutobotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(LeaseId)
            .map_err(|e| AutobotError::InvalidRequest(format!("invalid lease id '{}': {}", s, e)))
    }
}

/// Longest TTL a lease may carry (366 days)
pub const MAX_TTL_SECS: u64 = 366 * 86400;

/// How long a lease lives without renewal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseTtl {
    /// Expires this many seconds after creation or last renewal
    Seconds(u64),
    /// Never expires on its own; must be released
    Manual,
}

impl LeaseTtl {
    /// Reject zero and anything longer than [`MAX_TTL_SECS`]
    pub fn validate(&self) -> AutobotResult<()> {
        match self {
            LeaseTtl::Seconds(0) => Err(AutobotError::InvalidRequest(
                "ttl must be greater than zero".to_string(),
            )),
            LeaseTtl::Seconds(secs) if *secs > MAX_TTL_SECS => {
                Err(AutobotError::InvalidRequest(format!(
                    "ttl of {}s exceeds the maximum of {}s",
                    secs, MAX_TTL_SECS
                )))
            }
            _ => Ok(()),
        }
    }

    /// Expiry time for a lease (re)started at `from`, `None` for manual leases
    pub fn expiry_from(&self, from: DateTime<Utc>) -> AutobotResult<Option<DateTime<Utc>>> {
        let LeaseTtl::Seconds(secs) = *self else {
            return Ok(None);
        };
        self.validate()?;
        i64::try_from(secs)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|ttl| from.checked_add_signed(ttl))
            .map(Some)
            .ok_or_else(|| {
                AutobotError::InvalidRequest(format!("ttl of {}s is out of range", secs))
            })
    }

    pub fn is_manual(&self) -> bool {
        matches!(self, LeaseTtl::Manual)
    }
}

impl std::fmt::Display for LeaseTtl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeaseTtl::Seconds(secs) => write!(f, "{}s", secs),
            LeaseTtl::Manual => write!(f, "manual"),
        }
    }
}

impl FromStr for LeaseTtl {
    type Err = AutobotError;

    /// Accepts `manual`, a bare number of seconds, or a number with one of
    /// the suffixes `s`, `m`, `h`, `d`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        if s == "manual" {
            return Ok(LeaseTtl::Manual);
        }

        let invalid = || AutobotError::InvalidRequest(format!("invalid ttl '{}'", s));

        let (digits, multiplier) = match s.chars().last() {
            Some('s') => (&s[..s.len() - 1], 1),
            Some('m') => (&s[..s.len() - 1], 60),
            Some('h') => (&s[..s.len() - 1], 3600),
            Some('d') => (&s[..s.len() - 1], 86400),
            Some(c) if c.is_ascii_digit() => (s.as_str(), 1),
            _ => return Err(invalid()),
        };

        let value: u64 = digits.parse().map_err(|_| invalid())?;
        let secs = value.checked_mul(multiplier).ok_or_else(invalid)?;
        let ttl = LeaseTtl::Seconds(secs);
        ttl.validate()?;
        Ok(ttl)
    }
}

/// Lease lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseState {
    Active,
    Released,
    Expired,
}

impl std::fmt::Display for LeaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeaseState::Active => write!(f, "active"),
            LeaseState::Released => write!(f, "released"),
            LeaseState::Expired => write!(f, "expired"),
        }
    }
}

/// One allocation grant over a set of slots on a single node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub id: LeaseId,
    pub node_id: String,
    /// Ascending slot indices
    pub slot_indices: Vec<u32>,
    /// Normalized model of every slot in the lease
    pub model: String,
    pub requester: String,
    pub ttl: LeaseTtl,
    pub state: LeaseState,
    pub created_at: DateTime<Utc>,
    /// `None` for manual leases
    pub expires_at: Option<DateTime<Utc>>,
    /// Set when the lease leaves `Active`
    pub ended_at: Option<DateTime<Utc>>,
}

impl Lease {
    /// Create an active lease starting at `now`
    pub fn new(
        id: LeaseId,
        node_id: String,
        mut slot_indices: Vec<u32>,
        model: String,
        requester: String,
        ttl: LeaseTtl,
        now: DateTime<Utc>,
    ) -> AutobotResult<Self> {
        slot_indices.sort_unstable();
        let expires_at = ttl.expiry_from(now)?;
        Ok(Self {
            id,
            node_id,
            slot_indices,
            model,
            requester,
            ttl,
            state: LeaseState::Active,
            created_at: now,
            expires_at,
            ended_at: None,
        })
    }

    pub fn is_active(&self) -> bool {
        self.state == LeaseState::Active
    }

    /// Whether a sweep at `now` should expire this lease.
    ///
    /// Manual leases only expire when `max_manual` is set and they are older
    /// than it.
    pub fn is_due_at(&self, now: DateTime<Utc>, max_manual: Option<Duration>) -> bool {
        if !self.is_active() {
            return false;
        }
        match (self.expires_at, max_manual) {
            (Some(expires_at), _) => expires_at <= now,
            (None, Some(max)) => self
                .created_at
                .checked_add_signed(max)
                .is_some_and(|cap| cap <= now),
            (None, None) => false,
        }
    }
}

/// Request to reserve `count` slots of `model` on one node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationRequest {
    pub model: String,
    pub count: u32,
    pub requester: String,
    pub ttl: LeaseTtl,
}

impl AllocationRequest {
    pub fn new(model: impl Into<String>, count: u32, requester: impl Into<String>, ttl: LeaseTtl) -> Self {
        Self {
            model: model.into(),
            count,
            requester: requester.into(),
            ttl,
        }
    }

    /// Reject requests that can never be satisfied as written
    pub fn validate(&self) -> AutobotResult<()> {
        if self.count == 0 {
            return Err(AutobotError::InvalidRequest(
                "count must be greater than zero".to_string(),
            ));
        }
        if crate::normalize_model(&self.model).is_empty() {
            return Err(AutobotError::InvalidRequest(
                "model must not be empty".to_string(),
            ));
        }
        self.ttl.validate()
    }
}

/// Successful allocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub node_id: String,
    pub slot_indices: Vec<u32>,
    pub lease_id: LeaseId,
    pub model: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Reservation {
    /// `node:idx,idx,...`
    pub fn to_line(&self) -> String {
        crate::format_reservation_line(&self.node_id, &self.slot_indices)
    }
}

/// Filter for listing leases
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseFilter {
    /// Include released and expired leases
    #[serde(default)]
    pub include_ended: bool,
}
