//! Staff login throttling and session lifetime.
//!
//! Failed logins are counted per identity in `local_settings` (category
//! `staff`) so a lockout survives a restart. A session ends on whichever
//! limit it crosses first: inactivity, maximum duration, or the optional
//! daily cutoff. Each limit is reported with its own [`TimeoutReason`].

use chrono::{DateTime, Duration, FixedOffset, NaiveTime, Offset, TimeZone, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::db::{self, DbState};
use crate::error::{Result, SyncError};
use crate::events::{EventBus, SyncEvent, TimeoutReason};

const STAFF_CATEGORY: &str = "staff";
const DEFAULT_IDENTITY: &str = "terminal";

/// Checks a secret against whatever credential store backs the terminal.
pub trait CredentialVerifier: Send + Sync {
    fn verify(&self, identity: &str, secret: &str) -> Result<bool>;
}

/// PIN hashes kept in `local_settings` under `staff/pin_hash:<identity>`.
pub struct BcryptVerifier {
    db: Arc<DbState>,
    cost: u32,
}

impl BcryptVerifier {
    pub fn new(db: Arc<DbState>) -> Self {
        Self {
            db,
            cost: bcrypt::DEFAULT_COST,
        }
    }

    pub fn with_cost(mut self, cost: u32) -> Self {
        self.cost = cost;
        self
    }

    /// Hash and store the PIN for `identity`. PINs are at least 4 digits.
    pub fn set_pin(&self, identity: &str, pin: &str) -> Result<()> {
        if pin.len() < 4 || !pin.chars().all(|c| c.is_ascii_digit()) {
            return Err(SyncError::InvalidPayload(
                "PIN must be at least 4 digits".into(),
            ));
        }
        let hash = bcrypt::hash(pin, self.cost)
            .map_err(|e| SyncError::Config(format!("failed to hash PIN: {e}")))?;
        let conn = self.db.lock()?;
        db::set_setting(&conn, STAFF_CATEGORY, &pin_key(identity), &hash)?;
        info!(identity = %identity, "PIN set");
        Ok(())
    }
}

impl CredentialVerifier for BcryptVerifier {
    fn verify(&self, identity: &str, secret: &str) -> Result<bool> {
        let hash = {
            let conn = self.db.lock()?;
            db::get_setting(&conn, STAFF_CATEGORY, &pin_key(identity))
        };
        let Some(hash) = hash else {
            debug!(identity = %identity, "no PIN configured");
            return Ok(false);
        };
        Ok(bcrypt::verify(secret, &hash).unwrap_or_else(|e| {
            warn!(identity = %identity, error = %e, "stored PIN hash is unreadable");
            false
        }))
    }
}

fn pin_key(identity: &str) -> String {
    format!("pin_hash:{identity}")
}

fn attempts_key(identity: &str) -> String {
    format!("lockout_attempts:{identity}")
}

fn last_attempt_key(identity: &str) -> String {
    format!("lockout_last_attempt:{identity}")
}

#[derive(Debug, Clone, Copy)]
struct LockoutEntry {
    attempts: u32,
    last_attempt: Option<DateTime<Utc>>,
}

fn load_lockout(db: &DbState, identity: &str) -> Result<LockoutEntry> {
    let conn = db.lock()?;
    let attempts = db::get_setting(&conn, STAFF_CATEGORY, &attempts_key(identity))
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(0);
    let last_attempt = db::get_setting(&conn, STAFF_CATEGORY, &last_attempt_key(identity))
        .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
        .map(|dt| dt.with_timezone(&Utc));
    Ok(LockoutEntry {
        attempts,
        last_attempt,
    })
}

fn persist_lockout(db: &DbState, identity: &str, entry: &LockoutEntry) -> Result<()> {
    let conn = db.lock()?;
    db::set_setting(
        &conn,
        STAFF_CATEGORY,
        &attempts_key(identity),
        &entry.attempts.to_string(),
    )?;
    if let Some(at) = entry.last_attempt {
        db::set_setting(
            &conn,
            STAFF_CATEGORY,
            &last_attempt_key(identity),
            &at.to_rfc3339(),
        )?;
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StaffSession {
    pub session_id: String,
    pub staff_id: String,
    pub login_time: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Daily cutoff instant that ends this session, if one is configured.
    pub cutoff_at: Option<DateTime<Utc>>,
}

impl StaffSession {
    /// The limit this session crossed first, if any.
    fn expired_by(&self, now: DateTime<Utc>, inactivity: Duration) -> Option<TimeoutReason> {
        let deadlines = [
            self.cutoff_at.map(|at| (at, TimeoutReason::TimeLimit)),
            Some((self.expires_at, TimeoutReason::DurationLimit)),
            Some((self.last_activity + inactivity, TimeoutReason::Inactivity)),
        ];
        deadlines
            .into_iter()
            .flatten()
            .filter(|(deadline, _)| *deadline <= now)
            .min_by_key(|(deadline, _)| *deadline)
            .map(|(_, reason)| reason)
    }
}

/// First wall-clock `cutoff` strictly after `login`, as a UTC instant.
fn next_cutoff(login: DateTime<Utc>, cutoff: NaiveTime, offset: FixedOffset) -> DateTime<Utc> {
    let local = login.with_timezone(&offset).naive_local();
    let mut candidate = local.date().and_time(cutoff);
    if candidate <= local {
        candidate += Duration::days(1);
    }
    // Fixed offsets have no gaps or folds.
    Utc.from_utc_datetime(&(candidate - Duration::seconds(i64::from(offset.local_minus_utc()))))
}

pub struct SessionActivityGovernor {
    db: Arc<DbState>,
    verifier: Arc<dyn CredentialVerifier>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    max_failed_logins: u32,
    lockout: Duration,
    max_duration: Duration,
    inactivity: Duration,
    daily_cutoff: Option<NaiveTime>,
    offset: FixedOffset,
    current: Mutex<Option<StaffSession>>,
}

impl SessionActivityGovernor {
    pub fn new(
        config: &SyncConfig,
        db: Arc<DbState>,
        verifier: Arc<dyn CredentialVerifier>,
        events: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let offset = FixedOffset::east_opt(config.timezone_offset_minutes * 60)
            .unwrap_or_else(|| {
                warn!(
                    offset_minutes = config.timezone_offset_minutes,
                    "timezone offset out of range, using UTC"
                );
                Utc.fix()
            });
        Self {
            db,
            verifier,
            events,
            clock,
            max_failed_logins: config.max_failed_logins.max(1),
            lockout: Duration::minutes(config.lockout_minutes),
            max_duration: Duration::hours(config.session_max_hours),
            inactivity: Duration::minutes(config.session_inactivity_minutes),
            daily_cutoff: config.daily_cutoff(),
            offset,
            current: Mutex::new(None),
        }
    }

    fn identity(hint: Option<&str>) -> &str {
        hint.map(str::trim)
            .filter(|h| !h.is_empty())
            .unwrap_or(DEFAULT_IDENTITY)
    }

    /// Remaining whole minutes of an active lockout, rounded up.
    fn lockout_remaining(&self, entry: &LockoutEntry, now: DateTime<Utc>) -> Option<i64> {
        if entry.attempts < self.max_failed_logins {
            return None;
        }
        let last = entry.last_attempt?;
        let left = last + self.lockout - now;
        if left <= Duration::zero() {
            return None;
        }
        Some(((left.num_seconds() + 59) / 60).max(1))
    }

    /// Verify `secret` for `identity_hint` and open a session.
    ///
    /// A locked identity is refused before the secret is even checked.
    pub fn login(&self, secret: &str, identity_hint: Option<&str>) -> Result<StaffSession> {
        if secret.is_empty() {
            return Err(SyncError::InvalidCredentials);
        }
        let identity = Self::identity(identity_hint);
        let now = self.clock.now();

        let mut entry = load_lockout(&self.db, identity)?;
        if let Some(remaining_minutes) = self.lockout_remaining(&entry, now) {
            warn!(identity = %identity, remaining_minutes, "login refused, identity locked");
            return Err(SyncError::Locked { remaining_minutes });
        }
        if entry.attempts >= self.max_failed_logins {
            // The window has passed; start counting afresh.
            entry.attempts = 0;
        }

        if self.verifier.verify(identity, secret)? {
            entry.attempts = 0;
            entry.last_attempt = Some(now);
            persist_lockout(&self.db, identity, &entry)?;
            let session = self.open_session(identity, now)?;
            info!(identity = %identity, session_id = %session.session_id, "login successful");
            return Ok(session);
        }

        entry.attempts += 1;
        entry.last_attempt = Some(now);
        persist_lockout(&self.db, identity, &entry)?;
        warn!(identity = %identity, attempts = entry.attempts, "failed login attempt");
        Err(SyncError::InvalidCredentials)
    }

    fn open_session(&self, staff_id: &str, now: DateTime<Utc>) -> Result<StaffSession> {
        let session = StaffSession {
            session_id: Uuid::new_v4().to_string(),
            staff_id: staff_id.to_string(),
            login_time: now,
            last_activity: now,
            expires_at: now + self.max_duration,
            cutoff_at: self
                .daily_cutoff
                .map(|cutoff| next_cutoff(now, cutoff, self.offset)),
        };
        let mut current = self.current.lock().map_err(|_| SyncError::lock_poisoned())?;
        *current = Some(session.clone());
        Ok(session)
    }

    pub fn logout(&self) -> Result<()> {
        let mut current = self.current.lock().map_err(|_| SyncError::lock_poisoned())?;
        if let Some(session) = current.take() {
            info!(session_id = %session.session_id, "session logged out");
        }
        Ok(())
    }

    /// Refresh the inactivity timer. Returns false when there is no live
    /// session to refresh.
    pub fn update_activity(&self) -> Result<bool> {
        if self.check_timeouts()?.is_some() {
            return Ok(false);
        }
        let mut current = self.current.lock().map_err(|_| SyncError::lock_poisoned())?;
        match current.as_mut() {
            Some(session) => {
                session.last_activity = self.clock.now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// End the current session if it crossed a limit and announce why.
    pub fn check_timeouts(&self) -> Result<Option<TimeoutReason>> {
        let now = self.clock.now();
        let expired = {
            let mut current = self.current.lock().map_err(|_| SyncError::lock_poisoned())?;
            let reason = current
                .as_ref()
                .and_then(|session| session.expired_by(now, self.inactivity));
            match reason {
                Some(reason) => current.take().map(|session| (session, reason)),
                None => None,
            }
        };

        let Some((session, reason)) = expired else {
            return Ok(None);
        };
        info!(
            session_id = %session.session_id,
            staff_id = %session.staff_id,
            reason = reason.as_str(),
            "session timed out"
        );
        self.events.emit(SyncEvent::SessionTimeout {
            staff_id: session.staff_id,
            reason,
        });
        Ok(Some(reason))
    }

    /// The live session, after applying any pending timeout.
    pub fn current_session(&self) -> Result<Option<StaffSession>> {
        self.check_timeouts()?;
        let current = self.current.lock().map_err(|_| SyncError::lock_poisoned())?;
        Ok(current.clone())
    }

    pub fn failed_attempts(&self, identity_hint: Option<&str>) -> Result<u32> {
        Ok(load_lockout(&self.db, Self::identity(identity_hint))?.attempts)
    }

    pub fn lockout_remaining_minutes(&self, identity_hint: Option<&str>) -> Result<Option<i64>> {
        let entry = load_lockout(&self.db, Self::identity(identity_hint))?;
        Ok(self.lockout_remaining(&entry, self.clock.now()))
    }
}
