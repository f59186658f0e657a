// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Per-IP rate limiting for the authentication surface.
//!
//! Auth endpoints: 5 attempts per sliding minute, then a 5-minute lockout.
//! Recovery endpoints: exponential backoff after every third failure and a
//! persisted permanent block after 10 lifetime failures. Loopback is exempt
//! everywhere; a local process already owns the machine.

use std::collections::HashMap;
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use governor::{
    clock::DefaultClock,
    state::keyed::DashMapStateStore,
    Quota, RateLimiter,
};
use tracing::warn;

use tinyclaw_store::SecurityStore;

type IpLimiter = RateLimiter<IpAddr, DashMapStateStore<IpAddr>, DefaultClock>;

const PERMANENT_BLOCK_THRESHOLD: i64 = 10;

pub fn is_loopback(ip: IpAddr) -> bool {
    ip.is_loopback()
}

pub struct AuthRateLimiter {
    limiter: IpLimiter,
    lockouts: Mutex<HashMap<IpAddr, Instant>>,
    lockout: Duration,
    friend_limiter: IpLimiter,
    security: Arc<SecurityStore>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Gate {
    Allowed,
    /// 429 with a generic message.
    Limited,
    /// Persisted permanent block (recovery abuse).
    Blocked,
}

impl AuthRateLimiter {
    pub fn new(
        attempts_per_minute: u32,
        lockout: Duration,
        friend_per_minute: u32,
        security: Arc<SecurityStore>,
    ) -> Self {
        let quota = |per_minute: u32| {
            Quota::per_minute(NonZeroU32::new(per_minute.max(1)).expect("nonzero"))
        };
        Self {
            limiter: RateLimiter::keyed(quota(attempts_per_minute)),
            lockouts: Mutex::new(HashMap::new()),
            lockout,
            friend_limiter: RateLimiter::keyed(quota(friend_per_minute)),
            security,
        }
    }

    /// Gate one auth attempt (login/setup). Call before verification; every
    /// attempt counts, success or not.
    pub fn check_auth(&self, ip: IpAddr) -> Gate {
        if is_loopback(ip) {
            return Gate::Allowed;
        }
        {
            let mut lockouts = self.lockouts.lock().expect("limiter mutex");
            if let Some(until) = lockouts.get(&ip) {
                if Instant::now() < *until {
                    return Gate::Limited;
                }
                lockouts.remove(&ip);
            }
        }
        if self.limiter.check_key(&ip).is_err() {
            warn!(%ip, "auth rate limit tripped, locking out");
            self.lockouts
                .lock()
                .expect("limiter mutex")
                .insert(ip, Instant::now() + self.lockout);
            return Gate::Limited;
        }
        Gate::Allowed
    }

    /// Gate one guest chat request.
    pub fn check_friend(&self, ip: IpAddr) -> Gate {
        if is_loopback(ip) {
            return Gate::Allowed;
        }
        match self.friend_limiter.check_key(&ip) {
            Ok(_) => Gate::Allowed,
            Err(_) => Gate::Limited,
        }
    }

    /// Gate one recovery attempt against the persisted failure history.
    pub fn check_recovery(&self, ip: IpAddr) -> Gate {
        if is_loopback(ip) {
            return Gate::Allowed;
        }
        if self.security.is_ip_blocked(&ip.to_string()).unwrap_or(false) {
            return Gate::Blocked;
        }
        let (failures, last_failure_at) = self
            .security
            .recovery_failures(&ip.to_string())
            .unwrap_or((0, 0));
        if failures < 3 {
            return Gate::Allowed;
        }
        // Backoff: 1 min × 2^(floor(n/3) − 1) since the last failure.
        let exponent = (failures / 3 - 1).min(16) as u32;
        let wait_ms = 60_000i64 * (1i64 << exponent);
        let now = chrono::Utc::now().timestamp_millis();
        if now - last_failure_at < wait_ms {
            Gate::Limited
        } else {
            Gate::Allowed
        }
    }

    /// Record a failed recovery attempt; flips to a persisted permanent
    /// block at the lifetime threshold.
    pub fn record_recovery_failure(&self, ip: IpAddr) {
        if is_loopback(ip) {
            return;
        }
        let key = ip.to_string();
        match self.security.record_recovery_failure(&key) {
            Ok(n) if n >= PERMANENT_BLOCK_THRESHOLD => {
                warn!(%ip, "permanently blocking after {n} recovery failures");
                let _ = self.security.block_ip(&key);
            }
            Ok(_) => {}
            Err(e) => warn!("recording recovery failure: {e:#}"),
        }
    }

    pub fn clear_recovery_failures(&self, ip: IpAddr) {
        let _ = self.security.clear_recovery_failures(&ip.to_string());
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> AuthRateLimiter {
        AuthRateLimiter::new(
            5,
            Duration::from_secs(300),
            20,
            Arc::new(SecurityStore::open_in_memory().unwrap()),
        )
    }

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([203, 0, 113, last])
    }

    #[test]
    fn loopback_is_exempt() {
        let rl = limiter();
        let localhost: IpAddr = "127.0.0.1".parse().unwrap();
        for _ in 0..100 {
            assert_eq!(rl.check_auth(localhost), Gate::Allowed);
        }
    }

    #[test]
    fn sixth_attempt_in_a_minute_locks_out() {
        let rl = limiter();
        let mut allowed = 0;
        for _ in 0..6 {
            if rl.check_auth(ip(1)) == Gate::Allowed {
                allowed += 1;
            }
        }
        assert!(allowed <= 5);
        // Locked out now regardless of the token bucket refilling.
        assert_eq!(rl.check_auth(ip(1)), Gate::Limited);
        // A different IP is unaffected.
        assert_eq!(rl.check_auth(ip(2)), Gate::Allowed);
    }

    #[test]
    fn recovery_backoff_engages_after_three_failures() {
        let rl = limiter();
        assert_eq!(rl.check_recovery(ip(3)), Gate::Allowed);
        for _ in 0..3 {
            rl.record_recovery_failure(ip(3));
        }
        assert_eq!(rl.check_recovery(ip(3)), Gate::Limited);
    }

    #[test]
    fn ten_recovery_failures_block_permanently() {
        let rl = limiter();
        for _ in 0..10 {
            rl.record_recovery_failure(ip(4));
        }
        assert_eq!(rl.check_recovery(ip(4)), Gate::Blocked);
    }
}
