//! Admission decisions over a shared sliding window.

use chrono::{DateTime, Utc};
use http::StatusCode;
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use super::fields::{FieldSnapshot, RequestContext};
use super::window::SlidingWindow;
use crate::config::LimiterConfig;

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Forward the request
    Admit,
    /// Short-circuit with exactly this status and message
    Deny {
        status_code: StatusCode,
        message: serde_json::Value,
    },
}

impl Decision {
    pub fn is_admit(&self) -> bool {
        matches!(self, Decision::Admit)
    }

    pub fn is_deny(&self) -> bool {
        !self.is_admit()
    }
}

/// The admission controller.
///
/// Owns the window of recent requests and serializes every
/// evict/count/append sequence behind one mutex. Construct once at startup
/// and share it (e.g. behind an `Arc`) with the request path.
pub struct AdmissionController {
    config: LimiterConfig,
    window: Mutex<SlidingWindow>,
}

impl AdmissionController {
    /// Create a controller with an empty window.
    pub fn new(config: LimiterConfig) -> Self {
        info!(
            window = %config.window(),
            limit = config.limit(),
            match_fields = ?config.match_fields(),
            match_method = %config.match_method(),
            status_code = config.status_code().as_u16(),
            "Rate limiter enabled"
        );
        Self {
            config,
            window: Mutex::new(SlidingWindow::new()),
        }
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    /// Decide on a request arriving at `now`.
    ///
    /// Every call records the request, admitted or not. The request is
    /// compared against prior records only, and denied once more than
    /// `limit` of them correlate with it.
    pub fn decide(&self, ctx: &RequestContext, now: DateTime<Utc>) -> Decision {
        let fields = FieldSnapshot::extract(ctx, self.config.match_fields());
        let mut window = self.window.lock();
        self.decide_locked(&mut window, fields, now)
    }

    /// Decide on a request arriving now, by the wall clock.
    ///
    /// The clock is read while holding the window lock, so records appended
    /// through this method are in arrival order.
    pub fn check(&self, ctx: &RequestContext) -> Decision {
        let fields = FieldSnapshot::extract(ctx, self.config.match_fields());
        let mut window = self.window.lock();
        let now = Utc::now();
        self.decide_locked(&mut window, fields, now)
    }

    fn decide_locked(
        &self,
        window: &mut SlidingWindow,
        fields: FieldSnapshot,
        now: DateTime<Utc>,
    ) -> Decision {
        let evicted = window.evict(now, self.config.window());
        if evicted > 0 {
            debug!(evicted, remaining = window.len(), "Evicted expired requests");
        }

        let count = window.count_matching(&fields, self.config.match_method()) as u64;

        let decision = if count > self.config.limit() {
            warn!(
                count,
                window = %self.config.window(),
                limit = self.config.limit(),
                status_code = self.config.status_code().as_u16(),
                client = %fields,
                "Rate limit exceeded"
            );
            Decision::Deny {
                status_code: self.config.status_code(),
                message: self.config.message(),
            }
        } else {
            trace!(count, client = %fields, "Request admitted");
            Decision::Admit
        };

        window.record(fields, now);
        decision
    }

    /// Number of requests currently held in the window.
    pub fn window_len(&self) -> usize {
        self.window.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{FieldName, MatchMethod};
    use chrono::{TimeDelta, TimeZone};
    use std::sync::Arc;
    use std::time::Duration;

    fn at_millis(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + millis).unwrap()
    }

    fn controller(window_secs: u64, limit: u64, fields: &[FieldName], method: MatchMethod) -> AdmissionController {
        let config = LimiterConfig::new(Duration::from_secs(window_secs), limit, fields.to_vec(), method).unwrap();
        AdmissionController::new(config)
    }

    fn from_addr(addr: &str) -> RequestContext {
        RequestContext::new().with_client_addr(addr)
    }

    #[test]
    fn test_zero_limit_denies_second_request() {
        let limiter = controller(60, 0, &[FieldName::Ip], MatchMethod::And);
        let ctx = from_addr("1.1.1.1");

        assert_eq!(limiter.decide(&ctx, at_millis(0)), Decision::Admit);

        let decision = limiter.decide(&ctx, at_millis(1));
        assert_eq!(
            decision,
            Decision::Deny {
                status_code: StatusCode::TOO_MANY_REQUESTS,
                message: serde_json::json!("Too Many Requests"),
            }
        );
    }

    #[test]
    fn test_limit_is_inclusive_capacity() {
        let limiter = controller(10, 2, &[FieldName::Ip], MatchMethod::And);
        let ctx = from_addr("10.0.0.1");

        let outcomes: Vec<bool> = (0..4)
            .map(|i| limiter.decide(&ctx, at_millis(i * 250)).is_admit())
            .collect();

        assert_eq!(outcomes, vec![true, true, true, false]);
    }

    #[test]
    fn test_kth_request_admitted_iff_within_limit_plus_one() {
        for limit in [0u64, 1, 3, 5] {
            let limiter = controller(60, limit, &[FieldName::Ip], MatchMethod::And);
            let ctx = from_addr("10.0.0.1");

            for k in 1..=(limit + 4) {
                let decision = limiter.decide(&ctx, at_millis(k as i64));
                assert_eq!(decision.is_admit(), k <= limit + 1, "limit={} k={}", limit, k);
            }
        }
    }

    #[test]
    fn test_expiry_resets_count() {
        let limiter = controller(5, 1, &[FieldName::Ip], MatchMethod::And);
        let ctx = from_addr("10.0.0.1");

        assert!(limiter.decide(&ctx, at_millis(0)).is_admit());
        assert!(limiter.decide(&ctx, at_millis(6_000)).is_admit());
        assert_eq!(limiter.window_len(), 1);
    }

    #[test]
    fn test_expiry_resets_after_denials() {
        let limiter = controller(5, 0, &[FieldName::Ip], MatchMethod::And);
        let ctx = from_addr("10.0.0.1");

        assert!(limiter.decide(&ctx, at_millis(0)).is_admit());
        assert!(limiter.decide(&ctx, at_millis(1_000)).is_deny());
        assert!(limiter.decide(&ctx, at_millis(2_000)).is_deny());
        // Everything up to t=2s has expired by t=7.5s.
        assert!(limiter.decide(&ctx, at_millis(7_500)).is_admit());
    }

    #[test]
    fn test_denied_requests_consume_budget() {
        let limiter = controller(10, 1, &[FieldName::Ip], MatchMethod::And);
        let ctx = from_addr("10.0.0.1");

        for i in 0..5 {
            limiter.decide(&ctx, at_millis(i));
        }
        assert_eq!(limiter.window_len(), 5);
        assert!(limiter.decide(&ctx, at_millis(5)).is_deny());
    }

    #[test]
    fn test_unrelated_clients_always_admitted() {
        let limiter = controller(60, 0, &[FieldName::Ip], MatchMethod::And);

        for i in 0..50 {
            let ctx = from_addr(&format!("10.0.0.{}", i));
            assert!(limiter.decide(&ctx, at_millis(i)).is_admit());
        }
        assert_eq!(limiter.window_len(), 50);
    }

    #[test]
    fn test_or_counts_shared_token() {
        let limiter = controller(60, 0, &[FieldName::Ip, FieldName::Auth], MatchMethod::Or);

        let first = RequestContext::new().with_client_addr("A").with_authorization("T");
        let second = RequestContext::new().with_client_addr("B").with_authorization("T");

        assert!(limiter.decide(&first, at_millis(0)).is_admit());
        assert!(limiter.decide(&second, at_millis(1)).is_deny());
    }

    #[test]
    fn test_and_ignores_partial_overlap() {
        let limiter = controller(60, 0, &[FieldName::Ip, FieldName::Auth], MatchMethod::And);

        let first = RequestContext::new().with_client_addr("A").with_authorization("T");
        let second = RequestContext::new().with_client_addr("B").with_authorization("T");

        assert!(limiter.decide(&first, at_millis(0)).is_admit());
        assert!(limiter.decide(&second, at_millis(1)).is_admit());
    }

    #[test]
    fn test_field_order_does_not_change_decisions() {
        let forward = controller(60, 1, &[FieldName::Ip, FieldName::UserAgent], MatchMethod::And);
        let reverse = controller(60, 1, &[FieldName::UserAgent, FieldName::Ip], MatchMethod::And);

        let requests = [
            RequestContext::new().with_client_addr("A").with_user_agent("u1"),
            RequestContext::new().with_client_addr("A").with_user_agent("u2"),
            RequestContext::new().with_client_addr("A").with_user_agent("u1"),
            RequestContext::new().with_client_addr("A").with_user_agent("u1"),
            RequestContext::new().with_client_addr("B").with_user_agent("u1"),
        ];

        for (i, ctx) in requests.iter().enumerate() {
            let now = at_millis(i as i64);
            assert_eq!(forward.decide(ctx, now), reverse.decide(ctx, now), "request {}", i);
        }
    }

    #[test]
    fn test_zero_window_counts_only_simultaneous_requests() {
        let limiter = controller(0, 0, &[FieldName::Ip], MatchMethod::And);
        let ctx = from_addr("10.0.0.1");

        assert!(limiter.decide(&ctx, at_millis(0)).is_admit());
        assert!(limiter.decide(&ctx, at_millis(0)).is_deny());
        assert!(limiter.decide(&ctx, at_millis(1)).is_admit());
    }

    #[test]
    fn test_custom_deny_response() {
        let config = LimiterConfig::new(Duration::from_secs(60), 0, vec![FieldName::Ip], MatchMethod::And)
            .unwrap()
            .with_status_code(503)
            .unwrap()
            .with_message("slow down");
        let limiter = AdmissionController::new(config);
        let ctx = from_addr("10.0.0.1");

        limiter.decide(&ctx, at_millis(0));
        match limiter.decide(&ctx, at_millis(1)) {
            Decision::Deny { status_code, message } => {
                assert_eq!(status_code, StatusCode::SERVICE_UNAVAILABLE);
                assert_eq!(message, serde_json::json!("slow down"));
            }
            Decision::Admit => panic!("expected deny"),
        }
    }

    #[test]
    fn test_check_uses_wall_clock() {
        let limiter = controller(60, 0, &[FieldName::Ip], MatchMethod::And);
        let ctx = from_addr("10.0.0.1");

        assert!(limiter.check(&ctx).is_admit());
        assert!(limiter.check(&ctx).is_deny());
    }


    #[test]
    fn test_config_window_exposed() {
        let limiter = controller(30, 3, &[FieldName::Ip], MatchMethod::Or);
        assert_eq!(limiter.config().window(), TimeDelta::seconds(30));
        assert_eq!(limiter.config().limit(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_decisions_are_serialized() {
        const TASKS: usize = 8;
        const PER_TASK: usize = 50;
        const LIMIT: u64 = 9;

        let limiter = Arc::new(controller(3600, LIMIT, &[FieldName::Ip], MatchMethod::And));

        let handles: Vec<_> = (0..TASKS)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move {
                    let ctx = from_addr("10.0.0.1");
                    (0..PER_TASK)
                        .filter(|_| limiter.check(&ctx).is_admit())
                        .count()
                })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            admitted += handle.await.unwrap();
        }

        // Exactly limit + 1 correlated requests fit, however they interleave.
        assert_eq!(admitted as u64, LIMIT + 1);
        assert_eq!(limiter.window_len(), TASKS * PER_TASK);
    }

    #[test]
    fn test_concurrent_threads_keep_window_sorted() {
        let limiter = Arc::new(controller(3600, 1_000, &[FieldName::Ip], MatchMethod::And));

        let threads: Vec<_> = (0..4)
            .map(|t| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || {
                    let ctx = from_addr(&format!("10.0.0.{}", t));
                    for _ in 0..100 {
                        limiter.check(&ctx);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        let window = limiter.window.lock();
        let timestamps: Vec<_> = window.iter().map(|r| r.timestamp()).collect();
        assert_eq!(timestamps.len(), 400);
        assert!(timestamps.windows(2).all(|pair| pair[0] <= pair[1]));
    }
}
