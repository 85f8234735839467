//! Per-subject, per-route-class rate limiting on the substrate counter.
//!
//! The counter pattern: the first increment in a window arms the TTL, so a
//! burst shares one window and the remaining TTL doubles as `retry_after`.

use std::collections::HashMap;
use std::time::Duration;

use tandem_core::{Fault, FaultKind};
use tandem_substrate::Substrate;

/// Route classes with independent budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteClass {
    /// REST calls (create/delete/execute/state).
    Api,
    /// Frame stream attachments.
    Stream,
    /// Signaling socket attachments.
    Signal,
}

impl RouteClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::Stream => "stream",
            Self::Signal => "signal",
        }
    }
}

/// One bucket's parameters.
#[derive(Debug, Clone, Copy)]
pub struct BucketSpec {
    pub capacity: i64,
    pub window: Duration,
}

#[derive(Clone)]
pub struct RateLimiter {
    substrate: Substrate,
    buckets: HashMap<RouteClass, BucketSpec>,
}

impl RateLimiter {
    /// Production defaults per route class.
    pub fn new(substrate: Substrate) -> Self {
        let mut buckets = HashMap::new();
        buckets.insert(
            RouteClass::Api,
            BucketSpec {
                capacity: 60,
                window: Duration::from_secs(60),
            },
        );
        buckets.insert(
            RouteClass::Stream,
            BucketSpec {
                capacity: 30,
                window: Duration::from_secs(60),
            },
        );
        buckets.insert(
            RouteClass::Signal,
            BucketSpec {
                capacity: 120,
                window: Duration::from_secs(60),
            },
        );
        Self { substrate, buckets }
    }

    /// Override one class's bucket.
    pub fn with_bucket(mut self, class: RouteClass, spec: BucketSpec) -> Self {
        self.buckets.insert(class, spec);
        self
    }

    /// Admit or refuse one request.
    pub async fn check(&self, subject: &str, class: RouteClass) -> Result<(), Fault> {
        let Some(spec) = self.buckets.get(&class) else {
            return Ok(());
        };
        if spec.capacity <= 0 {
            return Ok(());
        }

        let key = format!("rl:{subject}:{}", class.as_str());
        let count = self
            .substrate
            .incr(&key, spec.window)
            .await
            .map_err(Fault::from)?;
        if count <= spec.capacity {
            return Ok(());
        }

        let retry_after = self
            .substrate
            .ttl_of(&key)
            .await
            .map_err(Fault::from)?
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Err(Fault::new(
            FaultKind::TooManyRequests,
            format!("rate limit exceeded; retry after {retry_after}s"),
        ))
    }
}
