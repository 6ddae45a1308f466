//! Access to the external metadata catalog.

use crate::data::models::MatchCandidate;
use crate::error::CatalogError;
use async_trait::async_trait;
use governor::clock::MonotonicClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::time::Duration;

pub mod fetcher;
pub mod http;

pub use fetcher::{CandidateFetcher, FetchError, FetchStats, RetryPolicy};
pub use http::HttpCatalog;

/// A searchable source of [`MatchCandidate`]s.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Candidates whose name plausibly matches `name`.
    ///
    /// [`CatalogError::NotFound`] and an empty list both mean "no candidates".
    async fn search(&self, name: &str) -> Result<Vec<MatchCandidate>, CatalogError>;
}

/// Shared gate in front of every catalog call.
///
/// Cells are spaced `window / quota` apart, rounded up to the nanosecond, with
/// no burst allowance, so any window-long interval contains at most `quota`
/// calls. Runs on `std::time::Instant`. Waiting callers are served in the
/// order the limiter lets them through; none is dropped.
pub struct CallLimiter {
    limiter: RateLimiter<NotKeyed, InMemoryState, MonotonicClock, NoOpMiddleware<std::time::Instant>>,
    quota: NonZeroU32,
    window: Duration,
}

impl CallLimiter {
    /// `None` when `window / quota` rounds down to zero.
    pub fn new(quota: NonZeroU32, window: Duration) -> Option<Self> {
        if (window / quota.get()).is_zero() {
            return None;
        }
        let spacing = Quota::with_period(spacing(quota, window))?;
        Some(Self {
            limiter: RateLimiter::direct_with_clock(spacing, MonotonicClock),
            quota,
            window,
        })
    }

    /// Wait until the next call may be issued.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    pub fn quota(&self) -> NonZeroU32 {
        self.quota
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Minimum gap between two calls.
    pub fn spacing(&self) -> Duration {
        spacing(self.quota, self.window)
    }
}

fn spacing(quota: NonZeroU32, window: Duration) -> Duration {
    let spacing = window / quota.get();
    if spacing * quota.get() < window {
        spacing + Duration::from_nanos(1)
    } else {
        spacing
    }
}

impl std::fmt::Debug for CallLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallLimiter")
            .field("quota", &self.quota)
            .field("window", &self.window)
            .finish()
    }
}
