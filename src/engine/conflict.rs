use serde::Serialize;
use tracing::debug;
use ulid::Ulid;

use crate::calendar;
use crate::limits::MAX_DURATION_MS;
use crate::model::*;

use super::{Engine, EngineError};

/// Which data source produced a conflict verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Cache,
    Store,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Cache => "cache",
            Source::Store => "store",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub available: bool,
    /// A blocking booking that overlaps, when one was found.
    pub conflicting: Option<Ulid>,
    pub source: Source,
}

impl Verdict {
    fn new(conflicting: Option<Ulid>, source: Source) -> Self {
        let verdict = Self {
            available: conflicting.is_none(),
            conflicting,
            source,
        };
        metrics::counter!(
            crate::observability::CONFLICT_CHECKS_TOTAL,
            "source" => source.as_str(),
            "verdict" => if verdict.available { "free" } else { "conflict" }
        )
        .increment(1);
        verdict
    }

    /// `Ok` when free, otherwise the owner-specific conflict error.
    pub fn into_result(self, owner: OwnerKind) -> Result<Verdict, EngineError> {
        match (self.available, owner) {
            (true, _) => Ok(self),
            (false, OwnerKind::Expert) => Err(EngineError::ExpertUnavailable {
                conflicting: self.conflicting,
            }),
            (false, OwnerKind::User) => Err(EngineError::UserConflict {
                conflicting: self.conflicting,
            }),
        }
    }
}

impl Engine {
    /// Is the expert free over `span`? Index first, store when the index cannot answer.
    pub async fn check_expert(
        &self,
        expert_id: Ulid,
        span: Span,
        exclude: Option<Ulid>,
    ) -> Result<Verdict, EngineError> {
        self.check_owner(OwnerKind::Expert, expert_id, span, exclude).await
    }

    /// Does the user already hold an overlapping booking with any expert?
    pub async fn check_user(
        &self,
        user_id: Ulid,
        span: Span,
        exclude: Option<Ulid>,
    ) -> Result<Verdict, EngineError> {
        self.check_owner(OwnerKind::User, user_id, span, exclude).await
    }

    pub(super) async fn check_owner(
        &self,
        owner: OwnerKind,
        owner_id: Ulid,
        span: Span,
        exclude: Option<Ulid>,
    ) -> Result<Verdict, EngineError> {
        match self.index_conflict(owner, owner_id, &span, exclude).await {
            Some(None) => Ok(Verdict::new(None, Source::Cache)),
            Some(Some(hit)) => self.confirm_index_hit(owner, owner_id, span, exclude, hit).await,
            None => self.check_owner_authoritative(owner, owner_id, span, exclude).await,
        }
    }

    /// An index hit is only a candidate: the booking may have been released while the
    /// index was unreachable. The store decides, and a stale reference is evicted.
    async fn confirm_index_hit(
        &self,
        owner: OwnerKind,
        owner_id: Ulid,
        span: Span,
        exclude: Option<Ulid>,
        hit: Ulid,
    ) -> Result<Verdict, EngineError> {
        let overlapping = self
            .store_call(self.store.blocking_overlaps(owner, owner_id, span, exclude))
            .await?;
        if overlapping.iter().any(|b| b.id == hit) {
            return Ok(Verdict::new(Some(hit), Source::Cache));
        }
        debug!(booking = %hit, owner = owner.as_str(), "evicting stale index entry");
        metrics::counter!(crate::observability::INDEX_STALE_EVICTIONS_TOTAL).increment(1);
        self.index.remove(hit).await;
        Ok(Verdict::new(overlapping.first().map(|b| b.id), Source::Store))
    }

    /// Range query against the store. Errors here fail the operation closed.
    pub(super) async fn check_owner_authoritative(
        &self,
        owner: OwnerKind,
        owner_id: Ulid,
        span: Span,
        exclude: Option<Ulid>,
    ) -> Result<Verdict, EngineError> {
        let overlapping = self
            .store_call(self.store.blocking_overlaps(owner, owner_id, span, exclude))
            .await?;
        Ok(Verdict::new(overlapping.first().map(|b| b.id), Source::Store))
    }

    /// `None` if any bucket could not be read. A booking that overlaps `span` can start
    /// up to one maximum duration earlier, so earlier day buckets are scanned too.
    async fn index_conflict(
        &self,
        owner: OwnerKind,
        owner_id: Ulid,
        span: &Span,
        exclude: Option<Ulid>,
    ) -> Option<Option<Ulid>> {
        let tz = self.index.timezone();
        let first = calendar::local_date(tz, span.start - MAX_DURATION_MS);
        let last = calendar::local_date(tz, span.end - 1);

        for date in calendar::dates_between(first, last) {
            let entries = self.index.list_for_owner_day(owner, owner_id, date).await?;
            let hit = entries.iter().find(|e| {
                e.status.is_blocking() && Some(e.booking_id) != exclude && e.span().overlaps(span)
            });
            if let Some(e) = hit {
                return Some(Some(e.booking_id));
            }
        }
        Some(None)
    }
}
