use chrono::{DateTime, Utc};
use std::collections::HashSet;
use thiserror::Error;
use tracing::{info, warn};

use crate::labels::{Article, Factor, LabelRecord, Relevance, Sentiment};
use crate::storage::{keys, write_table, ObjectStore, StorageError};
use crate::table::{to_csv, Table};
use crate::TARGET_SESSION;

/// Where the session stands with respect to the current article.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingRelevance,
    AwaitingLabels,
    /// Every assigned article has been annotated.
    Exhausted,
    /// The batch was sent; the session accepts no further input.
    Closed,
}

/// Rules applied when a batch is sent to the labeled-batch store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushPolicy {
    /// Minimum number of annotations before a batch may be sent.
    pub min_records: usize,
    /// Drop records with empty required columns before sending.
    pub drop_incomplete: bool,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        FlushPolicy {
            min_records: 2,
            drop_incomplete: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("expected the session to be {expected:?}, but it is {actual:?}")]
    UnexpectedState {
        expected: SessionState,
        actual: SessionState,
    },
    #[error("no more data to annotate")]
    Exhausted,
    #[error("the annotated data has already been sent")]
    Closed,
    #[error("there are no annotations to send")]
    EmptyBatch,
    #[error("at least {required} annotations are needed before sending, found {found}")]
    BelowThreshold { required: usize, found: usize },
    #[error("failed to encode annotations: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Result of a successful flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushReceipt {
    pub key: String,
    pub records: usize,
}

/// One user's pass over their assigned articles.
///
/// The cursor only moves forward: every completed answer appends exactly one
/// record and advances to the next article. Nothing leaves the process until
/// [`AnnotationSession::flush`] succeeds.
#[derive(Debug)]
pub struct AnnotationSession {
    username: String,
    work: Vec<Article>,
    cursor: usize,
    state: SessionState,
    batch: Vec<LabelRecord>,
    policy: FlushPolicy,
}

impl AnnotationSession {
    pub fn new(username: impl Into<String>, work: Vec<Article>, policy: FlushPolicy) -> Self {
        let state = if work.is_empty() {
            SessionState::Exhausted
        } else {
            SessionState::AwaitingRelevance
        };
        AnnotationSession {
            username: username.into(),
            work,
            cursor: 0,
            state,
            batch: Vec::new(),
            policy,
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn policy(&self) -> FlushPolicy {
        self.policy
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn work_len(&self) -> usize {
        self.work.len()
    }

    /// Article awaiting an answer, if any.
    pub fn current(&self) -> Option<&Article> {
        match self.state {
            SessionState::AwaitingRelevance | SessionState::AwaitingLabels => {
                self.work.get(self.cursor)
            }
            SessionState::Exhausted | SessionState::Closed => None,
        }
    }

    pub fn annotations(&self) -> &[LabelRecord] {
        &self.batch
    }

    pub fn annotated_count(&self) -> usize {
        self.batch.len()
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Closed => Err(SessionError::Closed),
            SessionState::Exhausted => Err(SessionError::Exhausted),
            _ => Ok(()),
        }
    }

    fn expect_state(&self, expected: SessionState) -> Result<(), SessionError> {
        self.ensure_open()?;
        if self.state != expected {
            return Err(SessionError::UnexpectedState {
                expected,
                actual: self.state,
            });
        }
        Ok(())
    }

    /// Answers the relevance question for the current article.
    ///
    /// An irrelevant article is recorded immediately with the sentinel
    /// labels; a relevant one moves the session on to label selection.
    pub fn answer_relevance(&mut self, relevance: Relevance) -> Result<SessionState, SessionError> {
        self.expect_state(SessionState::AwaitingRelevance)?;
        match relevance {
            Relevance::NotRelated => {
                let record = LabelRecord::not_related(&self.work[self.cursor]);
                self.record(record);
            }
            Relevance::Related => self.state = SessionState::AwaitingLabels,
        }
        Ok(self.state)
    }

    /// Goes back to the relevance question without recording anything.
    pub fn revise_relevance(&mut self) -> Result<SessionState, SessionError> {
        self.expect_state(SessionState::AwaitingLabels)?;
        self.state = SessionState::AwaitingRelevance;
        Ok(self.state)
    }

    /// Records factor, sentiment and comments for the current article.
    pub fn submit_labels(
        &mut self,
        factors: Vec<Factor>,
        sentiment: Sentiment,
        comments: impl Into<String>,
    ) -> Result<SessionState, SessionError> {
        self.expect_state(SessionState::AwaitingLabels)?;
        let record = LabelRecord::related(&self.work[self.cursor], factors, sentiment, comments);
        self.record(record);
        Ok(self.state)
    }

    fn record(&mut self, record: LabelRecord) {
        info!(
            target: TARGET_SESSION,
            "{} annotated article {} ({}/{})",
            self.username,
            record.article_id,
            self.cursor + 1,
            self.work.len()
        );
        self.batch.push(record);
        self.cursor += 1;
        self.state = if self.cursor >= self.work.len() {
            SessionState::Exhausted
        } else {
            SessionState::AwaitingRelevance
        };
    }

    pub fn can_flush(&self) -> bool {
        self.state != SessionState::Closed
            && !self.batch.is_empty()
            && self.batch.len() >= self.policy.min_records
    }

    /// The records a flush would send right now.
    ///
    /// Duplicated articles keep their first record; incomplete records are
    /// dropped when the policy says so.
    pub fn prepared_batch(&self) -> Result<Vec<LabelRecord>, SessionError> {
        if self.state == SessionState::Closed {
            return Err(SessionError::Closed);
        }
        if self.batch.is_empty() {
            return Err(SessionError::EmptyBatch);
        }
        if self.batch.len() < self.policy.min_records {
            return Err(SessionError::BelowThreshold {
                required: self.policy.min_records,
                found: self.batch.len(),
            });
        }

        let mut seen = HashSet::with_capacity(self.batch.len());
        let prepared: Vec<LabelRecord> = self
            .batch
            .iter()
            .filter(|record| seen.insert(record.article_id.clone()))
            .filter(|record| !self.policy.drop_incomplete || record.is_complete())
            .cloned()
            .collect();

        if prepared.is_empty() {
            return Err(SessionError::EmptyBatch);
        }
        Ok(prepared)
    }

    /// Sends the batch to the labeled-batch store and closes the session.
    ///
    /// On failure nothing changes: the batch stays in memory and can be
    /// sent again.
    pub async fn flush(
        &mut self,
        store: &dyn ObjectStore,
        bucket: &str,
        at: DateTime<Utc>,
    ) -> Result<FlushReceipt, SessionError> {
        let prepared = self.prepared_batch()?;
        let dropped = self.batch.len() - prepared.len();
        let table = Table::from_records(&prepared)?;
        let key = keys::raw_batch_key(&self.username, at);

        if let Err(e) = write_table(store, bucket, &key, &table).await {
            warn!(target: TARGET_SESSION, "Sending {} annotations for {} failed: {}", prepared.len(), self.username, e);
            return Err(e.into());
        }

        info!(
            target: TARGET_SESSION,
            "Sent {} annotations for {} to {}/{} ({} dropped)",
            prepared.len(),
            self.username,
            bucket,
            key,
            dropped
        );
        self.state = SessionState::Closed;
        Ok(FlushReceipt {
            key,
            records: prepared.len(),
        })
    }

    /// All accumulated annotations as CSV, including any that a flush would
    /// drop.
    pub fn to_csv(&self) -> Result<String, SessionError> {
        let table = if self.batch.is_empty() {
            Table::with_columns(["article_id", "link", "factor(s)", "sentiment", "comments"])
        } else {
            Table::from_records(&self.batch)?
        };
        Ok(to_csv(&table))
    }
}
