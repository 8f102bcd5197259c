use crate::{messages::packet::AnalysisResult, utils::time::local_now_seconds};
use chrono::NaiveDateTime;
use parking_lot::Mutex;
use ringbuffer::{AllocRingBuffer, RingBuffer};
use serde::{Deserialize, Serialize};

/// Default number of records kept per history.
pub const DEFAULT_HISTORY_CAPACITY: usize = 256;

/// One question to the chat assistant and its answer.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct ChatExchange {
    #[serde(rename = "date", with = "crate::utils::time::verdict_date")]
    pub timestamp: NaiveDateTime,
    pub question: String,
    pub answer: String,
}

impl ChatExchange {
    pub fn now(question: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            timestamp: local_now_seconds(),
            question: question.into(),
            answer: answer.into(),
        }
    }
}

/// Append only history of verdicts and chat exchanges. Only used as
/// context for the chat assistant, never on the ingestion path.
pub trait AnalysisStore: Send + Sync {
    fn append_analysis(&self, result: AnalysisResult);

    fn append_chat(&self, exchange: ChatExchange);

    /// Up to `n` verdicts, newest first.
    fn recent_analyses(&self, n: usize) -> Vec<AnalysisResult>;

    /// Up to `n` chat exchanges, newest first.
    fn recent_chats(&self, n: usize) -> Vec<ChatExchange>;
}

/// Bounded in-memory history. Once full, the oldest record is dropped for
/// each new one.
pub struct MemoryStore {
    analyses: Mutex<AllocRingBuffer<AnalysisResult>>,
    chats: Mutex<AllocRingBuffer<ChatExchange>>,
}

impl MemoryStore {
    /// * `capacity`: records kept per history, rounded up to a power of two.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        Self {
            analyses: Mutex::new(AllocRingBuffer::new(capacity)),
            chats: Mutex::new(AllocRingBuffer::new(capacity)),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

/// Newest first by timestamp. Equal timestamps keep newest insertion first.
fn newest_first<T: Clone>(
    buffer: &AllocRingBuffer<T>,
    n: usize,
    timestamp: impl Fn(&T) -> NaiveDateTime,
) -> Vec<T> {
    let mut records = buffer.to_vec();
    records.reverse();
    records.sort_by_key(|record| std::cmp::Reverse(timestamp(record)));
    records.truncate(n);
    records
}

impl AnalysisStore for MemoryStore {
    fn append_analysis(&self, result: AnalysisResult) {
        self.analyses.lock().push(result);
    }

    fn append_chat(&self, exchange: ChatExchange) {
        self.chats.lock().push(exchange);
    }

    fn recent_analyses(&self, n: usize) -> Vec<AnalysisResult> {
        newest_first(&self.analyses.lock(), n, |result| result.timestamp)
    }

    fn recent_chats(&self, n: usize) -> Vec<ChatExchange> {
        newest_first(&self.chats.lock(), n, |exchange| exchange.timestamp)
    }
}
