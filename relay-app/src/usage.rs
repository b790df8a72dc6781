use chrono::{DateTime, Utc};
use dashmap::DashMap;
use relay_channels::ConversationId;
use relay_llm::CallUsage;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageRecord {
    pub calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cost_usd: f64,
    pub total_duration: Duration,
    pub last_call: Option<DateTime<Utc>>,
}

impl UsageRecord {
    fn add(&mut self, usage: &CallUsage, at: DateTime<Utc>) {
        self.calls += 1;
        self.input_tokens += usage.input_tokens;
        self.output_tokens += usage.output_tokens;
        self.cache_read_tokens += usage.cache_read_tokens;
        self.cache_creation_tokens += usage.cache_creation_tokens;
        self.cost_usd += usage.cost_usd;
        self.total_duration += usage.duration;
        self.last_call = Some(at);
    }

    pub fn report(&self, now: DateTime<Utc>) -> String {
        let mut out = String::from("Session usage:\n");
        out.push_str(&format!("  Calls: {}\n", self.calls));
        out.push_str(&format!("  Input tokens: {}\n", self.input_tokens));
        out.push_str(&format!("  Output tokens: {}\n", self.output_tokens));
        if self.cache_read_tokens > 0 || self.cache_creation_tokens > 0 {
            out.push_str(&format!(
                "  Cache tokens: {} read, {} created\n",
                self.cache_read_tokens, self.cache_creation_tokens
            ));
        }
        out.push_str(&format!("  Cost: ${:.4}\n", self.cost_usd));
        out.push_str(&format!("  Duration: {:.1}s\n", self.total_duration.as_secs_f64()));
        if let Some(last) = self.last_call {
            let ago = (now - last).num_seconds().max(0);
            out.push_str(&format!("  Last call: {ago}s ago"));
        }
        out.trim_end().to_string()
    }
}

#[derive(Default)]
pub struct UsageTracker {
    records: DashMap<ConversationId, UsageRecord>,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, conversation_id: &ConversationId, usage: &CallUsage) {
        self.records
            .entry(conversation_id.clone())
            .or_default()
            .add(usage, Utc::now());
    }

    pub fn get(&self, conversation_id: &ConversationId) -> Option<UsageRecord> {
        self.records.get(conversation_id).map(|r| r.clone())
    }

    pub fn reset(&self, conversation_id: &ConversationId) {
        self.records.remove(conversation_id);
    }

    pub fn report(&self, conversation_id: &ConversationId) -> String {
        match self.get(conversation_id) {
            Some(record) if record.calls > 0 => record.report(Utc::now()),
            _ => "No usage data yet. Send some messages first!".to_string(),
        }
    }
}
