//! Suffix-table speculative token proposer.
//!
//! Keeps, per request, a table from every observed token suffix (length
//! `1..=max_tree_depth`) to the tokens that followed it, with occurrence
//! counts. The table is extended incrementally as the request's history
//! grows, so each step only indexes the newly appended tokens.
//!
//! Proposals chain greedily: look up the longest suffix of the current
//! context that the table knows (falling back to shorter ones), emit its
//! most frequent continuation, append it to the context and repeat. A
//! continuation whose empirical probability falls below `min_token_prob`
//! ends the chain.
//!
//! Effective for repetitive or templated output (code, JSON) where the
//! same phrases recur within one request.

use std::collections::HashMap;

use tracing::debug;

use crate::batch::RequestHistory;
use crate::request::RequestId;

use super::DraftMethod;

#[derive(Debug, Clone)]
pub struct SuffixConfig {
    /// Longest suffix used as a lookup key.
    pub max_tree_depth: usize,
    /// Minimum empirical probability of a proposed continuation.
    pub min_token_prob: f32,
    pub num_speculative_tokens: usize,
}

impl Default for SuffixConfig {
    fn default() -> Self {
        Self {
            max_tree_depth: 10,
            min_token_prob: 0.1,
            num_speculative_tokens: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Continuation {
    count: u32,
    /// Position of the most recent occurrence; breaks count ties in favor
    /// of recent context.
    last_seen: usize,
}

#[derive(Debug, Default)]
struct FollowStats {
    total: u32,
    next: HashMap<u32, Continuation>,
}

impl FollowStats {
    fn record(&mut self, token: u32, pos: usize) {
        self.total += 1;
        let entry = self.next.entry(token).or_default();
        entry.count += 1;
        entry.last_seen = pos;
    }

    /// Most frequent continuation and its empirical probability.
    fn best(&self) -> Option<(u32, f32)> {
        let (&token, cont) = self
            .next
            .iter()
            .max_by_key(|(_, c)| (c.count, c.last_seen))?;
        Some((token, cont.count as f32 / self.total as f32))
    }
}

/// Incrementally built suffix → continuation table of one request.
#[derive(Debug)]
struct SuffixTable {
    admission_seq: u64,
    follows: HashMap<Vec<u32>, FollowStats>,
    num_indexed: usize,
    last_indexed_token: Option<u32>,
}

impl SuffixTable {
    fn new(admission_seq: u64) -> Self {
        Self {
            admission_seq,
            follows: HashMap::new(),
            num_indexed: 0,
            last_indexed_token: None,
        }
    }

    /// Whether `token_ids` extends what was indexed so far.
    fn is_prefix_of(&self, token_ids: &[u32]) -> bool {
        if token_ids.len() < self.num_indexed {
            return false;
        }
        match self.last_indexed_token {
            Some(last) => token_ids.get(self.num_indexed - 1) == Some(&last),
            None => true,
        }
    }

    fn extend(&mut self, token_ids: &[u32], max_depth: usize) {
        for pos in self.num_indexed.max(1)..token_ids.len() {
            let next = token_ids[pos];
            for depth in 1..=max_depth.min(pos) {
                let key = &token_ids[pos - depth..pos];
                match self.follows.get_mut(key) {
                    Some(stats) => stats.record(next, pos),
                    None => {
                        let mut stats = FollowStats::default();
                        stats.record(next, pos);
                        self.follows.insert(key.to_vec(), stats);
                    }
                }
            }
        }
        self.num_indexed = token_ids.len();
        self.last_indexed_token = token_ids.last().copied();
    }

    /// Longest known suffix of `context`, at most `max_depth` long.
    fn lookup(&self, context: &[u32], max_depth: usize) -> Option<&FollowStats> {
        let longest = max_depth.min(context.len());
        (1..=longest)
            .rev()
            .find_map(|depth| self.follows.get(&context[context.len() - depth..]))
    }
}

#[derive(Debug, Default)]
pub struct SuffixProposer {
    config: SuffixConfig,
    tables: HashMap<RequestId, SuffixTable>,
}

impl SuffixProposer {
    pub fn new(config: SuffixConfig) -> Self {
        Self {
            config,
            tables: HashMap::new(),
        }
    }

    pub fn method(&self) -> DraftMethod {
        DraftMethod::Suffix
    }

    /// Number of requests with a live table.
    pub fn num_tracked(&self) -> usize {
        self.tables.len()
    }

    /// Release the table of a request that left the batch.
    pub fn remove_request(&mut self, req_id: &RequestId) {
        self.tables.remove(req_id);
    }

    pub fn propose(&mut self, history: &RequestHistory, max_tokens: usize) -> Vec<u32> {
        let k = max_tokens.min(self.config.num_speculative_tokens);
        let max_depth = self.config.max_tree_depth;
        let token_ids = &history.token_ids;

        let table = self
            .tables
            .entry(history.req_id.clone())
            .or_insert_with(|| SuffixTable::new(history.admission_seq));
        if table.admission_seq != history.admission_seq || !table.is_prefix_of(token_ids) {
            debug!(request_id = %history.req_id, "suffix table out of sync, rebuilding");
            *table = SuffixTable::new(history.admission_seq);
        }
        table.extend(token_ids, max_depth);

        if k == 0 {
            return Vec::new();
        }

        let keep = token_ids.len().saturating_sub(max_depth);
        let mut context: Vec<u32> = token_ids[keep..].to_vec();
        let mut proposal = Vec::with_capacity(k);
        while proposal.len() < k {
            let Some(stats) = table.lookup(&context, max_depth) else {
                break;
            };
            let Some((token, prob)) = stats.best() else {
                break;
            };
            if prob < self.config.min_token_prob {
                break;
            }
            proposal.push(token);
            context.push(token);
        }
        proposal
    }
}
