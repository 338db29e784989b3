//! Duplicate detection across sources.
//!
//! The same concert is typically posted three times: by the venue, by the
//! ticketing platform and by the local paper. Candidates are blocked by
//! calendar day, scored pairwise with several strategies, clustered with
//! union-find, and each cluster elects one canonical record.

use chrono::{DateTime, Utc};
use kultur_core::{normalize_text, normalize_url, Event, EventDraft};
use serde::Serialize;
use strsim::jaro_winkler;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "kultur-dedupe";

#[derive(Debug, Clone, Copy)]
pub struct DedupeConfig {
    /// Scores at or above this merge automatically.
    pub merge_threshold: f64,
    /// Scores in [review, merge) are queued for a human, not merged.
    pub review_threshold: f64,
    /// Start times within this many minutes count as "the same time".
    pub time_window_minutes: i64,
    pub title_weight: f64,
    pub proximity_weight: f64,
}

impl Default for DedupeConfig {
    fn default() -> Self {
        Self {
            merge_threshold: 0.92,
            review_threshold: 0.80,
            time_window_minutes: 30,
            title_weight: 0.65,
            proximity_weight: 0.35,
        }
    }
}

/// Flattened comparison view of a draft or stored event.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Resolved after persistence for drafts; immediate for stored events.
    pub id: Option<Uuid>,
    pub source_id: String,
    pub source_priority: i64,
    pub signature: String,
    pub title_norm: String,
    pub venue_norm: Option<String>,
    pub url_norm: Option<String>,
    pub starts_at: DateTime<Utc>,
    pub completeness: u32,
    pub fetched_at: DateTime<Utc>,
}

impl Candidate {
    pub fn from_draft(draft: &EventDraft, source_priority: i64) -> Self {
        Self {
            id: None,
            source_id: draft.source_id.clone(),
            source_priority,
            signature: draft.signature(),
            title_norm: normalize_text(&draft.title),
            venue_norm: draft.venue.as_deref().map(normalize_text),
            url_norm: draft.url.as_deref().map(normalize_url),
            starts_at: draft.starts_at,
            completeness: draft.completeness(),
            fetched_at: draft.fetched_at,
        }
    }

    pub fn from_event(event: &Event, source_priority: i64) -> Self {
        let completeness = [
            event.source_event_id.is_some(),
            event.description.is_some(),
            event.ends_at.is_some(),
            event.venue.is_some(),
            event.address.is_some(),
            event.category.is_some(),
            event.url.is_some(),
            event.ticket_url.is_some(),
            event.image_url.is_some(),
            event.organizer.is_some(),
            event.price_text.is_some(),
            event.price_min_nok.is_some(),
        ]
        .iter()
        .filter(|populated| **populated)
        .count() as u32;

        Self {
            id: Some(event.id),
            source_id: event.source_id.clone(),
            source_priority,
            signature: event.signature.clone(),
            title_norm: normalize_text(&event.title),
            venue_norm: event.venue.as_deref().map(normalize_text),
            url_norm: event.url.as_deref().map(normalize_url),
            starts_at: event.starts_at,
            completeness,
            fetched_at: event.last_seen_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    Signature,
    Url,
    Fuzzy,
}

impl MatchStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchStrategy::Signature => "signature",
            MatchStrategy::Url => "url",
            MatchStrategy::Fuzzy => "fuzzy",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct MatchPair {
    pub left: usize,
    pub right: usize,
    pub score: f64,
    pub strategy: MatchStrategy,
}

#[derive(Debug, Clone)]
pub struct Cluster {
    /// Index of the elected canonical candidate.
    pub canonical: usize,
    /// All member indices, canonical included.
    pub members: Vec<usize>,
    /// Weakest pairwise score that linked the cluster.
    pub min_score: f64,
}

#[derive(Debug, Clone, Default)]
pub struct DedupeOutcome {
    pub clusters: Vec<Cluster>,
    pub review_pairs: Vec<MatchPair>,
}

/// Disjoint-set with path compression and union by rank.
#[derive(Debug)]
pub struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u32>,
}

impl UnionFind {
    pub fn new(size: usize) -> Self {
        Self {
            parent: (0..size).collect(),
            rank: vec![0; size],
        }
    }

    pub fn find(&mut self, x: usize) -> usize {
        if self.parent[x] != x {
            let root = self.find(self.parent[x]);
            self.parent[x] = root;
        }
        self.parent[x]
    }

    pub fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }
}

pub struct DedupeEngine {
    config: DedupeConfig,
}

impl DedupeEngine {
    pub fn new(config: DedupeConfig) -> Self {
        Self { config }
    }

    /// Score one pair. Exact signature or URL agreement is conclusive;
    /// otherwise a weighted blend of title similarity and time/venue
    /// proximity decides.
    pub fn score(&self, a: &Candidate, b: &Candidate) -> (f64, MatchStrategy) {
        if a.signature == b.signature {
            return (1.0, MatchStrategy::Signature);
        }
        if let (Some(ua), Some(ub)) = (&a.url_norm, &b.url_norm) {
            if ua == ub {
                return (1.0, MatchStrategy::Url);
            }
        }

        let title = jaro_winkler(&a.title_norm, &b.title_norm);
        let proximity = self.proximity_score(a, b);

        let score = match proximity {
            Some(proximity) => {
                self.config.title_weight * title + self.config.proximity_weight * proximity
            }
            // No venue on one side: title has to carry the decision alone,
            // slightly dampened so it cannot auto-merge on its own.
            None => title * 0.9,
        };
        (score, MatchStrategy::Fuzzy)
    }

    fn proximity_score(&self, a: &Candidate, b: &Candidate) -> Option<f64> {
        let (va, vb) = (a.venue_norm.as_deref()?, b.venue_norm.as_deref()?);
        let venue_sim = jaro_winkler(va, vb);

        let delta_minutes = (a.starts_at - b.starts_at).num_minutes().abs();
        let window = self.config.time_window_minutes.max(1);
        let time_factor = if delta_minutes <= window {
            1.0 - (delta_minutes as f64 / (2.0 * window as f64))
        } else {
            0.0
        };
        Some(venue_sim * time_factor)
    }

    /// Run the full pipeline over a candidate set.
    pub fn run(&self, candidates: &[Candidate]) -> DedupeOutcome {
        let mut uf = UnionFind::new(candidates.len());
        let mut merge_pairs: Vec<MatchPair> = Vec::new();
        let mut review_pairs: Vec<MatchPair> = Vec::new();

        // Block by calendar day: events more than a day apart are never
        // duplicates, and the quadratic scan stays small per block.
        let mut order: Vec<usize> = (0..candidates.len()).collect();
        order.sort_by_key(|&i| candidates[i].starts_at);

        for (oi, &i) in order.iter().enumerate() {
            for &j in order.iter().skip(oi + 1) {
                let gap = (candidates[j].starts_at - candidates[i].starts_at).num_hours();
                if gap > 24 {
                    break;
                }
                let (score, strategy) = self.score(&candidates[i], &candidates[j]);
                if score >= self.config.merge_threshold {
                    uf.union(i, j);
                    merge_pairs.push(MatchPair {
                        left: i,
                        right: j,
                        score,
                        strategy,
                    });
                } else if score >= self.config.review_threshold {
                    review_pairs.push(MatchPair {
                        left: i,
                        right: j,
                        score,
                        strategy,
                    });
                }
            }
        }

        let mut groups: std::collections::HashMap<usize, Vec<usize>> =
            std::collections::HashMap::new();
        for index in 0..candidates.len() {
            groups.entry(uf.find(index)).or_default().push(index);
        }

        let mut clusters = Vec::new();
        for (_root, members) in groups {
            if members.len() < 2 {
                continue;
            }
            let canonical = select_canonical(candidates, &members);
            let min_score = merge_pairs
                .iter()
                .filter(|pair| members.contains(&pair.left) && members.contains(&pair.right))
                .map(|pair| pair.score)
                .fold(f64::INFINITY, f64::min);
            debug!(
                cluster_size = members.len(),
                canonical_source = %candidates[canonical].source_id,
                "duplicate cluster formed"
            );
            clusters.push(Cluster {
                canonical,
                members,
                min_score,
            });
        }
        clusters.sort_by_key(|c| c.members.clone());

        // Review pairs that ended up merged anyway are dropped.
        review_pairs.retain(|pair| uf.find(pair.left) != uf.find(pair.right));

        DedupeOutcome {
            clusters,
            review_pairs,
        }
    }
}

/// Elect the canonical record: most trusted source first, then the most
/// complete record, then the most recently seen one.
fn select_canonical(candidates: &[Candidate], members: &[usize]) -> usize {
    *members
        .iter()
        .min_by(|&&a, &&b| {
            let ca = &candidates[a];
            let cb = &candidates[b];
            ca.source_priority
                .cmp(&cb.source_priority)
                .then(cb.completeness.cmp(&ca.completeness))
                .then(cb.fetched_at.cmp(&ca.fetched_at))
        })
        .expect("clusters always have members")
}
