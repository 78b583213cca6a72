//! The dedup ledger: which games have already been analyzed.
//!
//! Known identifiers are kept in memory as raw ids (provider prefix
//! stripped). The set is seeded once from storage by a bounded,
//! paginated load that can never block its callers for longer than the
//! overall budget:
//!
//! - pages of `page_size` rows are read in increasing offset order
//! - each page read gets `per_page_timeout_ms`
//! - the whole load gets `overall_timeout_ms`, after which the ledger is
//!   marked initialized with whatever was loaded
//! - loading stops early on a short page, a failed or timed-out page, or
//!   after `max_pages`
//!
//! Concurrent callers of [`DedupLedger::init_known_ids`] share one load.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use vigil_types::GameRecord;

use crate::store::RecordStore;

/// Tuning for the dedup ledger.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DedupPolicy {
    /// Table holding analyzed games.
    #[serde(default = "default_table")]
    pub table: String,

    /// Column carrying the game identifier.
    #[serde(default = "default_id_field")]
    pub id_field: String,

    /// Rows per page.
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Upper bound on pages read during one load.
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,

    /// Budget for a single page read.
    #[serde(default = "default_per_page_timeout_ms")]
    pub per_page_timeout_ms: u64,

    /// Budget for the whole load.
    #[serde(default = "default_overall_timeout_ms")]
    pub overall_timeout_ms: u64,

    /// Provider prefixes stripped from identifiers.
    #[serde(default = "default_id_prefixes")]
    pub id_prefixes: Vec<String>,
}

impl Default for DedupPolicy {
    fn default() -> Self {
        Self {
            table: default_table(),
            id_field: default_id_field(),
            page_size: default_page_size(),
            max_pages: default_max_pages(),
            per_page_timeout_ms: default_per_page_timeout_ms(),
            overall_timeout_ms: default_overall_timeout_ms(),
            id_prefixes: default_id_prefixes(),
        }
    }
}

fn default_table() -> String {
    "analyzed_games".to_owned()
}

fn default_id_field() -> String {
    "game_id".to_owned()
}

const fn default_page_size() -> u32 {
    1_000
}

const fn default_max_pages() -> u32 {
    50
}

const fn default_per_page_timeout_ms() -> u64 {
    4_000
}

const fn default_overall_timeout_ms() -> u64 {
    15_000
}

fn default_id_prefixes() -> Vec<String> {
    vec!["lichess_".to_owned(), "chesscom_".to_owned()]
}

/// Why a load stopped reading pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// A page came back shorter than `page_size`.
    Exhausted,
    /// A page read returned an error.
    PageError,
    /// A page read exceeded its budget.
    PageTimeout,
    /// `max_pages` pages were read.
    MaxPages,
    /// The overall budget ran out.
    OverallTimeout,
}

/// Summary of one initialization load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitReport {
    /// Identifiers read from storage.
    pub loaded: u64,
    /// Pages read successfully.
    pub pages: u32,
    /// Why the load stopped.
    pub stop: StopReason,
}

/// Strip at most one recognized provider prefix from `id`.
///
/// A prefix is only stripped when what remains is non-empty and does not
/// itself start with a recognized prefix, which makes the function
/// idempotent: `to_raw_id(to_raw_id(x)) == to_raw_id(x)`.
pub fn to_raw_id<'a>(id: &'a str, prefixes: &[String]) -> &'a str {
    let recognized = |s: &str| {
        prefixes
            .iter()
            .any(|p| !p.is_empty() && s.starts_with(p.as_str()))
    };
    for prefix in prefixes.iter().filter(|p| !p.is_empty()) {
        if let Some(rest) = id.strip_prefix(prefix.as_str()) {
            if !rest.is_empty() && !recognized(rest) {
                return rest;
            }
        }
    }
    id
}

type InitFuture = Shared<BoxFuture<'static, InitReport>>;

#[derive(Debug, Default)]
struct KnownIds {
    ids: RwLock<HashSet<String>>,
    initialized: AtomicBool,
    generation: AtomicU64,
}

impl KnownIds {
    /// Insert ids loaded under `generation`; ignored after a reset.
    fn extend_if_current(&self, generation: u64, ids: Vec<String>) -> usize {
        let mut set = self.ids.write().unwrap_or_else(PoisonError::into_inner);
        if self.generation.load(Ordering::Acquire) != generation {
            return 0;
        }
        let before = set.len();
        set.extend(ids);
        set.len().saturating_sub(before)
    }
}

/// In-memory set of analyzed game identifiers with bounded initialization.
pub struct DedupLedger<S> {
    store: Arc<S>,
    policy: DedupPolicy,
    known: Arc<KnownIds>,
    in_flight: Mutex<Option<InitFuture>>,
}

impl<S: RecordStore> std::fmt::Debug for DedupLedger<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupLedger")
            .field("policy", &self.policy)
            .field("known", &self.known_count())
            .field("initialized", &self.is_initialized())
            .finish_non_exhaustive()
    }
}

impl<S: RecordStore> DedupLedger<S> {
    /// Create an empty, uninitialized ledger over `store`.
    pub fn new(store: Arc<S>, policy: DedupPolicy) -> Self {
        Self {
            store,
            policy,
            known: Arc::new(KnownIds::default()),
            in_flight: Mutex::new(None),
        }
    }

    /// The active policy.
    pub const fn policy(&self) -> &DedupPolicy {
        &self.policy
    }

    /// Seed the known set from storage.
    ///
    /// The first caller starts the load; everyone else, concurrently or
    /// later, awaits the same result until [`reset_known_ids`](Self::reset_known_ids).
    pub async fn init_known_ids(&self) -> InitReport {
        let load = {
            let mut slot = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = slot.as_ref() {
                existing.clone()
            } else {
                let load = load_known_ids(
                    Arc::clone(&self.store),
                    self.policy.clone(),
                    Arc::clone(&self.known),
                )
                .boxed()
                .shared();
                *slot = Some(load.clone());
                load
            }
        };
        load.await
    }

    /// Strip this ledger's provider prefixes from `id`.
    pub fn to_raw_id<'a>(&self, id: &'a str) -> &'a str {
        to_raw_id(id, &self.policy.id_prefixes)
    }

    /// Whether `id` (prefixed or raw) has been analyzed.
    pub fn is_known(&self, id: &str) -> bool {
        let raw = self.to_raw_id(id);
        self.known
            .ids
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(raw)
    }

    /// Record `id` as analyzed. Returns `true` if it was new.
    pub fn mark_known(&self, id: &str) -> bool {
        let raw = self.to_raw_id(id).to_owned();
        self.known
            .ids
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(raw)
    }

    /// Keep only games that have an identifier and are not yet known.
    ///
    /// Repeats within the batch are dropped too, so the engine never sees
    /// the same game twice in one unit.
    pub fn filter_fresh_games(&self, games: Vec<GameRecord>) -> Vec<GameRecord> {
        let known = self.known.ids.read().unwrap_or_else(PoisonError::into_inner);
        let mut seen: HashSet<String> = HashSet::new();
        let total = games.len();
        let fresh: Vec<GameRecord> = games
            .into_iter()
            .filter(|game| {
                game.identifier().is_some_and(|id| {
                    let raw = to_raw_id(id, &self.policy.id_prefixes);
                    !known.contains(raw) && seen.insert(raw.to_owned())
                })
            })
            .collect();
        debug!(total, fresh = fresh.len(), "filtered batch against ledger");
        fresh
    }

    /// Forget every known id and allow a fresh load.
    pub fn reset_known_ids(&self) {
        let mut slot = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        {
            let mut ids = self.known.ids.write().unwrap_or_else(PoisonError::into_inner);
            ids.clear();
            self.known.generation.fetch_add(1, Ordering::AcqRel);
        }
        self.known.initialized.store(false, Ordering::Release);
        *slot = None;
        info!("dedup ledger reset");
    }

    /// Number of known ids.
    pub fn known_count(&self) -> usize {
        self.known.ids.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether a load has completed (possibly partially).
    pub fn is_initialized(&self) -> bool {
        self.known.initialized.load(Ordering::Acquire)
    }
}

#[derive(Debug, Default)]
struct Progress {
    loaded: AtomicU64,
    pages: AtomicU32,
}

async fn load_known_ids<S: RecordStore>(
    store: Arc<S>,
    policy: DedupPolicy,
    known: Arc<KnownIds>,
) -> InitReport {
    let generation = known.generation.load(Ordering::Acquire);
    let progress = Progress::default();
    let overall = Duration::from_millis(policy.overall_timeout_ms);

    let stop = tokio::time::timeout(
        overall,
        read_pages(&*store, &policy, &known, generation, &progress),
    )
    .await
    .unwrap_or_else(|_elapsed| {
        warn!(
            budget_ms = policy.overall_timeout_ms,
            "dedup load exceeded overall budget, continuing with partial set"
        );
        StopReason::OverallTimeout
    });

    if known.generation.load(Ordering::Acquire) == generation {
        known.initialized.store(true, Ordering::Release);
    }

    let report = InitReport {
        loaded: progress.loaded.load(Ordering::Relaxed),
        pages: progress.pages.load(Ordering::Relaxed),
        stop,
    };
    info!(
        loaded = report.loaded,
        pages = report.pages,
        stop = ?report.stop,
        "dedup ledger initialized"
    );
    report
}

async fn read_pages<S: RecordStore>(
    store: &S,
    policy: &DedupPolicy,
    known: &KnownIds,
    generation: u64,
    progress: &Progress,
) -> StopReason {
    let per_page = Duration::from_millis(policy.per_page_timeout_ms);
    let page_size = policy.page_size.max(1);
    let mut offset: u64 = 0;

    loop {
        if progress.pages.load(Ordering::Relaxed) >= policy.max_pages {
            return StopReason::MaxPages;
        }

        let rows = match tokio::time::timeout(
            per_page,
            store.select_range(&policy.table, offset, page_size),
        )
        .await
        {
            Ok(Ok(rows)) => rows,
            Ok(Err(e)) => {
                warn!(offset, error = %e, "dedup page read failed");
                return StopReason::PageError;
            }
            Err(_elapsed) => {
                warn!(offset, budget_ms = policy.per_page_timeout_ms, "dedup page read timed out");
                return StopReason::PageTimeout;
            }
        };

        let row_count = rows.len();
        let ids: Vec<String> = rows
            .iter()
            .filter_map(|row| row_id(row, &policy.id_field))
            .map(|id| to_raw_id(&id, &policy.id_prefixes).to_owned())
            .collect();
        let id_count = u64::try_from(ids.len()).unwrap_or(u64::MAX);
        known.extend_if_current(generation, ids);
        progress.loaded.fetch_add(id_count, Ordering::Relaxed);
        progress.pages.fetch_add(1, Ordering::Relaxed);
        debug!(offset, rows = row_count, "dedup page loaded");

        if u32::try_from(row_count).is_ok_and(|n| n < page_size) {
            return StopReason::Exhausted;
        }
        offset = offset.saturating_add(u64::from(page_size));
    }
}

fn row_id(row: &Value, field: &str) -> Option<String> {
    match row.get(field)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
