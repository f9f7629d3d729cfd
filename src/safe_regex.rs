//! Time-bounded regex execution.
//!
//! `regex` already guarantees linear-time matching, so catastrophic backtracking is
//! not possible here; what remains is unbounded *work* on hostile inputs (huge
//! haystacks, huge compiled programs, many matches). `sub` and `findall` check a
//! wall-clock deadline between matches; `search` and `match_start` run a single
//! match and compare its elapsed time afterwards, so their budget is checked
//! after the fact rather than enforced during the match. Compiled programs are
//! size-limited. A blown budget degrades to the operation's safe default and bumps
//! a counter; nothing is ever raised to the caller.

use ahash::AHashMap;
use parking_lot::Mutex;
use regex::{Captures, Regex, RegexBuilder};
use std::borrow::Cow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(100);
const COMPILED_SIZE_LIMIT: usize = 1 << 20;
const CACHE_CAPACITY: usize = 256;

/// Subset of Python-style flags callers need.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct RegexFlags {
    pub ignore_case: bool,
    pub multi_line: bool,
    pub dot_all: bool,
}

impl RegexFlags {
    pub const NONE: RegexFlags = RegexFlags { ignore_case: false, multi_line: false, dot_all: false };
    pub const IGNORE_CASE: RegexFlags = RegexFlags { ignore_case: true, multi_line: false, dot_all: false };

    pub fn multi_line(mut self) -> Self {
        self.multi_line = true;
        self
    }
}

pub struct SafeRegex {
    timeout: Duration,
    cache: Mutex<AHashMap<(String, RegexFlags), Regex>>,
    timeouts: AtomicU64,
}

impl Default for SafeRegex {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl SafeRegex {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout, cache: Mutex::new(AHashMap::new()), timeouts: AtomicU64::new(0) }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn timeout_count(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    pub fn reset_timeout_count(&self) {
        self.timeouts.store(0, Ordering::Relaxed);
    }

    /// Drop every cached compiled program. Registered as a memory reclaim hook.
    pub fn clear_cache(&self) -> usize {
        let mut cache = self.cache.lock();
        let n = cache.len();
        cache.clear();
        cache.shrink_to_fit();
        n
    }

    fn compiled(&self, pattern: &str, flags: RegexFlags) -> Option<Regex> {
        let key = (pattern.to_string(), flags);
        if let Some(re) = self.cache.lock().get(&key) {
            return Some(re.clone());
        }
        let built = RegexBuilder::new(pattern)
            .case_insensitive(flags.ignore_case)
            .multi_line(flags.multi_line)
            .dot_matches_new_line(flags.dot_all)
            .size_limit(COMPILED_SIZE_LIMIT)
            .dfa_size_limit(COMPILED_SIZE_LIMIT)
            .build();
        match built {
            Ok(re) => {
                let mut cache = self.cache.lock();
                if cache.len() >= CACHE_CAPACITY {
                    cache.clear();
                }
                cache.insert(key, re.clone());
                Some(re)
            }
            Err(e) => {
                tracing::warn!("rejecting regex pattern {:?}: {}", pattern, e);
                None
            }
        }
    }

    fn record_timeout(&self, op: &str, pattern: &str, text_len: usize) {
        let n = self.timeouts.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::warn!(
            "regex {} exceeded {:?} (pattern {:?}, {} bytes of input, {} timeouts so far)",
            op, self.timeout, pattern, text_len, n
        );
    }

    /// First match anywhere in `text`, or `None` (also on timeout or bad pattern).
    ///
    /// A single `captures` call cannot be interrupted, so the budget here is
    /// checked after the match returns rather than enforced during it.
    pub fn search<'t>(&self, pattern: &str, text: &'t str, flags: RegexFlags) -> Option<Captures<'t>> {
        let re = self.compiled(pattern, flags)?;
        let started = Instant::now();
        let caps = re.captures(text);
        if started.elapsed() > self.timeout {
            self.record_timeout("search", pattern, text.len());
            return None;
        }
        caps
    }

    /// Match anchored at the start of `text`.
    pub fn match_start<'t>(&self, pattern: &str, text: &'t str, flags: RegexFlags) -> Option<Captures<'t>> {
        // Leftmost semantics: if any match starts at 0, the first match does.
        self.search(pattern, text, flags)
            .filter(|c| c.get(0).map_or(false, |m| m.start() == 0))
    }

    /// Replace every match; `repl` accepts `\1`-style or `$1`-style group references.
    /// Returns `text` unchanged on timeout or bad pattern.
    pub fn sub(&self, pattern: &str, repl: &str, text: &str, flags: RegexFlags) -> String {
        let Some(re) = self.compiled(pattern, flags) else { return text.to_string() };
        let repl = expand_backrefs(repl);
        let deadline = Instant::now() + self.timeout;

        let mut out = String::with_capacity(text.len());
        let mut last = 0usize;
        for caps in re.captures_iter(text) {
            if Instant::now() > deadline {
                self.record_timeout("sub", pattern, text.len());
                return text.to_string();
            }
            let Some(m) = caps.get(0) else { continue };
            out.push_str(&text[last..m.start()]);
            caps.expand(&repl, &mut out);
            last = m.end();
        }
        if Instant::now() > deadline {
            self.record_timeout("sub", pattern, text.len());
            return text.to_string();
        }
        out.push_str(&text[last..]);
        out
    }

    /// All non-overlapping matches. With exactly one capture group, that group's
    /// text is returned instead of the whole match. Empty on timeout.
    pub fn findall(&self, pattern: &str, text: &str, flags: RegexFlags) -> Vec<String> {
        self.findall_groups(pattern, text, flags)
            .into_iter()
            .map(|mut groups| if groups.len() == 1 { groups.remove(0) } else { groups.join("") })
            .collect()
    }

    /// Like `findall`, keeping each capture group (or the whole match when the
    /// pattern has none) as its own element.
    pub fn findall_groups(&self, pattern: &str, text: &str, flags: RegexFlags) -> Vec<Vec<String>> {
        let Some(re) = self.compiled(pattern, flags) else { return Vec::new() };
        let deadline = Instant::now() + self.timeout;
        let group_count = re.captures_len().saturating_sub(1);

        let mut found = Vec::new();
        for caps in re.captures_iter(text) {
            if Instant::now() > deadline {
                self.record_timeout("findall", pattern, text.len());
                return Vec::new();
            }
            let row = if group_count == 0 {
                vec![caps.get(0).map_or(String::new(), |m| m.as_str().to_string())]
            } else {
                (1..=group_count)
                    .map(|i| caps.get(i).map_or(String::new(), |m| m.as_str().to_string()))
                    .collect()
            };
            found.push(row);
        }
        found
    }
}

/// Convert `\1`..`\99` references to the `${1}` form `regex` expands; `$` passes through.
fn expand_backrefs(repl: &str) -> Cow<'_, str> {
    static BACKREF: OnceLock<Regex> = OnceLock::new();
    let re = BACKREF.get_or_init(|| Regex::new(r"\\(\d{1,2})").expect("static backref pattern"));
    re.replace_all(repl, "$${$1}")
}
