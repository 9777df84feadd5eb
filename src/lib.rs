//! # ccn-nametree
//!
//! Name-indexed store for a CCN content store: a cookie-indexed entry table
//! paired with a probabilistic skiplist ordered by canonical (flattened) name
//! bytes, plus the doubly-linked level-0 chain used for ordered traversal.
//!
//! Entries are owned by the caller. [`NameTree::enroll`] moves an entry into
//! the tree and hands back a [`Cookie`]; [`NameTree::remove`] unlinks it and
//! hands the entry back, ready to be enrolled again under a fresh cookie.
//!
//! ## Example
//!
//! ```rust
//! use ccn_nametree::{Entry, ErrorKind, NameTree};
//!
//! let mut tree: NameTree<&str> = NameTree::new();
//! let a = tree.enroll(Entry::new(b"a", "first")).unwrap();
//! tree.enroll(Entry::new(b"b", "second")).unwrap();
//! tree.enroll(Entry::new(b"aa", "third")).unwrap();
//!
//! let names: Vec<&[u8]> = tree.iter().map(|e| e.name()).collect();
//! assert_eq!(names, [&b"a"[..], &b"aa"[..], &b"b"[..]]);
//!
//! let err = tree.enroll(Entry::new(b"b", "again")).unwrap_err();
//! assert_eq!(err.kind(), ErrorKind::DuplicateKey);
//!
//! let entry = tree.remove(a).unwrap();
//! assert!(!entry.is_linked());
//! assert!(tree.get(a).is_none());
//! ```

#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::fmt;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, error, trace, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Maximum number of skiplist levels an entry may participate in.
pub const MAX_DEPTH: usize = 30;

const DEFAULT_CAPACITY: usize = 1024;
const DEFAULT_MAX_CAPACITY: usize = 1 << 24;

/// Construction parameters for a [`NameTree`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NameTreeConfig {
    /// Initial number of cookie-table slots (rounded up to a power of two).
    pub initial_capacity: usize,
    /// Upper bound for cookie-table growth (rounded up to a power of two).
    pub max_capacity: usize,
    /// Seed for the leveling random source. `None` draws from OS entropy.
    pub seed: Option<u64>,
}

impl Default for NameTreeConfig {
    fn default() -> Self {
        Self {
            initial_capacity: DEFAULT_CAPACITY,
            max_capacity: DEFAULT_MAX_CAPACITY,
            seed: None,
        }
    }
}

impl NameTreeConfig {
    pub fn with_initial_capacity(mut self, slots: usize) -> Self {
        self.initial_capacity = slots;
        self
    }

    pub fn with_max_capacity(mut self, slots: usize) -> Self {
        self.max_capacity = slots;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// (initial, max) slot counts, both powers of two with `initial <= max`.
    fn capacities(&self) -> (usize, usize) {
        let initial = self.initial_capacity.max(1).next_power_of_two();
        let max = self.max_capacity.max(1).next_power_of_two().max(initial);
        (initial, max)
    }
}

// =============================================================================
// Cookie
// =============================================================================

/// Opaque handle of a linked entry.
///
/// Cookies are strictly increasing over the lifetime of a tree and never
/// reused. The zero value, [`Cookie::NONE`], means "no entry" and also
/// terminates level links.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Debug)]
pub struct Cookie(u64);

impl Cookie {
    pub const NONE: Cookie = Cookie(0);

    #[inline]
    pub fn get(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn is_some(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Why an enrollment was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ErrorKind {
    /// An entry with exactly the same name is already linked.
    #[error("an entry with the same name is already enrolled")]
    DuplicateKey,
    /// Every cookie-table slot is held by a live entry and the table is
    /// already at its configured maximum size.
    #[error("cookie {cookie} maps to occupied table slot {slot}")]
    CookieCollision { cookie: Cookie, slot: usize },
}

/// A refused enrollment. The rejected entry is handed back unlinked.
#[derive(thiserror::Error)]
#[error("{kind}")]
pub struct EnrollError<V> {
    kind: ErrorKind,
    entry: Entry<V>,
}

impl<V> EnrollError<V> {
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn entry(&self) -> &Entry<V> {
        &self.entry
    }

    pub fn into_entry(self) -> Entry<V> {
        self.entry
    }
}

impl<V> fmt::Debug for EnrollError<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnrollError")
            .field("kind", &self.kind)
            .field("name", &self.entry.name())
            .finish_non_exhaustive()
    }
}

/// Structural inconsistency. Never recoverable: the index can no longer be
/// trusted, so this logs and panics.
#[cold]
#[inline(never)]
#[track_caller]
fn corruption(what: fmt::Arguments<'_>) -> ! {
    error!(%what, "nametree corruption detected");
    panic!("nametree corruption detected: {what}");
}

// =============================================================================
// Entry
// =============================================================================

/// One indexed record: canonical name, payload, and its skiplist links.
///
/// `links[i]` is the successor at level `i`; the vector is empty while the
/// entry is unlinked and has the entry's height while it is linked.
pub struct Entry<V> {
    name: Box<[u8]>,
    value: V,
    cookie: Cookie,
    links: Vec<Cookie>,
    prev: Cookie,
}

impl<V> Entry<V> {
    /// Creates an unlinked entry for an already-flattened name.
    pub fn new(name: impl AsRef<[u8]>, value: V) -> Self {
        Self {
            name: name.as_ref().into(),
            value,
            cookie: Cookie::NONE,
            links: Vec::new(),
            prev: Cookie::NONE,
        }
    }

    #[inline]
    pub fn name(&self) -> &[u8] {
        &self.name
    }

    #[inline]
    pub fn value(&self) -> &V {
        &self.value
    }

    /// Only reachable while the caller owns the entry; linked payloads are
    /// reached through [`NameTree::get_mut`].
    #[inline]
    pub fn value_mut(&mut self) -> &mut V {
        &mut self.value
    }

    /// The cookie the entry is linked under, or [`Cookie::NONE`].
    #[inline]
    pub fn cookie(&self) -> Cookie {
        self.cookie
    }

    /// Number of skiplist levels the entry participates in (0 when unlinked).
    #[inline]
    pub fn height(&self) -> usize {
        self.links.len()
    }

    #[inline]
    pub fn is_linked(&self) -> bool {
        !self.links.is_empty()
    }

    pub fn into_parts(self) -> (Box<[u8]>, V) {
        (self.name, self.value)
    }

    fn unlink(&mut self) {
        self.links = Vec::new();
        self.cookie = Cookie::NONE;
        self.prev = Cookie::NONE;
    }

    fn clone_linked(&self) -> Self
    where
        V: Clone,
    {
        Self {
            name: self.name.clone(),
            value: self.value.clone(),
            cookie: self.cookie,
            links: self.links.clone(),
            prev: self.prev,
        }
    }
}

/// Clones name and payload only; the copy is unlinked.
impl<V: Clone> Clone for Entry<V> {
    fn clone(&self) -> Self {
        Self::new(&self.name, self.value.clone())
    }
}

impl<V: fmt::Debug> fmt::Debug for Entry<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("name", &self.name)
            .field("value", &self.value)
            .field("cookie", &self.cookie)
            .field("height", &self.links.len())
            .finish()
    }
}

// =============================================================================
// Cookie table
// =============================================================================

/// Fixed-size slot array addressed by `cookie & mask`. Holds the linked
/// entries themselves, so it doubles as the entry arena.
struct CookieTable<V> {
    slots: Vec<Option<Entry<V>>>,
    mask: u64,
}

impl<V> CookieTable<V> {
    fn with_capacity(capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two());
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            mask: capacity as u64 - 1,
        }
    }

    #[inline]
    fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    fn slot_of(&self, cookie: Cookie) -> usize {
        (cookie.0 & self.mask) as usize
    }

    /// The slot's entry, only if it is the one carrying `cookie`.
    #[inline]
    fn get(&self, cookie: Cookie) -> Option<&Entry<V>> {
        if cookie.is_none() {
            return None;
        }
        self.slots[self.slot_of(cookie)]
            .as_ref()
            .filter(|e| e.cookie == cookie)
    }

    #[inline]
    fn get_mut(&mut self, cookie: Cookie) -> Option<&mut Entry<V>> {
        if cookie.is_none() {
            return None;
        }
        let slot = self.slot_of(cookie);
        self.slots[slot].as_mut().filter(|e| e.cookie == cookie)
    }

    #[inline]
    fn is_free(&self, cookie: Cookie) -> bool {
        self.slots[self.slot_of(cookie)].is_none()
    }

    /// Stores a linked entry in its slot, or returns it if the slot is taken.
    fn place(&mut self, entry: Entry<V>) -> Result<(), Entry<V>> {
        let slot = self.slot_of(entry.cookie);
        match &self.slots[slot] {
            Some(_) => Err(entry),
            None => {
                self.slots[slot] = Some(entry);
                Ok(())
            }
        }
    }

    fn take(&mut self, cookie: Cookie) -> Option<Entry<V>> {
        self.get(cookie)?;
        let slot = self.slot_of(cookie);
        self.slots[slot].take()
    }

    fn live(&self) -> impl Iterator<Item = &Entry<V>> {
        self.slots.iter().flatten()
    }

    /// Live cookies are distinct, so they stay distinct under a wider mask.
    fn rehash(&mut self, capacity: usize) {
        let old = std::mem::replace(self, Self::with_capacity(capacity));
        for entry in old.slots.into_iter().flatten() {
            if let Err(entry) = self.place(entry) {
                corruption(format_args!(
                    "cookie {} collided while rehashing to {capacity} slots",
                    entry.cookie
                ));
            }
        }
    }
}

impl<V: Clone> Clone for CookieTable<V> {
    fn clone(&self) -> Self {
        Self {
            slots: self
                .slots
                .iter()
                .map(|s| s.as_ref().map(Entry::clone_linked))
                .collect(),
            mask: self.mask,
        }
    }
}

// =============================================================================
// NameTree
// =============================================================================

/// Skiplist of entries ordered by canonical name bytes, addressed by cookie.
///
/// Single-threaded: every operation is a synchronous, expected O(log n)
/// in-memory edit.
pub struct NameTree<V> {
    table: CookieTable<V>,
    /// First entry at each level; the length is the number of active levels.
    heads: Vec<Cookie>,
    /// Entry with the greatest name.
    tail: Cookie,
    /// Last cookie handed out.
    last_cookie: u64,
    count: usize,
    max_capacity: usize,
    rng: StdRng,
}

impl<V> NameTree<V> {
    pub fn new() -> Self {
        Self::with_config(NameTreeConfig::default())
    }

    pub fn with_config(config: NameTreeConfig) -> Self {
        let (initial, max_capacity) = config.capacities();
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            table: CookieTable::with_capacity(initial),
            heads: Vec::new(),
            tail: Cookie::NONE,
            last_cookie: 0,
            count: 0,
            max_capacity,
            rng,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Current number of cookie-table slots.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.table.capacity()
    }

    /// Number of skiplist levels in use. Grows lazily, never shrinks.
    #[inline]
    pub fn active_levels(&self) -> usize {
        self.heads.len()
    }

    // -------------------------------------------------------------------------
    // Link plumbing
    // -------------------------------------------------------------------------

    /// Resolves a cookie that the structure says is linked.
    fn resolve(&self, cookie: Cookie) -> &Entry<V> {
        match self.table.get(cookie) {
            Some(entry) => entry,
            None => corruption(format_args!("link to unknown cookie {cookie}")),
        }
    }

    fn resolve_mut(&mut self, cookie: Cookie) -> &mut Entry<V> {
        match self.table.get_mut(cookie) {
            Some(entry) => entry,
            None => corruption(format_args!("link to unknown cookie {cookie}")),
        }
    }

    #[inline]
    fn follow(&self, cookie: Cookie) -> Option<&Entry<V>> {
        cookie.is_some().then(|| self.resolve(cookie))
    }

    /// Level-`level` successor of `at`, where `Cookie::NONE` stands for the
    /// head array.
    fn link(&self, at: Cookie, level: usize) -> Cookie {
        if at.is_none() {
            return self.heads[level];
        }
        match self.resolve(at).links.get(level) {
            Some(&next) => next,
            None => corruption(format_args!("cookie {at} has no link at level {level}")),
        }
    }

    fn link_mut(&mut self, at: Cookie, level: usize) -> &mut Cookie {
        if at.is_none() {
            return &mut self.heads[level];
        }
        match self.resolve_mut(at).links.get_mut(level) {
            Some(next) => next,
            None => corruption(format_args!("cookie {at} has no link at level {level}")),
        }
    }

    // -------------------------------------------------------------------------
    // Skiplist
    // -------------------------------------------------------------------------

    /// Finds, at every active level, the last link holder whose successor does
    /// not sort after `name`.
    ///
    /// Returns the holders (`Cookie::NONE` meaning the head array) and whether
    /// an entry named exactly `name` was met. With `wanted` set, only that
    /// entry counts as a match.
    fn find_before(&self, name: &[u8], wanted: Cookie) -> ([Cookie; MAX_DEPTH], bool) {
        let mut preds = [Cookie::NONE; MAX_DEPTH];
        let mut found = false;
        let mut at = Cookie::NONE;
        for level in (0..self.heads.len()).rev() {
            loop {
                let next = self.link(at, level);
                if next.is_none() {
                    break;
                }
                let y = self.resolve(next);
                match y.name[..].cmp(name) {
                    Ordering::Greater => break,
                    Ordering::Equal if wanted.is_none() || wanted == next => {
                        found = true;
                        break;
                    }
                    _ => {}
                }
                if y.links.len() <= level {
                    corruption(format_args!(
                        "cookie {next} reached at level {level} with height {}",
                        y.links.len()
                    ));
                }
                at = next;
            }
            preds[level] = at;
        }
        (preds, found)
    }

    /// Geometric height: each extra level is kept with probability 1/4.
    fn choose_height(&mut self) -> usize {
        let mut height = 1;
        while height < MAX_DEPTH && self.rng.gen_ratio(1, 4) {
            height += 1;
        }
        height
    }

    /// Draws a height for `name` and finds its predecessors, refusing names
    /// that are already linked. Touches nothing but the leveling source.
    fn locate(&mut self, name: &[u8]) -> Result<(usize, [Cookie; MAX_DEPTH]), ErrorKind> {
        let height = self.choose_height();
        let (preds, found) = self.find_before(name, Cookie::NONE);
        if found {
            return Err(ErrorKind::DuplicateKey);
        }
        Ok((height, preds))
    }

    /// Splices `entry` (already carrying its cookie) into levels
    /// `0..height` after `preds`. The entry is not yet in the table.
    fn insert(&mut self, entry: &mut Entry<V>, height: usize, preds: &[Cookie; MAX_DEPTH]) {
        if self.heads.len() < height {
            debug!(from = self.heads.len(), to = height, "growing skiplist levels");
            self.heads.resize(height, Cookie::NONE);
        }

        let mut links = Vec::with_capacity(height);
        for (level, &pred) in preds.iter().enumerate().take(height) {
            links.push(std::mem::replace(self.link_mut(pred, level), entry.cookie));
        }
        entry.links = links;

        let next = entry.links[0];
        if next.is_none() {
            entry.prev = self.tail;
            self.tail = entry.cookie;
        } else {
            let next = self.resolve_mut(next);
            entry.prev = std::mem::replace(&mut next.prev, entry.cookie);
        }
    }

    // -------------------------------------------------------------------------
    // Public operations
    // -------------------------------------------------------------------------

    /// Links `entry` under a fresh cookie.
    ///
    /// On failure the entry comes back unlinked inside the error. A duplicate
    /// name leaves the tree untouched; a collision consumes one cookie.
    pub fn enroll(&mut self, mut entry: Entry<V>) -> Result<Cookie, EnrollError<V>> {
        if entry.is_linked() {
            corruption(format_args!("enrolling an entry that is already linked"));
        }
        let (height, preds) = match self.locate(&entry.name) {
            Ok(found) => found,
            Err(kind) => return Err(EnrollError { kind, entry }),
        };
        let cookie = match self.allocate_cookie() {
            Ok(cookie) => cookie,
            Err(kind) => {
                warn!(
                    capacity = self.table.capacity(),
                    live = self.count,
                    "cookie table full, enroll refused"
                );
                return Err(EnrollError { kind, entry });
            }
        };

        entry.cookie = cookie;
        self.insert(&mut entry, height, &preds);
        if self.table.place(entry).is_err() {
            corruption(format_args!("slot for cookie {cookie} taken during enroll"));
        }
        self.count += 1;
        trace!(cookie = cookie.get(), height, "enrolled entry");
        Ok(cookie)
    }

    /// Hands out the next cookie whose slot is free, skipping cookies whose
    /// slot is held by a live entry. The table doubles once it is half full;
    /// a full table at `max_capacity` refuses with `CookieCollision`.
    fn allocate_cookie(&mut self) -> Result<Cookie, ErrorKind> {
        if self.count * 2 >= self.table.capacity() {
            self.grow();
        }
        if self.count >= self.table.capacity() {
            self.last_cookie += 1;
            let cookie = Cookie(self.last_cookie);
            return Err(ErrorKind::CookieCollision {
                cookie,
                slot: self.table.slot_of(cookie),
            });
        }
        loop {
            self.last_cookie += 1;
            let cookie = Cookie(self.last_cookie);
            if self.table.is_free(cookie) {
                return Ok(cookie);
            }
            trace!(cookie = cookie.get(), "skipping cookie with occupied slot");
        }
    }

    fn grow(&mut self) {
        let capacity = match self.table.capacity().checked_mul(2) {
            Some(c) if c <= self.max_capacity => c,
            _ => return,
        };
        debug!(
            from = self.table.capacity(),
            to = capacity,
            live = self.count,
            "growing cookie table"
        );
        self.table.rehash(capacity);
    }

    /// Unlinks the entry carrying `cookie` and hands it back.
    ///
    /// Unknown, stale or already-removed cookies are a no-op.
    pub fn remove(&mut self, cookie: Cookie) -> Option<Entry<V>> {
        let entry = self.table.get(cookie)?;
        let height = entry.links.len();
        if height == 0 || height > self.heads.len() {
            corruption(format_args!("cookie {cookie} stored with height {height}"));
        }
        let (preds, found) = self.find_before(&entry.name, cookie);
        if !found {
            corruption(format_args!("cookie {cookie} is in the table but not in the skiplist"));
        }
        for (level, &pred) in preds.iter().enumerate().take(height) {
            if self.link(pred, level) != cookie {
                corruption(format_args!("cookie {cookie} misplaced at level {level}"));
            }
        }

        let Some(mut entry) = self.table.take(cookie) else {
            corruption(format_args!("cookie {cookie} vanished during remove"));
        };
        for (level, &pred) in preds.iter().enumerate().take(height) {
            *self.link_mut(pred, level) = entry.links[level];
        }
        let next = entry.links[0];
        if next.is_none() {
            if self.tail != cookie {
                corruption(format_args!("cookie {cookie} ends level 0 but is not the tail"));
            }
            self.tail = entry.prev;
        } else {
            let next = self.resolve_mut(next);
            if next.prev != cookie {
                corruption(format_args!("predecessor link of cookie {} is broken", next.cookie));
            }
            next.prev = entry.prev;
        }

        entry.unlink();
        self.count -= 1;
        trace!(cookie = cookie.get(), height, "removed entry");
        Some(entry)
    }

    #[inline]
    pub fn get(&self, cookie: Cookie) -> Option<&Entry<V>> {
        self.table.get(cookie)
    }

    /// Payload of a linked entry. Names stay immutable while linked.
    #[inline]
    pub fn get_mut(&mut self, cookie: Cookie) -> Option<&mut V> {
        self.table.get_mut(cookie).map(|e| &mut e.value)
    }

    #[inline]
    pub fn contains(&self, cookie: Cookie) -> bool {
        self.table.get(cookie).is_some()
    }

    /// Unlinks every entry and returns them in name order.
    pub fn drain(&mut self) -> Vec<Entry<V>> {
        let mut out = Vec::with_capacity(self.count);
        let mut at = self.heads.first().copied().unwrap_or(Cookie::NONE);
        while at.is_some() {
            let Some(mut entry) = self.table.take(at) else {
                corruption(format_args!("level 0 links to unknown cookie {at}"));
            };
            at = entry.links[0];
            entry.unlink();
            out.push(entry);
        }
        if out.len() != self.count {
            corruption(format_args!("drained {} entries, expected {}", out.len(), self.count));
        }
        self.heads.fill(Cookie::NONE);
        self.tail = Cookie::NONE;
        self.count = 0;
        debug!(drained = out.len(), "drained nametree");
        out
    }

    // -------------------------------------------------------------------------
    // Ordered access
    // -------------------------------------------------------------------------

    pub fn first(&self) -> Option<&Entry<V>> {
        self.follow(self.heads.first().copied().unwrap_or(Cookie::NONE))
    }

    pub fn last(&self) -> Option<&Entry<V>> {
        self.follow(self.tail)
    }

    pub fn next(&self, cookie: Cookie) -> Option<&Entry<V>> {
        self.table.get(cookie).and_then(|e| self.follow(e.links[0]))
    }

    pub fn prev(&self, cookie: Cookie) -> Option<&Entry<V>> {
        self.table.get(cookie).and_then(|e| self.follow(e.prev))
    }

    /// (last entry sorting before `name`, first entry not sorting before it).
    fn bracket(&self, name: &[u8]) -> (Cookie, Cookie) {
        if self.heads.is_empty() {
            return (Cookie::NONE, Cookie::NONE);
        }
        let (preds, _) = self.find_before(name, Cookie::NONE);
        (preds[0], self.link(preds[0], 0))
    }

    /// Exact match by canonical name.
    pub fn lookup(&self, name: &[u8]) -> Option<&Entry<V>> {
        self.seek(name).filter(|e| e.name() == name)
    }

    /// First entry whose name is `>= name`.
    pub fn seek(&self, name: &[u8]) -> Option<&Entry<V>> {
        self.follow(self.bracket(name).1)
    }

    /// Last entry whose name is `<= name`.
    pub fn floor(&self, name: &[u8]) -> Option<&Entry<V>> {
        let (before, at) = self.bracket(name);
        match self.follow(at) {
            Some(e) if e.name() == name => Some(e),
            _ => self.follow(before),
        }
    }

    pub fn iter(&self) -> Iter<'_, V> {
        let front = self.heads.first().copied().unwrap_or(Cookie::NONE);
        Iter::new(self, front, self.tail)
    }

    /// Entries from [`seek`](Self::seek)`(name)` to the end.
    pub fn range_from(&self, name: &[u8]) -> Iter<'_, V> {
        Iter::new(self, self.bracket(name).1, self.tail)
    }

    /// The contiguous run of entries whose name starts with `prefix`.
    pub fn prefix<'a>(&'a self, prefix: &'a [u8]) -> impl Iterator<Item = &'a Entry<V>> + 'a {
        self.range_from(prefix)
            .take_while(move |e| e.name().starts_with(prefix))
    }

    // -------------------------------------------------------------------------
    // Consistency
    // -------------------------------------------------------------------------

    /// Verifies every structural invariant, panicking on the first violation.
    /// Returns the number of linked entries.
    pub fn check(&self) -> usize {
        let levels = self.heads.len();
        if levels > MAX_DEPTH {
            corruption(format_args!("{levels} active levels"));
        }
        // Last entry seen at each level; each must link to the next one that
        // is tall enough.
        let mut last = vec![Cookie::NONE; levels];
        let mut prev = Cookie::NONE;
        let mut seen = 0usize;
        let mut at = self.heads.first().copied().unwrap_or(Cookie::NONE);
        while at.is_some() {
            let e = self.resolve(at);
            if e.links.is_empty() || e.links.len() > levels {
                corruption(format_args!("cookie {at} has height {}", e.links.len()));
            }
            if e.prev != prev {
                corruption(format_args!("cookie {at} points back to {} not {prev}", e.prev));
            }
            if prev.is_some() && self.resolve(prev).name >= e.name {
                corruption(format_args!("cookie {at} is out of name order"));
            }
            for (level, holder) in last.iter_mut().enumerate().take(e.links.len()) {
                if self.link(*holder, level) != at {
                    corruption(format_args!("level {level} skips cookie {at}"));
                }
                *holder = at;
            }
            seen += 1;
            if seen > self.count {
                corruption(format_args!("level 0 is longer than {} entries", self.count));
            }
            prev = at;
            at = e.links[0];
        }
        for (level, &holder) in last.iter().enumerate() {
            if self.link(holder, level).is_some() {
                corruption(format_args!("level {level} runs past its last entry"));
            }
        }
        if self.tail != prev {
            corruption(format_args!("tail is {} but level 0 ends at {prev}", self.tail));
        }
        if seen != self.count {
            corruption(format_args!("{seen} entries linked, {} counted", self.count));
        }
        let stored = self.table.live().count();
        if stored != seen {
            corruption(format_args!("{stored} entries in the table, {seen} linked"));
        }
        for e in self.table.live() {
            if e.cookie.is_none() || e.cookie.0 > self.last_cookie {
                corruption(format_args!("table holds cookie {} never issued", e.cookie));
            }
        }
        seen
    }
}

impl<V> Default for NameTree<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone> Clone for NameTree<V> {
    fn clone(&self) -> Self {
        Self {
            table: self.table.clone(),
            heads: self.heads.clone(),
            tail: self.tail,
            last_cookie: self.last_cookie,
            count: self.count,
            max_capacity: self.max_capacity,
            rng: self.rng.clone(),
        }
    }
}

impl<V: fmt::Debug> fmt::Debug for NameTree<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.iter().map(|e| (e.name(), e.value())))
            .finish()
    }
}

// =============================================================================
// Iteration
// =============================================================================

/// Entries in name order; walks successors forward and predecessor links
/// backward.
pub struct Iter<'a, V> {
    tree: &'a NameTree<V>,
    front: Cookie,
    back: Cookie,
}

impl<'a, V> Iter<'a, V> {
    fn new(tree: &'a NameTree<V>, front: Cookie, back: Cookie) -> Self {
        if front.is_none() || back.is_none() {
            return Self {
                tree,
                front: Cookie::NONE,
                back: Cookie::NONE,
            };
        }
        Self { tree, front, back }
    }

    fn finish(&mut self) {
        self.front = Cookie::NONE;
        self.back = Cookie::NONE;
    }
}

impl<'a, V> Iterator for Iter<'a, V> {
    type Item = &'a Entry<V>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.tree.follow(self.front)?;
        if self.front == self.back {
            self.finish();
        } else {
            self.front = entry.links[0];
        }
        Some(entry)
    }
}

impl<'a, V> DoubleEndedIterator for Iter<'a, V> {
    fn next_back(&mut self) -> Option<Self::Item> {
        let entry = self.tree.follow(self.back)?;
        if self.front == self.back {
            self.finish();
        } else {
            self.back = entry.prev;
        }
        Some(entry)
    }
}


#[cfg(test)]
mod proptests;
