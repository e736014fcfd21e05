// Quality-aware backtracking search over an FM-index interval.
//
// The search consumes the presented pattern from its right end (index
// qlen-1) down to 0, narrowing the suffix-array interval one base at a time
// and branching into substitutions where the revisitability thresholds
// permit. Depth d means d characters are matched; the thresholds, the
// half-and-half bounds and the seedling positions all live in depth
// coordinates. The orchestrator chooses pattern orientations so that depth
// maps onto the read region each phase is responsible for.
//
// Conceptually recursive, implemented as a greedy descent along the read's
// own bases plus a queue of pending substitution branches ordered by the
// rounded quality of the substituted position (cheapest first, deeper on
// ties), so the next branch expanded is always the cheapest mismatch still
// open. The per-worker buffers persist across reads.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::dna::{BASE_N, comp, rounded_penalty};
use crate::ebwt::Ebwt;
use crate::hit::{Hit, MismatchSet, SinkAgent};
use crate::partial::{PartialStore, Seedling};

/// Terminal state of one backtrack() invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchState {
    Complete,
    /// The backtrack budget ran out; not an error, the read simply keeps
    /// whatever it had.
    GaveUp,
    /// One-hit mode fired.
    HitLimitReached,
}

#[derive(Debug, Clone, Copy)]
pub struct SearchResult {
    pub state: SearchState,
    pub hits: u32,
    pub provisional: u32,
    pub seedlings: u32,
}

impl SearchResult {
    pub fn hit(&self) -> bool {
        self.hits > 0
    }
}

/// How the presented pattern relates to the original read: which strand it
/// is, and whether the source served it reversed (mirror-index phases).
#[derive(Debug, Clone, Copy)]
pub struct Orientation {
    pub fw: bool,
    pub reversed: bool,
}

impl Orientation {
    pub const FW: Orientation = Orientation {
        fw: true,
        reversed: false,
    };
    pub const RC: Orientation = Orientation {
        fw: false,
        reversed: false,
    };
    pub const FW_REV: Orientation = Orientation {
        fw: true,
        reversed: true,
    };
    pub const RC_REV: Orientation = Orientation {
        fw: false,
        reversed: true,
    };

    /// Map a presented-pattern position to a 5'-relative offset of the
    /// original read.
    #[inline]
    fn read5(&self, pos: usize, len: usize) -> usize {
        if self.fw != self.reversed {
            pos
        } else {
            len - 1 - pos
        }
    }

    /// Map a presented-pattern position to the unreversed pattern of the
    /// same strand (the coordinate seedlings are stored in).
    #[inline]
    fn unreversed(&self, pos: usize, len: usize) -> usize {
        if self.reversed { len - 1 - pos } else { pos }
    }
}

/// Revisitability thresholds, in depth coordinates. A substitution consumed
/// at depth d requires d >= unrev, and the cumulative substitution count is
/// capped at 1 below rev1, 2 below rev2, 3 below rev3, and unbounded past
/// rev3 (the quality cutoff still applies there).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevOffs {
    pub unrev: u32,
    pub rev1: u32,
    pub rev2: u32,
    pub rev3: u32,
}

impl RevOffs {
    pub fn new(unrev: u32, rev1: u32, rev2: u32, rev3: u32) -> Self {
        debug_assert!(unrev <= rev1 && rev1 <= rev2 && rev2 <= rev3);
        RevOffs {
            unrev,
            rev1,
            rev2,
            rev3,
        }
    }

    /// No substitutions anywhere in a pattern of this length.
    pub fn exact(len: u32) -> Self {
        RevOffs::new(len, len, len, len)
    }

    #[inline]
    fn budget(&self, depth: u32) -> u8 {
        if depth < self.unrev {
            0
        } else if depth < self.rev1 {
            1
        } else if depth < self.rev2 {
            2
        } else if depth < self.rev3 {
            3
        } else {
            u8::MAX
        }
    }
}

/// Per-phase configuration; one Backtracker is built per worker per phase.
#[derive(Debug, Clone)]
pub struct BtConfig {
    pub offs: RevOffs,
    /// Maximum sum of rounded mismatch qualities.
    pub qual_thresh: u32,
    /// When false, substitutions are free (end-to-end modes).
    pub consider_quals: bool,
    /// Budget of substitution branches per invocation.
    pub max_bts: u32,
    pub one_hit: bool,
    /// When > 0, stop at the seed boundary and record seedlings with up to
    /// this many substitutions instead of emitting hits.
    pub report_seedlings: u32,
    /// Require at least one substitution in [0, mid) and one in [mid, end).
    pub half_and_half: Option<(u32, u32)>,
    /// Report inexact hits as provisional (1-mismatch phase 1).
    pub provisional_inexact: bool,
    /// Suppress substitution-free hits (phases whose exact case an earlier
    /// phase already covered).
    pub disallow_exact: bool,
}

impl BtConfig {
    pub fn new(offs: RevOffs) -> Self {
        BtConfig {
            offs,
            qual_thresh: u32::MAX,
            consider_quals: false,
            max_bts: u32::MAX,
            one_hit: true,
            report_seedlings: 0,
            half_and_half: None,
            provisional_inexact: false,
            disallow_exact: false,
        }
    }
}

/// A substitution edge on the current path.
#[derive(Debug, Clone, Copy)]
struct PathSub {
    /// Presented-pattern position.
    pos: u8,
    base: u8,
}

/// A substitution branch waiting to be expanded: the interval state at its
/// depth, the candidate base, and the path that leads there.
#[derive(Debug, Clone)]
struct Branch {
    /// Rounded quality of the substituted position; the queue key.
    penalty_key: u32,
    /// Depth at which the substitution is consumed.
    depth: u32,
    /// Insertion counter; the deterministic last-resort tie-break.
    seq: u64,
    /// Interval before consuming this depth.
    top: u32,
    bot: u32,
    base: u8,
    mms: u8,
    penalty: u32,
    lo_mms: u8,
    hi_mms: u8,
    subs: Vec<PathSub>,
}

impl PartialEq for Branch {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for Branch {}

impl Ord for Branch {
    // BinaryHeap pops its maximum, so "greatest" must mean "explored next":
    // the lowest-quality substitution wins, deeper branches break ties, then
    // insertion order.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .penalty_key
            .cmp(&self.penalty_key)
            .then(self.depth.cmp(&other.depth))
            .then(other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Branch {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub struct Backtracker<'a> {
    ebwt: &'a Ebwt,
    cfg: BtConfig,
    /// Present-read override: search only the first `qlen` presented
    /// positions (the seed in seedling phases).
    qlen: Option<usize>,
    rng: StdRng,
    pending: BinaryHeap<Branch>,
    seq: u64,
    backtracks: u32,
}

impl<'a> Backtracker<'a> {
    pub fn new(ebwt: &'a Ebwt, cfg: BtConfig, rng_seed: u64) -> Self {
        Backtracker {
            ebwt,
            cfg,
            qlen: None,
            rng: StdRng::seed_from_u64(rng_seed),
            pending: BinaryHeap::with_capacity(64),
            seq: 0,
            backtracks: 0,
        }
    }

    /// Adjust the thresholds (short reads shrink the seed).
    pub fn set_offs(&mut self, offs: RevOffs) {
        self.cfg.offs = offs;
    }

    pub fn set_half_and_half(&mut self, hh: Option<(u32, u32)>) {
        self.cfg.half_and_half = hh;
    }

    /// Limit the search to the first `qlen` presented positions.
    pub fn set_qlen(&mut self, qlen: Option<usize>) {
        self.qlen = qlen;
    }

    pub fn num_backtracks(&self) -> u32 {
        self.backtracks
    }

    /// Search one pattern. `muts` are presented-coordinate substitutions
    /// applied in place for the duration of the call and restored before it
    /// returns; `initial_penalty` carries their quality cost. Hits flow into
    /// `agent`; seedlings into `store`.
    #[allow(clippy::too_many_arguments)]
    pub fn backtrack(
        &mut self,
        pat: &mut [u8],
        quals: &[u8],
        name: &str,
        read_id: u32,
        orient: Orientation,
        muts: &[(u8, u8)],
        initial_penalty: u32,
        agent: &mut SinkAgent<'_>,
        store: Option<&PartialStore>,
    ) -> SearchResult {
        debug_assert_eq!(pat.len(), quals.len());
        let len = pat.len();
        let qlen = self.qlen.map_or(len, |q| q.min(len));
        debug_assert!(qlen > 0);

        // Apply mutations, remembering the original bases.
        let mut saved: Vec<(usize, u8)> = Vec::with_capacity(muts.len());
        for &(pos, base) in muts {
            let pos = pos as usize;
            saved.push((pos, pat[pos]));
            pat[pos] = base;
        }

        let result = self.run(
            pat, quals, name, read_id, orient, muts, &saved, initial_penalty, agent, store, qlen,
        );

        // Restore; the caller's buffer must compare byte-equal afterward.
        for &(pos, base) in saved.iter().rev() {
            pat[pos] = base;
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn run(
        &mut self,
        pat: &[u8],
        quals: &[u8],
        name: &str,
        read_id: u32,
        orient: Orientation,
        muts: &[(u8, u8)],
        saved: &[(usize, u8)],
        initial_penalty: u32,
        agent: &mut SinkAgent<'_>,
        store: Option<&PartialStore>,
        qlen: usize,
    ) -> SearchResult {
        let mut result = SearchResult {
            state: SearchState::Complete,
            hits: 0,
            provisional: 0,
            seedlings: 0,
        };
        self.backtracks = 0;
        self.seq = 0;
        self.pending.clear();
        // Truncated searches only make sense for seedling collection.
        debug_assert!(self.cfg.report_seedlings > 0 || qlen == pat.len());

        // The substitution-free descent runs first, queueing every eligible
        // branch it passes; one-hit mode therefore always sees an exact hit
        // before any inexact one.
        let (top, bot) = self.ebwt.whole_interval();
        let stop = self.descend(
            pat,
            quals,
            name,
            read_id,
            orient,
            muts,
            saved,
            agent,
            store,
            qlen,
            &mut result,
            0,
            top,
            bot,
            0,
            initial_penalty,
            0,
            0,
            &[],
        );
        if stop {
            result.state = SearchState::HitLimitReached;
            return result;
        }

        // Expand pending branches, cheapest substitution first.
        while let Some(br) = self.pending.pop() {
            if self.backtracks >= self.cfg.max_bts {
                result.state = SearchState::GaveUp;
                return result;
            }
            self.backtracks += 1;

            let (top, bot) = if br.depth == 0 {
                self.ebwt.initial(br.base)
            } else {
                self.ebwt.narrow(br.top, br.bot, br.base)
            };
            if top == bot {
                continue;
            }
            let stop = self.descend(
                pat,
                quals,
                name,
                read_id,
                orient,
                muts,
                saved,
                agent,
                store,
                qlen,
                &mut result,
                br.depth + 1,
                top,
                bot,
                br.mms,
                br.penalty,
                br.lo_mms,
                br.hi_mms,
                &br.subs,
            );
            if stop {
                result.state = SearchState::HitLimitReached;
                return result;
            }
        }
        result
    }

    /// Follow the read's own bases from `depth` until the interval dies or
    /// the pattern is exhausted, queueing a branch for every substitution
    /// the thresholds, the region budget and the quality cutoff leave room
    /// for along the way. Returns true when one-hit mode fired.
    #[allow(clippy::too_many_arguments)]
    fn descend(
        &mut self,
        pat: &[u8],
        quals: &[u8],
        name: &str,
        read_id: u32,
        orient: Orientation,
        muts: &[(u8, u8)],
        saved: &[(usize, u8)],
        agent: &mut SinkAgent<'_>,
        store: Option<&PartialStore>,
        qlen: usize,
        result: &mut SearchResult,
        mut depth: u32,
        mut top: u32,
        mut bot: u32,
        mms: u8,
        penalty: u32,
        lo_mms: u8,
        hi_mms: u8,
        subs: &[PathSub],
    ) -> bool {
        debug_assert_eq!(mms as usize, subs.len());
        loop {
            // Half-and-half: a path crossing the midpoint without a low-half
            // substitution (or finishing without a high-half one) is dead.
            if let Some((mid, end)) = self.cfg.half_and_half {
                if depth == mid && lo_mms == 0 {
                    return false;
                }
                if depth == end && hi_mms == 0 {
                    return false;
                }
            }

            if depth as usize == qlen {
                if self.cfg.report_seedlings > 0 {
                    if mms >= 1 && mms as u32 <= self.cfg.report_seedlings {
                        self.emit_seedling(pat.len(), read_id, orient, store, subs);
                        result.seedlings += 1;
                    }
                    return false;
                }
                if self.cfg.disallow_exact && mms == 0 && muts.is_empty() {
                    return false;
                }
                let emitted = self.emit_hits(
                    pat, quals, name, read_id, orient, muts, saved, subs, top, bot, mms, agent,
                );
                if emitted > 0 {
                    if self.cfg.provisional_inexact && mms as usize + muts.len() > 0 {
                        result.provisional += emitted;
                    } else {
                        result.hits += emitted;
                    }
                    if self.cfg.one_hit {
                        return true;
                    }
                }
                return false;
            }

            let pos = qlen - 1 - depth as usize;
            let rb = pat[pos];
            let key = rounded_penalty(quals[pos]);
            let allowed = depth >= self.cfg.offs.unrev
                && mms < self.cfg.offs.budget(depth)
                && (!self.cfg.consider_quals || penalty + key <= self.cfg.qual_thresh);
            if allowed {
                let mut branch_lo = lo_mms;
                let mut branch_hi = hi_mms;
                if let Some((mid, end)) = self.cfg.half_and_half {
                    if depth < mid {
                        branch_lo += 1;
                    } else if depth < end {
                        branch_hi += 1;
                    }
                }
                for c in 0..4u8 {
                    if c == rb {
                        continue;
                    }
                    let mut branch_subs = Vec::with_capacity(subs.len() + 1);
                    branch_subs.extend_from_slice(subs);
                    branch_subs.push(PathSub {
                        pos: pos as u8,
                        base: c,
                    });
                    self.pending.push(Branch {
                        penalty_key: key,
                        depth,
                        seq: self.seq,
                        top,
                        bot,
                        base: c,
                        mms: mms + 1,
                        penalty: if self.cfg.consider_quals {
                            penalty + key
                        } else {
                            penalty
                        },
                        lo_mms: branch_lo,
                        hi_mms: branch_hi,
                        subs: branch_subs,
                    });
                    self.seq += 1;
                }
            }

            // Extend by the read's own base; a no-confidence base matches
            // nothing and ends the descent.
            if rb == BASE_N {
                return false;
            }
            let (t, b) = if depth == 0 {
                self.ebwt.initial(rb)
            } else {
                self.ebwt.narrow(top, bot, rb)
            };
            if t == b {
                return false;
            }
            top = t;
            bot = b;
            depth += 1;
        }
    }

    fn emit_seedling(
        &self,
        len: usize,
        read_id: u32,
        orient: Orientation,
        store: Option<&PartialStore>,
        subs: &[PathSub],
    ) {
        let store = store.expect("seedling search without a partial store");
        let subs: Vec<(u8, u8)> = subs
            .iter()
            .map(|s| (orient.unreversed(s.pos as usize, len) as u8, s.base))
            .collect();
        store.append(read_id, Seedling::new(&subs));
    }

    /// Resolve the final interval and hand hits to the sink agent. Returns
    /// the number of hits emitted (0 when every row straddles a reference
    /// boundary).
    #[allow(clippy::too_many_arguments)]
    fn emit_hits(
        &mut self,
        pat: &[u8],
        quals: &[u8],
        name: &str,
        read_id: u32,
        orient: Orientation,
        muts: &[(u8, u8)],
        saved: &[(usize, u8)],
        path: &[PathSub],
        top: u32,
        bot: u32,
        mms: u8,
        agent: &mut SinkAgent<'_>,
    ) -> u32 {
        let len = pat.len();
        let qlen = len as u32;

        // Mismatch bookkeeping in read-5' coordinates: path substitutions
        // plus any pre-applied seedling mutations. The reference base is
        // recorded in the read's frame (complemented for the minus strand).
        let mut bitmap = MismatchSet::default();
        let mut subs: Vec<(u8, u8)> = Vec::with_capacity(path.len() + muts.len());
        for s in path {
            let rpos = orient.read5(s.pos as usize, len) as u8;
            let ref_base = if orient.fw { s.base } else { comp(s.base) };
            bitmap.set(rpos as u32);
            subs.push((rpos, ref_base));
        }
        for &(pos, base) in muts {
            let rpos = orient.read5(pos as usize, len) as u8;
            let ref_base = if orient.fw { base } else { comp(base) };
            bitmap.set(rpos as u32);
            subs.push((rpos, ref_base));
        }
        subs.sort_unstable();
        debug_assert_eq!(bitmap.count() as usize, mms as usize + muts.len());

        // Strand-oriented sequence and qualities, with the original bases
        // put back where mutations are currently applied.
        let mut seq: Vec<u8> = pat.to_vec();
        for &(pos, orig) in saved {
            seq[pos] = orig;
        }
        let mut out_quals: Vec<u8> = quals.to_vec();
        if orient.reversed {
            seq.reverse();
            out_quals.reverse();
        }

        let stratum = mms as u32 + muts.len() as u32;
        let make_hit = |ref_id: u32, ref_off: u32| Hit {
            ref_id,
            ref_off,
            read_id,
            fw: orient.fw,
            mms: bitmap,
            subs: subs.clone(),
            stratum,
            seq: seq.clone(),
            quals: out_quals.clone(),
            name: name.to_string(),
        };

        let width = bot - top;
        if self.cfg.one_hit {
            let picked = top + self.rng.gen_range(0..width);
            if let Some((ref_id, ref_off)) = self.ebwt.resolve(picked, qlen) {
                self.report(agent, make_hit(ref_id, ref_off));
                return 1;
            }
            // The random row straddled a boundary; scan for a survivor.
            for row in (top..bot).filter(|&r| r != picked) {
                if let Some((ref_id, ref_off)) = self.ebwt.resolve(row, qlen) {
                    self.report(agent, make_hit(ref_id, ref_off));
                    return 1;
                }
            }
            0
        } else {
            let mut emitted = 0;
            for row in top..bot {
                if let Some((ref_id, ref_off)) = self.ebwt.resolve(row, qlen) {
                    self.report(agent, make_hit(ref_id, ref_off));
                    emitted += 1;
                }
            }
            emitted
        }
    }

    fn report(&self, agent: &mut SinkAgent<'_>, hit: Hit) {
        if self.cfg.provisional_inexact && hit.stratum > 0 {
            agent.report_provisional(hit);
        } else {
            agent.report(hit);
        }
    }
}

/// Brute-force reference scan used by the test suite: every position where
/// `pat` (already oriented for the strand being checked) matches a reference
/// with at most `max_mms` substitutions, N matching nothing. Returns
/// `(ref_id, ref_off, mismatch positions in pattern coordinates)`.
pub fn naive_hits(refs: &[Vec<u8>], pat: &[u8], max_mms: usize) -> Vec<(u32, u32, Vec<u32>)> {
    let mut out = Vec::new();
    for (rid, r) in refs.iter().enumerate() {
        if pat.len() > r.len() {
            continue;
        }
        for off in 0..=(r.len() - pat.len()) {
            let mut mm = Vec::new();
            let mut ok = true;
            for (i, &pc) in pat.iter().enumerate() {
                if pc >= 4 || r[off + i] >= 4 {
                    // no-confidence bases never match
                    mm.push(i as u32);
                } else if pc != r[off + i] {
                    mm.push(i as u32);
                }
                if mm.len() > max_mms {
                    ok = false;
                    break;
                }
            }
            if ok {
                out.push((rid as u32, off as u32, mm));
            }
        }
    }
    out
}
