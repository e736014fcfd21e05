// Phase orchestration: the four search variants and the worker pool.
//
// Every variant is a sequence of phases. Within a phase, worker threads pull
// reads from the shared source and run one or more backtracking searches per
// read; the scope join is the phase barrier. Between phases the resident
// index is swapped (forward <-> mirror) and the read source is rewound, with
// its reverse flag matching the index: the mirror index walks reads from the
// other end, so each phase sees depth mapped onto the read region it is
// responsible for.
//
// Case bookkeeping follows the classic split: with the forward index
// resident, a search can place substitutions in the half of the read matched
// early; the mirror index reaches the other half; half-and-half passes mop
// up reads needing one substitution on each side of the seed midpoint.

use crate::backtrack::{Backtracker, BtConfig, Orientation, RevOffs, SearchState};
use crate::bitset::SyncBitset;
use crate::dna::{BASE_N, rounded_penalty};
use crate::ebwt::Ebwt;
use crate::hit::{HitSink, SinkAgent};
use crate::options::{AlignOpt, NsPolicy, SearchMode};
use crate::partial::PartialStore;
use crate::pattern::{Query, SyncPatternSource};
use crate::utils::{Timer, err_fatal};

/// Initial completion-bitmap capacity: the read-count bound, capped at 16 Mi.
const MAX_INITIAL_QS: u32 = 16 * 1024 * 1024;

pub struct Aligner<'a> {
    opt: &'a AlignOpt,
    patsrc: &'a SyncPatternSource,
    sink: &'a dyn HitSink,
    done: SyncBitset,
}

/// Seed geometry for one read: effective seed and its two halves.
#[derive(Debug, Clone, Copy)]
struct SeedSplit {
    qs: u32,
    qs5: u32,
    qs3: u32,
}

impl SeedSplit {
    fn new(len: usize, seed_len: usize) -> Self {
        let qs = len.min(seed_len) as u32;
        SeedSplit {
            qs,
            qs5: (qs >> 1) + (qs & 1),
            qs3: qs >> 1,
        }
    }
}

impl<'a> Aligner<'a> {
    pub fn new(opt: &'a AlignOpt, patsrc: &'a SyncPatternSource, sink: &'a dyn HitSink) -> Self {
        let cap = opt.q_upto.min(MAX_INITIAL_QS) as usize;
        Aligner {
            opt,
            patsrc,
            sink,
            done: SyncBitset::with_capacity(cap),
        }
    }

    /// Run the configured variant. The forward index must be loadable; the
    /// mirror index is required by every mode except exact.
    pub fn run(&self, ebwt_fw: &mut Ebwt, mut ebwt_bw: Option<&mut Ebwt>) {
        self.switch_to(ebwt_fw, ebwt_bw.as_deref_mut(), false);
        match self.opt.mode {
            SearchMode::EndToEnd(0) => self.exact_search(ebwt_fw),
            SearchMode::EndToEnd(1) => {
                let bw = self.require_mirror(ebwt_bw);
                self.one_mismatch_search(ebwt_fw, bw);
            }
            SearchMode::EndToEnd(k) => {
                let bw = self.require_mirror(ebwt_bw);
                self.two_or_three_mismatch_search(ebwt_fw, bw, k);
            }
            SearchMode::Seeded => {
                let bw = self.require_mirror(ebwt_bw);
                self.seeded_search(ebwt_fw, bw);
            }
        }
        self.sink.finish();
    }

    fn require_mirror<'b>(&self, bw: Option<&'b mut Ebwt>) -> &'b mut Ebwt {
        bw.unwrap_or_else(|| {
            err_fatal(
                "search",
                "this mode needs the mirror index (basename.rev.*.ebwt)",
            )
        })
    }

    /// Evict one index, load the other, rewind the source with the matching
    /// reverse flag.
    fn switch_to(&self, fw: &mut Ebwt, bw: Option<&mut Ebwt>, mirror: bool) {
        if mirror {
            let bw = bw.expect("mirror switch without a mirror index");
            fw.evict();
            if !bw.is_resident() {
                let _t = Timer::new("Time loading mirror index", self.opt.timing);
                if let Err(e) = bw.load() {
                    err_fatal("index", &format!("could not load mirror index: {e}"));
                }
            }
            self.patsrc.reset(true);
        } else {
            if let Some(bw) = bw {
                bw.evict();
            }
            if !fw.is_resident() {
                let _t = Timer::new("Time loading forward index", self.opt.timing);
                if let Err(e) = fw.load() {
                    err_fatal("index", &format!("could not load forward index: {e}"));
                }
            }
            self.patsrc.reset(false);
        }
    }

    /// Fan a phase out over the worker pool; the calling thread is worker 0.
    fn run_phase<F>(&self, worker: F)
    where
        F: Fn(usize) + Sync,
    {
        let nthreads = self.opt.nthreads;
        if nthreads <= 1 {
            worker(0);
            return;
        }
        std::thread::scope(|scope| {
            for t in 1..nthreads {
                let worker = &worker;
                scope.spawn(move || worker(t));
            }
            worker(0);
        });
    }

    fn check_min_len(&self, q: &Query) {
        let min = self.opt.min_read_len();
        if q.len() < min {
            err_fatal(
                "reads",
                &format!(
                    "read {} is {} bases long; this mode needs at least {}",
                    q.name,
                    q.len(),
                    min
                ),
            );
        }
    }

    /// Quality cost of pre-applied mutations, in presented coordinates.
    fn mut_penalty(muts: &[(u8, u8)], quals: &[u8]) -> u32 {
        muts.iter()
            .map(|&(pos, _)| rounded_penalty(quals[pos as usize]))
            .sum()
    }

    // ----- exact ---------------------------------------------------------

    /// Single phase on the forward index; the reverse complement is tried
    /// when the forward orientation misses (or always, in all-hits mode).
    fn exact_search(&self, ebwt: &Ebwt) {
        let opt = self.opt;
        let _t = Timer::new("Time for exact search", opt.timing);
        self.run_phase(|_tid| {
            let mut cfg = BtConfig::new(RevOffs::exact(0));
            cfg.one_hit = opt.one_hit;
            let mut bt = Backtracker::new(ebwt, cfg, opt.seed);
            let mut agent = SinkAgent::new(self.sink);
            while let Some(mut q) = self.patsrc.next() {
                self.check_min_len(&q);
                let len = q.len() as u32;
                bt.set_offs(RevOffs::exact(len));
                let res = bt.backtrack(
                    &mut q.fw,
                    &q.qual_fw,
                    &q.name,
                    q.id,
                    Orientation::FW,
                    &[],
                    0,
                    &mut agent,
                    None,
                );
                if res.hit() && opt.one_hit {
                    continue;
                }
                if !opt.revcomp {
                    continue;
                }
                bt.backtrack(
                    &mut q.rc,
                    &q.qual_rc,
                    &q.name,
                    q.id,
                    Orientation::RC,
                    &[],
                    0,
                    &mut agent,
                    None,
                );
            }
        });
    }

    // ----- 1-mismatch ----------------------------------------------------

    fn one_mismatch_search(&self, ebwt_fw: &mut Ebwt, ebwt_bw: &mut Ebwt) {
        let opt = self.opt;
        {
            let _t = Timer::new("Time for 1-mismatch forward-index search", opt.timing);
            let ebwt: &Ebwt = ebwt_fw;
            self.run_phase(|_tid| self.one_mismatch_phase1(ebwt));
        }
        self.switch_to(ebwt_fw, Some(&mut *ebwt_bw), true);
        {
            let _t = Timer::new("Time for 1-mismatch mirror-index search", opt.timing);
            let ebwt: &Ebwt = ebwt_bw;
            self.run_phase(|_tid| self.one_mismatch_phase2(ebwt));
        }
    }

    /// Phase 1, forward index. The reverse complement goes first and, in
    /// one-hit mode, its inexact hits are provisional: an exact hit on the
    /// forward orientation dominates and retracts them. All-hits mode
    /// reports every alignment and skips the dominance dance.
    fn one_mismatch_phase1(&self, ebwt: &Ebwt) {
        let opt = self.opt;
        let mut prov_cfg = BtConfig::new(RevOffs::exact(0));
        prov_cfg.one_hit = opt.one_hit;
        prov_cfg.provisional_inexact = opt.one_hit;
        let mut bt_rc = Backtracker::new(ebwt, prov_cfg, opt.seed);

        let mut fw_cfg = BtConfig::new(RevOffs::exact(0));
        fw_cfg.one_hit = opt.one_hit;
        let mut bt_fw = Backtracker::new(ebwt, fw_cfg, opt.seed);

        let mut agent = SinkAgent::new(self.sink);
        while let Some(mut q) = self.patsrc.next() {
            self.check_min_len(&q);
            let len = q.len() as u32;
            let s = SeedSplit::new(q.len(), q.len());

            if opt.revcomp {
                // rc: the mismatch may sit in the late-matched half.
                bt_rc.set_offs(RevOffs::new(s.qs5, len, len, len));
                let res_rc = bt_rc.backtrack(
                    &mut q.rc,
                    &q.qual_rc,
                    &q.name,
                    q.id,
                    Orientation::RC,
                    &[],
                    0,
                    &mut agent,
                    None,
                );
                if opt.one_hit && res_rc.hit() {
                    debug_assert_eq!(agent.num_provisional(), 0);
                    self.done.set(q.id);
                    continue;
                }
            }

            if agent.num_provisional() > 0 {
                // A provisional inexact rc hit exists (one-hit mode only);
                // only an exact forward hit can beat it.
                debug_assert!(opt.one_hit);
                bt_fw.set_offs(RevOffs::exact(len));
                let res_fw = bt_fw.backtrack(
                    &mut q.fw,
                    &q.qual_fw,
                    &q.name,
                    q.id,
                    Orientation::FW,
                    &[],
                    0,
                    &mut agent,
                    None,
                );
                if res_fw.hit() {
                    agent.reject_provisional();
                } else {
                    agent.accept_provisional();
                }
                self.done.set(q.id);
            } else {
                bt_fw.set_offs(RevOffs::new(s.qs3, len, len, len));
                let res_fw = bt_fw.backtrack(
                    &mut q.fw,
                    &q.qual_fw,
                    &q.name,
                    q.id,
                    Orientation::FW,
                    &[],
                    0,
                    &mut agent,
                    None,
                );
                if opt.one_hit && res_fw.hit() {
                    self.done.set(q.id);
                }
            }
        }
    }

    /// Phase 2, mirror index, reads served reversed: the other half of each
    /// strand becomes reachable. Exact hits were all found in phase 1.
    fn one_mismatch_phase2(&self, ebwt: &Ebwt) {
        let opt = self.opt;
        let mut cfg = BtConfig::new(RevOffs::exact(0));
        cfg.one_hit = opt.one_hit;
        cfg.disallow_exact = true;
        let mut bt = Backtracker::new(ebwt, cfg, opt.seed.wrapping_add(1));
        let mut agent = SinkAgent::new(self.sink);
        while let Some(mut q) = self.patsrc.next() {
            if self.done.test(q.id) {
                continue;
            }
            let len = q.len() as u32;
            let s = SeedSplit::new(q.len(), q.len());

            bt.set_offs(RevOffs::new(s.qs5, len, len, len));
            let res_fw = bt.backtrack(
                &mut q.fw,
                &q.qual_fw,
                &q.name,
                q.id,
                Orientation::FW_REV,
                &[],
                0,
                &mut agent,
                None,
            );
            if opt.one_hit && res_fw.hit() {
                self.done.set(q.id);
                continue;
            }
            if !opt.revcomp {
                continue;
            }
            bt.set_offs(RevOffs::new(s.qs3, len, len, len));
            let res_rc = bt.backtrack(
                &mut q.rc,
                &q.qual_rc,
                &q.name,
                q.id,
                Orientation::RC_REV,
                &[],
                0,
                &mut agent,
                None,
            );
            if opt.one_hit && res_rc.hit() {
                self.done.set(q.id);
            }
        }
    }

    // ----- 2/3-mismatch end-to-end ---------------------------------------

    fn two_or_three_mismatch_search(&self, ebwt_fw: &mut Ebwt, ebwt_bw: &mut Ebwt, k: u32) {
        let opt = self.opt;
        let two = k == 2;
        {
            let _t = Timer::new("End-to-end mismatch phase 1", opt.timing);
            let ebwt: &Ebwt = ebwt_fw;
            self.run_phase(|_tid| self.two_three_phase1(ebwt, two));
        }
        self.switch_to(ebwt_fw, Some(&mut *ebwt_bw), true);
        {
            let _t = Timer::new("End-to-end mismatch phase 2", opt.timing);
            let ebwt: &Ebwt = ebwt_bw;
            self.run_phase(|_tid| self.two_three_phase2(ebwt, two));
        }
        self.switch_to(ebwt_fw, Some(&mut *ebwt_bw), false);
        {
            let _t = Timer::new("End-to-end mismatch phase 3", opt.timing);
            let ebwt: &Ebwt = ebwt_fw;
            self.run_phase(|_tid| self.two_three_phase3(ebwt, two));
        }
    }

    /// Phase 1: exact forward, then rc with mismatches confined to the
    /// early-matched half (plus the whole read in 3-mismatch mode's third
    /// slot).
    fn two_three_phase1(&self, ebwt: &Ebwt, two: bool) {
        let opt = self.opt;
        let mut exact_cfg = BtConfig::new(RevOffs::exact(0));
        exact_cfg.one_hit = opt.one_hit;
        let mut bt_exact = Backtracker::new(ebwt, exact_cfg, opt.seed);

        let mut rc_cfg = BtConfig::new(RevOffs::exact(0));
        rc_cfg.one_hit = opt.one_hit;
        let mut bt_rc = Backtracker::new(ebwt, rc_cfg, opt.seed);

        let mut agent = SinkAgent::new(self.sink);
        while let Some(mut q) = self.patsrc.next() {
            self.check_min_len(&q);
            let len = q.len() as u32;
            let s = SeedSplit::new(q.len(), q.len());

            bt_exact.set_offs(RevOffs::exact(len));
            let res = bt_exact.backtrack(
                &mut q.fw,
                &q.qual_fw,
                &q.name,
                q.id,
                Orientation::FW,
                &[],
                0,
                &mut agent,
                None,
            );
            if opt.one_hit && res.hit() {
                self.done.set(q.id);
                continue;
            }

            if !opt.revcomp {
                continue;
            }
            bt_rc.set_offs(RevOffs::new(
                s.qs5,
                s.qs5,
                if two { len } else { s.qs5 },
                len,
            ));
            let res = bt_rc.backtrack(
                &mut q.rc,
                &q.qual_rc,
                &q.name,
                q.id,
                Orientation::RC,
                &[],
                0,
                &mut agent,
                None,
            );
            if opt.one_hit && res.hit() {
                self.done.set(q.id);
            }
        }
    }

    /// Phase 2: mirror index; each strand's other half.
    fn two_three_phase2(&self, ebwt: &Ebwt, two: bool) {
        let opt = self.opt;
        let mut cfg = BtConfig::new(RevOffs::exact(0));
        cfg.one_hit = opt.one_hit;
        cfg.disallow_exact = true;
        let mut bt = Backtracker::new(ebwt, cfg, opt.seed.wrapping_add(1));
        let mut agent = SinkAgent::new(self.sink);
        while let Some(mut q) = self.patsrc.next() {
            if self.done.test(q.id) {
                continue;
            }
            let len = q.len() as u32;
            let s = SeedSplit::new(q.len(), q.len());

            bt.set_offs(RevOffs::new(
                s.qs5,
                s.qs5,
                if two { len } else { s.qs5 },
                len,
            ));
            let res = bt.backtrack(
                &mut q.fw,
                &q.qual_fw,
                &q.name,
                q.id,
                Orientation::FW_REV,
                &[],
                0,
                &mut agent,
                None,
            );
            if opt.one_hit && res.hit() {
                self.done.set(q.id);
                continue;
            }
            if !opt.revcomp {
                continue;
            }

            bt.set_offs(RevOffs::new(
                s.qs3,
                s.qs3,
                if two { len } else { s.qs3 },
                len,
            ));
            let res = bt.backtrack(
                &mut q.rc,
                &q.qual_rc,
                &q.name,
                q.id,
                Orientation::RC_REV,
                &[],
                0,
                &mut agent,
                None,
            );
            if opt.one_hit && res.hit() {
                self.done.set(q.id);
            }
        }
    }

    /// Phase 3: remaining cases on the forward index — the other forward
    /// half, then half-and-half on both strands.
    fn two_three_phase3(&self, ebwt: &Ebwt, two: bool) {
        let opt = self.opt;
        let mut cfg = BtConfig::new(RevOffs::exact(0));
        cfg.one_hit = opt.one_hit;
        cfg.disallow_exact = true;
        let mut bt = Backtracker::new(ebwt, cfg, opt.seed.wrapping_add(3));

        let mut hh_cfg = BtConfig::new(RevOffs::exact(0));
        hh_cfg.one_hit = opt.one_hit;
        hh_cfg.disallow_exact = true;
        hh_cfg.max_bts = opt.effective_max_bts();
        let mut bt_hh = Backtracker::new(ebwt, hh_cfg, opt.seed.wrapping_add(5));

        let mut agent = SinkAgent::new(self.sink);
        while let Some(mut q) = self.patsrc.next() {
            if self.done.test(q.id) {
                continue;
            }
            let len = q.len() as u32;
            let s = SeedSplit::new(q.len(), q.len());

            bt.set_offs(RevOffs::new(
                s.qs3,
                s.qs3,
                if two { len } else { s.qs3 },
                len,
            ));
            let res = bt.backtrack(
                &mut q.fw,
                &q.qual_fw,
                &q.name,
                q.id,
                Orientation::FW,
                &[],
                0,
                &mut agent,
                None,
            );
            if opt.one_hit && res.hit() {
                continue;
            }

            // Forward half-and-half: the early half here is the read's 3'
            // side, so the midpoint is qs3 deep.
            bt_hh.set_offs(RevOffs::new(
                0,
                if two { s.qs3 } else { 0 },
                if two { len } else { s.qs3 },
                len,
            ));
            bt_hh.set_half_and_half(Some((s.qs3, len)));
            let res = bt_hh.backtrack(
                &mut q.fw,
                &q.qual_fw,
                &q.name,
                q.id,
                Orientation::FW,
                &[],
                0,
                &mut agent,
                None,
            );
            if res.state == SearchState::GaveUp {
                log::trace!("gave up on {} (forward half-and-half)", q.name);
            }
            if opt.one_hit && res.hit() {
                continue;
            }
            if !opt.revcomp {
                continue;
            }

            bt_hh.set_offs(RevOffs::new(
                0,
                if two { s.qs5 } else { 0 },
                if two { len } else { s.qs5 },
                len,
            ));
            bt_hh.set_half_and_half(Some((s.qs5, len)));
            let res = bt_hh.backtrack(
                &mut q.rc,
                &q.qual_rc,
                &q.name,
                q.id,
                Orientation::RC,
                &[],
                0,
                &mut agent,
                None,
            );
            if res.state == SearchState::GaveUp {
                log::trace!("gave up on {} (rc half-and-half)", q.name);
            }
        }
    }

    // ----- seeded quality-cutoff -----------------------------------------

    fn seeded_search(&self, ebwt_fw: &mut Ebwt, ebwt_bw: &mut Ebwt) {
        let opt = self.opt;
        let pam_rc = PartialStore::new();
        let pam_fw = PartialStore::new();

        {
            let _t = Timer::new("Seeded quality search phase 1", opt.timing);
            let ebwt: &Ebwt = ebwt_fw;
            self.run_phase(|_tid| self.seeded_phase1(ebwt));
        }
        self.switch_to(ebwt_fw, Some(&mut *ebwt_bw), true);
        {
            let _t = Timer::new("Seeded quality search phase 2", opt.timing);
            let ebwt: &Ebwt = ebwt_bw;
            self.run_phase(|_tid| self.seeded_phase2(ebwt, &pam_rc));
        }
        if opt.seed_mms == 0 {
            return;
        }
        self.switch_to(ebwt_fw, Some(&mut *ebwt_bw), false);
        {
            let _t = Timer::new("Seeded quality search phase 3", opt.timing);
            let ebwt: &Ebwt = ebwt_fw;
            self.run_phase(|_tid| self.seeded_phase3(ebwt, &pam_rc, &pam_fw));
        }
        drop(pam_rc);
        self.switch_to(ebwt_fw, Some(&mut *ebwt_bw), true);
        {
            let _t = Timer::new("Seeded quality search phase 4", opt.timing);
            let ebwt: &Ebwt = ebwt_bw;
            self.run_phase(|_tid| self.seeded_phase4(ebwt, &pam_fw));
        }
    }

    /// The seeded quadruple: the early seed half is locked, the late half
    /// opens one slot per allowed seed mismatch, the tail is free.
    fn seeded_offs(&self, s: SeedSplit, half: u32) -> RevOffs {
        let mm = self.opt.seed_mms;
        RevOffs::new(
            if mm > 0 { half } else { s.qs },
            if mm > 1 { half } else { s.qs },
            if mm > 2 { half } else { s.qs },
            s.qs,
        )
    }

    /// Reads whose seed drowns in Ns can never align.
    fn seed_dead_on_ns(&self, q: &Query) -> bool {
        if self.opt.ns_policy != NsPolicy::NToN {
            return false;
        }
        let slen = q.len().min(self.opt.seed_len);
        let ns = q.fw[..slen].iter().filter(|&&c| c == BASE_N).count();
        ns > self.opt.seed_mms as usize
    }

    /// Phase 1: exact forward (quality-blind), then rc with seed-half
    /// mismatches under the quality cutoff.
    fn seeded_phase1(&self, ebwt: &Ebwt) {
        let opt = self.opt;
        let mut exact_cfg = BtConfig::new(RevOffs::exact(0));
        exact_cfg.one_hit = opt.one_hit;
        let mut bt_exact = Backtracker::new(ebwt, exact_cfg, opt.seed);

        let mut rc_cfg = BtConfig::new(RevOffs::exact(0));
        rc_cfg.one_hit = opt.one_hit;
        rc_cfg.consider_quals = true;
        rc_cfg.qual_thresh = opt.qual_thresh;
        rc_cfg.max_bts = opt.max_bts;
        let mut bt_rc = Backtracker::new(ebwt, rc_cfg, opt.seed);

        let mut agent = SinkAgent::new(self.sink);
        while let Some(mut q) = self.patsrc.next() {
            self.check_min_len(&q);
            let len = q.len() as u32;
            let s = SeedSplit::new(q.len(), opt.seed_len);

            if self.seed_dead_on_ns(&q) {
                self.done.set(q.id);
                continue;
            }

            bt_exact.set_offs(RevOffs::exact(len));
            let res = bt_exact.backtrack(
                &mut q.fw,
                &q.qual_fw,
                &q.name,
                q.id,
                Orientation::FW,
                &[],
                0,
                &mut agent,
                None,
            );
            if opt.one_hit && res.hit() {
                self.done.set(q.id);
                continue;
            }

            bt_rc.set_offs(self.seeded_offs(s, s.qs5));
            let res = bt_rc.backtrack(
                &mut q.rc,
                &q.qual_rc,
                &q.name,
                q.id,
                Orientation::RC,
                &[],
                0,
                &mut agent,
                None,
            );
            if res.state == SearchState::GaveUp {
                log::trace!("gave up on {} (seeded phase 1)", q.name);
            }
            if opt.one_hit && res.hit() {
                self.done.set(q.id);
            }
        }
    }

    /// Phase 2: mirror index. Forward-strand seed-half cases, then seedling
    /// collection for the rc 5'-half case.
    fn seeded_phase2(&self, ebwt: &Ebwt, pam_rc: &PartialStore) {
        let opt = self.opt;
        let mut fw_cfg = BtConfig::new(RevOffs::exact(0));
        fw_cfg.one_hit = opt.one_hit;
        fw_cfg.consider_quals = true;
        fw_cfg.qual_thresh = opt.qual_thresh;
        fw_cfg.max_bts = opt.max_bts;
        fw_cfg.disallow_exact = true;
        let mut bt_fw = Backtracker::new(ebwt, fw_cfg, opt.seed.wrapping_add(1));

        let mut sd_cfg = BtConfig::new(RevOffs::exact(0));
        sd_cfg.one_hit = opt.one_hit;
        sd_cfg.consider_quals = true;
        sd_cfg.qual_thresh = opt.qual_thresh;
        sd_cfg.max_bts = opt.max_bts;
        sd_cfg.report_seedlings = opt.seed_mms;
        let mut bt_sd = Backtracker::new(ebwt, sd_cfg, opt.seed.wrapping_add(2));

        let mut agent = SinkAgent::new(self.sink);
        while let Some(mut q) = self.patsrc.next() {
            if self.done.test(q.id) {
                continue;
            }
            let s = SeedSplit::new(q.len(), opt.seed_len);

            bt_fw.set_offs(self.seeded_offs(s, s.qs5));
            let res = bt_fw.backtrack(
                &mut q.fw,
                &q.qual_fw,
                &q.name,
                q.id,
                Orientation::FW_REV,
                &[],
                0,
                &mut agent,
                None,
            );
            if opt.one_hit && res.hit() {
                self.done.set(q.id);
                continue;
            }
            if opt.seed_mms == 0 {
                continue;
            }

            // Seed-only search for rc 5'-half substitutions; the matches are
            // recorded, not reported.
            bt_sd.set_offs(self.seeded_offs(s, s.qs3));
            bt_sd.set_qlen(Some(s.qs as usize));
            bt_sd.backtrack(
                &mut q.rc,
                &q.qual_rc,
                &q.name,
                q.id,
                Orientation::RC_REV,
                &[],
                0,
                &mut agent,
                Some(pam_rc),
            );
            bt_sd.set_qlen(None);
        }
    }

    /// Phase 3: forward index again. Extend the rc seedlings over the whole
    /// read, run rc half-and-half, and collect forward-strand seedlings.
    fn seeded_phase3(&self, ebwt: &Ebwt, pam_rc: &PartialStore, pam_fw: &PartialStore) {
        let opt = self.opt;
        let mut ext_cfg = BtConfig::new(RevOffs::exact(0));
        ext_cfg.one_hit = opt.one_hit;
        ext_cfg.consider_quals = true;
        ext_cfg.qual_thresh = opt.qual_thresh;
        ext_cfg.max_bts = opt.max_bts;
        let mut bt_ext = Backtracker::new(ebwt, ext_cfg, opt.seed.wrapping_add(4));

        let mut sd_cfg = BtConfig::new(RevOffs::exact(0));
        sd_cfg.one_hit = opt.one_hit;
        sd_cfg.consider_quals = true;
        sd_cfg.qual_thresh = opt.qual_thresh;
        sd_cfg.max_bts = opt.max_bts;
        sd_cfg.report_seedlings = opt.seed_mms;
        let mut bt_sd = Backtracker::new(ebwt, sd_cfg, opt.seed.wrapping_add(3));

        let mut hh_cfg = BtConfig::new(RevOffs::exact(0));
        hh_cfg.one_hit = opt.one_hit;
        hh_cfg.consider_quals = true;
        hh_cfg.qual_thresh = opt.qual_thresh;
        hh_cfg.max_bts = opt.max_bts;
        hh_cfg.disallow_exact = true;
        let mut bt_hh = Backtracker::new(ebwt, hh_cfg, opt.seed.wrapping_add(5));

        let mut agent = SinkAgent::new(self.sink);
        while let Some(mut q) = self.patsrc.next() {
            if self.done.test(q.id) {
                continue;
            }
            let s = SeedSplit::new(q.len(), opt.seed_len);

            // Case: rc with substitutions confined to the seed's 5' half,
            // prepared in phase 2.
            let mut hit = false;
            bt_ext.set_offs(RevOffs::new(s.qs, s.qs, s.qs, s.qs));
            for seedling in pam_rc.get(q.id) {
                let muts: Vec<(u8, u8)> = seedling.subs().collect();
                let iham = Self::mut_penalty(&muts, &q.qual_rc);
                if iham > opt.qual_thresh {
                    continue;
                }
                let res = bt_ext.backtrack(
                    &mut q.rc,
                    &q.qual_rc,
                    &q.name,
                    q.id,
                    Orientation::RC,
                    &muts,
                    iham,
                    &mut agent,
                    None,
                );
                if opt.one_hit && res.hit() {
                    self.done.set(q.id);
                    hit = true;
                    break;
                }
            }
            if hit {
                continue;
            }

            if opt.seed_mms >= 2 {
                bt_hh.set_offs(RevOffs::new(
                    0,
                    if opt.seed_mms <= 2 { s.qs5 } else { 0 },
                    if opt.seed_mms < 3 { s.qs } else { s.qs5 },
                    s.qs,
                ));
                bt_hh.set_half_and_half(Some((s.qs5, s.qs)));
                let res = bt_hh.backtrack(
                    &mut q.rc,
                    &q.qual_rc,
                    &q.name,
                    q.id,
                    Orientation::RC,
                    &[],
                    0,
                    &mut agent,
                    None,
                );
                if res.state == SearchState::GaveUp {
                    log::trace!("gave up on {} (rc half-and-half)", q.name);
                }
                if opt.one_hit && res.hit() {
                    self.done.set(q.id);
                    continue;
                }
            }

            // Collect forward-strand seedlings for phase 4.
            bt_sd.set_offs(self.seeded_offs(s, s.qs3));
            bt_sd.set_qlen(Some(s.qs as usize));
            bt_sd.backtrack(
                &mut q.fw,
                &q.qual_fw,
                &q.name,
                q.id,
                Orientation::FW,
                &[],
                0,
                &mut agent,
                Some(pam_fw),
            );
            bt_sd.set_qlen(None);
        }
    }

    /// Phase 4: mirror index. Extend the forward seedlings; forward
    /// half-and-half closes the last case.
    fn seeded_phase4(&self, ebwt: &Ebwt, pam_fw: &PartialStore) {
        let opt = self.opt;
        let mut ext_cfg = BtConfig::new(RevOffs::exact(0));
        ext_cfg.one_hit = opt.one_hit;
        ext_cfg.consider_quals = true;
        ext_cfg.qual_thresh = opt.qual_thresh;
        ext_cfg.max_bts = opt.max_bts;
        let mut bt_ext = Backtracker::new(ebwt, ext_cfg, opt.seed.wrapping_add(6));

        let mut hh_cfg = BtConfig::new(RevOffs::exact(0));
        hh_cfg.one_hit = opt.one_hit;
        hh_cfg.consider_quals = true;
        hh_cfg.qual_thresh = opt.qual_thresh;
        hh_cfg.max_bts = opt.max_bts;
        hh_cfg.disallow_exact = true;
        let mut bt_hh = Backtracker::new(ebwt, hh_cfg, opt.seed.wrapping_add(7));

        let mut agent = SinkAgent::new(self.sink);
        while let Some(mut q) = self.patsrc.next() {
            if self.done.test(q.id) {
                continue;
            }
            let len = q.len();
            let s = SeedSplit::new(len, opt.seed_len);

            let mut hit = false;
            bt_ext.set_offs(RevOffs::new(s.qs, s.qs, s.qs, s.qs));
            for seedling in pam_fw.get(q.id) {
                // Stored positions are unreversed; this phase presents the
                // read reversed.
                let muts: Vec<(u8, u8)> = seedling
                    .subs()
                    .map(|(pos, base)| ((len - 1 - pos as usize) as u8, base))
                    .collect();
                let iham = Self::mut_penalty(&muts, &q.qual_fw);
                if iham > opt.qual_thresh {
                    continue;
                }
                let res = bt_ext.backtrack(
                    &mut q.fw,
                    &q.qual_fw,
                    &q.name,
                    q.id,
                    Orientation::FW_REV,
                    &muts,
                    iham,
                    &mut agent,
                    None,
                );
                if opt.one_hit && res.hit() {
                    self.done.set(q.id);
                    hit = true;
                    break;
                }
            }
            if hit {
                continue;
            }

            if opt.seed_mms >= 2 {
                bt_hh.set_offs(RevOffs::new(
                    0,
                    if opt.seed_mms <= 2 { s.qs5 } else { 0 },
                    if opt.seed_mms < 3 { s.qs } else { s.qs5 },
                    s.qs,
                ));
                bt_hh.set_half_and_half(Some((s.qs5, s.qs)));
                let res = bt_hh.backtrack(
                    &mut q.fw,
                    &q.qual_fw,
                    &q.name,
                    q.id,
                    Orientation::FW_REV,
                    &[],
                    0,
                    &mut agent,
                    None,
                );
                if res.state == SearchState::GaveUp {
                    log::trace!("gave up on {} (forward half-and-half)", q.name);
                }
                if opt.one_hit && res.hit() {
                    self.done.set(q.id);
                }
            }
        }
    }
}
