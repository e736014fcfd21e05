// Search options structure shared by the CLI and the phase orchestrator.
//
// The orchestrator and every worker receive this as a shared read-only
// reference; nothing mutates it after main() finishes assembling it.

/// Which of the four search variants to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    /// End-to-end with exactly this many mismatches allowed (0..=3).
    EndToEnd(u32),
    /// Seeded quality-cutoff search (Maq-like); the default.
    Seeded,
}

/// Policy for no-confidence bases in reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NsPolicy {
    /// Keep Ns; an N matches nothing and must be substituted to align.
    NToN,
    /// Rewrite Ns to A at ingestion.
    NToA,
}

/// How hits are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Full,
    Concise,
    None,
}

#[derive(Debug, Clone)]
pub struct AlignOpt {
    pub mode: SearchMode,
    /// Seed length for seeded mode (>= 20).
    pub seed_len: usize,
    /// Mismatches allowed in the seed (0..=3), seeded mode only.
    pub seed_mms: u32,
    /// Maximum sum of rounded mismatch qualities, seeded mode only.
    pub qual_thresh: u32,
    /// Report one randomly chosen hit per read instead of all hits.
    pub one_hit: bool,
    /// Also search the reverse complement (forced on in seeded mode).
    pub revcomp: bool,
    /// Bases trimmed from the 5' / 3' ends before alignment.
    pub trim5: usize,
    pub trim3: usize,
    /// Reads with more Ns than this are skipped.
    pub max_ns: usize,
    pub ns_policy: NsPolicy,
    /// Per-read backtrack budget for the seeded and half-and-half searches.
    pub max_bts: u32,
    /// Stop after this many reads.
    pub q_upto: u32,
    pub nthreads: usize,
    /// PRNG seed for one-hit selection.
    pub seed: u64,
    pub out_mode: OutputMode,
    /// Interpret quality strings as Solexa-scaled and rescale to Phred.
    pub solexa_quals: bool,
    /// Override the on-disk suffix-array sampling rate (upward only).
    pub off_rate: Option<u32>,
    /// Report per-phase wall/CPU times.
    pub timing: bool,
}

impl Default for AlignOpt {
    fn default() -> Self {
        AlignOpt {
            mode: SearchMode::Seeded,
            seed_len: 28,
            seed_mms: 2,
            qual_thresh: 70,
            one_hit: true,
            revcomp: true,
            trim5: 0,
            trim3: 0,
            max_ns: 999_999,
            ns_policy: NsPolicy::NToN,
            max_bts: 100,
            q_upto: u32::MAX,
            nthreads: 1,
            seed: 0,
            out_mode: OutputMode::Full,
            solexa_quals: false,
            off_rate: None,
            timing: false,
        }
    }
}

impl AlignOpt {
    /// Minimum read length the selected mode can handle.
    pub fn min_read_len(&self) -> usize {
        let mms = match self.mode {
            SearchMode::EndToEnd(k) => k,
            SearchMode::Seeded => self.seed_mms,
        };
        (mms as usize + 1).max(1)
    }

    /// Validate cross-field constraints. Called once from main().
    pub fn validate(&self) -> Result<(), String> {
        if let SearchMode::EndToEnd(k) = self.mode {
            if k > 3 {
                return Err(format!("{k} is not a supported number of mismatches (max 3)"));
            }
        }
        if self.mode == SearchMode::Seeded {
            if self.seed_len < 20 {
                return Err(format!(
                    "seed length must be at least 20 (got {})",
                    self.seed_len
                ));
            }
            if self.seed_mms > 3 {
                return Err(format!(
                    "seed mismatches must be in 0..=3 (got {})",
                    self.seed_mms
                ));
            }
        }
        if self.nthreads == 0 {
            return Err("thread count must be at least 1".to_string());
        }
        Ok(())
    }

    /// Whether the mirror index is needed at all.
    pub fn needs_mirror(&self) -> bool {
        !matches!(self.mode, SearchMode::EndToEnd(0))
    }

    /// The backtrack budget actually applied: unbounded outside the seeded
    /// and half-and-half searches.
    pub fn effective_max_bts(&self) -> u32 {
        match self.mode {
            SearchMode::Seeded => self.max_bts,
            SearchMode::EndToEnd(_) => u32::MAX,
        }
    }
}
