// Read ("query") model and the pattern sources that serve it.
//
// A source yields queries with dense ids starting at 0; the id sequence is
// identical after every reset(). During mirror-index phases the orchestrator
// flips set_reverse(true) and the source serves every sequence and quality
// string reversed (not complemented) so the backtracker consumes the read
// from its other end.

use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Mutex;

use bio::io::{fasta, fastq};

use crate::dna::{BASE_N, encode_base, phred_from_ascii, revcomp, solexa_to_phred};
use crate::options::NsPolicy;
use crate::utils::{err_fatal, xzopen};

/// Longest supported read; the mismatch bitset is two 64-bit words.
pub const MAX_QUERY_LEN: usize = 127;

/// Quality assigned when the input format carries none.
const DEFAULT_QUAL: u8 = 30;

/// One read in both orientations, with per-base Phred qualities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub id: u32,
    pub fw: Vec<u8>,
    pub rc: Vec<u8>,
    pub qual_fw: Vec<u8>,
    pub qual_rc: Vec<u8>,
    pub name: String,
}

impl Query {
    pub fn len(&self) -> usize {
        self.fw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fw.is_empty()
    }
}

/// Shared ingestion knobs applied while parsing.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub trim5: usize,
    pub trim3: usize,
    pub max_ns: usize,
    pub ns_policy: NsPolicy,
    pub solexa_quals: bool,
    pub q_upto: u32,
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig {
            trim5: 0,
            trim3: 0,
            max_ns: 999_999,
            ns_policy: NsPolicy::NToN,
            solexa_quals: false,
            q_upto: u32::MAX,
        }
    }
}

/// Turns raw records into queries: trims, encodes, applies the N policy,
/// assigns ids, and reverses when asked to.
struct QueryFactory {
    cfg: SourceConfig,
    next_id: u32,
    reverse: bool,
}

impl QueryFactory {
    fn new(cfg: SourceConfig) -> Self {
        QueryFactory {
            cfg,
            next_id: 0,
            reverse: false,
        }
    }

    fn exhausted(&self) -> bool {
        self.next_id >= self.cfg.q_upto
    }

    fn reset(&mut self) {
        self.next_id = 0;
    }

    /// `None` means the record was skipped (empty after trimming, or too
    /// many Ns); skipped records do not consume an id.
    fn make(&mut self, name: &str, seq: &[u8], qual: Option<&[u8]>) -> Option<Query> {
        let trimmed_len = seq
            .len()
            .saturating_sub(self.cfg.trim5 + self.cfg.trim3);
        if trimmed_len == 0 {
            log::debug!("skipping empty read {name}");
            return None;
        }
        if trimmed_len > MAX_QUERY_LEN {
            err_fatal(
                "reads",
                &format!(
                    "read {name} is {trimmed_len} bases long; the maximum supported length \
                     is {MAX_QUERY_LEN}"
                ),
            );
        }
        let range = self.cfg.trim5..seq.len() - self.cfg.trim3;

        let mut fw: Vec<u8> = seq[range.clone()].iter().map(|&c| encode_base(c)).collect();
        let n_count = fw.iter().filter(|&&c| c == BASE_N).count();
        if n_count > self.cfg.max_ns {
            log::debug!("skipping read {name}: {n_count} no-confidence bases");
            return None;
        }
        if self.cfg.ns_policy == NsPolicy::NToA {
            for c in fw.iter_mut() {
                if *c == BASE_N {
                    *c = 0;
                }
            }
        }

        let mut qual_fw: Vec<u8> = match qual {
            Some(q) => {
                if q.len() != seq.len() {
                    err_fatal(
                        "reads",
                        &format!(
                            "read {name}: quality string length {} does not match \
                             sequence length {}",
                            q.len(),
                            seq.len()
                        ),
                    );
                }
                let conv = if self.cfg.solexa_quals {
                    solexa_to_phred
                } else {
                    phred_from_ascii
                };
                q[range].iter().map(|&c| conv(c)).collect()
            }
            None => vec![DEFAULT_QUAL; fw.len()],
        };

        let mut rc = revcomp(&fw);
        let mut qual_rc: Vec<u8> = qual_fw.iter().rev().copied().collect();

        if self.reverse {
            fw.reverse();
            rc.reverse();
            qual_fw.reverse();
            qual_rc.reverse();
        }

        let id = self.next_id;
        self.next_id += 1;
        Some(Query {
            id,
            fw,
            rc,
            qual_fw,
            qual_rc,
            name: name.to_string(),
        })
    }
}

pub trait PatternSource: Send {
    fn next(&mut self) -> Option<Query>;
    /// Rewind to the first read; ids repeat exactly.
    fn reset(&mut self);
    /// Serve sequences and qualities reversed (mirror-index phases).
    fn set_reverse(&mut self, reverse: bool);
    /// Number of queries served since the last reset.
    fn num_served(&self) -> u32;
}

/// In-memory source for command-line literals and tests.
pub struct VectorPatternSource {
    records: Vec<(String, Vec<u8>, Option<Vec<u8>>)>,
    idx: usize,
    factory: QueryFactory,
}

impl VectorPatternSource {
    /// Sequences only; names are synthesized from the index.
    pub fn new(seqs: &[&str], cfg: SourceConfig) -> Self {
        let records = seqs
            .iter()
            .enumerate()
            .map(|(i, s)| (i.to_string(), s.as_bytes().to_vec(), None))
            .collect();
        VectorPatternSource {
            records,
            idx: 0,
            factory: QueryFactory::new(cfg),
        }
    }

    pub fn with_quals(records: Vec<(String, Vec<u8>, Vec<u8>)>, cfg: SourceConfig) -> Self {
        let records = records
            .into_iter()
            .map(|(n, s, q)| (n, s, Some(q)))
            .collect();
        VectorPatternSource {
            records,
            idx: 0,
            factory: QueryFactory::new(cfg),
        }
    }
}

impl PatternSource for VectorPatternSource {
    fn next(&mut self) -> Option<Query> {
        while self.idx < self.records.len() && !self.factory.exhausted() {
            let (name, seq, qual) = &self.records[self.idx];
            self.idx += 1;
            if let Some(q) = self.factory.make(name, seq, qual.as_deref()) {
                return Some(q);
            }
        }
        None
    }

    fn reset(&mut self) {
        self.idx = 0;
        self.factory.reset();
    }

    fn set_reverse(&mut self, reverse: bool) {
        self.factory.reverse = reverse;
    }

    fn num_served(&self) -> u32 {
        self.factory.next_id
    }
}

/// FASTQ files (optionally gzipped), via bio's record reader.
pub struct FastqPatternSource {
    files: Vec<PathBuf>,
    file_idx: usize,
    records: Option<fastq::Records<BufReader<Box<dyn io::Read + Send>>>>,
    factory: QueryFactory,
}

impl FastqPatternSource {
    pub fn new(files: Vec<PathBuf>, cfg: SourceConfig) -> Self {
        FastqPatternSource {
            files,
            file_idx: 0,
            records: None,
            factory: QueryFactory::new(cfg),
        }
    }
}

impl PatternSource for FastqPatternSource {
    fn next(&mut self) -> Option<Query> {
        if self.factory.exhausted() {
            return None;
        }
        loop {
            if self.records.is_none() {
                if self.file_idx >= self.files.len() {
                    return None;
                }
                let path = &self.files[self.file_idx];
                let reader = xzopen(path, "r").unwrap_or_else(|e| {
                    err_fatal("reads", &format!("could not open {}: {e}", path.display()))
                });
                self.records = Some(fastq::Reader::new(reader).records());
            }
            match self.records.as_mut().unwrap().next() {
                Some(Ok(rec)) => {
                    if let Some(q) = self.factory.make(rec.id(), rec.seq(), Some(rec.qual())) {
                        return Some(q);
                    }
                }
                Some(Err(e)) => {
                    err_fatal(
                        "reads",
                        &format!("malformed FASTQ in {}: {e}", self.files[self.file_idx].display()),
                    );
                }
                None => {
                    self.records = None;
                    self.file_idx += 1;
                }
            }
        }
    }

    fn reset(&mut self) {
        self.records = None;
        self.file_idx = 0;
        self.factory.reset();
    }

    fn set_reverse(&mut self, reverse: bool) {
        self.factory.reverse = reverse;
    }

    fn num_served(&self) -> u32 {
        self.factory.next_id
    }
}

/// FASTA files; a constant quality is synthesized.
pub struct FastaPatternSource {
    files: Vec<PathBuf>,
    file_idx: usize,
    records: Option<fasta::Records<BufReader<Box<dyn io::Read + Send>>>>,
    factory: QueryFactory,
}

impl FastaPatternSource {
    pub fn new(files: Vec<PathBuf>, cfg: SourceConfig) -> Self {
        FastaPatternSource {
            files,
            file_idx: 0,
            records: None,
            factory: QueryFactory::new(cfg),
        }
    }
}

impl PatternSource for FastaPatternSource {
    fn next(&mut self) -> Option<Query> {
        if self.factory.exhausted() {
            return None;
        }
        loop {
            if self.records.is_none() {
                if self.file_idx >= self.files.len() {
                    return None;
                }
                let path = &self.files[self.file_idx];
                let reader = xzopen(path, "r").unwrap_or_else(|e| {
                    err_fatal("reads", &format!("could not open {}: {e}", path.display()))
                });
                self.records = Some(fasta::Reader::new(reader).records());
            }
            match self.records.as_mut().unwrap().next() {
                Some(Ok(rec)) => {
                    if let Some(q) = self.factory.make(rec.id(), rec.seq(), None) {
                        return Some(q);
                    }
                }
                Some(Err(e)) => {
                    err_fatal(
                        "reads",
                        &format!("malformed FASTA in {}: {e}", self.files[self.file_idx].display()),
                    );
                }
                None => {
                    self.records = None;
                    self.file_idx += 1;
                }
            }
        }
    }

    fn reset(&mut self) {
        self.records = None;
        self.file_idx = 0;
        self.factory.reset();
    }

    fn set_reverse(&mut self, reverse: bool) {
        self.factory.reverse = reverse;
    }

    fn num_served(&self) -> u32 {
        self.factory.next_id
    }
}

/// One raw sequence per line, no names or qualities.
pub struct RawPatternSource {
    files: Vec<PathBuf>,
    file_idx: usize,
    lines: Option<io::Lines<BufReader<Box<dyn io::Read + Send>>>>,
    line_no: usize,
    factory: QueryFactory,
}

impl RawPatternSource {
    pub fn new(files: Vec<PathBuf>, cfg: SourceConfig) -> Self {
        RawPatternSource {
            files,
            file_idx: 0,
            lines: None,
            line_no: 0,
            factory: QueryFactory::new(cfg),
        }
    }
}

impl PatternSource for RawPatternSource {
    fn next(&mut self) -> Option<Query> {
        if self.factory.exhausted() {
            return None;
        }
        loop {
            if self.lines.is_none() {
                if self.file_idx >= self.files.len() {
                    return None;
                }
                let path = &self.files[self.file_idx];
                let reader = xzopen(path, "r").unwrap_or_else(|e| {
                    err_fatal("reads", &format!("could not open {}: {e}", path.display()))
                });
                self.lines = Some(BufReader::new(reader).lines());
            }
            match self.lines.as_mut().unwrap().next() {
                Some(Ok(line)) => {
                    let name = self.line_no.to_string();
                    self.line_no += 1;
                    let seq = line.trim_end();
                    if seq.is_empty() {
                        continue;
                    }
                    if let Some(q) = self.factory.make(&name, seq.as_bytes(), None) {
                        return Some(q);
                    }
                }
                Some(Err(e)) => {
                    err_fatal(
                        "reads",
                        &format!("could not read {}: {e}", self.files[self.file_idx].display()),
                    );
                }
                None => {
                    self.lines = None;
                    self.file_idx += 1;
                }
            }
        }
    }

    fn reset(&mut self) {
        self.lines = None;
        self.file_idx = 0;
        self.line_no = 0;
        self.factory.reset();
    }

    fn set_reverse(&mut self, reverse: bool) {
        self.factory.reverse = reverse;
    }

    fn num_served(&self) -> u32 {
        self.factory.next_id
    }
}

/// Mutex wrapper handing out reads to the worker pool; the only
/// serialization point of a phase besides hit emission.
pub struct SyncPatternSource {
    inner: Mutex<Box<dyn PatternSource>>,
}

impl SyncPatternSource {
    pub fn new(source: Box<dyn PatternSource>) -> Self {
        SyncPatternSource {
            inner: Mutex::new(source),
        }
    }

    pub fn next(&self) -> Option<Query> {
        self.inner.lock().unwrap().next()
    }

    pub fn reset(&self, reverse: bool) {
        let mut src = self.inner.lock().unwrap();
        src.reset();
        src.set_reverse(reverse);
    }

    pub fn num_served(&self) -> u32 {
        self.inner.lock().unwrap().num_served()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dna::decode_seq;

    fn cfg() -> SourceConfig {
        SourceConfig::default()
    }

    #[test]
    fn test_vector_source_orientations() {
        let mut src = VectorPatternSource::new(&["GATTACA"], cfg());
        let q = src.next().unwrap();
        assert_eq!(q.id, 0);
        assert_eq!(decode_seq(&q.fw), "GATTACA");
        assert_eq!(decode_seq(&q.rc), "TGTAATC");
        assert_eq!(q.qual_fw.len(), 7);
        assert!(src.next().is_none());
    }

    #[test]
    fn test_reverse_presentation() {
        let mut src = VectorPatternSource::new(&["GATTACA"], cfg());
        src.set_reverse(true);
        let q = src.next().unwrap();
        assert_eq!(decode_seq(&q.fw), "ACATTAG");
        assert_eq!(decode_seq(&q.rc), "CTAATGT");
    }

    #[test]
    fn test_ids_stable_across_reset() {
        let mut src = VectorPatternSource::new(&["ACGT", "GGGG"], cfg());
        let ids1: Vec<u32> = std::iter::from_fn(|| src.next()).map(|q| q.id).collect();
        src.reset();
        let ids2: Vec<u32> = std::iter::from_fn(|| src.next()).map(|q| q.id).collect();
        assert_eq!(ids1, vec![0, 1]);
        assert_eq!(ids1, ids2);
    }

    #[test]
    fn test_trimming() {
        let mut c = cfg();
        c.trim5 = 2;
        c.trim3 = 1;
        let mut src = VectorPatternSource::new(&["GGACGTT"], c);
        let q = src.next().unwrap();
        assert_eq!(decode_seq(&q.fw), "ACGT");
    }

    #[test]
    fn test_max_ns_skips_without_consuming_ids() {
        let mut c = cfg();
        c.max_ns = 1;
        let mut src = VectorPatternSource::new(&["ANNA", "ACGT"], c);
        let q = src.next().unwrap();
        assert_eq!(q.id, 0);
        assert_eq!(decode_seq(&q.fw), "ACGT");
    }

    #[test]
    fn test_n_to_a_policy() {
        let mut c = cfg();
        c.ns_policy = NsPolicy::NToA;
        let mut src = VectorPatternSource::new(&["ANGT"], c);
        let q = src.next().unwrap();
        assert_eq!(decode_seq(&q.fw), "AAGT");
    }

    #[test]
    fn test_q_upto_limits_reads() {
        let mut c = cfg();
        c.q_upto = 1;
        let mut src = VectorPatternSource::new(&["ACGT", "GGGG"], c);
        assert!(src.next().is_some());
        assert!(src.next().is_none());
        assert_eq!(src.num_served(), 1);
    }

    #[test]
    fn test_qualities_follow_orientation() {
        let rec = vec![(
            "r".to_string(),
            b"ACGT".to_vec(),
            vec![b'!' + 10, b'!' + 20, b'!' + 30, b'!' + 40],
        )];
        let mut src = VectorPatternSource::with_quals(rec, cfg());
        let q = src.next().unwrap();
        assert_eq!(q.qual_fw, vec![10, 20, 30, 40]);
        assert_eq!(q.qual_rc, vec![40, 30, 20, 10]);
    }
}
