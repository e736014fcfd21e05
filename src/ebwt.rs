// FM-index over the reference (or its reversal), with checkpointed rank.
//
// Layout follows the classic small-alphabet design: the BWT is held only as
// 64-row checkpoint blocks (running per-base counts plus four one-hot bit
// planes), so a single structure answers both rank queries and character
// lookups with one popcount. The sentinel occupies a "hole" row recorded in
// the header; it has no bit in any plane.
//
// The suffix array is sampled by value: rows whose suffix offset is a
// multiple of 2^off_rate carry a sample, so resolving a row walks at most
// 2^off_rate LF steps.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use bio::data_structures::bwt::bwt;
use bio::data_structures::suffix_array::suffix_array;

use crate::dna::encode_base;

const EBWT_MAGIC: u32 = 0x4542_5754;
const EBWT_VERSION: u32 = 3;
const FLAG_MIRROR: u32 = 1;

/// One rank checkpoint: per-base occurrence counts for all rows before the
/// block, and one-hot planes for the 64 rows inside it.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct OccCheckpoint {
    pub counts: [u64; 4],
    pub bits: [u64; 4],
}

/// Reference names and their extents inside the concatenated text.
#[derive(Debug, Clone, Default)]
pub struct RefMap {
    pub names: Vec<String>,
    pub starts: Vec<u32>,
    pub lens: Vec<u32>,
}

impl RefMap {
    pub fn push(&mut self, name: String, start: u32, len: u32) {
        self.names.push(name);
        self.starts.push(start);
        self.lens.push(len);
    }

    /// Map a forward-text offset to reference coordinates. `None` when the
    /// match would straddle a reference boundary.
    pub fn locate(&self, text_off: u32, qlen: u32) -> Option<(u32, u32)> {
        let i = self.starts.partition_point(|&s| s <= text_off) - 1;
        let off = text_off - self.starts[i];
        if off + qlen <= self.lens[i] {
            Some((i as u32, off))
        } else {
            None
        }
    }
}

/// The bulky, evictable payload.
struct EbwtCore {
    checkpoints: Vec<OccCheckpoint>,
    sa_rows: Vec<u32>,
    sa_vals: Vec<u32>,
}

pub struct Ebwt {
    /// Paths for load(); `None` for purely in-memory indexes.
    path1: Option<PathBuf>,
    path2: Option<PathBuf>,
    mirror: bool,
    off_rate: u32,
    /// Sampling rate actually in effect (>= off_rate when overridden).
    effective_off_rate: u32,
    text_len: u32,
    primary: u32,
    /// First row for each base (the C array; row 0 is the sentinel suffix).
    ccounts: [u64; 4],
    refs: RefMap,
    core: Option<EbwtCore>,
}

fn read_u32(r: &mut impl Read) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(r: &mut impl Read) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn bad_data(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

impl Ebwt {
    /// Build an index in memory from ASCII reference text (A/C/G/T only;
    /// the caller has already rewritten Ns). `text` is the concatenation of
    /// the references described by `refs`; for a mirror index the caller
    /// passes the reversed text with the same (forward) `refs`.
    pub fn build(text: &[u8], refs: RefMap, off_rate: u32, mirror: bool) -> io::Result<Ebwt> {
        if text.len() >= u32::MAX as usize {
            return Err(bad_data(format!(
                "reference too large for this index format: {} bases",
                text.len()
            )));
        }
        let mut t: Vec<u8> = Vec::with_capacity(text.len() + 1);
        t.extend_from_slice(text);
        t.push(b'$');

        let sa = suffix_array(&t);
        let bw = bwt(&t, &sa);
        let num_rows = t.len() as u32;

        // Checkpoints: one block per 64 rows plus a terminal block so rank
        // queries at row == num_rows stay in bounds.
        let nblocks = (num_rows as usize / 64) + 1;
        let mut checkpoints = vec![OccCheckpoint::default(); nblocks];
        let mut running = [0u64; 4];
        let mut primary = None;
        for (row, &ch) in bw.iter().enumerate() {
            if row % 64 == 0 {
                checkpoints[row / 64].counts = running;
            }
            if ch == b'$' {
                primary = Some(row as u32);
                continue;
            }
            let c = encode_base(ch);
            debug_assert!(c < 4, "non-ACGT character in BWT");
            checkpoints[row / 64].bits[c as usize] |= 1u64 << (row % 64);
            running[c as usize] += 1;
        }
        if num_rows as usize % 64 == 0 {
            checkpoints[nblocks - 1].counts = running;
        }
        let primary =
            primary.ok_or_else(|| bad_data("BWT has no sentinel row".to_string()))?;

        // C array: row 0 is the sentinel suffix, then bases in order.
        let mut ccounts = [0u64; 4];
        let mut acc = 1u64;
        for c in 0..4 {
            ccounts[c] = acc;
            acc += running[c];
        }

        // Value-sampled suffix array.
        let period = 1u32 << off_rate;
        let mut sa_rows = Vec::new();
        let mut sa_vals = Vec::new();
        for (row, &val) in sa.iter().enumerate() {
            if (val as u32) % period == 0 {
                sa_rows.push(row as u32);
                sa_vals.push(val as u32);
            }
        }

        Ok(Ebwt {
            path1: None,
            path2: None,
            mirror,
            off_rate,
            effective_off_rate: off_rate,
            text_len: text.len() as u32,
            primary,
            ccounts,
            refs,
            core: Some(EbwtCore {
                checkpoints,
                sa_rows,
                sa_vals,
            }),
        })
    }

    /// Write the `.1.ebwt`/`.2.ebwt` pair for `basename`. The index must be
    /// resident.
    pub fn save(&self, basename: &Path) -> io::Result<()> {
        let core = self
            .core
            .as_ref()
            .ok_or_else(|| bad_data("cannot save an evicted index".to_string()))?;

        let p1 = with_suffix(basename, ".1.ebwt");
        let mut w = BufWriter::new(File::create(&p1)?);
        w.write_all(&EBWT_MAGIC.to_le_bytes())?;
        w.write_all(&EBWT_VERSION.to_le_bytes())?;
        let flags = if self.mirror { FLAG_MIRROR } else { 0 };
        w.write_all(&flags.to_le_bytes())?;
        w.write_all(&self.off_rate.to_le_bytes())?;
        w.write_all(&(self.text_len as u64).to_le_bytes())?;
        w.write_all(&(self.primary as u64).to_le_bytes())?;
        for c in 0..4 {
            w.write_all(&self.ccounts[c].to_le_bytes())?;
        }
        w.write_all(&(core.checkpoints.len() as u64).to_le_bytes())?;
        for cp in &core.checkpoints {
            for c in 0..4 {
                w.write_all(&cp.counts[c].to_le_bytes())?;
            }
            for c in 0..4 {
                w.write_all(&cp.bits[c].to_le_bytes())?;
            }
        }
        w.flush()?;

        let p2 = with_suffix(basename, ".2.ebwt");
        let mut w = BufWriter::new(File::create(&p2)?);
        w.write_all(&EBWT_MAGIC.to_le_bytes())?;
        w.write_all(&EBWT_VERSION.to_le_bytes())?;
        w.write_all(&(core.sa_rows.len() as u64).to_le_bytes())?;
        for &row in &core.sa_rows {
            w.write_all(&row.to_le_bytes())?;
        }
        for &val in &core.sa_vals {
            w.write_all(&val.to_le_bytes())?;
        }
        w.write_all(&(self.refs.names.len() as u32).to_le_bytes())?;
        for i in 0..self.refs.names.len() {
            let name = self.refs.names[i].as_bytes();
            w.write_all(&(name.len() as u32).to_le_bytes())?;
            w.write_all(name)?;
            w.write_all(&self.refs.starts[i].to_le_bytes())?;
            w.write_all(&self.refs.lens[i].to_le_bytes())?;
        }
        w.flush()
    }

    /// Open an index pair, reading only the header and reference table. The
    /// bulky payload is brought in by `load()`. An `off_rate` override may
    /// thin the stored samples but never densify them.
    pub fn open(basename: &Path, off_rate_override: Option<u32>) -> io::Result<Ebwt> {
        let p1 = with_suffix(basename, ".1.ebwt");
        let p2 = with_suffix(basename, ".2.ebwt");

        let mut r = BufReader::new(File::open(&p1)?);
        if read_u32(&mut r)? != EBWT_MAGIC {
            return Err(bad_data(format!("{}: not an ebwt index", p1.display())));
        }
        let version = read_u32(&mut r)?;
        if version != EBWT_VERSION {
            return Err(bad_data(format!(
                "{}: unsupported index version {} (expected {})",
                p1.display(),
                version,
                EBWT_VERSION
            )));
        }
        let flags = read_u32(&mut r)?;
        let off_rate = read_u32(&mut r)?;
        let text_len = read_u64(&mut r)? as u32;
        let primary = read_u64(&mut r)? as u32;
        let mut ccounts = [0u64; 4];
        for c in ccounts.iter_mut() {
            *c = read_u64(&mut r)?;
        }

        let effective_off_rate = match off_rate_override {
            Some(rate) if rate < off_rate => {
                return Err(bad_data(format!(
                    "requested off-rate {} is below the index's rate {}; \
                     rebuild the index to sample more densely",
                    rate, off_rate
                )));
            }
            Some(rate) => rate,
            None => off_rate,
        };

        // Reference table from the tail of the .2 file.
        let mut r2 = BufReader::new(File::open(&p2)?);
        if read_u32(&mut r2)? != EBWT_MAGIC {
            return Err(bad_data(format!("{}: not an ebwt index", p2.display())));
        }
        let _version = read_u32(&mut r2)?;
        let nsamples = read_u64(&mut r2)? as usize;
        // Skip sample arrays.
        io::copy(
            &mut r2.by_ref().take(nsamples as u64 * 8),
            &mut io::sink(),
        )?;
        let refs = read_refmap(&mut r2)?;

        Ok(Ebwt {
            path1: Some(p1),
            path2: Some(p2),
            mirror: flags & FLAG_MIRROR != 0,
            off_rate,
            effective_off_rate,
            text_len,
            primary,
            ccounts,
            refs,
            core: None,
        })
    }

    /// Bring the checkpoint blocks and SA samples into memory.
    pub fn load(&mut self) -> io::Result<()> {
        if self.core.is_some() {
            return Ok(());
        }
        let p1 = self
            .path1
            .as_ref()
            .ok_or_else(|| bad_data("in-memory index was evicted".to_string()))?;
        // 16 MB read buffer: the checkpoint array dominates and the default
        // buffer size turns it into millions of tiny reads.
        const BUF: usize = 16 * 1024 * 1024;
        let mut r = BufReader::with_capacity(BUF, File::open(p1)?);
        // Header already validated in open(); skip it.
        let header_len = 4 + 4 + 4 + 4 + 8 + 8 + 32;
        io::copy(&mut r.by_ref().take(header_len), &mut io::sink())?;
        let nblocks = read_u64(&mut r)? as usize;
        let mut checkpoints = Vec::new();
        if checkpoints.try_reserve_exact(nblocks).is_err() {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "could not allocate rank checkpoints",
            ));
        }
        for _ in 0..nblocks {
            let mut cp = OccCheckpoint::default();
            for c in 0..4 {
                cp.counts[c] = read_u64(&mut r)?;
            }
            for c in 0..4 {
                cp.bits[c] = read_u64(&mut r)?;
            }
            checkpoints.push(cp);
        }

        let p2 = self.path2.as_ref().unwrap();
        let mut r = BufReader::with_capacity(BUF, File::open(p2)?);
        io::copy(&mut r.by_ref().take(8), &mut io::sink())?;
        let nsamples = read_u64(&mut r)? as usize;
        let mut sa_rows = Vec::with_capacity(nsamples);
        let mut sa_vals = Vec::with_capacity(nsamples);
        for _ in 0..nsamples {
            sa_rows.push(read_u32(&mut r)?);
        }
        for _ in 0..nsamples {
            sa_vals.push(read_u32(&mut r)?);
        }

        // Apply an upward off-rate override by thinning samples.
        if self.effective_off_rate > self.off_rate {
            let period = 1u32 << self.effective_off_rate;
            let mut rows = Vec::new();
            let mut vals = Vec::new();
            for i in 0..sa_rows.len() {
                if sa_vals[i] % period == 0 {
                    rows.push(sa_rows[i]);
                    vals.push(sa_vals[i]);
                }
            }
            sa_rows = rows;
            sa_vals = vals;
        }

        log::debug!(
            "loaded {} index: {} rows, {} checkpoints, {} SA samples",
            if self.mirror { "mirror" } else { "forward" },
            self.num_rows(),
            nblocks,
            sa_rows.len()
        );
        self.core = Some(EbwtCore {
            checkpoints,
            sa_rows,
            sa_vals,
        });
        Ok(())
    }

    /// Release the bulky payload. In-memory indexes have nowhere to reload
    /// from and stay resident.
    pub fn evict(&mut self) {
        if self.path1.is_none() {
            return;
        }
        if self.core.take().is_some() {
            log::debug!(
                "evicted {} index",
                if self.mirror { "mirror" } else { "forward" }
            );
        }
    }

    pub fn is_resident(&self) -> bool {
        self.core.is_some()
    }

    pub fn is_mirror(&self) -> bool {
        self.mirror
    }

    pub fn off_rate(&self) -> u32 {
        self.effective_off_rate
    }

    pub fn text_len(&self) -> u32 {
        self.text_len
    }

    pub fn refs(&self) -> &RefMap {
        &self.refs
    }

    /// Total number of BWT rows (text length plus the sentinel).
    #[inline]
    pub fn num_rows(&self) -> u32 {
        self.text_len + 1
    }

    /// The interval spanning every suffix.
    #[inline]
    pub fn whole_interval(&self) -> (u32, u32) {
        (0, self.num_rows())
    }

    fn core(&self) -> &EbwtCore {
        self.core.as_ref().expect("index not resident")
    }

    /// Occurrences of base `c` among BWT rows `[0, row)`.
    #[inline]
    fn occ(&self, c: u8, row: u32) -> u64 {
        let core = self.core();
        let cp = &core.checkpoints[(row / 64) as usize];
        let y = row % 64;
        let mask = if y == 0 { 0 } else { !0u64 >> (64 - y) };
        cp.counts[c as usize] + u64::from((cp.bits[c as usize] & mask).count_ones())
    }

    /// BWT character of a row; `None` at the sentinel hole.
    #[inline]
    fn bwt_char(&self, row: u32) -> Option<u8> {
        if row == self.primary {
            return None;
        }
        let cp = &self.core().checkpoints[(row / 64) as usize];
        let bit = 1u64 << (row % 64);
        (0..4u8).find(|&c| cp.bits[c as usize] & bit != 0)
    }

    /// Interval of the single-base pattern `c`.
    #[inline]
    pub fn initial(&self, c: u8) -> (u32, u32) {
        debug_assert!(c < 4);
        let top = self.ccounts[c as usize];
        let bot = if c == 3 {
            self.num_rows() as u64
        } else {
            self.ccounts[c as usize + 1]
        };
        (top as u32, bot as u32)
    }

    /// Narrow an interval by prepending base `c` to the matched suffix.
    /// Returns an empty interval when `c` does not extend the match.
    #[inline]
    pub fn narrow(&self, top: u32, bot: u32, c: u8) -> (u32, u32) {
        debug_assert!(c < 4 && top <= bot);
        let base = self.ccounts[c as usize];
        let new_top = base + self.occ(c, top);
        let new_bot = base + self.occ(c, bot);
        (new_top as u32, new_bot as u32)
    }

    /// One LF step. Must not be called on the sentinel hole.
    #[inline]
    fn lf(&self, row: u32) -> u32 {
        let c = self.bwt_char(row).expect("LF through the sentinel row");
        (self.ccounts[c as usize] + self.occ(c, row)) as u32
    }

    /// Suffix offset of a row, walking LF to the nearest sample.
    fn sa_value(&self, mut row: u32) -> u32 {
        let core = self.core();
        let mut steps = 0u32;
        loop {
            if let Ok(i) = core.sa_rows.binary_search(&row) {
                return core.sa_vals[i] + steps;
            }
            row = self.lf(row);
            steps += 1;
            debug_assert!(steps <= 1 << self.effective_off_rate);
        }
    }

    /// Map one row of a final interval to reference coordinates for a match
    /// of length `qlen`. `None` when the hit straddles a reference boundary.
    pub fn resolve(&self, row: u32, qlen: u32) -> Option<(u32, u32)> {
        let j = self.sa_value(row);
        let start = if self.mirror {
            self.text_len - j - qlen
        } else {
            j
        };
        self.refs.locate(start, qlen)
    }
}

fn with_suffix(basename: &Path, suffix: &str) -> PathBuf {
    let mut s = basename.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

fn read_refmap(r: &mut impl Read) -> io::Result<RefMap> {
    let nrefs = read_u32(r)? as usize;
    let mut refs = RefMap::default();
    for _ in 0..nrefs {
        let name_len = read_u32(r)? as usize;
        let mut name = vec![0u8; name_len];
        r.read_exact(&mut name)?;
        let name = String::from_utf8(name)
            .map_err(|_| bad_data("reference name is not UTF-8".to_string()))?;
        let start = read_u32(r)?;
        let len = read_u32(r)?;
        refs.push(name, start, len);
    }
    Ok(refs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dna::decode_base;

    fn single_ref(text: &str) -> (Ebwt, Ebwt) {
        let mut refs = RefMap::default();
        refs.push("ref0".to_string(), 0, text.len() as u32);
        let fwd = Ebwt::build(text.as_bytes(), refs.clone(), 2, false).unwrap();
        let rev_text: Vec<u8> = text.bytes().rev().collect();
        let mir = Ebwt::build(&rev_text, refs, 2, true).unwrap();
        (fwd, mir)
    }

    fn search(ebwt: &Ebwt, pat: &[u8]) -> (u32, u32) {
        let (mut top, mut bot) = ebwt.whole_interval();
        for &c in pat.iter().rev() {
            let (t, b) = ebwt.narrow(top, bot, c);
            top = t;
            bot = b;
            if top == bot {
                break;
            }
        }
        (top, bot)
    }

    fn enc(s: &str) -> Vec<u8> {
        s.bytes().map(crate::dna::encode_base).collect()
    }

    #[test]
    fn test_interval_width_counts_occurrences() {
        let text = "AAAAGATCGATCGATCGATCAAAA";
        let (fwd, _) = single_ref(text);
        let (top, bot) = search(&fwd, &enc("GATC"));
        assert_eq!(bot - top, 4);
        let (top, bot) = search(&fwd, &enc("GATCGATCGATCGATC"));
        assert_eq!(bot - top, 1);
        let (top, bot) = search(&fwd, &enc("TTTT"));
        assert_eq!(top, bot);
    }

    #[test]
    fn test_resolve_forward_offsets() {
        let text = "AAAAGATCGATCGATCGATCAAAA";
        let (fwd, _) = single_ref(text);
        let pat = enc("GATCGATCGATCGATC");
        let (top, bot) = search(&fwd, &pat);
        assert_eq!(bot - top, 1);
        assert_eq!(fwd.resolve(top, pat.len() as u32), Some((0, 4)));
    }

    #[test]
    fn test_resolve_mirror_offsets() {
        let text = "AAAAGATCGATCGATCGATCAAAA";
        let (_, mir) = single_ref(text);
        // The mirror index matches reversed patterns at flipped offsets.
        let pat = enc("GATCGATCGATCGATC");
        let rev_pat: Vec<u8> = pat.iter().rev().copied().collect();
        let (top, bot) = search(&mir, &rev_pat);
        assert_eq!(bot - top, 1);
        assert_eq!(mir.resolve(top, pat.len() as u32), Some((0, 4)));
    }

    #[test]
    fn test_all_rows_resolve_to_distinct_offsets() {
        let text = "ACGTACGTAC";
        let (fwd, _) = single_ref(text);
        let pat = enc("AC");
        let (top, bot) = search(&fwd, &pat);
        let mut offs: Vec<u32> = (top..bot)
            .map(|row| fwd.resolve(row, 2).unwrap().1)
            .collect();
        offs.sort_unstable();
        assert_eq!(offs, vec![0, 4, 8]);
    }

    #[test]
    fn test_boundary_spanning_hits_rejected() {
        // Two references; "CA" occurs only across their junction.
        let mut refs = RefMap::default();
        refs.push("a".to_string(), 0, 4);
        refs.push("b".to_string(), 4, 4);
        let ebwt = Ebwt::build(b"GGCAAGGG", refs, 1, false).unwrap();
        let (top, bot) = search(&ebwt, &enc("CAAG"));
        assert_eq!(bot - top, 1);
        assert_eq!(ebwt.resolve(top, 4), None);
        // Within-reference hits still resolve, with per-reference offsets.
        let (top, bot) = search(&ebwt, &enc("GG"));
        let mut locs: Vec<(u32, u32)> = (top..bot).filter_map(|r| ebwt.resolve(r, 2)).collect();
        locs.sort_unstable();
        assert_eq!(locs, vec![(0, 0), (1, 1), (1, 2)]);
    }

    #[test]
    fn test_bwt_char_has_sentinel_hole() {
        let text = "ACGT";
        let (fwd, _) = single_ref(text);
        let mut seen = Vec::new();
        for row in 0..fwd.num_rows() {
            match fwd.bwt_char(row) {
                Some(c) => seen.push(decode_base(c)),
                None => seen.push(b'$'),
            }
        }
        assert_eq!(seen.iter().filter(|&&c| c == b'$').count(), 1);
        // The BWT is a permutation of text + sentinel.
        seen.sort_unstable();
        assert_eq!(seen, b"$ACGT".to_vec());
    }
}
