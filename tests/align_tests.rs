// End-to-end tests of the four search pipelines over in-memory indexes.

use ebwt_align::backtrack::naive_hits;
use ebwt_align::dna::{decode_base, encode_base, revcomp};
use ebwt_align::ebwt::Ebwt;
use ebwt_align::ebwt_index::{build_in_memory, build_index, mirror_basename};
use ebwt_align::hit::{Hit, RetainingSink};
use ebwt_align::options::{AlignOpt, SearchMode};
use ebwt_align::pattern::{SourceConfig, SyncPatternSource, VectorPatternSource};
use ebwt_align::search::Aligner;

fn enc(s: &str) -> Vec<u8> {
    s.bytes().map(encode_base).collect()
}

fn dec(s: &[u8]) -> String {
    s.iter().map(|&c| decode_base(c) as char).collect()
}

/// Run one configuration over in-memory indexes and collect the hits.
fn align(reference: &str, reads: &[&str], opt: &AlignOpt) -> Vec<Hit> {
    let (mut fwd, mut mir) = build_in_memory(&[("ref0", reference)], 2).unwrap();
    let src = VectorPatternSource::new(
        reads,
        SourceConfig {
            q_upto: opt.q_upto,
            ns_policy: opt.ns_policy,
            ..SourceConfig::default()
        },
    );
    let patsrc = SyncPatternSource::new(Box::new(src));
    let sink = RetainingSink::new();
    Aligner::new(opt, &patsrc, &sink).run(&mut fwd, Some(&mut mir));
    sink.hits()
}

fn align_with_quals(
    reference: &str,
    reads: Vec<(String, Vec<u8>, Vec<u8>)>,
    opt: &AlignOpt,
) -> Vec<Hit> {
    let (mut fwd, mut mir) = build_in_memory(&[("ref0", reference)], 2).unwrap();
    let src = VectorPatternSource::with_quals(reads, SourceConfig::default());
    let patsrc = SyncPatternSource::new(Box::new(src));
    let sink = RetainingSink::new();
    Aligner::new(opt, &patsrc, &sink).run(&mut fwd, Some(&mut mir));
    sink.hits()
}

fn end_to_end(k: u32, one_hit: bool) -> AlignOpt {
    AlignOpt {
        mode: SearchMode::EndToEnd(k),
        one_hit,
        ..AlignOpt::default()
    }
}

const REF1: &str = "AAAAGATCGATCGATCGATCAAAA";

#[test]
fn test_exact_all_hits_single_occurrence() {
    let mut opt = end_to_end(0, false);
    opt.revcomp = false;
    let hits = align(REF1, &["GATCGATCGATCGATC"], &opt);
    assert_eq!(hits.len(), 1);
    let h = &hits[0];
    assert_eq!((h.ref_id, h.ref_off, h.fw), (0, 4, true));
    assert!(h.mms.is_empty());
}

#[test]
fn test_exact_palindromic_read_hits_both_strands() {
    // GATC repeats are their own reverse complement, so with both strands
    // enabled the same window is reported once per strand.
    let hits = align(REF1, &["GATCGATCGATCGATC"], &end_to_end(0, false));
    let mut got: Vec<(u32, bool)> = hits.iter().map(|h| (h.ref_off, h.fw)).collect();
    got.sort_unstable();
    assert_eq!(got, vec![(4, false), (4, true)]);
}

#[test]
fn test_one_mismatch_mode_exact_position() {
    // One difference at 5'-offset 11; nothing else in range on this strand.
    let mut opt = end_to_end(1, false);
    opt.revcomp = false;
    let hits = align(REF1, &["GATCGATCGATAGATC"], &opt);
    assert_eq!(hits.len(), 1);
    let h = &hits[0];
    assert_eq!((h.ref_id, h.ref_off, h.fw), (0, 4, true));
    assert_eq!(h.mms.positions(), vec![11]);
}

#[test]
fn test_exact_two_occurrences_and_one_hit_determinism() {
    let reference = "AAAAGATCGTTTTTTTTTTTGATCGAAA";
    let hits = align(reference, &["GATCG"], &end_to_end(0, false));
    let mut offs: Vec<u32> = hits.iter().map(|h| h.ref_off).collect();
    offs.sort_unstable();
    assert_eq!(offs, vec![4, 20]);

    let mut opt = end_to_end(0, true);
    opt.seed = 99;
    let first = align(reference, &["GATCG"], &opt);
    assert_eq!(first.len(), 1);
    let again = align(reference, &["GATCG"], &opt);
    assert_eq!(first[0].ref_off, again[0].ref_off, "same seed, same choice");
    assert!([4, 20].contains(&first[0].ref_off));
}

#[test]
fn test_n_read_matches_nothing_in_exact_mode() {
    let hits = align(REF1, &["GATNGATCGATCGATC"], &end_to_end(0, false));
    assert!(hits.is_empty());
}

#[test]
fn test_one_mismatch_completeness_both_strands() {
    // Every read either copies a reference window, copies it with one
    // change, or copies a window of the reverse complement.
    let reference = "ACGGTTACCAGATTACAGGATCCGGTTAACGTGCATTACGGA";
    let refs = vec![enc(reference)];
    let reads: Vec<String> = vec![
        dec(&enc(&reference[3..19])),
        {
            let mut r = enc(&reference[8..24]);
            r[2] = (r[2] + 1) % 4;
            dec(&r)
        },
        dec(&revcomp(&enc(&reference[10..30]))),
        {
            let mut r = revcomp(&enc(&reference[14..34]));
            r[17] = (r[17] + 2) % 4;
            dec(&r)
        },
        "TTTTTTTTTTTTTTTT".to_string(),
    ];
    let read_refs: Vec<&str> = reads.iter().map(String::as_str).collect();
    let hits = align(reference, &read_refs, &end_to_end(1, false));

    for (id, read) in reads.iter().enumerate() {
        let mut got: Vec<(bool, u32, Vec<u32>)> = hits
            .iter()
            .filter(|h| h.read_id == id as u32)
            .map(|h| (h.fw, h.ref_off, h.mms.positions()))
            .collect();
        got.sort();
        assert_eq!(got, oracle_both_strands(&refs, &enc(read), 1), "read {id} ({read})");
    }
}

/// The full expected hit set for one read: oracle over both strands, with
/// rc mismatch positions flipped into read-5' coordinates.
fn oracle_both_strands(refs: &[Vec<u8>], read: &[u8], k: usize) -> Vec<(bool, u32, Vec<u32>)> {
    let mut expect: Vec<(bool, u32, Vec<u32>)> = Vec::new();
    for (_, off, mm) in naive_hits(refs, read, k) {
        expect.push((true, off, mm));
    }
    let rc = revcomp(read);
    for (_, off, mm) in naive_hits(refs, &rc, k) {
        let len = rc.len() as u32;
        let mut read_mm: Vec<u32> = mm.iter().map(|&p| len - 1 - p).collect();
        read_mm.sort_unstable();
        expect.push((false, off, read_mm));
    }
    expect.sort();
    expect
}

#[test]
fn test_two_mismatch_split_read_found() {
    // One mismatch in each seed half: only the half-and-half pass can place
    // them, and the emitted set still matches the oracle exactly.
    let reference = "ACGGTTACCAGATTACAGGATCCGGTTAACGTGCATTACGGA";
    let refs = vec![enc(reference)];
    let mut read = enc(&reference[10..26]);
    read[3] = (read[3] + 1) % 4;
    read[11] = (read[11] + 2) % 4;
    let read_str = dec(&read);
    let hits = align(reference, &[&read_str], &end_to_end(2, false));

    let mut got: Vec<(bool, u32, Vec<u32>)> = hits
        .iter()
        .map(|h| (h.fw, h.ref_off, h.mms.positions()))
        .collect();
    got.sort();
    assert_eq!(got, oracle_both_strands(&refs, &read, 2));
    assert!(
        got.contains(&(true, 10, vec![3, 11])),
        "the straddling alignment itself must be reported"
    );
}

#[test]
fn test_two_mismatch_completeness() {
    let reference = "ACGGTTACCAGATTACAGGATCCGGTTAACGTGCATTACGGA";
    let refs = vec![enc(reference)];
    let mut read = enc(&reference[6..26]);
    read[4] = (read[4] + 1) % 4;
    read[15] = (read[15] + 3) % 4;
    let read_str = dec(&read);
    let hits = align(reference, &[&read_str], &end_to_end(2, false));

    let mut got: Vec<(bool, u32, Vec<u32>)> = hits
        .iter()
        .map(|h| (h.fw, h.ref_off, h.mms.positions()))
        .collect();
    got.sort();
    assert_eq!(got, oracle_both_strands(&refs, &read, 2));
    assert!(hits.iter().any(|h| h.ref_off == 6 && h.fw));
}

#[test]
fn test_one_hit_reports_at_most_once_per_read() {
    let reference = "AAAAGATCGTTTTTTTTTTTGATCGAAA";
    let reads = ["GATCG", "TTTTTTT", "CCCCC"];
    let hits = align(reference, &reads, &end_to_end(0, true));
    for id in 0..reads.len() as u32 {
        let n = hits.iter().filter(|h| h.read_id == id).count();
        assert!(n <= 1, "read {id} reported {n} hits in one-hit mode");
    }
    // GATCG and TTTTTTT align; CCCCC does not.
    assert_eq!(hits.iter().filter(|h| h.read_id == 0).count(), 1);
    assert_eq!(hits.iter().filter(|h| h.read_id == 1).count(), 1);
    assert_eq!(hits.iter().filter(|h| h.read_id == 2).count(), 0);
}

const SEED_REF: &str = "TGCAACGGTTCAGGTCCTATAGCATCGCAATGGACCTTGAGCAT";

fn seeded_opt(seed_mms: u32) -> AlignOpt {
    AlignOpt {
        mode: SearchMode::Seeded,
        seed_len: 20,
        seed_mms,
        qual_thresh: 70,
        one_hit: true,
        ..AlignOpt::default()
    }
}

fn segment() -> Vec<u8> {
    enc(&SEED_REF[10..34])
}

fn with_change(mut seq: Vec<u8>, pos: usize, delta: u8) -> Vec<u8> {
    seq[pos] = (seq[pos] + delta) % 4;
    seq
}

#[test]
fn test_seeded_covers_all_mismatch_cases() {
    // One read per pipeline case: seed-right and seed-left mismatches on
    // each strand, plus a split read on each strand.
    let cases: Vec<(String, bool, Vec<u32>)> = vec![
        (dec(&with_change(segment(), 15, 1)), true, vec![15]),
        (
            dec(&with_change(revcomp(&segment()), 15, 1)),
            false,
            vec![15],
        ),
        (dec(&with_change(segment(), 4, 2)), true, vec![4]),
        (dec(&with_change(revcomp(&segment()), 4, 2)), false, vec![4]),
        (
            dec(&with_change(with_change(segment(), 4, 1), 15, 1)),
            true,
            vec![4, 15],
        ),
        (
            dec(&with_change(with_change(revcomp(&segment()), 4, 1), 15, 1)),
            false,
            vec![4, 15],
        ),
    ];
    let reads: Vec<&str> = cases.iter().map(|(r, _, _)| r.as_str()).collect();
    let hits = align(SEED_REF, &reads, &seeded_opt(2));

    for (id, (read, fw, mm)) in cases.iter().enumerate() {
        let per_read: Vec<&Hit> = hits.iter().filter(|h| h.read_id == id as u32).collect();
        assert_eq!(per_read.len(), 1, "read {id} ({read}) should align once");
        let h = per_read[0];
        assert_eq!(h.ref_off, 10, "read {id}");
        assert_eq!(h.fw, *fw, "read {id}");
        assert_eq!(&h.mms.positions(), mm, "read {id}");
    }
}

#[test]
fn test_seeded_quality_cutoff() {
    // Two seed mismatches at rounded qualities 30+30 pass the cutoff of 70;
    // at 40+40 they do not.
    let read = with_change(with_change(segment(), 2, 1), 6, 1);
    let make = |q_mm: u8| {
        let mut quals = vec![b'!' + 30; 24];
        quals[2] = b'!' + q_mm;
        quals[6] = b'!' + q_mm;
        vec![("r0".to_string(), dec(&read).into_bytes(), quals)]
    };

    let hits = align_with_quals(SEED_REF, make(30), &seeded_opt(2));
    assert_eq!(hits.len(), 1, "penalty 60 is within the cutoff");
    assert_eq!(hits[0].mms.positions(), vec![2, 6]);

    let hits = align_with_quals(SEED_REF, make(40), &seeded_opt(2));
    assert!(hits.is_empty(), "penalty 80 exceeds the cutoff");
}

#[test]
fn test_seeded_tail_mismatches_do_not_count_against_seed() {
    // seed_mms = 1: one mismatch inside the seed plus one in the tail is
    // still acceptable (the tail is only quality-bounded).
    let read = with_change(with_change(segment(), 15, 1), 22, 1);
    let reads = [dec(&read)];
    let read_refs: Vec<&str> = reads.iter().map(String::as_str).collect();
    let hits = align(SEED_REF, &read_refs, &seeded_opt(1));
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].mms.positions(), vec![15, 22]);
}

#[test]
fn test_worker_pool_matches_single_thread() {
    // Four workers over a batch of reads produce the same hit multiset as
    // one worker (order aside).
    let reference = "ACGGTTACCAGATTACAGGATCCGGTTAACGTGCATTACGGA";
    let reads: Vec<String> = (0..12)
        .map(|i| {
            let start = i % 20;
            dec(&enc(&reference[start..start + 18]))
        })
        .collect();
    let read_refs: Vec<&str> = reads.iter().map(String::as_str).collect();

    let single = align(reference, &read_refs, &end_to_end(1, false));
    let mut opt = end_to_end(1, false);
    opt.nthreads = 4;
    let pooled = align(reference, &read_refs, &opt);

    let key = |h: &Hit| (h.read_id, h.fw, h.ref_id, h.ref_off, h.mms.positions());
    let mut a: Vec<_> = single.iter().map(key).collect();
    let mut b: Vec<_> = pooled.iter().map(key).collect();
    a.sort();
    b.sort();
    assert_eq!(a, b);
}

#[test]
fn test_disk_roundtrip_pipeline() {
    // Index on disk, reads from a FASTQ file, full seeded run.
    use std::io::Write;
    let dir = tempfile::tempdir().unwrap();
    let fa = dir.path().join("ref.fa");
    std::fs::write(&fa, format!(">ref0\n{SEED_REF}\n")).unwrap();
    let base = dir.path().join("idx");
    build_index(&fa, &base, 2, false).unwrap();

    let fq = dir.path().join("reads.fq");
    let mut f = std::fs::File::create(&fq).unwrap();
    let read = dec(&with_change(segment(), 15, 1));
    writeln!(f, "@r0\n{read}\n+\n{}", "I".repeat(24)).unwrap();
    drop(f);

    let mut fwd = Ebwt::open(&base, None).unwrap();
    let mut mir = Ebwt::open(&mirror_basename(&base), None).unwrap();
    let src = ebwt_align::pattern::FastqPatternSource::new(vec![fq], SourceConfig::default());
    let patsrc = SyncPatternSource::new(Box::new(src));
    let sink = RetainingSink::new();
    let opt = seeded_opt(2);
    Aligner::new(&opt, &patsrc, &sink).run(&mut fwd, Some(&mut mir));

    let hits = sink.hits();
    assert_eq!(hits.len(), 1);
    assert_eq!((hits[0].ref_off, hits[0].fw), (10, true));
    assert_eq!(hits[0].mms.positions(), vec![15]);
    assert_eq!(hits[0].name, "r0");
}
