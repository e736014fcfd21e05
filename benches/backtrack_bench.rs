// Microbenchmarks for the hot search loop.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use ebwt_align::backtrack::{Backtracker, BtConfig, Orientation, RevOffs};
use ebwt_align::dna::encode_base;
use ebwt_align::ebwt::{Ebwt, RefMap};
use ebwt_align::hit::{NullHitSink, SinkAgent};

fn random_reference(len: usize, seed: u64) -> String {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len)
        .map(|_| ['A', 'C', 'G', 'T'][rng.gen_range(0..4)])
        .collect()
}

fn build_index(text: &str) -> Ebwt {
    let mut refs = RefMap::default();
    refs.push("ref0".to_string(), 0, text.len() as u32);
    Ebwt::build(text.as_bytes(), refs, 5, false).unwrap()
}

fn bench_backtrack(c: &mut Criterion) {
    let text = random_reference(100_000, 7);
    let ebwt = build_index(&text);
    let mut rng = StdRng::seed_from_u64(11);

    // 36 bp reads drawn from the reference, one injected mismatch each.
    let reads: Vec<Vec<u8>> = (0..256)
        .map(|_| {
            let start = rng.gen_range(0..text.len() - 36);
            let mut pat: Vec<u8> = text[start..start + 36].bytes().map(encode_base).collect();
            let pos = rng.gen_range(0..36);
            pat[pos] = (pat[pos] + rng.gen_range(1..4)) % 4;
            pat
        })
        .collect();
    let quals = vec![30u8; 36];

    c.bench_function("exact_search_36bp", |b| {
        let sink = NullHitSink;
        let mut agent = SinkAgent::new(&sink);
        let cfg = BtConfig::new(RevOffs::exact(36));
        let mut bt = Backtracker::new(&ebwt, cfg, 0);
        b.iter(|| {
            for pat in &reads {
                let mut p = pat.clone();
                black_box(bt.backtrack(
                    &mut p,
                    &quals,
                    "r",
                    0,
                    Orientation::FW,
                    &[],
                    0,
                    &mut agent,
                    None,
                ));
            }
        })
    });

    c.bench_function("one_mismatch_search_36bp", |b| {
        let sink = NullHitSink;
        let mut agent = SinkAgent::new(&sink);
        let cfg = BtConfig::new(RevOffs::new(0, 36, 36, 36));
        let mut bt = Backtracker::new(&ebwt, cfg, 0);
        b.iter(|| {
            for pat in &reads {
                let mut p = pat.clone();
                black_box(bt.backtrack(
                    &mut p,
                    &quals,
                    "r",
                    0,
                    Orientation::FW,
                    &[],
                    0,
                    &mut agent,
                    None,
                ));
            }
        })
    });
}

criterion_group!(benches, bench_backtrack);
criterion_main!(benches);
