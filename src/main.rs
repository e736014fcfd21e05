use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use ebwt_align::ebwt::Ebwt;
use ebwt_align::ebwt_index::{build_index, mirror_basename};
use ebwt_align::hit::{ConciseHitSink, FullHitSink, HitSink, NullHitSink};
use ebwt_align::options::{AlignOpt, NsPolicy, OutputMode, SearchMode};
use ebwt_align::pattern::{
    FastaPatternSource, FastqPatternSource, PatternSource, RawPatternSource, SourceConfig,
    SyncPatternSource, VectorPatternSource,
};
use ebwt_align::search::Aligner;
use ebwt_align::utils::Timer;

#[derive(Parser)]
#[command(name = "ebwt-align")]
#[command(about = "Short-read aligner: bounded-mismatch search over a BWT/FM-index pair", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ReadFormat {
    Fastq,
    Fasta,
    Raw,
    /// Treat the read arguments as literal sequences.
    Literal,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the forward and mirror FM-indexes for a reference
    Index {
        /// Input FASTA file (may be gzipped)
        #[arg(value_name = "REF.FA")]
        fasta: PathBuf,

        /// Basename for the index files (default: same as FASTA)
        #[arg(short = 'p', long, value_name = "BASE")]
        prefix: Option<PathBuf>,

        /// Suffix-array sampling: keep offsets divisible by 2^RATE
        #[arg(short = 'o', long, value_name = "INT", default_value = "5")]
        offrate: u32,

        /// Print timing information
        #[arg(short = 't', long)]
        timing: bool,
    },

    /// Align reads against a prebuilt index
    Align {
        /// Index basename (built with 'index')
        #[arg(value_name = "INDEX")]
        index: PathBuf,

        /// Read files (or literal sequences with --format literal)
        #[arg(value_name = "READS", required = true)]
        reads: Vec<String>,

        /// Input format
        #[arg(short = 'f', long, value_enum, default_value = "fastq")]
        format: ReadFormat,

        // ===== Alignment policy =====
        /// End-to-end mode: report alignments with at most INT mismatches
        /// (0-3); disables the seeded quality search
        #[arg(short = 'v', long, value_name = "INT")]
        mismatches: Option<u32>,

        /// Seed length for the seeded quality search
        #[arg(short = 'l', long, value_name = "INT", default_value = "28")]
        seed_len: usize,

        /// Mismatches allowed in the seed (0-3)
        #[arg(short = 'n', long, value_name = "INT", default_value = "2")]
        seed_mms: u32,

        /// Maximum permitted sum of mismatch qualities
        #[arg(short = 'e', long, value_name = "INT", default_value = "70")]
        qual_thresh: u32,

        /// Report all valid alignments per read instead of one random one
        #[arg(short = 'a', long)]
        all_hits: bool,

        /// Do not align against the reverse-complement strand
        #[arg(long)]
        norc: bool,

        /// Backtrack budget for the seeded search
        #[arg(long, value_name = "INT", default_value = "100")]
        maxbts: u32,

        // ===== Read handling =====
        /// Trim INT bases from the 5' end of each read
        #[arg(short = '5', long, value_name = "INT", default_value = "0")]
        trim5: usize,

        /// Trim INT bases from the 3' end of each read
        #[arg(short = '3', long, value_name = "INT", default_value = "0")]
        trim3: usize,

        /// Skip reads with more than INT no-confidence bases
        #[arg(long, value_name = "INT", default_value = "999999")]
        maxns: usize,

        /// Rewrite no-confidence bases to A instead of matching nothing
        #[arg(long)]
        ntoa: bool,

        /// Qualities are Solexa-scaled; rescale them to Phred
        #[arg(long)]
        solexa_quals: bool,

        /// Stop after the first INT reads
        #[arg(short = 'u', long, value_name = "INT")]
        qupto: Option<u32>,

        // ===== Output =====
        /// Output file (default: stdout)
        #[arg(long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// Compact id±:<ref,off,mms> output
        #[arg(long)]
        concise: bool,

        /// Suppress hit output (timing/benchmark runs)
        #[arg(long)]
        no_out: bool,

        // ===== Processing =====
        /// Number of worker threads (default: all cores)
        #[arg(short = 'p', long, value_name = "INT")]
        threads: Option<usize>,

        /// Seed for the pick-one-random hit choice
        #[arg(long, value_name = "INT", default_value = "0")]
        seed: u64,

        /// Override the index's suffix-array sampling rate (upward only)
        #[arg(short = 'o', long, value_name = "INT")]
        offrate: Option<u32>,

        /// Print per-phase timing information
        #[arg(short = 't', long)]
        timing: bool,

        /// Verbosity: 1=error, 2=warning, 3=message, 4+=debugging
        #[arg(long, value_name = "INT", default_value = "3")]
        verbosity: i32,
    },
}

fn init_logger(verbosity: i32) {
    let log_level = match verbosity {
        v if v <= 1 => log::LevelFilter::Error,
        2 => log::LevelFilter::Warn,
        3 => log::LevelFilter::Info,
        4 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .format_timestamp(None)
        .format_target(false)
        .init();
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Index {
            fasta,
            prefix,
            offrate,
            timing,
        } => {
            init_logger(3);
            let base = prefix.unwrap_or_else(|| fasta.clone());
            log::info!("building index for {}", fasta.display());
            if let Err(e) = build_index(&fasta, &base, offrate, timing) {
                log::error!("index building failed: {e}");
                std::process::exit(1);
            }
        }

        Commands::Align {
            index,
            reads,
            format,
            mismatches,
            seed_len,
            seed_mms,
            qual_thresh,
            all_hits,
            norc,
            maxbts,
            trim5,
            trim3,
            maxns,
            ntoa,
            solexa_quals,
            qupto,
            output,
            concise,
            no_out,
            threads,
            seed,
            offrate,
            timing,
            verbosity,
        } => {
            init_logger(verbosity);
            let _overall = Timer::new("Overall time", timing);

            let mut opt = AlignOpt::default();
            opt.mode = match mismatches {
                Some(k) => SearchMode::EndToEnd(k),
                None => SearchMode::Seeded,
            };
            opt.seed_len = seed_len;
            opt.seed_mms = seed_mms;
            opt.qual_thresh = qual_thresh;
            opt.one_hit = !all_hits;
            // The seeded search always needs both strands.
            opt.revcomp = if opt.mode == SearchMode::Seeded {
                if norc {
                    log::warn!("--norc is ignored in seeded mode");
                }
                true
            } else {
                !norc
            };
            opt.trim5 = trim5;
            opt.trim3 = trim3;
            opt.max_ns = maxns;
            opt.ns_policy = if ntoa { NsPolicy::NToA } else { NsPolicy::NToN };
            opt.max_bts = maxbts;
            opt.q_upto = qupto.unwrap_or(u32::MAX);
            opt.seed = seed;
            opt.solexa_quals = solexa_quals;
            opt.off_rate = offrate;
            opt.timing = timing;
            opt.out_mode = if no_out {
                OutputMode::None
            } else if concise {
                OutputMode::Concise
            } else {
                OutputMode::Full
            };

            // Thread count selection, with a sanity cap.
            let mut num_threads = threads.unwrap_or_else(num_cpus::get).max(1);
            let max_threads = num_cpus::get() * 2;
            if num_threads > max_threads {
                log::warn!(
                    "thread count {} exceeds recommended maximum {}, capping",
                    num_threads,
                    max_threads
                );
                num_threads = max_threads;
            }
            opt.nthreads = num_threads;

            if let Err(e) = opt.validate() {
                log::error!("{e}");
                std::process::exit(1);
            }

            if verbosity >= 3 {
                match opt.mode {
                    SearchMode::EndToEnd(k) => {
                        log::info!("end-to-end search, {} mismatch(es)", k)
                    }
                    SearchMode::Seeded => log::info!(
                        "seeded quality search: seed {} bp, {} seed mismatch(es), \
                         quality cutoff {}",
                        opt.seed_len,
                        opt.seed_mms,
                        opt.qual_thresh
                    ),
                }
                log::info!("using {} thread(s)", opt.nthreads);
            }

            // Open the index pair; the bulky payload loads at phase entry.
            let mut ebwt_fw = match Ebwt::open(&index, opt.off_rate) {
                Ok(e) => e,
                Err(e) => {
                    log::error!(
                        "could not open index {}: {e}",
                        index.display()
                    );
                    std::process::exit(1);
                }
            };
            let mut ebwt_bw = if opt.needs_mirror() {
                match Ebwt::open(&mirror_basename(&index), opt.off_rate) {
                    Ok(e) => Some(e),
                    Err(e) => {
                        log::error!(
                            "could not open mirror index {}: {e} \
                             (rebuild the index with 'ebwt-align index')",
                            mirror_basename(&index).display()
                        );
                        std::process::exit(1);
                    }
                }
            } else {
                None
            };

            let src_cfg = SourceConfig {
                trim5: opt.trim5,
                trim3: opt.trim3,
                max_ns: opt.max_ns,
                ns_policy: opt.ns_policy,
                solexa_quals: opt.solexa_quals,
                q_upto: opt.q_upto,
            };
            let files: Vec<PathBuf> = reads.iter().map(PathBuf::from).collect();
            let source: Box<dyn PatternSource> = match format {
                ReadFormat::Fastq => Box::new(FastqPatternSource::new(files, src_cfg)),
                ReadFormat::Fasta => Box::new(FastaPatternSource::new(files, src_cfg)),
                ReadFormat::Raw => Box::new(RawPatternSource::new(files, src_cfg)),
                ReadFormat::Literal => {
                    let seqs: Vec<&str> = reads.iter().map(String::as_str).collect();
                    Box::new(VectorPatternSource::new(&seqs, src_cfg))
                }
            };
            let patsrc = SyncPatternSource::new(source);

            let out: Box<dyn std::io::Write + Send> = match &output {
                Some(path) => match std::fs::File::create(path) {
                    Ok(f) => Box::new(f),
                    Err(e) => {
                        log::error!("could not create {}: {e}", path.display());
                        std::process::exit(1);
                    }
                },
                None => Box::new(std::io::stdout()),
            };
            let sink: Box<dyn HitSink> = match opt.out_mode {
                OutputMode::Full => Box::new(FullHitSink::new(out, ebwt_fw.refs())),
                OutputMode::Concise => Box::new(ConciseHitSink::new(out)),
                OutputMode::None => Box::new(NullHitSink),
            };

            {
                let _t = Timer::new("Time searching", timing);
                let aligner = Aligner::new(&opt, &patsrc, sink.as_ref());
                aligner.run(&mut ebwt_fw, ebwt_bw.as_mut());
            }
            log::info!("processed {} reads", patsrc.num_served());
        }
    }
}
