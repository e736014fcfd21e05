pub mod backtrack;
pub mod bitset;
pub mod dna;
pub mod ebwt; // FM-index primitive (checkpointed rank, sampled suffix array)
pub mod ebwt_index; // Offline index construction (FASTA -> .1/.2.ebwt pairs)
pub mod hit;
pub mod options;
pub mod partial;
pub mod pattern; // Read sources (FASTA/FASTQ/raw/literal) and the sync wrapper
pub mod search; // Phase orchestration and the worker pool
pub mod utils;
