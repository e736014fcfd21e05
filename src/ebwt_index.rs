// Offline index construction: reference FASTA in, two ebwt pairs out.
//
// The forward pair indexes the concatenated references; the mirror pair
// (written under `basename.rev`) indexes the reversed concatenation so the
// search phases can revisit either end of a read.

use std::io;
use std::path::{Path, PathBuf};

use bio::io::fasta;

use crate::dna::encode_base;
use crate::ebwt::{Ebwt, RefMap};
use crate::utils::{Timer, xzopen};

/// Basename of the mirror index files for a forward basename.
pub fn mirror_basename(basename: &Path) -> PathBuf {
    let mut s = basename.as_os_str().to_os_string();
    s.push(".rev");
    PathBuf::from(s)
}

/// Read a reference FASTA (gz ok) into concatenated A/C/G/T text plus a
/// name/extent table. Ambiguous bases are rewritten to A; one warning is
/// logged with the total.
pub fn read_reference(fasta_path: &Path) -> io::Result<(Vec<u8>, RefMap)> {
    let reader = fasta::Reader::new(xzopen(fasta_path, "r")?);
    let mut text: Vec<u8> = Vec::new();
    let mut refs = RefMap::default();
    let mut n_rewritten = 0u64;

    for rec in reader.records() {
        let rec = rec.map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("malformed FASTA in {}: {e}", fasta_path.display()),
            )
        })?;
        let start = text.len() as u32;
        for &c in rec.seq() {
            let code = encode_base(c);
            if code == 4 {
                n_rewritten += 1;
                text.push(b'A');
            } else {
                text.push(c.to_ascii_uppercase());
            }
        }
        refs.push(rec.id().to_string(), start, text.len() as u32 - start);
    }
    if refs.names.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{}: no sequences found", fasta_path.display()),
        ));
    }
    if n_rewritten > 0 {
        log::warn!(
            "{} ambiguous reference bases rewritten to A",
            n_rewritten
        );
    }
    Ok((text, refs))
}

/// Build and write the forward and mirror index pairs.
pub fn build_index(
    fasta_path: &Path,
    basename: &Path,
    off_rate: u32,
    timing: bool,
) -> io::Result<()> {
    let (text, refs) = read_reference(fasta_path)?;
    log::info!(
        "indexing {} reference(s), {} bases",
        refs.names.len(),
        text.len()
    );

    {
        let _t = Timer::new("Time building forward index", timing);
        let fwd = Ebwt::build(&text, refs.clone(), off_rate, false)?;
        fwd.save(basename)?;
    }
    {
        let _t = Timer::new("Time building mirror index", timing);
        let rev_text: Vec<u8> = text.iter().rev().copied().collect();
        let mir = Ebwt::build(&rev_text, refs, off_rate, true)?;
        mir.save(&mirror_basename(basename))?;
    }
    log::info!("index written to {}.*.ebwt", basename.display());
    Ok(())
}

/// Build both indexes in memory (the test suite's entry point).
pub fn build_in_memory(refs: &[(&str, &str)], off_rate: u32) -> io::Result<(Ebwt, Ebwt)> {
    let mut text: Vec<u8> = Vec::new();
    let mut map = RefMap::default();
    for (name, seq) in refs {
        let start = text.len() as u32;
        text.extend_from_slice(seq.as_bytes());
        map.push(name.to_string(), start, seq.len() as u32);
    }
    let fwd = Ebwt::build(&text, map.clone(), off_rate, false)?;
    let rev_text: Vec<u8> = text.iter().rev().copied().collect();
    let mir = Ebwt::build(&rev_text, map, off_rate, true)?;
    Ok((fwd, mir))
}
