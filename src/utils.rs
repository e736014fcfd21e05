use flate2::read::GzDecoder;
use std::fs::OpenOptions;
use std::io::{self, BufReader, Read, stdin};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

pub fn realtime() -> f64 {
    let now = SystemTime::now();
    let since_epoch = now.duration_since(UNIX_EPOCH).expect("Time went backwards");
    since_epoch.as_secs_f64()
}

pub fn cputime() -> f64 {
    let rusage = unsafe {
        let mut rusage = std::mem::MaybeUninit::uninit();
        libc::getrusage(libc::RUSAGE_SELF, rusage.as_mut_ptr());
        rusage.assume_init()
    };
    let user_time = rusage.ru_utime;
    let sys_time = rusage.ru_stime;
    (user_time.tv_sec as f64 + user_time.tv_usec as f64 * 1e-6)
        + (sys_time.tv_sec as f64 + sys_time.tv_usec as f64 * 1e-6)
}

pub fn err_fatal<S: AsRef<str>>(header: S, msg: &str) -> ! {
    log::error!("[{}] {}", header.as_ref(), msg);
    std::process::exit(1);
}

pub fn xopen(path: &Path, _mode: &str) -> Result<Box<dyn Read + Send>, io::Error> {
    if path.to_str() == Some("-") {
        return Ok(Box::new(BufReader::new(stdin())));
    }

    let file = OpenOptions::new().read(true).open(path)?;
    Ok(Box::new(BufReader::new(file)))
}

pub fn xzopen(path: &Path, mode: &str) -> Result<Box<dyn Read + Send>, io::Error> {
    let input = xopen(path, mode)?;
    if path.extension().and_then(|s| s.to_str()) == Some("gz") {
        Ok(Box::new(GzDecoder::new(input)))
    } else {
        Ok(input)
    }
}

/// Scoped clock for a pipeline phase. Logs wall and CPU time on drop when
/// enabled (the --timing flag).
pub struct Timer {
    label: &'static str,
    enabled: bool,
    wall0: f64,
    cpu0: f64,
}

impl Timer {
    pub fn new(label: &'static str, enabled: bool) -> Self {
        Timer {
            label,
            enabled,
            wall0: realtime(),
            cpu0: cputime(),
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if self.enabled {
            log::info!(
                "{}: {:.2}s wall, {:.2}s CPU",
                self.label,
                realtime() - self.wall0,
                cputime() - self.cpu0
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cputime_monotonic() {
        let a = cputime();
        let mut x = 0u64;
        for i in 0..100_000u64 {
            x = x.wrapping_add(i * i);
        }
        std::hint::black_box(x);
        assert!(cputime() >= a);
    }
}
