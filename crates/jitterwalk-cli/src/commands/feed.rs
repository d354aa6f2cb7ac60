use jitterwalk_core::HostConfig;

use super::CmdResult;

/// Run as a daemon topping up the kernel entropy pool whenever it drains
/// below the write wakeup threshold.
#[cfg(target_os = "linux")]
pub fn run(host: &HostConfig, tests: &str, cores: usize, write_wakeup: Option<u32>) -> CmdResult {
    linux::run(host, tests, cores, write_wakeup)
}

#[cfg(not(target_os = "linux"))]
pub fn run(_host: &HostConfig, _tests: &str, _cores: usize, _wakeup: Option<u32>) -> CmdResult {
    Err("kernel entropy feeding requires Linux".into())
}

#[cfg(target_os = "linux")]
mod linux {
    use std::fs::{File, OpenOptions};
    use std::io;
    use std::os::unix::io::AsRawFd;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use jitterwalk_core::{CollectorConfig, HostConfig, Orchestrator, TestPlan};

    use super::CmdResult;

    const RANDOM_DEVICE: &str = "/dev/random";
    const POOLSIZE_PATH: &str = "/proc/sys/kernel/random/poolsize";
    const WATERMARK_PATH: &str = "/proc/sys/kernel/random/write_wakeup_threshold";

    const RNDGETENTCNT: libc::c_ulong = 0x8004_5200;
    const RNDADDENTROPY: libc::c_ulong = 0x4008_5203;

    /// Largest single top-up, in words. Covers the biggest pool the kernel
    /// has shipped with plenty of slack.
    const FEED_WORDS: usize = 1024;

    #[repr(C)]
    struct RandPoolInfo {
        entropy_count: libc::c_int,
        buf_size: libc::c_int,
        buf: [u32; FEED_WORDS],
    }

    pub fn run(
        host: &HostConfig,
        tests: &str,
        cores: usize,
        write_wakeup: Option<u32>,
    ) -> CmdResult {
        let plan = TestPlan::parse(tests)?;
        let mut rng = Orchestrator::start(host, &plan, &CollectorConfig::default(), cores)?;

        let poolsize = read_poolsize()?;
        if let Some(bits) = write_wakeup {
            std::fs::write(WATERMARK_PATH, format!("{bits}\n"))?;
            log::info!("write wakeup threshold set to {bits} bits");
        }

        let device = OpenOptions::new()
            .read(true)
            .write(true)
            .open(RANDOM_DEVICE)?;
        let running = Arc::new(AtomicBool::new(true));
        {
            let running = Arc::clone(&running);
            ctrlc::set_handler(move || running.store(false, Ordering::SeqCst))?;
        }
        log::info!("feeding {RANDOM_DEVICE} from {cores} collector(s), pool size {poolsize} bits");

        let mut info = RandPoolInfo {
            entropy_count: 0,
            buf_size: 0,
            buf: [0u32; FEED_WORDS],
        };
        while running.load(Ordering::SeqCst) {
            if !pool_wants_input(&device)? {
                continue;
            }
            let mut current: libc::c_int = 0;
            // SAFETY: RNDGETENTCNT reads a single int through the pointer.
            if unsafe { libc::ioctl(device.as_raw_fd(), RNDGETENTCNT, &mut current) } == -1 {
                return Err(io::Error::last_os_error().into());
            }
            let nbytes = (poolsize.saturating_sub(current.max(0) as u32) / 8) as usize;
            if nbytes < 1 {
                continue;
            }
            let nbytes = nbytes.min(FEED_WORDS * 4);
            let words = nbytes.div_ceil(4);
            rng.read_words(&mut info.buf[..words])?;
            info.buf_size = nbytes as libc::c_int;
            info.entropy_count = (nbytes * 8) as libc::c_int;
            // SAFETY: info is a properly sized rand_pool_info with buf_size
            // bytes of payload behind the header.
            if unsafe { libc::ioctl(device.as_raw_fd(), RNDADDENTROPY, &info) } == -1 {
                return Err(io::Error::last_os_error().into());
            }
            log::debug!("added {nbytes} bytes ({} bits) to the pool", nbytes * 8);
        }
        log::info!("shutting down");
        Ok(())
    }

    /// Wait until the pool drops below the wakeup threshold. Times out
    /// periodically so shutdown stays responsive.
    fn pool_wants_input(device: &File) -> io::Result<bool> {
        let mut pfd = libc::pollfd {
            fd: device.as_raw_fd(),
            events: libc::POLLOUT,
            revents: 0,
        };
        // SAFETY: pfd is a valid pollfd for the open device fd.
        let rc = unsafe { libc::poll(&mut pfd, 1, 1000) };
        if rc == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(err);
        }
        Ok(rc > 0 && pfd.revents & libc::POLLOUT != 0)
    }

    fn read_poolsize() -> io::Result<u32> {
        let text = std::fs::read_to_string(POOLSIZE_PATH)?;
        text.trim()
            .parse()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "unreadable pool size"))
    }
}
